use std::{path::PathBuf, process::ExitCode};

use ::tracing::{error, info_span, Instrument};
use anyhow::Result;
use clap::{Parser, Subcommand};
use command_run::RunContext;
use config::StelvioConfig;
use state_store::ForceUnlock;

mod command_run;
mod commands;
mod config;
mod engine;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(name = "stlv", version, about = "Deploy and manage app state", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Environment to operate on")]
    env: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Preview the changes a deploy would make
    Diff,
    /// Deploy the app
    Deploy,
    /// Reconcile state with the real cloud resources
    Refresh,
    /// Destroy every resource of the app
    Destroy,
    /// Print the outputs of the deployed app
    Outputs {
        #[arg(long, help = "Print outputs as JSON")]
        json: bool,
    },
    /// Remove a lock left behind by a crashed run
    Unlock,
    /// List past updates
    History,
    /// Inspect or fix the stored state
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
}

#[derive(Subcommand)]
enum StateCommand {
    /// List the resources in the state
    List,
    /// Remove a resource, by name or URN, and everything depending on it
    Rm { target: String },
    /// Remove dangling parents and dependencies
    Repair {
        #[arg(long, help = "Report the changes without pushing them")]
        dry_run: bool,
    },
}

fn load_config(cli: &Cli) -> Result<StelvioConfig> {
    let mut config = StelvioConfig::load(cli.config.as_deref())?;
    if let Some(env) = &cli.env {
        config.env = env.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn run_command(command: CliCommand, config: &StelvioConfig) -> Result<()> {
    let ctx = RunContext::from_config(config)?;
    match command {
        CliCommand::Diff => {
            commands::diff(&ctx).await?;
        }
        CliCommand::Deploy => {
            commands::deploy(&ctx).await?;
        }
        CliCommand::Refresh => {
            commands::refresh(&ctx).await?;
        }
        CliCommand::Destroy => {
            commands::destroy(&ctx).await?;
        }
        CliCommand::Outputs { json } => {
            let outputs = commands::outputs(&ctx).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outputs)?);
            } else {
                for (name, value) in outputs.iter() {
                    match value {
                        serde_json::Value::String(s) => println!("{}: {}", name, s),
                        other => println!("{}: {}", name, other),
                    }
                }
            }
        }
        CliCommand::Unlock => match commands::unlock(&ctx).await? {
            ForceUnlock::Removed(lock) => println!(
                "removed lock held by '{}' since {} (update {})",
                lock.command, lock.created, lock.update_id
            ),
            ForceUnlock::RemovedUnreadable => {
                println!("removed unreadable lock of {}/{}", config.app, config.env)
            }
            ForceUnlock::NotLocked => println!("{}/{} is not locked", config.app, config.env),
        },
        CliCommand::History => {
            for record in commands::history(&ctx).await? {
                let status = match (&record.time_completed, record.failed()) {
                    (None, _) => "running",
                    (Some(_), true) => "failed",
                    (Some(_), false) => "succeeded",
                };
                println!(
                    "{}  {:<14} {:<10} {}",
                    record.time_started, record.command, status, record.id
                );
                for message in record.errors.iter().flatten() {
                    println!("    {}", message);
                }
            }
        }
        CliCommand::State { command } => match command {
            StateCommand::List => {
                for resource in commands::state_list(&ctx).await? {
                    println!("{}  {}", resource.resource_type, resource.urn);
                }
            }
            StateCommand::Rm { target } => {
                for mutation in commands::state_rm(&ctx, &target).await? {
                    println!("{}  {}", mutation.action, mutation.detail);
                }
            }
            StateCommand::Repair { dry_run } => {
                let mutations = commands::state_repair(&ctx, dry_run).await?;
                if mutations.is_empty() {
                    println!("state is consistent");
                }
                for mutation in mutations {
                    println!(
                        "{}  {} ({})",
                        mutation.action,
                        mutation.target_name(),
                        mutation.detail
                    );
                }
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error loading config: {:#}", err);
            return ExitCode::FAILURE;
        }
    };

    let providers = match setup_tracing(&config) {
        Ok(providers) => providers,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            return ExitCode::FAILURE;
        }
    };

    let root_span = info_span!("stlv", app = %config.app, env = %config.env);
    let exit_code = match run_command(cli.command, &config)
        .instrument(root_span)
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    };

    // export telemetry before shutdown
    providers.shutdown();
    exit_code
}
