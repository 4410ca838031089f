//! The CLI commands. Each one opens exactly one [`CommandRun`] and closes it
//! on every path, recording the error of a failed command in the update
//! ledger.

use data_model::{Command, Mutation, ResourceRecord, StateBlob, UpdateRecord};
use serde_json::{Map, Value};
use state_store::{
    find_resource, find_resources_by_name, remove_resource, repair, ForceUnlock, Result, StateError,
};
use tracing::{error, info, warn};

use crate::{
    command_run::{CommandRun, RunContext},
    engine::{EngineSummary, Operation},
};

async fn finish<T>(run: CommandRun, result: Result<T>) -> Result<T> {
    let errors = match &result {
        Ok(_) => vec![],
        Err(e) => vec![e.to_string()],
    };
    let closed = run.close(errors).await;
    let value = result?;
    closed?;
    Ok(value)
}

/// Runs a mutating engine operation with partial pushes enabled, then
/// uploads the final local state whether or not the engine succeeded.
async fn run_engine(
    ctx: &RunContext,
    run: &mut CommandRun,
    operation: Operation,
) -> Result<EngineSummary> {
    let trigger = run.start_partial_push();
    let result = ctx.engine.run(operation, run.workspace(), trigger).await;
    run.stop_partial_push().await;

    let pushed = run.push_local_if_present().await;
    match (result, pushed) {
        (result, Ok(true)) => {
            info!(%operation, "pushed state");
            result
        }
        (result, Ok(false)) => {
            warn!(%operation, "engine left no local state to push");
            result
        }
        (Ok(_), Err(push_err)) => Err(push_err),
        (Err(engine_err), Err(push_err)) => {
            error!(error = %push_err, "failed to push state after engine failure");
            Err(engine_err)
        }
    }
}

pub async fn diff(ctx: &RunContext) -> Result<EngineSummary> {
    let run = CommandRun::open(ctx, Command::Diff).await?;
    let result = ctx
        .engine
        .run(Operation::Preview, run.workspace(), Default::default())
        .await;
    finish(run, result).await
}

/// Deploys and snapshots the resulting state.
pub async fn deploy(ctx: &RunContext) -> Result<EngineSummary> {
    let mut run = CommandRun::open(ctx, Command::Deploy).await?;
    let result = deploy_and_snapshot(ctx, &mut run).await;
    finish(run, result).await
}

async fn deploy_and_snapshot(ctx: &RunContext, run: &mut CommandRun) -> Result<EngineSummary> {
    let summary = run_engine(ctx, run, Operation::Up).await?;
    run.create_snapshot().await?;
    Ok(summary)
}

pub async fn refresh(ctx: &RunContext) -> Result<EngineSummary> {
    let mut run = CommandRun::open(ctx, Command::Refresh).await?;
    let result = run_engine(ctx, &mut run, Operation::Refresh).await;
    finish(run, result).await
}

/// Destroys the app. Snapshots are deleted once no resources remain.
pub async fn destroy(ctx: &RunContext) -> Result<EngineSummary> {
    let mut run = CommandRun::open(ctx, Command::Destroy).await?;
    let result = destroy_and_clean_up(ctx, &mut run).await;
    finish(run, result).await
}

async fn destroy_and_clean_up(ctx: &RunContext, run: &mut CommandRun) -> Result<EngineSummary> {
    let summary = run_engine(ctx, run, Operation::Destroy).await?;
    let remaining = run
        .load_local()
        .await?
        .map(|state| state.resource_count())
        .unwrap_or(0);
    if remaining == 0 {
        run.delete_snapshots().await?;
    } else {
        warn!(remaining, "resources remain after destroy, keeping snapshots");
    }
    Ok(summary)
}

/// Outputs of the deployed stack, empty when nothing is deployed.
pub async fn outputs(ctx: &RunContext) -> Result<Map<String, Value>> {
    let run = CommandRun::open(ctx, Command::Outputs).await?;
    let result = run.load_local().await.map(|state| {
        state
            .and_then(|state| state.stack_outputs().cloned())
            .unwrap_or_default()
    });
    finish(run, result).await
}

/// Force-removes the lock.
pub async fn unlock(ctx: &RunContext) -> Result<ForceUnlock> {
    let run = CommandRun::open(ctx, Command::Unlock).await?;
    let result = ctx.store.locks().force_unlock().await;
    finish(run, result).await
}

pub async fn history(ctx: &RunContext) -> Result<Vec<UpdateRecord>> {
    let run = CommandRun::open(ctx, Command::History).await?;
    let result = ctx.store.ledger().list().await;
    finish(run, result).await
}

pub async fn state_list(ctx: &RunContext) -> Result<Vec<ResourceRecord>> {
    let run = CommandRun::open(ctx, Command::StateList).await?;
    let result = run
        .load_local()
        .await
        .map(|state| state.map(|s| s.resources().to_vec()).unwrap_or_default());
    finish(run, result).await
}

/// Removes the resource named by `target` (a URN or a resource name) and
/// everything that depended on it, then pushes the result.
pub async fn state_rm(ctx: &RunContext, target: &str) -> Result<Vec<Mutation>> {
    let run = CommandRun::open(ctx, Command::StateRm).await?;
    let result = remove_and_push(&run, target).await;
    finish(run, result).await
}

async fn remove_and_push(run: &CommandRun, target: &str) -> Result<Vec<Mutation>> {
    let mut state = run
        .load_local()
        .await?
        .ok_or_else(|| StateError::ResourceNotFound(target.to_string()))?;
    let urn = resolve_target(&state, target)?;
    let mutations = remove_resource(&mut state, &urn)?;
    run.push_state(Some(&state)).await?;
    Ok(mutations)
}

/// Repairs dangling references. With `dry_run` the mutations are reported
/// but nothing is pushed.
pub async fn state_repair(ctx: &RunContext, dry_run: bool) -> Result<Vec<Mutation>> {
    let run = CommandRun::open(ctx, Command::StateRepair).await?;
    let result = repair_and_push(&run, dry_run).await;
    finish(run, result).await
}

async fn repair_and_push(run: &CommandRun, dry_run: bool) -> Result<Vec<Mutation>> {
    let Some(mut state) = run.load_local().await? else {
        return Ok(vec![]);
    };
    let mutations = repair(&mut state);
    if !mutations.is_empty() && !dry_run {
        run.push_state(Some(&state)).await?;
    }
    Ok(mutations)
}

fn resolve_target(state: &StateBlob, target: &str) -> Result<String> {
    if let Some(resource) = find_resource(state, target) {
        return Ok(resource.urn.clone());
    }
    let matches = find_resources_by_name(state, target);
    match matches.as_slice() {
        [] => Err(StateError::ResourceNotFound(target.to_string())),
        [resource] => Ok(resource.urn.clone()),
        _ => Err(StateError::AmbiguousResource {
            name: target.to_string(),
            candidates: matches.iter().map(|r| r.urn.clone()).collect(),
        }),
    }
}
