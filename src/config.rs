use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use blob_store::BlobStorageConfig;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use state_store::DEFAULT_PARTIAL_PUSH_INTERVAL;
use stelvio_utils::is_url_safe;

/// Read from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "stlv.yaml";
const ENV_PREFIX: &str = "STLV_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StelvioConfig {
    pub app: String,
    pub env: String,
    pub blob_storage: BlobStorageConfig,
    pub pulumi: PulumiConfig,
    pub partial_push_interval_secs: u64,
    /// Parent of the per-run scratch directories. Defaults to the system
    /// temp dir.
    pub work_dir: Option<PathBuf>,
    pub keep_work_dir: bool,
    /// CI run identifier stored in locks and update records.
    pub run_id: Option<String>,
    pub structured_logging: bool,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulumiConfig {
    pub binary: String,
    pub project_dir: PathBuf,
    pub passphrase: String,
}

impl Default for PulumiConfig {
    fn default() -> Self {
        PulumiConfig {
            binary: "pulumi".to_string(),
            project_dir: PathBuf::from("."),
            passphrase: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enable_tracing: bool,
    pub enable_metrics: bool,
    // OTLP collector, the exporter default when unset
    pub endpoint: Option<String>,
}

impl Default for StelvioConfig {
    fn default() -> Self {
        StelvioConfig {
            app: default_app_name(),
            env: "dev".to_string(),
            blob_storage: Default::default(),
            pulumi: Default::default(),
            partial_push_interval_secs: DEFAULT_PARTIAL_PUSH_INTERVAL.as_secs(),
            work_dir: None,
            keep_work_dir: false,
            run_id: None,
            structured_logging: false,
            telemetry: Default::default(),
        }
    }
}

fn default_app_name() -> String {
    env::current_dir()
        .ok()
        .and_then(|dir| dir.file_name().map(|name| name.to_string_lossy().into_owned()))
        .filter(|name| is_url_safe(name))
        .unwrap_or_else(|| "app".to_string())
}

impl StelvioConfig {
    /// Loads the YAML file at `path` (or `stlv.yaml` when present) and
    /// applies `STLV_` environment overrides. Nested keys use `__`, e.g.
    /// `STLV_BLOB_STORAGE__PATH`.
    pub fn load(path: Option<&Path>) -> Result<StelvioConfig> {
        let yaml = match path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?,
            ),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Some(std::fs::read_to_string(DEFAULT_CONFIG_FILE)?)
            }
            None => None,
        };
        let mut figment = Figment::new();
        if let Some(yaml) = yaml {
            figment = figment.merge(Yaml::string(&yaml));
        }
        let config: StelvioConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<StelvioConfig> {
        let config: StelvioConfig = Figment::new().merge(Yaml::string(yaml)).extract()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_url_safe(&self.app) {
            return Err(anyhow!(
                "invalid app name '{}': use letters, digits, '-', '_' or '.'",
                self.app
            ));
        }
        if !is_url_safe(&self.env) {
            return Err(anyhow!(
                "invalid env name '{}': use letters, digits, '-', '_' or '.'",
                self.env
            ));
        }
        if url::Url::parse(&self.blob_storage.path).is_err() {
            return Err(anyhow!(
                "invalid blob storage url: {}",
                self.blob_storage.path
            ));
        }
        if self.partial_push_interval_secs == 0 {
            return Err(anyhow!("partial_push_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn partial_push_interval(&self) -> Duration {
        Duration::from_secs(self.partial_push_interval_secs)
    }

    pub fn structured_logging(&self) -> bool {
        self.structured_logging
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml() {
        let config = StelvioConfig::from_yaml(
            r#"
app: shop
env: staging
blob_storage:
  path: s3://stelvio-state/shop
  region: eu-west-1
pulumi:
  passphrase: secret
partial_push_interval_secs: 2
telemetry:
  enable_tracing: true
"#,
        )
        .unwrap();
        assert_eq!(config.app, "shop");
        assert_eq!(config.env, "staging");
        assert_eq!(config.blob_storage.region.as_deref(), Some("eu-west-1"));
        assert_eq!(config.pulumi.binary, "pulumi");
        assert_eq!(config.pulumi.passphrase, "secret");
        assert_eq!(config.partial_push_interval(), Duration::from_secs(2));
        assert!(config.telemetry.enable_tracing);
        assert!(!config.keep_work_dir);
        config.validate().unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = StelvioConfig::from_yaml("app: shop").unwrap();
        assert_eq!(config.env, "dev");
        assert_eq!(config.partial_push_interval(), DEFAULT_PARTIAL_PUSH_INTERVAL);
        assert!(config.work_dir.is_none());
    }

    #[test]
    fn test_validate_rejects_unsafe_names() {
        let mut config = StelvioConfig::from_yaml("app: shop\nenv: dev").unwrap();
        config.validate().unwrap();

        config.env = "../prod".to_string();
        assert!(config.validate().is_err());

        config.env = "dev".to_string();
        config.blob_storage.path = "not a url".to_string();
        assert!(config.validate().is_err());

        config.blob_storage.path = "memory:///".to_string();
        config.partial_push_interval_secs = 0;
        assert!(config.validate().is_err());
    }
}
