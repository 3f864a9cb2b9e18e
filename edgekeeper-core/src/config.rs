//! Agent configuration loaded with figment

use crate::error::{EdgeKeeperError, Result};
use crate::workload::{ProbeKind, Workload};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "edgekeeper.toml";

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "EDGEKEEPER_CONFIG_PATH";

/// Prefix of environment overrides; nested keys are separated by `__`
pub const ENV_PREFIX: &str = "EDGEKEEPER_";

/// Main configuration of the edgekeeper agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Process engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Reconciliation loop settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Desired workload set
    #[serde(default)]
    pub workloads: Vec<Workload>,
}

/// Native process engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Time between SIGTERM and SIGKILL when stopping an instance
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,

    /// Default working directory for workloads that don't set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            working_dir: None,
        }
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// How often the desired set is re-read and applied
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

/// Merge a file provider chosen by the file extension
fn merge_file(figment: Figment, path: &Path) -> Figment {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
        Some("json") => figment.merge(Json::file(path)),
        _ => figment.merge(Toml::file(path)),
    }
}

impl AgentConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `edgekeeper.toml` in the working directory
    /// 3. `path`, or the file named by `EDGEKEEPER_CONFIG_PATH`
    /// 4. `EDGEKEEPER_` environment overrides (`EDGEKEEPER_ENGINE__GRACE_PERIOD=3s`)
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(AgentConfig::default()))
            .merge(Toml::file(DEFAULT_CONFIG_FILE));

        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        if let Some(explicit) = explicit {
            if !explicit.exists() {
                return Err(EdgeKeeperError::Configuration(format!(
                    "Configuration file not found: {}",
                    explicit.display()
                )));
            }
            figment = merge_file(figment, &explicit);
        }

        let config: AgentConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| {
                EdgeKeeperError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        tracing::debug!(
            workloads = config.workloads.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load configuration from a specific file path only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EdgeKeeperError::Configuration(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let figment = Figment::new().merge(Serialized::defaults(AgentConfig::default()));
        let config: AgentConfig = merge_file(figment, path).extract().map_err(|e| {
            EdgeKeeperError::Configuration(format!("Failed to load configuration file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.reconcile.interval.is_zero() {
            return Err(invalid("reconcile.interval must be greater than zero"));
        }

        let mut names = HashSet::new();
        for workload in &self.workloads {
            if workload.name.trim().is_empty() {
                return Err(invalid("workload name must not be empty"));
            }
            if !names.insert(workload.name.as_str()) {
                return Err(invalid(format!("duplicate workload name '{}'", workload.name)));
            }
            if workload.command.trim().is_empty() {
                return Err(invalid(format!(
                    "workload '{}': command must not be empty",
                    workload.name
                )));
            }

            let backoff = &workload.restart.backoff;
            if backoff.factor.is_nan() || backoff.factor < 1.0 {
                return Err(invalid(format!(
                    "workload '{}': restart.backoff.factor must be >= 1",
                    workload.name
                )));
            }
            if backoff.min > backoff.max {
                return Err(invalid(format!(
                    "workload '{}': restart.backoff.min must not exceed restart.backoff.max",
                    workload.name
                )));
            }

            for kind in [ProbeKind::Startup, ProbeKind::Liveness] {
                let Some(probe) = workload.probe(kind) else {
                    continue;
                };
                if probe.success_threshold < 1 || probe.failure_threshold < 1 {
                    return Err(invalid(format!(
                        "workload '{}': {} probe thresholds must be >= 1",
                        workload.name, kind
                    )));
                }
                if probe.period_seconds < 1 {
                    return Err(invalid(format!(
                        "workload '{}': {} probe period_seconds must be >= 1",
                        workload.name, kind
                    )));
                }
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> EdgeKeeperError {
    EdgeKeeperError::Configuration(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{ProbeAction, ProbeSpec, RestartMode, RestartPolicy};
    use figment::Jail;
    use std::io::Write;

    const SAMPLE: &str = r#"
[engine]
grace_period = "3s"

[reconcile]
interval = "15s"

[[workloads]]
name = "web"
version = "2"
command = "/usr/bin/web"
args = ["--port", "8080"]

[workloads.restart]
policy = "on-failure"
retry = { max = 5 }
backoff = { min = "500ms", max = "1m", factor = 1.5 }

[workloads.liveness_probe]
http = { port = 8080, path = "/healthz" }
failure_threshold = 4

[[workloads]]
name = "db"
command = "/usr/bin/db"

[workloads.startup_probe]
tcp = { port = 5432 }
"#;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.engine.grace_period, Duration::from_secs(10));
        assert_eq!(config.reconcile.interval, Duration::from_secs(5));
        assert_eq!(config.logging.filter, "info");
        assert!(config.workloads.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = AgentConfig::from_file(file.path()).unwrap();
        assert_eq!(config.engine.grace_period, Duration::from_secs(3));
        assert_eq!(config.reconcile.interval, Duration::from_secs(15));
        assert_eq!(config.workloads.len(), 2);

        let web = &config.workloads[0];
        assert_eq!(web.version, "2");
        assert_eq!(web.args, vec!["--port", "8080"]);
        assert_eq!(web.restart.policy, RestartMode::OnFailure);
        assert_eq!(web.restart.max_retries(), 5);
        assert_eq!(web.restart.backoff.min, Duration::from_millis(500));
        assert_eq!(web.restart.backoff.max, Duration::from_secs(60));
        let liveness = web.liveness_probe.as_ref().unwrap();
        assert_eq!(liveness.failure_threshold, 4);
        assert_eq!(liveness.period_seconds, 10);

        let db = &config.workloads[1];
        assert_eq!(db.version, "1");
        assert_eq!(db.restart, RestartPolicy::default());
        assert!(matches!(
            db.startup_probe.as_ref().unwrap().action,
            ProbeAction::Tcp(_)
        ));
    }

    #[test]
    fn test_from_file_missing() {
        let err = AgentConfig::from_file("/nonexistent/edgekeeper.toml").unwrap_err();
        assert!(matches!(err, EdgeKeeperError::Configuration(_)));
    }

    #[test]
    fn test_load_merges_env_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(DEFAULT_CONFIG_FILE, SAMPLE)?;
            jail.set_env("EDGEKEEPER_ENGINE__GRACE_PERIOD", "30s");
            jail.set_env("EDGEKEEPER_LOGGING__FILTER", "debug");

            let config = AgentConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.engine.grace_period, Duration::from_secs(30));
            assert_eq!(config.logging.filter, "debug");
            assert_eq!(config.reconcile.interval, Duration::from_secs(15));
            assert_eq!(config.workloads.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_load_explicit_yaml_path() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "agent.yaml",
                r#"
reconcile:
  interval: 2s
workloads:
  - name: worker
    command: /bin/worker
    restart:
      policy: "no"
"#,
            )?;
            jail.set_env(CONFIG_PATH_ENV, "agent.yaml");

            let config = AgentConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config.reconcile.interval, Duration::from_secs(2));
            assert_eq!(config.workloads[0].restart.policy, RestartMode::Never);
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = AgentConfig {
            workloads: vec![
                Workload::new("app", "/bin/a"),
                Workload::new("app", "/bin/b"),
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_bad_probe_and_backoff() {
        let config = AgentConfig {
            workloads: vec![
                Workload::new("app", "/bin/a")
                    .with_liveness_probe(ProbeSpec::tcp(80).with_thresholds(0, 3)),
            ],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            workloads: vec![Workload::new("app", "/bin/a").with_restart(
                RestartPolicy::always().with_backoff(
                    Duration::from_secs(10),
                    Duration::from_secs(1),
                    2.0,
                ),
            )],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AgentConfig {
            workloads: vec![Workload::new("app", "  ")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
