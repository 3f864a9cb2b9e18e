//! Workload declarations: what to run, how to restart it and how to probe it

use crate::instance::InstanceHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

fn default_version() -> String {
    "1".to_string()
}

/// Name/version pair identifying one declared workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    /// Workload name
    pub name: String,
    /// Declared version; a config change produces a new version
    pub version: String,
}

impl WorkloadRef {
    /// Create a new reference
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A single supervised unit as declared by the desired state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    /// Unique workload name
    pub name: String,

    /// Declared version
    #[serde(default = "default_version")]
    pub version: String,

    /// Executable to run
    pub command: String,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory (engine default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Restart policy applied when the instance exits
    #[serde(default)]
    pub restart: RestartPolicy,

    /// Probe whose failure forces a restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<ProbeSpec>,

    /// Probe gating liveness probing until the workload has started
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<ProbeSpec>,
}

impl Workload {
    /// Create a workload with default restart policy and no probes
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            restart: RestartPolicy::default(),
            liveness_probe: None,
            startup_probe: None,
        }
    }

    /// Builder: set version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Builder: set arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Builder: set restart policy
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Builder: set liveness probe
    pub fn with_liveness_probe(mut self, probe: ProbeSpec) -> Self {
        self.liveness_probe = Some(probe);
        self
    }

    /// Builder: set startup probe
    pub fn with_startup_probe(mut self, probe: ProbeSpec) -> Self {
        self.startup_probe = Some(probe);
        self
    }

    /// Name/version reference for this workload
    pub fn workload_ref(&self) -> WorkloadRef {
        WorkloadRef::new(&self.name, &self.version)
    }

    /// Handle of the (single) instance this workload runs as
    pub fn instance_handle(&self) -> InstanceHandle {
        InstanceHandle::new(&self.name, &self.version, &self.name)
    }

    /// Probe declared for the given kind
    pub fn probe(&self, kind: ProbeKind) -> Option<&ProbeSpec> {
        match kind {
            ProbeKind::Liveness => self.liveness_probe.as_ref(),
            ProbeKind::Startup => self.startup_probe.as_ref(),
        }
    }

    /// Kind of the first probe worker to register.
    ///
    /// A startup probe gates liveness probing, so it wins when both are declared.
    pub fn initial_probe_kind(&self) -> Option<ProbeKind> {
        if self.startup_probe.is_some() {
            Some(ProbeKind::Startup)
        } else if self.liveness_probe.is_some() {
            Some(ProbeKind::Liveness)
        } else {
            None
        }
    }
}

/// When an exited instance is restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// Never restart
    #[serde(alias = "no")]
    Never,
    /// Restart on any exit
    #[default]
    Always,
    /// Restart only when the instance exited unsuccessfully
    OnFailure,
}

impl std::fmt::Display for RestartMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartMode::Never => write!(f, "never"),
            RestartMode::Always => write!(f, "always"),
            RestartMode::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// Retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum restart attempts; 0 means unlimited
    #[serde(default)]
    pub max: u32,
}

/// Bounded exponential backoff between restarts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First delay
    #[serde(with = "humantime_serde", default = "default_backoff_min")]
    pub min: Duration,

    /// Upper bound on any delay
    #[serde(with = "humantime_serde", default = "default_backoff_max")]
    pub max: Duration,

    /// Multiplier applied per successive restart
    #[serde(default = "default_backoff_factor")]
    pub factor: f64,
}

fn default_backoff_min() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: default_backoff_min(),
            max: default_backoff_max(),
            factor: default_backoff_factor(),
        }
    }
}

/// Restart policy of a workload
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Restart mode
    #[serde(default)]
    pub policy: RestartMode,

    /// Retry budget
    #[serde(default)]
    pub retry: RetryConfig,

    /// Backoff between restarts
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl RestartPolicy {
    /// Policy that never restarts
    pub fn never() -> Self {
        Self {
            policy: RestartMode::Never,
            ..Default::default()
        }
    }

    /// Policy that restarts on every exit
    pub fn always() -> Self {
        Self {
            policy: RestartMode::Always,
            ..Default::default()
        }
    }

    /// Policy that restarts only after unsuccessful exits
    pub fn on_failure() -> Self {
        Self {
            policy: RestartMode::OnFailure,
            ..Default::default()
        }
    }

    /// Builder: set the retry budget (0 = unlimited)
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.retry.max = max;
        self
    }

    /// Builder: set backoff bounds and factor
    pub fn with_backoff(mut self, min: Duration, max: Duration, factor: f64) -> Self {
        self.backoff = BackoffConfig { min, max, factor };
        self
    }

    /// Retry budget (0 = unlimited)
    pub fn max_retries(&self) -> u32 {
        self.retry.max
    }
}

/// Which role a probe plays for its workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Failure forces a restart
    Liveness,
    /// Success ends the startup phase
    Startup,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Liveness => write!(f, "liveness"),
            ProbeKind::Startup => write!(f, "startup"),
        }
    }
}

/// HTTP scheme used by an HTTP probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpScheme {
    #[default]
    Http,
    Https,
}

impl HttpScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpScheme::Http => "http",
            HttpScheme::Https => "https",
        }
    }
}

/// One request header sent by an HTTP probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

fn default_path() -> String {
    "/".to_string()
}

/// HTTP GET health check target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpGetAction {
    /// Target host (loopback when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Target port; 0 means no port was selected
    #[serde(default)]
    pub port: u16,

    /// Request path, optionally with a query
    #[serde(default = "default_path")]
    pub path: String,

    /// Scheme
    #[serde(default)]
    pub scheme: HttpScheme,

    /// Extra request headers
    #[serde(default)]
    pub headers: Vec<HttpHeader>,
}

/// TCP connect health check target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSocketAction {
    /// Target host (loopback when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Target port; 0 means no port was selected
    #[serde(default)]
    pub port: u16,
}

/// Probe mechanism
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeAction {
    /// HTTP GET
    Http(HttpGetAction),
    /// TCP connect
    Tcp(TcpSocketAction),
}

fn default_period_seconds() -> u64 {
    10
}

fn default_timeout_seconds() -> u64 {
    1
}

fn default_threshold_success() -> u32 {
    1
}

fn default_threshold_failure() -> u32 {
    3
}

/// Health probe declaration for one workload and probe kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// What to check
    #[serde(flatten)]
    pub action: ProbeAction,

    /// Interval between probes
    #[serde(default = "default_period_seconds")]
    pub period_seconds: u64,

    /// Per-attempt timeout enforced by the transport
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Delay after instance start before the first probe counts
    #[serde(default)]
    pub initial_delay_seconds: u64,

    /// Consecutive successes required to mark the instance healthy
    #[serde(default = "default_threshold_success")]
    pub success_threshold: u32,

    /// Consecutive failures required to restart the instance
    #[serde(default = "default_threshold_failure")]
    pub failure_threshold: u32,

    /// Follow redirects to other hosts
    #[serde(default)]
    pub follow_redirects: bool,
}

impl ProbeSpec {
    fn with_action(action: ProbeAction) -> Self {
        Self {
            action,
            period_seconds: default_period_seconds(),
            timeout_seconds: default_timeout_seconds(),
            initial_delay_seconds: 0,
            success_threshold: default_threshold_success(),
            failure_threshold: default_threshold_failure(),
            follow_redirects: false,
        }
    }

    /// HTTP GET probe against loopback
    pub fn http(port: u16, path: impl Into<String>) -> Self {
        Self::with_action(ProbeAction::Http(HttpGetAction {
            host: None,
            port,
            path: path.into(),
            scheme: HttpScheme::Http,
            headers: Vec::new(),
        }))
    }

    /// TCP connect probe against loopback
    pub fn tcp(port: u16) -> Self {
        Self::with_action(ProbeAction::Tcp(TcpSocketAction { host: None, port }))
    }

    /// Builder: set target host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        match &mut self.action {
            ProbeAction::Http(http) => http.host = Some(host.into()),
            ProbeAction::Tcp(tcp) => tcp.host = Some(host.into()),
        }
        self
    }

    /// Builder: set period
    pub fn with_period_seconds(mut self, seconds: u64) -> Self {
        self.period_seconds = seconds;
        self
    }

    /// Builder: set timeout
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Builder: set initial delay
    pub fn with_initial_delay_seconds(mut self, seconds: u64) -> Self {
        self.initial_delay_seconds = seconds;
        self
    }

    /// Builder: set thresholds
    pub fn with_thresholds(mut self, success: u32, failure: u32) -> Self {
        self.success_threshold = success;
        self.failure_threshold = failure;
        self
    }

    /// Builder: follow cross-host redirects
    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_seconds)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_seconds)
    }
}
