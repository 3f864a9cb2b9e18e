//! Probe runner: one verdict per probing attempt, with bounded local retries

use super::ProbeResult;
use super::http::HttpProber;
use super::tcp::probe_tcp;
use crate::error::ProbeError;
use async_trait::async_trait;
use edgekeeper_core::workload::{HttpScheme, ProbeAction, ProbeSpec};
use reqwest::Url;
use tracing::{debug, error, warn};

/// Attempts per verdict; only execution errors are retried
pub const MAX_PROBE_RETRIES: u32 = 3;

/// Host used when a probe leaves it unset
pub const LOCALHOST: &str = "127.0.0.1";

/// Produces one health verdict for a probe declaration
#[async_trait]
pub trait Prober: Send + Sync {
    /// Check `spec` on behalf of `workload`.
    ///
    /// `Err` means no verdict could be produced at all.
    async fn probe(&self, workload: &str, spec: &ProbeSpec) -> Result<ProbeResult, ProbeError>;
}

/// Default prober backed by the HTTP and TCP executors.
///
/// HTTP probes that follow cross-host redirects use their own client, so the
/// two redirect policies never share a connection pool.
#[derive(Debug, Clone)]
pub struct ProbeRunner {
    http: HttpProber,
    http_follow: HttpProber,
}

impl ProbeRunner {
    /// Create a runner
    pub fn new() -> Result<Self, ProbeError> {
        Ok(Self {
            http: HttpProber::new(false)?,
            http_follow: HttpProber::new(true)?,
        })
    }

    /// Run a single attempt and return the verdict with its output
    pub async fn execute(&self, spec: &ProbeSpec) -> Result<(ProbeResult, String), ProbeError> {
        let timeout = spec.timeout();
        match &spec.action {
            ProbeAction::Http(http) => {
                if http.port == 0 {
                    return Err(ProbeError::MissingPort);
                }
                let host = target_host(http.host.as_deref());
                let url = match format_url(http.scheme, host, http.port, &http.path) {
                    Ok(url) => url,
                    Err(output) => return Ok((ProbeResult::Failure, output)),
                };
                debug!(%url, "HTTP probe target");

                let prober = if spec.follow_redirects {
                    &self.http_follow
                } else {
                    &self.http
                };
                prober.probe(url, &http.headers, timeout).await
            }
            ProbeAction::Tcp(tcp) => {
                if tcp.port == 0 {
                    return Err(ProbeError::MissingPort);
                }
                let host = target_host(tcp.host.as_deref());
                debug!(host, port = tcp.port, "TCP probe target");
                Ok(probe_tcp(host, tcp.port, timeout).await)
            }
        }
    }
}

#[async_trait]
impl Prober for ProbeRunner {
    async fn probe(&self, workload: &str, spec: &ProbeSpec) -> Result<ProbeResult, ProbeError> {
        let mut last_error = None;

        for attempt in 1..=MAX_PROBE_RETRIES {
            match self.execute(spec).await {
                Ok((result, output)) => {
                    return Ok(match result {
                        ProbeResult::Success => {
                            debug!(workload, "Probe succeeded");
                            ProbeResult::Success
                        }
                        ProbeResult::Warning => {
                            warn!(workload, %output, "Probe succeeded with a warning");
                            ProbeResult::Warning
                        }
                        ProbeResult::Failure | ProbeResult::Unknown => {
                            warn!(workload, %output, "Probe failed");
                            ProbeResult::Failure
                        }
                    });
                }
                Err(e) => {
                    debug!(workload, attempt, error = %e, "Probe attempt errored");
                    last_error = Some(e);
                }
            }
        }

        let last = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(workload, error = %last, "Probe errored");
        Err(ProbeError::Exhausted {
            attempts: MAX_PROBE_RETRIES,
            last,
        })
    }
}

fn target_host(host: Option<&str>) -> &str {
    match host {
        Some(host) if !host.is_empty() => host,
        _ => LOCALHOST,
    }
}

/// Build the probe URL from its parts.
///
/// `path` may carry a query string. IPv6 literals are bracketed.
pub fn format_url(scheme: HttpScheme, host: &str, port: u16, path: &str) -> Result<Url, String> {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    let mut url = Url::parse(&format!("{}://{}:{}", scheme.as_str(), host, port))
        .map_err(|e| format!("invalid probe target {}:{}: {}", host, port, e))?;

    let (path, query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path, None),
    };
    url.set_path(path);
    url.set_query(query);
    Ok(url)
}
