//! HTTP GET probe executor

use super::ProbeResult;
use crate::error::ProbeError;
use edgekeeper_core::workload::HttpHeader;
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, Response, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Response bodies are read up to this many bytes
pub const MAX_RESPONSE_BODY: usize = 10 * 1024;

/// Redirect chains longer than this are an error
pub const MAX_REDIRECTS: usize = 10;

const DEFAULT_USER_AGENT: &str = concat!("edgekeeper-probe/", env!("CARGO_PKG_VERSION"));

/// Issues single HTTP GET health checks.
///
/// Certificates are not verified and proxies from the environment are ignored.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
}

impl HttpProber {
    /// Create a prober.
    ///
    /// With `follow_redirects` unset, a redirect to a different host is not
    /// followed and the caller sees the redirect response itself.
    pub fn new(follow_redirects: bool) -> Result<Self, ProbeError> {
        let policy = if follow_redirects {
            Policy::limited(MAX_REDIRECTS)
        } else {
            Policy::custom(|attempt| {
                let same_host = attempt
                    .previous()
                    .first()
                    .map(|first| first.host_str() == attempt.url().host_str())
                    .unwrap_or(true);
                if !same_host {
                    attempt.stop()
                } else if attempt.previous().len() >= MAX_REDIRECTS {
                    attempt.error(format!("stopped after {} redirects", MAX_REDIRECTS))
                } else {
                    attempt.follow()
                }
            })
        };

        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .no_gzip()
            .pool_max_idle_per_host(0)
            .redirect(policy)
            .build()
            .map_err(|e| ProbeError::Client(e.to_string()))?;

        Ok(Self { client })
    }

    /// Perform one GET against `url`.
    ///
    /// Transport errors and malformed headers are reported as `Failure` with the
    /// error text as output. Only a broken response body is an execution error.
    pub async fn probe(
        &self,
        url: Url,
        headers: &[HttpHeader],
        timeout: Duration,
    ) -> Result<(ProbeResult, String), ProbeError> {
        let headers = match build_headers(headers) {
            Ok(headers) => headers,
            Err(output) => return Ok((ProbeResult::Failure, output)),
        };

        let mut request = self.client.get(url.clone()).headers(headers);
        if !timeout.is_zero() {
            request = request.timeout(timeout);
        }

        let mut response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok((ProbeResult::Failure, e.to_string())),
        };

        let status = response.status();
        let body = read_body(&mut response, &url).await?;

        if status.is_success() {
            debug!(%url, status = status.as_u16(), "Probe succeeded");
            Ok((ProbeResult::Success, body))
        } else if status.is_redirection() {
            warn!(%url, status = status.as_u16(), "Probe succeeded with a redirect");
            Ok((ProbeResult::Warning, body))
        } else {
            warn!(%url, status = status.as_u16(), body = %body, "Probe failed");
            Ok((
                ProbeResult::Failure,
                format!("HTTP probe failed with statuscode: {}", status.as_u16()),
            ))
        }
    }
}

/// Build request headers, filling in `User-Agent` and `Accept` defaults.
///
/// An explicitly empty `Accept` header is dropped.
fn build_headers(headers: &[HttpHeader]) -> Result<HeaderMap, String> {
    let mut map = HeaderMap::new();
    for header in headers {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|e| format!("invalid header name '{}': {}", header.name, e))?;
        let value = HeaderValue::from_str(&header.value)
            .map_err(|e| format!("invalid value for header '{}': {}", header.name, e))?;
        map.append(name, value);
    }

    if !map.contains_key(USER_AGENT) {
        map.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }

    match map.get(ACCEPT).map(HeaderValue::is_empty) {
        None => {
            map.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }
        Some(true) => {
            map.remove(ACCEPT);
        }
        Some(false) => {}
    }

    Ok(map)
}

async fn read_body(response: &mut Response, url: &Url) -> Result<String, ProbeError> {
    let mut body = Vec::new();
    let mut truncated = false;

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| ProbeError::Body(e.to_string()))?
    {
        let remaining = MAX_RESPONSE_BODY - body.len();
        if chunk.len() > remaining {
            body.extend_from_slice(&chunk[..remaining]);
            truncated = true;
            break;
        }
        body.extend_from_slice(&chunk);
    }

    if truncated {
        debug!(%url, limit = MAX_RESPONSE_BODY, "Non fatal body truncation");
    }

    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, value: &str) -> HttpHeader {
        HttpHeader {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_default_headers_injected() {
        let map = build_headers(&[]).unwrap();
        assert_eq!(map.get(ACCEPT).unwrap(), "*/*");
        assert!(
            map.get(USER_AGENT)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("edgekeeper-probe/")
        );
    }

    #[test]
    fn test_explicit_headers_win() {
        let map = build_headers(&[
            header("User-Agent", "custom/1.0"),
            header("Accept", "application/json"),
            header("X-Probe", "a"),
            header("X-Probe", "b"),
        ])
        .unwrap();
        assert_eq!(map.get(USER_AGENT).unwrap(), "custom/1.0");
        assert_eq!(map.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(map.get_all("x-probe").iter().count(), 2);
    }

    #[test]
    fn test_empty_accept_removed() {
        let map = build_headers(&[header("Accept", "")]).unwrap();
        assert!(map.get(ACCEPT).is_none());
    }

    #[test]
    fn test_invalid_header_rejected() {
        let err = build_headers(&[header("bad header", "x")]).unwrap_err();
        assert!(err.contains("bad header"));
    }
}
