//! TCP connect probe executor

use super::ProbeResult;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Try to open a TCP connection to `host:port`.
///
/// A successful connect is closed immediately. Any error, including a timeout
/// or a failed name lookup, is a `Failure` carrying the error text.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> (ProbeResult, String) {
    let connect = TcpStream::connect((host, port));
    let outcome = if timeout.is_zero() {
        connect.await
    } else {
        match tokio::time::timeout(timeout, connect).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return (
                    ProbeResult::Failure,
                    format!("dial tcp {}:{}: i/o timeout", host, port),
                );
            }
        }
    };

    match outcome {
        Ok(stream) => {
            drop(stream);
            debug!(host, port, "TCP probe succeeded");
            (ProbeResult::Success, String::new())
        }
        Err(e) => (
            ProbeResult::Failure,
            format!("dial tcp {}:{}: {}", host, port, e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (result, output) = probe_tcp("127.0.0.1", port, Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Success);
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn test_refused_is_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (result, output) = probe_tcp("127.0.0.1", port, Duration::from_secs(1)).await;
        assert_eq!(result, ProbeResult::Failure);
        assert!(output.contains(&port.to_string()));
    }
}
