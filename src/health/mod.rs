//! Liveness probe for a listening port: HTTP first, raw TCP as fallback.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpStream;

pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const OK_CEILING_MS: u64 = 2_000;
const SLOW_CEILING_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Slow,
    Timeout,
    Down,
    /// Nothing to probe.
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub port: Option<u16>,
    pub status: HealthStatus,
    pub response_ms: u64,
    pub message: String,
    pub checked_at: DateTime<Utc>,
}

impl HealthCheck {
    /// Placeholder for an entry that has no port.
    pub fn unknown() -> Self {
        Self {
            port: None,
            status: HealthStatus::Unknown,
            response_ms: 0,
            message: "no port to probe".to_string(),
            checked_at: Utc::now(),
        }
    }
}

/// Latency bands: `≤ 2000 ms` ok, `≤ 5000 ms` slow, anything above timeout.
pub fn categorize(response_ms: u64) -> HealthStatus {
    if response_ms <= OK_CEILING_MS {
        HealthStatus::Ok
    } else if response_ms <= SLOW_CEILING_MS {
        HealthStatus::Slow
    } else {
        HealthStatus::Timeout
    }
}

pub struct HealthChecker {
    timeout: Duration,
    client: reqwest::Client,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_TIMEOUT)
    }
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        // 로컬 포트만 확인하므로 프록시 설정을 따르지 않음
        let client = match reqwest::Client::builder().timeout(timeout).no_proxy().build() {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            }
        };
        Self { timeout, client }
    }

    pub async fn check(&self, port: u16) -> HealthCheck {
        let checked_at = Utc::now();

        if let Some(ms) = self.probe_http(port).await {
            return HealthCheck {
                port: Some(port),
                status: categorize(ms),
                response_ms: ms,
                message: format!("HTTP responding in {}ms", ms),
                checked_at,
            };
        }

        if let Some(ms) = self.probe_tcp(port).await {
            return HealthCheck {
                port: Some(port),
                status: categorize(ms),
                response_ms: ms,
                message: format!("TCP responding in {}ms", ms),
                checked_at,
            };
        }

        HealthCheck {
            port: Some(port),
            status: HealthStatus::Down,
            response_ms: 0,
            message: "no response over HTTP or TCP".to_string(),
            checked_at,
        }
    }

    /// Any HTTP response counts, whatever its status code.
    async fn probe_http(&self, port: u16) -> Option<u64> {
        let url = format!("http://localhost:{}", port);
        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(_) => Some(elapsed_ms(started)),
            Err(e) => {
                tracing::debug!("HTTP probe of {} failed: {}", url, e);
                None
            }
        }
    }

    async fn probe_tcp(&self, port: u16) -> Option<u64> {
        let started = Instant::now();
        match tokio::time::timeout(self.timeout, TcpStream::connect(("localhost", port))).await {
            Ok(Ok(_stream)) => Some(elapsed_ms(started)),
            Ok(Err(e)) => {
                tracing::debug!("TCP probe of port {} failed: {}", port, e);
                None
            }
            Err(_) => None,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_categorize_is_monotonic() {
        assert_eq!(categorize(0), HealthStatus::Ok);
        assert_eq!(categorize(2_000), HealthStatus::Ok);
        assert_eq!(categorize(2_001), HealthStatus::Slow);
        assert_eq!(categorize(5_000), HealthStatus::Slow);
        assert_eq!(categorize(5_001), HealthStatus::Timeout);
    }

    #[tokio::test]
    async fn test_http_server_is_ok() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .await;
            }
        });

        let check = HealthChecker::new(Duration::from_secs(2)).check(port).await;
        assert_eq!(check.status, HealthStatus::Ok);
        assert!(check.message.starts_with("HTTP"), "{}", check.message);
    }

    #[tokio::test]
    async fn test_silent_listener_falls_back_to_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        // 연결은 받지만 아무 응답도 보내지 않음
        let _keep = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let check = HealthChecker::new(Duration::from_millis(300)).check(port).await;
        assert_eq!(check.status, HealthStatus::Ok);
        assert!(check.message.starts_with("TCP"), "{}", check.message);
    }

    #[tokio::test]
    async fn test_closed_port_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let check = HealthChecker::new(Duration::from_millis(500)).check(port).await;
        assert_eq!(check.status, HealthStatus::Down);
        assert_eq!(check.port, Some(port));
    }

    #[test]
    fn test_unknown_has_no_port() {
        let check = HealthCheck::unknown();
        assert_eq!(check.status, HealthStatus::Unknown);
        assert!(check.port.is_none());
    }
}
