//! Readiness polling for freshly spawned services

use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Default delay between probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound for a single probe
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Something that answers once a service can accept traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessTarget {
    /// A TCP port that accepts connections
    Tcp { host: String, port: u16 },
    /// An HTTP endpoint; any response counts unless `expected_status` is set
    Http {
        url: String,
        expected_status: Option<u16>,
    },
}

impl ReadinessTarget {
    /// Port the target listens on, if known
    pub fn port(&self) -> Option<u16> {
        match self {
            ReadinessTarget::Tcp { port, .. } => Some(*port),
            ReadinessTarget::Http { url, .. } => reqwest::Url::parse(url)
                .ok()
                .and_then(|u| u.port_or_known_default()),
        }
    }
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessTarget::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            ReadinessTarget::Http { url, .. } => write!(f, "{}", url),
        }
    }
}

/// Result of waiting for readiness
#[derive(Debug, Clone)]
pub struct Readiness {
    pub ready: bool,
    /// Error from the most recent failed probe
    pub last_error: Option<String>,
    /// Number of probes performed
    pub probes: u32,
}

/// Polls readiness targets at a fixed interval until success or a deadline
#[derive(Debug, Clone)]
pub struct ReadinessChecker {
    client: reqwest::Client,
    interval: Duration,
    probe_timeout: Duration,
}

impl ReadinessChecker {
    /// Create a checker polling every `interval`
    pub fn new(interval: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_PROBE_TIMEOUT)
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            interval,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until `target` answers or `timeout` elapses.
    ///
    /// A missing target is ready immediately. Refused connections and
    /// unexpected statuses are "not yet ready" and retried; the wait never
    /// runs meaningfully past `timeout` because each probe is capped by the
    /// time remaining.
    pub async fn wait_ready(
        &self,
        target: Option<&ReadinessTarget>,
        timeout: Duration,
    ) -> Readiness {
        let Some(target) = target else {
            return Readiness {
                ready: true,
                last_error: None,
                probes: 0,
            };
        };

        let deadline = Instant::now() + timeout;
        let mut probes = 0;

        let last_error = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            probes += 1;

            let probe_timeout = remaining.min(self.probe_timeout);
            let error = match tokio::time::timeout(probe_timeout, self.probe(target)).await {
                Ok(Ok(())) => {
                    log::debug!("{} ready after {} probe(s)", target, probes);
                    return Readiness {
                        ready: true,
                        last_error: None,
                        probes,
                    };
                }
                Ok(Err(e)) => e,
                Err(_) => format!("probe of {} timed out", target),
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break error;
            }
            tokio::time::sleep(self.interval.min(remaining)).await;
        };

        Readiness {
            ready: false,
            last_error: Some(last_error),
            probes,
        }
    }

    /// Probe the target once
    pub async fn probe(&self, target: &ReadinessTarget) -> Result<(), String> {
        match target {
            ReadinessTarget::Tcp { host, port } => TcpStream::connect((host.as_str(), *port))
                .await
                .map(|_| ())
                .map_err(|e| format!("connect to {}:{} failed: {}", host, port, e)),
            ReadinessTarget::Http {
                url,
                expected_status,
            } => {
                let response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| format!("GET {} failed: {}", url, e))?;

                match expected_status {
                    Some(expected) if response.status().as_u16() != *expected => Err(format!(
                        "GET {} returned {} (expected {})",
                        url,
                        response.status().as_u16(),
                        expected
                    )),
                    _ => Ok(()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn tcp(port: u16) -> ReadinessTarget {
        ReadinessTarget::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        }
    }

    /// Minimal HTTP server answering every request with `status`
    async fn serve_status(status: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut request = [0u8; 1024];
                let _ = stream.read(&mut request).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                    status
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_no_target_is_ready_immediately() {
        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();
        let readiness = checker.wait_ready(None, Duration::from_secs(5)).await;
        assert!(readiness.ready);
        assert_eq!(readiness.probes, 0);
    }

    #[tokio::test]
    async fn test_tcp_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();
        let readiness = checker
            .wait_ready(Some(&tcp(port)), Duration::from_secs(2))
            .await;
        assert!(readiness.ready);
        assert_eq!(readiness.probes, 1);
    }

    #[tokio::test]
    async fn test_tcp_becomes_ready_later() {
        let port = free_port();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(listener);
        });

        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();
        let started = StdInstant::now();
        let readiness = checker
            .wait_ready(Some(&tcp(port)), Duration::from_secs(3))
            .await;
        assert!(readiness.ready);
        assert!(readiness.probes > 1);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_refused_times_out_at_deadline() {
        let port = free_port();
        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();

        let started = StdInstant::now();
        let readiness = checker
            .wait_ready(Some(&tcp(port)), Duration::from_millis(400))
            .await;
        let elapsed = started.elapsed();

        assert!(!readiness.ready);
        assert!(readiness.last_error.unwrap().contains("connect"));
        assert!(elapsed >= Duration::from_millis(400), "gave up early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(900), "gave up late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_zero_timeout_probes_once() {
        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();
        let readiness = checker
            .wait_ready(Some(&tcp(free_port())), Duration::ZERO)
            .await;

        assert!(!readiness.ready);
        assert_eq!(readiness.probes, 1);
        assert!(readiness.last_error.is_some());
    }

    #[tokio::test]
    async fn test_http_any_status_counts() {
        let port = serve_status("503 Service Unavailable").await;
        let target = ReadinessTarget::Http {
            url: format!("http://127.0.0.1:{}/health", port),
            expected_status: None,
        };

        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();
        let readiness = checker.wait_ready(Some(&target), Duration::from_secs(2)).await;
        assert!(readiness.ready);
    }

    #[tokio::test]
    async fn test_http_expected_status_mismatch() {
        let port = serve_status("503 Service Unavailable").await;
        let target = ReadinessTarget::Http {
            url: format!("http://127.0.0.1:{}/health", port),
            expected_status: Some(200),
        };

        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();
        let readiness = checker
            .wait_ready(Some(&target), Duration::from_millis(300))
            .await;
        assert!(!readiness.ready);
        assert!(readiness.last_error.unwrap().contains("503"));
    }

    #[tokio::test]
    async fn test_http_expected_status_match() {
        let port = serve_status("200 OK").await;
        let target = ReadinessTarget::Http {
            url: format!("http://127.0.0.1:{}/health", port),
            expected_status: Some(200),
        };

        let checker = ReadinessChecker::new(Duration::from_millis(50)).unwrap();
        assert!(checker.probe(&target).await.is_ok());
    }

    #[test]
    fn test_target_port() {
        assert_eq!(tcp(5432).port(), Some(5432));

        let http = ReadinessTarget::Http {
            url: "http://localhost:8765/health".to_string(),
            expected_status: None,
        };
        assert_eq!(http.port(), Some(8765));

        let default_port = ReadinessTarget::Http {
            url: "https://example.com/health".to_string(),
            expected_status: None,
        };
        assert_eq!(default_port.port(), Some(443));
        assert_eq!(tcp(80).to_string(), "tcp://127.0.0.1:80");
    }
}
