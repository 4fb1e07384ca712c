//! Blue/green port manager
//!
//! Owns which of an app's two ports is live and orchestrates the
//! health-gated swap that makes rebuilds zero-downtime: the new port must
//! answer its health check before the active pointer moves, and the old
//! port keeps serving until after it has moved.

use crate::client::Client;
use anyhow::Result;
use futures::future::BoxFuture;
use hyper::StatusCode;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

pub type CheckHealth = Arc<dyn Fn(u16) -> BoxFuture<'static, Result<u16>> + Send + Sync>;
pub type ReportHealth = Arc<dyn Fn(String, u16) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct Config {
    pub check_health: CheckHealth,
    pub check_interval: Duration,
    pub check_retries: u32,
    pub report_health: ReportHealth,
}

pub struct Manager {
    blue: u16,
    green: u16,
    active: Mutex<u16>,
    config: Config,
}

impl Manager {
    pub fn new(blue: u16, green: u16, config: Config) -> Self {
        Self {
            blue,
            green,
            active: Mutex::new(blue),
            config,
        }
    }

    pub fn active(&self) -> u16 {
        *self.active.lock()
    }

    pub fn inactive(&self) -> u16 {
        if *self.active.lock() == self.green {
            self.blue
        } else {
            self.green
        }
    }

    pub fn set_active(&self, port: u16) {
        *self.active.lock() = port;
    }

    /// Poll the health check up to `check_retries` times, one
    /// `check_interval` apart. True on the first HTTP 200.
    pub async fn wait_for_healthy(&self, port: u16) -> bool {
        for _ in 0..self.config.check_retries {
            tokio::time::sleep(self.config.check_interval).await;
            match (self.config.check_health)(port).await {
                Ok(status) if status == StatusCode::OK.as_u16() => return true,
                _ => {}
            }
        }
        false
    }

    /// Report a health status together with the port that is active at the
    /// moment of the call. The snapshot is taken under the lock so a
    /// concurrent [`set_active`] can never reorder status relative to port.
    ///
    /// [`set_active`]: Manager::set_active
    pub async fn report_health(&self, status: &str) {
        let port = *self.active.lock();
        (self.config.report_health)(status.to_string(), port).await;
    }

    /// Blue/green swap: start the inactive port, gate on its health, move
    /// the active pointer, then stop the old port.
    ///
    /// On a start failure nothing is touched and the old port keeps
    /// serving; the failed start is the caller's to clean up. On a health
    /// failure the new port is stopped and the active pointer is unchanged.
    pub async fn swap<S, T>(&self, start: S, stop: T) -> bool
    where
        S: Fn(u16) -> BoxFuture<'static, Result<()>>,
        T: Fn(u16) -> BoxFuture<'static, ()>,
    {
        let new = self.inactive();
        let old = self.active();

        if let Err(e) = start(new).await {
            warn!(port = new, error = %e, "start failed");
            return false;
        }

        if !self.wait_for_healthy(new).await {
            stop(new).await;
            return false;
        }

        self.set_active(new);
        self.report_health("healthy").await;
        stop(old).await;
        true
    }
}

/// Production config: probe `GET /health` on loopback with a 1 second
/// timeout, report transitions to the dashboard.
pub fn default_config(client: Client, space: String) -> Config {
    Config {
        check_health: Arc::new(|port| -> BoxFuture<'static, Result<u16>> {
            Box::pin(async move {
                tokio::time::timeout(Duration::from_secs(1), probe_health(port))
                    .await
                    .map_err(|_| anyhow::anyhow!("health check timed out"))?
            })
        }),
        check_interval: Duration::from_millis(500),
        check_retries: 30,
        report_health: Arc::new(move |status, port| -> BoxFuture<'static, ()> {
            let client = client.clone();
            let space = space.clone();
            Box::pin(async move {
                client.health_update(&space, port, &status).await;
            })
        }),
    }
}

/// One-shot HTTP/1.1 health probe returning the status code.
pub(crate) async fn probe_health(port: u16) -> Result<u16> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request =
        format!("GET /health HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| anyhow::anyhow!("malformed health response"))?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(
        check: impl Fn(u16) -> Result<u16> + Send + Sync + 'static,
        reports: Arc<Mutex<Vec<String>>>,
    ) -> Config {
        let check = Arc::new(check);
        Config {
            check_health: Arc::new(move |port| -> BoxFuture<'static, Result<u16>> {
                let check = Arc::clone(&check);
                Box::pin(async move { check(port) })
            }),
            check_interval: Duration::from_millis(1),
            check_retries: 3,
            report_health: Arc::new(move |status, port| -> BoxFuture<'static, ()> {
                let reports = Arc::clone(&reports);
                Box::pin(async move {
                    reports.lock().push(format!("{status}:{port}"));
                })
            }),
        }
    }

    fn start_ok(_: u16) -> BoxFuture<'static, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn stop_into(stopped: Arc<Mutex<Vec<u16>>>) -> impl Fn(u16) -> BoxFuture<'static, ()> {
        move |port| -> BoxFuture<'static, ()> {
            let stopped = Arc::clone(&stopped);
            Box::pin(async move {
                stopped.lock().push(port);
            })
        }
    }

    #[test]
    fn test_inactive() {
        let m = Manager::new(5000, 5001, test_config(|_| Ok(200), Default::default()));
        m.set_active(5000);
        assert_eq!(m.inactive(), 5001);
        m.set_active(5001);
        assert_eq!(m.inactive(), 5000);
    }

    #[tokio::test]
    async fn test_wait_for_healthy() {
        let healthy = Manager::new(5000, 5001, test_config(|_| Ok(200), Default::default()));
        assert!(healthy.wait_for_healthy(5000).await);

        let refused = Manager::new(
            5000,
            5001,
            test_config(|_| anyhow::bail!("connection refused"), Default::default()),
        );
        assert!(!refused.wait_for_healthy(5000).await);

        let unavailable = Manager::new(5000, 5001, test_config(|_| Ok(503), Default::default()));
        assert!(!unavailable.wait_for_healthy(5000).await);
    }

    #[tokio::test]
    async fn test_swap_success() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let m = Manager::new(5000, 5001, test_config(|_| Ok(200), Arc::clone(&reports)));
        let stopped = Arc::new(Mutex::new(Vec::new()));

        assert!(m.swap(start_ok, stop_into(Arc::clone(&stopped))).await);
        assert_eq!(m.active(), 5001);
        assert_eq!(*reports.lock(), vec!["healthy:5001"]);
        assert_eq!(*stopped.lock(), vec![5000]);
    }

    #[tokio::test]
    async fn test_swap_start_failure_leaves_active_untouched() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let m = Manager::new(5000, 5001, test_config(|_| Ok(200), Arc::clone(&reports)));
        let stopped = Arc::new(Mutex::new(Vec::new()));

        let start = |_: u16| -> BoxFuture<'static, Result<()>> {
            Box::pin(async { anyhow::bail!("build error") })
        };
        assert!(!m.swap(start, stop_into(Arc::clone(&stopped))).await);
        assert_eq!(m.active(), 5000);
        assert!(reports.lock().is_empty());
        assert!(stopped.lock().is_empty());
    }

    #[tokio::test]
    async fn test_swap_health_failure_stops_new_port() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let m = Manager::new(
            5000,
            5001,
            test_config(|_| anyhow::bail!("unhealthy"), Arc::clone(&reports)),
        );
        let stopped = Arc::new(Mutex::new(Vec::new()));

        assert!(!m.swap(start_ok, stop_into(Arc::clone(&stopped))).await);
        assert_eq!(m.active(), 5000);
        assert!(reports.lock().is_empty());
        assert_eq!(*stopped.lock(), vec![5001]);
    }

    #[tokio::test]
    async fn test_report_health_snapshots_active_port() {
        let reports = Arc::new(Mutex::new(Vec::new()));
        let m = Manager::new(5000, 5001, test_config(|_| Ok(200), Arc::clone(&reports)));

        m.report_health("unknown").await;
        m.set_active(5001);
        m.report_health("healthy").await;

        assert_eq!(*reports.lock(), vec!["unknown:5000", "healthy:5001"]);
    }
}
