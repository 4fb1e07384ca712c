//! Pooled HTTP client for guest ports
//!
//! Proxied requests reuse upstream connections instead of dialing the guest
//! for every request. Guests only ever live on loopback, so the pool rewrites
//! each request onto `127.0.0.1:<port>` before sending.

use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Error type for pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "client error: {e}"),
            PoolError::RequestBuild(s) => write!(f, "request build error: {s}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per guest port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A pool of HTTP connections to guest ports
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        Self { client }
    }

    /// Forward an inbound request to a guest port, rewriting the URI and
    /// Host header onto loopback. The response body streams through.
    pub async fn send_request(
        &self,
        mut req: Request<Incoming>,
        port: u16,
    ) -> Result<Response<Incoming>, PoolError> {
        rewrite_to_port(&mut req, port)?;
        Ok(self.client.request(req).await?)
    }
}

fn rewrite_to_port<B>(req: &mut Request<B>, port: u16) -> Result<(), PoolError> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://127.0.0.1:{port}{path}")
        .parse()
        .map_err(|e| PoolError::RequestBuild(format!("{e}")))?;
    *req.uri_mut() = uri;

    let host = HeaderValue::from_str(&format!("127.0.0.1:{port}"))
        .map_err(|e| PoolError::RequestBuild(format!("{e}")))?;
    req.headers_mut().insert(HOST, host);
    Ok(())
}
