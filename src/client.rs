//! Client for the daemon's HTTP API
//!
//! The daemon binds loopback only, so the client always dials 127.0.0.1 and
//! carries the dashboard Host header from the configured base URL; the
//! host-dispatch middleware routes on that header, not on DNS.

use crate::registry::{AppIn, AppOut, LogEntry, Status};
use anyhow::{Context, Result};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::http::Uri;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;

#[derive(Clone)]
pub struct Client {
    http: HyperClient<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    host_header: String,
    port: u16,
}

impl Client {
    /// Build a client from a base URL such as `http://cheetah.localhost:50000`.
    pub fn new(base_url: &str) -> Result<Self> {
        let uri: Uri = base_url.parse().context("parse url")?;
        let host = uri.host().context("base url has no host")?.to_string();
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            http: HyperClient::builder(TokioExecutor::new()).build(HttpConnector::new()),
            host_header: format!("{host}:{port}"),
            port,
        })
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<(StatusCode, Bytes)> {
        let uri = format!("http://127.0.0.1:{}{}", self.port, path);
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, HeaderValue::from_str(&self.host_header)?);

        let body = match body {
            Some(data) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Full::new(Bytes::from(data))
                    .map_err(|never| match never {})
                    .boxed()
            }
            None => Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
        };

        let request = builder.body(body).context("build request")?;
        let response = self.http.request(request).await.context("send request")?;

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .context("read response")?
            .to_bytes();
        Ok((status, bytes))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let (status, body) = self.request(Method::GET, path, None).await?;
        if !status.is_success() {
            anyhow::bail!("GET {path} failed: {status}");
        }
        serde_json::from_slice(&body).context("decode")
    }

    pub async fn status(&self) -> Result<Status> {
        self.get_json("/api/status").await
    }

    /// Register (or refresh) an app and return its assigned ports, database
    /// URL, and any env the dashboard holds for it.
    pub async fn app_post(&self, req: &AppIn) -> Result<AppOut> {
        let body = serde_json::to_vec(req).context("marshal")?;
        let (status, response) = self
            .request(Method::POST, "/api/apps", Some(body))
            .await
            .context("post")?;
        if status != StatusCode::CREATED && status != StatusCode::OK {
            anyhow::bail!("register failed: {status}");
        }
        serde_json::from_slice(&response).context("decode")
    }

    /// Best effort: deregistration failures are invisible by design.
    pub async fn app_delete(&self, space: &str) {
        let _ = self
            .request(Method::DELETE, &format!("/api/apps/{space}"), None)
            .await;
    }

    /// Best effort: losing a log line must never block the supervisor.
    pub async fn log_post(&self, space: &str, entries: &[LogEntry]) {
        let Ok(body) = serde_json::to_vec(entries) else {
            return;
        };
        let _ = self
            .request(Method::POST, &format!("/api/apps/{space}/logs"), Some(body))
            .await;
    }

    /// Best effort health report with the currently active port.
    pub async fn health_update(&self, space: &str, port_active: u16, status: &str) {
        let body = serde_json::json!({
            "port_active": port_active,
            "status": status,
        });
        let _ = self
            .request(
                Method::PUT,
                &format!("/api/apps/{space}/health"),
                Some(body.to_string().into_bytes()),
            )
            .await;
    }

    /// Record a pending OAuth flow so callbacks route back to this space.
    pub async fn oauth_state_post(&self, state: &str, space: &str) {
        let body = serde_json::json!({ "state": state, "space": space });
        let _ = self
            .request(
                Method::POST,
                "/api/oauth/state",
                Some(body.to_string().into_bytes()),
            )
            .await;
    }

    /// Open the daemon's event stream; the response body yields SSE frames
    /// until either side disconnects.
    pub async fn events(&self) -> Result<Response<Incoming>> {
        let uri = format!("http://127.0.0.1:{}/api/events", self.port);
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, HeaderValue::from_str(&self.host_header)?)
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .context("build request")?;
        self.http.request(request).await.context("open event stream")
    }
}
