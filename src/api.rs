//! HTTP/SSE API and host dispatch
//!
//! One listener serves everything on the dashboard port. Each request is
//! classified by its Host header: OAuth callbacks on the bare host go to
//! the redistributor, non-dashboard subdomains are reverse-proxied to the
//! resolved app, and the reserved dashboard subdomain reaches the API and
//! dashboard page routed here.

use crate::dashboard;
use crate::error::{json_error, proxy_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy;
use crate::registry::{
    extract_subdomain, AppIn, HealthStatus, LogEntry, Registry, RESERVED_SUBDOMAINS,
};
use crate::secrets;
use anyhow::{Context, Result};
use futures::FutureExt;
use futures::StreamExt;
use http_body_util::{combinators::BoxBody, BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, HOST,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

/// The daemon's HTTP server: API, dashboard, event stream, and proxy.
pub struct ApiServer {
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    bind_addr: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
}

impl ApiServer {
    pub fn new(
        registry: Arc<Registry>,
        bind_addr: SocketAddr,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            bind_addr,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("bind {}", self.bind_addr))?;
        info!(addr = %self.bind_addr, "cheetah listening");

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, registry, pool).await {
                                    debug!(addr = %addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, registry, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {e}"))?;

    Ok(())
}

type HandlerResponse = Response<BoxBody<Bytes, hyper::Error>>;

async fn handle_request(
    req: Request<Incoming>,
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    addr: SocketAddr,
) -> std::result::Result<HandlerResponse, hyper::Error> {
    // Handlers must never take the daemon down; a panic becomes a 500.
    match AssertUnwindSafe(dispatch(req, registry, pool, addr))
        .catch_unwind()
        .await
    {
        Ok(response) => Ok(response),
        Err(_) => {
            error!("handler panicked");
            Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error",
            ))
        }
    }
}

async fn dispatch(
    req: Request<Incoming>,
    registry: Arc<Registry>,
    pool: Arc<ConnectionPool>,
    addr: SocketAddr,
) -> HandlerResponse {
    let Some(host) = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_lowercase)
    else {
        return proxy_error_response(ProxyErrorCode::MissingHostHeader, "missing Host header");
    };

    let sub = extract_subdomain(&host);

    // Providers that registered a bare callback URL deliver to localhost
    // without a subdomain; redistribute those to their initiating app.
    if sub.is_empty() && proxy::is_oauth_callback(req.uri()) {
        return proxy::oauth_bounce_response(req.uri(), &registry);
    }

    if !RESERVED_SUBDOMAINS.contains(&sub.as_str()) {
        let method = req.method().clone();
        let uri = req.uri().clone();
        let response = proxy::handle(req, &host, &registry, &pool, addr).await;
        info!(method = %method, uri = %uri, status = response.status().as_u16(), "request");
        return response;
    }

    api_routes(req, &registry).await
}

async fn api_routes(req: Request<Incoming>, registry: &Registry) -> HandlerResponse {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (&method, segments.as_slice()) {
        (&Method::GET, []) => html_response(dashboard::render(
            &registry.status(),
            &registry.list(),
        )),
        (&Method::GET, ["spaces.js"]) => script_response(dashboard::SPACES_JS),
        (&Method::GET, ["api", "status"]) => json_response(StatusCode::OK, &registry.status()),
        (&Method::GET, ["api", "events"]) => handle_events(registry),
        (&Method::GET, ["api", "apps"]) => json_response(StatusCode::OK, &registry.list()),
        (&Method::POST, ["api", "apps"]) => handle_app_post(req, registry).await,
        (&Method::GET, ["api", "apps", space]) => match registry.get(space) {
            Some(app) => json_response(StatusCode::OK, &app),
            None => json_error(StatusCode::NOT_FOUND, "not found"),
        },
        (&Method::DELETE, ["api", "apps", space]) => {
            if registry.deregister(space) {
                info!(space, "deregister");
                no_content()
            } else {
                json_error(StatusCode::NOT_FOUND, "not found")
            }
        }
        (&Method::POST, ["api", "apps", space, "logs"]) => {
            let space = space.to_string();
            match read_json::<Vec<LogEntry>>(req).await {
                Ok(entries) => {
                    if registry.append_logs(&space, entries) {
                        no_content()
                    } else {
                        json_error(StatusCode::NOT_FOUND, "not found")
                    }
                }
                Err(response) => response,
            }
        }
        (&Method::PUT, ["api", "apps", space, "health"]) => {
            let space = space.to_string();
            match read_json::<HealthIn>(req).await {
                Ok(body) => {
                    if registry.update_health(&space, body.status, body.port_active) {
                        no_content()
                    } else {
                        json_error(StatusCode::NOT_FOUND, "not found")
                    }
                }
                Err(response) => response,
            }
        }
        (&Method::GET, ["api", "env"]) => json_response(StatusCode::OK, &registry.env_list()),
        (&Method::POST, ["api", "env", "export"]) => handle_env_export(req, registry).await,
        (&Method::POST, ["api", "env", "import"]) => handle_env_import(req, registry).await,
        (&Method::GET, ["api", "env", app]) => {
            let vars = registry.env_get(app).unwrap_or_default();
            json_response(StatusCode::OK, &vars)
        }
        (&Method::PUT, ["api", "env", app]) => {
            let app = app.to_string();
            match read_json::<HashMap<String, String>>(req).await {
                Ok(vars) => {
                    registry.env_replace(&app, vars);
                    no_content()
                }
                Err(response) => response,
            }
        }
        (&Method::DELETE, ["api", "env", app, key]) => {
            if registry.env_delete_key(app, key) {
                no_content()
            } else {
                json_error(StatusCode::NOT_FOUND, "not found")
            }
        }
        (&Method::POST, ["api", "oauth", "state"]) => handle_oauth_state(req, registry).await,
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    }
}

#[derive(Deserialize)]
struct HealthIn {
    status: HealthStatus,
    #[serde(default)]
    port_active: Option<u16>,
}

#[derive(Deserialize)]
struct EnvExportIn {
    #[serde(default)]
    app: String,
    #[serde(default)]
    passphrase: String,
}

#[derive(Serialize)]
struct EnvExportOut {
    blob: String,
}

#[derive(Deserialize)]
struct EnvImportIn {
    #[serde(default)]
    blob: String,
    #[serde(default)]
    passphrase: String,
}

#[derive(Deserialize)]
struct OauthStateIn {
    #[serde(default)]
    state: String,
    #[serde(default)]
    space: String,
}

async fn handle_app_post(req: Request<Incoming>, registry: &Registry) -> HandlerResponse {
    let body = match read_json::<AppIn>(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if body.space.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "space is required");
    }

    let app_name = crate::space::app_name(&body.dir, &body.space);
    let (app, existed) = registry.register(body);
    info!(space = %app.space, existed, "register");

    let status = if existed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    json_response(
        status,
        &crate::registry::AppOut {
            database_url: app.database_url.clone(),
            env: registry.env_get(&app_name).unwrap_or_default(),
            ports: app.ports,
            space: app.space,
        },
    )
}

async fn handle_env_export(req: Request<Incoming>, registry: &Registry) -> HandlerResponse {
    let body = match read_json::<EnvExportIn>(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if body.app.is_empty() || body.passphrase.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "app and passphrase required");
    }

    let Some(vars) = registry.env_get(&body.app) else {
        return json_error(StatusCode::NOT_FOUND, "no env for app");
    };

    match secrets::encrypt_env(&body.app, &vars, &body.passphrase) {
        Ok(blob) => json_response(StatusCode::OK, &EnvExportOut { blob }),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")),
    }
}

async fn handle_env_import(req: Request<Incoming>, registry: &Registry) -> HandlerResponse {
    let body = match read_json::<EnvImportIn>(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if body.blob.is_empty() || body.passphrase.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "blob and passphrase required");
    }

    let (app, vars) = match secrets::decrypt_env(&body.blob, &body.passphrase) {
        Ok(result) => result,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("{e:#}")),
    };

    registry.env_replace(&app, vars.clone());
    json_response(
        StatusCode::OK,
        &serde_json::json!({ "app": app, "vars": vars }),
    )
}

async fn handle_oauth_state(req: Request<Incoming>, registry: &Registry) -> HandlerResponse {
    let body = match read_json::<OauthStateIn>(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    if body.state.is_empty() || body.space.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "state and space required");
    }
    if registry.get(&body.space).is_none() {
        return json_error(StatusCode::NOT_FOUND, "not found");
    }
    registry.oauth_state_put(&body.state, &body.space);
    no_content()
}

/// SSE: a snapshot `init` event, then every broadcast until the client
/// disconnects. The server side never closes the stream.
fn handle_events(registry: &Registry) -> HandlerResponse {
    let apps = registry.list();
    let init = Bytes::from(format!(
        "event: init\ndata: {}\n\n",
        serde_json::to_string(&apps).unwrap_or_else(|_| "[]".to_string())
    ));
    let rx = registry.subscribe();

    let stream = futures::stream::once(async move { init })
        .chain(ReceiverStream::new(rx))
        .map(|bytes| Ok::<_, hyper::Error>(Frame::data(bytes)));

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, "keep-alive")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(BodyExt::boxed(StreamBody::new(stream)))
        .expect("valid response with static headers")
}

async fn read_json<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> std::result::Result<T, HandlerResponse> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("read body: {e}")))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, format!("decode body: {e}")))
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> HandlerResponse {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

fn html_response(page: String) -> HandlerResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(page)).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

fn script_response(script: &'static str) -> HandlerResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/javascript")
        .header(CACHE_CONTROL, "no-cache")
        .body(Full::new(Bytes::from_static(script.as_bytes())).map_err(|never| match never {}).boxed())
        .expect("valid response with static headers")
}

fn no_content() -> HandlerResponse {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Full::new(Bytes::new()).map_err(|never| match never {}).boxed())
        .expect("valid empty response")
}
