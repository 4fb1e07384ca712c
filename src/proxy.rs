//! Host-routed reverse proxy
//!
//! Requests that do not name the dashboard are forwarded to the resolved
//! app's active port. HTML responses get a status-bubble script injected so
//! guest pages can show build state and soft-reload on port swaps. OAuth
//! callbacks landing on the bare host are redistributed to the app that
//! initiated the flow.

use crate::error::{proxy_error_response, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::registry::Registry;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, TRANSFER_ENCODING};
use hyper::http::Uri;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use tracing::{debug, error};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Forward a request to the app resolved from its Host header. With no
/// resolvable target the browser is bounced to the dashboard.
pub async fn handle(
    mut req: Request<Incoming>,
    host: &str,
    registry: &Registry,
    pool: &ConnectionPool,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let dashboard_port = registry.config().dashboard_port;
    let Some((space, port)) = registry.target_for_request(host) else {
        return redirect(&format!("http://cheetah.localhost:{dashboard_port}/"));
    };

    // Generate or propagate a request ID, and overwrite forwarding headers
    // rather than appending: this proxy is the first trusted hop.
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let original_host = req.headers().get(HOST).cloned();
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host_value) = original_host {
        headers.insert(X_FORWARDED_HOST, host_value);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(space, port, method = %req.method(), uri = %req.uri(), request_id, "proxy");

    let response = match pool.send_request(req, port).await {
        Ok(response) => response,
        Err(e) => {
            error!(space, port, error = %e, "failed to forward request");
            return proxy_error_response(
                ProxyErrorCode::ConnectionFailed,
                "failed to connect to app",
            );
        }
    };

    let is_html = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/html"))
        .unwrap_or(false);

    if !is_html {
        // Stream through with no buffering so SSE and long polls pass
        let (parts, body) = response.into_parts();
        return Response::from_parts(parts, body.boxed());
    }

    // HTML gets the status script injected, which requires the full body
    let (mut parts, body) = response.into_parts();
    let collected = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!(space, port, error = %e, "failed to read response body");
            return proxy_error_response(ProxyErrorCode::InternalError, "failed to read app response");
        }
    };

    let body_text = String::from_utf8_lossy(&collected);
    let injected = match inject_status_script(&body_text, &space, port, dashboard_port) {
        Some(injected) => Bytes::from(injected),
        None => collected,
    };

    parts.headers.remove(TRANSFER_ENCODING);
    if let Ok(value) = HeaderValue::from_str(&injected.len().to_string()) {
        parts.headers.insert(CONTENT_LENGTH, value);
    }
    Response::from_parts(
        parts,
        Full::new(injected).map_err(|never| match never {}).boxed(),
    )
}

/// Inject the status-bubble script before the last closing body tag.
/// Returns None when the document has no such tag; the response is then
/// forwarded unchanged.
pub fn inject_status_script(
    body: &str,
    space: &str,
    port: u16,
    dashboard_port: u16,
) -> Option<String> {
    let idx = body.rfind("</body>")?;
    let script = format!(
        "<script src=\"//cheetah.localhost:{dashboard_port}/spaces.js\" data-space=\"{space}\" data-port=\"{port}\"></script>"
    );
    let mut out = String::with_capacity(body.len() + script.len());
    out.push_str(&body[..idx]);
    out.push_str(&script);
    out.push_str(&body[idx..]);
    Some(out)
}

/// True for requests that look like an OAuth provider delivering a callback:
/// a callback-ish path carrying both `code` and `state`.
pub fn is_oauth_callback(uri: &Uri) -> bool {
    if !uri.path().contains("/callback") {
        return false;
    }
    let params = query_params(uri);
    let has = |key| params.iter().any(|(k, _)| k == key);
    has("code") && has("state")
}

/// Redistribute an OAuth callback that arrived at the bare host.
///
/// Resolution order: the recorded state map (consumed on use, so replays
/// fall through), then `space|nonce` state splitting against known apps,
/// then the dashboard host unchanged so the true initiator can pick it up
/// once known.
pub fn oauth_bounce_response(
    uri: &Uri,
    registry: &Registry,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let dashboard_port = registry.config().dashboard_port;
    let params = query_params(uri);
    let state = params
        .iter()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.clone())
        .unwrap_or_default();

    let (space, new_state) = if let Some(space) = registry.oauth_state_take(&state) {
        (Some(space), state.clone())
    } else if let Some((space, nonce)) = state.split_once('|') {
        if !space.is_empty() && registry.get(space).is_some() {
            (Some(space.to_string()), nonce.to_string())
        } else {
            (None, state.clone())
        }
    } else {
        (None, state.clone())
    };

    let mut rest: Vec<(String, String)> = params
        .into_iter()
        .filter(|(k, _)| k != "state")
        .collect();
    rest.push(("state".to_string(), new_state));
    rest.sort_by(|a, b| a.0.cmp(&b.0));

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &rest {
        serializer.append_pair(k, v);
    }
    let query = serializer.finish();

    let path = uri.path();
    let target = match space {
        Some(space) => format!("http://{space}.localhost:{dashboard_port}{path}?{query}"),
        None => format!("http://localhost:{dashboard_port}{path}?{query}"),
    };
    redirect(&target)
}

fn query_params(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

pub fn redirect(location: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::TEMPORARY_REDIRECT)
        .header(
            LOCATION,
            HeaderValue::from_str(location).unwrap_or(HeaderValue::from_static("/")),
        )
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid redirect response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AppIn, RegistryConfig};

    fn test_registry() -> Registry {
        let reg = Registry::new(RegistryConfig {
            blue_port_start: 4000,
            dashboard_port: 50000,
            postgres_port: 54320,
        });
        for space in ["buffalo", "manama"] {
            reg.register(AppIn {
                space: space.to_string(),
                ..Default::default()
            });
        }
        reg
    }

    fn location(resp: &Response<BoxBody<Bytes, hyper::Error>>) -> String {
        resp.headers()
            .get(LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_inject_replaces_last_body_tag() {
        let html = "<html><body><code></body></code>text</body></html>";
        let out = inject_status_script(html, "auth", 4001, 50000).unwrap();

        // Only the last closing tag gains the script
        assert_eq!(out.matches("<script").count(), 1);
        let script_idx = out.find("<script").unwrap();
        assert!(script_idx > out.find("text").unwrap());
        assert!(out.contains("data-space=\"auth\""));
        assert!(out.contains("data-port=\"4001\""));
        assert!(out.ends_with("</script></body></html>"));
    }

    #[test]
    fn test_inject_without_body_tag() {
        assert!(inject_status_script("{\"not\":\"html\"}", "auth", 4001, 50000).is_none());
    }

    #[test]
    fn test_is_oauth_callback() {
        let yes: Uri = "/auth/callback?code=abc&state=xyz".parse().unwrap();
        assert!(is_oauth_callback(&yes));

        let no_code: Uri = "/auth/callback?state=xyz".parse().unwrap();
        assert!(!is_oauth_callback(&no_code));

        let wrong_path: Uri = "/auth/login?code=abc&state=xyz".parse().unwrap();
        assert!(!is_oauth_callback(&wrong_path));
    }

    #[test]
    fn test_oauth_bounce_state_splitting() {
        let reg = test_registry();
        let uri: Uri = "/auth/callback?code=abc&state=buffalo%7Cxyz".parse().unwrap();

        let resp = oauth_bounce_response(&uri, &reg);
        assert_eq!(resp.status(), StatusCode::TEMPORARY_REDIRECT);
        let loc = location(&resp);
        assert!(loc.starts_with("http://buffalo.localhost:50000/auth/callback?"));
        assert!(loc.contains("code=abc"));
        assert!(loc.contains("state=xyz"));
        assert!(!loc.contains("buffalo%7C"));
    }

    #[test]
    fn test_oauth_bounce_unknown_space_falls_back() {
        let reg = test_registry();
        let uri: Uri = "/auth/callback?code=abc&state=ghost%7Cxyz".parse().unwrap();

        let loc = location(&oauth_bounce_response(&uri, &reg));
        assert!(loc.starts_with("http://localhost:50000/auth/callback?"));
        // State is passed through unchanged for the true initiator
        assert!(loc.contains("state=ghost%7Cxyz"));
    }

    #[test]
    fn test_oauth_bounce_map_wins_and_consumes() {
        let reg = test_registry();
        reg.oauth_state_put("nonce123", "manama");
        let uri: Uri = "/auth/callback?code=abc&state=nonce123".parse().unwrap();

        let loc = location(&oauth_bounce_response(&uri, &reg));
        assert!(loc.starts_with("http://manama.localhost:50000/auth/callback?"));
        assert!(loc.contains("state=nonce123"));

        // Replay of the same state no longer routes to the initiator
        let loc = location(&oauth_bounce_response(&uri, &reg));
        assert!(loc.starts_with("http://localhost:50000/auth/callback?"));
    }

    #[test]
    fn test_oauth_bounce_no_pipe_no_map() {
        let reg = test_registry();
        let uri: Uri = "/auth/callback?code=abc&state=plain".parse().unwrap();

        let loc = location(&oauth_bounce_response(&uri, &reg));
        assert_eq!(loc, "http://localhost:50000/auth/callback?code=abc&state=plain");
    }
}
