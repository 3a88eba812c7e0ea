use crate::aggregate;
use crate::config::BridgeConfig;
use crate::proxy::auth;
use crate::proxy::context::{empty_body, full_body, BoxBody, RequestContext};
use crate::proxy::rewrite;
use crate::server::BridgeState;
use bytes::Bytes;
use http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, warn};

/// Handle one inbound request:
///
/// 1. build the per-request context (ids, principal, timing)
/// 2. strip the API path prefix
/// 3. OPTIONS short-circuit, then authorization
/// 4. aggregation endpoints, or group-type lookup + proxy
/// 5. CORS normalization, metrics, access log
///
/// Group routing is a table lookup against the currently published
/// consolidated view; routes are never rebound at runtime.
pub async fn handle_request(
    req: Request<Incoming>,
    state: BridgeState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let raw_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();

    // Trust the left-most X-Forwarded-For entry when present, otherwise
    // fall back to the TCP peer address.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let mut ctx = RequestContext::new(req.headers(), method, raw_path, client_ip);
    ctx.user = auth::extract_principal(req.headers());

    let mut resp = dispatch(req, &state, &mut ctx, &host).await;

    ensure_cors(resp.headers_mut());
    let status = resp.status().as_u16();
    ctx.finalize_metrics(status);
    ctx.access_log(status);
    Ok(resp)
}

async fn dispatch(
    req: Request<Incoming>,
    state: &BridgeState,
    ctx: &mut RequestContext,
    host: &str,
) -> Response<BoxBody> {
    let raw_path = ctx.path.clone();
    let Some(path) = strip_api_prefix(state.config.api_path_prefix.as_deref(), &raw_path) else {
        return ctx.error_response(
            StatusCode::NOT_FOUND,
            json!({"error": "not found", "path": raw_path}),
        );
    };

    if req.method() == Method::OPTIONS {
        return Response::builder()
            .status(StatusCode::OK)
            .body(empty_body())
            .unwrap();
    }

    if !auth::is_exempt_path(path) && !auth::is_localhost(host) {
        if let Err(message) = auth::authorize(&state.config, req.headers(), ctx.user.as_ref()) {
            debug!("auth: rejected, path={}, client_ip={}", path, ctx.client_ip);
            return ctx.unauthorized(message);
        }
    }

    let base_url = effective_base_url(&state.config, req.headers(), host);

    match path {
        "/" => aggregate::handle_root(state, ctx, &base_url, req.uri().query()).await,
        "/model" => aggregate::handle_model(state),
        "/capabilities" => aggregate::handle_capabilities(state),
        "/registries" => aggregate::handle_registries(state).await,
        "/health" => aggregate::handle_health(state).await,
        "/status" => aggregate::handle_status(state).await,
        "/metrics" => aggregate::handle_metrics(state),
        _ => proxy_group_request(req, state, ctx, path, &base_url).await,
    }
}

/// Proxy a `/{groupType}/…` request to the owning upstream.
async fn proxy_group_request(
    req: Request<Incoming>,
    state: &BridgeState,
    ctx: &mut RequestContext,
    path: &str,
    base_url: &str,
) -> Response<BoxBody> {
    let group_type = path.trim_start_matches('/').split('/').next().unwrap_or("");
    let view = state.view.load_full();
    let Some(upstream) = view.routing.get(group_type).cloned() else {
        debug!(
            "proxy: unknown group type, group_type={}, path={}",
            group_type, path
        );
        return ctx.unknown_group_type(group_type);
    };

    ctx.group_type = group_type.to_string();
    ctx.upstream_url = upstream.url.clone();

    // The upstream sees the same path the bridge matched on: the API
    // prefix is already stripped, so it still begins with /{groupType}.
    let upstream_uri = match req.uri().query() {
        Some(query) => format!("{}{}?{}", upstream.url, path, query),
        None => format!("{}{}", upstream.url, path),
    };

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    remove_hop_headers(&mut headers);

    // Host must name the upstream authority, not the bridge.
    match authority_of(&upstream.url).and_then(|a| HeaderValue::from_str(a).ok()) {
        Some(value) => {
            headers.insert(HOST, value);
        }
        None => {
            headers.remove(HOST);
        }
    }

    if let Some(key) = &upstream.api_key {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key)) {
            headers.insert(AUTHORIZATION, value);
        }
    }
    insert_header(&mut headers, "x-correlation-id", &ctx.correlation_id);
    insert_header(&mut headers, "x-request-id", &ctx.request_id);
    insert_header(&mut headers, "traceparent", &ctx.traceparent);
    // Hand the upstream our effective base URL so it can author self-links
    // that already point back at the bridge.
    insert_header(&mut headers, &state.config.base_url_header, base_url);

    let mut builder = Request::builder().method(parts.method).uri(&upstream_uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let upstream_req = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!(
                "proxy: failed to build upstream request, group_type={}, error={}",
                group_type, e
            );
            return ctx.error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "internal server error"}),
            );
        }
    };

    // Client disconnects drop this future, which cancels the upstream call.
    ctx.upstream_start = Some(Instant::now());
    let upstream_resp = match state.proxy_client.request(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(
                "proxy: upstream request failed, group_type={}, upstream={}, error={}",
                group_type, upstream.url, e
            );
            return ctx.bad_gateway(&format!("upstream request failed: {}", e));
        }
    };

    let status = upstream_resp.status();
    if status.is_server_error() {
        warn!(
            "proxy: upstream server error, group_type={}, upstream={}, status={}",
            group_type,
            upstream.url,
            status.as_u16()
        );
        return ctx.bad_gateway(&format!("upstream returned {}", status.as_u16()));
    }

    forward_response(upstream_resp, &upstream.url, base_url, ctx).await
}

/// Pass an upstream response downstream. JSON bodies are buffered and
/// rewritten (upstream URLs → bridge base URL, `xid` untouched); everything
/// else streams through unchanged. 4xx statuses pass through as-is.
async fn forward_response(
    upstream_resp: Response<Incoming>,
    upstream_base: &str,
    bridge_base: &str,
    ctx: &RequestContext,
) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();

    let is_json = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.trim_start().starts_with("application/json"))
        .unwrap_or(false);

    if !is_json {
        let mut builder = Response::builder().status(parts.status);
        for (name, value) in &parts.headers {
            builder = builder.header(name, value);
        }
        return builder.body(body.boxed()).unwrap();
    }

    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(
                "proxy: failed reading upstream body, upstream={}, error={}",
                upstream_base, e
            );
            return ctx.bad_gateway("failed reading upstream response body");
        }
    };

    let rewritten = match rewrite::rewrite_body(&bytes, upstream_base, bridge_base) {
        Ok(v) => Bytes::from(v),
        Err(e) => {
            // Degrade to the raw upstream body rather than fail the request.
            warn!(
                "rewrite: unparseable JSON passed through unchanged, upstream={}, error={}",
                upstream_base, e
            );
            bytes
        }
    };

    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(CONTENT_LENGTH, rewritten.len());
    builder.body(full_body(rewritten)).unwrap()
}

/// Effective bridge base URL, in priority order: configured override,
/// forwarded headers, inbound Host.
fn effective_base_url(config: &BridgeConfig, headers: &HeaderMap, host: &str) -> String {
    if let Some(base) = &config.base_url {
        return base.clone();
    }
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .filter(|p| !p.is_empty())
        .unwrap_or("http");
    let authority = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or(if host.is_empty() { "localhost" } else { host });
    format!("{}://{}", proto, authority)
}

/// Strip the configured API prefix. `None` means the request is outside the
/// bridge's path space.
fn strip_api_prefix<'a>(prefix: Option<&str>, path: &'a str) -> Option<&'a str> {
    let Some(prefix) = prefix else {
        return Some(path);
    };
    if path == prefix {
        return Some("/");
    }
    path.strip_prefix(prefix).filter(|rest| rest.starts_with('/'))
}

fn authority_of(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    let authority = rest.split('/').next().unwrap_or(rest);
    (!authority.is_empty()).then_some(authority)
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// Permissive CORS, set only if absent so upstreams that already supply
/// their own headers are respected.
fn ensure_cors(headers: &mut HeaderMap) {
    static ALLOW_ORIGIN: HeaderName = HeaderName::from_static("access-control-allow-origin");
    static ALLOW_METHODS: HeaderName = HeaderName::from_static("access-control-allow-methods");
    static ALLOW_HEADERS: HeaderName = HeaderName::from_static("access-control-allow-headers");

    if !headers.contains_key(&ALLOW_ORIGIN) {
        headers.insert(ALLOW_ORIGIN.clone(), HeaderValue::from_static("*"));
    }
    if !headers.contains_key(&ALLOW_METHODS) {
        headers.insert(
            ALLOW_METHODS.clone(),
            HeaderValue::from_static("GET, POST, PUT, DELETE, PATCH, OPTIONS"),
        );
    }
    if !headers.contains_key(&ALLOW_HEADERS) {
        headers.insert(
            ALLOW_HEADERS.clone(),
            HeaderValue::from_static(
                "authorization, content-type, x-correlation-id, x-request-id, traceparent",
            ),
        );
    }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_prefix_stripping() {
        assert_eq!(strip_api_prefix(None, "/npmregs/x"), Some("/npmregs/x"));
        assert_eq!(
            strip_api_prefix(Some("/registry"), "/registry/npmregs/x"),
            Some("/npmregs/x")
        );
        assert_eq!(strip_api_prefix(Some("/registry"), "/registry"), Some("/"));
        assert_eq!(strip_api_prefix(Some("/registry"), "/other/npmregs"), None);
        // A prefix must match on a segment boundary.
        assert_eq!(strip_api_prefix(Some("/registry"), "/registryx/foo"), None);
    }

    #[test]
    fn base_url_priority() {
        let mut config = BridgeConfig::default();
        let mut headers = HeaderMap::new();

        assert_eq!(
            effective_base_url(&config, &headers, "bridge:8080"),
            "http://bridge:8080"
        );

        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        headers.insert("x-forwarded-host", "public.example.com".parse().unwrap());
        assert_eq!(
            effective_base_url(&config, &headers, "bridge:8080"),
            "https://public.example.com"
        );

        config.base_url = Some("http://override".into());
        assert_eq!(
            effective_base_url(&config, &headers, "bridge:8080"),
            "http://override"
        );
    }

    #[test]
    fn authority_extraction() {
        assert_eq!(authority_of("http://u1:9000"), Some("u1:9000"));
        assert_eq!(authority_of("https://u2.example.com/base"), Some("u2.example.com"));
        assert_eq!(authority_of("not-a-url"), None);
    }

    #[test]
    fn cors_set_only_if_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "access-control-allow-origin",
            "https://app.example.com".parse().unwrap(),
        );
        ensure_cors(&mut headers);
        assert_eq!(
            headers.get("access-control-allow-origin").unwrap(),
            "https://app.example.com"
        );
        assert!(headers.contains_key("access-control-allow-methods"));
        assert!(headers.contains_key("access-control-allow-headers"));
    }
}
