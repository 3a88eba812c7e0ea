use crate::config::UpstreamConfig;
use crate::proxy::context::{full_body, BoxBody, RequestContext};
use crate::server::BridgeState;
use futures_util::stream::{self, StreamExt};
use http::StatusCode;
use hyper::Response;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::{debug, error};

/// The xRegistry spec version the bridge serves.
pub const SPEC_VERSION: &str = "1.0-rc1";

/// Values a client may request via `?specversion=`; anything else is a 400.
const ACCEPTED_SPECVERSIONS: &[&str] = &["0.5", "1.0-rc1"];

/// How many live health checks run concurrently.
const FETCH_CONCURRENCY: usize = 8;

fn json_response(status: StatusCode, body: &Value) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// `GET /`: the synthesized root document with registry identity, epoch, and a
/// `{plural}url` / `{plural}count` pair per routable group type. Supports
/// `?specversion=` validation and `?inline=` expansion.
pub async fn handle_root(
    state: &BridgeState,
    ctx: &RequestContext,
    base_url: &str,
    query: Option<&str>,
) -> Response<BoxBody> {
    let params = parse_query(query);

    if let Some(requested) = params.get("specversion") {
        if !ACCEPTED_SPECVERSIONS.contains(&requested.as_str()) {
            return ctx.error_response(
                StatusCode::BAD_REQUEST,
                json!({"error": "unsupported specversion", "specversion": requested}),
            );
        }
    }

    let view = state.view.load_full();
    let mut doc = Map::new();
    doc.insert("specversion".into(), json!(SPEC_VERSION));
    doc.insert("registryid".into(), json!("xregistry-bridge"));
    doc.insert("self".into(), json!(format!("{}/", base_url)));
    doc.insert("xid".into(), json!("/"));
    doc.insert("epoch".into(), json!(view.epoch));
    doc.insert("name".into(), json!("xRegistry federation bridge"));
    doc.insert(
        "description".into(),
        json!("Read-only federation of multiple xRegistry services"),
    );
    doc.insert("createdat".into(), json!(view.started_at.to_rfc3339()));
    doc.insert("modifiedat".into(), json!(chrono::Utc::now().to_rfc3339()));

    for group_type in view.routing.keys() {
        let plural = view.plural(group_type);
        doc.insert(
            format!("{}url", plural),
            json!(format!("{}/{}", base_url, group_type)),
        );
        let count_key = format!("{}count", plural);
        let count = match view.model.get(&count_key) {
            Some(value) => value.clone(),
            // Certain well-known group types are assumed to hold one
            // registry when the upstream does not publish a count.
            None if state.config.well_known_groups.contains(group_type) => json!(1),
            None => json!(0),
        };
        doc.insert(count_key, count);
    }

    if let Some(inline) = params.get("inline") {
        for token in inline.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "model" => {
                    doc.insert("model".into(), view.model.clone());
                }
                "capabilities" => {
                    doc.insert("capabilities".into(), view.capabilities.clone());
                }
                plural => {
                    let owner = view
                        .routing
                        .iter()
                        .find(|(gt, _)| view.plural(gt) == plural || gt.as_str() == plural);
                    let value = match owner {
                        Some((group_type, upstream)) => {
                            fetch_inline(state, upstream, group_type, ctx).await
                        }
                        None => {
                            debug!("inline: unknown collection requested, token={}", plural);
                            json!({})
                        }
                    };
                    doc.insert(plural.to_string(), value);
                }
            }
        }
    }

    json_response(StatusCode::OK, &Value::Object(doc))
}

/// Live fetch of a group collection for `?inline=`. Any failure embeds an
/// empty object; the root response itself stays 200.
async fn fetch_inline(
    state: &BridgeState,
    upstream: &UpstreamConfig,
    group_type: &str,
    ctx: &RequestContext,
) -> Value {
    let url = format!("{}/{}", upstream.url, group_type);
    let mut req = state
        .meta_client
        .get(&url)
        .timeout(state.config.probe_timeout())
        .header("x-correlation-id", &ctx.correlation_id)
        .header("traceparent", &ctx.traceparent);
    if let Some(key) = &upstream.api_key {
        req = req.bearer_auth(key);
    }

    let result = match req.send().await {
        Ok(resp) if resp.status().is_success() => resp.json::<Value>().await.map_err(|e| e.to_string()),
        Ok(resp) => Err(format!("GET {} returned {}", url, resp.status().as_u16())),
        Err(e) => Err(e.to_string()),
    };

    match result {
        Ok(value) => value,
        Err(e) => {
            error!(
                "inline: fetch failed, group_type={}, upstream={}, error={}",
                group_type, upstream.url, e
            );
            json!({})
        }
    }
}

/// `GET /model`: the consolidated model.
pub fn handle_model(state: &BridgeState) -> Response<BoxBody> {
    let view = state.view.load_full();
    json_response(StatusCode::OK, &view.model)
}

/// `GET /capabilities`: the consolidated capabilities.
pub fn handle_capabilities(state: &BridgeState) -> Response<BoxBody> {
    let view = state.view.load_full();
    json_response(StatusCode::OK, &view.capabilities)
}

/// `GET /registries`: the federated upstreams and the group types each one
/// currently owns.
pub async fn handle_registries(state: &BridgeState) -> Response<BoxBody> {
    let view = state.view.load_full();
    let snapshot = state.registry.snapshot().await;

    let registries: Vec<Value> = snapshot
        .iter()
        .map(|s| {
            json!({
                "url": s.config.url,
                "active": s.active,
                "groupTypes": owned_group_types(&view.routing, &s.config.url),
            })
        })
        .collect();

    json_response(StatusCode::OK, &json!({"registries": registries}))
}

/// `GET /health`: live-probes every upstream root. 200 iff at least one
/// upstream is currently active, 503 otherwise.
pub async fn handle_health(state: &BridgeState) -> Response<BoxBody> {
    let view = state.view.load_full();
    let snapshot = state.registry.snapshot().await;
    let timeout = state.config.probe_timeout();

    let configs: Vec<UpstreamConfig> = snapshot.iter().map(|s| s.config.clone()).collect();
    let checks: Vec<bool> = stream::iter(configs)
        .map(|config| {
            let client = state.meta_client.clone();
            async move { live_check(&client, &config, timeout).await }
        })
        .buffered(FETCH_CONCURRENCY)
        .collect()
        .await;

    let upstreams: Vec<Value> = snapshot
        .iter()
        .zip(checks)
        .map(|(s, healthy)| {
            json!({
                "url": s.config.url,
                "healthy": healthy,
                "active": s.active,
                "lastAttempt": s.last_attempt.map(|t| t.to_rfc3339()),
                "consecutiveFailures": s.consecutive_failures,
                "lastError": s.last_error,
                "groupTypes": owned_group_types(&view.routing, &s.config.url),
            })
        })
        .collect();

    let any_active = snapshot.iter().any(|s| s.active);
    let status = if any_active {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(
        status,
        &json!({
            "status": if any_active { "ok" } else { "unavailable" },
            "upstreams": upstreams,
        }),
    )
}

async fn live_check(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
    timeout: std::time::Duration,
) -> bool {
    let mut req = client.get(&upstream.url).timeout(timeout);
    if let Some(key) = &upstream.api_key {
        req = req.bearer_auth(key);
    }
    match req.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// `GET /status`: the full current topology.
pub async fn handle_status(state: &BridgeState) -> Response<BoxBody> {
    let view = state.view.load_full();
    let snapshot = state.registry.snapshot().await;

    let routing: HashMap<&str, &str> = view
        .routing
        .iter()
        .map(|(gt, upstream)| (gt.as_str(), upstream.url.as_str()))
        .collect();

    let upstreams: Vec<Value> = snapshot
        .iter()
        .map(|s| {
            json!({
                "url": s.config.url,
                "active": s.active,
                "lastAttempt": s.last_attempt.map(|t| t.to_rfc3339()),
                "consecutiveFailures": s.consecutive_failures,
                "lastError": s.last_error,
            })
        })
        .collect();

    json_response(
        StatusCode::OK,
        &json!({
            "epoch": view.epoch,
            "startedAt": view.started_at.to_rfc3339(),
            "model": view.model,
            "capabilities": view.capabilities,
            "routing": routing,
            "upstreams": upstreams,
        }),
    )
}

/// `GET /metrics`: Prometheus text exposition.
pub fn handle_metrics(state: &BridgeState) -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(full_body(state.metrics.render()))
        .unwrap()
}

fn owned_group_types<'a>(
    routing: &'a std::collections::BTreeMap<String, UpstreamConfig>,
    url: &str,
) -> Vec<&'a str> {
    routing
        .iter()
        .filter(|(_, upstream)| upstream.url == url)
        .map(|(gt, _)| gt.as_str())
        .collect()
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        if key.is_empty() {
            continue;
        }
        params.insert(key.to_string(), parts.next().unwrap_or("").to_string());
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::upstream::Probed;
    use http::HeaderMap;

    fn test_ctx() -> RequestContext {
        RequestContext::new(
            &HeaderMap::new(),
            "GET".into(),
            "/".into(),
            "127.0.0.1".parse().unwrap(),
        )
    }

    fn test_state() -> BridgeState {
        let config = BridgeConfig {
            servers: vec![UpstreamConfig {
                url: "http://u1:9000".into(),
                api_key: None,
            }],
            ..BridgeConfig::default()
        };
        BridgeState::new(config).unwrap()
    }

    async fn body_json(resp: Response<BoxBody>) -> Value {
        use http_body_util::BodyExt;
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn root_document_lists_groups_with_counts() {
        let state = test_state();
        state
            .registry
            .record_success(
                0,
                Probed {
                    model: json!({
                        "groups": {"npmregs": {"plural": "npmregs"}},
                        "npmregscount": 42
                    }),
                    capabilities: json!({"pagination": true}),
                },
            )
            .await;
        state.refresh_view().await;

        let ctx = test_ctx();
        let resp = handle_root(&state, &ctx, "http://bridge", None).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let doc = body_json(resp).await;
        assert_eq!(doc["specversion"], json!(SPEC_VERSION));
        assert_eq!(doc["xid"], json!("/"));
        assert_eq!(doc["epoch"], json!(1));
        assert_eq!(doc["npmregsurl"], json!("http://bridge/npmregs"));
        assert_eq!(doc["npmregscount"], json!(42));
    }

    #[tokio::test]
    async fn root_count_defaults_for_well_known_groups() {
        let state = test_state();
        state
            .registry
            .record_success(
                0,
                Probed {
                    model: json!({"groups": {
                        "noderegistries": {},
                        "custom": {}
                    }}),
                    capabilities: json!({}),
                },
            )
            .await;
        state.refresh_view().await;

        let ctx = test_ctx();
        let doc = body_json(handle_root(&state, &ctx, "http://bridge", None).await).await;
        assert_eq!(doc["noderegistriescount"], json!(1));
        assert_eq!(doc["customcount"], json!(0));
    }

    #[tokio::test]
    async fn unsupported_specversion_is_rejected() {
        let state = test_state();
        let ctx = test_ctx();
        let resp = handle_root(&state, &ctx, "http://bridge", Some("specversion=9.9")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn inline_model_embeds_consolidated_model() {
        let state = test_state();
        state
            .registry
            .record_success(
                0,
                Probed {
                    model: json!({"groups": {"npmregs": {}}}),
                    capabilities: json!({}),
                },
            )
            .await;
        state.refresh_view().await;

        let ctx = test_ctx();
        let doc = body_json(
            handle_root(&state, &ctx, "http://bridge", Some("inline=model,capabilities")).await,
        )
        .await;
        assert!(doc["model"]["groups"]["npmregs"].is_object());
        assert!(doc["capabilities"].is_object());
    }

    #[tokio::test]
    async fn health_is_503_with_no_active_upstreams() {
        let state = test_state();
        let resp = handle_health(&state).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn query_parsing() {
        let params = parse_query(Some("specversion=0.5&inline=model,npmregs"));
        assert_eq!(params["specversion"], "0.5");
        assert_eq!(params["inline"], "model,npmregs");
        assert!(parse_query(None).is_empty());
    }
}
