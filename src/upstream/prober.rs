use crate::config::UpstreamConfig;
use crate::proxy::context::{random_correlation_id, synthesize_traceparent};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Result of a successful probe: the upstream's model and capabilities
/// documents, with any `*count` keys from the root document folded into the
/// model so aggregate counts are visible to the consolidator.
#[derive(Debug, Clone)]
pub struct Probed {
    pub model: Value,
    pub capabilities: Value,
}

/// Build the shared HTTP client used for probes, health checks, and inline
/// collection expansion. Per-request timeouts are applied at the call site.
pub fn build_meta_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("failed to build meta client")
}

/// Single-shot health + metadata fetch against one upstream.
///
/// Issues three GETs concurrently (`{url}`, `{url}/model`,
/// `{url}/capabilities`), each with bearer auth when configured and fresh
/// trace headers. All three must return 2xx with parseable JSON; anything
/// else fails the probe with the first error encountered. No partial success
/// is reported.
pub async fn probe(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
    timeout: Duration,
) -> Result<Probed, String> {
    let correlation_id = random_correlation_id();
    let traceparent = synthesize_traceparent();

    let root = fetch_json(client, upstream, "", timeout, &correlation_id, &traceparent);
    let model = fetch_json(
        client,
        upstream,
        "/model",
        timeout,
        &correlation_id,
        &traceparent,
    );
    let capabilities = fetch_json(
        client,
        upstream,
        "/capabilities",
        timeout,
        &correlation_id,
        &traceparent,
    );

    let (root, mut model, capabilities) = tokio::try_join!(root, model, capabilities)?;

    if !model.is_object() {
        return Err(format!("GET {}/model did not return a JSON object", upstream.url));
    }

    // Aggregate counts live at the upstream's root but are published as
    // model attributes so the bridge's root document can serve them.
    if let (Some(model_obj), Some(root_obj)) = (model.as_object_mut(), root.as_object()) {
        for (key, value) in root_obj {
            if key.ends_with("count") {
                model_obj.insert(key.clone(), value.clone());
            }
        }
    }

    debug!("probe: succeeded, upstream={}", upstream.url);
    Ok(Probed {
        model,
        capabilities,
    })
}

async fn fetch_json(
    client: &reqwest::Client,
    upstream: &UpstreamConfig,
    path: &str,
    timeout: Duration,
    correlation_id: &str,
    traceparent: &str,
) -> Result<Value, String> {
    let url = format!("{}{}", upstream.url, path);

    let mut req = client
        .get(&url)
        .timeout(timeout)
        .header("x-correlation-id", correlation_id)
        .header("traceparent", traceparent);
    if let Some(key) = &upstream.api_key {
        req = req.bearer_auth(key);
    }

    let resp = req
        .send()
        .await
        .map_err(|e| format!("GET {} failed: {}", url, e))?;

    let status = resp.status();
    if !status.is_success() {
        // Includes 304: probes never issue conditional requests, so any
        // non-2xx means the upstream is not serving the expected document.
        return Err(format!("GET {} returned {}", url, status.as_u16()));
    }

    resp.json::<Value>()
        .await
        .map_err(|e| format!("GET {} returned unparseable JSON: {}", url, e))
}
