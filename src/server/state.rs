use crate::config::BridgeConfig;
use crate::consolidate::{consolidate, ConsolidatedView};
use crate::metrics::Metrics;
use crate::proxy::context::BoxBody;
use crate::upstream::{build_meta_client, UpstreamRegistry};
use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::Utc;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Shared bridge state, cheaply cloneable.
///
/// `view` is replaced wholesale by the lifecycle loop and read lock-free by
/// every request handler; `registry` has a single writer (the lifecycle
/// loop) and many snapshot readers. Consolidations are serialized through
/// `view_mu` so concurrent rebuilds cannot interleave their read-modify-write
/// of the epoch.
#[derive(Clone)]
pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    pub registry: UpstreamRegistry,
    pub view: Arc<ArcSwap<ConsolidatedView>>,
    /// Proxied traffic rides a pooled hyper client; probes, health checks,
    /// and inline expansion use the reqwest meta client.
    pub proxy_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
    pub meta_client: reqwest::Client,
    pub metrics: Metrics,
    view_mu: Arc<Mutex<()>>,
}

impl BridgeState {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        let registry = UpstreamRegistry::new(&config.servers);
        let seed = ConsolidatedView::seed(Utc::now());
        let metrics = Metrics::install();

        Ok(Self {
            config: Arc::new(config),
            registry,
            view: Arc::new(ArcSwap::new(Arc::new(seed))),
            proxy_client: build_proxy_client(),
            meta_client: build_meta_client(),
            metrics,
            view_mu: Arc::new(Mutex::new(())),
        })
    }

    /// Rebuild the consolidated view from the current registry snapshot and
    /// publish it atomically. Returns whether the topology changed.
    pub async fn refresh_view(&self) -> bool {
        let _guard = self.view_mu.lock().await;
        let snapshot = self.registry.snapshot().await;
        let prev = self.view.load_full();
        let (next, changed) = consolidate(&snapshot, &prev);

        if changed {
            info!(
                "consolidate: topology changed, epoch={}, group_types={}",
                next.epoch,
                next.routing.len()
            );
        }
        metrics::gauge!("bridge_group_types").set(next.routing.len() as f64);
        metrics::gauge!("bridge_consolidation_epoch").set(next.epoch as f64);

        self.view.store(Arc::new(next));
        changed
    }
}

/// Build a hyper `Client` for proxied traffic that supports both HTTP and
/// HTTPS upstreams (rustls, webpki roots; HTTP/2 via ALPN).
fn build_proxy_client() -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(Duration::from_secs(60)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(60))
        .build(https)
}
