use crate::server::BridgeState;
use futures_util::stream::{self, StreamExt};
use futures_util::FutureExt;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Probes within one round run concurrently so a slow upstream never stalls
/// the others.
const PROBE_CONCURRENCY: usize = 8;

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` if the full duration elapsed normally.
pub async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// Initial probe round: every configured upstream, concurrently. Returns
/// whether any state transitioned.
pub async fn probe_all(state: &BridgeState) -> bool {
    let count = state.registry.len();
    probe_indices(state, (0..count).collect()).await
}

/// One retry tick: probe only the currently inactive upstreams; on any
/// transition rebuild and publish the consolidated view.
pub async fn retry_tick(state: &BridgeState) {
    let snapshot = state.registry.snapshot().await;
    let inactive: Vec<usize> = snapshot
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.active)
        .map(|(i, _)| i)
        .collect();
    if inactive.is_empty() {
        return;
    }

    debug!("lifecycle: retrying {} inactive upstreams", inactive.len());
    if probe_indices(state, inactive).await {
        state.refresh_view().await;
    }
}

/// Spawn the retry ticker. A failure inside one tick, even a panic, is
/// logged and the ticker continues; only shutdown stops it.
pub fn start_retry_loop(state: &BridgeState, shutdown: &Arc<Notify>) {
    let state = state.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let interval = state.config.retry_interval();
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            if std::panic::AssertUnwindSafe(retry_tick(&state))
                .catch_unwind()
                .await
                .is_err()
            {
                error!("lifecycle: retry tick panicked, ticker continues");
            }
        }
    });
}

async fn probe_indices(state: &BridgeState, indices: Vec<usize>) -> bool {
    let snapshot = state.registry.snapshot().await;

    let results = stream::iter(indices)
        .map(|index| {
            let client = state.meta_client.clone();
            let config = snapshot[index].config.clone();
            let timeout = state.config.probe_timeout();
            async move {
                let result = crate::upstream::probe(&client, &config, timeout).await;
                (index, config, result)
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    let mut any_transition = false;
    for (index, config, result) in results {
        match result {
            Ok(probed) => {
                metrics::counter!(
                    "bridge_probe_total",
                    "upstream" => config.url.clone(),
                    "result" => "success",
                )
                .increment(1);
                metrics::gauge!(
                    "bridge_upstream_active",
                    "upstream" => config.url.clone(),
                )
                .set(1.0);

                if state.registry.record_success(index, probed).await {
                    info!("lifecycle: upstream active, upstream={}", config.url);
                    any_transition = true;
                }
            }
            Err(error) => {
                metrics::counter!(
                    "bridge_probe_total",
                    "upstream" => config.url.clone(),
                    "result" => "failure",
                )
                .increment(1);
                metrics::gauge!(
                    "bridge_upstream_active",
                    "upstream" => config.url.clone(),
                )
                .set(0.0);

                warn!(
                    "lifecycle: probe failed, upstream={}, error={}",
                    config.url, error
                );
                if state.registry.record_failure(index, error).await {
                    info!("lifecycle: upstream inactive, upstream={}", config.url);
                    any_transition = true;
                }
            }
        }
    }
    any_transition
}
