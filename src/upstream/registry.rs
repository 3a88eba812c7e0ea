use crate::config::UpstreamConfig;
use crate::upstream::prober::Probed;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Live state of one configured upstream. Created at startup, destroyed at
/// process exit. Mutated only by the lifecycle loop.
///
/// Invariants: `active` implies both documents are present; after the first
/// probe, `!active` implies `last_error` is set.
#[derive(Debug, Clone)]
pub struct UpstreamState {
    pub config: UpstreamConfig,
    pub active: bool,
    pub last_attempt: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub model: Option<Value>,
    pub capabilities: Option<Value>,
    pub last_error: Option<String>,
}

impl UpstreamState {
    fn new(config: UpstreamConfig) -> Self {
        Self {
            config,
            active: false,
            last_attempt: None,
            consecutive_failures: 0,
            model: None,
            capabilities: None,
            last_error: None,
        }
    }
}

/// Fixed-size, insertion-ordered registry of upstream states, built once
/// from config. Reads are frequent (every request, every health response);
/// writes come only from the lifecycle loop, so each entry sits behind its
/// own `RwLock` and readers take consistent per-state snapshots.
#[derive(Clone)]
pub struct UpstreamRegistry {
    entries: Arc<Vec<RwLock<UpstreamState>>>,
}

impl UpstreamRegistry {
    pub fn new(servers: &[UpstreamConfig]) -> Self {
        let entries = servers
            .iter()
            .map(|cfg| RwLock::new(UpstreamState::new(cfg.clone())))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clone every state in config order. Each entry is internally
    /// consistent; the vector as a whole reflects one pass over the
    /// registry, which is sufficient because only the lifecycle loop writes.
    pub async fn snapshot(&self) -> Vec<UpstreamState> {
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            out.push(entry.read().await.clone());
        }
        out
    }

    /// Record a successful probe: flip to active, store the fetched
    /// documents, clear the failure bookkeeping. Returns `true` when this
    /// was an inactive → active transition.
    pub async fn record_success(&self, index: usize, probed: Probed) -> bool {
        let mut state = self.entries[index].write().await;
        let transitioned = !state.active;
        state.active = true;
        state.last_attempt = Some(Utc::now());
        state.consecutive_failures = 0;
        state.model = Some(probed.model);
        state.capabilities = Some(probed.capabilities);
        state.last_error = None;
        transitioned
    }

    /// Record a failed probe. The last successfully fetched documents are
    /// kept (they describe what the upstream looked like when it was last
    /// seen), but the state leaves the routing table until it probes healthy
    /// again. Returns `true` when this was an active to inactive transition.
    pub async fn record_failure(&self, index: usize, error: String) -> bool {
        let mut state = self.entries[index].write().await;
        let transitioned = state.active;
        state.active = false;
        state.last_attempt = Some(Utc::now());
        state.consecutive_failures += 1;
        state.last_error = Some(error);
        transitioned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upstream(url: &str) -> UpstreamConfig {
        UpstreamConfig {
            url: url.into(),
            api_key: None,
        }
    }

    #[tokio::test]
    async fn snapshot_preserves_config_order() {
        let registry = UpstreamRegistry::new(&[
            upstream("http://u1:9000"),
            upstream("http://u2:9000"),
            upstream("http://u3:9000"),
        ]);
        let snap = registry.snapshot().await;
        let urls: Vec<&str> = snap.iter().map(|s| s.config.url.as_str()).collect();
        assert_eq!(urls, ["http://u1:9000", "http://u2:9000", "http://u3:9000"]);
        assert!(snap.iter().all(|s| !s.active));
        assert!(snap.iter().all(|s| s.last_attempt.is_none()));
    }

    #[tokio::test]
    async fn success_and_failure_transitions() {
        let registry = UpstreamRegistry::new(&[upstream("http://u1:9000")]);

        let probed = Probed {
            model: json!({"groups": {}}),
            capabilities: json!({}),
        };
        assert!(registry.record_success(0, probed.clone()).await);
        // Idempotent re-probe of an already-active upstream is not a transition.
        assert!(!registry.record_success(0, probed).await);

        let snap = registry.snapshot().await;
        assert!(snap[0].active);
        assert!(snap[0].model.is_some() && snap[0].capabilities.is_some());
        assert_eq!(snap[0].consecutive_failures, 0);

        assert!(registry.record_failure(0, "connection refused".into()).await);
        let snap = registry.snapshot().await;
        assert!(!snap[0].active);
        assert_eq!(snap[0].last_error.as_deref(), Some("connection refused"));
        assert_eq!(snap[0].consecutive_failures, 1);
        // Last successfully fetched documents survive the failure.
        assert!(snap[0].model.is_some());
    }
}
