use crate::config::UpstreamConfig;
use crate::upstream::UpstreamState;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{error, warn};

/// Paths served by the bridge itself. A group type carrying one of these
/// names can never be routed (the bridge's own endpoints always win), so
/// the consolidator refuses to admit it.
pub const RESERVED_PATHS: &[&str] = &[
    "model",
    "capabilities",
    "registries",
    "health",
    "status",
    "metrics",
];

/// Immutable merged view over all currently active upstreams. Replaced
/// wholesale on each rebuild and published via an atomic pointer swap, so
/// request handlers always observe a complete view.
#[derive(Debug, Clone)]
pub struct ConsolidatedView {
    /// Merged model: top-level keys shallow-merged across active upstreams,
    /// the `groups` submap deep-merged (union of group types).
    pub model: Value,

    /// Shallow union of every active upstream's capabilities.
    pub capabilities: Value,

    /// `group type → owning upstream`. Every key also appears in
    /// `model.groups`.
    pub routing: BTreeMap<String, UpstreamConfig>,

    /// Bumped by one whenever the set of routable group types changes.
    pub epoch: u64,

    /// Fixed at process start.
    pub started_at: DateTime<Utc>,
}

impl ConsolidatedView {
    /// The view published before the first consolidation: no groups, no
    /// capabilities, epoch zero. Handlers never see an absent view.
    pub fn seed(started_at: DateTime<Utc>) -> Self {
        Self {
            model: Value::Object(Map::from_iter([(
                "groups".to_string(),
                Value::Object(Map::new()),
            )])),
            capabilities: Value::Object(Map::new()),
            routing: BTreeMap::new(),
            epoch: 0,
            started_at,
        }
    }

    pub fn group_types(&self) -> impl Iterator<Item = &str> {
        self.routing.keys().map(|k| k.as_str())
    }

    /// The `plural` attribute of a group type from the merged model,
    /// defaulting to the group type itself.
    pub fn plural(&self, group_type: &str) -> String {
        self.model
            .get("groups")
            .and_then(|g| g.get(group_type))
            .and_then(|g| g.get("plural"))
            .and_then(|p| p.as_str())
            .unwrap_or(group_type)
            .to_string()
    }
}

/// Rebuild the consolidated view from a registry snapshot, in config order.
///
/// Returns the new view and whether the topology changed (the set of
/// routable group types differs from `prev`). The epoch bumps only on a
/// topology change, so rebuilding over an unchanged active set is
/// idempotent. Collisions are last-writer-wins with a warning naming both
/// upstreams.
pub fn consolidate(
    states: &[UpstreamState],
    prev: &ConsolidatedView,
) -> (ConsolidatedView, bool) {
    let mut model = Map::new();
    let mut groups = Map::new();
    let mut capabilities = Map::new();
    let mut routing: BTreeMap<String, UpstreamConfig> = BTreeMap::new();

    for state in states.iter().filter(|s| s.active) {
        let Some(state_model) = state.model.as_ref().and_then(|m| m.as_object()) else {
            // `active` implies a model is present; an active state without
            // one would be a lifecycle bug, not a consolidation concern.
            error!(
                "consolidate: active upstream has no model, upstream={}",
                state.config.url
            );
            continue;
        };

        for (key, value) in state_model {
            if key == "groups" {
                let Some(state_groups) = value.as_object() else {
                    continue;
                };
                for (group_type, group_def) in state_groups {
                    if RESERVED_PATHS.contains(&group_type.as_str()) {
                        error!(
                            "consolidate: group type collides with a bridge endpoint and is not routable, group_type={}, upstream={}",
                            group_type, state.config.url
                        );
                        continue;
                    }
                    if let Some(previous_owner) = routing.get(group_type) {
                        if previous_owner != &state.config {
                            warn!(
                                "consolidate: group type collision, group_type={}, kept={}, displaced={}",
                                group_type, state.config.url, previous_owner.url
                            );
                        }
                    }
                    groups.insert(group_type.clone(), group_def.clone());
                    routing.insert(group_type.clone(), state.config.clone());
                }
            } else {
                model.insert(key.clone(), value.clone());
            }
        }

        if let Some(state_caps) = state.capabilities.as_ref().and_then(|c| c.as_object()) {
            for (key, value) in state_caps {
                capabilities.insert(key.clone(), value.clone());
            }
        }
    }

    model.insert("groups".to_string(), Value::Object(groups));

    let topology_changed = !prev.routing.keys().eq(routing.keys());
    let epoch = if topology_changed {
        prev.epoch + 1
    } else {
        prev.epoch
    };

    let view = ConsolidatedView {
        model: Value::Object(model),
        capabilities: Value::Object(capabilities),
        routing,
        epoch,
        started_at: prev.started_at,
    };
    (view, topology_changed)
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

    fn active_state(url: &str, model: Value, capabilities: Value) -> UpstreamState {
        UpstreamState {
            config: upstream(url),
            active: true,
            last_attempt: Some(Utc::now()),
            consecutive_failures: 0,
            model: Some(model),
            capabilities: Some(capabilities),
            last_error: None,
        }
    }

    fn inactive_state(url: &str) -> UpstreamState {
        UpstreamState {
            config: upstream(url),
            active: false,
            last_attempt: Some(Utc::now()),
            consecutive_failures: 1,
            model: None,
            capabilities: None,
            last_error: Some("connection refused".into()),
        }
    }

    #[test]
    fn single_upstream_builds_routing_and_bumps_epoch() {
        let seed = ConsolidatedView::seed(Utc::now());
        let states = [active_state(
            "http://u1:9000",
            json!({"groups": {"npmregs": {"plural": "npmregs"}}, "npmregscount": 42}),
            json!({"pagination": true}),
        )];

        let (view, changed) = consolidate(&states, &seed);
        assert!(changed);
        assert_eq!(view.epoch, 1);
        assert_eq!(view.routing.len(), 1);
        assert_eq!(view.routing["npmregs"].url, "http://u1:9000");
        assert_eq!(view.model["npmregscount"], json!(42));
        assert_eq!(view.model["groups"]["npmregs"]["plural"], json!("npmregs"));
        assert_eq!(view.capabilities["pagination"], json!(true));
    }

    #[test]
    fn rebuild_over_same_states_is_idempotent() {
        let seed = ConsolidatedView::seed(Utc::now());
        let states = [active_state(
            "http://u1:9000",
            json!({"groups": {"npmregs": {}}}),
            json!({}),
        )];

        let (first, _) = consolidate(&states, &seed);
        let (second, changed) = consolidate(&states, &first);
        assert!(!changed);
        assert_eq!(second.epoch, first.epoch);
        assert_eq!(second.routing, first.routing);
    }

    #[test]
    fn collision_last_in_config_order_wins() {
        let seed = ConsolidatedView::seed(Utc::now());
        let states = [
            active_state("http://a:9000", json!({"groups": {"foo": {}}}), json!({})),
            active_state("http://b:9000", json!({"groups": {"foo": {}}}), json!({})),
        ];

        let (view, changed) = consolidate(&states, &seed);
        assert!(changed);
        assert_eq!(view.epoch, 1);
        assert_eq!(view.routing["foo"].url, "http://b:9000");
    }

    #[test]
    fn topology_change_when_upstream_joins() {
        let seed = ConsolidatedView::seed(Utc::now());
        let a = active_state("http://a:9000", json!({"groups": {"foo": {}}}), json!({}));
        let b = active_state("http://b:9000", json!({"groups": {"bar": {}}}), json!({}));

        let (first, _) = consolidate(&[a.clone(), inactive_state("http://b:9000")], &seed);
        assert_eq!(first.epoch, 1);
        assert!(!first.routing.contains_key("bar"));

        let (second, changed) = consolidate(&[a, b], &first);
        assert!(changed);
        assert_eq!(second.epoch, 2);
        assert_eq!(second.routing["foo"].url, "http://a:9000");
        assert_eq!(second.routing["bar"].url, "http://b:9000");
    }

    #[test]
    fn topology_change_when_upstream_leaves() {
        let seed = ConsolidatedView::seed(Utc::now());
        let a = active_state("http://a:9000", json!({"groups": {"foo": {}}}), json!({}));
        let (first, _) = consolidate(&[a], &seed);

        let (second, changed) = consolidate(&[inactive_state("http://a:9000")], &first);
        assert!(changed);
        assert_eq!(second.epoch, 2);
        assert!(second.routing.is_empty());
        assert_eq!(second.model["groups"], json!({}));
    }

    #[test]
    fn inactive_upstreams_do_not_contribute() {
        let seed = ConsolidatedView::seed(Utc::now());
        let (view, changed) = consolidate(&[inactive_state("http://a:9000")], &seed);
        assert!(!changed);
        assert_eq!(view.epoch, 0);
        assert!(view.routing.is_empty());
    }

    #[test]
    fn reserved_group_types_are_rejected() {
        let seed = ConsolidatedView::seed(Utc::now());
        let states = [active_state(
            "http://a:9000",
            json!({"groups": {"health": {}, "foo": {}}}),
            json!({}),
        )];

        let (view, _) = consolidate(&states, &seed);
        assert!(view.routing.contains_key("foo"));
        assert!(!view.routing.contains_key("health"));
        assert!(view.model["groups"].get("health").is_none());
    }

    #[test]
    fn every_routing_key_appears_in_model_groups() {
        let seed = ConsolidatedView::seed(Utc::now());
        let states = [
            active_state(
                "http://a:9000",
                json!({"groups": {"foo": {"plural": "foos"}}}),
                json!({}),
            ),
            active_state("http://b:9000", json!({"groups": {"bar": {}}}), json!({})),
        ];

        let (view, _) = consolidate(&states, &seed);
        let groups = view.model["groups"].as_object().unwrap();
        for group_type in view.routing.keys() {
            assert!(groups.contains_key(group_type));
        }
        assert_eq!(view.plural("foo"), "foos");
        assert_eq!(view.plural("bar"), "bar");
    }
}
