//! Usage attributor (C8) — accumulates per-`session_id` usage from stream `result`
//! events and projects it onto `(node_id, node_run_id)` once the session's
//! `node_session_bind` event arrives, in either order (§4.8, S1/S2).

use pipeline_core::types::NormalizedUsage;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRunKey {
    pub node_id: String,
    pub node_run_id: String,
}

#[derive(Default)]
pub struct UsageAttributor {
    session_bindings: HashMap<String, NodeRunKey>,
    by_node_run: HashMap<NodeRunKey, NormalizedUsage>,
    pending_by_session: HashMap<String, NormalizedUsage>,
    seen: std::collections::HashSet<NodeRunKey>,
}

impl UsageAttributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `result` event arrived for session `session_id` carrying `delta` usage.
    pub fn on_result(&mut self, session_id: &str, delta: NormalizedUsage) {
        if let Some(key) = self.session_bindings.get(session_id).cloned() {
            self.by_node_run.entry(key.clone()).or_default().add(&delta);
            self.seen.insert(key);
        } else {
            self.pending_by_session
                .entry(session_id.to_string())
                .or_default()
                .add(&delta);
        }
    }

    /// A `node_session_bind` event arrived binding `session_id` to a node run. The
    /// binding is monotonic: once recorded it never changes, per the lifecycle
    /// invariant in §3.
    pub fn on_session_bind(&mut self, node_id: &str, node_run_id: &str, session_id: &str) {
        let key = NodeRunKey {
            node_id: node_id.to_string(),
            node_run_id: node_run_id.to_string(),
        };
        self.session_bindings
            .entry(session_id.to_string())
            .or_insert_with(|| key.clone());

        if let Some(pending) = self.pending_by_session.remove(session_id) {
            self.by_node_run.entry(key.clone()).or_default().add(&pending);
            self.seen.insert(key);
        }
    }

    /// Normalized usage for a node run, if any session's `result` was ever attributed
    /// to it. Absent means the node run should carry no `normalized` field at all.
    pub fn usage_for(&self, node_id: &str, node_run_id: &str) -> Option<NormalizedUsage> {
        let key = NodeRunKey {
            node_id: node_id.to_string(),
            node_run_id: node_run_id.to_string(),
        };
        if self.seen.contains(&key) {
            self.by_node_run.get(&key).cloned()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64) -> NormalizedUsage {
        NormalizedUsage {
            input_tokens: input,
            ..Default::default()
        }
    }

    #[test]
    fn bind_before_result() {
        let mut a = UsageAttributor::new();
        a.on_session_bind("main", "main-1", "s1");
        a.on_result("s1", usage(10));
        assert_eq!(a.usage_for("main", "main-1").unwrap().input_tokens, 10);
    }

    #[test]
    fn result_before_bind() {
        let mut a = UsageAttributor::new();
        a.on_result("s1", usage(10));
        a.on_session_bind("main", "main-1", "s1");
        assert_eq!(a.usage_for("main", "main-1").unwrap().input_tokens, 10);
    }

    #[test]
    fn multiple_results_sum() {
        let mut a = UsageAttributor::new();
        a.on_session_bind("main", "main-1", "s1");
        a.on_result("s1", usage(10));
        a.on_result("s1", usage(5));
        assert_eq!(a.usage_for("main", "main-1").unwrap().input_tokens, 15);
    }

    #[test]
    fn unbound_session_leaves_no_usage() {
        let mut a = UsageAttributor::new();
        a.on_result("s1", usage(10));
        assert!(a.usage_for("main", "main-1").is_none());
    }

    #[test]
    fn pending_cleared_after_binding() {
        let mut a = UsageAttributor::new();
        a.on_result("s1", usage(10));
        a.on_session_bind("main", "main-1", "s1");
        assert!(!a.pending_by_session.contains_key("s1"));
    }
}
