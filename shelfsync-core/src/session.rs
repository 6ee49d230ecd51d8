//! The per-attempt sync session handed to every plugin.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::types::Subscription;

/// One evaluation of a subscription's remote state.
///
/// Created at the start of a sync attempt and dropped once plugin dispatch
/// finishes; never persisted. `created`, `updated` and `deleted` are pairwise
/// disjoint and keep the order in which the remote source delivered them.
/// `items` only holds payloads for created and updated keys.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSession {
    pub subscription: Subscription,
    /// Remote version observed during this attempt.
    pub version: u64,
    pub modified: bool,
    pub items: BTreeMap<String, Value>,
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
}

impl SyncSession {
    pub fn new(subscription: Subscription) -> Self {
        let version = subscription.version;
        Self {
            subscription,
            version,
            modified: false,
            items: BTreeMap::new(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    /// True when the attempt produced no created, updated or deleted keys.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Payloads of created and updated items, created first, in delivery order.
    pub fn changed_items(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.created
            .iter()
            .chain(self.updated.iter())
            .filter_map(|key| self.items.get(key).map(|v| (key.as_str(), v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubscriptionInput;
    use serde_json::json;

    #[test]
    fn new_session_starts_at_subscription_version() {
        let mut sub = Subscription::from_input(SubscriptionInput {
            url: "https://x.org/users/1".to_string(),
            ..Default::default()
        })
        .expect("sub");
        sub.version = 5;
        let session = SyncSession::new(sub);
        assert_eq!(session.version, 5);
        assert!(!session.modified);
        assert!(session.is_empty());
    }

    #[test]
    fn changed_items_lists_created_then_updated() {
        let sub = Subscription::from_input(SubscriptionInput {
            url: "https://x.org/users/1".to_string(),
            ..Default::default()
        })
        .expect("sub");
        let mut session = SyncSession::new(sub);
        session.created = vec!["b".into()];
        session.updated = vec!["a".into()];
        session.items.insert("a".into(), json!({"n": 1}));
        session.items.insert("b".into(), json!({"n": 2}));

        let keys: Vec<&str> = session.changed_items().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }
}
