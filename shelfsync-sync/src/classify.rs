//! Change-set classification into created, updated and deleted keys.

use std::collections::{BTreeSet, HashMap};

use shelfsync_core::SyncSession;

use crate::source::RemoteEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Created,
    Updated,
    Deleted,
}

/// Fold `entries` into `session` against the previously `known` keys.
///
/// Order within each list follows delivery order. A key delivered more than
/// once is classified by its last entry, so the three lists stay disjoint and
/// deletion markers never leave a payload in `items`.
pub fn classify(session: &mut SyncSession, entries: Vec<RemoteEntry>, known: &BTreeSet<String>) {
    let mut placed: HashMap<String, Bucket> = HashMap::new();

    for entry in entries {
        let (key, bucket, data) = match entry {
            RemoteEntry::Deleted { key, .. } => (key, Bucket::Deleted, None),
            RemoteEntry::Live { key, data } => {
                let bucket = if known.contains(&key) {
                    Bucket::Updated
                } else {
                    Bucket::Created
                };
                (key, bucket, Some(data))
            }
        };

        match placed.get(&key) {
            Some(previous) if *previous == bucket => {}
            Some(previous) => {
                list_mut(session, *previous).retain(|k| k != &key);
                list_mut(session, bucket).push(key.clone());
            }
            None => list_mut(session, bucket).push(key.clone()),
        }

        match data {
            Some(data) => {
                session.items.insert(key.clone(), data);
            }
            None => {
                session.items.remove(&key);
            }
        }
        placed.insert(key, bucket);
    }
}

fn list_mut(session: &mut SyncSession, bucket: Bucket) -> &mut Vec<String> {
    match bucket {
        Bucket::Created => &mut session.created,
        Bucket::Updated => &mut session.updated,
        Bucket::Deleted => &mut session.deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shelfsync_core::{Subscription, SubscriptionInput};

    fn session() -> SyncSession {
        SyncSession::new(
            Subscription::from_input(SubscriptionInput {
                url: "https://api.example.org/users/1".to_string(),
                ..Default::default()
            })
            .expect("sub"),
        )
    }

    fn known(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn classifies_against_known_keys_in_delivery_order() {
        let mut s = session();
        classify(
            &mut s,
            vec![
                RemoteEntry::deleted("a"),
                RemoteEntry::live("z", json!(1)),
                RemoteEntry::live("b", json!(2)),
                RemoteEntry::live("k", json!(3)),
                RemoteEntry::live("c", json!(4)),
            ],
            &known(&["a", "k", "c"]),
        );
        assert_eq!(s.deleted, vec!["a"]);
        assert_eq!(s.created, vec!["z", "b"]);
        assert_eq!(s.updated, vec!["k", "c"]);
        assert_eq!(s.items.len(), 4);
        assert!(!s.items.contains_key("a"));
    }

    #[test]
    fn repeated_key_takes_last_classification() {
        let mut s = session();
        classify(
            &mut s,
            vec![
                RemoteEntry::live("x", json!("v1")),
                RemoteEntry::deleted("y"),
                RemoteEntry::deleted("x"),
                RemoteEntry::live("y", json!("v2")),
                RemoteEntry::live("y", json!("v3")),
            ],
            &known(&["y"]),
        );
        assert_eq!(s.deleted, vec!["x"]);
        assert!(s.created.is_empty());
        assert_eq!(s.updated, vec!["y"]);
        assert_eq!(s.items.get("y"), Some(&json!("v3")));
        assert!(!s.items.contains_key("x"));
    }

    #[test]
    fn empty_change_set_leaves_session_empty() {
        let mut s = session();
        classify(&mut s, Vec::new(), &known(&["a"]));
        assert!(s.is_empty());
        assert!(s.items.is_empty());
    }
}
