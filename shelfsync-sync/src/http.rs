//! HTTP remote source.
//!
//! Requests go to the subscription URL's origin and path:
//!
//! | Request                                              | Yields                     |
//! |------------------------------------------------------|----------------------------|
//! | `GET {path}/items?limit=1&format=versions`           | `Last-Modified-Version`    |
//! | `GET {path}/items?since=V&format=json&start&limit`   | live items, paginated      |
//! | `GET {path}/deleted?since=V`                         | `{"items": [keys]}`        |
//!
//! The subscription's query parameters are forwarded on every request and its
//! key is sent as a bearer token. 403, 404 and 410 mean the library is gone.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use shelfsync_core::Subscription;

use crate::error::SyncError;
use crate::source::{ChangeSet, RemoteEntry, RemoteSource};

pub const VERSION_HEADER: &str = "Last-Modified-Version";
const PAGE_SIZE: usize = 100;

/// [`RemoteSource`] over blocking `ureq`, run on the blocking pool.
#[derive(Clone)]
pub struct HttpSource {
    agent: ureq::Agent,
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn version(&self, subscription: &Subscription) -> Result<u64, SyncError> {
        let request = Request::new(&self.agent, subscription)?;
        run_blocking(move || {
            let response = request.get(
                "/items",
                &[("limit", "1".to_string()), ("format", "versions".to_string())],
            )?;
            header_version(&response)
        })
        .await
    }

    async fn changes(
        &self,
        subscription: &Subscription,
        since: u64,
    ) -> Result<ChangeSet, SyncError> {
        let request = Request::new(&self.agent, subscription)?;
        run_blocking(move || request.changes(since)).await
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T, SyncError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Join(e.to_string()))?
}

/// Everything needed to talk to one subscription's library.
struct Request {
    agent: ureq::Agent,
    base: String,
    params: Vec<(String, String)>,
    key: Option<String>,
    id: shelfsync_core::SubscriptionId,
}

#[derive(Debug, Deserialize)]
struct Deleted {
    #[serde(default)]
    items: Vec<String>,
}

impl Request {
    fn new(agent: &ureq::Agent, subscription: &Subscription) -> Result<Self, SyncError> {
        Ok(Self {
            agent: agent.clone(),
            base: format!("{}{}", subscription.origin()?, subscription.pathname),
            params: subscription
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            key: subscription.key.clone(),
            id: subscription.id.clone(),
        })
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<ureq::Response, SyncError> {
        let url = format!("{}{path}", self.base);
        let mut req = self.agent.get(&url);
        for (k, v) in &self.params {
            req = req.query(k, v);
        }
        for (k, v) in query {
            req = req.query(k, v);
        }
        if let Some(key) = &self.key {
            req = req.set("Authorization", &format!("Bearer {key}"));
        }

        tracing::trace!(url = %url, "GET");
        match req.call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(403 | 404 | 410, _)) => Err(SyncError::Removed {
                id: self.id.clone(),
            }),
            Err(ureq::Error::Status(status, response)) => Err(SyncError::Remote {
                status,
                message: response.status_text().to_string(),
            }),
            Err(ureq::Error::Transport(t)) => Err(SyncError::Http(t.to_string())),
        }
    }

    fn changes(&self, since: u64) -> Result<ChangeSet, SyncError> {
        let mut entries = Vec::new();
        let mut version = None;
        let mut start = 0usize;

        loop {
            let response = self.get(
                "/items",
                &[
                    ("since", since.to_string()),
                    ("format", "json".to_string()),
                    ("start", start.to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                ],
            )?;
            version.get_or_insert(header_version(&response)?);
            let page: Vec<Value> = response
                .into_json()
                .map_err(|e| SyncError::Protocol(format!("items page: {e}")))?;
            let count = page.len();
            for item in page {
                entries.push(live_entry(item)?);
            }
            if count < PAGE_SIZE {
                break;
            }
            start += count;
        }

        let response = self.get("/deleted", &[("since", since.to_string())])?;
        let deleted: Deleted = response
            .into_json()
            .map_err(|e| SyncError::Protocol(format!("deleted list: {e}")))?;
        entries.extend(deleted.items.into_iter().map(RemoteEntry::deleted));

        Ok(ChangeSet {
            version: version.unwrap_or(since),
            entries,
        })
    }
}

fn header_version(response: &ureq::Response) -> Result<u64, SyncError> {
    let raw = response
        .header(VERSION_HEADER)
        .ok_or_else(|| SyncError::Protocol(format!("missing {VERSION_HEADER} header")))?;
    raw.trim()
        .parse()
        .map_err(|_| SyncError::Protocol(format!("bad {VERSION_HEADER} header '{raw}'")))
}

/// `{"key": .., "data": {..}}` or a bare object with a `key` field.
fn live_entry(mut item: Value) -> Result<RemoteEntry, SyncError> {
    let key = item
        .get("key")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SyncError::Protocol("item without a key".to_string()))?;
    let data = match item.get_mut("data") {
        Some(data) => data.take(),
        None => item,
    };
    Ok(RemoteEntry::live(key, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn live_entry_prefers_data_field() {
        let entry = live_entry(json!({"key": "AB12", "version": 4, "data": {"title": "T"}})).unwrap();
        assert_eq!(entry, RemoteEntry::live("AB12", json!({"title": "T"})));
    }

    #[test]
    fn live_entry_falls_back_to_whole_object() {
        let entry = live_entry(json!({"key": "AB12", "title": "T"})).unwrap();
        assert_eq!(entry, RemoteEntry::live("AB12", json!({"key": "AB12", "title": "T"})));
    }

    #[test]
    fn live_entry_requires_key() {
        assert!(matches!(
            live_entry(json!({"title": "T"})),
            Err(SyncError::Protocol(_))
        ));
    }
}
