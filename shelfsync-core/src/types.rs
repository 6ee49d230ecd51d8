//! Domain types for shelfsync subscriptions.
//!
//! A [`Subscription`] is built from caller-supplied [`SubscriptionInput`] via
//! [`Subscription::from_input`], which is the single validation gate for
//! malformed URLs and plugin bindings.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque, stable identifier of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SubscriptionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Free-form plugin options keyed by parameter name.
pub type PluginOptions = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Plugin bindings
// ---------------------------------------------------------------------------

/// A named plugin plus its options, attached to one subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginBinding {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: PluginOptions,
}

impl PluginBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: PluginOptions::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Delay strategy between job retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay_ms: u64 },
    /// `delay_ms * 2^(retry - 1)`.
    Exponential { delay_ms: u64 },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential { delay_ms: 1_000 }
    }
}

impl Backoff {
    /// Delay before the `retry`-th retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Backoff::Exponential { delay_ms } => {
                let shift = retry.saturating_sub(1).min(20);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << shift))
            }
        }
    }
}

/// Retry policy attached to each enqueued unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Caller-supplied data for creating a subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SubscriptionId>,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub plugins: Vec<PluginBinding>,
}

/// A registered remote library plus credentials, plugin chain, and
/// last-synced version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub url: String,
    /// Path component of `url`, without a trailing slash.
    pub pathname: String,
    /// Query parameters of `url`, forwarded on every remote request.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Last durably-committed remote version. Never decreases.
    pub version: u64,
    #[serde(default)]
    pub plugins: Vec<PluginBinding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set by the first committed sync attempt. A library whose remote
    /// version is 0 is still synced once this is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

impl Subscription {
    /// Validate `input` and build a fresh subscription at version 0.
    ///
    /// When `input.id` is absent the id is derived from the URL and key, so
    /// subscribing twice to the same library with the same key yields the
    /// same id.
    pub fn from_input(input: SubscriptionInput) -> Result<Self, CoreError> {
        let url = input.url.trim().to_string();
        let (pathname, params) = parse_url(&url)?;

        let key = input.key.filter(|k| !k.trim().is_empty());

        for binding in &input.plugins {
            if binding.name.trim().is_empty() {
                return Err(CoreError::Validation(
                    "plugin binding is missing a name".to_string(),
                ));
            }
        }

        let id = match input.id {
            Some(id) if !id.0.trim().is_empty() => validate_id(id)?,
            _ => derive_id(&url, key.as_deref()),
        };

        let now = Utc::now();
        Ok(Self {
            id,
            url,
            pathname,
            params,
            key,
            version: 0,
            plugins: input.plugins,
            created_at: now,
            updated_at: now,
            synced_at: None,
        })
    }

    /// `scheme://host[:port]` of the subscription URL.
    pub fn origin(&self) -> Result<String, CoreError> {
        let parsed = Url::parse(&self.url)
            .map_err(|e| CoreError::Validation(format!("invalid url '{}': {e}", self.url)))?;
        Ok(parsed.origin().ascii_serialization())
    }

    /// Stream topic for this subscription: the first two path segments
    /// (`/users/123`, `/groups/9`).
    pub fn topic(&self) -> String {
        let segments: Vec<&str> = self
            .pathname
            .split('/')
            .filter(|s| !s.is_empty())
            .take(2)
            .collect();
        format!("/{}", segments.join("/"))
    }

    /// True until the first successful sync has committed a version.
    pub fn never_synced(&self) -> bool {
        self.synced_at.is_none()
    }
}

/// Split a subscription URL into its path and query parameters.
pub fn parse_url(url: &str) -> Result<(String, BTreeMap<String, String>), CoreError> {
    if url.is_empty() {
        return Err(CoreError::Validation("subscription url is required".to_string()));
    }
    let parsed =
        Url::parse(url).map_err(|e| CoreError::Validation(format!("invalid url '{url}': {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(CoreError::Validation(format!(
            "unsupported url scheme '{}' in '{url}'",
            parsed.scheme()
        )));
    }

    let pathname = parsed.path().trim_end_matches('/').to_string();
    if pathname.is_empty() {
        return Err(CoreError::Validation(format!(
            "url '{url}' does not name a library path"
        )));
    }

    let params = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    Ok((pathname, params))
}

/// Explicit ids become store keys (`subscription:<id>:items`) and file
/// names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_id(id: SubscriptionId) -> Result<SubscriptionId, CoreError> {
    let valid = id
        .0
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(id)
    } else {
        Err(CoreError::Validation(format!(
            "subscription id '{id}' may only contain letters, digits, '_' and '-'"
        )))
    }
}

/// First 16 hex digits of SHA-256 over url and key.
pub fn derive_id(url: &str, key: Option<&str>) -> SubscriptionId {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(key.unwrap_or_default().as_bytes());
    let digest = hex::encode(hasher.finalize());
    SubscriptionId(digest[..16].to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn input(url: &str) -> SubscriptionInput {
        SubscriptionInput {
            url: url.to_string(),
            key: Some("secret".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn newtype_display() {
        assert_eq!(SubscriptionId::from("abc").to_string(), "abc");
    }

    #[test]
    fn from_input_decomposes_url() {
        let sub = Subscription::from_input(input(
            "https://api.example.org/users/42/items?collection=ABC&tag=x",
        ))
        .expect("valid");
        assert_eq!(sub.pathname, "/users/42/items");
        assert_eq!(sub.params.get("collection").map(String::as_str), Some("ABC"));
        assert_eq!(sub.params.get("tag").map(String::as_str), Some("x"));
        assert_eq!(sub.version, 0);
        assert_eq!(sub.topic(), "/users/42");
        assert_eq!(sub.origin().expect("origin"), "https://api.example.org");
    }

    #[test]
    fn derived_id_is_stable_and_key_sensitive() {
        let a = Subscription::from_input(input("https://x.org/groups/9")).expect("a");
        let b = Subscription::from_input(input("https://x.org/groups/9")).expect("b");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.0.len(), 16);

        let mut other = input("https://x.org/groups/9");
        other.key = Some("different".to_string());
        let c = Subscription::from_input(other).expect("c");
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn explicit_id_wins() {
        let mut data = input("https://x.org/users/1");
        data.id = Some(SubscriptionId::from("mine"));
        let sub = Subscription::from_input(data).expect("valid");
        assert_eq!(sub.id.0, "mine");
    }

    #[test]
    fn explicit_id_must_be_a_plain_token() {
        for id in ["a:items", "x.items", "../etc", "has space", "ü"] {
            let mut data = input("https://x.org/users/1");
            data.id = Some(SubscriptionId::from(id));
            let err = Subscription::from_input(data).unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{id}: {err}");
        }

        let mut data = input("https://x.org/users/1");
        data.id = Some(SubscriptionId::from("Lib_2-b"));
        assert!(Subscription::from_input(data).is_ok());
    }

    #[test]
    fn fresh_subscription_is_never_synced() {
        let mut sub = Subscription::from_input(input("https://x.org/users/1")).expect("valid");
        assert!(sub.never_synced());
        sub.synced_at = Some(Utc::now());
        assert!(!sub.never_synced());
        assert_eq!(sub.version, 0);
    }

    #[test]
    fn rejects_malformed_input() {
        for url in ["", "not a url", "ftp://x.org/users/1", "https://x.org/"] {
            let err = Subscription::from_input(input(url)).unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{url}: {err}");
        }

        let mut data = input("https://x.org/users/1");
        data.plugins.push(PluginBinding::new("  "));
        let err = Subscription::from_input(data).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn blank_key_is_dropped() {
        let mut data = input("https://x.org/users/1");
        data.key = Some("   ".to_string());
        let sub = Subscription::from_input(data).expect("valid");
        assert!(sub.key.is_none());
    }

    #[test]
    fn backoff_delays() {
        let fixed = Backoff::Fixed { delay_ms: 250 };
        assert_eq!(fixed.delay_for(1), Duration::from_millis(250));
        assert_eq!(fixed.delay_for(4), Duration::from_millis(250));

        let exp = Backoff::Exponential { delay_ms: 100 };
        assert_eq!(exp.delay_for(1), Duration::from_millis(100));
        assert_eq!(exp.delay_for(2), Duration::from_millis(200));
        assert_eq!(exp.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_serde_shape() {
        let yaml = "kind: fixed\ndelay_ms: 10\n";
        let backoff: Backoff = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(backoff, Backoff::Fixed { delay_ms: 10 });
    }
}
