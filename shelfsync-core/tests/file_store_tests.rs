//! FileStore + SubscriptionRepo persistence, crash-safety and error-message tests.

use std::fs;
use std::sync::Arc;

use rstest::rstest;
use shelfsync_core::{
    error::CoreError,
    repo::{self, SubscriptionRepo},
    FileStore, PluginBinding, Store, StoreError, Subscription, SubscriptionId, SubscriptionInput,
};

fn open_repo(home: &assert_fs::TempDir) -> (FileStore, SubscriptionRepo) {
    let store = FileStore::open_at(home.path(), "default").expect("open store");
    let repo = SubscriptionRepo::new(Arc::new(store.clone()));
    (store, repo)
}

fn subscription(url: &str, key: Option<&str>, plugins: Vec<PluginBinding>) -> Subscription {
    Subscription::from_input(SubscriptionInput {
        id: None,
        url: url.to_string(),
        key: key.map(str::to_string),
        plugins,
    })
    .expect("valid subscription")
}

// ---------------------------------------------------------------------------
// 1. Persistence across reopen
// ---------------------------------------------------------------------------

#[rstest]
#[case("minimal", subscription("https://api.example.org/users/1", None, vec![]))]
#[case(
    "query_params",
    subscription("https://api.example.org/groups/77/items?collection=XY12&tag=to%20read", Some("k"), vec![])
)]
#[case(
    "plugin_chain",
    subscription(
        "https://api.example.org/users/5",
        Some("secret"),
        vec![
            PluginBinding::new("logger").with_option("level", "debug"),
            PluginBinding::new("file").with_option("directory", "/tmp/out"),
        ],
    )
)]
#[case(
    "unicode_params",
    subscription("https://api.example.org/users/9?tag=%E6%97%A5%E6%9C%AC%E8%AA%9E", None, vec![])
)]
#[tokio::test]
async fn subscription_survives_reopen(#[case] label: &str, #[case] original: Subscription) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    {
        let (_store, repo) = open_repo(&home);
        repo.save(&original).await.unwrap_or_else(|e| panic!("[{label}] save: {e}"));
    }

    let (_store, repo) = open_repo(&home);
    let loaded = repo
        .load(&original.id)
        .await
        .unwrap_or_else(|e| panic!("[{label}] load: {e}"));
    assert_eq!(loaded.url, original.url, "[{label}] url");
    assert_eq!(loaded.pathname, original.pathname, "[{label}] pathname");
    assert_eq!(loaded.params, original.params, "[{label}] params");
    assert_eq!(loaded.key, original.key, "[{label}] key");
    assert_eq!(loaded.plugins, original.plugins, "[{label}] plugins");
    assert_eq!(
        loaded.created_at.timestamp(),
        original.created_at.timestamp(),
        "[{label}] created_at"
    );
}

#[tokio::test]
async fn committed_version_and_keys_survive_reopen() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut sub = subscription("https://api.example.org/users/1", Some("k"), vec![]);
    {
        let (_store, repo) = open_repo(&home);
        repo.save(&sub).await.expect("save");
        repo.commit(&mut sub, 12, &["A".to_string(), "B".to_string()], &[])
            .await
            .expect("commit");
    }

    let (_store, repo) = open_repo(&home);
    let loaded = repo.load(&sub.id).await.expect("load");
    assert_eq!(loaded.version, 12);
    assert!(!loaded.never_synced());
    let keys = repo.known_keys(&sub.id).await.expect("keys");
    assert!(keys.contains("A") && keys.contains("B"));
    assert_eq!(repo.load_all().await.expect("all").len(), 1);
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[tokio::test]
async fn mid_write_crash_leaves_original_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let (store, repo) = open_repo(&home);
    let sub = subscription("https://api.example.org/users/1", None, vec![]);
    repo.save(&sub).await.expect("save");

    let path = store
        .document_path(&repo::record_key(&sub.id))
        .expect("path");
    let original_bytes = fs::read(&path).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, b"CRASH - INCOMPLETE WRITE").expect("write crash tmp");

    assert_eq!(original_bytes, fs::read(&path).expect("read after crash"));
    let loaded = repo.load(&sub.id).await.expect("load after crash");
    assert_eq!(loaded.url, sub.url);
}

#[cfg(unix)]
#[tokio::test]
async fn documents_are_private() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    let (store, repo) = open_repo(&home);
    let sub = subscription("https://api.example.org/users/1", Some("secret"), vec![]);
    repo.save(&sub).await.expect("save");

    let path = store.document_path(&repo::record_key(&sub.id)).expect("path");
    let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
    assert_eq!(mode, 0o600, "credentials must not be world-readable");
}

// ---------------------------------------------------------------------------
// 3. Error messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_subscription_names_the_id() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let (_store, repo) = open_repo(&home);
    let err = repo.load(&SubscriptionId::from("abc123")).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("abc123"));
}

#[tokio::test]
async fn corrupt_version_field_is_reported() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let (store, repo) = open_repo(&home);
    let sub = subscription("https://api.example.org/users/1", None, vec![]);
    repo.save(&sub).await.expect("save");

    let mut fields = shelfsync_core::Fields::new();
    fields.insert("version".to_string(), "seven".to_string());
    store
        .write(&repo::record_key(&sub.id), fields)
        .await
        .expect("write");

    let err = repo.load(&sub.id).await.unwrap_err();
    match err {
        CoreError::Store(StoreError::Corrupt { field, .. }) => assert_eq!(field, "version"),
        other => panic!("unexpected error: {other}"),
    }
}
