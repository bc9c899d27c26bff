mod common;

use common::{context, settle, test_config, will, Harness};
use session_engine::config::{EngineConfig, StorageConfig};
use session_engine::net::security::AnonymousSecurityManager;
use session_engine::storage::Storage;
use session_engine::subscriptions::{CreditMode, SubscriptionContext};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn file_config(dir: &Path) -> EngineConfig {
    let mut config = test_config();
    config.storage = StorageConfig {
        data_dir: Some(dir.to_path_buf()),
    };
    config
}

fn harness(config: &EngineConfig) -> Harness {
    let storage = Storage::open(&config.storage).unwrap();
    Harness::with_parts(config.clone(), Arc::new(AnonymousSecurityManager), storage)
}

/// Hibernate `client-1` with one subscription and a delayed will, then stop.
async fn seed(config: &EngineConfig) -> u64 {
    let h = harness(config);
    h.manager.start().await;
    let session = h
        .manager
        .create(
            context("client-1")
                .persistent(true)
                .expiry_secs(60)
                .will(will("status/offline", 30))
                .build(),
        )
        .unwrap();
    session
        .add_subscription(
            SubscriptionContext::new("s1", "room/1").with_credit_mode(CreditMode::Client),
        )
        .await
        .unwrap();
    let internal_id = session.internal_id();
    h.manager.close(&session, false);
    h.manager.stop();
    internal_id
}

#[tokio::test(start_paused = true)]
async fn restart_reloads_hibernated_sessions_and_wills() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    let first_id = seed(&config).await;

    let h = harness(&config);
    assert_eq!(h.manager.start().await, 1);
    assert_eq!(h.manager.hibernated(), vec!["client-1".to_string()]);
    assert_eq!(h.manager.disconnected(), 1);
    assert_eq!(h.manager.wills().session_ids(), vec!["client-1".to_string()]);

    let controller = h.manager.controller("client-1").unwrap();
    let contexts = controller.contexts();
    assert_eq!(contexts.len(), 1);
    assert_eq!(contexts[0].destination_name, "room/1");
    assert_eq!(contexts[0].credit_mode, CreditMode::Client);
    assert_eq!(h.destinations.store("room/1").unwrap().subscribers(), 1);

    let resumed = h
        .manager
        .create(context("client-1").persistent(true).expiry_secs(60).build())
        .unwrap();
    assert!(resumed.is_restored());
    assert!(resumed.controller().contains("s1"));
    assert_eq!(resumed.internal_id(), first_id);

    let other = h.manager.create(context("client-2").build()).unwrap();
    assert!(other.internal_id() > first_id);

    // reconnecting without a will dropped the reloaded one
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(h.committed("status/offline"), 0);
    assert!(h.storage.wills.get("client-1").unwrap().is_none());
    h.manager.stop();
}

#[tokio::test(start_paused = true)]
async fn reloaded_session_expires_and_fires_will() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    seed(&config).await;

    let h = harness(&config);
    h.manager.start().await;
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.committed("status/offline"), 1);
    assert!(h.manager.wills().is_empty());

    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;
    assert_eq!(h.manager.expired(), 1);
    assert!(h.manager.hibernated().is_empty());
    assert!(h.storage.sessions.get("client-1").unwrap().is_none());
    assert_eq!(h.committed("status/offline"), 1);
    h.manager.stop();
}

#[tokio::test(start_paused = true)]
async fn clean_start_discards_persisted_state() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    seed(&config).await;

    let h = harness(&config);
    h.manager.start().await;
    let session = h
        .manager
        .create(
            context("client-1")
                .persistent(true)
                .expiry_secs(60)
                .reset_state(true)
                .build(),
        )
        .unwrap();
    assert!(!session.is_restored());
    assert!(session.controller().is_empty());
    assert_eq!(h.destinations.store("room/1").unwrap().subscribers(), 0);
    let stored = h.storage.sessions.get("client-1").unwrap().unwrap();
    assert!(stored.subscriptions.is_empty());
    h.manager.stop();
}

#[tokio::test(start_paused = true)]
async fn sessions_without_subscriptions_are_not_reloaded() {
    let dir = tempdir().unwrap();
    let config = file_config(dir.path());
    {
        let h = harness(&config);
        let session = h
            .manager
            .create(context("empty").persistent(true).expiry_secs(60).build())
            .unwrap();
        h.manager.close(&session, true);
        h.manager.stop();
    }
    let h = harness(&config);
    assert_eq!(h.manager.start().await, 0);
    assert!(h.manager.hibernated().is_empty());
    let session = h
        .manager
        .create(context("empty").persistent(true).expiry_secs(60).build())
        .unwrap();
    assert!(!session.is_restored());
    assert!(h.storage.sessions.get("empty").unwrap().is_some());
}
