mod common;

use common::{FailingPersistence, SlowPersistence, args, counter};
use livestate::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn ttl_entry_is_evicted_and_expired_in_the_backend() {
    let memory = Arc::new(MemoryPersistence::new());
    let engine = LiveState::builder()
        .expiring_backend(StoreKind::Memory, memory.clone())
        .entity(counter(EntityConfig::new().ttl_seconds(1).auto_persist(true)))
        .build()
        .unwrap();
    let key = StateKey::global("Counter");

    engine
        .command("Counter", "increment", &ScopeContext::new(), FieldMap::new(), None)
        .await
        .unwrap();
    assert!(engine.dispatcher().cache().contains(&key));
    assert!(memory.exists(&key).await.unwrap());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    let removed = engine.sweep_now().await;

    assert!(removed >= 2, "removed {removed}");
    assert!(!engine.dispatcher().cache().contains(&key));
    assert!(!memory.exists(&key).await.unwrap());
    assert!(memory.is_empty().await);
    assert_eq!(engine.stats().cached_entries, 0);
}

#[tokio::test]
async fn access_keeps_a_ttl_entry_alive() {
    let engine = LiveState::builder()
        .entity(counter(EntityConfig::new().ttl_seconds(1)))
        .build()
        .unwrap();
    let key = StateKey::global("Counter");

    for _ in 0..3 {
        engine
            .command("Counter", "increment", &ScopeContext::new(), FieldMap::new(), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        engine.sweep_now().await;
    }

    let state = engine.state(&key).await.unwrap();
    assert_eq!(state.version, 3);
}

#[tokio::test]
async fn memory_only_state_is_gone_after_its_ttl() {
    let memory = Arc::new(MemoryPersistence::new());
    let engine = LiveState::builder()
        .expiring_backend(StoreKind::Memory, memory.clone())
        .entity(counter(EntityConfig::new().ttl_seconds(1)))
        .build()
        .unwrap();
    let key = StateKey::global("Counter");

    engine
        .command("Counter", "increment", &ScopeContext::new(), args(json!({ "amount": 4 })), None)
        .await
        .unwrap();
    assert!(!memory.exists(&key).await.unwrap());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(engine.sweep_now().await, 1);

    assert!(!engine.dispatcher().cache().contains(&key));
    assert!(!memory.exists(&key).await.unwrap());
    let state = engine.state(&key).await.unwrap();
    assert_eq!(state.version, 0);
    assert_eq!(state.field("count"), Some(&json!(0)));
}

#[tokio::test]
async fn sweep_racing_a_command_keeps_versions_climbing() {
    let slow = Arc::new(SlowPersistence::new(Duration::from_millis(200)));
    let engine = Arc::new(
        LiveState::builder()
            .config(EngineConfig::new().default_ttl(Duration::from_millis(100)))
            .custom_backend("slow", slow.clone())
            .entity(counter(
                EntityConfig::new().custom_backend("slow").auto_persist(true),
            ))
            .build()
            .unwrap(),
    );
    let increment = |amount: i64| {
        let engine = engine.clone();
        async move {
            engine
                .command("Counter", "increment", &ScopeContext::new(), args(json!({ "amount": amount })), None)
                .await
                .unwrap()
                .into_result()
                .unwrap()
                .0
        }
    };

    assert_eq!(increment(4).await.version, 1);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let sweeping = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.sweep_now().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = increment(1).await;
    sweeping.await.unwrap();

    assert_eq!(second.version, 2);
    assert_eq!(second.changed_fields.get("count"), Some(&json!(5)));
}

#[tokio::test]
async fn reads_during_a_delete_wait_for_the_backend() {
    let slow = Arc::new(
        SlowPersistence::new(Duration::ZERO).with_delete_delay(Duration::from_millis(200)),
    );
    let engine = Arc::new(
        LiveState::builder()
            .custom_backend("slow", slow.clone())
            .entity(counter(
                EntityConfig::new().custom_backend("slow").auto_persist(true),
            ))
            .build()
            .unwrap(),
    );
    let key = StateKey::global("Counter");

    engine
        .command("Counter", "increment", &ScopeContext::new(), args(json!({ "amount": 7 })), None)
        .await
        .unwrap();
    assert!(slow.exists(&key).await.unwrap());

    let deleting = {
        let engine = engine.clone();
        let key = key.clone();
        tokio::spawn(async move { engine.delete(&key).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let during = engine.state(&key).await.unwrap();

    assert!(deleting.await.unwrap().unwrap());
    assert_eq!(during.version, 0);
    assert_eq!(during.field("count"), Some(&json!(0)));
    assert!(!slow.exists(&key).await.unwrap());

    let (diff, _) = engine
        .command("Counter", "increment", &ScopeContext::new(), FieldMap::new(), None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(diff.version, 1);
    assert_eq!(diff.changed_fields.get("count"), Some(&json!(1)));
}

#[tokio::test]
async fn load_failures_respect_load_miss_tolerance() {
    let engine = LiveState::builder()
        .custom_backend("down", Arc::new(FailingPersistence::failing_loads()))
        .entity(counter(
            EntityConfig::new().custom_backend("down").load_miss_tolerant(true),
        ))
        .entity(
            EntityType::builder("Ledger")
                .field("balance", FieldType::Int, json!(0))
                .config(EntityConfig::new().custom_backend("down"))
                .build(),
        )
        .build()
        .unwrap();

    let tolerant = engine.state(&StateKey::global("Counter")).await.unwrap();
    assert_eq!(tolerant.version, 0);
    assert_eq!(tolerant.field("count"), Some(&json!(0)));

    let strict = engine.state(&StateKey::global("Ledger")).await;
    assert!(matches!(strict, Err(StateError::Persistence(_))));
    assert!(!engine.dispatcher().cache().contains(&StateKey::global("Ledger")));
    assert_eq!(engine.stats().cached_entries, 1);
}

#[tokio::test]
async fn json_files_survive_an_engine_restart() {
    let dir = tempfile::tempdir().unwrap();
    let key = StateKey::global("Counter");

    {
        let files = Arc::new(JsonFilePersistence::open(dir.path()).await.unwrap());
        let engine = LiveState::builder()
            .custom_backend("files", files)
            .entity(counter(
                EntityConfig::new().custom_backend("files").auto_persist(true),
            ))
            .build()
            .unwrap();
        for _ in 0..2 {
            engine
                .command("Counter", "increment", &ScopeContext::new(), args(json!({ "amount": 3 })), None)
                .await
                .unwrap();
        }
    }

    let files = Arc::new(JsonFilePersistence::open(dir.path()).await.unwrap());
    let engine = LiveState::builder()
        .custom_backend("files", files.clone())
        .entity(counter(
            EntityConfig::new().custom_backend("files").auto_persist(true),
        ))
        .build()
        .unwrap();

    let restored = engine.state(&key).await.unwrap();
    assert_eq!(restored.version, 2);
    assert_eq!(restored.field("count"), Some(&json!(6)));

    assert!(engine.delete(&key).await.unwrap());
    assert!(!files.exists(&key).await.unwrap());
    assert!(!engine.delete(&key).await.unwrap());
    assert_eq!(engine.state(&key).await.unwrap().version, 0);
}
