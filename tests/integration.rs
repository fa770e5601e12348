use std::{ops::Deref, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use serde_json::json;
use tempfile::TempDir;
use tempoq::{
    config::Config,
    metrics::{self, Outcome, RecordingMetrics},
    queue::{Location, QueueStore},
    store::{keys, BackingStore, Batch, SqliteStore},
    Context, Message, MessageStatus, NewMessage, Service,
};

struct TmpService {
    svc: Service,
    metrics: RecordingMetrics,
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

fn db_path(dir: &TempDir) -> String {
    dir.path().join("tempoq.db").to_string_lossy().to_string()
}

async fn connect(tmpdir: TempDir) -> TmpService {
    let metrics = RecordingMetrics::new();

    TmpService {
        svc: Service::connect_with()
            .config(Config {
                db_path: Some(db_path(&tmpdir)),
                processing_timeout_ms: 1_000,
                ..Config::default()
            })
            .metrics(Arc::new(metrics.clone()))
            .call()
            .await
            .unwrap(),
        metrics,
        tmpdir,
    }
}

async fn setup() -> TmpService {
    connect(tempfile::tempdir().unwrap()).await
}

#[tokio::test]
async fn test_failing_job_is_dead_lettered() {
    let service = setup().await;

    service
        .subscribe("ai_process", |_: Context, message: Message| async move {
            Err::<(), _>(eyre::eyre!("transcription failed for {}", message.payload["track"]))
        })
        .await
        .unwrap();

    let id = service
        .publish_with_retry("ai_process", json!({ "track": "intro.wav" }), 2)
        .await
        .unwrap();

    service.drain().await;

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::DeadLetter);
    assert_eq!(message.retry_count, 2);
    assert_eq!(message.attempts, 3);
    assert_eq!(
        message.error_message.as_deref(),
        Some("transcription failed for \"intro.wav\"")
    );

    let stats = service.stats("ai_process").await.unwrap();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.dead_letter_size, 1);
    assert!(stats.consistent());

    assert_eq!(
        service
            .metrics
            .counter(metrics::NACK, "ai_process", Outcome::Success),
        3
    );

    let replayed = service.replay_dead_letter(id).await.unwrap();
    assert_eq!(replayed.status, MessageStatus::Pending);
    assert!(service.replay_dead_letter(id).await.unwrap_err().is_conflict());
    assert!(service.stats("ai_process").await.unwrap().consistent());
}

#[tokio::test]
async fn test_successful_job_completes() {
    let service = setup().await;

    service
        .subscribe("thumbnails", |ctx: Context, _: Message| async move {
            assert_eq!(ctx.topic, "thumbnails");
            assert_eq!(ctx.attempt, 1);
            Ok::<_, eyre::Report>(())
        })
        .await
        .unwrap();

    let mut ids = Vec::new();
    for n in 0..25 {
        ids.push(
            service
                .publish("thumbnails", json!({ "image": n }))
                .await
                .unwrap(),
        );
    }

    service.drain().await;

    for id in ids {
        let message = service.get_message(id).await.unwrap();
        assert_eq!(message.status, MessageStatus::Completed);
        assert!(message.processed_at.is_some());
    }

    let stats = service.stats("thumbnails").await.unwrap();
    assert_eq!(stats.size, 0);
    assert_eq!(stats.pending + stats.processing, 0);
}

#[tokio::test]
async fn test_state_survives_reconnect() {
    let tmpdir = tempfile::tempdir().unwrap();
    let service = connect(tmpdir).await;

    let id = service
        .publish_idempotent("reports", "2026-10", json!({ "month": 10 }))
        .await
        .unwrap();

    service.close().await.unwrap();
    let TmpService { tmpdir, .. } = service;

    let service = connect(tmpdir).await;

    let message = service.get_message(id).await.unwrap();
    assert_eq!(message.status, MessageStatus::Pending);
    assert_eq!(service.topics().await.unwrap(), vec!["reports"]);

    let again = service
        .publish_idempotent("reports", "2026-10", json!({ "month": 10 }))
        .await
        .unwrap();
    assert_eq!(again, id);
    assert_eq!(service.stats("reports").await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_crashed_worker_recovery() {
    let tmpdir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::connect(db_path(&tmpdir)).await.unwrap());
    let queue = QueueStore::new(store.clone(), Duration::from_secs(3600));

    // A worker claims the message, marks it processing and never comes back.
    let crashed_at = Utc::now() - TimeDelta::minutes(30);
    let mut message = Message::new(
        NewMessage::builder()
            .topic("ingest")
            .payload(json!({ "batch": 7 }))
            .build(),
        3,
        crashed_at,
    );
    queue.publish(&message).await.unwrap();
    assert_eq!(queue.claim("ingest").await.unwrap(), Some(message.id));
    queue
        .mark_processing(&mut message, crashed_at)
        .await
        .unwrap();

    let service = Service::connect_with()
        .store(store as Arc<dyn BackingStore>)
        .call()
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        service.reclaim_once(Utc::now()),
        service.reclaim_once(Utc::now())
    );
    assert_eq!(a.unwrap() + b.unwrap(), 1);

    let reclaimed = service.get_message(message.id).await.unwrap();
    assert_eq!(reclaimed.retry_count, 1);
    assert_eq!(reclaimed.status, MessageStatus::Retrying);
    assert_eq!(
        queue.locate(&reclaimed).await.unwrap(),
        Some(Location::Pending)
    );

    service
        .subscribe("ingest", |_: Context, _: Message| async {
            Ok::<_, eyre::Report>(())
        })
        .await
        .unwrap();
    service.drain().await;

    assert_eq!(
        service.get_message(message.id).await.unwrap().status,
        MessageStatus::Completed
    );
    assert!(service.stats("ingest").await.unwrap().consistent());
}

#[tokio::test]
async fn test_dead_letter_expiry_and_purge() {
    let service = setup().await;

    service
        .subscribe("exports", |_: Context, _: Message| async {
            Err::<(), _>(eyre::eyre!("bucket missing"))
        })
        .await
        .unwrap();

    for n in 0..3 {
        service
            .publish_with_retry("exports", json!({ "n": n }), 0)
            .await
            .unwrap();
    }
    service.drain().await;

    let dead = service.list_dead_letters("exports", 0, 10).await.unwrap();
    assert_eq!(dead.len(), 3);

    assert_eq!(
        service.expire_dead_letters_once(Utc::now()).await.unwrap(),
        0
    );

    let later = Utc::now() + TimeDelta::days(8);
    assert_eq!(service.expire_dead_letters_once(later).await.unwrap(), 3);
    assert_eq!(service.stats("exports").await.unwrap().dead_letter_size, 0);

    service
        .publish_with_retry("exports", json!({ "n": 3 }), 0)
        .await
        .unwrap();
    service.drain().await;
    assert_eq!(service.purge_dead_letters("exports").await.unwrap(), 1);
    assert!(service
        .list_dead_letters("exports", 0, 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_sqlite_store_primitives() {
    let tmpdir = tempfile::tempdir().unwrap();
    let store = SqliteStore::connect(db_path(&tmpdir)).await.unwrap();

    assert_eq!(store.transfer("a", "b").await.unwrap(), None);

    store
        .commit(Batch::new().push("a", "1").push("a", "2").incr("n", 2))
        .await
        .unwrap();
    assert_eq!(store.transfer("a", "b").await.unwrap().as_deref(), Some("1"));
    assert_eq!(store.range("a", 0, 10).await.unwrap(), vec!["2"]);
    assert_eq!(store.range("b", 0, 10).await.unwrap(), vec!["1"]);

    // A failed guard applies nothing.
    let applied = store
        .commit(
            Batch::new()
                .guard_member("a", "1")
                .remove("b", "1")
                .incr("n", -1),
        )
        .await
        .unwrap();
    assert!(!applied);
    assert_eq!(store.counter("n").await.unwrap(), 2);
    assert!(store.contains("b", "1").await.unwrap());

    store
        .commit(Batch::new().set(keys::message("x"), b"v1".to_vec(), None))
        .await
        .unwrap();
    assert!(!store
        .commit(
            Batch::new()
                .guard_unchanged(keys::message("x"), b"v0".to_vec())
                .delete(keys::message("x"))
        )
        .await
        .unwrap());
    assert!(store
        .commit(
            Batch::new()
                .guard_unchanged(keys::message("x"), b"v1".to_vec())
                .delete(keys::message("x"))
        )
        .await
        .unwrap());
    assert_eq!(store.get(&keys::message("x")).await.unwrap(), None);

    store
        .commit(Batch::new().set("ttl", b"gone".to_vec(), Some(Duration::from_millis(1))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(store.get("ttl").await.unwrap(), None);
    assert_eq!(store.evict_expired().await.unwrap(), 1);

    store.close().await.unwrap();
}
