//! End-to-end tests: live workers, triggers, supervision, publish helpers.

mod common;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pgpubsub_core::{AcceptAll, ColumnRowDecoder, ListenerFilter, RowSnapshot, decode_kwargs};
use pgpubsub_pg::notify::{notify, process_stored_notifications};
use pgpubsub_pg::triggers::{TriggerOperation, TriggerSpec, TriggerTiming, install_trigger};
use pgpubsub_pg::{
    ChannelDescriptor, ChannelRegistry, CustomListener, Dispatcher, ListenerConfig, ListenerError,
    PayloadMeta, Supervisor, TriggerListener, Worker,
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use serial_test::serial;
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Map<String, Value>>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn calls(&self) -> Vec<Map<String, Value>> {
        self.calls.lock().unwrap().clone()
    }
}

struct RecordingListener(Arc<Recorder>);

#[async_trait]
impl CustomListener for RecordingListener {
    async fn call(
        &self,
        _conn: &mut PgConnection,
        kwargs: &Map<String, Value>,
        _meta: PayloadMeta<'_>,
    ) -> Result<(), ListenerError> {
        self.0.calls.lock().unwrap().push(kwargs.clone());
        Ok(())
    }
}

#[derive(Default)]
struct TriggerRecorder {
    calls: Mutex<Vec<(Option<RowSnapshot>, Option<RowSnapshot>)>>,
}

struct RecordingTrigger(Arc<TriggerRecorder>);

#[async_trait]
impl TriggerListener for RecordingTrigger {
    async fn call(
        &self,
        _conn: &mut PgConnection,
        old: Option<RowSnapshot>,
        new: Option<RowSnapshot>,
        _meta: PayloadMeta<'_>,
    ) -> Result<(), ListenerError> {
        self.0.calls.lock().unwrap().push((old, new));
        Ok(())
    }
}

struct TenantFilter(&'static str);

impl ListenerFilter for TenantFilter {
    fn accept(&self, context: &Value) -> bool {
        context.get("tenant").and_then(Value::as_str) == Some(self.0)
    }
}

struct Harness {
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<ListenerConfig>,
}

fn harness(descriptor: ChannelDescriptor, filter: Arc<dyn ListenerFilter>) -> Harness {
    let registry = Arc::new(
        ChannelRegistry::builder()
            .register(descriptor)
            .build()
            .unwrap(),
    );
    // Short poll deadline keeps shutdown fast in tests.
    let config = Arc::new(ListenerConfig {
        poll_deadline: Duration::from_millis(200),
        restart_initial_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        config.clone(),
        filter,
        Arc::new(ColumnRowDecoder::new()),
    ));
    Harness {
        registry,
        dispatcher,
        config,
    }
}

fn spawn_worker(
    id: usize,
    pool: &PgPool,
    harness: &Harness,
    shutdown: &CancellationToken,
) -> tokio::task::JoinHandle<Result<(), pgpubsub_pg::WorkerError>> {
    let worker = Worker::new(
        id,
        pool.clone(),
        harness.dispatcher.clone(),
        harness.config.clone(),
        harness.registry.select(&[]).unwrap(),
    );
    tokio::spawn(worker.run(shutdown.clone()))
}

async fn stored_count(pool: &PgPool, channel: &str) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM pgpubsub_notification WHERE channel = $1")
        .bind(channel)
        .fetch_one(pool)
        .await
        .expect("Failed to count stored notifications")
}

// Give the freshly spawned worker time to issue its LISTEN.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
#[serial]
async fn custom_channel_delivers_kwargs_once() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("post_reads");

    let recorder = Arc::new(Recorder::default());
    let harness = harness(
        ChannelDescriptor::custom(&channel, Arc::new(RecordingListener(recorder.clone()))),
        Arc::new(AcceptAll),
    );

    let shutdown = CancellationToken::new();
    let handle = spawn_worker(0, &pool, &harness, &shutdown);
    settle().await;

    let mut kwargs = Map::new();
    kwargs.insert("model_id".into(), json!(12));
    kwargs.insert("date".into(), json!("2022-01-24"));
    notify(&pool, &harness.registry, &channel, kwargs, None)
        .await
        .unwrap();

    assert!(common::wait_until(Duration::from_secs(5), || recorder.count() == 1).await);

    #[derive(Deserialize)]
    struct PostReads {
        model_id: i64,
        date: chrono::NaiveDate,
    }
    let calls = recorder.calls();
    let decoded: PostReads = decode_kwargs(&calls[0]).unwrap();
    assert_eq!(decoded.model_id, 12);
    assert_eq!(decoded.date, chrono::NaiveDate::from_ymd_opt(2022, 1, 24).unwrap());

    // Transient channel: nothing stored.
    assert_eq!(stored_count(&pool, &channel).await, 0);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn custom_payload_types_round_trip() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("round_trip");

    let recorder = Arc::new(Recorder::default());
    let harness = harness(
        ChannelDescriptor::custom(&channel, Arc::new(RecordingListener(recorder.clone()))),
        Arc::new(AcceptAll),
    );

    let shutdown = CancellationToken::new();
    let handle = spawn_worker(0, &pool, &harness, &shutdown);
    settle().await;

    // Sets publish as sorted arrays; dates as ISO-8601 strings.
    let ratings: BTreeSet<i64> = [3, 1, 2].into_iter().collect();
    let mut kwargs = Map::new();
    kwargs.insert("count".into(), json!(7));
    kwargs.insert("score".into(), json!(4.5));
    kwargs.insert("name".into(), json!("Paul"));
    kwargs.insert("active".into(), json!(true));
    kwargs.insert("tags".into(), json!(["a", "b"]));
    kwargs.insert("ratings".into(), serde_json::to_value(&ratings).unwrap());
    kwargs.insert(
        "date".into(),
        serde_json::to_value(chrono::NaiveDate::from_ymd_opt(2022, 1, 24).unwrap()).unwrap(),
    );
    notify(&pool, &harness.registry, &channel, kwargs.clone(), None)
        .await
        .unwrap();

    assert!(common::wait_until(Duration::from_secs(5), || recorder.count() == 1).await);

    #[derive(Deserialize)]
    struct Everything {
        count: i64,
        score: f64,
        name: String,
        active: bool,
        tags: Vec<String>,
        ratings: BTreeSet<i64>,
        date: chrono::NaiveDate,
    }
    let observed = recorder.calls().remove(0);
    assert_eq!(observed, kwargs);
    let typed: Everything = decode_kwargs(&observed).unwrap();
    assert_eq!(typed.count, 7);
    assert_eq!(typed.score, 4.5);
    assert_eq!(typed.name, "Paul");
    assert!(typed.active);
    assert_eq!(typed.tags, vec!["a", "b"]);
    assert_eq!(typed.ratings, ratings);
    assert_eq!(typed.date, chrono::NaiveDate::from_ymd_opt(2022, 1, 24).unwrap());

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

async fn author_table_fixture(pool: &PgPool, channel: &str) -> TriggerSpec {
    sqlx::query("DROP TABLE IF EXISTS test_author CASCADE")
        .execute(pool)
        .await
        .unwrap();
    sqlx::query("CREATE TABLE test_author (id SERIAL PRIMARY KEY, name TEXT NOT NULL)")
        .execute(pool)
        .await
        .unwrap();

    let spec = TriggerSpec {
        channel: channel.to_string(),
        app: "tests".into(),
        model: "Author".into(),
        table: "test_author".into(),
        timing: TriggerTiming::After,
        operations: vec![TriggerOperation::Insert],
        durable: true,
        db_version: None,
    };
    install_trigger(pool, &spec).await.unwrap();
    spec
}

#[tokio::test]
#[serial]
async fn durable_trigger_is_executed_by_exactly_one_of_two_workers() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("author_trigger");
    author_table_fixture(&pool, &channel).await;

    let trigger_calls = Arc::new(TriggerRecorder::default());
    let harness = harness(
        ChannelDescriptor::trigger(&channel, Arc::new(RecordingTrigger(trigger_calls.clone())))
            .durable(),
        Arc::new(AcceptAll),
    );

    let shutdown = CancellationToken::new();
    let first = spawn_worker(0, &pool, &harness, &shutdown);
    let second = spawn_worker(1, &pool, &harness, &shutdown);
    settle().await;

    sqlx::query("INSERT INTO test_author (name) VALUES ('Paul')")
        .execute(&pool)
        .await
        .unwrap();

    assert!(
        common::wait_until(Duration::from_secs(5), || {
            trigger_calls.calls.lock().unwrap().len() == 1
        })
        .await
    );
    // Both workers saw the notification; give the loser time to double-fire
    // if the claim protocol were broken.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let calls = trigger_calls.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    let (old, new) = &calls[0];
    assert!(old.is_none());
    let new = new.as_ref().unwrap();
    assert_eq!(new.model, "tests.Author");
    assert_eq!(new.field("name"), Some(&json!("Paul")));
    drop(calls);

    assert_eq!(stored_count(&pool, &channel).await, 0);

    shutdown.cancel();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn aborted_producing_transaction_publishes_nothing() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("author_abort");
    author_table_fixture(&pool, &channel).await;

    let trigger_calls = Arc::new(TriggerRecorder::default());
    let harness = harness(
        ChannelDescriptor::trigger(&channel, Arc::new(RecordingTrigger(trigger_calls.clone())))
            .durable(),
        Arc::new(AcceptAll),
    );

    let shutdown = CancellationToken::new();
    let handle = spawn_worker(0, &pool, &harness, &shutdown);
    settle().await;

    let mut tx = pool.begin().await.unwrap();
    sqlx::query("INSERT INTO test_author (name) VALUES ('Nobody')")
        .execute(&mut *tx)
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    // Neither the notification nor the stored row survived the rollback.
    assert_eq!(trigger_calls.calls.lock().unwrap().len(), 0);
    assert_eq!(stored_count(&pool, &channel).await, 0);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn filter_is_applied_uniformly_and_rejected_rows_remain() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("tenanted");

    let recorder = Arc::new(Recorder::default());
    let harness = harness(
        ChannelDescriptor::custom(&channel, Arc::new(RecordingListener(recorder.clone())))
            .durable(),
        Arc::new(TenantFilter("a")),
    );

    let shutdown = CancellationToken::new();
    let handle = spawn_worker(0, &pool, &harness, &shutdown);
    settle().await;

    for i in 0..20 {
        let tenant = if i % 2 == 0 { "a" } else { "b" };
        let mut kwargs = Map::new();
        kwargs.insert("event_id".into(), json!(i));
        notify(
            &pool,
            &harness.registry,
            &channel,
            kwargs,
            Some(json!({"tenant": tenant})),
        )
        .await
        .unwrap();
    }

    assert!(common::wait_until(Duration::from_secs(5), || recorder.count() == 10).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(recorder.count(), 10);
    // The rejected half stays in the table for another deployment.
    assert_eq!(stored_count(&pool, &channel).await, 10);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn identical_payloads_collapse_live_and_recovery_drains_the_rest() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("dups");

    let recorder = Arc::new(Recorder::default());
    let harness = harness(
        ChannelDescriptor::custom(&channel, Arc::new(RecordingListener(recorder.clone())))
            .durable(),
        Arc::new(AcceptAll),
    );

    let shutdown = CancellationToken::new();
    let handle = spawn_worker(0, &pool, &harness, &shutdown);
    settle().await;

    // Five identical payloads in one producing transaction: PostgreSQL
    // coalesces the notifications, five rows are stored.
    let payload = json!({"kwargs": {"model_id": 5}});
    let mut tx = pool.begin().await.unwrap();
    for _ in 0..5 {
        sqlx::query("SELECT pg_notify($1, $2::text)")
            .bind(&channel)
            .bind(payload.to_string())
            .execute(&mut *tx)
            .await
            .unwrap();
        sqlx::query("INSERT INTO pgpubsub_notification (channel, payload) VALUES ($1, $2)")
            .bind(&channel)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();

    assert!(common::wait_until(Duration::from_secs(5), || recorder.count() == 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(recorder.count(), 1);
    assert_eq!(stored_count(&pool, &channel).await, 4);

    // The backlog hint replays each surviving duplicate individually.
    process_stored_notifications(&pool, &harness.registry, &[])
        .await
        .unwrap();
    assert!(common::wait_until(Duration::from_secs(5), || recorder.count() == 5).await);
    assert_eq!(stored_count(&pool, &channel).await, 0);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn backlog_hint_drains_rows_published_while_no_worker_ran() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("backlog");

    let recorder = Arc::new(Recorder::default());
    let harness = harness(
        ChannelDescriptor::custom(&channel, Arc::new(RecordingListener(recorder.clone())))
            .durable(),
        Arc::new(AcceptAll),
    );

    // Publish with no listener running: rows accumulate.
    for i in 0..3 {
        let mut kwargs = Map::new();
        kwargs.insert("event_id".into(), json!(i));
        notify(&pool, &harness.registry, &channel, kwargs, None)
            .await
            .unwrap();
    }
    assert_eq!(stored_count(&pool, &channel).await, 3);

    let shutdown = CancellationToken::new();
    let handle = spawn_worker(0, &pool, &harness, &shutdown);
    settle().await;
    assert_eq!(recorder.count(), 0);

    process_stored_notifications(&pool, &harness.registry, &[])
        .await
        .unwrap();
    assert!(common::wait_until(Duration::from_secs(5), || recorder.count() == 3).await);
    assert_eq!(stored_count(&pool, &channel).await, 0);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
#[serial]
async fn supervisor_replaces_a_terminated_worker() {
    let pool = common::get_pg_pool().await;
    common::truncate_notifications(&pool).await;
    let channel = common::unique_channel("restart");

    let recorder = Arc::new(Recorder::default());
    let harness = harness(
        ChannelDescriptor::custom(&channel, Arc::new(RecordingListener(recorder.clone()))),
        Arc::new(AcceptAll),
    );

    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::new(
        pool.clone(),
        harness.dispatcher.clone(),
        harness.config.clone(),
        harness.registry.select(&[]).unwrap(),
    );
    let token = shutdown.clone();
    let handle = tokio::spawn(async move { supervisor.run(1, token).await });
    settle().await;

    // Kill the worker's listening backend out from under it.
    let terminated: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM (
            SELECT pg_terminate_backend(pid)
            FROM pg_stat_activity
            WHERE datname = current_database()
              AND pid <> pg_backend_pid()
              AND query ILIKE 'LISTEN%'
        ) t
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(terminated >= 1, "expected to terminate a listening backend");

    // The replacement worker resubscribes and keeps delivering. Probe
    // repeatedly: notifications sent before the new LISTEN is in place are
    // lost, which is exactly the transient-channel contract.
    let mut delivered = false;
    for probe in 0..25 {
        let mut kwargs = Map::new();
        kwargs.insert("probe".into(), json!(probe));
        notify(&pool, &harness.registry, &channel, kwargs, None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        if recorder.count() >= 1 {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "replacement worker never delivered a notification");

    shutdown.cancel();
    handle.await.unwrap();
}
