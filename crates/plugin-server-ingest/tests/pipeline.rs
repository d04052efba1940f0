//! End-to-end tests for the ingestion pipeline.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use plugin_server_core::{Event, FilterKey, PropertyType, ValueKinds};
use plugin_server_ingest::health::HealthRegistry;
use plugin_server_ingest::pipeline::{MemoryDeadLetters, MemorySink};
use plugin_server_ingest::plugins::{PluginContext, PluginExecutionError, PluginOutcome};
use plugin_server_ingest::{
    ChainResult, ChannelQueue, DeadLetterReason, EventQueue, MemoryStore, Plugin, PluginConfig,
    PluginConfigHandle, PluginConfigSnapshot, PluginExecutor, PluginRegistry,
    PropertyDefinitionStore, PropertyResolver, RawMessage, RetryPolicy, SpoolQueue, SqliteStore,
    TopicWriter, UpsertOutcome, WorkerContext, run_pool,
};
use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tempfile::TempDir;

struct Pipeline {
    ctx: Arc<WorkerContext>,
    sink: Arc<MemorySink>,
    dead_letters: Arc<MemoryDeadLetters>,
    store: Arc<dyn PropertyDefinitionStore>,
}

fn pipeline(
    queue: Arc<dyn EventQueue>,
    store: Arc<dyn PropertyDefinitionStore>,
    registry: PluginRegistry,
    plugins: Value,
) -> Pipeline {
    let doc = serde_json::from_value(plugins).unwrap();
    let sink = Arc::new(MemorySink::new());
    let dead_letters = Arc::new(MemoryDeadLetters::new());

    let ctx = WorkerContext {
        queue,
        plugin_config: PluginConfigHandle::new(PluginConfigSnapshot::from_document(doc)),
        executor: PluginExecutor::new(Arc::new(registry), Duration::from_millis(50)),
        resolver: PropertyResolver::new(Arc::clone(&store)),
        retry: RetryPolicy::default(),
        sink: sink.clone(),
        dead_letters: dead_letters.clone(),
        batch_size: 8,
        poll_timeout: Duration::from_millis(10),
        running: Arc::new(AtomicBool::new(true)),
        health: HealthRegistry::new(),
    };

    Pipeline {
        ctx: Arc::new(ctx),
        sink,
        dead_letters,
        store,
    }
}

fn pageview_json() -> Value {
    json!({
        "team_id": 42,
        "event": "pageview",
        "timestamp": "2024-01-01T00:00:00Z",
        "properties": {"$browser": "Chrome"}
    })
}

async fn feed(messages: Vec<Value>) -> Arc<dyn EventQueue> {
    let (queue, tx) = ChannelQueue::new(messages.len().max(1));
    for (i, m) in messages.into_iter().enumerate() {
        tx.send(RawMessage::new(m.to_string(), format!("m{i}")))
            .await
            .unwrap();
    }
    Arc::new(queue)
}

#[tokio::test]
async fn test_pageview_creates_then_bumps_definition() {
    let tmp = TempDir::new().unwrap();
    let store: Arc<dyn PropertyDefinitionStore> =
        Arc::new(SqliteStore::open(&tmp.path().join("propdefs.db")).unwrap());

    let p = pipeline(
        feed(vec![pageview_json()]).await,
        Arc::clone(&store),
        PluginRegistry::with_builtins(),
        json!({"teams": [{"team_id": 42}]}),
    );
    let stats = run_pool(Arc::clone(&p.ctx), 1).await.unwrap();
    assert_eq!(stats.forwarded, 1);

    let created = p.store.get(42, PropertyType::Event).unwrap().unwrap();
    assert_eq!(created.created_at, created.updated_at);
    let filter = created.decoded_filter().unwrap();
    assert_eq!(
        filter.kinds(&FilterKey::new("$browser")),
        Some(ValueKinds::STRING)
    );

    let forwarded = p.sink.events();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].event, "pageview");
    assert_eq!(forwarded[0].properties["$browser"], "Chrome");

    // Re-ingesting the same event only moves updated_at.
    tokio::time::sleep(Duration::from_millis(5)).await;
    let again = pipeline(
        feed(vec![pageview_json()]).await,
        Arc::clone(&store),
        PluginRegistry::with_builtins(),
        json!({"teams": [{"team_id": 42}]}),
    );
    run_pool(Arc::clone(&again.ctx), 1).await.unwrap();

    let bumped = store.get(42, PropertyType::Event).unwrap().unwrap();
    assert_eq!(bumped.created_at, created.created_at);
    assert!(bumped.updated_at > created.updated_at);
    assert_eq!(bumped.filter, created.filter);
}

/// Counts invocations so tests can prove plugins never ran.
struct Recorder(Arc<parking_lot::Mutex<usize>>);

#[async_trait]
impl Plugin for Recorder {
    fn id(&self) -> &str {
        "recorder"
    }

    async fn transform(
        &self,
        event: Event,
        _ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        *self.0.lock() += 1;
        Ok(PluginOutcome::Continue(event))
    }
}

#[tokio::test]
async fn test_missing_team_is_dead_lettered_before_plugins() {
    let calls = Arc::new(parking_lot::Mutex::new(0));
    let mut registry = PluginRegistry::with_builtins();
    registry.register(Arc::new(Recorder(Arc::clone(&calls))));

    let mut no_team = pageview_json();
    no_team.as_object_mut().unwrap().remove("team_id");

    let p = pipeline(
        feed(vec![no_team]).await,
        Arc::new(MemoryStore::new()),
        registry,
        json!({"teams": [{"team_id": 42, "plugins": [{"plugin": "recorder"}]}]}),
    );
    let stats = run_pool(Arc::clone(&p.ctx), 1).await.unwrap();

    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(*calls.lock(), 0);
    assert!(p.sink.events().is_empty());
    let letters = p.dead_letters.letters();
    assert_eq!(letters[0].reason, DeadLetterReason::Validation);
    assert!(letters[0].error.contains("team_id"));
    assert!(p.store.list_for_team(42).unwrap().is_empty());
}

struct NeverFinishes;

#[async_trait]
impl Plugin for NeverFinishes {
    fn id(&self) -> &str {
        "never-finishes"
    }

    async fn transform(
        &self,
        event: Event,
        _ctx: &PluginContext,
    ) -> Result<PluginOutcome, PluginExecutionError> {
        std::future::pending::<()>().await;
        Ok(PluginOutcome::Continue(event))
    }
}

#[tokio::test]
async fn test_timing_out_plugin_fails_once_per_event_and_event_survives() {
    let mut registry = PluginRegistry::with_builtins();
    registry.register(Arc::new(NeverFinishes));

    let p = pipeline(
        feed(vec![pageview_json(), pageview_json(), pageview_json()]).await,
        Arc::new(MemoryStore::new()),
        registry,
        json!({"teams": [{"team_id": 42, "plugins": [{"plugin": "never-finishes"}]}]}),
    );
    let stats = run_pool(Arc::clone(&p.ctx), 2).await.unwrap();

    assert_eq!(stats.plugin_failures, 3);
    assert_eq!(stats.forwarded, 3);
    for event in p.sink.events() {
        assert_eq!(event.properties["$browser"], "Chrome");
    }
}

#[tokio::test]
async fn test_chain_transforms_in_order() {
    let p = pipeline(
        feed(vec![json!({
            "team_id": 42,
            "event": "User Signed Up",
            "timestamp": "2024-01-01T00:00:00Z",
            "properties": {"$ip": "1.2.3.4", "plan": {"tier": "pro"}}
        })])
        .await,
        Arc::new(MemoryStore::new()),
        PluginRegistry::with_builtins(),
        json!({"teams": [{"team_id": 42, "plugins": [
            {"plugin": "property-filter", "config": {"properties": ["$ip"]}},
            {"plugin": "flatten-properties"},
            {"plugin": "taxonomy", "config": {"style": "snake_case"}}
        ]}]}),
    );
    run_pool(Arc::clone(&p.ctx), 1).await.unwrap();

    let events = p.sink.events();
    assert_eq!(events[0].event, "user_signed_up");
    assert!(!events[0].properties.contains_key("$ip"));
    assert_eq!(events[0].properties["plan__tier"], "pro");

    // The resolver sees the transformed event.
    let filter = p
        .store
        .get(42, PropertyType::Event)
        .unwrap()
        .unwrap()
        .decoded_filter()
        .unwrap();
    assert!(filter.contains(&FilterKey::new("plan__tier")));
    assert!(!filter.contains(&FilterKey::new("$ip")));
}

fn sample_event() -> Event {
    Event::new(42, "purchase", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        .with_property("cart", json!({"total": 10, "items": {"sku": "a1"}}))
        .with_property("Order Placed", true)
}

#[tokio::test]
async fn test_empty_chain_leaves_event_unchanged() {
    let executor = PluginExecutor::new(
        Arc::new(PluginRegistry::with_builtins()),
        Duration::from_secs(1),
    );

    let unchanged = executor.run(sample_event(), &[]).await;
    assert_eq!(unchanged.result, ChainResult::Forward(sample_event()));
    assert!(unchanged.failures.is_empty());
}

fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,6}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..3).prop_map(Value::from),
            proptest::collection::btree_map("[a-zA-Z_$]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

fn event_name() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9 _$.-]{0,24}",
        "([A-Z]?[a-z]{0,3}[ _-]?){0,6}",
        ".{0,16}",
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_idempotent_builtins_applied_twice_equal_once(
        name in event_name(),
        properties in proptest::collection::btree_map("[a-zA-Z_$]{1,8}", json_value(), 0..6),
        set in proptest::collection::btree_map("[a-z]{1,4}", json_value(), 0..3),
        style in prop_oneof![
            Just("camelCase"),
            Just("PascalCase"),
            Just("snake_case"),
            Just("kebab-case"),
            Just("spaces"),
        ],
        separator in prop_oneof![Just("__"), Just("."), Just("/")],
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let registry = Arc::new(PluginRegistry::with_builtins());
        let executor = PluginExecutor::new(Arc::clone(&registry), Duration::from_secs(1));

        let mut event = Event::new(42, name, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        for (key, value) in properties {
            event = event.with_property(key, value);
        }
        let config = json!({
            "style": style,
            "separator": separator,
            "properties": Value::Object(set.into_iter().collect()),
        });

        for id in registry.ids() {
            let idempotent = registry.get(id).is_some_and(|p| p.is_idempotent());
            if !idempotent {
                continue;
            }
            let entry = PluginConfig::new(id, config.clone());
            let twice = [entry.clone(), entry.clone()];

            let (once, double) = runtime.block_on(async {
                (
                    executor.run(event.clone(), std::slice::from_ref(&entry)).await,
                    executor.run(event.clone(), &twice).await,
                )
            });
            prop_assert!(once.failures.is_empty(), "{} failed: {:?}", id, once.failures);
            prop_assert_eq!(once.result, double.result, "{} is not idempotent", id);
        }
    }
}

#[tokio::test]
async fn test_spool_to_topic_files() {
    let tmp = TempDir::new().unwrap();
    let topic_dir = tmp.path().join("events_plugin_ingestion");
    std::fs::create_dir_all(&topic_dir).unwrap();
    std::fs::write(
        topic_dir.join("000.jsonl"),
        format!("{}\nnot json\n", pageview_json()),
    )
    .unwrap();

    let queue = Arc::new(
        SpoolQueue::open(&[tmp.path().to_path_buf()], "events_plugin_ingestion").unwrap(),
    );
    let sink = Arc::new(TopicWriter::open(tmp.path(), "events_processed").unwrap());
    let dead = Arc::new(TopicWriter::open(tmp.path(), "events_dead_letter").unwrap());

    let mut p = pipeline(
        queue,
        Arc::new(MemoryStore::new()),
        PluginRegistry::with_builtins(),
        json!({"teams": [{"team_id": 42}]}),
    );
    {
        let ctx = Arc::get_mut(&mut p.ctx).unwrap();
        ctx.sink = sink.clone();
        ctx.dead_letters = dead.clone();
    }
    let stats = run_pool(Arc::clone(&p.ctx), 2).await.unwrap();
    assert_eq!(stats.received, 2);

    let processed = std::fs::read_to_string(sink.path()).unwrap();
    assert_eq!(processed.lines().count(), 1);
    let dead_letters = std::fs::read_to_string(dead.path()).unwrap();
    let letter: Value = serde_json::from_str(dead_letters.lines().next().unwrap()).unwrap();
    assert_eq!(letter["reason"], "decode");
    assert_eq!(letter["payload"], "not json");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolution_matches_sequential() {
    let tmp = TempDir::new().unwrap();
    let events: Vec<Event> = (0..40)
        .map(|i| {
            Event::new(42, "e", Utc::now())
                .with_property(format!("p{}", i % 13), i)
                .with_property("$set", json!({ format!("u{}", i % 5): "x" }))
        })
        .collect();

    let sequential = PropertyResolver::new(Arc::new(MemoryStore::new()));
    for e in &events {
        sequential.resolve(e).unwrap();
    }

    let concurrent_store: Arc<dyn PropertyDefinitionStore> =
        Arc::new(SqliteStore::open(&tmp.path().join("c.db")).unwrap());
    let concurrent =
        PropertyResolver::new(Arc::clone(&concurrent_store)).with_max_cas_attempts(64);
    let mut handles = Vec::new();
    for chunk in events.chunks(10) {
        let resolver = concurrent.clone();
        let chunk = chunk.to_vec();
        handles.push(tokio::task::spawn_blocking(move || {
            for e in &chunk {
                resolver.resolve(e).unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for prop_type in [PropertyType::Event, PropertyType::Person] {
        let a = sequential.store().get(42, prop_type).unwrap().unwrap();
        let b = concurrent_store.get(42, prop_type).unwrap().unwrap();
        assert_eq!(a.filter, b.filter, "{prop_type} filters diverged");
    }
}

proptest! {
    #[test]
    fn prop_resolution_order_does_not_matter(
        names in proptest::collection::vec("[a-z]{1,4}", 1..12),
        seed in any::<u64>(),
    ) {
        let events: Vec<Event> = names
            .iter()
            .map(|n| Event::new(1, "e", Utc::now()).with_property(n.clone(), 1))
            .collect();

        let mut shuffled = events.clone();
        let len = shuffled.len();
        for i in 0..len {
            let j = (seed.wrapping_mul(i as u64 + 1) as usize) % len;
            shuffled.swap(i, j);
        }

        let forward = PropertyResolver::new(Arc::new(MemoryStore::new()));
        let reordered = PropertyResolver::new(Arc::new(MemoryStore::new()));
        let mut first_outcome = None;
        for e in &events {
            let report = forward.resolve(e).unwrap();
            first_outcome.get_or_insert(report.get(PropertyType::Event));
        }
        for e in &shuffled {
            reordered.resolve(e).unwrap();
        }

        prop_assert_eq!(first_outcome, Some(Some(UpsertOutcome::Created)));
        let a = forward.store().get(1, PropertyType::Event).unwrap().unwrap();
        let b = reordered.store().get(1, PropertyType::Event).unwrap().unwrap();
        prop_assert_eq!(a.filter, b.filter);
    }
}
