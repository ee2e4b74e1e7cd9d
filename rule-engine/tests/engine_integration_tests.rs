//! End-to-end tests running full evaluation passes through the coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use envconfig::Envconfig;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use rule_engine::config::Config;
use rule_engine::coordinator::{Coordinator, EngineContext};
use rule_engine::model::{
    DuplicateSuppression, FilterExpr, FilterTerm, PipelineRef, ProcessConfig, RuleDefinition,
    RuleKind, TermCondition,
};
use rule_engine::test_utils::{
    record, stream, CollectingSink, InMemoryCatalog, InMemoryRuleProvider, MapPipeline,
};

const MINUTE_MS: i64 = 60 * 1000;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;
const NOW_MS: i64 = 1_700_000_000_000;

fn config(dir: &TempDir, max_batch: usize) -> Config {
    let mut env = HashMap::new();
    env.insert(
        "DATA_DIR".to_string(),
        dir.path().to_string_lossy().to_string(),
    );
    env.insert("MAX_BATCH_SIZE".to_string(), max_batch.to_string());
    Config::init_from_hashmap(&env).unwrap()
}

fn feed_filter(feed: &str) -> FilterExpr {
    FilterExpr::new(vec![FilterTerm {
        field: "Feed".to_string(),
        condition: TermCondition::Equals,
        value: feed.to_string(),
    }])
}

fn base_rule(feed: &str, kind: RuleKind) -> RuleDefinition {
    RuleDefinition {
        uuid: Uuid::new_v4(),
        name: "rule".to_string(),
        version: "1".to_string(),
        description: String::new(),
        pipeline: PipelineRef {
            uuid: Uuid::nil(),
            name: "pipeline".to_string(),
        },
        filter: feed_filter(feed),
        process: ProcessConfig::default(),
        kind,
        suppression: DuplicateSuppression::default(),
    }
}

fn table_rule(feed: &str, wait_ms: i64, retention_ms: Option<i64>) -> RuleDefinition {
    let mut rule = base_rule(
        feed,
        RuleKind::TableBuilder {
            component_id: "table".to_string(),
        },
    );
    rule.process.time_to_wait_for_data_ms = wait_ms;
    rule.process.data_retention_ms = retention_ms;
    rule
}

fn streaming_rule(feed: &str) -> RuleDefinition {
    base_rule(
        feed,
        RuleKind::Streaming {
            predicate: FilterExpr::new(vec![FilterTerm {
                field: "outcome".to_string(),
                condition: TermCondition::Equals,
                value: "failure".to_string(),
            }]),
        },
    )
}

struct Harness {
    _data_dir: TempDir,
    sink: Arc<CollectingSink>,
    provider: Arc<InMemoryRuleProvider>,
    catalog: Arc<InMemoryCatalog>,
    coordinator: Coordinator,
}

fn harness(
    rules: Vec<RuleDefinition>,
    streams: Vec<rule_engine::model::StreamUnit>,
    records: HashMap<u64, Vec<rule_engine::model::EventRecord>>,
    max_batch: usize,
) -> Harness {
    let data_dir = TempDir::new().unwrap();
    let sink = Arc::new(CollectingSink::new());
    let provider = Arc::new(InMemoryRuleProvider::new(rules));
    let catalog = Arc::new(InMemoryCatalog::new(streams));
    let context = EngineContext {
        provider: provider.clone(),
        catalog: catalog.clone(),
        pipeline: Arc::new(MapPipeline::new(records)),
        sink: sink.clone(),
    };
    let coordinator = Coordinator::new(config(&data_dir, max_batch), context).unwrap();
    Harness {
        _data_dir: data_dir,
        sink,
        provider,
        catalog,
        coordinator,
    }
}

async fn evaluate(harness: &Harness) {
    harness
        .coordinator
        .evaluate_once(&CancellationToken::new())
        .await
        .unwrap();
}

#[tokio::test]
async fn watermarks_advance_monotonically_across_evaluations() {
    let rule = streaming_rule("A");
    let rule_uuid = rule.uuid;
    let mut records = HashMap::new();
    for id in 1..=4u64 {
        records.insert(id, vec![record(id, 1, 0, &[("outcome", "failure")])]);
    }
    let h = harness(
        vec![rule],
        (1..=4).map(|id| stream(id, "A", 0)).collect(),
        records,
        100,
    );

    evaluate(&h).await;
    let first = h.coordinator.tracker_store().get(rule_uuid).unwrap();
    assert_eq!(first.last_stream_id, Some(4));

    // New streams arrive; the watermark only moves forward.
    h.catalog.push(stream(5, "A", 0));
    evaluate(&h).await;
    let second = h.coordinator.tracker_store().get(rule_uuid).unwrap();
    assert_eq!(second.last_stream_id, Some(5));
    assert!(second.next_stream_id() > first.next_stream_id());
    assert_eq!(h.sink.detections().len(), 4);
}

#[tokio::test]
async fn small_batches_drain_everything_without_reprocessing() {
    let rule = streaming_rule("A");
    let rule_uuid = rule.uuid;
    let mut records = HashMap::new();
    for id in 1..=9u64 {
        records.insert(id, vec![record(id, 1, 0, &[("outcome", "failure")])]);
    }
    // Batch size 3 forces several planning rounds in one evaluation.
    let h = harness(
        vec![rule],
        (1..=9).map(|id| stream(id, "A", 0)).collect(),
        records,
        3,
    );

    evaluate(&h).await;

    assert_eq!(h.sink.detections().len(), 9);
    let tracker = h.coordinator.tracker_store().get(rule_uuid).unwrap();
    assert_eq!(tracker.stream_count, 9);
    assert!(tracker.poll_count >= 3);

    // Replanning the same catalog is a no-op.
    evaluate(&h).await;
    assert_eq!(h.sink.detections().len(), 9);
    assert_eq!(
        h.coordinator.tracker_store().get(rule_uuid).unwrap().stream_count,
        9
    );
}

#[tokio::test]
async fn rules_sharing_a_filter_are_planned_together_but_tracked_separately() {
    let rule_a = streaming_rule("A");
    let rule_b = streaming_rule("A");
    let (uuid_a, uuid_b) = (rule_a.uuid, rule_b.uuid);
    let mut records = HashMap::new();
    for id in 1..=3u64 {
        records.insert(id, vec![record(id, 1, 0, &[("outcome", "failure")])]);
    }
    let h = harness(
        vec![rule_a, rule_b],
        (1..=3).map(|id| stream(id, "A", 0)).collect(),
        records,
        100,
    );

    evaluate(&h).await;

    // Both rules saw all three streams and each emitted its own detections.
    assert_eq!(h.sink.detections().len(), 6);
    for uuid in [uuid_a, uuid_b] {
        let tracker = h.coordinator.tracker_store().get(uuid).unwrap();
        assert_eq!(tracker.last_stream_id, Some(3));
        assert_eq!(tracker.stream_count, 3);
    }
}

#[tokio::test]
async fn windowed_notifications_fire_only_aged_rows() {
    let rule = table_rule("A", 5 * MINUTE_MS, None);
    let mut records = HashMap::new();
    records.insert(
        1,
        vec![
            record(1, 1, NOW_MS - 10 * MINUTE_MS, &[("user", "alice")]),
            record(1, 2, NOW_MS - 7 * MINUTE_MS, &[("user", "bob")]),
            record(1, 3, NOW_MS, &[("user", "carol")]),
        ],
    );
    let h = harness(vec![rule], vec![stream(1, "A", NOW_MS)], records, 100);

    evaluate(&h).await;

    // Firing trails the newest event by the five minute wait, so only the
    // rows older than that are delivered; the youngest waits for more data.
    // (The window end is measured from event time, not wall clock, so this
    // test is deterministic.)
    let detections = h.sink.detections();
    let users: Vec<String> = detections
        .iter()
        .flat_map(|d| d.values.iter())
        .filter(|v| v.name == "user")
        .map(|v| v.value.clone())
        .collect();
    assert_eq!(users, vec!["alice", "bob"]);

    // Nothing new fires until newer data moves the window forward.
    evaluate(&h).await;
    assert_eq!(h.sink.detections().len(), 2);
}

#[tokio::test]
async fn duplicate_suppression_holds_across_evaluations() {
    let mut rule = streaming_rule("A");
    rule.suppression = DuplicateSuppression {
        enabled: true,
        key_columns: vec!["user".to_string()],
    };
    let mut records = HashMap::new();
    records.insert(
        1,
        vec![record(1, 1, 0, &[("outcome", "failure"), ("user", "alice")])],
    );
    records.insert(
        2,
        vec![
            record(2, 1, 0, &[("outcome", "failure"), ("user", "alice")]),
            record(2, 2, 0, &[("outcome", "failure"), ("user", "bob")]),
        ],
    );
    let h = harness(
        vec![rule],
        vec![stream(1, "A", 0)],
        records,
        100,
    );

    evaluate(&h).await;
    assert_eq!(h.sink.detections().len(), 1);

    // A later stream repeats alice; only bob gets through.
    h.catalog.push(stream(2, "A", 0));
    evaluate(&h).await;
    let detections = h.sink.detections();
    assert_eq!(detections.len(), 2);
}

#[tokio::test]
async fn retention_prunes_aggregated_rows() {
    let rule = table_rule("A", 5 * MINUTE_MS, Some(DAY_MS));
    let rule_uuid = rule.uuid;
    let mut records = HashMap::new();
    records.insert(
        1,
        vec![
            record(1, 1, NOW_MS - 2 * DAY_MS, &[("user", "old")]),
            record(1, 2, NOW_MS - 10 * MINUTE_MS, &[("user", "recent")]),
            record(1, 3, NOW_MS, &[("user", "new")]),
        ],
    );
    let data_dir = TempDir::new().unwrap();
    let sink = Arc::new(CollectingSink::new());
    let context = EngineContext {
        provider: Arc::new(InMemoryRuleProvider::new(vec![rule.clone()])),
        catalog: Arc::new(InMemoryCatalog::new(vec![stream(1, "A", NOW_MS)])),
        pipeline: Arc::new(MapPipeline::new(records)),
        sink: sink.clone(),
    };
    let coordinator = Coordinator::new(config(&data_dir, 100), context).unwrap();

    coordinator
        .evaluate_once(&CancellationToken::new())
        .await
        .unwrap();

    // Both aged rows fired, then retention removed the one older than a day.
    assert_eq!(sink.detections().len(), 2);
    drop(coordinator);
    let store_path = data_dir
        .path()
        .join("aggregate-stores")
        .join(store_dir_name(rule_uuid, "table"));
    let store =
        rule_engine::aggregate::AggregateStore::open(&store_path, rule_uuid, "table").unwrap();
    let remaining = store.rows_in_window(0, i64::MAX).unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|r| r.event_time_ms >= NOW_MS - DAY_MS));
}

fn store_dir_name(rule_uuid: Uuid, component_id: &str) -> String {
    format!("{rule_uuid}_{component_id}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[tokio::test]
async fn removed_rules_lose_their_stores_and_restart_empty() {
    let keep = table_rule("A", 5 * MINUTE_MS, None);
    let remove = table_rule("A", 5 * MINUTE_MS, None);
    let removed_uuid = remove.uuid;
    let mut records = HashMap::new();
    records.insert(1, vec![record(1, 1, NOW_MS, &[("user", "alice")])]);

    let data_dir = TempDir::new().unwrap();
    let sink = Arc::new(CollectingSink::new());
    let store_dir = data_dir
        .path()
        .join("aggregate-stores")
        .join(store_dir_name(removed_uuid, "table"));

    {
        let context = EngineContext {
            provider: Arc::new(InMemoryRuleProvider::new(vec![
                keep.clone(),
                remove.clone(),
            ])),
            catalog: Arc::new(InMemoryCatalog::new(vec![stream(1, "A", NOW_MS)])),
            pipeline: Arc::new(MapPipeline::new(records.clone())),
            sink: sink.clone(),
        };
        let coordinator = Coordinator::new(config(&data_dir, 100), context).unwrap();
        coordinator
            .evaluate_once(&CancellationToken::new())
            .await
            .unwrap();
        assert!(store_dir.exists());
    }

    // Next evaluation with the rule gone garbage-collects its store.
    let context = EngineContext {
        provider: Arc::new(InMemoryRuleProvider::new(vec![keep])),
        catalog: Arc::new(InMemoryCatalog::new(vec![stream(1, "A", NOW_MS)])),
        pipeline: Arc::new(MapPipeline::new(records)),
        sink,
    };
    let coordinator = Coordinator::new(config(&data_dir, 100), context).unwrap();
    coordinator
        .evaluate_once(&CancellationToken::new())
        .await
        .unwrap();
    assert!(!store_dir.exists());

    // A recreated rule with the same uuid starts from an empty store.
    let store =
        rule_engine::aggregate::AggregateStore::open(&store_dir, removed_uuid, "table").unwrap();
    assert!(store.sync().unwrap().is_none());
}

#[tokio::test]
async fn notification_failure_disables_the_rule() {
    let rule = table_rule("A", 5 * MINUTE_MS, None);
    let rule_uuid = rule.uuid;
    let mut records = HashMap::new();
    records.insert(
        1,
        vec![
            record(1, 1, NOW_MS - 10 * MINUTE_MS, &[("user", "alice")]),
            record(1, 2, NOW_MS, &[("user", "bob")]),
        ],
    );
    let h = harness(vec![rule], vec![stream(1, "A", NOW_MS)], records, 100);

    h.sink.set_failing(true);
    evaluate(&h).await;

    assert_eq!(h.provider.disabled(), vec![rule_uuid]);
    let tracker = h.coordinator.tracker_store().get(rule_uuid).unwrap();
    assert!(tracker.message.as_deref().unwrap().contains("Notification failed"));
}
