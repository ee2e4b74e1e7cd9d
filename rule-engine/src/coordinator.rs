use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::aggregate::AggregateStoreManager;
use crate::config::Config;
use crate::dupcheck::DuplicateCheckStores;
use crate::executor::{execute_batch, ActiveRule, ExecutionStatus};
use crate::metrics_const::{
    BATCH_SIZE_HISTOGRAM, EVALUATION_PASSES_COUNTER, PASS_DURATION_HISTOGRAM,
};
use crate::model::{
    DetectionSink, RecordPipeline, RuleDefinition, RuleProvider, SourceCatalog,
};
use crate::notifier::evaluate_notifications;
use crate::planner::{plan_batch, PlanEntry};
use crate::tracker::TrackerStore;

/// The engine's external collaborators.
pub struct EngineContext {
    pub provider: Arc<dyn RuleProvider>,
    pub catalog: Arc<dyn SourceCatalog>,
    pub pipeline: Arc<dyn RecordPipeline>,
    pub sink: Arc<dyn DetectionSink>,
}

/// Drives evaluation passes: loads rules, groups them by pipeline, plans and
/// executes batches per group until every group reports complete, then fires
/// notifications and persists trackers.
pub struct Coordinator {
    config: Config,
    context: EngineContext,
    trackers: TrackerStore,
    aggregates: AggregateStoreManager,
    dupchecks: DuplicateCheckStores,
}

impl Coordinator {
    pub fn new(config: Config, context: EngineContext) -> Result<Self> {
        let trackers =
            TrackerStore::open(&config.tracker_dir()).context("Failed to open tracker store")?;
        let aggregates = AggregateStoreManager::new(config.aggregate_store_dir());
        let dupchecks = DuplicateCheckStores::new(
            config.duplicate_check_dir(),
            config.dedup_max_puts_before_commit,
            config.dedup_commit_interval(),
        );
        Ok(Self {
            config,
            context,
            trackers,
            aggregates,
            dupchecks,
        })
    }

    /// Run evaluation passes until cancelled, sleeping the configured
    /// interval between passes.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            interval = ?self.config.evaluation_interval(),
            "Starting rule evaluation loop"
        );
        loop {
            if cancel.is_cancelled() {
                info!("Evaluation loop cancelled");
                return Ok(());
            }
            if let Err(e) = self.evaluate_once(&cancel).await {
                error!(error = ?e, "Evaluation pass failed");
            }
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Evaluation loop cancelled");
                    return Ok(());
                }
                () = tokio::time::sleep(self.config.evaluation_interval()) => {}
            }
        }
    }

    /// One full evaluation: reload rules, garbage-collect stores, then repeat
    /// batch passes until every pipeline group reports no further streams.
    /// Rules are re-read from the provider between passes so a rule disabled
    /// mid-evaluation (a failing notification) drops out immediately.
    pub async fn evaluate_once(&self, cancel: &CancellationToken) -> Result<()> {
        let start = Instant::now();
        let mut rules = self
            .context
            .provider
            .load_rules()
            .await
            .context("Failed to load rules")?;

        self.garbage_collect(&rules);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let eligible = self.eligible_rules(rules);
            if eligible.is_empty() {
                break;
            }
            counter!(EVALUATION_PASSES_COUNTER).increment(1);
            if self.process_pass(&eligible, cancel).await? {
                break;
            }
            rules = self
                .context
                .provider
                .load_rules()
                .await
                .context("Failed to load rules")?;
        }

        histogram!(PASS_DURATION_HISTOGRAM).record(start.elapsed().as_secs_f64());
        Ok(())
    }

    fn eligible_rules(&self, rules: Vec<RuleDefinition>) -> Vec<Arc<RuleDefinition>> {
        rules
            .into_iter()
            .filter(|rule| rule.process.enabled)
            .filter(|rule| match &rule.process.node {
                Some(node) => self.config.node_name.as_deref() == Some(node.as_str()),
                None => true,
            })
            .map(Arc::new)
            .collect()
    }

    /// Drop on-disk state belonging to rules that no longer exist. Errors are
    /// logged; a failed delete is retried on the next pass.
    fn garbage_collect(&self, rules: &[RuleDefinition]) {
        if let Err(e) = self.aggregates.delete_old_stores(rules) {
            warn!(error = ?e, "Aggregate store cleanup failed");
        }
        if let Err(e) = self.dupchecks.delete_old_stores(rules) {
            warn!(error = ?e, "Duplicate check store cleanup failed");
        }
    }

    /// One batch pass over all pipeline groups. Returns true when every group
    /// reported a complete (under-sized) batch.
    async fn process_pass(
        &self,
        rules: &[Arc<RuleDefinition>],
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut groups: HashMap<Uuid, Vec<Arc<RuleDefinition>>> = HashMap::new();
        for rule in rules {
            groups
                .entry(rule.pipeline.uuid)
                .or_default()
                .push(rule.clone());
        }

        let results: Vec<bool> = futures::stream::iter(groups.into_values())
            .map(|group| self.process_group(group, cancel))
            .buffer_unordered(self.config.worker_threads.max(1))
            .collect()
            .await;
        Ok(results.into_iter().all(|complete| complete))
    }

    /// Plan and execute one batch for the rules sharing a pipeline, then
    /// evaluate notifications and persist trackers. Failures end the group's
    /// participation in this evaluation; state already persisted keeps the
    /// retry safe.
    async fn process_group(
        &self,
        group: Vec<Arc<RuleDefinition>>,
        cancel: &CancellationToken,
    ) -> bool {
        match self.try_process_group(group, cancel).await {
            Ok(complete) => complete,
            Err(e) => {
                error!(error = ?e, "Pipeline group failed, will retry next evaluation");
                true
            }
        }
    }

    async fn try_process_group(
        &self,
        group: Vec<Arc<RuleDefinition>>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut active = Vec::with_capacity(group.len());
        for definition in group {
            let mut tracker = self.trackers.get(definition.uuid)?;
            tracker.poll_count += 1;

            let aggregate = if definition.kind.aggregates() {
                Some(self.aggregates.get_or_create(&definition)?)
            } else {
                None
            };
            let dupcheck = if definition.suppression.enabled {
                Some(self.dupchecks.get_or_create(&definition)?)
            } else {
                None
            };
            active.push(ActiveRule {
                definition,
                tracker,
                aggregate,
                dupcheck,
                failed: false,
            });
        }

        let positions: Vec<(Option<u64>, Option<u64>)> = active
            .iter()
            .map(|rule| (rule.tracker.last_stream_id, rule.tracker.last_event_id))
            .collect();

        let entries: Vec<PlanEntry<'_>> = active
            .iter()
            .map(|rule| PlanEntry {
                filter: &rule.definition.filter,
                next_stream_id: rule.tracker.next_stream_id(),
                min_create_ms: rule.definition.process.min_stream_create_ms,
                max_create_ms: rule.definition.process.max_stream_create_ms,
            })
            .collect();
        let plan = plan_batch(
            self.context.catalog.as_ref(),
            &entries,
            self.config.max_batch_size,
        )
        .await?;
        drop(entries);
        histogram!(BATCH_SIZE_HISTOGRAM).record(plan.streams.len() as f64);

        let execute_result = execute_batch(
            &plan.streams,
            &mut active,
            self.context.pipeline.as_ref(),
            &self.context.sink,
            cancel,
        )
        .await;

        let now_ms = Utc::now().timestamp_millis();
        for rule in &mut active {
            if matches!(execute_result, Ok(ExecutionStatus::Completed)) && !rule.failed {
                if let Err(e) =
                    evaluate_notifications(rule, &self.context.sink, self.context.provider.as_ref(), now_ms)
                        .await
                {
                    error!(
                        rule = %rule.definition.identity(),
                        error = ?e,
                        "Notification evaluation failed"
                    );
                    rule.tracker.message = Some(format!("Notification evaluation failed: {e:#}"));
                }
            }
            self.trackers.update(&rule.tracker);
            if let Some(dupcheck) = &rule.dupcheck {
                if let Err(e) = dupcheck.flush() {
                    warn!(
                        rule = %rule.definition.identity(),
                        error = ?e,
                        "Duplicate check flush failed"
                    );
                }
            }
        }
        let status = execute_result?;

        // A full batch that advanced no rule would replan identically forever,
        // e.g. a rule parked on its first stream each pass. End the group's
        // evaluation and retry at the next one.
        let advanced = active
            .iter()
            .zip(&positions)
            .any(|(rule, before)| {
                (rule.tracker.last_stream_id, rule.tracker.last_event_id) != *before
            });
        if !plan.complete && status == ExecutionStatus::Completed && !advanced {
            warn!("Batch made no progress, ending the group's evaluation");
            return Ok(true);
        }

        // A stopped batch counts as complete for this evaluation: the blocker
        // (a locked stream or shutdown) will not clear within this pass.
        Ok(plan.complete || status == ExecutionStatus::Stopped)
    }

    pub fn tracker_store(&self) -> &TrackerStore {
        &self.trackers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DuplicateSuppression, FilterExpr, FilterTerm, PipelineRef, ProcessConfig, RuleKind,
        TermCondition,
    };
    use crate::test_utils::{
        record, stream, CollectingSink, InMemoryCatalog, InMemoryRuleProvider, MapPipeline,
    };
    use tempfile::TempDir;

    fn config(dir: &TempDir, max_batch: usize) -> Config {
        let mut env = std::collections::HashMap::new();
        env.insert(
            "DATA_DIR".to_string(),
            dir.path().to_string_lossy().to_string(),
        );
        env.insert("MAX_BATCH_SIZE".to_string(), max_batch.to_string());
        envconfig::Envconfig::init_from_hashmap(&env).unwrap()
    }

    fn streaming_rule(feed: &str) -> RuleDefinition {
        RuleDefinition {
            uuid: Uuid::new_v4(),
            name: "r".to_string(),
            version: "1".to_string(),
            description: String::new(),
            pipeline: PipelineRef {
                uuid: Uuid::nil(),
                name: "p".to_string(),
            },
            filter: FilterExpr::new(vec![FilterTerm {
                field: "Feed".to_string(),
                condition: TermCondition::Equals,
                value: feed.to_string(),
            }]),
            process: ProcessConfig::default(),
            kind: RuleKind::Streaming {
                predicate: FilterExpr::new(vec![FilterTerm {
                    field: "outcome".to_string(),
                    condition: TermCondition::Equals,
                    value: "failure".to_string(),
                }]),
            },
            suppression: DuplicateSuppression::default(),
        }
    }

    #[tokio::test]
    async fn evaluation_processes_all_streams_and_persists_trackers() {
        let dir = TempDir::new().unwrap();
        let rule = streaming_rule("A");
        let rule_uuid = rule.uuid;

        let mut records = HashMap::new();
        for id in 1..=5u64 {
            records.insert(
                id,
                vec![record(id, 1, id as i64 * 1000, &[("outcome", "failure")])],
            );
        }

        let sink = Arc::new(CollectingSink::new());
        let context = EngineContext {
            provider: Arc::new(InMemoryRuleProvider::new(vec![rule])),
            catalog: Arc::new(InMemoryCatalog::new(
                (1..=5).map(|id| stream(id, "A", 0)).collect(),
            )),
            pipeline: Arc::new(MapPipeline::new(records)),
            sink: sink.clone(),
        };
        // Batch size 2 forces multiple passes before completion.
        let coordinator = Coordinator::new(config(&dir, 2), context).unwrap();

        coordinator
            .evaluate_once(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sink.detections().len(), 5);
        let tracker = coordinator.tracker_store().get(rule_uuid).unwrap();
        assert_eq!(tracker.last_stream_id, Some(5));
        assert_eq!(tracker.stream_count, 5);
        assert!(tracker.poll_count >= 3);
    }

    #[tokio::test]
    async fn replanning_after_restart_does_not_reprocess() {
        let dir = TempDir::new().unwrap();
        let rule = streaming_rule("A");

        let mut records = HashMap::new();
        records.insert(1, vec![record(1, 1, 1000, &[("outcome", "failure")])]);

        let sink = Arc::new(CollectingSink::new());
        let make_context = |sink: Arc<CollectingSink>| EngineContext {
            provider: Arc::new(InMemoryRuleProvider::new(vec![rule.clone()])),
            catalog: Arc::new(InMemoryCatalog::new(vec![stream(1, "A", 0)])),
            pipeline: Arc::new(MapPipeline::new(records.clone())),
            sink,
        };

        {
            let coordinator =
                Coordinator::new(config(&dir, 100), make_context(sink.clone())).unwrap();
            coordinator
                .evaluate_once(&CancellationToken::new())
                .await
                .unwrap();
        }
        assert_eq!(sink.detections().len(), 1);

        // Same data dir, fresh coordinator: watermark survives, nothing is
        // replayed.
        let coordinator = Coordinator::new(config(&dir, 100), make_context(sink.clone())).unwrap();
        coordinator
            .evaluate_once(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sink.detections().len(), 1);
    }

    #[tokio::test]
    async fn persistent_rule_failure_does_not_spin_the_evaluation() {
        let dir = TempDir::new().unwrap();
        let rule = streaming_rule("A");
        let rule_uuid = rule.uuid;

        let mut records = HashMap::new();
        for id in 1..=4u64 {
            records.insert(
                id,
                vec![record(id, 1, id as i64 * 1000, &[("outcome", "failure")])],
            );
        }

        let sink = Arc::new(CollectingSink::new());
        sink.set_failing(true);
        let context = EngineContext {
            provider: Arc::new(InMemoryRuleProvider::new(vec![rule])),
            catalog: Arc::new(InMemoryCatalog::new(
                (1..=4).map(|id| stream(id, "A", 0)).collect(),
            )),
            pipeline: Arc::new(MapPipeline::new(records)),
            sink: sink.clone(),
        };
        // Backlog larger than the batch, so an unadvanced tracker would
        // replan the same batch indefinitely.
        let coordinator = Coordinator::new(config(&dir, 2), context).unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            coordinator.evaluate_once(&CancellationToken::new()),
        )
        .await
        .expect("evaluation must terminate")
        .unwrap();

        assert!(sink.detections().is_empty());
        let tracker = coordinator.tracker_store().get(rule_uuid).unwrap();
        assert_eq!(tracker.last_stream_id, None);
        assert!(tracker.message.as_deref().unwrap().contains("Error on stream"));
    }

    #[tokio::test]
    async fn rule_disabled_mid_evaluation_is_dropped_from_later_passes() {
        let dir = TempDir::new().unwrap();
        let mut rule = streaming_rule("A");
        rule.kind = RuleKind::TableBuilder {
            component_id: "t".to_string(),
        };
        let rule_uuid = rule.uuid;

        // Stream 1's event sits two hours behind stream 2's, so the first
        // batch already has a row aged past the one-hour default wait and the
        // first pass fires a notification window.
        let base = 1_700_000_000_000i64;
        let hour_ms = 60 * 60 * 1000i64;
        let mut records = HashMap::new();
        records.insert(1, vec![record(1, 1, base, &[("outcome", "failure")])]);
        for id in 2..=4u64 {
            records.insert(
                id,
                vec![record(id, 1, base + 2 * hour_ms + id as i64, &[("outcome", "failure")])],
            );
        }

        let sink = Arc::new(CollectingSink::new());
        sink.set_failing(true);
        let provider = Arc::new(InMemoryRuleProvider::new(vec![rule]));
        let context = EngineContext {
            provider: provider.clone(),
            catalog: Arc::new(InMemoryCatalog::new(
                (1..=4).map(|id| stream(id, "A", 0)).collect(),
            )),
            pipeline: Arc::new(MapPipeline::new(records)),
            sink: sink.clone(),
        };
        let coordinator = Coordinator::new(config(&dir, 2), context).unwrap();

        coordinator
            .evaluate_once(&CancellationToken::new())
            .await
            .unwrap();

        // The failing notification disables the rule after the first pass;
        // the reload keeps it out of the rest of the evaluation.
        assert_eq!(provider.disabled(), vec![rule_uuid]);
        let tracker = coordinator.tracker_store().get(rule_uuid).unwrap();
        assert_eq!(tracker.poll_count, 1);
    }

    #[tokio::test]
    async fn disabled_rules_are_not_evaluated() {
        let dir = TempDir::new().unwrap();
        let mut rule = streaming_rule("A");
        rule.process.enabled = false;

        let mut records = HashMap::new();
        records.insert(1, vec![record(1, 1, 1000, &[("outcome", "failure")])]);
        let sink = Arc::new(CollectingSink::new());
        let context = EngineContext {
            provider: Arc::new(InMemoryRuleProvider::new(vec![rule])),
            catalog: Arc::new(InMemoryCatalog::new(vec![stream(1, "A", 0)])),
            pipeline: Arc::new(MapPipeline::new(records)),
            sink: sink.clone(),
        };
        let coordinator = Coordinator::new(config(&dir, 100), context).unwrap();

        coordinator
            .evaluate_once(&CancellationToken::new())
            .await
            .unwrap();
        assert!(sink.detections().is_empty());
    }

    #[tokio::test]
    async fn node_affinity_is_honored() {
        let dir = TempDir::new().unwrap();
        let mut rule = streaming_rule("A");
        rule.process.node = Some("other-node".to_string());

        let mut records = HashMap::new();
        records.insert(1, vec![record(1, 1, 1000, &[("outcome", "failure")])]);
        let sink = Arc::new(CollectingSink::new());
        let context = EngineContext {
            provider: Arc::new(InMemoryRuleProvider::new(vec![rule])),
            catalog: Arc::new(InMemoryCatalog::new(vec![stream(1, "A", 0)])),
            pipeline: Arc::new(MapPipeline::new(records)),
            sink: sink.clone(),
        };
        let coordinator = Coordinator::new(config(&dir, 100), context).unwrap();

        coordinator
            .evaluate_once(&CancellationToken::new())
            .await
            .unwrap();
        assert!(sink.detections().is_empty());
    }
}
