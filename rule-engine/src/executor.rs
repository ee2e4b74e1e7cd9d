use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregate::AggregateStore;
use crate::consumer::{RecordConsumer, StreamingConsumer, TableBuilderConsumer};
use crate::dupcheck::DuplicateCheckHandle;
use crate::metrics_const::{
    EVENTS_CONSUMED_COUNTER, RULE_FAILURES_COUNTER, STREAMS_PROCESSED_COUNTER,
};
use crate::model::{
    DetectionSink, RecordPipeline, RuleDefinition, RuleKind, StreamStatus, StreamUnit,
};
use crate::tracker::RuleTracker;

pub const COMPLETE_FOR_NOW: &str = "Complete for now";

/// How a batch run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Every stream in the batch was visited.
    Completed,
    /// The batch stopped early at a locked stream or on cancellation; the
    /// remaining streams wait for a later evaluation.
    Stopped,
}

/// A rule loaded for one evaluation pass, with its tracker and any stores it
/// needs. Trackers are mutated in memory during the pass and persisted by the
/// coordinator afterwards.
pub struct ActiveRule {
    pub definition: Arc<RuleDefinition>,
    pub tracker: RuleTracker,
    pub aggregate: Option<Arc<AggregateStore>>,
    pub dupcheck: Option<Arc<DuplicateCheckHandle>>,
    /// Set when a consumer for this rule errors mid-pass; the rule takes no
    /// further streams until the next pass.
    pub failed: bool,
}

impl ActiveRule {
    /// Whether this rule should consume the given stream.
    fn wants(&self, stream: &StreamUnit) -> bool {
        if self.failed {
            return false;
        }
        if stream.id < self.tracker.next_stream_id() {
            return false;
        }
        let process = &self.definition.process;
        if process
            .min_stream_create_ms
            .is_some_and(|min| stream.create_time_ms < min)
        {
            return false;
        }
        if process
            .max_stream_create_ms
            .is_some_and(|max| stream.create_time_ms > max)
        {
            return false;
        }
        self.definition.filter.matches(&stream.attribute_map())
    }

    fn build_consumer(
        &self,
        stream: &StreamUnit,
        sink: &Arc<dyn DetectionSink>,
    ) -> Result<Box<dyn RecordConsumer>> {
        let min_event_id = self.tracker.min_event_id(stream.id);
        match &self.definition.kind {
            RuleKind::TableBuilder { .. } | RuleKind::Scheduled { .. } => {
                let store = self.aggregate.clone().with_context(|| {
                    format!(
                        "No aggregation store open for rule {}",
                        self.definition.identity()
                    )
                })?;
                Ok(Box::new(TableBuilderConsumer::new(store, min_event_id)))
            }
            RuleKind::Streaming { .. } => Ok(Box::new(StreamingConsumer::new(
                self.definition.clone(),
                sink.clone(),
                self.dupcheck.clone(),
                min_event_id,
            ))),
        }
    }
}

/// Run one planned batch of streams through the pipeline and fan each
/// stream's records out to every interested rule.
///
/// Streams are processed in id order. A locked stream ends the batch early
/// with a "complete for now" marker since later streams cannot be consumed
/// ahead of it without breaking watermark ordering. A pipeline failure aborts
/// the batch; watermarks for the failed stream are not advanced, so it is
/// retried on the next pass. A single rule's consumer failure parks only that
/// rule, keeping any mid-stream resumption point it reached.
///
/// Every rule in the slice must target the same pipeline; the coordinator
/// groups rules by pipeline uuid before calling this.
pub async fn execute_batch(
    streams: &[StreamUnit],
    rules: &mut [ActiveRule],
    pipeline_runner: &dyn RecordPipeline,
    sink: &Arc<dyn DetectionSink>,
    cancel: &CancellationToken,
) -> Result<ExecutionStatus> {
    debug_assert!(
        rules
            .windows(2)
            .all(|w| w[0].definition.pipeline.uuid == w[1].definition.pipeline.uuid),
        "execute_batch requires rules grouped by pipeline"
    );
    for stream in streams {
        if cancel.is_cancelled() {
            info!("Cancellation requested, stopping batch early");
            return Ok(ExecutionStatus::Stopped);
        }

        if stream.status == StreamStatus::Locked {
            debug!(stream = stream.id, "Hit locked stream, ending batch");
            for rule in rules.iter_mut().filter(|r| !r.failed) {
                rule.tracker.message = Some(COMPLETE_FOR_NOW.to_string());
            }
            return Ok(ExecutionStatus::Stopped);
        }

        let interested: Vec<usize> = rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.wants(stream))
            .map(|(i, _)| i)
            .collect();
        if interested.is_empty() {
            continue;
        }

        let pipeline = rules[interested[0]].definition.pipeline.clone();
        let records = pipeline_runner
            .process(stream, &pipeline)
            .await
            .with_context(|| format!("Pipeline failed on stream {}", stream.id))?;

        let max_event_time_ms = records.iter().map(|r| r.event_time_ms).max();

        let mut survivors: Vec<(usize, Box<dyn RecordConsumer>)> = Vec::new();
        'consumers: for i in interested {
            let mut consumer = match rules[i].build_consumer(stream, sink) {
                Ok(consumer) => consumer,
                Err(e) => {
                    park_rule(&mut rules[i], stream, &e);
                    continue 'consumers;
                }
            };
            if let Err(e) = consumer.start(stream) {
                park_rule(&mut rules[i], stream, &e);
                continue 'consumers;
            }
            for record in &records {
                if let Err(e) = consumer.accept(record) {
                    park_rule(&mut rules[i], stream, &e);
                    record_partial_progress(&mut rules[i], stream, consumer.as_ref());
                    continue 'consumers;
                }
            }
            if let Err(e) = consumer.end() {
                park_rule(&mut rules[i], stream, &e);
                record_partial_progress(&mut rules[i], stream, consumer.as_ref());
                continue 'consumers;
            }
            survivors.push((i, consumer));
        }

        for (i, consumer) in survivors {
            let rule = &mut rules[i];
            rule.tracker.last_stream_id = Some(stream.id);
            rule.tracker.last_event_id = None;
            rule.tracker.stream_count += 1;
            rule.tracker.event_count += consumer.events_accepted();
            if let Some(max) = max_event_time_ms {
                rule.tracker.last_event_time_ms =
                    Some(rule.tracker.last_event_time_ms.unwrap_or(i64::MIN).max(max));
            }
            if rule.tracker.message.as_deref() == Some(COMPLETE_FOR_NOW) {
                rule.tracker.message = None;
            }
            if let Some(store) = &rule.aggregate {
                store
                    .record_progress(stream.id, None)
                    .context("Failed to record aggregate progress")?;
            }
            counter!(EVENTS_CONSUMED_COUNTER).increment(consumer.events_accepted());
        }
        counter!(STREAMS_PROCESSED_COUNTER).increment(1);
    }
    Ok(ExecutionStatus::Completed)
}

/// Keep the event-id watermark a parked consumer reached so the next pass
/// revisits the stream from where it stopped instead of replaying it.
fn record_partial_progress(rule: &mut ActiveRule, stream: &StreamUnit, consumer: &dyn RecordConsumer) {
    let Some(event_id) = consumer.last_accepted_event_id() else {
        return;
    };
    rule.tracker.last_stream_id = Some(stream.id);
    rule.tracker.last_event_id = Some(event_id);
    rule.tracker.event_count += consumer.events_accepted();
    if let Some(store) = &rule.aggregate {
        if let Err(e) = store.record_progress(stream.id, Some(event_id)) {
            warn!(
                rule = %rule.definition.identity(),
                stream = stream.id,
                error = ?e,
                "Failed to record partial aggregate progress"
            );
        }
    }
}

fn park_rule(rule: &mut ActiveRule, stream: &StreamUnit, e: &anyhow::Error) {
    error!(
        rule = %rule.definition.identity(),
        stream = stream.id,
        error = ?e,
        "Rule failed while consuming stream, parking until next pass"
    );
    counter!(RULE_FAILURES_COUNTER).increment(1);
    rule.tracker.message = Some(format!("Error on stream {}: {e:#}", stream.id));
    rule.failed = true;
}
