use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::counter;
use uuid::Uuid;

use crate::aggregate::{AggregateRow, AggregateStore};
use crate::dupcheck::{fingerprint, DuplicateCheckHandle};
use crate::model::{
    Detection, DetectionSink, DetectionValue, EventRecord, LinkedEvent, RuleDefinition, StreamUnit,
};

/// Per-rule consumer of the records extracted from one stream. Built fresh
/// for each (rule, stream) pair; `end` is called once the stream's records
/// are exhausted.
pub trait RecordConsumer: Send {
    fn start(&mut self, stream: &StreamUnit) -> Result<()>;
    fn accept(&mut self, record: &EventRecord) -> Result<()>;
    fn end(&mut self) -> Result<()>;

    /// Events this consumer actually took, after resumption skipping.
    fn events_accepted(&self) -> u64;

    /// Highest event id fully handled so far, if any. Lets the executor
    /// record a mid-stream resumption point when the consumer fails.
    fn last_accepted_event_id(&self) -> Option<u64>;
}

/// Writes extracted records into the rule's aggregation store. Notification
/// firing happens later, over the store, once data has aged past the wait
/// threshold.
pub struct TableBuilderConsumer {
    store: Arc<AggregateStore>,
    /// Skip events below this id; set when resuming a partially consumed
    /// stream.
    min_event_id: Option<u64>,
    last_event_id: Option<u64>,
    events: u64,
}

impl TableBuilderConsumer {
    pub fn new(store: Arc<AggregateStore>, min_event_id: Option<u64>) -> Self {
        Self {
            store,
            min_event_id,
            last_event_id: None,
            events: 0,
        }
    }
}

impl RecordConsumer for TableBuilderConsumer {
    fn start(&mut self, _stream: &StreamUnit) -> Result<()> {
        Ok(())
    }

    fn accept(&mut self, record: &EventRecord) -> Result<()> {
        if let Some(min) = self.min_event_id {
            if record.event_id < min {
                return Ok(());
            }
        }
        self.store
            .put_row(&AggregateRow {
                stream_id: record.stream_id,
                event_id: Some(record.event_id),
                event_time_ms: record.event_time_ms,
                values: record.values.clone(),
            })
            .context("Failed to write aggregate row")?;
        self.last_event_id = Some(record.event_id);
        self.events += 1;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        Ok(())
    }

    fn events_accepted(&self) -> u64 {
        self.events
    }

    fn last_accepted_event_id(&self) -> Option<u64> {
        self.last_event_id
    }
}

/// Evaluates the rule's predicate per record and emits a detection on match,
/// optionally suppressed through the rule's duplicate-check store.
pub struct StreamingConsumer {
    rule: Arc<RuleDefinition>,
    sink: Arc<dyn DetectionSink>,
    dupcheck: Option<Arc<DuplicateCheckHandle>>,
    min_event_id: Option<u64>,
    last_event_id: Option<u64>,
    events: u64,
}

impl StreamingConsumer {
    pub fn new(
        rule: Arc<RuleDefinition>,
        sink: Arc<dyn DetectionSink>,
        dupcheck: Option<Arc<DuplicateCheckHandle>>,
        min_event_id: Option<u64>,
    ) -> Self {
        Self {
            rule,
            sink,
            dupcheck,
            min_event_id,
            last_event_id: None,
            events: 0,
        }
    }

    fn detection_for(&self, record: &EventRecord) -> Detection {
        Detection {
            detect_time_ms: Utc::now().timestamp_millis(),
            detector_name: self.rule.name.clone(),
            detector_uuid: self.rule.uuid,
            detector_version: self.rule.version.clone(),
            description: self.rule.description.clone(),
            unique_id: Uuid::new_v4(),
            values: record
                .values
                .iter()
                .map(|v| DetectionValue {
                    name: v.name.clone(),
                    value: v.value.clone(),
                })
                .collect(),
            linked_events: vec![LinkedEvent {
                stream_id: Some(record.stream_id),
                event_id: Some(record.event_id),
            }],
        }
    }
}

impl RecordConsumer for StreamingConsumer {
    fn start(&mut self, _stream: &StreamUnit) -> Result<()> {
        self.sink.start()
    }

    fn accept(&mut self, record: &EventRecord) -> Result<()> {
        if let Some(min) = self.min_event_id {
            if record.event_id < min {
                return Ok(());
            }
        }

        let matched = match &self.rule.kind {
            crate::model::RuleKind::Streaming { predicate } => {
                predicate.matches(&record.value_map())
            }
            _ => false,
        };
        if matched {
            let suppressed = match &self.dupcheck {
                Some(dupcheck) => {
                    let key = fingerprint(&record.values, &self.rule.suppression.key_columns);
                    !dupcheck.try_insert(key).context("Duplicate check failed")?
                }
                None => false,
            };
            if suppressed {
                counter!(crate::metrics_const::DETECTIONS_SUPPRESSED_COUNTER).increment(1);
            } else {
                counter!(crate::metrics_const::DETECTIONS_EMITTED_COUNTER).increment(1);
                self.sink.accept(self.detection_for(record))?;
            }
        }
        self.last_event_id = Some(record.event_id);
        self.events += 1;
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.sink.end()
    }

    fn events_accepted(&self) -> u64 {
        self.events
    }

    fn last_accepted_event_id(&self) -> Option<u64> {
        self.last_event_id
    }
}
