//! In-memory implementations of the engine's collaborator traits, for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    Detection, DetectionSink, EventRecord, FilterExpr, PipelineRef, RecordPipeline, RuleDefinition,
    RuleProvider, SourceCatalog, StreamStatus, StreamUnit,
};

/// Catalog backed by a vector of streams, filtered the way a real catalog
/// query would filter.
#[derive(Default)]
pub struct InMemoryCatalog {
    streams: Mutex<Vec<StreamUnit>>,
}

impl InMemoryCatalog {
    pub fn new(mut streams: Vec<StreamUnit>) -> Self {
        streams.sort_by_key(|s| s.id);
        Self {
            streams: Mutex::new(streams),
        }
    }

    pub fn push(&self, stream: StreamUnit) {
        let mut streams = self.streams.lock().unwrap();
        streams.push(stream);
        streams.sort_by_key(|s| s.id);
    }

    pub fn set_status(&self, stream_id: u64, status: StreamStatus) {
        let mut streams = self.streams.lock().unwrap();
        for stream in streams.iter_mut() {
            if stream.id == stream_id {
                stream.status = status;
            }
        }
    }
}

#[async_trait]
impl SourceCatalog for InMemoryCatalog {
    async fn find_streams(
        &self,
        filter: &FilterExpr,
        min_stream_id: u64,
        min_create_ms: Option<i64>,
        max_create_ms: Option<i64>,
        statuses: &[StreamStatus],
        limit: usize,
    ) -> Result<Vec<StreamUnit>> {
        let streams = self.streams.lock().unwrap();
        Ok(streams
            .iter()
            .filter(|s| s.id >= min_stream_id)
            .filter(|s| min_create_ms.is_none_or(|min| s.create_time_ms >= min))
            .filter(|s| max_create_ms.is_none_or(|max| s.create_time_ms <= max))
            .filter(|s| statuses.contains(&s.status))
            .filter(|s| filter.matches(&s.attribute_map()))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Provider over a fixed rule list; records which rules get disabled.
pub struct InMemoryRuleProvider {
    rules: Mutex<Vec<RuleDefinition>>,
    disabled: Mutex<Vec<Uuid>>,
}

impl InMemoryRuleProvider {
    pub fn new(rules: Vec<RuleDefinition>) -> Self {
        Self {
            rules: Mutex::new(rules),
            disabled: Mutex::new(Vec::new()),
        }
    }

    pub fn disabled(&self) -> Vec<Uuid> {
        self.disabled.lock().unwrap().clone()
    }
}

#[async_trait]
impl RuleProvider for InMemoryRuleProvider {
    async fn load_rules(&self) -> Result<Vec<RuleDefinition>> {
        Ok(self.rules.lock().unwrap().clone())
    }

    async fn disable_process(&self, rule_uuid: Uuid) -> Result<()> {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if rule.uuid == rule_uuid {
                rule.process.enabled = false;
            }
        }
        self.disabled.lock().unwrap().push(rule_uuid);
        Ok(())
    }
}

/// Pipeline backed by a map from stream id to pre-extracted records.
#[derive(Default)]
pub struct MapPipeline {
    records: HashMap<u64, Vec<EventRecord>>,
    failing: Vec<u64>,
}

impl MapPipeline {
    pub fn new(records: HashMap<u64, Vec<EventRecord>>) -> Self {
        Self {
            records,
            failing: Vec::new(),
        }
    }

    pub fn failing_on(mut self, stream_id: u64) -> Self {
        self.failing.push(stream_id);
        self
    }
}

#[async_trait]
impl RecordPipeline for MapPipeline {
    async fn process(
        &self,
        stream: &StreamUnit,
        _pipeline: &PipelineRef,
    ) -> Result<Vec<EventRecord>> {
        if self.failing.contains(&stream.id) {
            return Err(anyhow!("pipeline failure on stream {}", stream.id));
        }
        Ok(self.records.get(&stream.id).cloned().unwrap_or_default())
    }
}

/// Sink that collects accepted detections; can be told to fail, either on
/// every accept or once a number of detections have landed.
#[derive(Default)]
pub struct CollectingSink {
    detections: Mutex<Vec<Detection>>,
    fail_after: Mutex<Option<usize>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail_after.lock().unwrap() = if fail { Some(0) } else { None };
    }

    pub fn fail_after(&self, accepted: usize) {
        *self.fail_after.lock().unwrap() = Some(accepted);
    }

    pub fn detections(&self) -> Vec<Detection> {
        self.detections.lock().unwrap().clone()
    }
}

impl DetectionSink for CollectingSink {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn accept(&self, detection: Detection) -> Result<()> {
        let mut detections = self.detections.lock().unwrap();
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if detections.len() >= limit {
                return Err(anyhow!("sink failure"));
            }
        }
        detections.push(detection);
        Ok(())
    }

    fn end(&self) -> Result<()> {
        Ok(())
    }
}

pub fn stream(id: u64, feed: &str, create_time_ms: i64) -> StreamUnit {
    StreamUnit {
        id,
        feed: feed.to_string(),
        create_time_ms,
        status: StreamStatus::Unlocked,
        attributes: HashMap::new(),
    }
}

pub fn record(stream_id: u64, event_id: u64, event_time_ms: i64, pairs: &[(&str, &str)]) -> EventRecord {
    EventRecord {
        stream_id,
        event_id,
        event_time_ms,
        values: pairs
            .iter()
            .map(|(name, value)| crate::model::FieldValue {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect(),
    }
}
