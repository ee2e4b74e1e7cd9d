use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a stream unit in the source catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Unlocked,
    Locked,
    Deleted,
}

/// An immutable unit of source data. Produced by the source catalog and
/// consumed read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamUnit {
    pub id: u64,
    pub feed: String,
    pub create_time_ms: i64,
    pub status: StreamStatus,
    pub attributes: HashMap<String, String>,
}

impl StreamUnit {
    /// Attribute map used for cheap filter matching before the pipeline runs.
    /// The feed name and creation time are always present alongside any
    /// catalog-supplied attributes.
    pub fn attribute_map(&self) -> HashMap<String, String> {
        let mut map = self.attributes.clone();
        map.insert("Feed".to_string(), self.feed.clone());
        map.insert("Create Time".to_string(), self.create_time_ms.to_string());
        map
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TermCondition {
    Equals,
    NotEquals,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterTerm {
    pub field: String,
    pub condition: TermCondition,
    pub value: String,
}

impl FilterTerm {
    fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        let actual = attributes.get(&self.field).map(String::as_str);
        match self.condition {
            TermCondition::Equals => actual == Some(self.value.as_str()),
            TermCondition::NotEquals => actual != Some(self.value.as_str()),
            TermCondition::Contains => actual.is_some_and(|v| v.contains(&self.value)),
        }
    }
}

/// A conjunction of terms over stream attributes or record fields. Rules with
/// syntactically equal filters share one catalog query, so equality and
/// hashing are derived structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FilterExpr {
    pub terms: Vec<FilterTerm>,
}

impl FilterExpr {
    pub fn new(terms: Vec<FilterTerm>) -> Self {
        Self { terms }
    }

    pub fn has_terms(&self) -> bool {
        !self.terms.is_empty()
    }

    pub fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        self.terms.iter().all(|t| t.matches(attributes))
    }
}

/// Reference to an external transformation pipeline. Rules sharing a pipeline
/// are executed together so each stream is only replayed once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineRef {
    pub uuid: Uuid,
    pub name: String,
}

/// Per-rule processing configuration. Durations are stored as milliseconds so
/// the definition round-trips through serde without custom impls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub enabled: bool,
    /// Node affinity. `None` means any node may process the rule.
    pub node: Option<String>,
    pub min_stream_create_ms: Option<i64>,
    pub max_stream_create_ms: Option<i64>,
    /// Grace period delaying notification firing to tolerate late data.
    pub time_to_wait_for_data_ms: i64,
    /// Minimum interval between evaluations for scheduled-style rules.
    pub query_frequency_ms: Option<i64>,
    /// Aggregated data older than this is deleted after each window pass.
    pub data_retention_ms: Option<i64>,
}

impl ProcessConfig {
    pub const DEFAULT_TIME_TO_WAIT_MS: i64 = 60 * 60 * 1000;

    pub fn time_to_wait_for_data(&self) -> Duration {
        Duration::from_millis(self.time_to_wait_for_data_ms.max(0) as u64)
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            node: None,
            min_stream_create_ms: None,
            max_stream_create_ms: None,
            time_to_wait_for_data_ms: Self::DEFAULT_TIME_TO_WAIT_MS,
            query_frequency_ms: None,
            data_retention_ms: None,
        }
    }
}

/// Duplicate suppression settings. When enabled, detections are passed through
/// the rule's duplicate-check store before delivery; the key is derived from
/// `key_columns` (all value columns when empty).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DuplicateSuppression {
    pub enabled: bool,
    pub key_columns: Vec<String>,
}

/// The rule kind selects the per-rule execution strategy: how extracted
/// records are consumed and when notifications fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RuleKind {
    /// Aggregates extracted records into an embedded table store and fires
    /// windowed notifications once data has aged past the wait threshold.
    TableBuilder { component_id: String },
    /// Evaluates a predicate per extracted record and emits detections
    /// immediately on match.
    Streaming { predicate: FilterExpr },
    /// Same table-building consumption, but notification evaluation is
    /// additionally throttled by the configured query frequency.
    Scheduled { component_id: String },
}

impl RuleKind {
    pub fn aggregates(&self) -> bool {
        matches!(self, RuleKind::TableBuilder { .. } | RuleKind::Scheduled { .. })
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self, RuleKind::Scheduled { .. })
    }

    pub fn component_id(&self) -> Option<&str> {
        match self {
            RuleKind::TableBuilder { component_id } | RuleKind::Scheduled { component_id } => {
                Some(component_id)
            }
            RuleKind::Streaming { .. } => None,
        }
    }
}

/// A user-defined analytic rule. Immutable for the duration of one evaluation
/// pass; reloaded at the start of each pass to pick up edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub uuid: Uuid,
    pub name: String,
    pub version: String,
    pub description: String,
    pub pipeline: PipelineRef,
    pub filter: FilterExpr,
    pub process: ProcessConfig,
    pub kind: RuleKind,
    pub suppression: DuplicateSuppression,
}

impl RuleDefinition {
    pub fn identity(&self) -> String {
        format!("{} ({})", self.name, self.uuid)
    }
}

/// A single extracted field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: String,
}

/// One record extracted from a stream by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub stream_id: u64,
    pub event_id: u64,
    pub event_time_ms: i64,
    pub values: Vec<FieldValue>,
}

impl EventRecord {
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_str())
    }

    pub fn value_map(&self) -> HashMap<String, String> {
        self.values
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionValue {
    pub name: String,
    pub value: String,
}

/// Link from a detection back to the stream/event that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinkedEvent {
    pub stream_id: Option<u64>,
    pub event_id: Option<u64>,
}

/// An emitted alert record. Write-once; handed to the detection sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub detect_time_ms: i64,
    pub detector_name: String,
    pub detector_uuid: Uuid,
    pub detector_version: String,
    pub description: String,
    pub unique_id: Uuid,
    pub values: Vec<DetectionValue>,
    pub linked_events: Vec<LinkedEvent>,
}

/// Source of rule definitions. Reloaded each pass.
#[async_trait]
pub trait RuleProvider: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<RuleDefinition>>;

    /// Disable a rule's process after repeated notification failures so a
    /// broken rule cannot storm the logs and sinks.
    async fn disable_process(&self, rule_uuid: Uuid) -> Result<()>;
}

/// Read-only catalog of stream units.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn find_streams(
        &self,
        filter: &FilterExpr,
        min_stream_id: u64,
        min_create_ms: Option<i64>,
        max_create_ms: Option<i64>,
        statuses: &[StreamStatus],
        limit: usize,
    ) -> Result<Vec<StreamUnit>>;
}

/// External transformation that turns a raw stream into field-value records.
/// A failure here skips the stream for this pass; the watermark is not
/// advanced so the stream is retried on the next pass.
#[async_trait]
pub trait RecordPipeline: Send + Sync {
    async fn process(
        &self,
        stream: &StreamUnit,
        pipeline: &PipelineRef,
    ) -> Result<Vec<EventRecord>>;
}

/// Downstream consumer of detections, scoped per notification/pipeline
/// invocation with `start`/`end`.
pub trait DetectionSink: Send + Sync {
    fn start(&self) -> Result<()>;
    fn accept(&self, detection: Detection) -> Result<()>;
    fn end(&self) -> Result<()>;
}
