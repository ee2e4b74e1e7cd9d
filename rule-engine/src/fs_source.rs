//! File-backed implementations of the engine's collaborator traits.
//!
//! Rules come from a JSON document, streams from a spool directory with one
//! JSON file per stream, and detections go to the log as JSON. Suitable for
//! small deployments and for exercising the engine end to end; larger
//! deployments implement the traits against their own infrastructure.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::model::{
    Detection, DetectionSink, EventRecord, FilterExpr, PipelineRef, RecordPipeline,
    RuleDefinition, RuleProvider, SourceCatalog, StreamStatus, StreamUnit,
};

/// Rule definitions loaded from a JSON file holding a `Vec<RuleDefinition>`.
/// The file is re-read on every load so edits take effect on the next pass.
pub struct FileRuleProvider {
    path: PathBuf,
}

impl FileRuleProvider {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl RuleProvider for FileRuleProvider {
    async fn load_rules(&self) -> Result<Vec<RuleDefinition>> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("Failed to read rules file {}", self.path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse rules file {}", self.path.display()))
    }

    async fn disable_process(&self, rule_uuid: Uuid) -> Result<()> {
        let mut rules = self.load_rules().await?;
        for rule in rules.iter_mut() {
            if rule.uuid == rule_uuid {
                rule.process.enabled = false;
            }
        }
        let bytes = serde_json::to_vec_pretty(&rules).context("Failed to serialize rules")?;
        tokio::fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("Failed to write rules file {}", self.path.display()))
    }
}

/// On-disk stream file: metadata plus the already-extracted records.
#[derive(Debug, Deserialize)]
struct StreamFile {
    id: u64,
    feed: String,
    create_time_ms: i64,
    #[serde(default)]
    locked: bool,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    records: Vec<StreamFileRecord>,
}

#[derive(Debug, Deserialize)]
struct StreamFileRecord {
    event_id: u64,
    event_time_ms: i64,
    #[serde(default)]
    values: HashMap<String, String>,
}

/// Catalog and pipeline over a spool directory of `*.json` stream files.
pub struct SpoolDirectory {
    dir: PathBuf,
}

impl SpoolDirectory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    async fn load_all(&self) -> Result<Vec<StreamFile>> {
        let mut streams = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read spool directory {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read stream file {}", path.display()))?;
            let stream: StreamFile = serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse stream file {}", path.display()))?;
            streams.push(stream);
        }
        streams.sort_by_key(|s| s.id);
        Ok(streams)
    }

    async fn load_stream(&self, id: u64) -> Result<Option<StreamFile>> {
        // Stream files are named by id, so a point lookup avoids a full scan.
        let path = self.dir.join(format!("{id}.json"));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(
                || format!("Failed to parse stream file {}", path.display()),
            )?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read stream file {}", path.display()))
            }
        }
    }
}

fn unit_of(stream: &StreamFile) -> StreamUnit {
    StreamUnit {
        id: stream.id,
        feed: stream.feed.clone(),
        create_time_ms: stream.create_time_ms,
        status: if stream.locked {
            StreamStatus::Locked
        } else {
            StreamStatus::Unlocked
        },
        attributes: stream.attributes.clone(),
    }
}

#[async_trait]
impl SourceCatalog for SpoolDirectory {
    async fn find_streams(
        &self,
        filter: &FilterExpr,
        min_stream_id: u64,
        min_create_ms: Option<i64>,
        max_create_ms: Option<i64>,
        statuses: &[StreamStatus],
        limit: usize,
    ) -> Result<Vec<StreamUnit>> {
        let streams = self.load_all().await?;
        Ok(streams
            .iter()
            .map(unit_of)
            .filter(|s| s.id >= min_stream_id)
            .filter(|s| min_create_ms.is_none_or(|min| s.create_time_ms >= min))
            .filter(|s| max_create_ms.is_none_or(|max| s.create_time_ms <= max))
            .filter(|s| statuses.contains(&s.status))
            .filter(|s| filter.matches(&s.attribute_map()))
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl RecordPipeline for SpoolDirectory {
    async fn process(
        &self,
        stream: &StreamUnit,
        _pipeline: &PipelineRef,
    ) -> Result<Vec<EventRecord>> {
        let Some(file) = self.load_stream(stream.id).await? else {
            return Ok(Vec::new());
        };
        Ok(file
            .records
            .into_iter()
            .map(|record| EventRecord {
                stream_id: stream.id,
                event_id: record.event_id,
                event_time_ms: record.event_time_ms,
                values: record
                    .values
                    .into_iter()
                    .map(|(name, value)| crate::model::FieldValue { name, value })
                    .collect(),
            })
            .collect())
    }
}

/// Sink that logs each detection as a single JSON line.
#[derive(Default)]
pub struct LogSink;

impl DetectionSink for LogSink {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn accept(&self, detection: Detection) -> Result<()> {
        let json = serde_json::to_string(&detection).context("Failed to serialize detection")?;
        info!(detection = %json, "Detection");
        Ok(())
    }

    fn end(&self) -> Result<()> {
        Ok(())
    }
}
