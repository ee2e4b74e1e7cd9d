use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::kv::KvStore;

/// Durable per-rule cursor. Every "has this ever happened" field is an
/// explicit `Option` so "never executed" and "executed at zero" stay
/// distinguishable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleTracker {
    pub rule_uuid: Uuid,
    /// Last stream id for which any events were processed. Non-decreasing
    /// across successful batches.
    pub last_stream_id: Option<u64>,
    /// Last event id processed within `last_stream_id`. `Some` only while a
    /// stream is partially consumed; cleared once the stream completes.
    pub last_event_id: Option<u64>,
    pub last_event_time_ms: Option<i64>,
    pub last_execution_ms: Option<i64>,
    pub last_window_start_ms: Option<i64>,
    pub last_window_end_ms: Option<i64>,
    /// Free-text status surfaced to users (errors, "complete for now", ...).
    pub message: Option<String>,
    pub poll_count: u64,
    pub stream_count: u64,
    pub event_count: u64,
}

impl RuleTracker {
    pub fn new(rule_uuid: Uuid) -> Self {
        Self {
            rule_uuid,
            last_stream_id: None,
            last_event_id: None,
            last_event_time_ms: None,
            last_execution_ms: None,
            last_window_start_ms: None,
            last_window_end_ms: None,
            message: None,
            poll_count: 0,
            stream_count: 0,
            event_count: 0,
        }
    }

    /// The first stream id this rule has not fully processed. A set
    /// `last_event_id` means the last stream was only partially consumed and
    /// must be revisited; otherwise resume strictly after it.
    pub fn next_stream_id(&self) -> u64 {
        match (self.last_stream_id, self.last_event_id) {
            (None, _) => 0,
            (Some(id), Some(_)) => id,
            (Some(id), None) => id + 1,
        }
    }

    /// Event-id resumption point within `stream_id`, if this tracker shows a
    /// partially consumed stream.
    pub fn min_event_id(&self, stream_id: u64) -> Option<u64> {
        match (self.last_stream_id, self.last_event_id) {
            (Some(last), Some(event)) if last == stream_id => Some(event + 1),
            _ => None,
        }
    }
}

const TRACKERS_CF: &str = "trackers";

/// Durable store of rule trackers, one record per rule, keyed by rule uuid.
#[derive(Debug)]
pub struct TrackerStore {
    kv: KvStore,
}

impl TrackerStore {
    pub fn open(path: &Path) -> Result<Self> {
        let kv = KvStore::open(path, &[TRACKERS_CF])?;
        Ok(Self { kv })
    }

    /// Fetch the tracker for a rule, creating a zero-valued one if none
    /// exists. Creation races are benign: the loser's write is overwritten by
    /// an identical zero-valued record and the re-read returns it.
    pub fn get(&self, rule_uuid: Uuid) -> Result<RuleTracker> {
        loop {
            if let Some(bytes) = self.kv.get(TRACKERS_CF, rule_uuid.as_bytes())? {
                let (tracker, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .context("Failed to decode rule tracker")?;
                return Ok(tracker);
            }
            let tracker = RuleTracker::new(rule_uuid);
            let bytes = bincode::serde::encode_to_vec(&tracker, bincode::config::standard())
                .context("Failed to encode rule tracker")?;
            self.kv.put(TRACKERS_CF, rule_uuid.as_bytes(), &bytes)?;
        }
    }

    /// Persist all tracker fields. Failure is logged rather than aborting the
    /// batch: the next pass re-reads storage, so an unpersisted advance is
    /// safe to redo.
    pub fn update(&self, tracker: &RuleTracker) {
        if let Err(e) = self.try_update(tracker) {
            warn!(
                rule = %tracker.rule_uuid,
                error = ?e,
                "Failed to persist rule tracker; advance will be redone next pass"
            );
        }
    }

    fn try_update(&self, tracker: &RuleTracker) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(tracker, bincode::config::standard())
            .context("Failed to encode rule tracker")?;
        self.kv
            .put(TRACKERS_CF, tracker.rule_uuid.as_bytes(), &bytes)
    }
}
