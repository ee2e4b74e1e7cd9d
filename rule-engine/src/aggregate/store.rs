use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kv::{encode_u64, KvStore};
use crate::model::FieldValue;

const ROWS_CF: &str = "rows";
const STATE_CF: &str = "state";
const STATE_KEY: &[u8] = b"current";

/// The most recent fully-committed position of an aggregation store: which
/// stream (and event, when mid-stream) has been written, and the newest event
/// time seen in the data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    pub last_stream_id: u64,
    pub last_event_id: Option<u64>,
    pub last_event_time_ms: Option<i64>,
}

/// One aggregated row. Stream and event ids are carried as structure, not as
/// value columns, so notification firing can demote them to detection links
/// without string matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRow {
    pub stream_id: u64,
    pub event_id: Option<u64>,
    pub event_time_ms: i64,
    pub values: Vec<FieldValue>,
}

/// Embedded ordered store of aggregated rows for one (rule, component).
/// Rows are keyed `(event_time, stream_id, event_id)` big-endian, so window
/// scans and retention deletes are plain range operations and re-processing
/// a stream overwrites its rows instead of duplicating them.
#[derive(Debug)]
pub struct AggregateStore {
    kv: KvStore,
    rule_uuid: Uuid,
    component_id: String,
    /// Newest event time written since open; i64::MIN until the first row.
    max_event_time_ms: AtomicI64,
}

impl AggregateStore {
    pub fn open(path: &Path, rule_uuid: Uuid, component_id: &str) -> Result<Self> {
        let kv = KvStore::open(path, &[ROWS_CF, STATE_CF])?;

        let store = Self {
            kv,
            rule_uuid,
            component_id: component_id.to_string(),
            max_event_time_ms: AtomicI64::new(i64::MIN),
        };
        if let Some(state) = store.read_state()? {
            if let Some(last) = state.last_event_time_ms {
                store.max_event_time_ms.store(last, Ordering::SeqCst);
            }
        }
        Ok(store)
    }

    pub fn rule_uuid(&self) -> Uuid {
        self.rule_uuid
    }

    pub fn component_id(&self) -> &str {
        &self.component_id
    }

    pub fn put_row(&self, row: &AggregateRow) -> Result<()> {
        let key = row_key(row.event_time_ms, row.stream_id, row.event_id.unwrap_or(0));
        let value = bincode::serde::encode_to_vec(row, bincode::config::standard())
            .context("Failed to encode aggregate row")?;
        self.kv.put(ROWS_CF, &key, &value)?;
        self.max_event_time_ms
            .fetch_max(row.event_time_ms, Ordering::SeqCst);
        Ok(())
    }

    /// Record that everything up to `stream_id`/`event_id` has been written.
    /// Called once per completed stream (event id unset) or on mid-stream
    /// abort (event id set).
    pub fn record_progress(&self, stream_id: u64, event_id: Option<u64>) -> Result<()> {
        let max = self.max_event_time_ms.load(Ordering::SeqCst);
        let last_event_time_ms = if max == i64::MIN { None } else { Some(max) };
        let state = CurrentState {
            last_stream_id: stream_id,
            last_event_id: event_id,
            last_event_time_ms,
        };
        let bytes = bincode::serde::encode_to_vec(&state, bincode::config::standard())
            .context("Failed to encode store state")?;
        self.kv.put(STATE_CF, STATE_KEY, &bytes)
    }

    /// Flush writer state and return the most recent fully-committed
    /// position, or nothing if no progress has ever been recorded.
    pub fn sync(&self) -> Result<Option<CurrentState>> {
        self.kv.flush(ROWS_CF)?;
        self.kv.flush(STATE_CF)?;
        self.read_state()
    }

    fn read_state(&self) -> Result<Option<CurrentState>> {
        match self.kv.get(STATE_CF, STATE_KEY)? {
            Some(bytes) => {
                let (state, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .context("Failed to decode store state")?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// All rows with event time in `[from_ms, to_ms)`, in time order.
    pub fn rows_in_window(&self, from_ms: i64, to_ms: i64) -> Result<Vec<AggregateRow>> {
        if to_ms <= from_ms {
            return Ok(Vec::new());
        }
        let from = time_prefix(from_ms);
        let to = time_prefix(to_ms);
        let entries = self.kv.scan_range(ROWS_CF, &from, &to)?;

        let mut rows = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            let (row, _) = bincode::serde::decode_from_slice(&value, bincode::config::standard())
                .context("Failed to decode aggregate row")?;
            rows.push(row);
        }
        Ok(rows)
    }

    /// Range-delete rows dated before `last_event_time - retention`. A no-op
    /// until the store has seen data.
    pub fn delete_older_than(&self, retention_ms: i64) -> Result<()> {
        let Some(state) = self.read_state()? else {
            return Ok(());
        };
        let Some(last_event_time_ms) = state.last_event_time_ms else {
            return Ok(());
        };
        let cutoff = last_event_time_ms.saturating_sub(retention_ms);
        self.kv
            .delete_range(ROWS_CF, &time_prefix(0), &time_prefix(cutoff))
    }

    pub fn row_count(&self) -> Result<u64> {
        self.kv.count(ROWS_CF)
    }
}

fn row_key(event_time_ms: i64, stream_id: u64, event_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(&encode_u64(event_time_ms.max(0) as u64));
    key.extend_from_slice(&encode_u64(stream_id));
    key.extend_from_slice(&encode_u64(event_id));
    key
}

fn time_prefix(event_time_ms: i64) -> Vec<u8> {
    encode_u64(event_time_ms.max(0) as u64).to_vec()
}
