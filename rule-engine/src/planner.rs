use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use tracing::debug;

use crate::model::{FilterExpr, SourceCatalog, StreamStatus, StreamUnit};

/// What one rule contributes to batch planning: its stream filter, its resume
/// position, and its stream creation-time bounds.
#[derive(Debug, Clone)]
pub struct PlanEntry<'a> {
    pub filter: &'a FilterExpr,
    pub next_stream_id: u64,
    pub min_create_ms: Option<i64>,
    pub max_create_ms: Option<i64>,
}

/// One planned batch of streams, ordered by stream id, deduplicated across
/// rules. `complete` means no rule has further streams waiting beyond this
/// batch; a pass over the rules can stop once a batch comes back complete.
#[derive(Debug)]
pub struct BatchPlan {
    pub streams: Vec<StreamUnit>,
    pub complete: bool,
}

#[derive(Debug)]
struct GroupBounds {
    next_stream_id: u64,
    min_create_ms: Option<i64>,
    max_create_ms: Option<i64>,
}

fn min_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

fn max_opt(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (Some(v), None) | (None, Some(v)) => Some(v),
        (None, None) => None,
    }
}

/// Plan the next batch for a set of rules sharing a source. Rules with
/// syntactically equal filters share one catalog query; per group the resume
/// position is the furthest-behind rule's. Queries include locked streams so
/// execution can stop at the first one. Entries whose filter has no terms are
/// skipped; a rule must say what it reads.
pub async fn plan_batch(
    catalog: &dyn SourceCatalog,
    entries: &[PlanEntry<'_>],
    max_batch: usize,
) -> Result<BatchPlan> {
    let mut groups: HashMap<&FilterExpr, GroupBounds> = HashMap::new();
    for entry in entries {
        if !entry.filter.has_terms() {
            continue;
        }
        groups
            .entry(entry.filter)
            .and_modify(|bounds| {
                bounds.next_stream_id = bounds.next_stream_id.min(entry.next_stream_id);
                bounds.min_create_ms = min_opt(bounds.min_create_ms, entry.min_create_ms);
                bounds.max_create_ms = max_opt(bounds.max_create_ms, entry.max_create_ms);
            })
            .or_insert(GroupBounds {
                next_stream_id: entry.next_stream_id,
                min_create_ms: entry.min_create_ms,
                max_create_ms: entry.max_create_ms,
            });
    }

    let mut union: BTreeMap<u64, StreamUnit> = BTreeMap::new();
    for (filter, bounds) in &groups {
        let streams = catalog
            .find_streams(
                *filter,
                bounds.next_stream_id,
                bounds.min_create_ms,
                bounds.max_create_ms,
                &[StreamStatus::Unlocked, StreamStatus::Locked],
                max_batch,
            )
            .await?;
        for stream in streams {
            union.entry(stream.id).or_insert(stream);
        }
    }

    let complete = union.len() < max_batch;
    let streams: Vec<StreamUnit> = union.into_values().take(max_batch).collect();
    debug!(
        groups = groups.len(),
        streams = streams.len(),
        complete,
        "Planned stream batch"
    );
    Ok(BatchPlan { streams, complete })
}
