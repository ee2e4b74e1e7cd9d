use std::sync::Arc;

use anyhow::{Context, Result};
use metrics::counter;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::aggregate::AggregateRow;
use crate::dupcheck::fingerprint;
use crate::executor::ActiveRule;
use crate::metrics_const::{
    DETECTIONS_EMITTED_COUNTER, DETECTIONS_SUPPRESSED_COUNTER, NOTIFICATION_ERRORS_COUNTER,
};
use crate::model::{Detection, DetectionSink, DetectionValue, LinkedEvent, RuleProvider};

/// Evaluate notification firing for one aggregating rule after a pass.
///
/// The window start is where the previous window ended; the end trails the
/// newest event time by the rule's wait-for-data grace so late arrivals land
/// inside a future window instead of being missed. Nothing fires until the
/// data has aged past the grace period. Windows are half-open, so
/// consecutive windows tile without gap or overlap.
///
/// Rules with duplicate suppression enabled route each window row through
/// their duplicate-check store; rows whose fingerprint was seen before are
/// dropped instead of reaching the sink.
///
/// A notification failure records the error on the tracker and disables the
/// rule's processing so a broken sink cannot fire storms of retries.
pub async fn evaluate_notifications(
    rule: &mut ActiveRule,
    sink: &Arc<dyn DetectionSink>,
    provider: &dyn RuleProvider,
    now_ms: i64,
) -> Result<()> {
    let Some(store) = rule.aggregate.clone() else {
        return Ok(());
    };

    if rule.definition.kind.is_scheduled() {
        if let (Some(frequency), Some(last)) = (
            rule.definition.process.query_frequency_ms,
            rule.tracker.last_execution_ms,
        ) {
            if now_ms - last < frequency {
                debug!(
                    rule = %rule.definition.identity(),
                    "Skipping notification evaluation, query frequency not elapsed"
                );
                return Ok(());
            }
        }
    }

    let state = store.sync().context("Failed to sync aggregation store")?;
    let Some(last_event_time_ms) = state.and_then(|s| s.last_event_time_ms) else {
        return Ok(());
    };

    let process = &rule.definition.process;
    let from = rule
        .tracker
        .last_window_end_ms
        .or(process.min_stream_create_ms)
        .unwrap_or(0)
        .max(0);
    let mut to = last_event_time_ms - process.time_to_wait_for_data_ms;
    if let Some(max_create) = process.max_stream_create_ms {
        to = to.min(max_create);
    }

    rule.tracker.last_execution_ms = Some(now_ms);

    if to <= from {
        debug!(
            rule = %rule.definition.identity(),
            from,
            to,
            "No window ready, data has not aged past the wait threshold"
        );
        return Ok(());
    }

    let rows = store.rows_in_window(from, to)?;
    info!(
        rule = %rule.definition.identity(),
        from,
        to,
        rows = rows.len(),
        "Firing notification window"
    );

    if let Err(e) = deliver(rule, &rows, sink, now_ms) {
        counter!(NOTIFICATION_ERRORS_COUNTER).increment(1);
        error!(
            rule = %rule.definition.identity(),
            error = ?e,
            "Notification delivery failed, disabling rule processing"
        );
        rule.tracker.message = Some(format!("Notification failed: {e:#}"));
        provider
            .disable_process(rule.definition.uuid)
            .await
            .context("Failed to disable rule after notification error")?;
        return Ok(());
    }

    rule.tracker.last_window_start_ms = Some(from);
    rule.tracker.last_window_end_ms = Some(to);

    if let Some(retention_ms) = process.data_retention_ms {
        store
            .delete_older_than(retention_ms)
            .context("Failed to apply data retention")?;
    }
    Ok(())
}

fn deliver(
    rule: &ActiveRule,
    rows: &[AggregateRow],
    sink: &Arc<dyn DetectionSink>,
    now_ms: i64,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    sink.start()?;
    for row in rows {
        if let Some(dupcheck) = &rule.dupcheck {
            let key = fingerprint(&row.values, &rule.definition.suppression.key_columns);
            if !dupcheck.try_insert(key).context("Duplicate check failed")? {
                counter!(DETECTIONS_SUPPRESSED_COUNTER).increment(1);
                continue;
            }
        }
        sink.accept(detection_for(&rule.definition, row, now_ms))?;
        counter!(DETECTIONS_EMITTED_COUNTER).increment(1);
    }
    sink.end()
}

fn detection_for(
    definition: &crate::model::RuleDefinition,
    row: &AggregateRow,
    now_ms: i64,
) -> Detection {
    Detection {
        detect_time_ms: now_ms,
        detector_name: definition.name.clone(),
        detector_uuid: definition.uuid,
        detector_version: definition.version.clone(),
        description: definition.description.clone(),
        unique_id: Uuid::new_v4(),
        values: row
            .values
            .iter()
            .map(|v| DetectionValue {
                name: v.name.clone(),
                value: v.value.clone(),
            })
            .collect(),
        linked_events: vec![LinkedEvent {
            stream_id: Some(row.stream_id),
            event_id: row.event_id,
        }],
    }
}
