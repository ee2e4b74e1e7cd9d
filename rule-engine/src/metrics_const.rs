//! Metric name constants, kept in one place so dashboards and code agree.

pub const EVALUATION_PASSES_COUNTER: &str = "rule_engine_evaluation_passes_total";
pub const STREAMS_PROCESSED_COUNTER: &str = "rule_engine_streams_processed_total";
pub const EVENTS_CONSUMED_COUNTER: &str = "rule_engine_events_consumed_total";
pub const DETECTIONS_EMITTED_COUNTER: &str = "rule_engine_detections_emitted_total";
pub const DETECTIONS_SUPPRESSED_COUNTER: &str = "rule_engine_detections_suppressed_total";
pub const NOTIFICATION_ERRORS_COUNTER: &str = "rule_engine_notification_errors_total";
pub const RULE_FAILURES_COUNTER: &str = "rule_engine_rule_failures_total";
pub const BATCH_SIZE_HISTOGRAM: &str = "rule_engine_batch_size";
pub const PASS_DURATION_HISTOGRAM: &str = "rule_engine_pass_duration_seconds";
