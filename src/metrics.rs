use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, Gauge, HistogramVec, IntCounterVec, TextEncoder,
};

lazy_static! {
    // Check metrics
    pub static ref CHECKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotr_checks_total",
        "Total number of quota checks",
        &["path", "allowed"]
    ).unwrap();

    pub static ref CHECKS_DENIED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotr_checks_denied_total",
        "Denied quota checks by reason",
        &["reason"]
    ).unwrap();

    pub static ref CHECK_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotr_check_errors_total",
        "Checks that ended in internal_error",
        &["error_type"]
    ).unwrap();

    pub static ref CHECK_DURATION: HistogramVec = register_histogram_vec!(
        "quotr_check_duration_seconds",
        "Decision latency in seconds",
        &["path"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
    ).unwrap();

    // Redis metrics
    pub static ref REDIS_DURATION: HistogramVec = register_histogram_vec!(
        "quotr_redis_duration_seconds",
        "Redis command duration in seconds",
        &["command"],
        vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5]
    ).unwrap();

    pub static ref REDIS_SCRIPT_EXECUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "quotr_redis_script_executions_total",
        "Total number of Lua script executions",
        &["result"]
    ).unwrap();

    // Policy metrics
    pub static ref POLICY_SYNCS_TOTAL: CounterVec = register_counter_vec!(
        "quotr_policy_syncs_total",
        "Policy sync attempts",
        &["result"]
    ).unwrap();

    pub static ref POLICY_RELOAD_TRIGGERS_TOTAL: CounterVec = register_counter_vec!(
        "quotr_policy_reload_triggers_total",
        "Policy file change notifications",
        &["result"]
    ).unwrap();

    pub static ref ACTIVE_POLICIES: Gauge = register_gauge!(
        "quotr_active_policies",
        "Number of enabled policies in the cache"
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotr_events_published_total",
        "Quota events handed to the stream",
        &["result"]
    ).unwrap();

    // Audit metrics
    pub static ref AUDIT_RECORDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotr_audit_records_total",
        "Audit records by ingestion outcome",
        &["outcome"]
    ).unwrap();

    pub static ref AUDIT_BATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "quotr_audit_batches_total",
        "Audit batches by result",
        &["result"]
    ).unwrap();
}

/// Record a finished check
pub fn record_check(path: &str, allowed: bool, duration_secs: f64) {
    let allowed_str = if allowed { "true" } else { "false" };
    CHECKS_TOTAL.with_label_values(&[path, allowed_str]).inc();
    CHECK_DURATION.with_label_values(&[path]).observe(duration_secs);
}

/// Record denied check
pub fn record_denied(reason: &str) {
    CHECKS_DENIED_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_check_error(error_type: &str) {
    CHECK_ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Record Redis operation duration
pub fn record_redis_duration(command: &str, duration_secs: f64) {
    REDIS_DURATION
        .with_label_values(&[command])
        .observe(duration_secs);
}

/// Record script execution
pub fn record_script_execution(success: bool) {
    let result = if success { "success" } else { "error" };
    REDIS_SCRIPT_EXECUTIONS_TOTAL
        .with_label_values(&[result])
        .inc();
}

pub fn update_policy_cache_size(active: usize) {
    ACTIVE_POLICIES.set(active as f64);
}

pub fn record_policy_sync(success: bool) {
    let result = if success { "success" } else { "error" };
    POLICY_SYNCS_TOTAL.with_label_values(&[result]).inc();
}

/// Record a policy file change notification
pub fn record_policy_reload_trigger(success: bool) {
    let result = if success { "success" } else { "error" };
    POLICY_RELOAD_TRIGGERS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_event_published(success: bool) {
    let result = if success { "success" } else { "error" };
    EVENTS_PUBLISHED_TOTAL.with_label_values(&[result]).inc();
}

/// Record audit records by outcome (`inserted`, `duplicate`, `undecodable`, `failed`)
pub fn record_audit_records(outcome: &str, count: usize) {
    if count > 0 {
        AUDIT_RECORDS_TOTAL
            .with_label_values(&[outcome])
            .inc_by(count as u64);
    }
}

pub fn record_audit_batch(success: bool) {
    let result = if success { "committed" } else { "redelivered" };
    AUDIT_BATCHES_TOTAL.with_label_values(&[result]).inc();
}

/// Text exposition of every registered metric
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_includes_recorded_series() {
        record_check("local", true, 0.0002);
        record_denied("quota_exceeded");
        update_policy_cache_size(3);

        let text = gather();
        assert!(text.contains("quotr_checks_total"));
        assert!(text.contains("quotr_checks_denied_total{reason=\"quota_exceeded\"}"));
        assert!(text.contains("quotr_active_policies"));
    }
}
