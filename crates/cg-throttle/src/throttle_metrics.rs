//! Prometheus-compatible metrics for the throttling engine.

use metrics::counter;

pub fn record_connection_granted(group_type: &str, group_name: &str) {
    counter!(
        "cg_connections_granted_total",
        "group_type" => group_type.to_string(),
        "group" => group_name.to_string()
    )
    .increment(1);
}

pub fn record_connection_denied(group_type: &str, group_name: &str) {
    counter!(
        "cg_connections_denied_total",
        "group_type" => group_type.to_string(),
        "group" => group_name.to_string()
    )
    .increment(1);
}

pub fn record_connection_released(group_type: &str, group_name: &str) {
    counter!(
        "cg_connections_released_total",
        "group_type" => group_type.to_string(),
        "group" => group_name.to_string()
    )
    .increment(1);
}

pub fn record_fetch_granted(group_type: &str, group_name: &str) {
    counter!(
        "cg_fetches_granted_total",
        "group_type" => group_type.to_string(),
        "group" => group_name.to_string()
    )
    .increment(1);
}

pub fn record_bytes_granted(group_type: &str, group_name: &str, bytes: u64) {
    counter!(
        "cg_stream_bytes_granted_total",
        "group_type" => group_type.to_string(),
        "group" => group_name.to_string()
    )
    .increment(bytes);
}

pub fn record_group_removed(group_type: &str) {
    counter!(
        "cg_groups_removed_total",
        "group_type" => group_type.to_string()
    )
    .increment(1);
}
