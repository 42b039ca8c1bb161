//! Metrics for observability.
//!
//! Emits Prometheus-compatible metrics through the `metrics` facade for:
//! - Server selection and request outcomes
//! - Login / token refresh
//! - Connection lifecycle and server pushes
//! - Redo replay
//! - Failover switch, hits and snapshot persistence
//! - Service instance changes
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `registry_client_`:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track durations in seconds
//!
//! No recorder is installed by this crate; the embedding application decides
//! where metrics go.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

fn status(success: bool) -> &'static str {
    if success {
        "success"
    } else {
        "failure"
    }
}

/// Record a request attempt against one server.
pub fn record_request(operation: &str, server: &str, success: bool, latency: Duration) {
    counter!(
        "registry_client_requests_total",
        "operation" => operation.to_string(),
        "server" => server.to_string(),
        "status" => status(success)
    )
    .increment(1);
    histogram!("registry_client_request_duration_seconds", "operation" => operation.to_string())
        .record(latency.as_secs_f64());
}

/// Record a request that failed on every server.
pub fn record_request_exhausted(operation: &str, attempts: usize) {
    counter!("registry_client_requests_exhausted_total", "operation" => operation.to_string()).increment(1);
    histogram!("registry_client_request_attempts", "operation" => operation.to_string()).record(attempts as f64);
}

/// Record a server health transition.
pub fn record_server_health(server: &str, healthy: bool) {
    gauge!("registry_client_server_healthy", "server" => server.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

/// Record a login attempt.
pub fn record_login(success: bool) {
    counter!("registry_client_logins_total", "status" => status(success)).increment(1);
}

/// Set the connection state gauge.
///
/// Encoded as: 0=Disconnected, 1=Connecting, 2=Connected, 3=Shutdown, -1=unknown.
pub fn set_connection_state(state: &str) {
    let value = match state {
        "Disconnected" => 0.0,
        "Connecting" => 1.0,
        "Connected" => 2.0,
        "Shutdown" => 3.0,
        _ => -1.0,
    };
    gauge!("registry_client_connection_state").set(value);
}

/// Record a connection attempt (transport connect plus handshake).
pub fn record_connection_attempt(server: &str, success: bool) {
    counter!(
        "registry_client_connection_attempts_total",
        "server" => server.to_string(),
        "status" => status(success)
    )
    .increment(1);
}

/// Record a server push by type.
pub fn record_push(push_type: &str) {
    counter!("registry_client_pushes_total", "type" => push_type.to_string()).increment(1);
}

/// Record one replayed redo entry.
pub fn record_redo(kind: &str, action: &str, success: bool) {
    counter!(
        "registry_client_redo_total",
        "kind" => kind.to_string(),
        "action" => action.to_string(),
        "status" => status(success)
    )
    .increment(1);
}

/// Record a completed redo cycle.
pub fn record_redo_cycle(replayed: usize, failed: usize, duration: Duration) {
    counter!("registry_client_redo_cycles_total").increment(1);
    if failed > 0 {
        counter!("registry_client_redo_failures_total").increment(failed as u64);
    }
    gauge!("registry_client_redo_last_cycle_replayed").set(replayed as f64);
    histogram!("registry_client_redo_cycle_duration_seconds").record(duration.as_secs_f64());
}

/// Set the number of tracked entries per redo registry.
pub fn set_redo_entries(kind: &str, count: usize) {
    gauge!("registry_client_redo_entries", "kind" => kind.to_string()).set(count as f64);
}

/// Set the failover switch gauge.
pub fn set_failover_switch(enabled: bool) {
    gauge!("registry_client_failover_enabled").set(if enabled { 1.0 } else { 0.0 });
}

/// Record data served from failover instead of the server.
pub fn record_failover_hit(kind: &str) {
    counter!("registry_client_failover_hits_total", "kind" => kind.to_string()).increment(1);
}

/// Record a snapshot write.
pub fn record_snapshot_write(kind: &str, success: bool) {
    counter!(
        "registry_client_snapshot_writes_total",
        "kind" => kind.to_string(),
        "status" => status(success)
    )
    .increment(1);
}

/// Record a snapshot file that was ignored because it was unreadable.
pub fn record_snapshot_corrupt(kind: &str) {
    counter!("registry_client_snapshot_corrupt_total", "kind" => kind.to_string()).increment(1);
}

/// Record instance changes for a service.
pub fn record_instances_changed(service: &str, added: usize, removed: usize, modified: usize) {
    let service = service.to_string();
    counter!("registry_client_instances_added_total", "service" => service.clone()).increment(added as u64);
    counter!("registry_client_instances_removed_total", "service" => service.clone()).increment(removed as u64);
    counter!("registry_client_instances_modified_total", "service" => service).increment(modified as u64);
}

/// Record a push dropped by the stale or empty-push guard.
pub fn record_push_ignored(reason: &str) {
    counter!("registry_client_pushes_ignored_total", "reason" => reason.to_string()).increment(1);
}

/// Set the client state gauge.
///
/// Encoded as: 0=Created, 1=Starting, 2=Running, 3=ShuttingDown, 4=Stopped, 5=Failed, -1=unknown.
pub fn set_client_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("registry_client_state").set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without a recorder these are no-ops; the tests check they never panic.

    #[test]
    fn test_record_request() {
        record_request("config.get", "a:8848", true, Duration::from_millis(5));
        record_request("config.get", "a:8848", false, Duration::ZERO);
        record_request_exhausted("config.get", 3);
    }

    #[test]
    fn test_connection_state_all_states() {
        for state in ["Disconnected", "Connecting", "Connected", "Shutdown", "Unknown"] {
            set_connection_state(state);
        }
        record_connection_attempt("a:9848", true);
        record_connection_attempt("a:9848", false);
    }

    #[test]
    fn test_client_state_all_states() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "?"] {
            set_client_state(state);
        }
    }

    #[test]
    fn test_redo_metrics() {
        record_redo("instance", "register", true);
        record_redo("lock", "unregister", false);
        record_redo_cycle(10, 1, Duration::from_millis(40));
        record_redo_cycle(0, 0, Duration::ZERO);
        set_redo_entries("subscriber", 4);
    }

    #[test]
    fn test_failover_and_snapshot_metrics() {
        set_failover_switch(true);
        set_failover_switch(false);
        record_failover_hit("naming");
        record_snapshot_write("config", true);
        record_snapshot_corrupt("naming");
    }

    #[test]
    fn test_misc_metrics() {
        record_server_health("a:8848", false);
        record_login(true);
        record_push("NotifySubscriberRequest");
        record_push_ignored("stale");
        record_instances_changed("DEFAULT_GROUP@@orders", 1, 0, 2);
    }
}
