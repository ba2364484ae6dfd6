use std::io;
use std::net::SocketAddr;

use crate::command::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: scheduler operations. Labels: op, status (`ok` or an error kind).
pub const OPERATIONS_TOTAL: &str = "apron_operations_total";

/// Histogram: scheduler operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "apron_operation_duration_seconds";

/// Counter: requests denied by the capability table. Labels: role, class, action.
pub const POLICY_DENIALS_TOTAL: &str = "apron_policy_denials_total";

/// Counter: reservations rejected because the window was taken. Labels: class.
pub const CONFLICTS_TOTAL: &str = "apron_conflicts_total";

/// Counter: committed-state invariant violations. Should stay at zero.
pub const INVARIANT_VIOLATIONS_TOTAL: &str = "apron_invariant_violations_total";

/// Counter: journal writes that failed and were rolled back.
pub const PERSISTENCE_FAILURES_TOTAL: &str = "apron_persistence_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: committed assignments held in memory.
pub const ASSIGNMENTS_ACTIVE: &str = "apron_assignments_active";

/// Counter: historical assignments dropped by the reaper.
pub const ASSIGNMENTS_PRUNED_TOTAL: &str = "apron_assignments_pruned_total";

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "apron_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "apron_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "apron_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "apron_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (events per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "apron_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| io::Error::other(format!("failed to install Prometheus exporter: {e}")))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Authorize { .. } => "authorize",
        Command::RegisterResource { .. } => "register_resource",
        Command::Create { .. } => "create",
        Command::Reschedule { .. } => "reschedule",
        Command::Reassign { .. } => "reassign",
        Command::Cancel { .. } => "cancel",
        Command::DeleteResource { .. } => "delete_resource",
        Command::Conflicts { .. } => "conflicts",
        Command::GetAssignment { .. } => "get_assignment",
        Command::ListAssignments { .. } => "list_assignments",
        Command::FlightAssignments { .. } => "flight_assignments",
        Command::ListResources { .. } => "list_resources",
        Command::Subscribe { .. } => "subscribe",
    }
}
