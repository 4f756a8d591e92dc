use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "stayd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "stayd_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "stayd_connections_active";
pub const CONNECTIONS_TOTAL: &str = "stayd_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "stayd_connections_rejected_total";

/// Counter: startup handshakes rejected for a wrong user name.
pub const AUTH_FAILURES_TOTAL: &str = "stayd_auth_failures_total";

/// Gauge: tenants with a loaded engine.
pub const TENANTS_ACTIVE: &str = "stayd_tenants_active";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "stayd_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "stayd_wal_flush_batch_size";

// ── Domain counters ─────────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (reserved, conflict, rejected).
pub const RESERVATIONS_TOTAL: &str = "stayd_reservations_total";

/// Counter: payment confirmations. Labels: outcome (confirmed, already_paid, unmatched).
pub const PAYMENTS_TOTAL: &str = "stayd_payments_total";

/// Counter: unpaid bookings removed by purges.
pub const BOOKINGS_PURGED_TOTAL: &str = "stayd_bookings_purged_total";

/// Install the Prometheus exporter on `port`. No-op when `port` is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://{addr}/metrics");
    Ok(())
}

/// Short, fixed label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertListing { .. } => "insert_listing",
        Command::DeleteListing { .. } => "delete_listing",
        Command::SelectListings => "select_listings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFreeRanges { .. } => "select_free_ranges",
        Command::SelectBookedDates { .. } => "select_booked_dates",
        Command::InsertBooking { .. } => "reserve",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::PurgeUnpaid { .. } => "purge_unpaid",
        Command::SelectBookings { .. } => "select_bookings",
        Command::AttachPaymentSession { .. } => "attach_payment_session",
        Command::ConfirmPayment { .. } => "confirm_payment",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
