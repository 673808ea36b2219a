//! Runtime metrics: connection lifecycle, byte throughput, selector
//! activity and DNS outcomes. Registered with `metriken`, so an embedding
//! application can scrape them with any metriken exporter.

use metriken::metric;

use crate::counter::{Counter, CounterGroup};

static CONN: CounterGroup = CounterGroup::new();
static BYTES: CounterGroup = CounterGroup::new();
static SELECTOR: CounterGroup = CounterGroup::new();
static DNS: CounterGroup = CounterGroup::new();

/// Counter slot indices for connection metrics.
pub mod conn {
    pub const ACCEPTED: usize = 0;
    pub const CLOSED: usize = 1;
    pub const FILTERED: usize = 2;
}

/// Counter slot indices for byte metrics.
pub mod bytes {
    pub const RECEIVED: usize = 0;
    pub const SENT: usize = 1;
}

/// Counter slot indices for selector metrics.
pub mod selector {
    pub const TASKS_RUN: usize = 0;
    pub const ALARMS_FIRED: usize = 1;
}

/// Counter slot indices for DNS metrics.
pub mod dns {
    pub const LOOKUPS: usize = 0;
    pub const FAILURES: usize = 1;
}

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "wireline/connections/accepted",
    description = "Connections accepted and initialized"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new(&CONN, conn::ACCEPTED);

#[metric(
    name = "wireline/connections/closed",
    description = "Connections fully closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new(&CONN, conn::CLOSED);

#[metric(
    name = "wireline/connections/filtered",
    description = "Inbound connections rejected by the filter handler"
)]
pub static CONNECTIONS_FILTERED: Counter = Counter::new(&CONN, conn::FILTERED);

// ── Bytes ────────────────────────────────────────────────────────

#[metric(name = "wireline/bytes/received", description = "Total bytes received")]
pub static BYTES_RECEIVED: Counter = Counter::new(&BYTES, bytes::RECEIVED);

#[metric(name = "wireline/bytes/sent", description = "Total bytes sent")]
pub static BYTES_SENT: Counter = Counter::new(&BYTES, bytes::SENT);

// ── Selector activity ────────────────────────────────────────────

#[metric(
    name = "wireline/selector/tasks_run",
    description = "Deferred tasks executed by selector loops"
)]
pub static TASKS_RUN: Counter = Counter::new(&SELECTOR, selector::TASKS_RUN);

#[metric(
    name = "wireline/selector/alarms_fired",
    description = "Alarms fired by selector loops"
)]
pub static ALARMS_FIRED: Counter = Counter::new(&SELECTOR, selector::ALARMS_FIRED);

// ── DNS ──────────────────────────────────────────────────────────

#[metric(name = "wireline/dns/lookups", description = "Name resolutions attempted")]
pub static DNS_LOOKUPS: Counter = Counter::new(&DNS, dns::LOOKUPS);

#[metric(name = "wireline/dns/failures", description = "Name resolutions that failed")]
pub static DNS_FAILURES: Counter = Counter::new(&DNS, dns::FAILURES);
