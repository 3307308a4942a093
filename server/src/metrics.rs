//! Framework metrics.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently indexed connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "messages_dispatched",
    description = "Decoded requests handed to process"
)]
pub static MESSAGES_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "messages_returned",
    description = "Messages returned to a reactor for writeback"
)]
pub static MESSAGES_RETURNED: Counter = Counter::new();

#[metric(
    name = "decode_errors",
    description = "Connections closed by framing errors"
)]
pub static DECODE_ERRORS: Counter = Counter::new();

#[metric(
    name = "send_errors",
    description = "Rejected server-initiated sends"
)]
pub static SEND_ERRORS: Counter = Counter::new();
