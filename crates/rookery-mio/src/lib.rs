//! Managed I/O: sockets, XML streams, karma and timers.
//!
//! One driver task per connection reads under a karma budget, parses the
//! inbound XML stream, drains a FIFO queue of typed write entries, and
//! reports events to the owning instance. Listeners apply a per-IP rate
//! limit at accept time and run the historical first-read sniffs for
//! port-sharing clients.

pub mod conn;
pub mod karma;
pub mod legacy;
pub mod rate;

pub use conn::{
    connect, listen, spawn, Accepted, ConnConfig, ConnEvent, ConnHandle, READ_BUF_SIZE,
};
pub use karma::{Karma, KARMA_HEARTBEAT, KARMA_INIT, KARMA_MAX, KARMA_PENALTY, KARMA_RESTORE};
pub use legacy::{HttpAnswer, Sniff};
pub use rate::{RateConfig, RateLimit};
