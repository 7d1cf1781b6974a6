//! Error type for the delivery bus.

use thiserror::Error;

/// Errors raised while parsing or routing packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The packet's destination address is missing or unparseable.
    #[error("packet has no routable destination: {0}")]
    BadAddress(String),

    /// No instance accepts packets for this domain.
    #[error("no route for domain {0}")]
    NoRoute(String),

    /// An instance id was registered twice.
    #[error("instance {0} already registered")]
    DuplicateInstance(String),
}
