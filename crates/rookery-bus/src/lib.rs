//! The delivery bus: address-based routing of packets among named
//! instances, plus the XDB storage facade that rides on it.
//!
//! Every component of the server (the session manager, the dialback
//! instance, storage backends, loggers) registers an [`Instance`] with an
//! ordered chain of handlers. Packets are routed by their destination
//! domain and packet kind; the first handler to accept a packet consumes
//! it, and a packet nobody accepts bounces back to its sender with an
//! error stanza.

pub mod deliver;
pub mod error;
pub mod packet;
pub mod stanza;
pub mod xdb;

pub use deliver::{Handler, HandlerResult, Instance, InstanceType, Router};
pub use error::BusError;
pub use packet::{Packet, PacketKind};
pub use stanza::{error_reply, StanzaError};
pub use xdb::{
    MatchSpec, MemoryXdb, XdbBackend, XdbCache, XdbError, XdbInstanceHandler, XdbRequest,
};
