//! The named modules of the session manager.
//!
//! Registration order is chain order. The stock arrangement is privacy
//! (filters run first), roster, offline (sees available presence before
//! the presence module consumes it), presence, then groups when enabled.

pub mod groups;
pub mod offline;
pub mod presence;
pub mod privacy;
pub mod roster;

pub use groups::GroupsModule;
pub use offline::OfflineModule;
pub use presence::PresenceModule;
pub use privacy::PrivacyModule;
pub use roster::RosterModule;
