//! Users and sessions.
//!
//! A [`User`] is created lazily for a bare JID the first time anything
//! touches it, and unloaded when its last session is gone and no module
//! holds a reference. A [`Session`] exists per authenticated resource.
//! Module scratch lives in a typed [`AuxMap`] per user and per session.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};

use rookery_jid::Jid;
use rookery_xml::{ns, Element};

/// Typed per-entity scratch storage for modules.
///
/// Each module declares its own state type; lookups are keyed by that type
/// so modules cannot collide or see each other's data.
#[derive(Default)]
pub struct AuxMap {
    entries: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl AuxMap {
    /// Fetch a module's state.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|b| b.downcast_ref())
    }

    /// Fetch a module's state mutably.
    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.entries
            .get_mut(&TypeId::of::<T>())
            .and_then(|b| b.downcast_mut())
    }

    /// Store a module's state, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Remove a module's state.
    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.entries
            .remove(&TypeId::of::<T>())
            .and_then(|b| b.downcast().ok())
            .map(|b| *b)
    }

    /// Fetch the state, inserting a default first if absent.
    pub fn get_or_default<T: Any + Send + Sync + Default>(&mut self) -> &mut T {
        self.entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(T::default()))
            .downcast_mut()
            .expect("aux entry keyed by its own type")
    }
}

/// Priority value marking a session as gone (terminator pending).
pub const PRIORITY_GONE: i32 = -129;

/// One authenticated resource of a user.
pub struct Session {
    /// Full JID (user plus resource).
    pub jid: Jid,
    /// The resource string.
    pub resource: String,
    /// Route-back address of the connection manager for this session.
    pub cid: Jid,
    /// The session's last presence; starts unavailable.
    pub presence: Element,
    /// Presence priority; `PRIORITY_GONE` means unavailable/gone.
    pub priority: i32,
    /// Whether the client has requested its roster (gets pushes).
    pub roster: bool,
    /// Module scratch.
    pub aux: AuxMap,
}

impl Session {
    /// A fresh, not-yet-available session.
    pub fn new(jid: Jid, cid: Jid) -> Self {
        let resource = jid.resource().unwrap_or_default().to_string();
        let mut presence = Element::new("presence", ns::SERVER);
        presence.set_attr("type", "unavailable");
        Self {
            jid,
            resource,
            cid,
            presence,
            priority: PRIORITY_GONE,
            roster: false,
            aux: AuxMap::default(),
        }
    }

    /// Whether the session currently accepts stanzas addressed to it.
    pub fn available(&self) -> bool {
        self.priority >= -128
    }
}

/// Per-user state on the session manager.
pub struct User {
    /// Bare JID.
    pub jid: Jid,
    /// Active sessions.
    pub sessions: Vec<Session>,
    /// Bare JIDs subscribed to this user's presence (may probe).
    pub trustees: HashSet<String>,
    /// Bare JIDs this user is subscribed to.
    pub seen: HashSet<String>,
    /// Module scratch at user scope.
    pub aux: AuxMap,
    /// References held by modules; the user stays loaded while nonzero.
    pub refs: u32,
}

impl User {
    /// A fresh user with no sessions.
    pub fn new(jid: Jid) -> Self {
        Self {
            jid: jid.bare(),
            sessions: Vec::new(),
            trustees: HashSet::new(),
            seen: HashSet::new(),
            aux: AuxMap::default(),
            refs: 0,
        }
    }

    /// Find a session by resource.
    pub fn session(&self, resource: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.resource == resource)
    }

    /// Find a session by resource, mutably.
    pub fn session_mut(&mut self, resource: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.resource == resource)
    }

    /// Index of a session by resource.
    pub fn session_index(&self, resource: &str) -> Option<usize> {
        self.sessions.iter().position(|s| s.resource == resource)
    }

    /// The available session with the highest priority, if any has
    /// priority ≥ 0 (the target for bare-JID messages).
    pub fn top_session(&self) -> Option<&Session> {
        self.sessions
            .iter()
            .filter(|s| s.available() && s.priority >= 0)
            .max_by_key(|s| s.priority)
    }

    /// Whether this user may be unloaded.
    pub fn removable(&self) -> bool {
        self.sessions.is_empty() && self.refs == 0
    }

    /// Whether a bare JID belongs to the trustees set.
    pub fn is_trustee(&self, bare: &str) -> bool {
        self.trustees.contains(bare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, PartialEq, Debug)]
    struct Scratch {
        hits: u32,
    }

    #[test]
    fn aux_map_is_typed() {
        let mut aux = AuxMap::default();
        assert!(aux.get::<Scratch>().is_none());
        aux.get_or_default::<Scratch>().hits = 3;
        assert_eq!(aux.get::<Scratch>().unwrap().hits, 3);

        aux.insert(Scratch { hits: 9 });
        assert_eq!(aux.remove::<Scratch>(), Some(Scratch { hits: 9 }));
        assert!(aux.get::<Scratch>().is_none());
    }

    #[test]
    fn fresh_sessions_are_gone_until_presence() {
        let jid: Jid = "u@a.example/desk".parse().unwrap();
        let cid: Jid = "c2s.a.example".parse().unwrap();
        let session = Session::new(jid, cid);
        assert!(!session.available());
        assert_eq!(session.presence.attr("type"), Some("unavailable"));
    }

    #[test]
    fn top_session_picks_highest_nonnegative_priority() {
        let mut user = User::new("u@a.example".parse().unwrap());
        let cid: Jid = "c2s.a.example".parse().unwrap();

        for (res, prio) in [("a", -1), ("b", 3), ("c", 7)] {
            let jid: Jid = format!("u@a.example/{}", res).parse().unwrap();
            let mut s = Session::new(jid, cid.clone());
            s.priority = prio;
            user.sessions.push(s);
        }

        assert_eq!(user.top_session().unwrap().resource, "c");

        // sessions below zero never collect bare-JID traffic
        user.sessions.retain(|s| s.priority < 0);
        assert!(user.top_session().is_none());
    }

    #[test]
    fn user_removable_only_without_sessions_and_refs() {
        let mut user = User::new("u@a.example".parse().unwrap());
        assert!(user.removable());
        user.refs = 1;
        assert!(!user.removable());
    }
}
