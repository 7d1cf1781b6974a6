//! Instances, handler chains and packet routing.
//!
//! Routing is by destination domain and packet kind: exact host match
//! first, then the `*` wildcard instance for the packet's class. The
//! chosen instance's handlers run in registration order until one returns
//! [`HandlerResult::Done`]; a chain that ends without a taker bounces the
//! packet with the configured default error. Bounced packets are flagged
//! so they can never bounce twice.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::packet::{Packet, PacketKind};
use crate::stanza::{error_reply, StanzaError};

/// What an instance is, deciding which packets can reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceType {
    /// A server-side component (session manager, dialback).
    Server,
    /// A client connection manager.
    Client,
    /// A storage backend; only xdb packets are delivered.
    Xdb,
    /// A log sink; only log packets are delivered.
    Log,
}

/// Routing class: which table a packet kind consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HostClass {
    General,
    Xdb,
    Log,
}

impl HostClass {
    fn of_instance(itype: InstanceType) -> Self {
        match itype {
            InstanceType::Server | InstanceType::Client => HostClass::General,
            InstanceType::Xdb => HostClass::Xdb,
            InstanceType::Log => HostClass::Log,
        }
    }

    fn of_kind(kind: PacketKind) -> Self {
        match kind {
            PacketKind::Normal | PacketKind::Route => HostClass::General,
            PacketKind::Xdb => HostClass::Xdb,
            PacketKind::Log => HostClass::Log,
        }
    }
}

/// Result of one handler in a chain.
pub enum HandlerResult {
    /// The packet was consumed.
    Done,
    /// Not interested; hand the packet to the next handler.
    Pass(Packet),
    /// Refuse the packet with a specific error.
    Err(Packet, StanzaError),
    /// End of the line; bounce as unreachable.
    Last(Packet),
}

/// One link in an instance's delivery chain.
///
/// Handlers run on the router task; long work must stash the packet and
/// finish via another bus call rather than block here.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Offer the packet to this handler.
    async fn handle(&self, packet: Packet) -> HandlerResult;
}

/// A named routing endpoint with its ordered handler chain.
pub struct Instance {
    /// Instance id; also the address other components use to reach it.
    pub id: String,
    /// Instance type.
    pub itype: InstanceType,
    /// Domains this instance accepts, `*` for the wildcard slot.
    pub hosts: Vec<String>,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
}

impl Instance {
    /// Create an instance serving the given hosts.
    pub fn new(
        id: impl Into<String>,
        itype: InstanceType,
        hosts: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            itype,
            hosts,
            handlers: RwLock::new(Vec::new()),
        })
    }

    /// Append a handler to the chain.
    pub fn add_handler(&self, handler: Arc<dyn Handler>) {
        self.handlers.write().expect("handler lock").push(handler);
    }

    fn chain(&self) -> Vec<Arc<dyn Handler>> {
        self.handlers.read().expect("handler lock").clone()
    }
}

/// The delivery bus.
pub struct Router {
    exact: RwLock<HashMap<(HostClass, String), Arc<Instance>>>,
    wildcard: RwLock<HashMap<HostClass, Arc<Instance>>>,
    /// Error used when no handler accepts a packet.
    pub default_error: StanzaError,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// An empty router bouncing unroutable packets with
    /// `service-unavailable`.
    pub fn new() -> Self {
        Self {
            exact: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(HashMap::new()),
            default_error: StanzaError::ServiceUnavailable,
        }
    }

    /// Register an instance under all of its hosts.
    pub fn register(&self, instance: Arc<Instance>) -> Result<(), BusError> {
        let class = HostClass::of_instance(instance.itype);
        for host in &instance.hosts {
            if host == "*" {
                let mut wild = self.wildcard.write().expect("router lock");
                if wild.contains_key(&class) {
                    return Err(BusError::DuplicateInstance(instance.id.clone()));
                }
                wild.insert(class, Arc::clone(&instance));
            } else {
                let mut exact = self.exact.write().expect("router lock");
                let key = (class, host.clone());
                if exact.contains_key(&key) {
                    return Err(BusError::DuplicateInstance(instance.id.clone()));
                }
                exact.insert(key, Arc::clone(&instance));
            }
        }
        Ok(())
    }

    /// Look up the instance a packet of this class would be delivered to:
    /// exact host match first, then the class wildcard.
    pub fn route_for(&self, kind: PacketKind, host: &str) -> Option<Arc<Instance>> {
        let class = HostClass::of_kind(kind);
        self.lookup_exact(class, host)
            .or_else(|| self.lookup_wildcard(class))
    }

    /// The route for a packet. Storage *replies* (xdb envelopes carrying
    /// `type='result'` or `type='error'`) are addressed to the requesting
    /// instance, so they consult the general table; everything else routes
    /// by its own class. Ordinary stanzas never reach an xdb or log
    /// instance either way.
    fn route_packet(&self, packet: &Packet) -> Option<Arc<Instance>> {
        let host = packet.host();
        let is_xdb_reply = packet.kind == PacketKind::Xdb
            && matches!(
                packet.element.attr("type"),
                Some("result") | Some("error")
            );
        if is_xdb_reply {
            return self
                .lookup_exact(HostClass::General, host)
                .or_else(|| self.lookup_wildcard(HostClass::General));
        }
        self.route_for(packet.kind, host)
    }

    fn lookup_exact(&self, class: HostClass, host: &str) -> Option<Arc<Instance>> {
        self.exact
            .read()
            .expect("router lock")
            .get(&(class, host.to_string()))
            .map(Arc::clone)
    }

    fn lookup_wildcard(&self, class: HostClass) -> Option<Arc<Instance>> {
        self.wildcard
            .read()
            .expect("router lock")
            .get(&class)
            .map(Arc::clone)
    }

    /// Deliver a packet, following bounces until everything settles.
    pub async fn deliver(&self, packet: Packet) {
        let mut current = Some(packet);
        while let Some(packet) = current.take() {
            current = self.deliver_once(packet).await;
        }
    }

    /// One routing step; returns the bounce to deliver next, if any.
    async fn deliver_once(&self, mut packet: Packet) -> Option<Packet> {
        let Some(instance) = self.route_packet(&packet) else {
            debug!(host = %packet.host(), "no instance for packet");
            return self.bounce(packet, self.default_error, "no route to host");
        };

        for handler in instance.chain() {
            match handler.handle(packet).await {
                HandlerResult::Done => return None,
                HandlerResult::Pass(p) => packet = p,
                HandlerResult::Err(p, error) => {
                    return self.bounce(p, error, "delivery refused");
                }
                HandlerResult::Last(p) => {
                    return self.bounce(p, self.default_error, "unreachable");
                }
            }
        }

        self.bounce(packet, self.default_error, "no handler accepted packet")
    }

    /// Build the bounce for a dead packet, or drop it.
    fn bounce(&self, packet: Packet, error: StanzaError, text: &str) -> Option<Packet> {
        if packet.bounced {
            warn!(host = %packet.host(), "dropping twice-bounced packet");
            return None;
        }
        let reply = error_reply(&packet.element, error, Some(text))?;
        match Packet::from_element(reply) {
            Ok(mut bounce) => {
                bounce.bounced = true;
                Some(bounce)
            }
            Err(_) => {
                debug!("bounce had no return address, dropping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookery_xml::{ns, Element};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Accepting {
        seen: mpsc::UnboundedSender<Packet>,
    }

    #[async_trait]
    impl Handler for Accepting {
        async fn handle(&self, packet: Packet) -> HandlerResult {
            let _ = self.seen.send(packet);
            HandlerResult::Done
        }
    }

    struct Passing {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for Passing {
        async fn handle(&self, packet: Packet) -> HandlerResult {
            self.count.fetch_add(1, Ordering::SeqCst);
            HandlerResult::Pass(packet)
        }
    }

    fn message(to: &str, from: &str) -> Packet {
        Packet::from_element(
            Element::builder("message", ns::SERVER)
                .attr("to", to)
                .attr("from", from)
                .build(),
        )
        .unwrap()
    }

    fn accepting_instance(
        id: &str,
        hosts: Vec<String>,
    ) -> (Arc<Instance>, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance = Instance::new(id, InstanceType::Server, hosts);
        instance.add_handler(Arc::new(Accepting { seen: tx }));
        (instance, rx)
    }

    #[tokio::test]
    async fn exact_host_wins_over_wildcard() {
        let router = Router::new();
        let (exact, mut exact_rx) = accepting_instance("jsm", vec!["a.example".into()]);
        let (wild, mut wild_rx) = accepting_instance("s2s", vec!["*".into()]);
        router.register(exact).unwrap();
        router.register(wild).unwrap();

        router
            .deliver(message("user@a.example", "peer@b.example"))
            .await;
        assert!(exact_rx.try_recv().is_ok());
        assert!(wild_rx.try_recv().is_err());

        router
            .deliver(message("user@elsewhere.example", "peer@b.example"))
            .await;
        assert!(wild_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn chain_runs_in_order_until_done() {
        let router = Router::new();
        let count = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let instance = Instance::new("jsm", InstanceType::Server, vec!["a.example".into()]);
        instance.add_handler(Arc::new(Passing {
            count: Arc::clone(&count),
        }));
        instance.add_handler(Arc::new(Accepting { seen: tx }));
        router.register(instance).unwrap();

        router
            .deliver(message("user@a.example", "peer@b.example"))
            .await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn unrouted_packets_bounce_to_the_sender() {
        let router = Router::new();
        // only the sender's host is routable
        let (home, mut home_rx) = accepting_instance("jsm", vec!["b.example".into()]);
        router.register(home).unwrap();

        router
            .deliver(message("user@nowhere.example", "peer@b.example"))
            .await;

        let bounce = home_rx.try_recv().expect("bounce delivered to sender");
        assert_eq!(bounce.element.attr("type"), Some("error"));
        assert_eq!(bounce.element.attr("to"), Some("peer@b.example"));
        assert!(bounce.bounced);
    }

    #[tokio::test]
    async fn twice_bounced_packets_are_dropped() {
        let router = Router::new();
        // nothing routable at all: the bounce itself has nowhere to go
        router
            .deliver(message("user@nowhere.example", "peer@gone.example"))
            .await;
        // reaching here without hanging means the loop was broken
    }

    #[tokio::test]
    async fn xdb_packets_only_reach_xdb_instances() {
        let router = Router::new();
        let (general, mut general_rx) = accepting_instance("jsm", vec!["a.example".into()]);
        router.register(general).unwrap();

        let (tx, mut xdb_rx) = mpsc::unbounded_channel();
        let storage = Instance::new("storage", InstanceType::Xdb, vec!["a.example".into()]);
        storage.add_handler(Arc::new(Accepting { seen: tx }));
        router.register(storage).unwrap();

        let xdb = Packet::from_element(
            Element::builder("xdb", ns::SERVER)
                .attr("to", "user@a.example")
                .attr("type", "get")
                .attr("ns", ns::ROSTER)
                .attr("from", "jsm")
                .build(),
        )
        .unwrap();
        router.deliver(xdb).await;

        assert!(xdb_rx.try_recv().is_ok());
        assert!(general_rx.try_recv().is_err());
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let router = Router::new();
        let (a, _) = accepting_instance("one", vec!["a.example".into()]);
        let (b, _) = accepting_instance("two", vec!["a.example".into()]);
        router.register(a).unwrap();
        assert!(matches!(
            router.register(b),
            Err(BusError::DuplicateInstance(_))
        ));
    }
}
