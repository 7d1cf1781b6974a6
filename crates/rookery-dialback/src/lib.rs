//! Server-to-server dialback.
//!
//! Dialback authenticates that a peer server may assert a source domain:
//! the receiving side sends a challenge key back to the claimed domain's
//! authoritative address and only accepts traffic once the challenge
//! round-trips. This crate hosts both directions:
//!
//! - the outgoing side ([`out`]) keeps a pending connection (`dboc`) per
//!   `(to, from)` domain pair, queues stanzas while authenticating, walks
//!   the resolved candidate addresses, and promotes the stream into the
//!   established table when the peer reports `type='valid'`;
//! - the incoming side ([`incoming`]) issues a random stream id per
//!   connection, relays `db:result` claims as `db:verify` round trips
//!   through the bus, answers `db:verify` challenges from its own secret,
//!   and indexes authorized `(id, to, from)` triples.
//!
//! Established streams in either direction are wrapped in a [`Miod`] that
//! counts stanzas and tracks idle time for the sweep tasks.

pub mod dns;
pub mod incoming;
pub mod key;
pub mod out;

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rookery_bus::{
    error_reply, Handler, HandlerResult, Instance, InstanceType, Packet, PacketKind, Router,
    StanzaError,
};
use rookery_mio::{Accepted, ConnConfig, ConnHandle, Karma, RateConfig};
use rookery_xml::{ns, Element, StreamKind};

use dns::{Candidate, S2sResolver};
use key::{random_secret, random_stream_id};

/// Default idle timeout for established streams, seconds.
pub const DEFAULT_TIMEOUT_IDLE: i64 = 600;

/// Default age limit for queued outgoing packets, seconds.
pub const DEFAULT_TIMEOUT_PACKETS: i64 = 30;

/// Configuration for one dialback instance.
#[derive(Debug, Clone)]
pub struct DialbackConfig {
    /// The instance id on the bus; also the return address for verify
    /// round trips, so bounces come back to us.
    pub instance_id: String,
    /// Domains this server is authoritative for.
    pub local_domains: Vec<String>,
    /// Shared HMAC secret; generated at startup when absent.
    pub secret: Option<String>,
    /// Remote domains allowed to skip dialback (pre-RFC peers). Off by
    /// default; every use is logged.
    pub legacy_peers: Vec<String>,
    /// Idle timeout for established streams.
    pub timeout_idle: i64,
    /// Maximum queue age for packets awaiting authorization.
    pub timeout_packets: i64,
    /// Karma tuning for s2s connections.
    pub karma: Karma,
    /// Accept-rate limit for the s2s listener.
    pub accept_rate: Option<RateConfig>,
}

impl Default for DialbackConfig {
    fn default() -> Self {
        Self {
            instance_id: "s2s".to_string(),
            local_domains: Vec::new(),
            secret: None,
            legacy_peers: Vec::new(),
            timeout_idle: DEFAULT_TIMEOUT_IDLE,
            timeout_packets: DEFAULT_TIMEOUT_PACKETS,
            karma: Karma::default(),
            accept_rate: None,
        }
    }
}

/// Key for outgoing tables: destination and source domains.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutKey {
    /// Remote domain.
    pub to: String,
    /// Local domain the stream speaks for.
    pub from: String,
}

impl fmt::Display for OutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.to, self.from)
    }
}

/// Key for incoming established streams.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InKey {
    /// Our stream id.
    pub id: String,
    /// Local domain.
    pub to: String,
    /// Remote domain.
    pub from: String,
}

impl fmt::Display for InKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.id, self.to, self.from)
    }
}

/// Unix seconds.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A connected, authorized s2s stream with activity accounting.
#[derive(Clone)]
pub struct Miod {
    /// The underlying connection.
    pub conn: ConnHandle,
    last: Arc<AtomicI64>,
    count: Arc<AtomicU64>,
}

impl Miod {
    /// Wrap a connection.
    pub fn new(conn: ConnHandle) -> Self {
        Self {
            conn,
            last: Arc::new(AtomicI64::new(now_secs())),
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Send a stanza, updating the activity counters.
    pub fn write(&self, element: Element) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.touch();
        self.conn.write(element);
    }

    /// Record read activity.
    pub fn touch(&self) {
        self.last.store(now_secs(), Ordering::Relaxed);
    }

    /// Seconds-since-epoch of the last activity.
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Relaxed)
    }

    /// Stanzas carried so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// A pending outgoing connection (`dboc`).
pub struct Dboc {
    /// Table key.
    pub key: OutKey,
    /// Creation time.
    pub stamp: i64,
    /// Mutable side: the queue, pending verifies, and the live socket.
    pub state: Mutex<DbocState>,
}

/// The mutable half of a [`Dboc`].
#[derive(Default)]
pub struct DbocState {
    /// Stanzas waiting for authorization, with enqueue stamps.
    pub queue: Vec<(i64, Element)>,
    /// Verify requests waiting for the socket to open.
    pub verifies: Vec<Element>,
    /// Present once connected and the peer's root is in: verify requests
    /// may be written directly.
    pub conn: Option<ConnHandle>,
    /// Set at promotion time, under the same lock that drains the queue,
    /// so late packets keep their place behind it.
    pub promoted: Option<Miod>,
}

impl Dboc {
    fn new(key: OutKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            stamp: now_secs(),
            state: Mutex::new(DbocState::default()),
        })
    }
}

/// The dialback instance: tables, secret, resolver.
pub struct Dialback {
    /// Instance configuration.
    pub config: DialbackConfig,
    pub(crate) secret: String,
    pub(crate) loop_token: String,
    pub(crate) router: Arc<Router>,
    pub(crate) resolver: S2sResolver,
    pub(crate) out_connecting: DashMap<OutKey, Arc<Dboc>>,
    pub(crate) out_ok_db: DashMap<OutKey, Miod>,
    pub(crate) out_ok_legacy: DashMap<OutKey, Miod>,
    pub(crate) in_id: DashMap<String, mpsc::UnboundedSender<Element>>,
    pub(crate) in_ok_db: DashMap<InKey, Miod>,
    pub(crate) in_ok_legacy: DashMap<InKey, Miod>,
}

impl Dialback {
    /// Build the instance; a missing secret is generated at random.
    pub fn new(config: DialbackConfig, router: Arc<Router>) -> Arc<Self> {
        let secret = config.secret.clone().unwrap_or_else(|| {
            debug!("no dialback secret configured, generating one");
            random_secret()
        });
        Arc::new(Self {
            config,
            secret,
            loop_token: random_stream_id(),
            router,
            resolver: S2sResolver::new(),
            out_connecting: DashMap::new(),
            out_ok_db: DashMap::new(),
            out_ok_legacy: DashMap::new(),
            in_id: DashMap::new(),
            in_ok_db: DashMap::new(),
            in_ok_legacy: DashMap::new(),
        })
    }

    /// Register this instance as the wildcard server route and start the
    /// s2s listener plus the sweep tasks.
    pub fn start(self: &Arc<Self>, listener: TcpListener) -> Result<(), rookery_bus::BusError> {
        let instance = Instance::new(
            self.config.instance_id.clone(),
            InstanceType::Server,
            vec!["*".to_string(), self.config.instance_id.clone()],
        );
        instance.add_handler(Arc::new(DialbackHandler {
            db: Arc::clone(self),
        }));
        self.router.register(instance)?;

        let mut accepted = rookery_mio::listen(
            listener,
            self.conn_config(true),
            self.config.accept_rate,
        );
        let db = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(Accepted { handle, events, peer }) = accepted.recv().await {
                debug!(peer = %peer, "incoming s2s connection");
                tokio::spawn(incoming::run_incoming(
                    Arc::clone(&db),
                    handle,
                    events,
                ));
            }
        });

        self.start_sweeps();
        Ok(())
    }

    /// The connection tuning used for s2s sockets.
    pub(crate) fn conn_config(&self, sniff: bool) -> ConnConfig {
        ConnConfig {
            kind: StreamKind::Server,
            xml_mode: true,
            karma: self.config.karma,
            declared: vec![
                (String::new(), ns::SERVER.to_string()),
                ("stream".to_string(), ns::STREAM.to_string()),
                ("db".to_string(), ns::DIALBACK.to_string()),
            ],
            sniff,
            http: None,
            policy_domains: Vec::new(),
        }
    }

    /// Whether we are authoritative for a domain.
    pub(crate) fn is_local(&self, domain: &str) -> bool {
        self.config.local_domains.iter().any(|d| d == domain)
    }

    /// Remember resolved candidates for a remote host (the local
    /// resolution cache; also used to pin peers in tests).
    pub fn ip_set(&self, host: &str, candidates: &str) {
        self.resolver.seed(host, candidates);
    }

    /// The cached candidate list for a host, comma-separated.
    pub fn ip_get(&self, host: &str) -> Option<String> {
        self.resolver
            .cached(host)
            .map(|list| dns::join_candidates(&list))
    }

    /// Whether an authorized outgoing stream exists for `(to, from)`.
    pub fn out_established(&self, to: &str, from: &str) -> bool {
        let key = OutKey {
            to: to.to_string(),
            from: from.to_string(),
        };
        self.out_ok_db.contains_key(&key) || self.out_ok_legacy.contains_key(&key)
    }

    /// How many outgoing connections are still authenticating.
    pub fn connecting_count(&self) -> usize {
        self.out_connecting.len()
    }

    /// How many authorized incoming `(id, to, from)` entries exist.
    pub fn in_established_count(&self) -> usize {
        self.in_ok_db.len() + self.in_ok_legacy.len()
    }

    /// Route a verify element (request answer or bounced request) to the
    /// incoming stream that is waiting for it, by stream id.
    pub fn in_verify(&self, element: Element) {
        let Some(id) = element.attr("id").map(str::to_string) else {
            warn!("verify response without id, dropping");
            return;
        };
        match self.in_id.get(&id) {
            Some(tx) => {
                let _ = tx.send(element);
            }
            None => debug!(id = %id, "verify response for unknown stream"),
        }
    }

    /// Bounce a stanza back to its sender over the bus.
    pub(crate) async fn bounce(&self, element: Element, error: StanzaError, text: &str) {
        let Some(reply) = error_reply(&element, error, Some(text)) else {
            return;
        };
        match Packet::from_element(reply) {
            Ok(mut packet) => {
                packet.bounced = true;
                self.router.deliver(packet).await;
            }
            Err(e) => debug!(error = %e, "bounce unroutable"),
        }
    }

    /// Abort a pending connection: bounce its queue, fail its verifies.
    pub(crate) async fn kill_dboc(&self, key: &OutKey) {
        let Some((_, dboc)) = self.out_connecting.remove(key) else {
            return;
        };
        info!(key = %key, "outgoing dialback connection failed");

        let (queue, verifies) = {
            let mut state = dboc.state.lock().expect("dboc lock");
            (
                std::mem::take(&mut state.queue),
                std::mem::take(&mut state.verifies),
            )
        };

        for (_, element) in queue {
            self.bounce(
                element,
                StanzaError::RemoteServerFailed,
                "server connect failed",
            )
            .await;
        }
        for mut verify in verifies {
            // answer the waiting incoming stream as a failed trip
            verify.set_attr("type", "error");
            self.in_verify(verify);
        }
    }

    /// Remove established entries owned by a closed connection, logging
    /// the accounting record.
    pub(crate) fn drop_conn_entries(&self, conn_id: u64) {
        for (table, name, direction) in [
            (&self.out_ok_db, "dialback", "out"),
            (&self.out_ok_legacy, "legacy", "out"),
        ] {
            table.retain(|key, miod| {
                if miod.conn.id() == conn_id {
                    info!(
                        key = %key,
                        direction = direction,
                        kind = name,
                        stanzas = miod.count(),
                        "s2s stream closed"
                    );
                    false
                } else {
                    true
                }
            });
        }
        for (table, name) in [(&self.in_ok_db, "dialback"), (&self.in_ok_legacy, "legacy")] {
            table.retain(|key, miod| {
                if miod.conn.id() == conn_id {
                    info!(
                        key = %key,
                        direction = "in",
                        kind = name,
                        stanzas = miod.count(),
                        "s2s stream closed"
                    );
                    false
                } else {
                    true
                }
            });
        }
    }

    fn start_sweeps(self: &Arc<Self>) {
        // idle streams
        let db = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let now = now_secs();
                let idle = db.config.timeout_idle;
                for table in [&db.out_ok_db, &db.out_ok_legacy] {
                    table.retain(|key, miod| {
                        if now - miod.last() >= idle {
                            info!(key = %key, "closing idle outgoing s2s stream");
                            close_with_stream_error(&miod.conn, "connection-timeout", "Idle Timeout");
                            false
                        } else {
                            true
                        }
                    });
                }
                for table in [&db.in_ok_db, &db.in_ok_legacy] {
                    table.retain(|key, miod| {
                        if now - miod.last() >= idle {
                            info!(key = %key, "closing idle incoming s2s stream");
                            close_with_stream_error(&miod.conn, "connection-timeout", "Idle Timeout");
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        });

        // stale queued packets
        let db = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let now = now_secs();
                let limit = db.config.timeout_packets;
                let mut expired = Vec::new();
                for entry in db.out_connecting.iter() {
                    let mut state = entry.value().state.lock().expect("dboc lock");
                    let (old, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.queue)
                        .into_iter()
                        .partition(|(stamp, _)| now - *stamp > limit);
                    state.queue = fresh;
                    expired.extend(old.into_iter().map(|(_, el)| el));
                }
                for element in expired {
                    db.bounce(
                        element,
                        StanzaError::RemoteServerTimeout,
                        "server connect timeout",
                    )
                    .await;
                }
            }
        });
    }
}

/// Write a stream error and close.
pub(crate) fn close_with_stream_error(conn: &ConnHandle, condition: &str, text: &str) {
    let mut error = Element::new("error", ns::STREAM);
    error.append_child(Element::new(condition, ns::XMPP_STREAMS));
    let mut t = Element::new("text", ns::XMPP_STREAMS);
    t.append_text(text);
    error.append_child(t);
    conn.write(error);
    conn.write_bytes(b"</stream:stream>".to_vec());
    conn.close();
}

/// The bus-facing handler of the dialback instance.
struct DialbackHandler {
    db: Arc<Dialback>,
}

#[async_trait]
impl Handler for DialbackHandler {
    async fn handle(&self, packet: Packet) -> HandlerResult {
        // routes from other components carry the payload one level down
        let (element, ip) = if packet.kind == PacketKind::Route {
            let ip = packet.element.attr("ip").map(str::to_string);
            match packet.element.children().next() {
                Some(child) => (child.clone(), ip),
                None => return HandlerResult::Done,
            }
        } else {
            (packet.element, None)
        };

        // everything addressed to our own id is a verify answer (or a
        // bounced verify) for the incoming side
        if packet.to.domain() == self.db.config.instance_id {
            self.db.in_verify(element);
            return HandlerResult::Done;
        }

        out::handle_packet(&self.db, element, ip).await;
        HandlerResult::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_key_formats_as_the_table_key() {
        let key = OutKey {
            to: "b.example".into(),
            from: "a.example".into(),
        };
        assert_eq!(key.to_string(), "b.example/a.example");
    }

    #[test]
    fn in_key_encodes_the_triple() {
        let key = InKey {
            id: "abc".into(),
            to: "a.example".into(),
            from: "b.example".into(),
        };
        assert_eq!(key.to_string(), "abc@a.example/b.example");
    }

    #[test]
    fn secret_is_generated_when_unconfigured() {
        let router = Arc::new(Router::new());
        let db = Dialback::new(DialbackConfig::default(), router);
        assert!(!db.secret.is_empty());
    }
}
