//! The session manager.
//!
//! Hosts the per-user logic for local accounts: session lifecycle, the
//! event pipelines, and the modules that implement presence, roster,
//! offline storage, privacy lists and shared groups.
//!
//! # Pipelines
//!
//! Inbound stanzas run `e_DELIVER` then, per target session, the
//! `es_FILTER_IN`/`es_IN` chains; a bare-JID message with no available
//! session runs `e_OFFLINE`. Stanzas from a session run `es_FILTER_OUT`
//! then `es_OUT` before they are routed. IQ addressed to the server's bare
//! domain runs `e_SERVER`. Each chain stops at the first module returning
//! [`ModRet::Handled`].
//!
//! # Concurrency
//!
//! Every user has one worker task owning its [`User`]; all module
//! callbacks for that user run there, in arrival order, so per-user state
//! needs no locks. Cross-user traffic goes back over the bus.
//!
//! # Session control interface
//!
//! The connection manager (c2s) is an external collaborator speaking
//! route packets:
//!
//! - `<route type='session' to='u@host/res' from='CID'/>` opens a session
//!   for an authenticated stream (answered with the same envelope, or
//!   `type='error'` when the resource is taken),
//! - `<route to='u@host/res' from='CID'><stanza/></route>` carries a
//!   stanza from the client,
//! - `<route type='error' to='u@host/res' from='CID'/>` is the
//!   terminator: the session ends and the user may unload,
//! - stanzas for the client leave as
//!   `<route to='CID' from='u@host/res'><stanza/></route>`.

pub mod modules;
pub mod user;
pub mod util;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use rookery_bus::{
    error_reply, Handler, HandlerResult, Instance, InstanceType, Packet, PacketKind, Router,
    StanzaError, XdbCache,
};
use rookery_jid::Jid;
use rookery_xml::{ns, Element};

pub use user::{AuxMap, Session, User, PRIORITY_GONE};

/// Verdict of one module in a chain.
pub enum ModRet {
    /// The packet was consumed; the chain stops.
    Handled,
    /// Not interested (or done observing); the chain continues.
    Pass(Packet),
}

/// A named subsystem hooked into the session manager's event chains.
///
/// Every hook defaults to passing; modules implement only the events they
/// care about. Per-user and per-session state lives in the [`AuxMap`]s.
#[allow(unused_variables)]
#[async_trait]
pub trait Module: Send + Sync {
    /// The module's name, for logs.
    fn name(&self) -> &'static str;

    /// Features this module adds to the server's disco#info identity.
    fn features(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// A new session was established (`e_SESSION`).
    async fn session_new(&self, jsm: &Jsm, user: &mut User, resource: &str) {}

    /// A session is closing (`es_END`).
    async fn session_end(&self, jsm: &Jsm, user: &mut User, resource: &str) {}

    /// A persisted session is being restored (`e_DESERIALIZE`).
    async fn deserialize(&self, jsm: &Jsm, user: &mut User, resource: &str, data: &Element) {}

    /// A session is being snapshotted (`es_SERIALIZE`).
    async fn serialize(&self, jsm: &Jsm, user: &User, resource: &str, out: &mut Element) {}

    /// Inbound stanza entering the manager (`e_DELIVER`).
    async fn deliver(&self, jsm: &Jsm, user: &mut User, packet: Packet) -> ModRet {
        ModRet::Pass(packet)
    }

    /// Stanza about to reach an offline user (`e_OFFLINE`).
    async fn offline(&self, jsm: &Jsm, user: &mut User, packet: Packet) -> ModRet {
        ModRet::Pass(packet)
    }

    /// User-scope inbound filter (`e_FILTER_IN`), used on offline paths.
    async fn filter_in(&self, jsm: &Jsm, user: &mut User, packet: Packet) -> ModRet {
        ModRet::Pass(packet)
    }

    /// Per-session inbound filter (`es_FILTER_IN`).
    async fn filter_in_session(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: Packet,
    ) -> ModRet {
        ModRet::Pass(packet)
    }

    /// Stanza delivered to a session (`es_IN`).
    async fn in_session(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: Packet,
    ) -> ModRet {
        ModRet::Pass(packet)
    }

    /// Per-session outbound filter (`es_FILTER_OUT`).
    async fn filter_out(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: Packet,
    ) -> ModRet {
        ModRet::Pass(packet)
    }

    /// Stanza sent by a session (`es_OUT`).
    async fn out(&self, jsm: &Jsm, user: &mut User, resource: &str, packet: Packet) -> ModRet {
        ModRet::Pass(packet)
    }

    /// IQ addressed to the server's bare domain (`e_SERVER`).
    async fn server(&self, jsm: &Jsm, packet: Packet) -> ModRet {
        ModRet::Pass(packet)
    }

    /// The roster just changed (`e_ROSTERCHANGE`).
    async fn rosterchange(&self, jsm: &Jsm, user: &mut User, item: &Element) {}

    /// The user account is being removed (`e_DELETE`).
    async fn delete(&self, jsm: &Jsm, user: &mut User) {}

    /// Instance teardown (`e_SHUTDOWN`).
    async fn shutdown(&self, jsm: &Jsm) {}
}

/// Configuration for a session manager instance.
#[derive(Debug, Clone)]
pub struct JsmConfig {
    /// Instance id on the bus.
    pub instance_id: String,
    /// Domains served.
    pub hosts: Vec<String>,
    /// Server name advertised in disco#info.
    pub server_name: String,
}

impl Default for JsmConfig {
    fn default() -> Self {
        Self {
            instance_id: "sessions".to_string(),
            hosts: Vec::new(),
            server_name: "rookery".to_string(),
        }
    }
}

enum UserWork {
    Inbound(Packet),
    Control(Packet),
}

/// The session manager instance.
pub struct Jsm {
    /// Configuration.
    pub config: JsmConfig,
    /// The delivery bus.
    pub router: Arc<Router>,
    /// Storage facade.
    pub xdb: Arc<XdbCache>,
    users: DashMap<String, mpsc::UnboundedSender<UserWork>>,
    modules: RwLock<Vec<Arc<dyn Module>>>,
}

impl Jsm {
    /// Build the manager. Call [`Jsm::register_module`] for each module,
    /// then [`Jsm::start`].
    pub fn new(config: JsmConfig, router: Arc<Router>, xdb: Arc<XdbCache>) -> Arc<Self> {
        Arc::new(Self {
            config,
            router,
            xdb,
            users: DashMap::new(),
            modules: RwLock::new(Vec::new()),
        })
    }

    /// Append a module; chain order is registration order.
    pub fn register_module(&self, module: Arc<dyn Module>) {
        info!(module = module.name(), "session manager module loaded");
        self.modules.write().expect("module lock").push(module);
    }

    /// Register the instance on the bus.
    pub fn start(self: &Arc<Self>) -> Result<(), rookery_bus::BusError> {
        let mut hosts = self.config.hosts.clone();
        hosts.push(self.config.instance_id.clone());
        let instance = Instance::new(
            self.config.instance_id.clone(),
            InstanceType::Server,
            hosts,
        );
        instance.add_handler(self.xdb.handler());
        instance.add_handler(Arc::new(JsmHandler {
            jsm: Arc::clone(self),
        }));
        self.router.register(instance)
    }

    /// Whether a domain belongs to this instance.
    pub fn is_local(&self, domain: &str) -> bool {
        self.config.hosts.iter().any(|h| h == domain)
    }

    pub(crate) fn modules(&self) -> Vec<Arc<dyn Module>> {
        self.modules.read().expect("module lock").clone()
    }

    /// Route an element into the bus; unroutable elements are dropped.
    pub async fn deliver(&self, element: Element) {
        match Packet::from_element(element) {
            Ok(packet) => self.router.deliver(packet).await,
            Err(e) => debug!(error = %e, "undeliverable element dropped"),
        }
    }

    /// Send a stanza to a session's client connection.
    pub async fn send_to_client(&self, cid: &Jid, from: &Jid, stanza: Element) {
        let route = Element::builder("route", ns::SERVER)
            .attr("to", cid.to_string())
            .attr("from", from.to_string())
            .append(stanza)
            .build();
        self.deliver(route).await;
    }

    /// Bounce a stanza with an error, back through the bus.
    pub async fn bounce(&self, element: &Element, error: StanzaError) {
        if let Some(reply) = error_reply(element, error, None) {
            self.deliver(reply).await;
        }
    }

    /// Fire `e_SHUTDOWN` on every module.
    pub async fn shutdown(&self) {
        for module in self.modules() {
            module.shutdown(self).await;
        }
    }

    /// Hand work to a user's worker, creating the user lazily.
    fn dispatch_user(self: &Arc<Self>, bare: &str, mut work: UserWork) {
        loop {
            let tx = self
                .users
                .entry(bare.to_string())
                .or_insert_with(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    let jsm = Arc::clone(self);
                    let bare = bare.to_string();
                    tokio::spawn(user_worker(jsm, bare, rx));
                    tx
                })
                .clone();
            match tx.send(work) {
                Ok(()) => return,
                Err(mpsc::error::SendError(w)) => {
                    // the worker unloaded between lookup and send; drop the
                    // stale entry (only if it is still the same channel)
                    self.users
                        .remove_if(bare, |_, entry| entry.same_channel(&tx));
                    work = w;
                }
            }
        }
    }
}

/// The bus-facing handler of the session manager.
struct JsmHandler {
    jsm: Arc<Jsm>,
}

#[async_trait]
impl Handler for JsmHandler {
    async fn handle(&self, packet: Packet) -> HandlerResult {
        match packet.kind {
            PacketKind::Normal => {
                if packet.to.node().is_none() {
                    return server_packet(&self.jsm, packet).await;
                }
                let bare = packet.to.user();
                self.jsm.dispatch_user(&bare, UserWork::Inbound(packet));
                HandlerResult::Done
            }
            PacketKind::Route => {
                if packet.to.node().is_none() {
                    debug!("route packet without user target, dropping");
                    return HandlerResult::Done;
                }
                let bare = packet.to.user();
                self.jsm.dispatch_user(&bare, UserWork::Control(packet));
                HandlerResult::Done
            }
            _ => HandlerResult::Pass(packet),
        }
    }
}

/// `e_SERVER`: stanzas addressed to a bare server domain.
async fn server_packet(jsm: &Arc<Jsm>, mut packet: Packet) -> HandlerResult {
    for module in jsm.modules() {
        match module.server(jsm, packet).await {
            ModRet::Handled => return HandlerResult::Done,
            ModRet::Pass(p) => packet = p,
        }
    }

    // default server answers: disco#info from the module features
    if packet.element.name() == "iq" && packet.stanza_type() == Some("get") {
        if let Some(query) = packet.element.get_child("query", ns::DISCO_INFO) {
            if query.attr("node").is_none() {
                let mut result = Element::new("query", ns::DISCO_INFO);
                result.append_child(
                    Element::builder("identity", ns::DISCO_INFO)
                        .attr("category", "server")
                        .attr("type", "im")
                        .attr("name", jsm.config.server_name.clone())
                        .build(),
                );
                let mut features: Vec<&'static str> = vec![ns::DISCO_INFO, ns::DISCO_ITEMS];
                for module in jsm.modules() {
                    features.extend(module.features());
                }
                for feature in features {
                    result.append_child(
                        Element::builder("feature", ns::DISCO_INFO)
                            .attr("var", feature)
                            .build(),
                    );
                }
                let mut reply = packet.element.clone();
                util::tofrom(&mut reply);
                reply.set_attr("type", "result");
                reply.set_nodes(Vec::new());
                reply.append_child(result);
                jsm.deliver(reply).await;
                return HandlerResult::Done;
            }
        }
    }

    if packet.element.name() == "iq" && matches!(packet.stanza_type(), Some("get") | Some("set")) {
        jsm.bounce(&packet.element, StanzaError::FeatureNotImplemented)
            .await;
        return HandlerResult::Done;
    }

    // non-iq server traffic (spam for the admin) is dropped
    HandlerResult::Done
}

/// The per-user worker: owns the [`User`], processes work in order.
async fn user_worker(jsm: Arc<Jsm>, bare: String, mut rx: mpsc::UnboundedReceiver<UserWork>) {
    let jid: Jid = match bare.parse() {
        Ok(jid) => jid,
        Err(e) => {
            warn!(bare = %bare, error = %e, "refusing user with invalid jid");
            jsm.users.remove(&bare);
            return;
        }
    };
    let mut user = User::new(jid);
    debug!(user = %bare, "user loaded");

    loop {
        // drain buffered work before deciding the user may unload
        let work = match rx.try_recv() {
            Ok(work) => work,
            Err(mpsc::error::TryRecvError::Empty) => {
                if user.removable() {
                    break;
                }
                match rx.recv().await {
                    Some(work) => work,
                    None => break,
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        };

        match work {
            UserWork::Inbound(packet) => deliver_in(&jsm, &mut user, packet).await,
            UserWork::Control(packet) => session_control(&jsm, &mut user, packet).await,
        }
    }

    // refuse new work, then hand anything that raced in to a fresh worker
    rx.close();
    jsm.users.remove(&bare);
    while let Some(work) = rx.recv().await {
        jsm.dispatch_user(&bare, work);
    }
    debug!(user = %bare, "user unloaded");
}

/// Inbound pipeline: `e_DELIVER`, then session or offline handling.
#[instrument(skip_all, fields(user = %user.jid, stanza = %packet.element.name()))]
async fn deliver_in(jsm: &Arc<Jsm>, user: &mut User, mut packet: Packet) {
    for module in jsm.modules() {
        match module.deliver(jsm, user, packet).await {
            ModRet::Handled => return,
            ModRet::Pass(p) => packet = p,
        }
    }

    match packet.to.resource() {
        Some(resource) => {
            let resource = resource.to_string();
            let deliverable = user
                .session(&resource)
                .map(|s| s.available())
                .unwrap_or(false);
            if deliverable {
                session_in(jsm, user, &resource, packet).await;
            } else {
                // the addressed resource is gone; messages fall back to
                // the bare address, presence is dropped, iq errors out
                match packet.element.name() {
                    "message" => bare_in(jsm, user, packet).await,
                    "presence" => {}
                    _ => {
                        jsm.bounce(&packet.element, StanzaError::RecipientUnavailable)
                            .await
                    }
                }
            }
        }
        None => bare_in(jsm, user, packet).await,
    }
}

/// Inbound for the bare address.
async fn bare_in(jsm: &Arc<Jsm>, user: &mut User, packet: Packet) {
    match packet.element.name() {
        "presence" => {
            let resources: Vec<String> = user
                .sessions
                .iter()
                .filter(|s| s.available())
                .map(|s| s.resource.clone())
                .collect();
            for resource in resources {
                session_in(jsm, user, &resource, packet.clone()).await;
            }
        }
        "message" => {
            if let Some(top) = user.top_session() {
                let resource = top.resource.clone();
                session_in(jsm, user, &resource, packet).await;
            } else {
                offline_in(jsm, user, packet).await;
            }
        }
        _ => {
            jsm.bounce(&packet.element, StanzaError::ServiceUnavailable)
                .await;
        }
    }
}

/// `e_FILTER_IN` then `e_OFFLINE` for a user with no available session.
async fn offline_in(jsm: &Arc<Jsm>, user: &mut User, mut packet: Packet) {
    for module in jsm.modules() {
        match module.filter_in(jsm, user, packet).await {
            ModRet::Handled => return,
            ModRet::Pass(p) => packet = p,
        }
    }
    for module in jsm.modules() {
        match module.offline(jsm, user, packet).await {
            ModRet::Handled => return,
            ModRet::Pass(p) => packet = p,
        }
    }
    jsm.bounce(&packet.element, StanzaError::ServiceUnavailable)
        .await;
}

/// `es_FILTER_IN` then `es_IN`, defaulting to client delivery.
async fn session_in(jsm: &Arc<Jsm>, user: &mut User, resource: &str, mut packet: Packet) {
    for module in jsm.modules() {
        match module
            .filter_in_session(jsm, user, resource, packet)
            .await
        {
            ModRet::Handled => return,
            ModRet::Pass(p) => packet = p,
        }
    }
    for module in jsm.modules() {
        match module.in_session(jsm, user, resource, packet).await {
            ModRet::Handled => return,
            ModRet::Pass(p) => packet = p,
        }
    }

    let Some(session) = user.session(resource) else {
        return;
    };
    let cid = session.cid.clone();
    let from = session.jid.clone();
    jsm.send_to_client(&cid, &from, packet.element).await;
}

/// Route packets: session lifecycle and stanzas from the client.
async fn session_control(jsm: &Arc<Jsm>, user: &mut User, packet: Packet) {
    let route_type = packet.element.attr("type").map(str::to_string);
    let Some(cid) = packet.from.clone() else {
        debug!("route packet without return address, dropping");
        return;
    };

    match route_type.as_deref() {
        Some("session") => {
            let full = packet.to.clone();
            let Some(resource) = full.resource() else {
                warn!(user = %user.jid, "session start without resource");
                return;
            };
            if user.session(resource).is_some() {
                // the resource is taken; refuse
                let refusal = Element::builder("route", ns::SERVER)
                    .attr("type", "error")
                    .attr("to", cid.to_string())
                    .attr("from", full.to_string())
                    .build();
                jsm.deliver(refusal).await;
                return;
            }

            info!(session = %full, "session starting");
            user.sessions.push(Session::new(full.clone(), cid.clone()));
            let resource = resource.to_string();
            for module in jsm.modules() {
                module.session_new(jsm, user, &resource).await;
            }

            // a snapshot riding the start route restores the old session
            if let Some(snapshot) = packet.element.get_child("session", ns::SESSION).cloned() {
                for module in jsm.modules() {
                    module.deserialize(jsm, user, &resource, &snapshot).await;
                }
            }

            let ack = Element::builder("route", ns::SERVER)
                .attr("type", "session")
                .attr("to", cid.to_string())
                .attr("from", full.to_string())
                .build();
            jsm.deliver(ack).await;
        }

        Some("serialize") => {
            // snapshot the session for a connection-manager handoff
            let Some(resource) = packet.to.resource().map(str::to_string) else {
                return;
            };
            if user.session(&resource).is_none() {
                return;
            }
            let mut snapshot = Element::new("session", ns::SESSION);
            snapshot.set_attr("jid", packet.to.to_string());
            for module in jsm.modules() {
                module.serialize(jsm, user, &resource, &mut snapshot).await;
            }
            let reply = Element::builder("route", ns::SERVER)
                .attr("type", "serialize")
                .attr("to", cid.to_string())
                .attr("from", packet.to.to_string())
                .append(snapshot)
                .build();
            jsm.deliver(reply).await;
        }

        Some("error") => {
            let Some(resource) = packet.to.resource().map(str::to_string) else {
                return;
            };
            if user.session(&resource).is_none() {
                return;
            }
            info!(session = %packet.to, "session ending");
            for module in jsm.modules() {
                module.session_end(jsm, user, &resource).await;
            }
            if let Some(idx) = user.session_index(&resource) {
                user.sessions.remove(idx);
            }
        }

        _ => {
            // a stanza from the session
            let Some(resource) = packet.to.resource().map(str::to_string) else {
                return;
            };
            let Some(session) = user.session(&resource) else {
                debug!(to = %packet.to, "stanza from unknown session, dropping");
                return;
            };
            let full = session.jid.clone();
            let Some(mut stanza) = packet.element.children().next().cloned() else {
                return;
            };
            // sessions may not forge their origin
            stanza.set_attr("from", full.to_string());
            session_out(jsm, user, &resource, stanza).await;
        }
    }
}

/// `es_FILTER_OUT` then `es_OUT`, defaulting to routing the stanza out.
pub(crate) async fn session_out(
    jsm: &Arc<Jsm>,
    user: &mut User,
    resource: &str,
    stanza: Element,
) {
    let mut packet = match Packet::from_element(stanza.clone()) {
        Ok(p) => p,
        Err(_) => {
            // no to address: modules (presence above all) claim these
            Packet {
                kind: PacketKind::Normal,
                to: user.jid.clone(),
                from: Some(
                    user.session(resource)
                        .map(|s| s.jid.clone())
                        .unwrap_or_else(|| user.jid.clone()),
                ),
                element: stanza,
                bounced: false,
            }
        }
    };

    for module in jsm.modules() {
        match module.filter_out(jsm, user, resource, packet).await {
            ModRet::Handled => return,
            ModRet::Pass(p) => packet = p,
        }
    }
    for module in jsm.modules() {
        match module.out(jsm, user, resource, packet).await {
            ModRet::Handled => return,
            ModRet::Pass(p) => packet = p,
        }
    }

    if packet.element.attr("to").is_none() {
        jsm.bounce(&packet.element, StanzaError::BadRequest).await;
        return;
    }
    jsm.deliver(packet.element).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = JsmConfig::default();
        assert_eq!(config.instance_id, "sessions");
        assert!(config.hosts.is_empty());
    }
}
