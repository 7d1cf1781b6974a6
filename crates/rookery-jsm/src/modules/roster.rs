//! The roster module: contact list storage and subscription states.
//!
//! Roster items live in storage under `jabber:iq:roster`, one `<item/>`
//! per contact. Subscription state transitions follow XMPP IM; every
//! mutation is pushed to sessions that have requested their roster and
//! fires the roster-change event for the other modules. Inbound
//! subscription requests are additionally persisted under the stored
//! subscription request namespace so they survive restarts, and are
//! re-delivered when the user next requests the roster.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use rookery_bus::{MatchSpec, Packet, StanzaError};
use rookery_jid::Jid;
use rookery_xml::{ns, Element};

use crate::user::User;
use crate::util;
use crate::{Jsm, ModRet, Module};

/// Subscription state of a roster item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Subscription {
    /// No subscription in either direction.
    #[default]
    None,
    /// We receive the contact's presence.
    To,
    /// The contact receives ours.
    From,
    /// Mutual.
    Both,
}

impl Subscription {
    fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
        }
    }

    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("to") => Subscription::To,
            Some("from") => Subscription::From,
            Some("both") => Subscription::Both,
            _ => Subscription::None,
        }
    }

    /// Whether the contact sees our presence.
    pub fn is_from(&self) -> bool {
        matches!(self, Subscription::From | Subscription::Both)
    }

    /// Whether we see the contact's presence.
    pub fn is_to(&self) -> bool {
        matches!(self, Subscription::To | Subscription::Both)
    }
}

/// One roster item, keyed by the contact's bare JID.
#[derive(Debug, Clone, Default)]
pub struct RosterItem {
    /// Contact bare JID.
    pub jid: String,
    /// Display name.
    pub name: Option<String>,
    /// Subscription state.
    pub subscription: Subscription,
    /// Pending outbound request (`ask='subscribe'`).
    pub ask: bool,
    /// Stored text of a pending inbound request.
    pub pending_in: Option<String>,
    /// The item exists only because of a pending inbound request.
    pub hidden: bool,
    /// Group names.
    pub groups: Vec<String>,
}

impl RosterItem {
    /// A fresh item for a contact.
    pub fn new(jid: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            ..Self::default()
        }
    }

    /// Parse a stored or client-sent item element.
    pub fn from_element(el: &Element) -> Option<Self> {
        let jid = el.attr("jid")?.to_string();
        Some(Self {
            jid,
            name: el.attr("name").map(str::to_string),
            subscription: Subscription::parse(el.attr("subscription")),
            ask: el.attr("ask") == Some("subscribe"),
            pending_in: el.attr("subscribe").map(str::to_string),
            hidden: el.attr("hidden").is_some(),
            groups: el
                .children()
                .filter(|c| c.name() == "group")
                .map(|g| g.text())
                .collect(),
        })
    }

    /// Serialize; `for_client` strips the internal bookkeeping.
    pub fn to_element(&self, for_client: bool) -> Element {
        let mut item = Element::new("item", ns::ROSTER);
        item.set_attr("jid", self.jid.clone());
        if let Some(name) = &self.name {
            item.set_attr("name", name.clone());
        }
        item.set_attr("subscription", self.subscription.as_str());
        if self.ask {
            item.set_attr("ask", "subscribe");
        }
        if !for_client {
            if let Some(text) = &self.pending_in {
                item.set_attr("subscribe", text.clone());
            }
            if self.hidden {
                item.set_attr("hidden", "hidden");
            }
        }
        for group in &self.groups {
            let mut g = Element::new("group", ns::ROSTER);
            g.append_text(group.clone());
            item.append_child(g);
        }
        item
    }
}

/// The roster module.
pub struct RosterModule;

impl RosterModule {
    /// Create the module.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    /// Load the full roster from storage.
    pub async fn load(jsm: &Jsm, user: &User) -> Vec<RosterItem> {
        match jsm.xdb.get(&user.jid, ns::ROSTER).await {
            Some(container) => container
                .children()
                .filter_map(RosterItem::from_element)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Load one item.
    async fn load_item(jsm: &Jsm, user: &User, contact: &str) -> Option<RosterItem> {
        Self::load(jsm, user)
            .await
            .into_iter()
            .find(|i| i.jid == contact)
    }

    /// Persist one item, replacing any stored copy.
    async fn save_item(jsm: &Jsm, user: &User, item: &RosterItem) {
        let spec = MatchSpec::AttrEq {
            name: "jid".into(),
            value: item.jid.clone(),
        };
        jsm.xdb
            .insert(&user.jid, ns::ROSTER, &spec, item.to_element(false))
            .await;
    }

    /// Remove one item from storage.
    async fn delete_item(jsm: &Jsm, user: &User, contact: &str) {
        let spec = MatchSpec::AttrEq {
            name: "jid".into(),
            value: contact.to_string(),
        };
        jsm.xdb.delete_matching(&user.jid, ns::ROSTER, &spec).await;
    }

    /// Keep the in-memory trustee/seen sets in step with an item.
    fn update_sets(user: &mut User, item: &RosterItem) {
        if item.subscription.is_from() {
            user.trustees.insert(item.jid.clone());
        } else {
            user.trustees.remove(&item.jid);
        }
        if item.subscription.is_to() {
            user.seen.insert(item.jid.clone());
        } else {
            user.seen.remove(&item.jid);
        }
    }

    /// Push an item to every session that has requested its roster.
    async fn push(jsm: &Jsm, user: &User, item: &Element) {
        for session in user.sessions.iter().filter(|s| s.roster) {
            let push = Element::builder("iq", ns::SERVER)
                .attr("type", "set")
                .attr("to", session.jid.to_string())
                .attr("from", user.jid.to_string())
                .attr("id", format!("push-{}", util::timestamp_ms()))
                .append(
                    Element::builder("query", ns::ROSTER)
                        .append(item.clone())
                        .build(),
                )
                .build();
            jsm.send_to_client(&session.cid, &session.jid, push).await;
        }
    }

    /// Persist, push, update sets and fire the roster-change event.
    async fn commit(jsm: &Jsm, user: &mut User, item: &RosterItem) {
        Self::save_item(jsm, user, item).await;
        Self::update_sets(user, item);
        let client_item = item.to_element(true);
        if !item.hidden {
            Self::push(jsm, user, &client_item).await;
        }
        for module in jsm.modules() {
            module.rosterchange(jsm, user, &client_item).await;
        }
    }

    /// Store a pending inbound subscribe for redelivery after restarts.
    async fn store_pending(jsm: &Jsm, user: &User, presence: &Element) {
        let from = presence.attr("from").unwrap_or_default().to_string();
        let spec = MatchSpec::AttrEq {
            name: "from".into(),
            value: from,
        };
        jsm.xdb
            .insert(&user.jid, ns::STORED_SUBSCRIPTION, &spec, presence.clone())
            .await;
    }

    async fn clear_pending(jsm: &Jsm, user: &User, contact: &str) {
        let spec = MatchSpec::AttrEq {
            name: "from".into(),
            value: contact.to_string(),
        };
        jsm.xdb
            .delete_matching(&user.jid, ns::STORED_SUBSCRIPTION, &spec)
            .await;
    }

    /// Forward a subscription stanza to every available session.
    async fn deliver_to_sessions(jsm: &Jsm, user: &User, stanza: &Element) {
        for session in user.sessions.iter().filter(|s| s.available()) {
            jsm.send_to_client(&session.cid, &session.jid, stanza.clone())
                .await;
        }
    }

    /// Handle the client's `jabber:iq:roster` queries.
    async fn iq_roster(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: Packet,
    ) -> ModRet {
        match packet.stanza_type() {
            Some("get") => {
                let items = Self::load(jsm, user).await;
                let mut query = Element::new("query", ns::ROSTER);
                for item in items.iter().filter(|i| !i.hidden) {
                    query.append_child(item.to_element(true));
                }
                // also seed the in-memory sets on first load
                for item in &items {
                    Self::update_sets(user, item);
                }

                let mut reply = packet.element.clone();
                util::tofrom(&mut reply);
                reply.set_attr("type", "result");
                reply.set_nodes(Vec::new());
                reply.append_child(query);

                if let Some(session) = user.session_mut(resource) {
                    session.roster = true;
                }
                if let Some(session) = user.session(resource) {
                    let cid = session.cid.clone();
                    let sjid = session.jid.clone();
                    jsm.send_to_client(&cid, &sjid, reply).await;

                    // re-deliver stored inbound requests to this session
                    if let Some(stored) =
                        jsm.xdb.get(&user.jid, ns::STORED_SUBSCRIPTION).await
                    {
                        for pending in stored.children() {
                            jsm.send_to_client(&cid, &sjid, pending.clone()).await;
                        }
                    }
                }
                ModRet::Handled
            }

            Some("set") => {
                let Some(query) = packet.element.get_child("query", ns::ROSTER) else {
                    return ModRet::Pass(packet);
                };
                let items: Vec<Element> = query.children().cloned().collect();
                for el in items {
                    let Some(jid) = el.attr("jid").map(str::to_string) else {
                        continue;
                    };
                    let contact = match jid.parse::<Jid>() {
                        Ok(j) => j.bare().to_string(),
                        Err(_) => continue,
                    };

                    if el.attr("subscription") == Some("remove") {
                        self.remove_item(jsm, user, &contact).await;
                        continue;
                    }

                    let mut item = Self::load_item(jsm, user, &contact)
                        .await
                        .unwrap_or_else(|| RosterItem::new(contact.clone()));
                    // the client controls name and groups, never state
                    item.jid = contact;
                    item.name = el.attr("name").map(str::to_string);
                    item.groups = el
                        .children()
                        .filter(|c| c.name() == "group")
                        .map(|g| g.text())
                        .collect();
                    item.hidden = false;
                    Self::commit(jsm, user, &item).await;
                }

                let mut reply = packet.element.clone();
                util::tofrom(&mut reply);
                reply.set_attr("type", "result");
                reply.set_nodes(Vec::new());
                if let Some(session) = user.session(resource) {
                    jsm.send_to_client(&session.cid.clone(), &session.jid.clone(), reply)
                        .await;
                }
                ModRet::Handled
            }

            _ => ModRet::Pass(packet),
        }
    }

    /// Removal: generated unsubscribe/unsubscribed go out even though the
    /// stored state is already gone.
    async fn remove_item(&self, jsm: &Jsm, user: &mut User, contact: &str) {
        let prior = Self::load_item(jsm, user, contact).await.unwrap_or_default();

        if prior.subscription.is_to() || prior.ask {
            let unsub = Element::builder("presence", ns::SERVER)
                .attr("to", contact)
                .attr("from", user.jid.to_string())
                .attr("type", "unsubscribe")
                .build();
            jsm.deliver(unsub).await;
        }
        if prior.subscription.is_from() {
            let unsubd = Element::builder("presence", ns::SERVER)
                .attr("to", contact)
                .attr("from", user.jid.to_string())
                .attr("type", "unsubscribed")
                .build();
            jsm.deliver(unsubd).await;
        }

        Self::delete_item(jsm, user, contact).await;
        Self::clear_pending(jsm, user, contact).await;
        user.trustees.remove(contact);
        user.seen.remove(contact);

        let removed = Element::builder("item", ns::ROSTER)
            .attr("jid", contact)
            .attr("subscription", "remove")
            .build();
        Self::push(jsm, user, &removed).await;
        for module in jsm.modules() {
            module.rosterchange(jsm, user, &removed).await;
        }
        info!(user = %user.jid, contact = %contact, "roster item removed");
    }

    /// Outbound subscription-state presence from one of our sessions.
    async fn presence_out(
        &self,
        jsm: &Jsm,
        user: &mut User,
        packet: Packet,
        ptype: &str,
    ) -> ModRet {
        let Some(target) = packet
            .element
            .attr("to")
            .and_then(|t| t.parse::<Jid>().ok())
        else {
            return ModRet::Pass(packet);
        };
        let contact = target.user();

        let mut item = Self::load_item(jsm, user, &contact)
            .await
            .unwrap_or_else(|| RosterItem::new(contact.clone()));

        match ptype {
            "subscribe" => {
                item.ask = true;
                item.hidden = false;
                Self::commit(jsm, user, &item).await;
            }
            "subscribed" => {
                if item.subscription.is_from() && !item.hidden && item.pending_in.is_none() {
                    // granting again is a no-op
                    return ModRet::Handled;
                }
                item.subscription = match item.subscription {
                    Subscription::None => Subscription::From,
                    Subscription::To => Subscription::Both,
                    other => other,
                };
                item.pending_in = None;
                item.hidden = false;
                Self::clear_pending(jsm, user, &contact).await;
                Self::commit(jsm, user, &item).await;
            }
            "unsubscribe" => {
                item.subscription = match item.subscription {
                    Subscription::To => Subscription::None,
                    Subscription::Both => Subscription::From,
                    other => other,
                };
                item.ask = false;
                Self::commit(jsm, user, &item).await;
            }
            "unsubscribed" => {
                if item.hidden {
                    // denying a pending-in request deletes the placeholder
                    Self::delete_item(jsm, user, &contact).await;
                    Self::clear_pending(jsm, user, &contact).await;
                } else {
                    item.subscription = match item.subscription {
                        Subscription::From => Subscription::None,
                        Subscription::Both => Subscription::To,
                        other => other,
                    };
                    item.pending_in = None;
                    Self::clear_pending(jsm, user, &contact).await;
                    Self::commit(jsm, user, &item).await;
                }
                user.trustees.remove(&contact);
            }
            _ => {}
        }

        // subscription stanzas travel bare to bare
        let mut out = packet.element.clone();
        out.set_attr("from", user.jid.to_string());
        out.set_attr("to", contact);
        jsm.deliver(out).await;
        ModRet::Handled
    }

    /// Inbound subscription-state presence from a contact.
    async fn presence_in(
        &self,
        jsm: &Jsm,
        user: &mut User,
        packet: Packet,
        ptype: &str,
    ) -> ModRet {
        let Some(sender) = packet
            .element
            .attr("from")
            .and_then(|f| f.parse::<Jid>().ok())
        else {
            return ModRet::Pass(packet);
        };
        let contact = sender.user();
        let existing = Self::load_item(jsm, user, &contact).await;

        match ptype {
            "subscribe" => {
                if existing
                    .as_ref()
                    .map(|i| i.subscription.is_from())
                    .unwrap_or(false)
                {
                    // already subscribed: answer without bothering anyone
                    let auto = Element::builder("presence", ns::SERVER)
                        .attr("to", contact)
                        .attr("from", user.jid.to_string())
                        .attr("type", "subscribed")
                        .build();
                    jsm.deliver(auto).await;
                    return ModRet::Handled;
                }

                let mut item = existing.unwrap_or_else(|| {
                    let mut i = RosterItem::new(contact.clone());
                    i.hidden = true;
                    i
                });
                item.pending_in = Some(packet.element.text());
                Self::save_item(jsm, user, &item).await;

                let mut request = packet.element.clone();
                request.set_attr("from", contact);
                Self::store_pending(jsm, user, &request).await;
                Self::deliver_to_sessions(jsm, user, &request).await;
                ModRet::Handled
            }

            "subscribed" => {
                let Some(mut item) = existing else {
                    debug!(contact = %contact, "unsolicited subscribed, dropping");
                    return ModRet::Handled;
                };
                if !item.ask {
                    // a second subscribed is a no-op
                    return ModRet::Handled;
                }
                item.ask = false;
                item.subscription = match item.subscription {
                    Subscription::None => Subscription::To,
                    Subscription::From => Subscription::Both,
                    other => other,
                };
                Self::commit(jsm, user, &item).await;
                Self::deliver_to_sessions(jsm, user, &packet.element).await;
                ModRet::Handled
            }

            "unsubscribe" => {
                if let Some(mut item) = existing {
                    if item.hidden {
                        Self::delete_item(jsm, user, &contact).await;
                    } else {
                        item.subscription = match item.subscription {
                            Subscription::From => Subscription::None,
                            Subscription::Both => Subscription::To,
                            other => other,
                        };
                        item.pending_in = None;
                        Self::commit(jsm, user, &item).await;
                    }
                    Self::clear_pending(jsm, user, &contact).await;
                    user.trustees.remove(&contact);
                    Self::deliver_to_sessions(jsm, user, &packet.element).await;
                }
                ModRet::Handled
            }

            "unsubscribed" => {
                if let Some(mut item) = existing {
                    if item.subscription.is_to() || item.ask {
                        item.ask = false;
                        item.subscription = match item.subscription {
                            Subscription::To => Subscription::None,
                            Subscription::Both => Subscription::From,
                            other => other,
                        };
                        Self::commit(jsm, user, &item).await;
                        Self::deliver_to_sessions(jsm, user, &packet.element).await;
                    }
                    user.seen.remove(&contact);
                }
                ModRet::Handled
            }

            _ => ModRet::Pass(packet),
        }
    }
}

impl Default for RosterModule {
    fn default() -> Self {
        Self
    }
}

#[async_trait]
impl Module for RosterModule {
    fn name(&self) -> &'static str {
        "roster"
    }

    async fn session_new(&self, jsm: &Jsm, user: &mut User, _resource: &str) {
        // seed trustees/seen so presence can consult them immediately
        let items = Self::load(jsm, user).await;
        for item in &items {
            Self::update_sets(user, item);
        }
    }

    async fn out(&self, jsm: &Jsm, user: &mut User, resource: &str, packet: Packet) -> ModRet {
        if packet.element.name() == "iq" && packet.iq_ns() == Some(ns::ROSTER) {
            return self.iq_roster(jsm, user, resource, packet).await;
        }
        if packet.element.name() == "presence" {
            if let Some(ptype) = packet.stanza_type().map(str::to_string) {
                if matches!(
                    ptype.as_str(),
                    "subscribe" | "subscribed" | "unsubscribe" | "unsubscribed"
                ) {
                    return self.presence_out(jsm, user, packet, &ptype).await;
                }
            }
        }
        ModRet::Pass(packet)
    }

    async fn deliver(&self, jsm: &Jsm, user: &mut User, packet: Packet) -> ModRet {
        if packet.element.name() == "presence" {
            if let Some(ptype) = packet.stanza_type().map(str::to_string) {
                if matches!(
                    ptype.as_str(),
                    "subscribe" | "subscribed" | "unsubscribe" | "unsubscribed"
                ) {
                    return self.presence_in(jsm, user, packet, &ptype).await;
                }
            }
        }
        ModRet::Pass(packet)
    }

    async fn delete(&self, jsm: &Jsm, user: &mut User) {
        jsm.xdb.set(&user.jid, ns::ROSTER, Vec::new()).await;
        jsm.xdb
            .set(&user.jid, ns::STORED_SUBSCRIPTION, Vec::new())
            .await;
    }
}
