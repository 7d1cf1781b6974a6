//! The offline module: storage and redelivery of messages for users with
//! no available session.
//!
//! Each message type is configured to store or bounce; stored messages get
//! a generated `node` id (millisecond timestamp), a delay stamp, and
//! XEP-0023 expiry bookkeeping. When a session comes online with
//! non-negative priority the store floods to it and clears, unless the
//! client has invoked flexible retrieval (XEP-0013), in which case it
//! drives fetch/view/remove/purge itself.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use rookery_bus::{MatchSpec, Packet, StanzaError};
use rookery_xml::{ns, Element};

use crate::user::User;
use crate::util;
use crate::{Jsm, ModRet, Module};

/// What to do with one message type when the user is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAction {
    /// Shelve for later delivery.
    Store,
    /// Bounce back to the sender.
    Bounce,
    /// Drop without a trace (error messages, to stop loops).
    Drop,
}

/// Per-type storage policy.
#[derive(Debug, Clone)]
pub struct OfflineConfig {
    /// Messages without a type, or `type='normal'`.
    pub normal: StoreAction,
    /// `type='chat'`.
    pub chat: StoreAction,
    /// `type='headline'`.
    pub headline: StoreAction,
    /// `type='groupchat'`.
    pub groupchat: StoreAction,
    /// `type='error'`.
    pub error: StoreAction,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            normal: StoreAction::Store,
            chat: StoreAction::Store,
            headline: StoreAction::Bounce,
            groupchat: StoreAction::Bounce,
            error: StoreAction::Drop,
        }
    }
}

/// Per-session retrieval state.
#[derive(Default)]
struct OfflineScratch {
    /// The client invoked XEP-0013; no flooding for this session.
    flexible: bool,
}

/// The offline module.
pub struct OfflineModule {
    config: OfflineConfig,
}

impl OfflineModule {
    /// Create the module.
    pub fn new(config: OfflineConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }

    fn action_for(&self, message: &Element) -> StoreAction {
        match message.attr("type") {
            None | Some("normal") => self.config.normal,
            Some("chat") => self.config.chat,
            Some("headline") => self.config.headline,
            Some("groupchat") => self.config.groupchat,
            Some("error") => self.config.error,
            Some(_) => StoreAction::Bounce,
        }
    }

    /// Remaining lifetime check for XEP-0023 expiry.
    fn expired(message: &Element) -> bool {
        let Some(expire) = message.get_child("x", ns::EXPIRE) else {
            return false;
        };
        let Some(seconds) = expire.attr("seconds").and_then(|s| s.parse::<i64>().ok()) else {
            return false;
        };
        let Some(stored) = expire.attr("stored").and_then(|s| s.parse::<i64>().ok()) else {
            return false;
        };
        seconds - (Utc::now().timestamp() - stored) <= 0
    }

    async fn store(&self, jsm: &Jsm, user: &User, message: &Element) {
        let mut copy = message.clone();
        util::delay_stamp(&mut copy, &user.jid.to_string(), Some("Offline Storage"));
        copy.set_attr("node", util::timestamp_ms());

        if let Some(expire) = copy.get_child_mut("x", ns::EXPIRE) {
            expire.set_attr("stored", Utc::now().timestamp().to_string());
        }

        jsm.xdb
            .insert(&user.jid, ns::OFFLINE, &MatchSpec::None, copy)
            .await;
        debug!(user = %user.jid, "message stored offline");
    }

    /// Synthesize the offline-delivery receipt (message events).
    async fn event_receipt(&self, jsm: &Jsm, user: &User, message: &Element) {
        let Some(event) = message.get_child("x", ns::EVENT) else {
            return;
        };
        if event.get_child("offline", ns::EVENT).is_none() {
            return;
        }
        let Some(id) = message.attr("id") else {
            return;
        };
        let Some(sender) = message.attr("from") else {
            return;
        };

        let mut x = Element::new("x", ns::EVENT);
        x.append_child(Element::new("offline", ns::EVENT));
        let mut id_el = Element::new("id", ns::EVENT);
        id_el.append_text(id);
        x.append_child(id_el);

        let receipt = Element::builder("message", ns::SERVER)
            .attr("to", sender)
            .attr("from", user.jid.to_string())
            .append(x)
            .build();
        jsm.deliver(receipt).await;
    }

    async fn stored_messages(&self, jsm: &Jsm, user: &User) -> Vec<Element> {
        jsm.xdb
            .get(&user.jid, ns::OFFLINE)
            .await
            .map(|c| c.children().cloned().collect())
            .unwrap_or_default()
    }

    /// Flood everything to a session, then clear the store.
    async fn flood(&self, jsm: &Jsm, user: &User, resource: &str) {
        let messages = self.stored_messages(jsm, user).await;
        if messages.is_empty() {
            return;
        }
        let Some(session) = user.session(resource) else {
            return;
        };
        let cid = session.cid.clone();
        let sjid = session.jid.clone();

        let mut delivered = 0usize;
        for mut message in messages {
            if Self::expired(&message) {
                continue;
            }
            message.set_attr("to", sjid.to_string());
            jsm.send_to_client(&cid, &sjid, message).await;
            delivered += 1;
        }
        jsm.xdb.set(&user.jid, ns::OFFLINE, Vec::new()).await;
        info!(user = %user.jid, count = delivered, "offline messages flooded");
    }

    /// Disco#info on the flexible-offline node: advertise the count and
    /// suppress flooding for this session.
    async fn disco_offline_node(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: &Packet,
    ) {
        let count = self.stored_messages(jsm, user).await.len();

        if let Some(session) = user.session_mut(resource) {
            session.aux.get_or_default::<OfflineScratch>().flexible = true;
        }

        let mut query = Element::new("query", ns::DISCO_INFO);
        query.set_attr("node", ns::FLEX_OFFLINE);
        query.append_child(
            Element::builder("identity", ns::DISCO_INFO)
                .attr("category", "automation")
                .attr("type", "message-list")
                .build(),
        );
        query.append_child(
            Element::builder("feature", ns::DISCO_INFO)
                .attr("var", ns::FLEX_OFFLINE)
                .build(),
        );

        let mut form = Element::new("x", "jabber:x:data");
        form.set_attr("type", "result");
        form.append_child(
            Element::builder("field", "jabber:x:data")
                .attr("var", "FORM_TYPE")
                .attr("type", "hidden")
                .append(
                    Element::builder("value", "jabber:x:data")
                        .text(ns::FLEX_OFFLINE)
                        .build(),
                )
                .build(),
        );
        form.append_child(
            Element::builder("field", "jabber:x:data")
                .attr("var", "number_of_messages")
                .append(
                    Element::builder("value", "jabber:x:data")
                        .text(count.to_string())
                        .build(),
                )
                .build(),
        );
        query.append_child(form);

        let mut reply = packet.element.clone();
        util::tofrom(&mut reply);
        reply.set_attr("type", "result");
        reply.set_nodes(Vec::new());
        reply.append_child(query);
        if let Some(session) = user.session(resource) {
            jsm.send_to_client(&session.cid.clone(), &session.jid.clone(), reply)
                .await;
        }
    }

    /// The `<offline/>` retrieval verbs of XEP-0013.
    async fn flexible_query(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: &Packet,
    ) {
        if let Some(session) = user.session_mut(resource) {
            session.aux.get_or_default::<OfflineScratch>().flexible = true;
        }
        let Some(offline) = packet.element.get_child("offline", ns::FLEX_OFFLINE) else {
            return;
        };
        let Some(session) = user.session(resource) else {
            return;
        };
        let cid = session.cid.clone();
        let sjid = session.jid.clone();

        if offline.get_child("purge", ns::FLEX_OFFLINE).is_some() {
            jsm.xdb.set(&user.jid, ns::OFFLINE, Vec::new()).await;
        } else if offline.get_child("fetch", ns::FLEX_OFFLINE).is_some() {
            for mut message in self.stored_messages(jsm, user).await {
                if Self::expired(&message) {
                    continue;
                }
                message.set_attr("to", sjid.to_string());
                jsm.send_to_client(&cid, &sjid, message).await;
            }
        } else {
            for item in offline
                .children()
                .filter(|c| c.name() == "item")
            {
                let Some(node) = item.attr("node") else { continue };
                match item.attr("action") {
                    Some("view") => {
                        for mut message in self.stored_messages(jsm, user).await {
                            if message.attr("node") == Some(node) {
                                message.set_attr("to", sjid.to_string());
                                jsm.send_to_client(&cid, &sjid, message).await;
                            }
                        }
                    }
                    Some("remove") => {
                        let spec = MatchSpec::AttrEq {
                            name: "node".into(),
                            value: node.to_string(),
                        };
                        jsm.xdb
                            .delete_matching(&user.jid, ns::OFFLINE, &spec)
                            .await;
                    }
                    _ => {}
                }
            }
        }

        let mut reply = packet.element.clone();
        util::tofrom(&mut reply);
        reply.set_attr("type", "result");
        reply.set_nodes(Vec::new());
        jsm.send_to_client(&cid, &sjid, reply).await;
    }
}

#[async_trait]
impl Module for OfflineModule {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn features(&self) -> Vec<&'static str> {
        vec!["msgoffline", ns::FLEX_OFFLINE]
    }

    async fn offline(&self, jsm: &Jsm, user: &mut User, packet: Packet) -> ModRet {
        if packet.element.name() != "message" {
            return ModRet::Pass(packet);
        }
        match self.action_for(&packet.element) {
            StoreAction::Store => {
                self.store(jsm, user, &packet.element).await;
                self.event_receipt(jsm, user, &packet.element).await;
                ModRet::Handled
            }
            StoreAction::Bounce => {
                jsm.bounce(&packet.element, StanzaError::ServiceUnavailable)
                    .await;
                ModRet::Handled
            }
            StoreAction::Drop => ModRet::Handled,
        }
    }

    async fn out(&self, jsm: &Jsm, user: &mut User, resource: &str, packet: Packet) -> ModRet {
        // flood on available presence with non-negative priority, unless
        // this session drives retrieval itself
        if packet.element.name() == "presence"
            && packet.element.attr("to").is_none()
            && packet.element.attr("type").is_none()
        {
            let priority = util::priority_of(&packet.element);
            let flexible = user
                .session(resource)
                .and_then(|s| s.aux.get::<OfflineScratch>())
                .map(|s| s.flexible)
                .unwrap_or(false);
            if priority >= 0 && !flexible {
                self.flood(jsm, user, resource).await;
            }
            return ModRet::Pass(packet);
        }

        if packet.element.name() == "iq" {
            // disco against the flexible-offline node
            if let Some(query) = packet.element.get_child("query", ns::DISCO_INFO) {
                if query.attr("node") == Some(ns::FLEX_OFFLINE) {
                    self.disco_offline_node(jsm, user, resource, &packet).await;
                    return ModRet::Handled;
                }
            }
            if let Some(items) = packet.element.get_child("query", ns::DISCO_ITEMS) {
                if items.attr("node") == Some(ns::FLEX_OFFLINE) {
                    // the item list: one entry per stored message
                    if let Some(session) = user.session_mut(resource) {
                        session.aux.get_or_default::<OfflineScratch>().flexible = true;
                    }
                    let stored = self.stored_messages(jsm, user).await;
                    let mut query = Element::new("query", ns::DISCO_ITEMS);
                    query.set_attr("node", ns::FLEX_OFFLINE);
                    for message in stored {
                        let mut item = Element::new("item", ns::DISCO_ITEMS);
                        item.set_attr("jid", user.jid.to_string());
                        if let Some(node) = message.attr("node") {
                            item.set_attr("node", node);
                        }
                        if let Some(from) = message.attr("from") {
                            item.set_attr("name", from);
                        }
                        query.append_child(item);
                    }
                    let mut reply = packet.element.clone();
                    util::tofrom(&mut reply);
                    reply.set_attr("type", "result");
                    reply.set_nodes(Vec::new());
                    reply.append_child(query);
                    if let Some(session) = user.session(resource) {
                        jsm.send_to_client(&session.cid.clone(), &session.jid.clone(), reply)
                            .await;
                    }
                    return ModRet::Handled;
                }
            }
            if packet
                .element
                .get_child("offline", ns::FLEX_OFFLINE)
                .is_some()
            {
                self.flexible_query(jsm, user, resource, &packet).await;
                return ModRet::Handled;
            }
        }

        ModRet::Pass(packet)
    }

    async fn delete(&self, jsm: &Jsm, user: &mut User) {
        jsm.xdb.set(&user.jid, ns::OFFLINE, Vec::new()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_the_original() {
        let config = OfflineConfig::default();
        assert_eq!(config.normal, StoreAction::Store);
        assert_eq!(config.chat, StoreAction::Store);
        assert_eq!(config.headline, StoreAction::Bounce);
        assert_eq!(config.error, StoreAction::Drop);
    }

    #[test]
    fn expiry_is_computed_from_the_stored_stamp() {
        let mut message = Element::new("message", ns::SERVER);
        let mut x = Element::new("x", ns::EXPIRE);
        x.set_attr("seconds", "60");
        x.set_attr("stored", (Utc::now().timestamp() - 10).to_string());
        message.append_child(x);
        assert!(!OfflineModule::expired(&message));

        let mut old = Element::new("message", ns::SERVER);
        let mut x = Element::new("x", ns::EXPIRE);
        x.set_attr("seconds", "60");
        x.set_attr("stored", (Utc::now().timestamp() - 120).to_string());
        old.append_child(x);
        assert!(OfflineModule::expired(&old));
    }

    #[test]
    fn action_for_uses_the_type_attribute() {
        let module = OfflineModule {
            config: OfflineConfig::default(),
        };
        let chat = Element::builder("message", ns::SERVER)
            .attr("type", "chat")
            .build();
        assert_eq!(module.action_for(&chat), StoreAction::Store);

        let err = Element::builder("message", ns::SERVER)
            .attr("type", "error")
            .build();
        assert_eq!(module.action_for(&err), StoreAction::Drop);
    }
}
