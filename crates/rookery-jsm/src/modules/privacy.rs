//! The privacy module: named rule lists filtering traffic.
//!
//! Lists are stored under `jabber:iq:privacy`; one may carry the
//! wrapper-private `default` attribute. A list compiles, against a roster
//! snapshot, into ordered rules; the first rule whose match applies to a
//! stanza decides (no match allows). Each session selects its own active
//! list; a compiled default list covers offline delivery. Rule changes
//! correct presence: newly blocked contacts are told we went unavailable,
//! newly unblocked ones are probed and get our presence again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use rookery_bus::{Packet, StanzaError};
use rookery_jid::Jid;
use rookery_xml::{ns, Element};

use crate::modules::roster::RosterModule;
use crate::user::User;
use crate::util;
use crate::{Jsm, ModRet, Module};

/// The kinds of traffic a rule can apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrafficKind {
    /// Inbound messages.
    Message,
    /// Inbound presence.
    PresenceIn,
    /// Outbound presence.
    PresenceOut,
    /// Inbound iq.
    Iq,
}

#[derive(Debug, Clone, PartialEq)]
enum RuleMatch {
    Jid(String),
    /// Expanded to explicit bare JIDs at compile time.
    Group(Vec<String>),
    Subscription(String),
    All,
}

#[derive(Debug, Clone)]
struct Rule {
    order: u64,
    deny: bool,
    matcher: RuleMatch,
    message: bool,
    presence_in: bool,
    presence_out: bool,
    iq: bool,
}

impl Rule {
    fn applies_to(&self, kind: TrafficKind) -> bool {
        match kind {
            TrafficKind::Message => self.message,
            TrafficKind::PresenceIn => self.presence_in,
            TrafficKind::PresenceOut => self.presence_out,
            TrafficKind::Iq => self.iq,
        }
    }

    fn matches_peer(&self, peer: &Jid, roster_subs: &HashMap<String, String>) -> bool {
        match &self.matcher {
            RuleMatch::All => true,
            RuleMatch::Jid(value) => jid_value_matches(value, peer),
            RuleMatch::Group(members) => members.contains(&peer.user()),
            RuleMatch::Subscription(wanted) => {
                let actual = roster_subs
                    .get(&peer.user())
                    .map(String::as_str)
                    .unwrap_or("none");
                actual == wanted
            }
        }
    }
}

/// XMPP jid-value matching: full JID, bare JID, or whole domain.
fn jid_value_matches(value: &str, peer: &Jid) -> bool {
    if value.contains('/') {
        peer.to_string() == value
    } else if value.contains('@') {
        peer.user() == value
    } else {
        peer.domain() == value
    }
}

/// A list compiled against a roster snapshot.
#[derive(Debug, Clone, Default)]
pub struct CompiledList {
    name: String,
    rules: Vec<Rule>,
    roster_subs: HashMap<String, String>,
}

impl CompiledList {
    /// Whether the list denies this stanza.
    pub fn denies(&self, kind: TrafficKind, peer: &Jid) -> bool {
        for rule in &self.rules {
            if rule.applies_to(kind) && rule.matches_peer(peer, &self.roster_subs) {
                return rule.deny;
            }
        }
        false
    }

    /// The contacts this list denies outbound presence to.
    fn blocked_presence_out<'a>(
        &self,
        contacts: impl Iterator<Item = &'a String>,
    ) -> Vec<String> {
        contacts
            .filter(|c| {
                c.parse::<Jid>()
                    .map(|jid| self.denies(TrafficKind::PresenceOut, &jid))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct PrivacyUserScratch {
    /// Compiled default list, applied on offline delivery.
    offline_list: Option<CompiledList>,
    loaded: bool,
}

#[derive(Default)]
struct PrivacySessionScratch {
    active: Option<CompiledList>,
}

/// The privacy module.
pub struct PrivacyModule;

impl PrivacyModule {
    /// Create the module.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }

    async fn stored_lists(jsm: &Jsm, user: &User) -> Vec<Element> {
        jsm.xdb
            .get(&user.jid, ns::PRIVACY)
            .await
            .map(|c| c.children().cloned().collect())
            .unwrap_or_default()
    }

    async fn save_lists(jsm: &Jsm, user: &User, lists: Vec<Element>) {
        jsm.xdb.set(&user.jid, ns::PRIVACY, lists).await;
    }

    /// Compile a stored list element against the current roster.
    fn compile(list: &Element, roster: &[crate::modules::roster::RosterItem]) -> CompiledList {
        let mut rules = Vec::new();
        for item in list.children().filter(|c| c.name() == "item") {
            let order = item
                .attr("order")
                .and_then(|o| o.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            let deny = item.attr("action") == Some("deny");

            let matcher = match (item.attr("type"), item.attr("value")) {
                (Some("jid"), Some(value)) => RuleMatch::Jid(value.to_string()),
                (Some("group"), Some(value)) => {
                    let wanted = normalize_group(value);
                    let members = roster
                        .iter()
                        .filter(|r| r.groups.iter().any(|g| normalize_group(g) == wanted))
                        .map(|r| r.jid.clone())
                        .collect();
                    RuleMatch::Group(members)
                }
                (Some("subscription"), Some(value)) => {
                    RuleMatch::Subscription(value.to_string())
                }
                _ => RuleMatch::All,
            };

            let has_kinds = item.has_children();
            rules.push(Rule {
                order,
                deny,
                matcher,
                message: !has_kinds || item.get_child("message", ns::PRIVACY).is_some(),
                presence_in: !has_kinds || item.get_child("presence-in", ns::PRIVACY).is_some(),
                presence_out: !has_kinds
                    || item.get_child("presence-out", ns::PRIVACY).is_some(),
                iq: !has_kinds || item.get_child("iq", ns::PRIVACY).is_some(),
            });
        }
        rules.sort_by_key(|r| r.order);

        let roster_subs = roster
            .iter()
            .map(|r| {
                (
                    r.jid.clone(),
                    match r.subscription {
                        crate::modules::roster::Subscription::None => "none",
                        crate::modules::roster::Subscription::To => "to",
                        crate::modules::roster::Subscription::From => "from",
                        crate::modules::roster::Subscription::Both => "both",
                    }
                    .to_string(),
                )
            })
            .collect();

        CompiledList {
            name: list.attr("name").unwrap_or_default().to_string(),
            rules,
            roster_subs,
        }
    }

    async fn compile_by_name(jsm: &Jsm, user: &User, name: &str) -> Option<CompiledList> {
        let lists = Self::stored_lists(jsm, user).await;
        let list = lists.iter().find(|l| l.attr("name") == Some(name))?;
        let roster = RosterModule::load(jsm, user).await;
        Some(Self::compile(list, &roster))
    }

    /// (Re)compile the default list for offline filtering.
    async fn reload_offline_list(jsm: &Jsm, user: &mut User) {
        let lists = Self::stored_lists(jsm, user).await;
        let compiled = match lists.iter().find(|l| l.attr("default").is_some()) {
            Some(list) => {
                let roster = RosterModule::load(jsm, user).await;
                Some(Self::compile(list, &roster))
            }
            None => None,
        };
        let scratch = user.aux.get_or_default::<PrivacyUserScratch>();
        scratch.offline_list = compiled;
        scratch.loaded = true;
    }

    /// Presence corrections when a session's effective list changes.
    async fn correct_presence(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        old: Option<&CompiledList>,
        new: Option<&CompiledList>,
    ) {
        let contacts: Vec<String> = user.trustees.iter().cloned().collect();
        let empty = CompiledList::default();
        let old_blocked = old.unwrap_or(&empty).blocked_presence_out(contacts.iter());
        let new_blocked = new.unwrap_or(&empty).blocked_presence_out(contacts.iter());

        let (full, presence, available) = match user.session(resource) {
            Some(s) => (s.jid.to_string(), s.presence.clone(), s.available()),
            None => return,
        };
        if !available {
            return;
        }

        for contact in &new_blocked {
            if !old_blocked.contains(contact) {
                let unavailable = Element::builder("presence", ns::SERVER)
                    .attr("type", "unavailable")
                    .attr("to", contact.clone())
                    .attr("from", full.clone())
                    .build();
                jsm.deliver(unavailable).await;
            }
        }
        for contact in &old_blocked {
            if !new_blocked.contains(contact) {
                let probe = Element::builder("presence", ns::SERVER)
                    .attr("type", "probe")
                    .attr("to", contact.clone())
                    .attr("from", user.jid.to_string())
                    .build();
                jsm.deliver(probe).await;

                let mut current = presence.clone();
                current.set_attr("to", contact.clone());
                jsm.deliver(current).await;
            }
        }
    }

    /// Answer `jabber:iq:privacy` queries from the session.
    async fn iq_privacy(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: Packet,
    ) -> ModRet {
        let query = packet
            .element
            .get_child("query", ns::PRIVACY)
            .cloned()
            .unwrap_or_else(|| Element::new("query", ns::PRIVACY));

        match packet.stanza_type() {
            Some("get") => {
                let lists = Self::stored_lists(jsm, user).await;
                let mut result = Element::new("query", ns::PRIVACY);

                let wanted: Vec<&Element> =
                    query.children().filter(|c| c.name() == "list").collect();
                if wanted.is_empty() {
                    // overview: active, default, names
                    if let Some(active) = user
                        .session(resource)
                        .and_then(|s| s.aux.get::<PrivacySessionScratch>())
                        .and_then(|p| p.active.as_ref())
                    {
                        result.append_child(
                            Element::builder("active", ns::PRIVACY)
                                .attr("name", active.name.clone())
                                .build(),
                        );
                    }
                    if let Some(default) =
                        lists.iter().find(|l| l.attr("default").is_some())
                    {
                        result.append_child(
                            Element::builder("default", ns::PRIVACY)
                                .attr("name", default.attr("name").unwrap_or_default())
                                .build(),
                        );
                    }
                    for list in &lists {
                        result.append_child(
                            Element::builder("list", ns::PRIVACY)
                                .attr("name", list.attr("name").unwrap_or_default())
                                .build(),
                        );
                    }
                } else {
                    for want in wanted {
                        let name = want.attr("name").unwrap_or_default();
                        match lists.iter().find(|l| l.attr("name") == Some(name)) {
                            Some(list) => {
                                let mut copy = list.clone();
                                // the default marker is wrapper-private
                                copy.remove_attr("default");
                                result.append_child(copy);
                            }
                            None => {
                                jsm.bounce(&packet.element, StanzaError::ItemNotFound).await;
                                return ModRet::Handled;
                            }
                        }
                    }
                }

                self.reply(jsm, user, resource, &packet, Some(result)).await;
                ModRet::Handled
            }

            Some("set") => {
                let Some(child) = query.children().next().cloned() else {
                    jsm.bounce(&packet.element, StanzaError::BadRequest).await;
                    return ModRet::Handled;
                };

                match child.name() {
                    "active" => {
                        let old = user
                            .session(resource)
                            .and_then(|s| s.aux.get::<PrivacySessionScratch>())
                            .and_then(|p| p.active.clone());

                        let new = match child.attr("name") {
                            Some(name) => {
                                match Self::compile_by_name(jsm, user, name).await {
                                    Some(list) => Some(list),
                                    None => {
                                        jsm.bounce(
                                            &packet.element,
                                            StanzaError::ItemNotFound,
                                        )
                                        .await;
                                        return ModRet::Handled;
                                    }
                                }
                            }
                            None => None,
                        };

                        self.correct_presence(
                            jsm,
                            user,
                            resource,
                            old.as_ref(),
                            new.as_ref(),
                        )
                        .await;

                        if let Some(session) = user.session_mut(resource) {
                            session
                                .aux
                                .get_or_default::<PrivacySessionScratch>()
                                .active = new;
                        }
                        self.reply(jsm, user, resource, &packet, None).await;
                        ModRet::Handled
                    }

                    "default" => {
                        let mut lists = Self::stored_lists(jsm, user).await;
                        let current_default: Option<String> = lists
                            .iter()
                            .find(|l| l.attr("default").is_some())
                            .and_then(|l| l.attr("name"))
                            .map(str::to_string);

                        // other sessions pinning the old default block it
                        let conflicted = current_default.as_deref().is_some_and(|def| {
                            user.sessions.iter().any(|s| {
                                s.resource != resource
                                    && s.aux
                                        .get::<PrivacySessionScratch>()
                                        .and_then(|p| p.active.as_ref())
                                        .is_some_and(|a| a.name == def)
                            })
                        });
                        if conflicted {
                            jsm.bounce(&packet.element, StanzaError::Conflict).await;
                            return ModRet::Handled;
                        }

                        let new_default = child.attr("name").map(str::to_string);
                        if let Some(name) = &new_default {
                            if !lists.iter().any(|l| l.attr("name") == Some(name)) {
                                jsm.bounce(&packet.element, StanzaError::ItemNotFound).await;
                                return ModRet::Handled;
                            }
                        }
                        for list in lists.iter_mut() {
                            list.remove_attr("default");
                            if list.attr("name") == new_default.as_deref() {
                                list.set_attr("default", "default");
                            }
                        }
                        Self::save_lists(jsm, user, lists).await;
                        Self::reload_offline_list(jsm, user).await;
                        self.reply(jsm, user, resource, &packet, None).await;
                        ModRet::Handled
                    }

                    "list" => {
                        let Some(name) = child.attr("name").map(str::to_string) else {
                            jsm.bounce(&packet.element, StanzaError::BadRequest).await;
                            return ModRet::Handled;
                        };

                        // an edit while another session uses the list conflicts
                        let in_use_elsewhere = user.sessions.iter().any(|s| {
                            s.resource != resource
                                && s.aux
                                    .get::<PrivacySessionScratch>()
                                    .and_then(|p| p.active.as_ref())
                                    .is_some_and(|a| a.name == name)
                        });
                        if in_use_elsewhere {
                            jsm.bounce(&packet.element, StanzaError::Conflict).await;
                            return ModRet::Handled;
                        }

                        let mut lists = Self::stored_lists(jsm, user).await;
                        let was_default = lists
                            .iter()
                            .find(|l| l.attr("name") == Some(name.as_str()))
                            .map(|l| l.attr("default").is_some())
                            .unwrap_or(false);
                        lists.retain(|l| l.attr("name") != Some(name.as_str()));

                        let deleting = !child.has_children();
                        if !deleting {
                            let mut stored = child.clone();
                            if was_default {
                                stored.set_attr("default", "default");
                            }
                            lists.push(stored);
                        }
                        Self::save_lists(jsm, user, lists).await;

                        if was_default {
                            Self::reload_offline_list(jsm, user).await;
                        }

                        // our own session may be using the edited list
                        let old = user
                            .session(resource)
                            .and_then(|s| s.aux.get::<PrivacySessionScratch>())
                            .and_then(|p| p.active.clone());
                        if old.as_ref().is_some_and(|l| l.name == name) {
                            let new = if deleting {
                                None
                            } else {
                                Self::compile_by_name(jsm, user, &name).await
                            };
                            self.correct_presence(
                                jsm,
                                user,
                                resource,
                                old.as_ref(),
                                new.as_ref(),
                            )
                            .await;
                            if let Some(session) = user.session_mut(resource) {
                                session
                                    .aux
                                    .get_or_default::<PrivacySessionScratch>()
                                    .active = new;
                            }
                        }

                        self.reply(jsm, user, resource, &packet, None).await;
                        ModRet::Handled
                    }

                    _ => {
                        jsm.bounce(&packet.element, StanzaError::BadRequest).await;
                        ModRet::Handled
                    }
                }
            }

            _ => ModRet::Pass(packet),
        }
    }

    async fn reply(
        &self,
        jsm: &Jsm,
        user: &User,
        resource: &str,
        packet: &Packet,
        payload: Option<Element>,
    ) {
        let mut reply = packet.element.clone();
        util::tofrom(&mut reply);
        reply.set_attr("type", "result");
        reply.set_nodes(Vec::new());
        if let Some(payload) = payload {
            reply.append_child(payload);
        }
        if let Some(session) = user.session(resource) {
            jsm.send_to_client(&session.cid.clone(), &session.jid.clone(), reply)
                .await;
        }
    }

    /// The effective inbound list for a session: active, else default.
    fn effective_in<'a>(&self, user: &'a User, resource: &str) -> Option<&'a CompiledList> {
        if let Some(active) = user
            .session(resource)
            .and_then(|s| s.aux.get::<PrivacySessionScratch>())
            .and_then(|p| p.active.as_ref())
        {
            return Some(active);
        }
        user.aux
            .get::<PrivacyUserScratch>()
            .and_then(|p| p.offline_list.as_ref())
    }

    async fn apply_filter(
        &self,
        jsm: &Jsm,
        list: Option<&CompiledList>,
        kind: TrafficKind,
        peer: Option<Jid>,
        packet: Packet,
    ) -> ModRet {
        let (Some(list), Some(peer)) = (list, peer) else {
            return ModRet::Pass(packet);
        };
        if !list.denies(kind, &peer) {
            return ModRet::Pass(packet);
        }
        debug!(peer = %peer, ?kind, list = %list.name, "stanza denied by privacy list");
        match kind {
            TrafficKind::Message | TrafficKind::Iq => {
                jsm.bounce(&packet.element, StanzaError::ServiceUnavailable)
                    .await;
            }
            TrafficKind::PresenceIn | TrafficKind::PresenceOut => {}
        }
        ModRet::Handled
    }
}

impl Default for PrivacyModule {
    fn default() -> Self {
        Self
    }
}

/// Group names compare after resourceprep normalization; names that fail
/// the profile compare verbatim.
fn normalize_group(name: &str) -> String {
    stringprep::resourceprep(name)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| name.to_string())
}

fn inbound_kind(el: &Element) -> Option<TrafficKind> {
    match el.name() {
        "message" => Some(TrafficKind::Message),
        "iq" => Some(TrafficKind::Iq),
        "presence" => match el.attr("type") {
            None | Some("unavailable") => Some(TrafficKind::PresenceIn),
            _ => None,
        },
        _ => None,
    }
}

#[async_trait]
impl Module for PrivacyModule {
    fn name(&self) -> &'static str {
        "privacy"
    }

    fn features(&self) -> Vec<&'static str> {
        vec![ns::PRIVACY]
    }

    async fn session_new(&self, jsm: &Jsm, user: &mut User, _resource: &str) {
        let loaded = user
            .aux
            .get::<PrivacyUserScratch>()
            .map(|p| p.loaded)
            .unwrap_or(false);
        if !loaded {
            Self::reload_offline_list(jsm, user).await;
        }
    }

    async fn out(&self, jsm: &Jsm, user: &mut User, resource: &str, packet: Packet) -> ModRet {
        if packet.element.name() == "iq" && packet.iq_ns() == Some(ns::PRIVACY) {
            return self.iq_privacy(jsm, user, resource, packet).await;
        }
        ModRet::Pass(packet)
    }

    async fn filter_out(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: Packet,
    ) -> ModRet {
        // only presence-out is filtered on the way out; subscription
        // stanzas are never blocked
        if packet.element.name() != "presence" {
            return ModRet::Pass(packet);
        }
        if !matches!(packet.element.attr("type"), None | Some("unavailable")) {
            return ModRet::Pass(packet);
        }
        let Some(peer) = packet
            .element
            .attr("to")
            .and_then(|t| t.parse::<Jid>().ok())
        else {
            return ModRet::Pass(packet);
        };
        let list = self.effective_in(user, resource).cloned();
        self.apply_filter(jsm, list.as_ref(), TrafficKind::PresenceOut, Some(peer), packet)
            .await
    }

    async fn filter_in_session(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        packet: Packet,
    ) -> ModRet {
        let Some(kind) = inbound_kind(&packet.element) else {
            return ModRet::Pass(packet);
        };
        let peer = packet
            .element
            .attr("from")
            .and_then(|f| f.parse::<Jid>().ok());
        let list = self.effective_in(user, resource).cloned();
        self.apply_filter(jsm, list.as_ref(), kind, peer, packet).await
    }

    async fn filter_in(&self, jsm: &Jsm, user: &mut User, packet: Packet) -> ModRet {
        // offline delivery: the compiled default list decides
        let loaded = user
            .aux
            .get::<PrivacyUserScratch>()
            .map(|p| p.loaded)
            .unwrap_or(false);
        if !loaded {
            Self::reload_offline_list(jsm, user).await;
        }
        let Some(kind) = inbound_kind(&packet.element) else {
            return ModRet::Pass(packet);
        };
        let peer = packet
            .element
            .attr("from")
            .and_then(|f| f.parse::<Jid>().ok());
        let list = user
            .aux
            .get::<PrivacyUserScratch>()
            .and_then(|p| p.offline_list.clone());
        self.apply_filter(jsm, list.as_ref(), kind, peer, packet).await
    }

    async fn delete(&self, jsm: &Jsm, user: &mut User) {
        jsm.xdb.set(&user.jid, ns::PRIVACY, Vec::new()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_with_rule(rule: Element) -> Element {
        Element::builder("list", ns::PRIVACY)
            .attr("name", "test")
            .append(rule)
            .build()
    }

    #[test]
    fn first_matching_rule_by_order_decides() {
        let list = Element::builder("list", ns::PRIVACY)
            .attr("name", "t")
            .append(
                Element::builder("item", ns::PRIVACY)
                    .attr("type", "jid")
                    .attr("value", "v@b.example")
                    .attr("action", "allow")
                    .attr("order", "1")
                    .build(),
            )
            .append(
                Element::builder("item", ns::PRIVACY)
                    .attr("action", "deny")
                    .attr("order", "2")
                    .build(),
            )
            .build();
        let compiled = PrivacyModule::compile(&list, &[]);

        let friend: Jid = "v@b.example/desk".parse().unwrap();
        let stranger: Jid = "x@c.example".parse().unwrap();
        assert!(!compiled.denies(TrafficKind::Message, &friend));
        assert!(compiled.denies(TrafficKind::Message, &stranger));
    }

    #[test]
    fn rules_without_kind_children_cover_everything() {
        let rule = Element::builder("item", ns::PRIVACY)
            .attr("type", "jid")
            .attr("value", "v@b.example")
            .attr("action", "deny")
            .attr("order", "1")
            .build();
        let compiled = PrivacyModule::compile(&list_with_rule(rule), &[]);
        let peer: Jid = "v@b.example".parse().unwrap();
        for kind in [
            TrafficKind::Message,
            TrafficKind::PresenceIn,
            TrafficKind::PresenceOut,
            TrafficKind::Iq,
        ] {
            assert!(compiled.denies(kind, &peer), "kind {:?}", kind);
        }
    }

    #[test]
    fn kind_children_narrow_a_rule() {
        let rule = Element::builder("item", ns::PRIVACY)
            .attr("type", "jid")
            .attr("value", "v@b.example")
            .attr("action", "deny")
            .attr("order", "1")
            .append(Element::new("presence-out", ns::PRIVACY))
            .build();
        let compiled = PrivacyModule::compile(&list_with_rule(rule), &[]);
        let peer: Jid = "v@b.example".parse().unwrap();
        assert!(compiled.denies(TrafficKind::PresenceOut, &peer));
        assert!(!compiled.denies(TrafficKind::Message, &peer));
    }

    #[test]
    fn jid_values_match_at_their_precision() {
        let full: Jid = "v@b.example/desk".parse().unwrap();
        assert!(jid_value_matches("v@b.example/desk", &full));
        assert!(!jid_value_matches("v@b.example/other", &full));
        assert!(jid_value_matches("v@b.example", &full));
        assert!(jid_value_matches("b.example", &full));
        assert!(!jid_value_matches("c.example", &full));
    }

    #[test]
    fn group_rules_expand_against_the_roster() {
        use crate::modules::roster::{RosterItem, Subscription};

        let mut member = RosterItem::new("v@b.example");
        member.groups = vec!["Friends".into()];
        member.subscription = Subscription::Both;
        let mut other = RosterItem::new("w@c.example");
        other.groups = vec!["Work".into()];
        other.subscription = Subscription::To;

        let rule = Element::builder("item", ns::PRIVACY)
            .attr("type", "group")
            .attr("value", "Friends")
            .attr("action", "deny")
            .attr("order", "1")
            .build();
        let compiled =
            PrivacyModule::compile(&list_with_rule(rule), &[member, other]);

        let friend: Jid = "v@b.example/any".parse().unwrap();
        let coworker: Jid = "w@c.example".parse().unwrap();
        assert!(compiled.denies(TrafficKind::Message, &friend));
        assert!(!compiled.denies(TrafficKind::Message, &coworker));
    }

    #[test]
    fn subscription_rules_use_the_snapshot() {
        use crate::modules::roster::{RosterItem, Subscription};

        let mut item = RosterItem::new("v@b.example");
        item.subscription = Subscription::To;

        let rule = Element::builder("item", ns::PRIVACY)
            .attr("type", "subscription")
            .attr("value", "none")
            .attr("action", "deny")
            .attr("order", "1")
            .build();
        let compiled = PrivacyModule::compile(&list_with_rule(rule), &[item]);

        let contact: Jid = "v@b.example".parse().unwrap();
        let stranger: Jid = "x@c.example".parse().unwrap();
        assert!(!compiled.denies(TrafficKind::Message, &contact));
        assert!(compiled.denies(TrafficKind::Message, &stranger));
    }

    #[test]
    fn no_matching_rule_allows() {
        let rule = Element::builder("item", ns::PRIVACY)
            .attr("type", "jid")
            .attr("value", "blocked@b.example")
            .attr("action", "deny")
            .attr("order", "1")
            .build();
        let compiled = PrivacyModule::compile(&list_with_rule(rule), &[]);
        let peer: Jid = "fine@b.example".parse().unwrap();
        assert!(!compiled.denies(TrafficKind::Message, &peer));
    }
}
