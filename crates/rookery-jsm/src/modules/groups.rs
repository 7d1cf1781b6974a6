//! The shared-groups module (optional, off unless configured).
//!
//! Groups are server-side addresses of the form `host/groups/<gid>`.
//! Users browse them, register to join and unregister to leave; members
//! are presented to each other as `subscription='both'` roster contacts.
//! Group messages broadcast to online members only, and only writers may
//! post when a writer list is configured.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use rookery_bus::{MatchSpec, Packet, StanzaError};
use rookery_jid::Jid;
use rookery_xml::{ns, Element};

use crate::user::User;
use crate::util;
use crate::{Jsm, ModRet, Module};

/// Namespace for stored group membership.
pub const NS_XGROUPS: &str = "jabber:xdb:groups";

/// One configured group.
#[derive(Debug, Clone)]
pub struct GroupDef {
    /// Group id, the last part of the address.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Bare JIDs allowed to post; empty means every member may.
    pub writers: Vec<String>,
}

/// Configuration: the set of declared groups.
#[derive(Debug, Clone, Default)]
pub struct GroupsConfig {
    /// Declared groups.
    pub groups: Vec<GroupDef>,
}

/// The shared-groups module.
pub struct GroupsModule {
    config: GroupsConfig,
    /// Online members per group id.
    online: DashMap<String, HashSet<String>>,
}

impl GroupsModule {
    /// Create the module; an empty config declares no groups at all.
    pub fn new(config: GroupsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            online: DashMap::new(),
        })
    }

    fn group(&self, gid: &str) -> Option<&GroupDef> {
        self.config.groups.iter().find(|g| g.id == gid)
    }

    /// The group id in an address like `host/groups/<gid>`, if any.
    fn gid_of(to: &Jid) -> Option<&str> {
        to.resource()?.strip_prefix("groups/")
    }

    fn group_jid(&self, jsm: &Jsm, gid: &str) -> String {
        let host = jsm
            .config
            .hosts
            .first()
            .cloned()
            .unwrap_or_else(|| jsm.config.instance_id.clone());
        format!("{}/groups/{}", host, gid)
    }

    async fn members(&self, jsm: &Jsm, gid: &str) -> Vec<(String, String)> {
        let owner: Jid = match self.group_jid(jsm, gid).parse() {
            Ok(j) => j,
            Err(_) => return Vec::new(),
        };
        jsm.xdb
            .get(&owner, NS_XGROUPS)
            .await
            .map(|c| {
                c.children()
                    .filter_map(|u| {
                        Some((
                            u.attr("jid")?.to_string(),
                            u.attr("name").unwrap_or_default().to_string(),
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Join: record membership and cross-link rosters as `both`.
    async fn join(&self, jsm: &Jsm, gid: &str, user_jid: &str, name: &str) {
        let owner: Jid = match self.group_jid(jsm, gid).parse() {
            Ok(j) => j,
            Err(_) => return,
        };
        let members = self.members(jsm, gid).await;

        let entry = Element::builder("user", NS_XGROUPS)
            .attr("jid", user_jid)
            .attr("name", name)
            .build();
        let spec = MatchSpec::AttrEq {
            name: "jid".into(),
            value: user_jid.to_string(),
        };
        jsm.xdb.insert(&owner, NS_XGROUPS, &spec, entry).await;

        // both-subscription roster entries in both directions
        for (member, member_name) in members {
            if member == user_jid {
                continue;
            }
            self.link_rosters(jsm, gid, user_jid, name, &member, &member_name)
                .await;
        }
        info!(group = %gid, user = %user_jid, "joined shared group");
    }

    async fn link_rosters(
        &self,
        jsm: &Jsm,
        gid: &str,
        a: &str,
        a_name: &str,
        b: &str,
        b_name: &str,
    ) {
        let group_name = self
            .group(gid)
            .map(|g| g.name.clone())
            .unwrap_or_else(|| gid.to_string());
        for (owner, contact, contact_name) in [(a, b, b_name), (b, a, a_name)] {
            let Ok(owner_jid) = owner.parse::<Jid>() else { continue };
            let item = Element::builder("item", ns::ROSTER)
                .attr("jid", contact)
                .attr("name", contact_name)
                .attr("subscription", "both")
                .append(
                    Element::builder("group", ns::ROSTER)
                        .text(group_name.clone())
                        .build(),
                )
                .build();
            let spec = MatchSpec::AttrEq {
                name: "jid".into(),
                value: contact.to_string(),
            };
            jsm.xdb.insert(&owner_jid, ns::ROSTER, &spec, item).await;
        }
    }

    async fn leave(&self, jsm: &Jsm, gid: &str, user_jid: &str) {
        let Ok(owner) = self.group_jid(jsm, gid).parse::<Jid>() else {
            return;
        };
        let spec = MatchSpec::AttrEq {
            name: "jid".into(),
            value: user_jid.to_string(),
        };
        jsm.xdb.delete_matching(&owner, NS_XGROUPS, &spec).await;
        if let Some(mut online) = self.online.get_mut(gid) {
            online.remove(user_jid);
        }

        // unlink from every remaining member's roster
        for (member, _) in self.members(jsm, gid).await {
            let Ok(member_jid) = member.parse::<Jid>() else { continue };
            let spec = MatchSpec::AttrEq {
                name: "jid".into(),
                value: user_jid.to_string(),
            };
            jsm.xdb.delete_matching(&member_jid, ns::ROSTER, &spec).await;
            if let Ok(user_jid) = user_jid.parse::<Jid>() {
                let spec = MatchSpec::AttrEq {
                    name: "jid".into(),
                    value: member.clone(),
                };
                jsm.xdb.delete_matching(&user_jid, ns::ROSTER, &spec).await;
            }
        }
        info!(group = %gid, user = %user_jid, "left shared group");
    }

    async fn may_post(&self, jsm: &Jsm, gid: &str, sender: &str) -> bool {
        let Some(def) = self.group(gid) else {
            return false;
        };
        if !def.writers.is_empty() {
            return def.writers.iter().any(|w| w == sender);
        }
        self.members(jsm, gid).await.iter().any(|(m, _)| m == sender)
    }

    /// Broadcast a group message to online members.
    async fn broadcast(&self, jsm: &Jsm, gid: &str, message: &Element) {
        let online: Vec<String> = self
            .online
            .get(gid)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        let from = self.group_jid(jsm, gid);
        for member in online {
            let mut copy = message.clone();
            copy.set_attr("to", member);
            copy.set_attr("from", from.clone());
            jsm.deliver(copy).await;
        }
    }

    async fn browse_reply(&self, jsm: &Jsm, packet: &Packet, gid: Option<&str>) {
        let mut browse = Element::new("item", ns::BROWSE);
        match gid {
            None => {
                browse.set_attr("category", "service");
                browse.set_attr("name", "Shared Groups");
                for def in &self.config.groups {
                    browse.append_child(
                        Element::builder("item", ns::BROWSE)
                            .attr("category", "conference")
                            .attr("jid", self.group_jid(jsm, &def.id))
                            .attr("name", def.name.clone())
                            .build(),
                    );
                }
            }
            Some(gid) => {
                browse.set_attr("category", "conference");
                browse.set_attr("jid", self.group_jid(jsm, gid));
                if let Some(def) = self.group(gid) {
                    browse.set_attr("name", def.name.clone());
                }
                for (member, name) in self.members(jsm, gid).await {
                    browse.append_child(
                        Element::builder("user", ns::BROWSE)
                            .attr("jid", member)
                            .attr("name", name)
                            .build(),
                    );
                }
            }
        }

        let mut reply = packet.element.clone();
        util::tofrom(&mut reply);
        reply.set_attr("type", "result");
        reply.set_nodes(Vec::new());
        reply.append_child(browse);
        jsm.deliver(reply).await;
    }
}

#[async_trait]
impl Module for GroupsModule {
    fn name(&self) -> &'static str {
        "groups"
    }

    async fn server(&self, jsm: &Jsm, packet: Packet) -> ModRet {
        if self.config.groups.is_empty() {
            return ModRet::Pass(packet);
        }
        let Some(gid_or_root) = packet.to.resource() else {
            return ModRet::Pass(packet);
        };
        if gid_or_root != "groups" && !gid_or_root.starts_with("groups/") {
            return ModRet::Pass(packet);
        }
        let gid = Self::gid_of(&packet.to).map(str::to_string);

        if let Some(gid) = &gid {
            if self.group(gid).is_none() {
                jsm.bounce(&packet.element, StanzaError::ItemNotFound).await;
                return ModRet::Handled;
            }
        }

        let sender_bare = packet
            .from
            .as_ref()
            .map(|f| f.user())
            .unwrap_or_default();

        match packet.element.name() {
            "iq" => {
                let iq_ns = packet.iq_ns().map(str::to_string);
                match (packet.stanza_type(), iq_ns.as_deref()) {
                    (Some("get"), Some(ns::BROWSE)) => {
                        self.browse_reply(jsm, &packet, gid.as_deref()).await;
                    }
                    (Some("set"), Some(ns::REGISTER)) => {
                        let Some(gid) = gid else {
                            jsm.bounce(&packet.element, StanzaError::BadRequest).await;
                            return ModRet::Handled;
                        };
                        let query = packet.element.get_child("query", ns::REGISTER);
                        let removing = query
                            .map(|q| q.get_child("remove", ns::REGISTER).is_some())
                            .unwrap_or(false);
                        if removing {
                            self.leave(jsm, &gid, &sender_bare).await;
                        } else {
                            let name = query
                                .and_then(|q| q.get_child("name", ns::REGISTER))
                                .map(|n| n.text())
                                .unwrap_or_else(|| sender_bare.clone());
                            self.join(jsm, &gid, &sender_bare, &name).await;
                        }
                        let mut reply = packet.element.clone();
                        util::tofrom(&mut reply);
                        reply.set_attr("type", "result");
                        reply.set_nodes(Vec::new());
                        jsm.deliver(reply).await;
                    }
                    _ => {
                        jsm.bounce(&packet.element, StanzaError::FeatureNotImplemented)
                            .await;
                    }
                }
                ModRet::Handled
            }

            "message" => {
                let Some(gid) = gid else {
                    jsm.bounce(&packet.element, StanzaError::BadRequest).await;
                    return ModRet::Handled;
                };
                if !self.may_post(jsm, &gid, &sender_bare).await {
                    debug!(group = %gid, sender = %sender_bare, "group post refused");
                    jsm.bounce(&packet.element, StanzaError::Forbidden).await;
                    return ModRet::Handled;
                }
                self.broadcast(jsm, &gid, &packet.element).await;
                ModRet::Handled
            }

            _ => ModRet::Handled,
        }
    }

    async fn out(&self, jsm: &Jsm, user: &mut User, _resource: &str, packet: Packet) -> ModRet {
        // track which members are online, from their undirected presence
        if !self.config.groups.is_empty()
            && packet.element.name() == "presence"
            && packet.element.attr("to").is_none()
        {
            let bare = user.jid.to_string();
            let coming_online = packet.element.attr("type").is_none();
            for def in &self.config.groups {
                let is_member = self
                    .members(jsm, &def.id)
                    .await
                    .iter()
                    .any(|(m, _)| *m == bare);
                if !is_member {
                    continue;
                }
                let mut online = self.online.entry(def.id.clone()).or_default();
                if coming_online {
                    online.insert(bare.clone());
                } else {
                    online.remove(&bare);
                }
            }
        }
        ModRet::Pass(packet)
    }
}
