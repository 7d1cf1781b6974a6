//! The presence module: availability broadcast, probes, invisibility.
//!
//! Each session keeps two delivery sets: `A`, the addresses that believe
//! the session is available, and `I`, those who were told while the
//! session was invisible. Undirected presence replaces the session's last
//! presence and broadcasts along the roster's trustees; directed presence
//! adjusts the sets and travels verbatim. Probes are answered only for
//! trustees that are not being deliberately ignored.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use rookery_bus::Packet;
use rookery_jid::Jid;
use rookery_xml::{ns, Element};

use crate::user::{User, PRIORITY_GONE};
use crate::util;
use crate::{Jsm, ModRet, Module};

/// Per-session presence bookkeeping.
#[derive(Default)]
struct PresenceScratch {
    /// Who believes this session is available.
    avail: HashSet<String>,
    /// Who was told while invisible.
    invis: HashSet<String>,
    /// The invisibility flag.
    invisible: bool,
}

fn set_contains(set: &HashSet<String>, jid: &Jid) -> bool {
    set.contains(&jid.to_string()) || set.contains(&jid.user())
}

/// Priority of a presence element ignoring its type attribute (used for
/// the invisible translation, which keeps the declared priority).
fn raw_priority(el: &Element) -> i32 {
    el.get_child("priority", ns::SERVER)
        .and_then(|p| p.text().trim().parse::<i32>().ok())
        .map(|p| p.clamp(-128, 127))
        .unwrap_or(0)
}

/// The presence module.
pub struct PresenceModule {
    /// Administrative addresses copied on every availability change.
    bcc: Vec<String>,
}

impl PresenceModule {
    /// Create the module with an optional BCC list.
    pub fn new(bcc: Vec<String>) -> Arc<Self> {
        Arc::new(Self { bcc })
    }

    async fn send_to(&self, jsm: &Jsm, presence: &Element, to: &str) {
        let mut copy = presence.clone();
        copy.set_attr("to", to);
        jsm.deliver(copy).await;
    }

    async fn broadcast(&self, jsm: &Jsm, presence: &Element, targets: Vec<String>) {
        for target in targets {
            self.send_to(jsm, presence, &target).await;
        }
    }

    /// Undirected presence from a session.
    async fn self_presence(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        mut element: Element,
    ) -> ModRet {
        let ptype = element.attr("type").map(str::to_string);

        match ptype.as_deref() {
            None => {
                let new_priority = util::priority_of(&element);
                util::delay_stamp(
                    &mut element,
                    &user
                        .session(resource)
                        .map(|s| s.jid.to_string())
                        .unwrap_or_default(),
                    None,
                );

                let (old_priority, was_invisible) = {
                    let Some(session) = user.session_mut(resource) else {
                        return ModRet::Handled;
                    };
                    let scratch = session.aux.get_or_default::<PresenceScratch>();
                    let was_invisible = scratch.invisible;
                    let old = session.priority;
                    session.presence = element.clone();
                    session.priority = new_priority;
                    (old, was_invisible)
                };

                if old_priority < -128 || was_invisible {
                    self.come_online(jsm, user, resource, &element).await;
                } else {
                    // update: A ∩ trustees, plus the bcc list
                    let targets: Vec<String> = {
                        let trustees = user.trustees.clone();
                        let Some(session) = user.session_mut(resource) else {
                            return ModRet::Handled;
                        };
                        let scratch = session.aux.get_or_default::<PresenceScratch>();
                        scratch
                            .avail
                            .iter()
                            .filter(|a| {
                                let bare = a
                                    .parse::<Jid>()
                                    .map(|j| j.user())
                                    .unwrap_or_else(|_| (*a).clone());
                                trustees.contains(&bare)
                            })
                            .cloned()
                            .chain(self.bcc.iter().cloned())
                            .collect()
                    };
                    self.broadcast(jsm, &element, targets).await;
                }
                ModRet::Handled
            }

            Some("unavailable") => {
                util::delay_stamp(
                    &mut element,
                    &user
                        .session(resource)
                        .map(|s| s.jid.to_string())
                        .unwrap_or_default(),
                    None,
                );
                let (targets, was_invisible) = {
                    let Some(session) = user.session_mut(resource) else {
                        return ModRet::Handled;
                    };
                    session.presence = element.clone();
                    session.priority = PRIORITY_GONE;
                    let scratch = session.aux.get_or_default::<PresenceScratch>();
                    let was_invisible = scratch.invisible;
                    let mut targets: Vec<String> = scratch
                        .avail
                        .drain()
                        .chain(scratch.invis.drain())
                        .collect();
                    scratch.invisible = false;
                    if !was_invisible {
                        targets.extend(self.bcc.iter().cloned());
                    }
                    (targets, was_invisible)
                };
                let _ = was_invisible;
                self.broadcast(jsm, &element, targets).await;
                ModRet::Handled
            }

            Some("invisible") => {
                let priority = raw_priority(&element);
                let was_available = {
                    let Some(session) = user.session(resource) else {
                        return ModRet::Handled;
                    };
                    session.available()
                        && !session
                            .aux
                            .get::<PresenceScratch>()
                            .map(|s| s.invisible)
                            .unwrap_or(false)
                };

                if was_available {
                    // pretend to go offline first
                    let mut unavailable = Element::new("presence", ns::SERVER);
                    unavailable.set_attr("type", "unavailable");
                    if let Some(session) = user.session(resource) {
                        unavailable.set_attr("from", session.jid.to_string());
                    }
                    let targets: Vec<String> = {
                        let Some(session) = user.session_mut(resource) else {
                            return ModRet::Handled;
                        };
                        let scratch = session.aux.get_or_default::<PresenceScratch>();
                        scratch
                            .avail
                            .drain()
                            .chain(scratch.invis.drain())
                            .chain(self.bcc.iter().cloned())
                            .collect()
                    };
                    self.broadcast(jsm, &unavailable, targets).await;
                }

                if let Some(session) = user.session_mut(resource) {
                    session.priority = priority;
                    session.aux.get_or_default::<PresenceScratch>().invisible = true;
                }
                debug!(user = %user.jid, resource = %resource, "session went invisible");
                ModRet::Handled
            }

            _ => ModRet::Pass(Packet {
                kind: rookery_bus::PacketKind::Normal,
                to: user.jid.clone(),
                from: None,
                element,
                bounced: false,
            }),
        }
    }

    /// First available presence: probes out, broadcast to subscribers.
    async fn come_online(&self, jsm: &Jsm, user: &mut User, resource: &str, element: &Element) {
        let bare = user.jid.to_string();

        // probe everyone we are subscribed to
        let seen: Vec<String> = user.seen.iter().cloned().collect();
        for contact in seen {
            let probe = Element::builder("presence", ns::SERVER)
                .attr("type", "probe")
                .attr("to", contact)
                .attr("from", bare.clone())
                .build();
            jsm.deliver(probe).await;
        }

        // seed A with our subscribers and broadcast to them
        let trustees: Vec<String> = user.trustees.iter().cloned().collect();
        {
            if let Some(session) = user.session_mut(resource) {
                let scratch = session.aux.get_or_default::<PresenceScratch>();
                scratch.invisible = false;
                for t in &trustees {
                    scratch.avail.insert(t.clone());
                }
            }
        }
        let mut targets = trustees;
        targets.extend(self.bcc.iter().cloned());
        self.broadcast(jsm, element, targets).await;

        // show this session what the user's other resources look like
        let others: Vec<(Jid, Element)> = user
            .sessions
            .iter()
            .filter(|s| s.resource != resource && s.available())
            .map(|s| (s.jid.clone(), s.presence.clone()))
            .collect();
        if let Some(session) = user.session(resource) {
            let cid = session.cid.clone();
            let sjid = session.jid.clone();
            for (_, presence) in others {
                let mut copy = presence;
                copy.set_attr("to", sjid.to_string());
                jsm.send_to_client(&cid, &sjid, copy).await;
            }
        }
    }

    /// Directed presence: adjust the sets, send verbatim.
    async fn directed(
        &self,
        jsm: &Jsm,
        user: &mut User,
        resource: &str,
        element: Element,
    ) -> ModRet {
        let target = element.attr("to").unwrap_or_default().to_string();
        let ptype = element.attr("type").map(str::to_string);

        if let Some(session) = user.session_mut(resource) {
            let scratch = session.aux.get_or_default::<PresenceScratch>();
            match ptype.as_deref() {
                None => {
                    scratch.invis.remove(&target);
                    scratch.avail.insert(target.clone());
                }
                Some("unavailable") => {
                    scratch.avail.remove(&target);
                }
                Some("invisible") => {
                    scratch.avail.remove(&target);
                    scratch.invis.insert(target.clone());
                    // invisibility is a local concept; the wire sees nothing
                    return ModRet::Handled;
                }
                _ => {}
            }
        }

        jsm.deliver(element).await;
        ModRet::Handled
    }

    /// Answer a probe from the session's last presence.
    async fn probe(&self, jsm: &Jsm, user: &mut User, packet: Packet) -> ModRet {
        let Some(sender) = packet
            .element
            .attr("from")
            .and_then(|f| f.parse::<Jid>().ok())
        else {
            return ModRet::Handled;
        };

        if !user.is_trustee(&sender.user()) {
            debug!(from = %sender, "probe from a non-trustee ignored");
            return ModRet::Handled;
        }

        let replies: Vec<Element> = user
            .sessions
            .iter()
            .filter(|s| s.available())
            .filter_map(|s| {
                let scratch = s.aux.get::<PresenceScratch>();
                let invisible = scratch.map(|p| p.invisible).unwrap_or(false);
                if invisible {
                    // only those already allowed through may learn anything
                    let allowed = scratch
                        .map(|p| set_contains(&p.avail, &sender))
                        .unwrap_or(false);
                    if !allowed {
                        return None;
                    }
                }
                if set_contains(
                    &scratch.map(|p| p.invis.clone()).unwrap_or_default(),
                    &sender,
                ) {
                    return None;
                }
                Some(s.presence.clone())
            })
            .collect();

        for presence in replies {
            self.send_to(jsm, &presence, &sender.to_string()).await;
        }
        ModRet::Handled
    }
}

#[async_trait]
impl Module for PresenceModule {
    fn name(&self) -> &'static str {
        "presence"
    }

    async fn out(&self, jsm: &Jsm, user: &mut User, resource: &str, packet: Packet) -> ModRet {
        if packet.element.name() != "presence" {
            return ModRet::Pass(packet);
        }
        match packet.stanza_type() {
            Some("subscribe") | Some("subscribed") | Some("unsubscribe")
            | Some("unsubscribed") | Some("probe") | Some("error") => ModRet::Pass(packet),
            _ => {
                if packet.element.attr("to").is_some() {
                    self.directed(jsm, user, resource, packet.element).await
                } else {
                    self.self_presence(jsm, user, resource, packet.element).await
                }
            }
        }
    }

    async fn deliver(&self, jsm: &Jsm, user: &mut User, mut packet: Packet) -> ModRet {
        if packet.element.name() != "presence" {
            return ModRet::Pass(packet);
        }
        match packet.stanza_type() {
            Some("probe") => self.probe(jsm, user, packet).await,

            Some("error") => {
                if let Some(from) = packet.element.attr("from").map(str::to_string) {
                    for session in user.sessions.iter_mut() {
                        let scratch = session.aux.get_or_default::<PresenceScratch>();
                        scratch.avail.remove(&from);
                        if let Ok(jid) = from.parse::<Jid>() {
                            scratch.avail.remove(&jid.user());
                        }
                    }
                }
                ModRet::Pass(packet)
            }

            Some("invisible") => {
                // peers never address us invisibly; normalize
                packet.element.set_attr("type", "unavailable");
                ModRet::Pass(packet)
            }

            None => {
                // available presence from someone we never subscribed to:
                // tell them to stop (roster drift repair)
                let Some(sender) = packet
                    .element
                    .attr("from")
                    .and_then(|f| f.parse::<Jid>().ok())
                else {
                    return ModRet::Pass(packet);
                };
                if !user.seen.contains(&sender.user()) {
                    let unsub = Element::builder("presence", ns::SERVER)
                        .attr("type", "unsubscribe")
                        .attr("to", sender.user())
                        .attr("from", user.jid.to_string())
                        .build();
                    jsm.deliver(unsub).await;
                    return ModRet::Handled;
                }
                ModRet::Pass(packet)
            }

            _ => ModRet::Pass(packet),
        }
    }

    async fn rosterchange(&self, jsm: &Jsm, user: &mut User, item: &Element) {
        // a contact that can now see us gets our current presence
        let sub = item.attr("subscription").unwrap_or("none");
        if !matches!(sub, "from" | "both") {
            return;
        }
        let Some(contact) = item.attr("jid").map(str::to_string) else {
            return;
        };

        let mut updates: Vec<Element> = Vec::new();
        for session in user.sessions.iter_mut() {
            if !session.available() {
                continue;
            }
            let presence = session.presence.clone();
            let scratch = session.aux.get_or_default::<PresenceScratch>();
            if scratch.invisible || scratch.avail.contains(&contact) {
                continue;
            }
            scratch.avail.insert(contact.clone());
            updates.push(presence);
        }
        for presence in updates {
            self.send_to(jsm, &presence, &contact).await;
        }
    }

    async fn serialize(&self, _jsm: &Jsm, user: &User, resource: &str, out: &mut Element) {
        if let Some(session) = user.session(resource) {
            if session.available() {
                out.append_child(session.presence.clone());
            }
        }
    }

    async fn deserialize(&self, _jsm: &Jsm, user: &mut User, resource: &str, data: &Element) {
        let Some(presence) = data.get_child("presence", ns::SERVER).cloned() else {
            return;
        };
        if let Some(session) = user.session_mut(resource) {
            session.priority = util::priority_of(&presence);
            session.presence = presence;
        }
    }

    async fn session_end(&self, jsm: &Jsm, user: &mut User, resource: &str) {
        let (still_available, from, targets) = {
            let Some(session) = user.session_mut(resource) else {
                return;
            };
            let available = session.available();
            let from = session.jid.to_string();
            let scratch = session.aux.get_or_default::<PresenceScratch>();
            let targets: Vec<String> = scratch
                .avail
                .drain()
                .chain(scratch.invis.drain())
                .chain(self.bcc.iter().cloned())
                .collect();
            (available, from, targets)
        };

        if still_available {
            let mut unavailable = Element::new("presence", ns::SERVER);
            unavailable.set_attr("type", "unavailable");
            unavailable.set_attr("from", from);
            self.broadcast(jsm, &unavailable, targets).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_priority_ignores_type() {
        let mut el = Element::new("presence", ns::SERVER);
        el.set_attr("type", "invisible");
        let mut p = Element::new("priority", ns::SERVER);
        p.append_text("6");
        el.append_child(p);
        assert_eq!(raw_priority(&el), 6);
        assert_eq!(util::priority_of(&el), PRIORITY_GONE);
    }

    #[test]
    fn set_matching_accepts_bare_or_full() {
        let mut set = HashSet::new();
        set.insert("v@b.example".to_string());
        let full: Jid = "v@b.example/desk".parse().unwrap();
        assert!(set_contains(&set, &full));

        let other: Jid = "w@b.example/desk".parse().unwrap();
        assert!(!set_contains(&set, &other));
    }
}
