//! The incoming dialback state machine.
//!
//! Each accepted s2s connection gets a fresh random stream id. The peer
//! may then, in any order and for several domain pairs on one stream:
//!
//! - claim domains with `db:result`; each claim is recorded pending and
//!   relayed as a `db:verify` round trip through the bus to the claimed
//!   domain's authoritative server,
//! - ask us to verify keys minted against our own id with `db:verify`,
//!   answered directly from the shared secret,
//! - send stanzas, which are only delivered when the `(id, to, from)`
//!   triple has been authorized.
//!
//! Verify answers come back from the outgoing side through
//! [`Dialback::in_verify`], matched against the pending claims, answered
//! on the incoming socket with `db:result type='valid'|'invalid'`.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rookery_bus::Packet;
use rookery_jid::Jid;
use rookery_mio::{ConnEvent, ConnHandle};
use rookery_xml::{ns, Element};

use crate::key::{dialback_key, key_matches, random_stream_id};
use crate::{close_with_stream_error, Dialback, InKey, Miod};

/// One recorded `db:result` claim awaiting its verify round trip.
struct PendingResult {
    /// Local domain the peer addressed (`to`).
    to: String,
    /// Domain the peer asserts (`from`).
    from: String,
}

/// Drive one accepted s2s connection.
pub async fn run_incoming(
    db: Arc<Dialback>,
    handle: ConnHandle,
    mut events: mpsc::Receiver<ConnEvent>,
) {
    let mut stream_id: Option<String> = None;
    let mut legacy = false;
    let mut pending: Vec<PendingResult> = Vec::new();
    let mut authorized: HashSet<(String, String)> = HashSet::new();
    let miod = Miod::new(handle.clone());

    let (verify_tx, mut verify_rx) = mpsc::unbounded_channel::<Element>();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    ConnEvent::New | ConnEvent::Buffer(_) | ConnEvent::Timeout => {}

                    ConnEvent::XmlRoot(root) => {
                        if !handle_root(
                            &db,
                            &handle,
                            &root,
                            &mut stream_id,
                            &mut legacy,
                            &verify_tx,
                        ) {
                            break;
                        }
                    }

                    ConnEvent::XmlNode(el) => {
                        let Some(id) = stream_id.as_deref() else {
                            close_with_stream_error(&handle, "invalid-xml", "No Stream Header");
                            break;
                        };
                        if !handle_node(
                            &db,
                            &handle,
                            &miod,
                            id,
                            legacy,
                            &mut pending,
                            &mut authorized,
                            el,
                        )
                        .await
                        {
                            break;
                        }
                    }

                    ConnEvent::XmlClose => {
                        handle.write_bytes(b"</stream:stream>".to_vec());
                        handle.close();
                    }
                    ConnEvent::XmlError(e) => {
                        close_with_stream_error(&handle, e.stream_condition(), "stream died");
                    }
                    ConnEvent::Error(_) => handle.close(),
                    ConnEvent::Closed => break,
                }
            }

            answer = verify_rx.recv() => {
                let Some(answer) = answer else { break };
                let Some(id) = stream_id.as_deref() else { continue };
                handle_verify_answer(
                    &db,
                    &handle,
                    &miod,
                    id,
                    &mut pending,
                    &mut authorized,
                    answer,
                );
            }
        }
    }

    if let Some(id) = stream_id {
        db.in_id.remove(&id);
    }
    db.drop_conn_entries(handle.id());
}

/// Answer the peer's stream root: header with our random id, features.
fn handle_root(
    db: &Arc<Dialback>,
    handle: &ConnHandle,
    root: &Element,
    stream_id: &mut Option<String>,
    legacy: &mut bool,
    verify_tx: &mpsc::UnboundedSender<Element>,
) -> bool {
    // loop detection: our own token coming back at us
    if root.attr("loopcheck") == Some(db.loop_token.as_str()) {
        warn!("stream looped back to ourselves");
        close_with_stream_error(handle, "remote-connection-failed", "Mirror Mirror");
        return false;
    }

    let we = match root.attr("to") {
        Some(to) if db.is_local(to) => to.to_string(),
        Some(to) => {
            warn!(to = %to, "incoming s2s stream for a domain we do not host");
            close_with_stream_error(handle, "host-unknown", "Invalid Destination");
            return false;
        }
        None => db
            .config
            .local_domains
            .first()
            .cloned()
            .unwrap_or_default(),
    };

    let peer_is_xmpp = root.attr("version").is_some();
    let id = random_stream_id();

    let mut header = format!(
        "<?xml version='1.0'?><stream:stream xmlns:stream='{}' xmlns='jabber:server' \
         xmlns:db='{}' from='{}' id='{}'",
        ns::STREAM,
        ns::DIALBACK,
        we,
        id
    );
    if let Some(from) = root.attr("from") {
        header.push_str(&format!(" to='{}'", from));
    }
    if peer_is_xmpp {
        header.push_str(" version='1.0'");
    }
    header.push('>');
    handle.write_bytes(header.into_bytes());

    if root.attr("xmlns") != Some(ns::SERVER) {
        close_with_stream_error(handle, "invalid-namespace", "Invalid Stream Header");
        return false;
    }

    if root.attr("xmlns:db").is_none() {
        if db.config.legacy_peers.is_empty() {
            info!("refusing legacy s2s peer (no dialback, none configured)");
            close_with_stream_error(handle, "not-authorized", "Legacy Access Denied");
            return false;
        }
        *legacy = true;
        warn!("incoming legacy s2s stream accepted, restricted to configured peers");
    }

    if peer_is_xmpp {
        let features = Element::builder("features", ns::STREAM)
            .append(Element::new("dialback", "urn:xmpp:features:dialback"))
            .build();
        handle.write(features);
    }

    db.in_id.insert(id.clone(), verify_tx.clone());
    *stream_id = Some(id);
    true
}

/// Handle one inbound frame on an incoming stream.
#[allow(clippy::too_many_arguments)]
async fn handle_node(
    db: &Arc<Dialback>,
    handle: &ConnHandle,
    miod: &Miod,
    stream_id: &str,
    legacy: bool,
    pending: &mut Vec<PendingResult>,
    authorized: &mut HashSet<(String, String)>,
    el: Element,
) -> bool {
    // TLS and SASL are negotiation plug points; without them configured
    // the offers are declined cleanly.
    if el.ns() == ns::XMPP_TLS && el.name() == "starttls" {
        handle.write(Element::new("failure", ns::XMPP_TLS));
        handle.close();
        return false;
    }
    if el.ns() == ns::XMPP_SASL && el.name() == "auth" {
        let mut failure = Element::new("failure", ns::XMPP_SASL);
        failure.append_child(Element::new("not-authorized", ns::XMPP_SASL));
        handle.write(failure);
        handle.close();
        return false;
    }

    if el.ns() == ns::DIALBACK && el.name() == "verify" {
        return answer_verify(db, handle, el);
    }

    if el.ns() == ns::DIALBACK && el.name() == "result" {
        return relay_result(db, handle, stream_id, pending, el).await;
    }

    // an ordinary stanza: deliverable only on an authorized pair
    let (Some(to), Some(from)) = (
        el.attr("to").and_then(|s| s.parse::<Jid>().ok()),
        el.attr("from").and_then(|s| s.parse::<Jid>().ok()),
    ) else {
        close_with_stream_error(handle, "improper-addressing", "Invalid Packet");
        return false;
    };

    let pair = (to.domain().to_string(), from.domain().to_string());

    let allowed = if legacy {
        db.config.legacy_peers.iter().any(|d| d == from.domain()) && db.is_local(to.domain())
    } else {
        authorized.contains(&pair)
    };

    if !allowed {
        warn!(to = %to, from = %from, "stanza on unauthorized incoming stream");
        close_with_stream_error(handle, "invalid-from", "Invalid Packets Received");
        return false;
    }

    if legacy {
        let key = InKey {
            id: stream_id.to_string(),
            to: pair.0.clone(),
            from: pair.1.clone(),
        };
        db.in_ok_legacy.entry(key).or_insert_with(|| miod.clone());
    }

    miod.touch();
    match Packet::from_element(el) {
        Ok(packet) => db.router.deliver(packet).await,
        Err(e) => debug!(error = %e, "undeliverable inbound stanza"),
    }
    true
}

/// Answer a `db:verify` asked of us, from the shared secret.
fn answer_verify(db: &Arc<Dialback>, handle: &ConnHandle, el: Element) -> bool {
    let to = el.attr("to").unwrap_or_default().to_string();
    let from = el.attr("from").unwrap_or_default().to_string();
    let id = el.attr("id").unwrap_or_default().to_string();
    let presented = el.text();

    let expected = dialback_key(&db.secret, &from, &to, &id);
    let valid = key_matches(presented.trim(), &expected);
    if !valid {
        warn!(from = %from, id = %id, "dialback verify key mismatch");
    }

    let reply = Element::builder("verify", ns::DIALBACK)
        .attr("to", from)
        .attr("from", to)
        .attr("id", id)
        .attr("type", if valid { "valid" } else { "invalid" })
        .build();
    handle.write(reply);
    true
}

/// Record a `db:result` claim and originate its verify round trip.
async fn relay_result(
    db: &Arc<Dialback>,
    handle: &ConnHandle,
    stream_id: &str,
    pending: &mut Vec<PendingResult>,
    el: Element,
) -> bool {
    let Some(to) = el.attr("to").map(str::to_string) else {
        close_with_stream_error(handle, "improper-addressing", "Result Without To");
        return false;
    };
    let Some(from) = el.attr("from").map(str::to_string) else {
        close_with_stream_error(handle, "improper-addressing", "Result Without From");
        return false;
    };
    if !db.is_local(&to) {
        close_with_stream_error(handle, "host-unknown", "Invalid Destination");
        return false;
    }

    pending.push(PendingResult {
        to: to.clone(),
        from: from.clone(),
    });

    // ask the claimed domain's authoritative server, through the bus so
    // failures bounce back to our instance id
    let verify = Element::builder("verify", ns::DIALBACK)
        .attr("to", from.clone())
        .attr("from", db.config.instance_id.clone())
        .attr("ofrom", to.clone())
        .attr("id", stream_id)
        .text(el.text())
        .build();

    debug!(claimed = %from, local = %to, "originating dialback verify");
    match Packet::from_element(verify) {
        Ok(packet) => db.router.deliver(packet).await,
        Err(e) => {
            warn!(error = %e, "could not route verify request");
        }
    }
    true
}

/// A verify answer (or bounced request) came back; settle the claim.
fn handle_verify_answer(
    db: &Arc<Dialback>,
    handle: &ConnHandle,
    miod: &Miod,
    stream_id: &str,
    pending: &mut Vec<PendingResult>,
    authorized: &mut HashSet<(String, String)>,
    answer: Element,
) {
    // a peer answer carries to=our domain, from=claimed domain; a failed
    // request comes back unswapped (or readdressed to our instance id)
    let to = answer.attr("to").unwrap_or_default().to_string();
    let from = answer.attr("from").unwrap_or_default().to_string();
    let valid = answer.attr("type") == Some("valid");

    let found = pending
        .iter()
        .position(|p| p.to == to && p.from == from)
        .or_else(|| pending.iter().position(|p| p.to == from && p.from == to))
        .or_else(|| {
            if valid {
                None
            } else {
                pending.iter().position(|p| p.from == from || p.to == to)
            }
        });
    let Some(idx) = found else {
        debug!(to = %to, from = %from, "verify answer without a pending claim");
        return;
    };
    let claim = pending.remove(idx);

    let result = Element::builder("result", ns::DIALBACK)
        .attr("to", claim.from.clone())
        .attr("from", claim.to.clone())
        .attr("type", if valid { "valid" } else { "invalid" })
        .build();
    handle.write(result);

    if valid {
        let key = InKey {
            id: stream_id.to_string(),
            to: claim.to.clone(),
            from: claim.from.clone(),
        };
        db.in_ok_db.insert(key, miod.clone());
        authorized.insert((claim.to, claim.from));
        info!(stream = %stream_id, "incoming dialback pair authorized");
    } else {
        info!(stream = %stream_id, claimed = %claim.from, "incoming dialback pair refused");
    }
}
