//! The outgoing dialback state machine.
//!
//! A stanza for a remote domain either rides an established stream or
//! lands in the pending connection (`dboc`) for its `(to, from)` key. A
//! fresh dboc spawns a connect task that resolves the candidate address
//! list and walks it in order; each connected socket sends our stream
//! header, answers the peer's root, and sends the `db:result` challenge.
//! Only `db:verify` round trips may use the stream before the peer
//! declares the result valid; on `type='valid'` the queue flushes FIFO and
//! the stream joins the established table.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rookery_jid::Jid;
use rookery_mio::{ConnEvent, ConnHandle};
use rookery_xml::{ns, Element};

use crate::dns::{parse_candidates, Candidate};
use crate::key::dialback_key;
use crate::{close_with_stream_error, now_secs, Dboc, Dialback, Miod, OutKey};

/// Seconds allowed for one TCP connect attempt.
const CONNECT_TIMEOUT: u64 = 20;

/// Accept a packet headed for a remote domain.
pub(crate) async fn handle_packet(db: &Arc<Dialback>, mut element: Element, ip: Option<String>) {
    let Some(to) = element.attr("to").and_then(|s| s.parse::<Jid>().ok()) else {
        warn!("dropping s2s packet with unparseable to address");
        return;
    };
    let Some(mut from) = element.attr("from").and_then(|s| s.parse::<Jid>().ok()) else {
        warn!("dropping s2s packet with unparseable from address");
        return;
    };

    // verify requests from our own incoming side carry our id as the
    // sender; restore the real origin before building the key
    let mut verify = false;
    if from.domain() == db.config.instance_id {
        verify = true;
        if let Some(ofrom) = element.attr("ofrom").map(str::to_string) {
            element.set_attr("from", ofrom.clone());
            element.remove_attr("ofrom");
            match ofrom.parse::<Jid>() {
                Ok(jid) => from = jid,
                Err(_) => {
                    warn!("verify request with bad ofrom, dropping");
                    return;
                }
            }
        }
    }

    let key = OutKey {
        to: to.domain().to_string(),
        from: from.domain().to_string(),
    };

    // the easy case: an authorized stream already exists
    let established = db
        .out_ok_db
        .get(&key)
        .map(|m| m.clone())
        .or_else(|| {
            if verify {
                None
            } else {
                db.out_ok_legacy.get(&key).map(|m| m.clone())
            }
        });
    if let Some(miod) = established {
        miod.write(element);
        return;
    }

    // find or start the pending connection
    let dboc = match db.out_connecting.entry(key.clone()) {
        Entry::Occupied(entry) => Arc::clone(entry.get()),
        Entry::Vacant(entry) => {
            let dboc = Dboc::new(key.clone());
            entry.insert(Arc::clone(&dboc));
            let candidates = ip.as_deref().map(parse_candidates);
            tokio::spawn(connect_task(
                Arc::clone(db),
                Arc::clone(&dboc),
                candidates,
            ));
            dboc
        }
    };

    let mut state = dboc.state.lock().expect("dboc lock");
    if let Some(miod) = &state.promoted {
        // promoted while we were looking; keep ordering behind the queue
        miod.write(element);
        return;
    }
    if verify {
        match &state.conn {
            Some(conn) => {
                conn.write(element);
            }
            None => state.verifies.push(element),
        }
    } else {
        state.queue.push((now_secs(), element));
    }
}

async fn connect_task(
    db: Arc<Dialback>,
    dboc: Arc<Dboc>,
    preset: Option<Vec<Candidate>>,
) {
    let candidates = match preset {
        Some(list) if !list.is_empty() => list,
        _ => match db.resolver.resolve(&dboc.key.to).await {
            Ok(list) => list,
            Err(e) => {
                warn!(domain = %dboc.key.to, error = %e, "s2s resolution failed");
                db.kill_dboc(&dboc.key).await;
                return;
            }
        },
    };

    for candidate in candidates {
        let Some(addr) = resolve_addr(&candidate).await else {
            debug!(host = %candidate.host, "candidate did not resolve");
            continue;
        };

        debug!(key = %dboc.key, addr = %addr, "attempting s2s connection");
        let connected = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT),
            rookery_mio::connect(addr, db.conn_config(false)),
        )
        .await;

        let (handle, events) = match connected {
            Ok(Ok(pair)) => pair,
            _ => {
                debug!(addr = %addr, "s2s connect attempt failed");
                continue;
            }
        };

        match run_outgoing(&db, &dboc, handle, events).await {
            Outcome::Established => return,
            Outcome::Fatal => {
                db.kill_dboc(&dboc.key).await;
                return;
            }
            Outcome::TryNext => continue,
        }
    }

    db.resolver.forget(&dboc.key.to);
    db.kill_dboc(&dboc.key).await;
}

async fn resolve_addr(candidate: &Candidate) -> Option<SocketAddr> {
    tokio::net::lookup_host((candidate.host.as_str(), candidate.port))
        .await
        .ok()?
        .next()
}

enum Outcome {
    Established,
    Fatal,
    TryNext,
}

async fn run_outgoing(
    db: &Arc<Dialback>,
    dboc: &Arc<Dboc>,
    handle: ConnHandle,
    mut events: mpsc::Receiver<ConnEvent>,
) -> Outcome {
    let key = dboc.key.clone();

    handle.write_bytes(
        format!(
            "<?xml version='1.0'?><stream:stream xmlns:stream='{}' xmlns='jabber:server' \
             xmlns:db='{}' to='{}' from='{}' loopcheck='{}' version='1.0'>",
            ns::STREAM,
            ns::DIALBACK,
            key.to,
            key.from,
            db.loop_token
        )
        .into_bytes(),
    );

    let mut peer_id: Option<String> = None;
    let mut result_sent = false;

    while let Some(event) = events.recv().await {
        match event {
            ConnEvent::New | ConnEvent::Buffer(_) | ConnEvent::Timeout => {}

            ConnEvent::XmlRoot(root) => {
                if root.attr("xmlns") != Some(ns::SERVER) {
                    close_with_stream_error(&handle, "invalid-namespace", "Invalid Stream Header");
                    return Outcome::Fatal;
                }

                if root.attr("xmlns:db").is_none() {
                    return legacy_root(db, dboc, handle, events).await;
                }

                peer_id = root.attr("id").map(str::to_string);
                let peer_is_xmpp = root.attr("version").is_some();

                // the socket is usable for verify requests from here on
                {
                    let mut state = dboc.state.lock().expect("dboc lock");
                    state.conn = Some(handle.clone());
                    for verify in state.verifies.drain(..) {
                        handle.write(verify);
                    }
                }

                if !peer_is_xmpp {
                    // pre-1.0 peer: no features are coming
                    if !send_result(db, &key, &handle, peer_id.as_deref()) {
                        return Outcome::Fatal;
                    }
                    result_sent = true;
                }
            }

            ConnEvent::XmlNode(el) => {
                if el.ns() == ns::STREAM && el.name() == "features" {
                    if !result_sent {
                        if !send_result(db, &key, &handle, peer_id.as_deref()) {
                            return Outcome::Fatal;
                        }
                        result_sent = true;
                    }
                } else if el.ns() == ns::DIALBACK && el.name() == "result" {
                    if el.attr("from") != Some(key.to.as_str())
                        || el.attr("to") != Some(key.from.as_str())
                    {
                        warn!(
                            key = %key,
                            from = ?el.attr("from"),
                            to = ?el.attr("to"),
                            "illegal dialback validation"
                        );
                        close_with_stream_error(&handle, "invalid-from", "Invalid Dialback Result");
                        clear_conn(dboc);
                        return Outcome::Fatal;
                    }

                    if el.attr("type") == Some("valid") {
                        promote(db, dboc, &handle);
                        info!(key = %key, "outgoing dialback stream authorized");
                        return established_loop(db, handle, events).await;
                    }

                    warn!(key = %key, "peer declared our dialback key invalid");
                    clear_conn(dboc);
                    handle.close();
                    return Outcome::Fatal;
                } else if el.ns() == ns::DIALBACK && el.name() == "verify" {
                    // answer for a verification our incoming side asked for
                    db.in_verify(el);
                } else if el.ns() == ns::STREAM && el.name() == "error" {
                    debug!(key = %key, "stream error before authorization");
                    clear_conn(dboc);
                    handle.close();
                    return Outcome::Fatal;
                } else {
                    close_with_stream_error(
                        &handle,
                        "not-authorized",
                        "Not Allowed to send data on this socket",
                    );
                    clear_conn(dboc);
                    return Outcome::Fatal;
                }
            }

            ConnEvent::XmlClose => {
                handle.close();
            }
            ConnEvent::XmlError(_) | ConnEvent::Error(_) => {
                handle.close();
            }
            ConnEvent::Closed => {
                clear_conn(dboc);
                return Outcome::TryNext;
            }
        }
    }

    clear_conn(dboc);
    Outcome::TryNext
}

/// The peer has no dialback support: only configured legacy peers pass.
async fn legacy_root(
    db: &Arc<Dialback>,
    dboc: &Arc<Dboc>,
    handle: ConnHandle,
    events: mpsc::Receiver<ConnEvent>,
) -> Outcome {
    let key = dboc.key.clone();
    if !db.config.legacy_peers.iter().any(|d| d == &key.to) {
        info!(peer = %key.to, "legacy server access denied by configuration");
        close_with_stream_error(&handle, "unsupported-version", "Legacy Access Denied");
        return Outcome::Fatal;
    }

    warn!(peer = %key.to, "authorizing legacy s2s peer without dialback");
    let miod = Miod::new(handle.clone());
    {
        let mut state = dboc.state.lock().expect("dboc lock");
        state.promoted = Some(miod.clone());
        for (_, element) in state.queue.drain(..) {
            miod.write(element);
        }
        // verifies cannot be serviced by a legacy peer
        for mut verify in state.verifies.drain(..) {
            verify.set_attr("type", "error");
            db.in_verify(verify);
        }
    }
    db.out_ok_legacy.insert(key.clone(), miod);
    db.out_connecting.remove(&key);

    established_loop(db, handle, events).await
}

/// Move the pending connection into the established table, draining the
/// queue in FIFO order under the state lock so nothing overtakes it.
fn promote(db: &Arc<Dialback>, dboc: &Arc<Dboc>, handle: &ConnHandle) {
    let miod = Miod::new(handle.clone());
    {
        let mut state = dboc.state.lock().expect("dboc lock");
        state.promoted = Some(miod.clone());
        for (_, element) in state.queue.drain(..) {
            miod.write(element);
        }
    }
    db.out_ok_db.insert(dboc.key.clone(), miod);
    db.out_connecting.remove(&dboc.key);
}

fn clear_conn(dboc: &Arc<Dboc>) {
    dboc.state.lock().expect("dboc lock").conn = None;
}

/// Send our `db:result` challenge; requires the peer's stream id.
fn send_result(db: &Arc<Dialback>, key: &OutKey, handle: &ConnHandle, peer_id: Option<&str>) -> bool {
    let Some(id) = peer_id else {
        warn!(key = %key, "peer sent no stream id, cannot dialback");
        close_with_stream_error(handle, "invalid-id", "Missing Stream ID");
        return false;
    };
    let computed = dialback_key(&db.secret, &key.to, &key.from, id);
    let result = Element::builder("result", ns::DIALBACK)
        .attr("to", key.to.clone())
        .attr("from", key.from.clone())
        .text(computed)
        .build();
    handle.write(result);
    true
}

/// After authorization: only verify answers may arrive on this socket.
async fn established_loop(
    db: &Arc<Dialback>,
    handle: ConnHandle,
    mut events: mpsc::Receiver<ConnEvent>,
) -> Outcome {
    while let Some(event) = events.recv().await {
        match event {
            ConnEvent::XmlNode(el) => {
                if el.ns() == ns::DIALBACK && el.name() == "verify" {
                    db.in_verify(el);
                } else {
                    close_with_stream_error(
                        &handle,
                        "not-authorized",
                        "Not Allowed to send data on this socket",
                    );
                }
            }
            ConnEvent::XmlClose => handle.close(),
            ConnEvent::XmlError(_) | ConnEvent::Error(_) => handle.close(),
            ConnEvent::Closed => break,
            _ => {}
        }
    }
    db.drop_conn_entries(handle.id());
    Outcome::Established
}
