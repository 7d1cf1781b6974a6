//! Session-manager flows: subscriptions, offline storage, privacy lists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rookery_bus::{
    Handler, HandlerResult, Instance, InstanceType, MemoryXdb, Packet, Router, XdbCache,
    XdbInstanceHandler,
};
use rookery_jid::Jid;
use rookery_jsm::modules::{OfflineModule, PresenceModule, PrivacyModule, RosterModule};
use rookery_jsm::modules::offline::OfflineConfig;
use rookery_jsm::{Jsm, JsmConfig};
use rookery_xml::{ns, Element};

struct Capture {
    tx: mpsc::UnboundedSender<Packet>,
}

#[async_trait]
impl Handler for Capture {
    async fn handle(&self, packet: Packet) -> HandlerResult {
        let _ = self.tx.send(packet);
        HandlerResult::Done
    }
}

struct Rig {
    router: Arc<Router>,
    jsm: Arc<Jsm>,
    xdb: Arc<XdbCache>,
    client: mpsc::UnboundedReceiver<Packet>,
    remote: mpsc::UnboundedReceiver<Packet>,
}

async fn rig() -> Rig {
    let router = Arc::new(Router::new());

    // storage
    let backend = Arc::new(MemoryXdb::new());
    let storage = Instance::new("xdb-mem", InstanceType::Xdb, vec!["*".to_string()]);
    storage.add_handler(XdbInstanceHandler::new(backend, Arc::clone(&router)));
    router.register(storage).unwrap();

    // c2s capture
    let (ctx, client) = mpsc::unbounded_channel();
    let c2s = Instance::new("c2s", InstanceType::Client, vec!["c2s.test".to_string()]);
    c2s.add_handler(Arc::new(Capture { tx: ctx }));
    router.register(c2s).unwrap();

    // remote capture (everything not local)
    let (rtx, remote) = mpsc::unbounded_channel();
    let wildcard = Instance::new("remote", InstanceType::Server, vec!["*".to_string()]);
    wildcard.add_handler(Arc::new(Capture { tx: rtx }));
    router.register(wildcard).unwrap();

    let config = JsmConfig {
        instance_id: "sessions.a.example".to_string(),
        hosts: vec!["a.example".to_string()],
        server_name: "rookery".to_string(),
    };
    let xdb = XdbCache::new(Arc::clone(&router), config.instance_id.clone());
    let jsm = Jsm::new(config, Arc::clone(&router), Arc::clone(&xdb));
    jsm.register_module(PrivacyModule::new());
    jsm.register_module(RosterModule::new());
    jsm.register_module(OfflineModule::new(OfflineConfig::default()));
    jsm.register_module(PresenceModule::new(Vec::new()));
    jsm.start().unwrap();

    Rig {
        router,
        jsm,
        xdb,
        client,
        remote,
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("capture closed")
}

/// Pull packets until one satisfies the predicate, dropping the rest.
async fn next_matching<F: Fn(&Packet) -> bool>(
    rx: &mut mpsc::UnboundedReceiver<Packet>,
    pred: F,
) -> Packet {
    loop {
        let packet = next(rx).await;
        if pred(&packet) {
            return packet;
        }
    }
}

async fn deliver(router: &Router, element: Element) {
    router
        .deliver(Packet::from_element(element).unwrap())
        .await;
}

/// Open a session for `full` with c2s return address `cid`.
async fn open_session(rig: &mut Rig, full: &str, cid: &str) {
    let start = Element::builder("route", ns::SERVER)
        .attr("type", "session")
        .attr("to", full)
        .attr("from", cid)
        .build();
    deliver(&rig.router, start).await;
    let ack = next_matching(&mut rig.client, |p| {
        p.element.name() == "route" && p.element.attr("type") == Some("session")
    })
    .await;
    assert_eq!(ack.element.attr("from"), Some(full));
}

/// Send a stanza from the session into the manager.
async fn from_session(rig: &Rig, full: &str, cid: &str, stanza: Element) {
    let route = Element::builder("route", ns::SERVER)
        .attr("to", full)
        .attr("from", cid)
        .append(stanza)
        .build();
    deliver(&rig.router, route).await;
}

fn unwrap_route(packet: &Packet) -> Element {
    assert_eq!(packet.element.name(), "route");
    packet
        .element
        .children()
        .next()
        .expect("route payload")
        .clone()
}

#[tokio::test]
async fn subscribe_round_trip_builds_the_roster() {
    let mut rig = rig().await;
    let full = "romeo@a.example/desk";
    let cid = "c2s.test/s1";
    open_session(&mut rig, full, cid).await;

    // fetch the roster so pushes flow, and mark roster=true
    from_session(
        &rig,
        full,
        cid,
        Element::builder("iq", ns::SERVER)
            .attr("type", "get")
            .attr("id", "r1")
            .append(Element::new("query", ns::ROSTER))
            .build(),
    )
    .await;
    let result = next_matching(&mut rig.client, |p| {
        unwrap_route(p).attr("id") == Some("r1".into())
    })
    .await;
    let iq = unwrap_route(&result);
    assert_eq!(iq.attr("type"), Some("result"));
    assert_eq!(
        iq.get_child("query", ns::ROSTER).unwrap().children().count(),
        0
    );

    // outbound subscribe
    from_session(
        &rig,
        full,
        cid,
        Element::builder("presence", ns::SERVER)
            .attr("to", "juliet@b.example")
            .attr("type", "subscribe")
            .build(),
    )
    .await;

    // the contact's server sees the request, bare to bare
    let sub = next_matching(&mut rig.remote, |p| {
        p.element.name() == "presence" && p.element.attr("type") == Some("subscribe")
    })
    .await;
    assert_eq!(sub.element.attr("from"), Some("romeo@a.example"));
    assert_eq!(sub.element.attr("to"), Some("juliet@b.example"));

    // a push announces the pending item
    let push = next_matching(&mut rig.client, |p| {
        let el = unwrap_route(p);
        el.name() == "iq" && el.get_child("query", ns::ROSTER).is_some()
    })
    .await;
    let item = unwrap_route(&push)
        .get_child("query", ns::ROSTER)
        .unwrap()
        .get_child("item", ns::ROSTER)
        .unwrap()
        .clone();
    assert_eq!(item.attr("jid"), Some("juliet@b.example"));
    assert_eq!(item.attr("subscription"), Some("none"));
    assert_eq!(item.attr("ask"), Some("subscribe"));

    // the approval arrives
    deliver(
        &rig.router,
        Element::builder("presence", ns::SERVER)
            .attr("from", "juliet@b.example")
            .attr("to", "romeo@a.example")
            .attr("type", "subscribed")
            .build(),
    )
    .await;

    let push = next_matching(&mut rig.client, |p| {
        let el = unwrap_route(p);
        el.name() == "iq"
            && el
                .get_child("query", ns::ROSTER)
                .and_then(|q| q.get_child("item", ns::ROSTER))
                .is_some_and(|i| i.attr("subscription") == Some("to"))
    })
    .await;
    let item = unwrap_route(&push)
        .get_child("query", ns::ROSTER)
        .unwrap()
        .get_child("item", ns::ROSTER)
        .unwrap()
        .clone();
    assert_eq!(item.attr("ask"), None);

    // a duplicate approval changes nothing: probe the stored roster
    deliver(
        &rig.router,
        Element::builder("presence", ns::SERVER)
            .attr("from", "juliet@b.example")
            .attr("to", "romeo@a.example")
            .attr("type", "subscribed")
            .build(),
    )
    .await;

    let owner: Jid = "romeo@a.example".parse().unwrap();
    let stored = rig.xdb.get(&owner, ns::ROSTER).await.unwrap();
    let items: Vec<_> = stored.children().collect();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].attr("subscription"), Some("to"));
}

#[tokio::test]
async fn offline_messages_flood_once_online() {
    let mut rig = rig().await;

    for i in 0..3 {
        deliver(
            &rig.router,
            Element::builder("message", ns::SERVER)
                .attr("to", "sleeper@a.example")
                .attr("from", "sender@a.example/desk")
                .attr("type", "chat")
                .attr("id", format!("m{}", i))
                .append(Element::builder("body", ns::SERVER).text("psst").build())
                .build(),
        )
        .await;
    }

    // wait until all three are shelved
    let owner: Jid = "sleeper@a.example".parse().unwrap();
    for _ in 0..100 {
        let count = rig
            .xdb
            .get(&owner, ns::OFFLINE)
            .await
            .map(|c| c.children().count())
            .unwrap_or(0);
        if count == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let stored = rig.xdb.get(&owner, ns::OFFLINE).await.unwrap();
    assert_eq!(stored.children().count(), 3);
    for message in stored.children() {
        assert!(message.attr("node").is_some());
        assert!(message.get_child("x", ns::DELAY).is_some());
    }

    // the user logs in and goes available
    let full = "sleeper@a.example/couch";
    let cid = "c2s.test/s2";
    open_session(&mut rig, full, cid).await;
    let mut presence = Element::new("presence", ns::SERVER);
    let mut prio = Element::new("priority", ns::SERVER);
    prio.append_text("3");
    presence.append_child(prio);
    from_session(&rig, full, cid, presence).await;

    let mut got = Vec::new();
    while got.len() < 3 {
        let packet = next_matching(&mut rig.client, |p| {
            unwrap_route(p).name() == "message"
        })
        .await;
        let msg = unwrap_route(&packet);
        assert!(msg.get_child("x", ns::DELAY).is_some());
        got.push(msg.attr("id").unwrap_or_default().to_string());
    }
    assert_eq!(got, vec!["m0", "m1", "m2"]);

    // the store is cleared after the flood
    let stored = rig.xdb.get(&owner, ns::OFFLINE).await.unwrap();
    assert_eq!(stored.children().count(), 0);
}

#[tokio::test]
async fn flexible_retrieval_suppresses_the_flood() {
    let mut rig = rig().await;

    deliver(
        &rig.router,
        Element::builder("message", ns::SERVER)
            .attr("to", "flex@a.example")
            .attr("from", "sender@a.example/desk")
            .attr("type", "chat")
            .append(Element::builder("body", ns::SERVER).text("wait for me").build())
            .build(),
    )
    .await;

    let owner: Jid = "flex@a.example".parse().unwrap();
    for _ in 0..100 {
        if rig
            .xdb
            .get(&owner, ns::OFFLINE)
            .await
            .map(|c| c.children().count())
            .unwrap_or(0)
            == 1
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let full = "flex@a.example/mobile";
    let cid = "c2s.test/s3";
    open_session(&mut rig, full, cid).await;

    // ask for the offline disco node first (XEP-0013)
    from_session(
        &rig,
        full,
        cid,
        Element::builder("iq", ns::SERVER)
            .attr("type", "get")
            .attr("id", "d1")
            .append(
                Element::builder("query", ns::DISCO_INFO)
                    .attr("node", ns::FLEX_OFFLINE)
                    .build(),
            )
            .build(),
    )
    .await;

    let reply = next_matching(&mut rig.client, |p| {
        unwrap_route(p).attr("id") == Some("d1".into())
    })
    .await;
    let iq = unwrap_route(&reply);
    let query = iq.get_child("query", ns::DISCO_INFO).unwrap();
    let form = query.get_child("x", "jabber:x:data").unwrap();
    let count_field = form
        .children()
        .find(|f| f.attr("var") == Some("number_of_messages"))
        .unwrap();
    assert_eq!(
        count_field
            .get_child("value", "jabber:x:data")
            .unwrap()
            .text(),
        "1"
    );

    // available presence must not flood now
    from_session(&rig, full, cid, Element::new("presence", ns::SERVER)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let stored = rig.xdb.get(&owner, ns::OFFLINE).await.unwrap();
    assert_eq!(stored.children().count(), 1, "store was flooded away");
}

#[tokio::test]
async fn privacy_activation_corrects_presence() {
    let mut rig = rig().await;

    // seed a mutual contact and a deny list before login
    let owner: Jid = "hermit@a.example".parse().unwrap();
    rig.xdb
        .set(
            &owner,
            ns::ROSTER,
            vec![Element::builder("item", ns::ROSTER)
                .attr("jid", "buddy@b.example")
                .attr("subscription", "both")
                .build()],
        )
        .await;
    rig.xdb
        .set(
            &owner,
            ns::PRIVACY,
            vec![Element::builder("list", ns::PRIVACY)
                .attr("name", "wall")
                .append(
                    Element::builder("item", ns::PRIVACY)
                        .attr("type", "jid")
                        .attr("value", "buddy@b.example")
                        .attr("action", "deny")
                        .attr("order", "1")
                        .append(Element::new("presence-out", ns::PRIVACY))
                        .build(),
                )
                .build()],
        )
        .await;

    let full = "hermit@a.example/cave";
    let cid = "c2s.test/s4";
    open_session(&mut rig, full, cid).await;
    from_session(&rig, full, cid, Element::new("presence", ns::SERVER)).await;

    // the mutual contact hears about us on login
    next_matching(&mut rig.remote, |p| {
        p.element.name() == "presence"
            && p.element.attr("to") == Some("buddy@b.example")
            && p.element.attr("type").is_none()
    })
    .await;

    // activate the deny list
    from_session(
        &rig,
        full,
        cid,
        Element::builder("iq", ns::SERVER)
            .attr("type", "set")
            .attr("id", "p1")
            .append(
                Element::builder("query", ns::PRIVACY)
                    .append(
                        Element::builder("active", ns::PRIVACY)
                            .attr("name", "wall")
                            .build(),
                    )
                    .build(),
            )
            .build(),
    )
    .await;

    let unavailable = next_matching(&mut rig.remote, |p| {
        p.element.name() == "presence" && p.element.attr("type") == Some("unavailable")
    })
    .await;
    assert_eq!(unavailable.element.attr("to"), Some("buddy@b.example"));

    // deactivate: probe plus fresh presence
    from_session(
        &rig,
        full,
        cid,
        Element::builder("iq", ns::SERVER)
            .attr("type", "set")
            .attr("id", "p2")
            .append(
                Element::builder("query", ns::PRIVACY)
                    .append(Element::new("active", ns::PRIVACY))
                    .build(),
            )
            .build(),
    )
    .await;

    let probe = next_matching(&mut rig.remote, |p| {
        p.element.name() == "presence" && p.element.attr("type") == Some("probe")
    })
    .await;
    assert_eq!(probe.element.attr("to"), Some("buddy@b.example"));
    assert_eq!(probe.element.attr("from"), Some("hermit@a.example"));

    next_matching(&mut rig.remote, |p| {
        p.element.name() == "presence"
            && p.element.attr("type").is_none()
            && p.element.attr("to") == Some("buddy@b.example")
    })
    .await;
}

#[tokio::test]
async fn duplicate_resources_are_refused() {
    let mut rig = rig().await;
    let full = "twin@a.example/desk";
    open_session(&mut rig, full, "c2s.test/s5").await;

    let start = Element::builder("route", ns::SERVER)
        .attr("type", "session")
        .attr("to", full)
        .attr("from", "c2s.test/s6")
        .build();
    deliver(&rig.router, start).await;

    let refusal = next_matching(&mut rig.client, |p| {
        p.element.name() == "route" && p.element.attr("type") == Some("error")
    })
    .await;
    assert_eq!(refusal.element.attr("to"), Some("c2s.test/s6"));
}

#[tokio::test]
async fn probes_answered_for_trustees_only() {
    let mut rig = rig().await;

    let owner: Jid = "star@a.example".parse().unwrap();
    rig.xdb
        .set(
            &owner,
            ns::ROSTER,
            vec![Element::builder("item", ns::ROSTER)
                .attr("jid", "fan@b.example")
                .attr("subscription", "from")
                .build()],
        )
        .await;

    let full = "star@a.example/stage";
    let cid = "c2s.test/s7";
    open_session(&mut rig, full, cid).await;
    from_session(&rig, full, cid, Element::new("presence", ns::SERVER)).await;

    // login broadcast to the subscriber
    next_matching(&mut rig.remote, |p| {
        p.element.name() == "presence" && p.element.attr("to") == Some("fan@b.example")
    })
    .await;

    // a trustee's probe is answered
    deliver(
        &rig.router,
        Element::builder("presence", ns::SERVER)
            .attr("type", "probe")
            .attr("from", "fan@b.example")
            .attr("to", "star@a.example")
            .build(),
    )
    .await;
    let answer = next_matching(&mut rig.remote, |p| {
        p.element.name() == "presence" && p.element.attr("to") == Some("fan@b.example")
    })
    .await;
    assert!(answer.element.attr("type").is_none());

    // a stranger's probe is not
    deliver(
        &rig.router,
        Element::builder("presence", ns::SERVER)
            .attr("type", "probe")
            .attr("from", "creep@c.example")
            .attr("to", "star@a.example")
            .build(),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        rig.remote.try_recv().is_err(),
        "stranger's probe was answered"
    );
}
