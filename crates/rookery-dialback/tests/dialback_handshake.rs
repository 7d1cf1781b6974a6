//! End-to-end dialback between two in-process servers.
//!
//! Server A holds a stanza for a user on server B; A dials B, B dials back
//! to A to verify the key, and once B reports `type='valid'` the queued
//! stanza flows through and lands in B's local instance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use rookery_bus::{Handler, HandlerResult, Instance, InstanceType, Packet, Router};
use rookery_dialback::{Dialback, DialbackConfig};
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

/// One in-process server: a router, a dialback instance, and a capture
/// handler for its own domain.
async fn server(
    domain: &str,
) -> (
    Arc<Router>,
    Arc<Dialback>,
    mpsc::UnboundedReceiver<Packet>,
    std::net::SocketAddr,
) {
    let router = Arc::new(Router::new());

    let (tx, rx) = mpsc::unbounded_channel();
    let local = Instance::new(
        format!("jsm-{}", domain),
        InstanceType::Server,
        vec![domain.to_string()],
    );
    local.add_handler(Arc::new(Capture { tx }));
    router.register(local).unwrap();

    let config = DialbackConfig {
        instance_id: format!("s2s-{}", domain),
        local_domains: vec![domain.to_string()],
        ..DialbackConfig::default()
    };
    let dialback = Dialback::new(config, Arc::clone(&router));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    dialback.start(listener).unwrap();

    (router, dialback, rx, addr)
}

async fn recv_packet(rx: &mut mpsc::UnboundedReceiver<Packet>) -> Packet {
    tokio::time::timeout(Duration::from_secs(15), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("capture channel closed")
}

#[tokio::test]
async fn stanza_crosses_after_dialback() {
    let (router_a, db_a, _rx_a, addr_a) = server("a.example").await;
    let (_router_b, db_b, mut rx_b, addr_b) = server("b.example").await;

    // pin the candidate lists so no real DNS happens
    db_a.ip_set("b.example", &format!("{}:{}", addr_b.ip(), addr_b.port()));
    db_b.ip_set("a.example", &format!("{}:{}", addr_a.ip(), addr_a.port()));

    let message = Element::builder("message", ns::SERVER)
        .attr("to", "juliet@b.example")
        .attr("from", "romeo@a.example/home")
        .attr("type", "chat")
        .append(Element::builder("body", ns::SERVER).text("wherefore").build())
        .build();
    router_a
        .deliver(Packet::from_element(message).unwrap())
        .await;

    let delivered = recv_packet(&mut rx_b).await;
    assert_eq!(delivered.element.name(), "message");
    assert_eq!(
        delivered
            .element
            .get_child("body", ns::SERVER)
            .unwrap()
            .text(),
        "wherefore"
    );

    // the pending entry is gone once the stream is authorized
    assert!(db_a.out_established("b.example", "a.example"));
    assert_eq!(db_a.connecting_count(), 0);
    assert!(db_b.in_established_count() >= 1);
}

#[tokio::test]
async fn queued_stanzas_flush_in_order() {
    let (router_a, db_a, _rx_a, addr_a) = server("c.example").await;
    let (_router_b, db_b, mut rx_b, addr_b) = server("d.example").await;

    db_a.ip_set("d.example", &format!("{}:{}", addr_b.ip(), addr_b.port()));
    db_b.ip_set("c.example", &format!("{}:{}", addr_a.ip(), addr_a.port()));

    for i in 0..3 {
        let message = Element::builder("message", ns::SERVER)
            .attr("to", "u@d.example")
            .attr("from", "v@c.example")
            .attr("id", format!("m{}", i))
            .build();
        router_a
            .deliver(Packet::from_element(message).unwrap())
            .await;
    }

    for i in 0..3 {
        let delivered = recv_packet(&mut rx_b).await;
        assert_eq!(delivered.element.attr("id"), Some(format!("m{}", i).as_str()));
    }
}

#[tokio::test]
async fn unauthorized_stanzas_close_the_stream() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let (_router, _db, mut rx, addr) = server("e.example").await;

    let mut raw = tokio::net::TcpStream::connect(addr).await.unwrap();
    raw.write_all(
        b"<stream:stream xmlns='jabber:server' \
          xmlns:stream='http://etherx.jabber.org/streams' \
          xmlns:db='jabber:server:dialback' to='e.example' version='1.0'>",
    )
    .await
    .unwrap();

    // no dialback: send a stanza straight away
    raw.write_all(b"<message to='u@e.example' from='x@rogue.example'><body>boo</body></message>")
        .await
        .unwrap();

    let mut out = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), raw.read_to_end(&mut out)).await;
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("invalid-from"), "got: {}", text);

    // nothing was delivered
    assert!(rx.try_recv().is_err());
}
