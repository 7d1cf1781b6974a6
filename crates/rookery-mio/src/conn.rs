//! The managed connection driver.
//!
//! Each connection runs one task that owns the socket. It reads under the
//! karma budget, feeds bytes through the incremental XML parser (or hands
//! them over raw), drains a FIFO write queue of typed entries, runs the
//! karma heartbeat and the one-second timer tick, and reports everything
//! that happens as [`ConnEvent`]s on the connection's event channel. The
//! owning instance talks back through a cloneable [`ConnHandle`].
//!
//! Handlers consuming events must not block the event channel; they may
//! enqueue writes freely (the queue is unbounded, like the original's).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use rookery_xml::{Element, NsDeclList, StreamEvent, StreamKind, XmlError, XmlStream};

use crate::karma::{Karma, KARMA_HEARTBEAT};
use crate::legacy::{self, HttpAnswer, Sniff};
use crate::rate::{RateConfig, RateLimit};

/// Read buffer size; also the upper bound on one karma read budget.
pub const READ_BUF_SIZE: usize = 8192;

/// How many seconds a closing connection may spend flushing its queue.
const FLUSH_GRACE: u32 = 30;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Events delivered to the connection's owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// The connection is up and the driver is running.
    New,
    /// Raw bytes, for connections not in XML mode.
    Buffer(Vec<u8>),
    /// The stream root element opened.
    XmlRoot(Element),
    /// A complete stanza arrived.
    XmlNode(Element),
    /// The peer closed the stream.
    XmlClose,
    /// The inbound stream was not parseable; the connection will close.
    XmlError(XmlError),
    /// A socket-level failure; the connection will close.
    Error(String),
    /// The registered timer expired.
    Timeout,
    /// The connection is gone; last event on the channel.
    Closed,
}

/// A typed entry in the outbound queue.
///
/// Elements are serialized lazily, on first transmission.
enum WriteItem {
    Bytes(Vec<u8>),
    Element(Element),
}

enum Cmd {
    Write(WriteItem),
    Close,
    ResetStream,
    SetTimeout(u32),
    ClearTimeout,
    SetKarma(Karma),
}

/// Tuning and mode for one connection.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    /// Stream kind used when lazily serializing queued elements.
    pub kind: StreamKind,
    /// Whether inbound bytes run through the XML parser.
    pub xml_mode: bool,
    /// Initial karma record.
    pub karma: Karma,
    /// Namespace declarations the connection's stream header carries;
    /// queued elements serialize against this scope.
    pub declared: Vec<(String, String)>,
    /// Run the first-read sniffs (listeners only).
    pub sniff: bool,
    /// Answer for sniffed HTTP GET requests.
    pub http: Option<HttpAnswer>,
    /// Domains allowed in the Flash policy reply.
    pub policy_domains: Vec<String>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            kind: StreamKind::Server,
            xml_mode: true,
            karma: Karma::default(),
            declared: Vec::new(),
            sniff: false,
            http: None,
            policy_domains: Vec::new(),
        }
    }
}

/// Cloneable handle for talking to a connection's driver task.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    id: u64,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Cmd>,
}

impl ConnHandle {
    /// The connection id, unique within this process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer's socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The peer's IP as a string, the key for rate limiting and logs.
    pub fn peer_ip(&self) -> String {
        self.peer.ip().to_string()
    }

    /// Queue an element for transmission (serialized lazily).
    pub fn write(&self, element: Element) -> bool {
        self.tx.send(Cmd::Write(WriteItem::Element(element))).is_ok()
    }

    /// Queue raw bytes for transmission.
    pub fn write_bytes(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.tx
            .send(Cmd::Write(WriteItem::Bytes(bytes.into())))
            .is_ok()
    }

    /// Flush the queue once, then close the socket.
    pub fn close(&self) {
        let _ = self.tx.send(Cmd::Close);
    }

    /// Reinitialize the XML parser before the next read (STARTTLS/SASL).
    pub fn reset_stream(&self) {
        let _ = self.tx.send(Cmd::ResetStream);
    }

    /// Arm the single-shot idle timer.
    pub fn set_timeout(&self, secs: u32) {
        let _ = self.tx.send(Cmd::SetTimeout(secs));
    }

    /// Disarm the idle timer.
    pub fn clear_timeout(&self) {
        let _ = self.tx.send(Cmd::ClearTimeout);
    }

    /// Replace the karma record.
    pub fn set_karma(&self, karma: Karma) {
        let _ = self.tx.send(Cmd::SetKarma(karma));
    }
}

/// Spawn a driver for an already-connected socket.
pub fn spawn(stream: TcpStream, config: ConnConfig) -> (ConnHandle, mpsc::Receiver<ConnEvent>) {
    let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let peer = stream
        .peer_addr()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (ev_tx, ev_rx) = mpsc::channel(256);

    let handle = ConnHandle {
        id,
        peer,
        tx: cmd_tx,
    };

    tokio::spawn(drive(stream, config, cmd_rx, ev_tx, id));

    (handle, ev_rx)
}

/// Originate a connection and spawn its driver.
pub async fn connect(
    addr: SocketAddr,
    config: ConnConfig,
) -> std::io::Result<(ConnHandle, mpsc::Receiver<ConnEvent>)> {
    let stream = TcpStream::connect(addr).await?;
    Ok(spawn(stream, config))
}

/// An accepted connection handed out by a listener.
pub struct Accepted {
    /// Handle to the new connection.
    pub handle: ConnHandle,
    /// The connection's event channel.
    pub events: mpsc::Receiver<ConnEvent>,
    /// Peer address at accept time.
    pub peer: SocketAddr,
}

/// Accept connections, applying the optional per-IP rate limit.
///
/// Each accepted connection is driven immediately; the returned channel
/// yields the handle/event pairs.
pub fn listen(
    listener: TcpListener,
    config: ConnConfig,
    rate: Option<RateConfig>,
) -> mpsc::Receiver<Accepted> {
    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut limit = rate.map(RateLimit::new);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            if let Some(limit) = limit.as_mut() {
                if limit.check(&peer.ip().to_string(), 1) {
                    debug!(peer = %peer, "connection rate limit exceeded, refusing");
                    drop(stream);
                    continue;
                }
                limit.sweep();
            }

            let (handle, events) = spawn(stream, config.clone());
            if tx
                .send(Accepted {
                    handle,
                    events,
                    peer,
                })
                .await
                .is_err()
            {
                break;
            }
        }
    });

    rx
}

async fn drive(
    stream: TcpStream,
    config: ConnConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Cmd>,
    ev_tx: mpsc::Sender<ConnEvent>,
    id: u64,
) {
    let (mut rd, mut wr) = stream.into_split();

    let mut xml = XmlStream::new();
    let mut queue: VecDeque<WriteItem> = VecDeque::new();
    let mut front: Option<(Vec<u8>, usize)> = None;
    let mut karma = config.karma;
    let mut read_buf = vec![0u8; READ_BUF_SIZE];

    // interval_at so the first tick lands one period out, not immediately
    let karma_period = Duration::from_secs(KARMA_HEARTBEAT);
    let mut karma_tick =
        tokio::time::interval_at(tokio::time::Instant::now() + karma_period, karma_period);
    karma_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let second = Duration::from_secs(1);
    let mut sec_tick = tokio::time::interval_at(tokio::time::Instant::now() + second, second);
    sec_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut timeout_remaining: Option<u32> = None;
    let mut first_read = config.sniff;
    let mut nul_mode = false;
    let mut reset_pending = false;
    let mut closing = false;
    let mut flush_grace = FLUSH_GRACE;

    if ev_tx.send(ConnEvent::New).await.is_err() {
        return;
    }

    loop {
        if closing && front.is_none() && queue.is_empty() {
            break;
        }

        let budget = karma.read_budget().min(READ_BUF_SIZE);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(Cmd::Write(item)) => queue.push_back(item),
                Some(Cmd::Close) | None => closing = true,
                Some(Cmd::ResetStream) => reset_pending = true,
                Some(Cmd::SetTimeout(secs)) => timeout_remaining = Some(secs),
                Some(Cmd::ClearTimeout) => timeout_remaining = None,
                Some(Cmd::SetKarma(k)) => karma = k,
            },

            result = write_front(&mut wr, &mut front, &mut queue, &config),
                if front.is_some() || !queue.is_empty() =>
            {
                if let Err(e) = result {
                    debug!(conn = id, error = %e, "write failed");
                    let _ = ev_tx.send(ConnEvent::Error(e.to_string())).await;
                    queue.clear();
                    front = None;
                    closing = true;
                }
            }

            result = rd.read(&mut read_buf[..budget]), if budget > 0 && !closing => {
                match result {
                    Ok(0) => closing = true,
                    Ok(n) => {
                        let keep_going = handle_input(
                            &read_buf[..n],
                            &config,
                            &ev_tx,
                            &mut xml,
                            &mut karma,
                            &mut queue,
                            &mut first_read,
                            &mut nul_mode,
                            &mut reset_pending,
                            &mut closing,
                        )
                        .await;
                        if !keep_going {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(conn = id, error = %e, "read failed");
                        let _ = ev_tx.send(ConnEvent::Error(e.to_string())).await;
                        closing = true;
                    }
                }
            }

            _ = karma_tick.tick() => {
                if karma.increment() {
                    debug!(conn = id, karma = karma.val, "karma recovered, reads resume");
                }
            }

            _ = sec_tick.tick() => {
                if closing {
                    flush_grace = flush_grace.saturating_sub(1);
                    if flush_grace == 0 {
                        break;
                    }
                }
                if let Some(remaining) = timeout_remaining.as_mut() {
                    if *remaining <= 1 {
                        timeout_remaining = None;
                        if ev_tx.send(ConnEvent::Timeout).await.is_err() {
                            break;
                        }
                    } else {
                        *remaining -= 1;
                    }
                }
            }
        }
    }

    let _ = wr.shutdown().await;
    let _ = ev_tx.send(ConnEvent::Closed).await;
    debug!(conn = id, "connection closed");
}

/// Serialize (if needed) and write the front of the queue; a partial write
/// keeps the cursor for the next round.
async fn write_front(
    wr: &mut OwnedWriteHalf,
    front: &mut Option<(Vec<u8>, usize)>,
    queue: &mut VecDeque<WriteItem>,
    config: &ConnConfig,
) -> std::io::Result<()> {
    if front.is_none() {
        let Some(item) = queue.pop_front() else {
            return Ok(());
        };
        let bytes = match item {
            WriteItem::Bytes(b) => b,
            WriteItem::Element(el) => {
                let mut scope = NsDeclList::new();
                for (prefix, iri) in &config.declared {
                    scope.declare(prefix, iri);
                }
                let mut out = String::new();
                el.serialize(&mut out, &mut scope, config.kind);
                out.into_bytes()
            }
        };
        *front = Some((bytes, 0));
    }

    let (buf, cursor) = front.as_mut().expect("front was just filled");
    let n = wr.write(&buf[*cursor..]).await?;
    *cursor += n;
    if *cursor >= buf.len() {
        *front = None;
    }
    Ok(())
}

/// Process one chunk of inbound bytes. Returns `false` when the event
/// channel is gone and the driver should stop.
#[allow(clippy::too_many_arguments)]
async fn handle_input(
    data: &[u8],
    config: &ConnConfig,
    ev_tx: &mpsc::Sender<ConnEvent>,
    xml: &mut XmlStream,
    karma: &mut Karma,
    queue: &mut VecDeque<WriteItem>,
    first_read: &mut bool,
    nul_mode: &mut bool,
    reset_pending: &mut bool,
    closing: &mut bool,
) -> bool {
    let mut data = data.to_vec();

    if *first_read {
        *first_read = false;
        match legacy::sniff(&data) {
            Sniff::PolicyRequest => {
                queue.push_back(WriteItem::Bytes(
                    legacy::policy_reply(&config.policy_domains).into_bytes(),
                ));
                *closing = true;
                return true;
            }
            Sniff::HttpGet => {
                queue.push_back(WriteItem::Bytes(
                    legacy::http_response(&data, config.http.as_ref()).into_bytes(),
                ));
                *closing = true;
                return true;
            }
            Sniff::NulTerminated => *nul_mode = true,
            Sniff::Xml => {}
        }
    }

    if *nul_mode {
        legacy::strip_nuls(&mut data);
    }

    if karma.check(data.len() as i64) {
        debug!(karma = karma.val, "connection out of karma, reads paused");
    }

    if !config.xml_mode {
        return ev_tx.send(ConnEvent::Buffer(data)).await.is_ok();
    }

    if *reset_pending {
        xml.reset();
        *reset_pending = false;
    }

    match xml.feed(&data) {
        Ok(events) => {
            for event in events {
                let conn_event = match event {
                    StreamEvent::RootOpen(root) => ConnEvent::XmlRoot(root),
                    StreamEvent::Stanza(el) => ConnEvent::XmlNode(el),
                    StreamEvent::Close => ConnEvent::XmlClose,
                };
                if ev_tx.send(conn_event).await.is_err() {
                    return false;
                }
            }
        }
        Err(e) => {
            let ok = ev_tx.send(ConnEvent::XmlError(e)).await.is_ok();
            *closing = true;
            return ok;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use rookery_xml::ns;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn expect_event(rx: &mut mpsc::Receiver<ConnEvent>) -> ConnEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    const ROOT: &str = "<stream:stream xmlns='jabber:server' \
        xmlns:stream='http://etherx.jabber.org/streams' to='b.example'>";

    #[tokio::test]
    async fn inbound_bytes_become_xml_events() {
        let (mut client, server) = pair().await;
        let (_handle, mut events) = spawn(server, ConnConfig::default());

        assert_eq!(expect_event(&mut events).await, ConnEvent::New);

        client.write_all(ROOT.as_bytes()).await.unwrap();
        let ConnEvent::XmlRoot(root) = expect_event(&mut events).await else {
            panic!("expected root");
        };
        assert_eq!(root.attr("to"), Some("b.example"));

        client.write_all(b"<presence/>").await.unwrap();
        let ConnEvent::XmlNode(stanza) = expect_event(&mut events).await else {
            panic!("expected stanza");
        };
        assert_eq!(stanza.name(), "presence");

        client.write_all(b"</stream:stream>").await.unwrap();
        assert_eq!(expect_event(&mut events).await, ConnEvent::XmlClose);
    }

    #[tokio::test]
    async fn queued_elements_are_serialized_on_the_wire() {
        let (mut client, server) = pair().await;
        let mut config = ConnConfig::default();
        config.declared.push((String::new(), ns::SERVER.to_string()));
        let (handle, mut events) = spawn(server, config);
        assert_eq!(expect_event(&mut events).await, ConnEvent::New);

        let el = Element::builder("message", ns::SERVER)
            .attr("to", "x@b.example")
            .build();
        assert!(handle.write(el));

        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            "<message to='x@b.example'/>"
        );
    }

    #[tokio::test]
    async fn close_flushes_the_queue_first() {
        let (mut client, server) = pair().await;
        let (handle, mut events) = spawn(server, ConnConfig::default());
        assert_eq!(expect_event(&mut events).await, ConnEvent::New);

        handle.write_bytes(b"</stream:stream>".to_vec());
        handle.close();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"</stream:stream>");

        loop {
            if expect_event(&mut events).await == ConnEvent::Closed {
                break;
            }
        }
    }

    #[tokio::test]
    async fn malformed_xml_reports_and_closes() {
        let (mut client, server) = pair().await;
        let (_handle, mut events) = spawn(server, ConnConfig::default());
        assert_eq!(expect_event(&mut events).await, ConnEvent::New);

        client.write_all(ROOT.as_bytes()).await.unwrap();
        expect_event(&mut events).await; // root

        client.write_all(b"<a></b>").await.unwrap();
        assert!(matches!(
            expect_event(&mut events).await,
            ConnEvent::XmlError(_)
        ));
        loop {
            if expect_event(&mut events).await == ConnEvent::Closed {
                break;
            }
        }
    }

    #[tokio::test]
    async fn timer_fires_once() {
        let (_client, server) = pair().await;
        let (handle, mut events) = spawn(server, ConnConfig::default());
        assert_eq!(expect_event(&mut events).await, ConnEvent::New);

        handle.set_timeout(1);
        assert_eq!(expect_event(&mut events).await, ConnEvent::Timeout);
    }

    #[tokio::test]
    async fn policy_request_gets_the_policy_file() {
        let (mut client, server) = pair().await;
        let config = ConnConfig {
            sniff: true,
            ..ConnConfig::default()
        };
        let (_handle, mut events) = spawn(server, config);
        assert_eq!(expect_event(&mut events).await, ConnEvent::New);

        client
            .write_all(b"<policy-file-request/>\0")
            .await
            .unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("cross-domain-policy"));
    }

    #[tokio::test]
    async fn nul_framing_is_stripped() {
        let (mut client, server) = pair().await;
        let config = ConnConfig {
            sniff: true,
            ..ConnConfig::default()
        };
        let (_handle, mut events) = spawn(server, config);
        assert_eq!(expect_event(&mut events).await, ConnEvent::New);

        client
            .write_all(format!("{}\0<presence/>\0", ROOT).as_bytes())
            .await
            .unwrap();
        let ConnEvent::XmlRoot(_) = expect_event(&mut events).await else {
            panic!("expected root");
        };
        let ConnEvent::XmlNode(stanza) = expect_event(&mut events).await else {
            panic!("expected stanza");
        };
        assert_eq!(stanza.name(), "presence");
    }
}
