//! Incremental XML stream parsing.
//!
//! An XMPP stream is one long-lived document: a `stream:stream` root whose
//! second-level children are the stanzas. [`XmlStream`] accepts arbitrary
//! byte chunks and produces three events: the parsed root element (with its
//! namespace declarations materialized as attributes for downstream
//! visibility), complete stanzas, and the stream close.
//!
//! Two declaration scopes are tracked: the root element's declarations live
//! for the whole stream, each stanza's own declarations are reset between
//! stanzas. Undeclared prefixes on inbound stanzas are tolerated: `stream`
//! and `db` resolve to their canonical IRIs, anything else is assigned the
//! clue namespace so lenient peers interoperate.

use bytes::{Buf, BytesMut};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::element::{Attribute, Element};
use crate::error::XmlError;
use crate::ns;

/// Largest accepted size of a single stanza, in bytes.
pub const MAX_NODE_SIZE: usize = 1_000_000;

/// Deepest accepted element nesting within a stream.
pub const MAX_DEPTH: usize = 100;

/// An event produced by the stream parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The stream root element opened.
    RootOpen(Element),
    /// A complete second-level stanza.
    Stanza(Element),
    /// The stream root closed.
    Close,
}

/// What the extraction scan found at the front of the buffer.
enum Scan {
    /// Nothing complete yet; wait for more bytes.
    Incomplete,
    /// Skippable content (whitespace, comments, processing instructions).
    Skip(usize),
    /// The stream root's open tag, ending at the offset.
    Root(usize),
    /// A complete stanza in `start..end`, consumed through `end`.
    Stanza(usize, usize),
    /// The stream close tag, consumed through the offset.
    Close(usize),
}

/// Incremental parser for one XML stream.
pub struct XmlStream {
    buf: BytesMut,
    /// Declarations from the stream root, live until reset.
    root_scope: Vec<(String, String)>,
    seen_root: bool,
    closed: bool,
    max_node: usize,
    max_depth: usize,
}

impl Default for XmlStream {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlStream {
    /// A parser with the default node and depth budgets.
    pub fn new() -> Self {
        Self::with_limits(MAX_NODE_SIZE, MAX_DEPTH)
    }

    /// A parser with explicit budgets (tests use small ones).
    pub fn with_limits(max_node: usize, max_depth: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            root_scope: Vec::new(),
            seen_root: false,
            closed: false,
            max_node,
            max_depth,
        }
    }

    /// Forget all stream state, keeping the configured budgets.
    ///
    /// Used after STARTTLS and SASL success, when the peer restarts the
    /// stream on the same connection.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.root_scope.clear();
        self.seen_root = false;
        self.closed = false;
    }

    /// Whether the root element has been seen.
    pub fn root_seen(&self) -> bool {
        self.seen_root
    }

    /// Feed bytes, returning every event completed by them.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<StreamEvent>, XmlError> {
        self.buf.extend_from_slice(data);
        let mut events = Vec::new();

        loop {
            if self.closed {
                // Trailing bytes after the close are dropped.
                self.buf.clear();
                break;
            }

            match self.scan()? {
                Scan::Incomplete => {
                    if self.buf.len() > self.max_node {
                        return Err(XmlError::NodeTooLarge { max: self.max_node });
                    }
                    break;
                }
                Scan::Skip(end) => {
                    self.buf.advance(end);
                }
                Scan::Root(end) => {
                    let root = self.parse_root(end)?;
                    self.buf.advance(end);
                    self.seen_root = true;
                    events.push(StreamEvent::RootOpen(root));
                }
                Scan::Stanza(start, end) => {
                    if end - start > self.max_node {
                        return Err(XmlError::NodeTooLarge { max: self.max_node });
                    }
                    let stanza = parse_fragment(
                        &self.buf[start..end],
                        &self.root_scope,
                        self.max_depth,
                    )?;
                    self.buf.advance(end);
                    events.push(StreamEvent::Stanza(stanza));
                }
                Scan::Close(end) => {
                    self.buf.advance(end);
                    self.closed = true;
                    events.push(StreamEvent::Close);
                }
            }
        }

        Ok(events)
    }

    /// Find the next complete unit at the front of the buffer.
    fn scan(&self) -> Result<Scan, XmlError> {
        let mut reader = Reader::from_reader(&self.buf[..]);
        // The stream root's close tag has no matching open tag in this
        // buffer; name checking happens later, per fragment.
        reader.config_mut().check_end_names = false;
        let mut depth: usize = 0;
        let mut stanza_start: Option<usize> = None;

        loop {
            let pos = reader.buffer_position() as usize;
            match reader.read_event() {
                Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_))
                | Ok(Event::DocType(_)) => {
                    if stanza_start.is_none() {
                        return Ok(Scan::Skip(reader.buffer_position() as usize));
                    }
                }
                Ok(Event::Text(_)) | Ok(Event::CData(_)) => {
                    if stanza_start.is_none() {
                        // Inter-stanza character data (keepalives) is dropped,
                        // but only when complete: trailing text may continue.
                        let end = reader.buffer_position() as usize;
                        if end < self.buf.len() {
                            return Ok(Scan::Skip(end));
                        }
                        return Ok(Scan::Incomplete);
                    }
                }
                Ok(Event::Start(_)) => {
                    if !self.seen_root {
                        return Ok(Scan::Root(reader.buffer_position() as usize));
                    }
                    depth += 1;
                    if depth > self.max_depth {
                        return Err(XmlError::TooDeep {
                            max: self.max_depth,
                        });
                    }
                    if stanza_start.is_none() {
                        stanza_start = Some(pos);
                    }
                }
                Ok(Event::Empty(_)) => {
                    if !self.seen_root {
                        // A self-closing root: a degenerate but complete
                        // stream. Deliver the open; the peer said nothing.
                        return Ok(Scan::Root(reader.buffer_position() as usize));
                    }
                    if stanza_start.is_none() {
                        return Ok(Scan::Stanza(pos, reader.buffer_position() as usize));
                    }
                }
                Ok(Event::End(_)) => {
                    if depth == 0 {
                        // Closing tag at the top level: the stream root.
                        return Ok(Scan::Close(reader.buffer_position() as usize));
                    }
                    depth -= 1;
                    if depth == 0 {
                        let start = stanza_start.take().unwrap_or(pos);
                        return Ok(Scan::Stanza(start, reader.buffer_position() as usize));
                    }
                }
                Ok(Event::Eof) => return Ok(Scan::Incomplete),
                Err(quick_xml::Error::Syntax(_)) => {
                    // The buffer ends inside a tag; more bytes will finish it.
                    return Ok(Scan::Incomplete);
                }
                Err(quick_xml::Error::IllFormed(e)) => {
                    return Err(XmlError::malformed(e.to_string()));
                }
                Err(e) => return Err(XmlError::malformed(e.to_string())),
            }
        }
    }

    /// Parse the root open tag in `buf[..end]` and record its declarations.
    fn parse_root(&mut self, end: usize) -> Result<Element, XmlError> {
        let mut reader = Reader::from_reader(&self.buf[..end]);
        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) | Ok(Event::Empty(start)) => {
                    let decls = collect_decls(&start)?;
                    self.root_scope = decls.clone();

                    let qname = utf8(start.name().as_ref())?.to_string();
                    let (prefix, local) = split_qname(&qname);
                    let iri = resolve_prefix(prefix, &[&decls]);
                    let mut root = Element::new(local, iri);

                    // Materialize the declarations as attributes so the
                    // stream owner can inspect what the peer declared.
                    for (p, iri) in &decls {
                        let name = if p.is_empty() {
                            "xmlns".to_string()
                        } else {
                            format!("xmlns:{}", p)
                        };
                        root.push_attr(Attribute {
                            name,
                            ns: None,
                            value: iri.clone(),
                        });
                    }

                    read_attributes(&start, &[&decls], &mut root)?;
                    return Ok(root);
                }
                Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_))
                | Ok(Event::DocType(_)) | Ok(Event::Text(_)) => continue,
                Ok(other) => {
                    return Err(XmlError::malformed(format!(
                        "unexpected {:?} before stream root",
                        other
                    )))
                }
                Err(e) => return Err(XmlError::malformed(e.to_string())),
            }
        }
    }
}

/// Parse a complete standalone XML document into an element.
///
/// Used for configuration files and storage fragments; stream limits
/// apply to depth only.
pub fn parse_document(input: &str) -> Result<Element, XmlError> {
    parse_fragment(input.as_bytes(), &[], MAX_DEPTH)
}

/// Parse one complete stanza fragment against the root's declarations.
fn parse_fragment(
    slice: &[u8],
    root_scope: &[(String, String)],
    max_depth: usize,
) -> Result<Element, XmlError> {
    let mut reader = Reader::from_reader(slice);
    // Stack of open elements plus the declaration frame sizes they pushed.
    let mut stack: Vec<Element> = Vec::new();
    let mut decls: Vec<(String, String)> = Vec::new();
    let mut frames: Vec<usize> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                if stack.len() >= max_depth {
                    return Err(XmlError::TooDeep { max: max_depth });
                }
                let new_decls = collect_decls(&start)?;
                frames.push(new_decls.len());
                decls.extend(new_decls);
                let el = open_element(&start, &decls, root_scope)?;
                stack.push(el);
            }
            Ok(Event::Empty(start)) => {
                let new_decls = collect_decls(&start)?;
                let count = new_decls.len();
                decls.extend(new_decls);
                let el = open_element(&start, &decls, root_scope)?;
                decls.truncate(decls.len() - count);
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(el);
                    }
                    None => return Ok(el),
                }
            }
            Ok(Event::Text(text)) => {
                if let Some(parent) = stack.last_mut() {
                    let raw = utf8(text.as_ref())?;
                    let unescaped = quick_xml::escape::unescape(raw)
                        .map_err(|e| XmlError::malformed(e.to_string()))?;
                    parent.append_text(unescaped.into_owned());
                }
            }
            Ok(Event::CData(data)) => {
                if let Some(parent) = stack.last_mut() {
                    parent.append_text(utf8(data.as_ref())?.to_string());
                }
            }
            Ok(Event::End(_)) => {
                let mut done = match stack.pop() {
                    Some(el) => el,
                    None => return Err(XmlError::malformed("unbalanced end tag")),
                };
                done.merge_text();
                if let Some(frame) = frames.pop() {
                    decls.truncate(decls.len() - frame);
                }
                match stack.last_mut() {
                    Some(parent) => {
                        parent.append_child(done);
                    }
                    None => return Ok(done),
                }
            }
            Ok(Event::Decl(_)) | Ok(Event::Comment(_)) | Ok(Event::PI(_))
            | Ok(Event::DocType(_)) => {}
            Ok(Event::Eof) => {
                return Err(XmlError::malformed("truncated stanza fragment"))
            }
            Err(e) => return Err(XmlError::malformed(e.to_string())),
        }
    }
}

/// Pull the namespace declarations off a start tag.
fn collect_decls(start: &BytesStart<'_>) -> Result<Vec<(String, String)>, XmlError> {
    let mut decls = Vec::new();
    for attr in start.attributes().with_checks(false).flatten() {
        let key = utf8(attr.key.as_ref())?;
        let value = unescape_value(&attr.value)?;
        if key == "xmlns" {
            decls.push((String::new(), value));
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            decls.push((prefix.to_string(), value));
        }
    }
    Ok(decls)
}

/// Build an element from a start tag, resolving its prefix.
fn open_element(
    start: &BytesStart<'_>,
    decls: &[(String, String)],
    root_scope: &[(String, String)],
) -> Result<Element, XmlError> {
    let qname = utf8(start.name().as_ref())?.to_string();
    let (prefix, local) = split_qname(&qname);
    let iri = resolve_prefix(prefix, &[decls, root_scope]);
    let mut el = Element::new(local, iri);
    read_attributes(start, &[decls, root_scope], &mut el)?;
    Ok(el)
}

/// Copy the ordinary (non-declaration) attributes onto an element.
fn read_attributes(
    start: &BytesStart<'_>,
    scopes: &[&[(String, String)]],
    el: &mut Element,
) -> Result<(), XmlError> {
    for attr in start.attributes().with_checks(false).flatten() {
        let key = utf8(attr.key.as_ref())?;
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = unescape_value(&attr.value)?;
        match key.split_once(':') {
            None => el.push_attr(Attribute {
                name: key.to_string(),
                ns: None,
                value,
            }),
            Some(("xml", local)) => el.push_attr(Attribute {
                name: local.to_string(),
                ns: Some(ns::XML.to_string()),
                value,
            }),
            Some((prefix, local)) => {
                let iri = lookup(prefix, scopes)
                    .unwrap_or_else(|| known_prefix_iri(prefix))
                    .to_string();
                el.push_attr(Attribute {
                    name: local.to_string(),
                    ns: Some(iri),
                    value,
                });
            }
        }
    }
    Ok(())
}

fn split_qname(qname: &str) -> (Option<&str>, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, qname),
    }
}

fn lookup<'a>(prefix: &str, scopes: &[&'a [(String, String)]]) -> Option<&'a str> {
    for scope in scopes {
        if let Some((_, iri)) = scope.iter().rev().find(|(p, _)| p == prefix) {
            return Some(iri.as_str());
        }
    }
    None
}

/// IRI for a well-known prefix a lenient peer left undeclared.
fn known_prefix_iri(prefix: &str) -> &'static str {
    match prefix {
        "stream" => ns::STREAM,
        "db" => ns::DIALBACK,
        _ => ns::CLUE,
    }
}

/// Resolve an element prefix through the scopes, leniently.
fn resolve_prefix(prefix: Option<&str>, scopes: &[&[(String, String)]]) -> String {
    match prefix {
        None => lookup("", scopes).unwrap_or(ns::SERVER).to_string(),
        Some(p) => lookup(p, scopes)
            .unwrap_or_else(|| known_prefix_iri(p))
            .to_string(),
    }
}

fn utf8(bytes: &[u8]) -> Result<&str, XmlError> {
    std::str::from_utf8(bytes).map_err(|_| XmlError::InvalidUtf8)
}

fn unescape_value(raw: &[u8]) -> Result<String, XmlError> {
    let s = utf8(raw)?;
    quick_xml::escape::unescape(s)
        .map(|cow| cow.into_owned())
        .map_err(|e| XmlError::malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &[u8] = b"<?xml version='1.0'?><stream:stream \
        xmlns='jabber:server' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        xmlns:db='jabber:server:dialback' \
        to='b.example' from='a.example' version='1.0'>";

    fn opened() -> (XmlStream, Element) {
        let mut stream = XmlStream::new();
        let mut events = stream.feed(ROOT).unwrap();
        assert_eq!(events.len(), 1);
        match events.remove(0) {
            StreamEvent::RootOpen(root) => (stream, root),
            other => panic!("expected root open, got {:?}", other),
        }
    }

    #[test]
    fn root_open_reports_declarations() {
        let (_, root) = opened();
        assert_eq!(root.name(), "stream");
        assert_eq!(root.ns(), crate::ns::STREAM);
        assert_eq!(root.attr("to"), Some("b.example"));
        assert_eq!(root.attr("version"), Some("1.0"));
        assert_eq!(root.attr("xmlns"), Some("jabber:server"));
        assert_eq!(root.attr("xmlns:db"), Some("jabber:server:dialback"));
    }

    #[test]
    fn stanzas_resolve_against_the_root_scope() {
        let (mut stream, _) = opened();
        let events = stream
            .feed(b"<message to='x@b.example'><body>hi</body></message>")
            .unwrap();
        assert_eq!(events.len(), 1);
        let StreamEvent::Stanza(msg) = &events[0] else {
            panic!("expected stanza");
        };
        assert_eq!(msg.ns(), crate::ns::SERVER);
        assert_eq!(
            msg.get_child("body", crate::ns::SERVER).unwrap().text(),
            "hi"
        );
    }

    #[test]
    fn partial_stanzas_wait_for_more_bytes() {
        let (mut stream, _) = opened();
        assert!(stream.feed(b"<message><body>He").unwrap().is_empty());
        assert!(stream.feed(b"llo</body").unwrap().is_empty());
        let events = stream.feed(b"></message>").unwrap();
        assert_eq!(events.len(), 1);
        let StreamEvent::Stanza(msg) = &events[0] else {
            panic!("expected stanza");
        };
        assert_eq!(msg.get_child("body", "jabber:server").unwrap().text(), "Hello");
    }

    #[test]
    fn several_stanzas_in_one_chunk() {
        let (mut stream, _) = opened();
        let events = stream
            .feed(b"<presence/><message><body>a</body></message>")
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn whitespace_keepalives_are_dropped() {
        let (mut stream, _) = opened();
        assert!(stream.feed(b" \n ").unwrap().is_empty());
        let events = stream.feed(b" <presence/>").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn stream_close_is_reported() {
        let (mut stream, _) = opened();
        let events = stream.feed(b"</stream:stream>").unwrap();
        assert_eq!(events, vec![StreamEvent::Close]);
    }

    #[test]
    fn dialback_stanzas_keep_their_namespace() {
        let (mut stream, _) = opened();
        let events = stream
            .feed(b"<db:result to='b.example' from='a.example'>abc</db:result>")
            .unwrap();
        let StreamEvent::Stanza(db) = &events[0] else {
            panic!("expected stanza");
        };
        assert_eq!(db.ns(), crate::ns::DIALBACK);
        assert_eq!(db.text(), "abc");
    }

    #[test]
    fn undeclared_prefix_gets_the_clue_namespace() {
        let (mut stream, _) = opened();
        let events = stream.feed(b"<weird:thing>x</weird:thing>").unwrap();
        let StreamEvent::Stanza(el) = &events[0] else {
            panic!("expected stanza");
        };
        assert_eq!(el.ns(), crate::ns::CLUE);
    }

    #[test]
    fn stanza_local_declarations_do_not_leak() {
        let (mut stream, _) = opened();
        let events = stream
            .feed(b"<iq><query xmlns='jabber:iq:roster'/></iq><iq><query/></iq>")
            .unwrap();
        assert_eq!(events.len(), 2);
        let StreamEvent::Stanza(first) = &events[0] else { panic!() };
        let StreamEvent::Stanza(second) = &events[1] else { panic!() };
        assert!(first.get_child("query", "jabber:iq:roster").is_some());
        // the second <query/> has no declaration, so it rides the default
        assert!(second.get_child("query", "jabber:server").is_some());
    }

    #[test]
    fn oversized_stanza_is_rejected() {
        let mut stream = XmlStream::with_limits(64, MAX_DEPTH);
        stream.feed(ROOT).unwrap();
        let big = format!("<message><body>{}</body></message>", "x".repeat(100));
        let err = stream.feed(big.as_bytes()).unwrap_err();
        assert!(matches!(err, XmlError::NodeTooLarge { .. }));
    }

    #[test]
    fn overdeep_nesting_is_rejected() {
        let mut stream = XmlStream::with_limits(MAX_NODE_SIZE, 4);
        stream.feed(ROOT).unwrap();
        let err = stream
            .feed(b"<a><b><c><d><e>x</e></d></c></b></a>")
            .unwrap_err();
        assert!(matches!(err, XmlError::TooDeep { .. }));
    }

    #[test]
    fn depth_at_the_limit_completes() {
        let mut stream = XmlStream::with_limits(MAX_NODE_SIZE, 4);
        stream.feed(ROOT).unwrap();
        let events = stream.feed(b"<a><b><c><d/></c></b></a>").unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn malformed_input_is_an_error() {
        let (mut stream, _) = opened();
        let err = stream.feed(b"<message></presence>").unwrap_err();
        assert!(matches!(err, XmlError::Malformed(_)));
        assert_eq!(err.stream_condition(), "xml-not-well-formed");
    }

    #[test]
    fn reset_restarts_the_stream() {
        let (mut stream, _) = opened();
        stream.feed(b"<presence/>").unwrap();
        stream.reset();
        assert!(!stream.root_seen());
        let events = stream.feed(ROOT).unwrap();
        assert!(matches!(events[0], StreamEvent::RootOpen(_)));
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let stanza = Element::builder("message", crate::ns::SERVER)
            .attr("to", "juliet@capulet.example")
            .attr("type", "chat")
            .append(
                Element::builder("body", crate::ns::SERVER)
                    .text("Hello <world> & 'friends'")
                    .build(),
            )
            .build();

        let wire = stanza.to_wire(crate::StreamKind::Client);
        let (mut stream, _) = opened();
        let events = stream.feed(wire.as_bytes()).unwrap();
        let StreamEvent::Stanza(parsed) = &events[0] else {
            panic!("expected stanza");
        };
        assert!(parsed.semantic_eq(&stanza));
    }
}
