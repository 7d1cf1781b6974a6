//! The element tree and its serializer.
//!
//! An [`Element`] owns its attributes and child nodes in document order.
//! Namespace IRIs are stored canonicalized (server-class namespaces become
//! `jabber:server`); the wire namespace is chosen at serialization time from
//! the [`StreamKind`] the caller passes, together with a running
//! [`NsDeclList`] of namespace declarations already in scope on the stream.

use std::fmt::{self, Write as _};

use crate::{canonical_ns, ns};

/// A single attribute: local name, optional namespace IRI, value.
///
/// Unprefixed attributes carry no namespace. `xml:lang` and friends are
/// stored with the XML namespace and the bare local name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Local attribute name.
    pub name: String,
    /// Namespace IRI, `None` for unprefixed attributes.
    pub ns: Option<String>,
    /// Attribute value.
    pub value: String,
}

/// A child node: element or character data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// A child element.
    Element(Element),
    /// A run of character data.
    Text(String),
}

impl Node {
    /// The element inside this node, if it is one.
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        }
    }

    /// The text inside this node, if it is character data.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Node::Element(_) => None,
            Node::Text(t) => Some(t),
        }
    }
}

/// Which stream this tree is being written to.
///
/// The canonical `jabber:server` namespace is rewritten to the wire
/// namespace of the stream kind; everything else serializes as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// A server-to-server stream (`jabber:server`).
    Server,
    /// A client stream (`jabber:client`).
    Client,
    /// A legacy component stream (`jabber:component:accept`).
    Component,
}

impl StreamKind {
    /// Rewrite a canonical IRI to its on-the-wire form for this stream.
    pub fn wire_ns<'a>(&self, iri: &'a str) -> &'a str {
        if iri == ns::SERVER {
            match self {
                StreamKind::Server => ns::SERVER,
                StreamKind::Client => ns::CLIENT,
                StreamKind::Component => ns::COMPONENT_ACCEPT,
            }
        } else {
            iri
        }
    }
}

/// A stack of namespace declarations currently in scope.
///
/// Later declarations shadow earlier ones for the same prefix. The `xml`
/// prefix is pre-bound. Callers serializing several stanzas on one stream
/// keep the stream root's declarations in this list between stanzas.
#[derive(Debug, Clone)]
pub struct NsDeclList(Vec<(String, String)>);

impl Default for NsDeclList {
    fn default() -> Self {
        Self::new()
    }
}

impl NsDeclList {
    /// A fresh list with only the implicit `xml` binding.
    pub fn new() -> Self {
        Self(vec![("xml".to_string(), ns::XML.to_string())])
    }

    /// Declare `prefix` → `iri`, shadowing earlier bindings of the prefix.
    pub fn declare(&mut self, prefix: &str, iri: &str) {
        self.0.push((prefix.to_string(), iri.to_string()));
    }

    /// The IRI the prefix is currently bound to.
    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, iri)| iri.as_str())
    }

    /// Whether `prefix` is currently bound to exactly `iri`.
    pub fn is_bound(&self, prefix: &str, iri: &str) -> bool {
        self.resolve(prefix) == Some(iri)
    }

    /// A prefix currently bound to `iri`, innermost binding wins.
    pub fn prefix_for(&self, iri: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(p, bound)| bound == iri && self.resolve(p) == Some(iri))
            .map(|(p, _)| p.as_str())
    }

    /// Remember the current scope depth.
    pub fn mark(&self) -> usize {
        self.0.len()
    }

    /// Drop declarations made since `mark`.
    pub fn rewind(&mut self, mark: usize) {
        self.0.truncate(mark);
    }
}

/// A namespace-aware XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    ns: String,
    attrs: Vec<Attribute>,
    nodes: Vec<Node>,
}

impl Element {
    /// Create an empty element. The namespace is canonicalized.
    pub fn new(name: impl Into<String>, ns_iri: impl AsRef<str>) -> Self {
        Self {
            name: name.into(),
            ns: canonical_ns(ns_iri.as_ref()).to_string(),
            attrs: Vec::new(),
            nodes: Vec::new(),
        }
    }

    /// Start building an element.
    pub fn builder(name: impl Into<String>, ns_iri: impl AsRef<str>) -> ElementBuilder {
        ElementBuilder {
            element: Element::new(name, ns_iri),
        }
    }

    /// Local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical namespace IRI.
    pub fn ns(&self) -> &str {
        &self.ns
    }

    /// The attributes in document order.
    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    /// Value of an unprefixed attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        if let Some(rest) = name.strip_prefix("xml:") {
            return self.attr_ns(rest, ns::XML);
        }
        self.attrs
            .iter()
            .find(|a| a.ns.is_none() && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Value of a namespaced attribute.
    pub fn attr_ns(&self, name: &str, ns_iri: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.ns.as_deref() == Some(ns_iri) && a.name == name)
            .map(|a| a.value.as_str())
    }

    /// The element's own `xml:lang`, if declared.
    pub fn lang(&self) -> Option<&str> {
        self.attr_ns("lang", ns::XML)
    }

    /// Set (or replace) an unprefixed attribute.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(rest) = name.strip_prefix("xml:") {
            let rest = rest.to_string();
            return self.set_attr_ns(rest, ns::XML, value);
        }
        let value = value.into();
        match self
            .attrs
            .iter_mut()
            .find(|a| a.ns.is_none() && a.name == name)
        {
            Some(attr) => attr.value = value,
            None => self.attrs.push(Attribute {
                name,
                ns: None,
                value,
            }),
        }
    }

    /// Set (or replace) a namespaced attribute.
    pub fn set_attr_ns(
        &mut self,
        name: impl Into<String>,
        ns_iri: &str,
        value: impl Into<String>,
    ) {
        let name = name.into();
        let value = value.into();
        match self
            .attrs
            .iter_mut()
            .find(|a| a.ns.as_deref() == Some(ns_iri) && a.name == name)
        {
            Some(attr) => attr.value = value,
            None => self.attrs.push(Attribute {
                name,
                ns: Some(ns_iri.to_string()),
                value,
            }),
        }
    }

    /// Remove an unprefixed attribute, returning its old value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let idx = self
            .attrs
            .iter()
            .position(|a| a.ns.is_none() && a.name == name)?;
        Some(self.attrs.remove(idx).value)
    }

    /// Push a raw attribute (used by the parser).
    pub fn push_attr(&mut self, attr: Attribute) {
        self.attrs.push(attr);
    }

    /// All child nodes in document order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Append a child element, returning a reference to the inserted copy.
    pub fn append_child(&mut self, child: Element) -> &mut Element {
        self.nodes.push(Node::Element(child));
        match self.nodes.last_mut() {
            Some(Node::Element(el)) => el,
            _ => unreachable!(),
        }
    }

    /// Append character data.
    pub fn append_text(&mut self, text: impl Into<String>) {
        self.nodes.push(Node::Text(text.into()));
    }

    /// Append an arbitrary node.
    pub fn append_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    /// Child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.nodes.iter().filter_map(Node::as_element)
    }

    /// Mutable child elements in document order.
    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.nodes.iter_mut().filter_map(|n| match n {
            Node::Element(el) => Some(el),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given name and namespace.
    pub fn get_child(&self, name: &str, ns_iri: &str) -> Option<&Element> {
        let ns_iri = canonical_ns(ns_iri);
        self.children()
            .find(|c| c.name == name && c.ns == ns_iri)
    }

    /// Mutable variant of [`Element::get_child`].
    pub fn get_child_mut(&mut self, name: &str, ns_iri: &str) -> Option<&mut Element> {
        let ns_iri = canonical_ns(ns_iri).to_string();
        self.children_mut()
            .find(|c| c.name == name && c.ns == ns_iri)
    }

    /// Whether any child elements exist.
    pub fn has_children(&self) -> bool {
        self.children().next().is_some()
    }

    /// Take all child nodes out of this element.
    pub fn take_nodes(&mut self) -> Vec<Node> {
        std::mem::take(&mut self.nodes)
    }

    /// Replace all child nodes.
    pub fn set_nodes(&mut self, nodes: Vec<Node>) {
        self.nodes = nodes;
    }

    /// Drop child elements failing the predicate; text nodes are kept.
    pub fn retain_children<F: FnMut(&Element) -> bool>(&mut self, mut keep: F) {
        self.nodes.retain(|n| match n {
            Node::Element(el) => keep(el),
            Node::Text(_) => true,
        });
    }

    /// Concatenated character data of the direct children.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Merge runs of contiguous text nodes into single nodes.
    pub fn merge_text(&mut self) {
        let mut merged: Vec<Node> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            match (merged.last_mut(), node) {
                (Some(Node::Text(prev)), Node::Text(next)) => prev.push_str(&next),
                (_, node) => merged.push(node),
            }
        }
        self.nodes = merged;
    }

    /// Wrap this element in a new parent, carrying over `xml:lang`.
    pub fn wrap(self, name: impl Into<String>, ns_iri: &str) -> Element {
        let mut parent = Element::new(name, ns_iri);
        if let Some(lang) = self.lang() {
            let lang = lang.to_string();
            parent.set_attr_ns("lang", ns::XML, lang);
        }
        parent.append_child(self);
        parent
    }

    /// Serialize into `out`, declaring namespaces missing from `nslist`.
    ///
    /// Declarations made while writing this element are removed from the
    /// list again before returning, matching XML scoping.
    pub fn serialize(&self, out: &mut String, nslist: &mut NsDeclList, kind: StreamKind) {
        let mark = nslist.mark();
        self.serialize_inner(out, nslist, kind, &mut 0);
        nslist.rewind(mark);
    }

    fn serialize_inner(
        &self,
        out: &mut String,
        nslist: &mut NsDeclList,
        kind: StreamKind,
        gen_prefix: &mut usize,
    ) {
        let mark = nslist.mark();
        out.push('<');

        // Elements in the stream, dialback and session-control namespaces
        // keep their conventional prefixes; everything else rides the
        // default namespace.
        let conventional = conventional_prefix(&self.ns);
        match conventional {
            Some(prefix) => {
                out.push_str(prefix);
                out.push(':');
                out.push_str(&self.name);
                if !nslist.is_bound(prefix, &self.ns) {
                    let _ = write!(out, " xmlns:{}='{}'", prefix, escape(&self.ns));
                    nslist.declare(prefix, &self.ns);
                }
            }
            None => {
                out.push_str(&self.name);
                if !nslist.is_bound("", &self.ns) {
                    let wire = kind.wire_ns(&self.ns);
                    let _ = write!(out, " xmlns='{}'", escape(wire));
                    nslist.declare("", &self.ns);
                }
            }
        }

        for attr in &self.attrs {
            // Declarations materialized by the parser are recreated as
            // needed, never copied through.
            if attr.name == "xmlns" || attr.name.starts_with("xmlns:") {
                continue;
            }
            match &attr.ns {
                None => {
                    let _ = write!(out, " {}='{}'", attr.name, escape(&attr.value));
                }
                Some(attr_ns) => {
                    let prefix = match nslist.prefix_for(attr_ns) {
                        Some(p) if !p.is_empty() => p.to_string(),
                        _ => {
                            let p = match conventional_prefix(attr_ns) {
                                Some(p) => p.to_string(),
                                None => {
                                    let p = format!("ns{}", gen_prefix);
                                    *gen_prefix += 1;
                                    p
                                }
                            };
                            let _ = write!(out, " xmlns:{}='{}'", p, escape(attr_ns));
                            nslist.declare(&p, attr_ns);
                            p
                        }
                    };
                    let _ = write!(out, " {}:{}='{}'", prefix, attr.name, escape(&attr.value));
                }
            }
        }

        if self.nodes.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');
            for node in &self.nodes {
                match node {
                    Node::Text(t) => out.push_str(&escape(t)),
                    Node::Element(el) => el.serialize_inner(out, nslist, kind, gen_prefix),
                }
            }
            out.push_str("</");
            if let Some(prefix) = conventional {
                out.push_str(prefix);
                out.push(':');
            }
            out.push_str(&self.name);
            out.push('>');
        }

        nslist.rewind(mark);
    }

    /// Serialize against an empty declaration scope.
    pub fn to_wire(&self, kind: StreamKind) -> String {
        let mut out = String::new();
        let mut nslist = NsDeclList::new();
        self.serialize(&mut out, &mut nslist, kind);
        out
    }

    /// Structural equality ignoring inter-element whitespace and text splits.
    pub fn semantic_eq(&self, other: &Element) -> bool {
        fn normalized(el: &Element) -> Element {
            let mut copy = el.clone();
            copy.merge_text();
            copy.nodes.retain(|n| match n {
                Node::Text(t) => !t.trim().is_empty() || el.children().next().is_none(),
                Node::Element(_) => true,
            });
            let nodes = std::mem::take(&mut copy.nodes);
            copy.nodes = nodes
                .into_iter()
                .map(|n| match n {
                    Node::Element(el) => Node::Element(normalized(&el)),
                    text => text,
                })
                .collect();
            copy
        }
        normalized(self) == normalized(other)
    }
}

fn conventional_prefix(iri: &str) -> Option<&'static str> {
    match iri {
        ns::STREAM => Some("stream"),
        ns::DIALBACK => Some("db"),
        ns::SESSION => Some("sc"),
        _ => None,
    }
}

/// Escape character data and attribute values.
pub fn escape(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => result.push_str("&amp;"),
            '<' => result.push_str("&lt;"),
            '>' => result.push_str("&gt;"),
            '\'' => result.push_str("&apos;"),
            '"' => result.push_str("&quot;"),
            o => result.push(o),
        }
    }
    result
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire(StreamKind::Server))
    }
}

/// Fluent construction of elements.
pub struct ElementBuilder {
    element: Element,
}

impl ElementBuilder {
    /// Add an unprefixed attribute.
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.element.set_attr(name, value);
        self
    }

    /// Add a namespaced attribute.
    pub fn attr_ns(
        mut self,
        name: impl Into<String>,
        ns_iri: &str,
        value: impl Into<String>,
    ) -> Self {
        self.element.set_attr_ns(name, ns_iri, value);
        self
    }

    /// Append a child element.
    pub fn append(mut self, child: Element) -> Self {
        self.element.append_child(child);
        self
    }

    /// Append character data.
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.element.append_text(text);
        self
    }

    /// Finish building.
    pub fn build(self) -> Element {
        self.element
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_accessors() {
        let el = Element::builder("message", ns::CLIENT)
            .attr("to", "juliet@capulet.example")
            .attr("type", "chat")
            .append(
                Element::builder("body", ns::CLIENT)
                    .text("Hello")
                    .build(),
            )
            .build();

        // client namespace canonicalizes to jabber:server inside the tree
        assert_eq!(el.ns(), ns::SERVER);
        assert_eq!(el.attr("to"), Some("juliet@capulet.example"));
        let body = el.get_child("body", ns::SERVER).unwrap();
        assert_eq!(body.text(), "Hello");
    }

    #[test]
    fn serialize_rewrites_server_class_namespace() {
        let el = Element::builder("presence", ns::SERVER).build();
        assert_eq!(el.to_wire(StreamKind::Client), "<presence xmlns='jabber:client'/>");
        assert_eq!(el.to_wire(StreamKind::Server), "<presence xmlns='jabber:server'/>");
        assert_eq!(
            el.to_wire(StreamKind::Component),
            "<presence xmlns='jabber:component:accept'/>"
        );
    }

    #[test]
    fn serialize_skips_declared_default_namespace() {
        let el = Element::builder("iq", ns::SERVER).attr("type", "get").build();
        let mut nslist = NsDeclList::new();
        nslist.declare("", ns::SERVER);
        let mut out = String::new();
        el.serialize(&mut out, &mut nslist, StreamKind::Server);
        assert_eq!(out, "<iq type='get'/>");
    }

    #[test]
    fn conventional_prefixes_are_used() {
        let err = Element::builder("error", ns::STREAM)
            .append(Element::new("internal-server-error", ns::XMPP_STREAMS))
            .build();
        let out = err.to_wire(StreamKind::Server);
        assert!(out.starts_with("<stream:error xmlns:stream="));
        assert!(out.ends_with("</stream:error>"));

        let db = Element::builder("result", ns::DIALBACK)
            .attr("type", "valid")
            .build();
        let mut nslist = NsDeclList::new();
        nslist.declare("db", ns::DIALBACK);
        let mut out = String::new();
        db.serialize(&mut out, &mut nslist, StreamKind::Server);
        assert_eq!(out, "<db:result type='valid'/>");
    }

    #[test]
    fn xml_lang_uses_the_implicit_prefix() {
        let mut el = Element::new("body", ns::SERVER);
        el.set_attr("xml:lang", "en");
        el.append_text("hi");
        assert_eq!(el.lang(), Some("en"));
        assert_eq!(
            el.to_wire(StreamKind::Client),
            "<body xmlns='jabber:client' xml:lang='en'>hi</body>"
        );
    }

    #[test]
    fn text_is_escaped() {
        let mut el = Element::new("body", ns::SERVER);
        el.append_text("a < b & c");
        let out = el.to_wire(StreamKind::Server);
        assert!(out.contains("a &lt; b &amp; c"));
    }

    #[test]
    fn wrap_carries_language() {
        let mut inner = Element::new("presence", ns::SERVER);
        inner.set_attr("xml:lang", "fr");
        let wrapped = inner.wrap("route", ns::SERVER);
        assert_eq!(wrapped.lang(), Some("fr"));
        assert!(wrapped.get_child("presence", ns::SERVER).is_some());
    }

    #[test]
    fn merge_text_joins_runs() {
        let mut el = Element::new("body", ns::SERVER);
        el.append_text("Hel");
        el.append_text("lo");
        el.merge_text();
        assert_eq!(el.nodes().len(), 1);
        assert_eq!(el.text(), "Hello");
    }

    #[test]
    fn retain_children_deletes_matching_items() {
        let mut query = Element::builder("query", ns::ROSTER)
            .append(Element::builder("item", ns::ROSTER).attr("jid", "a@x").build())
            .append(Element::builder("item", ns::ROSTER).attr("jid", "b@x").build())
            .build();
        query.retain_children(|c| c.attr("jid") != Some("a@x"));
        let jids: Vec<_> = query.children().filter_map(|c| c.attr("jid")).collect();
        assert_eq!(jids, ["b@x"]);
    }

    #[test]
    fn semantic_eq_ignores_whitespace_between_siblings() {
        let mut a = Element::new("query", ns::ROSTER);
        a.append_text("\n  ");
        a.append_child(Element::new("item", ns::ROSTER));
        a.append_text("\n");

        let mut b = Element::new("query", ns::ROSTER);
        b.append_child(Element::new("item", ns::ROSTER));

        assert!(a.semantic_eq(&b));
    }
}
