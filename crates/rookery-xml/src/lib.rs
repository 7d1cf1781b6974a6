//! Namespace-aware XML tree, query and streaming substrate.
//!
//! Everything above the byte level in rookery works on [`Element`] trees:
//! stanzas, configuration, storage fragments. The model is deliberately
//! small: elements carry a local name, a namespace IRI and ordered
//! attributes/children; serialization resolves prefixes against a
//! declaration stack; an incremental [`stream::XmlStream`] turns raw bytes
//! into stream events.
//!
//! The three "server-class" namespaces `jabber:server`, `jabber:client` and
//! `jabber:component:accept` are canonicalized to `jabber:server` inside the
//! tree so the same stanza can flow through any stream kind; the serializer
//! rewrites the canonical IRI according to the [`StreamKind`] it is given.

pub mod element;
pub mod error;
pub mod stream;
pub mod xpath;

pub use element::{Attribute, Element, ElementBuilder, Node, NsDeclList, StreamKind};
pub use error::XmlError;
pub use stream::{parse_document, StreamEvent, XmlStream};
pub use xpath::{get_tags, select_by_lang, Match, NsMap};

/// Namespace IRIs the server accepts and produces.
pub mod ns {
    /// Client stream namespace.
    pub const CLIENT: &str = "jabber:client";
    /// Server stream namespace; the canonical server-class namespace.
    pub const SERVER: &str = "jabber:server";
    /// Legacy component stream namespace.
    pub const COMPONENT_ACCEPT: &str = "jabber:component:accept";
    /// Stream framing namespace, conventional prefix `stream`.
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// Server dialback namespace, conventional prefix `db`.
    pub const DIALBACK: &str = "jabber:server:dialback";
    /// Session-control namespace, conventional prefix `sc`.
    pub const SESSION: &str = "http://jabberd.jabberstudio.org/ns/session/1.0";
    /// The `xml:` prefix namespace.
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
    /// The `xmlns` declaration namespace.
    pub const XMLNS: &str = "http://www.w3.org/2000/xmlns/";
    /// Synthesized namespace for undeclared prefixes on lenient input.
    pub const CLUE: &str = "http://jabberd.org/ns/clue";

    /// Roster storage and queries.
    pub const ROSTER: &str = "jabber:iq:roster";
    /// Offline message storage.
    pub const OFFLINE: &str = "jabber:x:offline";
    /// Privacy lists.
    pub const PRIVACY: &str = "jabber:iq:privacy";
    /// Delayed delivery stamps.
    pub const DELAY: &str = "jabber:x:delay";
    /// Message expiry (XEP-0023).
    pub const EXPIRE: &str = "jabber:x:expire";
    /// Message events (offline receipts).
    pub const EVENT: &str = "jabber:x:event";
    /// In-band registration.
    pub const REGISTER: &str = "jabber:iq:register";
    /// Browse queries (used by shared groups).
    pub const BROWSE: &str = "jabber:iq:browse";
    /// Service discovery: info.
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    /// Service discovery: items.
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    /// Flexible offline retrieval (XEP-0013).
    pub const FLEX_OFFLINE: &str = "http://jabber.org/protocol/offline";
    /// Stored inbound subscription requests.
    pub const STORED_SUBSCRIPTION: &str = "http://jabberd.org/ns/storedsubscriptionrequest";
    /// STARTTLS negotiation.
    pub const XMPP_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL negotiation.
    pub const XMPP_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Stream error conditions.
    pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Stanza error conditions.
    pub const XMPP_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
}

/// Map a server-class namespace to the canonical `jabber:server` IRI.
///
/// All other IRIs pass through unchanged.
pub fn canonical_ns(iri: &str) -> &str {
    match iri {
        ns::CLIENT | ns::COMPONENT_ACCEPT => ns::SERVER,
        other => other,
    }
}
