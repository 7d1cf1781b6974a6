//! Packets: a stanza plus its parsed destination and kind.

use rookery_jid::Jid;
use rookery_xml::{ns, Element};

use crate::error::BusError;

/// How a packet is classified for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// An ordinary stanza (message, presence, iq).
    Normal,
    /// A `<route/>` wrapper between components.
    Route,
    /// An `<xdb/>` storage request or response.
    Xdb,
    /// A `<log/>` record.
    Log,
}

/// A routable packet: the stanza, its parsed destination, and its kind.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet kind derived from the element name.
    pub kind: PacketKind,
    /// Parsed destination address.
    pub to: Jid,
    /// Parsed source address, when present.
    pub from: Option<Jid>,
    /// The stanza itself.
    pub element: Element,
    /// Set once the packet has been bounced, to stop loops.
    pub bounced: bool,
}

impl Packet {
    /// Classify and address-parse a stanza into a packet.
    pub fn from_element(element: Element) -> Result<Self, BusError> {
        let kind = match element.name() {
            "route" => PacketKind::Route,
            "xdb" => PacketKind::Xdb,
            "log" => PacketKind::Log,
            _ => PacketKind::Normal,
        };

        let to = element
            .attr("to")
            .ok_or_else(|| BusError::BadAddress("missing to attribute".into()))?
            .parse::<Jid>()
            .map_err(|e| BusError::BadAddress(e.to_string()))?;

        let from = match element.attr("from") {
            Some(f) => Some(
                f.parse::<Jid>()
                    .map_err(|e| BusError::BadAddress(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            kind,
            to,
            from,
            element,
            bounced: false,
        })
    }

    /// Shorthand for building a packet around a freshly built element.
    pub fn new(element: Element) -> Result<Self, BusError> {
        Self::from_element(element)
    }

    /// The destination domain, the routing key.
    pub fn host(&self) -> &str {
        self.to.domain()
    }

    /// Whether this is a stanza in a server-class namespace named
    /// message/presence/iq.
    pub fn is_stanza(&self) -> bool {
        self.kind == PacketKind::Normal
            && self.element.ns() == ns::SERVER
            && matches!(self.element.name(), "message" | "presence" | "iq")
    }

    /// The stanza `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// The stanza `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// For iq stanzas, the primary-namespace child element.
    pub fn iq_query(&self) -> Option<&Element> {
        if self.element.name() != "iq" {
            return None;
        }
        self.element.children().next()
    }

    /// For iq stanzas, the namespace of the primary child.
    pub fn iq_ns(&self) -> Option<&str> {
        self.iq_query().map(|q| q.ns())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_element_name() {
        let msg = Element::builder("message", ns::SERVER)
            .attr("to", "a@x.example")
            .build();
        let p = Packet::from_element(msg).unwrap();
        assert_eq!(p.kind, PacketKind::Normal);
        assert_eq!(p.host(), "x.example");
        assert!(p.is_stanza());

        let xdb = Element::builder("xdb", ns::SERVER)
            .attr("to", "a@x.example")
            .attr("ns", ns::ROSTER)
            .build();
        let p = Packet::from_element(xdb).unwrap();
        assert_eq!(p.kind, PacketKind::Xdb);
        assert!(!p.is_stanza());
    }

    #[test]
    fn missing_to_is_rejected() {
        let el = Element::new("message", ns::SERVER);
        assert!(matches!(
            Packet::from_element(el),
            Err(BusError::BadAddress(_))
        ));
    }

    #[test]
    fn iq_primary_child_is_exposed() {
        let iq = Element::builder("iq", ns::SERVER)
            .attr("to", "x.example")
            .attr("type", "get")
            .append(Element::new("query", ns::ROSTER))
            .build();
        let p = Packet::from_element(iq).unwrap();
        assert_eq!(p.iq_ns(), Some(ns::ROSTER));
        assert_eq!(p.stanza_type(), Some("get"));
    }
}
