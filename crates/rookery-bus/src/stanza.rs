//! Stanza error construction.
//!
//! Error replies invert the original stanza (`to`/`from` swapped, `id`
//! preserved), set `type='error'` and append an `<error/>` child carrying
//! the RFC condition element, the legacy numeric code, and optional text.
//! A stanza that is already an error, or that carries the bounce marker,
//! is never bounced again.

use rookery_xml::{ns, Element, Node};

/// Stanza-level error conditions used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaError {
    /// 400, modify.
    BadRequest,
    /// 409, cancel.
    Conflict,
    /// 501, cancel.
    FeatureNotImplemented,
    /// 403, auth.
    Forbidden,
    /// 404, cancel.
    ItemNotFound,
    /// 405, cancel.
    NotAllowed,
    /// 406, modify.
    NotAcceptable,
    /// 401, auth.
    NotAuthorized,
    /// 500, wait.
    InternalServerError,
    /// 404, cancel.
    RecipientUnavailable,
    /// 404, cancel.
    RemoteServerNotFound,
    /// 502, wait (dialback could not authorize the link).
    RemoteServerFailed,
    /// 504, wait.
    RemoteServerTimeout,
    /// 503, cancel.
    ServiceUnavailable,
    /// 406, modify (privacy/groups policy).
    PolicyViolation,
}

impl StanzaError {
    /// The condition element name in `urn:ietf:params:xml:ns:xmpp-stanzas`.
    pub fn condition(&self) -> &'static str {
        match self {
            StanzaError::BadRequest => "bad-request",
            StanzaError::Conflict => "conflict",
            StanzaError::FeatureNotImplemented => "feature-not-implemented",
            StanzaError::Forbidden => "forbidden",
            StanzaError::ItemNotFound => "item-not-found",
            StanzaError::NotAllowed => "not-allowed",
            StanzaError::NotAcceptable => "not-acceptable",
            StanzaError::NotAuthorized => "not-authorized",
            StanzaError::InternalServerError => "internal-server-error",
            StanzaError::RecipientUnavailable => "recipient-unavailable",
            StanzaError::RemoteServerNotFound => "remote-server-not-found",
            StanzaError::RemoteServerFailed => "remote-server-failed",
            StanzaError::RemoteServerTimeout => "remote-server-timeout",
            StanzaError::ServiceUnavailable => "service-unavailable",
            StanzaError::PolicyViolation => "policy-violation",
        }
    }

    /// The error `type` attribute.
    pub fn error_type(&self) -> &'static str {
        match self {
            StanzaError::BadRequest | StanzaError::NotAcceptable | StanzaError::PolicyViolation => {
                "modify"
            }
            StanzaError::Forbidden | StanzaError::NotAuthorized => "auth",
            StanzaError::InternalServerError
            | StanzaError::RemoteServerFailed
            | StanzaError::RemoteServerTimeout => "wait",
            _ => "cancel",
        }
    }

    /// The legacy numeric code kept for old clients.
    pub fn legacy_code(&self) -> u16 {
        match self {
            StanzaError::BadRequest => 400,
            StanzaError::NotAuthorized => 401,
            StanzaError::Forbidden => 403,
            StanzaError::ItemNotFound
            | StanzaError::RecipientUnavailable
            | StanzaError::RemoteServerNotFound => 404,
            StanzaError::NotAllowed => 405,
            StanzaError::NotAcceptable | StanzaError::PolicyViolation => 406,
            StanzaError::Conflict => 409,
            StanzaError::InternalServerError => 500,
            StanzaError::RemoteServerFailed => 502,
            StanzaError::FeatureNotImplemented => 501,
            StanzaError::ServiceUnavailable => 503,
            StanzaError::RemoteServerTimeout => 504,
        }
    }
}

/// Whether a stanza must never be bounced (error type or bounce marker).
pub fn unbounceable(stanza: &Element) -> bool {
    if stanza.attr("type") == Some("error") {
        return true;
    }
    stanza.get_child("delay", ns::DELAY).is_some()
}

/// Build the error reply for a stanza, or `None` when bouncing is unsafe.
///
/// The reply echoes the original children, swaps the addresses, preserves
/// the id, and appends the `<error/>` child plus the bounce marker.
pub fn error_reply(original: &Element, error: StanzaError, text: Option<&str>) -> Option<Element> {
    if unbounceable(original) {
        return None;
    }

    let mut reply = Element::new(original.name(), original.ns());
    // invert the envelope
    if let Some(from) = original.attr("from") {
        reply.set_attr("to", from);
    }
    if let Some(to) = original.attr("to") {
        reply.set_attr("from", to);
    }
    if let Some(id) = original.attr("id") {
        reply.set_attr("id", id);
    }
    reply.set_attr("type", "error");

    for node in original.nodes() {
        match node {
            Node::Element(el) => {
                reply.append_child(el.clone());
            }
            Node::Text(t) => reply.append_text(t.clone()),
        }
    }

    let mut err = Element::new("error", original.ns());
    err.set_attr("type", error.error_type());
    err.set_attr("code", error.legacy_code().to_string());
    err.append_child(Element::new(error.condition(), ns::XMPP_STANZAS));
    if let Some(text) = text {
        let mut t = Element::new("text", ns::XMPP_STANZAS);
        t.append_text(text);
        err.append_child(t);
    }
    reply.append_child(err);

    // bounce marker so this reply is never bounced again
    let mut marker = Element::new("delay", ns::DELAY);
    marker.append_text("bounced");
    reply.append_child(marker);

    Some(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> Element {
        Element::builder("message", ns::SERVER)
            .attr("to", "juliet@capulet.example")
            .attr("from", "romeo@montague.example/balcony")
            .attr("id", "m1")
            .attr("type", "chat")
            .append(Element::builder("body", ns::SERVER).text("hi").build())
            .build()
    }

    #[test]
    fn reply_inverts_envelope_and_keeps_id() {
        let reply = error_reply(&chat(), StanzaError::ServiceUnavailable, None).unwrap();
        assert_eq!(reply.attr("to"), Some("romeo@montague.example/balcony"));
        assert_eq!(reply.attr("from"), Some("juliet@capulet.example"));
        assert_eq!(reply.attr("id"), Some("m1"));
        assert_eq!(reply.attr("type"), Some("error"));

        let err = reply.get_child("error", ns::SERVER).unwrap();
        assert_eq!(err.attr("type"), Some("cancel"));
        assert_eq!(err.attr("code"), Some("503"));
        assert!(err
            .get_child("service-unavailable", ns::XMPP_STANZAS)
            .is_some());
    }

    #[test]
    fn original_children_are_echoed() {
        let reply = error_reply(&chat(), StanzaError::RecipientUnavailable, None).unwrap();
        assert_eq!(reply.get_child("body", ns::SERVER).unwrap().text(), "hi");
    }

    #[test]
    fn errors_are_never_bounced() {
        let mut stanza = chat();
        stanza.set_attr("type", "error");
        assert!(error_reply(&stanza, StanzaError::ServiceUnavailable, None).is_none());
    }

    #[test]
    fn bounce_marker_stops_a_second_bounce() {
        let first = error_reply(&chat(), StanzaError::ServiceUnavailable, None).unwrap();
        assert!(error_reply(&first, StanzaError::ServiceUnavailable, None).is_none());
    }

    #[test]
    fn optional_text_is_included() {
        let reply = error_reply(&chat(), StanzaError::RemoteServerTimeout, Some("queue expired"))
            .unwrap();
        let err = reply.get_child("error", ns::SERVER).unwrap();
        assert_eq!(
            err.get_child("text", ns::XMPP_STANZAS).unwrap().text(),
            "queue expired"
        );
    }
}
