//! Small stanza utilities shared by the modules.

use chrono::Utc;

use rookery_xml::{ns, Element};

/// The legacy timestamp format used in delay stamps.
pub fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H:%M:%S").to_string()
}

/// Millisecond-precision timestamp, used for offline node ids.
pub fn timestamp_ms() -> String {
    Utc::now().format("%Y%m%dT%H:%M:%S%.3f").to_string()
}

/// Stamp a stanza with a `jabber:x:delay` marker.
pub fn delay_stamp(stanza: &mut Element, from: &str, reason: Option<&str>) {
    let mut delay = Element::new("x", ns::DELAY);
    delay.set_attr("from", from);
    delay.set_attr("stamp", timestamp());
    if let Some(reason) = reason {
        delay.append_text(reason);
    }
    stanza.append_child(delay);
}

/// The priority of a presence stanza.
///
/// A missing or unparseable `<priority/>` counts as zero; any `type`
/// attribute (unavailable, error, subscribe, ...) makes the stanza
/// non-available and yields the gone sentinel.
pub fn priority_of(presence: &Element) -> i32 {
    if presence.attr("type").is_some() {
        return crate::user::PRIORITY_GONE;
    }
    presence
        .get_child("priority", ns::SERVER)
        .map(|p| p.text().trim().parse().unwrap_or(0))
        .map(|p: i32| p.clamp(-128, 127))
        .unwrap_or(0)
}

/// Swap the `to` and `from` attributes in place.
pub fn tofrom(stanza: &mut Element) {
    let to = stanza.attr("to").map(str::to_string);
    let from = stanza.attr("from").map(str::to_string);
    match from {
        Some(f) => stanza.set_attr("to", f),
        None => {
            stanza.remove_attr("to");
        }
    }
    match to {
        Some(t) => stanza.set_attr("from", t),
        None => {
            stanza.remove_attr("from");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_parse_and_clamp() {
        let mut p = Element::new("presence", ns::SERVER);
        assert_eq!(priority_of(&p), 0);

        let mut prio = Element::new("priority", ns::SERVER);
        prio.append_text("7");
        p.append_child(prio.clone());
        assert_eq!(priority_of(&p), 7);

        let mut q = Element::new("presence", ns::SERVER);
        let mut big = Element::new("priority", ns::SERVER);
        big.append_text("500");
        q.append_child(big);
        assert_eq!(priority_of(&q), 127);

        p.set_attr("type", "unavailable");
        assert_eq!(priority_of(&p), crate::user::PRIORITY_GONE);
    }

    #[test]
    fn delay_stamps_carry_origin_and_time() {
        let mut msg = Element::new("message", ns::SERVER);
        delay_stamp(&mut msg, "u@a.example/desk", Some("Offline Storage"));
        let delay = msg.get_child("x", ns::DELAY).unwrap();
        assert_eq!(delay.attr("from"), Some("u@a.example/desk"));
        assert!(delay.attr("stamp").unwrap().contains('T'));
        assert_eq!(delay.text(), "Offline Storage");
    }

    #[test]
    fn tofrom_swaps_addresses() {
        let mut el = Element::builder("iq", ns::SERVER)
            .attr("to", "a@x")
            .attr("from", "b@y")
            .build();
        tofrom(&mut el);
        assert_eq!(el.attr("to"), Some("b@y"));
        assert_eq!(el.attr("from"), Some("a@x"));
    }

    #[test]
    fn timestamps_have_the_legacy_shape() {
        let ts = timestamp();
        assert_eq!(ts.len(), 17);
        let ms = timestamp_ms();
        assert!(ms.len() > ts.len());
        assert!(ms.contains('.'));
    }
}
