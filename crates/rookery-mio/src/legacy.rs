//! First-read sniffing for legacy and port-sharing clients.
//!
//! Three historical client behaviors share the XMPP port. The very first
//! read on an accepted connection is inspected once:
//!
//! - an embedded NUL byte means Flash XMLSocket framing; the connection
//!   switches to null-terminated-legacy mode and NULs are stripped,
//! - a `GET ` request line is answered from a static file root or with a
//!   redirect, then the connection is done,
//! - a leading `<policy-file-request` gets the Flash cross-domain policy.
//!
//! This is a compatibility surface: replicated, not extended.

/// Outcome of sniffing the first read of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniff {
    /// Ordinary XML stream traffic.
    Xml,
    /// Flash XMLSocket framing; strip NULs from the byte stream.
    NulTerminated,
    /// An HTTP GET; serve or redirect, then close.
    HttpGet,
    /// A Flash cross-domain policy request; answer and close.
    PolicyRequest,
}

/// Classify the first bytes read from a fresh connection.
pub fn sniff(first: &[u8]) -> Sniff {
    if first.starts_with(b"<policy-file-request") {
        return Sniff::PolicyRequest;
    }
    if first.starts_with(b"GET ") {
        return Sniff::HttpGet;
    }
    if first.contains(&0) {
        return Sniff::NulTerminated;
    }
    Sniff::Xml
}

/// Remove NUL framing bytes in place.
pub fn strip_nuls(data: &mut Vec<u8>) {
    data.retain(|&b| b != 0);
}

/// The Flash cross-domain policy reply for the given permitted domains.
///
/// An empty list permits all domains, matching the historical behavior.
pub fn policy_reply(domains: &[String]) -> String {
    let mut out = String::from(
        "<?xml version='1.0'?><!DOCTYPE cross-domain-policy SYSTEM \
         'http://www.macromedia.com/xml/dtds/cross-domain-policy.dtd'>\
         <cross-domain-policy>",
    );
    if domains.is_empty() {
        out.push_str("<allow-access-from domain='*' to-ports='*'/>");
    } else {
        for domain in domains {
            out.push_str(&format!(
                "<allow-access-from domain='{}' to-ports='*'/>",
                domain
            ));
        }
    }
    out.push_str("</cross-domain-policy>");
    // XMLSocket clients expect the NUL terminator
    out.push('\0');
    out
}

/// How GET requests on the XMPP port are answered.
#[derive(Debug, Clone)]
pub enum HttpAnswer {
    /// Redirect every request to a fixed URI.
    Redirect(String),
    /// Serve files below a static root.
    FileRoot(std::path::PathBuf),
}

/// Build the HTTP response for a sniffed GET request.
pub fn http_response(request: &[u8], answer: Option<&HttpAnswer>) -> String {
    match answer {
        Some(HttpAnswer::Redirect(uri)) => format!(
            "HTTP/1.0 301 Moved Permanently\r\nLocation: {}\r\nConnection: close\r\n\r\n",
            uri
        ),
        Some(HttpAnswer::FileRoot(root)) => {
            match read_requested_file(request, root) {
                Some(body) => format!(
                    "HTTP/1.0 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                ),
                None => "HTTP/1.0 404 Not Found\r\nConnection: close\r\n\r\n".to_string(),
            }
        }
        None => "HTTP/1.0 403 Forbidden\r\nConnection: close\r\n\r\n".to_string(),
    }
}

/// Resolve the GET path below the configured root, refusing traversal.
fn read_requested_file(request: &[u8], root: &std::path::Path) -> Option<String> {
    let line = request.split(|&b| b == b'\r' || b == b'\n').next()?;
    let line = std::str::from_utf8(line).ok()?;
    let path = line.strip_prefix("GET ")?.split(' ').next()?;
    let relative = path.trim_start_matches('/');
    if relative.contains("..") {
        return None;
    }
    let target = if relative.is_empty() {
        root.join("index.html")
    } else {
        root.join(relative)
    };
    std::fs::read_to_string(target).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_classifies_first_reads() {
        assert_eq!(sniff(b"<stream:stream to='x'>"), Sniff::Xml);
        assert_eq!(sniff(b"<policy-file-request/>\0"), Sniff::PolicyRequest);
        assert_eq!(sniff(b"GET / HTTP/1.0\r\n"), Sniff::HttpGet);
        assert_eq!(sniff(b"<stream:stream>\0"), Sniff::NulTerminated);
    }

    #[test]
    fn nul_stripping_keeps_payload() {
        let mut data = b"<presence/>\0<message/>\0".to_vec();
        strip_nuls(&mut data);
        assert_eq!(data, b"<presence/><message/>");
    }

    #[test]
    fn policy_reply_lists_domains() {
        let open = policy_reply(&[]);
        assert!(open.contains("domain='*'"));
        assert!(open.ends_with('\0'));

        let scoped = policy_reply(&["jabber.example".to_string()]);
        assert!(scoped.contains("domain='jabber.example'"));
        assert!(!scoped.contains("domain='*'"));
    }

    #[test]
    fn http_get_redirects_when_configured() {
        let answer = HttpAnswer::Redirect("https://chat.example/".to_string());
        let reply = http_response(b"GET /anything HTTP/1.0\r\n\r\n", Some(&answer));
        assert!(reply.starts_with("HTTP/1.0 301"));
        assert!(reply.contains("Location: https://chat.example/"));
    }

    #[test]
    fn http_get_without_config_is_forbidden() {
        let reply = http_response(b"GET / HTTP/1.0\r\n\r\n", None);
        assert!(reply.starts_with("HTTP/1.0 403"));
    }

    #[test]
    fn file_root_refuses_traversal() {
        let answer = HttpAnswer::FileRoot(std::path::PathBuf::from("/nonexistent"));
        let reply = http_response(b"GET /../etc/passwd HTTP/1.0\r\n\r\n", Some(&answer));
        assert!(reply.starts_with("HTTP/1.0 404"));
    }
}
