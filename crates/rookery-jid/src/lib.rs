//! Jabber Identifier (JID) handling.
//!
//! A JID addresses an entity on the network: `node@domain/resource`, where
//! node and resource are optional. Node and domain compare case-insensitively
//! (normalized with nodeprep/nameprep at construction); the resource is
//! case-sensitive (resourceprep only). A domain-only JID addresses a server,
//! node@domain a user, and a JID with a resource one particular session.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of each JID part, in bytes, after normalization.
pub const MAX_PART_LEN: usize = 1023;

/// Errors raised while parsing or building a JID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    /// The domain part is missing or empty.
    #[error("JID has no domain")]
    NoDomain,

    /// The node part is present but empty (`@domain`).
    #[error("JID node is empty")]
    EmptyNode,

    /// The resource part is present but empty (`domain/`).
    #[error("JID resource is empty")]
    EmptyResource,

    /// A part exceeds 1023 bytes after normalization.
    #[error("JID {part} is longer than {MAX_PART_LEN} bytes")]
    PartTooLong {
        /// Which part overflowed ("node", "domain" or "resource").
        part: &'static str,
    },

    /// Stringprep rejected a part.
    #[error("JID {part} failed stringprep")]
    Stringprep {
        /// Which part failed ("node", "domain" or "resource").
        part: &'static str,
    },
}

/// A parsed, normalized Jabber Identifier.
///
/// Parts are stored in normalized form, so derived equality and hashing give
/// the case-insensitive comparison the protocol requires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Build a JID from raw parts, applying nodeprep/nameprep/resourceprep.
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        if domain.is_empty() {
            return Err(JidError::NoDomain);
        }

        let node = match node {
            Some("") => return Err(JidError::EmptyNode),
            Some(n) => Some(prep_part(n, "node")?),
            None => None,
        };

        let domain = prep_part(domain, "domain")?;

        let resource = match resource {
            Some("") => return Err(JidError::EmptyResource),
            Some(r) => Some(prep_part(r, "resource")?),
            None => None,
        };

        Ok(Self {
            node,
            domain,
            resource,
        })
    }

    /// Build a domain-only (server) JID.
    pub fn domain_jid(domain: &str) -> Result<Self, JidError> {
        Self::new(None, domain, None)
    }

    /// The node part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// Whether this JID addresses a server (domain only).
    pub fn is_server(&self) -> bool {
        self.node.is_none() && self.resource.is_none()
    }

    /// Whether this JID carries a resource (addresses one session).
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// The bare JID: same node and domain, resource dropped.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// The bare-JID string `node@domain` (or just `domain`).
    pub fn user(&self) -> String {
        match &self.node {
            Some(n) => format!("{}@{}", n, self.domain),
            None => self.domain.clone(),
        }
    }

    /// A copy of this JID with the given resource.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        if resource.is_empty() {
            return Err(JidError::EmptyResource);
        }
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(prep_part(resource, "resource")?),
        })
    }

    /// Compare bare parts only (node and domain), ignoring resources.
    pub fn bare_eq(&self, other: &Jid) -> bool {
        self.node == other.node && self.domain == other.domain
    }
}

/// Run the part through its stringprep profile and enforce the length cap.
fn prep_part(raw: &str, part: &'static str) -> Result<String, JidError> {
    let prepped = match part {
        "node" => stringprep::nodeprep(raw),
        "resource" => stringprep::resourceprep(raw),
        _ => stringprep::nameprep(raw),
    }
    .map_err(|_| JidError::Stringprep { part })?;

    if prepped.len() > MAX_PART_LEN {
        return Err(JidError::PartTooLong { part });
    }
    Ok(prepped.into_owned())
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The resource starts at the first '/'; everything after it is
        // opaque, including further '/' and '@' characters.
        let (before, resource) = match s.find('/') {
            Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
            None => (s, None),
        };

        let (node, domain) = match before.find('@') {
            Some(idx) => (Some(&before[..idx]), &before[idx + 1..]),
            None => (None, before),
        };

        Jid::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}
