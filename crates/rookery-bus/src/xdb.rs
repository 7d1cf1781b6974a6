//! The XDB storage facade.
//!
//! Storage is reached over the bus: an `<xdb/>` envelope routed as an xdb
//! packet carries `get`/`set` requests keyed by owner JID and namespace,
//! and every backend answers with a correlated `result` (or `error`)
//! envelope. [`XdbCache`] is the caller side: it parks the requesting task
//! on a oneshot until the reply lands, synthesizing an empty result on
//! timeout. [`XdbInstanceHandler`] is the backend side, translating
//! envelopes into [`XdbBackend`] calls, including the delete-then-insert
//! `match`/`matchpath` semantics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use rookery_jid::Jid;
use rookery_xml::xpath::{self, NsMap};
use rookery_xml::Element;

use crate::deliver::{Handler, HandlerResult, Router};
use crate::packet::{Packet, PacketKind};

/// Default wait for a storage reply before synthesizing an empty result.
pub const XDB_TIMEOUT_SECS: u64 = 10;

/// Errors from storage backends.
#[derive(Debug, Error)]
pub enum XdbError {
    /// The envelope was not a valid request.
    #[error("bad xdb request: {0}")]
    BadRequest(String),

    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The match language for insert requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSpec {
    /// No match: nothing is deleted before the insert.
    None,
    /// `?attr=value`: delete children whose attribute equals the value.
    AttrEq {
        /// Attribute name.
        name: String,
        /// Required value.
        value: String,
    },
    /// An XPath-subset expression evaluated against each stored child.
    Path(String),
}

impl MatchSpec {
    /// Parse the `match`/`matchpath` attributes of an envelope.
    pub fn parse(match_attr: Option<&str>, matchpath: Option<&str>) -> Self {
        if let Some(m) = match_attr {
            if let Some(rest) = m.strip_prefix('?') {
                if let Some((name, value)) = rest.split_once('=') {
                    return MatchSpec::AttrEq {
                        name: name.to_string(),
                        value: value.to_string(),
                    };
                }
            }
            return MatchSpec::Path(m.to_string());
        }
        if let Some(p) = matchpath {
            return MatchSpec::Path(p.to_string());
        }
        MatchSpec::None
    }

    /// Whether a stored child matches (and should be deleted on insert).
    pub fn matches(&self, el: &Element, default_ns: &str) -> bool {
        match self {
            MatchSpec::None => false,
            MatchSpec::AttrEq { name, value } => el.attr(name) == Some(value.as_str()),
            MatchSpec::Path(path) => {
                let mut map = NsMap::new();
                map.insert(String::new(), default_ns.to_string());
                xpath::element_matches(el, path, &map)
            }
        }
    }

    fn attrs(&self) -> (Option<String>, Option<String>) {
        match self {
            MatchSpec::None => (None, None),
            MatchSpec::AttrEq { name, value } => (Some(format!("?{}={}", name, value)), None),
            MatchSpec::Path(p) => (None, Some(p.clone())),
        }
    }
}

/// A parsed `<xdb/>` request envelope.
#[derive(Debug, Clone)]
pub struct XdbRequest {
    /// `get` or `set`.
    pub op: String,
    /// Whose data.
    pub owner: Jid,
    /// Which namespace.
    pub ns: String,
    /// Correlation id.
    pub id: String,
    /// Reply address.
    pub reply_to: String,
    /// Insert mode for sets.
    pub insert: bool,
    /// Match specification for inserts.
    pub match_spec: MatchSpec,
    /// Payload children.
    pub content: Vec<Element>,
}

impl XdbRequest {
    /// Parse an envelope element.
    pub fn parse(el: &Element) -> Result<Self, XdbError> {
        if el.name() != "xdb" {
            return Err(XdbError::BadRequest("not an xdb envelope".into()));
        }
        let op = el
            .attr("type")
            .ok_or_else(|| XdbError::BadRequest("missing type".into()))?
            .to_string();
        let owner = el
            .attr("to")
            .ok_or_else(|| XdbError::BadRequest("missing to".into()))?
            .parse::<Jid>()
            .map_err(|e| XdbError::BadRequest(e.to_string()))?;
        let ns = el
            .attr("ns")
            .ok_or_else(|| XdbError::BadRequest("missing ns".into()))?
            .to_string();
        let id = el.attr("id").unwrap_or_default().to_string();
        let reply_to = el.attr("from").unwrap_or_default().to_string();
        let insert = el.attr("action") == Some("insert");
        let match_spec = MatchSpec::parse(el.attr("match"), el.attr("matchpath"));
        let content = el.children().cloned().collect();

        Ok(Self {
            op,
            owner,
            ns,
            id,
            reply_to,
            insert,
            match_spec,
            content,
        })
    }
}

/// A storage backend servicing one or more namespaces.
#[async_trait]
pub trait XdbBackend: Send + Sync {
    /// Load the stored children for `(owner, ns)`, `None` when absent.
    async fn get(&self, owner: &Jid, ns: &str) -> Result<Option<Vec<Element>>, XdbError>;

    /// Replace the stored children; an empty slice deletes the record.
    async fn put(&self, owner: &Jid, ns: &str, children: &[Element]) -> Result<(), XdbError>;

    /// Delete the matching subset, then append `content`.
    ///
    /// Backends with a native delete (SQL) override this; the default is
    /// read-modify-write in fragment space.
    async fn insert(
        &self,
        owner: &Jid,
        ns: &str,
        spec: &MatchSpec,
        content: &[Element],
    ) -> Result<(), XdbError> {
        let mut children = self.get(owner, ns).await?.unwrap_or_default();
        children.retain(|el| !spec.matches(el, ns));
        children.extend(content.iter().cloned());
        self.put(owner, ns, &children).await
    }
}

/// In-memory backend, for tests and storage-less deployments.
#[derive(Default)]
pub struct MemoryXdb {
    records: DashMap<(String, String), Vec<Element>>,
}

impl MemoryXdb {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(owner: &Jid, ns: &str) -> (String, String) {
        (owner.bare().to_string(), ns.to_string())
    }
}

#[async_trait]
impl XdbBackend for MemoryXdb {
    async fn get(&self, owner: &Jid, ns: &str) -> Result<Option<Vec<Element>>, XdbError> {
        Ok(self
            .records
            .get(&Self::key(owner, ns))
            .map(|v| v.value().clone()))
    }

    async fn put(&self, owner: &Jid, ns: &str, children: &[Element]) -> Result<(), XdbError> {
        let key = Self::key(owner, ns);
        if children.is_empty() {
            self.records.remove(&key);
        } else {
            self.records.insert(key, children.to_vec());
        }
        Ok(())
    }
}

/// The backend-side bus handler: envelope in, backend call, reply out.
pub struct XdbInstanceHandler {
    backend: Arc<dyn XdbBackend>,
    router: Arc<Router>,
}

impl XdbInstanceHandler {
    /// Wrap a backend for registration on an xdb instance.
    pub fn new(backend: Arc<dyn XdbBackend>, router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self { backend, router })
    }

    async fn respond(&self, request: &XdbRequest, children: Vec<Element>, error: bool) {
        if request.reply_to.is_empty() {
            debug!("xdb request without reply address, not responding");
            return;
        }
        let mut reply = Element::new("xdb", rookery_xml::ns::SERVER);
        reply.set_attr("type", if error { "error" } else { "result" });
        reply.set_attr("to", request.reply_to.clone());
        reply.set_attr("from", request.owner.to_string());
        reply.set_attr("ns", request.ns.clone());
        if !request.id.is_empty() {
            reply.set_attr("id", request.id.clone());
        }
        for child in children {
            reply.append_child(child);
        }
        match Packet::from_element(reply) {
            Ok(packet) => self.router.deliver(packet).await,
            Err(e) => warn!(error = %e, "xdb reply unroutable"),
        }
    }
}

#[async_trait]
impl Handler for XdbInstanceHandler {
    async fn handle(&self, packet: Packet) -> HandlerResult {
        if packet.kind != PacketKind::Xdb {
            return HandlerResult::Pass(packet);
        }
        let request = match XdbRequest::parse(&packet.element) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "dropping malformed xdb envelope");
                return HandlerResult::Done;
            }
        };

        // Replies routed here by accident are not requests.
        if request.op == "result" || request.op == "error" {
            return HandlerResult::Done;
        }

        match request.op.as_str() {
            "get" => match self.backend.get(&request.owner, &request.ns).await {
                Ok(children) => {
                    self.respond(&request, children.unwrap_or_default(), false)
                        .await
                }
                Err(e) => {
                    warn!(error = %e, owner = %request.owner, "xdb get failed");
                    self.respond(&request, Vec::new(), true).await;
                }
            },
            "set" => {
                let result = if request.insert {
                    self.backend
                        .insert(
                            &request.owner,
                            &request.ns,
                            &request.match_spec,
                            &request.content,
                        )
                        .await
                } else {
                    self.backend
                        .put(&request.owner, &request.ns, &request.content)
                        .await
                };
                match result {
                    Ok(()) => self.respond(&request, Vec::new(), false).await,
                    Err(e) => {
                        warn!(error = %e, owner = %request.owner, "xdb set failed");
                        self.respond(&request, Vec::new(), true).await;
                    }
                }
            }
            other => {
                warn!(op = %other, "unknown xdb operation");
                self.respond(&request, Vec::new(), true).await;
            }
        }

        HandlerResult::Done
    }
}

/// Caller-side cache of in-flight storage requests.
///
/// Each logical task awaits its own oneshot; replies are correlated by id.
pub struct XdbCache {
    router: Arc<Router>,
    instance_id: String,
    pending: DashMap<String, oneshot::Sender<Option<Element>>>,
    timeout: Duration,
    next_id: AtomicU64,
}

impl XdbCache {
    /// A cache sending requests from `instance_id` (the reply address).
    pub fn new(router: Arc<Router>, instance_id: impl Into<String>) -> Arc<Self> {
        Self::with_timeout(
            router,
            instance_id,
            Duration::from_secs(XDB_TIMEOUT_SECS),
        )
    }

    /// A cache with an explicit reply timeout.
    pub fn with_timeout(
        router: Arc<Router>,
        instance_id: impl Into<String>,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            router,
            instance_id: instance_id.into(),
            pending: DashMap::new(),
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    /// Fetch the stored children for `(owner, ns)`.
    ///
    /// Returns the result envelope, whose children are the stored
    /// fragment; `None` for absent records, errors and timeouts.
    pub async fn get(&self, owner: &Jid, ns_iri: &str) -> Option<Element> {
        let envelope = self.envelope("get", owner, ns_iri);
        self.request(envelope).await
    }

    /// Replace the stored children. An empty list deletes the record.
    pub async fn set(&self, owner: &Jid, ns_iri: &str, children: Vec<Element>) -> bool {
        let mut envelope = self.envelope("set", owner, ns_iri);
        for child in children {
            envelope.append_child(child);
        }
        self.request(envelope).await.is_some()
    }

    /// Delete the matching subset, then insert `content`.
    pub async fn insert(
        &self,
        owner: &Jid,
        ns_iri: &str,
        spec: &MatchSpec,
        content: Element,
    ) -> bool {
        let mut envelope = self.envelope("set", owner, ns_iri);
        envelope.set_attr("action", "insert");
        let (m, mp) = spec.attrs();
        if let Some(m) = m {
            envelope.set_attr("match", m);
        }
        if let Some(mp) = mp {
            envelope.set_attr("matchpath", mp);
        }
        envelope.append_child(content);
        self.request(envelope).await.is_some()
    }

    /// Delete the matching subset without inserting anything.
    pub async fn delete_matching(&self, owner: &Jid, ns_iri: &str, spec: &MatchSpec) -> bool {
        let mut envelope = self.envelope("set", owner, ns_iri);
        envelope.set_attr("action", "insert");
        let (m, mp) = spec.attrs();
        if let Some(m) = m {
            envelope.set_attr("match", m);
        }
        if let Some(mp) = mp {
            envelope.set_attr("matchpath", mp);
        }
        self.request(envelope).await.is_some()
    }

    /// The bus handler resolving replies addressed to this cache.
    pub fn handler(self: &Arc<Self>) -> Arc<dyn Handler> {
        Arc::new(XdbReplyHandler {
            cache: Arc::clone(self),
        })
    }

    /// Resolve a reply envelope against the pending table.
    pub fn resolve(&self, reply: &Element) -> bool {
        let Some(id) = reply.attr("id") else {
            return false;
        };
        let Some((_, tx)) = self.pending.remove(id) else {
            return false;
        };
        let result = if reply.attr("type") == Some("result") {
            Some(reply.clone())
        } else {
            None
        };
        let _ = tx.send(result);
        true
    }

    fn envelope(&self, op: &str, owner: &Jid, ns_iri: &str) -> Element {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Element::builder("xdb", rookery_xml::ns::SERVER)
            .attr("type", op)
            .attr("to", owner.bare().to_string())
            .attr("from", self.instance_id.clone())
            .attr("ns", ns_iri)
            .attr("id", id.to_string())
            .build()
    }

    async fn request(&self, envelope: Element) -> Option<Element> {
        let id = envelope.attr("id").unwrap_or_default().to_string();
        let ns = envelope.attr("ns").unwrap_or_default().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let packet = match Packet::from_element(envelope) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "xdb request unroutable");
                self.pending.remove(&id);
                return None;
            }
        };
        self.router.deliver(packet).await;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => None,
            Err(_) => {
                self.pending.remove(&id);
                warn!(id = %id, ns = %ns, "xdb request timed out, returning empty result");
                None
            }
        }
    }
}

struct XdbReplyHandler {
    cache: Arc<XdbCache>,
}

#[async_trait]
impl Handler for XdbReplyHandler {
    async fn handle(&self, packet: Packet) -> HandlerResult {
        if packet.kind == PacketKind::Xdb
            && matches!(packet.element.attr("type"), Some("result") | Some("error"))
            && self.cache.resolve(&packet.element)
        {
            return HandlerResult::Done;
        }
        HandlerResult::Pass(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliver::{Instance, InstanceType};
    use rookery_xml::ns;

    fn roster_query(items: &[(&str, &str)]) -> Element {
        let mut query = Element::new("query", ns::ROSTER);
        for (jid, sub) in items {
            query.append_child(
                Element::builder("item", ns::ROSTER)
                    .attr("jid", *jid)
                    .attr("subscription", *sub)
                    .build(),
            );
        }
        query
    }

    /// Wire a router with an xdb backend instance and a caller instance.
    fn rig() -> (Arc<Router>, Arc<XdbCache>) {
        let router = Arc::new(Router::new());

        let backend = Arc::new(MemoryXdb::new());
        let storage = Instance::new("xdb-mem", InstanceType::Xdb, vec!["*".to_string()]);
        storage.add_handler(XdbInstanceHandler::new(backend, Arc::clone(&router)));
        router.register(storage).unwrap();

        let cache = XdbCache::new(Arc::clone(&router), "sessions.a.example");
        let caller = Instance::new(
            "sessions.a.example",
            InstanceType::Server,
            vec!["sessions.a.example".to_string()],
        );
        caller.add_handler(cache.handler());
        router.register(caller).unwrap();

        (router, cache)
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let (_router, cache) = rig();
        let owner: Jid = "u@a.example".parse().unwrap();

        assert!(cache
            .set(&owner, ns::ROSTER, vec![roster_query(&[("a@x", "both")])])
            .await);

        let result = cache.get(&owner, ns::ROSTER).await.unwrap();
        let query = result.get_child("query", ns::ROSTER).unwrap();
        assert_eq!(query.children().count(), 1);
    }

    #[tokio::test]
    async fn get_of_absent_record_is_empty() {
        let (_router, cache) = rig();
        let owner: Jid = "nobody@a.example".parse().unwrap();
        let result = cache.get(&owner, ns::ROSTER).await.unwrap();
        assert_eq!(result.children().count(), 0);
    }

    #[tokio::test]
    async fn empty_set_deletes() {
        let (_router, cache) = rig();
        let owner: Jid = "u@a.example".parse().unwrap();
        cache
            .set(&owner, ns::ROSTER, vec![roster_query(&[("a@x", "to")])])
            .await;
        cache.set(&owner, ns::ROSTER, Vec::new()).await;
        let result = cache.get(&owner, ns::ROSTER).await.unwrap();
        assert_eq!(result.children().count(), 0);
    }

    #[tokio::test]
    async fn insert_with_match_replaces_only_the_subset() {
        let (_router, cache) = rig();
        let owner: Jid = "u@a.example".parse().unwrap();

        // store the fragment as its children (two items under one query)
        cache
            .set(
                &owner,
                ns::ROSTER,
                vec![
                    Element::builder("item", ns::ROSTER).attr("jid", "a@x").build(),
                    Element::builder("item", ns::ROSTER).attr("jid", "b@x").build(),
                ],
            )
            .await;

        let spec = MatchSpec::AttrEq {
            name: "jid".into(),
            value: "a@x".into(),
        };
        assert!(
            cache
                .insert(
                    &owner,
                    ns::ROSTER,
                    &spec,
                    Element::builder("item", ns::ROSTER)
                        .attr("jid", "a@x")
                        .attr("subscription", "both")
                        .build(),
                )
                .await
        );

        let result = cache.get(&owner, ns::ROSTER).await.unwrap();
        let items: Vec<_> = result.children().collect();
        assert_eq!(items.len(), 2);
        let a = items
            .iter()
            .find(|i| i.attr("jid") == Some("a@x"))
            .unwrap();
        assert_eq!(a.attr("subscription"), Some("both"));
        let b = items
            .iter()
            .find(|i| i.attr("jid") == Some("b@x"))
            .unwrap();
        assert_eq!(b.attr("subscription"), None);
    }

    #[tokio::test]
    async fn matchpath_uses_the_xpath_subset() {
        let spec = MatchSpec::parse(None, Some("item[@jid='a@x']"));
        let item = Element::builder("item", ns::ROSTER).attr("jid", "a@x").build();
        let other = Element::builder("item", ns::ROSTER).attr("jid", "b@x").build();
        assert!(spec.matches(&item, ns::ROSTER));
        assert!(!spec.matches(&other, ns::ROSTER));
    }

    #[tokio::test]
    async fn unresolved_requests_resolve_to_empty() {
        // router with no xdb instance at all: the request bounces, the
        // bounce resolves the pending entry as an error → None
        let router = Arc::new(Router::new());
        let cache = XdbCache::new(Arc::clone(&router), "sessions.a.example");
        let caller = Instance::new(
            "sessions.a.example",
            InstanceType::Server,
            vec!["sessions.a.example".to_string()],
        );
        caller.add_handler(cache.handler());
        router.register(caller).unwrap();

        let owner: Jid = "u@a.example".parse().unwrap();
        assert!(cache.get(&owner, ns::ROSTER).await.is_none());
    }
}
