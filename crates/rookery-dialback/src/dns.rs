//! DNS resolution for outgoing server links.
//!
//! Targets are discovered through `_xmpp-server._tcp` SRV records (falling
//! back to the historical `_jabber._tcp`, then plain A/AAAA on port 5269),
//! ordered by SRV priority and weight. The result is an ordered candidate
//! list that the outgoing connection walks until one answers. Resolved
//! lists are cached per remote host.

use std::sync::Arc;

use dashmap::DashMap;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::rr::rdata::SRV;
use hickory_resolver::{ResolveError, Resolver};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default XMPP server-to-server port.
pub const S2S_PORT: u16 = 5269;

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The resolver could not be constructed.
    #[error("failed to create DNS resolver: {0}")]
    ResolverCreation(#[from] ResolveError),

    /// The domain has no usable records.
    #[error("no DNS records found for {0}")]
    NoRecords(String),
}

/// One connection candidate, in walk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Hostname or literal IP.
    pub host: String,
    /// Port.
    pub port: u16,
}

impl Candidate {
    /// A candidate on the default s2s port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

/// Parse a comma-separated candidate list (`host[:port],host[:port]`).
pub fn parse_candidates(list: &str) -> Vec<Candidate> {
    list.split(',')
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.rsplit_once(':') {
            // bare IPv6 literals keep all their colons
            Some((host, port))
                if !port.is_empty()
                    && port.chars().all(|c| c.is_ascii_digit())
                    && !host.contains(':') =>
            {
                Candidate {
                    host: host.to_string(),
                    port: port.parse().unwrap_or(S2S_PORT),
                }
            }
            _ => Candidate {
                host: entry.to_string(),
                port: S2S_PORT,
            },
        })
        .collect()
}

/// Join candidates back into the comma-separated cache form.
pub fn join_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| format!("{}:{}", c.host, c.port))
        .collect::<Vec<_>>()
        .join(",")
}

type TokioResolver = Resolver<TokioConnectionProvider>;

/// Resolver with a per-host candidate cache.
pub struct S2sResolver {
    resolver: Arc<TokioResolver>,
    cache: DashMap<String, String>,
}

impl S2sResolver {
    /// A resolver using the system DNS configuration.
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver: Arc::new(resolver),
            cache: DashMap::new(),
        }
    }

    /// A resolver with explicit configuration.
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self {
            resolver: Arc::new(resolver),
            cache: DashMap::new(),
        }
    }

    /// Cached candidate list for a host, if still present.
    pub fn cached(&self, host: &str) -> Option<Vec<Candidate>> {
        self.cache.get(host).map(|v| parse_candidates(v.value()))
    }

    /// Pre-seed the cache for a host.
    pub fn seed(&self, host: &str, candidates: &str) {
        self.cache.insert(host.to_string(), candidates.to_string());
    }

    /// Drop a host's cached list (after all candidates failed).
    pub fn forget(&self, host: &str) {
        self.cache.remove(host);
    }

    /// Resolve the candidate list for a remote domain.
    #[instrument(skip(self), name = "dialback.dns.resolve")]
    pub async fn resolve(&self, domain: &str) -> Result<Vec<Candidate>, DnsError> {
        if let Some(cached) = self.cached(domain) {
            debug!(domain = %domain, "using cached candidate list");
            return Ok(cached);
        }

        for service in ["_xmpp-server._tcp", "_jabber._tcp"] {
            let name = format!("{}.{}", service, domain);
            match self.resolver.srv_lookup(&name).await {
                Ok(response) => {
                    let mut records: Vec<&SRV> = response.iter().collect();
                    if records.is_empty() {
                        continue;
                    }
                    // priority ascending, weight descending within priority
                    records.sort_by(|a, b| match a.priority().cmp(&b.priority()) {
                        std::cmp::Ordering::Equal => b.weight().cmp(&a.weight()),
                        other => other,
                    });
                    let candidates: Vec<Candidate> = records
                        .iter()
                        .filter_map(|srv| {
                            let target = srv.target().to_utf8();
                            let host = target.trim_end_matches('.');
                            if host.is_empty() || host == "." {
                                return None;
                            }
                            Some(Candidate::new(host, srv.port()))
                        })
                        .collect();
                    if !candidates.is_empty() {
                        self.cache
                            .insert(domain.to_string(), join_candidates(&candidates));
                        return Ok(candidates);
                    }
                }
                Err(e) => {
                    debug!(name = %name, error = %e, "SRV lookup failed");
                }
            }
        }

        // fall back to the domain's address records on the default port
        match self.resolver.lookup_ip(domain).await {
            Ok(response) => {
                let candidates: Vec<Candidate> = response
                    .iter()
                    .map(|ip| Candidate::new(ip.to_string(), S2S_PORT))
                    .collect();
                if candidates.is_empty() {
                    return Err(DnsError::NoRecords(domain.to_string()));
                }
                self.cache
                    .insert(domain.to_string(), join_candidates(&candidates));
                Ok(candidates)
            }
            Err(e) => {
                warn!(domain = %domain, error = %e, "A/AAAA fallback failed");
                Err(DnsError::NoRecords(domain.to_string()))
            }
        }
    }
}

impl Default for S2sResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_lists_round_trip() {
        let parsed = parse_candidates("192.0.2.1:5270,xmpp.example,192.0.2.2");
        assert_eq!(
            parsed,
            vec![
                Candidate::new("192.0.2.1", 5270),
                Candidate::new("xmpp.example", S2S_PORT),
                Candidate::new("192.0.2.2", S2S_PORT),
            ]
        );
        assert_eq!(
            join_candidates(&parsed),
            "192.0.2.1:5270,xmpp.example:5269,192.0.2.2:5269"
        );
    }

    #[test]
    fn empty_entries_are_skipped() {
        assert!(parse_candidates("").is_empty());
        assert_eq!(parse_candidates(",a,").len(), 1);
    }
}
