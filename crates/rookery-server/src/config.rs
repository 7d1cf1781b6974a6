//! Server configuration.
//!
//! The configuration is a single XML document whose children declare
//! instances: `<service id='...'/>` for the session manager and dialback,
//! `<xdb id='...'/>` for storage, `<log id='...'/>` for a log sink.
//! `<host/>` children at the top level list the served domains; `<load/>`
//! inside the session service names the modules to register, in chain
//! order.
//!
//! ```xml
//! <rookery>
//!   <host>a.example</host>
//!   <service id="sessions">
//!     <load><privacy/><roster/><offline/><presence/></load>
//!     <bcc>watcher@a.example</bcc>
//!   </service>
//!   <service id="s2s">
//!     <ip>0.0.0.0</ip><port>5269</port>
//!     <secret>s3cr3t</secret>
//!     <legacy>old.example</legacy>
//!     <idletimeout>600</idletimeout>
//!     <queuetimeout>30</queuetimeout>
//!     <rate time="60" points="30"/>
//!   </service>
//!   <xdb id="storage"><sqlite>rookery.db</sqlite></xdb>
//!   <log id="record"/>
//! </rookery>
//! ```

use anyhow::{bail, Context, Result};
use std::path::Path;

use rookery_mio::RateConfig;
use rookery_xml::{ns, parse_document, Element};

/// The session-manager section.
#[derive(Debug, Clone)]
pub struct JsmSection {
    /// Instance id.
    pub id: String,
    /// Modules to register, in order.
    pub modules: Vec<String>,
    /// Presence BCC addresses.
    pub bcc: Vec<String>,
}

impl Default for JsmSection {
    fn default() -> Self {
        Self {
            id: "sessions".to_string(),
            modules: ["privacy", "roster", "offline", "presence"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bcc: Vec::new(),
        }
    }
}

/// The dialback section.
#[derive(Debug, Clone)]
pub struct S2sSection {
    /// Instance id.
    pub id: String,
    /// Listen address.
    pub ip: String,
    /// Listen port.
    pub port: u16,
    /// Shared secret; generated when absent.
    pub secret: Option<String>,
    /// Remote domains allowed to skip dialback.
    pub legacy: Vec<String>,
    /// Idle stream timeout, seconds.
    pub idle_timeout: i64,
    /// Queued packet timeout, seconds.
    pub queue_timeout: i64,
    /// Accept-rate limit.
    pub rate: Option<RateConfig>,
}

impl Default for S2sSection {
    fn default() -> Self {
        Self {
            id: "s2s".to_string(),
            ip: "0.0.0.0".to_string(),
            port: 5269,
            secret: None,
            legacy: Vec::new(),
            idle_timeout: rookery_dialback::DEFAULT_TIMEOUT_IDLE,
            queue_timeout: rookery_dialback::DEFAULT_TIMEOUT_PACKETS,
            rate: None,
        }
    }
}

/// The storage section.
#[derive(Debug, Clone, Default)]
pub struct XdbSection {
    /// Instance id.
    pub id: String,
    /// Path of the sqlite database; in-memory storage when absent.
    pub sqlite: Option<String>,
}

/// The whole configuration document.
#[derive(Debug, Clone)]
pub struct Config {
    /// Domains this server is authoritative for.
    pub hosts: Vec<String>,
    /// Session manager settings.
    pub jsm: JsmSection,
    /// Dialback settings.
    pub s2s: S2sSection,
    /// Storage settings.
    pub xdb: XdbSection,
    /// Log instance id, when declared.
    pub log: Option<String>,
}

impl Config {
    /// Load and parse a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration {}", path.display()))?;
        Self::from_xml(&text)
    }

    /// Parse a configuration document.
    pub fn from_xml(text: &str) -> Result<Self> {
        let root = parse_document(text).context("configuration is not well-formed XML")?;

        let hosts: Vec<String> = root
            .children()
            .filter(|c| c.name() == "host")
            .map(|h| h.text().trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
        if hosts.is_empty() {
            bail!("configuration declares no <host/>");
        }

        let mut jsm = JsmSection::default();
        let mut s2s = S2sSection::default();
        let mut xdb = XdbSection {
            id: "storage".to_string(),
            sqlite: None,
        };
        let mut log = None;

        for child in root.children() {
            match child.name() {
                "service" => {
                    let id = child.attr("id").unwrap_or_default().to_string();
                    if child.get_child("load", ns::SERVER).is_some()
                        || child.get_child("bcc", ns::SERVER).is_some()
                    {
                        jsm = parse_jsm(child, id);
                    } else {
                        s2s = parse_s2s(child, id);
                    }
                }
                "xdb" => {
                    xdb.id = child.attr("id").unwrap_or("storage").to_string();
                    xdb.sqlite = child
                        .get_child("sqlite", ns::SERVER)
                        .map(|s| s.text().trim().to_string())
                        .filter(|s| !s.is_empty());
                }
                "log" => {
                    log = child.attr("id").map(str::to_string);
                }
                _ => {}
            }
        }

        Ok(Self {
            hosts,
            jsm,
            s2s,
            xdb,
            log,
        })
    }
}

fn parse_jsm(el: &Element, id: String) -> JsmSection {
    let mut section = JsmSection::default();
    if !id.is_empty() {
        section.id = id;
    }
    if let Some(load) = el.get_child("load", ns::SERVER) {
        section.modules = load.children().map(|m| m.name().to_string()).collect();
    }
    section.bcc = el
        .children()
        .filter(|c| c.name() == "bcc")
        .map(|b| b.text().trim().to_string())
        .filter(|b| !b.is_empty())
        .collect();
    section
}

fn parse_s2s(el: &Element, id: String) -> S2sSection {
    let mut section = S2sSection::default();
    if !id.is_empty() {
        section.id = id;
    }
    let text_of = |name: &str| {
        el.get_child(name, ns::SERVER)
            .map(|c| c.text().trim().to_string())
            .filter(|t| !t.is_empty())
    };

    if let Some(ip) = text_of("ip") {
        section.ip = ip;
    }
    if let Some(port) = text_of("port").and_then(|p| p.parse().ok()) {
        section.port = port;
    }
    section.secret = text_of("secret");
    section.legacy = el
        .children()
        .filter(|c| c.name() == "legacy")
        .map(|l| l.text().trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    if let Some(idle) = text_of("idletimeout").and_then(|t| t.parse().ok()) {
        section.idle_timeout = idle;
    }
    if let Some(queue) = text_of("queuetimeout").and_then(|t| t.parse().ok()) {
        section.queue_timeout = queue;
    }
    if let Some(rate) = el.get_child("rate", ns::SERVER) {
        let time = rate.attr("time").and_then(|t| t.parse().ok()).unwrap_or(60);
        let points = rate
            .attr("points")
            .and_then(|p| p.parse().ok())
            .unwrap_or(30);
        section.rate = Some(RateConfig::new(time, points));
    }
    section
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        <rookery>
          <host>a.example</host>
          <host>im.a.example</host>
          <service id="sessions">
            <load><privacy/><roster/><offline/><presence/></load>
            <bcc>watcher@a.example</bcc>
          </service>
          <service id="s2s">
            <ip>127.0.0.1</ip><port>15269</port>
            <secret>hunter2</secret>
            <legacy>old.example</legacy>
            <idletimeout>300</idletimeout>
            <queuetimeout>15</queuetimeout>
            <rate time="60" points="10"/>
          </service>
          <xdb id="storage"><sqlite>rookery.db</sqlite></xdb>
          <log id="record"/>
        </rookery>
    "#;

    #[test]
    fn full_document_parses() {
        let config = Config::from_xml(SAMPLE).unwrap();
        assert_eq!(config.hosts, vec!["a.example", "im.a.example"]);
        assert_eq!(config.jsm.id, "sessions");
        assert_eq!(
            config.jsm.modules,
            vec!["privacy", "roster", "offline", "presence"]
        );
        assert_eq!(config.jsm.bcc, vec!["watcher@a.example"]);
        assert_eq!(config.s2s.port, 15269);
        assert_eq!(config.s2s.secret.as_deref(), Some("hunter2"));
        assert_eq!(config.s2s.legacy, vec!["old.example"]);
        assert_eq!(config.s2s.idle_timeout, 300);
        assert_eq!(config.s2s.queue_timeout, 15);
        assert!(config.s2s.rate.is_some());
        assert_eq!(config.xdb.sqlite.as_deref(), Some("rookery.db"));
        assert_eq!(config.log.as_deref(), Some("record"));
    }

    #[test]
    fn missing_hosts_fail() {
        assert!(Config::from_xml("<rookery/>").is_err());
    }

    #[test]
    fn defaults_cover_missing_sections() {
        let config = Config::from_xml("<rookery><host>x.example</host></rookery>").unwrap();
        assert_eq!(config.s2s.port, 5269);
        assert_eq!(config.s2s.idle_timeout, 600);
        assert_eq!(config.s2s.queue_timeout, 30);
        assert!(config.xdb.sqlite.is_none());
        assert!(config.log.is_none());
    }
}
