//! rookeryd: wire the bus, storage, session manager and dialback.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use rookery_bus::{
    Handler, HandlerResult, Instance, InstanceType, MemoryXdb, Packet, Router, XdbBackend,
    XdbCache, XdbInstanceHandler,
};
use rookery_dialback::{Dialback, DialbackConfig};
use rookery_jsm::modules::{
    groups::GroupsConfig, offline::OfflineConfig, GroupsModule, OfflineModule, PresenceModule,
    PrivacyModule, RosterModule,
};
use rookery_jsm::{Jsm, JsmConfig};
use rookery_xdb_sql::SqlXdb;

mod config;
mod telemetry;

use config::Config;

/// The rookery XMPP server.
#[derive(Debug, Parser)]
#[command(name = "rookeryd", version, about)]
struct Args {
    /// Path to the XML configuration file.
    #[arg(short, long, default_value = "rookery.xml")]
    config: PathBuf,

    /// Stay attached to the terminal (the only supported mode).
    #[arg(long, default_value_t = true)]
    foreground: bool,

    /// Log filter, overriding RUST_LOG (e.g. `info,rookery_jsm=debug`).
    #[arg(long)]
    log: Option<String>,
}

/// A log-type instance: log packets become structured log records.
struct LogSink;

#[async_trait]
impl Handler for LogSink {
    async fn handle(&self, packet: Packet) -> HandlerResult {
        info!(
            host = %packet.host(),
            kind = packet.element.attr("type").unwrap_or("notice"),
            record = %packet.element.text(),
            "log"
        );
        HandlerResult::Done
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init(args.log.as_deref())?;

    info!("rookery starting");
    info!("version: {}", env!("CARGO_PKG_VERSION"));
    if !args.foreground {
        warn!("daemon mode is not available; staying in the foreground");
    }

    let config = Config::load(&args.config)?;
    info!(hosts = ?config.hosts, "configuration loaded");

    let router = Arc::new(Router::new());

    // storage backend behind the xdb facade
    let backend: Arc<dyn XdbBackend> = match &config.xdb.sqlite {
        Some(path) => {
            info!(path = %path, "using sqlite storage");
            let url = format!("sqlite://{}?mode=rwc", path);
            SqlXdb::open(&url)
                .await
                .map_err(|e| anyhow::anyhow!("opening storage: {}", e))?
        }
        None => {
            warn!("no <sqlite/> configured, storage is in-memory only");
            Arc::new(MemoryXdb::new())
        }
    };
    let storage = Instance::new(config.xdb.id.clone(), InstanceType::Xdb, vec!["*".to_string()]);
    storage.add_handler(XdbInstanceHandler::new(backend, Arc::clone(&router)));
    router
        .register(storage)
        .context("registering the storage instance")?;

    // the log sink, when declared
    if let Some(log_id) = &config.log {
        let log = Instance::new(log_id.clone(), InstanceType::Log, vec!["*".to_string()]);
        log.add_handler(Arc::new(LogSink));
        router.register(log).context("registering the log instance")?;
    }

    // the session manager and its modules, in configured order
    let jsm_config = JsmConfig {
        instance_id: config.jsm.id.clone(),
        hosts: config.hosts.clone(),
        server_name: "rookery".to_string(),
    };
    let xdb = XdbCache::new(Arc::clone(&router), jsm_config.instance_id.clone());
    let jsm = Jsm::new(jsm_config, Arc::clone(&router), xdb);
    for module in &config.jsm.modules {
        match module.as_str() {
            "privacy" => jsm.register_module(PrivacyModule::new()),
            "roster" => jsm.register_module(RosterModule::new()),
            "offline" => jsm.register_module(OfflineModule::new(OfflineConfig::default())),
            "presence" => jsm.register_module(PresenceModule::new(config.jsm.bcc.clone())),
            "groups" => jsm.register_module(GroupsModule::new(GroupsConfig::default())),
            other => warn!(module = %other, "unknown module in <load/>, skipping"),
        }
    }
    jsm.start().context("registering the session manager")?;

    // dialback: wildcard route for everything non-local
    let s2s_listener = TcpListener::bind((config.s2s.ip.as_str(), config.s2s.port))
        .await
        .with_context(|| format!("binding s2s on {}:{}", config.s2s.ip, config.s2s.port))?;
    info!(addr = %s2s_listener.local_addr()?, "s2s listener up");

    let dialback = Dialback::new(
        DialbackConfig {
            instance_id: config.s2s.id.clone(),
            local_domains: config.hosts.clone(),
            secret: config.s2s.secret.clone(),
            legacy_peers: config.s2s.legacy.clone(),
            timeout_idle: config.s2s.idle_timeout,
            timeout_packets: config.s2s.queue_timeout,
            karma: rookery_mio::Karma::default(),
            accept_rate: config.s2s.rate,
        },
        Arc::clone(&router),
    );
    dialback
        .start(s2s_listener)
        .context("registering the dialback instance")?;

    info!("rookery running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    jsm.shutdown().await;

    Ok(())
}
