use crate::api::{live::LiveApiHandler, traffic::TrafficApiHandler, ApiHandler, ApiRouter};
use crate::capture::Capture;
use crate::classifier::{Classifier, Ipv6Net};
use crate::inspector::refresh_classifier;
use crate::stats::TrafficStats;
use crate::storage;
use crate::system::log_startup_info;
use crate::web;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::interval;

/// Base tick of the address refresh task.
const LOCAL_IP_REFRESH_INTERVAL: u64 = 600;
/// Every sixth refresh tick re-derives the GUA /56 prefixes even when the
/// address set looks unchanged; ISP reconnects can move the delegation.
const GUA_REFRESH_EVERY_N_TICKS: u64 = 6;

#[derive(Debug, Parser)]
#[clap(name = "netsentinel")]
#[clap(version = env!("CARGO_PKG_VERSION"))]
#[clap(about = "Passive WAN traffic metering for a NAS uplink interface")]
pub struct Opt {
    #[clap(
        long,
        env = "MONITOR_IFACE",
        default_value = "eth0",
        help = "Network interface to monitor"
    )]
    pub iface: String,

    #[clap(
        long,
        env = "WEB_PORT",
        default_value = "8080",
        help = "Web server listening port"
    )]
    pub port: u16,

    #[clap(
        long,
        env = "DB_PATH",
        default_value = "/data/traffic.db",
        help = "SQLite database path"
    )]
    pub db_path: String,

    #[clap(
        long,
        env = "SAVE_INTERVAL",
        default_value = "300",
        help = "Seconds between persistence flushes"
    )]
    pub save_interval: u64,

    #[clap(
        long,
        env = "EXCLUDE_IPV6_PREFIX",
        default_value = "",
        help = "Comma-separated IPv6 CIDR list; when set, the LAN filter is pinned to these prefixes"
    )]
    pub exclude_ipv6_prefix: String,

    #[clap(long, help = "Enable web request logging (per-HTTP-request line)")]
    pub web_log: bool,
}

#[derive(Clone)]
pub struct Options {
    iface: String,
    port: u16,
    db_path: String,
    save_interval: u64,
    exclude_ipv6_prefix: String,
    web_log: bool,
}

impl Options {
    pub fn iface(&self) -> &str {
        &self.iface
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn db_path(&self) -> &str {
        &self.db_path
    }
    pub fn save_interval(&self) -> u64 {
        self.save_interval
    }
    pub fn exclude_ipv6_prefix(&self) -> &str {
        &self.exclude_ipv6_prefix
    }
    pub fn web_log(&self) -> bool {
        self.web_log
    }
}

impl From<Opt> for Options {
    fn from(opt: Opt) -> Self {
        Self {
            iface: opt.iface,
            port: opt.port,
            db_path: opt.db_path,
            save_interval: opt.save_interval.max(1),
            exclude_ipv6_prefix: opt.exclude_ipv6_prefix,
            web_log: opt.web_log,
        }
    }
}

/// Parse the manual exclusion list; invalid entries are skipped with a
/// warning, a fully-empty result leaves the classifier in auto mode.
fn parse_manual_prefixes(raw: &str) -> Vec<Ipv6Net> {
    let mut nets = Vec::new();
    for prefix in raw.split(',') {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            continue;
        }
        match Ipv6Net::parse(prefix) {
            Ok(net) => {
                info!("Manual LAN exclusion prefix: {}", net);
                nets.push(net);
            }
            Err(e) => warn!("Invalid IPv6 prefix '{}': {}", prefix, e),
        }
    }
    nets
}

pub async fn run(opt: Opt) -> Result<(), anyhow::Error> {
    env_logger::Builder::new()
        .filter(None, LevelFilter::Info)
        .target(env_logger::Target::Stdout)
        .init();

    let options = Options::from(opt);
    log_startup_info(&options);

    storage::ensure_schema(options.db_path())?;

    let classifier = Arc::new(Classifier::new(parse_manual_prefixes(
        options.exclude_ipv6_prefix(),
    )));
    // First inspection happens before capture starts, so the very first
    // packets already see the host's addresses.
    refresh_classifier(&classifier, options.iface(), true);

    let stats = Arc::new(TrafficStats::new());
    let running = Arc::new(AtomicBool::new(true));
    let shutdown_notify = Arc::new(tokio::sync::Notify::new());

    {
        let running = Arc::clone(&running);
        let shutdown_notify = Arc::clone(&shutdown_notify);
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Exiting...");
                running.store(false, Ordering::Relaxed);
                shutdown_notify.notify_waiters();
            }
        });
    }

    // Capture runs on its own OS thread: the hot path must never contend
    // with the async runtime for a worker.
    let capture = Capture::new(
        options.iface().to_string(),
        Arc::clone(&classifier),
        Arc::clone(&stats),
        Arc::clone(&running),
    );
    let capture_handle = std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || capture.run())?;
    info!("Packet capture thread started");

    // 1 Hz realtime sample rotation
    {
        let stats = Arc::clone(&stats);
        let running = Arc::clone(&running);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            ticker.tick().await;
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                stats.tick();
            }
        });
    }

    // Address refresh
    {
        let classifier = Arc::clone(&classifier);
        let running = Arc::clone(&running);
        let iface = options.iface().to_string();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(LOCAL_IP_REFRESH_INTERVAL));
            ticker.tick().await;
            let mut ticks: u64 = 0;
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                ticks += 1;
                let force = ticks % GUA_REFRESH_EVERY_N_TICKS == 0;
                refresh_classifier(&classifier, &iface, force);
            }
        });
    }

    // Persistence: drain the hourly map and upsert it. A failed round is
    // logged and skipped; the drained counts for that round are gone.
    {
        let stats = Arc::clone(&stats);
        let running = Arc::clone(&running);
        let db_path = options.db_path().to_string();
        let save_interval = options.save_interval();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(save_interval));
            ticker.tick().await;
            while running.load(Ordering::Relaxed) {
                ticker.tick().await;
                let drained = stats.drain_hourly();
                if drained.is_empty() {
                    continue;
                }
                match storage::commit_stats(&db_path, &drained) {
                    Ok(()) => info!("Stats flushed to DB: {} records", drained.len()),
                    Err(e) => error!("Persistence error: {}", e),
                }
            }
        });
    }
    info!(
        "Persistence task started (interval={}s)",
        options.save_interval()
    );

    let mut api_router = ApiRouter::new();
    api_router.register_handler(ApiHandler::Traffic(TrafficApiHandler::new(
        options.db_path().to_string(),
        Arc::clone(&stats),
    )));
    api_router.register_handler(ApiHandler::Live(LiveApiHandler::new(
        Arc::clone(&stats),
        Arc::clone(&classifier),
        options.iface().to_string(),
    )));

    web::start_server(
        options.port(),
        api_router,
        options.web_log(),
        Arc::clone(&shutdown_notify),
    )
    .await?;

    // Web server only returns on shutdown; the capture thread notices the
    // flag within one recv timeout.
    running.store(false, Ordering::Relaxed);
    if capture_handle.join().is_err() {
        warn!("Capture thread terminated abnormally");
    }

    Ok(())
}
