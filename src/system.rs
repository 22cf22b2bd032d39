use crate::command::Options;
use chrono::Local;
use log::{info, warn};
use std::env;
use std::fs;

fn read_first_line(path: &str) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
}

fn kernel_version() -> Option<String> {
    if let Ok(out) = std::process::Command::new("uname").args(["-sr"]).output() {
        if let Ok(s) = String::from_utf8(out.stdout) {
            return Some(s.trim().to_string());
        }
    }
    read_first_line("/proc/version")
}

fn hostname() -> Option<String> {
    read_first_line("/proc/sys/kernel/hostname").or_else(|| read_first_line("/etc/hostname"))
}

fn current_user_ids() -> (u32, u32) {
    unsafe { (libc::geteuid(), libc::getegid()) }
}

/// Startup banner. The timezone line matters in the field: hour bucket keys
/// follow the TZ environment variable, and a wrong TZ shows up here first.
pub fn log_startup_info(options: &Options) {
    let app_version = env!("CARGO_PKG_VERSION");
    let (uid, gid) = current_user_ids();
    let host = hostname().unwrap_or_else(|| "unknown".to_string());
    let kver = kernel_version().unwrap_or_else(|| "unknown".to_string());

    info!("netsentinel v{} started", app_version);
    info!("Host: {} (uid={}, gid={})", host, uid, gid);
    info!("Kernel: {}", kver);
    info!("OS: {} ({})", env::consts::OS, env::consts::ARCH);
    match env::var("TZ") {
        Ok(tz) => info!("TZ environment variable: {}", tz),
        Err(_) => info!("TZ not set; using system default timezone"),
    }
    info!(
        "Current local time: {}",
        Local::now().format("%Y-%m-%d %H:%M:%S %Z")
    );
    info!("Interface: {}", options.iface());
    info!("Web port: {}", options.port());
    info!("DB path: {}", options.db_path());
    info!("Save interval: {}s", options.save_interval());
    if options.exclude_ipv6_prefix().is_empty() {
        info!("IPv6 LAN filter: auto (GUA /56 derivation)");
    } else {
        info!("IPv6 LAN filter: manual ({})", options.exclude_ipv6_prefix());
    }
    if uid != 0 {
        warn!("Not running as root; raw capture needs CAP_NET_RAW or simulation mode will be used");
    }
}
