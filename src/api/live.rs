// Capture-side endpoints: realtime rates, heaviest remote peers, health,
// and the classifier diagnostics used to verify direction decisions in the
// field.

use super::{HttpRequest, HttpResponse};
use crate::classifier::{Classifier, LocalIpsDiag};
use crate::stats::{RealtimeSample, TrafficStats};
use crate::utils::format_utils::format_bytes;
use chrono::Local;
use serde::Serialize;
use std::sync::Arc;

/// The dashboard sparkline only needs the most recent points.
const REALTIME_SAMPLE_LIMIT: usize = 30;

#[derive(Serialize)]
struct RealtimeResponse {
    samples: Vec<RealtimeSample>,
    current_up_bps: u64,
    current_down_bps: u64,
    #[serde(rename = "current_up_Bps")]
    current_up_bytes: u64,
    #[serde(rename = "current_down_Bps")]
    current_down_bytes: u64,
}

#[derive(Serialize)]
struct TopIpEntry {
    ip: String,
    bytes: u64,
    bytes_fmt: String,
}

#[derive(Serialize)]
struct TopIpsResponse {
    top_ips: Vec<TopIpEntry>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ts: String,
}

#[derive(Serialize)]
struct LanFilterInfo {
    mode: &'static str,
    prefixes: Vec<String>,
}

#[derive(Serialize)]
struct LocalIpsResponse {
    iface: String,
    ipv4: Vec<String>,
    ipv6: Vec<String>,
    total: usize,
    ipv6_lan_filter: LanFilterInfo,
}

#[derive(Clone)]
pub struct LiveApiHandler {
    stats: Arc<TrafficStats>,
    classifier: Arc<Classifier>,
    iface: String,
}

impl LiveApiHandler {
    pub fn new(stats: Arc<TrafficStats>, classifier: Arc<Classifier>, iface: String) -> Self {
        Self {
            stats,
            classifier,
            iface,
        }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        vec![
            "/api/realtime",
            "/api/top_ips",
            "/api/health",
            "/api/debug/local_ips",
        ]
    }

    pub async fn handle_request(
        &self,
        request: &HttpRequest,
    ) -> Result<HttpResponse, anyhow::Error> {
        if request.method != "GET" {
            return Ok(HttpResponse::method_not_allowed());
        }
        match request.path.as_str() {
            "/api/realtime" => Ok(self.handle_realtime()),
            "/api/top_ips" => Ok(self.handle_top_ips()),
            "/api/health" => Ok(HttpResponse::json(&HealthResponse {
                status: "ok",
                ts: Local::now().to_rfc3339(),
            })),
            "/api/debug/local_ips" => Ok(self.handle_local_ips()),
            _ => Ok(HttpResponse::not_found()),
        }
    }

    fn handle_realtime(&self) -> HttpResponse {
        let samples = self.stats.realtime(60);
        let (cur_up, cur_down) = samples
            .last()
            .map(|s| (s.up, s.down))
            .unwrap_or((0, 0));
        let tail = samples.len().saturating_sub(REALTIME_SAMPLE_LIMIT);
        HttpResponse::json(&RealtimeResponse {
            samples: samples[tail..].to_vec(),
            current_up_bps: cur_up * 8,
            current_down_bps: cur_down * 8,
            current_up_bytes: cur_up,
            current_down_bytes: cur_down,
        })
    }

    fn handle_top_ips(&self) -> HttpResponse {
        let top_ips = self
            .stats
            .top_ips(10)
            .into_iter()
            .map(|usage| TopIpEntry {
                bytes_fmt: format_bytes(usage.bytes),
                ip: usage.ip,
                bytes: usage.bytes,
            })
            .collect();
        HttpResponse::json(&TopIpsResponse { top_ips })
    }

    fn handle_local_ips(&self) -> HttpResponse {
        let LocalIpsDiag {
            ipv4,
            ipv6,
            lan_prefixes,
            mode,
        } = self.classifier.diagnostics();
        HttpResponse::json(&LocalIpsResponse {
            iface: self.iface.clone(),
            total: ipv4.len() + ipv6.len(),
            ipv4,
            ipv6,
            ipv6_lan_filter: LanFilterInfo {
                mode,
                prefixes: lan_prefixes,
            },
        })
    }
}
