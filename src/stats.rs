// In-memory traffic accounting. One mutex guards the hourly map, the
// per-remote counter, and the realtime sample ring; every critical section
// is a handful of integer updates so the capture hot path never waits long.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Realtime samples older than this are dropped from the ring.
pub const REALTIME_WINDOW_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HourCounter {
    pub up: u64,
    pub down: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RealtimeSample {
    pub ts: u64,
    pub up: u64,
    pub down: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpUsage {
    pub ip: String,
    pub bytes: u64,
}

#[derive(Default)]
struct Inner {
    hourly: HashMap<String, HourCounter>,
    ip_counter: HashMap<String, u64>,
    current_up: u64,
    current_down: u64,
    samples: VecDeque<RealtimeSample>,
}

pub struct TrafficStats {
    inner: Mutex<Inner>,
}

pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Hour bucket key in the host's local timezone: `YYYY-MM-DD HH:00:00`.
pub fn hour_key(ts: f64) -> String {
    let ts = if ts.is_finite() && ts >= 0.0 { ts } else { 0.0 };
    let dt: DateTime<Local> = (UNIX_EPOCH + Duration::from_secs_f64(ts)).into();
    dt.format("%Y-%m-%d %H:00:00").to_string()
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record one counted packet. The hourly bucket, the current-second
    /// accumulator, and the per-remote counter move together under the
    /// mutex, so a reader never observes a partial update.
    pub fn add_bytes(&self, direction: Direction, size: u64, remote_ip: &str, ts: f64) {
        let key = hour_key(ts);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let bucket = inner.hourly.entry(key).or_default();
        match direction {
            Direction::Up => {
                bucket.up += size;
                inner.current_up += size;
            }
            Direction::Down => {
                bucket.down += size;
                inner.current_down += size;
            }
        }
        // Avoid a key allocation on the hot path for already-seen peers
        if let Some(total) = inner.ip_counter.get_mut(remote_ip) {
            *total += size;
        } else {
            inner.ip_counter.insert(remote_ip.to_string(), size);
        }
    }

    /// 1 Hz rotation: snapshot and zero the current-second pair, append it
    /// to the ring, drop samples past the window.
    pub fn tick(&self) {
        self.tick_at(unix_now());
    }

    fn tick_at(&self, now: f64) {
        let ts = now as u64;
        let mut inner = self.inner.lock().unwrap();
        let sample = RealtimeSample {
            ts,
            up: inner.current_up,
            down: inner.current_down,
        };
        inner.current_up = 0;
        inner.current_down = 0;
        inner.samples.push_back(sample);
        let cutoff = ts.saturating_sub(REALTIME_WINDOW_SECS);
        while inner.samples.front().is_some_and(|s| s.ts <= cutoff) {
            inner.samples.pop_front();
        }
    }

    /// Swap the hourly map out and return it; the sole operation that
    /// removes hourly entries. Counts added after the swap land in the
    /// fresh map.
    pub fn drain_hourly(&self) -> HashMap<String, HourCounter> {
        let mut inner = self.inner.lock().unwrap();
        std::mem::take(&mut inner.hourly)
    }

    /// Non-draining copy of the hourly increments still in memory.
    pub fn snapshot_hourly(&self) -> HashMap<String, HourCounter> {
        self.inner.lock().unwrap().hourly.clone()
    }

    /// Samples from the last `seconds` (capped at the ring window), oldest
    /// first.
    pub fn realtime(&self, seconds: u64) -> Vec<RealtimeSample> {
        let seconds = seconds.min(REALTIME_WINDOW_SECS);
        let cutoff = (unix_now() as u64).saturating_sub(seconds);
        let inner = self.inner.lock().unwrap();
        inner
            .samples
            .iter()
            .filter(|s| s.ts > cutoff)
            .copied()
            .collect()
    }

    /// Heaviest remote peers since process start, descending.
    pub fn top_ips(&self, n: usize) -> Vec<IpUsage> {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<IpUsage> = inner
            .ip_counter
            .iter()
            .map(|(ip, bytes)| IpUsage {
                ip: ip.clone(),
                bytes: *bytes,
            })
            .collect();
        drop(inner);
        entries.sort_by(|a, b| b.bytes.cmp(&a.bytes));
        entries.truncate(n);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Timelike};

    #[test]
    fn test_drain_returns_counts_and_keeps_ip_counter() {
        let stats = TrafficStats::new();
        let t0 = unix_now();
        stats.add_bytes(Direction::Up, 100, "1.1.1.1", t0);
        stats.add_bytes(Direction::Down, 200, "1.1.1.1", t0);

        let drained = stats.drain_hourly();
        assert_eq!(drained.len(), 1);
        let counter = drained.values().next().unwrap();
        assert_eq!(counter.up, 100);
        assert_eq!(counter.down, 200);

        assert!(stats.drain_hourly().is_empty());

        let top = stats.top_ips(10);
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].ip, "1.1.1.1");
        assert_eq!(top[0].bytes, 300);
    }

    #[test]
    fn test_hour_bucket_stable_within_hour() {
        let hour_start = Local::now()
            .with_minute(0)
            .unwrap()
            .with_second(0)
            .unwrap()
            .with_nanosecond(0)
            .unwrap();
        let base = hour_start.timestamp() as f64;

        assert_eq!(hour_key(base + 10.0), hour_key(base + 3500.0));

        let next = hour_start + ChronoDuration::hours(1);
        assert_eq!(hour_key(base + 3600.0), next.format("%Y-%m-%d %H:00:00").to_string());
        assert_ne!(hour_key(base + 10.0), hour_key(base + 3600.0));
    }

    #[test]
    fn test_hour_key_format() {
        let key = hour_key(unix_now());
        assert_eq!(key.len(), 19);
        assert!(key.ends_with(":00:00"));
    }

    #[test]
    fn test_tick_rotates_and_trims_ring() {
        let stats = TrafficStats::new();
        let now = unix_now();

        stats.add_bytes(Direction::Up, 40, "8.8.8.8", now);
        stats.add_bytes(Direction::Down, 60, "8.8.8.8", now);
        stats.tick_at(now);

        // A full ring plus samples old enough to be evicted
        for age in 1..=150u64 {
            let ts = now - age as f64;
            let mut inner = stats.inner.lock().unwrap();
            inner.samples.push_front(RealtimeSample { ts: ts as u64, up: 1, down: 1 });
        }
        stats.tick_at(now + 1.0);

        let window = stats.realtime(60);
        assert!(window.len() <= 61);
        let cutoff = (unix_now() as u64) - 60;
        assert!(window.iter().all(|s| s.ts > cutoff));

        // The first rotation captured the pending bytes and reset them
        let all = stats.realtime(REALTIME_WINDOW_SECS);
        let captured = all.iter().find(|s| s.up == 40).unwrap();
        assert_eq!(captured.down, 60);
        let last = all.last().unwrap();
        assert_eq!(last.up, 0);
        assert_eq!(last.down, 0);
    }

    #[test]
    fn test_realtime_caps_requested_window() {
        let stats = TrafficStats::new();
        let now = unix_now();
        {
            let mut inner = stats.inner.lock().unwrap();
            for age in 0..10u64 {
                inner.samples.push_front(RealtimeSample {
                    ts: now as u64 - age,
                    up: age,
                    down: 0,
                });
            }
        }
        // Requests beyond the ring window behave like the full window
        assert_eq!(
            stats.realtime(10_000).len(),
            stats.realtime(REALTIME_WINDOW_SECS).len()
        );
    }

    #[test]
    fn test_top_ips_sorted_desc() {
        let stats = TrafficStats::new();
        let now = unix_now();
        stats.add_bytes(Direction::Down, 10, "1.1.1.1", now);
        stats.add_bytes(Direction::Down, 30, "8.8.8.8", now);
        stats.add_bytes(Direction::Up, 20, "9.9.9.9", now);

        let top = stats.top_ips(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].ip, "8.8.8.8");
        assert_eq!(top[1].ip, "9.9.9.9");
    }
}
