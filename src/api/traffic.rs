// History endpoints backed by the SQLite store, with the not-yet-persisted
// in-memory hourly increments overlaid so totals never appear to step
// backwards between persistence ticks.

use super::{HttpRequest, HttpResponse};
use crate::stats::TrafficStats;
use crate::storage::{self, Granularity, SeriesRow, TrafficTotals};
use crate::utils::format_utils::format_bytes;
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct SummaryStat {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub total_bytes: u64,
    pub up_fmt: String,
    pub down_fmt: String,
    pub total_fmt: String,
}

impl SummaryStat {
    fn new(db: TrafficTotals, mem_up: u64, mem_down: u64) -> Self {
        let up = db.up_bytes + mem_up;
        let down = db.down_bytes + mem_down;
        Self {
            up_bytes: up,
            down_bytes: down,
            total_bytes: up + down,
            up_fmt: format_bytes(up),
            down_fmt: format_bytes(down),
            total_fmt: format_bytes(up + down),
        }
    }
}

#[derive(Serialize)]
struct SummaryResponse {
    today: SummaryStat,
    month: SummaryStat,
    year: SummaryStat,
}

#[derive(Serialize)]
struct QueryResponse {
    summary: SummaryStat,
    series: Vec<SeriesRow>,
}

#[derive(Serialize)]
struct DaysResponse {
    days: Vec<storage::DayRow>,
}

#[derive(Serialize)]
struct MonthsResponse {
    months: Vec<storage::MonthRow>,
}

#[derive(Serialize)]
struct HoursResponse {
    hours: Vec<storage::TodayHourRow>,
}

#[derive(Serialize)]
struct DateRangeResponse {
    min: String,
    max: String,
}

#[derive(Clone)]
pub struct TrafficApiHandler {
    db_path: String,
    stats: Arc<TrafficStats>,
}

impl TrafficApiHandler {
    pub fn new(db_path: String, stats: Arc<TrafficStats>) -> Self {
        Self { db_path, stats }
    }

    pub fn supported_routes(&self) -> Vec<&'static str> {
        vec![
            "/api/summary",
            "/api/query",
            "/api/history/30days",
            "/api/history/12months",
            "/api/history/today_hours",
            "/api/date_range",
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
            "/api/summary" => self.handle_summary(),
            "/api/query" => self.handle_query(request),
            "/api/history/30days" => self.handle_history_30days(),
            "/api/history/12months" => self.handle_history_12months(),
            "/api/history/today_hours" => self.handle_today_hours(),
            "/api/date_range" => self.handle_date_range(),
            _ => Ok(HttpResponse::not_found()),
        }
    }

    /// Sum of in-memory hourly increments whose hour key starts with
    /// `prefix` (a day, month, or year string).
    fn memory_increments(&self, prefix: &str) -> (u64, u64) {
        let mut up = 0u64;
        let mut down = 0u64;
        for (key, counter) in self.stats.snapshot_hourly() {
            if key.starts_with(prefix) {
                up += counter.up;
                down += counter.down;
            }
        }
        (up, down)
    }

    fn handle_summary(&self) -> Result<HttpResponse, anyhow::Error> {
        let now = Local::now();
        let today_str = now.format("%Y-%m-%d").to_string();
        let month_str = now.format("%Y-%m").to_string();
        let year_str = now.format("%Y").to_string();

        let today_db = storage::day_stats(&self.db_path, &today_str)?;
        let month_db = storage::month_stats(&self.db_path, &month_str)?;
        let year_db = storage::year_stats(&self.db_path, &year_str)?;

        let (t_up, t_down) = self.memory_increments(&today_str);
        let (m_up, m_down) = self.memory_increments(&month_str);
        let (y_up, y_down) = self.memory_increments(&year_str);

        Ok(HttpResponse::json(&SummaryResponse {
            today: SummaryStat::new(today_db, t_up, t_down),
            month: SummaryStat::new(month_db, m_up, m_down),
            year: SummaryStat::new(year_db, y_up, y_down),
        }))
    }

    fn handle_query(&self, request: &HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let start = request.query("start").unwrap_or("");
        let end = request.query("end").unwrap_or("");
        if start.is_empty() || end.is_empty() {
            return Ok(HttpResponse::bad_request("start and end are required"));
        }
        if NaiveDate::parse_from_str(start, "%Y-%m-%d").is_err()
            || NaiveDate::parse_from_str(end, "%Y-%m-%d").is_err()
        {
            return Ok(HttpResponse::bad_request(
                "Invalid date format, use YYYY-MM-DD",
            ));
        }
        let granularity = Granularity::parse(request.query("granularity").unwrap_or("day"));

        let mut result = storage::query_range(&self.db_path, start, end, granularity)?;

        // The store only sees drained counts; when the range covers today,
        // fold the pending memory increments into today's day row.
        let today_str = Local::now().format("%Y-%m-%d").to_string();
        let mut mem_up = 0u64;
        let mut mem_down = 0u64;
        if granularity == Granularity::Day && start <= today_str.as_str() && today_str.as_str() <= end
        {
            let (u, d) = self.memory_increments(&today_str);
            mem_up = u;
            mem_down = d;
            if mem_up > 0 || mem_down > 0 {
                for row in result.series.iter_mut() {
                    if let SeriesRow::Day(day_row) = row {
                        if day_row.day == today_str {
                            day_row.up_bytes += mem_up;
                            day_row.down_bytes += mem_down;
                            day_row.total_bytes = day_row.up_bytes + day_row.down_bytes;
                            break;
                        }
                    }
                }
            }
        }

        Ok(HttpResponse::json(&QueryResponse {
            summary: SummaryStat::new(result.summary, mem_up, mem_down),
            series: result.series,
        }))
    }

    fn handle_history_30days(&self) -> Result<HttpResponse, anyhow::Error> {
        let days = storage::last_30days(&self.db_path)?;
        Ok(HttpResponse::json(&DaysResponse { days }))
    }

    fn handle_history_12months(&self) -> Result<HttpResponse, anyhow::Error> {
        let months = storage::last_12months(&self.db_path)?;
        Ok(HttpResponse::json(&MonthsResponse { months }))
    }

    fn handle_today_hours(&self) -> Result<HttpResponse, anyhow::Error> {
        let hours = storage::hourly_today(&self.db_path)?;
        Ok(HttpResponse::json(&HoursResponse { hours }))
    }

    fn handle_date_range(&self) -> Result<HttpResponse, anyhow::Error> {
        let (min, max) = storage::available_date_range(&self.db_path)?;
        Ok(HttpResponse::json(&DateRangeResponse { min, max }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Direction;
    use std::collections::HashMap;

    fn temp_db(name: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "netsentinel_api_{}_{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path.to_string_lossy().into_owned()
    }

    fn get(path: &str, params: &[(&str, &str)]) -> HttpRequest {
        HttpRequest {
            method: "GET".to_string(),
            path: path.to_string(),
            query_params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_query_validates_input() {
        let db = temp_db("validate");
        storage::ensure_schema(&db).unwrap();
        let handler = TrafficApiHandler::new(db, Arc::new(TrafficStats::new()));

        let resp = handler
            .handle_request(&get("/api/query", &[]))
            .await
            .unwrap();
        assert_eq!(resp.status, 400);

        let resp = handler
            .handle_request(&get("/api/query", &[("start", "junk"), ("end", "2024-06-30")]))
            .await
            .unwrap();
        assert_eq!(resp.status, 400);

        let resp = handler
            .handle_request(&get(
                "/api/query",
                &[("start", "2024-06-01"), ("end", "2024-06-02")],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn test_query_overlays_memory_increments_on_today() {
        let db = temp_db("overlay");
        storage::ensure_schema(&db).unwrap();

        let stats = Arc::new(TrafficStats::new());
        stats.add_bytes(Direction::Up, 111, "8.8.8.8", crate::stats::unix_now());

        let today = Local::now().format("%Y-%m-%d").to_string();
        let mut persisted = HashMap::new();
        persisted.insert(
            format!("{} 00:00:00", today),
            crate::stats::HourCounter { up: 1000, down: 2000 },
        );
        storage::commit_stats(&db, &persisted).unwrap();

        let handler = TrafficApiHandler::new(db, stats);
        let resp = handler
            .handle_request(&get(
                "/api/query",
                &[("start", today.as_str()), ("end", today.as_str())],
            ))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);

        let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(body["summary"]["up_bytes"], 1111);
        assert_eq!(body["summary"]["down_bytes"], 2000);
        assert_eq!(body["series"][0]["up_bytes"], 1111);
        assert_eq!(body["series"][0]["total_bytes"], 3111);
    }

    #[tokio::test]
    async fn test_summary_includes_memory_only_traffic() {
        let db = temp_db("summary");
        storage::ensure_schema(&db).unwrap();

        let stats = Arc::new(TrafficStats::new());
        stats.add_bytes(Direction::Down, 4096, "1.1.1.1", crate::stats::unix_now());

        let handler = TrafficApiHandler::new(db, stats);
        let resp = handler
            .handle_request(&get("/api/summary", &[]))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);

        let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(body["today"]["down_bytes"], 4096);
        assert_eq!(body["today"]["down_fmt"], "4.00 KB");
        assert_eq!(body["month"]["down_bytes"], 4096);
        assert_eq!(body["year"]["total_bytes"], 4096);
    }

    #[tokio::test]
    async fn test_non_get_rejected() {
        let db = temp_db("methods");
        storage::ensure_schema(&db).unwrap();
        let handler = TrafficApiHandler::new(db, Arc::new(TrafficStats::new()));

        let mut req = get("/api/summary", &[]);
        req.method = "POST".to_string();
        let resp = handler.handle_request(&req).await.unwrap();
        assert_eq!(resp.status, 405);
    }
}
