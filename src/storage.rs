// SQLite persistence. Hourly rows are the single source of truth; the daily
// and monthly views aggregate over the hour-key text. Writes happen only in
// the persistence tick, readers are the HTTP handlers; WAL mode lets both
// run concurrently.

use crate::stats::HourCounter;
use anyhow::Context;
use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS traffic_hourly (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    hour_ts    TEXT NOT NULL UNIQUE,
    up_bytes   INTEGER NOT NULL DEFAULT 0,
    down_bytes INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,
    updated_at TEXT
);

CREATE VIEW IF NOT EXISTS traffic_daily AS
SELECT
    substr(hour_ts, 1, 10)     AS day,
    SUM(up_bytes)              AS up_bytes,
    SUM(down_bytes)            AS down_bytes,
    SUM(up_bytes + down_bytes) AS total_bytes
FROM traffic_hourly
GROUP BY substr(hour_ts, 1, 10);

CREATE VIEW IF NOT EXISTS traffic_monthly AS
SELECT
    substr(hour_ts, 1, 7)      AS month,
    SUM(up_bytes)              AS up_bytes,
    SUM(down_bytes)            AS down_bytes,
    SUM(up_bytes + down_bytes) AS total_bytes
FROM traffic_hourly
GROUP BY substr(hour_ts, 1, 7);

CREATE INDEX IF NOT EXISTS idx_hourly_hour_ts ON traffic_hourly(hour_ts);
";

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TrafficTotals {
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayRow {
    pub day: String,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthRow {
    pub month: String,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourRow {
    pub hour_ts: String,
    pub up_bytes: u64,
    pub down_bytes: u64,
    pub total_bytes: u64,
}

/// Today's per-hour rows carry no derived total; the dashboard stacks the
/// two directions itself.
#[derive(Debug, Clone, Serialize)]
pub struct TodayHourRow {
    pub hour_ts: String,
    pub up_bytes: u64,
    pub down_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SeriesRow {
    Hour(HourRow),
    Day(DayRow),
    Month(MonthRow),
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeResult {
    pub summary: TrafficTotals,
    pub series: Vec<SeriesRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    /// Unknown values fall back to daily granularity.
    pub fn parse(s: &str) -> Self {
        match s {
            "hour" => Granularity::Hour,
            "month" => Granularity::Month,
            _ => Granularity::Day,
        }
    }
}

fn open(db_path: &str) -> Result<Connection, anyhow::Error> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create data directory for {}", db_path))?;
        }
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("failed to open SQLite DB at {}", db_path))?;
    conn.busy_timeout(Duration::from_secs(10))?;
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.execute_batch("PRAGMA synchronous=NORMAL")?;
    Ok(conn)
}

/// Local wall-clock time in the SQLite datetime shape, so created_at and
/// updated_at follow the TZ environment variable like the hour keys do.
fn local_now_str() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

pub fn ensure_schema(db_path: &str) -> Result<(), anyhow::Error> {
    let conn = open(db_path)?;
    conn.execute_batch(SCHEMA).context("failed to apply schema")?;
    Ok(())
}

/// Insert-or-add every drained hour bucket. On a hour_ts conflict the new
/// counts are added to the existing row and updated_at is refreshed, which
/// makes repeated commits of the same interval additive rather than lossy.
pub fn commit_stats(
    db_path: &str,
    hourly: &HashMap<String, HourCounter>,
) -> Result<(), anyhow::Error> {
    if hourly.is_empty() {
        return Ok(());
    }
    let mut conn = open(db_path)?;
    let now_str = local_now_str();
    let tx = conn.transaction()?;
    for (hour_ts, counter) in hourly {
        tx.execute(
            "INSERT INTO traffic_hourly (hour_ts, up_bytes, down_bytes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(hour_ts) DO UPDATE SET
                 up_bytes   = up_bytes   + excluded.up_bytes,
                 down_bytes = down_bytes + excluded.down_bytes,
                 updated_at = excluded.updated_at",
            params![hour_ts, counter.up as i64, counter.down as i64, now_str],
        )
        .context("failed to upsert hourly row")?;
    }
    tx.commit().context("failed to commit hourly batch")?;
    Ok(())
}

fn totals_from_row(up: Option<i64>, down: Option<i64>, total: Option<i64>) -> TrafficTotals {
    TrafficTotals {
        up_bytes: up.unwrap_or(0).max(0) as u64,
        down_bytes: down.unwrap_or(0).max(0) as u64,
        total_bytes: total.unwrap_or(0).max(0) as u64,
    }
}

pub fn day_stats(db_path: &str, day: &str) -> Result<TrafficTotals, anyhow::Error> {
    let conn = open(db_path)?;
    let row = conn
        .query_row(
            "SELECT up_bytes, down_bytes, total_bytes FROM traffic_daily WHERE day = ?1",
            params![day],
            |row| Ok(totals_from_row(row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    Ok(row.unwrap_or_default())
}

pub fn month_stats(db_path: &str, month: &str) -> Result<TrafficTotals, anyhow::Error> {
    let conn = open(db_path)?;
    let row = conn
        .query_row(
            "SELECT up_bytes, down_bytes, total_bytes FROM traffic_monthly WHERE month = ?1",
            params![month],
            |row| Ok(totals_from_row(row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    Ok(row.unwrap_or_default())
}

pub fn year_stats(db_path: &str, year: &str) -> Result<TrafficTotals, anyhow::Error> {
    let conn = open(db_path)?;
    let totals = conn.query_row(
        "SELECT SUM(up_bytes), SUM(down_bytes), SUM(up_bytes + down_bytes)
         FROM traffic_hourly WHERE hour_ts LIKE ?1",
        params![format!("{}%", year)],
        |row| Ok(totals_from_row(row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(totals)
}

pub fn last_30days(db_path: &str) -> Result<Vec<DayRow>, anyhow::Error> {
    let today = Local::now().date_naive();
    let start = (today - ChronoDuration::days(29)).format("%Y-%m-%d").to_string();
    let end = today.format("%Y-%m-%d").to_string();
    let conn = open(db_path)?;
    daily_range_filled(&conn, &start, &end)
}

pub fn last_12months(db_path: &str) -> Result<Vec<MonthRow>, anyhow::Error> {
    let now = Local::now();
    let mut months: Vec<String> = Vec::with_capacity(12);
    for i in (0..12).rev() {
        let total = now.month0() as i32 - i;
        let year = now.year() + total.div_euclid(12);
        let month = total.rem_euclid(12) + 1;
        months.push(format!("{:04}-{:02}", year, month));
    }

    let conn = open(db_path)?;
    let placeholders = vec!["?"; months.len()].join(",");
    let sql = format!(
        "SELECT month, up_bytes, down_bytes, total_bytes FROM traffic_monthly
         WHERE month IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut row_map: HashMap<String, MonthRow> = HashMap::new();
    let rows = stmt.query_map(params_from_iter(months.iter()), |row| {
        let month: String = row.get(0)?;
        let totals = totals_from_row(row.get(1)?, row.get(2)?, row.get(3)?);
        Ok(MonthRow {
            month,
            up_bytes: totals.up_bytes,
            down_bytes: totals.down_bytes,
            total_bytes: totals.total_bytes,
        })
    })?;
    for row in rows {
        let row = row?;
        row_map.insert(row.month.clone(), row);
    }

    Ok(months
        .into_iter()
        .map(|m| {
            row_map.remove(&m).unwrap_or(MonthRow {
                month: m,
                up_bytes: 0,
                down_bytes: 0,
                total_bytes: 0,
            })
        })
        .collect())
}

pub fn hourly_today(db_path: &str) -> Result<Vec<TodayHourRow>, anyhow::Error> {
    let today = Local::now().format("%Y-%m-%d").to_string();
    let conn = open(db_path)?;
    let mut stmt = conn.prepare(
        "SELECT hour_ts, up_bytes, down_bytes
         FROM traffic_hourly WHERE hour_ts LIKE ?1 ORDER BY hour_ts",
    )?;
    let rows = stmt.query_map(params![format!("{}%", today)], |row| {
        let up: Option<i64> = row.get(1)?;
        let down: Option<i64> = row.get(2)?;
        Ok(TodayHourRow {
            hour_ts: row.get(0)?,
            up_bytes: up.unwrap_or(0).max(0) as u64,
            down_bytes: down.unwrap_or(0).max(0) as u64,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

/// Min and max day present in the hourly table; today twice when empty.
pub fn available_date_range(db_path: &str) -> Result<(String, String), anyhow::Error> {
    let conn = open(db_path)?;
    let row: (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(substr(hour_ts, 1, 10)), MAX(substr(hour_ts, 1, 10)) FROM traffic_hourly",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match row {
        (Some(min), Some(max)) => Ok((min, max)),
        _ => {
            let today = Local::now().format("%Y-%m-%d").to_string();
            Ok((today.clone(), today))
        }
    }
}

/// Arbitrary date-range query. Day granularity zero-fills missing days so
/// charts get a continuous axis; hour and month return only existing rows.
pub fn query_range(
    db_path: &str,
    start: &str,
    end: &str,
    granularity: Granularity,
) -> Result<RangeResult, anyhow::Error> {
    let conn = open(db_path)?;
    let series: Vec<SeriesRow> = match granularity {
        Granularity::Hour => hourly_range(&conn, start, end)?
            .into_iter()
            .map(SeriesRow::Hour)
            .collect(),
        Granularity::Month => monthly_range(&conn, start, end)?
            .into_iter()
            .map(SeriesRow::Month)
            .collect(),
        Granularity::Day => daily_range_filled(&conn, start, end)?
            .into_iter()
            .map(SeriesRow::Day)
            .collect(),
    };

    let mut summary = TrafficTotals::default();
    for row in &series {
        let (up, down) = match row {
            SeriesRow::Hour(r) => (r.up_bytes, r.down_bytes),
            SeriesRow::Day(r) => (r.up_bytes, r.down_bytes),
            SeriesRow::Month(r) => (r.up_bytes, r.down_bytes),
        };
        summary.up_bytes += up;
        summary.down_bytes += down;
    }
    summary.total_bytes = summary.up_bytes + summary.down_bytes;

    Ok(RangeResult { summary, series })
}

fn hourly_range(conn: &Connection, start: &str, end: &str) -> Result<Vec<HourRow>, anyhow::Error> {
    let mut stmt = conn.prepare(
        "SELECT hour_ts, up_bytes, down_bytes, (up_bytes + down_bytes)
         FROM traffic_hourly
         WHERE hour_ts >= ?1 AND hour_ts <= ?2
         ORDER BY hour_ts",
    )?;
    let rows = stmt.query_map(
        params![format!("{} 00:00:00", start), format!("{} 23:59:59", end)],
        |row| {
            let totals = totals_from_row(row.get(1)?, row.get(2)?, row.get(3)?);
            Ok(HourRow {
                hour_ts: row.get(0)?,
                up_bytes: totals.up_bytes,
                down_bytes: totals.down_bytes,
                total_bytes: totals.total_bytes,
            })
        },
    )?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn daily_range_filled(
    conn: &Connection,
    start: &str,
    end: &str,
) -> Result<Vec<DayRow>, anyhow::Error> {
    let mut stmt = conn.prepare(
        "SELECT day, up_bytes, down_bytes, total_bytes
         FROM traffic_daily WHERE day >= ?1 AND day <= ?2 ORDER BY day",
    )?;
    let rows = stmt.query_map(params![start, end], |row| {
        let totals = totals_from_row(row.get(1)?, row.get(2)?, row.get(3)?);
        Ok(DayRow {
            day: row.get(0)?,
            up_bytes: totals.up_bytes,
            down_bytes: totals.down_bytes,
            total_bytes: totals.total_bytes,
        })
    })?;
    let mut row_map: HashMap<String, DayRow> = HashMap::new();
    for row in rows {
        let row = row?;
        row_map.insert(row.day.clone(), row);
    }

    let start_date = NaiveDate::parse_from_str(start, "%Y-%m-%d")
        .with_context(|| format!("invalid start date '{}'", start))?;
    let end_date = NaiveDate::parse_from_str(end, "%Y-%m-%d")
        .with_context(|| format!("invalid end date '{}'", end))?;

    let mut result = Vec::new();
    let mut cursor = start_date;
    while cursor <= end_date {
        let key = cursor.format("%Y-%m-%d").to_string();
        result.push(row_map.remove(&key).unwrap_or(DayRow {
            day: key,
            up_bytes: 0,
            down_bytes: 0,
            total_bytes: 0,
        }));
        cursor = match cursor.succ_opt() {
            Some(next) => next,
            None => break,
        };
    }
    Ok(result)
}

fn monthly_range(
    conn: &Connection,
    start: &str,
    end: &str,
) -> Result<Vec<MonthRow>, anyhow::Error> {
    let start_m = start.get(..7).unwrap_or(start);
    let end_m = end.get(..7).unwrap_or(end);
    let mut stmt = conn.prepare(
        "SELECT month, up_bytes, down_bytes, total_bytes
         FROM traffic_monthly WHERE month >= ?1 AND month <= ?2 ORDER BY month",
    )?;
    let rows = stmt.query_map(params![start_m, end_m], |row| {
        let totals = totals_from_row(row.get(1)?, row.get(2)?, row.get(3)?);
        Ok(MonthRow {
            month: row.get(0)?,
            up_bytes: totals.up_bytes,
            down_bytes: totals.down_bytes,
            total_bytes: totals.total_bytes,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db(name: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "netsentinel_{}_{}.db",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path.to_string_lossy().into_owned()
    }

    fn one_hour(hour_ts: &str, up: u64, down: u64) -> HashMap<String, HourCounter> {
        let mut map = HashMap::new();
        map.insert(hour_ts.to_string(), HourCounter { up, down });
        map
    }

    #[test]
    fn test_upsert_adds_on_conflict() {
        let db = temp_db("upsert");
        ensure_schema(&db).unwrap();

        let batch = one_hour("2024-06-01 10:00:00", 5, 7);
        commit_stats(&db, &batch).unwrap();
        commit_stats(&db, &batch).unwrap();

        let result = query_range(&db, "2024-06-01", "2024-06-01", Granularity::Hour).unwrap();
        assert_eq!(result.series.len(), 1);
        match &result.series[0] {
            SeriesRow::Hour(row) => {
                assert_eq!(row.hour_ts, "2024-06-01 10:00:00");
                assert_eq!(row.up_bytes, 10);
                assert_eq!(row.down_bytes, 14);
                assert_eq!(row.total_bytes, 24);
            }
            _ => panic!("expected an hour row"),
        }
        assert_eq!(result.summary.up_bytes, 10);
        assert_eq!(result.summary.down_bytes, 14);
    }

    #[test]
    fn test_daily_view_and_zero_fill() {
        let db = temp_db("daily");
        ensure_schema(&db).unwrap();

        commit_stats(&db, &one_hour("2024-06-01 10:00:00", 100, 200)).unwrap();
        commit_stats(&db, &one_hour("2024-06-01 11:00:00", 1, 2)).unwrap();
        commit_stats(&db, &one_hour("2024-06-03 00:00:00", 50, 60)).unwrap();

        let result = query_range(&db, "2024-06-01", "2024-06-03", Granularity::Day).unwrap();
        assert_eq!(result.series.len(), 3);
        match (&result.series[0], &result.series[1], &result.series[2]) {
            (SeriesRow::Day(d1), SeriesRow::Day(d2), SeriesRow::Day(d3)) => {
                assert_eq!(d1.day, "2024-06-01");
                assert_eq!(d1.up_bytes, 101);
                assert_eq!(d1.down_bytes, 202);
                assert_eq!(d2.day, "2024-06-02");
                assert_eq!(d2.total_bytes, 0);
                assert_eq!(d3.day, "2024-06-03");
                assert_eq!(d3.total_bytes, 110);
            }
            _ => panic!("expected day rows"),
        }
        assert_eq!(result.summary.up_bytes, 151);
        assert_eq!(result.summary.down_bytes, 262);
        assert_eq!(result.summary.total_bytes, 413);
    }

    #[test]
    fn test_monthly_view_and_year_sum() {
        let db = temp_db("monthly");
        ensure_schema(&db).unwrap();

        commit_stats(&db, &one_hour("2024-05-31 23:00:00", 10, 20)).unwrap();
        commit_stats(&db, &one_hour("2024-06-01 00:00:00", 30, 40)).unwrap();

        let may = month_stats(&db, "2024-05").unwrap();
        assert_eq!(may.up_bytes, 10);
        assert_eq!(may.total_bytes, 30);

        let june = month_stats(&db, "2024-06").unwrap();
        assert_eq!(june.down_bytes, 40);

        let year = year_stats(&db, "2024").unwrap();
        assert_eq!(year.up_bytes, 40);
        assert_eq!(year.down_bytes, 60);
        assert_eq!(year.total_bytes, 100);

        let missing = month_stats(&db, "2023-01").unwrap();
        assert_eq!(missing.total_bytes, 0);
    }

    #[test]
    fn test_date_range_defaults_to_today_when_empty() {
        let db = temp_db("range");
        ensure_schema(&db).unwrap();

        let today = Local::now().format("%Y-%m-%d").to_string();
        let (min, max) = available_date_range(&db).unwrap();
        assert_eq!(min, today);
        assert_eq!(max, today);

        commit_stats(&db, &one_hour("2024-06-01 10:00:00", 1, 1)).unwrap();
        commit_stats(&db, &one_hour("2024-07-04 10:00:00", 1, 1)).unwrap();
        let (min, max) = available_date_range(&db).unwrap();
        assert_eq!(min, "2024-06-01");
        assert_eq!(max, "2024-07-04");
    }

    #[test]
    fn test_hourly_today_rows_carry_only_directions() {
        let db = temp_db("today_hours");
        ensure_schema(&db).unwrap();

        let today = Local::now().format("%Y-%m-%d").to_string();
        commit_stats(&db, &one_hour(&format!("{} 09:00:00", today), 3, 4)).unwrap();

        let rows = hourly_today(&db).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].hour_ts, format!("{} 09:00:00", today));
        assert_eq!(rows[0].up_bytes, 3);
        assert_eq!(rows[0].down_bytes, 4);

        let json = serde_json::to_value(&rows[0]).unwrap();
        assert!(json.get("total_bytes").is_none());
    }

    #[test]
    fn test_last_12months_is_contiguous() {
        let db = temp_db("months12");
        ensure_schema(&db).unwrap();

        let months = last_12months(&db).unwrap();
        assert_eq!(months.len(), 12);
        assert_eq!(
            months.last().unwrap().month,
            Local::now().format("%Y-%m").to_string()
        );
        assert!(months.iter().all(|m| m.total_bytes == 0));
    }
}
