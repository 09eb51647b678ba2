use anyhow::{anyhow, Context, Result};
use chrono::{Datelike, FixedOffset, NaiveDate, TimeZone, Timelike, Utc, Weekday};

/// All day/week boundaries in this system are anchored to KST (UTC+09:00).
pub fn kst() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("KST offset is valid")
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

pub fn now_kst() -> chrono::DateTime<FixedOffset> {
    Utc::now().with_timezone(&kst())
}

/// "YYYY-MM-DD" for the current KST day.
pub fn today_ymd() -> String {
    now_kst().date_naive().format("%Y-%m-%d").to_string()
}

/// KST calendar day for an epoch timestamp.
pub fn ymd_from_ts(ts: i64) -> String {
    kst()
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

pub fn parse_ymd(ymd: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(ymd, "%Y-%m-%d").with_context(|| format!("bad ymd: {ymd}"))
}

/// ISO week key ("YYYY-Www", Monday start) for a KST calendar day.
pub fn week_key_from_ymd(ymd: &str) -> Result<String> {
    let d = parse_ymd(ymd)?;
    let iso = d.iso_week();
    Ok(format!("{:04}-W{:02}", iso.year(), iso.week()))
}

/// The seven KST days (Mon..Sun) of an ISO week key.
pub fn week_ymds_from_week_key(week_key: &str) -> Result<Vec<String>> {
    let (year, week) = parse_week_key(week_key)?;
    let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
        .ok_or_else(|| anyhow!("bad week key: {week_key}"))?;
    Ok((0..7)
        .map(|i| {
            (monday + chrono::Duration::days(i))
                .format("%Y-%m-%d")
                .to_string()
        })
        .collect())
}

fn parse_week_key(week_key: &str) -> Result<(i32, u32)> {
    let (y, w) = week_key
        .split_once("-W")
        .ok_or_else(|| anyhow!("bad week key: {week_key}"))?;
    Ok((y.parse()?, w.parse()?))
}

/// Week key of the ISO week before the one containing `ymd`.
pub fn prev_week_key(ymd: &str) -> Result<String> {
    let d = parse_ymd(ymd)? - chrono::Duration::days(7);
    week_key_from_ymd(&d.format("%Y-%m-%d").to_string())
}

pub fn next_ymd(ymd: &str) -> Result<String> {
    let d = parse_ymd(ymd)? + chrono::Duration::days(1);
    Ok(d.format("%Y-%m-%d").to_string())
}

/// Epoch `[start, end)` of one KST calendar day.
pub fn day_bounds_kst(ymd: &str) -> Result<(i64, i64)> {
    let d = parse_ymd(ymd)?;
    let start = kst()
        .from_local_datetime(&d.and_hms_opt(0, 0, 0).expect("midnight"))
        .single()
        .ok_or_else(|| anyhow!("bad day start: {ymd}"))?;
    Ok((start.timestamp(), start.timestamp() + 86_400))
}

/// Epoch `[start, end)` of one KST ISO week (Mon 00:00 .. next Mon 00:00).
pub fn week_bounds_kst(week_key: &str) -> Result<(i64, i64)> {
    let ymds = week_ymds_from_week_key(week_key)?;
    let (start, _) = day_bounds_kst(&ymds[0])?;
    Ok((start, start + 7 * 86_400))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBand {
    Night,
    Morning,
    Day,
    Evening,
}

impl TimeBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeBand::Night => "night",
            TimeBand::Morning => "morning",
            TimeBand::Day => "day",
            TimeBand::Evening => "evening",
        }
    }
}

/// night 00-06, morning 07-11, day 12-17, evening 18-23.
pub fn time_band(hour: u32) -> TimeBand {
    match hour {
        0..=6 => TimeBand::Night,
        7..=11 => TimeBand::Morning,
        12..=17 => TimeBand::Day,
        _ => TimeBand::Evening,
    }
}

pub fn current_time_band() -> TimeBand {
    time_band(now_kst().hour())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_week_key_iso_monday_start() {
        // 2025-01-06 is a Monday, ISO week 2.
        assert_eq!(week_key_from_ymd("2025-01-06").unwrap(), "2025-W02");
        // The Sunday before belongs to week 1.
        assert_eq!(week_key_from_ymd("2025-01-05").unwrap(), "2025-W01");
        // Dec 31 2024 falls into ISO 2025-W01.
        assert_eq!(week_key_from_ymd("2024-12-31").unwrap(), "2025-W01");
    }

    #[test]
    fn test_week_ymds_round_trip() {
        let days = week_ymds_from_week_key("2025-W02").unwrap();
        assert_eq!(days.len(), 7);
        assert_eq!(days[0], "2025-01-06");
        assert_eq!(days[6], "2025-01-12");
        for d in &days {
            assert_eq!(week_key_from_ymd(d).unwrap(), "2025-W02");
        }
    }

    #[test]
    fn test_prev_week_key() {
        assert_eq!(prev_week_key("2025-01-06").unwrap(), "2025-W01");
    }

    #[test]
    fn test_day_bounds_are_kst_midnights() {
        let (start, end) = day_bounds_kst("2025-01-06").unwrap();
        assert_eq!(end - start, 86_400);
        // 2025-01-06 00:00 KST == 2025-01-05 15:00 UTC.
        assert_eq!(start, 1736089200);
    }

    #[test]
    fn test_week_bounds_cover_exactly_seven_days() {
        let (start, end) = week_bounds_kst("2025-W02").unwrap();
        assert_eq!(end - start, 7 * 86_400);
        let (day_start, _) = day_bounds_kst("2025-01-06").unwrap();
        assert_eq!(start, day_start);
    }

    #[test]
    fn test_time_bands() {
        assert_eq!(time_band(0), TimeBand::Night);
        assert_eq!(time_band(6), TimeBand::Night);
        assert_eq!(time_band(7), TimeBand::Morning);
        assert_eq!(time_band(11), TimeBand::Morning);
        assert_eq!(time_band(12), TimeBand::Day);
        assert_eq!(time_band(17), TimeBand::Day);
        assert_eq!(time_band(18), TimeBand::Evening);
        assert_eq!(time_band(23), TimeBand::Evening);
    }

    #[test]
    fn test_next_ymd_crosses_month() {
        assert_eq!(next_ymd("2025-01-31").unwrap(), "2025-02-01");
    }

    #[test]
    fn test_ymd_from_ts_uses_kst() {
        // 2025-01-05 15:00 UTC is already Jan 6 in KST.
        assert_eq!(ymd_from_ts(1736089200), "2025-01-06");
        assert_eq!(ymd_from_ts(1736089199), "2025-01-05");
    }
}
