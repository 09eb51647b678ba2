use anyhow::Result;
use common::calendar::{now_kst, prev_week_key, week_bounds_kst, week_ymds_from_week_key};
use common::db::AsyncDb;
use common::transport::Outbound;
use chrono::{Datelike, Timelike};
use tokio_util::sync::CancellationToken;

use crate::debt::{self, pressure_stage};
use crate::incidents::notice_channel_id;
use crate::quests;

/// `bot_config` marker that makes the Monday publish at-most-once per
/// `(guild, week)`.
pub fn last_sent_key(guild_id: i64) -> String {
    format!("aby_weekly_report_last_sent_week:{guild_id}")
}

/// Weekly debt movement, aggregated from the economy journal. The journal is
/// the single source of truth; nothing here double-counts across weeks
/// because the window is half-open on KST Monday midnights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WeeklySummary {
    pub interest_delta: i64,
    pub incident_delta: i64,
    pub repay_delta: i64,
    pub net_delta: i64,
    pub repaid_credits: i64,
}

pub async fn weekly_debt_summary(
    db: &AsyncDb,
    guild_id: i64,
    week_key: &str,
) -> Result<WeeklySummary> {
    let (start, end) = week_bounds_kst(week_key)?;
    db.call_named("report.summary", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT kind, COALESCE(SUM(delta_debt), 0), COALESCE(SUM(delta_credits), 0)
             FROM aby_economy_log
             WHERE guild_id = ?1 AND created_at >= ?2 AND created_at < ?3
             GROUP BY kind",
        )?;
        let mut summary = WeeklySummary::default();
        let rows = stmt.query_map(rusqlite::params![guild_id, start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (kind, delta_debt, delta_credits) = row?;
            match kind.as_str() {
                "interest" => summary.interest_delta = delta_debt,
                "incident" => summary.incident_delta = delta_debt,
                "repay" => {
                    summary.repay_delta = delta_debt;
                    summary.repaid_credits = -delta_credits;
                }
                _ => {}
            }
            summary.net_delta += delta_debt;
        }
        Ok(summary)
    })
    .await
}

pub async fn top_repayers(
    db: &AsyncDb,
    guild_id: i64,
    week_key: &str,
    limit: i64,
) -> Result<Vec<(i64, i64)>> {
    let (start, end) = week_bounds_kst(week_key)?;
    db.call_named("report.top_repayers", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT user_id, COALESCE(SUM(-delta_credits), 0) AS total
             FROM aby_economy_log
             WHERE guild_id = ?1 AND kind = 'repay' AND user_id IS NOT NULL
               AND created_at >= ?2 AND created_at < ?3
             GROUP BY user_id
             ORDER BY total DESC, user_id ASC
             LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![guild_id, start, end, limit], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(rows)
    })
    .await
}

fn sign(n: i64) -> &'static str {
    if n >= 0 {
        "+"
    } else {
        ""
    }
}

/// Plain-text rendering of a week's report.
pub async fn render_weekly_report(
    db: &AsyncDb,
    guild_id: i64,
    week_key: &str,
    today: &str,
) -> Result<String> {
    let summary = weekly_debt_summary(db, guild_id, week_key).await?;
    let debt_state = debt::get_guild_debt(db, guild_id, today).await?;
    let stage = pressure_stage(debt_state.debt);

    let range = week_ymds_from_week_key(week_key)
        .map(|days| format!("{} ~ {}", days[0], days[6]))
        .unwrap_or_default();

    let mut lines = vec![
        format!("Weekly report · {week_key} ({range})"),
        format!(
            "Current debt: {} (pressure: {})",
            debt_state.debt, stage.label
        ),
        format!(
            "Debt movement: net {}{} | interest {}{} | incidents {}{} | repaid {}{}",
            sign(summary.net_delta),
            summary.net_delta,
            sign(summary.interest_delta),
            summary.interest_delta,
            sign(summary.incident_delta),
            summary.incident_delta,
            sign(summary.repay_delta),
            summary.repay_delta,
        ),
        format!("Total credits repaid: {}", summary.repaid_credits),
    ];

    let tops = top_repayers(db, guild_id, week_key, 5).await?;
    if !tops.is_empty() {
        lines.push("Top repayers:".to_string());
        for (rank, (user_id, total)) in tops.iter().enumerate() {
            lines.push(format!("{}. <@{user_id}> — {total}", rank + 1));
        }
    }

    let points = quests::weekly_points_ranking(db, guild_id, week_key, 5).await?;
    if !points.is_empty() {
        lines.push("Quest points:".to_string());
        for (rank, (user_id, pts)) in points.iter().enumerate() {
            lines.push(format!("{}. <@{user_id}> — {pts}pt", rank + 1));
        }
    }

    Ok(lines.join("\n"))
}

/// One pass of the Monday publisher. Fires only inside the KST window
/// Monday 00:05–00:55, once per guild-week.
pub async fn tick(db: &AsyncDb, out: &Outbound) -> Result<()> {
    let now = now_kst();
    if now.weekday() != chrono::Weekday::Mon {
        return Ok(());
    }
    if now.hour() != 0 || !(5..=55).contains(&now.minute()) {
        return Ok(());
    }

    let today = now.date_naive().format("%Y-%m-%d").to_string();
    let week = prev_week_key(&today)?;

    for guild_id in debt::list_debt_guild_ids(db).await? {
        if let Err(e) = tick_guild(db, out, guild_id, &week, &today).await {
            tracing::error!(guild_id, error = %e, "weekly report failed");
        }
    }
    Ok(())
}

async fn tick_guild(
    db: &AsyncDb,
    out: &Outbound,
    guild_id: i64,
    week_key: &str,
    today: &str,
) -> Result<()> {
    let Some(channel_id) = notice_channel_id(db, guild_id).await? else {
        return Ok(());
    };

    let marker = last_sent_key(guild_id);
    if db.config_get(&marker).await?.as_deref() == Some(week_key) {
        return Ok(());
    }

    let report = render_weekly_report(db, guild_id, week_key, today).await?;
    out.say(channel_id, report);
    db.config_set(&marker, week_key).await?;
    tracing::info!(guild_id, week_key, "weekly report published");
    Ok(())
}

/// Background loop: check the calendar every 10 minutes.
pub async fn run_loop(db: AsyncDb, out: Outbound, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = tick(&db, &out).await {
            tracing::error!(error = %e, "weekly report pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::calendar::day_bounds_kst;

    async fn mem_db() -> AsyncDb {
        AsyncDb::open(":memory:").await.unwrap()
    }

    async fn log_at(db: &AsyncDb, gid: i64, uid: Option<i64>, kind: &str, dc: i64, dd: i64, at: i64) {
        let kind = kind.to_string();
        db.call(move |conn| {
            conn.execute(
                "INSERT INTO aby_economy_log(guild_id, user_id, kind, delta_credits, delta_debt, created_at)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![gid, uid, kind, dc, dd, at],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_weekly_summary_matches_log_rows() {
        let db = mem_db().await;
        let (start, _) = week_bounds_kst("2025-W02").unwrap();

        log_at(&db, 1, None, "interest", 0, 5_000, start + 10).await;
        log_at(&db, 1, None, "interest", 0, 5_025, start + 86_400).await;
        log_at(&db, 1, None, "incident", 0, 80_000, start + 100).await;
        log_at(&db, 1, Some(7), "repay", -30_000, -30_000, start + 200).await;
        log_at(&db, 1, Some(8), "repay", -20_000, -20_000, start + 300).await;
        // Outside the window (previous Sunday) and another guild.
        log_at(&db, 1, Some(7), "repay", -99_999, -99_999, start - 1).await;
        log_at(&db, 2, None, "interest", 0, 77_777, start + 50).await;

        let summary = weekly_debt_summary(&db, 1, "2025-W02").await.unwrap();
        assert_eq!(summary.interest_delta, 10_025);
        assert_eq!(summary.incident_delta, 80_000);
        assert_eq!(summary.repay_delta, -50_000);
        assert_eq!(summary.net_delta, 10_025 + 80_000 - 50_000);
        assert_eq!(summary.repaid_credits, 50_000);
    }

    #[tokio::test]
    async fn test_no_double_counting_across_weeks() {
        let db = mem_db().await;
        let (w2_start, w2_end) = week_bounds_kst("2025-W02").unwrap();

        // Boundary rows: last second of W02 and first second of W03.
        log_at(&db, 1, None, "interest", 0, 111, w2_end - 1).await;
        log_at(&db, 1, None, "interest", 0, 222, w2_end).await;
        log_at(&db, 1, None, "interest", 0, 333, w2_start).await;

        let w2 = weekly_debt_summary(&db, 1, "2025-W02").await.unwrap();
        let w3 = weekly_debt_summary(&db, 1, "2025-W03").await.unwrap();
        assert_eq!(w2.interest_delta, 111 + 333);
        assert_eq!(w3.interest_delta, 222);
    }

    #[tokio::test]
    async fn test_top_repayers_ordering() {
        let db = mem_db().await;
        let (start, _) = day_bounds_kst("2025-01-07").unwrap();

        log_at(&db, 1, Some(1), "repay", -10_000, -10_000, start).await;
        log_at(&db, 1, Some(2), "repay", -25_000, -25_000, start).await;
        log_at(&db, 1, Some(2), "repay", -5_000, -5_000, start).await;
        log_at(&db, 1, Some(3), "repay", -10_000, -10_000, start).await;

        let tops = top_repayers(&db, 1, "2025-W02", 2).await.unwrap();
        assert_eq!(tops, vec![(2, 30_000), (1, 10_000)]);
    }

    #[tokio::test]
    async fn test_render_contains_headline_numbers() {
        let db = mem_db().await;
        let (start, _) = week_bounds_kst("2025-W02").unwrap();
        log_at(&db, 1, Some(1), "repay", -10_000, -10_000, start + 5).await;

        let report = render_weekly_report(&db, 1, "2025-W02", "2025-01-13")
            .await
            .unwrap();
        assert!(report.contains("2025-W02"));
        assert!(report.contains("Total credits repaid: 10000"));
        assert!(report.contains("<@1>"));
    }

    #[tokio::test]
    async fn test_marker_prevents_second_publish() {
        let db = mem_db().await;
        let (out, mut rx) = Outbound::channel();
        // Guild with a configured channel.
        db.config_set(&crate::incidents::notice_channel_key(1), "42")
            .await
            .unwrap();
        db.call(|conn| {
            conn.execute(
                "INSERT INTO aby_guild_debt(guild_id, debt, interest_rate, last_interest_ymd, created_at, updated_at)
                 VALUES(1, 1000, 0.005, '2025-01-13', 0, 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        tick_guild(&db, &out, 1, "2025-W02", "2025-01-13").await.unwrap();
        assert!(rx.try_recv().is_ok());

        tick_guild(&db, &out, 1, "2025-W02", "2025-01-13").await.unwrap();
        assert!(rx.try_recv().is_err(), "second publish must be suppressed");

        assert_eq!(
            db.config_get(&last_sent_key(1)).await.unwrap().as_deref(),
            Some("2025-W02")
        );
    }
}
