use anyhow::Result;
use common::calendar::{now_ts, today_ymd};
use common::db::AsyncDb;
use common::transport::Outbound;
use rand::Rng;
use rusqlite::OptionalExtension;
use tokio_util::sync::CancellationToken;

use crate::debt::{self, pressure_stage};

/// `bot_config` key pattern for the per-guild announcement channel.
pub fn notice_channel_key(guild_id: i64) -> String {
    format!("aby_notice_channel_id:{guild_id}")
}

pub async fn notice_channel_id(db: &AsyncDb, guild_id: i64) -> Result<Option<i64>> {
    let raw = db.config_get(&notice_channel_key(guild_id)).await?;
    Ok(raw.and_then(|v| v.trim().parse().ok()).filter(|v| *v > 0))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incident {
    pub title: &'static str,
    pub description: &'static str,
    pub delta_debt: i64,
}

/// Stochastic economic event. Bad events get more likely and heavier as the
/// pressure stage rises; mild positive events shave a little off the debt.
pub fn roll_incident(rng: &mut impl Rng, debt: i64) -> Incident {
    let stage = i64::from(pressure_stage(debt).stage);

    let bad_p = (0.45 + 0.08 * stage as f64).min(0.85);
    if rng.gen::<f64>() >= bad_p {
        let good: [(&str, &str, (i64, i64)); 3] = [
            (
                "Anonymous donation",
                "An unmarked transfer landed in the account. Someone out there hasn't given up on us.",
                (-250_000, -50_000),
            ),
            (
                "Parts clearance",
                "Sold off a pile of usable scrap. A little breathing room.",
                (-180_000, -30_000),
            ),
            (
                "A quiet day",
                "No collection calls today. The silence is almost worse.",
                (-80_000, -10_000),
            ),
        ];
        let (title, description, (lo, hi)) = good[rng.gen_range(0..good.len())];
        return Incident {
            title,
            description,
            delta_debt: rng.gen_range(lo..=hi),
        };
    }

    let base_lo = 40_000 + stage * 40_000;
    let base_hi = (180_000 + stage * 120_000).min(1_200_000);

    let bad: [(&str, &str, f64); 5] = [
        (
            "Collection call",
            "A long, loud phone call. \"By the end of the day\" is starting to sound familiar.",
            1.00,
        ),
        (
            "Equipment breakdown",
            "Part of the survey gear gave out. Repairs cost money. Everything costs money.",
            1.10,
        ),
        (
            "Lost paperwork",
            "A delivery form went missing and a fine appeared in its place.",
            0.85,
        ),
        (
            "Late fees",
            "Small arrears, piling up. Small, but they never stop.",
            0.95,
        ),
        (
            "Price spike",
            "Filters and batteries got more expensive overnight. Upkeep just went up.",
            0.90,
        ),
    ];
    let (title, description, mult) = bad[rng.gen_range(0..bad.len())];
    let lo = (base_lo as f64 * mult) as i64;
    let hi = (base_hi as f64 * mult) as i64;
    Incident {
        title,
        description,
        delta_debt: rng.gen_range(lo..=hi),
    }
}

/// Next-fire delay shrinks as the pressure stage grows.
pub fn roll_next_incident_at(rng: &mut impl Rng, now: i64, debt: i64) -> i64 {
    let stage = pressure_stage(debt).stage;
    let (lo, hi) = if stage >= 6 {
        (3_600, 3 * 3_600)
    } else if stage >= 4 {
        (5_400, 4 * 3_600)
    } else if stage >= 2 {
        (2 * 3_600, 6 * 3_600)
    } else {
        (4 * 3_600, 10 * 3_600)
    };
    now + rng.gen_range(lo..=hi)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncidentState {
    pub next_incident_at: i64,
    pub last_incident_at: i64,
}

/// Read the per-guild scheduler state, initializing a fresh guild to fire
/// roughly two hours out.
pub async fn ensure_incident_state(db: &AsyncDb, guild_id: i64, now: i64) -> Result<IncidentState> {
    db.call_named("incidents.ensure_state", move |conn| {
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT next_incident_at, last_incident_at FROM aby_incident_state WHERE guild_id = ?1",
                [guild_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let state = match row {
            Some((next, last)) if next > 0 => IncidentState {
                next_incident_at: next,
                last_incident_at: last,
            },
            other => {
                let next = now + 2 * 3_600;
                let last = other.map(|(_, l)| l).unwrap_or(0);
                conn.execute(
                    "INSERT INTO aby_incident_state(guild_id, next_incident_at, last_incident_at, updated_at)
                     VALUES(?1, ?2, ?3, ?4)
                     ON CONFLICT(guild_id) DO UPDATE SET
                       next_incident_at = excluded.next_incident_at, updated_at = excluded.updated_at",
                    rusqlite::params![guild_id, next, last, now_ts()],
                )?;
                IncidentState {
                    next_incident_at: next,
                    last_incident_at: last,
                }
            }
        };
        Ok(state)
    })
    .await
}

pub async fn update_incident_state(
    db: &AsyncDb,
    guild_id: i64,
    next_incident_at: i64,
    last_incident_at: i64,
) -> Result<()> {
    db.call_named("incidents.update_state", move |conn| {
        conn.execute(
            "INSERT INTO aby_incident_state(guild_id, next_incident_at, last_incident_at, updated_at)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(guild_id) DO UPDATE SET
               next_incident_at = excluded.next_incident_at,
               last_incident_at = excluded.last_incident_at,
               updated_at = excluded.updated_at",
            rusqlite::params![guild_id, next_incident_at, last_incident_at, now_ts()],
        )?;
        Ok(())
    })
    .await
}

/// Apply an incident's debt delta atomically (debt never drops below zero)
/// and journal it in both logs. Returns the new debt.
pub async fn apply_incident(
    db: &AsyncDb,
    guild_id: i64,
    incident: &Incident,
    today: &str,
) -> Result<i64> {
    let incident = incident.clone();
    let today = today.to_string();
    db.call_named("incidents.apply", move |conn| {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        debt::ensure_debt_row(&tx, guild_id, &today)?;
        let state = debt::read_debt(&tx, guild_id)?;
        let new_debt = (state.debt + incident.delta_debt).max(0);
        let applied = new_debt - state.debt;

        tx.execute(
            "UPDATE aby_guild_debt SET debt = ?2, updated_at = ?3 WHERE guild_id = ?1",
            rusqlite::params![guild_id, new_debt, now_ts()],
        )?;
        debt::log_economy(
            &tx,
            Some(guild_id),
            None,
            "incident",
            0,
            0,
            applied,
            incident.title,
        )?;
        tx.execute(
            "INSERT INTO aby_incident_log(guild_id, kind, title, description, delta_debt, created_at)
             VALUES(?1, 'incident', ?2, ?3, ?4, ?5)",
            rusqlite::params![guild_id, incident.title, incident.description, applied, now_ts()],
        )?;

        tx.commit()?;
        Ok(new_debt)
    })
    .await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncidentRow {
    pub title: String,
    pub description: String,
    pub delta_debt: i64,
    pub created_at: i64,
}

pub async fn recent_incidents(db: &AsyncDb, guild_id: i64, limit: i64) -> Result<Vec<IncidentRow>> {
    db.call_named("incidents.recent", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT title, description, delta_debt, created_at FROM aby_incident_log
             WHERE guild_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![guild_id, limit], |row| {
                Ok(IncidentRow {
                    title: row.get(0)?,
                    description: row.get(1)?,
                    delta_debt: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(rows)
    })
    .await
}

/// One scheduler pass over every indebted guild. Errors are per-guild:
/// logged, skipped, never fatal to the loop.
pub async fn tick(db: &AsyncDb, out: &Outbound, now: i64, today: &str) -> Result<()> {
    for guild_id in debt::list_debt_guild_ids(db).await? {
        if let Err(e) = tick_guild(db, out, guild_id, now, today).await {
            tracing::error!(guild_id, error = %e, "incident tick failed");
        }
    }
    Ok(())
}

async fn tick_guild(
    db: &AsyncDb,
    out: &Outbound,
    guild_id: i64,
    now: i64,
    today: &str,
) -> Result<()> {
    let state = ensure_incident_state(db, guild_id, now).await?;
    if now < state.next_incident_at {
        return Ok(());
    }

    // Interest catch-up first so the incident lands on today's figures.
    let debt_state = debt::apply_interest_upto(db, guild_id, today).await?;

    let incident = {
        let mut rng = rand::thread_rng();
        roll_incident(&mut rng, debt_state.debt)
    };
    let new_debt = apply_incident(db, guild_id, &incident, today).await?;

    let next_at = {
        let mut rng = rand::thread_rng();
        roll_next_incident_at(&mut rng, now, new_debt)
    };
    update_incident_state(db, guild_id, next_at, now).await?;

    tracing::info!(
        guild_id,
        title = incident.title,
        delta_debt = incident.delta_debt,
        new_debt,
        "incident applied"
    );

    if let Some(channel_id) = notice_channel_id(db, guild_id).await? {
        let stage = pressure_stage(new_debt);
        let sign = if incident.delta_debt >= 0 { "+" } else { "" };
        out.say(
            channel_id,
            format!(
                "Incident: {} — {}\nDebt change: {sign}{}\nCurrent debt: {} (pressure: {})",
                incident.title, incident.description, incident.delta_debt, new_debt, stage.label
            ),
        );
    }
    Ok(())
}

/// Background loop: every 120 s, fire due incidents. At most one tick in
/// flight; guilds are visited sequentially within a tick.
pub async fn run_loop(db: AsyncDb, out: Outbound, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(120));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = tick(&db, &out, now_ts(), &today_ymd()).await {
            tracing::error!(error = %e, "incident loop pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn mem_db() -> AsyncDb {
        AsyncDb::open(":memory:").await.unwrap()
    }

    async fn seed_debt(db: &AsyncDb, gid: i64, debt: i64) {
        db.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO aby_guild_debt(guild_id, debt, interest_rate, last_interest_ymd, created_at, updated_at)
                 VALUES(?1, ?2, 0.005, '2025-01-06', 0, 0)",
                rusqlite::params![gid, debt],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_next_incident_window_scales_with_stage() {
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..200 {
            // Stage 4-5 band: 1.5h .. 4h.
            let at = roll_next_incident_at(&mut rng, 0, 10_000_000);
            assert!((5_400..=4 * 3_600).contains(&at), "got {at}");

            // Stage 0-1 band: 4h .. 10h.
            let at = roll_next_incident_at(&mut rng, 0, 100_000);
            assert!((4 * 3_600..=10 * 3_600).contains(&at), "got {at}");

            // Stage 6+: 1h .. 3h.
            let at = roll_next_incident_at(&mut rng, 0, 40_000_000);
            assert!((3_600..=3 * 3_600).contains(&at), "got {at}");
        }
    }

    #[test]
    fn test_bad_incidents_dominate_under_pressure() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut bad = 0;
        for _ in 0..2_000 {
            if roll_incident(&mut rng, 60_000_000).delta_debt > 0 {
                bad += 1;
            }
        }
        // Stage 7 caps at 85% bad.
        assert!(bad > 1_500, "only {bad} bad incidents at max pressure");
        assert!(bad < 1_900, "cap must leave room for good events: {bad}");
    }

    #[test]
    fn test_incident_delta_ranges() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let inc = roll_incident(&mut rng, 10_000_000);
            if inc.delta_debt < 0 {
                assert!(inc.delta_debt >= -250_000);
            } else {
                // Stage 4, worst multiplier 1.10 on base_hi 660k.
                assert!(inc.delta_debt <= 726_000, "got {}", inc.delta_debt);
            }
        }
    }

    #[tokio::test]
    async fn test_ensure_state_initializes_two_hours_out() {
        let db = mem_db().await;
        let state = ensure_incident_state(&db, 1, 1_000).await.unwrap();
        assert_eq!(state.next_incident_at, 1_000 + 7_200);
        assert_eq!(state.last_incident_at, 0);

        // Re-read keeps the stored value.
        let again = ensure_incident_state(&db, 1, 5_000).await.unwrap();
        assert_eq!(again.next_incident_at, state.next_incident_at);
    }

    #[tokio::test]
    async fn test_apply_incident_updates_debt_and_logs() {
        let db = mem_db().await;
        seed_debt(&db, 1, 1_000_000).await;

        let incident = Incident {
            title: "Collection call",
            description: "test",
            delta_debt: 50_000,
        };
        let new_debt = apply_incident(&db, 1, &incident, "2025-01-06").await.unwrap();
        assert_eq!(new_debt, 1_050_000);

        let (econ_delta, log_delta): (i64, i64) = db
            .call(|conn| {
                let econ: i64 = conn.query_row(
                    "SELECT delta_debt FROM aby_economy_log WHERE kind='incident'",
                    [],
                    |row| row.get(0),
                )?;
                let inc: i64 = conn.query_row(
                    "SELECT delta_debt FROM aby_incident_log WHERE guild_id=1",
                    [],
                    |row| row.get(0),
                )?;
                Ok((econ, inc))
            })
            .await
            .unwrap();
        assert_eq!(econ_delta, 50_000);
        assert_eq!(log_delta, 50_000);
    }

    #[tokio::test]
    async fn test_apply_incident_floors_debt_at_zero() {
        let db = mem_db().await;
        seed_debt(&db, 1, 30_000).await;

        let incident = Incident {
            title: "Anonymous donation",
            description: "test",
            delta_debt: -100_000,
        };
        let new_debt = apply_incident(&db, 1, &incident, "2025-01-06").await.unwrap();
        assert_eq!(new_debt, 0);

        // The journal records the applied delta, not the rolled one.
        let applied: i64 = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT delta_debt FROM aby_incident_log WHERE guild_id=1",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(applied, -30_000);
    }

    #[tokio::test]
    async fn test_tick_fires_only_when_due() {
        let db = mem_db().await;
        let (out, _rx) = Outbound::channel();
        seed_debt(&db, 1, 10_000_000).await;

        // First pass initializes the schedule without firing.
        tick(&db, &out, 1_000, "2025-01-06").await.unwrap();
        let incidents = recent_incidents(&db, 1, 10).await.unwrap();
        assert!(incidents.is_empty());

        let state = ensure_incident_state(&db, 1, 1_000).await.unwrap();

        // Well past the scheduled moment: the incident fires and reschedules.
        let later = state.next_incident_at + 60;
        tick(&db, &out, later, "2025-01-06").await.unwrap();
        let incidents = recent_incidents(&db, 1, 10).await.unwrap();
        assert_eq!(incidents.len(), 1);

        let new_state = ensure_incident_state(&db, 1, later).await.unwrap();
        assert_eq!(new_state.last_incident_at, later);
        // Stage >= 4 band.
        assert!(new_state.next_incident_at >= later + 5_400);
        assert!(new_state.next_incident_at <= later + 4 * 3_600);
    }
}
