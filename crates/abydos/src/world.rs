use anyhow::Result;
use common::calendar::now_ts;
use common::db::AsyncDb;
use common::transport::Outbound;
use common::types::Weather;
use rand::Rng;
use tokio_util::sync::CancellationToken;

/// The singleton world row. Created with defaults by the store migration;
/// mutated only here (scheduler loop + admin force).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorldState {
    pub weather: Weather,
    pub changed_at: i64,
    pub next_change_at: i64,
}

pub async fn get_world_state(db: &AsyncDb) -> Result<WorldState> {
    db.call_named("world.get", |conn| {
        let (weather, changed_at, next_change_at): (String, i64, i64) = conn.query_row(
            "SELECT weather, weather_changed_at, weather_next_change_at FROM world_state WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(WorldState {
            weather: Weather::from_str_loose(&weather).unwrap_or(Weather::Clear),
            changed_at,
            next_change_at,
        })
    })
    .await
}

/// Weighted draw: clear 55%, cloudy 30%, sandstorm 15%. Drawing the current
/// weather re-rolls once, uniformly among the other two.
pub fn pick_next_weather(rng: &mut impl Rng, current: Weather) -> Weather {
    let roll: f64 = rng.gen();
    let picked = if roll < 0.55 {
        Weather::Clear
    } else if roll < 0.85 {
        Weather::Cloudy
    } else {
        Weather::Sandstorm
    };

    if picked != current {
        return picked;
    }

    let others: [Weather; 2] = match current {
        Weather::Clear => [Weather::Cloudy, Weather::Sandstorm],
        Weather::Cloudy => [Weather::Clear, Weather::Sandstorm],
        Weather::Sandstorm => [Weather::Clear, Weather::Cloudy],
    };
    others[rng.gen_range(0..2)]
}

pub fn roll_next_change_at(rng: &mut impl Rng, now: i64) -> i64 {
    now + rng.gen_range(4 * 3600..=6 * 3600)
}

pub async fn set_weather(db: &AsyncDb, weather: Weather, now: i64, next_at: i64) -> Result<()> {
    db.call_named("world.set", move |conn| {
        conn.execute(
            "UPDATE world_state
             SET weather = ?1, weather_changed_at = ?2, weather_next_change_at = ?3, updated_at = ?2
             WHERE id = 1",
            rusqlite::params![weather.as_str(), now, next_at],
        )?;
        Ok(())
    })
    .await
}

/// Rotate the weather if the schedule is due. Returns the new state when a
/// rotation happened.
pub async fn rotate_if_due(db: &AsyncDb, now: i64) -> Result<Option<WorldState>> {
    let state = get_world_state(db).await?;
    if state.next_change_at > now {
        return Ok(None);
    }

    let (weather, next_at) = {
        let mut rng = rand::thread_rng();
        (
            pick_next_weather(&mut rng, state.weather),
            roll_next_change_at(&mut rng, now),
        )
    };
    set_weather(db, weather, now, next_at).await?;
    tracing::info!(weather = %weather, next_change_at = next_at, "world weather rotated");
    Ok(Some(WorldState {
        weather,
        changed_at: now,
        next_change_at: next_at,
    }))
}

fn announce_line(weather: Weather) -> &'static str {
    match weather {
        Weather::Clear => "The sky over Abydos is clear. Good day for a dig.",
        Weather::Cloudy => "Clouds are rolling over Abydos.",
        Weather::Sandstorm => "A sandstorm is sweeping Abydos. Expeditions will be rough.",
    }
}

/// Single writer of `world_state`: one process-wide task. Checks every 60 s
/// with a small startup jitter so restarts don't align ticks across fleets.
pub async fn run_loop(
    db: AsyncDb,
    out: Outbound,
    announce_channel_id: Option<i64>,
    cancel: CancellationToken,
) {
    let jitter = {
        let mut rng = rand::thread_rng();
        std::time::Duration::from_millis(rng.gen_range(500..=3000))
    };
    tokio::time::sleep(jitter).await;

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match rotate_if_due(&db, now_ts()).await {
            Ok(Some(state)) => {
                if let Some(channel_id) = announce_channel_id {
                    out.say(channel_id, announce_line(state.weather));
                }
            }
            Ok(None) => {}
            Err(e) => tracing::error!(error = %e, "world rotation failed"),
        }
    }
}
