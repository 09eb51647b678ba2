use abydos::world;
use anyhow::Result;
use common::calendar::{now_ts, today_ymd};
use common::db::AsyncDb;
use rusqlite::OptionalExtension;
use serde::Serialize;

/// Small, stable snapshot POSTed to the dashboard. Boring keys, no message
/// content.
#[derive(Debug, Clone, Serialize)]
pub struct SyncPayload {
    pub generated_at: i64,
    pub bot: BotIdentity,
    pub guilds: Vec<GuildInfo>,
    pub world: WorldInfo,
    pub daily_rule: DailyRule,
    pub daily_meal: DailyMeal,
    pub stamps: Stamps,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct BotIdentity {
    pub user_id: i64,
    pub username: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuildInfo {
    pub guild_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorldInfo {
    pub weather: String,
    pub weather_changed_at: i64,
    pub weather_next_change_at: i64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DailyRule {
    pub date: String,
    pub rule_no: i64,
    pub rule_text: String,
    pub posted_channel_id: Option<i64>,
    pub posted_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct DailyMeal {
    pub date: String,
    pub meal_text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stamps {
    pub top: Vec<StampEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StampEntry {
    pub user_id: i64,
    pub stamps: i64,
    pub stamp_title: String,
}

async fn read_daily_rule(db: &AsyncDb, ymd: &str) -> Result<DailyRule> {
    let ymd_owned = ymd.to_string();
    let row = db
        .call_named("websync.rule", move |conn| {
            Ok(conn
                .query_row(
                    "SELECT rule_no, rule_text, posted_channel_id, posted_at
                     FROM daily_rules WHERE date_ymd = ?1",
                    [&ymd_owned],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                            row.get::<_, Option<i64>>(3)?,
                        ))
                    },
                )
                .optional()?)
        })
        .await?;

    Ok(match row {
        Some((rule_no, rule_text, posted_channel_id, posted_at)) => DailyRule {
            date: ymd.to_string(),
            rule_no,
            rule_text,
            posted_channel_id,
            posted_at,
        },
        None => DailyRule {
            date: ymd.to_string(),
            ..DailyRule::default()
        },
    })
}

async fn read_daily_meal(db: &AsyncDb, ymd: &str) -> Result<DailyMeal> {
    let ymd_owned = ymd.to_string();
    let text: Option<String> = db
        .call_named("websync.meal", move |conn| {
            Ok(conn
                .query_row(
                    "SELECT meal_text FROM daily_meals WHERE date_ymd = ?1",
                    [&ymd_owned],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await?;
    Ok(DailyMeal {
        date: ymd.to_string(),
        meal_text: text.unwrap_or_default(),
    })
}

async fn top_stamps(db: &AsyncDb, limit: i64) -> Result<Vec<StampEntry>> {
    db.call_named("websync.stamps", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT user_id, stamps, stamp_title FROM user_settings
             WHERE stamps > 0 ORDER BY stamps DESC, user_id ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| {
                Ok(StampEntry {
                    user_id: row.get(0)?,
                    stamps: row.get(1)?,
                    stamp_title: row.get(2)?,
                })
            })?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(rows)
    })
    .await
}

pub async fn build_payload(
    db: &AsyncDb,
    bot: BotIdentity,
    guilds: Vec<GuildInfo>,
) -> Result<SyncPayload> {
    let today = today_ymd();
    let world = world::get_world_state(db).await?;

    Ok(SyncPayload {
        generated_at: now_ts(),
        bot,
        guilds,
        world: WorldInfo {
            weather: world.weather.as_str().to_string(),
            weather_changed_at: world.changed_at,
            weather_next_change_at: world.next_change_at,
        },
        daily_rule: read_daily_rule(db, &today).await?,
        daily_meal: read_daily_meal(db, &today).await?,
        stamps: Stamps {
            top: top_stamps(db, 10).await?,
        },
    })
}

/// POST one snapshot. Returns true on 2xx; everything else is logged and
/// swallowed — sync is best-effort and must never surface to users.
pub async fn sync_once(
    client: &reqwest::Client,
    db: &AsyncDb,
    url: &str,
    token: &str,
    bot: BotIdentity,
    guilds: Vec<GuildInfo>,
) -> bool {
    let payload = match build_payload(db, bot, guilds).await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(error = %e, "websync payload build failed");
            return false;
        }
    };

    let res = client
        .post(url)
        .bearer_auth(token)
        .timeout(std::time::Duration::from_secs(8))
        .json(&payload)
        .send()
        .await;

    match res {
        Ok(resp) if resp.status().is_success() => true,
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(%status, body = %body.chars().take(300).collect::<String>(), "websync non-2xx");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, "websync post failed");
            false
        }
    }
}
