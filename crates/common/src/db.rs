use anyhow::Result;
use rusqlite::Connection;

use crate::calendar::now_ts;

/// Async store wrapper around `tokio_rusqlite::Connection`.
///
/// Runs all SQLite operations on a dedicated background thread via
/// `tokio_rusqlite`, keeping the Tokio runtime cooperative. Clone is
/// cheap (shared mpsc sender to the background thread).
///
/// Subsystems own their rows: every multi-row invariant (exploration commit,
/// craft, repay, quest claim) runs inside a single `BEGIN IMMEDIATE`
/// transaction in one `call` closure.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    /// Open the database at `path`, set PRAGMAs (WAL, foreign keys,
    /// busy_timeout) and run migrations, all on the background thread.
    ///
    /// Startup migrations need the write lock. A concurrent reader (sqlite3
    /// admin session, deploy check) can hold it; hard-failing here would
    /// crash-loop under systemd, so migrations retry with backoff until the
    /// lock clears. The per-attempt busy_timeout is short so backoff is
    /// handled here rather than inside SQLite.
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path).await?;

        let mut backoff = std::time::Duration::from_secs(1);
        let max_backoff = std::time::Duration::from_secs(30);
        let max_total_wait = std::time::Duration::from_secs(10 * 60);
        let start = std::time::Instant::now();

        loop {
            let res = conn
                .call(|conn| -> std::result::Result<(), rusqlite::Error> {
                    conn.busy_timeout(std::time::Duration::from_secs(1))?;
                    conn.execute_batch(
                        "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
                    )?;
                    migrate(conn)?;
                    // Normal runtime operations get a longer busy_timeout.
                    conn.busy_timeout(std::time::Duration::from_secs(30))?;
                    Ok(())
                })
                .await;

            match res {
                Ok(()) => break,
                Err(tokio_rusqlite::Error::Error(err)) => {
                    let is_locked = matches!(
                        err,
                        rusqlite::Error::SqliteFailure(
                            rusqlite::ffi::Error {
                                code: rusqlite::ffi::ErrorCode::DatabaseBusy
                                    | rusqlite::ffi::ErrorCode::DatabaseLocked,
                                ..
                            },
                            _,
                        )
                    );
                    if !is_locked {
                        return Err(
                            anyhow::Error::from(err).context("AsyncDb::open: migration failed")
                        );
                    }

                    if start.elapsed() >= max_total_wait {
                        return Err(anyhow::Error::from(err).context(
                            "AsyncDb::open: migration failed (database stayed locked too long)",
                        ));
                    }

                    tracing::warn!(
                        wait_for = ?backoff,
                        "AsyncDb::open: database is locked; retrying migrations"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(other) => return Err(anyhow::anyhow!("AsyncDb::open: {other}")),
            }
        }

        Ok(Self { conn })
    }

    /// Run a closure on the background SQLite thread and return the result.
    pub async fn call<F, R>(&self, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.conn.call(move |conn| function(conn)).await.map_err(
            |e: tokio_rusqlite::Error<anyhow::Error>| match e {
                tokio_rusqlite::Error::ConnectionClosed => {
                    anyhow::anyhow!("database connection closed")
                }
                tokio_rusqlite::Error::Close((_, err)) => {
                    anyhow::anyhow!("database close error: {err}")
                }
                tokio_rusqlite::Error::Error(err) => err,
                other => anyhow::anyhow!("database error: {other}"),
            },
        )
    }

    /// Like [`Self::call`], but records Prometheus metrics for latency and
    /// errors. Measures the full wall-clock time including queueing on the
    /// SQLite thread.
    pub async fn call_named<F, R>(&self, op: &'static str, function: F) -> Result<R>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let start = std::time::Instant::now();
        let res = self.call(function).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;

        match &res {
            Ok(_) => {
                metrics::histogram!(
                    "abydos_db_query_latency_ms",
                    "op" => op,
                    "status" => "ok"
                )
                .record(ms);
            }
            Err(_) => {
                metrics::histogram!(
                    "abydos_db_query_latency_ms",
                    "op" => op,
                    "status" => "err"
                )
                .record(ms);
                metrics::counter!("abydos_db_query_errors_total", "op" => op).increment(1);
            }
        }

        res
    }

    /// Ensure a `user_settings` row exists; called on first interaction.
    pub async fn touch_user_settings(&self, user_id: i64) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO user_settings(user_id, created_at, updated_at) VALUES(?1, ?2, ?2)",
                rusqlite::params![user_id, now_ts()],
            )?;
            Ok(())
        })
        .await
    }

    /// Read a free-form `bot_config` value.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.call(move |conn| {
            use rusqlite::OptionalExtension;
            Ok(conn
                .query_row(
                    "SELECT value FROM bot_config WHERE key = ?1",
                    [&key],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    /// Upsert a free-form `bot_config` value.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO bot_config(key, value, updated_at) VALUES(?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![key, value, now_ts()],
            )?;
            Ok(())
        })
        .await
    }
}

const SCHEMA_VERSION: i64 = 6;

/// Create tables / apply light migrations.
///
/// Migrations are intentionally additive only (new tables / new columns).
/// The current version lives in `schema_meta('schema_version')`; version
/// blocks below must never drop, rename, or change column types.
pub fn migrate(conn: &Connection) -> std::result::Result<(), rusqlite::Error> {
    let now = now_ts();

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL,
           updated_at INTEGER NOT NULL
         );",
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // ===== v1: settings + world + config =====
    if current < 1 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_settings (
               user_id INTEGER PRIMARY KEY,
               dm_opt_in INTEGER NOT NULL DEFAULT 1,
               noise_opt_in INTEGER NOT NULL DEFAULT 1,
               stamps_opt_in INTEGER NOT NULL DEFAULT 1,
               stamps INTEGER NOT NULL DEFAULT 0,
               stamps_rewarded INTEGER NOT NULL DEFAULT 0,
               stamp_title TEXT NOT NULL DEFAULT '',
               last_stamp_at INTEGER NOT NULL DEFAULT 0,
               last_reward_at INTEGER NOT NULL DEFAULT 0,
               created_at INTEGER NOT NULL,
               updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS world_state (
               id INTEGER PRIMARY KEY CHECK (id = 1),
               weather TEXT NOT NULL,
               weather_changed_at INTEGER NOT NULL,
               weather_next_change_at INTEGER NOT NULL,
               updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS bot_config (
               key TEXT PRIMARY KEY,
               value TEXT NOT NULL,
               updated_at INTEGER NOT NULL
             );",
        )?;
    }

    // ===== v2: daily content =====
    if current < 2 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS daily_rules (
               date_ymd TEXT PRIMARY KEY,
               rule_no INTEGER NOT NULL,
               rule_text TEXT NOT NULL,
               posted_channel_id INTEGER,
               posted_at INTEGER,
               attempts INTEGER NOT NULL DEFAULT 0,
               created_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS rule_suggestions (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               user_id INTEGER NOT NULL,
               guild_id INTEGER,
               content TEXT NOT NULL,
               created_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS daily_meals (
               date_ymd TEXT PRIMARY KEY,
               meal_text TEXT NOT NULL,
               created_at INTEGER NOT NULL,
               last_requested_at INTEGER NOT NULL
             );",
        )?;
    }

    // ===== v3: colony economy =====
    if current < 3 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aby_user_economy (
               user_id INTEGER PRIMARY KEY,
               credits INTEGER NOT NULL DEFAULT 0,
               water INTEGER NOT NULL DEFAULT 0,
               last_explore_ymd TEXT NOT NULL DEFAULT '',
               created_at INTEGER NOT NULL,
               updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS aby_guild_debt (
               guild_id INTEGER PRIMARY KEY,
               debt INTEGER NOT NULL,
               interest_rate REAL NOT NULL,
               last_interest_ymd TEXT NOT NULL,
               created_at INTEGER NOT NULL,
               updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS aby_economy_log (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               guild_id INTEGER,
               user_id INTEGER,
               kind TEXT NOT NULL,
               delta_credits INTEGER NOT NULL DEFAULT 0,
               delta_water INTEGER NOT NULL DEFAULT 0,
               delta_debt INTEGER NOT NULL DEFAULT 0,
               memo TEXT,
               created_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS aby_inventory (
               user_id INTEGER NOT NULL,
               item_key TEXT NOT NULL,
               qty INTEGER NOT NULL DEFAULT 0,
               updated_at INTEGER NOT NULL,
               PRIMARY KEY (user_id, item_key)
             );

             CREATE TABLE IF NOT EXISTS aby_buffs (
               user_id INTEGER PRIMARY KEY,
               buff_key TEXT NOT NULL DEFAULT '',
               stacks INTEGER NOT NULL DEFAULT 0,
               expires_at INTEGER NOT NULL DEFAULT 0,
               updated_at INTEGER NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_aby_econ_log_guild_time
               ON aby_economy_log(guild_id, created_at);
             CREATE INDEX IF NOT EXISTS idx_aby_inv_user ON aby_inventory(user_id);",
        )?;
    }

    // ===== v4: quest board + weekly points + explore provenance =====
    if current < 4 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aby_explore_meta (
               user_id INTEGER NOT NULL,
               date_ymd TEXT NOT NULL,
               weather TEXT NOT NULL,
               success INTEGER NOT NULL DEFAULT 0,
               credits_delta INTEGER NOT NULL DEFAULT 0,
               water_delta INTEGER NOT NULL DEFAULT 0,
               created_at INTEGER NOT NULL,
               PRIMARY KEY (user_id, date_ymd)
             );

             CREATE TABLE IF NOT EXISTS aby_quest_board (
               guild_id INTEGER NOT NULL,
               scope TEXT NOT NULL,
               board_key TEXT NOT NULL,
               quest_no INTEGER NOT NULL,
               quest_type TEXT NOT NULL,
               title TEXT NOT NULL,
               description TEXT NOT NULL,
               target_key TEXT,
               target_qty INTEGER NOT NULL DEFAULT 0,
               reward_points INTEGER NOT NULL DEFAULT 0,
               reward_credits INTEGER NOT NULL DEFAULT 0,
               reward_item_key TEXT,
               reward_item_qty INTEGER NOT NULL DEFAULT 0,
               created_at INTEGER NOT NULL,
               PRIMARY KEY (guild_id, scope, board_key, quest_no)
             );

             CREATE TABLE IF NOT EXISTS aby_quest_claims (
               guild_id INTEGER NOT NULL,
               scope TEXT NOT NULL,
               board_key TEXT NOT NULL,
               quest_no INTEGER NOT NULL,
               user_id INTEGER NOT NULL,
               claimed_at INTEGER NOT NULL,
               PRIMARY KEY (guild_id, scope, board_key, quest_no, user_id)
             );

             CREATE TABLE IF NOT EXISTS aby_weekly_points (
               guild_id INTEGER NOT NULL,
               week_key TEXT NOT NULL,
               user_id INTEGER NOT NULL,
               points INTEGER NOT NULL DEFAULT 0,
               updated_at INTEGER NOT NULL,
               PRIMARY KEY (guild_id, week_key, user_id)
             );

             CREATE INDEX IF NOT EXISTS idx_aby_qb_guild
               ON aby_quest_board(guild_id, scope, board_key);
             CREATE INDEX IF NOT EXISTS idx_aby_qc_user
               ON aby_quest_claims(user_id, claimed_at);
             CREATE INDEX IF NOT EXISTS idx_aby_wp_week
               ON aby_weekly_points(guild_id, week_key, points);",
        )?;
    }

    // ===== v5: incidents =====
    if current < 5 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS aby_incident_state (
               guild_id INTEGER PRIMARY KEY,
               next_incident_at INTEGER NOT NULL DEFAULT 0,
               last_incident_at INTEGER NOT NULL DEFAULT 0,
               updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS aby_incident_log (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               guild_id INTEGER NOT NULL,
               kind TEXT NOT NULL,
               title TEXT NOT NULL,
               description TEXT NOT NULL,
               delta_debt INTEGER NOT NULL DEFAULT 0,
               created_at INTEGER NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_aby_incident_log_guild_time
               ON aby_incident_log(guild_id, created_at);",
        )?;
    }

    // ===== v6: leveling + word-chain records =====
    if current < 6 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS xp_state (
               guild_id INTEGER NOT NULL,
               user_id INTEGER NOT NULL,
               total_xp INTEGER NOT NULL DEFAULT 0,
               level INTEGER NOT NULL DEFAULT 1,
               last_xp_at INTEGER NOT NULL DEFAULT 0,
               last_msg_sig TEXT NOT NULL DEFAULT '',
               created_at INTEGER NOT NULL,
               updated_at INTEGER NOT NULL,
               PRIMARY KEY (guild_id, user_id)
             );

             CREATE TABLE IF NOT EXISTS xp_config (
               guild_id INTEGER PRIMARY KEY,
               enabled INTEGER NOT NULL DEFAULT 1,
               chat_xp_min INTEGER NOT NULL DEFAULT 15,
               chat_xp_max INTEGER NOT NULL DEFAULT 25,
               chat_len_step INTEGER NOT NULL DEFAULT 30,
               chat_len_cap INTEGER NOT NULL DEFAULT 10,
               chat_attach_bonus INTEGER NOT NULL DEFAULT 3,
               chat_link_bonus INTEGER NOT NULL DEFAULT 0,
               chat_min_chars INTEGER NOT NULL DEFAULT 4,
               chat_repeat_window_sec INTEGER NOT NULL DEFAULT 5,
               chat_total_cap INTEGER NOT NULL DEFAULT 50,
               cmd_xp INTEGER NOT NULL DEFAULT 5,
               cmd_xp_system INTEGER NOT NULL DEFAULT 0,
               cmd_xp_game INTEGER NOT NULL DEFAULT 12,
               cmd_xp_chat INTEGER NOT NULL DEFAULT 8,
               cmd_xp_social INTEGER NOT NULL DEFAULT 8,
               interaction_xp_component INTEGER NOT NULL DEFAULT 2,
               interaction_xp_modal INTEGER NOT NULL DEFAULT 3,
               announce_levelup INTEGER NOT NULL DEFAULT 1,
               announce_style TEXT NOT NULL DEFAULT 'text',
               announce_channel_id INTEGER,
               announce_ping INTEGER NOT NULL DEFAULT 1,
               ignore_channel_ids TEXT NOT NULL DEFAULT '',
               updated_at INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS word_chain_records (
               user_id INTEGER PRIMARY KEY,
               wins INTEGER NOT NULL DEFAULT 0,
               losses INTEGER NOT NULL DEFAULT 0,
               display_name TEXT,
               updated_at INTEGER NOT NULL
             );",
        )?;
    }

    // Ensure the world singleton exists; the world scheduler only ever
    // updates it. Default: clear weather, first rotation due in 6h.
    let have_world: i64 =
        conn.query_row("SELECT COUNT(*) FROM world_state WHERE id = 1", [], |row| {
            row.get(0)
        })?;
    if have_world == 0 {
        conn.execute(
            "INSERT INTO world_state(id, weather, weather_changed_at, weather_next_change_at, updated_at)
             VALUES(1, 'clear', ?1, ?2, ?1)",
            rusqlite::params![now, now + 6 * 3600],
        )?;
    }

    conn.execute(
        "INSERT INTO schema_meta(key, value, updated_at) VALUES('schema_version', ?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        rusqlite::params![SCHEMA_VERSION.to_string(), now],
    )?;

    Ok(())
}

/// Add a column if missing (idempotent; used by future additive migrations).
#[allow(dead_code)]
fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    name: &str,
    col_def: &str,
) -> std::result::Result<(), rusqlite::Error> {
    let has: i64 = conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
        rusqlite::params![table, name],
        |row| row.get(0),
    )?;
    if has == 0 {
        conn.execute(&format!("ALTER TABLE {table} ADD COLUMN {name} {col_def}"), [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_db() -> AsyncDb {
        AsyncDb::open(":memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_migrations_create_all_tables() {
        let db = mem_db().await;
        let tables: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(std::result::Result::ok)
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap();

        for table in [
            "user_settings",
            "world_state",
            "bot_config",
            "daily_rules",
            "rule_suggestions",
            "daily_meals",
            "aby_user_economy",
            "aby_guild_debt",
            "aby_economy_log",
            "aby_inventory",
            "aby_buffs",
            "aby_explore_meta",
            "aby_quest_board",
            "aby_quest_claims",
            "aby_weekly_points",
            "aby_incident_state",
            "aby_incident_log",
            "xp_state",
            "xp_config",
            "word_chain_records",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let db = mem_db().await;
        // second run on the same connection must not fail
        db.call(|conn| {
            migrate(conn)?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_world_singleton_created_with_defaults() {
        let db = mem_db().await;
        let (weather, next_at): (String, i64) = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT weather, weather_next_change_at FROM world_state WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(weather, "clear");
        assert!(next_at > now_ts());
    }

    #[tokio::test]
    async fn test_schema_version_recorded() {
        let db = mem_db().await;
        let version: String = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT value FROM schema_meta WHERE key = 'schema_version'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[tokio::test]
    async fn test_expected_indexes_exist() {
        let db = mem_db().await;
        let indexes: Vec<String> = db
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='index' ORDER BY name")?;
                let rows = stmt
                    .query_map([], |row| row.get(0))?
                    .filter_map(std::result::Result::ok)
                    .collect();
                Ok(rows)
            })
            .await
            .unwrap();

        for name in [
            "idx_aby_econ_log_guild_time",
            "idx_aby_incident_log_guild_time",
            "idx_aby_qb_guild",
            "idx_aby_wp_week",
            "idx_aby_inv_user",
        ] {
            assert!(
                indexes.contains(&name.to_string()),
                "missing index {name}; existing: {indexes:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_async_db_is_clone_and_shares_state() {
        let db = mem_db().await;
        let db2 = db.clone();

        db.config_set("greeting", "hello").await.unwrap();
        assert_eq!(
            db2.config_get("greeting").await.unwrap().as_deref(),
            Some("hello")
        );
        assert_eq!(db2.config_get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_touch_user_settings_is_idempotent() {
        let db = mem_db().await;
        db.touch_user_settings(7).await.unwrap();
        db.touch_user_settings(7).await.unwrap();
        let (count, dm_opt_in): (i64, i64) = db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), MAX(dm_opt_in) FROM user_settings WHERE user_id = 7",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(dm_opt_in, 1);
    }

    #[tokio::test]
    async fn test_config_set_overwrites() {
        let db = mem_db().await;
        db.config_set("k", "v1").await.unwrap();
        db.config_set("k", "v2").await.unwrap();
        assert_eq!(db.config_get("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_call_returns_error_on_bad_sql() {
        let db = mem_db().await;
        let result: Result<()> = db
            .call(|conn| {
                conn.execute("INVALID SQL", [])?;
                Ok(())
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_add_column_if_missing_is_idempotent() {
        let db = mem_db().await;
        db.call(|conn| {
            add_column_if_missing(conn, "bot_config", "note", "TEXT")?;
            add_column_if_missing(conn, "bot_config", "note", "TEXT")?;
            Ok(())
        })
        .await
        .unwrap();
    }
}
