use anyhow::Result;
use common::calendar::now_ts;
use common::db::AsyncDb;
use rusqlite::OptionalExtension;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchRecord {
    pub wins: i64,
    pub losses: i64,
    pub display_name: Option<String>,
}

pub async fn get_record(db: &AsyncDb, user_id: i64) -> Result<MatchRecord> {
    db.call_named("wordchain.record_get", move |conn| {
        Ok(conn
            .query_row(
                "SELECT wins, losses, display_name FROM word_chain_records WHERE user_id = ?1",
                [user_id],
                |row| {
                    Ok(MatchRecord {
                        wins: row.get(0)?,
                        losses: row.get(1)?,
                        display_name: row.get(2)?,
                    })
                },
            )
            .optional()?
            .unwrap_or_default())
    })
    .await
}

/// Record one finished match for a user. `won` bumps the right counter; the
/// display name refreshes opportunistically.
pub async fn record_result(
    db: &AsyncDb,
    user_id: i64,
    won: bool,
    display_name: Option<&str>,
) -> Result<()> {
    let display_name = display_name.map(ToString::to_string);
    db.call_named("wordchain.record_put", move |conn| {
        let (w, l) = if won { (1, 0) } else { (0, 1) };
        conn.execute(
            "INSERT INTO word_chain_records(user_id, wins, losses, display_name, updated_at)
             VALUES(?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
               wins = wins + excluded.wins,
               losses = losses + excluded.losses,
               display_name = COALESCE(excluded.display_name, display_name),
               updated_at = excluded.updated_at",
            rusqlite::params![user_id, w, l, display_name, now_ts()],
        )?;
        Ok(())
    })
    .await
}
