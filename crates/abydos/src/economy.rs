use anyhow::Result;
use common::calendar::now_ts;
use common::db::AsyncDb;
use common::types::{GameError, OpError};
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeMap;

/// Item catalog. Usables become buffs; materials feed the workshop.
pub const MASK: &str = "mask";
pub const DRONE: &str = "drone";
pub const KIT: &str = "kit";

pub const USABLE_KEYS: [&str; 3] = [MASK, DRONE, KIT];
pub const MATERIAL_KEYS: [&str; 5] = ["scrap", "cloth", "filter", "battery", "circuit"];

pub fn is_material(key: &str) -> bool {
    MATERIAL_KEYS.contains(&key)
}

pub fn item_display_name(key: &str) -> &str {
    match key {
        "mask" => "dust mask",
        "drone" => "survey drone",
        "kit" => "expedition kit",
        "scrap" => "scrap metal",
        "cloth" => "cloth strip",
        "filter" => "air filter",
        "battery" => "battery",
        "circuit" => "circuit board",
        other => other,
    }
}

/// Resolve user input (canonical keys, display names, Korean aliases) to an
/// item key.
pub fn resolve_item_key(raw: &str) -> Option<&'static str> {
    let norm: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    match norm.as_str() {
        "mask" | "dustmask" | "방진" | "마스크" | "방진마스크" => Some("mask"),
        "drone" | "surveydrone" | "드론" | "탐사드론" | "탐사용드론" => Some("drone"),
        "kit" | "expeditionkit" | "키트" | "탐사키트" => Some("kit"),
        "scrap" | "scrapmetal" | "고철" | "스크랩" | "부품" => Some("scrap"),
        "cloth" | "clothstrip" | "천" | "천조각" => Some("cloth"),
        "filter" | "airfilter" | "필터" => Some("filter"),
        "battery" | "배터리" => Some("battery"),
        "circuit" | "circuitboard" | "회로" | "기판" | "회로기판" => Some("circuit"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserEconomy {
    pub user_id: i64,
    pub credits: i64,
    pub water: i64,
    pub last_explore_ymd: String,
}

/// Upsert-on-read: every user gets an economy row on first touch.
pub(crate) fn ensure_economy_row(conn: &Connection, user_id: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO aby_user_economy(user_id, credits, water, last_explore_ymd, created_at, updated_at)
         VALUES(?1, 0, 0, '', ?2, ?2)",
        rusqlite::params![user_id, now_ts()],
    )?;
    Ok(())
}

pub(crate) fn read_economy(conn: &Connection, user_id: i64) -> rusqlite::Result<UserEconomy> {
    ensure_economy_row(conn, user_id)?;
    conn.query_row(
        "SELECT credits, water, last_explore_ymd FROM aby_user_economy WHERE user_id = ?1",
        [user_id],
        |row| {
            Ok(UserEconomy {
                user_id,
                credits: row.get(0)?,
                water: row.get(1)?,
                last_explore_ymd: row.get(2)?,
            })
        },
    )
}

pub async fn get_user_economy(db: &AsyncDb, user_id: i64) -> Result<UserEconomy> {
    db.call_named("economy.get", move |conn| Ok(read_economy(conn, user_id)?))
        .await
}

pub async fn get_user_inventory(db: &AsyncDb, user_id: i64) -> Result<BTreeMap<String, i64>> {
    db.call_named("economy.inventory", move |conn| {
        let mut stmt =
            conn.prepare("SELECT item_key, qty FROM aby_inventory WHERE user_id = ?1 AND qty > 0")?;
        let rows = stmt
            .query_map([user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(rows)
    })
    .await
}

pub(crate) fn add_item(
    conn: &Connection,
    user_id: i64,
    item_key: &str,
    qty: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO aby_inventory(user_id, item_key, qty, updated_at) VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(user_id, item_key) DO UPDATE SET qty = qty + excluded.qty, updated_at = excluded.updated_at",
        rusqlite::params![user_id, item_key, qty, now_ts()],
    )?;
    Ok(())
}

pub(crate) fn inventory_qty(
    conn: &Connection,
    user_id: i64,
    item_key: &str,
) -> rusqlite::Result<i64> {
    Ok(conn
        .query_row(
            "SELECT qty FROM aby_inventory WHERE user_id = ?1 AND item_key = ?2",
            rusqlite::params![user_id, item_key],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0))
}

/// Deduct `qty`; returns false (and changes nothing) when short.
pub(crate) fn take_item(
    conn: &Connection,
    user_id: i64,
    item_key: &str,
    qty: i64,
) -> rusqlite::Result<bool> {
    let have = inventory_qty(conn, user_id, item_key)?;
    if have < qty {
        return Ok(false);
    }
    conn.execute(
        "UPDATE aby_inventory SET qty = qty - ?3, updated_at = ?4 WHERE user_id = ?1 AND item_key = ?2",
        rusqlite::params![user_id, item_key, qty, now_ts()],
    )?;
    Ok(true)
}

pub async fn add_user_item(db: &AsyncDb, user_id: i64, item_key: &str, qty: i64) -> Result<()> {
    let item_key = item_key.to_string();
    db.call_named("economy.add_item", move |conn| {
        add_item(conn, user_id, &item_key, qty)?;
        Ok(())
    })
    .await
}

/// At most one active buff per user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buff {
    pub key: String,
    pub stacks: i64,
    pub expires_at: i64,
}

pub(crate) fn read_valid_buff(
    conn: &Connection,
    user_id: i64,
    now: i64,
) -> rusqlite::Result<Option<Buff>> {
    let row: Option<(String, i64, i64)> = conn
        .query_row(
            "SELECT buff_key, stacks, expires_at FROM aby_buffs WHERE user_id = ?1",
            [user_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((key, stacks, expires_at)) = row else {
        return Ok(None);
    };

    if key.is_empty() || stacks <= 0 || expires_at <= now {
        // Validation implicitly clears expired rows.
        conn.execute(
            "UPDATE aby_buffs SET buff_key = '', stacks = 0, expires_at = 0, updated_at = ?2
             WHERE user_id = ?1",
            rusqlite::params![user_id, now],
        )?;
        return Ok(None);
    }

    Ok(Some(Buff {
        key,
        stacks,
        expires_at,
    }))
}

/// Active-buff check; expired rows are cleared on the way through.
pub async fn ensure_buff_valid(db: &AsyncDb, user_id: i64, now: i64) -> Result<Option<Buff>> {
    db.call_named("economy.buff_valid", move |conn| {
        Ok(read_valid_buff(conn, user_id, now)?)
    })
    .await
}

pub(crate) fn write_buff(
    conn: &Connection,
    user_id: i64,
    key: &str,
    stacks: i64,
    expires_at: i64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO aby_buffs(user_id, buff_key, stacks, expires_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id) DO UPDATE SET
           buff_key = excluded.buff_key, stacks = excluded.stacks,
           expires_at = excluded.expires_at, updated_at = excluded.updated_at",
        rusqlite::params![user_id, key, stacks, expires_at, now_ts()],
    )?;
    Ok(())
}

/// Drop one stack; a buff at zero stacks is inactive.
pub async fn consume_buff_stack(db: &AsyncDb, user_id: i64) -> Result<()> {
    db.call_named("economy.buff_consume", move |conn| {
        conn.execute(
            "UPDATE aby_buffs SET stacks = MAX(0, stacks - 1), updated_at = ?2 WHERE user_id = ?1",
            rusqlite::params![user_id, now_ts()],
        )?;
        Ok(())
    })
    .await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UseReceipt {
    pub item_key: String,
    pub expires_at: i64,
    /// Key of the buff that got overwritten, if any.
    pub replaced: Option<String>,
}

/// Consume one consumable and set its buff, atomically. Replaces any
/// previous buff. Materials are refused so they can't be wasted.
pub async fn use_item(
    db: &AsyncDb,
    user_id: i64,
    item_key: &str,
    now: i64,
) -> std::result::Result<UseReceipt, OpError> {
    let Some(key) = resolve_item_key(item_key) else {
        return Err(GameError::InvalidInput(format!("unknown item: {item_key}")).into());
    };
    if !USABLE_KEYS.contains(&key) {
        return Err(GameError::InvalidInput(format!(
            "{} is a material; craft or sell it instead",
            item_display_name(key)
        ))
        .into());
    }

    let out = db
        .call_named("economy.use_item", move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            if !take_item(&tx, user_id, key, 1)? {
                return Ok(Err(GameError::InsufficientItems {
                    item: key.to_string(),
                    have: inventory_qty(&tx, user_id, key)?,
                    need: 1,
                }));
            }

            let prev = read_valid_buff(&tx, user_id, now)?;
            let expires_at = match key {
                "mask" => now + 2 * 3600,
                _ => now + 24 * 3600,
            };
            write_buff(&tx, user_id, key, 1, expires_at)?;
            tx.commit()?;

            Ok(Ok(UseReceipt {
                item_key: key.to_string(),
                expires_at,
                replaced: prev.filter(|b| b.key != key).map(|b| b.key),
            }))
        })
        .await?;

    out.map_err(OpError::from)
}
