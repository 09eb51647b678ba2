use anyhow::Result;
use common::calendar::{next_ymd, now_ts};
use common::db::AsyncDb;
use common::types::{GameError, OpError};
use rusqlite::Connection;
use rust_decimal::prelude::*;

pub const DEFAULT_DEBT: i64 = 5_000_000;
pub const DEFAULT_INTEREST_RATE: f64 = 0.005;

#[derive(Debug, Clone, PartialEq)]
pub struct GuildDebt {
    pub guild_id: i64,
    pub debt: i64,
    pub interest_rate: f64,
    pub last_interest_ymd: String,
}

/// One day of compound interest, rounded up. Exact decimal math so repeated
/// application is reproducible across platforms.
pub fn apply_interest_once(debt: i64, rate: f64) -> i64 {
    let d = Decimal::from(debt);
    let r = Decimal::from_f64(rate).unwrap_or_default();
    let new = (d * (Decimal::ONE + r)).ceil();
    new.to_i64().unwrap_or(debt).max(0)
}

/// Debt pressure bucket; scales incident severity and cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressureStage {
    pub stage: u32,
    pub label: &'static str,
}

pub fn pressure_stage(debt: i64) -> PressureStage {
    let (stage, label) = match debt {
        d if d >= 50_000_000 => (7, "collapse"),
        d if d >= 30_000_000 => (6, "critical"),
        d if d >= 20_000_000 => (5, "harsh"),
        d if d >= 8_000_000 => (4, "pressed"),
        d if d >= 4_000_000 => (3, "strained"),
        d if d >= 2_000_000 => (2, "tense"),
        d if d >= 1_000_000 => (1, "uneasy"),
        _ => (0, "calm"),
    };
    PressureStage { stage, label }
}

/// New guilds start with the default debt and interest already "applied"
/// for today, so day one charges nothing.
pub(crate) fn ensure_debt_row(
    conn: &Connection,
    guild_id: i64,
    today: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO aby_guild_debt(guild_id, debt, interest_rate, last_interest_ymd, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?5)",
        rusqlite::params![guild_id, DEFAULT_DEBT, DEFAULT_INTEREST_RATE, today, now_ts()],
    )?;
    Ok(())
}

pub(crate) fn read_debt(conn: &Connection, guild_id: i64) -> rusqlite::Result<GuildDebt> {
    conn.query_row(
        "SELECT debt, interest_rate, last_interest_ymd FROM aby_guild_debt WHERE guild_id = ?1",
        [guild_id],
        |row| {
            Ok(GuildDebt {
                guild_id,
                debt: row.get(0)?,
                interest_rate: row.get(1)?,
                last_interest_ymd: row.get(2)?,
            })
        },
    )
}

pub(crate) fn log_economy(
    conn: &Connection,
    guild_id: Option<i64>,
    user_id: Option<i64>,
    kind: &str,
    delta_credits: i64,
    delta_water: i64,
    delta_debt: i64,
    memo: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO aby_economy_log(guild_id, user_id, kind, delta_credits, delta_water, delta_debt, memo, created_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![guild_id, user_id, kind, delta_credits, delta_water, delta_debt, memo, now_ts()],
    )?;
    Ok(())
}

/// Walk `last_interest_ymd` forward one calendar day at a time, compounding
/// and logging each step. Idempotent per day: a second call with the same
/// `today` changes nothing and writes no rows.
pub(crate) fn apply_interest_upto_tx(
    conn: &Connection,
    guild_id: i64,
    today: &str,
) -> Result<GuildDebt> {
    ensure_debt_row(conn, guild_id, today)?;
    let mut state = read_debt(conn, guild_id)?;

    if state.last_interest_ymd.is_empty() {
        state.last_interest_ymd = today.to_string();
    }

    while state.last_interest_ymd.as_str() < today {
        let ymd = next_ymd(&state.last_interest_ymd)?;
        let new_debt = apply_interest_once(state.debt, state.interest_rate);
        let delta = new_debt - state.debt;
        log_economy(conn, Some(guild_id), None, "interest", 0, 0, delta, &ymd)?;
        state.debt = new_debt;
        state.last_interest_ymd = ymd;
    }

    conn.execute(
        "UPDATE aby_guild_debt SET debt = ?2, last_interest_ymd = ?3, updated_at = ?4
         WHERE guild_id = ?1",
        rusqlite::params![guild_id, state.debt, state.last_interest_ymd, now_ts()],
    )?;
    Ok(state)
}

pub async fn apply_interest_upto(db: &AsyncDb, guild_id: i64, today: &str) -> Result<GuildDebt> {
    let today = today.to_string();
    db.call_named("debt.apply_interest", move |conn| {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let state = apply_interest_upto_tx(&tx, guild_id, &today)?;
        tx.commit()?;
        Ok(state)
    })
    .await
}

/// Current debt row (created with defaults if missing). Does not compound.
pub async fn get_guild_debt(db: &AsyncDb, guild_id: i64, today: &str) -> Result<GuildDebt> {
    let today = today.to_string();
    db.call_named("debt.get", move |conn| {
        ensure_debt_row(conn, guild_id, &today)?;
        Ok(read_debt(conn, guild_id)?)
    })
    .await
}

pub async fn list_debt_guild_ids(db: &AsyncDb) -> Result<Vec<i64>> {
    db.call_named("debt.list_guilds", |conn| {
        let mut stmt = conn.prepare("SELECT guild_id FROM aby_guild_debt ORDER BY guild_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(ids)
    })
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepayAmount {
    All,
    Exact(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepayReceipt {
    pub paid: i64,
    pub old_debt: i64,
    pub new_debt: i64,
    pub credits_after: i64,
}

/// Repay guild debt from a user's wallet. Interest is caught up first so the
/// payment lands on today's figure; the amount is clamped to
/// `min(amount, credits, debt)`; everything happens in one transaction.
pub async fn repay(
    db: &AsyncDb,
    guild_id: i64,
    user_id: i64,
    amount: RepayAmount,
    today: &str,
) -> std::result::Result<RepayReceipt, OpError> {
    if let RepayAmount::Exact(n) = amount {
        if n <= 0 {
            return Err(GameError::InvalidInput("repay amount must be positive".into()).into());
        }
    }

    let today = today.to_string();
    let out = db
        .call_named("debt.repay", move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let state = apply_interest_upto_tx(&tx, guild_id, &today)?;
            let econ = crate::economy::read_economy(&tx, user_id)?;

            if econ.credits <= 0 {
                return Ok(Err(GameError::EmptyWallet));
            }
            if state.debt <= 0 {
                return Ok(Err(GameError::InvalidInput(
                    "the ledger shows no outstanding debt".into(),
                )));
            }

            let requested = match amount {
                RepayAmount::All => econ.credits,
                RepayAmount::Exact(n) => n,
            };
            let paid = requested.min(econ.credits).min(state.debt);

            tx.execute(
                "UPDATE aby_user_economy SET credits = credits - ?2, updated_at = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, paid, now_ts()],
            )?;
            tx.execute(
                "UPDATE aby_guild_debt SET debt = debt - ?2, updated_at = ?3 WHERE guild_id = ?1",
                rusqlite::params![guild_id, paid, now_ts()],
            )?;
            log_economy(&tx, Some(guild_id), Some(user_id), "repay", -paid, 0, -paid, "repay")?;

            tx.commit()?;
            Ok(Ok(RepayReceipt {
                paid,
                old_debt: state.debt,
                new_debt: state.debt - paid,
                credits_after: econ.credits - paid,
            }))
        })
        .await?;

    out.map_err(OpError::from)
}
