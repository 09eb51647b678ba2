use common::calendar::now_ts;
use common::db::AsyncDb;
use common::types::{GameError, OpError};

use crate::debt::log_economy;
use crate::economy::{self, inventory_qty, take_item};

/// Static recipe table. Costs and materials mirror the loot rates: a drone
/// is a real investment, a mask is an impulse buy before a storm.
#[derive(Debug, Clone, Copy)]
pub struct Recipe {
    pub key: &'static str,
    pub cost_credits: i64,
    pub required: &'static [(&'static str, i64)],
    pub output: &'static [(&'static str, i64)],
    pub flavor: &'static str,
}

pub static RECIPES: [Recipe; 3] = [
    Recipe {
        key: "mask",
        cost_credits: 2_000,
        required: &[("cloth", 2), ("filter", 1)],
        output: &[("mask", 1)],
        flavor: "Softens sandstorm penalties for 2 hours.",
    },
    Recipe {
        key: "drone",
        cost_credits: 5_000,
        required: &[("scrap", 5), ("battery", 1), ("circuit", 1)],
        output: &[("drone", 1)],
        flavor: "Next expedition earns +25% credits (single use).",
    },
    Recipe {
        key: "kit",
        cost_credits: 3_000,
        required: &[("scrap", 3), ("cloth", 1)],
        output: &[("kit", 1)],
        flavor: "Next expedition gets +10% success odds (single use).",
    },
];

pub fn find_recipe(key: &str) -> Option<&'static Recipe> {
    RECIPES.iter().find(|r| r.key == key)
}

pub static SELL_PRICES: [(&str, i64); 5] = [
    ("scrap", 800),
    ("cloth", 500),
    ("filter", 1_200),
    ("battery", 1_500),
    ("circuit", 1_800),
];

pub fn sell_price(key: &str) -> Option<i64> {
    SELL_PRICES
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, p)| *p)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CraftReceipt {
    pub credits_after: i64,
}

/// Craft one item: verify credits and materials, then deduct both and add
/// the outputs, all in one transaction.
pub async fn craft(
    db: &AsyncDb,
    user_id: i64,
    recipe_key: &str,
) -> std::result::Result<CraftReceipt, OpError> {
    let Some(recipe) = resolve_recipe(recipe_key) else {
        return Err(GameError::InvalidInput(format!("no recipe for {recipe_key}")).into());
    };

    let out = db
        .call_named("workshop.craft", move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let econ = economy::read_economy(&tx, user_id)?;
            if econ.credits < recipe.cost_credits {
                return Ok(Err(GameError::InsufficientCredits {
                    have: econ.credits,
                    need: recipe.cost_credits,
                }));
            }

            for (item, need) in recipe.required {
                let have = inventory_qty(&tx, user_id, item)?;
                if have < *need {
                    return Ok(Err(GameError::InsufficientItems {
                        item: (*item).to_string(),
                        have,
                        need: *need,
                    }));
                }
            }

            tx.execute(
                "UPDATE aby_user_economy SET credits = credits - ?2, updated_at = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, recipe.cost_credits, now_ts()],
            )?;
            for (item, need) in recipe.required {
                // Checked above; inside the same transaction this cannot go short.
                take_item(&tx, user_id, item, *need)?;
            }
            for (item, qty) in recipe.output {
                economy::add_item(&tx, user_id, item, *qty)?;
            }
            log_economy(
                &tx,
                None,
                Some(user_id),
                "craft",
                -recipe.cost_credits,
                0,
                0,
                &format!("craft:{}", recipe.key),
            )?;
            tx.commit()?;

            Ok(Ok(CraftReceipt {
                credits_after: econ.credits - recipe.cost_credits,
            }))
        })
        .await?;

    out.map_err(OpError::from)
}

fn resolve_recipe(raw: &str) -> Option<&'static Recipe> {
    let key = economy::resolve_item_key(raw)?;
    find_recipe(key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellQty {
    All,
    Exact(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SellReceipt {
    pub sold: i64,
    pub earned: i64,
    pub credits_after: i64,
}

/// Sell materials at the fixed unit price; inventory out, credits in, one
/// transaction.
pub async fn sell(
    db: &AsyncDb,
    user_id: i64,
    item_key: &str,
    qty: SellQty,
) -> std::result::Result<SellReceipt, OpError> {
    let Some(key) = economy::resolve_item_key(item_key) else {
        return Err(GameError::InvalidInput(format!("unknown item: {item_key}")).into());
    };
    let Some(unit_price) = sell_price(key) else {
        return Err(GameError::InvalidInput(format!(
            "{} is not sellable",
            economy::item_display_name(key)
        ))
        .into());
    };
    if let SellQty::Exact(n) = qty {
        if n <= 0 {
            return Err(GameError::InvalidInput("sell quantity must be positive".into()).into());
        }
    }

    let out = db
        .call_named("workshop.sell", move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

            let have = inventory_qty(&tx, user_id, key)?;
            let sold = match qty {
                SellQty::All => have,
                SellQty::Exact(n) => n,
            };
            if sold <= 0 || have < sold {
                return Ok(Err(GameError::InsufficientItems {
                    item: key.to_string(),
                    have,
                    need: sold.max(1),
                }));
            }

            let earned = sold * unit_price;
            take_item(&tx, user_id, key, sold)?;
            let econ = economy::read_economy(&tx, user_id)?;
            tx.execute(
                "UPDATE aby_user_economy SET credits = credits + ?2, updated_at = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, earned, now_ts()],
            )?;
            log_economy(
                &tx,
                None,
                Some(user_id),
                "sell",
                earned,
                0,
                0,
                &format!("sell:{key}"),
            )?;
            tx.commit()?;

            Ok(Ok(SellReceipt {
                sold,
                earned,
                credits_after: econ.credits + earned,
            }))
        })
        .await?;

    out.map_err(OpError::from)
}
