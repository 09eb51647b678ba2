use anyhow::Result;
use common::calendar::now_ts;
use common::db::AsyncDb;
use common::transport::InteractionKind;
use rand::Rng;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Per-guild leveling tunables, one row per guild with sane defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XpConfig {
    pub enabled: bool,
    pub chat_xp_min: i64,
    pub chat_xp_max: i64,
    pub chat_len_step: i64,
    pub chat_len_cap: i64,
    pub chat_attach_bonus: i64,
    pub chat_link_bonus: i64,
    pub chat_min_chars: i64,
    pub chat_repeat_window_sec: i64,
    pub chat_total_cap: i64,
    pub cmd_xp: i64,
    pub cmd_xp_system: i64,
    pub cmd_xp_game: i64,
    pub cmd_xp_chat: i64,
    pub cmd_xp_social: i64,
    pub interaction_xp_component: i64,
    pub interaction_xp_modal: i64,
    pub announce_levelup: bool,
    pub announce_style: String,
    pub announce_channel_id: Option<i64>,
    pub announce_ping: bool,
    pub ignore_channel_ids: Vec<i64>,
}

pub fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|tok| tok.trim().parse().ok())
        .collect()
}

pub async fn get_xp_config(db: &AsyncDb, guild_id: i64) -> Result<XpConfig> {
    db.call_named("xp.config", move |conn| {
        conn.execute(
            "INSERT OR IGNORE INTO xp_config(guild_id, updated_at) VALUES(?1, ?2)",
            rusqlite::params![guild_id, now_ts()],
        )?;
        let config = conn.query_row(
            "SELECT enabled, chat_xp_min, chat_xp_max, chat_len_step, chat_len_cap,
                    chat_attach_bonus, chat_link_bonus, chat_min_chars, chat_repeat_window_sec,
                    chat_total_cap, cmd_xp, cmd_xp_system, cmd_xp_game, cmd_xp_chat, cmd_xp_social,
                    interaction_xp_component, interaction_xp_modal,
                    announce_levelup, announce_style, announce_channel_id, announce_ping,
                    ignore_channel_ids
             FROM xp_config WHERE guild_id = ?1",
            [guild_id],
            |row| {
                Ok(XpConfig {
                    enabled: row.get::<_, i64>(0)? != 0,
                    chat_xp_min: row.get(1)?,
                    chat_xp_max: row.get(2)?,
                    chat_len_step: row.get(3)?,
                    chat_len_cap: row.get(4)?,
                    chat_attach_bonus: row.get(5)?,
                    chat_link_bonus: row.get(6)?,
                    chat_min_chars: row.get(7)?,
                    chat_repeat_window_sec: row.get(8)?,
                    chat_total_cap: row.get(9)?,
                    cmd_xp: row.get(10)?,
                    cmd_xp_system: row.get(11)?,
                    cmd_xp_game: row.get(12)?,
                    cmd_xp_chat: row.get(13)?,
                    cmd_xp_social: row.get(14)?,
                    interaction_xp_component: row.get(15)?,
                    interaction_xp_modal: row.get(16)?,
                    announce_levelup: row.get::<_, i64>(17)? != 0,
                    announce_style: row.get(18)?,
                    announce_channel_id: row.get(19)?,
                    announce_ping: row.get::<_, i64>(20)? != 0,
                    ignore_channel_ids: parse_id_list(&row.get::<_, String>(21)?),
                })
            },
        )?;
        Ok(config)
    })
    .await
}

/// Chat XP ranks only real content: digits, latin letters, hangul syllables.
fn effective_char_count(s: &str) -> i64 {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric() || ('가'..='힣').contains(c))
        .count() as i64
}

fn contains_url(s: &str) -> bool {
    let lower = s.to_lowercase();
    lower.contains("http://") || lower.contains("https://")
}

/// Lowercase, punctuation to spaces, whitespace collapsed. Two messages that
/// normalize identically count as repeats.
fn normalize_for_repeat(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_space = true;
    for c in s.trim().chars() {
        let mapped = if c.is_alphanumeric() {
            Some(c.to_lowercase().next().unwrap_or(c))
        } else {
            None
        };
        match mapped {
            Some(c) => {
                out.push(c);
                last_space = false;
            }
            None => {
                if !last_space {
                    out.push(' ');
                    last_space = true;
                }
            }
        }
    }
    out.trim_end().to_string()
}

fn signature(s: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// A chat message as the XP engine sees it.
#[derive(Debug, Clone)]
pub struct ChatEvent {
    pub content: String,
    pub has_attachment: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTier {
    System,
    Game,
    Chat,
    Social,
    Default,
}

/// Event shaping. Holds the in-process repeat-suppression map; correctness
/// is per-process, which is all a single-bot deployment needs.
pub struct XpEngine {
    repeat_sigs: Mutex<HashMap<(i64, i64), (i64, u64)>>,
}

impl Default for XpEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl XpEngine {
    pub fn new() -> Self {
        Self {
            repeat_sigs: Mutex::new(HashMap::new()),
        }
    }

    /// XP for one chat message; 0 means "ignore this event".
    pub fn shape_chat(
        &self,
        cfg: &XpConfig,
        guild_id: i64,
        user_id: i64,
        event: &ChatEvent,
        now: i64,
        rng: &mut impl Rng,
    ) -> i64 {
        let content = event.content.trim();

        if effective_char_count(content) < cfg.chat_min_chars.max(0) {
            return 0;
        }

        let norm = normalize_for_repeat(content);
        if !norm.is_empty() {
            let sig = signature(&norm);
            let key = (guild_id, user_id);
            let mut map = self.repeat_sigs.lock().expect("repeat map poisoned");
            if let Some((prev_ts, prev_sig)) = map.get(&key) {
                if cfg.chat_repeat_window_sec > 0
                    && *prev_sig == sig
                    && now - prev_ts <= cfg.chat_repeat_window_sec
                {
                    return 0;
                }
            }
            map.insert(key, (now, sig));
        }

        let lo = cfg.chat_xp_min.max(0);
        let hi = cfg.chat_xp_max.max(lo);
        let base = rng.gen_range(lo..=hi);

        let step = cfg.chat_len_step.max(1);
        let length_bonus = (content.chars().count() as i64 / step).clamp(0, cfg.chat_len_cap.max(0));

        let attach_bonus = if event.has_attachment {
            cfg.chat_attach_bonus.max(0)
        } else {
            0
        };
        let link_bonus = if contains_url(content) {
            cfg.chat_link_bonus.max(0)
        } else {
            0
        };

        (base + length_bonus + attach_bonus + link_bonus).clamp(0, cfg.chat_total_cap.max(1))
    }

    pub fn command_xp(cfg: &XpConfig, tier: CommandTier) -> i64 {
        match tier {
            CommandTier::System => cfg.cmd_xp_system,
            CommandTier::Game => cfg.cmd_xp_game,
            CommandTier::Chat => cfg.cmd_xp_chat,
            CommandTier::Social => cfg.cmd_xp_social,
            CommandTier::Default => cfg.cmd_xp,
        }
        .max(0)
    }

    pub fn interaction_xp(cfg: &XpConfig, kind: InteractionKind) -> i64 {
        match kind {
            InteractionKind::Component => cfg.interaction_xp_component,
            InteractionKind::ModalSubmit => cfg.interaction_xp_modal,
        }
        .max(0)
    }
}

/// XP needed to clear `level`. Monotonically increasing in `level`.
pub fn xp_to_next(level: i64) -> i64 {
    5 * level * level + 50 * level + 100
}

/// `(level, xp_into_level)` for a total. Levels start at 1.
pub fn level_for_total(total_xp: i64) -> (i64, i64) {
    let mut level = 1;
    let mut rest = total_xp.max(0);
    loop {
        let need = xp_to_next(level);
        if rest >= need {
            rest -= need;
            level += 1;
        } else {
            return (level, rest);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpAward {
    pub before_level: i64,
    pub after_level: i64,
    pub total_xp: i64,
    pub xp_into_level: i64,
    pub xp_to_next: i64,
}

impl XpAward {
    pub fn leveled_up(&self) -> bool {
        self.after_level > self.before_level
    }
}

/// Add XP and cascade any level-ups, in one transaction.
pub async fn add_user_xp(
    db: &AsyncDb,
    guild_id: i64,
    user_id: i64,
    delta: i64,
    now: i64,
) -> Result<XpAward> {
    db.call_named("xp.add", move |conn| {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT OR IGNORE INTO xp_state(guild_id, user_id, total_xp, level, created_at, updated_at)
             VALUES(?1, ?2, 0, 1, ?3, ?3)",
            rusqlite::params![guild_id, user_id, now_ts()],
        )?;
        let total: i64 = tx.query_row(
            "SELECT total_xp FROM xp_state WHERE guild_id = ?1 AND user_id = ?2",
            rusqlite::params![guild_id, user_id],
            |row| row.get(0),
        )?;

        let (before_level, _) = level_for_total(total);
        let new_total = (total + delta).max(0);
        let (after_level, xp_into_level) = level_for_total(new_total);

        tx.execute(
            "UPDATE xp_state SET total_xp = ?3, level = ?4, last_xp_at = ?5, updated_at = ?6
             WHERE guild_id = ?1 AND user_id = ?2",
            rusqlite::params![guild_id, user_id, new_total, after_level, now, now_ts()],
        )?;
        tx.commit()?;

        Ok(XpAward {
            before_level,
            after_level,
            total_xp: new_total,
            xp_into_level,
            xp_to_next: xp_to_next(after_level),
        })
    })
    .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpProgress {
    pub level: i64,
    pub total_xp: i64,
    pub xp_into_level: i64,
    pub xp_to_next: i64,
}

pub async fn get_progress(db: &AsyncDb, guild_id: i64, user_id: i64) -> Result<XpProgress> {
    db.call_named("xp.progress", move |conn| {
        use rusqlite::OptionalExtension;
        let total: i64 = conn
            .query_row(
                "SELECT total_xp FROM xp_state WHERE guild_id = ?1 AND user_id = ?2",
                rusqlite::params![guild_id, user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let (level, xp_into_level) = level_for_total(total);
        Ok(XpProgress {
            level,
            total_xp: total,
            xp_into_level,
            xp_to_next: xp_to_next(level),
        })
    })
    .await
}

pub async fn leaderboard(
    db: &AsyncDb,
    guild_id: i64,
    limit: i64,
    offset: i64,
) -> Result<Vec<(i64, i64, i64)>> {
    db.call_named("xp.leaderboard", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT user_id, level, total_xp FROM xp_state
             WHERE guild_id = ?1 AND total_xp > 0
             ORDER BY total_xp DESC, user_id ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![guild_id, limit, offset], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(std::result::Result::ok)
            .collect();
        Ok(rows)
    })
    .await
}

pub async fn reset_user_xp(db: &AsyncDb, guild_id: i64, user_id: i64) -> Result<()> {
    db.call_named("xp.reset", move |conn| {
        conn.execute(
            "UPDATE xp_state SET total_xp = 0, level = 1, updated_at = ?3
             WHERE guild_id = ?1 AND user_id = ?2",
            rusqlite::params![guild_id, user_id, now_ts()],
        )?;
        Ok(())
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    async fn mem_db() -> AsyncDb {
        AsyncDb::open(":memory:").await.unwrap()
    }

    fn chat(content: &str) -> ChatEvent {
        ChatEvent {
            content: content.to_string(),
            has_attachment: false,
        }
    }

    #[tokio::test]
    async fn test_config_defaults() {
        let db = mem_db().await;
        let cfg = get_xp_config(&db, 1).await.unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.chat_xp_min, 15);
        assert_eq!(cfg.chat_xp_max, 25);
        assert_eq!(cfg.chat_total_cap, 50);
        assert_eq!(cfg.cmd_xp_game, 12);
        assert_eq!(cfg.cmd_xp_system, 0);
        assert!(cfg.ignore_channel_ids.is_empty());
    }

    #[test]
    fn test_level_curve_is_monotonic() {
        let mut prev = 0;
        for level in 1..100 {
            let need = xp_to_next(level);
            assert!(need > prev);
            prev = need;
        }
    }

    #[test]
    fn test_level_for_total() {
        assert_eq!(level_for_total(0), (1, 0));
        // Level 1 needs 155.
        assert_eq!(level_for_total(154), (1, 154));
        assert_eq!(level_for_total(155), (2, 0));
        // Level 2 needs 220 more.
        assert_eq!(level_for_total(155 + 220), (3, 0));
    }

    #[tokio::test]
    async fn test_add_xp_accumulates_and_cascades() {
        let db = mem_db().await;

        let award = add_user_xp(&db, 1, 7, 100, 1_000).await.unwrap();
        assert_eq!(award.before_level, 1);
        assert_eq!(award.after_level, 1);
        assert!(!award.leveled_up());

        // Big grant cascades through multiple levels: 155 + 220 = 375.
        let award = add_user_xp(&db, 1, 7, 300, 1_001).await.unwrap();
        assert_eq!(award.total_xp, 400);
        assert_eq!(award.before_level, 1);
        assert_eq!(award.after_level, 3);
        assert_eq!(award.xp_into_level, 400 - 375);
        assert!(award.leveled_up());

        let progress = get_progress(&db, 1, 7).await.unwrap();
        assert_eq!(progress.level, 3);
        assert_eq!(progress.total_xp, 400);
    }

    #[tokio::test]
    async fn test_add_then_read_equals_sum() {
        let db = mem_db().await;
        let mut sum = 0;
        for (i, delta) in [13i64, 55, 7, 200].into_iter().enumerate() {
            sum += delta;
            add_user_xp(&db, 1, 2, delta, i as i64).await.unwrap();
        }
        assert_eq!(get_progress(&db, 1, 2).await.unwrap().total_xp, sum);
    }

    #[tokio::test]
    async fn test_repeat_suppression_window() {
        let db = mem_db().await;
        let cfg = get_xp_config(&db, 1).await.unwrap();
        let engine = XpEngine::new();
        let mut rng = StdRng::seed_from_u64(1);

        let first = engine.shape_chat(&cfg, 1, 7, &chat("hello abydos friends"), 100, &mut rng);
        assert!(first > 0);

        // Identical (after normalization) within the 5 s window: zero.
        let repeat = engine.shape_chat(&cfg, 1, 7, &chat("HELLO   abydos, friends!"), 103, &mut rng);
        assert_eq!(repeat, 0);

        // Same text after the window passes earns again.
        let later = engine.shape_chat(&cfg, 1, 7, &chat("hello abydos friends"), 120, &mut rng);
        assert!(later > 0);

        // Different user is unaffected.
        let other = engine.shape_chat(&cfg, 1, 8, &chat("hello abydos friends"), 103, &mut rng);
        assert!(other > 0);
    }

    #[test]
    fn test_min_chars_threshold() {
        let cfg = test_cfg();
        let engine = XpEngine::new();
        let mut rng = StdRng::seed_from_u64(2);
        assert_eq!(engine.shape_chat(&cfg, 1, 1, &chat("ok!"), 0, &mut rng), 0);
        assert_eq!(engine.shape_chat(&cfg, 1, 1, &chat("?!...~~"), 1, &mut rng), 0);
        assert!(engine.shape_chat(&cfg, 1, 1, &chat("okay then"), 2, &mut rng) > 0);
    }

    #[test]
    fn test_bonuses_and_total_cap() {
        let mut cfg = test_cfg();
        cfg.chat_xp_min = 20;
        cfg.chat_xp_max = 20;
        cfg.chat_link_bonus = 5;
        let engine = XpEngine::new();
        let mut rng = StdRng::seed_from_u64(3);

        let long_text = "a ".repeat(200) + "https://example.com";
        let xp = engine.shape_chat(
            &cfg,
            1,
            1,
            &ChatEvent {
                content: long_text,
                has_attachment: true,
            },
            0,
            &mut rng,
        );
        // 20 base + 10 len cap + 3 attach + 5 link = 38, under the cap of 50.
        assert_eq!(xp, 38);

        cfg.chat_total_cap = 30;
        let mut rng = StdRng::seed_from_u64(3);
        let xp = engine.shape_chat(
            &cfg,
            1,
            1,
            &ChatEvent {
                content: "b ".repeat(200) + "https://example.com",
                has_attachment: true,
            },
            60,
            &mut rng,
        );
        assert_eq!(xp, 30);
    }

    #[test]
    fn test_command_and_interaction_tiers() {
        let cfg = test_cfg();
        assert_eq!(XpEngine::command_xp(&cfg, CommandTier::System), 0);
        assert_eq!(XpEngine::command_xp(&cfg, CommandTier::Game), 12);
        assert_eq!(XpEngine::command_xp(&cfg, CommandTier::Default), 5);
        assert_eq!(XpEngine::interaction_xp(&cfg, InteractionKind::Component), 2);
        assert_eq!(XpEngine::interaction_xp(&cfg, InteractionKind::ModalSubmit), 3);
    }

    #[test]
    fn test_normalize_for_repeat() {
        assert_eq!(
            normalize_for_repeat("  Hello,   WORLD!!  "),
            normalize_for_repeat("hello world")
        );
        assert_ne!(
            normalize_for_repeat("hello world"),
            normalize_for_repeat("hello worlds")
        );
    }

    #[test]
    fn test_effective_chars_counts_hangul() {
        assert_eq!(effective_char_count("안녕 yume 123"), 9);
        assert_eq!(effective_char_count("!!! ... ~~~"), 0);
    }

    fn test_cfg() -> XpConfig {
        XpConfig {
            enabled: true,
            chat_xp_min: 15,
            chat_xp_max: 25,
            chat_len_step: 30,
            chat_len_cap: 10,
            chat_attach_bonus: 3,
            chat_link_bonus: 0,
            chat_min_chars: 4,
            chat_repeat_window_sec: 5,
            chat_total_cap: 50,
            cmd_xp: 5,
            cmd_xp_system: 0,
            cmd_xp_game: 12,
            cmd_xp_chat: 8,
            cmd_xp_social: 8,
            interaction_xp_component: 2,
            interaction_xp_modal: 3,
            announce_levelup: true,
            announce_style: "text".into(),
            announce_channel_id: None,
            announce_ping: true,
            ignore_channel_ids: vec![],
        }
    }
}
