use std::sync::Arc;

use abydos::debt::{self, RepayAmount};
use abydos::economy::{self, item_display_name};
use abydos::explore::{self, Encounter};
use abydos::incidents;
use abydos::quests::{self, Scope};
use abydos::report;
use abydos::workshop::{self, SellQty};
use abydos::world;
use abydos::xp::{self, ChatEvent, CommandTier, XpEngine};
use common::calendar::{kst, now_ts, prev_week_key, today_ymd, week_key_from_ymd};
use common::config::Glitch;
use common::db::AsyncDb;
use common::transport::{ChatMessage, Interaction, Outbound};
use common::types::{GameError, OpError, Weather};
use chrono::TimeZone;
use wordchain::engine::Difficulty;

use crate::effects;
use crate::wordgame::WordGame;

/// The prefix-triggered command surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Weather,
    WeatherSet(Weather),
    Explore,
    Wallet,
    Bag,
    Use(String),
    Craft(String),
    Sell { item: String, qty: SellQty },
    Quests,
    Claim(i64),
    Debt,
    Repay(RepayAmount),
    Rank,
    Level,
    StartWordgame,
    Practice(Difficulty),
    StopPractice,
    Report(Option<String>),
    Incidents,
    Notice(Option<i64>),
}

impl Command {
    fn tier(&self) -> CommandTier {
        match self {
            Command::Weather | Command::WeatherSet(_) | Command::Notice(_) => CommandTier::System,
            Command::Explore
            | Command::Wallet
            | Command::Bag
            | Command::Use(_)
            | Command::Craft(_)
            | Command::Sell { .. }
            | Command::Quests
            | Command::Claim(_)
            | Command::Debt
            | Command::Repay(_) => CommandTier::Game,
            Command::Rank | Command::Level => CommandTier::Social,
            _ => CommandTier::Default,
        }
    }

    fn guild_only(&self) -> bool {
        matches!(
            self,
            Command::WeatherSet(_)
                | Command::Explore
                | Command::Quests
                | Command::Claim(_)
                | Command::Debt
                | Command::Repay(_)
                | Command::Rank
                | Command::Level
                | Command::StartWordgame
                | Command::Report(_)
                | Command::Incidents
                | Command::Notice(_)
        )
    }
}

/// `None`: not a command (or an unknown one — both are ignored).
/// `Some(Err(hint))`: recognized command with bad arguments.
pub fn parse(prefix: &str, text: &str) -> Option<Result<Command, String>> {
    let body = text.trim().strip_prefix(prefix)?;
    let mut parts = body.split_whitespace();
    let name = parts.next()?.to_lowercase();
    let rest: Vec<&str> = parts.collect();

    let parsed = match name.as_str() {
        "weather" => Ok(Command::Weather),
        "weather_set" => match rest.first().and_then(|w| Weather::from_str_loose(w)) {
            Some(weather) => Ok(Command::WeatherSet(weather)),
            None => Err("usage: weather_set <clear|cloudy|sandstorm>".to_string()),
        },
        "explore" => Ok(Command::Explore),
        "wallet" => Ok(Command::Wallet),
        "bag" => Ok(Command::Bag),
        "use" => match rest.is_empty() {
            true => Err("usage: use <item>".to_string()),
            false => Ok(Command::Use(rest.join(" "))),
        },
        "craft" => match rest.is_empty() {
            true => Err("usage: craft <recipe>".to_string()),
            false => Ok(Command::Craft(rest.join(" "))),
        },
        "sell" => parse_sell(&rest),
        "quests" => Ok(Command::Quests),
        "claim" => match rest.first().and_then(|n| n.parse::<i64>().ok()) {
            Some(n) if n >= 1 => Ok(Command::Claim(n)),
            _ => Err("usage: claim <quest number>".to_string()),
        },
        "debt" => Ok(Command::Debt),
        "repay" => match rest.first().copied().and_then(parse_amount) {
            Some(amount) => Ok(Command::Repay(amount)),
            None => Err("usage: repay <amount|all> (e.g. repay 50000, repay 3만, repay all)".to_string()),
        },
        "rank" => Ok(Command::Rank),
        "level" => Ok(Command::Level),
        "start_wordgame" => Ok(Command::StartWordgame),
        "practice" => {
            let difficulty = rest
                .first()
                .and_then(|d| Difficulty::from_str_loose(d))
                .unwrap_or(Difficulty::Normal);
            Ok(Command::Practice(difficulty))
        }
        "stop_practice" => Ok(Command::StopPractice),
        "report" => Ok(Command::Report(rest.first().map(ToString::to_string))),
        "incidents" => Ok(Command::Incidents),
        "notice" => match rest.first() {
            Some(&"off") => Ok(Command::Notice(None)),
            Some(raw) => match parse_channel_ref(raw) {
                Some(id) => Ok(Command::Notice(Some(id))),
                None => Err("usage: notice <#channel|channel id|off>".to_string()),
            },
            None => Err("usage: notice <#channel|channel id|off>".to_string()),
        },
        _ => return None,
    };
    Some(parsed)
}

fn parse_sell(rest: &[&str]) -> Result<Command, String> {
    if rest.is_empty() {
        return Err("usage: sell <item> [qty|all]".to_string());
    }
    let (item_parts, qty) = match rest.split_last() {
        Some((last, head)) if !head.is_empty() => match parse_qty(last) {
            Some(qty) => (head, qty),
            None => (rest, SellQty::Exact(1)),
        },
        _ => (rest, SellQty::Exact(1)),
    };
    Ok(Command::Sell {
        item: item_parts.join(" "),
        qty,
    })
}

/// Accepts a raw channel id or a `<#123>` style mention.
fn parse_channel_ref(raw: &str) -> Option<i64> {
    let trimmed = raw
        .trim()
        .trim_start_matches("<#")
        .trim_end_matches('>');
    trimmed.parse().ok().filter(|id| *id > 0)
}

fn parse_qty(token: &str) -> Option<SellQty> {
    let t = token.trim().to_lowercase();
    if ["all", "전체", "전부", "올인"].contains(&t.as_str()) {
        return Some(SellQty::All);
    }
    t.parse::<i64>().ok().filter(|n| *n > 0).map(SellQty::Exact)
}

/// Amount grammar: plain digits (commas ok), `k`/`m`/`b` suffixes, single
/// Korean units (3만, 2억), and the all-in words.
pub fn parse_amount(raw: &str) -> Option<RepayAmount> {
    let s: String = raw.trim().to_lowercase().replace(',', "");
    if s.is_empty() {
        return None;
    }
    if ["all", "전체", "전부", "올인"].contains(&s.as_str()) {
        return Some(RepayAmount::All);
    }

    let suffixes: [(&str, i64); 6] = [
        ("k", 1_000),
        ("m", 1_000_000),
        ("b", 1_000_000_000),
        ("천", 1_000),
        ("만", 10_000),
        ("억", 100_000_000),
    ];
    for (suffix, mult) in suffixes {
        if let Some(num) = s.strip_suffix(suffix) {
            let v: i64 = num.parse().ok()?;
            return (v > 0).then_some(RepayAmount::Exact(v * mult));
        }
    }

    let v: i64 = s.parse().ok()?;
    (v > 0).then_some(RepayAmount::Exact(v))
}

fn fmt_ts(ts: i64) -> String {
    if ts <= 0 {
        return "-".to_string();
    }
    kst()
        .timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%m/%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn weather_label(weather: Weather) -> &'static str {
    match weather {
        Weather::Clear => "clear",
        Weather::Cloudy => "cloudy",
        Weather::Sandstorm => "sandstorm",
    }
}

fn error_hint(err: &GameError) -> String {
    match err {
        GameError::AlreadyClaimedToday => {
            "You already went out today. One expedition per day.".to_string()
        }
        GameError::AlreadyClaimed => "That quest reward was already collected.".to_string(),
        GameError::NoSuchQuest => "No quest with that number. Check `quests`.".to_string(),
        GameError::InsufficientCredits { have, need } => {
            format!("Not enough credits ({have}/{need}).")
        }
        GameError::InsufficientItems { item, have, need } => {
            format!("Not enough {} ({have}/{need}).", item_display_name(item))
        }
        GameError::RepayShort { current, need } => {
            format!("Repayment progress is short: {current}/{need}.")
        }
        GameError::ExploreRequired => "The exploration condition isn't met yet.".to_string(),
        GameError::EmptyWallet => "Your wallet is empty. Go explore first.".to_string(),
        GameError::NotInGuild => "That only works inside a guild channel.".to_string(),
        GameError::NoSession => "No game is running in this channel.".to_string(),
        GameError::Busy => "A game is already running in this channel.".to_string(),
        GameError::Unauthorized => "You don't have permission for that.".to_string(),
        GameError::InvalidInput(hint) => hint.clone(),
        GameError::BudgetExceeded => {
            "The radio budget for this month is used up. Plain words only for a while.".to_string()
        }
    }
}

/// Level-up announcement per the guild's configured style: `text` is a
/// one-liner, `banner` is a framed block standing in for the image banner.
fn levelup_text(cfg: &xp::XpConfig, user_id: i64, award: xp::XpAward) -> String {
    let mention = if cfg.announce_ping {
        format!("<@{user_id}> ")
    } else {
        String::new()
    };

    if cfg.announce_style.trim().eq_ignore_ascii_case("banner") {
        let banner = format!(
            "╔══════ LEVEL UP ══════╗\n\
             ║  Lv {} → Lv {}\n\
             ║  XP {}/{} (total {})\n\
             ╚══════════════════════╝",
            award.before_level,
            award.after_level,
            award.xp_into_level,
            award.xp_to_next,
            award.total_xp
        );
        return if mention.is_empty() {
            banner
        } else {
            format!("{mention}\n{banner}")
        };
    }

    format!(
        "{mention}level {} → {}! (XP {}/{}, total {})",
        award.before_level, award.after_level, award.xp_into_level, award.xp_to_next, award.total_xp
    )
}

/// Command router plus the inbound-event entry points. One instance per
/// process; cheap to clone behind Arc.
pub struct App {
    pub db: AsyncDb,
    pub out: Outbound,
    pub wordgame: Arc<WordGame>,
    pub xp: XpEngine,
    pub glitch: Glitch,
    pub prefix: String,
}

impl App {
    /// Weather-aware send: sandstorms add radio noise, everything else goes
    /// out untouched.
    async fn say(&self, channel_id: i64, text: impl Into<String>) {
        let text = text.into();
        let weather = world::get_world_state(&self.db)
            .await
            .map(|s| s.weather)
            .unwrap_or(Weather::Clear);
        let parts = {
            let mut rng = rand::thread_rng();
            effects::radio_shape(&self.glitch, weather, &text, &mut rng)
        };
        for part in parts {
            self.out.say(channel_id, part);
        }
    }

    /// Inbound chat. Commands are dispatched; everything else feeds the
    /// word-game router and the chat XP shaper.
    pub async fn handle_message(&self, msg: &ChatMessage) {
        if msg.author_is_bot {
            return;
        }
        if let Err(e) = self.db.touch_user_settings(msg.author_id).await {
            tracing::debug!(error = %e, "user settings touch failed");
        }

        match parse(&self.prefix, &msg.text) {
            Some(Ok(command)) => {
                let tier = command.tier();
                let ok = self.dispatch(msg, command).await;
                if ok {
                    self.award_command_xp(msg, tier).await;
                }
            }
            Some(Err(usage)) => self.say(msg.channel_id, usage).await,
            None => {
                let key = (msg.guild_id.unwrap_or(0), msg.channel_id);
                self.wordgame
                    .sessions
                    .route_message(
                        key,
                        wordchain::session::TurnMessage {
                            author_id: msg.author_id,
                            text: msg.text.clone(),
                        },
                    )
                    .await;
                self.award_chat_xp(msg).await;
            }
        }
    }

    pub async fn handle_interaction(&self, interaction: &Interaction) {
        let Some(guild_id) = interaction.guild_id else {
            return;
        };
        let Ok(cfg) = xp::get_xp_config(&self.db, guild_id).await else {
            return;
        };
        if !cfg.enabled || cfg.ignore_channel_ids.contains(&interaction.channel_id) {
            return;
        }
        let delta = XpEngine::interaction_xp(&cfg, interaction.kind);
        if delta <= 0 {
            return;
        }
        match xp::add_user_xp(&self.db, guild_id, interaction.user_id, delta, now_ts()).await {
            Ok(award) if award.leveled_up() => {
                self.announce_levelup(&cfg, guild_id, interaction.channel_id, interaction.user_id, award)
                    .await;
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "interaction xp failed"),
        }
    }

    async fn award_chat_xp(&self, msg: &ChatMessage) {
        let Some(guild_id) = msg.guild_id else { return };
        let Ok(cfg) = xp::get_xp_config(&self.db, guild_id).await else {
            return;
        };
        if !cfg.enabled || cfg.ignore_channel_ids.contains(&msg.channel_id) {
            return;
        }

        let event = ChatEvent {
            content: msg.text.clone(),
            has_attachment: msg.has_attachment,
        };
        let now = now_ts();
        let delta = {
            let mut rng = rand::thread_rng();
            self.xp
                .shape_chat(&cfg, guild_id, msg.author_id, &event, now, &mut rng)
        };
        if delta <= 0 {
            return;
        }
        match xp::add_user_xp(&self.db, guild_id, msg.author_id, delta, now).await {
            Ok(award) if award.leveled_up() => {
                self.announce_levelup(&cfg, guild_id, msg.channel_id, msg.author_id, award)
                    .await;
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "chat xp failed"),
        }
    }

    async fn award_command_xp(&self, msg: &ChatMessage, tier: CommandTier) {
        let Some(guild_id) = msg.guild_id else { return };
        let Ok(cfg) = xp::get_xp_config(&self.db, guild_id).await else {
            return;
        };
        if !cfg.enabled || cfg.ignore_channel_ids.contains(&msg.channel_id) {
            return;
        }
        let delta = XpEngine::command_xp(&cfg, tier);
        if delta <= 0 {
            return;
        }
        match xp::add_user_xp(&self.db, guild_id, msg.author_id, delta, now_ts()).await {
            Ok(award) if award.leveled_up() => {
                self.announce_levelup(&cfg, guild_id, msg.channel_id, msg.author_id, award)
                    .await;
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "command xp failed"),
        }
    }

    async fn announce_levelup(
        &self,
        cfg: &xp::XpConfig,
        _guild_id: i64,
        fallback_channel: i64,
        user_id: i64,
        award: xp::XpAward,
    ) {
        if !cfg.announce_levelup {
            return;
        }
        let channel = cfg.announce_channel_id.unwrap_or(fallback_channel);
        self.out.say(channel, levelup_text(cfg, user_id, award));
    }

    /// Returns true when the command completed (for XP purposes); typed
    /// precondition failures still count as handled but earn nothing.
    async fn dispatch(&self, msg: &ChatMessage, command: Command) -> bool {
        if command.guild_only() && msg.guild_id.is_none() {
            self.say(msg.channel_id, error_hint(&GameError::NotInGuild)).await;
            return false;
        }

        let result = match command {
            Command::Weather => self.cmd_weather(msg).await,
            Command::WeatherSet(weather) => self.cmd_weather_set(msg, weather).await,
            Command::Explore => self.cmd_explore(msg).await,
            Command::Wallet => self.cmd_wallet(msg).await,
            Command::Bag => self.cmd_bag(msg).await,
            Command::Use(item) => self.cmd_use(msg, &item).await,
            Command::Craft(recipe) => self.cmd_craft(msg, &recipe).await,
            Command::Sell { item, qty } => self.cmd_sell(msg, &item, qty).await,
            Command::Quests => self.cmd_quests(msg).await,
            Command::Claim(n) => self.cmd_claim(msg, n).await,
            Command::Debt => self.cmd_debt(msg).await,
            Command::Repay(amount) => self.cmd_repay(msg, amount).await,
            Command::Rank => self.cmd_rank(msg).await,
            Command::Level => self.cmd_level(msg).await,
            Command::StartWordgame => {
                self.wordgame.clone().start_pvp(msg).await;
                Ok(())
            }
            Command::Practice(difficulty) => {
                self.wordgame.clone().start_practice(msg, difficulty).await;
                Ok(())
            }
            Command::StopPractice => {
                self.wordgame.stop_practice(msg).await;
                Ok(())
            }
            Command::Report(week) => self.cmd_report(msg, week).await,
            Command::Incidents => self.cmd_incidents(msg).await,
            Command::Notice(channel) => self.cmd_notice(msg, channel).await,
        };

        match result {
            Ok(()) => true,
            Err(OpError::Game(err)) => {
                self.say(msg.channel_id, error_hint(&err)).await;
                false
            }
            Err(OpError::Store(err)) => {
                tracing::error!(error = %err, "command failed");
                self.say(msg.channel_id, "Something jammed in the office machinery. Try again soon.")
                    .await;
                false
            }
        }
    }

    async fn cmd_weather(&self, msg: &ChatMessage) -> Result<(), OpError> {
        world::rotate_if_due(&self.db, now_ts()).await?;
        let state = world::get_world_state(&self.db).await?;
        self.say(
            msg.channel_id,
            format!(
                "Abydos weather: {}\nlast change: {}\nnext change: {}",
                weather_label(state.weather),
                fmt_ts(state.changed_at),
                fmt_ts(state.next_change_at)
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_weather_set(&self, msg: &ChatMessage, weather: Weather) -> Result<(), OpError> {
        if !msg.author_is_admin {
            return Err(GameError::Unauthorized.into());
        }
        let now = now_ts();
        let next_at = {
            let mut rng = rand::thread_rng();
            world::roll_next_change_at(&mut rng, now)
        };
        world::set_weather(&self.db, weather, now, next_at).await?;
        self.say(
            msg.channel_id,
            format!(
                "Weather forced to {}. Next natural change around {}.",
                weather_label(weather),
                fmt_ts(next_at)
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_explore(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let today = today_ymd();
        let user_id = msg.author_id;

        let econ = economy::get_user_economy(&self.db, user_id).await?;
        if econ.last_explore_ymd == today {
            return Err(GameError::AlreadyClaimedToday.into());
        }

        world::rotate_if_due(&self.db, now_ts()).await?;
        let state = world::get_world_state(&self.db).await?;
        let buff = economy::ensure_buff_valid(&self.db, user_id, now_ts()).await?;

        let roll = {
            let mut rng = rand::thread_rng();
            explore::roll_explore(&mut rng, state.weather, buff.as_ref())
        };

        let Some(commit) =
            explore::claim_daily_explore(&self.db, user_id, msg.guild_id, &today, &roll).await?
        else {
            // Lost a race with a concurrent claim; consume nothing.
            return Err(GameError::AlreadyClaimedToday.into());
        };
        explore::finish_explore(&self.db, user_id, &roll).await?;

        let mut lines = vec![format!(
            "Expedition result — weather {}{}",
            weather_label(roll.weather),
            if roll.mask_applied {
                " (mask: counted as cloudy)"
            } else {
                ""
            }
        )];
        lines.push(
            if roll.success {
                "Found something in the sand!"
            } else {
                "Mostly sand today. Retreat."
            }
            .to_string(),
        );
        lines.push(format!("Credits: {:+}", roll.credits));
        if roll.water > 0 {
            lines.push(format!("Water: +{}", roll.water));
        }
        match roll.encounter {
            Some(Encounter::ForgottenCache(bonus)) => {
                lines.push(format!("Encounter: a forgotten cache (+{bonus} credits)"));
            }
            Some(Encounter::SlippedInSand(loss)) => {
                lines.push(format!("Encounter: slipped in the sand (-{loss} credits)"));
            }
            Some(Encounter::FoundMask) => lines.push("Encounter: picked up a dust mask".to_string()),
            Some(Encounter::FoundDrone) => {
                lines.push("Encounter: salvaged a survey drone".to_string());
            }
            Some(Encounter::FoundWater) => lines.push("Encounter: found a canteen (+1 water)".to_string()),
            None => {}
        }
        for (key, qty) in &roll.loot {
            lines.push(format!("Loot: {} x{qty}", item_display_name(key)));
        }
        if roll.drone_applied {
            lines.push("Buff: survey drone +25% applied".to_string());
        }
        if roll.kit_applied {
            lines.push("Buff: expedition kit +10% success applied".to_string());
        }
        lines.push(format!(
            "Holdings: {} credits, {} water",
            commit.credits_after, commit.water_after
        ));
        self.say(msg.channel_id, lines.join("\n")).await;
        Ok(())
    }

    async fn cmd_wallet(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let econ = economy::get_user_economy(&self.db, msg.author_id).await?;
        self.say(
            msg.channel_id,
            format!("Wallet — credits: {}, water: {}", econ.credits, econ.water),
        )
        .await;
        Ok(())
    }

    async fn cmd_bag(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let inventory = economy::get_user_inventory(&self.db, msg.author_id).await?;
        let buff = economy::ensure_buff_valid(&self.db, msg.author_id, now_ts()).await?;

        let mut lines = vec!["Bag contents:".to_string()];
        match buff {
            Some(b) => lines.push(format!(
                "Active buff: {} (stacks {}, expires {})",
                item_display_name(&b.key),
                b.stacks,
                fmt_ts(b.expires_at)
            )),
            None => lines.push("Active buff: none".to_string()),
        }
        if inventory.is_empty() {
            lines.push("Items: (empty)".to_string());
        } else {
            for (key, qty) in &inventory {
                lines.push(format!("- {}: {qty}", item_display_name(key)));
            }
        }
        self.say(msg.channel_id, lines.join("\n")).await;
        Ok(())
    }

    async fn cmd_use(&self, msg: &ChatMessage, item: &str) -> Result<(), OpError> {
        let receipt = economy::use_item(&self.db, msg.author_id, item, now_ts()).await?;
        let mut text = format!(
            "{} ready (expires {}).",
            item_display_name(&receipt.item_key),
            fmt_ts(receipt.expires_at)
        );
        if let Some(replaced) = receipt.replaced {
            text.push_str(&format!(
                " Your previous {} buff was replaced.",
                item_display_name(&replaced)
            ));
        }
        self.say(msg.channel_id, text).await;
        Ok(())
    }

    async fn cmd_craft(&self, msg: &ChatMessage, recipe: &str) -> Result<(), OpError> {
        let receipt = workshop::craft(&self.db, msg.author_id, recipe).await?;
        self.say(
            msg.channel_id,
            format!("Crafted! Credits left: {}", receipt.credits_after),
        )
        .await;
        Ok(())
    }

    async fn cmd_sell(&self, msg: &ChatMessage, item: &str, qty: SellQty) -> Result<(), OpError> {
        let receipt = workshop::sell(&self.db, msg.author_id, item, qty).await?;
        self.say(
            msg.channel_id,
            format!(
                "Sold {} for +{} credits. Balance: {}",
                receipt.sold, receipt.earned, receipt.credits_after
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_quests(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let today = today_ymd();
        let week_key = week_key_from_ymd(&today).map_err(OpError::Store)?;

        quests::ensure_daily_board(&self.db, guild_id, &today).await?;
        quests::ensure_weekly_board(&self.db, guild_id, &week_key).await?;

        let mut lines = vec![format!("Quest board — daily {today} / weekly {week_key}")];
        let boards = [
            (Scope::Daily, today.clone(), 0, "[daily]"),
            (Scope::Weekly, week_key.clone(), quests::DAILY_QUEST_COUNT, "[weekly]"),
        ];
        for (scope, board_key, offset, header) in boards {
            lines.push(header.to_string());
            for quest in quests::get_board(&self.db, guild_id, scope, &board_key).await? {
                let claimed = quests::is_claimed(
                    &self.db,
                    guild_id,
                    scope,
                    &board_key,
                    quest.quest_no,
                    msg.author_id,
                )
                .await?;
                let progress = if claimed {
                    "done".to_string()
                } else {
                    match quests::quest_progress(
                        &self.db,
                        guild_id,
                        msg.author_id,
                        scope,
                        &board_key,
                        &quest,
                        &today,
                    )
                    .await?
                    {
                        quests::QuestProgress::Deliver { have, need } => format!("{have}/{need}"),
                        quests::QuestProgress::Repay { current, need } => format!("{current}/{need}"),
                        quests::QuestProgress::Explore { done } => {
                            (if done { "1/1" } else { "0/1" }).to_string()
                        }
                    }
                };
                let mut reward = Vec::new();
                if quest.reward_points > 0 {
                    reward.push(format!("{}pt", quest.reward_points));
                }
                if quest.reward_credits > 0 {
                    reward.push(format!("{}cr", quest.reward_credits));
                }
                if let (Some(key), qty) = (&quest.reward_item_key, quest.reward_item_qty) {
                    if qty > 0 {
                        reward.push(format!("{} x{qty}", item_display_name(key)));
                    }
                }
                lines.push(format!(
                    "{}. {} — {} ({progress}) reward: {}",
                    offset + quest.quest_no,
                    quest.title,
                    quest.description,
                    reward.join(" + ")
                ));
            }
        }
        lines.push("Collect with `claim <n>`.".to_string());
        self.say(msg.channel_id, lines.join("\n")).await;
        Ok(())
    }

    async fn cmd_claim(&self, msg: &ChatMessage, n: i64) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let today = today_ymd();
        let week_key = week_key_from_ymd(&today).map_err(OpError::Store)?;

        quests::ensure_daily_board(&self.db, guild_id, &today).await?;
        quests::ensure_weekly_board(&self.db, guild_id, &week_key).await?;

        let (scope, board_key, quest_no) = if (1..=quests::DAILY_QUEST_COUNT).contains(&n) {
            (Scope::Daily, today.clone(), n)
        } else if n <= quests::DAILY_QUEST_COUNT + quests::WEEKLY_QUEST_COUNT {
            (Scope::Weekly, week_key.clone(), n - quests::DAILY_QUEST_COUNT)
        } else {
            return Err(GameError::NoSuchQuest.into());
        };

        let receipt = quests::claim(
            &self.db,
            guild_id,
            msg.author_id,
            scope,
            &board_key,
            quest_no,
            &today,
        )
        .await?;

        let mut reward = Vec::new();
        if receipt.reward_points > 0 {
            reward.push(format!("{}pt", receipt.reward_points));
        }
        if receipt.reward_credits > 0 {
            reward.push(format!("{}cr", receipt.reward_credits));
        }
        if let Some((key, qty)) = &receipt.reward_item {
            reward.push(format!("{} x{qty}", item_display_name(key)));
        }
        self.say(
            msg.channel_id,
            format!(
                "Delivered: {} — reward {}. Weekly points: {} ({})",
                receipt.quest_title,
                reward.join(" + "),
                receipt.points_after,
                receipt.week_key
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_debt(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let today = today_ymd();
        let state = debt::apply_interest_upto(&self.db, guild_id, &today).await?;
        let stage = debt::pressure_stage(state.debt);
        let tomorrow = debt::apply_interest_once(state.debt, state.interest_rate);
        self.say(
            msg.channel_id,
            format!(
                "Abydos ledger — debt: {} credits (pressure: {})\n\
                 daily rate: {:.2}% (applied through {})\n\
                 tomorrow's interest: +{} (projected {})",
                state.debt,
                stage.label,
                state.interest_rate * 100.0,
                state.last_interest_ymd,
                tomorrow - state.debt,
                tomorrow
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_repay(&self, msg: &ChatMessage, amount: RepayAmount) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let receipt = debt::repay(&self.db, guild_id, msg.author_id, amount, &today_ymd()).await?;
        self.say(
            msg.channel_id,
            format!(
                "Repaid {} credits. Debt {} → {}. Your wallet: {}",
                receipt.paid, receipt.old_debt, receipt.new_debt, receipt.credits_after
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_rank(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let rows = xp::leaderboard(&self.db, guild_id, 10, 0).await?;
        if rows.is_empty() {
            self.say(msg.channel_id, "No XP on the board yet.").await;
            return Ok(());
        }
        let mut lines = vec!["XP ranking:".to_string()];
        for (i, (user_id, level, total)) in rows.iter().enumerate() {
            lines.push(format!("{}. <@{user_id}> — Lv {level} ({total} XP)", i + 1));
        }
        self.say(msg.channel_id, lines.join("\n")).await;
        Ok(())
    }

    async fn cmd_level(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let target = msg.mentions.first().copied().unwrap_or(msg.author_id);
        let progress = xp::get_progress(&self.db, guild_id, target).await?;
        self.say(
            msg.channel_id,
            format!(
                "<@{target}> | Lv {} | XP {}/{} (total {})",
                progress.level, progress.xp_into_level, progress.xp_to_next, progress.total_xp
            ),
        )
        .await;
        Ok(())
    }

    async fn cmd_report(&self, msg: &ChatMessage, week: Option<String>) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let today = today_ymd();
        let week_key = match week {
            Some(w) if w.contains("-W") => w,
            Some(other) => {
                return Err(
                    GameError::InvalidInput(format!("not a week key: {other} (try 2025-W02)"))
                        .into(),
                )
            }
            None => prev_week_key(&today).map_err(OpError::Store)?,
        };
        let text = report::render_weekly_report(&self.db, guild_id, &week_key, &today).await?;
        self.say(msg.channel_id, text).await;
        Ok(())
    }

    async fn cmd_notice(&self, msg: &ChatMessage, channel: Option<i64>) -> Result<(), OpError> {
        if !msg.author_is_admin {
            return Err(GameError::Unauthorized.into());
        }
        let guild_id = msg.guild_id.expect("guild_only checked");
        let key = incidents::notice_channel_key(guild_id);
        match channel {
            Some(id) => {
                self.db
                    .config_set(&key, &id.to_string())
                    .await
                    .map_err(OpError::Store)?;
                self.say(
                    msg.channel_id,
                    format!("Incident and weekly-report notices will go to <#{id}>."),
                )
                .await;
            }
            None => {
                self.db.config_set(&key, "").await.map_err(OpError::Store)?;
                self.say(msg.channel_id, "Abydos notices turned off.").await;
            }
        }
        Ok(())
    }

    async fn cmd_incidents(&self, msg: &ChatMessage) -> Result<(), OpError> {
        let guild_id = msg.guild_id.expect("guild_only checked");
        let rows = incidents::recent_incidents(&self.db, guild_id, 8).await?;
        if rows.is_empty() {
            self.say(msg.channel_id, "No incidents on record. Suspiciously quiet.")
                .await;
            return Ok(());
        }
        let mut lines = vec!["Recent incidents:".to_string()];
        for row in rows {
            let sign = if row.delta_debt >= 0 { "+" } else { "" };
            lines.push(format!(
                "[{}] {} ({sign}{} debt) — {}",
                fmt_ts(row.created_at),
                row.title,
                row.delta_debt,
                row.description
            ));
        }
        self.say(msg.channel_id, lines.join("\n")).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(parse("!", "!weather"), Some(Ok(Command::Weather)));
        assert_eq!(parse("!", "  !explore  "), Some(Ok(Command::Explore)));
        assert_eq!(parse("!", "!claim 4"), Some(Ok(Command::Claim(4))));
        assert_eq!(
            parse("!", "!weather_set sandstorm"),
            Some(Ok(Command::WeatherSet(Weather::Sandstorm)))
        );
        assert_eq!(
            parse("!", "!practice hard"),
            Some(Ok(Command::Practice(Difficulty::Hard)))
        );
        assert_eq!(
            parse("!", "!practice"),
            Some(Ok(Command::Practice(Difficulty::Normal)))
        );
    }

    #[test]
    fn test_parse_non_commands_ignored() {
        assert_eq!(parse("!", "hello there"), None);
        assert_eq!(parse("!", "!definitely_not_a_command"), None);
        assert_eq!(parse("?", "!weather"), None);
    }

    #[test]
    fn test_parse_usage_errors() {
        assert!(matches!(parse("!", "!weather_set fog"), Some(Err(_))));
        assert!(matches!(parse("!", "!claim zero"), Some(Err(_))));
        assert!(matches!(parse("!", "!use"), Some(Err(_))));
        assert!(matches!(parse("!", "!repay"), Some(Err(_))));
    }

    #[test]
    fn test_parse_sell_variants() {
        assert_eq!(
            parse("!", "!sell scrap 3"),
            Some(Ok(Command::Sell {
                item: "scrap".into(),
                qty: SellQty::Exact(3)
            }))
        );
        assert_eq!(
            parse("!", "!sell scrap all"),
            Some(Ok(Command::Sell {
                item: "scrap".into(),
                qty: SellQty::All
            }))
        );
        assert_eq!(
            parse("!", "!sell scrap"),
            Some(Ok(Command::Sell {
                item: "scrap".into(),
                qty: SellQty::Exact(1)
            }))
        );
        // Multi-word item name without quantity.
        assert_eq!(
            parse("!", "!sell dust mask"),
            Some(Ok(Command::Sell {
                item: "dust mask".into(),
                qty: SellQty::Exact(1)
            }))
        );
    }

    #[test]
    fn test_parse_amount_grammar() {
        assert_eq!(parse_amount("50000"), Some(RepayAmount::Exact(50_000)));
        assert_eq!(parse_amount("1,234"), Some(RepayAmount::Exact(1_234)));
        assert_eq!(parse_amount("3k"), Some(RepayAmount::Exact(3_000)));
        assert_eq!(parse_amount("2m"), Some(RepayAmount::Exact(2_000_000)));
        assert_eq!(parse_amount("1b"), Some(RepayAmount::Exact(1_000_000_000)));
        assert_eq!(parse_amount("3만"), Some(RepayAmount::Exact(30_000)));
        assert_eq!(parse_amount("2억"), Some(RepayAmount::Exact(200_000_000)));
        assert_eq!(parse_amount("5천"), Some(RepayAmount::Exact(5_000)));
        assert_eq!(parse_amount("all"), Some(RepayAmount::All));
        assert_eq!(parse_amount("전체"), Some(RepayAmount::All));
        assert_eq!(parse_amount("0"), None);
        assert_eq!(parse_amount("-5"), None);
        assert_eq!(parse_amount("lots"), None);
    }

    #[test]
    fn test_levelup_text_styles_differ() {
        let mut cfg = xp_cfg("text");
        let award = xp::XpAward {
            before_level: 2,
            after_level: 3,
            total_xp: 400,
            xp_into_level: 25,
            xp_to_next: 295,
        };

        let text = levelup_text(&cfg, 9, award);
        assert!(text.starts_with("<@9> level 2 → 3"));
        assert!(!text.contains('\n'));

        cfg.announce_style = "banner".into();
        let banner = levelup_text(&cfg, 9, award);
        assert!(banner.contains("LEVEL UP"));
        assert!(banner.contains("Lv 2 → Lv 3"));
        assert!(banner.contains('\n'));
        assert_ne!(text, banner);

        // Ping toggle drops the mention in both styles.
        cfg.announce_ping = false;
        assert!(!levelup_text(&cfg, 9, award).contains("<@9>"));
    }

    fn xp_cfg(style: &str) -> xp::XpConfig {
        xp::XpConfig {
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
            announce_style: style.into(),
            announce_channel_id: None,
            announce_ping: true,
            ignore_channel_ids: vec![],
        }
    }

    #[test]
    fn test_parse_notice() {
        assert_eq!(parse("!", "!notice 12345"), Some(Ok(Command::Notice(Some(12345)))));
        assert_eq!(parse("!", "!notice <#777>"), Some(Ok(Command::Notice(Some(777)))));
        assert_eq!(parse("!", "!notice off"), Some(Ok(Command::Notice(None))));
        assert!(matches!(parse("!", "!notice here"), Some(Err(_))));
    }

    #[test]
    fn test_command_tiers() {
        assert_eq!(Command::Weather.tier(), CommandTier::System);
        assert_eq!(Command::Explore.tier(), CommandTier::Game);
        assert_eq!(Command::Rank.tier(), CommandTier::Social);
        assert_eq!(Command::StartWordgame.tier(), CommandTier::Default);
    }

    #[test]
    fn test_guild_only_flags() {
        assert!(Command::Explore.guild_only());
        assert!(Command::Repay(RepayAmount::All).guild_only());
        assert!(!Command::Wallet.guild_only());
        assert!(!Command::Craft("mask".into()).guild_only());
    }
}
