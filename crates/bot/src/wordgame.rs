use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::calendar::now_ts;
use common::db::AsyncDb;
use common::transport::{ChatMessage, Outbound};
use common::types::GameError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wordchain::dict::{last_char, normalize_word, WordIndex};
use wordchain::engine::{self, Difficulty};
use wordchain::records;
use wordchain::rules::PhoneticRules;
use wordchain::session::{
    judge_move, MoveOutcome, SessionHandle, SessionKind, SessionManager, TurnMessage,
    TURN_TIMEOUT_SECS, TURN_WARN_BEFORE_SECS,
};

const RECRUIT_TIMEOUT_SECS: u64 = 60;
const JOIN_TOKENS: [&str; 2] = ["join", "참가"];

/// Word-chain front end: session lifecycle, turn loops, and the engine
/// opponent. One instance behind an `Arc`, shared with the command router.
pub struct WordGame {
    pub db: AsyncDb,
    pub out: Outbound,
    pub sessions: SessionManager,
    pub words: Arc<WordIndex>,
    pub rules: Arc<PhoneticRules>,
    pub suggestions: Vec<String>,
}

enum TurnInput {
    Move(String),
    Timeout,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    NoMoves,
    Timeout,
    Forfeit,
    Resigned,
    Stopped,
}

impl EndReason {
    fn as_str(self) -> &'static str {
        match self {
            EndReason::NoMoves => "no_moves",
            EndReason::Timeout => "timeout",
            EndReason::Forfeit => "forfeit",
            EndReason::Resigned => "resigned",
            EndReason::Stopped => "forced_stop",
        }
    }
}

impl WordGame {
    fn allowed_hint(&self, word: &str) -> String {
        let Some(last) = last_char(word) else {
            return String::new();
        };
        let allowed: Vec<String> = self
            .rules
            .allowed_first_chars(last)
            .into_iter()
            .map(|c| c.to_string())
            .collect();
        allowed.join(", ")
    }

    fn pick_start_word(&self) -> Option<String> {
        let mut rng = rand::thread_rng();
        let viable: Vec<&String> = self
            .suggestions
            .iter()
            .filter(|w| {
                self.words.contains(w.as_str()) && {
                    let mut used = HashSet::new();
                    used.insert((*w).clone());
                    last_char(w)
                        .map(|c| self.words.has_follow(c, &self.rules, &used))
                        .unwrap_or(false)
                }
            })
            .collect();
        if !viable.is_empty() {
            use rand::Rng;
            return Some(viable[rng.gen_range(0..viable.len())].clone());
        }
        self.words.choose_start_word(&self.rules, &mut rng)
    }

    pub async fn start_practice(self: Arc<Self>, msg: &ChatMessage, difficulty: Difficulty) {
        let key = (msg.guild_id.unwrap_or(0), msg.channel_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let handle = SessionHandle {
            kind: SessionKind::Practice,
            host_id: msg.author_id,
            opponent_id: None,
            input_tx: tx,
            stop: stop.clone(),
        };
        if self.sessions.try_start(key, handle).await.is_err() {
            self.out
                .say(msg.channel_id, "A game is already running in this channel.");
            return;
        }

        let channel_id = msg.channel_id;
        let user_id = msg.author_id;
        let game = Arc::clone(&self);
        tokio::spawn(async move {
            game.run_practice(key, channel_id, user_id, difficulty, rx, stop)
                .await;
        });
    }

    pub async fn start_pvp(self: Arc<Self>, msg: &ChatMessage) {
        let key = (msg.guild_id.unwrap_or(0), msg.channel_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let handle = SessionHandle {
            kind: SessionKind::Pvp,
            host_id: msg.author_id,
            opponent_id: None,
            input_tx: tx,
            stop: stop.clone(),
        };
        if self.sessions.try_start(key, handle).await.is_err() {
            self.out
                .say(msg.channel_id, "A game is already running in this channel.");
            return;
        }

        let channel_id = msg.channel_id;
        let host_id = msg.author_id;
        let game = Arc::clone(&self);
        tokio::spawn(async move {
            game.run_pvp(key, channel_id, host_id, rx, stop).await;
        });
    }

    pub async fn stop_practice(&self, msg: &ChatMessage) {
        let key = (msg.guild_id.unwrap_or(0), msg.channel_id);
        match self
            .sessions
            .stop_practice(key, msg.author_id, msg.author_is_admin)
            .await
        {
            Ok(()) => self.out.say(msg.channel_id, "Stopping practice."),
            Err(GameError::NoSession) => self
                .out
                .say(msg.channel_id, "No practice running in this channel."),
            Err(_) => self
                .out
                .say(msg.channel_id, "Only the host or an admin can stop this."),
        }
    }

    /// Wait for the expected speaker's next non-empty message. A single
    /// warning fires 10 s before the hard 90 s deadline; the stop signal or
    /// the deadline cancels the wait.
    async fn wait_for_input(
        &self,
        rx: &mut mpsc::UnboundedReceiver<TurnMessage>,
        expected_author: i64,
        channel_id: i64,
        stop: &CancellationToken,
        timeout_secs: u64,
    ) -> TurnInput {
        let deadline = tokio::time::sleep(Duration::from_secs(timeout_secs));
        tokio::pin!(deadline);
        let warn_at = tokio::time::sleep(Duration::from_secs(
            timeout_secs.saturating_sub(TURN_WARN_BEFORE_SECS),
        ));
        tokio::pin!(warn_at);
        let mut warned = false;

        loop {
            tokio::select! {
                _ = stop.cancelled() => return TurnInput::Stopped,
                _ = &mut deadline => return TurnInput::Timeout,
                _ = &mut warn_at, if !warned => {
                    warned = true;
                    self.out
                        .say(channel_id, format!("<@{expected_author}> 10 seconds left."));
                }
                msg = rx.recv() => match msg {
                    Some(m) if m.author_id == expected_author && !m.text.trim().is_empty() => {
                        return TurnInput::Move(m.text);
                    }
                    Some(_) => {}
                    None => return TurnInput::Stopped,
                }
            }
        }
    }

    async fn pick_bot_word(
        &self,
        current: &str,
        used: &HashSet<String>,
        difficulty: Difficulty,
    ) -> Option<String> {
        let words = Arc::clone(&self.words);
        let rules = Arc::clone(&self.rules);
        let current = current.to_string();
        let used = used.clone();
        let depth = difficulty.depth();
        tokio::task::spawn_blocking(move || {
            engine::select_bot_word(
                &words,
                &rules,
                &current,
                &used,
                depth,
                engine::DEFAULT_TIME_LIMIT,
            )
        })
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "bot word search panicked");
            None
        })
    }

    async fn run_practice(
        &self,
        key: (i64, i64),
        channel_id: i64,
        user_id: i64,
        difficulty: Difficulty,
        mut rx: mpsc::UnboundedReceiver<TurnMessage>,
        stop: CancellationToken,
    ) {
        let Some(start_word) = self.pick_start_word() else {
            self.out
                .say(channel_id, "The dictionary has no playable starting word.");
            self.sessions.end(key).await;
            return;
        };

        let mut used: HashSet<String> = HashSet::new();
        let mut history: Vec<String> = Vec::new();
        let mut current = start_word.clone();
        used.insert(current.clone());
        history.push(current.clone());

        let mut user_turn = rand::random::<bool>();
        let started_at = now_ts();

        self.out.say(
            channel_id,
            format!(
                "Practice match ({}) — first word: {start_word}\nFirst turn: {}\nNext word starts with: {}",
                difficulty.as_str(),
                if user_turn { format!("<@{user_id}>") } else { "me".to_string() },
                self.allowed_hint(&start_word)
            ),
        );

        let mut user_won = false;
        let mut reason = EndReason::Stopped;

        loop {
            if stop.is_cancelled() {
                reason = EndReason::Stopped;
                break;
            }

            if user_turn {
                match self
                    .wait_for_input(&mut rx, user_id, channel_id, &stop, TURN_TIMEOUT_SECS)
                    .await
                {
                    TurnInput::Stopped => {
                        reason = EndReason::Stopped;
                        break;
                    }
                    TurnInput::Timeout => {
                        self.out
                            .say(channel_id, format!("<@{user_id}> time's up. My win this round."));
                        user_won = false;
                        reason = EndReason::Timeout;
                        break;
                    }
                    TurnInput::Move(text) => {
                        match judge_move(&self.words, &self.rules, &current, &text, &used) {
                            MoveOutcome::Forfeit => {
                                self.out
                                    .say(channel_id, format!("<@{user_id}> forfeits. My win."));
                                user_won = false;
                                reason = EndReason::Forfeit;
                                break;
                            }
                            MoveOutcome::AlreadyUsed => {
                                self.out
                                    .say(channel_id, "That word was already played. Another one.");
                                continue;
                            }
                            MoveOutcome::NotInDictionary => {
                                self.out
                                    .say(channel_id, "Not in my dictionary. Try another word.");
                                continue;
                            }
                            MoveOutcome::IllegalFirst { allowed } => {
                                let allowed: Vec<String> =
                                    allowed.into_iter().map(|c| c.to_string()).collect();
                                self.out.say(
                                    channel_id,
                                    format!(
                                        "Rule break! After {current} the next word must start with: {}",
                                        allowed.join(", ")
                                    ),
                                );
                                continue;
                            }
                            MoveOutcome::Accepted { word, ends_game } => {
                                used.insert(word.clone());
                                history.push(word.clone());
                                current = word;
                                if ends_game {
                                    self.out.say(
                                        channel_id,
                                        "Nothing can follow that. You win this round!",
                                    );
                                    user_won = true;
                                    reason = EndReason::NoMoves;
                                    break;
                                }
                                user_turn = false;
                            }
                        }
                    }
                }
            } else {
                match self.pick_bot_word(&current, &used, difficulty).await {
                    None => {
                        self.out
                            .say(channel_id, "I've got nothing. Your win this round!");
                        user_won = true;
                        reason = EndReason::Resigned;
                        break;
                    }
                    Some(word) => {
                        self.out.say(channel_id, format!("**{word}**"));
                        used.insert(word.clone());
                        history.push(word.clone());
                        current = word;

                        let stuck = match last_char(&current) {
                            Some(last) => !self.words.has_follow(last, &self.rules, &used),
                            None => true,
                        };
                        if stuck {
                            self.out
                                .say(channel_id, "Nothing can follow that. My win this round.");
                            user_won = false;
                            reason = EndReason::NoMoves;
                            break;
                        }
                        user_turn = true;
                    }
                }
            }
        }

        self.sessions.end(key).await;

        if reason == EndReason::Stopped {
            self.out.say(channel_id, "Practice ended.");
            return;
        }

        if let Err(e) = records::record_result(&self.db, user_id, user_won, None).await {
            tracing::error!(error = %e, "practice record update failed");
        }
        self.out.say(
            channel_id,
            if user_won {
                format!("<@{user_id}> takes it. Well played.")
            } else {
                format!("<@{user_id}> better luck next round.")
            },
        );
        // The engine reports as participant 0.
        let (winner_id, loser_id) = if user_won { (user_id, 0) } else { (0, user_id) };
        self.report_match("practice", winner_id, loser_id, &history, started_at, reason);
    }

    async fn run_pvp(
        &self,
        key: (i64, i64),
        channel_id: i64,
        host_id: i64,
        mut rx: mpsc::UnboundedReceiver<TurnMessage>,
        stop: CancellationToken,
    ) {
        self.out.say(
            channel_id,
            format!(
                "<@{host_id}> opened a word-chain duel! Type `join` within {RECRUIT_TIMEOUT_SECS}s to play."
            ),
        );

        let opponent_id = match self.wait_for_join(&mut rx, host_id, &stop).await {
            Some(id) => id,
            None => {
                self.out
                    .say(channel_id, "No challenger appeared. Duel cancelled.");
                self.sessions.end(key).await;
                return;
            }
        };

        let Some(start_word) = self.pick_start_word() else {
            self.out
                .say(channel_id, "The dictionary has no playable starting word.");
            self.sessions.end(key).await;
            return;
        };

        let mut used: HashSet<String> = HashSet::new();
        let mut history: Vec<String> = Vec::new();
        let mut current = start_word.clone();
        used.insert(current.clone());
        history.push(current.clone());

        let mut turn = host_id;
        let started_at = now_ts();

        self.out.say(
            channel_id,
            format!(
                "Duel on: <@{host_id}> vs <@{opponent_id}>\nFirst word: {start_word}\nFirst turn: <@{turn}>\nNext word starts with: {}",
                self.allowed_hint(&start_word)
            ),
        );

        let mut winner: Option<i64> = None;
        let mut reason = EndReason::Stopped;
        let other = |id: i64| if id == host_id { opponent_id } else { host_id };

        loop {
            if stop.is_cancelled() {
                break;
            }
            match self
                .wait_for_input(&mut rx, turn, channel_id, &stop, TURN_TIMEOUT_SECS)
                .await
            {
                TurnInput::Stopped => break,
                TurnInput::Timeout => {
                    winner = Some(other(turn));
                    reason = EndReason::Timeout;
                    self.out.say(
                        channel_id,
                        format!("<@{turn}> ran out of time. <@{}> wins!", other(turn)),
                    );
                    break;
                }
                TurnInput::Move(text) => {
                    match judge_move(&self.words, &self.rules, &current, &text, &used) {
                        MoveOutcome::Forfeit => {
                            winner = Some(other(turn));
                            reason = EndReason::Forfeit;
                            self.out.say(
                                channel_id,
                                format!("<@{turn}> forfeits. <@{}> wins!", other(turn)),
                            );
                            break;
                        }
                        MoveOutcome::AlreadyUsed => {
                            self.out
                                .say(channel_id, "That word was already played. Another one.");
                        }
                        MoveOutcome::NotInDictionary => {
                            self.out
                                .say(channel_id, "Not in the dictionary. Try another word.");
                        }
                        MoveOutcome::IllegalFirst { allowed } => {
                            let allowed: Vec<String> =
                                allowed.into_iter().map(|c| c.to_string()).collect();
                            self.out.say(
                                channel_id,
                                format!(
                                    "Rule break! After {current} the next word must start with: {}",
                                    allowed.join(", ")
                                ),
                            );
                        }
                        MoveOutcome::Accepted { word, ends_game } => {
                            used.insert(word.clone());
                            history.push(word.clone());
                            current = word;
                            if ends_game {
                                winner = Some(turn);
                                reason = EndReason::NoMoves;
                                self.out.say(
                                    channel_id,
                                    format!("Nothing can follow that. <@{turn}> wins!"),
                                );
                                break;
                            }
                            turn = other(turn);
                        }
                    }
                }
            }
        }

        self.sessions.end(key).await;

        let Some(winner_id) = winner else {
            self.out.say(channel_id, "Duel ended.");
            return;
        };
        let loser_id = other(winner_id);
        for (uid, won) in [(winner_id, true), (loser_id, false)] {
            if let Err(e) = records::record_result(&self.db, uid, won, None).await {
                tracing::error!(error = %e, "pvp record update failed");
            }
        }
        self.report_match("pvp", winner_id, loser_id, &history, started_at, reason);
    }

    async fn wait_for_join(
        &self,
        rx: &mut mpsc::UnboundedReceiver<TurnMessage>,
        host_id: i64,
        stop: &CancellationToken,
    ) -> Option<i64> {
        let deadline = tokio::time::sleep(Duration::from_secs(RECRUIT_TIMEOUT_SECS));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return None,
                _ = &mut deadline => return None,
                msg = rx.recv() => match msg {
                    Some(m) if m.author_id != host_id
                        && JOIN_TOKENS.contains(&normalize_word(&m.text).to_lowercase().as_str()) =>
                    {
                        return Some(m.author_id);
                    }
                    Some(_) => {}
                    None => return None,
                }
            }
        }
    }

    /// Structured summary for the admin collaborator; fire-and-forget.
    fn report_match(
        &self,
        mode: &str,
        winner_id: i64,
        loser_id: i64,
        history: &[String],
        started_at: i64,
        reason: EndReason,
    ) {
        let payload = serde_json::json!({
            "mode": mode,
            "status": "finished",
            "winner_id": winner_id.to_string(),
            "loser_id": loser_id.to_string(),
            "total_rounds": history.len(),
            "started_at": started_at,
            "finished_at": now_ts(),
            "reason": reason.as_str(),
            "review_log": history.join(" → "),
        });
        self.out.match_report(payload);
    }
}
