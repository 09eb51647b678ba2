use std::collections::{BTreeSet, HashMap, HashSet};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use common::types::GameError;

use crate::dict::{first_char, last_char, normalize_word, WordIndex};
use crate::rules::PhoneticRules;

/// Sessions are keyed per channel; a guild-less DM channel uses guild 0.
pub type ChannelKey = (i64, i64);

pub const TURN_TIMEOUT_SECS: u64 = 90;
pub const TURN_WARN_BEFORE_SECS: u64 = 10;

const FORFEIT_TOKENS: [&str; 4] = ["gg", "기권", "항복", "포기"];

pub fn is_forfeit(word: &str) -> bool {
    FORFEIT_TOKENS.contains(&word.to_lowercase().as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Practice,
    Pvp,
}

/// Chat line routed into an active session's turn loop.
#[derive(Debug, Clone)]
pub struct TurnMessage {
    pub author_id: i64,
    pub text: String,
}

/// Handle registered while a game runs on a channel.
pub struct SessionHandle {
    pub kind: SessionKind,
    pub host_id: i64,
    pub opponent_id: Option<i64>,
    pub input_tx: mpsc::UnboundedSender<TurnMessage>,
    pub stop: CancellationToken,
}

/// At most one session per channel. Creation goes through the mutex so a
/// concurrent second `start` loses cleanly with `Busy`.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<ChannelKey, SessionHandle>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn try_start(
        &self,
        key: ChannelKey,
        handle: SessionHandle,
    ) -> Result<(), GameError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&key) {
            return Err(GameError::Busy);
        }
        sessions.insert(key, handle);
        Ok(())
    }

    /// Remove a finished session; the turn loop calls this on every exit
    /// path.
    pub async fn end(&self, key: ChannelKey) {
        self.sessions.lock().await.remove(&key);
    }

    pub async fn is_active(&self, key: ChannelKey) -> bool {
        self.sessions.lock().await.contains_key(&key)
    }

    /// Signal the practice stop command. The host or a guild admin may stop;
    /// anyone else gets `Unauthorized`.
    pub async fn stop_practice(
        &self,
        key: ChannelKey,
        requester_id: i64,
        requester_is_admin: bool,
    ) -> Result<(), GameError> {
        let sessions = self.sessions.lock().await;
        let Some(handle) = sessions.get(&key) else {
            return Err(GameError::NoSession);
        };
        if handle.kind != SessionKind::Practice {
            return Err(GameError::NoSession);
        }
        if handle.host_id != requester_id && !requester_is_admin {
            return Err(GameError::Unauthorized);
        }
        handle.stop.cancel();
        Ok(())
    }

    /// Forward a chat message to the session on this channel, if any.
    /// Returns true when a session consumed it.
    pub async fn route_message(&self, key: ChannelKey, msg: TurnMessage) -> bool {
        let sessions = self.sessions.lock().await;
        match sessions.get(&key) {
            Some(handle) => handle.input_tx.send(msg).is_ok(),
            None => false,
        }
    }
}

/// Result of judging one submitted word against the current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveOutcome {
    Forfeit,
    AlreadyUsed,
    NotInDictionary,
    IllegalFirst { allowed: BTreeSet<char> },
    /// Legal move. `ends_game` is set when the new tail has no legal follow,
    /// which makes the mover the winner.
    Accepted { word: String, ends_game: bool },
}

/// Pure move validation: normalization, forfeit tokens, used-set, dictionary
/// membership, then the equivalence-class follow rule.
pub fn judge_move(
    index: &WordIndex,
    rules: &PhoneticRules,
    current_word: &str,
    raw_input: &str,
    used: &HashSet<String>,
) -> MoveOutcome {
    let word = normalize_word(raw_input);
    if is_forfeit(&word) {
        return MoveOutcome::Forfeit;
    }
    if used.contains(&word) {
        return MoveOutcome::AlreadyUsed;
    }
    if !index.contains(&word) {
        return MoveOutcome::NotInDictionary;
    }

    let Some(last) = last_char(current_word) else {
        return MoveOutcome::NotInDictionary;
    };
    let allowed = rules.allowed_first_chars(last);
    match first_char(&word) {
        Some(first) if allowed.contains(&first) => {}
        _ => return MoveOutcome::IllegalFirst { allowed },
    }

    let ends_game = match last_char(&word) {
        Some(new_last) => {
            let mut next_used = used.clone();
            next_used.insert(word.clone());
            !index.has_follow(new_last, rules, &next_used)
        }
        None => true,
    };

    MoveOutcome::Accepted { word, ends_game }
}
