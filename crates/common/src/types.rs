use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Virtual Abydos weather. A single global value rotated by the world
/// scheduler; everything else only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weather {
    Clear,
    Cloudy,
    Sandstorm,
}

impl Weather {
    pub fn as_str(&self) -> &'static str {
        match self {
            Weather::Clear => "clear",
            Weather::Cloudy => "cloudy",
            Weather::Sandstorm => "sandstorm",
        }
    }

    /// Accepts canonical names plus common aliases (admin command input).
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "clear" | "sun" | "sunny" | "맑음" => Some(Weather::Clear),
            "cloudy" | "cloud" | "흐림" => Some(Weather::Cloudy),
            "sandstorm" | "storm" | "모래폭풍" | "모래" => Some(Weather::Sandstorm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Weather {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing precondition failures. Command handlers translate these to
/// short reply hints; background loops only log them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GameError {
    #[error("already explored today")]
    AlreadyClaimedToday,
    #[error("quest already claimed")]
    AlreadyClaimed,
    #[error("no such quest")]
    NoSuchQuest,
    #[error("not enough credits (have {have}, need {need})")]
    InsufficientCredits { have: i64, need: i64 },
    #[error("not enough {item} (have {have}, need {need})")]
    InsufficientItems { item: String, have: i64, need: i64 },
    #[error("repay progress {current}/{need}")]
    RepayShort { current: i64, need: i64 },
    #[error("exploration condition not met")]
    ExploreRequired,
    #[error("wallet is empty")]
    EmptyWallet,
    #[error("this only works inside a guild")]
    NotInGuild,
    #[error("no active session in this channel")]
    NoSession,
    #[error("a session is already running in this channel")]
    Busy,
    #[error("permission denied")]
    Unauthorized,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("monthly LLM budget exhausted")]
    BudgetExceeded,
}

/// Result error for synchronous game operations: either a typed precondition
/// the handler can phrase for the user, or a store/IO failure that only gets
/// logged.
#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Game(#[from] GameError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl OpError {
    pub fn as_game(&self) -> Option<&GameError> {
        match self {
            OpError::Game(g) => Some(g),
            OpError::Store(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weather_round_trip() {
        for w in [Weather::Clear, Weather::Cloudy, Weather::Sandstorm] {
            assert_eq!(Weather::from_str_loose(w.as_str()), Some(w));
        }
        assert_eq!(Weather::from_str_loose("STORM"), Some(Weather::Sandstorm));
        assert_eq!(Weather::from_str_loose("rain"), None);
    }

    #[test]
    fn test_weather_serde_lowercase() {
        let json = serde_json::to_string(&Weather::Sandstorm).unwrap();
        assert_eq!(json, "\"sandstorm\"");
    }

    #[test]
    fn test_op_error_exposes_game_reason() {
        let err = OpError::from(GameError::EmptyWallet);
        assert_eq!(err.as_game(), Some(&GameError::EmptyWallet));
        let err = OpError::from(anyhow::anyhow!("disk on fire"));
        assert!(err.as_game().is_none());
    }
}
