use tokio::sync::mpsc;

/// Inbound chat message, already decoded by the transport adapter.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub guild_id: Option<i64>,
    pub channel_id: i64,
    pub author_id: i64,
    pub author_is_bot: bool,
    pub author_is_admin: bool,
    pub text: String,
    pub has_attachment: bool,
    pub mentions: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Component,
    ModalSubmit,
}

/// Inbound UI interaction (button press, modal submit).
#[derive(Debug, Clone)]
pub struct Interaction {
    pub kind: InteractionKind,
    pub guild_id: Option<i64>,
    pub channel_id: i64,
    pub user_id: i64,
}

/// Everything a transport adapter can feed into the core.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Message(ChatMessage),
    Interaction(Interaction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Playing,
    Watching,
    Listening,
    Competing,
}

impl PresenceKind {
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "watching" => PresenceKind::Watching,
            "listening" => PresenceKind::Listening,
            "competing" => PresenceKind::Competing,
            _ => PresenceKind::Playing,
        }
    }
}

/// Chat transports reject oversized messages; everything the core says is
/// cut to fit before it reaches the adapter.
pub const TRANSPORT_TEXT_LIMIT: usize = 1900;

/// Split text into transport-safe chunks of at most `limit` characters,
/// preferring to cut at a newline, then at a space, past the midpoint of the
/// window; otherwise cut hard at the limit.
pub fn chunk_for_transport(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(200);
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut rest = text;
    loop {
        let char_offsets: Vec<usize> = rest.char_indices().map(|(i, _)| i).collect();
        if char_offsets.len() <= limit {
            let tail = rest.trim_end();
            if !tail.is_empty() {
                chunks.push(tail.to_string());
            }
            break;
        }

        let window_end = char_offsets[limit];
        let midpoint = char_offsets[limit / 2];
        let window = &rest[..window_end];

        let cut = match window.rfind('\n') {
            Some(i) if i >= midpoint => i,
            _ => match window.rfind(' ') {
                Some(i) if i >= midpoint => i,
                _ => window_end,
            },
        };

        let head = rest[..cut].trim_end();
        if !head.is_empty() {
            chunks.push(head.to_string());
        }
        rest = rest[cut..].trim_start();
        if rest.is_empty() {
            break;
        }
    }
    chunks
}

/// Command sent to the owning transport task. The chat transport itself is an
/// external collaborator; the core only enqueues outbound work.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Say {
        channel_id: i64,
        text: String,
    },
    Presence {
        kind: PresenceKind,
        text: String,
    },
    /// Structured match summary for the admin collaborator. Best-effort.
    MatchReport(serde_json::Value),
}

/// Cloneable handle used by every subsystem that needs to emit chat output.
/// Sends never block; a closed transport just drops the event.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a message, chunked to the transport limit. Long reports go out
    /// as several messages in order rather than getting rejected downstream.
    pub fn say(&self, channel_id: i64, text: impl Into<String>) {
        let text = text.into();
        for chunk in chunk_for_transport(&text, TRANSPORT_TEXT_LIMIT) {
            let _ = self.tx.send(OutboundEvent::Say {
                channel_id,
                text: chunk,
            });
        }
    }

    pub fn presence(&self, kind: PresenceKind, text: impl Into<String>) {
        let _ = self.tx.send(OutboundEvent::Presence {
            kind,
            text: text.into(),
        });
    }

    pub fn match_report(&self, payload: serde_json::Value) {
        let _ = self.tx.send(OutboundEvent::MatchReport(payload));
    }
}
