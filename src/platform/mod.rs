pub mod discord;
pub mod slack;

use anyhow::Result;
use async_trait::async_trait;

use crate::cursor::Cursor;
use crate::transfer::StagedFile;

/// The two sides of a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Push-capable side (gateway events)
    Discord,
    /// Pull side (polled history)
    Slack,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Discord => write!(f, "discord"),
            Platform::Slack => write!(f, "slack"),
        }
    }
}

/// A downloadable file referenced by a platform message.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRef {
    pub url: String,
    pub file_name: String,
    /// Full `Authorization` header value, when the source requires one
    pub auth_header: Option<String>,
}

/// A message from either platform, reduced to what the relay needs.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub author_name: String,
    pub body: String,
    pub attachments: Vec<AttachmentRef>,
    pub is_bot: bool,
    /// Source ordering token (Slack `ts`, Discord message id)
    pub ordering_token: String,
    /// Platform system marker (join, edit, ...); `None` for conversational content
    pub subtype: Option<String>,
}

impl NormalizedMessage {
    /// `"<author>: <body>"`, the attributed form sent to the other side.
    pub fn display_text(&self) -> String {
        format!("{}: {}", self.author_name, self.body)
    }

    pub fn has_body(&self) -> bool {
        !self.body.trim().is_empty()
    }

    /// Human-authored, non-system content.
    pub fn is_conversational(&self) -> bool {
        !self.is_bot && self.subtype.is_none()
    }
}

/// Outcome of one outbound call, kept for logging only.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeliveryResult {
    pub success: bool,
    pub message_id: Option<String>,
}

impl DeliveryResult {
    pub fn from_outcome(outcome: &Result<Option<String>>) -> Self {
        match outcome {
            Ok(id) => Self {
                success: true,
                message_id: id.clone(),
            },
            Err(_) => Self::default(),
        }
    }
}

/// A raw history entry from the pull side.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistoryMessage {
    pub ts: String,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub text: String,
    pub subtype: Option<String>,
    pub files: Vec<AttachmentRef>,
}

/// Author details resolved through the user lookup API.
#[derive(Debug, Clone, PartialEq)]
pub struct UserInfo {
    pub display_name: String,
    pub is_bot: bool,
}

/// Split `text` into pieces of at most `max_chars` characters, preferring to
/// break after a newline. Concatenating the pieces gives back `text`.
pub fn split_text(text: &str, max_chars: usize) -> Vec<&str> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while let Some((hard, _)) = rest.char_indices().nth(max_chars) {
        let cut = match rest[..hard].rfind('\n') {
            Some(newline) if newline > 0 => newline + 1,
            _ => hard,
        };
        let (chunk, tail) = rest.split_at(cut);
        chunks.push(chunk);
        rest = tail;
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Destination side of a mirror: plain text sends and file uploads.
#[async_trait]
pub trait MessageSink: Send + Sync {
    fn platform(&self) -> Platform;

    /// Longest text, in characters, one send may carry.
    fn max_text_chars(&self) -> usize {
        usize::MAX
    }

    /// Send a text message, returning the destination message id if known.
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<Option<String>>;

    /// Upload a fully staged file, returning the destination id if known.
    async fn upload_file(&self, channel_id: &str, file: &StagedFile) -> Result<Option<String>>;
}

/// Pull side history API.
#[async_trait]
pub trait HistorySource: Send + Sync {
    /// Messages strictly newer than `oldest`, in whatever order the API returns.
    async fn history_since(
        &self,
        channel_id: &str,
        oldest: &Cursor,
        limit: u32,
    ) -> Result<Vec<HistoryMessage>>;

    /// The single most recent message in the channel, if any.
    async fn latest(&self, channel_id: &str) -> Result<Option<HistoryMessage>>;
}

/// User lookup API.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn lookup(&self, user_id: &str) -> Result<UserInfo>;
}
