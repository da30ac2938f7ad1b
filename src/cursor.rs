use std::cmp::Ordering;

use tracing::{debug, error, info, warn};

use crate::platform::HistorySource;

const FRACTION_DIGITS: usize = 9;

/// Position in a pull-side history: a Slack `ts` such as `1712345678.000200`.
///
/// Ordering is numeric (seconds, then fraction) without going through a
/// float, so sixteen-digit timestamps compare exactly.
#[derive(Debug, Clone)]
pub struct Cursor {
    raw: String,
    key: (u64, u64),
}

impl Cursor {
    /// "Beginning of time", used when the channel is empty or seeding failed.
    pub fn sentinel() -> Self {
        Self {
            raw: "0".to_string(),
            key: (0, 0),
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        let (secs, frac) = match token.split_once('.') {
            Some((secs, frac)) => (secs, frac),
            None => (token, ""),
        };
        if secs.is_empty()
            || !secs.bytes().all(|b| b.is_ascii_digit())
            || !frac.bytes().all(|b| b.is_ascii_digit())
            || frac.len() > FRACTION_DIGITS
        {
            return None;
        }

        let secs = secs.parse::<u64>().ok()?;
        let frac = if frac.is_empty() {
            0
        } else {
            format!("{:0<width$}", frac, width = FRACTION_DIGITS)
                .parse::<u64>()
                .ok()?
        };

        Some(Self {
            raw: token.to_string(),
            key: (secs, frac),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_sentinel(&self) -> bool {
        self.key == (0, 0)
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Cursor {}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Per-mirror pull state. Owned by exactly one relay loop.
#[derive(Debug, Clone)]
pub struct RelayState {
    last_seen: Cursor,
}

impl RelayState {
    pub fn new(last_seen: Cursor) -> Self {
        Self { last_seen }
    }

    /// Seed the cursor from the newest message in the channel.
    ///
    /// An empty channel or a failed query leaves the cursor at the sentinel,
    /// in which case the first poll relays whatever backlog the history API
    /// returns.
    pub async fn initialize(source: &dyn HistorySource, channel_id: &str) -> Self {
        let seed = match source.latest(channel_id).await {
            Ok(Some(latest)) => match Cursor::parse(&latest.ts) {
                Some(cursor) => cursor,
                None => {
                    warn!(
                        "Latest message in {} has unparseable ts '{}', starting from the beginning",
                        channel_id, latest.ts
                    );
                    Cursor::sentinel()
                }
            },
            Ok(None) => Cursor::sentinel(),
            Err(e) => {
                error!(
                    "Failed to seed cursor for {}: {:#}; the first poll will relay the backlog",
                    channel_id, e
                );
                Cursor::sentinel()
            }
        };

        if seed.is_sentinel() {
            info!("Cursor for {} starts from the beginning of history", channel_id);
        } else {
            info!("Cursor for {} seeded at {}", channel_id, seed);
        }
        Self::new(seed)
    }

    pub fn last_seen(&self) -> &Cursor {
        &self.last_seen
    }

    /// Move the cursor forward. Returns `true` if it moved; equal, older and
    /// malformed tokens leave it untouched.
    pub fn advance(&mut self, token: &str) -> bool {
        let Some(next) = Cursor::parse(token) else {
            warn!("Ignoring unparseable cursor token '{}'", token);
            return false;
        };

        if next > self.last_seen {
            self.last_seen = next;
            true
        } else {
            debug!(
                "Cursor {} not advanced to non-increasing token {}",
                self.last_seen, token
            );
            false
        }
    }
}
