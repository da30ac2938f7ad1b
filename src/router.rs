use tracing::info;

use crate::config::MirrorConfig;
use crate::platform::Platform;

/// Static routing table built from the configured mirrors.
#[derive(Debug, Clone)]
pub struct MirrorRouter {
    mirrors: Vec<MirrorConfig>,
}

impl MirrorRouter {
    pub fn new(mirrors: Vec<MirrorConfig>) -> Self {
        for mirror in &mirrors {
            info!(
                "Mirror: discord #{} <-> slack #{}",
                mirror.discord_channel, mirror.slack_channel
            );
        }
        Self { mirrors }
    }

    /// Destination channel for a message seen on `source_platform` in
    /// `source_channel`, or `None` if that channel is not mirrored.
    pub fn resolve(&self, source_channel: &str, source_platform: Platform) -> Option<&str> {
        self.mirrors.iter().find_map(|mirror| match source_platform {
            Platform::Discord if mirror.discord_channel == source_channel => {
                Some(mirror.slack_channel.as_str())
            }
            Platform::Slack if mirror.slack_channel == source_channel => {
                Some(mirror.discord_channel.as_str())
            }
            _ => None,
        })
    }

    pub fn mirrors(&self) -> &[MirrorConfig] {
        &self.mirrors
    }
}
