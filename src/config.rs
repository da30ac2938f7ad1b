use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SlackConfig {
    #[serde(default)]
    pub bot_token: String,
}

/// One Discord channel paired with one Slack channel.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MirrorConfig {
    pub discord_channel: String,
    pub slack_channel: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            history_limit: default_history_limit(),
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransferConfig {
    /// Directory for in-flight attachment files (defaults to `$TMPDIR/mirrorbot`)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl TransferConfig {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mirrorbot"))
    }
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_history_limit() -> u32 {
    100
}

pub const ENV_DISCORD_TOKEN: &str = "DISCORD_TOKEN";
pub const ENV_SLACK_TOKEN: &str = "SLACK_TOKEN";
pub const ENV_DISCORD_CHANNEL: &str = "DISCORD_CHANNEL_ID";
pub const ENV_SLACK_CHANNEL: &str = "SLACK_CHANNEL_ID";

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides and validate. A missing file is not an error; missing
    /// credentials are.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = lookup(ENV_DISCORD_TOKEN) {
            self.discord.bot_token = token;
        }
        if let Some(token) = lookup(ENV_SLACK_TOKEN) {
            self.slack.bot_token = token;
        }

        let discord_channel = lookup(ENV_DISCORD_CHANNEL);
        let slack_channel = lookup(ENV_SLACK_CHANNEL);
        match (discord_channel, slack_channel) {
            (Some(discord_channel), Some(slack_channel)) => {
                let mirror = MirrorConfig {
                    discord_channel,
                    slack_channel,
                };
                match self.mirrors.first_mut() {
                    Some(first) => *first = mirror,
                    None => self.mirrors.push(mirror),
                }
            }
            (Some(discord_channel), None) => {
                if let Some(first) = self.mirrors.first_mut() {
                    first.discord_channel = discord_channel;
                }
            }
            (None, Some(slack_channel)) => {
                if let Some(first) = self.mirrors.first_mut() {
                    first.slack_channel = slack_channel;
                }
            }
            (None, None) => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.discord.bot_token.trim().is_empty() {
            anyhow::bail!(
                "Missing Discord bot token: set [discord] bot_token or {}",
                ENV_DISCORD_TOKEN
            );
        }
        if self.slack.bot_token.trim().is_empty() {
            anyhow::bail!(
                "Missing Slack bot token: set [slack] bot_token or {}",
                ENV_SLACK_TOKEN
            );
        }
        if self.mirrors.is_empty() {
            anyhow::bail!(
                "No mirrors configured: add a [[mirrors]] entry or set {} and {}",
                ENV_DISCORD_CHANNEL,
                ENV_SLACK_CHANNEL
            );
        }

        for (i, mirror) in self.mirrors.iter().enumerate() {
            if mirror.discord_channel.trim().is_empty() {
                anyhow::bail!("Mirror #{} is missing its Discord channel id", i);
            }
            if mirror.slack_channel.trim().is_empty() {
                anyhow::bail!("Mirror #{} is missing its Slack channel id", i);
            }
            match mirror.discord_channel.trim().parse::<u64>() {
                Ok(id) if id != 0 => {}
                _ => anyhow::bail!(
                    "Mirror #{} has an invalid Discord channel id '{}': expected a non-zero integer",
                    i,
                    mirror.discord_channel
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn full_env() -> impl Fn(&str) -> Option<String> {
        env(&[
            (ENV_DISCORD_TOKEN, "discord-token"),
            (ENV_SLACK_TOKEN, "xoxb-slack"),
            (ENV_DISCORD_CHANNEL, "123456789"),
            (ENV_SLACK_CHANNEL, "C0123"),
        ])
    }

    #[test]
    fn test_env_only_config_is_valid() {
        let mut config = Config::default();
        config.apply_overrides(full_env());
        config.validate().unwrap();

        assert_eq!(config.discord.bot_token, "discord-token");
        assert_eq!(config.slack.bot_token, "xoxb-slack");
        assert_eq!(
            config.mirrors,
            vec![MirrorConfig {
                discord_channel: "123456789".to_string(),
                slack_channel: "C0123".to_string(),
            }]
        );
    }

    #[test]
    fn test_missing_slack_token_is_descriptive() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            (ENV_DISCORD_TOKEN, "discord-token"),
            (ENV_DISCORD_CHANNEL, "1"),
            (ENV_SLACK_CHANNEL, "C1"),
        ]));

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Slack bot token"), "got: {}", err);
        assert!(err.contains(ENV_SLACK_TOKEN));
    }

    #[test]
    fn test_empty_values_count_as_missing() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            (ENV_DISCORD_TOKEN, "   "),
            (ENV_SLACK_TOKEN, "xoxb"),
            (ENV_DISCORD_CHANNEL, "1"),
            (ENV_SLACK_CHANNEL, "C1"),
        ]));

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Discord bot token"), "got: {}", err);
    }

    #[test]
    fn test_missing_channel_ids() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            (ENV_DISCORD_TOKEN, "d"),
            (ENV_SLACK_TOKEN, "s"),
            (ENV_SLACK_CHANNEL, "C1"),
        ]));

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("No mirrors configured"), "got: {}", err);
    }

    #[test]
    fn test_non_numeric_discord_channel_rejected() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            (ENV_DISCORD_TOKEN, "d"),
            (ENV_SLACK_TOKEN, "s"),
            (ENV_DISCORD_CHANNEL, "general"),
            (ENV_SLACK_CHANNEL, "C1"),
        ]));

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("invalid Discord channel id"), "got: {}", err);
    }

    #[test]
    fn test_toml_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [discord]
            bot_token = "d"

            [slack]
            bot_token = "s"

            [[mirrors]]
            discord_channel = "42"
            slack_channel = "C42"

            [[mirrors]]
            discord_channel = "43"
            slack_channel = "C43"
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.mirrors.len(), 2);
        assert_eq!(config.relay.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.relay.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.relay.history_limit, 100);
        assert!(config.transfer.staging_dir().ends_with("mirrorbot"));
    }

    #[test]
    fn test_env_overrides_first_mirror_only() {
        let mut config: Config = toml::from_str(
            r#"
            [[mirrors]]
            discord_channel = "42"
            slack_channel = "C42"

            [[mirrors]]
            discord_channel = "43"
            slack_channel = "C43"
            "#,
        )
        .unwrap();

        config.apply_overrides(env(&[(ENV_SLACK_CHANNEL, "CNEW")]));

        assert_eq!(config.mirrors[0].discord_channel, "42");
        assert_eq!(config.mirrors[0].slack_channel, "CNEW");
        assert_eq!(config.mirrors[1].slack_channel, "C43");
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[mirrors]\ndiscord_channel = ").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
