//! Discord side of the bridge: gateway event handler and REST sink.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serenity::all::{
    ChannelId, Context, CreateAttachment, CreateMessage, EventHandler, GatewayIntents, Http,
    Message, Ready,
};
use tracing::{debug, info};

use crate::listener::EventListener;
use crate::normalize;
use crate::platform::{MessageSink, Platform};
use crate::transfer::StagedFile;

/// Discord rejects message content longer than this.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Gateway intents the bridge needs to read channel messages.
pub fn intents() -> GatewayIntents {
    GatewayIntents::GUILDS | GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT
}

fn parse_channel_id(channel_id: &str) -> Result<ChannelId> {
    let id: u64 = channel_id
        .trim()
        .parse()
        .with_context(|| format!("Invalid Discord channel id '{}'", channel_id))?;
    if id == 0 {
        anyhow::bail!("Invalid Discord channel id '{}'", channel_id);
    }
    Ok(ChannelId::new(id))
}

/// Handler for Discord gateway events.
///
/// serenity spawns one task per event, so messages are handled concurrently
/// with each other and with the relay loops.
pub struct DiscordHandler {
    listener: Arc<EventListener>,
}

impl DiscordHandler {
    pub fn new(listener: Arc<EventListener>) -> Self {
        Self { listener }
    }
}

#[serenity::async_trait]
impl EventHandler for DiscordHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(
            "Discord connected as {} ({} guilds)",
            ready.user.name,
            ready.guilds.len()
        );
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        debug!(
            "Discord message {} in {} from {}",
            msg.id, msg.channel_id, msg.author.name
        );
        let event = normalize::from_discord(&msg);
        self.listener.handle(event).await;
    }
}

/// Sends relayed Slack content into Discord channels.
pub struct DiscordSink {
    http: Arc<Http>,
}

impl DiscordSink {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl MessageSink for DiscordSink {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn max_text_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }

    async fn send_text(&self, channel_id: &str, text: &str) -> Result<Option<String>> {
        let channel = parse_channel_id(channel_id)?;
        let sent = channel
            .send_message(self.http.as_ref(), CreateMessage::new().content(text))
            .await
            .with_context(|| format!("Failed to send message to Discord channel {}", channel))?;
        Ok(Some(sent.id.to_string()))
    }

    async fn upload_file(&self, channel_id: &str, file: &StagedFile) -> Result<Option<String>> {
        let channel = parse_channel_id(channel_id)?;
        let bytes = file.read_all().await?;
        let attachment = CreateAttachment::bytes(bytes, file.file_name());
        let sent = channel
            .send_message(
                self.http.as_ref(),
                CreateMessage::new().add_file(attachment),
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to upload {} to Discord channel {}",
                    file.file_name(),
                    channel
                )
            })?;
        Ok(Some(sent.id.to_string()))
    }
}
