use serenity::model::channel::Message;
use serenity::model::sticker::StickerFormatType;
use tracing::debug;

use crate::listener::InboundEvent;
use crate::platform::{AttachmentRef, HistoryMessage, NormalizedMessage, UserInfo};

const DISCORD_STICKER_CDN: &str = "https://media.discordapp.net/stickers";

/// Build the neutral form of a Slack history entry once its author is known.
pub fn from_slack(message: &HistoryMessage, author: &UserInfo) -> NormalizedMessage {
    NormalizedMessage {
        author_name: author.display_name.clone(),
        body: message.text.clone(),
        attachments: message.files.clone(),
        is_bot: author.is_bot || message.bot_id.is_some(),
        ordering_token: message.ts.clone(),
        subtype: message.subtype.clone().filter(|s| !s.is_empty()),
    }
}

/// Build a push-side event from a Discord gateway message.
pub fn from_discord(msg: &Message) -> InboundEvent {
    let author_name = msg
        .member
        .as_ref()
        .and_then(|member| member.nick.clone())
        .or_else(|| msg.author.global_name.clone())
        .unwrap_or_else(|| msg.author.name.clone());

    let attachments = msg
        .attachments
        .iter()
        .map(|a| AttachmentRef {
            url: a.url.clone(),
            file_name: a.filename.clone(),
            auth_header: None,
        })
        .collect();

    let stickers = msg
        .sticker_items
        .iter()
        .filter_map(|item| {
            let url = sticker_url(item.id.get(), item.format_type);
            if url.is_none() {
                debug!("Sticker {} has no raster form, not relayable", item.name);
            }
            url.map(|url| AttachmentRef {
                url,
                file_name: item.name.clone(),
                auth_header: None,
            })
        })
        .collect();

    InboundEvent {
        channel_id: msg.channel_id.to_string(),
        message: NormalizedMessage {
            author_name,
            body: msg.content.clone(),
            attachments,
            is_bot: msg.author.bot,
            ordering_token: msg.id.to_string(),
            subtype: None,
        },
        stickers,
    }
}

/// CDN location of a sticker image. Lottie stickers are vector JSON and have
/// no image to fetch.
pub fn sticker_url(sticker_id: u64, format: StickerFormatType) -> Option<String> {
    let ext = match format {
        StickerFormatType::Png | StickerFormatType::Apng => "png",
        StickerFormatType::Gif => "gif",
        _ => return None,
    };
    Some(format!("{}/{}.{}", DISCORD_STICKER_CDN, sticker_id, ext))
}
