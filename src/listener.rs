use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::platform::{AttachmentRef, DeliveryResult, MessageSink, NormalizedMessage, Platform};
use crate::relay::{send_text_chunked, timed};
use crate::router::MirrorRouter;
use crate::transfer::Transfer;

/// A message-created event from the push-capable side.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub channel_id: String,
    pub message: NormalizedMessage,
    /// Stickers that have a fetchable image
    pub stickers: Vec<AttachmentRef>,
}

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Bot-authored, unmirrored channel, or nothing to send
    Ignored,
    Relayed,
    Failed,
}

/// Push-side dispatcher: turns Discord events into Slack sends.
pub struct EventListener {
    router: Arc<MirrorRouter>,
    sink: Arc<dyn MessageSink>,
    transfer: Arc<dyn Transfer>,
    request_timeout: Duration,
}

impl EventListener {
    pub fn new(
        router: Arc<MirrorRouter>,
        sink: Arc<dyn MessageSink>,
        transfer: Arc<dyn Transfer>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            router,
            sink,
            transfer,
            request_timeout,
        }
    }

    pub async fn handle(&self, event: InboundEvent) -> EventOutcome {
        let message = &event.message;

        if message.is_bot {
            debug!("Ignoring bot message {}", message.ordering_token);
            return EventOutcome::Ignored;
        }

        let Some(destination) = self.router.resolve(&event.channel_id, Platform::Discord) else {
            debug!("Channel {} is not mirrored", event.channel_id);
            return EventOutcome::Ignored;
        };

        let text = message.display_text();

        let Some(attachment) = message.attachments.first() else {
            if let [sticker] = event.stickers.as_slice() {
                return self.relay_sticker(sticker, destination).await;
            }
            if !message.has_body() {
                return EventOutcome::Ignored;
            }
            let outcome = self.send_text(destination, &text).await;
            return self.report(message, &[("text", outcome)]);
        };

        if message.attachments.len() > 1 {
            debug!(
                "Message {} has {} attachments, relaying only the first",
                message.ordering_token,
                message.attachments.len()
            );
        }

        let staged = match timed(
            self.request_timeout,
            "attachment download",
            self.transfer.stage(attachment),
        )
        .await
        {
            Ok(staged) => staged,
            Err(e) => {
                error!(
                    "Failed to fetch attachment {} from message {}: {:#}",
                    attachment.file_name, message.ordering_token, e
                );
                return EventOutcome::Failed;
            }
        };

        // Both sends are issued together; neither waits on nor undoes the other.
        let text_send = async {
            if message.has_body() {
                Some(self.send_text(destination, &text).await)
            } else {
                None
            }
        };
        let (text_outcome, file_outcome) = futures::join!(
            text_send,
            timed(
                self.request_timeout,
                "file upload",
                self.sink.upload_file(destination, &staged),
            ),
        );

        let mut parts = Vec::with_capacity(2);
        if let Some(outcome) = text_outcome {
            parts.push(("text", outcome));
        }
        parts.push(("file", file_outcome));
        self.report(message, &parts)
    }

    async fn relay_sticker(&self, sticker: &AttachmentRef, destination: &str) -> EventOutcome {
        let staged = match timed(
            self.request_timeout,
            "sticker download",
            self.transfer.stage_sticker(sticker),
        )
        .await
        {
            Ok(staged) => staged,
            Err(e) => {
                error!("Failed to fetch sticker {}: {:#}", sticker.file_name, e);
                return EventOutcome::Failed;
            }
        };

        let outcome = timed(
            self.request_timeout,
            "sticker upload",
            self.sink.upload_file(destination, &staged),
        )
        .await;
        match outcome {
            Ok(_) => {
                info!("Relayed sticker {} to {}", sticker.file_name, destination);
                EventOutcome::Relayed
            }
            Err(e) => {
                error!("Failed to upload sticker {}: {:#}", sticker.file_name, e);
                EventOutcome::Failed
            }
        }
    }

    async fn send_text(&self, destination: &str, text: &str) -> Result<Option<String>> {
        send_text_chunked(self.sink.as_ref(), destination, text, self.request_timeout).await
    }

    fn report(
        &self,
        message: &NormalizedMessage,
        outcomes: &[(&str, Result<Option<String>>)],
    ) -> EventOutcome {
        let mut all_ok = true;
        for (part, outcome) in outcomes {
            let delivery = DeliveryResult::from_outcome(outcome);
            debug!("{} of {} -> {:?}", part, message.ordering_token, delivery.message_id);
            if let Err(e) = outcome {
                warn!(
                    "Failed to relay {} of Discord message {}: {:#}",
                    part, message.ordering_token, e
                );
            }
            all_ok &= delivery.success;
        }

        if all_ok {
            info!(
                "Relayed Discord message {} from {} to {}",
                message.ordering_token,
                message.author_name,
                self.sink.platform()
            );
            EventOutcome::Relayed
        } else {
            EventOutcome::Failed
        }
    }
}
