use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::{MirrorConfig, RelayConfig};
use crate::cursor::{Cursor, RelayState};
use crate::normalize;
use crate::platform::{
    split_text, DeliveryResult, HistoryMessage, HistorySource, MessageSink, NormalizedMessage,
    Platform, UserDirectory,
};
use crate::router::MirrorRouter;
use crate::scheduler::Job;
use crate::transfer::Transfer;

/// Run an outbound call with an upper bound; expiry counts as a failure.
pub async fn timed<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("{} timed out after {:?}", what, limit)),
    }
}

/// Send `text` as one or more messages, in order, each within the sink's
/// length limit. Stops at the first piece that fails.
pub async fn send_text_chunked(
    sink: &dyn MessageSink,
    channel_id: &str,
    text: &str,
    limit: Duration,
) -> Result<Option<String>> {
    let chunks = split_text(text, sink.max_text_chars());
    if chunks.len() > 1 {
        debug!(
            "Splitting {} characters into {} messages for {}",
            text.chars().count(),
            chunks.len(),
            channel_id
        );
    }

    let mut last = None;
    for chunk in chunks {
        last = timed(limit, "text send", sink.send_text(channel_id, chunk)).await?;
    }
    Ok(last)
}

/// Collaborators a relay loop talks to. Shared across mirrors.
#[derive(Clone)]
pub struct RelayServices {
    pub history: Arc<dyn HistorySource>,
    pub users: Arc<dyn UserDirectory>,
    pub sink: Arc<dyn MessageSink>,
    pub transfer: Arc<dyn Transfer>,
}

/// What one poll did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollStats {
    pub fetched: usize,
    pub dispatched: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Disposition {
    Dispatched,
    Skipped,
    Failed,
}

/// Pull-side relay for one mirror. Owns that mirror's cursor.
pub struct RelayLoop {
    mirror: MirrorConfig,
    router: Arc<MirrorRouter>,
    services: RelayServices,
    state: RelayState,
    history_limit: u32,
    request_timeout: Duration,
}

impl RelayLoop {
    pub fn new(
        mirror: MirrorConfig,
        router: Arc<MirrorRouter>,
        services: RelayServices,
        state: RelayState,
        config: &RelayConfig,
    ) -> Self {
        Self {
            mirror,
            router,
            services,
            state,
            history_limit: config.history_limit,
            request_timeout: config.request_timeout(),
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// One iteration: fetch everything after the cursor, restore source
    /// order, and relay each message in turn.
    pub async fn poll_once(&mut self) -> Result<PollStats> {
        let channel = self.mirror.slack_channel.clone();
        let batch = timed(
            self.request_timeout,
            "history poll",
            self.services
                .history
                .history_since(&channel, self.state.last_seen(), self.history_limit),
        )
        .await?;

        // The API is asked for newer messages only; anything at or behind the
        // cursor is dropped here as well.
        let last_seen = self.state.last_seen().clone();
        let mut batch: Vec<(Cursor, HistoryMessage)> = batch
            .into_iter()
            .filter_map(|m| match Cursor::parse(&m.ts) {
                Some(cursor) if cursor > last_seen => Some((cursor, m)),
                Some(_) => None,
                None => {
                    warn!("Dropping Slack message with unparseable ts '{}'", m.ts);
                    None
                }
            })
            .collect();

        let mut stats = PollStats {
            fetched: batch.len(),
            ..Default::default()
        };
        if batch.is_empty() {
            return Ok(stats);
        }

        batch.sort_by(|(a, _), (b, _)| a.cmp(b));

        for (_, message) in batch {
            match self.process(message).await {
                Disposition::Dispatched => stats.dispatched += 1,
                Disposition::Skipped => stats.skipped += 1,
                Disposition::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }

    async fn process(&mut self, message: HistoryMessage) -> Disposition {
        // The cursor tracks position, not delivery: it moves past every
        // message before dispatch, and a failed dispatch is not retried.
        self.state.advance(&message.ts);

        if message.subtype.as_deref().is_some_and(|s| !s.is_empty()) {
            debug!(
                "Skipping {} message {}",
                message.subtype.as_deref().unwrap_or_default(),
                message.ts
            );
            return Disposition::Skipped;
        }

        if message.bot_id.is_some() {
            debug!("Skipping bot message {}", message.ts);
            return Disposition::Skipped;
        }

        let Some(user_id) = message.user.as_deref() else {
            debug!("Skipping message {} with no sender", message.ts);
            return Disposition::Skipped;
        };

        let author = match timed(
            self.request_timeout,
            "user lookup",
            self.services.users.lookup(user_id),
        )
        .await
        {
            Ok(author) => author,
            Err(e) => {
                warn!(
                    "Skipping message {}: could not resolve sender {}: {:#}",
                    message.ts, user_id, e
                );
                return Disposition::Skipped;
            }
        };

        let normalized = normalize::from_slack(&message, &author);
        if !normalized.is_conversational() {
            debug!("Skipping message {} from bot {}", message.ts, author.display_name);
            return Disposition::Skipped;
        }
        if !normalized.has_body() && normalized.attachments.is_empty() {
            debug!("Skipping empty message {}", message.ts);
            return Disposition::Skipped;
        }

        let Some(destination) = self
            .router
            .resolve(&self.mirror.slack_channel, Platform::Slack)
        else {
            warn!("No route for Slack channel {}", self.mirror.slack_channel);
            return Disposition::Skipped;
        };

        if self.dispatch(&normalized, destination).await {
            Disposition::Dispatched
        } else {
            Disposition::Failed
        }
    }

    async fn dispatch(&self, message: &NormalizedMessage, destination: &str) -> bool {
        let mut delivered = true;

        if message.has_body() {
            let outcome = send_text_chunked(
                self.services.sink.as_ref(),
                destination,
                &message.display_text(),
                self.request_timeout,
            )
            .await;
            let result = DeliveryResult::from_outcome(&outcome);
            debug!("Text of {} delivered: {:?}", message.ordering_token, result.message_id);
            if let Err(e) = outcome {
                error!(
                    "Failed to relay text of Slack message {}: {:#}",
                    message.ordering_token, e
                );
            }
            delivered &= result.success;
        }

        if let Some(attachment) = message.attachments.first() {
            if message.attachments.len() > 1 {
                debug!(
                    "Slack message {} has {} files, relaying only the first",
                    message.ordering_token,
                    message.attachments.len()
                );
            }

            let outcome = match timed(
                self.request_timeout,
                "attachment download",
                self.services.transfer.stage(attachment),
            )
            .await
            {
                Ok(staged) => {
                    timed(
                        self.request_timeout,
                        "file upload",
                        self.services.sink.upload_file(destination, &staged),
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            let result = DeliveryResult::from_outcome(&outcome);
            if let Err(e) = outcome {
                error!(
                    "Failed to relay file {} of Slack message {}: {:#}",
                    attachment.file_name, message.ordering_token, e
                );
            }
            delivered &= result.success;
        }

        if delivered {
            info!(
                "Relayed Slack message {} from {} to {}",
                message.ordering_token,
                message.author_name,
                self.services.sink.platform()
            );
        }
        delivered
    }
}

#[async_trait]
impl Job for RelayLoop {
    async fn tick(&mut self) {
        match self.poll_once().await {
            Ok(stats) if stats.fetched > 0 => debug!(
                "Poll of {}: {} new, {} relayed, {} skipped, {} failed (cursor {})",
                self.mirror.slack_channel,
                stats.fetched,
                stats.dispatched,
                stats.skipped,
                stats.failed,
                self.state().last_seen()
            ),
            Ok(_) => {}
            Err(e) => warn!(
                "Poll of {} failed, retrying next interval: {:#}",
                self.mirror.slack_channel, e
            ),
        }
    }
}
