//! Slack Web API client: history polling, user lookup, text posts and
//! external file uploads.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::cursor::Cursor;
use crate::platform::{
    AttachmentRef, HistoryMessage, HistorySource, MessageSink, Platform, UserDirectory, UserInfo,
};
use crate::transfer::StagedFile;

const API_BASE: &str = "https://slack.com/api";

/// chat.postMessage truncates text beyond this many characters.
const MAX_MESSAGE_CHARS: usize = 40_000;

/// Envelope shared by every Web API response.
#[derive(Debug, Deserialize)]
struct SlackResponse<T> {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    body: T,
}

impl<T> SlackResponse<T> {
    fn into_result(self, method: &str) -> Result<T> {
        if self.ok {
            Ok(self.body)
        } else {
            anyhow::bail!(
                "Slack {} failed: {}",
                method,
                self.error.as_deref().unwrap_or("unknown error")
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct SlackFile {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    url_private_download: Option<String>,
    #[serde(default)]
    url_private: Option<String>,
}

/// A message from the conversations.history response.
#[derive(Debug, Deserialize)]
struct SlackMessage {
    ts: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    user: Option<String>,
    /// Present if the message was sent by a bot or integration.
    #[serde(default)]
    bot_id: Option<String>,
    /// Message subtype (e.g., "bot_message", "channel_join").
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    files: Vec<SlackFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ResponseMetadata {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryBody {
    #[serde(default)]
    messages: Vec<SlackMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    response_metadata: ResponseMetadata,
}

impl HistoryBody {
    /// Cursor for the following page, if Slack reported one.
    fn next_page(&self) -> Option<String> {
        if !self.has_more {
            return None;
        }
        self.response_metadata
            .next_cursor
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
    }
}

#[derive(Debug, Deserialize, Default)]
struct SlackProfile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlackUser {
    #[serde(default)]
    name: String,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    profile: SlackProfile,
}

#[derive(Debug, Deserialize)]
struct UserInfoBody {
    #[serde(default)]
    user: Option<SlackUser>,
}

#[derive(Debug, Deserialize)]
struct PostMessageBody {
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadUrlBody {
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteUploadBody {
    #[serde(default)]
    files: Vec<serde_json::Value>,
}

/// Pick the best human-readable name Slack offers for a user.
fn display_name(user: &SlackUser) -> String {
    [
        user.profile.display_name.as_deref(),
        user.profile.real_name.as_deref(),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|name| !name.is_empty())
    .unwrap_or(&user.name)
    .to_string()
}

pub struct SlackApi {
    client: Client,
    token: String,
    base_url: String,
}

impl SlackApi {
    pub fn new(token: String, timeout: Duration) -> Result<Self> {
        Self::with_base_url(token, timeout, API_BASE)
    }

    pub fn with_base_url(token: String, timeout: Duration, base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Slack HTTP client")?;
        Ok(Self {
            client,
            token,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.token)
    }

    async fn parse<T: DeserializeOwned>(method: &str, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Slack {} returned HTTP {}: {}", method, status, body);
        }
        let parsed: SlackResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Slack {} response", method))?;
        parsed.into_result(method)
    }

    /// One page of `conversations.history`, newest first.
    async fn history_page(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        limit: u32,
        page: Option<&str>,
    ) -> Result<HistoryBody> {
        let limit = limit.to_string();
        let mut request = self
            .client
            .get(self.url("conversations.history"))
            .bearer_auth(&self.token)
            .query(&[("channel", channel_id), ("limit", limit.as_str())]);
        if let Some(oldest) = oldest {
            request = request.query(&[("oldest", oldest), ("inclusive", "false")]);
        }
        if let Some(page) = page {
            request = request.query(&[("cursor", page)]);
        }

        let response = request
            .send()
            .await
            .context("Failed to send conversations.history request")?;
        Self::parse("conversations.history", response).await
    }

    /// Messages after `oldest`, following `next_cursor` until Slack reports
    /// no more pages. Without `oldest` only the first page is read.
    async fn conversations_history(
        &self,
        channel_id: &str,
        oldest: Option<&str>,
        limit: u32,
    ) -> Result<Vec<HistoryMessage>> {
        let mut messages = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let body = self
                .history_page(channel_id, oldest, limit, page.as_deref())
                .await?;
            let next = body.next_page();
            messages.extend(body.messages);
            match next {
                Some(cursor) if oldest.is_some() && page.as_deref() != Some(cursor.as_str()) => {
                    debug!(
                        "conversations.history for {} has more pages ({} so far)",
                        channel_id,
                        messages.len()
                    );
                    page = Some(cursor);
                }
                _ => break,
            }
        }

        let auth = self.auth_header();
        Ok(messages
            .into_iter()
            .map(|m| HistoryMessage {
                ts: m.ts,
                user: m.user,
                bot_id: m.bot_id,
                text: m.text,
                subtype: m.subtype,
                files: m
                    .files
                    .into_iter()
                    .filter_map(|f| {
                        let url = f.url_private_download.or(f.url_private)?;
                        Some(AttachmentRef {
                            url,
                            file_name: f.name.unwrap_or_default(),
                            auth_header: Some(auth.clone()),
                        })
                    })
                    .collect(),
            })
            .collect())
    }

    pub async fn post_message(&self, channel_id: &str, text: &str) -> Result<Option<String>> {
        let body = serde_json::json!({
            "channel": channel_id,
            "text": text,
        });

        let response = self
            .client
            .post(self.url("chat.postMessage"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .context("Failed to send chat.postMessage request")?;
        let parsed: PostMessageBody = Self::parse("chat.postMessage", response).await?;
        Ok(parsed.ts)
    }

    /// Upload via the external upload flow: reserve an upload URL for the
    /// exact byte count, send the bytes, then share the file into the channel.
    pub async fn upload_file(&self, channel_id: &str, file: &StagedFile) -> Result<Option<String>> {
        let length = file.byte_count().to_string();
        let response = self
            .client
            .post(self.url("files.getUploadURLExternal"))
            .bearer_auth(&self.token)
            .form(&[("filename", file.file_name()), ("length", length.as_str())])
            .send()
            .await
            .context("Failed to send files.getUploadURLExternal request")?;
        let reserved: UploadUrlBody =
            Self::parse("files.getUploadURLExternal", response).await?;
        let upload_url = reserved
            .upload_url
            .context("files.getUploadURLExternal returned no upload_url")?;
        let file_id = reserved
            .file_id
            .context("files.getUploadURLExternal returned no file_id")?;

        let bytes = file.read_all().await?;
        let response = self
            .client
            .post(&upload_url)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("Failed to upload bytes for {}", file.file_name()))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Slack file upload returned HTTP {}", status);
        }

        let files = serde_json::json!([{ "id": file_id, "title": file.file_name() }]).to_string();
        let response = self
            .client
            .post(self.url("files.completeUploadExternal"))
            .bearer_auth(&self.token)
            .form(&[("files", files.as_str()), ("channel_id", channel_id)])
            .send()
            .await
            .context("Failed to send files.completeUploadExternal request")?;
        let completed: CompleteUploadBody =
            Self::parse("files.completeUploadExternal", response).await?;

        debug!(
            "Uploaded {} to Slack as {} ({} file(s) shared)",
            file.file_name(),
            file_id,
            completed.files.len()
        );
        Ok(Some(file_id))
    }
}

#[async_trait]
impl HistorySource for SlackApi {
    async fn history_since(
        &self,
        channel_id: &str,
        oldest: &Cursor,
        limit: u32,
    ) -> Result<Vec<HistoryMessage>> {
        self.conversations_history(channel_id, Some(oldest.as_str()), limit)
            .await
    }

    async fn latest(&self, channel_id: &str) -> Result<Option<HistoryMessage>> {
        // History is newest-first, so the first entry is the latest.
        Ok(self
            .conversations_history(channel_id, None, 1)
            .await?
            .into_iter()
            .next())
    }
}

#[async_trait]
impl UserDirectory for SlackApi {
    async fn lookup(&self, user_id: &str) -> Result<UserInfo> {
        let response = self
            .client
            .get(self.url("users.info"))
            .bearer_auth(&self.token)
            .query(&[("user", user_id)])
            .send()
            .await
            .context("Failed to send users.info request")?;
        let parsed: UserInfoBody = Self::parse("users.info", response).await?;
        let user = parsed
            .user
            .with_context(|| format!("users.info returned no user for {}", user_id))?;

        Ok(UserInfo {
            display_name: display_name(&user),
            is_bot: user.is_bot || user_id == "USLACKBOT",
        })
    }
}

#[async_trait]
impl MessageSink for SlackApi {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    fn max_text_chars(&self) -> usize {
        MAX_MESSAGE_CHARS
    }

    async fn send_text(&self, channel_id: &str, text: &str) -> Result<Option<String>> {
        self.post_message(channel_id, text).await
    }

    async fn upload_file(&self, channel_id: &str, file: &StagedFile) -> Result<Option<String>> {
        SlackApi::upload_file(self, channel_id, file).await
    }
}
