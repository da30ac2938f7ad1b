//! In-process fakes for the platform traits, shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::cursor::Cursor;
use crate::platform::{
    AttachmentRef, HistoryMessage, HistorySource, MessageSink, Platform, UserDirectory, UserInfo,
};
use crate::transfer::{StagedFile, Transfer, TransferAdapter, STICKER_FILE_NAME};

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Text {
        channel: String,
        text: String,
    },
    File {
        channel: String,
        name: String,
        bytes: Vec<u8>,
    },
}

/// Records every send; optionally fails text sends.
pub struct RecordingSink {
    platform: Platform,
    calls: Mutex<Vec<SinkCall>>,
    fail_text: bool,
    max_text: usize,
}

impl RecordingSink {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            calls: Mutex::new(Vec::new()),
            fail_text: false,
            max_text: usize::MAX,
        }
    }

    pub fn with_text_limit(mut self, max_chars: usize) -> Self {
        self.max_text = max_chars;
        self
    }

    pub fn failing_text(mut self) -> Self {
        self.fail_text = true;
        self
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn max_text_chars(&self) -> usize {
        self.max_text
    }

    async fn send_text(&self, channel_id: &str, text: &str) -> Result<Option<String>> {
        if text.chars().count() > self.max_text {
            anyhow::bail!("text of {} characters is over the limit", text.chars().count());
        }
        if self.fail_text {
            anyhow::bail!("text send rejected");
        }
        let mut calls = self.calls.lock().unwrap();
        calls.push(SinkCall::Text {
            channel: channel_id.to_string(),
            text: text.to_string(),
        });
        Ok(Some(format!("msg-{}", calls.len())))
    }

    async fn upload_file(&self, channel_id: &str, file: &StagedFile) -> Result<Option<String>> {
        let bytes = file.read_all().await?;
        let mut calls = self.calls.lock().unwrap();
        calls.push(SinkCall::File {
            channel: channel_id.to_string(),
            name: file.file_name().to_string(),
            bytes,
        });
        Ok(Some(format!("file-{}", calls.len())))
    }
}

/// Stages the attachment URL itself as the file content.
pub struct StubTransfer {
    adapter: TransferAdapter,
    fetches: AtomicUsize,
    fail: bool,
    _dir: tempfile::TempDir,
}

impl StubTransfer {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TransferAdapter::new(dir.path().to_path_buf(), Duration::from_secs(5)).unwrap();
        Self {
            adapter,
            fetches: AtomicUsize::new(0),
            fail: false,
            _dir: dir,
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transfer for StubTransfer {
    async fn stage(&self, attachment: &AttachmentRef) -> Result<StagedFile> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("download failed: {}", attachment.url);
        }
        self.adapter
            .stage_bytes(&attachment.file_name, attachment.url.as_bytes())
            .await
    }

    async fn stage_sticker(&self, attachment: &AttachmentRef) -> Result<StagedFile> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("download failed: {}", attachment.url);
        }
        self.adapter
            .stage_bytes(STICKER_FILE_NAME, b"\x89PNG")
            .await
    }
}

type Batch = Result<Vec<HistoryMessage>, String>;

/// Serves queued history batches and records the cursor each poll used.
/// Batches pushed for a specific channel are served only to that channel.
#[derive(Default)]
pub struct FakeHistory {
    batches: Mutex<VecDeque<Batch>>,
    by_channel: Mutex<HashMap<String, VecDeque<Batch>>>,
    queried: Mutex<Vec<String>>,
    queried_by_channel: Mutex<Vec<(String, String)>>,
}

impl FakeHistory {
    pub fn push_to(&self, channel_id: &str, batch: Vec<HistoryMessage>) {
        self.by_channel
            .lock()
            .unwrap()
            .entry(channel_id.to_string())
            .or_default()
            .push_back(Ok(batch));
    }

    /// Cursors used by polls of `channel_id`, in order.
    pub fn queried_for(&self, channel_id: &str) -> Vec<String> {
        self.queried_by_channel
            .lock()
            .unwrap()
            .iter()
            .filter(|(channel, _)| channel == channel_id)
            .map(|(_, cursor)| cursor.clone())
            .collect()
    }

    pub fn push(&self, batch: Vec<HistoryMessage>) {
        self.batches.lock().unwrap().push_back(Ok(batch));
    }

    pub fn push_error(&self, error: &str) {
        self.batches.lock().unwrap().push_back(Err(error.to_string()));
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistorySource for FakeHistory {
    async fn history_since(
        &self,
        channel_id: &str,
        oldest: &Cursor,
        _limit: u32,
    ) -> Result<Vec<HistoryMessage>> {
        self.queried.lock().unwrap().push(oldest.to_string());
        self.queried_by_channel
            .lock()
            .unwrap()
            .push((channel_id.to_string(), oldest.to_string()));

        let scoped = self
            .by_channel
            .lock()
            .unwrap()
            .get_mut(channel_id)
            .and_then(VecDeque::pop_front);
        let next = scoped.or_else(|| self.batches.lock().unwrap().pop_front());
        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(Vec::new()),
        }
    }

    async fn latest(&self, _channel_id: &str) -> Result<Option<HistoryMessage>> {
        Ok(None)
    }
}

#[derive(Default)]
pub struct FakeUsers {
    users: HashMap<String, UserInfo>,
}

impl FakeUsers {
    pub fn with(mut self, id: &str, name: &str, is_bot: bool) -> Self {
        self.users.insert(
            id.to_string(),
            UserInfo {
                display_name: name.to_string(),
                is_bot,
            },
        );
        self
    }
}

#[async_trait]
impl UserDirectory for FakeUsers {
    async fn lookup(&self, user_id: &str) -> Result<UserInfo> {
        self.users
            .get(user_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("user_not_found: {}", user_id))
    }
}

/// Serve `conversations.history` the way Slack pages it: messages after
/// `oldest`, newest first, `limit` per page, with `next_cursor` while more
/// remain. Returns the base URL and the page cursors requested.
pub async fn serve_paged_history(
    messages: Vec<(&'static str, &'static str, &'static str)>,
) -> (String, Arc<Mutex<Vec<Option<String>>>>) {
    use axum::extract::Query;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    let pages: Arc<Mutex<Vec<Option<String>>>> = Arc::default();
    let requested = pages.clone();
    let router = Router::new().route(
        "/conversations.history",
        get(move |Query(params): Query<HashMap<String, String>>| {
            let requested = requested.clone();
            let messages = messages.clone();
            async move {
                requested.lock().unwrap().push(params.get("cursor").cloned());
                let oldest = params
                    .get("oldest")
                    .and_then(|o| Cursor::parse(o))
                    .unwrap_or_else(Cursor::sentinel);
                let limit: usize = params["limit"].parse().unwrap();
                let offset: usize = params
                    .get("cursor")
                    .and_then(|c| c.strip_prefix("page-"))
                    .map(|n| n.parse().unwrap())
                    .unwrap_or(0);

                let mut newer: Vec<_> = messages
                    .iter()
                    .filter(|(ts, _, _)| Cursor::parse(ts).unwrap() > oldest)
                    .collect();
                newer.sort_by_key(|(ts, _, _)| std::cmp::Reverse(Cursor::parse(ts).unwrap()));

                let end = (offset + limit).min(newer.len());
                let has_more = end < newer.len();
                let page: Vec<_> = newer[offset.min(end)..end]
                    .iter()
                    .map(|(ts, user, text)| json!({"ts": ts, "user": user, "text": text}))
                    .collect();
                Json(json!({
                    "ok": true,
                    "messages": page,
                    "has_more": has_more,
                    "response_metadata": {
                        "next_cursor": if has_more { format!("page-{}", end) } else { String::new() }
                    }
                }))
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{}", addr), pages)
}

pub fn history(ts: &str, user: &str, text: &str) -> HistoryMessage {
    HistoryMessage {
        ts: ts.to_string(),
        user: Some(user.to_string()),
        text: text.to_string(),
        ..Default::default()
    }
}
