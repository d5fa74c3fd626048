//! HTTP client for the assistant worker that backs each room.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

/// One entry of a room's assistant conversation.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub ts: i64,
}

impl ChatMessage {
    /// A message stamped with the current time.
    pub fn now(role: impl Into<String>, user_id: Option<String>, text: impl Into<String>) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self {
            role: role.into(),
            user_id,
            text: text.into(),
            ts,
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct MessageRequest<'a> {
    text: &'a str,
    #[serde(rename = "userId", skip_serializing_if = "str::is_empty")]
    user_id: &'a str,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct MessageResponse {
    pub reply: String,
    pub messages: Vec<ChatMessage>,
    pub error: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct ExecRequest<'a> {
    cmd: &'a str,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct ExecResponse {
    pub result: ExecResult,
    #[serde(rename = "sandboxName")]
    pub sandbox_name: String,
    pub error: Option<String>,
}

/// Releases whatever external resources a room held once it is torn down.
#[async_trait]
pub trait RoomCleanup: Send + Sync {
    async fn cleanup_room(&self, room_id: &str) -> anyhow::Result<()>;
}

/// Client for the worker's room API.
#[derive(Clone, Debug)]
pub struct WorkerClient {
    base_url: String,
    http: reqwest::Client,
}

impl WorkerClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build worker http client")?;
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// False when no worker URL was configured.
    pub fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn room_url(&self, room_id: &str, path: &str) -> String {
        format!("{}/api/rooms/{}{}", self.base_url, room_id, path)
    }

    fn ensure_enabled(&self) -> anyhow::Result<()> {
        if !self.enabled() {
            anyhow::bail!("worker url not configured");
        }
        Ok(())
    }

    /// POST a JSON body and decode the JSON reply. Non-2xx statuses fail with
    /// the status and response body.
    async fn post_json<B, R>(&self, url: &str, body: &B) -> anyhow::Result<R>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("send request to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("worker error HTTP {}: {}", status, text.trim());
        }

        response
            .json()
            .await
            .with_context(|| format!("decode response from {}", url))
    }

    /// Send a chat message to the room's assistant.
    pub async fn send_message(
        &self,
        room_id: &str,
        user_id: &str,
        text: &str,
    ) -> anyhow::Result<MessageResponse> {
        self.ensure_enabled()?;
        let (user_id, text) = (user_id.trim(), text.trim());
        if room_id.is_empty() || text.is_empty() {
            anyhow::bail!("missing room id or text");
        }
        let url = self.room_url(room_id, "/message");
        log::debug!("Worker message request for room {}", room_id);

        let response: MessageResponse = self
            .post_json(&url, &MessageRequest { text, user_id })
            .await?;

        match response.error.as_deref() {
            Some(error) if !error.is_empty() => Err(anyhow::anyhow!("api error: {}", error)),
            _ => Ok(response),
        }
    }

    /// Run a command in the room's sandbox.
    pub async fn exec_command(&self, room_id: &str, cmd: &str) -> anyhow::Result<ExecResponse> {
        self.ensure_enabled()?;
        if room_id.is_empty() || cmd.trim().is_empty() {
            anyhow::bail!("missing room id or command");
        }
        let url = self.room_url(room_id, "/sandbox/exec");
        log::debug!("Worker sandbox exec for room {}: {}", room_id, cmd);

        let response: ExecResponse = self.post_json(&url, &ExecRequest { cmd }).await?;

        match response.error.as_deref() {
            Some(error) if !error.is_empty() => Err(anyhow::anyhow!("sandbox error: {}", error)),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl RoomCleanup for WorkerClient {
    async fn cleanup_room(&self, room_id: &str) -> anyhow::Result<()> {
        self.ensure_enabled()?;
        let url = self.room_url(room_id, "");
        let response = self
            .http
            .delete(&url)
            .timeout(CLEANUP_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("send cleanup request to {}", url))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(anyhow::anyhow!("cleanup of room {} returned HTTP {}", room_id, status));
        }
        Ok(())
    }
}
