//! Fleetbot Slack Adapter
//!
//! Chat delivery and identity traits, the Slack Web API client that
//! implements them, Block Kit payloads and the Events API webhook.

mod webhook;

pub use webhook::{extract_message, router, serve, verify_signature, WebhookState};

use fleetbot_config::ChatConfig;
use reqwest::{Client, ClientBuilder};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const PROCESSING_PLACEHOLDER: &str = ":processing: Processing the request...";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat transport failed: {0}")]
    Transport(String),

    #[error("chat API {method} returned error: {error}")]
    Api { method: String, error: String },

    #[error("chat API {method} response decode failed: {reason}")]
    Decode { method: String, reason: String },

    #[error("user '{0}' has no e-mail address on file")]
    MissingEmail(String),
}

/// Address of a posted message: the conversation plus the platform timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub conversation_id: String,
    pub ts: String,
}

impl MessageHandle {
    pub fn new(conversation_id: impl Into<String>, ts: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ts: ts.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl TextObject {
    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            kind: "mrkdwn".to_string(),
            text: text.into(),
        }
    }
}

/// Subset of Block Kit the bot renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Block {
    Section {
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<TextObject>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        fields: Vec<TextObject>,
    },
    Divider,
    Image {
        image_url: String,
        alt_text: String,
    },
}

impl Block {
    pub fn markdown(text: impl Into<String>) -> Self {
        Self::Section {
            text: Some(TextObject::mrkdwn(text)),
            fields: Vec::new(),
        }
    }

    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Section {
            text: None,
            fields: fields.into_iter().map(TextObject::mrkdwn).collect(),
        }
    }

    pub fn divider() -> Self {
        Self::Divider
    }

    pub fn image(image_url: impl Into<String>, alt_text: impl Into<String>) -> Self {
        Self::Image {
            image_url: image_url.into(),
            alt_text: alt_text.into(),
        }
    }

    fn plain_text(&self) -> Option<String> {
        match self {
            Self::Section { text, fields } => {
                let mut parts: Vec<&str> = text.iter().map(|t| t.text.as_str()).collect();
                parts.extend(fields.iter().map(|f| f.text.as_str()));
                (!parts.is_empty()).then(|| parts.join("\n"))
            }
            Self::Divider => None,
            Self::Image { alt_text, .. } => Some(alt_text.clone()),
        }
    }
}

/// What a single message carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Blocks(Vec<Block>),
}

impl Content {
    /// Notification/fallback text; Slack wants one even for block messages.
    pub fn fallback_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(Block::plain_text)
                .next()
                .unwrap_or_default(),
        }
    }

    fn apply(&self, payload: &mut serde_json::Value) {
        payload["text"] = serde_json::json!(self.fallback_text());
        if let Self::Blocks(blocks) = self {
            payload["blocks"] = serde_json::json!(blocks);
        }
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

#[async_trait::async_trait]
pub trait ChatDelivery: Send + Sync {
    async fn post_placeholder(&self, conversation_id: &str) -> Result<MessageHandle, ChatError>;

    async fn update_message(&self, handle: &MessageHandle, content: &Content)
        -> Result<(), ChatError>;

    async fn post_thread_reply(
        &self,
        handle: &MessageHandle,
        content: &Content,
    ) -> Result<MessageHandle, ChatError>;
}

#[async_trait::async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn user_email(&self, caller_id: &str) -> Result<String, ChatError>;
}

pub struct SlackClient {
    client: Client,
    api_url: String,
    bot_token: String,
    user_token: String,
}

impl SlackClient {
    pub fn new(config: &ChatConfig) -> anyhow::Result<Self> {
        let client = ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
            user_token: config.user_token.clone(),
        })
    }

    /// Identity lookups need `users:read.email`; fall back to the bot token
    /// when no separate user token is configured.
    fn lookup_token(&self) -> &str {
        if self.user_token.is_empty() {
            &self.bot_token
        } else {
            &self.user_token
        }
    }

    async fn call(
        &self,
        method: &str,
        token: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, ChatError> {
        let url = format!("{}/{}", self.api_url, method);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|e| ChatError::Transport(format!("{} request failed: {}", method, e)))?
            .error_for_status()
            .map_err(|e| ChatError::Transport(format!("{} HTTP error: {}", method, e)))?;

        let body: serde_json::Value = response.json().await.map_err(|e| ChatError::Decode {
            method: method.to_string(),
            reason: e.to_string(),
        })?;
        check_ok(method, body)
    }

    async fn post_message(
        &self,
        conversation_id: &str,
        thread_ts: Option<&str>,
        content: &Content,
    ) -> Result<MessageHandle, ChatError> {
        let mut payload = serde_json::json!({ "channel": conversation_id });
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = serde_json::json!(ts);
        }
        content.apply(&mut payload);

        let body = self.call("chat.postMessage", &self.bot_token, &payload).await?;
        let ts = body["ts"].as_str().ok_or_else(|| ChatError::Decode {
            method: "chat.postMessage".into(),
            reason: "missing ts".into(),
        })?;
        let channel = body["channel"].as_str().unwrap_or(conversation_id);
        Ok(MessageHandle::new(channel, ts))
    }
}

fn check_ok(method: &str, body: serde_json::Value) -> Result<serde_json::Value, ChatError> {
    if body["ok"].as_bool().unwrap_or(false) {
        Ok(body)
    } else {
        Err(ChatError::Api {
            method: method.to_string(),
            error: body["error"].as_str().unwrap_or("unknown_error").to_string(),
        })
    }
}

#[async_trait::async_trait]
impl ChatDelivery for SlackClient {
    async fn post_placeholder(&self, conversation_id: &str) -> Result<MessageHandle, ChatError> {
        self.post_message(conversation_id, None, &Content::from(PROCESSING_PLACEHOLDER))
            .await
    }

    async fn update_message(
        &self,
        handle: &MessageHandle,
        content: &Content,
    ) -> Result<(), ChatError> {
        let mut payload = serde_json::json!({
            "channel": handle.conversation_id,
            "ts": handle.ts,
        });
        content.apply(&mut payload);
        self.call("chat.update", &self.bot_token, &payload).await?;
        debug!("Updated message {} in {}", handle.ts, handle.conversation_id);
        Ok(())
    }

    async fn post_thread_reply(
        &self,
        handle: &MessageHandle,
        content: &Content,
    ) -> Result<MessageHandle, ChatError> {
        self.post_message(&handle.conversation_id, Some(&handle.ts), content)
            .await
    }
}

#[async_trait::async_trait]
impl IdentityLookup for SlackClient {
    async fn user_email(&self, caller_id: &str) -> Result<String, ChatError> {
        let url = format!("{}/users.info", self.api_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.lookup_token())
            .query(&[("user", caller_id)])
            .send()
            .await
            .map_err(|e| ChatError::Transport(format!("users.info request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| ChatError::Transport(format!("users.info HTTP error: {}", e)))?;

        let body: serde_json::Value = response.json().await.map_err(|e| ChatError::Decode {
            method: "users.info".into(),
            reason: e.to_string(),
        })?;
        let body = check_ok("users.info", body)?;
        email_from_user_info(&body).ok_or_else(|| ChatError::MissingEmail(caller_id.to_string()))
    }
}

fn email_from_user_info(body: &serde_json::Value) -> Option<String> {
    body["user"]["profile"]["email"]
        .as_str()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}
