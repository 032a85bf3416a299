use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt;
use std::time::Duration;

pub mod poller;
pub mod types;

pub use poller::UpdatePoller;
pub use types::{CallbackQuery, IncomingMessage, InlineButton, InlineKeyboard, Update, User};

/// A non-2xx answer from the bot API. Kept as a typed error so callers can
/// distinguish a 409 conflict (another poller owns the update stream) from
/// ordinary network failures.
#[derive(Debug)]
pub struct ApiStatusError {
    pub code: u16,
    pub description: String,
}

impl fmt::Display for ApiStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bot API error {}: {}", self.code, self.description)
    }
}

impl std::error::Error for ApiStatusError {}

impl ApiStatusError {
    pub fn is_conflict(&self) -> bool {
        self.code == 409
    }
}

/// HTTP client for the chat bot API. Every method maps 1:1 onto an API
/// call; responses arrive in the `{"ok": bool, "result": ..., "description":
/// ...}` envelope.
#[derive(Clone)]
pub struct BotApi {
    client: Client,
    base_url: String,
}

impl BotApi {
    pub fn new(api_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let envelope: serde_json::Value = resp.json().await?;
        if !envelope["ok"].as_bool().unwrap_or(false) {
            let description = envelope["description"]
                .as_str()
                .unwrap_or("no description")
                .to_string();
            return Err(ApiStatusError {
                code: envelope["error_code"]
                    .as_u64()
                    .map(|c| c as u16)
                    .unwrap_or(status.as_u16()),
                description,
            }
            .into());
        }
        serde_json::from_value(envelope["result"].clone())
            .map_err(|e| anyhow!("malformed {} result: {}", method, e))
    }

    /// Send a message, optionally into a thread and with an inline keyboard.
    /// Returns the new message id.
    pub async fn send_message(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if let Some(tid) = thread_id {
            body["message_thread_id"] = json!(tid);
        }
        if let Some(kb) = keyboard {
            body["reply_markup"] = serde_json::to_value(kb)?;
        }
        let msg: serde_json::Value = self.call("sendMessage", body).await?;
        msg["message_id"]
            .as_i64()
            .ok_or_else(|| anyhow!("sendMessage result missing message_id"))
    }

    /// Edit a message's text and keyboard. Passing `None` for the keyboard
    /// removes any existing one.
    pub async fn edit_message(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        let mut body = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(kb) = keyboard {
            body["reply_markup"] = serde_json::to_value(kb)?;
        }
        let _: serde_json::Value = self.call("editMessageText", body).await?;
        Ok(())
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "deleteMessage",
                json!({ "chat_id": chat_id, "message_id": message_id }),
            )
            .await?;
        Ok(())
    }

    /// Create a forum topic, returning its thread id.
    pub async fn create_topic(&self, chat_id: i64, title: &str) -> Result<i64> {
        let topic: serde_json::Value = self
            .call(
                "createForumTopic",
                json!({ "chat_id": chat_id, "name": title }),
            )
            .await?;
        topic["message_thread_id"]
            .as_i64()
            .ok_or_else(|| anyhow!("createForumTopic result missing message_thread_id"))
    }

    pub async fn rename_topic(&self, chat_id: i64, thread_id: i64, title: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "editForumTopic",
                json!({ "chat_id": chat_id, "message_thread_id": thread_id, "name": title }),
            )
            .await?;
        Ok(())
    }

    pub async fn close_topic(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "closeForumTopic",
                json!({ "chat_id": chat_id, "message_thread_id": thread_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn reopen_topic(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "reopenForumTopic",
                json!({ "chat_id": chat_id, "message_thread_id": thread_id }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_topic(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "deleteForumTopic",
                json!({ "chat_id": chat_id, "message_thread_id": thread_id }),
            )
            .await?;
        Ok(())
    }

    /// Acknowledge a callback so the client stops showing a spinner.
    pub async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .call(
                "answerCallbackQuery",
                json!({ "callback_query_id": callback_id }),
            )
            .await?;
        Ok(())
    }

    /// Long-poll for updates. Blocks server-side for up to `timeout_secs`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }
}
