use anyhow::Result;
use async_trait::async_trait;
use chat_client::{BotApi, InlineKeyboard};
use std::sync::Arc;

use crate::state::SuppressionGuard;

/// Message id returned for sends swallowed by the chatter suppressor.
pub const SUPPRESSED_MESSAGE_ID: i64 = 0;

/// Capability bag over the chat transport. Everything the control plane
/// does with chat goes through this, so tests can drop in a mock and the
/// suppression middleware can wrap any implementation.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64>;

    async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;

    async fn create_thread(&self, chat_id: i64, title: &str) -> Result<i64>;
    async fn rename_thread(&self, chat_id: i64, thread_id: i64, title: &str) -> Result<()>;
    async fn close_thread(&self, chat_id: i64, thread_id: i64) -> Result<()>;
    async fn reopen_thread(&self, chat_id: i64, thread_id: i64) -> Result<()>;
    async fn delete_thread(&self, chat_id: i64, thread_id: i64) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str) -> Result<()>;
}

#[async_trait]
impl ChatTransport for BotApi {
    async fn send(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64> {
        self.send_message(chat_id, thread_id, text, keyboard).await
    }

    async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        self.edit_message(chat_id, message_id, text, keyboard).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        BotApi::delete_message(self, chat_id, message_id).await
    }

    async fn create_thread(&self, chat_id: i64, title: &str) -> Result<i64> {
        self.create_topic(chat_id, title).await
    }

    async fn rename_thread(&self, chat_id: i64, thread_id: i64, title: &str) -> Result<()> {
        self.rename_topic(chat_id, thread_id, title).await
    }

    async fn close_thread(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.close_topic(chat_id, thread_id).await
    }

    async fn reopen_thread(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.reopen_topic(chat_id, thread_id).await
    }

    async fn delete_thread(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.delete_topic(chat_id, thread_id).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        BotApi::answer_callback(self, callback_id).await
    }
}

/// Chatter-suppression middleware. Sends aimed at a thread currently owned
/// by a streaming session, a live directory browse, or a just-closed
/// session are dropped with a synthetic success, so an embedded assistant
/// can never step on live output. Applied at construction: every handle
/// the rest of the system sees goes through this wrapper; only the topic
/// facade's own stream path uses the inner transport.
pub struct SuppressedTransport<T: ChatTransport> {
    inner: Arc<T>,
    guard: Arc<SuppressionGuard>,
}

impl<T: ChatTransport> SuppressedTransport<T> {
    pub fn new(inner: Arc<T>, guard: Arc<SuppressionGuard>) -> Self {
        Self { inner, guard }
    }
}

#[async_trait]
impl<T: ChatTransport> ChatTransport for SuppressedTransport<T> {
    async fn send(
        &self,
        chat_id: i64,
        thread_id: Option<i64>,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<i64> {
        if let Some(tid) = thread_id
            && self.guard.is_suppressed(tid)
        {
            metrics::counter!("chat_sends_suppressed_total").increment(1);
            tracing::debug!(thread_id = tid, "Suppressed send to live session thread");
            return Ok(SUPPRESSED_MESSAGE_ID);
        }
        self.inner.send(chat_id, thread_id, text, keyboard).await
    }

    async fn edit(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        keyboard: Option<&InlineKeyboard>,
    ) -> Result<()> {
        self.inner.edit(chat_id, message_id, text, keyboard).await
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        self.inner.delete_message(chat_id, message_id).await
    }

    async fn create_thread(&self, chat_id: i64, title: &str) -> Result<i64> {
        self.inner.create_thread(chat_id, title).await
    }

    async fn rename_thread(&self, chat_id: i64, thread_id: i64, title: &str) -> Result<()> {
        self.inner.rename_thread(chat_id, thread_id, title).await
    }

    async fn close_thread(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.inner.close_thread(chat_id, thread_id).await
    }

    async fn reopen_thread(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.inner.reopen_thread(chat_id, thread_id).await
    }

    async fn delete_thread(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.inner.delete_thread(chat_id, thread_id).await
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        self.inner.answer_callback(callback_id).await
    }
}
