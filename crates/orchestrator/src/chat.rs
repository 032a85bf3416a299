use anyhow::{anyhow, Result};
use chat_client::InlineKeyboard;
use common::CallbackData;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::database::Database;
use crate::state::{PendingQuestion, SharedState};
use crate::stream::Chunk;
use crate::transport::ChatTransport;

/// Buffered text is flushed after this much quiet time.
pub const FLUSH_MS: u64 = 1500;
/// Flush before a message would exceed the transport's comfortable size.
pub const MAX_MSG: usize = 3500;

/// What session supervisors feed into a topic stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Chunk(Chunk),
    /// Scrubbed stderr text; rendered with a `[stderr]` prefix.
    Stderr(String),
    /// One-line notice (engine fallback, session end). Flushes the buffer
    /// and goes out as its own message.
    Notice(String),
}

/// Grouping key for the rolling buffer: a kind change forces a flush so
/// one message never mixes, say, tool status lines into engine prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferKind {
    Text,
    Hook,
    Tool,
    Stderr,
    Passthrough,
}

/// Wraps the chat transport with topic lifecycle rules, the durable topic
/// registry, and per-stream rolling buffers.
pub struct TopicFacade {
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    db: Database,
    state: Arc<SharedState>,
}

impl TopicFacade {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        chat_id: i64,
        db: Database,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            transport,
            chat_id,
            db,
            state,
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Create a topic and persist its registry row so a crash cannot
    /// orphan the thread.
    pub async fn create_topic(&self, title: &str, task_id: Option<&str>) -> Result<i64> {
        let thread_id = self.transport.create_thread(self.chat_id, title).await?;
        self.db.upsert_topic(thread_id, "active", task_id).await?;
        Ok(thread_id)
    }

    /// Idempotent: renaming an already-renamed or missing topic is a no-op.
    pub async fn rename_topic(&self, thread_id: i64, title: &str) {
        if let Err(e) = self.transport.rename_thread(self.chat_id, thread_id, title).await {
            tracing::debug!(thread_id, error = %e, "Topic rename was a no-op");
        }
    }

    /// Idempotent: closing twice is a no-op.
    pub async fn close_topic(&self, thread_id: i64) {
        if let Err(e) = self.transport.close_thread(self.chat_id, thread_id).await {
            tracing::debug!(thread_id, error = %e, "Topic close was a no-op");
        }
        if let Err(e) = self.db.set_topic_status(thread_id, "closed").await {
            tracing::warn!(thread_id, error = %e, "Failed to persist topic close");
        }
    }

    /// Delete a topic. Fails for the root thread and for threads the
    /// registry does not know.
    pub async fn delete_topic(&self, thread_id: i64) -> Result<()> {
        if thread_id <= 0 {
            return Err(anyhow!("refusing to delete the root thread"));
        }
        let Some(topic) = self.db.get_topic(thread_id).await? else {
            return Err(anyhow!("unknown topic {}", thread_id));
        };
        if topic.status == "deleted" {
            return Err(anyhow!("topic {} already deleted", thread_id));
        }
        self.transport.delete_thread(self.chat_id, thread_id).await?;
        self.db.set_topic_status(thread_id, "deleted").await?;
        Ok(())
    }

    /// Plain send into a thread (executor summaries, error reports).
    pub async fn send(&self, thread_id: Option<i64>, text: &str) -> Result<i64> {
        self.transport.send(self.chat_id, thread_id, text, None).await
    }

    pub async fn send_with_keyboard(
        &self,
        thread_id: Option<i64>,
        text: &str,
        keyboard: &InlineKeyboard,
    ) -> Result<i64> {
        self.transport
            .send(self.chat_id, thread_id, text, Some(keyboard))
            .await
    }

    /// Open the rolling-buffer stream for one session. Returned sender
    /// accepts typed items; dropping it flushes and ends the actor.
    pub fn open_stream(&self, session_id: &str, thread_id: i64) -> mpsc::Sender<StreamItem> {
        spawn_stream(
            Arc::clone(&self.transport),
            self.chat_id,
            thread_id,
            session_id.to_string(),
            Arc::clone(&self.state),
        )
    }
}

/// Spawn a buffer actor for one stream key. Incoming items accumulate
/// into at most `MAX_MSG`-sized messages, flushed on the quiet timer, on
/// overflow, or on a kind change; `ask_user` and `result` chunks bypass
/// the buffer. Every flush is a new message so history is preserved.
pub fn spawn_stream(
    transport: Arc<dyn ChatTransport>,
    chat_id: i64,
    thread_id: i64,
    session_id: String,
    state: Arc<SharedState>,
) -> mpsc::Sender<StreamItem> {
    let (tx, mut rx) = mpsc::channel::<StreamItem>(256);

    tokio::spawn(async move {
        let mut buf = String::new();
        let mut kind: Option<BufferKind> = None;
        let idle = Duration::from_secs(86400);
        let timer = tokio::time::sleep(idle);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                item = rx.recv() => {
                    let Some(item) = item else {
                        flush(&*transport, chat_id, thread_id, &mut buf, &mut kind).await;
                        break;
                    };

                    match item {
                        StreamItem::Chunk(Chunk::AskUser { tool_id, question, options }) => {
                            flush(&*transport, chat_id, thread_id, &mut buf, &mut kind).await;
                            send_question(
                                &*transport, chat_id, thread_id, &session_id, &state,
                                tool_id, question, options,
                            ).await;
                            timer.as_mut().reset(tokio::time::Instant::now() + idle);
                        }
                        StreamItem::Chunk(Chunk::Result { subtype, cost_usd, duration_ms }) => {
                            flush(&*transport, chat_id, thread_id, &mut buf, &mut kind).await;
                            let mut line = format!("Result: {}", subtype);
                            if let Some(cost) = cost_usd {
                                line.push_str(&format!(" · cost {}", common::fmt::format_cost(cost)));
                            }
                            if let Some(duration) = duration_ms {
                                line.push_str(&format!(
                                    " · took {}",
                                    common::fmt::format_duration_ms(duration)
                                ));
                            }
                            send_line(&*transport, chat_id, thread_id, &line).await;
                            timer.as_mut().reset(tokio::time::Instant::now() + idle);
                        }
                        StreamItem::Notice(text) => {
                            flush(&*transport, chat_id, thread_id, &mut buf, &mut kind).await;
                            send_line(&*transport, chat_id, thread_id, &text).await;
                            timer.as_mut().reset(tokio::time::Instant::now() + idle);
                        }
                        other => {
                            let Some((item_kind, text)) = format_item(other) else {
                                continue;
                            };
                            if text.trim().is_empty() {
                                continue;
                            }

                            // A kind change or overflow flushes before the
                            // new chunk is appended
                            if (kind.is_some() && kind != Some(item_kind) && !buf.is_empty())
                                || (!buf.is_empty() && buf.len() + text.len() + 1 > MAX_MSG)
                            {
                                flush(&*transport, chat_id, thread_id, &mut buf, &mut kind).await;
                            }

                            if !buf.is_empty() {
                                buf.push('\n');
                            }
                            buf.push_str(&text);
                            kind = Some(item_kind);

                            // A single oversized chunk goes out in pieces
                            while buf.len() > MAX_MSG {
                                let head = split_at_boundary(&mut buf, MAX_MSG);
                                send_line(&*transport, chat_id, thread_id, &head).await;
                            }

                            timer.as_mut().reset(
                                tokio::time::Instant::now() + Duration::from_millis(FLUSH_MS),
                            );
                        }
                    }
                }
                _ = &mut timer => {
                    flush(&*transport, chat_id, thread_id, &mut buf, &mut kind).await;
                    timer.as_mut().reset(tokio::time::Instant::now() + idle);
                }
            }
        }
    });

    tx
}

fn format_item(item: StreamItem) -> Option<(BufferKind, String)> {
    match item {
        StreamItem::Chunk(Chunk::Text { text }) => Some((BufferKind::Text, text)),
        StreamItem::Chunk(Chunk::HookResponse { text }) => {
            let quoted = text
                .lines()
                .map(|l| format!("> {}", l))
                .collect::<Vec<_>>()
                .join("\n");
            Some((BufferKind::Hook, quoted))
        }
        StreamItem::Chunk(Chunk::ToolUse { summary, .. }) => {
            Some((BufferKind::Tool, format!("• {}", summary)))
        }
        StreamItem::Chunk(Chunk::Passthrough { text }) => Some((BufferKind::Passthrough, text)),
        StreamItem::Stderr(text) => {
            let prefixed = text
                .lines()
                .map(|l| format!("[stderr] {}", l))
                .collect::<Vec<_>>()
                .join("\n");
            Some((BufferKind::Stderr, prefixed))
        }
        // Handled before format_item is reached
        StreamItem::Chunk(Chunk::AskUser { .. })
        | StreamItem::Chunk(Chunk::Result { .. })
        | StreamItem::Notice(_) => None,
    }
}

/// Cut `buf` at the largest char boundary at or below `max`, returning the
/// head and leaving the remainder in place.
fn split_at_boundary(buf: &mut String, max: usize) -> String {
    let mut cut = max.min(buf.len());
    while cut > 0 && !buf.is_char_boundary(cut) {
        cut -= 1;
    }
    let rest = buf.split_off(cut);
    std::mem::replace(buf, rest)
}

async fn flush(
    transport: &dyn ChatTransport,
    chat_id: i64,
    thread_id: i64,
    buf: &mut String,
    kind: &mut Option<BufferKind>,
) {
    if buf.is_empty() {
        return;
    }
    let text = std::mem::take(buf);
    *kind = None;
    send_line(transport, chat_id, thread_id, &text).await;
}

async fn send_line(transport: &dyn ChatTransport, chat_id: i64, thread_id: i64, text: &str) {
    if let Err(e) = transport.send(chat_id, Some(thread_id), text, None).await {
        tracing::warn!(thread_id, error = %e, "Failed to post stream message");
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_question(
    transport: &dyn ChatTransport,
    chat_id: i64,
    thread_id: i64,
    session_id: &str,
    state: &SharedState,
    tool_id: String,
    question: String,
    options: Vec<String>,
) {
    let mut keyboard = InlineKeyboard::new();
    for (idx, label) in options.iter().enumerate() {
        let data = CallbackData::Answer {
            thread_id,
            option_index: idx,
        };
        let Some(encoded) = data.encode() else {
            continue;
        };
        keyboard = keyboard.row(vec![InlineKeyboard::button(label.clone(), encoded)]);
    }

    match transport
        .send(chat_id, Some(thread_id), &question, Some(&keyboard))
        .await
    {
        Ok(message_id) => {
            state.pending_questions.insert(
                thread_id,
                PendingQuestion {
                    tool_id,
                    question,
                    options,
                    message_id,
                    session_id: session_id.to_string(),
                },
            );
        }
        Err(e) => {
            tracing::warn!(thread_id, error = %e, "Failed to post question keyboard");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<(Option<i64>, String, bool)>>,
        next_id: AtomicI64,
    }

    impl MockTransport {
        fn sent(&self) -> Vec<(Option<i64>, String, bool)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for MockTransport {
        async fn send(
            &self,
            _chat_id: i64,
            thread_id: Option<i64>,
            text: &str,
            keyboard: Option<&InlineKeyboard>,
        ) -> Result<i64> {
            self.sent
                .lock()
                .unwrap()
                .push((thread_id, text.to_string(), keyboard.is_some()));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 100)
        }

        async fn edit(&self, _: i64, _: i64, _: &str, _: Option<&InlineKeyboard>) -> Result<()> {
            Ok(())
        }
        async fn delete_message(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn create_thread(&self, _: i64, _: &str) -> Result<i64> {
            Ok(1)
        }
        async fn rename_thread(&self, _: i64, _: i64, _: &str) -> Result<()> {
            Ok(())
        }
        async fn close_thread(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn reopen_thread(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn delete_thread(&self, _: i64, _: i64) -> Result<()> {
            Ok(())
        }
        async fn answer_callback(&self, _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn text_chunk(s: &str) -> StreamItem {
        StreamItem::Chunk(Chunk::Text { text: s.into() })
    }

    #[tokio::test]
    async fn quiet_timer_flushes_one_message() {
        let transport = Arc::new(MockTransport::default());
        let state = Arc::new(SharedState::new());
        let tx = spawn_stream(transport.clone(), -1, 7, "s1".into(), state);

        tx.send(text_chunk("hello")).await.unwrap();
        tx.send(text_chunk("world")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(FLUSH_MS + 400)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "hello\nworld");
        assert_eq!(sent[0].0, Some(7));
    }

    #[tokio::test]
    async fn kind_change_flushes_before_append() {
        let transport = Arc::new(MockTransport::default());
        let state = Arc::new(SharedState::new());
        let tx = spawn_stream(transport.clone(), -1, 7, "s1".into(), state);

        tx.send(text_chunk("prose")).await.unwrap();
        tx.send(StreamItem::Chunk(Chunk::ToolUse {
            name: "Bash".into(),
            summary: "Bash `ls`".into(),
        }))
        .await
        .unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, "prose");
        assert_eq!(sent[1].1, "• Bash `ls`");
    }

    #[tokio::test]
    async fn oversize_forces_flush() {
        let transport = Arc::new(MockTransport::default());
        let state = Arc::new(SharedState::new());
        let tx = spawn_stream(transport.clone(), -1, 7, "s1".into(), state);

        let big = "x".repeat(MAX_MSG - 10);
        tx.send(text_chunk(&big)).await.unwrap();
        tx.send(text_chunk("tail")).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, big);
        assert_eq!(sent[1].1, "tail");
    }

    #[tokio::test]
    async fn ask_user_bypasses_buffer_and_registers_question() {
        let transport = Arc::new(MockTransport::default());
        let state = Arc::new(SharedState::new());
        let tx = spawn_stream(transport.clone(), -1, 7, "s1".into(), state.clone());

        tx.send(text_chunk("before")).await.unwrap();
        tx.send(StreamItem::Chunk(Chunk::AskUser {
            tool_id: "tu_1".into(),
            question: "Deploy?".into(),
            options: vec!["Yes".into(), "No".into()],
        }))
        .await
        .unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        // Pending text flushed first, then the standalone keyboard message
        assert_eq!(sent[0].1, "before");
        assert!(!sent[0].2);
        assert_eq!(sent[1].1, "Deploy?");
        assert!(sent[1].2);

        let pending = state.pending_questions.get(&7).expect("question registered");
        assert_eq!(pending.tool_id, "tu_1");
        assert_eq!(pending.options, vec!["Yes".to_string(), "No".to_string()]);
        assert_eq!(pending.session_id, "s1");
    }

    #[tokio::test]
    async fn result_chunk_sends_standalone_summary() {
        let transport = Arc::new(MockTransport::default());
        let state = Arc::new(SharedState::new());
        let tx = spawn_stream(transport.clone(), -1, 7, "s1".into(), state);

        tx.send(StreamItem::Chunk(Chunk::Result {
            subtype: "success".into(),
            cost_usd: Some(0.01),
            duration_ms: Some(1234),
        }))
        .await
        .unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Result: success · cost $0.0100 · took 1.2s");
    }

    #[tokio::test]
    async fn stderr_lines_are_prefixed() {
        let transport = Arc::new(MockTransport::default());
        let state = Arc::new(SharedState::new());
        let tx = spawn_stream(transport.clone(), -1, 7, "s1".into(), state);

        tx.send(StreamItem::Stderr("warning: unused var\nnote: see above".into()))
            .await
            .unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sent = transport.sent();
        assert_eq!(sent[0].1, "[stderr] warning: unused var\n[stderr] note: see above");
    }

    #[test]
    fn split_at_boundary_respects_chars() {
        let mut buf = "héllo wörld".to_string();
        let head = split_at_boundary(&mut buf, 3);
        assert_eq!(head, "hé");
        assert_eq!(buf, "llo wörld");
    }
}
