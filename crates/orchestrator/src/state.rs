use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::shell::ProcessHandle;

/// How long a thread stays in the recently-closed set after its session
/// ends. Late assistant chatter inside this window is still suppressed.
pub const RECENTLY_CLOSED_TTL: Duration = Duration::from_secs(30);

/// Conversation-flow wizard state expires after this much inactivity.
pub const FLOW_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    StreamJson,
    Tui,
}

impl SessionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "stream-json" => Some(SessionMode::StreamJson),
            "tui" => Some(SessionMode::Tui),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::StreamJson => "stream-json",
            SessionMode::Tui => "tui",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub kind: String,
    pub content: String,
    pub ts: DateTime<Utc>,
}

pub type Transcript = Arc<Mutex<Vec<TranscriptEntry>>>;

pub fn transcript_push(transcript: &Transcript, kind: &str, content: &str) {
    if let Ok(mut entries) = transcript.lock() {
        entries.push(TranscriptEntry {
            kind: kind.to_string(),
            content: content.to_string(),
            ts: Utc::now(),
        });
    }
}

/// Render a transcript as plain text for summaries and analysis.
pub fn transcript_text(transcript: &Transcript) -> String {
    let Ok(entries) = transcript.lock() else {
        return String::new();
    };
    entries
        .iter()
        .map(|e| format!("[{}] {}", e.kind, e.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One live session owned by this process. The handle is present while a
/// child process runs and absent between multi-turn resumes.
#[derive(Clone)]
pub struct ActiveSession {
    pub session_id: String,
    pub thread_id: i64,
    pub machine: String,
    pub project: String,
    pub mode: SessionMode,
    pub task_id: Option<String>,
    pub workspace: Option<String>,
    pub handle: Option<ProcessHandle>,
    pub transcript: Transcript,
}

/// A question the engine asked that is waiting for a keyboard answer.
#[derive(Debug, Clone)]
pub struct PendingQuestion {
    pub tool_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub message_id: i64,
    pub session_id: String,
}

/// Threads the chatter suppressor must protect: live sessions, live
/// directory browses, and sessions closed within the TTL.
#[derive(Default)]
pub struct SuppressionGuard {
    active: DashMap<i64, ()>,
    browsing: DashMap<i64, ()>,
    recently_closed: DashMap<i64, Instant>,
}

impl SuppressionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_active(&self, thread_id: i64) {
        self.active.insert(thread_id, ());
    }

    /// Session ended: the thread moves to the recently-closed set.
    pub fn clear_active(&self, thread_id: i64) {
        self.active.remove(&thread_id);
        self.recently_closed.insert(thread_id, Instant::now());
    }

    pub fn mark_browsing(&self, thread_id: i64) {
        self.browsing.insert(thread_id, ());
    }

    pub fn clear_browsing(&self, thread_id: i64) {
        self.browsing.remove(&thread_id);
    }

    pub fn is_suppressed(&self, thread_id: i64) -> bool {
        if self.active.contains_key(&thread_id) || self.browsing.contains_key(&thread_id) {
            return true;
        }
        if let Some(closed_at) = self.recently_closed.get(&thread_id).map(|e| *e.value()) {
            if closed_at.elapsed() <= RECENTLY_CLOSED_TTL {
                return true;
            }
            self.recently_closed.remove(&thread_id);
        }
        false
    }
}

/// Process-local shared state. Each map has a single-owner rule (the
/// session supervisor for its own entries); the callback router reads.
pub struct SharedState {
    pub active_sessions: DashMap<String, ActiveSession>,
    pub sessions_by_thread: DashMap<i64, String>,
    pub pending_questions: DashMap<i64, PendingQuestion>,
    pub inbox: DashMap<i64, VecDeque<String>>,
    pub suppression: Arc<SuppressionGuard>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            active_sessions: DashMap::new(),
            sessions_by_thread: DashMap::new(),
            pending_questions: DashMap::new(),
            inbox: DashMap::new(),
            suppression: Arc::new(SuppressionGuard::new()),
        }
    }

    pub fn register_session(&self, session: ActiveSession) {
        self.suppression.mark_active(session.thread_id);
        self.sessions_by_thread
            .insert(session.thread_id, session.session_id.clone());
        self.active_sessions
            .insert(session.session_id.clone(), session);
    }

    pub fn set_session_handle(&self, session_id: &str, handle: Option<ProcessHandle>) {
        if let Some(mut session) = self.active_sessions.get_mut(session_id) {
            session.handle = handle;
        }
    }

    /// Remove a session; the thread enters the recently-closed window and
    /// any pending question for it is dropped.
    pub fn remove_session(&self, session_id: &str) -> Option<ActiveSession> {
        let (_, session) = self.active_sessions.remove(session_id)?;
        self.sessions_by_thread.remove(&session.thread_id);
        self.pending_questions.remove(&session.thread_id);
        self.inbox.remove(&session.thread_id);
        self.suppression.clear_active(session.thread_id);
        Some(session)
    }

    pub fn session_by_thread(&self, thread_id: i64) -> Option<ActiveSession> {
        let session_id = self.sessions_by_thread.get(&thread_id)?.clone();
        self.active_sessions.get(&session_id).map(|s| s.clone())
    }

    pub fn push_inbox(&self, thread_id: i64, text: String) {
        self.inbox.entry(thread_id).or_default().push_back(text);
    }

    pub fn pop_inbox(&self, thread_id: i64) -> Option<String> {
        self.inbox.get_mut(&thread_id)?.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_mode_parses() {
        assert_eq!(SessionMode::parse("stream-json"), Some(SessionMode::StreamJson));
        assert_eq!(SessionMode::parse("tui"), Some(SessionMode::Tui));
        assert_eq!(SessionMode::parse("repl"), None);
    }

    #[test]
    fn suppression_tracks_lifecycle() {
        let guard = SuppressionGuard::new();
        assert!(!guard.is_suppressed(7));

        guard.mark_active(7);
        assert!(guard.is_suppressed(7));

        guard.clear_active(7);
        // Inside the recently-closed window the thread stays suppressed
        assert!(guard.is_suppressed(7));
    }

    #[test]
    fn browsing_threads_are_suppressed() {
        let guard = SuppressionGuard::new();
        guard.mark_browsing(9);
        assert!(guard.is_suppressed(9));
        guard.clear_browsing(9);
        assert!(!guard.is_suppressed(9));
    }

    #[test]
    fn inbox_is_fifo() {
        let state = SharedState::new();
        state.push_inbox(1, "first".into());
        state.push_inbox(1, "second".into());
        assert_eq!(state.pop_inbox(1).as_deref(), Some("first"));
        assert_eq!(state.pop_inbox(1).as_deref(), Some("second"));
        assert_eq!(state.pop_inbox(1), None);
    }

    #[test]
    fn register_and_remove_session() {
        let state = SharedState::new();
        let transcript: Transcript = Arc::new(Mutex::new(Vec::new()));
        state.register_session(ActiveSession {
            session_id: "s1".into(),
            thread_id: 42,
            machine: "alpha".into(),
            project: "foo".into(),
            mode: SessionMode::StreamJson,
            task_id: None,
            workspace: None,
            handle: None,
            transcript,
        });

        assert!(state.suppression.is_suppressed(42));
        assert_eq!(state.session_by_thread(42).unwrap().session_id, "s1");

        let removed = state.remove_session("s1").unwrap();
        assert_eq!(removed.thread_id, 42);
        assert!(state.session_by_thread(42).is_none());
        // Recently closed: still suppressed
        assert!(state.suppression.is_suppressed(42));
    }

    #[test]
    fn transcript_renders_in_order() {
        let transcript: Transcript = Arc::new(Mutex::new(Vec::new()));
        transcript_push(&transcript, "text", "hello");
        transcript_push(&transcript, "user_input", "go on");
        let text = transcript_text(&transcript);
        assert_eq!(text, "[text] hello\n[user_input] go on");
    }
}
