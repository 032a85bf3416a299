use common::OrcError;
use metrics::counter;
use regex::Regex;
use shell_escape::escape;
use std::borrow::Cow;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::chat::{StreamItem, TopicFacade};
use crate::database::{Database, TaskStatus};
use crate::engine::{classify_failure, Engine};
use crate::machines::MachineRegistry;
use crate::scrub::scrub;
use crate::shell::{ProcessEvent, ShellGateway, SpawnOptions};
use crate::state::{
    transcript_push, transcript_text, ActiveSession, SessionMode, SharedState, Transcript,
};
use crate::stream::{wrap_user_input, Chunk, StreamParser};

/// How often the waiting-input loop polls the task inbox.
const RESUME_POLL: Duration = Duration::from_secs(5);
/// How long a task waits for a human reply before giving up.
const RESUME_WAIT_MAX: Duration = Duration::from_secs(30 * 60);
/// Cadence of the application-level task heartbeat.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Rolling output tail kept for error classification and the needs-input
/// heuristic.
const TAIL_KEEP: usize = 4000;
/// The needs-input heuristic only looks at the end of the tail.
const NEEDS_INPUT_WINDOW: usize = 500;

#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub session_id: String,
    pub machine: String,
    pub workdir: String,
    pub prompt: String,
    /// Prompt already materialized on the remote (task runs); the first
    /// turn pipes this file into the engine instead of writing stdin.
    pub prompt_path: Option<String>,
    pub thread_id: i64,
    pub mode: SessionMode,
    pub project: String,
    pub task_id: Option<String>,
    pub preferred_engine: Option<Engine>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
    /// The waiting-input deadline passed without a reply.
    pub wait_expired: bool,
    pub turns: u32,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub engine: Engine,
    pub tail: String,
    pub transcript_text: String,
}

#[derive(Debug)]
struct AttemptOutcome {
    code: i32,
    timed_out: bool,
    cost_usd: f64,
    duration_ms: u64,
    tail: String,
}

/// What the next engine invocation starts from.
enum TurnInput {
    Initial,
    /// Native resume (`--continue`) with the user's reply on stdin.
    Resume(String),
    /// Engines without native resume: fresh spawn, original prompt plus
    /// the reply appended.
    Reprompt(String),
}

/// Owns one logical session: spawns the engine over the shell gateway,
/// turns its byte stream into chat output, handles questions, engine
/// fallback, and multi-turn resumes.
pub struct SessionSupervisor {
    shell: Arc<ShellGateway>,
    facade: Arc<TopicFacade>,
    db: Database,
    registry: MachineRegistry,
    state: Arc<SharedState>,
}

impl SessionSupervisor {
    pub fn new(
        shell: Arc<ShellGateway>,
        facade: Arc<TopicFacade>,
        db: Database,
        registry: MachineRegistry,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            shell,
            facade,
            db,
            registry,
            state,
        }
    }

    pub async fn run(&self, request: SessionRequest) -> Result<SessionOutcome, OrcError> {
        let transcript: Transcript = Default::default();
        self.state.register_session(ActiveSession {
            session_id: request.session_id.clone(),
            thread_id: request.thread_id,
            machine: request.machine.clone(),
            project: request.project.clone(),
            mode: request.mode,
            task_id: request.task_id.clone(),
            workspace: Some(request.workdir.clone()),
            handle: None,
            transcript: Arc::clone(&transcript),
        });
        counter!("sessions_started_total").increment(1);

        let stream_tx = self.facade.open_stream(&request.session_id, request.thread_id);

        let result = self.run_turns(&request, &transcript, &stream_tx).await;

        let note = match &result {
            Ok(outcome) => format!("Session ended ({})", outcome.exit_code),
            Err(e) => format!("Session failed: {}", e.message()),
        };
        let _ = stream_tx.send(StreamItem::Notice(note)).await;
        drop(stream_tx);

        self.state.remove_session(&request.session_id);

        result.map(|mut outcome| {
            outcome.transcript_text = transcript_text(&transcript);
            outcome
        })
    }

    async fn run_turns(
        &self,
        request: &SessionRequest,
        transcript: &Transcript,
        stream_tx: &mpsc::Sender<StreamItem>,
    ) -> Result<SessionOutcome, OrcError> {
        let priority = self
            .registry
            .engine_priority(&request.machine)
            .await
            .map_err(|e| OrcError::fatal(format!("engine priority lookup failed: {}", e)))?;

        let mut candidates: Vec<Engine> = Vec::new();
        if let Some(preferred) = request.preferred_engine {
            candidates.push(preferred);
        }
        for engine in priority {
            if !candidates.contains(&engine) {
                candidates.push(engine);
            }
        }

        let windows = self
            .shell
            .target(&request.machine)
            .map(|t| t.windows)
            .unwrap_or(false);

        let mut total_cost = 0.0f64;
        let mut total_duration = 0u64;
        let mut turn: u32 = 1;
        let mut idx = 0;

        while idx < candidates.len() {
            let engine = candidates[idx];

            let auth_ok = self
                .shell
                .exec(&request.machine, &engine.auth_probe())
                .await
                .map(|o| o.success)
                .unwrap_or(false);
            if !auth_ok {
                tracing::info!(
                    session_id = %request.session_id,
                    engine = engine.as_str(),
                    "Engine auth probe failed, skipping"
                );
                idx += 1;
                continue;
            }

            let mut turn_input = TurnInput::Initial;
            loop {
                let attempt = self
                    .run_attempt(request, engine, turn, &turn_input, windows, transcript, stream_tx)
                    .await?;
                total_cost += attempt.cost_usd;
                total_duration += attempt.duration_ms;

                let outcome = SessionOutcome {
                    exit_code: attempt.code,
                    timed_out: attempt.timed_out,
                    wait_expired: false,
                    turns: turn,
                    total_cost_usd: total_cost,
                    total_duration_ms: total_duration,
                    engine,
                    tail: attempt.tail.clone(),
                    transcript_text: String::new(),
                };

                // A timeout is terminal, never retried on another engine
                if attempt.timed_out {
                    return Ok(outcome);
                }

                if let Some(err) = classify_failure(&attempt.tail, attempt.code) {
                    if idx + 1 < candidates.len() {
                        let next = candidates[idx + 1];
                        counter!("engine_fallbacks_total").increment(1);
                        let _ = stream_tx
                            .send(StreamItem::Notice(format!(
                                "Engine {} unavailable ({}), trying {}",
                                engine.as_str(),
                                err.message(),
                                next.as_str()
                            )))
                            .await;
                        idx += 1;
                        break;
                    }
                    return Ok(outcome);
                }

                if request.task_id.is_some() && attempt.code == 0 && needs_input(&attempt.tail) {
                    if let Some(task_id) = &request.task_id {
                        let _ = self.db.set_task_status(task_id, TaskStatus::WaitingInput).await;
                    }
                    let _ = stream_tx
                        .send(StreamItem::Notice(format!(
                            "Waiting for your reply (turn {})",
                            turn
                        )))
                        .await;

                    match self.wait_for_reply(request.thread_id).await {
                        Some(reply) => {
                            if let Some(task_id) = &request.task_id {
                                let _ = self.db.set_task_status(task_id, TaskStatus::Running).await;
                            }
                            transcript_push(transcript, "user_input", &reply);
                            turn += 1;
                            turn_input = if engine.supports_continue() {
                                TurnInput::Resume(reply)
                            } else {
                                TurnInput::Reprompt(reply)
                            };
                            continue;
                        }
                        None => {
                            return Ok(SessionOutcome {
                                wait_expired: true,
                                ..outcome
                            });
                        }
                    }
                }

                return Ok(outcome);
            }
        }

        Err(OrcError::auth(format!(
            "no engine with valid credentials on {}",
            request.machine
        )))
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        request: &SessionRequest,
        engine: Engine,
        turn: u32,
        turn_input: &TurnInput,
        windows: bool,
        transcript: &Transcript,
        stream_tx: &mpsc::Sender<StreamItem>,
    ) -> Result<AttemptOutcome, OrcError> {
        let (invocation, stdin_payload, close_stdin) = match (request.mode, turn_input) {
            (SessionMode::Tui, _) => (
                engine.tui_invocation(),
                Some(format!("{}\n", request.prompt)),
                false,
            ),
            (SessionMode::StreamJson, TurnInput::Initial) => match &request.prompt_path {
                Some(path) => {
                    let task_id = request.task_id.as_deref().unwrap_or(&request.session_id);
                    (batch_command(engine, path, task_id, windows), None, true)
                }
                None => (
                    engine.stream_json_invocation(false),
                    Some(wrap_user_input(&request.prompt)),
                    false,
                ),
            },
            (SessionMode::StreamJson, TurnInput::Resume(reply)) => (
                engine.stream_json_invocation(true),
                Some(wrap_user_input(reply)),
                false,
            ),
            (SessionMode::StreamJson, TurnInput::Reprompt(reply)) => {
                let combined = format!("{}\n\nUser reply (turn {}): {}", request.prompt, turn, reply);
                (
                    engine.stream_json_invocation(false),
                    Some(wrap_user_input(&combined)),
                    false,
                )
            }
        };

        let full_cmd = format!(
            "cd {} && {}",
            escape(Cow::Borrowed(request.workdir.as_str())),
            invocation
        );

        tracing::info!(
            session_id = %request.session_id,
            engine = engine.as_str(),
            turn,
            mode = request.mode.as_str(),
            "Spawning engine"
        );

        let (events_tx, mut events_rx) = mpsc::channel::<ProcessEvent>(256);
        let opts = SpawnOptions {
            use_pty: request.mode == SessionMode::Tui && !windows,
            close_stdin,
            timeout: request.timeout,
        };
        let handle = self
            .shell
            .spawn(&request.machine, &full_cmd, opts, events_tx)
            .await
            .map_err(|e| OrcError::fatal(format!("failed to spawn engine: {}", e)))?;

        self.state
            .set_session_handle(&request.session_id, Some(handle.clone()));

        if let Some(payload) = stdin_payload
            && let Err(e) = handle.write(payload.as_bytes()).await
        {
            tracing::warn!(session_id = %request.session_id, error = %e, "Failed to write initial input");
        }

        let started = Instant::now();
        let mut parser = StreamParser::new();
        let mut tail = String::new();
        let mut cost_usd = 0.0f64;
        let mut duration_ms = 0u64;
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await; // first tick is immediate

        let exit_code = loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(ProcessEvent::Stdout(bytes)) => {
                            match request.mode {
                                SessionMode::StreamJson => {
                                    for chunk in parser.feed(&bytes) {
                                        self.handle_chunk(
                                            chunk, transcript, stream_tx,
                                            &mut tail, &mut cost_usd, &mut duration_ms,
                                        ).await;
                                    }
                                }
                                SessionMode::Tui => {
                                    let text = scrub(&bytes);
                                    if !text.trim().is_empty() {
                                        push_tail(&mut tail, &text);
                                        transcript_push(transcript, "text", &text);
                                        let _ = stream_tx
                                            .send(StreamItem::Chunk(Chunk::Text { text }))
                                            .await;
                                    }
                                }
                            }
                        }
                        Some(ProcessEvent::Stderr(bytes)) => {
                            let text = scrub(&bytes);
                            if !text.trim().is_empty() {
                                push_tail(&mut tail, &text);
                                transcript_push(transcript, "stderr", &text);
                                let _ = stream_tx.send(StreamItem::Stderr(text)).await;
                            }
                        }
                        Some(ProcessEvent::Exit(code)) => {
                            for chunk in parser.finish() {
                                self.handle_chunk(
                                    chunk, transcript, stream_tx,
                                    &mut tail, &mut cost_usd, &mut duration_ms,
                                ).await;
                            }
                            break code;
                        }
                        None => break -1,
                    }
                }
                _ = heartbeat.tick() => {
                    if let Some(task_id) = &request.task_id
                        && let Err(e) = self.db.refresh_task_heartbeat(task_id).await
                    {
                        tracing::warn!(task_id = %task_id, error = %e, "Task heartbeat failed");
                    }
                }
            }
        };

        self.state.set_session_handle(&request.session_id, None);

        let timed_out = started.elapsed() >= request.timeout;
        if duration_ms == 0 {
            duration_ms = started.elapsed().as_millis() as u64;
        }

        Ok(AttemptOutcome {
            code: exit_code,
            timed_out,
            cost_usd,
            duration_ms,
            tail,
        })
    }

    async fn handle_chunk(
        &self,
        chunk: Chunk,
        transcript: &Transcript,
        stream_tx: &mpsc::Sender<StreamItem>,
        tail: &mut String,
        cost_usd: &mut f64,
        duration_ms: &mut u64,
    ) {
        match &chunk {
            Chunk::Text { text } => {
                push_tail(tail, text);
                transcript_push(transcript, "text", text);
                tracing::debug!(preview = %preview(text), "text chunk");
            }
            Chunk::HookResponse { text } => {
                transcript_push(transcript, "hook_response", text);
            }
            Chunk::AskUser { question, .. } => {
                transcript_push(transcript, "ask_user", question);
            }
            Chunk::ToolUse { summary, .. } => {
                transcript_push(transcript, "tool_use", summary);
                tracing::debug!(tool = %summary, "tool chunk");
            }
            Chunk::Result {
                subtype,
                cost_usd: cost,
                duration_ms: duration,
            } => {
                transcript_push(transcript, "result", subtype);
                if let Some(c) = cost {
                    *cost_usd += c;
                }
                if let Some(d) = duration {
                    *duration_ms += d;
                }
            }
            Chunk::Passthrough { text } => {
                push_tail(tail, text);
                transcript_push(transcript, "passthrough", text);
            }
        }
        let _ = stream_tx.send(StreamItem::Chunk(chunk)).await;
    }

    /// Poll the thread's input inbox until a reply arrives or the wait
    /// deadline passes.
    async fn wait_for_reply(&self, thread_id: i64) -> Option<String> {
        let deadline = Instant::now() + RESUME_WAIT_MAX;
        while Instant::now() < deadline {
            if let Some(reply) = self.state.pop_inbox(thread_id) {
                return Some(reply);
            }
            tokio::time::sleep(RESUME_POLL).await;
        }
        None
    }
}

/// Batch invocation for task runs: the prompt file is piped into the
/// engine with the task id in its environment.
pub fn batch_command(engine: Engine, prompt_path: &str, task_id: &str, windows: bool) -> String {
    if windows {
        // PowerShell variant: load credentials from profile files, then
        // pipe the prompt file in
        format!(
            "$env:TASK_ID='{id}'; \
             if (Test-Path $HOME/.claude/oauth_token) {{ $env:CLAUDE_CODE_OAUTH_TOKEN = Get-Content $HOME/.claude/oauth_token -Raw }}; \
             if (Test-Path $HOME/.config/agent/api_keys.ps1) {{ . $HOME/.config/agent/api_keys.ps1 }}; \
             Get-Content '{path}' -Raw | {cmd} --dangerously-skip-permissions -p",
            id = task_id,
            path = prompt_path,
            cmd = engine.command(),
        )
    } else {
        format!(
            "cat {path} | TASK_ID={id} {cmd}",
            path = escape(Cow::Borrowed(prompt_path)),
            id = task_id,
            cmd = engine.batch_invocation(),
        )
    }
}

fn preview(text: &str) -> &str {
    common::fmt::truncate_chars(text, 120)
}

/// Keep the last `TAIL_KEEP` chars of output for classification.
fn push_tail(tail: &mut String, text: &str) {
    tail.push_str(text);
    if tail.len() > TAIL_KEEP {
        let cut = tail.len() - TAIL_KEEP;
        let mut boundary = cut;
        while boundary < tail.len() && !tail.is_char_boundary(boundary) {
            boundary += 1;
        }
        tail.drain(..boundary);
    }
}

static NEEDS_INPUT_RES: OnceLock<Vec<Regex>> = OnceLock::new();

fn needs_input_patterns() -> &'static Vec<Regex> {
    NEEDS_INPUT_RES.get_or_init(|| {
        [
            r"(?m)\?\s*$",
            r"(?i)\b(which|what|how|should i|do you want|would you)\b[^\n?]*\?",
            r"(?i)\bplease (choose|select|specify|confirm|clarify)\b",
            r"(?i)\bwaiting for (your|user) (approval|input|response|reply|confirmation)\b",
            r"(?i)\boption [a-d]\b",
            r"(?i)\b(allow|deny|permit|authorize)\b[^\n?]*\?",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("invalid needs-input regex"))
        .collect()
    })
}

/// Does the output tail look like the engine stopped to ask something?
/// Deliberately loose: a false positive only costs a bounded wait the
/// user can cancel.
pub fn needs_input(tail: &str) -> bool {
    let trimmed = tail.trim_end();
    if trimmed.is_empty() {
        return false;
    }
    let start = trimmed
        .char_indices()
        .rev()
        .nth(NEEDS_INPUT_WINDOW - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let window = &trimmed[start..];
    needs_input_patterns().iter().any(|re| re.is_match(window))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_mark_at_end() {
        assert!(needs_input("I edited the file. Which file should I edit next?"));
        assert!(needs_input("All done.\nShould I also update the tests?"));
    }

    #[test]
    fn phrase_patterns() {
        assert!(needs_input("Please choose one of the branches below"));
        assert!(needs_input("Waiting for your approval before pushing"));
        assert!(needs_input("Pick option A to continue, option B to abort"));
        assert!(needs_input("Do you want me to allow the migration?"));
    }

    #[test]
    fn plain_completion_is_not_input() {
        assert!(!needs_input("Committed and pushed. All tests pass."));
        assert!(!needs_input(""));
        assert!(!needs_input("Wrote 3 files.\nDone."));
    }

    #[test]
    fn only_the_window_counts() {
        let mut tail = "Should I proceed?".to_string();
        tail.push_str(&"filler text without questions. ".repeat(40));
        // The question scrolled out of the 500-char window
        assert!(!needs_input(&tail));
    }

    #[test]
    fn batch_command_posix() {
        let cmd = batch_command(Engine::Claude, "/tmp/task-a1.prompt", "a1b2", false);
        assert_eq!(cmd, "cat /tmp/task-a1.prompt | TASK_ID=a1b2 itachi --ds --dp");
    }

    #[test]
    fn batch_command_windows_uses_powershell() {
        let cmd = batch_command(Engine::Claude, "C:/tasks/a1.prompt", "a1b2", true);
        assert!(cmd.starts_with("$env:TASK_ID='a1b2'"));
        assert!(cmd.contains("Get-Content 'C:/tasks/a1.prompt' -Raw"));
        assert!(cmd.contains("itachi --dangerously-skip-permissions -p"));
        assert!(!cmd.contains("&&"));
    }

    #[test]
    fn push_tail_keeps_last_chars() {
        let mut tail = String::new();
        push_tail(&mut tail, &"a".repeat(TAIL_KEEP));
        push_tail(&mut tail, "end marker");
        assert!(tail.len() <= TAIL_KEEP);
        assert!(tail.ends_with("end marker"));
    }
}
