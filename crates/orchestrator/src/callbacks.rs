use chat_client::{CallbackQuery, IncomingMessage};
use common::CallbackData;
use dashmap::DashMap;
use shell_escape::escape;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::chat::TopicFacade;
use crate::config::settings;
use crate::database::{Database, NewTask};
use crate::executor::TaskExecutor;
use crate::flows::{
    listing_keyboard, machine_keyboard, parse_start_mode, repo_mode_keyboard, start_mode_keyboard,
    ConversationFlows, Flow, FlowKind, FlowStep,
};
use crate::machines::MachineRegistry;
use crate::session::{SessionRequest, SessionSupervisor};
use crate::shell::ShellGateway;
use crate::state::{SessionMode, SharedState};
use crate::stream::wrap_user_input;
use crate::transport::ChatTransport;

/// Browse sessions expire after this much inactivity; every interaction
/// refreshes the clock.
const BROWSE_TTL: Duration = Duration::from_secs(10 * 60);

/// One live directory-browse, independent of any wizard.
#[derive(Debug, Clone)]
struct BrowseSession {
    machine: String,
    path: String,
    message_id: Option<i64>,
    thread_id: Option<i64>,
    listings: Vec<String>,
    /// When set, "use this directory" offers the engine picker and starts
    /// a session with this prompt.
    prompt: Option<String>,
    touched: Instant,
}

/// Translates inline-keyboard callbacks and chat messages into state
/// changes: question answers, wizard progression, directory browsing,
/// topic deletion, and task-input routing.
pub struct CallbackRouter {
    db: Database,
    state: Arc<SharedState>,
    flows: Arc<ConversationFlows>,
    facade: Arc<TopicFacade>,
    shell: Arc<ShellGateway>,
    registry: MachineRegistry,
    supervisor: Arc<SessionSupervisor>,
    transport: Arc<dyn ChatTransport>,
    executor: Option<Arc<TaskExecutor>>,
    browse: DashMap<(i64, i64), BrowseSession>,
}

impl CallbackRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        state: Arc<SharedState>,
        flows: Arc<ConversationFlows>,
        facade: Arc<TopicFacade>,
        shell: Arc<ShellGateway>,
        registry: MachineRegistry,
        supervisor: Arc<SessionSupervisor>,
        transport: Arc<dyn ChatTransport>,
        executor: Option<Arc<TaskExecutor>>,
    ) -> Self {
        Self {
            db,
            state,
            flows,
            facade,
            shell,
            registry,
            supervisor,
            transport,
            executor,
            browse: DashMap::new(),
        }
    }

    pub async fn handle_callback(&self, cb: CallbackQuery) {
        let _ = self.transport.answer_callback(&cb.id).await;

        let Some(data) = cb.data.as_deref().and_then(CallbackData::parse) else {
            tracing::debug!(data = ?cb.data, "Unparseable callback payload");
            return;
        };

        match data {
            CallbackData::Answer {
                thread_id,
                option_index,
            } => self.handle_answer(thread_id, option_index).await,
            CallbackData::DeleteTopic { thread_id } => {
                if let Err(e) = self.facade.delete_topic(thread_id).await {
                    tracing::warn!(thread_id, error = %e, "Topic deletion refused");
                    let _ = self
                        .facade
                        .send(Some(thread_id), &format!("Cannot delete this topic: {}", e))
                        .await;
                }
            }
            CallbackData::TaskFlow { key, value } => {
                self.handle_flow(FlowKind::Task, &key, &value, &cb).await
            }
            CallbackData::SessionFlow { key, value } => {
                self.handle_flow(FlowKind::Session, &key, &value, &cb).await
            }
            CallbackData::Browse { value } => self.handle_browse(&value, &cb).await,
        }
    }

    /// `answer:<thread>:<i>`: resolve the pending question, show the
    /// chosen label, and inject the framed answer into the engine's stdin.
    async fn handle_answer(&self, thread_id: i64, option_index: usize) {
        let Some((_, question)) = self.state.pending_questions.remove(&thread_id) else {
            tracing::debug!(thread_id, "Answer for unknown or already-answered question");
            return;
        };

        let Some(label) = question.options.get(option_index).cloned() else {
            tracing::warn!(thread_id, option_index, "Answer index out of range");
            return;
        };

        let edited = format!("{}\n\nAnswered: {}", question.question, label);
        if let Err(e) = self
            .transport
            .edit(self.facade.chat_id(), question.message_id, &edited, None)
            .await
        {
            tracing::warn!(thread_id, error = %e, "Failed to edit answered question");
        }

        if let Some(session) = self.state.active_sessions.get(&question.session_id) {
            crate::state::transcript_push(&session.transcript, "user_input", &label);
            if let Some(handle) = session.handle.clone() {
                drop(session);
                if let Err(e) = handle.write(wrap_user_input(&label).as_bytes()).await {
                    tracing::warn!(thread_id, error = %e, "Failed to write answer to engine");
                }
            }
        }
    }

    // -- wizard progression --

    async fn handle_flow(&self, kind: FlowKind, key: &str, value: &str, cb: &CallbackQuery) {
        self.flows.prune_expired();
        let chat_id = cb.message.as_ref().map(|m| m.chat.id).unwrap_or_default();
        let user_id = cb.from.id;
        let message_id = cb.message.as_ref().map(|m| m.message_id);

        let mut flow = match self.flows.get(chat_id, user_id) {
            Some(f) => f,
            None => {
                // A stale keyboard from an expired flow: restart at machine
                // selection
                let mut f = Flow::new(kind, chat_id);
                f.message_id = message_id;
                f
            }
        };
        flow.message_id = message_id.or(flow.message_id);

        match (key, value) {
            ("machine", idx) => {
                let Some(machine) = idx
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| flow.listings.get(i).cloned())
                else {
                    return self.restart_flow(kind, chat_id, user_id, flow.message_id).await;
                };
                flow.machine = Some(machine);
                if kind == FlowKind::Task {
                    flow.step = FlowStep::SelectRepoMode;
                    flow.listings.clear();
                    self.edit_wizard(&flow, "Repository:", repo_mode_keyboard(kind)).await;
                } else {
                    self.show_repo_listing(&mut flow).await;
                }
                self.flows.put(chat_id, user_id, flow);
            }
            ("repomode", "existing") => {
                self.show_repo_listing(&mut flow).await;
                self.flows.put(chat_id, user_id, flow);
            }
            ("repomode", "new") => {
                flow.step = FlowStep::AwaitProjectName;
                self.edit_wizard_plain(&flow, "Send the new project name as a message.").await;
                self.flows.put(chat_id, user_id, flow);
            }
            ("repo", "back") => {
                self.restart_flow(kind, chat_id, user_id, flow.message_id).await;
            }
            ("repo", idx) => {
                let Some(repo) = idx
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| flow.listings.get(i).cloned())
                else {
                    return self.restart_flow(kind, chat_id, user_id, flow.message_id).await;
                };
                flow.project = Some(repo.clone());
                flow.path = Some(format!("{}/{}", settings().repos_base_path, repo));
                self.show_subfolder_listing(&mut flow).await;
                self.flows.put(chat_id, user_id, flow);
            }
            ("sub", "here") => {
                flow.step = FlowStep::SelectStartMode;
                flow.listings.clear();
                self.edit_wizard(&flow, "Engine and mode:", start_mode_keyboard(kind)).await;
                self.flows.put(chat_id, user_id, flow);
            }
            ("sub", "back") => {
                let repo_root = flow
                    .project
                    .as_ref()
                    .map(|p| format!("{}/{}", settings().repos_base_path, p));
                if flow.path == repo_root {
                    // At the repo root: back returns to repo selection
                    self.show_repo_listing(&mut flow).await;
                } else if let Some(path) = &flow.path {
                    let parent = path.rsplit_once('/').map(|(p, _)| p.to_string());
                    flow.path = parent.or(flow.path.clone());
                    self.show_subfolder_listing(&mut flow).await;
                }
                self.flows.put(chat_id, user_id, flow);
            }
            ("sub", idx) => {
                let Some(dir) = idx
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| flow.listings.get(i).cloned())
                else {
                    return;
                };
                if let Some(path) = &flow.path {
                    flow.path = Some(format!("{}/{}", path, dir));
                }
                self.show_subfolder_listing(&mut flow).await;
                self.flows.put(chat_id, user_id, flow);
            }
            ("start", value) => {
                let Some((engine, mode)) = parse_start_mode(value) else {
                    return;
                };
                flow.engine = Some(engine);
                flow.mode = Some(mode);
                match kind {
                    FlowKind::Task => {
                        flow.step = FlowStep::AwaitDescription;
                        self.edit_wizard_plain(&flow, "Send the task description as a message.")
                            .await;
                        self.flows.put(chat_id, user_id, flow);
                    }
                    FlowKind::Session => {
                        self.flows.take(chat_id, user_id);
                        self.spawn_interactive_session(flow).await;
                    }
                }
            }
            _ => {
                tracing::debug!(key, value, "Unhandled flow callback");
            }
        }
    }

    async fn restart_flow(&self, kind: FlowKind, chat_id: i64, user_id: i64, message_id: Option<i64>) {
        let mut flow = Flow::new(kind, chat_id);
        flow.message_id = message_id;

        let mut machines: Vec<String> = self
            .registry
            .available()
            .await
            .map(|list| list.into_iter().map(|m| m.machine_id).collect())
            .unwrap_or_default();
        if machines.is_empty() {
            machines = self.shell.target_ids();
        }
        machines.sort();

        flow.listings = machines.clone();
        self.edit_wizard(&flow, "Machine:", machine_keyboard(kind, &machines)).await;
        self.flows.put(chat_id, user_id, flow);
    }

    /// Public entry for starting a wizard (wired to whatever UI command
    /// layer sits above the core).
    pub async fn start_flow(&self, kind: FlowKind, chat_id: i64, user_id: i64) {
        self.restart_flow(kind, chat_id, user_id, None).await;
    }

    async fn show_repo_listing(&self, flow: &mut Flow) {
        let machine = flow.machine.clone().unwrap_or_default();
        let mut repos = self.list_dirs(&machine, &settings().repos_base_path).await;
        if repos.is_empty() {
            // Fall back to the known-projects registry
            repos = settings().projects.keys().cloned().collect();
            repos.sort();
        }
        flow.step = FlowStep::SelectRepo;
        flow.listings = repos.clone();
        self.edit_wizard(
            flow,
            "Repository:",
            listing_keyboard(flow.kind, "repo", &repos, false),
        )
        .await;
    }

    async fn show_subfolder_listing(&self, flow: &mut Flow) {
        let machine = flow.machine.clone().unwrap_or_default();
        let path = flow.path.clone().unwrap_or_default();
        let dirs = self.list_dirs(&machine, &path).await;
        flow.step = FlowStep::SelectSubfolder;
        flow.listings = dirs.clone();
        self.edit_wizard(
            flow,
            &format!("Directory: `{}`", path),
            listing_keyboard(flow.kind, "sub", &dirs, true),
        )
        .await;
    }

    async fn list_dirs(&self, machine: &str, path: &str) -> Vec<String> {
        let cmd = format!(
            "cd {} 2>/dev/null && ls -1d */ 2>/dev/null",
            escape(Cow::Borrowed(path))
        );
        match self.shell.exec(machine, &cmd).await {
            Ok(out) if out.success => out
                .stdout
                .lines()
                .map(|l| l.trim().trim_end_matches('/').to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn edit_wizard(&self, flow: &Flow, text: &str, keyboard: chat_client::InlineKeyboard) {
        match flow.message_id {
            Some(message_id) => {
                if let Err(e) = self
                    .transport
                    .edit(flow.chat_id, message_id, text, Some(&keyboard))
                    .await
                {
                    tracing::warn!(error = %e, "Failed to edit wizard message");
                }
            }
            None => {
                let _ = self
                    .transport
                    .send(flow.chat_id, None, text, Some(&keyboard))
                    .await;
            }
        }
    }

    async fn edit_wizard_plain(&self, flow: &Flow, text: &str) {
        match flow.message_id {
            Some(message_id) => {
                let _ = self.transport.edit(flow.chat_id, message_id, text, None).await;
            }
            None => {
                let _ = self.transport.send(flow.chat_id, None, text, None).await;
            }
        }
    }

    /// Final session-flow step: create a topic and run the engine there.
    async fn spawn_interactive_session(&self, flow: Flow) {
        let Some(machine) = flow.machine.clone() else {
            return;
        };
        let project = flow.project.clone().unwrap_or_else(|| "adhoc".to_string());
        let workdir = flow
            .path
            .clone()
            .unwrap_or_else(|| settings().repos_base_path.clone());

        let title = format!("session · {}", project);
        let thread_id = match self.facade.create_topic(&title, None).await {
            Ok(t) => t,
            Err(e) => {
                let _ = self
                    .transport
                    .send(flow.chat_id, None, &format!("Could not open a topic: {}", e), None)
                    .await;
                return;
            }
        };

        let request = SessionRequest {
            session_id: Uuid::new_v4().to_string(),
            machine,
            workdir,
            prompt: String::new(),
            prompt_path: None,
            thread_id,
            mode: flow.mode.unwrap_or(SessionMode::StreamJson),
            project,
            task_id: None,
            preferred_engine: flow.engine,
            timeout: Duration::from_secs(settings().session_timeout_secs),
        };

        let supervisor = Arc::clone(&self.supervisor);
        tokio::spawn(async move {
            if let Err(e) = supervisor.run(request).await {
                tracing::warn!(error = %e, "Interactive session ended with error");
            }
        });
    }

    // -- directory browsing --

    async fn handle_browse(&self, value: &str, cb: &CallbackQuery) {
        let chat_id = cb.message.as_ref().map(|m| m.chat.id).unwrap_or_default();
        let user_id = cb.from.id;
        let thread_id = cb.message.as_ref().and_then(|m| m.message_thread_id);
        let message_id = cb.message.as_ref().map(|m| m.message_id);
        self.browse.retain(|_, s| s.touched.elapsed() <= BROWSE_TTL);

        match value {
            "start" => {
                self.start_browse(chat_id, user_id, thread_id, message_id, None)
                    .await;
            }
            "back" => {
                let Some(mut session) = self.browse.get(&(chat_id, user_id)).map(|s| s.clone())
                else {
                    return;
                };
                if session.path == settings().repos_base_path {
                    // Refuse at root
                    return;
                }
                if let Some((parent, _)) = session.path.rsplit_once('/') {
                    session.path = parent.to_string();
                }
                session.touched = Instant::now();
                self.refresh_browse(chat_id, &mut session).await;
                self.browse.insert((chat_id, user_id), session);
            }
            "here" => {
                let Some((_, session)) = self.browse.remove(&(chat_id, user_id)) else {
                    return;
                };
                if let Some(tid) = session.thread_id {
                    self.state.suppression.clear_browsing(tid);
                }
                if session.prompt.is_some() {
                    // A prompt was supplied up front: pick engine and mode
                    let mut flow = Flow::new(FlowKind::Session, chat_id);
                    flow.machine = Some(session.machine.clone());
                    flow.path = Some(session.path.clone());
                    flow.project = session.path.rsplit('/').next().map(|s| s.to_string());
                    flow.step = FlowStep::SelectStartMode;
                    flow.message_id = session.message_id;
                    self.edit_wizard(&flow, "Engine and mode:", start_mode_keyboard(FlowKind::Session))
                        .await;
                    self.flows.put(chat_id, user_id, flow);
                } else if let Some(message_id) = session.message_id {
                    let _ = self
                        .transport
                        .edit(chat_id, message_id, &format!("Path: `{}`", session.path), None)
                        .await;
                }
            }
            idx => {
                let Some(mut session) = self.browse.get(&(chat_id, user_id)).map(|s| s.clone())
                else {
                    return;
                };
                let Some(dir) = idx
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| session.listings.get(i).cloned())
                else {
                    return;
                };
                session.path = format!("{}/{}", session.path, dir);
                session.touched = Instant::now();
                self.refresh_browse(chat_id, &mut session).await;
                self.browse.insert((chat_id, user_id), session);
            }
        }
    }

    /// Begin a directory-browse at the repos base. When `prompt` is set,
    /// finalizing with "use this directory" offers the engine picker and
    /// starts a session with that prompt.
    pub async fn start_browse(
        &self,
        chat_id: i64,
        user_id: i64,
        thread_id: Option<i64>,
        message_id: Option<i64>,
        prompt: Option<String>,
    ) {
        let machine = match self.registry.available().await {
            Ok(list) if !list.is_empty() => list[0].machine_id.clone(),
            _ => match self.shell.target_ids().first().cloned() {
                Some(m) => m,
                None => return,
            },
        };
        let mut session = BrowseSession {
            machine,
            path: settings().repos_base_path.clone(),
            message_id,
            thread_id,
            listings: Vec::new(),
            prompt,
            touched: Instant::now(),
        };
        if let Some(tid) = thread_id {
            self.state.suppression.mark_browsing(tid);
        }
        self.refresh_browse(chat_id, &mut session).await;
        self.browse.insert((chat_id, user_id), session);
    }

    async fn refresh_browse(&self, chat_id: i64, session: &mut BrowseSession) {
        let dirs = self.list_dirs(&session.machine, &session.path).await;
        session.listings = dirs.clone();

        let mut kb = chat_client::InlineKeyboard::new();
        for (idx, dir) in dirs.iter().enumerate() {
            if let Some(data) = (CallbackData::Browse {
                value: idx.to_string(),
            })
            .encode()
            {
                kb = kb.row(vec![chat_client::InlineKeyboard::button(dir.clone(), data)]);
            }
        }
        let mut controls = Vec::new();
        for (label, value) in [("Use this directory", "here"), ("Back", "back")] {
            if let Some(data) = (CallbackData::Browse {
                value: value.to_string(),
            })
            .encode()
            {
                controls.push(chat_client::InlineKeyboard::button(label, data));
            }
        }
        kb = kb.row(controls);

        let text = format!("Browsing `{}` on {}", session.path, session.machine);
        match session.message_id {
            Some(message_id) => {
                let _ = self
                    .transport
                    .edit(chat_id, message_id, &text, Some(&kb))
                    .await;
            }
            None => {
                if let Ok(mid) = self
                    .transport
                    .send(chat_id, session.thread_id, &text, Some(&kb))
                    .await
                {
                    session.message_id = Some(mid);
                }
            }
        }
    }

    // -- message routing --

    /// Route an incoming chat message: thread messages feed live sessions
    /// and task inboxes; top-level messages complete wizard steps.
    pub async fn handle_message(&self, msg: IncomingMessage) {
        let Some(text) = msg.text.clone() else {
            return;
        };
        let chat_id = msg.chat.id;
        let user_id = msg.from.as_ref().map(|u| u.id).unwrap_or_default();

        if let Some(thread_id) = msg.message_thread_id {
            self.route_thread_message(thread_id, text).await;
            return;
        }

        // Minimal triggers; the full command layer sits above the core
        match text.trim() {
            "/task" => return self.start_flow(FlowKind::Task, chat_id, user_id).await,
            "/session" => return self.start_flow(FlowKind::Session, chat_id, user_id).await,
            "/browse" => {
                return self.start_browse(chat_id, user_id, None, None, None).await;
            }
            _ => {}
        }

        self.flows.prune_expired();
        let Some(mut flow) = self.flows.get(chat_id, user_id) else {
            return;
        };

        match flow.step {
            FlowStep::AwaitProjectName => {
                let name = text.trim().to_string();
                if name.is_empty() {
                    return;
                }
                flow.project = Some(name);
                flow.step = FlowStep::SelectStartMode;
                self.edit_wizard(&flow, "Engine and mode:", start_mode_keyboard(flow.kind)).await;
                self.flows.put(chat_id, user_id, flow);
            }
            FlowStep::AwaitDescription => {
                if text.trim().is_empty() {
                    return;
                }
                self.flows.take(chat_id, user_id);
                let new = NewTask {
                    description: text.trim().to_string(),
                    project: flow.project.clone().unwrap_or_else(|| "adhoc".to_string()),
                    assigned_machine: flow.machine.clone(),
                    engine_hint: flow.engine.map(|e| e.as_str().to_string()),
                    ..Default::default()
                };
                match self.db.create_task(&new).await {
                    Ok(task) => {
                        let _ = self
                            .transport
                            .send(
                                chat_id,
                                None,
                                &format!(
                                    "Task {} queued on {}",
                                    task.short_id(),
                                    new.assigned_machine.as_deref().unwrap_or("any machine")
                                ),
                                None,
                            )
                            .await;
                    }
                    Err(e) => {
                        let _ = self
                            .transport
                            .send(chat_id, None, &format!("Could not create task: {}", e), None)
                            .await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn route_thread_message(&self, thread_id: i64, text: String) {
        if let Some(session) = self.state.session_by_thread(thread_id) {
            if text.trim() == "/cancel"
                && let Some(task_id) = &session.task_id
            {
                if let Some(executor) = &self.executor {
                    executor.cancel_task(task_id).await;
                }
                return;
            }

            match session.handle.clone() {
                Some(handle) => {
                    // Engine is live: inject directly
                    crate::state::transcript_push(&session.transcript, "user_input", &text);
                    if let Err(e) = handle.write(wrap_user_input(&text).as_bytes()).await {
                        tracing::warn!(thread_id, error = %e, "Failed to forward thread message");
                        self.state.push_inbox(thread_id, text);
                    }
                }
                None => {
                    // Between turns: queue for the waiting-input poll
                    self.state.push_inbox(thread_id, text);
                }
            }
            return;
        }

        // No live session: task threads (no-repo prompt, replies after a
        // crash) still collect input
        if let Ok(Some(topic)) = self.db.get_topic(thread_id).await
            && topic.status == "active"
        {
            self.state.push_inbox(thread_id, text);
        }
    }
}
