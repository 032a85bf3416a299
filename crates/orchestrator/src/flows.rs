use chat_client::InlineKeyboard;
use common::CallbackData;
use dashmap::DashMap;
use std::time::Instant;

use crate::engine::Engine;
use crate::state::{SessionMode, FLOW_TTL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Task,
    Session,
}

impl FlowKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            FlowKind::Task => "tf",
            FlowKind::Session => "sf",
        }
    }

    pub fn callback(&self, key: &str, value: &str) -> CallbackData {
        match self {
            FlowKind::Task => CallbackData::TaskFlow {
                key: key.to_string(),
                value: value.to_string(),
            },
            FlowKind::Session => CallbackData::SessionFlow {
                key: key.to_string(),
                value: value.to_string(),
            },
        }
    }
}

/// Wizard steps: machine → repo mode (task only) → repo → optional
/// subfolder → start mode → description (task) or spawn (session).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStep {
    SelectMachine,
    SelectRepoMode,
    SelectRepo,
    SelectSubfolder,
    SelectStartMode,
    AwaitProjectName,
    AwaitDescription,
}

/// Short-lived per-user wizard state.
#[derive(Debug, Clone)]
pub struct Flow {
    pub kind: FlowKind,
    pub step: FlowStep,
    pub chat_id: i64,
    pub message_id: Option<i64>,
    pub machine: Option<String>,
    pub path: Option<String>,
    pub project: Option<String>,
    pub engine: Option<Engine>,
    pub mode: Option<SessionMode>,
    /// Cached listing the numeric callback indexes point into.
    pub listings: Vec<String>,
    pub touched: Instant,
}

impl Flow {
    pub fn new(kind: FlowKind, chat_id: i64) -> Self {
        Self {
            kind,
            step: FlowStep::SelectMachine,
            chat_id,
            message_id: None,
            machine: None,
            path: None,
            project: None,
            engine: None,
            mode: None,
            listings: Vec::new(),
            touched: Instant::now(),
        }
    }
}

/// All live wizard flows keyed by (chat, user), TTL'd at ten minutes.
#[derive(Default)]
pub struct ConversationFlows {
    flows: DashMap<(i64, i64), Flow>,
}

impl ConversationFlows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, chat_id: i64, user_id: i64, kind: FlowKind) {
        self.flows.insert((chat_id, user_id), Flow::new(kind, chat_id));
    }

    pub fn get(&self, chat_id: i64, user_id: i64) -> Option<Flow> {
        let entry = self.flows.get(&(chat_id, user_id))?;
        if entry.touched.elapsed() > FLOW_TTL {
            drop(entry);
            self.flows.remove(&(chat_id, user_id));
            return None;
        }
        Some(entry.clone())
    }

    pub fn put(&self, chat_id: i64, user_id: i64, mut flow: Flow) {
        flow.touched = Instant::now();
        self.flows.insert((chat_id, user_id), flow);
    }

    pub fn take(&self, chat_id: i64, user_id: i64) -> Option<Flow> {
        self.flows.remove(&(chat_id, user_id)).map(|(_, f)| f)
    }

    pub fn prune_expired(&self) {
        self.flows.retain(|_, flow| flow.touched.elapsed() <= FLOW_TTL);
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

// -- keyboard builders (pure; the router supplies the data) --

/// Numbered machine list, alphabetic, one per row.
pub fn machine_keyboard(kind: FlowKind, machines: &[String]) -> InlineKeyboard {
    let mut kb = InlineKeyboard::new();
    for (idx, machine) in machines.iter().enumerate() {
        if let Some(data) = kind.callback("machine", &idx.to_string()).encode() {
            kb = kb.row(vec![InlineKeyboard::button(machine.clone(), data)]);
        }
    }
    kb
}

pub fn repo_mode_keyboard(kind: FlowKind) -> InlineKeyboard {
    let mut kb = InlineKeyboard::new();
    let mut row = Vec::new();
    for (label, value) in [("Existing repo", "existing"), ("New repo", "new")] {
        if let Some(data) = kind.callback("repomode", value).encode() {
            row.push(InlineKeyboard::button(label, data));
        }
    }
    kb = kb.row(row);
    kb
}

/// Numbered directory listing plus `here`/`back` controls.
pub fn listing_keyboard(kind: FlowKind, key: &str, items: &[String], with_here: bool) -> InlineKeyboard {
    let mut kb = InlineKeyboard::new();
    for (idx, item) in items.iter().enumerate() {
        if let Some(data) = kind.callback(key, &idx.to_string()).encode() {
            kb = kb.row(vec![InlineKeyboard::button(item.clone(), data)]);
        }
    }
    let mut controls = Vec::new();
    if with_here
        && let Some(data) = kind.callback(key, "here").encode()
    {
        controls.push(InlineKeyboard::button("Use this directory", data));
    }
    if let Some(data) = kind.callback(key, "back").encode() {
        controls.push(InlineKeyboard::button("Back", data));
    }
    if !controls.is_empty() {
        kb = kb.row(controls);
    }
    kb
}

/// The 6-button engine × mode picker; values like `i.stream`, `c.tui`.
pub fn start_mode_keyboard(kind: FlowKind) -> InlineKeyboard {
    let mut kb = InlineKeyboard::new();
    for engine in [Engine::Claude, Engine::Codex, Engine::Gemini] {
        let mut row = Vec::new();
        for (mode_label, mode_value) in [("stream", "stream"), ("tui", "tui")] {
            let value = format!("{}.{}", engine.short(), mode_value);
            if let Some(data) = kind.callback("start", &value).encode() {
                row.push(InlineKeyboard::button(
                    format!("{} · {}", engine.as_str(), mode_label),
                    data,
                ));
            }
        }
        kb = kb.row(row);
    }
    kb
}

/// Parse a start-mode value (`<engine-short>.<mode>`).
pub fn parse_start_mode(value: &str) -> Option<(Engine, SessionMode)> {
    let (engine_part, mode_part) = value.split_once('.')?;
    let engine = Engine::from_short(engine_part.chars().next()?)?;
    let mode = match mode_part {
        "stream" | "sj" => SessionMode::StreamJson,
        "tui" => SessionMode::Tui,
        _ => return None,
    };
    Some((engine, mode))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_kind_prefixes() {
        assert_eq!(FlowKind::Task.prefix(), "tf");
        assert_eq!(FlowKind::Session.prefix(), "sf");
        assert!(matches!(
            FlowKind::Task.callback("machine", "0"),
            CallbackData::TaskFlow { .. }
        ));
    }

    #[test]
    fn flows_expire() {
        let flows = ConversationFlows::new();
        flows.start(-1, 42, FlowKind::Task);
        assert!(flows.get(-1, 42).is_some());

        // Force-expire by backdating
        if let Some(mut entry) = flows.flows.get_mut(&(-1, 42)) {
            entry.touched = Instant::now() - FLOW_TTL - std::time::Duration::from_secs(1);
        }
        assert!(flows.get(-1, 42).is_none());
        assert!(flows.is_empty());
    }

    #[test]
    fn put_refreshes_ttl() {
        let flows = ConversationFlows::new();
        flows.start(-1, 42, FlowKind::Session);
        let mut flow = flows.get(-1, 42).unwrap();
        flow.step = FlowStep::SelectRepo;
        flows.put(-1, 42, flow);
        assert_eq!(flows.get(-1, 42).unwrap().step, FlowStep::SelectRepo);
    }

    #[test]
    fn machine_keyboard_is_indexed() {
        let kb = machine_keyboard(FlowKind::Task, &["alpha".into(), "beta".into()]);
        assert_eq!(kb.inline_keyboard.len(), 2);
        assert_eq!(kb.inline_keyboard[0][0].callback_data, "tf:machine:0");
        assert_eq!(kb.inline_keyboard[1][0].text, "beta");
    }

    #[test]
    fn listing_keyboard_controls() {
        let kb = listing_keyboard(FlowKind::Session, "sub", &["api".into()], true);
        let controls = kb.inline_keyboard.last().unwrap();
        assert_eq!(controls[0].callback_data, "sf:sub:here");
        assert_eq!(controls[1].callback_data, "sf:sub:back");
    }

    #[test]
    fn start_mode_values_fit_callback_budget() {
        let kb = start_mode_keyboard(FlowKind::Session);
        assert_eq!(kb.inline_keyboard.len(), 3);
        for row in &kb.inline_keyboard {
            for button in row {
                assert!(button.callback_data.len() <= common::callback::MAX_CALLBACK_BYTES);
            }
        }
        assert_eq!(kb.inline_keyboard[0][0].callback_data, "sf:start:i.stream");
        assert_eq!(kb.inline_keyboard[2][1].callback_data, "sf:start:g.tui");
    }

    #[test]
    fn parse_start_mode_values() {
        assert_eq!(
            parse_start_mode("i.stream"),
            Some((Engine::Claude, SessionMode::StreamJson))
        );
        assert_eq!(parse_start_mode("g.tui"), Some((Engine::Gemini, SessionMode::Tui)));
        assert_eq!(parse_start_mode("x.stream"), None);
        assert_eq!(parse_start_mode("istream"), None);
    }
}
