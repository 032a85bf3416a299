use common::{ErrorKind, OrcError};

/// A coding-agent CLI family. Each machine carries an ordered priority
/// list; retriable failures walk down it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Claude,
    Codex,
    Gemini,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Claude => "claude",
            Engine::Codex => "codex",
            Engine::Gemini => "gemini",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "itachi" => Some(Engine::Claude),
            "codex" | "itachic" => Some(Engine::Codex),
            "gemini" | "itachig" => Some(Engine::Gemini),
            _ => None,
        }
    }

    /// The wrapper binary installed on worker machines.
    pub fn command(&self) -> &'static str {
        match self {
            Engine::Claude => "itachi",
            Engine::Codex => "itachic",
            Engine::Gemini => "itachig",
        }
    }

    /// One-letter code used in callback payloads (64-byte budget).
    pub fn short(&self) -> char {
        match self {
            Engine::Claude => 'i',
            Engine::Codex => 'c',
            Engine::Gemini => 'g',
        }
    }

    pub fn from_short(c: char) -> Option<Self> {
        match c {
            'i' => Some(Engine::Claude),
            'c' => Some(Engine::Codex),
            'g' => Some(Engine::Gemini),
            _ => None,
        }
    }

    /// Whether the CLI can resume the previous conversation in the same
    /// working directory.
    pub fn supports_continue(&self) -> bool {
        matches!(self, Engine::Claude)
    }

    /// Invocation for structured streaming with stdin held open.
    pub fn stream_json_invocation(&self, resume: bool) -> String {
        let cont = if resume { " --continue" } else { "" };
        format!(
            "{}{} --ds -p --verbose --output-format stream-json --input-format stream-json",
            self.command(),
            cont
        )
    }

    /// Plain interactive invocation (PTY, scrubbed output).
    pub fn tui_invocation(&self) -> String {
        self.command().to_string()
    }

    /// One-shot batch invocation used by the task executor; the prompt is
    /// piped in on stdin.
    pub fn batch_invocation(&self) -> String {
        format!("{} --ds --dp", self.command())
    }

    /// Shell probe that exits 0 when the CLI is installed and has a
    /// credential or active subscription.
    pub fn auth_probe(&self) -> String {
        let (cred_file, api_key_var) = match self {
            Engine::Claude => ("$HOME/.claude/.credentials.json", "ANTHROPIC_API_KEY"),
            Engine::Codex => ("$HOME/.codex/auth.json", "OPENAI_API_KEY"),
            Engine::Gemini => ("$HOME/.gemini/oauth_creds.json", "GEMINI_API_KEY"),
        };
        format!(
            "command -v {} >/dev/null 2>&1 && {{ test -s \"{}\" || test -n \"${}\"; }}",
            self.command(),
            cred_file,
            api_key_var
        )
    }
}

/// Substrings that mark a failed run as worth retrying on another engine.
/// Matched case-insensitively against the combined stdout+stderr tail.
const RETRIABLE_MARKERS: &[&str] = &[
    "oauth token has expired",
    "authentication_error",
    "rate_limit",
    "429",
    "billing",
    "insufficient_quota",
    "quota exceeded",
    "invalid api key",
    "unauthorized",
    "overloaded",
];

/// Classify a finished engine run. `None` means the run is not an engine
/// failure (exit 0, or a failure the engine is not responsible for).
pub fn classify_failure(combined_output: &str, exit_code: i32) -> Option<OrcError> {
    if exit_code == 0 {
        return None;
    }
    let lower = combined_output.to_ascii_lowercase();
    for marker in RETRIABLE_MARKERS {
        if lower.contains(marker) {
            return Some(OrcError::new(
                ErrorKind::Retriable,
                format!("engine failure ({})", marker),
            ));
        }
    }
    None
}
