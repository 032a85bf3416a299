use std::fmt;

/// Categories of failure the control plane reacts to. The kind, not the
/// message, decides what happens next: `Retriable` and `AuthFailed` drive
/// engine fallback, `NoRepo` triggers the repo-creation prompt, `Timeout`
/// is terminal without retry, `Fatal` fails the task outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoRepo,
    AuthFailed,
    Retriable,
    Timeout,
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NoRepo => "no_repo",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::Retriable => "retriable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Explicit error carried between the executor, supervisor, and workspace
/// layers. Never unwinds through a poll loop; callers match on `kind`.
#[derive(Debug, Clone)]
pub struct OrcError {
    kind: ErrorKind,
    message: String,
}

impl OrcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retriable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn no_repo(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoRepo, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether a different engine is allowed to retry this failure.
    pub fn retriable(&self) -> bool {
        matches!(self.kind, ErrorKind::Retriable | ErrorKind::AuthFailed)
    }
}

impl fmt::Display for OrcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for OrcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_kinds() {
        assert!(OrcError::retriable("rate limited").retriable());
        assert!(OrcError::auth("token expired").retriable());
        assert!(!OrcError::timeout("wall clock").retriable());
        assert!(!OrcError::fatal("clone failed").retriable());
        assert!(!OrcError::no_repo("unknown project").retriable());
    }

    #[test]
    fn display_carries_kind_and_message() {
        let e = OrcError::no_repo("project foo has no repository");
        assert_eq!(e.to_string(), "no_repo: project foo has no repository");
    }
}
