//! Typed failure contract between job handlers and the queue.
//!
//! Handlers report failures as a [`JobError`] carrying an explicit [`ErrorKind`].
//! Errors that arrive without a kind (panics, legacy handlers that only have a
//! message string) are `Unclassified`; for those the queue falls back to
//! inspecting the message text via [`ErrorKind::infer`].

use serde::{Deserialize, Serialize};

/// Coarse failure class used for retry and quarantine decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, timeouts, resets. Usually worth retrying.
    Network,
    /// The backing database rejected or lost the operation.
    Database,
    /// Something an operator must look at right away.
    Critical,
    /// Input failed validation. Retrying cannot help.
    Validation,
    /// A business rule rejected the input.
    Business,
    Authentication,
    Authorization,
    NotFound,
    /// No kind was given.
    Unclassified,
}

/// Substrings that identify a transient infrastructure failure in an untyped message.
const TRANSIENT_MARKERS: &[&str] = &[
    "econnrefused",
    "connection refused",
    "etimedout",
    "timeout",
    "timed out",
    "econnreset",
    "connection reset",
    "socket hang up",
    "ehostunreach",
];

/// Kinds with a canonical code, in the order embedded class names are looked up.
const NAMED_KINDS: [ErrorKind; 8] = [
    ErrorKind::Validation,
    ErrorKind::Business,
    ErrorKind::Authentication,
    ErrorKind::Authorization,
    ErrorKind::NotFound,
    ErrorKind::Critical,
    ErrorKind::Database,
    ErrorKind::Network,
];

impl ErrorKind {
    /// Canonical error code for the kind, as used in retry allow/deny lists.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            ErrorKind::Network => Some("NetworkError"),
            ErrorKind::Database => Some("DatabaseError"),
            ErrorKind::Critical => Some("CriticalError"),
            ErrorKind::Validation => Some("ValidationError"),
            ErrorKind::Business => Some("BusinessError"),
            ErrorKind::Authentication => Some("AuthenticationError"),
            ErrorKind::Authorization => Some("AuthorizationError"),
            ErrorKind::NotFound => Some("NotFoundError"),
            ErrorKind::Unclassified => None,
        }
    }

    /// The kind whose canonical code is `code`.
    pub fn from_code(code: &str) -> Option<ErrorKind> {
        NAMED_KINDS.iter().copied().find(|k| k.code() == Some(code))
    }

    /// Best-effort kind for an untyped error message.
    ///
    /// A class name in the message (`ValidationError: ...`) decides first,
    /// a leading one over an embedded one. Keyword heuristics only apply to
    /// messages that name no class.
    pub fn infer(message: &str) -> ErrorKind {
        if let Some((prefix, _)) = message.split_once(':')
            && let Some(kind) = Self::from_code(prefix.trim())
        {
            return kind;
        }
        if let Some(kind) = NAMED_KINDS
            .iter()
            .copied()
            .find(|k| k.code().is_some_and(|c| message.contains(c)))
        {
            return kind;
        }

        let lower = message.to_ascii_lowercase();
        if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
            return ErrorKind::Network;
        }
        if lower.contains("critical") {
            return ErrorKind::Critical;
        }
        if lower.contains("database") {
            return ErrorKind::Database;
        }
        if lower.contains("validation") {
            return ErrorKind::Validation;
        }
        if lower.contains("business") {
            return ErrorKind::Business;
        }
        ErrorKind::Unclassified
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code().unwrap_or("Error"))
    }
}

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    /// Explicit code; overrides the kind's canonical code when set.
    pub code: Option<String>,
    pub message: String,
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            stack: None,
        }
    }

    /// An error with no kind attached; classified from its message text.
    pub fn untyped(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unclassified, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Database, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Critical, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Explicit code, else the kind's canonical code.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref().or_else(|| self.kind.code())
    }

    /// The declared kind, or the kind inferred from the message for untyped errors.
    pub fn effective_kind(&self) -> ErrorKind {
        match self.kind {
            ErrorKind::Unclassified => ErrorKind::infer(&self.message),
            kind => kind,
        }
    }

    /// Whether this error carries `code`: as its explicit code, as the
    /// canonical code of its (effective) kind, or inside its message.
    pub fn matches_code(&self, code: &str) -> bool {
        self.code() == Some(code) || self.effective_kind().code() == Some(code) || self.message.contains(code)
    }

    /// Label used to group errors in reports.
    ///
    /// Falls back to a leading `SomethingError:` prefix of the message, then to
    /// the inferred kind.
    pub fn error_class(&self) -> String {
        if let Some(code) = self.code() {
            return code.to_string();
        }
        if let Some((prefix, _)) = self.message.split_once(':') {
            let prefix = prefix.trim();
            if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return prefix.to_string();
            }
        }
        ErrorKind::infer(&self.message).to_string()
    }
}

impl core::fmt::Display for JobError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.code() {
            Some(code) if !self.message.starts_with(code) => write!(f, "{}: {}", code, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for JobError {}

impl From<String> for JobError {
    fn from(message: String) -> Self {
        Self::untyped(message)
    }
}

impl From<&str> for JobError {
    fn from(message: &str) -> Self {
        Self::untyped(message)
    }
}
