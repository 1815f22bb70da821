//! Terminal results of contexts and captured remote failures.
//!
//! A [`Failure`] is the serializable snapshot of an error raised on the far side
//! of a channel: its type identity as a string (the type may not exist on the
//! receiving side), message, optional code, source location, a flattened trace and
//! the chain of causes. It never holds live references.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};

use crate::context::ContextError;

/// Kind recorded for failures produced from a panic payload.
pub const PANIC_KIND: &str = "panic";

/// One frame of a flattened stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

/// Error captured in one context and reconstructed in another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<TraceFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<Failure>>,
}

impl Failure {
    /// Capture a failure at the caller's location.
    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            kind: kind.into(),
            message: message.into(),
            code: None,
            file: Some(location.file().to_string()),
            line: Some(location.line()),
            trace: capture_trace(),
            previous: None,
        }
    }

    /// Capture an error value together with its `source()` chain.
    #[track_caller]
    pub fn from_error<E: StdError + 'static>(err: &E) -> Self {
        if let Some(failure) = (err as &dyn Any).downcast_ref::<Failure>() {
            return failure.clone();
        }
        let mut failure = Self::new(std::any::type_name::<E>(), err.to_string());
        failure.previous = err.source().map(|s| Box::new(Self::from_source(s)));
        failure
    }

    /// Capture a panic payload as returned by `catch_unwind` or a `JoinError`.
    #[track_caller]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self::new(PANIC_KIND, message)
    }

    fn from_source(err: &(dyn StdError + 'static)) -> Self {
        if let Some(failure) = err.downcast_ref::<Failure>() {
            return failure.clone();
        }
        Self {
            kind: "std::error::Error".to_string(),
            message: err.to_string(),
            code: None,
            file: None,
            line: None,
            trace: Vec::new(),
            previous: err.source().map(|s| Box::new(Self::from_source(s))),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_previous(mut self, previous: Failure) -> Self {
        self.previous = Some(Box::new(previous));
        self
    }

    pub fn is_panic(&self) -> bool {
        self.kind == PANIC_KIND
    }

    /// Iterate this failure and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &Failure> {
        std::iter::successors(Some(self), |f| f.previous.as_deref())
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code {code})")?;
        }
        if let (Some(file), Some(line)) = (&self.file, self.line) {
            write!(f, " at {file}:{line}")?;
        }
        Ok(())
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.previous
            .as_deref()
            .map(|p| p as &(dyn StdError + 'static))
    }
}

/// Terminal result sent by a context just before it ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExitResult {
    Success { value: serde_json::Value },
    Failure { failure: Failure },
}

impl ExitResult {
    pub fn success(value: serde_json::Value) -> Self {
        Self::Success { value }
    }

    pub fn failure(failure: Failure) -> Self {
        Self::Failure { failure }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The returned value, or the captured failure as a [`ContextError::Failed`].
    pub fn get_result(self) -> Result<serde_json::Value, ContextError> {
        match self {
            Self::Success { value } => Ok(value),
            Self::Failure { failure } => Err(ContextError::Failed(Box::new(failure))),
        }
    }
}

fn capture_trace() -> Vec<TraceFrame> {
    let backtrace = Backtrace::capture();
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    parse_backtrace(&backtrace.to_string())
}

/// Flatten std's backtrace rendering:
///
/// ```text
///    0: crate::module::function
///              at ./src/module.rs:10:5
/// ```
fn parse_backtrace(rendered: &str) -> Vec<TraceFrame> {
    let mut frames: Vec<TraceFrame> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut() {
                let mut parts = location.rsplitn(3, ':');
                let _column = parts.next();
                let line_no = parts.next().and_then(|l| l.parse().ok());
                match parts.next() {
                    Some(file) => {
                        frame.file = Some(file.to_string());
                        frame.line = line_no;
                    }
                    None => frame.file = Some(location.to_string()),
                }
            }
        } else if let Some((index, function)) = trimmed.split_once(": ")
            && index.chars().all(|c| c.is_ascii_digit())
        {
            frames.push(TraceFrame {
                function: function.to_string(),
                file: None,
                line: None,
            });
        }
    }
    frames
}
