use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    #[default]
    Print,
    Warning,
    Error,
    ScriptError,
    SessionStart,
    SessionStop,
    Breakpoint,
    Info,
    Debug,
}

impl EntryKind {
    pub const ALL: [EntryKind; 9] = [
        EntryKind::Print,
        EntryKind::Warning,
        EntryKind::Error,
        EntryKind::ScriptError,
        EntryKind::SessionStart,
        EntryKind::SessionStop,
        EntryKind::Breakpoint,
        EntryKind::Info,
        EntryKind::Debug,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Print => "print",
            EntryKind::Warning => "warning",
            EntryKind::Error => "error",
            EntryKind::ScriptError => "script_error",
            EntryKind::SessionStart => "session_start",
            EntryKind::SessionStop => "session_stop",
            EntryKind::Breakpoint => "breakpoint",
            EntryKind::Info => "info",
            EntryKind::Debug => "debug",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EntryKind::Error | EntryKind::ScriptError)
    }

    pub fn is_output(&self) -> bool {
        matches!(
            self,
            EntryKind::Print | EntryKind::Warning | EntryKind::Error | EntryKind::ScriptError
        )
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "print" | "log" | "output" | "stdout" => Ok(EntryKind::Print),
            "warning" | "warn" | "push_warning" => Ok(EntryKind::Warning),
            "error" | "err" | "push_error" | "stderr" => Ok(EntryKind::Error),
            "script_error" | "script" => Ok(EntryKind::ScriptError),
            "session_start" | "session_started" => Ok(EntryKind::SessionStart),
            "session_stop" | "session_stopped" => Ok(EntryKind::SessionStop),
            "breakpoint" => Ok(EntryKind::Breakpoint),
            "info" => Ok(EntryKind::Info),
            "debug" | "trace" => Ok(EntryKind::Debug),
            other => Err(format!("unknown entry kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntrySource {
    #[default]
    Host,
    ControlledProcess,
}

/// An entry before the bus assigns its id and timestamp.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewEntry {
    pub kind: EntryKind,
    pub message: String,
    pub source: EntrySource,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub stack_trace: Option<String>,
    pub session_id: Option<u64>,
    pub topic: Option<String>,
    pub raw_payload: Option<Value>,
}

impl NewEntry {
    pub fn new(kind: EntryKind, source: EntrySource, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source,
            ..Self::default()
        }
    }

    pub fn host(kind: EntryKind, message: impl Into<String>) -> Self {
        Self::new(kind, EntrySource::Host, message)
    }

    pub fn game(kind: EntryKind, message: impl Into<String>) -> Self {
        Self::new(kind, EntrySource::ControlledProcess, message)
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        if !payload.is_null() {
            self.raw_payload = Some(payload);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEntry {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub message: String,
    pub source: EntrySource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<Value>,
}

impl CapturedEntry {
    pub fn stamp(id: u64, timestamp: DateTime<Utc>, entry: NewEntry) -> Self {
        Self {
            id,
            timestamp,
            kind: entry.kind,
            message: entry.message,
            source: entry.source,
            file: entry.file,
            line: entry.line,
            function: entry.function,
            stack_trace: entry.stack_trace,
            session_id: entry.session_id,
            topic: entry.topic,
            raw_payload: entry.raw_payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindFilter {
    #[default]
    All,
    Errors,
    Warnings,
    Output,
    Only(EntryKind),
}

impl KindFilter {
    pub fn matches(&self, kind: EntryKind) -> bool {
        match self {
            KindFilter::All => true,
            KindFilter::Errors => kind.is_error(),
            KindFilter::Warnings => kind == EntryKind::Warning,
            KindFilter::Output => kind.is_output(),
            KindFilter::Only(expected) => kind == *expected,
        }
    }
}

impl FromStr for KindFilter {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "" | "all" => Ok(KindFilter::All),
            "error" | "errors" => Ok(KindFilter::Errors),
            "warning" | "warnings" => Ok(KindFilter::Warnings),
            "output" => Ok(KindFilter::Output),
            other => other.parse::<EntryKind>().map(KindFilter::Only),
        }
    }
}
