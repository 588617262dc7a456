use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 256 * 1024;
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub type Params = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    InvalidCommand,
    MissingCommand,
    UnknownCommand,
    InvalidParams,
    FrameTooLarge,
    MissingParam,
    InvalidParam,
    NotRunning,
    SendFailed,
    NoTestResults,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
            ErrorCode::MissingCommand => "MISSING_COMMAND",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::FrameTooLarge => "FRAME_TOO_LARGE",
            ErrorCode::MissingParam => "MISSING_PARAM",
            ErrorCode::InvalidParam => "INVALID_PARAM",
            ErrorCode::NotRunning => "NOT_RUNNING",
            ErrorCode::SendFailed => "SEND_FAILED",
            ErrorCode::NoTestResults => "NO_TEST_RESULTS",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn missing_param(name: &str) -> Self {
        Self::new(
            ErrorCode::MissingParam,
            format!("missing required parameter '{name}'"),
        )
    }

    pub fn invalid_param(name: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidParam,
            format!("parameter '{name}' must be {expected}"),
        )
    }

    pub fn not_running() -> Self {
        Self::new(ErrorCode::NotRunning, "game is not running")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub id: Value,
    pub command: String,
    /// Raw `params` as received; the shape is checked by `take_params` once
    /// the command is known to exist.
    pub params: Value,
}

/// A frame the dispatcher refused before reaching a handler. `id` is whatever
/// could be recovered from the frame, `null` when nothing could.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedCommand {
    pub id: Value,
    pub error: CommandError,
}

impl RejectedCommand {
    fn new(id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            error: CommandError::new(code, message),
        }
    }
}

impl CommandEnvelope {
    pub fn parse(raw: &[u8]) -> Result<Self, RejectedCommand> {
        let value: Value = serde_json::from_slice(raw).map_err(|err| {
            RejectedCommand::new(Value::Null, ErrorCode::ParseError, format!("invalid JSON: {err}"))
        })?;
        let Value::Object(mut object) = value else {
            return Err(RejectedCommand::new(
                Value::Null,
                ErrorCode::InvalidCommand,
                "command must be a JSON object",
            ));
        };

        let id = object.remove("id").unwrap_or(Value::Null);
        let command = match object.remove("command") {
            Some(Value::String(name)) if !name.trim().is_empty() => name,
            _ => {
                return Err(RejectedCommand::new(
                    id,
                    ErrorCode::MissingCommand,
                    "missing 'command' field",
                ))
            }
        };
        let params = object.remove("params").unwrap_or(Value::Null);

        Ok(Self {
            id,
            command,
            params,
        })
    }

    pub fn take_params(&mut self) -> Result<Params, CommandError> {
        match std::mem::take(&mut self.params) {
            Value::Null => Ok(Params::new()),
            Value::Object(map) => Ok(map),
            _ => Err(CommandError::new(
                ErrorCode::InvalidParams,
                "'params' must be a JSON object",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub id: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Params>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CommandError>,
}

impl ResponseEnvelope {
    pub fn ok(id: Value, result: Params) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: CommandError) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Loose parameter access for handlers. Each handler validates its own
/// parameters; these helpers only coerce and report type mismatches.
pub trait ParamsExt {
    fn opt_str(&self, key: &str) -> Result<Option<&str>, CommandError>;
    fn require_str(&self, key: &str) -> Result<&str, CommandError>;
    fn opt_f64(&self, key: &str) -> Result<Option<f64>, CommandError>;
    fn opt_i64(&self, key: &str) -> Result<Option<i64>, CommandError>;
    fn opt_bool(&self, key: &str) -> Result<Option<bool>, CommandError>;
}

impl ParamsExt for Params {
    fn opt_str(&self, key: &str) -> Result<Option<&str>, CommandError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(value)) => Ok(Some(value.as_str())),
            Some(_) => Err(CommandError::invalid_param(key, "a string")),
        }
    }

    fn require_str(&self, key: &str) -> Result<&str, CommandError> {
        match self.opt_str(key)? {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(CommandError::missing_param(key)),
        }
    }

    fn opt_f64(&self, key: &str) -> Result<Option<f64>, CommandError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(number)) => number
                .as_f64()
                .filter(|value| value.is_finite())
                .map(Some)
                .ok_or_else(|| CommandError::invalid_param(key, "a finite number")),
            Some(Value::String(text)) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map(Some)
                .ok_or_else(|| CommandError::invalid_param(key, "a finite number")),
            Some(_) => Err(CommandError::invalid_param(key, "a number")),
        }
    }

    fn opt_i64(&self, key: &str) -> Result<Option<i64>, CommandError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(number)) => {
                if let Some(value) = number.as_i64() {
                    return Ok(Some(value));
                }
                match number.as_f64() {
                    Some(value) if value.is_finite() && value.fract() == 0.0 => {
                        Ok(Some(value as i64))
                    }
                    _ => Err(CommandError::invalid_param(key, "an integer")),
                }
            }
            Some(Value::String(text)) => text
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| CommandError::invalid_param(key, "an integer")),
            Some(_) => Err(CommandError::invalid_param(key, "an integer")),
        }
    }

    fn opt_bool(&self, key: &str) -> Result<Option<bool>, CommandError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(*value)),
            Some(_) => Err(CommandError::invalid_param(key, "a boolean")),
        }
    }
}
