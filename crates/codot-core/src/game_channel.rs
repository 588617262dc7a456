use crate::protocol::MAX_FRAME_BYTES;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::marker::PhantomData;
use thiserror::Error;

pub const RESERVED_TOPIC_PREFIX: &str = "codot:";

pub mod topics {
    pub const READY: &str = "codot:ready";
    pub const ENTRY: &str = "codot:entry";
    pub const PONG: &str = "codot:pong";
    pub const STATUS: &str = "codot:status";
    pub const TEST_STARTING: &str = "codot:test_starting";
    pub const TEST_COMPLETE: &str = "codot:test_complete";
    pub const PING: &str = "codot:ping";
    pub const RUN_TESTS: &str = "codot:run_tests";
}

/// One newline-delimited frame on the game side channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameFrame {
    pub topic: String,
    #[serde(default)]
    pub payload: Value,
}

impl GameFrame {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadyPayload {
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub scene: Option<String>,
    #[serde(default)]
    pub engine_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryPayload {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, alias = "text")]
    pub message: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default, alias = "stack")]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PongPayload {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub sent_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestSummary {
    #[serde(default)]
    pub passed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub pending: u64,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub failures: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Side-channel messages decoded once at the boundary. Frames whose topic is
/// outside the reserved prefix, or whose payload does not fit the expected
/// shape, become `Unknown` and are still recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum GameMessage {
    Ready(ReadyPayload),
    Entry(EntryPayload),
    Pong(PongPayload),
    Status(Value),
    TestStarting(Value),
    TestComplete(TestSummary),
    Unknown { topic: String, payload: Value },
}

impl GameMessage {
    pub fn decode(frame: GameFrame) -> Self {
        let GameFrame { topic, payload } = frame;
        let Some(kind) = topic.strip_prefix(RESERVED_TOPIC_PREFIX) else {
            return GameMessage::Unknown { topic, payload };
        };
        let decoded = match kind {
            "ready" => typed(&payload).map(GameMessage::Ready),
            "entry" => typed(&payload).map(GameMessage::Entry),
            "pong" => typed(&payload).map(GameMessage::Pong),
            "status" => Some(GameMessage::Status(payload.clone())),
            "test_starting" => Some(GameMessage::TestStarting(payload.clone())),
            "test_complete" => typed(&payload).map(GameMessage::TestComplete),
            _ => None,
        };
        decoded.unwrap_or(GameMessage::Unknown { topic, payload })
    }

    pub fn topic(&self) -> &str {
        match self {
            GameMessage::Ready(_) => topics::READY,
            GameMessage::Entry(_) => topics::ENTRY,
            GameMessage::Pong(_) => topics::PONG,
            GameMessage::Status(_) => topics::STATUS,
            GameMessage::TestStarting(_) => topics::TEST_STARTING,
            GameMessage::TestComplete(_) => topics::TEST_COMPLETE,
            GameMessage::Unknown { topic, .. } => topic,
        }
    }
}

fn typed<T: DeserializeOwned>(payload: &Value) -> Option<T> {
    if payload.is_null() {
        return serde_json::from_value(Value::Object(Map::new())).ok();
    }
    serde_json::from_value(payload.clone()).ok()
}

/// Messages the bridge writes back to the controlled process.
#[derive(Debug, Clone, PartialEq)]
pub enum GameCommand {
    Ping {
        id: u64,
    },
    RunTests {
        script: Option<String>,
        test: Option<String>,
    },
}

impl GameCommand {
    pub fn into_frame(self) -> GameFrame {
        match self {
            GameCommand::Ping { id } => GameFrame::new(
                topics::PING,
                serde_json::json!({"id": id, "sent_ms": chrono::Utc::now().timestamp_millis()}),
            ),
            GameCommand::RunTests { script, test } => GameFrame::new(
                topics::RUN_TESTS,
                serde_json::json!({"script": script, "test": test}),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

pub fn encode_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

fn trim_line(bytes: &[u8]) -> &[u8] {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    raw
}

/// Incremental decoder for peers that deliver partial lines.
pub struct NdjsonFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> NdjsonFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for NdjsonFrameDecoder<T> {
    fn default() -> Self {
        Self::new(MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> NdjsonFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending.extend_from_slice(chunk);

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            let frame = trim_line(&line);
            if frame.iter().all(|byte| byte.is_ascii_whitespace()) {
                continue;
            }
            self.decode_into(frame, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        let remainder = std::mem::take(&mut self.pending);
        if !remainder.iter().all(|byte| byte.is_ascii_whitespace()) {
            self.decode_into(&remainder, &mut report);
        }
        report
    }

    fn decode_into(&self, frame: &[u8], report: &mut DecodeReport<T>) {
        if frame.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: frame.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match serde_json::from_slice(frame) {
            Ok(parsed) => report.frames.push(parsed),
            Err(err) => report.errors.push(FrameError::Decode(err.to_string())),
        }
    }
}
