use chrono::{DateTime, Utc};
use codot_core::capture::{CapturedEntry, EntryKind, KindFilter, NewEntry};
use codot_core::game_channel::{GameMessage, TestSummary};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestReport {
    pub entry_id: u64,
    pub received_at: DateTime<Utc>,
    pub summary: TestSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub counts: BTreeMap<String, u64>,
    pub last_id: u64,
    pub marker: u64,
    pub total_entries: usize,
    pub capacity: usize,
    pub evicted_entries: u64,
    pub active_session_count: usize,
    pub capture_enabled: bool,
    pub game_capture_active: bool,
    pub message_types_seen: BTreeMap<String, u64>,
}

struct BusState {
    entries: VecDeque<CapturedEntry>,
    last_id: u64,
    marker: u64,
    evicted: u64,
    topics_seen: BTreeMap<String, u64>,
    game_sessions: BTreeSet<u64>,
    capture_active: bool,
    last_status: Option<Value>,
    last_test: Option<TestReport>,
}

impl BusState {
    fn append(&mut self, capacity: usize, entry: NewEntry) -> u64 {
        self.last_id += 1;
        let id = self.last_id;
        self.entries
            .push_back(CapturedEntry::stamp(id, Utc::now(), entry));
        while self.entries.len() > capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        id
    }

    // Ids in the ring are contiguous, so the first entry past `cursor` is found
    // by offset rather than by scanning.
    fn start_after(&self, cursor: u64) -> usize {
        let Some(first) = self.entries.front() else {
            return 0;
        };
        if cursor < first.id {
            return 0;
        }
        let offset = cursor - first.id + 1;
        usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.entries.len())
    }
}

/// Fixed-capacity ring of captured entries with a single global marker.
/// All mutation goes through `append`, `mark` and the game-session hooks.
pub struct EventCaptureBus {
    capacity: usize,
    capture_enabled: bool,
    state: Mutex<BusState>,
}

impl Default for EventCaptureBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, true)
    }
}

impl EventCaptureBus {
    pub fn new(capacity: usize, capture_enabled: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            capture_enabled,
            state: Mutex::new(BusState {
                entries: VecDeque::with_capacity(capacity),
                last_id: 0,
                marker: 0,
                evicted: 0,
                topics_seen: BTreeMap::new(),
                game_sessions: BTreeSet::new(),
                capture_active: false,
                last_status: None,
                last_test: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn capture_enabled(&self) -> bool {
        self.capture_enabled
    }

    /// Host entries are always kept; capture being disabled only drops what
    /// the game sends, including its session start and stop records.
    pub fn append(&self, entry: NewEntry) -> u64 {
        self.state().append(self.capacity, entry)
    }

    pub fn mark(&self) -> u64 {
        let mut state = self.state();
        state.marker = state.marker.max(state.last_id);
        debug!(event = "capture_mark", marker = state.marker);
        state.marker
    }

    pub fn marker(&self) -> u64 {
        self.state().marker
    }

    pub fn last_id(&self) -> u64 {
        self.state().last_id
    }

    /// Entries newer than `since_id` (or the marker when `since_id` is absent),
    /// oldest first, keeping the oldest `max_count` matches.
    pub fn query(
        &self,
        filter: &KindFilter,
        since_id: Option<u64>,
        max_count: usize,
    ) -> Vec<CapturedEntry> {
        let state = self.state();
        let lower = since_id.unwrap_or(state.marker);
        let start = state.start_after(lower);
        state
            .entries
            .range(start..)
            .filter(|entry| filter.matches(entry.kind))
            .take(max_count)
            .cloned()
            .collect()
    }

    /// Newest `count` matching entries regardless of the marker, oldest first.
    pub fn recent(&self, filter: &KindFilter, count: usize) -> Vec<CapturedEntry> {
        let state = self.state();
        let mut newest = state
            .entries
            .iter()
            .rev()
            .filter(|entry| filter.matches(entry.kind))
            .take(count)
            .cloned()
            .collect::<Vec<_>>();
        newest.reverse();
        newest
    }

    /// Unfiltered read past a pinned cursor; ignores the global marker.
    pub fn entries_after(&self, cursor: u64) -> Vec<CapturedEntry> {
        let state = self.state();
        let start = state.start_after(cursor);
        state.entries.range(start..).cloned().collect()
    }

    pub fn summary(&self) -> CaptureSummary {
        let state = self.state();
        let mut counts = EntryKind::ALL
            .iter()
            .map(|kind| (kind.as_str().to_string(), 0u64))
            .collect::<BTreeMap<_, _>>();
        let start = state.start_after(state.marker);
        for entry in state.entries.range(start..) {
            *counts.entry(entry.kind.as_str().to_string()).or_default() += 1;
        }
        CaptureSummary {
            counts,
            last_id: state.last_id,
            marker: state.marker,
            total_entries: state.entries.len(),
            capacity: self.capacity,
            evicted_entries: state.evicted,
            active_session_count: state.game_sessions.len(),
            capture_enabled: self.capture_enabled,
            game_capture_active: state.capture_active,
            message_types_seen: state.topics_seen.clone(),
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.state().game_sessions.len()
    }

    pub fn capture_active(&self) -> bool {
        self.state().capture_active
    }

    pub fn last_status(&self) -> Option<Value> {
        self.state().last_status.clone()
    }

    pub fn last_test(&self) -> Option<TestReport> {
        self.state().last_test.clone()
    }

    /// Tracks the session even with capture disabled; only the
    /// `SessionStart` entry is skipped then.
    pub fn open_game_session(&self, session_id: u64, peer: &str) -> Option<u64> {
        let mut state = self.state();
        state.game_sessions.insert(session_id);
        if !self.capture_enabled {
            return None;
        }
        let entry = NewEntry::game(
            EntryKind::SessionStart,
            format!("controlled process connected from {peer}"),
        )
        .with_session(session_id);
        Some(state.append(self.capacity, entry))
    }

    pub fn close_game_session(&self, session_id: u64, reason: &str) -> Option<u64> {
        let mut state = self.state();
        state.game_sessions.remove(&session_id);
        if state.game_sessions.is_empty() {
            state.capture_active = false;
        }
        if !self.capture_enabled {
            return None;
        }
        let entry = NewEntry::game(
            EntryKind::SessionStop,
            format!("controlled process disconnected: {reason}"),
        )
        .with_session(session_id);
        Some(state.append(self.capacity, entry))
    }

    /// Records one side-channel message. Returns the id of the entry it
    /// produced, or `None` when capture is disabled.
    pub fn record_game_message(&self, session_id: u64, message: GameMessage) -> Option<u64> {
        if !self.capture_enabled {
            return None;
        }
        let topic = message.topic().to_string();
        let mut state = self.state();
        *state.topics_seen.entry(topic.clone()).or_default() += 1;

        let entry = match message {
            GameMessage::Ready(payload) => {
                state.capture_active = true;
                info!(event = "game_capture_ready", session_id, pid = ?payload.pid);
                NewEntry::game(EntryKind::Info, "game capture ready")
                    .with_payload(serde_json::to_value(&payload).unwrap_or_default())
            }
            GameMessage::Entry(payload) => {
                let kind = payload.kind.parse::<EntryKind>().unwrap_or_default();
                let mut entry = NewEntry::game(kind, payload.message);
                entry.file = payload.file;
                entry.line = payload.line;
                entry.function = payload.function;
                entry.stack_trace = payload.stack_trace;
                entry
            }
            GameMessage::Pong(payload) => NewEntry::game(EntryKind::Debug, "pong")
                .with_payload(serde_json::to_value(&payload).unwrap_or_default()),
            GameMessage::Status(payload) => {
                state.last_status = Some(payload.clone());
                NewEntry::game(EntryKind::Debug, "status update").with_payload(payload)
            }
            GameMessage::TestStarting(payload) => {
                NewEntry::game(EntryKind::Info, "test run starting").with_payload(payload)
            }
            GameMessage::TestComplete(summary) => {
                let message = format!(
                    "test run complete: {} passed, {} failed, {} pending",
                    summary.passed, summary.failed, summary.pending
                );
                let payload = serde_json::to_value(&summary).unwrap_or_default();
                let entry_id = state.last_id + 1;
                state.last_test = Some(TestReport {
                    entry_id,
                    received_at: Utc::now(),
                    summary,
                });
                NewEntry::game(EntryKind::Info, message).with_payload(payload)
            }
            GameMessage::Unknown { topic, payload } => {
                NewEntry::game(EntryKind::Debug, format!("unhandled message topic '{topic}'"))
                    .with_payload(payload)
            }
        };

        Some(state.append(self.capacity, entry.with_session(session_id).with_topic(topic)))
    }
}
