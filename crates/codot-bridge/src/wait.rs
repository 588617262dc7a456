use crate::capture::EventCaptureBus;
use codot_core::capture::CapturedEntry;
use codot_core::protocol::Params;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

pub const MAX_WAIT: Duration = Duration::from_secs(300);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartCursor {
    /// Advance the global marker and start from it.
    Mark,
    /// Start from the newest entry without touching the marker.
    Latest,
    At(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitSpec {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub start: StartCursor,
}

impl WaitSpec {
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval: poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL),
            timeout: timeout.min(MAX_WAIT),
            start: StartCursor::Latest,
        }
    }

    pub fn starting_at(mut self, start: StartCursor) -> Self {
        self.start = start;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Matched(CapturedEntry),
    Aborted(String),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitReport {
    pub outcome: WaitOutcome,
    pub elapsed: Duration,
    pub start_cursor: u64,
    pub last_cursor: u64,
    pub polls: u32,
}

impl WaitReport {
    pub fn found(&self) -> bool {
        matches!(self.outcome, WaitOutcome::Matched(_))
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, WaitOutcome::TimedOut)
    }

    pub fn matched(&self) -> Option<&CapturedEntry> {
        match &self.outcome {
            WaitOutcome::Matched(entry) => Some(entry),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.outcome {
            WaitOutcome::Matched(_) => None,
            WaitOutcome::Aborted(reason) => Some(reason),
            WaitOutcome::TimedOut => Some("timeout"),
            WaitOutcome::Cancelled => Some("cancelled"),
        }
    }

    pub fn to_params(&self) -> Params {
        let mut result = Params::new();
        result.insert("found".to_string(), json!(self.found()));
        result.insert("timeout".to_string(), json!(self.timed_out()));
        result.insert(
            "elapsed".to_string(),
            json!(round_millis(self.elapsed.as_secs_f64())),
        );
        result.insert("since_id".to_string(), json!(self.start_cursor));
        result.insert("last_id".to_string(), json!(self.last_cursor));
        if let Some(reason) = self.reason() {
            result.insert("reason".to_string(), json!(reason));
        }
        let entry = self
            .matched()
            .and_then(|entry| serde_json::to_value(entry).ok())
            .unwrap_or(Value::Null);
        result.insert("entry".to_string(), entry);
        result
    }
}

fn round_millis(seconds: f64) -> f64 {
    (seconds * 1000.0).round() / 1000.0
}

/// Resolves when the owning session or listener is gone. A dropped sender
/// without an explicit `true` never fires, so detached callers wait out
/// their timeout.
pub async fn cancelled(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
pub(crate) fn detached_signal() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

/// Polls the bus until `predicate` matches a new entry, `abort` reports a
/// reason, the timeout elapses or `cancel` fires. Exit priority per poll is
/// match, then abort, then timeout. The start cursor is pinned for the whole
/// wait; later marks by other clients do not move it.
pub async fn wait_for<P, A>(
    bus: &EventCaptureBus,
    spec: WaitSpec,
    mut predicate: P,
    mut abort: A,
    cancel: &mut watch::Receiver<bool>,
) -> WaitReport
where
    P: FnMut(&CapturedEntry) -> bool,
    A: FnMut() -> Option<String>,
{
    let started = Instant::now();
    let start_cursor = match spec.start {
        StartCursor::Mark => bus.mark(),
        StartCursor::Latest => bus.last_id(),
        StartCursor::At(cursor) => cursor,
    };
    let mut cursor = start_cursor;
    let mut polls = 0u32;

    let outcome = loop {
        let remaining = spec.timeout.saturating_sub(started.elapsed());
        let nap = spec.poll_interval.min(remaining);
        tokio::select! {
            biased;
            _ = cancelled(cancel) => break WaitOutcome::Cancelled,
            _ = tokio::time::sleep(nap) => {}
        }
        polls += 1;

        let batch = bus.entries_after(cursor);
        if let Some(last) = batch.last() {
            cursor = last.id;
        }
        if let Some(entry) = batch.into_iter().find(|entry| predicate(entry)) {
            break WaitOutcome::Matched(entry);
        }
        if let Some(reason) = abort() {
            break WaitOutcome::Aborted(reason);
        }
        if started.elapsed() >= spec.timeout {
            break WaitOutcome::TimedOut;
        }
    };

    let report = WaitReport {
        outcome,
        elapsed: started.elapsed(),
        start_cursor,
        last_cursor: cursor,
        polls,
    };
    debug!(
        event = "wait_complete",
        found = report.found(),
        reason = report.reason().unwrap_or("matched"),
        polls = report.polls,
        elapsed_ms = report.elapsed.as_millis() as u64
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use codot_core::capture::{EntryKind, NewEntry};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn never(_: &CapturedEntry) -> bool {
        false
    }

    fn no_abort() -> Option<String> {
        None
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_within_one_poll_of_the_deadline() {
        let bus = EventCaptureBus::default();
        let spec = WaitSpec::new(Duration::from_millis(50), Duration::from_millis(200));
        let mut cancel = detached_signal();

        let report = wait_for(&bus, spec, never, no_abort, &mut cancel).await;
        assert!(report.timed_out());
        assert!(!report.found());
        assert!(report.elapsed >= Duration::from_millis(200));
        assert!(report.elapsed < Duration::from_millis(250));
        assert_eq!(report.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn uneven_poll_interval_does_not_overshoot_timeout() {
        let bus = EventCaptureBus::default();
        let spec = WaitSpec::new(Duration::from_millis(150), Duration::from_millis(200));
        let mut cancel = detached_signal();

        let report = wait_for(&bus, spec, never, no_abort, &mut cancel).await;
        assert!(report.timed_out());
        assert!(report.elapsed < Duration::from_millis(350));
        assert_eq!(report.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn matches_on_first_poll_after_append_and_ignores_older_entries() {
        let bus = Arc::new(EventCaptureBus::default());
        bus.append(NewEntry::game(EntryKind::Error, "stale error"));

        let producer = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            producer.append(NewEntry::game(EntryKind::Print, "noise"));
            producer.append(NewEntry::game(EntryKind::Error, "fresh error"));
        });

        let spec = WaitSpec::new(Duration::from_millis(100), Duration::from_secs(2));
        let mut cancel = detached_signal();
        let report = wait_for(
            &bus,
            spec,
            |entry| entry.kind.is_error(),
            no_abort,
            &mut cancel,
        )
        .await;

        let matched = report.matched().expect("matched");
        assert_eq!(matched.message, "fresh error");
        assert_eq!(report.start_cursor, 1);
        assert_eq!(report.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_start_advances_the_global_marker() {
        let bus = EventCaptureBus::default();
        bus.append(NewEntry::game(EntryKind::Print, "before"));
        let spec = WaitSpec::new(Duration::from_millis(10), Duration::from_millis(20))
            .starting_at(StartCursor::Mark);
        let mut cancel = detached_signal();

        let report = wait_for(&bus, spec, never, no_abort, &mut cancel).await;
        assert_eq!(report.start_cursor, 1);
        assert_eq!(bus.marker(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pinned_cursor_survives_marks_from_other_clients() {
        let bus = Arc::new(EventCaptureBus::default());
        let producer = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.append(NewEntry::game(EntryKind::Warning, "watch me"));
            producer.mark();
        });

        let spec = WaitSpec::new(Duration::from_millis(50), Duration::from_millis(500));
        let mut cancel = detached_signal();
        let report = wait_for(
            &bus,
            spec,
            |entry| entry.kind == EntryKind::Warning,
            no_abort,
            &mut cancel,
        )
        .await;
        assert!(report.found());
    }

    #[tokio::test(start_paused = true)]
    async fn match_beats_abort_and_abort_beats_timeout() {
        let bus = Arc::new(EventCaptureBus::default());
        let producer = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.append(NewEntry::game(EntryKind::Print, "done"));
        });
        let spec = WaitSpec::new(Duration::from_millis(50), Duration::from_millis(50));
        let mut cancel = detached_signal();
        let report = wait_for(
            &bus,
            spec,
            |entry| entry.message == "done",
            || Some("game_stopped".to_string()),
            &mut cancel,
        )
        .await;
        assert!(report.found());

        let report = wait_for(
            &bus,
            spec,
            never,
            || Some("game_stopped".to_string()),
            &mut cancel,
        )
        .await;
        assert_eq!(report.outcome, WaitOutcome::Aborted("game_stopped".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_condition_is_checked_every_poll() {
        let bus = EventCaptureBus::default();
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let spec = WaitSpec::new(Duration::from_millis(50), Duration::from_secs(5));
        let mut cancel = detached_signal();
        let report = wait_for(
            &bus,
            spec,
            never,
            || stopped.load(Ordering::SeqCst).then(|| "game_stopped".to_string()),
            &mut cancel,
        )
        .await;
        assert_eq!(report.reason(), Some("game_stopped"));
        assert_eq!(report.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_wait_before_the_next_poll() {
        let bus = EventCaptureBus::default();
        let (cancel_tx, mut cancel) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(130)).await;
            let _ = cancel_tx.send(true);
        });

        let spec = WaitSpec::new(Duration::from_millis(100), Duration::from_secs(60));
        let report = wait_for(&bus, spec, never, no_abort, &mut cancel).await;
        assert_eq!(report.outcome, WaitOutcome::Cancelled);
        assert!(report.elapsed < Duration::from_millis(200));
    }

    #[test]
    fn spec_clamps_pathological_values() {
        let spec = WaitSpec::new(Duration::ZERO, Duration::from_secs(86_400));
        assert_eq!(spec.poll_interval, MIN_POLL_INTERVAL);
        assert_eq!(spec.timeout, MAX_WAIT);

        let spec = WaitSpec::new(Duration::from_secs(60), Duration::from_secs(1));
        assert_eq!(spec.poll_interval, MAX_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn report_serializes_outcome_fields() {
        let bus = EventCaptureBus::default();
        let spec = WaitSpec::new(Duration::from_millis(10), Duration::from_millis(10));
        let mut cancel = detached_signal();
        let report = wait_for(&bus, spec, never, no_abort, &mut cancel).await;
        let params = report.to_params();
        assert_eq!(params["found"], json!(false));
        assert_eq!(params["timeout"], json!(true));
        assert_eq!(params["reason"], json!("timeout"));
        assert_eq!(params["entry"], Value::Null);
    }
}
