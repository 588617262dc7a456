use crate::capture::EventCaptureBus;
use crate::dispatch::{HandlerResult, HandlerTable, RequestContext};
use crate::game_link::ControlledProcess;
use crate::registry::SessionRegistry;
use crate::wait::{wait_for, StartCursor, WaitOutcome, WaitSpec, MAX_WAIT};
use chrono::{DateTime, Utc};
use codot_core::capture::{CapturedEntry, EntryKind, KindFilter, NewEntry};
use codot_core::game_channel::{topics, GameCommand};
use codot_core::protocol::{CommandError, ErrorCode, Params, ParamsExt, BRIDGE_VERSION};
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;

const DEFAULT_OUTPUT_LINES: usize = 50;
const DEFAULT_ERROR_COUNT: usize = 10;
const GAME_STOPPED: &str = "game_stopped";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgePorts {
    pub control: u16,
    pub relay: Option<u16>,
    pub game: u16,
}

/// Everything the control vocabulary reads or drives.
pub struct ControlServices {
    pub bus: Arc<EventCaptureBus>,
    pub game: Arc<dyn ControlledProcess>,
    pub registry: Arc<SessionRegistry>,
    ports: Mutex<BridgePorts>,
    ping_counter: AtomicU64,
    started_at: DateTime<Utc>,
}

impl ControlServices {
    pub fn new(
        bus: Arc<EventCaptureBus>,
        game: Arc<dyn ControlledProcess>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            bus,
            game,
            registry,
            ports: Mutex::new(BridgePorts::default()),
            ping_counter: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn set_ports(&self, ports: BridgePorts) {
        *self.ports.lock().unwrap_or_else(PoisonError::into_inner) = ports;
    }

    pub fn ports(&self) -> BridgePorts {
        *self.ports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_running(&self) -> Result<(), CommandError> {
        if self.game.is_running() {
            Ok(())
        } else {
            Err(CommandError::not_running())
        }
    }

    fn game_stopped(&self) -> impl FnMut() -> Option<String> + '_ {
        move || (!self.game.is_running()).then(|| GAME_STOPPED.to_string())
    }
}

fn route<F, Fut>(
    table: &mut HandlerTable,
    services: &Arc<ControlServices>,
    name: &'static str,
    handler: F,
) where
    F: Fn(Arc<ControlServices>, RequestContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let services = Arc::clone(services);
    table.register(name, move |ctx, params| {
        handler(Arc::clone(&services), ctx, params)
    });
}

pub fn control_table(services: Arc<ControlServices>) -> HandlerTable {
    let mut table = HandlerTable::new();
    route(&mut table, &services, "ping", ping);
    route(&mut table, &services, "get_status", get_status);
    route(&mut table, &services, "is_playing", is_playing);
    route(&mut table, &services, "get_debug_output", get_debug_output);
    route(&mut table, &services, "clear_debug_log", clear_debug_log);
    route(&mut table, &services, "get_debugger_status", get_debugger_status);
    route(&mut table, &services, "get_recent_errors", get_recent_errors);
    route(&mut table, &services, "print_to_console", print_to_console);
    route(&mut table, &services, "wait_for_output", wait_for_output);
    route(&mut table, &services, "ping_game", ping_game);
    route(&mut table, &services, "get_game_state", get_game_state);
    route(&mut table, &services, "run_and_capture", run_and_capture);
    route(&mut table, &services, "gut_run_and_wait", gut_run_and_wait);
    route(&mut table, &services, "gut_get_summary", gut_get_summary);
    table
}

pub(crate) fn object(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, CommandError> {
    serde_json::to_value(value).map_err(|err| CommandError::internal(err.to_string()))
}

fn seconds_param(params: &Params, key: &str, default: f64) -> Result<Duration, CommandError> {
    let seconds = params.opt_f64(key)?.unwrap_or(default);
    if seconds < 0.0 {
        return Err(CommandError::invalid_param(key, "a non-negative number of seconds"));
    }
    Ok(Duration::from_secs_f64(seconds.min(MAX_WAIT.as_secs_f64())))
}

fn count_param(params: &Params, key: &str, default: usize, max: usize) -> Result<usize, CommandError> {
    match params.opt_i64(key)? {
        None => Ok(default.min(max)),
        Some(count) if count >= 1 => Ok(usize::try_from(count).unwrap_or(max).min(max)),
        Some(_) => Err(CommandError::invalid_param(key, "a positive integer")),
    }
}

fn filter_param(params: &Params, key: &str) -> Result<KindFilter, CommandError> {
    match params.opt_str(key)? {
        None => Ok(KindFilter::All),
        Some(raw) => raw
            .parse::<KindFilter>()
            .map_err(|_| CommandError::invalid_param(key, "all, error, warning, output or an entry type")),
    }
}

fn rounded_seconds(duration: Duration) -> f64 {
    (duration.as_secs_f64() * 1000.0).round() / 1000.0
}

async fn ping(_services: Arc<ControlServices>, _ctx: RequestContext, _params: Params) -> HandlerResult {
    Ok(object(json!({
        "pong": true,
        "timestamp": Utc::now().to_rfc3339(),
        "version": BRIDGE_VERSION,
    })))
}

async fn get_status(services: Arc<ControlServices>, _ctx: RequestContext, _params: Params) -> HandlerResult {
    let ports = services.ports();
    let uptime = Utc::now().signed_duration_since(services.started_at);
    Ok(object(json!({
        "version": BRIDGE_VERSION,
        "started_at": services.started_at.to_rfc3339(),
        "uptime_seconds": uptime.num_seconds(),
        "port": ports.control,
        "relay_port": ports.relay,
        "game_port": ports.game,
        "sessions": services.registry.open_count().await,
        "session_list": to_value(&services.registry.snapshot().await)?,
        "capture_enabled": services.bus.capture_enabled(),
        "game_running": services.game.is_running(),
        "game_sessions": services.game.session_count(),
    })))
}

async fn is_playing(services: Arc<ControlServices>, _ctx: RequestContext, _params: Params) -> HandlerResult {
    Ok(object(json!({ "playing": services.game.is_running() })))
}

async fn get_debug_output(services: Arc<ControlServices>, _ctx: RequestContext, params: Params) -> HandlerResult {
    let bus = &services.bus;
    let lines = count_param(&params, "lines", DEFAULT_OUTPUT_LINES, bus.capacity())?;
    let filter = filter_param(&params, "filter")?;
    let since_id = match params.opt_i64("since_id")? {
        None => None,
        Some(id) if id >= 0 => Some(id as u64),
        Some(_) => return Err(CommandError::invalid_param("since_id", "a non-negative integer")),
    };

    let mut entries = bus.query(&filter, since_id, lines.saturating_add(1));
    let truncated = entries.len() > lines;
    entries.truncate(lines);
    let summary = bus.summary();
    Ok(object(json!({
        "entries": to_value(&entries)?,
        "count": entries.len(),
        "truncated": truncated,
        "since_id": since_id.unwrap_or(summary.marker),
        "last_id": summary.last_id,
        "marker": summary.marker,
        "counts": summary.counts,
        "game_running": services.game.is_running(),
    })))
}

async fn clear_debug_log(services: Arc<ControlServices>, ctx: RequestContext, _params: Params) -> HandlerResult {
    let since_id = services.bus.mark();
    info!(event = "debug_log_cleared", session_id = ctx.session_id, since_id);
    Ok(object(json!({ "cleared": true, "since_id": since_id })))
}

async fn get_debugger_status(services: Arc<ControlServices>, _ctx: RequestContext, _params: Params) -> HandlerResult {
    let mut result = object(to_value(&services.bus.summary())?);
    result.insert("game_running".to_string(), json!(services.game.is_running()));
    result.insert("game_sessions".to_string(), json!(services.game.session_count()));
    Ok(result)
}

async fn get_recent_errors(services: Arc<ControlServices>, _ctx: RequestContext, params: Params) -> HandlerResult {
    let count = count_param(&params, "count", DEFAULT_ERROR_COUNT, services.bus.capacity())?;
    let errors = services.bus.recent(&KindFilter::Errors, count);
    Ok(object(json!({
        "errors": to_value(&errors)?,
        "count": errors.len(),
        "last_id": services.bus.last_id(),
    })))
}

async fn print_to_console(services: Arc<ControlServices>, _ctx: RequestContext, params: Params) -> HandlerResult {
    let message = params.require_str("message")?;
    let id = services.bus.append(NewEntry::host(EntryKind::Print, message));
    Ok(object(json!({ "printed": true, "id": id })))
}

fn output_predicate(wait_for: &str) -> Box<dyn FnMut(&CapturedEntry) -> bool + Send> {
    match wait_for {
        "" | "any" => Box::new(|entry: &CapturedEntry| entry.kind.is_output()),
        "error" | "errors" => Box::new(|entry: &CapturedEntry| entry.kind.is_error()),
        "warning" | "warnings" => Box::new(|entry: &CapturedEntry| entry.kind == EntryKind::Warning),
        text => {
            let needle = text.to_string();
            Box::new(move |entry: &CapturedEntry| entry.message.contains(&needle))
        }
    }
}

async fn wait_for_output(services: Arc<ControlServices>, ctx: RequestContext, params: Params) -> HandlerResult {
    let timeout = seconds_param(&params, "timeout", 5.0)?;
    let poll = seconds_param(&params, "poll_interval", 0.25)?;
    let target = params.opt_str("wait_for")?.unwrap_or("any").to_string();
    services.require_running()?;

    let mut cancel = ctx.cancel.clone();
    let report = wait_for(
        &services.bus,
        WaitSpec::new(poll, timeout),
        output_predicate(&target),
        services.game_stopped(),
        &mut cancel,
    )
    .await;

    let mut result = report.to_params();
    result.insert("wait_for".to_string(), json!(target));
    Ok(result)
}

async fn ping_game(services: Arc<ControlServices>, ctx: RequestContext, params: Params) -> HandlerResult {
    let timeout = seconds_param(&params, "timeout", 2.0)?;
    services.require_running()?;

    let ping_id = services.ping_counter.fetch_add(1, Ordering::SeqCst) + 1;
    let cursor = services.bus.last_id();
    services.game.send(GameCommand::Ping { id: ping_id })?;

    let mut cancel = ctx.cancel.clone();
    let spec = WaitSpec::new(Duration::from_millis(20), timeout).starting_at(StartCursor::At(cursor));
    let report = wait_for(
        &services.bus,
        spec,
        |entry| {
            entry.topic.as_deref() == Some(topics::PONG)
                && entry
                    .raw_payload
                    .as_ref()
                    .and_then(|payload| payload.get("id"))
                    .and_then(Value::as_u64)
                    == Some(ping_id)
        },
        services.game_stopped(),
        &mut cancel,
    )
    .await;

    Ok(object(json!({
        "responded": report.found(),
        "ping_id": ping_id,
        "latency_ms": report.found().then(|| report.elapsed.as_millis() as u64),
        "timeout": report.timed_out(),
        "reason": report.reason(),
    })))
}

async fn get_game_state(services: Arc<ControlServices>, _ctx: RequestContext, _params: Params) -> HandlerResult {
    let last_test = services.bus.last_test();
    Ok(object(json!({
        "running": services.game.is_running(),
        "game_sessions": services.game.session_count(),
        "capture_enabled": services.bus.capture_enabled(),
        "capture_active": services.bus.capture_active(),
        "last_status": services.bus.last_status(),
        "last_test_at": last_test.map(|report| report.received_at.to_rfc3339()),
    })))
}

async fn run_and_capture(services: Arc<ControlServices>, ctx: RequestContext, params: Params) -> HandlerResult {
    let duration = seconds_param(&params, "duration", 2.0)?;
    let filter = filter_param(&params, "filter")?;
    let stop_on_error = params.opt_bool("stop_on_error")?.unwrap_or(false);
    services.require_running()?;

    let cursor = services.bus.last_id();
    let mut cancel = ctx.cancel.clone();
    let spec = WaitSpec::new(Duration::from_millis(100), duration).starting_at(StartCursor::At(cursor));
    let report = wait_for(
        &services.bus,
        spec,
        |entry| stop_on_error && entry.kind.is_error(),
        services.game_stopped(),
        &mut cancel,
    )
    .await;

    let captured = services.bus.entries_after(cursor);
    let error_count = captured.iter().filter(|e| e.kind.is_error()).count();
    let warning_count = captured
        .iter()
        .filter(|e| e.kind == EntryKind::Warning)
        .count();
    let entries = captured
        .into_iter()
        .filter(|entry| filter.matches(entry.kind))
        .collect::<Vec<_>>();

    Ok(object(json!({
        "entries": to_value(&entries)?,
        "count": entries.len(),
        "error_count": error_count,
        "warning_count": warning_count,
        "since_id": cursor,
        "duration": rounded_seconds(duration),
        "elapsed": rounded_seconds(report.elapsed),
        "stopped_on_error": report.found(),
        "game_stopped": matches!(&report.outcome, WaitOutcome::Aborted(_)),
        "cancelled": matches!(report.outcome, WaitOutcome::Cancelled),
    })))
}

async fn gut_run_and_wait(services: Arc<ControlServices>, ctx: RequestContext, params: Params) -> HandlerResult {
    let script = params.opt_str("script")?.map(str::to_string);
    let test = params.opt_str("test")?.map(str::to_string);
    let timeout = seconds_param(&params, "timeout", 30.0)?;
    let include_output = params.opt_bool("include_output")?.unwrap_or(true);
    services.require_running()?;

    let cursor = services.bus.last_id();
    services.game.send(GameCommand::RunTests {
        script: script.clone(),
        test: test.clone(),
    })?;
    info!(event = "test_run_requested", session_id = ctx.session_id, script = ?script, test = ?test);

    let mut cancel = ctx.cancel.clone();
    let spec = WaitSpec::new(Duration::from_millis(100), timeout).starting_at(StartCursor::At(cursor));
    let report = wait_for(
        &services.bus,
        spec,
        |entry| entry.topic.as_deref() == Some(topics::TEST_COMPLETE),
        services.game_stopped(),
        &mut cancel,
    )
    .await;

    let mut result = object(json!({
        "completed": report.found(),
        "timeout": report.timed_out(),
        "elapsed": rounded_seconds(report.elapsed),
        "script": script,
        "test": test,
    }));
    if let Some(reason) = report.reason() {
        result.insert("reason".to_string(), json!(reason));
    }
    if let Some(entry) = report.matched() {
        let summary = entry.raw_payload.clone().unwrap_or(Value::Null);
        for key in ["passed", "failed", "pending", "total"] {
            result.insert(key.to_string(), summary.get(key).cloned().unwrap_or(json!(0)));
        }
        result.insert("summary".to_string(), summary);
    }
    if include_output {
        let output = services
            .bus
            .entries_after(cursor)
            .into_iter()
            .filter(|entry| entry.kind.is_output())
            .collect::<Vec<_>>();
        result.insert("output".to_string(), to_value(&output)?);
    }
    Ok(result)
}

async fn gut_get_summary(services: Arc<ControlServices>, _ctx: RequestContext, _params: Params) -> HandlerResult {
    let Some(report) = services.bus.last_test() else {
        return Err(CommandError::new(
            ErrorCode::NoTestResults,
            "no test run has completed yet",
        ));
    };
    let mut result = object(to_value(&report.summary)?);
    result.insert("entry_id".to_string(), json!(report.entry_id));
    result.insert("received_at".to_string(), json!(report.received_at.to_rfc3339()));
    Ok(result)
}
