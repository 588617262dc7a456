use crate::registry::{SessionId, SessionRegistry};
use codot_core::protocol::{
    CommandEnvelope, CommandError, ErrorCode, Params, ResponseEnvelope, MAX_FRAME_BYTES,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, warn};

pub type HandlerResult = Result<Params, CommandError>;
pub type HandlerFn =
    Arc<dyn Fn(RequestContext, Params) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Per-request data handed to a handler. `cancel` flips to `true` when the
/// requesting session goes away.
#[derive(Clone)]
pub struct RequestContext {
    pub session_id: SessionId,
    pub request_id: Value,
    pub cancel: watch::Receiver<bool>,
}

#[cfg(test)]
impl RequestContext {
    pub(crate) fn detached(session_id: SessionId) -> Self {
        Self {
            session_id,
            request_id: Value::Null,
            cancel: crate::wait::detached_signal(),
        }
    }
}

/// Static name to handler table, built once before the listener starts.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<&'static str, HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, name: &'static str, handler: F) -> &mut Self
    where
        F: Fn(RequestContext, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: HandlerFn = Arc::new(move |ctx, params| handler(ctx, params).boxed());
        if self.handlers.insert(name, handler).is_some() {
            warn!(event = "handler_replaced", command = name);
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<HandlerFn> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names = self.handlers.keys().copied().collect::<Vec<_>>();
        names.sort_unstable();
        names
    }

}

pub struct Dispatcher {
    table: HandlerTable,
    registry: Arc<SessionRegistry>,
    debug: bool,
}

impl Dispatcher {
    pub fn new(table: HandlerTable, registry: Arc<SessionRegistry>) -> Self {
        Self {
            table,
            registry,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn commands(&self) -> Vec<&'static str> {
        self.table.names()
    }

    /// Handles one inbound frame on its own task and pushes the response
    /// through the registry. A slow handler never delays later frames.
    /// `cancel` is the session's close signal and must be taken before the
    /// session can close.
    pub fn dispatch(
        self: &Arc<Self>,
        session_id: SessionId,
        raw: Vec<u8>,
        cancel: watch::Receiver<bool>,
    ) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let response = dispatcher.handle_frame(session_id, &raw, cancel).await;
            let text = match response.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!(event = "response_encode_error", session_id, error = %err);
                    return;
                }
            };
            if dispatcher.debug {
                debug!(event = "response_sent", session_id, raw = %text);
            }
            if let Err(err) = dispatcher.registry.send(session_id, text).await {
                debug!(event = "response_dropped", session_id, error = %err);
            }
        });
    }

    pub async fn handle_frame(
        &self,
        session_id: SessionId,
        raw: &[u8],
        cancel: watch::Receiver<bool>,
    ) -> ResponseEnvelope {
        if raw.len() > MAX_FRAME_BYTES {
            warn!(event = "frame_too_large", session_id, size = raw.len());
            return ResponseEnvelope::failure(
                Value::Null,
                CommandError::new(
                    ErrorCode::FrameTooLarge,
                    format!("frame exceeds max size: {} > {}", raw.len(), MAX_FRAME_BYTES),
                ),
            );
        }

        let mut envelope = match CommandEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(rejected) => {
                warn!(
                    event = "command_rejected",
                    session_id,
                    code = %rejected.error.code,
                    error = %rejected.error.message
                );
                return ResponseEnvelope::failure(rejected.id, rejected.error);
            }
        };
        let Some(handler) = self.table.get(&envelope.command) else {
            warn!(event = "unknown_command", session_id, command = %envelope.command);
            let message = format!("unknown command: {}", envelope.command);
            return ResponseEnvelope::failure(
                envelope.id,
                CommandError::new(ErrorCode::UnknownCommand, message),
            );
        };
        let params = match envelope.take_params() {
            Ok(params) => params,
            Err(error) => {
                warn!(event = "invalid_params", session_id, command = %envelope.command);
                return ResponseEnvelope::failure(envelope.id, error);
            }
        };
        let CommandEnvelope { id, command, .. } = envelope;

        let ctx = RequestContext {
            session_id,
            request_id: id.clone(),
            cancel,
        };
        let started = Instant::now();
        let result = match tokio::spawn(handler(ctx, params)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => {
                warn!(event = "handler_panic", session_id, command = %command);
                Err(CommandError::internal(format!(
                    "handler for '{command}' panicked"
                )))
            }
            Err(_) => Err(CommandError::internal(format!(
                "handler for '{command}' was cancelled"
            ))),
        };
        debug!(
            event = "command_complete",
            session_id,
            command = %command,
            success = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64
        );

        match result {
            Ok(result) => ResponseEnvelope::ok(id, result),
            Err(error) => ResponseEnvelope::failure(id, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{cancelled, detached_signal};
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_tungstenite::tungstenite::Message;

    fn table() -> HandlerTable {
        let mut table = HandlerTable::new();
        table
            .register("echo", |_ctx, params| async move { Ok(params) })
            .register("explode", |_ctx, _params| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(Params::new())
            })
            .register("slow", |_ctx, _params| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let mut result = Params::new();
                result.insert("slow".to_string(), json!(true));
                Ok(result)
            })
            .register("fails", |_ctx, _params| async move {
                Err(CommandError::missing_param("message"))
            });
        table
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            table(),
            Arc::new(SessionRegistry::new("control")),
        ))
    }

    async fn handle(dispatcher: &Dispatcher, raw: &str) -> ResponseEnvelope {
        dispatcher
            .handle_frame(1, raw.as_bytes(), detached_signal())
            .await
    }

    fn code(response: &ResponseEnvelope) -> Option<ErrorCode> {
        response.error.as_ref().map(|error| error.code)
    }

    #[tokio::test]
    async fn success_echoes_request_id_and_result() {
        let dispatcher = dispatcher();
        let response = handle(&dispatcher, r#"{"id":"a-1","command":"echo","params":{"x":1}}"#).await;
        assert!(response.success);
        assert_eq!(response.id, json!("a-1"));
        assert_eq!(response.result.expect("result")["x"], json!(1));
    }

    #[tokio::test]
    async fn protocol_errors_map_to_stable_codes() {
        let dispatcher = dispatcher();

        let parse = handle(&dispatcher, "not json").await;
        assert_eq!(parse.id, Value::Null);
        assert_eq!(code(&parse), Some(ErrorCode::ParseError));

        let unknown = handle(&dispatcher, r#"{"id":7,"command":"launch_rockets"}"#).await;
        assert_eq!(unknown.id, json!(7));
        assert_eq!(code(&unknown), Some(ErrorCode::UnknownCommand));

        let missing = handle(&dispatcher, r#"{"id":8}"#).await;
        assert_eq!(code(&missing), Some(ErrorCode::MissingCommand));

        let unknown_with_bad_params =
            handle(&dispatcher, r#"{"id":1,"command":"nope","params":[1]}"#).await;
        assert_eq!(code(&unknown_with_bad_params), Some(ErrorCode::UnknownCommand));

        let bad_params = handle(&dispatcher, r#"{"id":10,"command":"echo","params":"x"}"#).await;
        assert_eq!(bad_params.id, json!(10));
        assert_eq!(code(&bad_params), Some(ErrorCode::InvalidParams));

        let handler_error = handle(&dispatcher, r#"{"id":9,"command":"fails"}"#).await;
        assert_eq!(handler_error.id, json!(9));
        assert_eq!(code(&handler_error), Some(ErrorCode::MissingParam));
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_before_parsing() {
        let dispatcher = dispatcher();
        let padding = "x".repeat(MAX_FRAME_BYTES);
        let raw = format!(r#"{{"id":1,"command":"echo","params":{{"pad":"{padding}"}}}}"#);
        let response = handle(&dispatcher, &raw).await;
        assert_eq!(code(&response), Some(ErrorCode::FrameTooLarge));
    }

    #[tokio::test]
    async fn panicking_handler_yields_internal_error() {
        let dispatcher = dispatcher();
        let response = handle(&dispatcher, r#"{"id":3,"command":"explode"}"#).await;
        assert_eq!(response.id, json!(3));
        assert_eq!(code(&response), Some(ErrorCode::InternalError));
    }

    #[tokio::test]
    async fn fast_request_is_answered_before_slow_one() {
        let dispatcher = dispatcher();
        let registry = Arc::clone(dispatcher.registry());
        let session = registry
            .register(SocketAddr::from(([127, 0, 0, 1], 41000)))
            .await;
        let (tx, mut rx) = mpsc::channel(8);
        let closed = registry.open(session, tx).await.expect("open");

        dispatcher.dispatch(session, br#"{"id":"slow","command":"slow"}"#.to_vec(), closed.clone());
        dispatcher.dispatch(session, br#"{"id":"fast","command":"echo"}"#.to_vec(), closed.clone());

        let mut order = Vec::new();
        for _ in 0..2 {
            let Some(Message::Text(text)) = rx.recv().await else {
                panic!("expected text frame");
            };
            let response: ResponseEnvelope = serde_json::from_str(&text).expect("response");
            order.push(response.id);
        }
        assert_eq!(order, vec![json!("fast"), json!("slow")]);
    }

    #[test]
    fn table_lists_registered_names_sorted() {
        let table = table();
        assert_eq!(table.names(), vec!["echo", "explode", "fails", "slow"]);
        assert!(table.get("echo").is_some());
        assert!(table.get("missing").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn close_right_after_dispatch_cancels_the_handler() {
        let (done_tx, mut done_rx) = mpsc::channel::<bool>(1);
        let mut table = HandlerTable::new();
        table.register("hang", move |mut ctx, _params| {
            let done_tx = done_tx.clone();
            async move {
                let by_signal = tokio::time::timeout(
                    Duration::from_secs(300),
                    cancelled(&mut ctx.cancel),
                )
                .await
                .is_ok();
                let _ = done_tx.send(by_signal).await;
                Ok(Params::new())
            }
        });
        let registry = Arc::new(SessionRegistry::new("control"));
        let dispatcher = Arc::new(Dispatcher::new(table, Arc::clone(&registry)));
        let session = registry
            .register(SocketAddr::from(([127, 0, 0, 1], 41001)))
            .await;
        let (tx, _rx) = mpsc::channel(8);
        let closed = registry.open(session, tx).await.expect("open");

        let started = tokio::time::Instant::now();
        dispatcher.dispatch(session, br#"{"id":1,"command":"hang"}"#.to_vec(), closed.clone());
        registry
            .disconnected(session, "client_close")
            .await
            .expect("disconnect");

        let by_signal = done_rx.recv().await.expect("handler finished");
        assert!(by_signal);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
