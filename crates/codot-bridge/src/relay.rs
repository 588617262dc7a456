use crate::commands::object;
use crate::dispatch::{HandlerResult, HandlerTable, RequestContext};
use crate::registry::SessionRegistry;
use chrono::Utc;
use codot_core::protocol::{Params, ParamsExt, BRIDGE_VERSION};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

/// Vocabulary of the relay listener. The external tool and the editor both
/// connect here; prompts from one session fan out to all the others.
pub fn relay_table(registry: Arc<SessionRegistry>) -> HandlerTable {
    let mut table = HandlerTable::new();
    table.register("ping", |_ctx, _params| async move {
        Ok(object(json!({
            "pong": true,
            "timestamp": Utc::now().to_rfc3339(),
            "version": BRIDGE_VERSION,
        })))
    });
    let status_registry = Arc::clone(&registry);
    table.register("get_status", move |_ctx, _params| {
        let registry = Arc::clone(&status_registry);
        async move {
            Ok(object(json!({
                "listener": registry.listener(),
                "version": BRIDGE_VERSION,
                "sessions": registry.open_count().await,
            })))
        }
    });
    table.register("send_prompt", move |ctx, params| {
        send_prompt(Arc::clone(&registry), ctx, params)
    });
    table
}

async fn send_prompt(
    registry: Arc<SessionRegistry>,
    ctx: RequestContext,
    params: Params,
) -> HandlerResult {
    let prompt = params.require_str("prompt")?.to_string();
    let context = params.get("context").cloned().unwrap_or(Value::Null);
    let frame = json!({
        "type": "prompt",
        "prompt": prompt,
        "context": context,
        "from_session": ctx.session_id,
        "request_id": ctx.request_id,
        "timestamp": Utc::now().to_rfc3339(),
    });

    let recipients = registry
        .broadcast_except(Some(ctx.session_id), &frame.to_string())
        .await;
    if recipients == 0 {
        warn!(event = "prompt_unrouted", session_id = ctx.session_id);
    } else {
        info!(event = "prompt_relayed", session_id = ctx.session_id, recipients);
    }
    Ok(object(json!({
        "delivered": recipients > 0,
        "recipients": recipients,
    })))
}
