use codot_bridge::logging::init_logging;
use codot_bridge::{load_config, Bridge};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match load_config() {
        Ok(value) => value,
        Err(err) => {
            eprintln!("codot-bridge: {err}");
            std::process::exit(2);
        }
    };
    let _log_guard = init_logging(&config);

    let bridge = match Bridge::start(&config).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "bridge_error", error = %err);
            std::process::exit(1);
        }
    };

    let _ = tokio::signal::ctrl_c().await;
    info!(event = "shutdown_signal");
    bridge.stop().await;
}
