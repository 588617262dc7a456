pub mod bridge;
pub mod capture;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod game_link;
pub mod listener;
pub mod logging;
pub mod registry;
pub mod relay;
pub mod wait;

pub use bridge::Bridge;
pub use capture::{CaptureSummary, EventCaptureBus};
pub use config::{load_config, BridgeConfig};
pub use dispatch::{Dispatcher, HandlerTable, RequestContext};
pub use error::BridgeError;
pub use game_link::{ControlledProcess, GameLink};
pub use listener::{BridgeListener, ListenerConfig};
pub use registry::{SessionError, SessionId, SessionRegistry, SessionState};
pub use wait::{wait_for, WaitOutcome, WaitReport, WaitSpec};
