use crate::capture::DEFAULT_CAPACITY;
use crate::error::BridgeError;
use crate::listener::ListenerConfig;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_CONTROL_PORT: u16 = 6850;
pub const DEFAULT_RELAY_PORT: u16 = 6851;
pub const DEFAULT_GAME_PORT: u16 = 6852;
pub const DEFAULT_LOG_DIR: &str = ".codot/logs";

#[derive(Parser, Debug, Clone)]
#[command(name = "codot-bridge", version, about = "WebSocket control bridge for the Godot editor")]
pub struct Args {
    #[arg(long)]
    pub port: Option<u16>,
    /// 0 disables the relay listener.
    #[arg(long)]
    pub relay_port: Option<u16>,
    #[arg(long)]
    pub game_port: Option<u16>,
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: String,
    #[arg(long, default_value_t = false)]
    pub no_capture: bool,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = DEFAULT_CAPACITY)]
    pub capacity: usize,
    #[arg(long, default_value_t = 10)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 60)]
    pub stale_seconds: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 5)]
    pub handshake_timeout: u64,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub relay_port: Option<u16>,
    pub game_port: u16,
    pub capture_enabled: bool,
    pub debug: bool,
    pub log_dir: String,
    pub capacity: usize,
    pub ping_interval: Option<Duration>,
    pub stale_after: Option<Duration>,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_CONTROL_PORT,
            relay_port: Some(DEFAULT_RELAY_PORT),
            game_port: DEFAULT_GAME_PORT,
            capture_enabled: true,
            debug: false,
            log_dir: DEFAULT_LOG_DIR.to_string(),
            capacity: DEFAULT_CAPACITY,
            ping_interval: Some(Duration::from_secs(10)),
            stale_after: Some(Duration::from_secs(60)),
            write_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

impl BridgeConfig {
    pub fn listener(&self, name: &str, port: u16) -> ListenerConfig {
        ListenerConfig {
            name: name.to_string(),
            addr: SocketAddr::new(self.bind, port),
            handshake_timeout: self.handshake_timeout,
            ping_interval: self.ping_interval,
            write_timeout: self.write_timeout,
            stale_after: self.stale_after,
            queue_capacity: 256,
            debug: self.debug,
        }
    }

    pub fn game_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.game_port)
    }
}

pub fn load_config() -> Result<BridgeConfig, BridgeError> {
    resolve(Args::parse(), |key| std::env::var(key).ok())
}

/// Flags win over environment variables, which win over defaults.
pub fn resolve<E>(args: Args, env: E) -> Result<BridgeConfig, BridgeError>
where
    E: Fn(&str) -> Option<String>,
{
    let bind: IpAddr = args
        .bind
        .trim()
        .parse()
        .map_err(|_| BridgeError::InvalidAddr(args.bind.clone()))?;
    if !bind.is_loopback() {
        return Err(BridgeError::NonLoopback(bind));
    }

    let port = resolve_port(args.port, env("CODOT_PORT"), DEFAULT_CONTROL_PORT);
    let relay_port = match resolve_port(args.relay_port, env("CODOT_RELAY_PORT"), DEFAULT_RELAY_PORT) {
        0 => None,
        value => Some(value),
    };
    let game_port = resolve_port(args.game_port, env("CODOT_GAME_PORT"), DEFAULT_GAME_PORT);
    let capture_enabled = !args.no_capture && env_flag(env("CODOT_CAPTURE")).unwrap_or(true);
    let debug = args.debug || env_flag(env("CODOT_DEBUG")).unwrap_or(false);
    let log_dir = resolve_log_dir(&args.log_dir, env("CODOT_LOG_DIR"));

    Ok(BridgeConfig {
        bind,
        port,
        relay_port,
        game_port,
        capture_enabled,
        debug,
        log_dir,
        capacity: args.capacity.max(1),
        ping_interval: nonzero_secs(args.ping_interval),
        stale_after: nonzero_secs(args.stale_seconds),
        write_timeout: Duration::from_secs(args.write_timeout.max(1)),
        handshake_timeout: Duration::from_secs(args.handshake_timeout.max(1)),
    })
}

fn resolve_port(flag: Option<u16>, env: Option<String>, default: u16) -> u16 {
    if let Some(port) = flag {
        return port;
    }
    env.and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn resolve_log_dir(flag: &str, env: Option<String>) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    match env {
        Some(value) if !value.trim().is_empty() => value,
        _ => DEFAULT_LOG_DIR.to_string(),
    }
}

fn env_flag(value: Option<String>) -> Option<bool> {
    let value = value?;
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn nonzero_secs(seconds: u64) -> Option<Duration> {
    (seconds > 0).then(|| Duration::from_secs(seconds))
}
