use crate::capture::EventCaptureBus;
use crate::commands::{control_table, BridgePorts, ControlServices};
use crate::config::BridgeConfig;
use crate::dispatch::Dispatcher;
use crate::error::BridgeError;
use crate::game_link::{GameLink, GameLinkConfig};
use crate::listener::BridgeListener;
use crate::registry::SessionRegistry;
use crate::relay::relay_table;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// The running process: game side channel, control listener and the optional
/// relay listener, sharing one capture bus.
pub struct Bridge {
    bus: Arc<EventCaptureBus>,
    game: Arc<GameLink>,
    control: BridgeListener,
    relay: Option<BridgeListener>,
    game_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    game_task: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub async fn start(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let bus = Arc::new(EventCaptureBus::new(config.capacity, config.capture_enabled));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut game_config = GameLinkConfig::new(config.game_addr());
        game_config.write_timeout = config.write_timeout;
        game_config.debug = config.debug;
        let game = Arc::new(GameLink::new(Arc::clone(&bus), game_config));
        let (game_addr, game_task) = Arc::clone(&game).listen(shutdown_rx).await?;

        let control_registry = Arc::new(SessionRegistry::new("control"));
        let services = Arc::new(ControlServices::new(
            Arc::clone(&bus),
            game.clone(),
            Arc::clone(&control_registry),
        ));
        let control_dispatcher = Arc::new(
            Dispatcher::new(control_table(Arc::clone(&services)), control_registry)
                .with_debug(config.debug),
        );
        let control = match BridgeListener::listen(
            config.listener("control", config.port),
            control_dispatcher,
        )
        .await
        {
            Ok(listener) => listener,
            Err(err) => {
                let _ = shutdown.send(true);
                return Err(err);
            }
        };

        let relay = match config.relay_port {
            Some(port) => {
                let relay_registry = Arc::new(SessionRegistry::new("relay"));
                let relay_dispatcher = Arc::new(
                    Dispatcher::new(relay_table(Arc::clone(&relay_registry)), relay_registry)
                        .with_debug(config.debug),
                );
                match BridgeListener::listen(config.listener("relay", port), relay_dispatcher).await
                {
                    Ok(listener) => Some(listener),
                    Err(err) => {
                        control.stop().await;
                        let _ = shutdown.send(true);
                        return Err(err);
                    }
                }
            }
            None => None,
        };

        let ports = BridgePorts {
            control: control.local_addr().port(),
            relay: relay.as_ref().map(|listener| listener.local_addr().port()),
            game: game_addr.port(),
        };
        services.set_ports(ports);
        info!(
            event = "bridge_start",
            control = %control.local_addr(),
            relay = ?relay.as_ref().map(BridgeListener::local_addr),
            game = %game_addr,
            capture_enabled = config.capture_enabled,
            capacity = config.capacity
        );

        Ok(Self {
            bus,
            game,
            control,
            relay,
            game_addr,
            shutdown,
            game_task: Mutex::new(Some(game_task)),
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay.as_ref().map(BridgeListener::local_addr)
    }

    pub fn game_addr(&self) -> SocketAddr {
        self.game_addr
    }

    pub fn bus(&self) -> &Arc<EventCaptureBus> {
        &self.bus
    }

    pub fn game(&self) -> &Arc<GameLink> {
        &self.game
    }

    pub async fn stop(&self) {
        self.control.stop().await;
        if let Some(relay) = &self.relay {
            relay.stop().await;
        }
        if self.shutdown.send_replace(true) {
            return;
        }
        let game_task = self
            .game_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = game_task {
            let _ = task.await;
        }
        info!(event = "bridge_stop");
    }
}
