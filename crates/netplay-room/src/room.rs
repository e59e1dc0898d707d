//! Collaborator-facing room handle

use crate::config::{RoomConfig, RoomSettings, DEFAULT_BUFFER_TARGET};
use crate::control;
use crate::relay;
use crate::session::{shutdown_signal, Player, RoomInfo, Session};
use crate::supervisor;
use crate::RoomError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};

/// A running room. Dropping it shuts the room down.
pub struct Room {
    session: Arc<Session>,
    port: u16,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Bind TCP and UDP on the first port after `base_port` where both succeed
async fn bind_pair(config: &RoomConfig) -> Result<(TcpListener, UdpSocket, u16), RoomError> {
    for offset in 1..=config.max_games {
        let Some(port) = config.base_port.checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::new(config.bind_ip, port);

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                debug!(port, "TCP port unavailable: {}", e);
                continue;
            }
        };
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok((listener, socket, port)),
            Err(e) => debug!(port, "UDP port unavailable: {}", e),
        }
    }

    Err(RoomError::NoFreePort {
        base_port: config.base_port,
        max_games: config.max_games,
    })
}

impl Room {
    /// Bind the room's port and start serving the control channel and the
    /// input relay. The room accepts no traffic until players are added.
    pub async fn create(config: RoomConfig) -> Result<Room, RoomError> {
        let span = info_span!(
            "room",
            room = %config.room_name,
            game = %config.game_name,
            emulator = %config.emulator,
        );

        let (listener, socket, port) = bind_pair(&config).instrument(span.clone()).await?;
        relay::set_dscp(&socket);

        let info = RoomInfo {
            room_name: config.room_name,
            game_name: config.game_name,
            emulator: config.emulator,
            buffer_target: DEFAULT_BUFFER_TARGET,
            ..Default::default()
        };
        let session = Arc::new(Session::new(
            info,
            config.settings_size,
            config.timings,
            span.clone(),
        ));

        let tasks = vec![
            tokio::spawn(control::accept_loop(session.clone(), listener).instrument(span.clone())),
            tokio::spawn(relay::run(session.clone(), Arc::new(socket)).instrument(span.clone())),
        ];
        span.in_scope(|| {
            info!(port, "Created TCP server");
            info!(port, "Created UDP server");
        });

        Ok(Room {
            session,
            port,
            tasks: Mutex::new(tasks),
        })
    }

    /// Apply the lobby-supplied metadata
    pub async fn configure(&self, settings: RoomSettings) {
        self.session.apply_settings(settings).await;
    }

    pub async fn add_player(&self, name: impl Into<String>, ip: IpAddr, slot: u8) {
        let player = Player {
            name: name.into(),
            ip,
            slot,
        };
        self.session.span().in_scope(|| {
            info!(name = %player.name, %ip, slot, "added player");
        });
        self.session.add_player(player).await;
    }

    pub async fn remove_player(&self, name: &str) -> Option<Player> {
        self.session.remove_player(name).await
    }

    /// Begin the game: start the buffer controller and liveness sweep
    pub async fn start(&self) {
        if self.session.is_running() || self.session.is_shut_down() {
            return;
        }
        self.session.mark_started().await;
        let handles = supervisor::spawn(&self.session);
        self.tasks.lock().await.extend(handles);
        self.session
            .span()
            .in_scope(|| info!(port = self.port, "game started"));
    }

    /// Shut the room down and wait for its tasks to finish
    pub async fn close(&self) {
        self.session.shutdown();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("room task ended abnormally: {}", e);
            }
        }
    }

    /// Resolves once the room has shut down, for any reason
    pub async fn closed(&self) {
        let mut rx = self.session.subscribe_shutdown();
        shutdown_signal(&mut rx).await;
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_shut_down()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn info(&self) -> RoomInfo {
        self.session.info().await
    }

    pub async fn game_name(&self) -> String {
        self.session.info().await.game_name
    }

    pub async fn players(&self) -> Vec<Player> {
        self.session.players().await
    }

    /// Returns and clears the flag set whenever the roster changed
    pub fn take_needs_update_players(&self) -> bool {
        self.session.take_needs_update_players()
    }

    pub async fn play_time(&self) -> Duration {
        self.session.play_time().await
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        self.session.shutdown();
    }
}
