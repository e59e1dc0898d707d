//! Per-room netplay relay
//!
//! A room owns one port, bound for both TCP (control channel: registration,
//! save files, settings, custom blobs) and UDP (input relay with adaptive
//! buffering and desync detection). [`Room`] is the handle a lobby uses to
//! create, populate, start and observe a room.

pub mod config;
pub mod control;
pub mod relay;
pub mod room;
pub mod session;
pub mod supervisor;
pub mod sync;

pub use config::{RoomConfig, RoomSettings, Timings};
pub use netplay_protocol::MAX_PLAYERS;
pub use room::Room;
pub use session::{Player, RoomInfo, Session};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("No free port after {base_port} (tried {max_games})")]
    NoFreePort { base_port: u16, max_games: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] netplay_protocol::ProtocolError),
}
