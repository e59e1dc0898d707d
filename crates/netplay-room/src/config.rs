//! Room configuration

use netplay_protocol::control::DEFAULT_SETTINGS_SIZE;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Buffer target used when the lobby does not supply a usable one
pub const DEFAULT_BUFFER_TARGET: u8 = 2;

/// Intervals and bounds for the room's background work
#[derive(Debug, Clone)]
pub struct Timings {
    /// Period of the buffer-size control loop
    pub buffer_interval: Duration,
    /// A peer must send an input request at least once per interval
    pub liveness_interval: Duration,
    /// Delay before the first liveness sweep
    pub liveness_grace: Duration,
    /// How long a blob sender waits for its data to appear
    pub blob_timeout: Duration,
    /// How often a waiting blob sender looks again
    pub blob_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            buffer_interval: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(30),
            liveness_grace: Duration::from_secs(30),
            blob_timeout: Duration::from_secs(5 * 60),
            blob_poll: Duration::from_secs(1),
        }
    }
}

/// Parameters for creating a room
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Ports `base_port + 1 ..= base_port + max_games` are tried in order
    pub base_port: u16,
    pub max_games: u16,
    pub room_name: String,
    pub game_name: String,
    pub emulator: String,
    pub bind_ip: IpAddr,
    /// Settings blob length for the client protocol revision (24 or 28)
    pub settings_size: usize,
    pub timings: Timings,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            base_port: 45000,
            max_games: 10,
            room_name: String::new(),
            game_name: String::new(),
            emulator: String::new(),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            settings_size: DEFAULT_SETTINGS_SIZE,
            timings: Timings::default(),
        }
    }
}

/// Values the lobby fills in after the room exists
#[derive(Debug, Clone, Default)]
pub struct RoomSettings {
    pub password: String,
    /// ROM checksum reported by the creator
    pub rom_hash: String,
    /// Client build the creator runs; joiners must match it
    pub client_sha: String,
    pub features: HashMap<String, String>,
    pub buffer_target: u8,
}

impl RoomSettings {
    /// Replace an unusable buffer target with the default
    pub fn normalized(mut self) -> Self {
        if self.buffer_target < 1 {
            self.buffer_target = DEFAULT_BUFFER_TARGET;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_buffer_target_defaults() {
        let settings = RoomSettings::default().normalized();
        assert_eq!(settings.buffer_target, DEFAULT_BUFFER_TARGET);

        let settings = RoomSettings {
            buffer_target: 4,
            ..Default::default()
        }
        .normalized();
        assert_eq!(settings.buffer_target, 4);
    }
}
