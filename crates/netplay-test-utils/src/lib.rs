pub mod peer;

pub use peer::TestPeer;

use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("netplay_room=debug,netplay_protocol=debug")),
            )
            .with_test_writer()
            .init();
    });
}

/// Base port for a room whose first candidate port is currently free
pub fn free_base_port() -> u16 {
    portpicker::pick_unused_port()
        .map(|p| p - 1)
        .unwrap_or(45000)
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    /// How long a peer waits for any single reply
    pub reply_timeout: Duration,
    /// How long a peer waits for the room to close
    pub close_timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(10),
        }
    }
}
