use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use netplay_room::{Room, RoomConfig, RoomSettings, Timings};
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// A player admitted on the command line, written `NAME=IP:SLOT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSpec {
    pub name: String,
    pub ip: IpAddr,
    pub slot: u8,
}

impl FromStr for PlayerSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, addr) = s.split_once('=').context("expected NAME=IP:SLOT")?;
        if name.is_empty() {
            bail!("player name is empty");
        }
        // rsplit so IPv6 addresses keep their colons
        let (ip, slot) = addr.rsplit_once(':').context("expected IP:SLOT after '='")?;
        let ip = ip.trim_start_matches('[').trim_end_matches(']');
        let ip: IpAddr = ip.parse().with_context(|| format!("invalid IP address: {ip}"))?;
        let slot: u8 = slot.parse().with_context(|| format!("invalid slot: {slot}"))?;
        if usize::from(slot) >= netplay_room::MAX_PLAYERS {
            bail!("slot {slot} out of range");
        }
        Ok(Self {
            name: name.to_string(),
            ip,
            slot,
        })
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Netplay relay - hosts one game room")]
struct Args {
    /// Address to bind the room's TCP and UDP sockets to
    #[arg(long, default_value = "0.0.0.0")]
    bind_ip: IpAddr,

    /// Rooms use the first free port after this one
    #[arg(long, default_value = "45000")]
    base_port: u16,

    /// Number of ports after the base port to try
    #[arg(long, default_value = "10")]
    max_games: u16,

    #[arg(long, default_value = "room")]
    room_name: String,

    #[arg(long, default_value = "")]
    game_name: String,

    #[arg(long, default_value = "")]
    emulator: String,

    /// Target input buffer health reported to clients
    #[arg(long, default_value = "2")]
    buffer_target: u8,

    /// Length of the settings blob (24, or 28 for older clients)
    #[arg(long, default_value = "24", value_parser = parse_settings_size)]
    settings_size: usize,

    /// Admitted player, `NAME=IP:SLOT`; repeat for each player
    #[arg(long = "player", value_name = "NAME=IP:SLOT")]
    players: Vec<PlayerSpec>,

    /// Seconds a player may stay silent before being dropped
    #[arg(long, default_value = "30")]
    liveness_secs: u64,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    /// Path to log file (stderr if not specified)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn parse_settings_size(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(size @ (24 | 28)) => Ok(size),
        Ok(size) => Err(format!("unsupported settings size {size}, expected 24 or 28")),
        Err(e) => Err(e.to_string()),
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_filter()));

    if let Some(path) = &args.log_file {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(log_file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn room_config(args: &Args) -> RoomConfig {
    let liveness = Duration::from_secs(args.liveness_secs.max(1));
    RoomConfig {
        base_port: args.base_port,
        max_games: args.max_games,
        room_name: args.room_name.clone(),
        game_name: args.game_name.clone(),
        emulator: args.emulator.clone(),
        bind_ip: args.bind_ip,
        settings_size: args.settings_size,
        timings: Timings {
            liveness_interval: liveness,
            liveness_grace: liveness,
            ..Default::default()
        },
    }
}

/// Create the room, admit the listed players and serve until the room
/// closes itself or the process is interrupted.
pub async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    info!("Server args: {:?}", args);

    let room = Room::create(room_config(&args))
        .await
        .context("Failed to create room")?;
    room.configure(RoomSettings {
        buffer_target: args.buffer_target,
        ..Default::default()
    })
    .await;
    for player in &args.players {
        room.add_player(player.name.clone(), player.ip, player.slot)
            .await;
    }
    room.start().await;

    // Callers read the port from stdout
    println!("NETPLAY_PORT={}", room.port());

    tokio::select! {
        _ = room.closed() => info!("room closed"),
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for interrupt")?;
            info!("interrupted, closing room");
        }
    }
    room.close().await;
    Ok(())
}
