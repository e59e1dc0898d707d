//! Shared state for one room
//!
//! A `Session` is created with the room and shared (`Arc`) by every task the
//! room runs: one per control connection, the UDP relay loop, and the two
//! supervisor loops. Disjoint concerns sit behind their own locks:
//!
//! - registrations: slot claims made over the control channel
//! - sync: per-slot relay state (see `sync.rs`)
//! - roster: players the lobby admitted, used for IP validation
//! - blobs: save files, settings and custom data
//!
//! Locks are only held for a lookup or a small update, never across I/O, and
//! no method holds two of them at once.

use crate::config::{RoomSettings, Timings};
use crate::sync::SyncState;
use bytes::Bytes;
use netplay_protocol::{
    encode_registration_table, PlayerRegistration, PluginKind, MAX_PLAYERS,
    REGISTRATION_TABLE_LEN,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn, Span};

/// A player the lobby admitted to the room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    pub name: String,
    pub ip: IpAddr,
    pub slot: u8,
}

/// Room metadata the lobby displays
#[derive(Debug, Clone, Default)]
pub struct RoomInfo {
    pub room_name: String,
    pub game_name: String,
    pub emulator: String,
    pub password: String,
    pub rom_hash: String,
    pub client_sha: String,
    pub features: HashMap<String, String>,
    pub buffer_target: u8,
}

impl RoomInfo {
    pub fn is_protected(&self) -> bool {
        !self.password.is_empty()
    }
}

/// How a REGISTER_PLAYER request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// New registration stored (plugin kind may have been downgraded)
    Registered(PlayerRegistration),
    /// Same nonce already holds the slot
    AlreadyRegistered,
    /// Slot is held by a different nonce
    Conflict,
    InvalidSlot,
}

impl RegisterOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, Self::Registered(_) | Self::AlreadyRegistered)
    }
}

#[derive(Debug, Default)]
struct Blobs {
    files: HashMap<String, Bytes>,
    settings: Option<Bytes>,
    custom: HashMap<u8, Bytes>,
}

pub struct Session {
    registrations: RwLock<[Option<PlayerRegistration>; MAX_PLAYERS]>,
    sync: Mutex<SyncState>,
    roster: RwLock<HashMap<String, Player>>,
    blobs: RwLock<Blobs>,
    info: RwLock<RoomInfo>,
    started_at: RwLock<Option<Instant>>,
    needs_update_players: AtomicBool,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    settings_size: usize,
    timings: Timings,
    span: Span,
}

impl Session {
    pub fn new(info: RoomInfo, settings_size: usize, timings: Timings, span: Span) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registrations: RwLock::new([None; MAX_PLAYERS]),
            sync: Mutex::new(SyncState::new()),
            roster: RwLock::new(HashMap::new()),
            blobs: RwLock::new(Blobs::default()),
            info: RwLock::new(info),
            started_at: RwLock::new(None),
            needs_update_players: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown,
            settings_size,
            timings,
            span,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn settings_size(&self) -> usize {
        self.settings_size
    }

    /// Per-slot relay state
    pub fn sync(&self) -> &Mutex<SyncState> {
        &self.sync
    }

    // --- registrations ---

    /// Claim a slot for `reg.nonce`. Only slot 0 may use the mempak plugin;
    /// other slots asking for it are stored with the default plugin.
    pub async fn register(&self, mut reg: PlayerRegistration) -> RegisterOutcome {
        let slot = usize::from(reg.slot);
        if slot >= MAX_PLAYERS {
            warn!(slot, nonce = reg.nonce, "registration for invalid slot");
            return RegisterOutcome::InvalidSlot;
        }

        {
            let mut registrations = self.registrations.write().await;
            if let Some(existing) = registrations[slot] {
                if existing.nonce == reg.nonce {
                    warn!(slot, nonce = reg.nonce, "player already registered");
                    return RegisterOutcome::AlreadyRegistered;
                }
                warn!(
                    slot,
                    nonce = reg.nonce,
                    held_by = existing.nonce,
                    "could not register player: slot taken"
                );
                return RegisterOutcome::Conflict;
            }
            if slot > 0 && reg.plugin == PluginKind::MEMPAK {
                reg.plugin = PluginKind::default();
            }
            registrations[slot] = Some(reg);
        }

        self.sync.lock().await.seed_registration(slot, reg.plugin.0);
        info!(
            slot,
            nonce = reg.nonce,
            plugin = reg.plugin.0,
            raw = reg.raw,
            "registered player"
        );
        RegisterOutcome::Registered(reg)
    }

    pub async fn registration(&self, slot: usize) -> Option<PlayerRegistration> {
        self.registrations.read().await.get(slot).copied().flatten()
    }

    pub async fn registrations(&self) -> [Option<PlayerRegistration>; MAX_PLAYERS] {
        *self.registrations.read().await
    }

    pub async fn registered_count(&self) -> usize {
        self.registrations.read().await.iter().flatten().count()
    }

    pub async fn slot_for_nonce(&self, nonce: u32) -> Option<usize> {
        self.registrations
            .read()
            .await
            .iter()
            .position(|r| matches!(r, Some(reg) if reg.nonce == nonce))
    }

    /// Drop the registration in `slot` if it still belongs to `nonce`
    pub async fn unregister(&self, slot: usize, nonce: u32) -> bool {
        let mut registrations = self.registrations.write().await;
        match registrations[slot] {
            Some(reg) if reg.nonce == nonce => {
                registrations[slot] = None;
                true
            }
            _ => false,
        }
    }

    /// Handle a peer's disconnect notice: the slot holding `nonce` is marked
    /// gone, unregistered, and removed from the roster.
    pub async fn disconnect(&self, nonce: u32) -> Option<usize> {
        let slot = self.slot_for_nonce(nonce).await?;
        info!(slot, nonce, "player disconnected TCP");

        self.sync.lock().await.mark_disconnected(slot);
        self.unregister(slot, nonce).await;

        let removed = {
            let mut roster = self.roster.write().await;
            let before = roster.len();
            roster.retain(|_, p| usize::from(p.slot) != slot);
            before - roster.len()
        };
        if removed > 0 {
            self.needs_update_players.store(true, Ordering::SeqCst);
        }
        Some(slot)
    }

    /// The 24-byte registration table, available once every roster player
    /// has registered.
    pub async fn registration_table(&self) -> Option<[u8; REGISTRATION_TABLE_LEN]> {
        let players = self.player_count().await;
        let registrations = self.registrations().await;
        if registrations.iter().flatten().count() != players {
            return None;
        }
        Some(encode_registration_table(&registrations))
    }

    // --- blobs ---

    pub async fn store_file(&self, name: String, data: Bytes) {
        self.blobs.write().await.files.insert(name, data);
    }

    pub async fn file(&self, name: &str) -> Option<Bytes> {
        self.blobs.read().await.files.get(name).cloned()
    }

    pub async fn store_settings(&self, data: Bytes) {
        self.blobs.write().await.settings = Some(data);
    }

    pub async fn settings(&self) -> Option<Bytes> {
        self.blobs.read().await.settings.clone()
    }

    pub async fn store_custom(&self, key: u8, data: Bytes) {
        self.blobs.write().await.custom.insert(key, data);
    }

    pub async fn custom(&self, key: u8) -> Option<Bytes> {
        self.blobs.read().await.custom.get(&key).cloned()
    }

    // --- roster ---

    pub async fn add_player(&self, player: Player) {
        self.roster.write().await.insert(player.name.clone(), player);
        self.needs_update_players.store(true, Ordering::SeqCst);
    }

    pub async fn remove_player(&self, name: &str) -> Option<Player> {
        let removed = self.roster.write().await.remove(name);
        if removed.is_some() {
            self.needs_update_players.store(true, Ordering::SeqCst);
        }
        removed
    }

    pub async fn players(&self) -> Vec<Player> {
        let mut players: Vec<Player> = self.roster.read().await.values().cloned().collect();
        players.sort_by_key(|p| p.slot);
        players
    }

    pub async fn player_count(&self) -> usize {
        self.roster.read().await.len()
    }

    /// True if `ip` belongs to an admitted player
    pub async fn is_known_ip(&self, ip: IpAddr) -> bool {
        let ip = canonical(ip);
        self.roster
            .read()
            .await
            .values()
            .any(|p| canonical(p.ip) == ip)
    }

    /// Returns and clears the roster-changed flag
    pub fn take_needs_update_players(&self) -> bool {
        self.needs_update_players.swap(false, Ordering::SeqCst)
    }

    // --- metadata ---

    pub async fn info(&self) -> RoomInfo {
        self.info.read().await.clone()
    }

    pub async fn apply_settings(&self, settings: RoomSettings) {
        let settings = settings.normalized();
        let mut info = self.info.write().await;
        info.password = settings.password;
        info.rom_hash = settings.rom_hash;
        info.client_sha = settings.client_sha;
        info.features = settings.features;
        info.buffer_target = settings.buffer_target;
    }

    pub async fn buffer_target(&self) -> u8 {
        self.info.read().await.buffer_target
    }

    pub async fn play_time(&self) -> Duration {
        self.started_at
            .read()
            .await
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    // --- lifecycle ---

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn mark_started(&self) {
        *self.started_at.write().await = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);
    }

    /// Stop every task of the room. Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Resolves once the room behind `rx` has shut down
pub async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
