//! Per-slot synchronization state
//!
//! Everything the UDP relay reads and writes per frame lives here, behind the
//! session's sync lock. The supervisor takes the same lock for the buffer
//! controller and the liveness sweep, and a control connection takes it to
//! seed a new registration or record a disconnect.

use bytes::Bytes;
use netplay_protocol::{
    is_greater, FrameInput, InputRequest, KeyInfo, ServerInput, MAX_FRAMES_PER_PACKET,
    MAX_PLAYERS,
};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use tracing::{debug, info, warn};

/// Look-ahead window every slot starts with
pub const INITIAL_BUFFER_SIZE: u32 = 3;

/// Frames of input history kept per slot
pub const INPUT_HISTORY: u32 = 5000;

/// Checkpoints kept for desync comparison
pub const DIGEST_CACHE_CAP: usize = 50;

/// Status bit set once a desync has been detected
pub const STATUS_DESYNC: u8 = 1;

/// Status bit marking `slot` as disconnected
pub fn disconnect_bit(slot: usize) -> u8 {
    1 << (slot + 1)
}

/// Outcome of comparing a CP0 digest against the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestCheck {
    /// First report for this checkpoint
    Stored,
    Matched,
    /// Digest differs from the first report; the desync bit is now set
    Mismatch,
    /// Room already flagged, nothing compared
    AlreadyDesynced,
}

/// Bounded checkpoint → digest map, first writer wins
#[derive(Debug)]
struct DigestCache {
    entries: HashMap<u32, Bytes>,
    order: VecDeque<u32>,
    cap: usize,
}

impl DigestCache {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// `None` when the digest was stored as the first report, otherwise
    /// whether it matches the stored one.
    fn check(&mut self, vi_count: u32, digest: &Bytes) -> Option<bool> {
        if let Some(stored) = self.entries.get(&vi_count) {
            return Some(stored == digest);
        }
        self.entries.insert(vi_count, digest.clone());
        self.order.push_back(vi_count);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Reply computed for one input request
#[derive(Debug)]
pub struct Reply {
    /// Packet to send, absent when no frame could be packed
    pub packet: Option<ServerInput>,
    pub count_lag: u32,
    /// Requested frame was ahead of the lead; lag reporting suppressed
    pub ahead_of_lead: bool,
}

/// Result of one liveness sweep
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub alive: Vec<usize>,
    pub dead: Vec<usize>,
}

#[derive(Debug)]
pub struct SyncState {
    peer_addresses: [Option<SocketAddr>; MAX_PLAYERS],
    buffer_size: [u32; MAX_PLAYERS],
    buffer_health: [i32; MAX_PLAYERS],
    count_lag: [u32; MAX_PLAYERS],
    alive: [bool; MAX_PLAYERS],
    pending_input: [u32; MAX_PLAYERS],
    pending_plugin: [u8; MAX_PLAYERS],
    inputs: [HashMap<u32, (u32, u8)>; MAX_PLAYERS],
    lead_count: u32,
    status: u8,
    digests: DigestCache,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            peer_addresses: [None; MAX_PLAYERS],
            buffer_size: [INITIAL_BUFFER_SIZE; MAX_PLAYERS],
            buffer_health: [-1; MAX_PLAYERS],
            count_lag: [0; MAX_PLAYERS],
            alive: [false; MAX_PLAYERS],
            pending_input: [0; MAX_PLAYERS],
            pending_plugin: [0; MAX_PLAYERS],
            inputs: Default::default(),
            lead_count: 0,
            status: 0,
            digests: DigestCache::new(DIGEST_CACHE_CAP),
        }
    }
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u8 {
        self.status
    }

    pub fn lead_count(&self) -> u32 {
        self.lead_count
    }

    pub fn buffer_size(&self, slot: usize) -> u32 {
        self.buffer_size[slot]
    }

    pub fn buffer_health(&self, slot: usize) -> i32 {
        self.buffer_health[slot]
    }

    pub fn count_lag(&self, slot: usize) -> u32 {
        self.count_lag[slot]
    }

    pub fn is_alive(&self, slot: usize) -> bool {
        self.alive[slot]
    }

    pub fn peer_address(&self, slot: usize) -> Option<SocketAddr> {
        self.peer_addresses[slot]
    }

    pub fn slot_for_addr(&self, addr: SocketAddr) -> Option<usize> {
        self.peer_addresses.iter().position(|a| *a == Some(addr))
    }

    /// Seed a freshly registered slot
    pub fn seed_registration(&mut self, slot: usize, plugin: u8) {
        self.pending_plugin[slot] = plugin;
        self.alive[slot] = true;
    }

    /// Record a peer that announced it is leaving
    pub fn mark_disconnected(&mut self, slot: usize) {
        self.alive[slot] = false;
        self.status |= disconnect_bit(slot);
    }

    /// Resolve the input for `frame`, seeding it from the slot's latest
    /// pending input if nothing was recorded yet. Evicts the entry that just
    /// fell out of the history window, and sweeps everything behind it once
    /// the history is full (frames may skip past single evictions).
    pub fn fill_input(&mut self, slot: usize, frame: u32) -> (u32, u8) {
        let history = &mut self.inputs[slot];
        let horizon = frame.wrapping_sub(INPUT_HISTORY);
        history.remove(&horizon);
        if history.len() >= INPUT_HISTORY as usize {
            history.retain(|&count, _| is_greater(count, horizon));
        }
        *history
            .entry(frame)
            .or_insert((self.pending_input[slot], self.pending_plugin[slot]))
    }

    fn has_input(&self, slot: usize, frame: u32) -> bool {
        self.inputs[slot].contains_key(&frame)
    }

    /// Build the reply for `slot`'s input starting at `frame`.
    ///
    /// `requester` is the registered slot that asked, or `None` for the
    /// gratuitous fan-out triggered by a client key packet. Non-spectator,
    /// caught-up requesters get frames up to their look-ahead window; anyone
    /// else gets only frames that are already resolved.
    pub fn build_reply(
        &mut self,
        slot: usize,
        frame: u32,
        spectator: bool,
        requester: Option<usize>,
    ) -> Reply {
        let ahead_of_lead = is_greater(frame, self.lead_count);
        let count_lag = if ahead_of_lead {
            0
        } else {
            self.lead_count.wrapping_sub(frame)
        };

        let window_owner = requester.unwrap_or(slot);
        let end = frame.wrapping_add(self.buffer_size[window_owner]);
        let fill_window = !spectator && count_lag == 0;

        let mut frames = Vec::new();
        let mut count = frame;
        while frames.len() < MAX_FRAMES_PER_PACKET
            && ((fill_window && is_greater(end, count)) || self.has_input(slot, count))
        {
            let (input, plugin) = self.fill_input(slot, count);
            frames.push(FrameInput {
                frame: count,
                input,
                plugin,
            });
            count = count.wrapping_add(1);
        }

        let packet = (!frames.is_empty()).then(|| ServerInput {
            gratuitous: requester.is_none(),
            slot: slot as u8,
            status: self.status,
            count_lag: count_lag.min(u32::from(u8::MAX)) as u8,
            frames,
        });

        Reply {
            packet,
            count_lag,
            ahead_of_lead,
        }
    }

    /// Apply a client key packet and return the gratuitous fan-out to every
    /// peer address known so far.
    pub fn record_key_info(
        &mut self,
        from: SocketAddr,
        info: &KeyInfo,
    ) -> Vec<(SocketAddr, ServerInput)> {
        let slot = usize::from(info.slot);
        self.peer_addresses[slot] = Some(from);
        self.pending_input[slot] = info.input;
        self.pending_plugin[slot] = info.plugin;

        let targets: Vec<SocketAddr> = self.peer_addresses.iter().flatten().copied().collect();
        let mut out = Vec::new();
        for addr in targets {
            if let Some(packet) = self.build_reply(slot, info.frame, true, None).packet {
                out.push((addr, packet));
            }
        }
        out
    }

    /// Advance the lead frame for a non-spectator request
    pub fn observe_request(&mut self, req: &InputRequest) {
        if !req.spectator && is_greater(req.frame, self.lead_count) {
            self.lead_count = req.frame;
        }
    }

    /// Answer an input request from the registered slot `requester`
    pub fn answer_request(&mut self, requester: usize, req: &InputRequest) -> Reply {
        let reply = self.build_reply(
            usize::from(req.slot),
            req.frame,
            req.spectator,
            Some(requester),
        );
        if reply.ahead_of_lead && !req.spectator {
            warn!(
                frame = req.frame,
                lead_count = self.lead_count,
                slot = req.slot,
                "bad count lag: requested frame is ahead of lead"
            );
        }
        self.buffer_health[requester] = i32::from(req.buffer_health);
        self.alive[requester] = true;
        self.count_lag[requester] = reply.count_lag;
        reply
    }

    /// Compare a CP0 digest with the first report for its checkpoint
    pub fn check_digest(&mut self, vi_count: u32, digest: &Bytes) -> DigestCheck {
        if self.status & STATUS_DESYNC != 0 {
            return DigestCheck::AlreadyDesynced;
        }
        match self.digests.check(vi_count, digest) {
            None => DigestCheck::Stored,
            Some(true) => DigestCheck::Matched,
            Some(false) => {
                self.status |= STATUS_DESYNC;
                DigestCheck::Mismatch
            }
        }
    }

    /// One step of the buffer-size controller. Lagging peers and peers that
    /// never reported health are left alone.
    pub fn adjust_buffer_sizes(&mut self, target: u8) {
        let target = i32::from(target);
        for slot in 0..MAX_PLAYERS {
            if self.buffer_health[slot] == -1 || self.count_lag[slot] != 0 {
                continue;
            }
            let health = self.buffer_health[slot];
            if health > target && self.buffer_size[slot] > 0 {
                self.buffer_size[slot] -= 1;
                debug!(slot, buffer_size = self.buffer_size[slot], "reducing buffer size");
            } else if health < target {
                self.buffer_size[slot] = self.buffer_size[slot].saturating_add(1);
                debug!(slot, buffer_size = self.buffer_size[slot], "increasing buffer size");
            }
        }
    }

    /// Close one liveness interval. Registered slots that did not prove
    /// liveness get their disconnect bit; every alive flag is reset.
    pub fn sweep_liveness(&mut self, registered: [bool; MAX_PLAYERS]) -> LivenessReport {
        let mut report = LivenessReport::default();
        for slot in 0..MAX_PLAYERS {
            if registered[slot] {
                if self.alive[slot] {
                    info!(
                        slot,
                        buffer_size = self.buffer_size[slot],
                        buffer_health = self.buffer_health[slot],
                        count_lag = self.count_lag[slot],
                        address = ?self.peer_addresses[slot],
                        "player status"
                    );
                    report.alive.push(slot);
                } else {
                    info!(slot, address = ?self.peer_addresses[slot], "player disconnected UDP");
                    self.status |= disconnect_bit(slot);
                    report.dead.push(slot);
                }
            }
            self.alive[slot] = false;
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn request(slot: u8, frame: u32) -> InputRequest {
        InputRequest {
            slot,
            nonce: 0,
            frame,
            spectator: false,
            buffer_health: 2,
        }
    }

    #[test]
    fn test_fill_duplicates_last_pending_input() {
        let mut sync = SyncState::new();
        let info = KeyInfo {
            slot: 1,
            frame: 40,
            input: 0xabcd,
            plugin: 1,
        };
        sync.record_key_info(addr(1), &info);

        assert_eq!(sync.fill_input(1, 900), (0xabcd, 1));
        // already resolved frames keep their value
        sync.pending_input[1] = 0x1111;
        assert_eq!(sync.fill_input(1, 900), (0xabcd, 1));
        assert_eq!(sync.fill_input(1, 901), (0x1111, 1));
    }

    #[test]
    fn test_history_evicted_behind_horizon() {
        let mut sync = SyncState::new();
        sync.fill_input(0, 10);
        sync.fill_input(0, 10 + INPUT_HISTORY);
        assert!(!sync.has_input(0, 10));
        assert!(sync.has_input(0, 10 + INPUT_HISTORY));
    }

    #[test]
    fn test_history_bounded_when_frames_skip() {
        let mut sync = SyncState::new();
        for i in 0..20_000u32 {
            let req = request(0, i * 7);
            sync.observe_request(&req);
            sync.answer_request(0, &req);
            assert!(sync.inputs[0].len() <= INPUT_HISTORY as usize);
        }
        // the most recent window survives the sweep
        assert!(sync.has_input(0, 19_999 * 7));
        assert!(!sync.has_input(0, 0));
    }

    #[test]
    fn test_history_sweep_across_wrap() {
        let mut sync = SyncState::new();
        let start = u32::MAX - 3 * INPUT_HISTORY;
        for i in 0..(3 * INPUT_HISTORY) {
            sync.fill_input(2, start.wrapping_add(i * 3));
        }
        assert!(sync.inputs[2].len() <= INPUT_HISTORY as usize);
        let last = start.wrapping_add((3 * INPUT_HISTORY - 1) * 3);
        assert!(sync.has_input(2, last));
        assert!(!sync.has_input(2, start));
    }

    #[test]
    fn test_caught_up_request_fills_window() {
        let mut sync = SyncState::new();
        let req = request(0, 0);
        sync.observe_request(&req);
        let reply = sync.answer_request(0, &req);

        let packet = reply.packet.expect("frames packed");
        assert!(!packet.gratuitous);
        assert_eq!(
            packet.frames.iter().map(|f| f.frame).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(reply.count_lag, 0);
        assert!(sync.is_alive(0));
        assert_eq!(sync.buffer_health(0), 2);
    }

    #[test]
    fn test_lagging_request_only_gets_resolved_frames() {
        let mut sync = SyncState::new();
        let lead = request(0, 100);
        sync.observe_request(&lead);
        sync.answer_request(0, &lead);

        // slot 1 asks for slot 0's frame 98, which was never resolved
        let reply = sync.answer_request(1, &request(0, 98));
        assert!(reply.packet.is_none());
        assert_eq!(sync.count_lag(1), 2);

        // frame 100 was resolved by the lead request
        let reply = sync.answer_request(1, &request(0, 100));
        let packet = reply.packet.expect("resolved frames");
        assert_eq!(packet.frames[0].frame, 100);
        assert_eq!(packet.count_lag, 0);
    }

    #[test]
    fn test_window_crosses_wrap() {
        let mut sync = SyncState::new();
        sync.lead_count = u32::MAX - 5;
        let req = request(0, u32::MAX - 1);
        sync.observe_request(&req);
        assert_eq!(sync.lead_count(), u32::MAX - 1);

        let packet = sync.answer_request(0, &req).packet.unwrap();
        assert_eq!(
            packet.frames.iter().map(|f| f.frame).collect::<Vec<_>>(),
            vec![u32::MAX - 1, u32::MAX, 0]
        );
    }

    #[test]
    fn test_spectator_does_not_move_lead() {
        let mut sync = SyncState::new();
        let mut req = request(0, 50);
        req.spectator = true;
        sync.observe_request(&req);
        assert_eq!(sync.lead_count(), 0);

        let reply = sync.answer_request(2, &req);
        assert!(reply.ahead_of_lead);
        assert!(reply.packet.is_none());
    }

    #[test]
    fn test_key_info_fans_out_resolved_frames() {
        let mut sync = SyncState::new();
        let req = request(0, 0);
        sync.observe_request(&req);
        sync.answer_request(0, &req);

        sync.record_key_info(
            addr(2),
            &KeyInfo {
                slot: 1,
                frame: 0,
                input: 5,
                plugin: 1,
            },
        );
        let out = sync.record_key_info(
            addr(1),
            &KeyInfo {
                slot: 0,
                frame: 0,
                input: 7,
                plugin: 1,
            },
        );

        assert_eq!(out.len(), 2);
        for (_, packet) in &out {
            assert!(packet.gratuitous);
            assert_eq!(packet.slot, 0);
        }
    }

    #[test]
    fn test_digest_mismatch_sets_desync_once() {
        let mut sync = SyncState::new();
        let a = Bytes::from_static(&[1; 4]);
        let b = Bytes::from_static(&[2; 4]);

        assert_eq!(sync.check_digest(60, &a), DigestCheck::Stored);
        assert_eq!(sync.check_digest(60, &a), DigestCheck::Matched);
        assert_eq!(sync.status() & STATUS_DESYNC, 0);

        assert_eq!(sync.check_digest(60, &b), DigestCheck::Mismatch);
        assert_eq!(sync.status() & STATUS_DESYNC, STATUS_DESYNC);
        assert_eq!(sync.check_digest(60, &a), DigestCheck::AlreadyDesynced);
        assert_eq!(sync.status() & STATUS_DESYNC, STATUS_DESYNC);
    }

    #[test]
    fn test_digest_cache_drops_oldest() {
        let mut sync = SyncState::new();
        let digest = Bytes::from_static(&[9; 4]);
        for vi in 0..=DIGEST_CACHE_CAP as u32 {
            sync.check_digest(vi, &digest);
        }
        assert_eq!(sync.digests.len(), DIGEST_CACHE_CAP);
        // checkpoint 0 was evicted, so a different digest is stored fresh
        assert_eq!(
            sync.check_digest(0, &Bytes::from_static(&[1; 4])),
            DigestCheck::Stored
        );
    }

    #[test]
    fn test_buffer_shrinks_to_zero_and_stays() {
        let mut sync = SyncState::new();
        sync.buffer_health[0] = 5;
        for expected in [2, 1, 0, 0, 0] {
            sync.adjust_buffer_sizes(2);
            assert_eq!(sync.buffer_size(0), expected);
        }
    }

    #[test]
    fn test_buffer_grows_while_starved() {
        let mut sync = SyncState::new();
        sync.buffer_health[1] = 0;
        for tick in 1..=10 {
            sync.adjust_buffer_sizes(2);
            assert_eq!(sync.buffer_size(1), INITIAL_BUFFER_SIZE + tick);
        }
    }

    #[test]
    fn test_buffer_ignores_unreported_and_lagging() {
        let mut sync = SyncState::new();
        sync.buffer_health[1] = 0;
        sync.count_lag[1] = 4;
        sync.adjust_buffer_sizes(2);
        assert_eq!(sync.buffer_size(0), INITIAL_BUFFER_SIZE);
        assert_eq!(sync.buffer_size(1), INITIAL_BUFFER_SIZE);
    }

    #[test]
    fn test_sweep_marks_silent_slots() {
        let mut sync = SyncState::new();
        sync.seed_registration(0, 1);
        let report = sync.sweep_liveness([true, true, false, false]);
        assert_eq!(
            report,
            LivenessReport {
                alive: vec![0],
                dead: vec![1],
            }
        );
        assert_eq!(sync.status(), disconnect_bit(1));
        assert!(!sync.is_alive(0));
    }
}
