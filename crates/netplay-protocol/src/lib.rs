//! Wire protocol for the netplay relay
//!
//! Covers the two channels a peer talks to a room over: the TCP control
//! stream (handshake, save files, settings, custom blobs) and the UDP input
//! datagrams. Nothing in here touches a socket; the room crate feeds bytes in
//! and writes the encoded replies out.

pub mod control;
pub mod datagram;
pub mod seq;

pub use control::{
    encode_registration_reply, encode_registration_table, ControlParser, ControlRequest,
    PlayerRegistration, PluginKind, REGISTRATION_TABLE_LEN,
};
pub use datagram::{
    ClientPacket, Cp0Info, FrameInput, InputRequest, KeyInfo, PacketKind, ServerInput,
    CP0_DIGEST_LEN, MAX_DATAGRAM_SIZE, MAX_FRAMES_PER_PACKET,
};
pub use seq::is_greater;

use thiserror::Error;

/// Number of player slots in a room
pub const MAX_PLAYERS: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated {kind} datagram: got {len} bytes, need {need}")]
    Truncated {
        kind: &'static str,
        len: usize,
        need: usize,
    },

    #[error("Unknown packet tag: {0}")]
    UnknownPacket(u8),

    #[error("Slot out of range: {0}")]
    SlotOutOfRange(u8),

    #[error("Unknown control opcode: {0}")]
    UnknownOpcode(u8),

    #[error("Empty datagram")]
    Empty,
}
