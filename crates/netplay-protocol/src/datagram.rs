//! UDP input datagrams
//!
//! Layouts (all integers big-endian):
//!
//! ```text
//! KeyInfoClient       [0, slot, frame:4, input:4, plugin]
//! PlayerInputRequest  [2, slot, nonce:4, frame:4, spectator, health]
//! CP0Info             [4, vi:4, digest:128]
//! server reply        [1|3, slot, status, lag, n, (frame:4, input:4, plugin) * n]
//! ```

use crate::{ProtocolError, MAX_PLAYERS};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Datagrams stay under the common unfragmented payload budget
pub const MAX_DATAGRAM_SIZE: usize = 508;

/// Size of the opaque co-processor digest in a CP0Info packet
pub const CP0_DIGEST_LEN: usize = 128;

const REPLY_HEADER_LEN: usize = 5;
const FRAME_ENTRY_LEN: usize = 9;

/// Most frames a server reply can carry
pub const MAX_FRAMES_PER_PACKET: usize = (MAX_DATAGRAM_SIZE - REPLY_HEADER_LEN) / FRAME_ENTRY_LEN;

const KEY_INFO_LEN: usize = 11;
const INPUT_REQUEST_LEN: usize = 12;
const CP0_INFO_LEN: usize = 5 + CP0_DIGEST_LEN;

/// Packet tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    KeyInfoClient = 0,
    KeyInfoServer = 1,
    PlayerInputRequest = 2,
    KeyInfoServerGratuitous = 3,
    Cp0Info = 4,
}

impl TryFrom<u8> for PacketKind {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::KeyInfoClient),
            1 => Ok(Self::KeyInfoServer),
            2 => Ok(Self::PlayerInputRequest),
            3 => Ok(Self::KeyInfoServerGratuitous),
            4 => Ok(Self::Cp0Info),
            other => Err(ProtocolError::UnknownPacket(other)),
        }
    }
}

/// Unsolicited input from a peer for one of its frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub slot: u8,
    pub frame: u32,
    pub input: u32,
    pub plugin: u8,
}

/// A peer asking for a slot's input starting at `frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputRequest {
    /// Slot whose input is wanted
    pub slot: u8,
    /// Registration nonce of the requester
    pub nonce: u32,
    pub frame: u32,
    pub spectator: bool,
    /// Requester's local queue depth
    pub buffer_health: u8,
}

/// Periodic state digest used for desync detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cp0Info {
    pub vi_count: u32,
    pub digest: Bytes,
}

/// Datagrams a peer sends to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientPacket {
    KeyInfo(KeyInfo),
    InputRequest(InputRequest),
    Cp0Info(Cp0Info),
}

fn need(kind: &'static str, buf: &[u8], need: usize) -> Result<(), ProtocolError> {
    if buf.len() < need {
        return Err(ProtocolError::Truncated {
            kind,
            len: buf.len(),
            need,
        });
    }
    Ok(())
}

fn slot(byte: u8) -> Result<u8, ProtocolError> {
    if usize::from(byte) >= MAX_PLAYERS {
        return Err(ProtocolError::SlotOutOfRange(byte));
    }
    Ok(byte)
}

impl ClientPacket {
    /// Decode a datagram received from a peer. Trailing bytes are ignored.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        let Some(&tag) = datagram.first() else {
            return Err(ProtocolError::Empty);
        };
        match PacketKind::try_from(tag)? {
            PacketKind::KeyInfoClient => {
                need("KeyInfoClient", datagram, KEY_INFO_LEN)?;
                let mut buf = &datagram[1..];
                Ok(Self::KeyInfo(KeyInfo {
                    slot: slot(buf.get_u8())?,
                    frame: buf.get_u32(),
                    input: buf.get_u32(),
                    plugin: buf.get_u8(),
                }))
            }
            PacketKind::PlayerInputRequest => {
                need("PlayerInputRequest", datagram, INPUT_REQUEST_LEN)?;
                let mut buf = &datagram[1..];
                Ok(Self::InputRequest(InputRequest {
                    slot: slot(buf.get_u8())?,
                    nonce: buf.get_u32(),
                    frame: buf.get_u32(),
                    spectator: buf.get_u8() != 0,
                    buffer_health: buf.get_u8(),
                }))
            }
            PacketKind::Cp0Info => {
                need("CP0Info", datagram, CP0_INFO_LEN)?;
                let mut buf = &datagram[1..];
                let vi_count = buf.get_u32();
                Ok(Self::Cp0Info(Cp0Info {
                    vi_count,
                    digest: Bytes::copy_from_slice(&buf[..CP0_DIGEST_LEN]),
                }))
            }
            server @ (PacketKind::KeyInfoServer | PacketKind::KeyInfoServerGratuitous) => {
                Err(ProtocolError::UnknownPacket(server as u8))
            }
        }
    }

    /// Encode as a peer would. Used by test clients.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::KeyInfo(info) => {
                buf.put_u8(PacketKind::KeyInfoClient as u8);
                buf.put_u8(info.slot);
                buf.put_u32(info.frame);
                buf.put_u32(info.input);
                buf.put_u8(info.plugin);
            }
            Self::InputRequest(req) => {
                buf.put_u8(PacketKind::PlayerInputRequest as u8);
                buf.put_u8(req.slot);
                buf.put_u32(req.nonce);
                buf.put_u32(req.frame);
                buf.put_u8(u8::from(req.spectator));
                buf.put_u8(req.buffer_health);
            }
            Self::Cp0Info(info) => {
                buf.put_u8(PacketKind::Cp0Info as u8);
                buf.put_u32(info.vi_count);
                let mut digest = [0u8; CP0_DIGEST_LEN];
                let n = info.digest.len().min(CP0_DIGEST_LEN);
                digest[..n].copy_from_slice(&info.digest[..n]);
                buf.put_slice(&digest);
            }
        }
    }
}

/// Input resolved for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInput {
    pub frame: u32,
    pub input: u32,
    pub plugin: u8,
}

/// Server reply carrying consecutive frames of one slot's input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInput {
    /// Set when the reply was not requested; receivers ignore `count_lag`
    pub gratuitous: bool,
    pub slot: u8,
    pub status: u8,
    pub count_lag: u8,
    pub frames: Vec<FrameInput>,
}

impl ServerInput {
    pub fn encode(&self, buf: &mut BytesMut) {
        let kind = if self.gratuitous {
            PacketKind::KeyInfoServerGratuitous
        } else {
            PacketKind::KeyInfoServer
        };
        let frames = &self.frames[..self.frames.len().min(MAX_FRAMES_PER_PACKET)];
        buf.reserve(REPLY_HEADER_LEN + frames.len() * FRAME_ENTRY_LEN);
        buf.put_u8(kind as u8);
        buf.put_u8(self.slot);
        buf.put_u8(self.status);
        buf.put_u8(self.count_lag);
        buf.put_u8(frames.len() as u8);
        for f in frames {
            buf.put_u32(f.frame);
            buf.put_u32(f.input);
            buf.put_u8(f.plugin);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a server reply. Used by test clients.
    pub fn decode(datagram: &[u8]) -> Result<Self, ProtocolError> {
        need("server input", datagram, REPLY_HEADER_LEN)?;
        let mut buf = datagram;
        let gratuitous = match PacketKind::try_from(buf.get_u8())? {
            PacketKind::KeyInfoServer => false,
            PacketKind::KeyInfoServerGratuitous => true,
            other => return Err(ProtocolError::UnknownPacket(other as u8)),
        };
        let slot = buf.get_u8();
        let status = buf.get_u8();
        let count_lag = buf.get_u8();
        let count = usize::from(buf.get_u8());
        need(
            "server input",
            datagram,
            REPLY_HEADER_LEN + count * FRAME_ENTRY_LEN,
        )?;
        let frames = (0..count)
            .map(|_| FrameInput {
                frame: buf.get_u32(),
                input: buf.get_u32(),
                plugin: buf.get_u8(),
            })
            .collect();
        Ok(Self {
            gratuitous,
            slot,
            status,
            count_lag,
            frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_input_request() {
        let datagram = [2, 1, 0, 0, 0, 7, 0, 0, 1, 0, 0, 4];
        let packet = ClientPacket::decode(&datagram).unwrap();
        assert_eq!(
            packet,
            ClientPacket::InputRequest(InputRequest {
                slot: 1,
                nonce: 7,
                frame: 256,
                spectator: false,
                buffer_health: 4,
            })
        );
    }

    #[test]
    fn test_decode_rejects_short_and_bad_slot() {
        assert!(matches!(
            ClientPacket::decode(&[0, 1, 2]),
            Err(ProtocolError::Truncated { need: 11, .. })
        ));
        assert_eq!(
            ClientPacket::decode(&[0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(ProtocolError::SlotOutOfRange(9))
        );
        assert_eq!(ClientPacket::decode(&[]), Err(ProtocolError::Empty));
        assert_eq!(
            ClientPacket::decode(&[1, 0, 0, 0, 0]),
            Err(ProtocolError::UnknownPacket(1))
        );
    }

    #[test]
    fn test_cp0_digest_extracted() {
        let mut buf = BytesMut::new();
        ClientPacket::Cp0Info(Cp0Info {
            vi_count: 600,
            digest: Bytes::from(vec![0xab; CP0_DIGEST_LEN]),
        })
        .encode(&mut buf);
        assert_eq!(buf.len(), 133);
        match ClientPacket::decode(&buf).unwrap() {
            ClientPacket::Cp0Info(info) => {
                assert_eq!(info.vi_count, 600);
                assert_eq!(info.digest.len(), CP0_DIGEST_LEN);
            }
            other => panic!("Wrong packet: {other:?}"),
        }
    }

    #[test]
    fn test_reply_header_and_capacity() {
        assert_eq!(MAX_FRAMES_PER_PACKET, 55);

        let reply = ServerInput {
            gratuitous: true,
            slot: 2,
            status: 0b10,
            count_lag: 0,
            frames: vec![FrameInput {
                frame: 10,
                input: 0x8000_0001,
                plugin: 1,
            }],
        };
        let bytes = reply.to_bytes();
        assert_eq!(&bytes[..5], &[3, 2, 0b10, 0, 1]);
        assert_eq!(bytes.len(), 14);
        assert_eq!(ServerInput::decode(&bytes).unwrap(), reply);
    }

    #[test]
    fn test_full_reply_fits_datagram() {
        let frames = (0..MAX_FRAMES_PER_PACKET as u32)
            .map(|frame| FrameInput {
                frame,
                input: 0,
                plugin: 0,
            })
            .collect();
        let reply = ServerInput {
            gratuitous: false,
            slot: 0,
            status: 0,
            count_lag: 0,
            frames,
        };
        assert!(reply.to_bytes().len() <= MAX_DATAGRAM_SIZE);
    }
}
