//! TCP control channel framing
//!
//! The control stream has no message delimiters. A request starts with a
//! one-byte opcode and its payload shape depends on that opcode, so the
//! parser keeps the pending opcode and any half-read fields between calls.
//! Bytes are appended with [`ControlParser::feed`] in whatever chunks the
//! socket hands out, and [`ControlParser::next_request`] either makes
//! progress or reports that it needs more input.

use crate::{ProtocolError, MAX_PLAYERS};
use bytes::{Buf, Bytes, BytesMut};

pub const SEND_SAVE: u8 = 1;
pub const RECEIVE_SAVE: u8 = 2;
pub const SEND_SETTINGS: u8 = 3;
pub const RECEIVE_SETTINGS: u8 = 4;
pub const REGISTER_PLAYER: u8 = 5;
pub const GET_REGISTRATION: u8 = 6;
pub const DISCONNECT_NOTICE: u8 = 7;
pub const RECEIVE_SAVE_WITH_SIZE: u8 = 8;
pub const CUSTOM_SEND_START: u8 = 64;
pub const CUSTOM_RECEIVE_START: u8 = 128;
/// Number of custom data keys
pub const CUSTOM_KEYS: u8 = 64;

/// Settings blob size used by current clients
pub const DEFAULT_SETTINGS_SIZE: usize = 24;

/// Byte length of the registration table reply
pub const REGISTRATION_TABLE_LEN: usize = MAX_PLAYERS * 6;

const REGISTER_PAYLOAD_LEN: usize = 7;

/// Controller plugin a player registers with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginKind(pub u8);

impl PluginKind {
    pub const NONE: PluginKind = PluginKind(1);
    pub const MEMPAK: PluginKind = PluginKind(2);
}

impl Default for PluginKind {
    fn default() -> Self {
        Self::NONE
    }
}

/// Payload of a REGISTER_PLAYER request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlayerRegistration {
    pub slot: u8,
    pub plugin: PluginKind,
    pub raw: bool,
    pub nonce: u32,
}

/// A fully parsed control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Peer uploads a save file
    SendSave { filename: String, data: Bytes },

    /// Peer asks for a save file, optionally length-prefixed
    ReceiveSave { filename: String, with_size: bool },

    /// Peer uploads the settings blob
    SendSettings(Bytes),

    /// Peer asks for the settings blob
    ReceiveSettings,

    /// Peer claims a slot
    RegisterPlayer(PlayerRegistration),

    /// Peer asks for the registration table
    GetRegistration,

    /// Peer announces it is leaving
    DisconnectNotice { nonce: u32 },

    /// Peer uploads a custom blob
    CustomSend { key: u8, data: Bytes },

    /// Peer asks for a custom blob
    CustomReceive { key: u8 },
}

/// Where the parser is inside the current request
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParseState {
    /// No request pending, next byte is an opcode
    Idle,
    /// Reading a NUL-terminated filename for the given opcode
    Filename { opcode: u8 },
    /// Filename read, waiting for the 4-byte save size
    SaveSize { filename: String },
    /// Waiting for `size` bytes of save data
    SaveBody { filename: String, size: usize },
    Settings,
    Register,
    Disconnect,
    CustomSize { key: u8 },
    CustomBody { key: u8, size: usize },
}

/// Resumable parser for one control connection
#[derive(Debug)]
pub struct ControlParser {
    state: ParseState,
    buffer: BytesMut,
    settings_size: usize,
}

impl Default for ControlParser {
    fn default() -> Self {
        Self::new(DEFAULT_SETTINGS_SIZE)
    }
}

impl ControlParser {
    /// Create a parser expecting settings blobs of `settings_size` bytes
    pub fn new(settings_size: usize) -> Self {
        Self {
            state: ParseState::Idle,
            buffer: BytesMut::with_capacity(1500),
            settings_size,
        }
    }

    /// Append bytes received from the stream
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet consumed by a request
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True when no request is partially parsed
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::Idle
    }

    /// Advance the state machine as far as the buffered bytes allow.
    ///
    /// Returns `Ok(None)` when more input is needed. An unknown opcode is
    /// consumed and reported; the parser is idle again afterwards.
    pub fn next_request(&mut self) -> Result<Option<ControlRequest>, ProtocolError> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::Idle) {
                ParseState::Idle => {
                    if self.buffer.is_empty() {
                        return Ok(None);
                    }
                    let opcode = self.buffer.get_u8();
                    match self.begin(opcode)? {
                        Some(request) => return Ok(Some(request)),
                        None => continue,
                    }
                }
                ParseState::Filename { opcode } => {
                    let Some(nul) = self.buffer.iter().position(|&b| b == 0) else {
                        self.state = ParseState::Filename { opcode };
                        return Ok(None);
                    };
                    let raw = self.buffer.split_to(nul);
                    self.buffer.advance(1);
                    let filename = String::from_utf8_lossy(&raw).into_owned();
                    match opcode {
                        SEND_SAVE => self.state = ParseState::SaveSize { filename },
                        _ => {
                            return Ok(Some(ControlRequest::ReceiveSave {
                                filename,
                                with_size: opcode == RECEIVE_SAVE_WITH_SIZE,
                            }))
                        }
                    }
                }
                ParseState::SaveSize { filename } => {
                    if self.buffer.len() < 4 {
                        self.state = ParseState::SaveSize { filename };
                        return Ok(None);
                    }
                    let size = self.buffer.get_u32() as usize;
                    self.state = ParseState::SaveBody { filename, size };
                }
                ParseState::SaveBody { filename, size } => {
                    if self.buffer.len() < size {
                        self.state = ParseState::SaveBody { filename, size };
                        return Ok(None);
                    }
                    let data = self.buffer.split_to(size).freeze();
                    return Ok(Some(ControlRequest::SendSave { filename, data }));
                }
                ParseState::Settings => {
                    if self.buffer.len() < self.settings_size {
                        self.state = ParseState::Settings;
                        return Ok(None);
                    }
                    let data = self.buffer.split_to(self.settings_size).freeze();
                    return Ok(Some(ControlRequest::SendSettings(data)));
                }
                ParseState::Register => {
                    if self.buffer.len() < REGISTER_PAYLOAD_LEN {
                        self.state = ParseState::Register;
                        return Ok(None);
                    }
                    let slot = self.buffer.get_u8();
                    let plugin = PluginKind(self.buffer.get_u8());
                    let raw = self.buffer.get_u8() != 0;
                    let nonce = self.buffer.get_u32();
                    return Ok(Some(ControlRequest::RegisterPlayer(PlayerRegistration {
                        slot,
                        plugin,
                        raw,
                        nonce,
                    })));
                }
                ParseState::Disconnect => {
                    if self.buffer.len() < 4 {
                        self.state = ParseState::Disconnect;
                        return Ok(None);
                    }
                    let nonce = self.buffer.get_u32();
                    return Ok(Some(ControlRequest::DisconnectNotice { nonce }));
                }
                ParseState::CustomSize { key } => {
                    if self.buffer.len() < 4 {
                        self.state = ParseState::CustomSize { key };
                        return Ok(None);
                    }
                    let size = self.buffer.get_u32() as usize;
                    self.state = ParseState::CustomBody { key, size };
                }
                ParseState::CustomBody { key, size } => {
                    if self.buffer.len() < size {
                        self.state = ParseState::CustomBody { key, size };
                        return Ok(None);
                    }
                    let data = self.buffer.split_to(size).freeze();
                    return Ok(Some(ControlRequest::CustomSend { key, data }));
                }
            }
        }
    }

    /// Enter the state for a freshly read opcode. Requests without a payload
    /// complete immediately.
    fn begin(&mut self, opcode: u8) -> Result<Option<ControlRequest>, ProtocolError> {
        match opcode {
            SEND_SAVE | RECEIVE_SAVE | RECEIVE_SAVE_WITH_SIZE => {
                self.state = ParseState::Filename { opcode };
                Ok(None)
            }
            SEND_SETTINGS => {
                self.state = ParseState::Settings;
                Ok(None)
            }
            RECEIVE_SETTINGS => Ok(Some(ControlRequest::ReceiveSettings)),
            REGISTER_PLAYER => {
                self.state = ParseState::Register;
                Ok(None)
            }
            GET_REGISTRATION => Ok(Some(ControlRequest::GetRegistration)),
            DISCONNECT_NOTICE => {
                self.state = ParseState::Disconnect;
                Ok(None)
            }
            op if (CUSTOM_SEND_START..CUSTOM_RECEIVE_START).contains(&op) => {
                self.state = ParseState::CustomSize {
                    key: op - CUSTOM_SEND_START,
                };
                Ok(None)
            }
            op if (CUSTOM_RECEIVE_START..CUSTOM_RECEIVE_START + CUSTOM_KEYS).contains(&op) => {
                Ok(Some(ControlRequest::CustomReceive {
                    key: op - CUSTOM_RECEIVE_START,
                }))
            }
            op => Err(ProtocolError::UnknownOpcode(op)),
        }
    }
}

/// Two-byte reply to REGISTER_PLAYER: accepted flag, then the buffer target
pub fn encode_registration_reply(accepted: bool, buffer_target: u8) -> [u8; 2] {
    [u8::from(accepted), buffer_target]
}

/// Fixed 24-byte registration table. Each slot is a 4-byte nonce, the plugin
/// byte and the raw flag; unregistered slots are six zero bytes.
pub fn encode_registration_table(
    slots: &[Option<PlayerRegistration>; MAX_PLAYERS],
) -> [u8; REGISTRATION_TABLE_LEN] {
    let mut table = [0u8; REGISTRATION_TABLE_LEN];
    for (chunk, slot) in table.chunks_exact_mut(6).zip(slots) {
        if let Some(reg) = slot {
            chunk[..4].copy_from_slice(&reg.nonce.to_be_bytes());
            chunk[4] = reg.plugin.0;
            chunk[5] = u8::from(reg.raw);
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut ControlParser) -> Vec<ControlRequest> {
        let mut out = Vec::new();
        while let Some(req) = parser.next_request().unwrap() {
            out.push(req);
        }
        out
    }

    #[test]
    fn test_send_save_in_one_chunk() {
        let mut parser = ControlParser::default();
        let mut bytes = vec![SEND_SAVE];
        bytes.extend_from_slice(b"game.st\0");
        bytes.extend_from_slice(&3u32.to_be_bytes());
        bytes.extend_from_slice(&[9, 8, 7]);
        parser.feed(&bytes);

        assert_eq!(
            parse_all(&mut parser),
            vec![ControlRequest::SendSave {
                filename: "game.st".into(),
                data: Bytes::from_static(&[9, 8, 7]),
            }]
        );
        assert!(parser.is_idle());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn test_register_byte_at_a_time() {
        let mut parser = ControlParser::default();
        let bytes = [REGISTER_PLAYER, 1, 2, 1, 0xde, 0xad, 0xbe, 0xef];
        for (i, b) in bytes.iter().enumerate() {
            parser.feed(&[*b]);
            let req = parser.next_request().unwrap();
            if i + 1 < bytes.len() {
                assert!(req.is_none(), "completed early at byte {i}");
            } else {
                assert_eq!(
                    req,
                    Some(ControlRequest::RegisterPlayer(PlayerRegistration {
                        slot: 1,
                        plugin: PluginKind::MEMPAK,
                        raw: true,
                        nonce: 0xdead_beef,
                    }))
                );
            }
        }
    }

    #[test]
    fn test_receive_save_variants() {
        let mut parser = ControlParser::default();
        parser.feed(&[RECEIVE_SAVE]);
        parser.feed(b"a\0");
        parser.feed(&[RECEIVE_SAVE_WITH_SIZE]);
        parser.feed(b"b\0");

        assert_eq!(
            parse_all(&mut parser),
            vec![
                ControlRequest::ReceiveSave {
                    filename: "a".into(),
                    with_size: false
                },
                ControlRequest::ReceiveSave {
                    filename: "b".into(),
                    with_size: true
                },
            ]
        );
    }

    #[test]
    fn test_settings_respects_configured_size() {
        let mut parser = ControlParser::new(28);
        parser.feed(&[SEND_SETTINGS]);
        parser.feed(&[5u8; 24]);
        assert_eq!(parser.next_request().unwrap(), None);
        parser.feed(&[5u8; 4]);
        assert_eq!(
            parser.next_request().unwrap(),
            Some(ControlRequest::SendSettings(Bytes::from(vec![5u8; 28])))
        );
    }

    #[test]
    fn test_custom_keys() {
        let mut parser = ControlParser::default();
        parser.feed(&[CUSTOM_SEND_START + 3]);
        parser.feed(&2u32.to_be_bytes());
        parser.feed(&[1, 2]);
        parser.feed(&[CUSTOM_RECEIVE_START + 3]);

        assert_eq!(
            parse_all(&mut parser),
            vec![
                ControlRequest::CustomSend {
                    key: 3,
                    data: Bytes::from_static(&[1, 2]),
                },
                ControlRequest::CustomReceive { key: 3 },
            ]
        );
    }

    #[test]
    fn test_unknown_opcode_recovers() {
        let mut parser = ControlParser::default();
        parser.feed(&[0x20, GET_REGISTRATION]);
        assert_eq!(
            parser.next_request(),
            Err(ProtocolError::UnknownOpcode(0x20))
        );
        assert_eq!(
            parser.next_request().unwrap(),
            Some(ControlRequest::GetRegistration)
        );
    }

    #[test]
    fn test_registration_table_layout() {
        let mut slots = [None; MAX_PLAYERS];
        slots[1] = Some(PlayerRegistration {
            slot: 1,
            plugin: PluginKind::NONE,
            raw: false,
            nonce: 0x0102_0304,
        });
        let table = encode_registration_table(&slots);
        assert_eq!(table.len(), 24);
        assert_eq!(&table[..6], &[0; 6]);
        assert_eq!(&table[6..12], &[1, 2, 3, 4, 1, 0]);
        assert_eq!(&table[12..], &[0; 12]);
    }
}
