//! The bit-exact frame format.
//!
//! Every message is a 16-byte little-endian header followed by a type-tagged
//! payload, all of it fitting one transport frame. There is no fragmentation
//! or reassembly; senders must keep payloads under [`MAX_PAYLOAD`].
//!
//! ```text
//! offset  field
//! 0..4    magic          0x414E4D31 ("ANM1"), doubles as protocol version
//! 4       msg_type       1 heartbeat, 2 command, 3 status, 4 state, 0xFF emergency
//! 5       source_role
//! 6       dest_role      0xFF = broadcast
//! 7       sequence       wraps at 256
//! 8..12   timestamp_ms
//! 12..14  payload_len
//! 14..16  checksum       CRC-16/CCITT-FALSE over header[0..14] + payload
//! ```
//!
//! A frame failing any validation (magic, length, checksum, role, payload
//! shape) is rejected whole; no partial processing.

use heapless::Vec;

use crate::{Role, MAX_BLOCK_NAME, MAX_BLOCK_SIZE};

/// Protocol identifier, "ANM1" on the wire.
pub const MAGIC: u32 = 0x414E_4D31;

/// Largest frame the transport will carry (ESP-NOW leaves us ~250; we keep
/// headroom).
pub const MAX_FRAME: usize = 200;

pub const HEADER_LEN: usize = 16;

pub const MAX_PAYLOAD: usize = MAX_FRAME - HEADER_LEN;

/// Cap on command parameter bytes.
pub const MAX_COMMAND_PARAMS: usize = 64;

pub const MSG_HEARTBEAT: u8 = 1;
pub const MSG_COMMAND: u8 = 2;
pub const MSG_STATUS: u8 = 3;
pub const MSG_STATE: u8 = 4;
pub const MSG_EMERGENCY: u8 = 0xFF;

/// Wire value marking a broadcast destination.
pub const BROADCAST_ROLE: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame shorter than the header")]
    Truncated,
    #[error("bad magic")]
    BadMagic,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("payload length exceeds the transport MTU")]
    PayloadTooLong,
    #[error("frame length disagrees with the declared payload length")]
    LengthMismatch,
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown role byte {0:#04x}")]
    UnknownRole(u8),
    #[error("payload bytes do not match the message type's layout")]
    MalformedPayload,
}

/// CRC-16/CCITT-FALSE, bitwise. `init` is `0xFFFF` for a fresh checksum, or
/// a previous return value to continue over a second slice.
pub fn crc16_ccitt(init: u16, data: &[u8]) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// The checksum of an assembled frame: everything except the checksum field
/// itself.
fn frame_checksum(frame: &[u8]) -> u16 {
    let crc = crc16_ccitt(0xFFFF, &frame[..14]);
    crc16_ccitt(crc, &frame[HEADER_LEN..])
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub node_id: u32,
    pub fw_version: u8,
    pub cfg_version: u8,
    /// Low bits of the sender's scheduler loop counter; a coarse "how alive
    /// is it" signal, not a clock.
    pub loop_count: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub command_id: u8,
    pub priority: u8,
    pub params: Vec<u8, MAX_COMMAND_PARAMS>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub node_status: u8,
    pub battery_pct: u8,
    pub cpu_load: u8,
    /// Temperature in °C + 40, so -40..=215 fits a byte.
    pub temp_offset40: u8,
    pub uptime_sec: u32,
    pub error_count: u16,
    pub component_mask: u16,
}

/// A named shared-state block on the wire: `name_len:u8 | name | data_len:u16
/// | data`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateUpdate {
    pub name: heapless::String<MAX_BLOCK_NAME>,
    pub data: Vec<u8, MAX_BLOCK_SIZE>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Emergency {
    pub code: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Heartbeat(Heartbeat),
    Command(Command),
    Status(StatusReport),
    State(StateUpdate),
    Emergency(Emergency),
}

impl Payload {
    pub fn msg_type(&self) -> u8 {
        match self {
            Payload::Heartbeat(_) => MSG_HEARTBEAT,
            Payload::Command(_) => MSG_COMMAND,
            Payload::Status(_) => MSG_STATUS,
            Payload::State(_) => MSG_STATE,
            Payload::Emergency(_) => MSG_EMERGENCY,
        }
    }

    fn encode(&self, buf: &mut Vec<u8, MAX_FRAME>) -> Result<(), WireError> {
        let push = |buf: &mut Vec<u8, MAX_FRAME>, bytes: &[u8]| {
            buf.extend_from_slice(bytes)
                .map_err(|_| WireError::PayloadTooLong)
        };
        match self {
            Payload::Heartbeat(hb) => {
                push(buf, &hb.node_id.to_le_bytes())?;
                push(buf, &[hb.fw_version, hb.cfg_version])?;
                push(buf, &hb.loop_count.to_le_bytes())?;
            }
            Payload::Command(cmd) => {
                push(buf, &[cmd.command_id, cmd.priority])?;
                push(buf, &(cmd.params.len() as u16).to_le_bytes())?;
                push(buf, &cmd.params)?;
            }
            Payload::Status(st) => {
                push(
                    buf,
                    &[st.node_status, st.battery_pct, st.cpu_load, st.temp_offset40],
                )?;
                push(buf, &st.uptime_sec.to_le_bytes())?;
                push(buf, &st.error_count.to_le_bytes())?;
                push(buf, &st.component_mask.to_le_bytes())?;
            }
            Payload::State(update) => {
                push(buf, &[update.name.len() as u8])?;
                push(buf, update.name.as_bytes())?;
                push(buf, &(update.data.len() as u16).to_le_bytes())?;
                push(buf, &update.data)?;
            }
            Payload::Emergency(e) => {
                push(buf, &[e.code])?;
            }
        }
        Ok(())
    }

    fn decode(msg_type: u8, bytes: &[u8]) -> Result<Payload, WireError> {
        match msg_type {
            MSG_HEARTBEAT => {
                if bytes.len() != 8 {
                    return Err(WireError::MalformedPayload);
                }
                Ok(Payload::Heartbeat(Heartbeat {
                    node_id: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
                    fw_version: bytes[4],
                    cfg_version: bytes[5],
                    loop_count: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
                }))
            }
            MSG_COMMAND => {
                if bytes.len() < 4 {
                    return Err(WireError::MalformedPayload);
                }
                let param_count = u16::from_le_bytes(bytes[2..4].try_into().unwrap()) as usize;
                if bytes.len() != 4 + param_count || param_count > MAX_COMMAND_PARAMS {
                    return Err(WireError::MalformedPayload);
                }
                let mut params = Vec::new();
                params
                    .extend_from_slice(&bytes[4..])
                    .map_err(|_| WireError::MalformedPayload)?;
                Ok(Payload::Command(Command {
                    command_id: bytes[0],
                    priority: bytes[1],
                    params,
                }))
            }
            MSG_STATUS => {
                if bytes.len() != 12 {
                    return Err(WireError::MalformedPayload);
                }
                Ok(Payload::Status(StatusReport {
                    node_status: bytes[0],
                    battery_pct: bytes[1],
                    cpu_load: bytes[2],
                    temp_offset40: bytes[3],
                    uptime_sec: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
                    error_count: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
                    component_mask: u16::from_le_bytes(bytes[10..12].try_into().unwrap()),
                }))
            }
            MSG_STATE => {
                let name_len = *bytes.first().ok_or(WireError::MalformedPayload)? as usize;
                if name_len == 0 || name_len > MAX_BLOCK_NAME || bytes.len() < 1 + name_len + 2 {
                    return Err(WireError::MalformedPayload);
                }
                let name_bytes = &bytes[1..1 + name_len];
                let name = core::str::from_utf8(name_bytes)
                    .map_err(|_| WireError::MalformedPayload)?
                    .try_into()
                    .map_err(|_| WireError::MalformedPayload)?;
                let data_at = 1 + name_len + 2;
                let data_len =
                    u16::from_le_bytes(bytes[1 + name_len..data_at].try_into().unwrap()) as usize;
                if bytes.len() != data_at + data_len || data_len > MAX_BLOCK_SIZE {
                    return Err(WireError::MalformedPayload);
                }
                let mut data = Vec::new();
                data.extend_from_slice(&bytes[data_at..])
                    .map_err(|_| WireError::MalformedPayload)?;
                Ok(Payload::State(StateUpdate { name, data }))
            }
            MSG_EMERGENCY => {
                if bytes.len() != 1 {
                    return Err(WireError::MalformedPayload);
                }
                Ok(Payload::Emergency(Emergency { code: bytes[0] }))
            }
            other => Err(WireError::UnknownType(other)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dest {
    Role(Role),
    Broadcast,
}

impl Dest {
    fn to_wire(self) -> u8 {
        match self {
            Dest::Role(r) => r.to_wire(),
            Dest::Broadcast => BROADCAST_ROLE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub source: Role,
    pub dest: Dest,
    pub seq: u8,
    pub timestamp_ms: u32,
    pub payload: Payload,
}

impl Message {
    /// Assembles the full frame, checksum included.
    pub fn encode(&self) -> Result<Vec<u8, MAX_FRAME>, WireError> {
        let mut buf: Vec<u8, MAX_FRAME> = Vec::new();
        buf.extend_from_slice(&MAGIC.to_le_bytes()).unwrap();
        buf.extend_from_slice(&[
            self.payload.msg_type(),
            self.source.to_wire(),
            self.dest.to_wire(),
            self.seq,
        ])
        .unwrap();
        buf.extend_from_slice(&self.timestamp_ms.to_le_bytes()).unwrap();
        // Payload length and checksum are patched once the payload is in.
        buf.extend_from_slice(&[0; 4]).unwrap();

        self.payload.encode(&mut buf)?;

        let payload_len = (buf.len() - HEADER_LEN) as u16;
        buf[12..14].copy_from_slice(&payload_len.to_le_bytes());
        let crc = frame_checksum(&buf);
        buf[14..16].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Validates and parses one received frame. Any failure drops the whole
    /// frame.
    pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
        if bytes.len() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        if u32::from_le_bytes(bytes[0..4].try_into().unwrap()) != MAGIC {
            return Err(WireError::BadMagic);
        }
        let payload_len = u16::from_le_bytes(bytes[12..14].try_into().unwrap()) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLong);
        }
        if bytes.len() != HEADER_LEN + payload_len {
            return Err(WireError::LengthMismatch);
        }
        let checksum = u16::from_le_bytes(bytes[14..16].try_into().unwrap());
        if frame_checksum(bytes) != checksum {
            return Err(WireError::ChecksumMismatch);
        }

        let msg_type = bytes[4];
        let source = Role::from_wire(bytes[5]).ok_or(WireError::UnknownRole(bytes[5]))?;
        let dest = match bytes[6] {
            BROADCAST_ROLE => Dest::Broadcast,
            other => Dest::Role(Role::from_wire(other).ok_or(WireError::UnknownRole(other))?),
        };

        Ok(Message {
            source,
            dest,
            seq: bytes[7],
            timestamp_ms: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            payload: Payload::decode(msg_type, &bytes[HEADER_LEN..])?,
        })
    }
}
