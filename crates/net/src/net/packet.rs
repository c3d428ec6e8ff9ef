use serde::{Deserialize, Serialize};

use crate::wire::{WireError, WireReader, WireWriter};

pub const MAX_PACKET_SIZE: usize = 1200;
pub const HEADER_SIZE: usize = 3;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;
pub const DEFAULT_PORT: u16 = 27015;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketKind {
    Syn = 0,
    SynAck = 1,
    Ack = 2,
    Alive = 3,
    Close = 4,
    Ban = 5,
    Unreliable = 6,
    Reliable = 7,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Syn),
            1 => Ok(Self::SynAck),
            2 => Ok(Self::Ack),
            3 => Ok(Self::Alive),
            4 => Ok(Self::Close),
            5 => Ok(Self::Ban),
            6 => Ok(Self::Unreliable),
            7 => Ok(Self::Reliable),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub sequence: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketType {
    Syn,
    /// Answers the Syn carrying `syn_sequence`.
    SynAck { syn_sequence: u16 },
    /// The header sequence is the one acknowledged; bit `i` of `bitfield`
    /// also acknowledges `sequence - (i + 1)`.
    Ack { bitfield: u32 },
    Alive,
    Close,
    Ban,
    Unreliable(Vec<u8>),
    Reliable(Vec<u8>),
}

impl PacketType {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Syn => PacketKind::Syn,
            Self::SynAck { .. } => PacketKind::SynAck,
            Self::Ack { .. } => PacketKind::Ack,
            Self::Alive => PacketKind::Alive,
            Self::Close => PacketKind::Close,
            Self::Ban => PacketKind::Ban,
            Self::Unreliable(_) => PacketKind::Unreliable,
            Self::Reliable(_) => PacketKind::Reliable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: u16,
    pub payload: PacketType,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("malformed packet: {0}")]
    Malformed(#[from] WireError),
    #[error("packet of {size} bytes exceeds MTU")]
    TooLarge { size: usize },
}

impl Packet {
    pub fn new(sequence: u16, payload: PacketType) -> Self {
        Self { sequence, payload }
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            kind: self.payload.kind(),
            sequence: self.sequence,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut writer = WireWriter::new(MAX_PACKET_SIZE);
        writer.try_write(&(self.payload.kind() as u8))?;
        writer.try_write(&self.sequence)?;

        match &self.payload {
            PacketType::SynAck { syn_sequence } => writer.try_write(syn_sequence)?,
            PacketType::Ack { bitfield } => writer.try_write(bitfield)?,
            PacketType::Unreliable(data) | PacketType::Reliable(data) => {
                if !writer.write_array(data) {
                    return Err(PacketError::TooLarge {
                        size: HEADER_SIZE + data.len(),
                    });
                }
            }
            PacketType::Syn | PacketType::Alive | PacketType::Close | PacketType::Ban => {}
        }

        Ok(writer.into_bytes())
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge { size: data.len() });
        }

        let mut reader = WireReader::new(data);
        let kind = PacketKind::try_from(reader.try_read::<u8>()?)?;
        let sequence = reader.try_read::<u16>()?;

        let payload = match kind {
            PacketKind::Syn => PacketType::Syn,
            PacketKind::SynAck => PacketType::SynAck {
                syn_sequence: reader.try_read()?,
            },
            PacketKind::Ack => PacketType::Ack {
                bitfield: reader.try_read()?,
            },
            PacketKind::Alive => PacketType::Alive,
            PacketKind::Close => PacketType::Close,
            PacketKind::Ban => PacketType::Ban,
            PacketKind::Unreliable => PacketType::Unreliable(reader.rest().to_vec()),
            PacketKind::Reliable => PacketType::Reliable(reader.rest().to_vec()),
        };

        Ok(Self { sequence, payload })
    }
}
