use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{config::EngineConfig, errors::Error, sid::Sid, transport::TransportType};

/// Whether a packet payload is UTF-8 text or opaque octets.
///
/// The distinction drives the wire encoding: text payloads travel as-is,
/// binary payloads are base64 encoded on textual transports and sent as raw
/// frames on binary-capable ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
}

/// The engine.io packet types with their protocol digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Open = 0,
    Close = 1,
    Ping = 2,
    Pong = 3,
    Message = 4,
    Upgrade = 5,
    Noop = 6,
}

impl PacketType {
    pub(crate) fn from_digit(digit: u8) -> Result<Self, Error> {
        match digit {
            0 => Ok(PacketType::Open),
            1 => Ok(PacketType::Close),
            2 => Ok(PacketType::Ping),
            3 => Ok(PacketType::Pong),
            4 => Ok(PacketType::Message),
            5 => Ok(PacketType::Upgrade),
            6 => Ok(PacketType::Noop),
            _ => Err(Error::InvalidPacketType),
        }
    }

    pub(crate) fn digit(self) -> u8 {
        self as u8
    }
}

/// The lowest-level frame exchanged with a client: a type, a text/binary
/// marker and the payload bytes. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub msg_type: MessageType,
    pub packet_type: PacketType,
    pub data: Bytes,
}

impl Packet {
    /// Build a text packet. `data` must be valid UTF-8.
    pub fn text(packet_type: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            msg_type: MessageType::Text,
            packet_type,
            data: data.into(),
        }
    }

    /// Build a binary packet carrying opaque octets.
    pub fn binary(packet_type: PacketType, data: impl Into<Bytes>) -> Self {
        Self {
            msg_type: MessageType::Binary,
            packet_type,
            data: data.into(),
        }
    }

    pub fn open(open: &OpenPacket) -> Result<Self, Error> {
        Ok(Self::text(PacketType::Open, serde_json::to_vec(open)?))
    }

    pub fn close() -> Self {
        Self::text(PacketType::Close, Bytes::new())
    }

    pub fn ping() -> Self {
        Self::text(PacketType::Ping, Bytes::new())
    }

    /// A pong echoing the payload of the ping it answers.
    pub fn pong_of(ping: &Packet) -> Self {
        Self {
            msg_type: ping.msg_type,
            packet_type: PacketType::Pong,
            data: ping.data.clone(),
        }
    }

    pub fn noop() -> Self {
        Self::text(PacketType::Noop, Bytes::new())
    }

    pub fn is_binary(&self) -> bool {
        self.msg_type == MessageType::Binary
    }

    /// Serialize to the textual frame form: `<type digit><payload>`, or
    /// `b<type digit><base64 payload>` for binary payloads.
    pub fn encode_text(&self) -> Result<String, Error> {
        let digit = (self.packet_type.digit() + b'0') as char;
        let res = match self.msg_type {
            MessageType::Text => {
                let payload = std::str::from_utf8(&self.data)?;
                let mut s = String::with_capacity(1 + payload.len());
                s.push(digit);
                s.push_str(payload);
                s
            }
            MessageType::Binary => {
                let mut s = String::with_capacity(2 + self.data.len() * 4 / 3 + 4);
                s.push('b');
                s.push(digit);
                general_purpose::STANDARD.encode_string(&self.data, &mut s);
                s
            }
        };
        Ok(res)
    }

    /// Deserialize from the textual frame form.
    pub fn decode_text(frame: &str) -> Result<Self, Error> {
        let mut chars = frame.chars();
        match chars.next() {
            Some('b') => {
                let digit = chars.next().ok_or(Error::InvalidPacketType)?;
                let packet_type = digit_type(digit)?;
                let data = general_purpose::STANDARD.decode(chars.as_str())?;
                Ok(Packet::binary(packet_type, data))
            }
            Some(digit) => {
                let packet_type = digit_type(digit)?;
                Ok(Packet::text(
                    packet_type,
                    Bytes::copy_from_slice(chars.as_str().as_bytes()),
                ))
            }
            None => Err(Error::InvalidPacketType),
        }
    }
}

fn digit_type(digit: char) -> Result<PacketType, Error> {
    let digit = digit.to_digit(10).ok_or(Error::InvalidPacketType)?;
    PacketType::from_digit(digit as u8)
}

/// Handshake payload of the `Open` packet answering the first request of a
/// session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpenPacket {
    pub sid: Sid,
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
}

impl OpenPacket {
    /// Polling sessions are always offered the websocket upgrade; websocket
    /// sessions have nowhere further to go.
    pub fn new(transport: TransportType, sid: Sid, config: &EngineConfig) -> Self {
        let upgrades = if transport == TransportType::Polling {
            vec!["websocket".to_string()]
        } else {
            vec![]
        };
        OpenPacket {
            sid,
            upgrades,
            ping_interval: config.ping_interval.as_millis() as u64,
            ping_timeout: config.ping_timeout.as_millis() as u64,
        }
    }
}
