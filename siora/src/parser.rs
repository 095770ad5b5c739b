//! The parser seam: packets in, engine frames out, and the decoder state
//! machine reassembling binary attachments across frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::ParserKind,
    errors::Error,
    packet::{expand_event_array, split_event_array, BinaryPacket, Packet, PacketData},
};

/// One engine-level message: the unit a packet is split into on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Parser {
    kind: ParserKind,
}

impl Parser {
    pub fn new(kind: ParserKind) -> Self {
        Self { kind }
    }

    /// Encode a packet into the ordered frames to ship: a header frame
    /// followed by one binary frame per attachment for the default parser, a
    /// single binary frame for msgpack.
    pub fn encode(&self, packet: Packet) -> Result<Vec<Frame>, Error> {
        match self.kind {
            ParserKind::Default => {
                let bin = match &packet.inner {
                    PacketData::BinaryEvent(_, bin, _) | PacketData::BinaryAck(bin, _) => {
                        bin.bin.clone()
                    }
                    _ => vec![],
                };
                let header: String = packet.try_into()?;
                let mut frames = Vec::with_capacity(1 + bin.len());
                frames.push(Frame::Text(header));
                frames.extend(bin.into_iter().map(Frame::Binary));
                Ok(frames)
            }
            ParserKind::MsgPack => {
                let repr = MsgPackPacket::try_from(packet)?;
                Ok(vec![Frame::Binary(rmp_serde::to_vec_named(&repr)?)])
            }
        }
    }

    pub fn decoder(&self) -> Decoder {
        Decoder {
            kind: self.kind,
            partial: None,
        }
    }
}

/// Reassembles packets from a sequence of engine frames.
///
/// A text frame begins a new packet; a Binary* header puts the decoder in an
/// awaiting-binary state expecting exactly `attachments` binary frames, and
/// the packet is yielded only once the last one has been attached. A binary
/// frame outside that state is an error.
#[derive(Debug, Default)]
pub struct Decoder {
    kind: ParserKind,
    partial: Option<Packet>,
}

impl Decoder {
    pub fn add(&mut self, frame: Frame) -> Result<Option<Packet>, Error> {
        match frame {
            Frame::Text(text) => {
                if self.partial.take().is_some() {
                    return Err(Error::IncompleteBinaryPacket);
                }
                let packet = Packet::try_from(text)?;
                Ok(self.stage(packet))
            }
            Frame::Binary(data) => {
                let Some(packet) = self.partial.as_mut() else {
                    if self.kind == ParserKind::MsgPack {
                        let repr: MsgPackPacket = rmp_serde::from_slice(&data)?;
                        return Ok(Some(repr.try_into()?));
                    }
                    return Err(Error::UnexpectedBinaryFrame);
                };
                let complete = match &mut packet.inner {
                    PacketData::BinaryEvent(_, bin, _) | PacketData::BinaryAck(bin, _) => {
                        bin.add_payload(data);
                        bin.is_complete()
                    }
                    _ => unreachable!("only binary packets are staged"),
                };
                if complete {
                    Ok(self.partial.take())
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn stage(&mut self, packet: Packet) -> Option<Packet> {
        let complete = match &packet.inner {
            PacketData::BinaryEvent(_, bin, _) | PacketData::BinaryAck(bin, _) => bin.is_complete(),
            _ => true,
        };
        if complete {
            Some(packet)
        } else {
            self.partial = Some(packet);
            None
        }
    }
}

/// Self-describing msgpack rendition of a packet: the whole thing, binary
/// buffers included, in one frame.
#[derive(Debug, Serialize, Deserialize)]
struct MsgPackPacket {
    #[serde(rename = "type")]
    index: u8,
    nsp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    bin: Vec<Vec<u8>>,
}

impl TryFrom<Packet> for MsgPackPacket {
    type Error = Error;

    fn try_from(packet: Packet) -> Result<Self, Error> {
        let index = match &packet.inner {
            PacketData::Connect(_) => 0,
            PacketData::Disconnect => 1,
            PacketData::Event(_, _, _) => 2,
            PacketData::EventAck(_, _) => 3,
            PacketData::Error(_) => 4,
            PacketData::BinaryEvent(_, _, _) => 5,
            PacketData::BinaryAck(_, _) => 6,
        };
        let (id, data, bin) = match packet.inner {
            PacketData::Connect(data) => (None, data.unwrap_or(Value::Null), vec![]),
            PacketData::Disconnect => (None, Value::Null, vec![]),
            PacketData::Event(event, data, id) => (id, expand_event_array(&event, data), vec![]),
            PacketData::EventAck(data, id) => (Some(id), data, vec![]),
            PacketData::Error(data) => (None, data, vec![]),
            PacketData::BinaryEvent(event, bin, id) => {
                (id, expand_event_array(&event, bin.data), bin.bin)
            }
            PacketData::BinaryAck(bin, id) => (Some(id), bin.data, bin.bin),
        };
        Ok(Self {
            index,
            nsp: packet.ns,
            id,
            data,
            bin,
        })
    }
}

impl TryFrom<MsgPackPacket> for Packet {
    type Error = Error;

    fn try_from(repr: MsgPackPacket) -> Result<Self, Error> {
        let inner = match repr.index {
            0 => PacketData::Connect(match repr.data {
                Value::Null => None,
                data => Some(data),
            }),
            1 => PacketData::Disconnect,
            2 => {
                let (event, data) = split_event_array(repr.data)?;
                PacketData::Event(event, data, repr.id)
            }
            3 => PacketData::EventAck(repr.data, repr.id.ok_or(Error::InvalidPacketType)?),
            4 => PacketData::Error(repr.data),
            5 => {
                let (event, data) = split_event_array(repr.data)?;
                let count = repr.bin.len();
                let mut bin = BinaryPacket::incoming(data, count);
                for payload in repr.bin {
                    bin.add_payload(payload);
                }
                PacketData::BinaryEvent(event, bin, repr.id)
            }
            6 => {
                let count = repr.bin.len();
                let mut bin = BinaryPacket::incoming(repr.data, count);
                for payload in repr.bin {
                    bin.add_payload(payload);
                }
                PacketData::BinaryAck(bin, repr.id.ok_or(Error::InvalidPacketType)?)
            }
            _ => return Err(Error::UnknownPacket),
        };
        Ok(Packet {
            inner,
            ns: repr.nsp,
        })
    }
}
