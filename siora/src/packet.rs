//! The Socket.IO packet model and its textual header codec.
//!
//! Wire form: `<type digit>[<attachments>-][<nsp>,][<id>]<json data>`, with
//! `attachments` present only for the Binary* types and `nsp` omitted for
//! the default `/` namespace.

use itertools::{Itertools, PeekingNext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub inner: PacketData,
    pub ns: String,
}

/// | Type          | ID  | Usage                                             |
/// |---------------|-----|---------------------------------------------------|
/// | CONNECT       | 0   | Attach a namespace.                               |
/// | DISCONNECT    | 1   | Detach a namespace.                               |
/// | EVENT         | 2   | Send data to the other side.                      |
/// | ACK           | 3   | Acknowledge an event.                             |
/// | ERROR         | 4   | Surface an error to the other side.               |
/// | BINARY_EVENT  | 5   | Event with binary attachments.                    |
/// | BINARY_ACK    | 6   | Ack with binary attachments.                      |
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    Connect(Option<Value>),
    Disconnect,
    Event(String, Value, Option<i64>),
    EventAck(Value, i64),
    Error(Value),
    BinaryEvent(String, BinaryPacket, Option<i64>),
    BinaryAck(BinaryPacket, i64),
}

impl PacketData {
    fn index(&self) -> u8 {
        match self {
            PacketData::Connect(_) => 0,
            PacketData::Disconnect => 1,
            PacketData::Event(_, _, _) => 2,
            PacketData::EventAck(_, _) => 3,
            PacketData::Error(_) => 4,
            PacketData::BinaryEvent(_, _, _) => 5,
            PacketData::BinaryAck(_, _) => 6,
        }
    }

    /// Number of binary frames that follow the header frame on the wire.
    pub(crate) fn attachments(&self) -> usize {
        match self {
            PacketData::BinaryEvent(_, bin, _) | PacketData::BinaryAck(bin, _) => bin.bin.len(),
            _ => 0,
        }
    }
}

/// Payload of a Binary* packet: the JSON data with its placeholders removed
/// plus the pool of attached binary buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryPacket {
    pub data: Value,
    pub bin: Vec<Vec<u8>>,
    payload_count: usize,
}

impl BinaryPacket {
    /// An outgoing packet carries its buffers from the start.
    pub fn outgoing(data: Value, bin: Vec<Vec<u8>>) -> Self {
        let payload_count = bin.len();
        Self {
            data,
            bin,
            payload_count,
        }
    }

    /// An incoming packet knows its expected attachment count from the
    /// header and collects buffers as the follow-up frames arrive.
    /// Placeholder markers are stripped from array payloads so event
    /// arguments bind cleanly.
    pub fn incoming(mut data: Value, attachments: usize) -> Self {
        match &mut data {
            Value::Array(args) => args.retain(|v| !is_placeholder(v)),
            val => {
                if is_placeholder(val) {
                    data = Value::Array(vec![]);
                }
            }
        }
        Self {
            data,
            bin: Vec::new(),
            payload_count: attachments,
        }
    }

    pub fn add_payload(&mut self, payload: Vec<u8>) {
        self.bin.push(payload);
    }

    pub fn is_complete(&self) -> bool {
        self.bin.len() >= self.payload_count
    }
}

fn is_placeholder(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|o| o.get("_placeholder"))
        .is_some()
}

impl Packet {
    pub fn connect(ns: impl Into<String>) -> Self {
        Self {
            inner: PacketData::Connect(None),
            ns: ns.into(),
        }
    }

    pub fn disconnect(ns: impl Into<String>) -> Self {
        Self {
            inner: PacketData::Disconnect,
            ns: ns.into(),
        }
    }

    pub fn event(ns: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            inner: PacketData::Event(event.into(), data, None),
            ns: ns.into(),
        }
    }

    pub fn event_with_ack(
        ns: impl Into<String>,
        event: impl Into<String>,
        data: Value,
        id: i64,
    ) -> Self {
        Self {
            inner: PacketData::Event(event.into(), data, Some(id)),
            ns: ns.into(),
        }
    }

    pub fn bin_event(
        ns: impl Into<String>,
        event: impl Into<String>,
        data: Value,
        bin: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            inner: PacketData::BinaryEvent(event.into(), BinaryPacket::outgoing(data, bin), None),
            ns: ns.into(),
        }
    }

    pub fn ack(ns: impl Into<String>, data: Value, id: i64) -> Self {
        Self {
            inner: PacketData::EventAck(data, id),
            ns: ns.into(),
        }
    }

    pub fn error(ns: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            inner: PacketData::Error(json!({ "message": message.into() })),
            ns: ns.into(),
        }
    }
}

/// Prepend the event name to its argument list: `["event", ...args]`.
pub(crate) fn expand_event_array(event: &str, data: Value) -> Value {
    let mut array = match data {
        Value::Array(args) => args,
        Value::Null => vec![],
        other => vec![other],
    };
    array.insert(0, Value::String(event.to_string()));
    Value::Array(array)
}

/// Split `["event", ...args]` back into the event name and argument list.
pub(crate) fn split_event_array(data: Value) -> Result<(String, Value), Error> {
    let args = match data {
        Value::Array(args) => args,
        _ => return Err(Error::InvalidEventName),
    };
    let mut iter = args.into_iter();
    let event = match iter.next() {
        Some(Value::String(event)) => event,
        _ => return Err(Error::InvalidEventName),
    };
    Ok((event, Value::Array(iter.collect())))
}

/// Coerce ack return values into the array the protocol expects.
fn ack_array(data: Value) -> Value {
    match data {
        Value::Array(_) => data,
        Value::Null => Value::Array(vec![]),
        other => Value::Array(vec![other]),
    }
}

impl TryFrom<Packet> for String {
    type Error = Error;

    fn try_from(packet: Packet) -> Result<Self, Error> {
        let mut res = packet.inner.index().to_string();
        let attachments = packet.inner.attachments();
        if matches!(
            packet.inner,
            PacketData::BinaryEvent(_, _, _) | PacketData::BinaryAck(_, _)
        ) {
            res.push_str(&attachments.to_string());
            res.push('-');
        }
        if !packet.ns.is_empty() && packet.ns != "/" {
            res.push_str(&packet.ns);
            res.push(',');
        }

        match packet.inner {
            PacketData::Connect(Some(data)) => res.push_str(&serde_json::to_string(&data)?),
            PacketData::Connect(None) => (),
            PacketData::Disconnect => (),
            PacketData::Event(event, data, ack) => {
                if let Some(ack) = ack {
                    res.push_str(&ack.to_string());
                }
                let expanded = expand_event_array(&event, data);
                res.push_str(&serde_json::to_string(&expanded)?);
            }
            PacketData::EventAck(data, ack) => {
                res.push_str(&ack.to_string());
                res.push_str(&serde_json::to_string(&ack_array(data))?);
            }
            PacketData::Error(data) => res.push_str(&serde_json::to_string(&data)?),
            PacketData::BinaryEvent(event, bin, ack) => {
                if let Some(ack) = ack {
                    res.push_str(&ack.to_string());
                }
                let mut array = match expand_event_array(&event, bin.data) {
                    Value::Array(array) => array,
                    _ => unreachable!(),
                };
                // placeholders for the binary frames that follow
                array.extend((0..bin.bin.len()).map(|i| json!({ "_placeholder": true, "num": i })));
                res.push_str(&serde_json::to_string(&Value::Array(array))?);
            }
            PacketData::BinaryAck(bin, ack) => {
                res.push_str(&ack.to_string());
                let mut array = match ack_array(bin.data) {
                    Value::Array(array) => array,
                    _ => unreachable!(),
                };
                array.extend((0..bin.bin.len()).map(|i| json!({ "_placeholder": true, "num": i })));
                res.push_str(&serde_json::to_string(&Value::Array(array))?);
            }
        };
        Ok(res)
    }
}

fn deserialize_json(data: &str) -> Result<Option<Value>, Error> {
    if data.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::from_str(data)?))
    }
}

fn deserialize_event(data: &str) -> Result<(String, Value), Error> {
    split_event_array(deserialize_json(data)?.ok_or(Error::InvalidEventName)?)
}

impl TryFrom<&str> for Packet {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Error> {
        let mut chars = value.chars();
        let index = chars.next().ok_or(Error::InvalidPacketType)?;
        if !index.is_ascii_digit() {
            return Err(Error::InvalidPacketType);
        }

        let attachments: usize = if index == '5' || index == '6' {
            let count = chars
                .take_while_ref(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .map_err(|_| Error::InvalidPacketType)?;
            chars
                .peeking_next(|c| *c == '-')
                .ok_or(Error::InvalidPacketType)?;
            count
        } else {
            0
        };

        let ns = if chars.clone().next() == Some('/') {
            let ns: String = chars.take_while_ref(|c| *c != ',').collect();
            chars.next(); // the `,` separator
            ns
        } else {
            "/".to_string()
        };

        let ack: Option<i64> = chars
            .take_while_ref(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok();

        let data = chars.as_str();
        let inner = match index {
            '0' => PacketData::Connect(deserialize_json(data)?),
            '1' => PacketData::Disconnect,
            '2' => {
                let (event, payload) = deserialize_event(data)?;
                PacketData::Event(event, payload, ack)
            }
            '3' => {
                let payload = deserialize_json(data)?.ok_or(Error::InvalidPacketType)?;
                PacketData::EventAck(payload, ack.ok_or(Error::InvalidPacketType)?)
            }
            '4' => {
                let payload = deserialize_json(data)?.ok_or(Error::InvalidPacketType)?;
                PacketData::Error(payload)
            }
            '5' => {
                let (event, payload) = deserialize_event(data)?;
                PacketData::BinaryEvent(event, BinaryPacket::incoming(payload, attachments), ack)
            }
            '6' => {
                let payload = deserialize_json(data)?.ok_or(Error::InvalidPacketType)?;
                PacketData::BinaryAck(
                    BinaryPacket::incoming(payload, attachments),
                    ack.ok_or(Error::InvalidPacketType)?,
                )
            }
            _ => return Err(Error::UnknownPacket),
        };

        Ok(Self { inner, ns })
    }
}

impl TryFrom<String> for Packet {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Error> {
        Packet::try_from(value.as_str())
    }
}

/// The `{"_placeholder":true,"num":i}` marker standing in for the i-th
/// binary attachment inside a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placeholder {
    #[serde(rename = "_placeholder")]
    pub placeholder: bool,
    pub num: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Vectors from the socket.io protocol explanation section.
    #[test]
    fn decode_connect() {
        let packet = Packet::try_from("0{\"token\":\"123\"}").unwrap();
        assert_eq!(
            packet,
            Packet {
                ns: "/".to_string(),
                inner: PacketData::Connect(Some(json!({ "token": "123" }))),
            }
        );

        let packet = Packet::try_from("0/admin™,{\"token™\":\"123\"}").unwrap();
        assert_eq!(
            packet,
            Packet {
                ns: "/admin™".to_string(),
                inner: PacketData::Connect(Some(json!({ "token™": "123" }))),
            }
        );
    }

    #[test]
    fn decode_event_with_ack_id() {
        let packet = Packet::try_from("21[\"add\",1,2]").unwrap();
        assert_eq!(packet.ns, "/");
        assert_eq!(
            packet.inner,
            PacketData::Event("add".to_string(), json!([1, 2]), Some(1))
        );
    }

    #[test]
    fn decode_event_with_namespace_and_ack() {
        let packet = Packet::try_from("2/admin,456[\"project:delete\",123]").unwrap();
        assert_eq!(packet.ns, "/admin");
        assert_eq!(
            packet.inner,
            PacketData::Event("project:delete".to_string(), json!([123]), Some(456))
        );
    }

    #[test]
    fn decode_binary_event_header() {
        let packet = Packet::try_from("51-[\"img\",{\"_placeholder\":true,\"num\":0}]").unwrap();
        match packet.inner {
            PacketData::BinaryEvent(event, bin, ack) => {
                assert_eq!(event, "img");
                assert_eq!(bin.data, json!([]));
                assert!(!bin.is_complete());
                assert_eq!(ack, None);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(
            Packet::try_from("9nope"),
            Err(Error::UnknownPacket)
        ));
        assert!(matches!(Packet::try_from(""), Err(Error::InvalidPacketType)));
        assert!(matches!(
            Packet::try_from("2{\"not\":\"an array\"}"),
            Err(Error::InvalidEventName)
        ));
    }

    #[test]
    fn encode_connect_reply() {
        let encoded: String = Packet::connect("/").try_into().unwrap();
        assert_eq!(encoded, "0");
        let encoded: String = Packet::connect("/admin").try_into().unwrap();
        assert_eq!(encoded, "0/admin,");
    }

    #[test]
    fn encode_event() {
        let packet = Packet::event("/", "hello", json!(["world"]));
        let encoded: String = packet.try_into().unwrap();
        assert_eq!(encoded, "2[\"hello\",\"world\"]");
    }

    #[test]
    fn encode_ack_coerces_to_array() {
        let encoded: String = Packet::ack("/", json!([3]), 1).try_into().unwrap();
        assert_eq!(encoded, "31[3]");
        let encoded: String = Packet::ack("/", Value::Null, 2).try_into().unwrap();
        assert_eq!(encoded, "32[]");
        let encoded: String = Packet::ack("/", json!("lone"), 3).try_into().unwrap();
        assert_eq!(encoded, "33[\"lone\"]");
    }

    #[test]
    fn encode_binary_event_appends_placeholders() {
        let packet = Packet::bin_event("/", "img", json!([]), vec![vec![1, 2, 3]]);
        let encoded: String = packet.try_into().unwrap();
        assert_eq!(encoded, "51-[\"img\",{\"_placeholder\":true,\"num\":0}]");
    }

    #[test]
    fn roundtrip_namespaced_event() {
        let packet = Packet::event("/chat", "msg", json!(["hi there"]));
        let encoded: String = packet.clone().try_into().unwrap();
        assert_eq!(encoded, "2/chat,[\"msg\",\"hi there\"]");
        let decoded = Packet::try_from(encoded).unwrap();
        assert_eq!(decoded, packet);
    }
}
