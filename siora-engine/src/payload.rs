//! Batched payload codec for the polling transport.
//!
//! A payload is an ordered batch of packets shipped in a single HTTP
//! round-trip, in one of three wire forms:
//! - textual (XHR): `<length>:<frame>` repeated, length counted in
//!   grapheme clusters;
//! - binary (XHR2): `<0|1><length digits><0xFF><frame>` repeated, length
//!   counted in bytes, text frames carried as UTF-8 and binary frames as a
//!   raw type byte followed by raw octets;
//! - JSONP: the textual form wrapped in `___eio[<index>]("...");`.

use bytes::{BufMut, Bytes, BytesMut};
use unicode_segmentation::UnicodeSegmentation;

use crate::{
    errors::Error,
    packet::{MessageType, Packet, PacketType},
};

const XHR2_FRAME_SEPARATOR: u8 = 0xFF;

/// An ordered batch of packets plus the wire form it travels in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub packets: Vec<Packet>,
    pub xhr2: bool,
}

impl Payload {
    pub fn new(packets: Vec<Packet>, xhr2: bool) -> Self {
        Self { packets, xhr2 }
    }

    pub fn encode(&self) -> Result<Bytes, Error> {
        if self.xhr2 {
            encode_xhr2(&self.packets)
        } else {
            Ok(Bytes::from(encode_xhr(&self.packets)?))
        }
    }

    /// Decode a payload body, yielding packets lazily until the source is
    /// exhausted or a frame fails to parse.
    pub fn decode(data: &[u8], xhr2: bool) -> PayloadDecoder<'_> {
        if xhr2 {
            PayloadDecoder::Xhr2(Xhr2Decoder { rest: data })
        } else {
            PayloadDecoder::Xhr(XhrDecoder {
                rest: std::str::from_utf8(data),
            })
        }
    }
}

pub fn encode_xhr(packets: &[Packet]) -> Result<String, Error> {
    let mut out = String::new();
    for packet in packets {
        let frame = packet.encode_text()?;
        let len = frame.graphemes(true).count();
        out.push_str(&len.to_string());
        out.push(':');
        out.push_str(&frame);
    }
    Ok(out)
}

pub fn encode_xhr2(packets: &[Packet]) -> Result<Bytes, Error> {
    let mut out = BytesMut::new();
    for packet in packets {
        match packet.msg_type {
            MessageType::Text => {
                let frame = packet.encode_text()?;
                out.put_u8(0);
                put_length_digits(&mut out, frame.len());
                out.put_u8(XHR2_FRAME_SEPARATOR);
                out.put_slice(frame.as_bytes());
            }
            MessageType::Binary => {
                out.put_u8(1);
                put_length_digits(&mut out, 1 + packet.data.len());
                out.put_u8(XHR2_FRAME_SEPARATOR);
                out.put_u8(packet.packet_type.digit());
                out.put_slice(&packet.data);
            }
        }
    }
    Ok(out.freeze())
}

/// Wrap the textual encoding in a JSONP callback invocation.
///
/// The payload is escaped through its JSON string-literal encoding rather
/// than interpolated raw, so a payload containing quotes or script cannot
/// break out of the callback argument.
pub fn encode_jsonp(index: u32, packets: &[Packet]) -> Result<String, Error> {
    let body = serde_json::to_string(&encode_xhr(packets)?)?;
    Ok(format!("___eio[{index}]({body});"))
}

fn put_length_digits(out: &mut BytesMut, len: usize) {
    for digit in len.to_string().bytes() {
        out.put_u8(digit - b'0');
    }
}

pub enum PayloadDecoder<'a> {
    Xhr(XhrDecoder<'a>),
    Xhr2(Xhr2Decoder<'a>),
}

impl Iterator for PayloadDecoder<'_> {
    type Item = Result<Packet, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            PayloadDecoder::Xhr(inner) => inner.next(),
            PayloadDecoder::Xhr2(inner) => inner.next(),
        }
    }
}

pub struct XhrDecoder<'a> {
    rest: Result<&'a str, std::str::Utf8Error>,
}

impl<'a> Iterator for XhrDecoder<'a> {
    type Item = Result<Packet, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = match self.rest {
            Ok(rest) => rest,
            Err(e) => {
                self.rest = Ok("");
                return Some(Err(e.into()));
            }
        };
        if rest.is_empty() {
            return None;
        }
        self.rest = Ok("");

        let colon = match memchr::memchr(b':', rest.as_bytes()) {
            Some(i) => i,
            None => return Some(Err(Error::InvalidPacketLength)),
        };
        let len: usize = match rest[..colon].parse() {
            Ok(len) => len,
            Err(_) => return Some(Err(Error::InvalidPacketLength)),
        };
        let after = &rest[colon + 1..];

        // take `len` grapheme clusters off the front
        let mut taken = 0;
        let mut end = after.len();
        for (idx, _) in after.grapheme_indices(true) {
            if taken == len {
                end = idx;
                break;
            }
            taken += 1;
        }
        if taken < len {
            return Some(Err(Error::PayloadTruncated));
        }

        self.rest = Ok(&after[end..]);
        Some(Packet::decode_text(&after[..end]))
    }
}

pub struct Xhr2Decoder<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Xhr2Decoder<'a> {
    type Item = Result<Packet, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.rest;
        if rest.is_empty() {
            return None;
        }
        self.rest = &[];

        let is_binary = match rest[0] {
            0 => false,
            1 => true,
            _ => return Some(Err(Error::InvalidPacketLength)),
        };

        let sep = match memchr::memchr(XHR2_FRAME_SEPARATOR, &rest[1..]) {
            // a usize length never needs more than 20 digits
            Some(i) if i <= 20 => 1 + i,
            _ => return Some(Err(Error::InvalidPacketLength)),
        };
        let mut len: usize = 0;
        for digit in &rest[1..sep] {
            if *digit > 9 {
                return Some(Err(Error::InvalidPacketLength));
            }
            len = len * 10 + *digit as usize;
        }

        let frame = &rest[sep + 1..];
        if frame.len() < len {
            return Some(Err(Error::PayloadTruncated));
        }
        self.rest = &frame[len..];
        let frame = &frame[..len];

        if is_binary {
            let (digit, data) = match frame.split_first() {
                Some(split) => split,
                None => return Some(Err(Error::InvalidPacketType)),
            };
            let packet_type = match PacketType::from_digit(*digit) {
                Ok(t) => t,
                Err(e) => return Some(Err(e)),
            };
            Some(Ok(Packet::binary(packet_type, Bytes::copy_from_slice(data))))
        } else {
            match std::str::from_utf8(frame) {
                Ok(frame) => Some(Packet::decode_text(frame)),
                Err(e) => Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn msg(data: &str) -> Packet {
        Packet::text(PacketType::Message, data.to_string())
    }

    #[test]
    fn xhr_roundtrip() {
        let packets = vec![msg("hello"), msg("€f"), msg("f")];
        let encoded = encode_xhr(&packets).unwrap();
        assert_eq!(encoded, "6:4hello3:4€f2:4f");
        let decoded: Vec<_> = Payload::decode(encoded.as_bytes(), false)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn xhr_single_message() {
        let encoded = encode_xhr(&[msg("hello")]).unwrap();
        assert_eq!(encoded, "6:4hello");
    }

    #[test]
    fn xhr_binary_as_base64() {
        let packets = vec![Packet::binary(PacketType::Message, vec![1, 2, 3])];
        let encoded = encode_xhr(&packets).unwrap();
        assert_eq!(encoded, "6:b4AQID");
        let decoded: Vec<_> = Payload::decode(encoded.as_bytes(), false)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn xhr_invalid_length() {
        let mut decoder = Payload::decode(b"x:4hi", false);
        assert!(matches!(
            decoder.next(),
            Some(Err(Error::InvalidPacketLength))
        ));
        let mut decoder = Payload::decode(b"4hello", false);
        assert!(matches!(
            decoder.next(),
            Some(Err(Error::InvalidPacketLength))
        ));
    }

    #[test]
    fn xhr_truncated() {
        let mut decoder = Payload::decode(b"10:4hello", false);
        assert!(matches!(decoder.next(), Some(Err(Error::PayloadTruncated))));
    }

    #[test]
    fn xhr2_roundtrip_mixed() {
        let packets = vec![msg("hello"), Packet::binary(PacketType::Message, vec![1, 2, 3, 4])];
        let payload = Payload::new(packets.clone(), true);
        let encoded = payload.encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[
                0, 6, 0xFF, b'4', b'h', b'e', b'l', b'l', b'o', // "4hello"
                1, 5, 0xFF, 4, 1, 2, 3, 4, // raw type byte + data
            ][..]
        );
        let decoded: Vec<_> = Payload::decode(&encoded, true)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn xhr2_multidigit_length() {
        let data = "a".repeat(123);
        let packets = vec![msg(&data)];
        let encoded = encode_xhr2(&packets).unwrap();
        assert_eq!(&encoded[..4], &[0, 1, 2, 4]);
        assert_eq!(encoded[4], 0xFF);
        let decoded: Vec<_> = Payload::decode(&encoded, true)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(decoded, packets);
    }

    #[test]
    fn xhr2_truncated() {
        let mut decoder = Payload::decode(&[0, 9, 0xFF, b'4', b'h', b'i'], true);
        assert!(matches!(decoder.next(), Some(Err(Error::PayloadTruncated))));
    }

    #[test]
    fn xhr2_bad_marker() {
        let mut decoder = Payload::decode(&[7, 2, 0xFF, b'4', b'x'], true);
        assert!(matches!(
            decoder.next(),
            Some(Err(Error::InvalidPacketLength))
        ));
    }

    #[test]
    fn jsonp_wrapping_escapes() {
        let out = encode_jsonp(3, &[msg("he\"llo")]).unwrap();
        assert_eq!(out, "___eio[3](\"7:4he\\\"llo\");");
    }
}
