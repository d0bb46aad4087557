//! JSON-like value tree and the DTMI binary codecs that serialise it.
//!
//! DTMI type grammar (all integers big-endian):
//!
//! ```text
//! value   = 0x01 i64                          integer
//!         | 0x02 u32 byte*                    string (binary safe, length prefixed)
//!         | 0xE0 member* 0x00 0x00 0xEE       object
//!         | 0x0A value*  0x00 0x00 0xEE       array
//! member  = u16 name-byte* value              name is length prefixed
//! ```
//!
//! A v2 payload prefixes the DTMI object with `trackid(u32) | timestamp(u64)`;
//! decoding re-inserts both as the `trackid` and `time` members, and encoding
//! strips them back out into the prefix.

use byteorder::BigEndian;
use bytes::{Bytes, BytesMut};

use crate::bytesio::{BytesReader, BytesWriter};
use crate::define::{MAGIC_HEADER, MAGIC_PACKET, MAGIC_PACKET2};
use crate::errors::{DtscError, DtscErrorValue};

const MARKER_INT: u8 = 0x01;
const MARKER_STR: u8 = 0x02;
const MARKER_OBJECT: u8 = 0xE0;
const MARKER_ARRAY: u8 = 0x0A;
const MARKER_END: [u8; 3] = [0x00, 0x00, 0xEE];

/// An ordered, binary-safe value tree.
///
/// Objects keep insertion order for iteration and encoding, but compare
/// order-insensitively so codec round-trips do not depend on member order.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(Bytes),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
}

impl Value {
    #[must_use]
    pub fn string(s: &str) -> Self {
        Self::Str(Bytes::copy_from_slice(s.as_bytes()))
    }

    #[must_use]
    pub fn object() -> Self {
        Self::Object(Vec::new())
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }

    #[must_use]
    pub fn is_member(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Object(members) => members.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    #[must_use]
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            Self::Array(values) => values.get(index),
            _ => None,
        }
    }

    /// Member access that vivifies: a `Null` value becomes an object, and a
    /// missing member is inserted as `Null` before the reference is returned.
    pub fn member(&mut self, name: &str) -> &mut Value {
        if !self.is_object() {
            *self = Self::object();
        }
        let Self::Object(members) = self else {
            unreachable!()
        };
        if let Some(pos) = members.iter().position(|(k, _)| k == name) {
            &mut members[pos].1
        } else {
            members.push((name.to_string(), Value::Null));
            &mut members.last_mut().unwrap().1
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        *self.member(name) = value;
    }

    pub fn remove_member(&mut self, name: &str) {
        if let Self::Object(members) = self {
            members.retain(|(k, _)| k != name);
        }
    }

    /// Appends to an array, vivifying a `Null` value into an array first.
    pub fn append(&mut self, value: Value) {
        if !matches!(self, Self::Array(_)) {
            *self = Self::Array(Vec::new());
        }
        let Self::Array(values) = self else {
            unreachable!()
        };
        values.push(value);
    }

    /// Drops entries from the front (oldest first) until at most `keep`
    /// remain. Works on arrays and objects.
    pub fn shrink(&mut self, keep: usize) {
        match self {
            Self::Array(values) => {
                while values.len() > keep {
                    values.remove(0);
                }
            }
            Self::Object(members) => {
                while members.len() > keep {
                    members.remove(0);
                }
            }
            _ => {}
        }
    }

    /// Entry count of an array or object; 0 for scalars.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Array(values) => values.len(),
            Self::Object(members) => members.len(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordered object iteration; empty for non-objects.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Value)> {
        let members: &[(String, Value)] = match self {
            Self::Object(members) => members,
            _ => &[],
        };
        members.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Array element iteration; empty for non-arrays.
    pub fn values(&self) -> impl Iterator<Item = &Value> {
        let values: &[Value] = match self {
            Self::Array(values) => values,
            _ => &[],
        };
        values.iter()
    }

    /// Integer interpretation: integers as-is, booleans 0/1, numeric strings
    /// parsed, everything else 0.
    #[must_use]
    pub fn as_int(&self) -> i64 {
        match self {
            Self::Int(v) => *v,
            Self::Bool(v) => i64::from(*v),
            Self::Str(s) => std::str::from_utf8(s)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// Raw string bytes; empty for non-strings.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Str(s) => s,
            _ => &[],
        }
    }

    /// `trackid -> track name` mapping from a metadata value's `tracks`
    /// member.
    #[must_use]
    pub fn track_mapping(&self) -> std::collections::HashMap<i64, String> {
        let mut mapping = std::collections::HashMap::new();
        if let Some(tracks) = self.get("tracks") {
            for (name, track) in tracks.entries() {
                if let Some(trackid) = track.get("trackid") {
                    mapping.insert(trackid.as_int(), name.to_string());
                }
            }
        }
        mapping
    }

    /// Decodes a DTMI v1 payload.
    pub fn from_dtmi(data: &[u8]) -> Result<Value, DtscError> {
        let mut reader = BytesReader::new(BytesMut::from(data));
        decode_value(&mut reader)
    }

    /// Decodes a DTMI v2 payload: `trackid | timestamp | DTMI object`.
    pub fn from_dtmi2(data: &[u8]) -> Result<Value, DtscError> {
        let mut reader = BytesReader::new(BytesMut::from(data));
        let trackid = i64::from(reader.read_u32::<BigEndian>()?);
        let time = reader.read_u64::<BigEndian>()? as i64;
        let mut value = decode_value(&mut reader)?;
        value.set("time", Value::Int(time));
        value.set("trackid", Value::Int(trackid));
        Ok(value)
    }

    /// Encodes this value as DTMI v1.
    pub fn encode_dtmi(&self, writer: &mut BytesWriter) {
        encode_value(self, writer, &[]);
    }

    /// The network-ready frame for this value: `DTP2` framing when the value
    /// carries both `trackid` and `time` members (they move into the binary
    /// prefix), `DTPD` framing otherwise.
    #[must_use]
    pub fn net_packed(&self) -> Bytes {
        let mut body = BytesWriter::new();
        let magic = if self.is_member("trackid") && self.is_member("time") {
            body.write_u32::<BigEndian>(self.get("trackid").map_or(0, Value::as_int) as u32);
            body.write_u64::<BigEndian>(self.get("time").map_or(0, Value::as_int) as u64);
            encode_value(self, &mut body, &["trackid", "time"]);
            MAGIC_PACKET2
        } else {
            encode_value(self, &mut body, &[]);
            MAGIC_PACKET
        };
        frame(magic, &body.freeze())
    }

    /// The network-ready header frame for this value (`DTSC` magic), used for
    /// stream metadata.
    #[must_use]
    pub fn packed_header(&self) -> Bytes {
        let mut body = BytesWriter::new();
        encode_value(self, &mut body, &[]);
        frame(MAGIC_HEADER, &body.freeze())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter().any(|(name, value)| name == k && value == v)
                    })
            }
            _ => false,
        }
    }
}

impl Eq for Value {}

fn frame(magic: &[u8; 4], body: &[u8]) -> Bytes {
    let mut out = BytesWriter::new();
    out.write(magic);
    out.write_u32::<BigEndian>(body.len() as u32);
    out.write(body);
    out.freeze()
}

fn decode_value(reader: &mut BytesReader) -> Result<Value, DtscError> {
    match reader.read_u8().map_err(|_| DtscErrorValue::NotEnoughBytes)? {
        MARKER_INT => Ok(Value::Int(reader.read_u64::<BigEndian>()? as i64)),
        MARKER_STR => {
            let len = reader.read_u32::<BigEndian>()? as usize;
            Ok(Value::Str(reader.read_bytes(len)?.freeze()))
        }
        MARKER_OBJECT => {
            let mut members = Vec::new();
            while !take_end_marker(reader)? {
                let name_len = reader.read_u16::<BigEndian>()? as usize;
                let name = String::from_utf8_lossy(&reader.read_bytes(name_len)?).into_owned();
                members.push((name, decode_value(reader)?));
            }
            Ok(Value::Object(members))
        }
        MARKER_ARRAY => {
            let mut values = Vec::new();
            while !take_end_marker(reader)? {
                values.push(decode_value(reader)?);
            }
            Ok(Value::Array(values))
        }
        other => Err(DtscErrorValue::UnknownMarker(other).into()),
    }
}

fn take_end_marker(reader: &mut BytesReader) -> Result<bool, DtscError> {
    match reader.peek(3) {
        Some(bytes) if bytes == MARKER_END => {
            reader.advance(3)?;
            Ok(true)
        }
        Some(_) => Ok(false),
        None => Err(DtscErrorValue::NotEnoughBytes.into()),
    }
}

fn encode_value(value: &Value, writer: &mut BytesWriter, skip: &[&str]) {
    match value {
        Value::Null => {
            // no DTMI representation; encode as an empty object
            writer.write_u8(MARKER_OBJECT);
            writer.write(&MARKER_END);
        }
        Value::Bool(v) => {
            writer.write_u8(MARKER_INT);
            writer.write_u64::<BigEndian>(u64::from(*v));
        }
        Value::Int(v) => {
            writer.write_u8(MARKER_INT);
            writer.write_u64::<BigEndian>(*v as u64);
        }
        Value::Str(s) => {
            writer.write_u8(MARKER_STR);
            writer.write_u32::<BigEndian>(s.len() as u32);
            writer.write(s);
        }
        Value::Array(values) => {
            writer.write_u8(MARKER_ARRAY);
            for v in values {
                encode_value(v, writer, &[]);
            }
            writer.write(&MARKER_END);
        }
        Value::Object(members) => {
            writer.write_u8(MARKER_OBJECT);
            for (name, v) in members {
                if skip.contains(&name.as_str()) {
                    continue;
                }
                writer.write_u16::<BigEndian>(name.len() as u16);
                writer.write(name.as_bytes());
                encode_value(v, writer, &[]);
            }
            writer.write(&MARKER_END);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Value {
        let mut v = Value::object();
        v.set("trackid", Value::Int(1));
        v.set("time", Value::Int(1000));
        v.set("datatype", Value::string("video"));
        v.set("keyframe", Value::Int(1));
        v.set("data", Value::Str(Bytes::from_static(b"\x00\x01\x02framebytes")));
        v
    }

    #[test]
    fn test_dtmi_v1_round_trip() {
        let mut v = Value::object();
        v.set("lastms", Value::Int(90_000));
        v.member("keytime").append(Value::Int(0));
        v.member("keytime").append(Value::Int(3000));
        let mut tracks = Value::object();
        tracks.member("video_h264").set("trackid", Value::Int(1));
        tracks.member("video_h264").set("type", Value::string("video"));
        v.set("tracks", tracks);

        let mut w = BytesWriter::new();
        v.encode_dtmi(&mut w);
        let decoded = Value::from_dtmi(&w.freeze()).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn test_dtmi_v2_round_trip_moves_prefix_members() {
        let v = sample_packet();
        let packed = v.net_packed();
        assert_eq!(&packed[0..4], b"DTP2");
        let decoded = Value::from_dtmi2(&packed[8..]).unwrap();
        assert_eq!(decoded, v);
        assert_eq!(decoded.get("trackid").unwrap().as_int(), 1);
        assert_eq!(decoded.get("time").unwrap().as_int(), 1000);
    }

    #[test]
    fn test_net_packed_uses_v1_without_track_prefix() {
        let mut v = Value::object();
        v.set("hello", Value::string("world"));
        let packed = v.net_packed();
        assert_eq!(&packed[0..4], b"DTPD");
        assert_eq!(Value::from_dtmi(&packed[8..]).unwrap(), v);
    }

    #[test]
    fn test_member_vivifies_null() {
        let mut v = Value::Null;
        v.member("tracks").set("trackid", Value::Int(7));
        assert!(v.is_object());
        assert_eq!(
            v.get("tracks").and_then(|t| t.get("trackid")).unwrap().as_int(),
            7
        );
    }

    #[test]
    fn test_shrink_drops_oldest() {
        let mut v = Value::Null;
        for i in 0..5 {
            v.append(Value::Int(i));
        }
        v.shrink(2);
        assert_eq!(v.len(), 2);
        assert_eq!(v.get_index(0).unwrap().as_int(), 3);
        assert_eq!(v.get_index(1).unwrap().as_int(), 4);
    }

    #[test]
    fn test_object_equality_ignores_member_order() {
        let mut a = Value::object();
        a.set("x", Value::Int(1));
        a.set("y", Value::Int(2));
        let mut b = Value::object();
        b.set("y", Value::Int(2));
        b.set("x", Value::Int(1));
        assert_eq!(a, b);
        b.set("x", Value::Int(3));
        assert_ne!(a, b);
    }

    #[test]
    fn test_unknown_marker_is_an_error() {
        assert!(Value::from_dtmi(&[0x77]).is_err());
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let v = sample_packet();
        let mut w = BytesWriter::new();
        v.encode_dtmi(&mut w);
        let full = w.freeze();
        assert!(Value::from_dtmi(&full[..full.len() - 4]).is_err());
    }

    #[test]
    fn test_as_int_coercions() {
        assert_eq!(Value::Int(-3).as_int(), -3);
        assert_eq!(Value::Bool(true).as_int(), 1);
        assert_eq!(Value::string("1234").as_int(), 1234);
        assert_eq!(Value::string("junk").as_int(), 0);
        assert_eq!(Value::Null.as_int(), 0);
    }

    #[test]
    fn test_negative_int_round_trip() {
        let mut v = Value::object();
        v.set("n", Value::Int(-42));
        let mut w = BytesWriter::new();
        v.encode_dtmi(&mut w);
        assert_eq!(Value::from_dtmi(&w.freeze()).unwrap(), v);
    }
}
