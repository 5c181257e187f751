//! Frame encoding: `(cmd_code, format_string, payload_bytes)`.
//!
//! The format string describes how to read the payload back out: each
//! character is one field.
//!
//! - `L` — an 8-byte unsigned integer (`u64`)
//! - `I` — a 4-byte signed integer (`i32`)
//! - `P` — a length-prefixed byte blob (`u64` length, then the bytes)
//! - `Q` — a size-only field: just a `u64`, no bytes follow (used to declare
//!   an expected reply buffer size without sending data, e.g. CALL_STKOUT)

use aveo_core::{AveoError, Result};

use crate::cmd::CmdCode;

#[derive(Debug, Clone)]
pub enum Field {
    U64(u64),
    I32(i32),
    Bytes(Vec<u8>),
    Size(u64),
}

impl Field {
    fn token(&self) -> char {
        match self {
            Field::U64(_) => 'L',
            Field::I32(_) => 'I',
            Field::Bytes(_) => 'P',
            Field::Size(_) => 'Q',
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Field::U64(v) => Ok(*v),
            _ => Err(AveoError::ProtocolViolation("expected L field")),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self {
            Field::I32(v) => Ok(*v),
            _ => Err(AveoError::ProtocolViolation("expected I field")),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Field::Bytes(b) => Ok(b),
            _ => Err(AveoError::ProtocolViolation("expected P field")),
        }
    }

    pub fn as_size(&self) -> Result<u64> {
        match self {
            Field::Size(v) => Ok(*v),
            _ => Err(AveoError::ProtocolViolation("expected Q field")),
        }
    }
}

/// A decoded or to-be-encoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: CmdCode,
    pub fields: Vec<Field>,
}

impl Frame {
    pub fn new(cmd: CmdCode, fields: Vec<Field>) -> Self {
        Frame { cmd, fields }
    }

    pub fn format(&self) -> String {
        self.fields.iter().map(Field::token).collect()
    }

    /// Serialize to `cmd_code (1 byte) | field count (1 byte) | fields...`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.fields.len() * 8);
        out.push(self.cmd as u8);
        out.push(self.fields.len() as u8);
        for field in &self.fields {
            match field {
                Field::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
                Field::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
                Field::Size(v) => out.extend_from_slice(&v.to_le_bytes()),
                Field::Bytes(b) => {
                    out.extend_from_slice(&(b.len() as u64).to_le_bytes());
                    out.extend_from_slice(b);
                }
            }
        }
        out
    }

    /// Decode a frame whose field shape is known ahead of time from `format`
    /// (same token alphabet as [`Frame::format`]).
    pub fn decode(bytes: &[u8], format: &str) -> Result<Frame> {
        if bytes.len() < 2 {
            return Err(AveoError::ProtocolViolation("frame shorter than header"));
        }
        let cmd = CmdCode::from_u8(bytes[0]).ok_or(AveoError::ProtocolViolation("unknown cmd code"))?;
        let count = bytes[1] as usize;
        if count != format.len() {
            return Err(AveoError::ProtocolViolation("field count does not match format"));
        }
        let mut cursor = 2usize;
        let mut fields = Vec::with_capacity(count);
        for token in format.chars() {
            match token {
                'L' => {
                    let v = read_u64(bytes, &mut cursor)?;
                    fields.push(Field::U64(v));
                }
                'I' => {
                    let raw = read_u64(bytes, &mut cursor)? as u32;
                    fields.push(Field::I32(raw as i32));
                }
                'Q' => {
                    let v = read_u64(bytes, &mut cursor)?;
                    fields.push(Field::Size(v));
                }
                'P' => {
                    let len = read_u64(bytes, &mut cursor)? as usize;
                    let end = cursor.checked_add(len).ok_or(AveoError::ProtocolViolation("P length overflow"))?;
                    let slice = bytes.get(cursor..end).ok_or(AveoError::ProtocolViolation("P truncated"))?;
                    fields.push(Field::Bytes(slice.to_vec()));
                    cursor = end;
                }
                _ => return Err(AveoError::ProtocolViolation("unknown format token")),
            }
        }
        Ok(Frame { cmd, fields })
    }
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let end = cursor.checked_add(8).ok_or(AveoError::ProtocolViolation("field overflow"))?;
    let slice = bytes.get(*cursor..end).ok_or(AveoError::ProtocolViolation("frame truncated"))?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(slice);
    *cursor = end;
    Ok(u64::from_le_bytes(arr))
}

// `I` fields are carried in the same 8-byte slot as `L`/`Q` on the wire (the
// original protocol pads everything to 8 bytes); only the low 4 bytes carry
// the signed value, matching `veo_urpc`'s argument packing.
impl Field {
    pub fn i32_value(v: i32) -> Field {
        Field::I32(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::new(
            CmdCode::Call,
            vec![Field::U64(42), Field::Bytes(b"hello".to_vec())],
        );
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes, "LP").unwrap();
        assert_eq!(decoded.cmd, CmdCode::Call);
        assert_eq!(decoded.fields[0].as_u64().unwrap(), 42);
        assert_eq!(decoded.fields[1].as_bytes().unwrap(), b"hello");
    }

    #[test]
    fn decode_rejects_truncated_frame() {
        let frame = Frame::new(CmdCode::Ping, vec![Field::U64(1)]);
        let mut bytes = frame.encode();
        bytes.truncate(bytes.len() - 2);
        assert!(Frame::decode(&bytes, "L").is_err());
    }

    #[test]
    fn decode_rejects_format_mismatch() {
        let frame = Frame::new(CmdCode::Ping, vec![Field::U64(1)]);
        let bytes = frame.encode();
        assert!(Frame::decode(&bytes, "LL").is_err());
    }

    #[test]
    fn i32_round_trips_negative_values() {
        let frame = Frame::new(CmdCode::Exception, vec![Field::I32(-7)]);
        let bytes = frame.encode();
        let decoded = Frame::decode(&bytes, "I").unwrap();
        assert_eq!(decoded.fields[0].as_i32().unwrap(), -7);
    }
}
