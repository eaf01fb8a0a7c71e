//! Binary packet codec.
//!
//! Every packet is a sequence of self-delimiting MessagePack values:
//!
//! ```text
//! flag [seed] [id] path params payload
//! ```
//!
//! # Flag Byte
//!
//! The flag is a MessagePack positive fixint:
//!
//! | Bits | Meaning |
//! |------|---------|
//! | 0-2 | Packet kind |
//! | 4 | Format marker, always set |
//! | 5 | `id` follows |
//! | 6 | `seed` follows |
//!
//! Decoding is strict: anything that does not match the layout above is a
//! [`Error::Decode`], never a panic. Bytes after the payload are ignored.

// ============================================================================
// Imports
// ============================================================================

use rmpv::decode::read_value_with_max_depth;
use rmpv::encode::write_value;

use crate::error::{Error, Result};
use crate::identifiers::RequestId;

use super::packet::{Kind, Packet, Params, Value};

// ============================================================================
// Constants
// ============================================================================

/// Format marker, set on every packet.
const FLAG_FORMAT: u8 = 1 << 4;

/// Set when a request id follows the flag.
const FLAG_ID: u8 = 1 << 5;

/// Set when a seed follows the flag.
const FLAG_SEED: u8 = 1 << 6;

/// Low bits holding the packet kind.
const KIND_MASK: u8 = 0b0000_0111;

/// Largest flag value that still fits a positive fixint.
const FLAG_MAX: u64 = 0x7f;

/// Nesting limit for decoded values.
const MAX_DEPTH: usize = 256;

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a packet into its wire representation.
///
/// # Errors
///
/// Returns [`Error::Encode`] if the payload cannot be written.
pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
    let mut flag = FLAG_FORMAT | u8::from(packet.kind);
    if packet.seed != 0 {
        flag |= FLAG_SEED;
    }
    if !packet.id.is_none() {
        flag |= FLAG_ID;
    }

    let mut buf = Vec::with_capacity(32);
    write(&mut buf, &Value::from(flag))?;
    if packet.seed != 0 {
        write(&mut buf, &Value::from(packet.seed))?;
    }
    if !packet.id.is_none() {
        write(&mut buf, &Value::from(packet.id.as_u64()))?;
    }

    let path = Value::Array(packet.path.iter().map(|s| Value::from(s.as_str())).collect());
    write(&mut buf, &path)?;

    let params = Value::Map(
        packet
            .params
            .iter()
            .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
            .collect(),
    );
    write(&mut buf, &params)?;
    write(&mut buf, &packet.payload)?;

    Ok(buf)
}

#[inline]
fn write(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    write_value(buf, value).map_err(|e| Error::encode(e.to_string()))
}

// ============================================================================
// Decoding
// ============================================================================

/// Decodes a packet from its wire representation.
///
/// # Errors
///
/// Returns [`Error::Decode`] on malformed or truncated input.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    let mut rd = bytes;

    let flag = read(&mut rd, "flag")?
        .as_u64()
        .filter(|f| *f <= FLAG_MAX)
        .ok_or_else(|| Error::decode("flag is not a positive fixint"))?;
    // Bounded by FLAG_MAX above.
    let flag = flag as u8;

    if flag & FLAG_FORMAT == 0 {
        return Err(Error::decode(format!("missing format marker in flag {flag:#04x}")));
    }
    let kind = Kind::try_from(flag & KIND_MASK)?;

    let seed = if flag & FLAG_SEED != 0 {
        read_unsigned(&mut rd, "seed")?
    } else {
        0
    };
    let id = if flag & FLAG_ID != 0 {
        RequestId::new(read_unsigned(&mut rd, "id")?)
    } else {
        RequestId::NONE
    };

    let path = decode_path(read(&mut rd, "path")?)?;
    let params = decode_params(read(&mut rd, "params")?)?;
    let payload = read(&mut rd, "payload")?;

    Ok(Packet {
        kind,
        seed,
        id,
        path,
        params,
        payload,
    })
}

fn read(rd: &mut &[u8], field: &str) -> Result<Value> {
    read_value_with_max_depth(rd, MAX_DEPTH)
        .map_err(|e| Error::decode(format!("failed to read {field}: {e}")))
}

fn read_unsigned(rd: &mut &[u8], field: &str) -> Result<u64> {
    read(rd, field)?
        .as_u64()
        .ok_or_else(|| Error::decode(format!("{field} is not an unsigned integer")))
}

fn decode_path(value: Value) -> Result<Vec<String>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => s
                    .into_str()
                    .ok_or_else(|| Error::decode("path segment is not valid UTF-8")),
                other => Err(Error::decode(format!("path segment is not a string: {other}"))),
            })
            .collect(),
        other => Err(Error::decode(format!("path is not an array: {other}"))),
    }
}

fn decode_params(value: Value) -> Result<Params> {
    match value {
        Value::Nil => Ok(Params::new()),
        Value::Map(entries) => entries
            .into_iter()
            .map(|(key, value)| match key {
                Value::String(s) => s
                    .into_str()
                    .map(|k| (k, value))
                    .ok_or_else(|| Error::decode("param key is not valid UTF-8")),
                other => Err(Error::decode(format!("param key is not a string: {other}"))),
            })
            .collect(),
        other => Err(Error::decode(format!("params is not a map: {other}"))),
    }
}

// ============================================================================
// Tests
// ============================================================================
