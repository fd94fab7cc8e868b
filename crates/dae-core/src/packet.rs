//! Packet Codec - the wire format spoken between daemons
//!
//! A packet is `<name><space><json array>` with no length prefix.
//! One write on the sender side is expected to arrive as one read on the
//! receiver side, which only holds for small payloads over loopback.

use serde_json::Value;
use std::fmt;

use crate::error::{DaeError, Result};

/// Byte between the packet name and its JSON payload
pub const SEPARATOR: u8 = b' ';

/// A single protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub name: String,
    pub data: Vec<Value>,
}

impl Packet {
    pub fn new(name: impl Into<String>, data: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// Encode this packet for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode(&self.name, &self.data)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = Value::Array(self.data.clone());
        write!(f, "{}{}{}", self.name, SEPARATOR as char, json)
    }
}

/// Encode a name and its arguments into packet bytes
pub fn encode(name: &str, data: &[Value]) -> Result<Vec<u8>> {
    if name.is_empty() || name.as_bytes().contains(&SEPARATOR) {
        return Err(DaeError::InvalidPacketName(name.to_string()));
    }

    let json = serde_json::to_vec(data)?;
    let mut out = Vec::with_capacity(name.len() + 1 + json.len());
    out.extend_from_slice(name.as_bytes());
    out.push(SEPARATOR);
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decode packet bytes. Malformed input yields `None`, never an error.
///
/// A payload that is not valid JSON still produces a packet with an empty
/// argument list so the name survives.
pub fn decode(bytes: &[u8]) -> Option<Packet> {
    let index = bytes.iter().position(|b| *b == SEPARATOR)?;
    let name = String::from_utf8_lossy(&bytes[..index]).trim().to_string();
    if name.is_empty() {
        return None;
    }

    let data = serde_json::from_slice::<Value>(&bytes[index + 1..])
        .map(into_args)
        .unwrap_or_default();

    Some(Packet { name, data })
}

/// Decode every packet in one read.
///
/// Writes from the same sender can be coalesced by the transport. Since
/// every encoded payload is a self-delimiting JSON array, a payload that
/// parses cleanly and is followed by `<name><space>` marks the start of the
/// next packet. Anything else, unparsable payloads and trailing bytes with
/// no separator included, ends the read with empty arguments like `decode`.
pub fn decode_stream(mut bytes: &[u8]) -> Vec<Packet> {
    let mut packets = Vec::new();

    while let Some(index) = bytes.iter().position(|b| *b == SEPARATOR) {
        let name = String::from_utf8_lossy(&bytes[..index]).trim().to_string();
        if name.is_empty() {
            break;
        }

        let payload = &bytes[index + 1..];
        let mut values = serde_json::Deserializer::from_slice(payload).into_iter::<Value>();
        match values.next() {
            Some(Ok(value)) => {
                let rest = &payload[values.byte_offset()..];
                if !rest.iter().all(u8::is_ascii_whitespace) && !starts_packet(rest) {
                    packets.push(Packet {
                        name,
                        data: Vec::new(),
                    });
                    break;
                }
                packets.push(Packet {
                    name,
                    data: into_args(value),
                });
                bytes = rest;
            }
            _ => {
                packets.push(Packet {
                    name,
                    data: Vec::new(),
                });
                break;
            }
        }
    }

    packets
}

fn starts_packet(bytes: &[u8]) -> bool {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    bytes[start..]
        .iter()
        .position(|b| *b == SEPARATOR)
        .is_some_and(|index| index > 0)
}

fn into_args(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}
