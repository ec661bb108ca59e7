// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! MQTT 3.1.1 packet codec
//!
//! Only what a QoS 0 telemetry client needs: CONNECT/CONNACK, PUBLISH,
//! SUBSCRIBE/SUBACK, PINGREQ/PINGRESP and DISCONNECT.
//!
//! Fixed header:
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ type (4 bit) │ flags (4 bit)│ remaining length    │
//! │              │              │ (1-4 bytes, varint) │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```

use crate::broker::LastWill;
use crate::error::TransportError;

/// Largest remaining length the varint can carry
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

const PROTOCOL_LEVEL: u8 = 4;

/// CONNECT packet contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub will: Option<LastWill>,
}

/// A control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish { topic: String, payload: Vec<u8> },
    Subscribe { packet_id: u16, filters: Vec<String> },
    SubAck { packet_id: u16, codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

fn malformed(what: &str) -> TransportError {
    TransportError::Malformed(what.to_string())
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<(), TransportError> {
    let len = u16::try_from(bytes.len()).map_err(|_| malformed("field longer than 65535 bytes"))?;
    put_u16(buf, len);
    buf.extend_from_slice(bytes);
    Ok(())
}

fn put_remaining_length(buf: &mut Vec<u8>, mut len: usize) -> Result<(), TransportError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(TransportError::PayloadTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Reads big-endian fields from a packet body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransportError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| malformed("truncated packet"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, TransportError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, TransportError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8], TransportError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, TransportError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("invalid UTF-8 string"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

impl Packet {
    /// Append the wire form of this packet to `buf`
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        let mut body = Vec::new();
        let header = match self {
            Packet::Connect(connect) => {
                put_bytes(&mut body, b"MQTT")?;
                body.push(PROTOCOL_LEVEL);
                let mut flags = 0x02; // clean session
                if connect.username.is_some() {
                    flags |= 0x80;
                }
                if connect.password.is_some() {
                    flags |= 0x40;
                }
                if connect.will.is_some() {
                    flags |= 0x04;
                }
                body.push(flags);
                put_u16(&mut body, connect.keep_alive_secs);
                put_bytes(&mut body, connect.client_id.as_bytes())?;
                if let Some(will) = &connect.will {
                    put_bytes(&mut body, will.topic.as_bytes())?;
                    put_bytes(&mut body, &will.payload)?;
                }
                if let Some(username) = &connect.username {
                    put_bytes(&mut body, username.as_bytes())?;
                }
                if let Some(password) = &connect.password {
                    put_bytes(&mut body, password.as_bytes())?;
                }
                CONNECT << 4
            }
            Packet::ConnAck {
                session_present,
                code,
            } => {
                body.push(*session_present as u8);
                body.push(*code);
                CONNACK << 4
            }
            Packet::Publish { topic, payload } => {
                put_bytes(&mut body, topic.as_bytes())?;
                body.extend_from_slice(payload);
                PUBLISH << 4
            }
            Packet::Subscribe { packet_id, filters } => {
                put_u16(&mut body, *packet_id);
                for filter in filters {
                    put_bytes(&mut body, filter.as_bytes())?;
                    body.push(0); // requested QoS
                }
                (SUBSCRIBE << 4) | 0x02
            }
            Packet::SubAck { packet_id, codes } => {
                put_u16(&mut body, *packet_id);
                body.extend_from_slice(codes);
                SUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };
        buf.push(header);
        put_remaining_length(buf, body.len())?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Wire form of this packet
    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Decode one packet from the front of `buf`
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete packet,
    /// otherwise the packet and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, TransportError> {
        let Some(&header) = buf.first() else {
            return Ok(None);
        };
        let mut remaining = 0usize;
        let mut multiplier = 1usize;
        let mut offset = 1;
        loop {
            let Some(&byte) = buf.get(offset) else {
                return Ok(None);
            };
            offset += 1;
            remaining += (byte & 0x7F) as usize * multiplier;
            if byte & 0x80 == 0 {
                break;
            }
            if offset > 4 {
                return Err(malformed("remaining length longer than 4 bytes"));
            }
            multiplier *= 128;
        }
        let total = offset + remaining;
        if buf.len() < total {
            return Ok(None);
        }
        let packet = Self::decode_body(header, &buf[offset..total])?;
        Ok(Some((packet, total)))
    }

    fn decode_body(header: u8, body: &[u8]) -> Result<Packet, TransportError> {
        let mut r = Reader::new(body);
        let packet = match header >> 4 {
            CONNECT => {
                if r.bytes()? != b"MQTT" {
                    return Err(malformed("unknown protocol name"));
                }
                if r.u8()? != PROTOCOL_LEVEL {
                    return Err(malformed("unsupported protocol level"));
                }
                let flags = r.u8()?;
                let keep_alive_secs = r.u16()?;
                let client_id = r.string()?;
                let will = if flags & 0x04 != 0 {
                    Some(LastWill {
                        topic: r.string()?,
                        payload: r.bytes()?.to_vec(),
                    })
                } else {
                    None
                };
                let username = if flags & 0x80 != 0 { Some(r.string()?) } else { None };
                let password = if flags & 0x40 != 0 { Some(r.string()?) } else { None };
                Packet::Connect(Connect {
                    client_id,
                    keep_alive_secs,
                    username,
                    password,
                    will,
                })
            }
            CONNACK => Packet::ConnAck {
                session_present: r.u8()? & 0x01 != 0,
                code: r.u8()?,
            },
            PUBLISH => {
                let topic = r.string()?;
                let qos = (header >> 1) & 0x03;
                if qos > 0 {
                    r.u16()?; // packet id
                }
                Packet::Publish {
                    topic,
                    payload: r.rest().to_vec(),
                }
            }
            SUBSCRIBE => {
                let packet_id = r.u16()?;
                let mut filters = Vec::new();
                while !r.is_empty() {
                    filters.push(r.string()?);
                    r.u8()?;
                }
                Packet::Subscribe { packet_id, filters }
            }
            SUBACK => Packet::SubAck {
                packet_id: r.u16()?,
                codes: r.rest().to_vec(),
            },
            PINGREQ => Packet::PingReq,
            PINGRESP => Packet::PingResp,
            DISCONNECT => Packet::Disconnect,
            other => return Err(TransportError::Malformed(format!("packet type {}", other))),
        };
        Ok(packet)
    }
}
