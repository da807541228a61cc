//! Binary wire format for silo-to-silo liveness messages.
//!
//! One message per UDP datagram. All multi-byte integers are little-endian.
//! A silo address is encoded as its socket address followed by the i32
//! generation.

use std::io::{self, Read};
use std::net::SocketAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{SiloAddress, SiloStatus};

// Safe read helpers that return io::Error instead of panicking on truncated input.

fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 2 bytes"));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_i32_le(buf: &mut &[u8]) -> io::Result<i32> {
    if buf.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 4 bytes"));
    }
    Ok(buf.get_i32_le())
}

fn safe_get_u64_le(buf: &mut &[u8]) -> io::Result<u64> {
    if buf.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 8 bytes"));
    }
    Ok(buf.get_u64_le())
}

/// Messages exchanged by the liveness transport.
#[derive(Debug, Clone, PartialEq)]
pub enum SiloMessage {
    /// Liveness probe. Only the silo whose full address equals `target`
    /// answers; a restarted process on the same endpoint stays silent.
    Ping {
        seq: u64,
        sender: SiloAddress,
        target: SiloAddress,
    },

    /// Answer to a ping, echoing its sequence number.
    Ack { seq: u64, sender: SiloAddress },

    /// Gossip: `silo` changed to `status`. Receivers treat it as a hint
    /// to re-read the table.
    StatusNotification {
        sender: SiloAddress,
        silo: SiloAddress,
        status: SiloStatus,
    },
}

// Wire format constants
const MSG_PING: u8 = 1;
const MSG_ACK: u8 = 2;
const MSG_STATUS: u8 = 3;

const ADDR_V4: u8 = 4;
const ADDR_V6: u8 = 6;

impl SiloMessage {
    /// Serializes the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the message into the given buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            SiloMessage::Ping {
                seq,
                sender,
                target,
            } => {
                buf.put_u8(MSG_PING);
                buf.put_u64_le(*seq);
                encode_silo(buf, sender);
                encode_silo(buf, target);
            }
            SiloMessage::Ack { seq, sender } => {
                buf.put_u8(MSG_ACK);
                buf.put_u64_le(*seq);
                encode_silo(buf, sender);
            }
            SiloMessage::StatusNotification {
                sender,
                silo,
                status,
            } => {
                buf.put_u8(MSG_STATUS);
                encode_silo(buf, sender);
                encode_silo(buf, silo);
                buf.put_u8(status.code());
            }
        }
    }

    /// Deserializes a message from bytes. Trailing bytes are rejected.
    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "empty message",
            ));
        }

        let msg_type = safe_get_u8(&mut buf)?;
        let msg = match msg_type {
            MSG_PING => {
                let seq = safe_get_u64_le(&mut buf)?;
                let sender = decode_silo(&mut buf)?;
                let target = decode_silo(&mut buf)?;
                SiloMessage::Ping {
                    seq,
                    sender,
                    target,
                }
            }
            MSG_ACK => {
                let seq = safe_get_u64_le(&mut buf)?;
                let sender = decode_silo(&mut buf)?;
                SiloMessage::Ack { seq, sender }
            }
            MSG_STATUS => {
                let sender = decode_silo(&mut buf)?;
                let silo = decode_silo(&mut buf)?;
                let code = safe_get_u8(&mut buf)?;
                let status = SiloStatus::from_code(code).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("unknown silo status code: {code}"),
                    )
                })?;
                SiloMessage::StatusNotification {
                    sender,
                    silo,
                    status,
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message type: {other}"),
                ))
            }
        };
        if !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} trailing bytes after message", buf.len()),
            ));
        }
        Ok(msg)
    }

    /// The silo that sent the message.
    pub fn sender(&self) -> SiloAddress {
        match self {
            SiloMessage::Ping { sender, .. }
            | SiloMessage::Ack { sender, .. }
            | SiloMessage::StatusNotification { sender, .. } => *sender,
        }
    }
}

fn encode_silo(buf: &mut BytesMut, silo: &SiloAddress) {
    match silo.endpoint() {
        SocketAddr::V4(v4) => {
            buf.put_u8(ADDR_V4);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16_le(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(ADDR_V6);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16_le(v6.port());
        }
    }
    buf.put_i32_le(silo.generation());
}

fn decode_silo(buf: &mut &[u8]) -> io::Result<SiloAddress> {
    let endpoint = match safe_get_u8(buf)? {
        ADDR_V4 => {
            let mut octets = [0u8; 4];
            buf.read_exact(&mut octets)?;
            let port = safe_get_u16_le(buf)?;
            SocketAddr::from((octets, port))
        }
        ADDR_V6 => {
            let mut octets = [0u8; 16];
            buf.read_exact(&mut octets)?;
            let port = safe_get_u16_le(buf)?;
            SocketAddr::from((octets, port))
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address type: {other}"),
            ))
        }
    };
    let generation = safe_get_i32_le(buf)?;
    Ok(SiloAddress::new(endpoint, generation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn silo_v4(generation: i32) -> SiloAddress {
        SiloAddress::new(SocketAddr::from((Ipv4Addr::new(10, 0, 0, 7), 11111)), generation)
    }

    fn silo_v6(generation: i32) -> SiloAddress {
        SiloAddress::new(SocketAddr::from((Ipv6Addr::LOCALHOST, 22222)), generation)
    }

    #[test]
    fn ping_roundtrip_mixed_families() {
        let msg = SiloMessage::Ping {
            seq: 42,
            sender: silo_v4(1),
            target: silo_v6(-3),
        };
        let decoded = SiloMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
        assert_eq!(decoded.sender(), silo_v4(1));
    }

    #[test]
    fn status_notification_roundtrip() {
        for status in [SiloStatus::Active, SiloStatus::ShuttingDown, SiloStatus::Dead] {
            let msg = SiloMessage::StatusNotification {
                sender: silo_v6(9),
                silo: silo_v4(8),
                status,
            };
            assert_eq!(SiloMessage::decode(&msg.encode()).unwrap(), msg);
        }
    }

    #[test]
    fn truncated_input_is_an_error() {
        let encoded = SiloMessage::Ack {
            seq: 7,
            sender: silo_v4(2),
        }
        .encode();
        for len in 0..encoded.len() {
            assert!(SiloMessage::decode(&encoded[..len]).is_err(), "prefix {len}");
        }
    }

    #[test]
    fn unknown_type_and_status_rejected() {
        assert_eq!(
            SiloMessage::decode(&[99]).unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );

        let mut encoded = BytesMut::from(
            &SiloMessage::StatusNotification {
                sender: silo_v4(1),
                silo: silo_v4(2),
                status: SiloStatus::Active,
            }
            .encode()[..],
        );
        let last = encoded.len() - 1;
        encoded[last] = 0xEE;
        assert!(SiloMessage::decode(&encoded).is_err());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut encoded = BytesMut::from(&SiloMessage::Ack { seq: 1, sender: silo_v4(1) }.encode()[..]);
        encoded.put_u8(0);
        assert!(SiloMessage::decode(&encoded).is_err());
    }
}
