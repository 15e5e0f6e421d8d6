//! TFTP packets (RFC 1350) and option negotiation (RFC 2347, 2348, 2349)

use crate::error::{PxeError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use tracing::warn;

/// Block size used when the client does not negotiate one.
pub const DEFAULT_BLOCK_SIZE: usize = 512;
/// Smallest `blksize` RFC 2348 allows.
pub const MIN_BLOCK_SIZE: usize = 8;
/// Largest `blksize` RFC 2348 allows.
pub const MAX_BLOCK_SIZE: usize = 65464;
/// Room for a full DATA packet: opcode, block number, payload.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;
/// Retransmission timeout when the client does not negotiate one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Retransmissions before a transfer is abandoned.
pub const MAX_RETRIES: u32 = 5;

const MAX_STRING_LENGTH: usize = 255;

/// TFTP opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = PxeError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(PxeError::Tftp(format!("Invalid opcode: {value}"))),
        }
    }
}

/// Error codes carried in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTid = 5,
    FileExists = 6,
    NoSuchUser = 7,
    OptionNegotiation = 8,
}

/// RRQ mode. Every mode is served as raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Netascii,
    Octet,
    Mail,
}

impl TransferMode {
    /// Case-insensitive.
    pub fn parse(mode: &str) -> Result<Self> {
        match mode.to_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(PxeError::Tftp(format!("Invalid transfer mode: {mode}"))),
        }
    }
}

/// A request arriving on the listening port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read(ReadRequest),
    Write { filename: String },
}

/// A parsed RRQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Requested file.
    pub filename: String,
    /// Requested mode.
    pub mode: TransferMode,
    /// Options in the order sent, names lowercased.
    pub options: Vec<(String, String)>,
}

/// What a transfer peer sent back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ack(u16),
    Error { code: u16, message: String },
    Other(u16),
}

/// Parses an RRQ or WRQ.
pub fn parse_request(datagram: &[u8]) -> Result<Request> {
    let mut bytes = BytesMut::from(datagram);
    if bytes.len() < 2 {
        return Err(PxeError::Tftp("Packet too small".to_string()));
    }
    match Opcode::try_from(bytes.get_u16())? {
        Opcode::Rrq => {
            let filename = parse_string(&mut bytes)?;
            let mode = TransferMode::parse(&parse_string(&mut bytes)?)?;
            let mut options = Vec::new();
            while bytes.has_remaining() {
                let Ok(name) = parse_string(&mut bytes) else {
                    break;
                };
                let Ok(value) = parse_string(&mut bytes) else {
                    break;
                };
                options.push((name.to_lowercase(), value));
            }
            Ok(Request::Read(ReadRequest {
                filename,
                mode,
                options,
            }))
        }
        Opcode::Wrq => Ok(Request::Write {
            filename: parse_string(&mut bytes).unwrap_or_default(),
        }),
        other => Err(PxeError::Tftp(format!("Unexpected {other:?} on listening port"))),
    }
}

/// Parses what a client sends during a transfer.
pub fn parse_reply(datagram: &[u8]) -> Result<Reply> {
    let mut bytes = BytesMut::from(datagram);
    if bytes.len() < 4 {
        return Err(PxeError::Tftp("Packet too small".to_string()));
    }
    let opcode = bytes.get_u16();
    match Opcode::try_from(opcode) {
        Ok(Opcode::Ack) => Ok(Reply::Ack(bytes.get_u16())),
        Ok(Opcode::Error) => {
            let code = bytes.get_u16();
            let message = parse_string(&mut bytes).unwrap_or_default();
            Ok(Reply::Error { code, message })
        }
        _ => Ok(Reply::Other(opcode)),
    }
}

/// DATA: block number then payload.
pub fn data_packet(block: u16, payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(4 + payload.len());
    packet.put_u16(Opcode::Data as u16);
    packet.put_u16(block);
    packet.put_slice(payload);
    packet.freeze()
}

/// ACK for `block`.
pub fn ack_packet(block: u16) -> Bytes {
    let mut packet = BytesMut::with_capacity(4);
    packet.put_u16(Opcode::Ack as u16);
    packet.put_u16(block);
    packet.freeze()
}

/// ERROR with a null-terminated message.
pub fn error_packet(code: ErrorCode, message: &str) -> Bytes {
    let mut packet = BytesMut::with_capacity(5 + message.len());
    packet.put_u16(Opcode::Error as u16);
    packet.put_u16(code as u16);
    packet.put_slice(message.as_bytes());
    packet.put_u8(0);
    packet.freeze()
}

/// OACK listing the acknowledged options in order.
pub fn oack_packet(options: &[(String, String)]) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(Opcode::Oack as u16);
    for (name, value) in options {
        packet.put_slice(name.as_bytes());
        packet.put_u8(0);
        packet.put_slice(value.as_bytes());
        packet.put_u8(0);
    }
    packet.freeze()
}

/// Read request; used by clients and tests.
pub fn rrq_packet(filename: &str, mode: &str, options: &[(&str, &str)]) -> Bytes {
    let mut packet = BytesMut::new();
    packet.put_u16(Opcode::Rrq as u16);
    for part in [filename, mode]
        .into_iter()
        .chain(options.iter().flat_map(|(name, value)| [*name, *value]))
    {
        packet.put_slice(part.as_bytes());
        packet.put_u8(0);
    }
    packet.freeze()
}

/// Null-terminated string, at most 255 bytes.
fn parse_string(bytes: &mut BytesMut) -> Result<String> {
    let search = &bytes[..bytes.len().min(MAX_STRING_LENGTH + 1)];
    let null_pos = search.iter().position(|&b| b == 0).ok_or_else(|| {
        if bytes.len() > MAX_STRING_LENGTH {
            PxeError::Tftp("String too long (exceeds 255 bytes)".to_string())
        } else {
            PxeError::Tftp("No null terminator found".to_string())
        }
    })?;

    let string_bytes = bytes.split_to(null_pos);
    bytes.advance(1);

    String::from_utf8(string_bytes.to_vec())
        .map_err(|e| PxeError::Tftp(format!("Invalid UTF-8: {e}")))
}

/// Settings a transfer runs with once options are settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// Payload bytes per DATA packet.
    pub block_size: usize,
    /// Retransmission timeout.
    pub timeout: Duration,
    /// Options to acknowledge; a `tsize` value is filled in once the size is known.
    pub acknowledged: Vec<(String, String)>,
}

impl TransferOptions {
    /// Fills in the size for an acknowledged `tsize`.
    pub fn set_transfer_size(&mut self, size: u64) {
        for (name, value) in &mut self.acknowledged {
            if name == "tsize" {
                *value = size.to_string();
            }
        }
    }
}

/// Settles the requested options.
///
/// `blksize` is capped at `max_block_size` whatever the client asked for, including values
/// above the RFC maximum. Values below the minimum or unparseable are dropped from the
/// acknowledgement rather than refused.
pub fn negotiate(
    requested: &[(String, String)],
    max_block_size: usize,
    default_timeout: Duration,
) -> TransferOptions {
    let max_block_size = max_block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
    let mut options = TransferOptions {
        block_size: DEFAULT_BLOCK_SIZE.min(max_block_size),
        timeout: default_timeout,
        acknowledged: Vec::new(),
    };

    for (name, value) in requested {
        match name.as_str() {
            "blksize" => match value.parse::<usize>() {
                Ok(size) if size >= MIN_BLOCK_SIZE => {
                    let size = size.min(max_block_size);
                    options.block_size = size;
                    options.acknowledged.push((name.clone(), size.to_string()));
                }
                _ => warn!("Ignoring invalid blksize '{}'", value),
            },
            "timeout" => match value.parse::<u64>() {
                Ok(secs) if (1..=255).contains(&secs) => {
                    options.timeout = Duration::from_secs(secs);
                    options.acknowledged.push((name.clone(), secs.to_string()));
                }
                _ => warn!("Ignoring invalid timeout '{}'", value),
            },
            "tsize" => match value.parse::<u64>() {
                Ok(_) => options.acknowledged.push((name.clone(), "0".to_string())),
                Err(_) => warn!("Ignoring invalid tsize '{}'", value),
            },
            _ => {}
        }
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn owned(options: &[(&str, &str)]) -> Vec<(String, String)> {
        options
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_read_request_with_options() {
        let packet = rrq_packet("pxelinux.0", "OCTET", &[("BLKSIZE", "1468"), ("tsize", "0")]);
        let request = parse_request(&packet).unwrap();
        assert_eq!(
            request,
            Request::Read(ReadRequest {
                filename: "pxelinux.0".into(),
                mode: TransferMode::Octet,
                options: owned(&[("blksize", "1468"), ("tsize", "0")]),
            })
        );
    }

    #[test]
    fn test_parse_truncated_option_is_dropped() {
        let mut packet = BytesMut::from(&rrq_packet("a", "octet", &[])[..]);
        packet.put_slice(b"blksize\0512");
        let Request::Read(request) = parse_request(&packet).unwrap() else {
            panic!("expected a read request");
        };
        assert!(request.options.is_empty());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_request(&[0]).is_err());
        assert!(parse_request(&[0, 9, b'a', 0]).is_err());
        assert!(parse_request(&[0, 1, b'a', b'b']).is_err());
        assert!(parse_request(&rrq_packet("a", "binary", &[])).is_err());
        let long = "x".repeat(300);
        assert!(parse_request(&rrq_packet(&long, "octet", &[])).is_err());
    }

    #[test]
    fn test_parse_write_request() {
        let mut packet = BytesMut::new();
        packet.put_u16(Opcode::Wrq as u16);
        packet.put_slice(b"upload\0octet\0");
        assert_eq!(
            parse_request(&packet).unwrap(),
            Request::Write {
                filename: "upload".into()
            }
        );
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply(&ack_packet(7)).unwrap(), Reply::Ack(7));
        assert_eq!(
            parse_reply(&error_packet(ErrorCode::FileNotFound, "gone")).unwrap(),
            Reply::Error {
                code: 1,
                message: "gone".into()
            }
        );
        assert_eq!(parse_reply(&data_packet(1, b"")).unwrap(), Reply::Other(3));
    }

    #[test]
    fn test_packet_layouts() {
        assert_eq!(&data_packet(258, b"hi")[..], &[0, 3, 1, 2, b'h', b'i']);
        assert_eq!(
            &oack_packet(&owned(&[("blksize", "1008")]))[..],
            b"\x00\x06blksize\x001008\x00"
        );
    }

    #[test]
    fn test_negotiate_caps_block_size() {
        let options = negotiate(
            &owned(&[("blksize", "1468"), ("tsize", "0"), ("windowsize", "4")]),
            1008,
            Duration::from_secs(5),
        );
        assert_eq!(options.block_size, 1008);
        assert_eq!(options.acknowledged, owned(&[("blksize", "1008"), ("tsize", "0")]));
    }

    #[test]
    fn test_negotiate_oversized_block_size_gets_the_cap() {
        let options = negotiate(&owned(&[("blksize", "70000")]), 1008, Duration::from_secs(5));
        assert_eq!(options.block_size, 1008);
        assert_eq!(options.acknowledged, owned(&[("blksize", "1008")]));

        let options = negotiate(&owned(&[("blksize", "70000")]), 100_000, Duration::from_secs(5));
        assert_eq!(options.block_size, MAX_BLOCK_SIZE);
        assert_eq!(options.acknowledged, owned(&[("blksize", "65464")]));
    }

    #[test]
    fn test_negotiate_ignores_invalid_values() {
        let options = negotiate(
            &owned(&[("blksize", "4"), ("timeout", "0"), ("tsize", "big")]),
            1008,
            Duration::from_secs(5),
        );
        assert_eq!(options.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(options.timeout, Duration::from_secs(5));
        assert!(options.acknowledged.is_empty());
    }

    #[test]
    fn test_negotiate_timeout_and_tsize() {
        let mut options = negotiate(
            &owned(&[("timeout", "2"), ("tsize", "0"), ("blksize", "512")]),
            1008,
            Duration::from_secs(5),
        );
        options.set_transfer_size(4096);
        assert_eq!(options.timeout, Duration::from_secs(2));
        assert_eq!(
            options.acknowledged,
            owned(&[("timeout", "2"), ("tsize", "4096"), ("blksize", "512")])
        );
    }
}
