//! Wire codec for the six TFTP opcodes and option pairs (§4.1).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TftpError};

pub const MAX_BLOCK_SIZE: usize = 65464;
pub const MAX_PACKET_SIZE: usize = 65468;
/// Defensive cap on any single null-terminated string field; RFC 1350
/// itself places no limit, but an unbounded scan would let a malformed
/// datagram with no terminator force a full-buffer linear scan per field.
const MAX_STRING_LEN: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl Opcode {
    pub fn from_u16(v: u16) -> Result<Self> {
        match v {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            other => Err(TftpError::MalformedPacket(format!(
                "unknown opcode {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            8 => ErrorCode::OptionNegotiationFailed,
            _ => ErrorCode::NotDefined,
        }
    }

    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Undefined error",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
            ErrorCode::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    NetAscii,
    Octet,
}

impl TransferMode {
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Ok(TransferMode::NetAscii),
            "octet" | "binary" => Ok(TransferMode::Octet),
            "mail" => Err(TftpError::MalformedPacket(
                "mail transfer mode is not supported".to_string(),
            )),
            other => Err(TftpError::MalformedPacket(format!(
                "unknown transfer mode '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferMode::NetAscii => "netascii",
            TransferMode::Octet => "octet",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: TransferMode,
        options: Vec<(String, String)>,
    },
    Wrq {
        filename: String,
        mode: TransferMode,
        options: Vec<(String, String)>,
    },
    Data {
        block: u16,
        payload: Bytes,
    },
    Ack {
        block: u16,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Oack {
        options: Vec<(String, String)>,
    },
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Reads a null-terminated string, advancing `buf` past the terminator.
/// Fails if no terminator is found before the buffer ends or the field
/// would exceed `MAX_STRING_LEN` (§4.1's "zero-terminator missing" case).
fn get_cstr(buf: &mut Bytes) -> Result<String> {
    let terminator = buf
        .iter()
        .take(MAX_STRING_LEN + 1)
        .position(|&b| b == 0)
        .ok_or_else(|| TftpError::MalformedPacket("missing null terminator".to_string()))?;
    let bytes = buf.split_to(terminator);
    buf.advance(1); // consume the terminator itself
    String::from_utf8(bytes.to_vec())
        .map_err(|_| TftpError::MalformedPacket("non-ASCII/UTF-8 string field".to_string()))
}

fn put_options(buf: &mut BytesMut, options: &[(String, String)]) {
    for (name, value) in options {
        put_cstr(buf, name);
        put_cstr(buf, value);
    }
}

fn get_options(buf: &mut Bytes) -> Result<Vec<(String, String)>> {
    let mut options = Vec::new();
    while buf.has_remaining() {
        let name = get_cstr(buf)?;
        let value = get_cstr(buf)?;
        options.push((name, value));
    }
    Ok(options)
}

impl Packet {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE.min(2048));
        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => {
                buf.put_u16(Opcode::Rrq as u16);
                put_cstr(&mut buf, filename);
                put_cstr(&mut buf, mode.as_str());
                put_options(&mut buf, options);
            }
            Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                buf.put_u16(Opcode::Wrq as u16);
                put_cstr(&mut buf, filename);
                put_cstr(&mut buf, mode.as_str());
                put_options(&mut buf, options);
            }
            Packet::Data { block, payload } => {
                buf.put_u16(Opcode::Data as u16);
                buf.put_u16(*block);
                buf.put_slice(payload);
            }
            Packet::Ack { block } => {
                buf.put_u16(Opcode::Ack as u16);
                buf.put_u16(*block);
            }
            Packet::Error { code, message } => {
                buf.put_u16(Opcode::Error as u16);
                buf.put_u16(code.as_u16());
                put_cstr(&mut buf, message);
            }
            Packet::Oack { options } => {
                buf.put_u16(Opcode::Oack as u16);
                put_options(&mut buf, options);
            }
        }
        buf
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let mut buf = Bytes::copy_from_slice(datagram);
        if buf.remaining() < 2 {
            return Err(TftpError::MalformedPacket("truncated header".to_string()));
        }
        let opcode = Opcode::from_u16(buf.get_u16())?;
        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let filename = get_cstr(&mut buf)?;
                let mode = TransferMode::from_str(&get_cstr(&mut buf)?)?;
                let options = get_options(&mut buf)?;
                if opcode == Opcode::Rrq {
                    Ok(Packet::Rrq {
                        filename,
                        mode,
                        options,
                    })
                } else {
                    Ok(Packet::Wrq {
                        filename,
                        mode,
                        options,
                    })
                }
            }
            Opcode::Data => {
                if buf.remaining() < 2 {
                    return Err(TftpError::MalformedPacket(
                        "truncated DATA header".to_string(),
                    ));
                }
                let block = buf.get_u16();
                Ok(Packet::Data {
                    block,
                    payload: buf,
                })
            }
            Opcode::Ack => {
                if buf.remaining() < 2 {
                    return Err(TftpError::MalformedPacket(
                        "truncated ACK header".to_string(),
                    ));
                }
                Ok(Packet::Ack {
                    block: buf.get_u16(),
                })
            }
            Opcode::Error => {
                if buf.remaining() < 2 {
                    return Err(TftpError::MalformedPacket(
                        "truncated ERROR header".to_string(),
                    ));
                }
                let code = ErrorCode::from_u16(buf.get_u16());
                let message = get_cstr(&mut buf)?;
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => {
                let options = get_options(&mut buf)?;
                Ok(Packet::Oack { options })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_rrq_with_options() {
        let pkt = Packet::Rrq {
            filename: "firmware.bin".to_string(),
            mode: TransferMode::Octet,
            options: vec![
                ("blksize".to_string(), "1024".to_string()),
                ("windowsize".to_string(), "4".to_string()),
            ],
        };
        let encoded = pkt.encode();
        let decoded = Packet::decode(&encoded).unwrap();
        match decoded {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => {
                assert_eq!(filename, "firmware.bin");
                assert_eq!(mode, TransferMode::Octet);
                assert_eq!(options.len(), 2);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_data() {
        let payload = Bytes::from_static(b"hello world");
        let pkt = Packet::Data {
            block: 42,
            payload: payload.clone(),
        };
        let encoded = pkt.encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Data { block, payload: p } => {
                assert_eq!(block, 42);
                assert_eq!(p, payload);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_ack() {
        let encoded = Packet::Ack { block: 7 }.encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Ack { block } => assert_eq!(block, 7),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn round_trips_error() {
        let encoded = Packet::Error {
            code: ErrorCode::FileNotFound,
            message: "nope".to_string(),
        }
        .encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Error { code, message } => {
                assert_eq!(code, ErrorCode::FileNotFound);
                assert_eq!(message, "nope");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        let buf = [0u8, 9];
        assert!(Packet::decode(&buf).is_err());
    }

    #[test]
    fn rejects_missing_terminator() {
        // RRQ opcode followed by a filename with no null terminator at all.
        let mut buf = BytesMut::new();
        buf.put_u16(Opcode::Rrq as u16);
        buf.put_slice(b"no-terminator-here");
        assert!(Packet::decode(&buf).is_err());
    }

    #[test]
    fn rejects_mail_mode() {
        let mut buf = BytesMut::new();
        buf.put_u16(Opcode::Rrq as u16);
        put_cstr(&mut buf, "x");
        put_cstr(&mut buf, "mail");
        assert!(Packet::decode(&buf).is_err());
    }

    #[test]
    fn aliases_binary_to_octet() {
        assert_eq!(TransferMode::from_str("BINARY").unwrap(), TransferMode::Octet);
    }

    #[test]
    fn oack_echoes_arbitrary_option_order() {
        let pkt = Packet::Oack {
            options: vec![
                ("windowsize".to_string(), "4".to_string()),
                ("blksize".to_string(), "1024".to_string()),
            ],
        };
        let encoded = pkt.encode();
        match Packet::decode(&encoded).unwrap() {
            Packet::Oack { options } => assert_eq!(options.len(), 2),
            _ => panic!("wrong variant"),
        }
    }
}
