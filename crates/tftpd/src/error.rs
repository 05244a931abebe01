use thiserror::Error;

use crate::packet::ErrorCode;

#[derive(Error, Debug)]
pub enum TftpError {
    #[error("file not found")]
    NotFound,

    #[error("access violation: {0}")]
    AccessViolation(String),

    #[error("file already exists")]
    AlreadyExists,

    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("block number outside legal window")]
    OutOfWindow,

    #[error("retransmit cap exceeded")]
    RetransmitExceeded,

    #[error("{0}")]
    Tftp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TftpError {
    /// Maps this error onto the wire error code the session sends when it
    /// synthesizes an ERROR packet from the sticky error slot (§4.5, §7).
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            TftpError::NotFound => ErrorCode::FileNotFound,
            TftpError::AccessViolation(_) => ErrorCode::AccessViolation,
            TftpError::AlreadyExists => ErrorCode::FileAlreadyExists,
            TftpError::MalformedPacket(_) => ErrorCode::IllegalOperation,
            TftpError::OutOfWindow => ErrorCode::IllegalOperation,
            TftpError::RetransmitExceeded => ErrorCode::NotDefined,
            TftpError::Tftp(_) => ErrorCode::NotDefined,
            TftpError::Io(_) => ErrorCode::NotDefined,
            TftpError::Other(_) => ErrorCode::NotDefined,
        }
    }
}

pub type Result<T> = std::result::Result<T, TftpError>;
