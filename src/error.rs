//! Error definitions shared across the crate.
//!
//! Configuration errors are fatal for the run that raised them and carry the
//! offending key, value or line. Fusion errors only concern a single
//! navigation group and are reported, never propagated out of a run.

use thiserror::Error;

/// Crate wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures while decoding a single UBX frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame does not start with `0xB5 0x62`.
    #[error("missing sync marker")]
    BadSync,
    /// Fewer bytes than the header length field announces.
    #[error("truncated frame: need {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },
    /// Bytes left over after the checksum.
    #[error("{0} trailing bytes after checksum")]
    TrailingBytes(usize),
    /// Checksum bytes do not match the frame content.
    #[error("checksum mismatch: expected {expected:02x?}, found {found:02x?}")]
    ChecksumMismatch { expected: (u8, u8), found: (u8, u8) },
    /// Payload too short for the message it claims to be.
    #[error("payload of {class:#04x}/{id:#04x} too short: {len} bytes")]
    ShortPayload { class: u8, id: u8, len: usize },
}

#[derive(Debug, Error)]
pub enum Error {
    /// Definition line does not hold exactly `NAME HEXKEY TYPE`.
    #[error("corrupted definition: {line:?}")]
    CorruptDefinition { line: String },

    /// Config line does not hold exactly `NAME VALUE`.
    #[error("corrupted config: {line:?}")]
    CorruptConfig { line: String },

    /// Config value is not a base-10 integer.
    #[error("invalid value {value:?} for {key}")]
    InvalidConfigValue { key: String, value: String },

    #[error("unsupported config: {0}")]
    UnknownConfigKey(String),

    #[error("unsupported type {tag:?} for {key}")]
    UnsupportedValueType { key: String, tag: String },

    /// Value does not fit in the width declared by the definition.
    #[error("value {value} does not fit in {tag} for {key}")]
    ValueOutOfRange { key: String, value: i64, tag: &'static str },

    /// Transport accepted fewer bytes than the frame holds.
    #[error("expected to send {expected} bytes, but sent {sent}")]
    ShortWrite { expected: usize, sent: usize },

    /// Receiver rejected a setting and NAKs are not skipped.
    #[error(
        "failed to set {key} to {value}: got {response}, was expecting ACK for clsID={class:#04x}, msgID={id:#04x}"
    )]
    ConfigurationFailed {
        key: String,
        value: i64,
        response: String,
        class: u8,
        id: u8,
    },

    /// Acknowledgement listener is gone, no response can arrive anymore.
    #[error("acknowledgement listener stopped")]
    ReceiverStopped,

    /// A previous request failed, the session accepts no more requests.
    #[error("configuration session already failed")]
    SessionFailed,

    #[error("valid timestamp missing, skipping iTOW={0}")]
    MissingTimestamp(u32),

    #[error("valid location missing, skipping iTOW={0}")]
    MissingLocation(u32),

    #[error(transparent)]
    InvalidFrame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// System clock could not be read.
    #[error("clock error: {0}")]
    Clock(#[from] hifitime::HifitimeError),
}
