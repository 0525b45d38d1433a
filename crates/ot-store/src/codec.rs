//! Versioned encoding for diff and snapshot blobs.
//!
//! Every blob carries a 3-byte header so readers can tell which encoding
//! produced it:
//!
//! ```text
//! [MAGIC: 0x07][VERSION: u8][FORMAT: u8][PAYLOAD: N bytes]
//! ```

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Magic byte identifying ot-store blobs.
pub const MAGIC_BYTE: u8 = 0x07;

/// Envelope version written by this crate.
pub const CODEC_VERSION: u8 = 1;

/// Size of the envelope header in bytes.
pub const HEADER_SIZE: usize = 3;

/// Payload encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Format {
    /// Compact binary via `postcard`.
    #[default]
    Postcard = 1,
    /// Human-readable `serde_json`.
    Json = 2,
}

impl Format {
    /// Convert from a raw header byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Postcard),
            2 => Some(Self::Json),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Postcard => "postcard",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postcard" => Ok(Self::Postcard),
            "json" => Ok(Self::Json),
            _ => Err(CodecError::UnknownFormatName(s.to_string())),
        }
    }
}

/// Error encoding or decoding a blob.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Data is too short to contain the header.
    #[error("data too short for diff envelope")]
    TooShort,
    /// Missing or incorrect magic byte.
    #[error("invalid magic byte: 0x{0:02X}, expected 0x07")]
    InvalidMagic(u8),
    /// Written by a newer codec.
    #[error("unsupported envelope version {0}, expected at most {max}", max = CODEC_VERSION)]
    UnsupportedVersion(u8),
    /// Unknown format byte.
    #[error("unknown payload format: {0}")]
    UnknownFormat(u8),
    /// Unknown format name in configuration.
    #[error("unknown payload format name: {0:?}")]
    UnknownFormatName(String),
    /// The postcard payload is malformed.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
    /// The JSON payload is malformed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// A header plus an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEnvelope {
    /// Envelope version.
    pub version: u8,
    /// Encoding of `payload`.
    pub format: Format,
    /// Encoded value.
    pub payload: Vec<u8>,
}

impl DiffEnvelope {
    /// Serialize the envelope to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.push(MAGIC_BYTE);
        bytes.push(self.version);
        bytes.push(self.format as u8);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse an envelope from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < HEADER_SIZE {
            return Err(CodecError::TooShort);
        }
        if data[0] != MAGIC_BYTE {
            return Err(CodecError::InvalidMagic(data[0]));
        }
        let version = data[1];
        if version == 0 || version > CODEC_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let format = Format::from_byte(data[2]).ok_or(CodecError::UnknownFormat(data[2]))?;
        Ok(Self {
            version,
            format,
            payload: data[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Encode a list of operations.
pub fn encode_diffs<D: Serialize>(diffs: &[D], format: Format) -> Result<Vec<u8>, CodecError> {
    let payload = match format {
        Format::Postcard => postcard::to_allocvec(diffs)?,
        Format::Json => serde_json::to_vec(diffs)?,
    };
    Ok(DiffEnvelope {
        version: CODEC_VERSION,
        format,
        payload,
    }
    .to_bytes())
}

/// Decode a list of operations, whatever format wrote it.
pub fn decode_diffs<D: DeserializeOwned>(data: &[u8]) -> Result<Vec<D>, CodecError> {
    let envelope = DiffEnvelope::from_bytes(data)?;
    Ok(match envelope.format {
        Format::Postcard => postcard::from_bytes(&envelope.payload)?,
        Format::Json => serde_json::from_slice(&envelope.payload)?,
    })
}
