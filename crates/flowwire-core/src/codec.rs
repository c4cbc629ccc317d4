// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tagged wire codec for every persisted or queued blob.
//!
//! Byte 0 identifies the format, the remaining bytes are that format's
//! encoding of the value:
//!
//! | Tag | Format |
//! |-----|--------|
//! | `0` | MessagePack (named fields) |
//! | `1` | MessagePack, Brotli-compressed |
//! | `2` | JSON |
//!
//! An empty blob decodes to "no value". Anything else that fails to decode is a
//! [`CodecError`] carrying the attempted format and the target type.

use std::fmt;
use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LG_WINDOW: u32 = 22;

/// Encoding used for a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SerializerType {
    /// Compact binary. Fastest, best for small values.
    #[default]
    MessagePack = 0,
    /// Compact binary piped through Brotli. Trades CPU for store memory.
    MessagePackCompressed = 1,
    /// Human-readable, inspectable with external tools.
    Json = 2,
}

impl SerializerType {
    /// The tag byte written in front of the payload.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Map a tag byte back to its format.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::MessagePack),
            1 => Some(Self::MessagePackCompressed),
            2 => Some(Self::Json),
            _ => None,
        }
    }
}

impl fmt::Display for SerializerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessagePack => f.write_str("messagepack"),
            Self::MessagePackCompressed => f.write_str("messagepack+brotli"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for SerializerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "messagepack" | "msgpack" => Ok(Self::MessagePack),
            "messagepack+brotli" | "msgpack_compressed" | "compressed" => {
                Ok(Self::MessagePackCompressed)
            }
            "json" => Ok(Self::Json),
            other => Err(format!("unknown serializer '{}'", other)),
        }
    }
}

/// Codec failures.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// The first byte is not a known format tag.
    #[error("unknown format tag: {0}")]
    UnknownFormatTag(u8),

    /// The codec itself failed (truncated payload, corrupt stream, type mismatch).
    #[error("failed to {operation} {type_name} using {format}: {message}")]
    Serialization {
        /// `"encode"` or `"decode"`.
        operation: &'static str,
        /// Format that was attempted.
        format: SerializerType,
        /// Rust type that was being encoded or decoded.
        type_name: &'static str,
        /// Underlying codec message.
        message: String,
    },
}

impl CodecError {
    /// Stable code for logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownFormatTag(_) => "UNKNOWN_FORMAT_TAG",
            Self::Serialization { .. } => "SERIALIZATION_FAILURE",
        }
    }

    fn encode<T: ?Sized>(format: SerializerType, err: impl fmt::Display) -> Self {
        Self::Serialization {
            operation: "encode",
            format,
            type_name: std::any::type_name::<T>(),
            message: err.to_string(),
        }
    }

    fn decode<T>(format: SerializerType, err: impl fmt::Display) -> Self {
        Self::Serialization {
            operation: "decode",
            format,
            type_name: std::any::type_name::<T>(),
            message: err.to_string(),
        }
    }
}

/// Encode `value` with a leading format tag.
pub fn encode<T>(value: &T, format: SerializerType) -> Result<Vec<u8>, CodecError>
where
    T: Serialize + ?Sized,
{
    let mut out = Vec::with_capacity(64);
    out.push(format.tag());

    match format {
        SerializerType::MessagePack => {
            rmp_serde::encode::write_named(&mut out, value)
                .map_err(|e| CodecError::encode::<T>(format, e))?;
        }
        SerializerType::MessagePackCompressed => {
            let raw = rmp_serde::to_vec_named(value).map_err(|e| CodecError::encode::<T>(format, e))?;
            let mut compressor = brotli::CompressorWriter::new(
                &mut out,
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LG_WINDOW,
            );
            compressor
                .write_all(&raw)
                .and_then(|_| compressor.flush())
                .map_err(|e| CodecError::encode::<T>(format, e))?;
        }
        SerializerType::Json => {
            serde_json::to_writer(&mut out, value).map_err(|e| CodecError::encode::<T>(format, e))?;
        }
    }

    Ok(out)
}

/// Decode a tagged blob.
///
/// Returns `Ok(None)` for an empty blob.
pub fn decode<T>(data: &[u8]) -> Result<Option<T>, CodecError>
where
    T: DeserializeOwned,
{
    let Some((&tag, payload)) = data.split_first() else {
        return Ok(None);
    };

    let format = SerializerType::from_tag(tag).ok_or(CodecError::UnknownFormatTag(tag))?;

    let value = match format {
        SerializerType::MessagePack => {
            rmp_serde::from_slice(payload).map_err(|e| CodecError::decode::<T>(format, e))?
        }
        SerializerType::MessagePackCompressed => {
            let mut raw = Vec::with_capacity(payload.len() * 4);
            brotli::Decompressor::new(payload, BROTLI_BUFFER_SIZE)
                .read_to_end(&mut raw)
                .map_err(|e| CodecError::decode::<T>(format, e))?;
            rmp_serde::from_slice(&raw).map_err(|e| CodecError::decode::<T>(format, e))?
        }
        SerializerType::Json => {
            serde_json::from_slice(payload).map_err(|e| CodecError::decode::<T>(format, e))?
        }
    };

    Ok(Some(value))
}

/// Decode a tagged blob, treating corruption as absence.
///
/// For call sites where a bad blob should be skipped rather than fail the
/// whole operation (e.g. one corrupt entry in a batch).
pub fn try_decode<T>(data: &[u8]) -> Option<T>
where
    T: DeserializeOwned,
{
    match decode(data) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, code = e.error_code(), len = data.len(), "Discarding undecodable blob");
            None
        }
    }
}
