//! Error Types for dhub-core
//!
//! This module defines every error the record model, schema mapping and batch
//! wire codec can produce.
//!
//! ## Error Categories
//!
//! ### Frame Integrity Errors
//! - `InvalidMagic`: Frame doesn't start with the `"DHUB"` magic bytes
//! - `InvalidLength`: Frame is shorter than the header or disagrees with its declared length
//! - `CrcMismatch`: Stored payload does not match its CRC32-Castagnoli checksum
//! - `UnsupportedDataType`: Payload encoding other than Avro rows
//!
//! ### Schema Errors
//! - `InvalidSchema`: Duplicate/illegal field names, unparsable schema JSON
//! - `SchemaMismatch`: A record does not fit the schema it is being encoded with
//! - `UnknownSchemaVersion`: No schema is registered for a version id
//!
//! ### Compression Errors
//! - `Compression` / `Decompression`: codec failures (decompression usually means corruption)
//!
//! ## Usage
//! Functions return [`Result<T>`], so `?` propagates these errors.
//!
//! ```ignore
//! use dhub_core::{BatchHeader, Error};
//!
//! match BatchHeader::parse(&frame) {
//!     Err(Error::CrcMismatch { .. }) => eprintln!("corrupted frame"),
//!     Err(e) => eprintln!("bad frame: {e}"),
//!     Ok(header) => println!("{} records", header.record_count),
//! }
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Invalid frame length: {0}")]
    InvalidLength(String),

    #[error("Unsupported batch version: {0}")]
    UnsupportedVersion(u32),

    #[error("CRC mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(u16),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Record does not match schema: {0}")]
    SchemaMismatch(String),

    #[error("Unknown schema version: {0}")]
    UnknownSchemaVersion(i32),

    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
