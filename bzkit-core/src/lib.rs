//! # bzkit Core
//!
//! Core components for the bzkit BZip2 codec.
//!
//! This crate provides the building blocks the codec is layered on:
//!
//! - [`bitstream`]: MSB-first bit-level I/O ([`BitReader`], [`BitWriter`], [`BitBuffer`])
//! - [`crc`]: the CRC-32 variant used by BZip2 block and stream checksums
//! - [`error`]: Error types
//!
//! ## Example
//!
//! ```rust
//! use bzkit_core::bitstream::BitReader;
//! use bzkit_core::crc::Crc32;
//! use std::io::Cursor;
//!
//! // Read bits from data
//! let data = vec![0xAB, 0xCD];
//! let mut reader = BitReader::new(Cursor::new(data));
//! assert_eq!(reader.read_bits(12).unwrap(), 0xABC);
//!
//! // Compute a BZip2 CRC-32
//! let crc = Crc32::compute(b"Hello, World!");
//! assert_eq!(crc, 0xE6D8FEDF);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bitstream;
pub mod crc;
pub mod error;

// Re-exports for convenience
pub use bitstream::{BitBuffer, BitReader, BitWriter};
pub use crc::Crc32;
pub use error::{BzError, CrcScope, ErrorKind, Result};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bitstream::{BitBuffer, BitReader, BitWriter};
    pub use crate::crc::Crc32;
    pub use crate::error::{BzError, Result};
}
