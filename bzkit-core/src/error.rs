//! Error types for bzkit operations.
//!
//! Every failure the codec can report is a variant of [`BzError`]. Variants
//! are grouped into coarse [`ErrorKind`]s so callers can decide how to react
//! (bad input, integrity failure, truncated input, misuse, internal failure
//! or I/O) without matching every variant.

use std::fmt;
use std::io;
use thiserror::Error;

/// Which checksum failed to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcScope {
    /// The CRC stored in a block header.
    Block,
    /// The combined CRC stored in the stream trailer.
    Stream,
}

impl fmt::Display for CrcScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrcScope::Block => f.write_str("block"),
            CrcScope::Stream => f.write_str("stream"),
        }
    }
}

/// Coarse classification of a [`BzError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The compressed data is malformed.
    Format,
    /// A checksum did not match.
    Integrity,
    /// Input ended in the middle of a field.
    UnexpectedEof,
    /// The API was used incorrectly (bad configuration, write after finish).
    Usage,
    /// An invariant inside the codec was violated.
    Internal,
    /// The underlying reader or writer failed.
    Io,
}

/// The main error type for bzkit operations.
#[derive(Debug, Error)]
pub enum BzError {
    /// I/O error from underlying reader/writer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid magic number in a stream or block header.
    #[error("Invalid magic number: expected {expected:02x?}, found {found:02x?}")]
    InvalidMagic {
        /// Expected magic bytes.
        expected: Vec<u8>,
        /// Actual magic bytes found.
        found: Vec<u8>,
    },

    /// Invalid header field.
    #[error("Invalid header: {message}")]
    InvalidHeader {
        /// Description of the header error.
        message: String,
    },

    /// Corrupted compressed data.
    #[error("Corrupted data at bit {bit_position}: {message}")]
    CorruptedData {
        /// Bit position where corruption was detected.
        bit_position: u64,
        /// Description of the corruption.
        message: String,
    },

    /// A bit pattern that is not a code in the active Huffman table.
    #[error("Invalid Huffman code at bit position {bit_position}")]
    InvalidHuffmanCode {
        /// Bit position where the invalid code was found.
        bit_position: u64,
    },

    /// Block or stream CRC mismatch.
    #[error("{scope} CRC mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch {
        /// Which checksum failed.
        scope: CrcScope,
        /// CRC value stored in the stream.
        expected: u32,
        /// CRC value computed from the decoded data.
        computed: u32,
    },

    /// Input ended before a field was complete.
    #[error("Unexpected end of input at bit position {bit_position}")]
    UnexpectedEof {
        /// Number of bits consumed when the input ran out.
        bit_position: u64,
    },

    /// Invalid configuration value.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the problem.
        message: String,
    },

    /// The encoder was used after `finish`.
    #[error("Encoder already finished")]
    Finished,

    /// Internal invariant violation.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// A previous failure left the encoder or decoder unusable.
    #[error("Stream poisoned by an earlier failure")]
    Poisoned,
}

/// Result type alias for bzkit operations.
pub type Result<T> = std::result::Result<T, BzError>;

impl BzError {
    /// Create an invalid magic error.
    pub fn invalid_magic(expected: impl Into<Vec<u8>>, found: impl Into<Vec<u8>>) -> Self {
        Self::InvalidMagic {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Create an invalid header error.
    pub fn invalid_header(message: impl Into<String>) -> Self {
        Self::InvalidHeader {
            message: message.into(),
        }
    }

    /// Create a corrupted data error.
    pub fn corrupted(bit_position: u64, message: impl Into<String>) -> Self {
        Self::CorruptedData {
            bit_position,
            message: message.into(),
        }
    }

    /// Create an invalid Huffman code error.
    pub fn invalid_huffman(bit_position: u64) -> Self {
        Self::InvalidHuffmanCode { bit_position }
    }

    /// Create a CRC mismatch error.
    pub fn crc_mismatch(scope: CrcScope, expected: u32, computed: u32) -> Self {
        Self::CrcMismatch {
            scope,
            expected,
            computed,
        }
    }

    /// Create an unexpected EOF error.
    pub fn unexpected_eof(bit_position: u64) -> Self {
        Self::UnexpectedEof { bit_position }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BzError::InvalidMagic { .. }
            | BzError::InvalidHeader { .. }
            | BzError::CorruptedData { .. }
            | BzError::InvalidHuffmanCode { .. } => ErrorKind::Format,
            BzError::CrcMismatch { .. } => ErrorKind::Integrity,
            BzError::UnexpectedEof { .. } => ErrorKind::UnexpectedEof,
            BzError::InvalidConfig { .. } | BzError::Finished => ErrorKind::Usage,
            BzError::Internal { .. } | BzError::Poisoned => ErrorKind::Internal,
            BzError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<BzError> for io::Error {
    fn from(err: BzError) -> Self {
        let kind = match err.kind() {
            ErrorKind::Format | ErrorKind::Integrity => io::ErrorKind::InvalidData,
            ErrorKind::UnexpectedEof => io::ErrorKind::UnexpectedEof,
            ErrorKind::Usage => io::ErrorKind::InvalidInput,
            ErrorKind::Internal => io::ErrorKind::Other,
            ErrorKind::Io => match err {
                BzError::Io(inner) => return inner,
                _ => io::ErrorKind::Other,
            },
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BzError::invalid_magic(b"BZh".to_vec(), vec![0x1F, 0x8B, 0x08]);
        assert!(err.to_string().contains("Invalid magic"));

        let err = BzError::crc_mismatch(CrcScope::Block, 0x12345678, 0xDEADBEEF);
        let msg = err.to_string();
        assert!(msg.contains("block CRC mismatch"));
        assert!(msg.contains("0x12345678"));

        let err = BzError::unexpected_eof(42);
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(BzError::invalid_header("x").kind(), ErrorKind::Format);
        assert_eq!(BzError::corrupted(0, "x").kind(), ErrorKind::Format);
        assert_eq!(BzError::invalid_huffman(0).kind(), ErrorKind::Format);
        assert_eq!(
            BzError::crc_mismatch(CrcScope::Stream, 1, 2).kind(),
            ErrorKind::Integrity
        );
        assert_eq!(BzError::unexpected_eof(0).kind(), ErrorKind::UnexpectedEof);
        assert_eq!(BzError::invalid_config("x").kind(), ErrorKind::Usage);
        assert_eq!(BzError::Finished.kind(), ErrorKind::Usage);
        assert_eq!(BzError::Poisoned.kind(), ErrorKind::Internal);
        assert_eq!(BzError::internal("x").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: BzError = io_err.into();
        assert!(matches!(err, BzError::Io(_)));

        let back: io::Error = err.into();
        assert_eq!(back.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_into_io_error_kinds() {
        let e: io::Error = BzError::crc_mismatch(CrcScope::Block, 1, 2).into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);

        let e: io::Error = BzError::unexpected_eof(8).into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e: io::Error = BzError::Finished.into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidInput);

        let inner = e.into_inner().expect("source error kept");
        assert!(inner.downcast_ref::<BzError>().is_some());
    }
}
