//! BZip2 compression/decompression for bzkit.
//!
//! This crate provides a pure Rust implementation of the BZip2 format whose
//! output is bit-for-bit interchangeable with the reference `bzip2` tools.
//!
//! BZip2 uses a pipeline of transformations:
//! 1. Run-Length Encoding (RLE1) - runs of 4..=255 equal bytes are folded
//! 2. Burrows-Wheeler Transform (BWT) - block sorting groups similar contexts
//! 3. Move-to-Front Transform (MTF) - locality becomes small ranks
//! 4. Zero-Run Length Encoding - runs of rank 0 become RUNA/RUNB digits
//! 5. Huffman Coding - up to 6 tables, switched every 50 symbols
//!
//! Blocks are independent, so [`ParallelBzEncoder`] compresses them on a
//! thread pool and stitches the results back together in order; its output
//! is identical to [`BzEncoder`]'s.
//!
//! ## Example
//!
//! ```
//! use bzkit_bzip2::{CompressionLevel, compress, decompress};
//!
//! let data = b"Hello, BZip2! Hello, BZip2! Hello, BZip2!";
//! let level = CompressionLevel::new(1).unwrap();
//! let compressed = compress(data, level).unwrap();
//! assert_eq!(&compressed[..3], b"BZh");
//! assert_eq!(decompress(&compressed[..]).unwrap(), data);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod block;
/// Burrows-Wheeler Transform and the block sorter.
pub mod bwt;
mod decode;
mod encode;
mod framing;
/// Huffman code construction and decoding tables.
pub mod huffman;
mod mtf;
#[cfg(feature = "parallel")]
mod parallel;
mod randomize;
mod rle;
mod tables;

pub use bzkit_core::{BzError, CrcScope, ErrorKind, Result};
pub use decode::{BzDecoder, DecodeWorkspace, decompress, decompress_multi};
pub use encode::{BzEncoder, EncodeWorkspace, compress};

#[cfg(feature = "parallel")]
pub use parallel::{ParallelBzEncoder, ParallelOptions, compress_parallel};

/// BZip2 magic bytes ("BZ").
pub const BZIP2_MAGIC: [u8; 2] = [0x42, 0x5A];

/// Block header magic bytes (0x314159265359, the BCD digits of pi).
pub const BLOCK_MAGIC: [u8; 6] = [0x31, 0x41, 0x59, 0x26, 0x53, 0x59];

/// End of stream magic bytes (0x177245385090, the BCD digits of sqrt(pi)).
pub const EOS_MAGIC: [u8; 6] = [0x17, 0x72, 0x45, 0x38, 0x50, 0x90];

/// Maximum block size (900k).
pub const MAX_BLOCK_SIZE: usize = 900_000;

/// Compression level (1-9, where 9 = 900k block size).
///
/// The level only selects the block size; every level uses the same
/// algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompressionLevel(u8);

impl CompressionLevel {
    /// Smallest blocks, least memory.
    pub const FASTEST: Self = Self(1);
    /// Largest blocks, usually the best ratio.
    pub const BEST: Self = Self(9);

    /// Create a compression level. Values outside 1..=9 are rejected.
    pub fn new(level: u8) -> Result<Self> {
        if (1..=9).contains(&level) {
            Ok(Self(level))
        } else {
            Err(BzError::invalid_config(format!(
                "compression level must be in 1..=9, got {}",
                level
            )))
        }
    }

    /// Get the block size for this level.
    pub fn block_size(&self) -> usize {
        self.0 as usize * 100_000
    }

    /// Number of RLE1 bytes at which a block counts as full.
    ///
    /// One run adds at most 5 bytes, so a block never grows past
    /// [`CompressionLevel::block_size`].
    pub fn max_block_len(&self) -> usize {
        self.block_size() - 19
    }

    /// Get the level value.
    pub fn level(&self) -> u8 {
        self.0
    }
}

impl Default for CompressionLevel {
    fn default() -> Self {
        Self::BEST
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_level() {
        let level = CompressionLevel::new(5).unwrap();
        assert_eq!(level.level(), 5);
        assert_eq!(level.block_size(), 500_000);
        assert_eq!(level.max_block_len(), 499_981);
    }

    #[test]
    fn test_compression_level_out_of_range() {
        for bad in [0u8, 10, 255] {
            let err = CompressionLevel::new(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn test_default_level() {
        let level = CompressionLevel::default();
        assert_eq!(level.level(), 9);
        assert_eq!(level.block_size(), MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_roundtrip_single_byte() {
        let compressed = compress(b"a", CompressionLevel::FASTEST).unwrap();
        assert_eq!(decompress(&compressed[..]).unwrap(), b"a");
    }

    #[test]
    fn test_roundtrip_repeated() {
        let original = b"aaaaaaaaaabbbbbbbbbbcccccccccc";
        let compressed = compress(original, CompressionLevel::FASTEST).unwrap();
        let decompressed = decompress(&compressed[..]).unwrap();
        assert_eq!(decompressed, original.as_slice());
    }

    #[test]
    fn test_roundtrip_empty() {
        let compressed = compress(b"", CompressionLevel::FASTEST).unwrap();
        assert_eq!(compressed, b"BZh1\x17\x72\x45\x38\x50\x90\x00\x00\x00\x00");
        assert!(decompress(&compressed[..]).unwrap().is_empty());
    }
}
