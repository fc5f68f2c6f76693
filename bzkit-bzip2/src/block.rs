//! Stage-1 block accumulator.
//!
//! Input bytes are folded into the block with the first run-length stage:
//! runs of 4 to 255 equal bytes are stored as four literal bytes followed by
//! a count byte (`run - 4`). The block also tracks which byte values occur
//! and the CRC of the uncompressed bytes it represents.

use crate::CompressionLevel;
use crate::randomize;
use bzkit_core::Crc32;

/// Bytes past the end of the block the sorter may read.
pub const BLOCK_OVERSHOOT: usize = 34;

/// One block of RLE1 bytes awaiting compression.
#[derive(Debug, Clone)]
pub struct Block {
    /// Block bytes; sized `block_size + BLOCK_OVERSHOOT`.
    data: Vec<u8>,
    len: usize,
    max_len: usize,
    in_use: [bool; 256],
    crc: Crc32,
    randomised: bool,
}

impl Block {
    /// Create an empty block for the given level.
    pub fn new(level: CompressionLevel) -> Self {
        Self {
            data: vec![0; level.block_size() + BLOCK_OVERSHOOT],
            len: 0,
            max_len: level.max_block_len(),
            in_use: [false; 256],
            crc: Crc32::new(),
            randomised: false,
        }
    }

    /// Number of RLE1 bytes stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no bytes are stored.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once the block must be compressed before taking more input.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len >= self.max_len
    }

    /// The stored bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The stored bytes plus the sorter's overshoot area.
    pub(crate) fn bytes_with_overshoot_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len + BLOCK_OVERSHOOT]
    }

    /// Byte values present in the block.
    pub fn in_use(&self) -> &[bool; 256] {
        &self.in_use
    }

    /// CRC of the uncompressed bytes folded into this block.
    pub fn crc(&self) -> u32 {
        self.crc.value()
    }

    /// Whether the block bytes have been randomised.
    pub fn is_randomised(&self) -> bool {
        self.randomised
    }

    /// Flip the randomisation mask over the block.
    pub fn randomise(&mut self) {
        randomize::randomise(&mut self.data[..self.len], &mut self.in_use);
        self.randomised = true;
    }

    /// Forget the contents so the block can be refilled.
    pub fn reset(&mut self) {
        self.len = 0;
        self.in_use = [false; 256];
        self.crc.reset();
        self.randomised = false;
    }

    #[inline(always)]
    fn push_literal(&mut self, byte: u8) {
        self.data[self.len] = byte;
        self.len += 1;
    }

    /// Store a single occurrence of `byte`.
    #[inline]
    fn push_single(&mut self, byte: u8) {
        self.crc.update_byte(byte);
        self.in_use[byte as usize] = true;
        self.push_literal(byte);
    }

    /// Store a run of `count` (1..=255) copies of `byte`.
    fn push_run(&mut self, byte: u8, count: u8) {
        debug_assert!(count >= 1);
        self.crc.update_repeated(byte, count as usize);
        self.in_use[byte as usize] = true;
        match count {
            1..=3 => {
                for _ in 0..count {
                    self.push_literal(byte);
                }
            }
            _ => {
                for _ in 0..4 {
                    self.push_literal(byte);
                }
                let extra = count - 4;
                self.in_use[extra as usize] = true;
                self.push_literal(extra);
            }
        }
    }
}

/// The run currently being accumulated.
///
/// A run is only committed to a block when it ends, so it survives a block
/// boundary: when a block fills up mid-run, the run continues into the next
/// block.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    byte: Option<u8>,
    count: u8,
}

impl RunState {
    /// No pending run.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no run is pending.
    pub fn is_empty(&self) -> bool {
        self.byte.is_none() || self.count == 0
    }

    /// Feed one input byte.
    #[inline]
    pub fn push(&mut self, byte: u8, block: &mut Block) {
        match self.byte {
            Some(current) if current == byte && self.count < 255 => {
                self.count += 1;
            }
            Some(current) if self.count == 1 => {
                block.push_single(current);
                self.byte = Some(byte);
            }
            Some(current) => {
                block.push_run(current, self.count);
                self.byte = Some(byte);
                self.count = 1;
            }
            None => {
                self.byte = Some(byte);
                self.count = 1;
            }
        }
    }

    /// Commit the pending run to `block`.
    pub fn flush(&mut self, block: &mut Block) {
        if let Some(byte) = self.byte.take() {
            if self.count > 0 {
                block.push_run(byte, self.count);
            }
        }
        self.count = 0;
    }

    /// Feed bytes from `input` until it is exhausted or `block` is full.
    ///
    /// Returns the number of bytes consumed.
    pub fn fill(&mut self, block: &mut Block, input: &[u8]) -> usize {
        let mut consumed = 0;
        for &byte in input {
            if block.is_full() {
                break;
            }
            self.push(byte, block);
            consumed += 1;
        }
        consumed
    }
}
