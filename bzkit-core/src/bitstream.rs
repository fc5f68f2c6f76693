//! Bit-level I/O for the BZip2 wire format.
//!
//! This module provides [`BitReader`] and [`BitWriter`] for reading and
//! writing fields of up to 32 bits, plus [`BitBuffer`], a detached in-memory
//! bit string used to splice independently compressed blocks together.
//!
//! # Bit Ordering
//!
//! BZip2 packs bits MSB-first: the first bit written lands in the most
//! significant bit of the first byte, and multi-bit fields are stored with
//! their most significant bit first.
//!
//! # Example
//!
//! ```
//! use bzkit_core::bitstream::{BitReader, BitWriter};
//! use std::io::Cursor;
//!
//! let mut writer = BitWriter::new(Vec::new());
//! writer.write_bits(0b101, 3).unwrap();
//! writer.write_bits(0b1100, 4).unwrap();
//! let output = writer.finish().unwrap();
//! assert_eq!(output, vec![0b1011_1000]);
//!
//! let mut reader = BitReader::new(Cursor::new(&output));
//! assert_eq!(reader.read_bits(3).unwrap(), 0b101);
//! assert_eq!(reader.read_bits(4).unwrap(), 0b1100);
//! ```

use crate::error::{BzError, Result};
use std::io::{self, Read, Write};

/// Bytes staged by a [`BitWriter`] before they are handed to the sink.
const STAGE_CAPACITY: usize = 8192;

#[inline(always)]
fn low_mask(count: u8) -> u64 {
    (1u64 << count).wrapping_sub(1)
}

/// A bit-level reader that wraps any `Read` implementation.
///
/// Bytes are pulled from the source one at a time, only when the requested
/// field cannot be served from bits already held. The reader never consumes
/// more of the source than the bits asked for require, so the source can be
/// handed back with [`BitReader::into_inner`] positioned right after the last
/// byte touched.
#[derive(Debug)]
pub struct BitReader<R: Read> {
    /// Underlying reader.
    reader: R,
    /// Bit buffer; the low `bits_in_buffer` bits are pending, oldest highest.
    buffer: u64,
    /// Number of valid bits in buffer.
    bits_in_buffer: u8,
    /// Total bits consumed by callers.
    total_bits_read: u64,
}

impl<R: Read> BitReader<R> {
    /// Create a new `BitReader` wrapping the given reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: 0,
            bits_in_buffer: 0,
            total_bits_read: 0,
        }
    }

    /// Get a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Get a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consume this `BitReader` and return the underlying reader.
    ///
    /// Bits already pulled into the internal buffer are lost.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Get the total number of bits read so far.
    pub fn bits_read(&self) -> u64 {
        self.total_bits_read
    }

    /// Get the current bit position (for error reporting).
    pub fn bit_position(&self) -> u64 {
        self.total_bits_read
    }

    /// Pull one byte from the source, `None` at end of input.
    fn next_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    #[inline]
    fn fill_buffer(&mut self, count: u8) -> Result<()> {
        while self.bits_in_buffer < count {
            match self.next_byte()? {
                Some(byte) => {
                    self.buffer = (self.buffer << 8) | byte as u64;
                    self.bits_in_buffer += 8;
                }
                None => return Err(BzError::unexpected_eof(self.total_bits_read)),
            }
        }
        Ok(())
    }

    /// Read up to 32 bits from the stream.
    ///
    /// The first bit read ends up in the most significant position of the
    /// returned value.
    #[inline]
    pub fn read_bits(&mut self, count: u8) -> Result<u32> {
        debug_assert!(count <= 32, "Cannot read more than 32 bits at once");

        if count == 0 {
            return Ok(0);
        }

        self.fill_buffer(count)?;

        let shift = self.bits_in_buffer - count;
        let result = ((self.buffer >> shift) & low_mask(count)) as u32;
        self.bits_in_buffer = shift;
        self.total_bits_read += count as u64;

        Ok(result)
    }

    /// Read a single bit.
    #[inline]
    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Read an 8-bit field.
    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bits(8)? as u8)
    }

    /// Align to the next byte boundary by discarding partial bits.
    pub fn align_to_byte(&mut self) {
        let remainder = self.bits_in_buffer % 8;
        if remainder > 0 {
            self.bits_in_buffer -= remainder;
            self.total_bits_read += remainder as u64;
        }
    }

    /// Check if the reader is at end of stream.
    ///
    /// Returns `false` while buffered bits remain; otherwise attempts to
    /// pull one more byte from the source.
    pub fn is_eof(&mut self) -> Result<bool> {
        if self.bits_in_buffer > 0 {
            return Ok(false);
        }

        match self.next_byte()? {
            Some(byte) => {
                self.buffer = byte as u64;
                self.bits_in_buffer = 8;
                Ok(false)
            }
            None => Ok(true),
        }
    }
}

/// A detached bit string: whole bytes followed by up to 7 trailing bits.
///
/// Produced by [`BitWriter::take_bits`] and appended to another writer with
/// [`BitWriter::write_bit_buffer`] at any bit alignment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitBuffer {
    /// Complete bytes, MSB-first.
    pub bytes: Vec<u8>,
    /// Trailing bits, right-aligned in the low `tail_bits` bits.
    pub tail: u8,
    /// Number of valid bits in `tail` (0..=7).
    pub tail_bits: u8,
}

impl BitBuffer {
    /// Total length in bits.
    pub fn bit_len(&self) -> u64 {
        self.bytes.len() as u64 * 8 + self.tail_bits as u64
    }

    /// True if the buffer holds no bits.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.tail_bits == 0
    }

    /// Clear the contents, keeping the byte allocation.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.tail = 0;
        self.tail_bits = 0;
    }
}

/// A bit-level writer that wraps any `Write` implementation.
///
/// Complete bytes are staged internally and written to the sink in chunks.
/// [`BitWriter::flush`] pushes every complete byte out but keeps a partial
/// byte pending; [`BitWriter::finish`] pads it with zero bits and returns
/// the sink. Dropping a writer without finishing it discards pending bits.
#[derive(Debug)]
pub struct BitWriter<W: Write> {
    /// Underlying writer.
    writer: W,
    /// Complete bytes not yet handed to the writer.
    stage: Vec<u8>,
    /// Bit buffer; the low `bits_in_buffer` bits are pending, oldest highest.
    buffer: u64,
    /// Number of bits in buffer (always < 8 between calls).
    bits_in_buffer: u8,
    /// Total bits written.
    total_bits_written: u64,
}

impl<W: Write> BitWriter<W> {
    /// Create a new `BitWriter` wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            stage: Vec::with_capacity(STAGE_CAPACITY),
            buffer: 0,
            bits_in_buffer: 0,
            total_bits_written: 0,
        }
    }

    /// Get a reference to the underlying writer.
    ///
    /// Staged bytes are not visible through the writer until a flush.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Get a mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Get the total number of bits written so far.
    pub fn bits_written(&self) -> u64 {
        self.total_bits_written
    }

    #[inline]
    fn stage_bytes(&mut self) -> Result<()> {
        while self.bits_in_buffer >= 8 {
            self.bits_in_buffer -= 8;
            self.stage.push((self.buffer >> self.bits_in_buffer) as u8);
        }
        if self.stage.len() >= STAGE_CAPACITY {
            self.drain_stage()?;
        }
        Ok(())
    }

    fn drain_stage(&mut self) -> Result<()> {
        if !self.stage.is_empty() {
            self.writer.write_all(&self.stage)?;
            self.stage.clear();
        }
        Ok(())
    }

    /// Write the low `count` bits of `value`, most significant first.
    #[inline]
    pub fn write_bits(&mut self, value: u32, count: u8) -> Result<()> {
        debug_assert!(count <= 32, "Cannot write more than 32 bits at once");

        if count == 0 {
            return Ok(());
        }

        self.buffer = (self.buffer << count) | (value as u64 & low_mask(count));
        self.bits_in_buffer += count;
        self.total_bits_written += count as u64;

        self.stage_bytes()
    }

    /// Write a single bit.
    #[inline]
    pub fn write_bit(&mut self, bit: bool) -> Result<()> {
        self.write_bits(bit as u32, 1)
    }

    /// Write an 8-bit field.
    #[inline]
    pub fn write_u8(&mut self, byte: u8) -> Result<()> {
        self.write_bits(byte as u32, 8)
    }

    /// Append a detached bit string at the current bit position.
    pub fn write_bit_buffer(&mut self, bits: &BitBuffer) -> Result<()> {
        if self.bits_in_buffer == 0 {
            self.drain_stage()?;
            self.writer.write_all(&bits.bytes)?;
            self.total_bits_written += bits.bytes.len() as u64 * 8;
        } else {
            for &byte in &bits.bytes {
                self.write_bits(byte as u32, 8)?;
            }
        }
        self.write_bits(bits.tail as u32, bits.tail_bits)
    }

    /// Write every complete byte to the writer and flush it.
    ///
    /// Up to 7 bits of a partial byte stay pending.
    pub fn flush(&mut self) -> Result<()> {
        self.drain_stage()?;
        self.writer.flush()?;
        Ok(())
    }

    /// Pad the pending partial byte with zeros.
    pub fn align_to_byte(&mut self) -> Result<()> {
        let remainder = self.bits_in_buffer % 8;
        if remainder != 0 {
            self.write_bits(0, 8 - remainder)?;
        }
        Ok(())
    }

    /// Pad to a byte boundary, flush everything and return the writer.
    pub fn finish(mut self) -> Result<W> {
        self.align_to_byte()?;
        self.flush()?;
        Ok(self.writer)
    }

    /// Alias for [`BitWriter::finish`].
    pub fn into_inner(self) -> Result<W> {
        self.finish()
    }
}

impl BitWriter<Vec<u8>> {
    /// Detach everything written so far as a [`BitBuffer`], leaving the
    /// writer empty (and its allocations ready for reuse).
    pub fn take_bits(&mut self) -> BitBuffer {
        let mut bytes = std::mem::take(&mut self.writer);
        bytes.append(&mut self.stage);

        let tail_bits = self.bits_in_buffer;
        let tail = (self.buffer & low_mask(tail_bits)) as u8;

        self.buffer = 0;
        self.bits_in_buffer = 0;
        self.total_bits_written = 0;

        BitBuffer {
            bytes,
            tail,
            tail_bits,
        }
    }

    /// Return a previously taken buffer's allocation to this writer.
    pub fn recycle(&mut self, mut bits: BitBuffer) {
        if self.writer.is_empty() && self.writer.capacity() < bits.bytes.capacity() {
            bits.bytes.clear();
            self.writer = bits.bytes;
        }
    }
}
