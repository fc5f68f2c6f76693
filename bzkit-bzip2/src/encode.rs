//! BZip2 encoder.

use crate::block::{Block, RunState};
use crate::bwt::BlockSorter;
use crate::mtf::{MtfEncoder, MtfOutput};
use crate::tables::CodingTables;
use crate::{CompressionLevel, framing};
use bzkit_core::{BitWriter, BzError, Result, crc};
use log::debug;
use std::io::{self, Write};

/// Scratch buffers for compressing blocks of one size.
///
/// A workspace is sized once from the compression level and reused for
/// every block; the parallel encoder keeps one per work unit.
#[derive(Debug, Clone)]
pub struct EncodeWorkspace {
    level: CompressionLevel,
    sorter: BlockSorter,
    mtf: MtfEncoder,
    symbols: MtfOutput,
    tables: CodingTables,
}

impl EncodeWorkspace {
    /// Allocate a workspace for blocks of `level`.
    pub fn new(level: CompressionLevel) -> Self {
        let capacity = level.block_size();
        Self {
            level,
            sorter: BlockSorter::new(capacity),
            mtf: MtfEncoder::new(),
            symbols: MtfOutput::with_capacity(capacity),
            tables: CodingTables::new(),
        }
    }

    /// The level this workspace was sized for.
    pub fn level(&self) -> CompressionLevel {
        self.level
    }
}

/// Compress one non-empty block and append it to `out`.
///
/// The block may be randomised in place. Returns the block CRC.
pub(crate) fn compress_block<W: Write>(
    block: &mut Block,
    ws: &mut EncodeWorkspace,
    out: &mut BitWriter<W>,
    block_no: u64,
) -> Result<u32> {
    if block.is_empty() {
        return Err(BzError::internal("attempted to compress an empty block"));
    }

    let block_crc = block.crc();
    let orig_ptr = ws.sorter.sort_block(block)?;

    ws.mtf
        .encode(block.bytes(), ws.sorter.ptr(), block.in_use(), &mut ws.symbols);
    ws.tables.build(&ws.symbols);

    let start = out.bits_written();
    framing::write_block_header(out, block_crc, block.is_randomised(), orig_ptr)?;
    framing::write_mapping_table(out, block.in_use())?;
    framing::write_tables(out, &ws.tables)?;
    framing::write_symbols(out, &ws.symbols.symbols, &ws.tables)?;

    debug!(
        "block {}: level {}, {} bytes -> {} bits, orig_ptr {}, crc {:#010x}, {} tables, {} selectors{}",
        block_no,
        ws.level.level(),
        block.len(),
        out.bits_written() - start,
        orig_ptr,
        block_crc,
        ws.tables.n_groups,
        ws.tables.selectors.len(),
        if block.is_randomised() { ", randomised" } else { "" }
    );

    Ok(block_crc)
}

/// BZip2 encoder.
///
/// Bytes written are folded into blocks of the configured size; each full
/// block is compressed and written before `write` returns. Call
/// [`BzEncoder::finish`] to compress the last block and write the trailer.
pub struct BzEncoder<W: Write> {
    writer: BitWriter<W>,
    block: Block,
    run: RunState,
    workspace: EncodeWorkspace,
    combined_crc: u32,
    blocks: u64,
    total_in: u64,
    finished: bool,
    poisoned: bool,
}

impl<W: Write> BzEncoder<W> {
    /// Create a new encoder and write the stream header.
    pub fn new(writer: W, level: CompressionLevel) -> Result<Self> {
        Self::with_workspace(writer, EncodeWorkspace::new(level))
    }

    /// Create an encoder that reuses `workspace`; the level is the
    /// workspace's.
    pub fn with_workspace(writer: W, workspace: EncodeWorkspace) -> Result<Self> {
        let level = workspace.level();
        let mut bit_writer = BitWriter::new(writer);
        framing::write_stream_header(&mut bit_writer, level)?;

        Ok(Self {
            writer: bit_writer,
            block: Block::new(level),
            run: RunState::new(),
            workspace,
            combined_crc: 0,
            blocks: 0,
            total_in: 0,
            finished: false,
            poisoned: false,
        })
    }

    /// The compression level.
    pub fn level(&self) -> CompressionLevel {
        self.workspace.level()
    }

    /// Uncompressed bytes accepted so far.
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// Compressed bytes produced so far, including bytes still staged.
    pub fn total_out(&self) -> u64 {
        self.writer.bits_written() / 8
    }

    /// Reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }

    /// Mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        self.writer.get_mut()
    }

    fn check_open(&self) -> Result<()> {
        if self.poisoned {
            Err(BzError::Poisoned)
        } else if self.finished {
            Err(BzError::Finished)
        } else {
            Ok(())
        }
    }

    fn poison_on_err<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Feed uncompressed bytes.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let result = self.fold(data);
        self.poison_on_err(result)
    }

    fn fold(&mut self, data: &[u8]) -> Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let consumed = self.run.fill(&mut self.block, rest);
            rest = &rest[consumed..];
            self.total_in += consumed as u64;
            if self.block.is_full() {
                self.flush_block()?;
            }
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.block.is_empty() {
            return Ok(());
        }
        let block_crc = compress_block(
            &mut self.block,
            &mut self.workspace,
            &mut self.writer,
            self.blocks,
        )?;
        self.combined_crc = crc::combine(self.combined_crc, block_crc);
        self.blocks += 1;
        self.block.reset();
        Ok(())
    }

    /// Compress the last block, write the trailer and flush the sink.
    ///
    /// Further writes fail with [`BzError::Finished`]; calling this again
    /// does nothing.
    pub fn try_finish(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(BzError::Poisoned);
        }
        if self.finished {
            return Ok(());
        }
        let result = self.finish_stream();
        self.poison_on_err(result)?;
        self.finished = true;
        Ok(())
    }

    fn finish_stream(&mut self) -> Result<()> {
        self.run.flush(&mut self.block);
        self.flush_block()?;
        framing::write_stream_trailer(&mut self.writer, self.combined_crc)?;
        self.writer.flush()?;
        debug!(
            "stream finished: {} blocks, {} bytes in, {} bytes out, crc {:#010x}",
            self.blocks,
            self.total_in,
            self.total_out(),
            self.combined_crc
        );
        Ok(())
    }

    /// Finish the stream and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.try_finish()?;
        self.writer.finish()
    }
}

impl<W: Write> Write for BzEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf)?;
        Ok(buf.len())
    }

    /// Push completed bytes to the sink. The current block stays open, so
    /// flushing does not change the compressed output.
    fn flush(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(BzError::Poisoned.into());
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Compress `data` into a single BZip2 stream.
pub fn compress(data: &[u8], level: CompressionLevel) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), level)?;
    encoder.write_data(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress;

    fn text(len: usize) -> Vec<u8> {
        let words = [
            "block", "sort", "huffman", "table", "stream", "rotation", "pointer", "zero", "run",
            "the", "of", "and",
        ];
        let mut state = 12345u32;
        let mut out = Vec::with_capacity(len + 16);
        while out.len() < len {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
            out.extend_from_slice(words[(state >> 16) as usize % words.len()].as_bytes());
            out.push(b' ');
        }
        out.truncate(len);
        out
    }

    #[test]
    fn test_header() {
        let compressed = compress(b"x", CompressionLevel::new(3).unwrap()).unwrap();
        assert_eq!(&compressed[..4], b"BZh3");
        assert_eq!(&compressed[4..10], &crate::BLOCK_MAGIC);
    }

    #[test]
    fn test_counters() {
        let data = text(5000);
        let mut encoder = BzEncoder::new(Vec::new(), CompressionLevel::FASTEST).unwrap();
        encoder.write_all(&data).unwrap();
        assert_eq!(encoder.total_in(), 5000);
        encoder.try_finish().unwrap();
        let out_len = encoder.total_out();
        let compressed = encoder.finish().unwrap();
        assert_eq!(compressed.len() as u64, out_len);
    }

    #[test]
    fn test_write_after_finish() {
        let mut encoder = BzEncoder::new(Vec::new(), CompressionLevel::FASTEST).unwrap();
        encoder.write_all(b"abc").unwrap();
        encoder.try_finish().unwrap();
        encoder.try_finish().unwrap();
        let err = encoder.write_data(b"more").unwrap_err();
        assert!(matches!(err, BzError::Finished));
        let io_err = encoder.write(b"more").unwrap_err();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_flush_keeps_block_open() {
        let data = text(20_000);
        let expected = compress(&data, CompressionLevel::FASTEST).unwrap();

        let mut encoder = BzEncoder::new(Vec::new(), CompressionLevel::FASTEST).unwrap();
        for chunk in data.chunks(777) {
            encoder.write_all(chunk).unwrap();
            encoder.flush().unwrap();
        }
        assert_eq!(encoder.finish().unwrap(), expected);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let mut data = text(150_000);
        data.extend(std::iter::repeat_n(b'q', 3000));
        let expected = compress(&data, CompressionLevel::FASTEST).unwrap();

        let mut encoder = BzEncoder::new(Vec::new(), CompressionLevel::FASTEST).unwrap();
        for chunk in data.chunks(4093) {
            encoder.write_all(chunk).unwrap();
        }
        assert_eq!(encoder.finish().unwrap(), expected);
    }

    #[test]
    fn test_multiple_blocks() {
        let data = text(250_000);
        let compressed = compress(&data, CompressionLevel::FASTEST).unwrap();
        assert!(compressed.len() < data.len() / 2);
        assert_eq!(decompress(&compressed[..]).unwrap(), data);
    }

    #[test]
    fn test_run_across_block_boundary() {
        let level = CompressionLevel::FASTEST;
        let mut data = text(level.max_block_len() - 2);
        data.extend(std::iter::repeat_n(b'z', 600));
        data.extend_from_slice(b"tail");
        let compressed = compress(&data, level).unwrap();
        assert_eq!(decompress(&compressed[..]).unwrap(), data);
    }

    #[test]
    fn test_workspace_reuse() {
        let ws = EncodeWorkspace::new(CompressionLevel::new(2).unwrap());
        let mut encoder = BzEncoder::with_workspace(Vec::new(), ws).unwrap();
        assert_eq!(encoder.level().level(), 2);
        encoder.write_all(b"reuse").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(&compressed[..4], b"BZh2");
        assert_eq!(decompress(&compressed[..]).unwrap(), b"reuse");
    }
}
