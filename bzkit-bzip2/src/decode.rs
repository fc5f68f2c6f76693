//! BZip2 decoder.
//!
//! Decoding is pull-based. Each block is Huffman-decoded, un-MTF'd and
//! zero-run expanded into `tt`, which is then threaded with the inverse BWT
//! links so the original bytes can be walked in order. The first-stage run
//! expansion happens lazily as the caller reads, driven by a small state
//! machine that can stop and resume at any byte.

use crate::framing::{self, Marker};
use crate::huffman::{DecodeTable, GROUP_SIZE, MAX_GROUPS};
use crate::randomize::RandState;
use crate::rle::{RUNA, RUNB, ZeroRun};
use crate::CompressionLevel;
use bzkit_core::{BitReader, BzError, Crc32, CrcScope, Result, crc};
use log::{debug, trace};
use std::io::{self, Read};

const READ_CHUNK: usize = 64 * 1024;

/// Scratch buffers for decoding blocks.
///
/// Grows to the largest block size seen and can be handed from one decoder
/// to the next with [`BzDecoder::into_parts`] and
/// [`BzDecoder::with_workspace`].
#[derive(Debug, Clone)]
pub struct DecodeWorkspace {
    /// Low 8 bits: block byte; high 24 bits: inverse BWT link.
    tt: Vec<u32>,
    selectors: Vec<u8>,
    tables: [DecodeTable; MAX_GROUPS],
    seq_to_unseq: [u8; 256],
}

impl Default for DecodeWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeWorkspace {
    /// An empty workspace; buffers are allocated on first use.
    pub fn new() -> Self {
        Self {
            tt: Vec::new(),
            selectors: Vec::new(),
            tables: Default::default(),
            seq_to_unseq: [0; 256],
        }
    }

    /// A workspace with room for blocks of `level`.
    pub fn with_level(level: CompressionLevel) -> Self {
        let mut ws = Self::new();
        ws.reserve(level);
        ws
    }

    fn reserve(&mut self, level: CompressionLevel) {
        if self.tt.len() < level.block_size() {
            self.tt.resize(level.block_size(), 0);
        }
    }
}

/// Decode one block's symbols into `ws.tt` and link it for the inverse BWT.
///
/// Returns the block length and the starting position of the walk.
fn decode_block<R: Read>(
    r: &mut BitReader<R>,
    ws: &mut DecodeWorkspace,
    level: CompressionLevel,
    orig_ptr: u32,
) -> Result<(usize, u32)> {
    let DecodeWorkspace {
        tt,
        selectors,
        tables,
        seq_to_unseq,
    } = ws;

    let n_in_use = framing::read_mapping_table(r, seq_to_unseq)?;
    let alpha_size = n_in_use + 2;
    let eob = (alpha_size - 1) as u16;
    framing::read_tables(r, alpha_size, selectors, tables)?;

    let limit = level.block_size();
    let mut unzftab = [0u32; 256];
    let mut mtf: [u8; 256] = std::array::from_fn(|i| i as u8);
    let mut run = ZeroRun::new();
    let mut nblock = 0usize;

    let mut next_selector = 0usize;
    let mut group_left = 0usize;
    let mut table = &tables[0];

    loop {
        if group_left == 0 {
            let sel = *selectors
                .get(next_selector)
                .ok_or_else(|| BzError::corrupted(r.bit_position(), "ran out of selectors"))?;
            next_selector += 1;
            group_left = GROUP_SIZE;
            table = &tables[sel as usize];
        }
        group_left -= 1;

        let sym = table.decode_symbol(r)?;

        if sym == RUNA || sym == RUNB {
            run.push(sym, r.bit_position())?;
            continue;
        }

        if !run.is_empty() {
            let len = run.take() as usize;
            if len > limit - nblock {
                return Err(BzError::corrupted(r.bit_position(), "block overflows its size"));
            }
            let byte = seq_to_unseq[mtf[0] as usize];
            tt[nblock..nblock + len].fill(byte as u32);
            unzftab[byte as usize] += len as u32;
            nblock += len;
        }

        if sym == eob {
            break;
        }

        if nblock >= limit {
            return Err(BzError::corrupted(r.bit_position(), "block overflows its size"));
        }

        let nn = (sym - 1) as usize;
        let uc = mtf[nn];
        mtf.copy_within(0..nn, 1);
        mtf[0] = uc;

        let byte = seq_to_unseq[uc as usize];
        unzftab[byte as usize] += 1;
        tt[nblock] = byte as u32;
        nblock += 1;
    }

    if orig_ptr as usize >= nblock {
        return Err(BzError::corrupted(
            r.bit_position(),
            format!("original pointer {} outside block of {} bytes", orig_ptr, nblock),
        ));
    }

    // cftab[b] = number of block bytes smaller than b.
    let mut cftab = [0u32; 257];
    for i in 0..256 {
        cftab[i + 1] = cftab[i] + unzftab[i];
    }
    debug_assert_eq!(cftab[256] as usize, nblock);

    for i in 0..nblock {
        let b = (tt[i] & 0xff) as usize;
        tt[cftab[b] as usize] |= (i as u32) << 8;
        cftab[b] += 1;
    }

    Ok((nblock, tt[orig_ptr as usize] >> 8))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Eof,
    StartBlock,
    RandPartA,
    RandPartB,
    RandPartC,
    NoRandPartA,
    NoRandPartB,
    NoRandPartC,
}

/// BZip2 decoder.
///
/// Implements [`Read`]; bytes are produced on demand and input is pulled no
/// further than needed to decode the next block.
pub struct BzDecoder<R: Read> {
    reader: BitReader<R>,
    workspace: DecodeWorkspace,
    level: CompressionLevel,
    multi_stream: bool,
    state: State,
    poisoned: bool,

    // Current block.
    randomised: bool,
    rand: RandState,
    expected_crc: u32,
    crc: Crc32,
    t_pos: u32,
    used: usize,
    nblock: usize,
    last: Option<u8>,
    prev: Option<u8>,
    count: u8,
    run_left: u8,

    combined_crc: u32,
    blocks: u64,
    total_out: u64,
}

impl<R: Read> BzDecoder<R> {
    /// Create a decoder for a single stream, reading its header.
    ///
    /// Anything after the stream's trailer is left unread.
    pub fn new(reader: R) -> Result<Self> {
        Self::with_workspace(reader, DecodeWorkspace::new())
    }

    /// Create a decoder that continues through concatenated streams until
    /// the input ends.
    pub fn new_multi(reader: R) -> Result<Self> {
        let mut decoder = Self::new(reader)?;
        decoder.multi_stream = true;
        Ok(decoder)
    }

    /// Create a single-stream decoder reusing `workspace`.
    pub fn with_workspace(reader: R, mut workspace: DecodeWorkspace) -> Result<Self> {
        let mut reader = BitReader::new(reader);
        let level = framing::read_stream_header(&mut reader)?;
        workspace.reserve(level);

        Ok(Self {
            reader,
            workspace,
            level,
            multi_stream: false,
            state: State::StartBlock,
            poisoned: false,
            randomised: false,
            rand: RandState::new(),
            expected_crc: 0,
            crc: Crc32::new(),
            t_pos: 0,
            used: 0,
            nblock: 0,
            last: None,
            prev: None,
            count: 0,
            run_left: 0,
            combined_crc: 0,
            blocks: 0,
            total_out: 0,
        })
    }

    /// Block size of the current stream, in bytes.
    pub fn block_size(&self) -> usize {
        self.level.block_size()
    }

    /// Decompressed bytes produced so far.
    pub fn total_out(&self) -> u64 {
        self.total_out
    }

    /// Reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        self.reader.get_ref()
    }

    /// Return the reader and the workspace.
    pub fn into_parts(self) -> (R, DecodeWorkspace) {
        (self.reader.into_inner(), self.workspace)
    }

    /// Return the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    fn part_a(&self) -> State {
        if self.randomised {
            State::RandPartA
        } else {
            State::NoRandPartA
        }
    }

    fn part_b(&self) -> State {
        if self.randomised {
            State::RandPartB
        } else {
            State::NoRandPartB
        }
    }

    fn part_c(&self) -> State {
        if self.randomised {
            State::RandPartC
        } else {
            State::NoRandPartC
        }
    }

    /// Decompress into `buf`, returning the number of bytes written; 0
    /// means the end of the (last) stream.
    pub fn read_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.poisoned {
            return Err(BzError::Poisoned);
        }
        let result = self.produce(buf);
        match result {
            Ok(n) => {
                self.total_out += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }

    fn produce(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut written = 0;

        while written < buf.len() {
            match self.state {
                State::Eof => break,
                State::StartBlock => self.start_block()?,
                State::RandPartA | State::NoRandPartA => {
                    if self.used < self.nblock {
                        let byte = self.fetch();
                        buf[written] = byte;
                        written += 1;
                        self.crc.update_byte(byte);
                        self.prev = self.last;
                        self.last = Some(byte);
                        self.state = self.part_b();
                    } else {
                        self.end_block()?;
                    }
                }
                State::RandPartB | State::NoRandPartB => {
                    if self.last != self.prev {
                        self.count = 1;
                        self.state = self.part_a();
                    } else {
                        self.count += 1;
                        if self.count >= 4 && self.used < self.nblock {
                            self.run_left = self.fetch();
                            self.state = self.part_c();
                        } else {
                            self.state = self.part_a();
                        }
                    }
                }
                State::RandPartC | State::NoRandPartC => {
                    let byte = self
                        .last
                        .ok_or_else(|| BzError::internal("run expansion without a byte"))?;
                    let n = (self.run_left as usize).min(buf.len() - written);
                    buf[written..written + n].fill(byte);
                    written += n;
                    self.crc.update_repeated(byte, n);
                    self.run_left -= n as u8;
                    if self.run_left == 0 {
                        self.count = 0;
                        self.state = self.part_a();
                    }
                }
            }
        }

        Ok(written)
    }

    #[inline(always)]
    fn fetch(&mut self) -> u8 {
        let entry = self.workspace.tt[self.t_pos as usize];
        self.t_pos = entry >> 8;
        self.used += 1;
        let byte = entry as u8;
        if self.randomised {
            byte ^ self.rand.next_mask()
        } else {
            byte
        }
    }

    fn start_block(&mut self) -> Result<()> {
        match framing::read_marker(&mut self.reader)? {
            Marker::Block => {
                let start = self.reader.bit_position();
                let header = framing::read_block_header(&mut self.reader, self.level)?;
                let (nblock, t_pos) = decode_block(
                    &mut self.reader,
                    &mut self.workspace,
                    self.level,
                    header.orig_ptr,
                )?;

                debug!(
                    "block {}: {} bits -> {} bytes, orig_ptr {}, crc {:#010x}{}",
                    self.blocks,
                    self.reader.bit_position() - start + 48,
                    nblock,
                    header.orig_ptr,
                    header.crc,
                    if header.randomised { ", randomised" } else { "" }
                );

                self.randomised = header.randomised;
                self.rand = RandState::new();
                self.expected_crc = header.crc;
                self.crc.reset();
                self.t_pos = t_pos;
                self.used = 0;
                self.nblock = nblock;
                self.last = None;
                self.prev = None;
                self.count = 0;
                self.run_left = 0;
                self.state = self.part_a();
            }
            Marker::EndOfStream => {
                let stored = framing::read_stream_crc(&mut self.reader)?;
                if stored != self.combined_crc {
                    return Err(BzError::crc_mismatch(
                        CrcScope::Stream,
                        stored,
                        self.combined_crc,
                    ));
                }
                trace!("stream end after {} blocks, crc {:#010x}", self.blocks, stored);
                self.state = State::Eof;

                if self.multi_stream {
                    self.reader.align_to_byte();
                    if !self.reader.is_eof()? {
                        self.level = framing::read_stream_header(&mut self.reader)?;
                        self.workspace.reserve(self.level);
                        self.combined_crc = 0;
                        self.state = State::StartBlock;
                        trace!("next stream, level {}", self.level.level());
                    }
                }
            }
        }
        Ok(())
    }

    fn end_block(&mut self) -> Result<()> {
        let computed = self.crc.value();
        if computed != self.expected_crc {
            return Err(BzError::crc_mismatch(
                CrcScope::Block,
                self.expected_crc,
                computed,
            ));
        }
        self.combined_crc = crc::combine(self.combined_crc, computed);
        self.blocks += 1;
        self.state = State::StartBlock;
        Ok(())
    }

    fn read_to_vec(&mut self, out: &mut Vec<u8>) -> Result<()> {
        loop {
            let start = out.len();
            out.resize(start + READ_CHUNK, 0);
            let n = self.read_data(&mut out[start..]);
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    out.truncate(start);
                    return Err(e);
                }
            };
            out.truncate(start + n);
            if n == 0 {
                return Ok(());
            }
        }
    }
}

impl<R: Read> Read for BzDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_data(buf)?)
    }
}

/// Decompress a single BZip2 stream.
pub fn decompress<R: Read>(reader: R) -> Result<Vec<u8>> {
    let mut decoder = BzDecoder::new(reader)?;
    let mut out = Vec::new();
    decoder.read_to_vec(&mut out)?;
    Ok(out)
}

/// Decompress one or more concatenated BZip2 streams.
pub fn decompress_multi<R: Read>(reader: R) -> Result<Vec<u8>> {
    let mut decoder = BzDecoder::new_multi(reader)?;
    let mut out = Vec::new();
    decoder.read_to_vec(&mut out)?;
    Ok(out)
}
