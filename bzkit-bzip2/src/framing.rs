//! BZip2 wire format: stream and block headers, table descriptors, trailer.
//!
//! Layout of a stream:
//!
//! ```text
//! "BZh" level
//! { block magic, block CRC, randomised, orig_ptr, in-use bitmap,
//!   n_groups, n_selectors, selectors, code lengths, symbols }*
//! end magic, combined CRC, zero padding to a byte
//! ```

use crate::huffman::{
    DecodeTable, GROUP_SIZE, MAX_ALPHA_SIZE, MAX_DECODE_CODE_LEN, MAX_GROUPS, MIN_GROUPS,
};
use crate::tables::CodingTables;
use crate::{BLOCK_MAGIC, BZIP2_MAGIC, CompressionLevel, EOS_MAGIC};
use bzkit_core::{BitReader, BitWriter, BzError, Result};
use std::io::{Read, Write};

/// Selectors the decoder stores; any beyond this are read and dropped.
pub const MAX_SELECTORS: usize = 2 + 900_000 / GROUP_SIZE;

const STREAM_MAGIC: [u8; 3] = [BZIP2_MAGIC[0], BZIP2_MAGIC[1], b'h'];

fn magic_halves(magic: &[u8; 6]) -> (u32, u32) {
    (
        u32::from_be_bytes([0, magic[0], magic[1], magic[2]]),
        u32::from_be_bytes([0, magic[3], magic[4], magic[5]]),
    )
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Write `"BZh"` and the block size digit.
pub fn write_stream_header<W: Write>(w: &mut BitWriter<W>, level: CompressionLevel) -> Result<()> {
    for byte in STREAM_MAGIC {
        w.write_u8(byte)?;
    }
    w.write_u8(b'0' + level.level())
}

/// Write the block magic, CRC, randomised flag and original pointer.
pub fn write_block_header<W: Write>(
    w: &mut BitWriter<W>,
    block_crc: u32,
    randomised: bool,
    orig_ptr: u32,
) -> Result<()> {
    let (hi, lo) = magic_halves(&BLOCK_MAGIC);
    w.write_bits(hi, 24)?;
    w.write_bits(lo, 24)?;
    w.write_bits(block_crc, 32)?;
    w.write_bit(randomised)?;
    w.write_bits(orig_ptr, 24)
}

/// Write the two-level bitmap of byte values present in the block.
pub fn write_mapping_table<W: Write>(w: &mut BitWriter<W>, in_use: &[bool; 256]) -> Result<()> {
    let mut in_use16 = [false; 16];
    for (i, flag) in in_use16.iter_mut().enumerate() {
        *flag = in_use[i * 16..(i + 1) * 16].iter().any(|&b| b);
    }

    for &flag in &in_use16 {
        w.write_bit(flag)?;
    }
    for (i, _) in in_use16.iter().enumerate().filter(|&(_, &f)| f) {
        for &used in &in_use[i * 16..(i + 1) * 16] {
            w.write_bit(used)?;
        }
    }
    Ok(())
}

/// Write group count, selectors and the delta-coded code lengths.
pub fn write_tables<W: Write>(w: &mut BitWriter<W>, tables: &CodingTables) -> Result<()> {
    w.write_bits(tables.n_groups as u32, 3)?;
    w.write_bits(tables.selectors_mtf.len() as u32, 15)?;

    for &j in &tables.selectors_mtf {
        for _ in 0..j {
            w.write_bit(true)?;
        }
        w.write_bit(false)?;
    }

    for t in 0..tables.n_groups {
        let lengths = tables.table_lengths(t);
        let mut curr = lengths[0];
        w.write_bits(curr as u32, 5)?;
        for &len in lengths {
            while curr < len {
                w.write_bits(0b10, 2)?;
                curr += 1;
            }
            while curr > len {
                w.write_bits(0b11, 2)?;
                curr -= 1;
            }
            w.write_bit(false)?;
        }
    }
    Ok(())
}

/// Write the Huffman-coded symbols, switching tables every 50 symbols.
pub fn write_symbols<W: Write>(
    w: &mut BitWriter<W>,
    symbols: &[u16],
    tables: &CodingTables,
) -> Result<()> {
    for (group, &sel) in symbols.chunks(GROUP_SIZE).zip(&tables.selectors) {
        let lengths = &tables.lengths[sel as usize];
        let codes = &tables.codes[sel as usize];
        for &sym in group {
            w.write_bits(codes[sym as usize], lengths[sym as usize])?;
        }
    }
    Ok(())
}

/// Write the end-of-stream magic and combined CRC, then pad to a byte.
pub fn write_stream_trailer<W: Write>(w: &mut BitWriter<W>, combined_crc: u32) -> Result<()> {
    let (hi, lo) = magic_halves(&EOS_MAGIC);
    w.write_bits(hi, 24)?;
    w.write_bits(lo, 24)?;
    w.write_bits(combined_crc, 32)?;
    w.align_to_byte()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// What follows a block boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// A compressed block.
    Block,
    /// The stream trailer.
    EndOfStream,
}

/// Fixed-size fields at the start of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// CRC of the block's uncompressed bytes.
    pub crc: u32,
    /// Whether the block was randomised before sorting.
    pub randomised: bool,
    /// Row of the original string in the sorted rotations.
    pub orig_ptr: u32,
}

/// Read `"BZh"` and the block size digit.
pub fn read_stream_header<R: Read>(r: &mut BitReader<R>) -> Result<CompressionLevel> {
    let mut magic = [0u8; 3];
    for byte in &mut magic {
        *byte = r.read_u8()?;
    }
    if magic != STREAM_MAGIC {
        return Err(BzError::invalid_magic(STREAM_MAGIC, magic));
    }

    let digit = r.read_u8()?;
    if !(b'1'..=b'9').contains(&digit) {
        return Err(BzError::invalid_header(format!(
            "invalid block size digit {:#04x}",
            digit
        )));
    }
    CompressionLevel::new(digit - b'0')
}

/// Read the 48-bit marker that starts a block or the trailer.
pub fn read_marker<R: Read>(r: &mut BitReader<R>) -> Result<Marker> {
    let position = r.bit_position();
    let hi = r.read_bits(24)?;
    let lo = r.read_bits(24)?;

    if (hi, lo) == magic_halves(&BLOCK_MAGIC) {
        Ok(Marker::Block)
    } else if (hi, lo) == magic_halves(&EOS_MAGIC) {
        Ok(Marker::EndOfStream)
    } else {
        Err(BzError::corrupted(
            position,
            format!("bad block magic {:06x}{:06x}", hi, lo),
        ))
    }
}

/// Read the stored combined CRC after the end-of-stream magic.
pub fn read_stream_crc<R: Read>(r: &mut BitReader<R>) -> Result<u32> {
    r.read_bits(32)
}

/// Read a block's CRC, randomised flag and original pointer.
pub fn read_block_header<R: Read>(
    r: &mut BitReader<R>,
    level: CompressionLevel,
) -> Result<BlockHeader> {
    let crc = r.read_bits(32)?;
    let randomised = r.read_bit()?;
    let position = r.bit_position();
    let orig_ptr = r.read_bits(24)?;

    if orig_ptr as usize > 10 + level.block_size() {
        return Err(BzError::corrupted(
            position,
            format!("original pointer {} out of range", orig_ptr),
        ));
    }

    Ok(BlockHeader {
        crc,
        randomised,
        orig_ptr,
    })
}

/// Read the in-use bitmap into `seq_to_unseq`; returns the number of
/// byte values in use.
pub fn read_mapping_table<R: Read>(
    r: &mut BitReader<R>,
    seq_to_unseq: &mut [u8; 256],
) -> Result<usize> {
    let position = r.bit_position();
    let in_use16 = r.read_bits(16)?;

    let mut n_in_use = 0;
    for i in 0..16 {
        if in_use16 & (0x8000 >> i) == 0 {
            continue;
        }
        let bits = r.read_bits(16)?;
        for j in 0..16 {
            if bits & (0x8000 >> j) != 0 {
                seq_to_unseq[n_in_use] = (i * 16 + j) as u8;
                n_in_use += 1;
            }
        }
    }

    if n_in_use == 0 {
        return Err(BzError::corrupted(position, "block uses no byte values"));
    }
    Ok(n_in_use)
}

/// Read the selectors and code lengths for a block with `alpha_size`
/// symbols, building one decode table per group. Returns the group count.
pub fn read_tables<R: Read>(
    r: &mut BitReader<R>,
    alpha_size: usize,
    selectors: &mut Vec<u8>,
    tables: &mut [DecodeTable; MAX_GROUPS],
) -> Result<usize> {
    let position = r.bit_position();
    let n_groups = r.read_bits(3)? as usize;
    if !(MIN_GROUPS..=MAX_GROUPS).contains(&n_groups) {
        return Err(BzError::corrupted(
            position,
            format!("invalid number of Huffman tables {}", n_groups),
        ));
    }

    let n_selectors = r.read_bits(15)? as usize;
    if n_selectors == 0 {
        return Err(BzError::corrupted(position + 3, "no selectors"));
    }

    // Selectors arrive move-to-front coded; undo that as they are read.
    let mut pos: [u8; MAX_GROUPS] = std::array::from_fn(|i| i as u8);
    selectors.clear();
    for i in 0..n_selectors {
        let mut j = 0usize;
        while r.read_bit()? {
            j += 1;
            if j >= n_groups {
                return Err(BzError::corrupted(
                    r.bit_position(),
                    "selector index out of range",
                ));
            }
        }
        if i < MAX_SELECTORS {
            let sel = pos[j];
            pos.copy_within(0..j, 1);
            pos[0] = sel;
            selectors.push(sel);
        }
    }

    let mut lengths = [0u8; MAX_ALPHA_SIZE];
    for table in tables.iter_mut().take(n_groups) {
        let mut curr = r.read_bits(5)? as i32;
        for len in lengths.iter_mut().take(alpha_size) {
            loop {
                if curr < 1 || curr > MAX_DECODE_CODE_LEN as i32 {
                    return Err(BzError::corrupted(
                        r.bit_position(),
                        format!("code length {} out of range", curr),
                    ));
                }
                if !r.read_bit()? {
                    break;
                }
                curr += if r.read_bit()? { -1 } else { 1 };
            }
            *len = curr as u8;
        }
        table.build(&lengths[..alpha_size])?;
    }

    Ok(n_groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn written(f: impl FnOnce(&mut BitWriter<Vec<u8>>) -> Result<()>) -> Vec<u8> {
        let mut w = BitWriter::new(Vec::new());
        f(&mut w).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn test_stream_header_roundtrip() {
        let bytes = written(|w| write_stream_header(w, CompressionLevel::new(7).unwrap()));
        assert_eq!(bytes, b"BZh7");
        let level = read_stream_header(&mut BitReader::new(&bytes[..])).unwrap();
        assert_eq!(level.level(), 7);
    }

    #[test]
    fn test_bad_stream_magic() {
        let err = read_stream_header(&mut BitReader::new(&b"BZx9"[..])).unwrap_err();
        assert!(matches!(err, BzError::InvalidMagic { .. }));
    }

    #[test]
    fn test_bad_level_digit() {
        for bytes in [b"BZh0", b"BZh:"] {
            let err = read_stream_header(&mut BitReader::new(&bytes[..])).unwrap_err();
            assert!(matches!(err, BzError::InvalidHeader { .. }));
        }
    }

    #[test]
    fn test_trailer_of_empty_stream() {
        let bytes = written(|w| {
            write_stream_header(w, CompressionLevel::FASTEST)?;
            write_stream_trailer(w, 0)
        });
        assert_eq!(bytes, b"BZh1\x17\x72\x45\x38\x50\x90\x00\x00\x00\x00");

        let mut r = BitReader::new(&bytes[..]);
        read_stream_header(&mut r).unwrap();
        assert_eq!(read_marker(&mut r).unwrap(), Marker::EndOfStream);
        assert_eq!(read_stream_crc(&mut r).unwrap(), 0);
    }

    #[test]
    fn test_block_header_roundtrip() {
        let bytes = written(|w| write_block_header(w, 0xDEADBEEF, true, 12345));
        let mut r = BitReader::new(&bytes[..]);
        assert_eq!(read_marker(&mut r).unwrap(), Marker::Block);
        let header = read_block_header(&mut r, CompressionLevel::FASTEST).unwrap();
        assert_eq!(
            header,
            BlockHeader {
                crc: 0xDEADBEEF,
                randomised: true,
                orig_ptr: 12345
            }
        );
    }

    #[test]
    fn test_orig_ptr_bound() {
        let bytes = written(|w| write_block_header(w, 0, false, 100_011));
        let mut r = BitReader::new(&bytes[..]);
        read_marker(&mut r).unwrap();
        let err = read_block_header(&mut r, CompressionLevel::FASTEST).unwrap_err();
        assert!(matches!(err, BzError::CorruptedData { .. }));
    }

    #[test]
    fn test_bad_marker() {
        let bytes = [0x31, 0x41, 0x59, 0x26, 0x53, 0x58];
        let err = read_marker(&mut BitReader::new(&bytes[..])).unwrap_err();
        assert!(matches!(err, BzError::CorruptedData { .. }));
    }

    #[test]
    fn test_mapping_table_roundtrip() {
        let mut in_use = [false; 256];
        for b in [0u8, 17, b'a', b'z', 255] {
            in_use[b as usize] = true;
        }
        let bytes = written(|w| write_mapping_table(w, &in_use));
        let mut seq_to_unseq = [0u8; 256];
        let n = read_mapping_table(&mut BitReader::new(&bytes[..]), &mut seq_to_unseq).unwrap();
        assert_eq!(&seq_to_unseq[..n], &[0, 17, b'a', b'z', 255]);
    }

    #[test]
    fn test_empty_mapping_rejected() {
        let bytes = [0u8; 2];
        let mut seq_to_unseq = [0u8; 256];
        assert!(read_mapping_table(&mut BitReader::new(&bytes[..]), &mut seq_to_unseq).is_err());
    }

    #[test]
    fn test_tables_roundtrip() {
        let mut tables = CodingTables::new();
        tables.n_groups = 2;
        tables.alpha_size = 4;
        tables.lengths[0][..4].copy_from_slice(&[1, 2, 3, 3]);
        tables.lengths[1][..4].copy_from_slice(&[2, 2, 2, 2]);
        tables.selectors = vec![1, 0, 0];
        tables.selectors_mtf = vec![1, 1, 0];

        let bytes = written(|w| write_tables(w, &tables));
        let mut selectors = Vec::new();
        let mut decode: [DecodeTable; MAX_GROUPS] = Default::default();
        let n_groups = read_tables(
            &mut BitReader::new(&bytes[..]),
            4,
            &mut selectors,
            &mut decode,
        )
        .unwrap();
        assert_eq!(n_groups, 2);
        assert_eq!(selectors, vec![1, 0, 0]);
        assert_eq!(decode[0].max_len(), 3);
        assert_eq!(decode[1].min_len(), 2);
    }

    #[test]
    fn test_group_count_rejected() {
        // n_groups = 7
        let bytes = written(|w| w.write_bits(7, 3));
        let mut selectors = Vec::new();
        let mut decode: [DecodeTable; MAX_GROUPS] = Default::default();
        let err = read_tables(&mut BitReader::new(&bytes[..]), 4, &mut selectors, &mut decode)
            .unwrap_err();
        assert!(matches!(err, BzError::CorruptedData { .. }));
    }
}
