//! Huffman coding for BZip2.
//!
//! BZip2 uses multiple Huffman tables (up to 6) and can switch between them
//! every 50 symbols for better compression. Code lengths are built with a
//! binary heap over scaled weights; if any code comes out longer than the
//! limit, the weights are flattened and the tree is rebuilt. Codes are
//! canonical: assigned in order of length, then symbol.

use bzkit_core::{BitReader, BzError, Result};
use std::io::Read;

pub use crate::mtf::MAX_ALPHA_SIZE;

/// Maximum number of Huffman tables.
pub const MAX_GROUPS: usize = 6;

/// Minimum number of Huffman tables.
pub const MIN_GROUPS: usize = 2;

/// Symbols per selector group.
pub const GROUP_SIZE: usize = 50;

/// Longest code the encoder produces.
///
/// The format allows 20; libbzip2 has built its tables with a cap of 17
/// since 1.0.3, and the output has to match it.
pub const MAX_ENCODE_CODE_LEN: u8 = 17;

/// Longest code length the decoder accepts in a table.
pub const MAX_DECODE_CODE_LEN: u8 = 23;

const TABLE_LEN: usize = MAX_DECODE_CODE_LEN as usize + 2;

#[inline(always)]
fn add_weights(w1: u32, w2: u32) -> u32 {
    let depth = 1 + (w1 & 0xff).max(w2 & 0xff);
    ((w1 & !0xff) + (w2 & !0xff)) | depth
}

fn up_heap(heap: &mut [usize], weight: &[u32], mut z: usize) {
    let tmp = heap[z];
    while weight[tmp] < weight[heap[z >> 1]] {
        heap[z] = heap[z >> 1];
        z >>= 1;
    }
    heap[z] = tmp;
}

fn down_heap(heap: &mut [usize], weight: &[u32], n_heap: usize, mut z: usize) {
    let tmp = heap[z];
    loop {
        let mut yy = z << 1;
        if yy > n_heap {
            break;
        }
        if yy < n_heap && weight[heap[yy + 1]] < weight[heap[yy]] {
            yy += 1;
        }
        if weight[tmp] < weight[heap[yy]] {
            break;
        }
        heap[z] = heap[yy];
        z = yy;
    }
    heap[z] = tmp;
}

/// Compute code lengths for `freq`, none longer than `max_len`.
///
/// Each weight carries the subtree depth in its low 8 bits so that, among
/// equal frequencies, shallower subtrees are merged first. Zero frequencies
/// are treated as 1 so every symbol gets a code.
pub fn make_code_lengths(freq: &[u32], max_len: u8, lengths: &mut [u8]) {
    let alpha = freq.len();
    debug_assert!((2..=MAX_ALPHA_SIZE).contains(&alpha));
    debug_assert!(lengths.len() >= alpha);

    // Index 0 is a sentinel with weight 0 at the heap root's parent.
    let mut heap = [0usize; MAX_ALPHA_SIZE + 2];
    let mut weight = [0u32; MAX_ALPHA_SIZE * 2];
    let mut parent = [0i32; MAX_ALPHA_SIZE * 2];

    for (i, &f) in freq.iter().enumerate() {
        weight[i + 1] = f.max(1) << 8;
    }

    loop {
        let mut n_nodes = alpha;
        let mut n_heap = 0usize;

        heap[0] = 0;
        weight[0] = 0;
        parent[0] = -2;

        for i in 1..=alpha {
            parent[i] = -1;
            n_heap += 1;
            heap[n_heap] = i;
            up_heap(&mut heap, &weight, n_heap);
        }

        while n_heap > 1 {
            let n1 = heap[1];
            heap[1] = heap[n_heap];
            n_heap -= 1;
            down_heap(&mut heap, &weight, n_heap, 1);

            let n2 = heap[1];
            heap[1] = heap[n_heap];
            n_heap -= 1;
            down_heap(&mut heap, &weight, n_heap, 1);

            n_nodes += 1;
            parent[n1] = n_nodes as i32;
            parent[n2] = n_nodes as i32;
            weight[n_nodes] = add_weights(weight[n1], weight[n2]);
            parent[n_nodes] = -1;

            n_heap += 1;
            heap[n_heap] = n_nodes;
            up_heap(&mut heap, &weight, n_heap);
        }

        let mut too_long = false;
        for i in 1..=alpha {
            let mut depth = 0u8;
            let mut k = i;
            while parent[k] >= 0 {
                k = parent[k] as usize;
                depth += 1;
            }
            lengths[i - 1] = depth;
            too_long |= depth > max_len;
        }

        if !too_long {
            return;
        }

        for w in &mut weight[1..=alpha] {
            *w = (1 + (*w >> 8) / 2) << 8;
        }
    }
}

/// Assign canonical codes for `lengths`, shortest first, ties by symbol.
pub fn assign_codes(lengths: &[u8], codes: &mut [u32]) {
    let (min_len, max_len) = length_range(lengths);
    let mut code = 0u32;
    for len in min_len..=max_len {
        for (sym, &l) in lengths.iter().enumerate() {
            if l == len {
                codes[sym] = code;
                code += 1;
            }
        }
        code <<= 1;
    }
}

/// Smallest and largest entry of `lengths`.
pub fn length_range(lengths: &[u8]) -> (u8, u8) {
    lengths
        .iter()
        .fold((u8::MAX, 0), |(lo, hi), &l| (lo.min(l), hi.max(l)))
}

/// Canonical decoding table for one Huffman group.
///
/// `limit[len]` is the largest code value of length `len`; `base[len]`
/// turns a code of that length into an index into `perm`, which lists the
/// symbols ordered by code length then symbol value.
#[derive(Debug, Clone)]
pub struct DecodeTable {
    limit: [i32; TABLE_LEN],
    base: [i32; TABLE_LEN],
    perm: [u16; MAX_ALPHA_SIZE],
    min_len: u8,
    max_len: u8,
    alpha_size: usize,
}

impl Default for DecodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DecodeTable {
    /// An empty table; call [`DecodeTable::build`] before decoding.
    pub fn new() -> Self {
        Self {
            limit: [0; TABLE_LEN],
            base: [0; TABLE_LEN],
            perm: [0; MAX_ALPHA_SIZE],
            min_len: 0,
            max_len: 0,
            alpha_size: 0,
        }
    }

    /// Build from code lengths, each in `1..=MAX_DECODE_CODE_LEN`.
    pub fn build(&mut self, lengths: &[u8]) -> Result<()> {
        let alpha = lengths.len();
        if !(2..=MAX_ALPHA_SIZE).contains(&alpha) {
            return Err(BzError::internal(format!("alphabet size {} out of range", alpha)));
        }
        if let Some(&bad) = lengths
            .iter()
            .find(|&&l| l == 0 || l > MAX_DECODE_CODE_LEN)
        {
            return Err(BzError::internal(format!("code length {} out of range", bad)));
        }

        let (min_len, max_len) = length_range(lengths);

        let mut pp = 0;
        for len in min_len..=max_len {
            for (sym, &l) in lengths.iter().enumerate() {
                if l == len {
                    self.perm[pp] = sym as u16;
                    pp += 1;
                }
            }
        }

        self.base = [0; TABLE_LEN];
        self.limit = [0; TABLE_LEN];
        for &l in lengths {
            self.base[l as usize + 1] += 1;
        }
        for i in 1..TABLE_LEN {
            self.base[i] += self.base[i - 1];
        }

        let mut vec = 0i32;
        for i in min_len as usize..=max_len as usize {
            vec += self.base[i + 1] - self.base[i];
            self.limit[i] = vec - 1;
            vec <<= 1;
        }
        for i in min_len as usize + 1..=max_len as usize {
            self.base[i] = ((self.limit[i - 1] + 1) << 1) - self.base[i];
        }

        self.min_len = min_len;
        self.max_len = max_len;
        self.alpha_size = alpha;
        Ok(())
    }

    /// Shortest code length in the table.
    pub fn min_len(&self) -> u8 {
        self.min_len
    }

    /// Longest code length in the table.
    pub fn max_len(&self) -> u8 {
        self.max_len
    }

    /// Read one symbol.
    pub fn decode_symbol<R: Read>(&self, reader: &mut BitReader<R>) -> Result<u16> {
        let start = reader.bit_position();
        let mut len = self.min_len as usize;
        let mut zvec = reader.read_bits(self.min_len)? as i32;

        while zvec > self.limit[len] {
            len += 1;
            if len > self.max_len as usize {
                return Err(BzError::invalid_huffman(start));
            }
            zvec = (zvec << 1) | reader.read_bit()? as i32;
        }

        let idx = zvec - self.base[len];
        if idx < 0 || idx as usize >= self.alpha_size {
            return Err(BzError::invalid_huffman(start));
        }
        Ok(self.perm[idx as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzkit_core::BitWriter;

    fn lengths_for(freq: &[u32], max_len: u8) -> Vec<u8> {
        let mut lengths = vec![0u8; freq.len()];
        make_code_lengths(freq, max_len, &mut lengths);
        lengths
    }

    fn kraft_sum(lengths: &[u8]) -> f64 {
        lengths.iter().map(|&l| 0.5f64.powi(l as i32)).sum()
    }

    #[test]
    fn test_two_symbols() {
        assert_eq!(lengths_for(&[10, 1], 20), vec![1, 1]);
    }

    #[test]
    fn test_skewed_frequencies() {
        let lengths = lengths_for(&[100, 50, 25, 12, 6, 3], 20);
        assert_eq!(lengths[0], 1);
        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
        assert!((kraft_sum(&lengths) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_frequencies_get_codes() {
        let lengths = lengths_for(&[1000, 0, 0, 0, 5], 20);
        assert!(lengths.iter().all(|&l| l > 0));
    }

    #[test]
    fn test_length_limit_enforced() {
        // Fibonacci weights give a maximally unbalanced tree.
        let mut freq = vec![1u32, 1];
        while freq.len() < 30 {
            let next = freq[freq.len() - 1] + freq[freq.len() - 2];
            freq.push(next);
        }
        for max_len in [17u8, 20] {
            let lengths = lengths_for(&freq, max_len);
            assert!(lengths.iter().all(|&l| l >= 1 && l <= max_len));
            assert!(kraft_sum(&lengths) <= 1.0 + 1e-12);
        }
    }

    #[test]
    fn test_canonical_codes() {
        let lengths = [2u8, 1, 3, 3];
        let mut codes = [0u32; 4];
        assign_codes(&lengths, &mut codes);
        assert_eq!(codes, [0b10, 0b0, 0b110, 0b111]);
    }

    #[test]
    fn test_decode_roundtrip() {
        let freq: Vec<u32> = (0..30u32).map(|i| (i * 7 + 3) % 23 + 1).collect();
        let lengths = lengths_for(&freq, MAX_ENCODE_CODE_LEN);
        let mut codes = vec![0u32; freq.len()];
        assign_codes(&lengths, &mut codes);

        let symbols: Vec<u16> = (0..500u32).map(|i| ((i * 13) % 30) as u16).collect();
        let mut writer = BitWriter::new(Vec::new());
        for &s in &symbols {
            writer
                .write_bits(codes[s as usize], lengths[s as usize])
                .unwrap();
        }
        let bytes = writer.finish().unwrap();

        let mut table = DecodeTable::new();
        table.build(&lengths).unwrap();
        let mut reader = BitReader::new(&bytes[..]);
        for &s in &symbols {
            assert_eq!(table.decode_symbol(&mut reader).unwrap(), s);
        }
    }

    #[test]
    fn test_incomplete_code_rejected() {
        // Lengths {1, 2}: code "11" is unassigned.
        let mut table = DecodeTable::new();
        table.build(&[1, 2]).unwrap();
        let bytes = [0xFFu8; 4];
        let mut reader = BitReader::new(&bytes[..]);
        assert!(table.decode_symbol(&mut reader).is_err());
    }

    #[test]
    fn test_build_rejects_bad_lengths() {
        let mut table = DecodeTable::new();
        assert!(table.build(&[0, 1]).is_err());
        assert!(table.build(&[24, 1]).is_err());
        assert!(table.build(&[1]).is_err());
    }
}
