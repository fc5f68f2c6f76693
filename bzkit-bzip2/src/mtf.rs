//! Move-to-Front Transform for BZip2.
//!
//! MTF replaces each byte of the BWT output with its position in a list of
//! the block's byte values, then moves that value to the front. Clustered
//! bytes become runs of rank 0, which are coded as RUNA/RUNB digits; other
//! ranks `r` become symbol `r + 1`. The last symbol of every block is the
//! end-of-block marker.

use crate::rle::{self, RUNA, RUNB};

/// Largest alphabet: RUNA, RUNB, ranks 1..=255 and end-of-block.
pub const MAX_ALPHA_SIZE: usize = 258;

/// MTF symbols for one block.
#[derive(Debug, Clone)]
pub struct MtfOutput {
    /// The symbol stream, ending with end-of-block.
    pub symbols: Vec<u16>,
    /// Frequency of each symbol, including the end-of-block marker.
    pub freq: [u32; MAX_ALPHA_SIZE],
    /// Number of distinct symbols in use (`in_use_count + 2`).
    pub alpha_size: usize,
}

impl MtfOutput {
    /// Create an empty output buffer for blocks of up to `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            symbols: Vec::with_capacity(capacity + 1),
            freq: [0; MAX_ALPHA_SIZE],
            alpha_size: 0,
        }
    }

    /// The end-of-block symbol.
    pub fn eob(&self) -> u16 {
        (self.alpha_size - 1) as u16
    }

    fn clear(&mut self) {
        self.symbols.clear();
        self.freq = [0; MAX_ALPHA_SIZE];
        self.alpha_size = 0;
    }

    #[inline(always)]
    fn push(&mut self, symbol: u16) {
        self.symbols.push(symbol);
        self.freq[symbol as usize] += 1;
    }

    fn push_zero_run(&mut self, run: u32) {
        rle::encode_zero_run(run, |digit| {
            debug_assert!(digit == RUNA || digit == RUNB);
            self.symbols.push(digit);
            self.freq[digit as usize] += 1;
        });
    }
}

/// Move-to-front coder over a block's in-use alphabet.
#[derive(Debug, Clone)]
pub struct MtfEncoder {
    list: [u8; 256],
    unseq_to_seq: [u8; 256],
}

impl Default for MtfEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MtfEncoder {
    /// Create an encoder.
    pub fn new() -> Self {
        Self {
            list: [0; 256],
            unseq_to_seq: [0; 256],
        }
    }

    /// Code the BWT output of `block` given its sorted rotations `ptr`.
    ///
    /// The BWT output byte for row `i` is `block[ptr[i] - 1]` (wrapping),
    /// so the last column is never materialised.
    pub fn encode(&mut self, block: &[u8], ptr: &[u32], in_use: &[bool; 256], out: &mut MtfOutput) {
        out.clear();

        let mut n_in_use = 0usize;
        for (byte, _) in in_use.iter().enumerate().filter(|&(_, &used)| used) {
            self.unseq_to_seq[byte] = n_in_use as u8;
            n_in_use += 1;
        }
        out.alpha_size = n_in_use + 2;

        for (i, slot) in self.list.iter_mut().enumerate().take(n_in_use) {
            *slot = i as u8;
        }

        let n = block.len();
        let mut zero_run = 0u32;

        for &p in ptr {
            let src = if p == 0 { n - 1 } else { p as usize - 1 };
            let ll = self.unseq_to_seq[block[src] as usize];

            if self.list[0] == ll {
                zero_run += 1;
                continue;
            }

            if zero_run > 0 {
                out.push_zero_run(zero_run);
                zero_run = 0;
            }

            // Shift the list right until `ll` is found, then put it in front.
            let mut carried = self.list[0];
            let mut j = 0;
            while carried != ll {
                j += 1;
                std::mem::swap(&mut carried, &mut self.list[j]);
            }
            self.list[0] = ll;
            out.push(j as u16 + 1);
        }

        if zero_run > 0 {
            out.push_zero_run(zero_run);
        }

        let eob = out.eob();
        out.push(eob);
    }
}
