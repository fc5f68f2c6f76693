//! Huffman table selection for one block.
//!
//! The symbol stream is cut into groups of 50 symbols. Starting from
//! tables that each cover a slice of the alphabet, four refinement passes
//! assign every group to the table that codes it cheapest and rebuild each
//! table from the symbols it was given.

use crate::huffman::{
    GROUP_SIZE, MAX_ALPHA_SIZE, MAX_ENCODE_CODE_LEN, MAX_GROUPS, assign_codes, make_code_lengths,
};
use crate::mtf::MtfOutput;

const N_ITERS: usize = 4;
const LESSER_ICOST: u8 = 0;
const GREATER_ICOST: u8 = 15;

/// Number of tables to use for a block with `n_symbols` MTF symbols.
pub fn group_count(n_symbols: usize) -> usize {
    match n_symbols {
        0..200 => 2,
        200..600 => 3,
        600..1200 => 4,
        1200..2400 => 5,
        _ => 6,
    }
}

/// Code tables and the per-group selectors for one block.
#[derive(Debug, Clone)]
pub struct CodingTables {
    /// Code lengths per table.
    pub lengths: [[u8; MAX_ALPHA_SIZE]; MAX_GROUPS],
    /// Canonical codes per table.
    pub codes: [[u32; MAX_ALPHA_SIZE]; MAX_GROUPS],
    /// Table index for each group of 50 symbols.
    pub selectors: Vec<u8>,
    /// `selectors` after move-to-front, as written to the stream.
    pub selectors_mtf: Vec<u8>,
    /// Number of tables in use.
    pub n_groups: usize,
    /// Alphabet size shared by all tables.
    pub alpha_size: usize,
    rfreq: [[u32; MAX_ALPHA_SIZE]; MAX_GROUPS],
}

impl Default for CodingTables {
    fn default() -> Self {
        Self::new()
    }
}

impl CodingTables {
    /// Empty tables.
    pub fn new() -> Self {
        Self {
            lengths: [[0; MAX_ALPHA_SIZE]; MAX_GROUPS],
            codes: [[0; MAX_ALPHA_SIZE]; MAX_GROUPS],
            selectors: Vec::new(),
            selectors_mtf: Vec::new(),
            n_groups: 0,
            alpha_size: 0,
            rfreq: [[0; MAX_ALPHA_SIZE]; MAX_GROUPS],
        }
    }

    /// Table `t`'s code lengths over the block's alphabet.
    pub fn table_lengths(&self, t: usize) -> &[u8] {
        &self.lengths[t][..self.alpha_size]
    }

    /// Choose tables and selectors for `mtf`.
    pub fn build(&mut self, mtf: &MtfOutput) {
        let alpha = mtf.alpha_size;
        let symbols = &mtf.symbols;
        let n_groups = group_count(symbols.len());

        self.alpha_size = alpha;
        self.n_groups = n_groups;
        self.initial_partition(mtf);

        for _ in 0..N_ITERS {
            self.selectors.clear();
            for t in 0..n_groups {
                self.rfreq[t][..alpha].fill(0);
            }

            for group in symbols.chunks(GROUP_SIZE) {
                let mut cost = [0u32; MAX_GROUPS];
                for &sym in group {
                    for (t, c) in cost.iter_mut().enumerate().take(n_groups) {
                        *c += self.lengths[t][sym as usize] as u32;
                    }
                }

                // First cheapest table wins ties.
                let mut best = 0;
                for t in 1..n_groups {
                    if cost[t] < cost[best] {
                        best = t;
                    }
                }

                self.selectors.push(best as u8);
                for &sym in group {
                    self.rfreq[best][sym as usize] += 1;
                }
            }

            for t in 0..n_groups {
                make_code_lengths(
                    &self.rfreq[t][..alpha],
                    MAX_ENCODE_CODE_LEN,
                    &mut self.lengths[t][..alpha],
                );
            }
        }

        self.encode_selectors();

        for t in 0..n_groups {
            assign_codes(&self.lengths[t][..alpha], &mut self.codes[t][..alpha]);
        }
    }

    /// Seed each table with cost 0 for a contiguous slice of the alphabet
    /// holding roughly an equal share of the symbol frequency, 15 elsewhere.
    fn initial_partition(&mut self, mtf: &MtfOutput) {
        let alpha = self.alpha_size;
        let n_groups = self.n_groups;

        let mut n_part = n_groups;
        let mut rem_freq = mtf.symbols.len() as u32;
        let mut gs = 0usize;

        while n_part > 0 {
            let target = rem_freq / n_part as u32;
            let mut ge = gs as isize - 1;
            let mut acc = 0u32;
            while acc < target && ge < alpha as isize - 1 {
                ge += 1;
                acc += mtf.freq[ge as usize];
            }

            if ge > gs as isize
                && n_part != n_groups
                && n_part != 1
                && (n_groups - n_part) % 2 == 1
            {
                acc -= mtf.freq[ge as usize];
                ge -= 1;
            }

            let table = &mut self.lengths[n_part - 1];
            for (v, len) in table.iter_mut().enumerate().take(alpha) {
                *len = if v >= gs && (v as isize) <= ge {
                    LESSER_ICOST
                } else {
                    GREATER_ICOST
                };
            }

            n_part -= 1;
            gs = (ge + 1) as usize;
            rem_freq -= acc;
        }
    }

    fn encode_selectors(&mut self) {
        let mut pos: [u8; MAX_GROUPS] = std::array::from_fn(|i| i as u8);
        self.selectors_mtf.clear();
        for &sel in &self.selectors {
            let mut carried = pos[0];
            let mut j = 0;
            while carried != sel {
                j += 1;
                std::mem::swap(&mut carried, &mut pos[j]);
            }
            pos[0] = sel;
            self.selectors_mtf.push(j as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtf::MtfEncoder;

    fn mtf_of(last_column: &[u8]) -> MtfOutput {
        let n = last_column.len();
        let mut in_use = [false; 256];
        for &b in last_column {
            in_use[b as usize] = true;
        }
        let ptr: Vec<u32> = (0..n as u32).map(|i| (i + 1) % n as u32).collect();
        let mut out = MtfOutput::with_capacity(n);
        MtfEncoder::new().encode(last_column, &ptr, &in_use, &mut out);
        out
    }

    #[test]
    fn test_group_count_thresholds() {
        assert_eq!(group_count(1), 2);
        assert_eq!(group_count(199), 2);
        assert_eq!(group_count(200), 3);
        assert_eq!(group_count(599), 3);
        assert_eq!(group_count(600), 4);
        assert_eq!(group_count(1200), 5);
        assert_eq!(group_count(2399), 5);
        assert_eq!(group_count(2400), 6);
    }

    #[test]
    fn test_selectors_cover_all_groups() {
        let data: Vec<u8> = (0..5000u32).map(|i| ((i * 31) % 97 % 40) as u8).collect();
        let mtf = mtf_of(&data);
        let mut tables = CodingTables::new();
        tables.build(&mtf);

        assert_eq!(tables.selectors.len(), mtf.symbols.len().div_ceil(GROUP_SIZE));
        assert_eq!(tables.selectors_mtf.len(), tables.selectors.len());
        assert!(
            tables
                .selectors
                .iter()
                .all(|&s| (s as usize) < tables.n_groups)
        );
        for t in 0..tables.n_groups {
            assert!(
                tables
                    .table_lengths(t)
                    .iter()
                    .all(|&l| (1..=MAX_ENCODE_CODE_LEN).contains(&l))
            );
        }
    }

    #[test]
    fn test_selector_mtf() {
        let mut tables = CodingTables::new();
        tables.selectors = vec![0, 0, 2, 2, 1, 0];
        tables.encode_selectors();
        assert_eq!(tables.selectors_mtf, vec![0, 0, 2, 0, 2, 2]);
    }

    #[test]
    fn test_tiny_block() {
        let mtf = mtf_of(b"a");
        let mut tables = CodingTables::new();
        tables.build(&mtf);
        assert_eq!(tables.n_groups, 2);
        assert_eq!(tables.alpha_size, 3);
        assert_eq!(tables.selectors, vec![0]);
    }
}
