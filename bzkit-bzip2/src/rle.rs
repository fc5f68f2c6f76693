//! Zero-run coding for BZip2 (the second run-length stage).
//!
//! After MTF, runs of rank 0 are written in bijective base 2 using two
//! symbols, RUNA (digit 1) and RUNB (digit 2), least significant digit
//! first. A run of length `n` therefore takes about `log2(n)` symbols.

use bzkit_core::{BzError, Result};

/// Symbol for digit 1 of a zero run.
pub const RUNA: u16 = 0;
/// Symbol for digit 2 of a zero run.
pub const RUNB: u16 = 1;

/// Longest run weight the decoder accepts before calling the data corrupt.
const MAX_RUN_WEIGHT: u32 = 2 * 1024 * 1024;

/// Emit the RUNA/RUNB digits for a zero run of `run` (>= 1) symbols.
#[inline]
pub fn encode_zero_run(run: u32, mut emit: impl FnMut(u16)) {
    debug_assert!(run > 0);
    let mut rest = run - 1;
    loop {
        emit(if rest & 1 == 1 { RUNB } else { RUNA });
        if rest < 2 {
            break;
        }
        rest = (rest - 2) / 2;
    }
}

/// Accumulates RUNA/RUNB digits while decoding.
#[derive(Debug, Clone)]
pub struct ZeroRun {
    length: u32,
    weight: u32,
}

impl Default for ZeroRun {
    fn default() -> Self {
        Self::new()
    }
}

impl ZeroRun {
    /// An empty run.
    pub fn new() -> Self {
        Self {
            length: 0,
            weight: 1,
        }
    }

    /// True if no digit has been pushed.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Add one digit (`RUNA` or `RUNB`).
    #[inline]
    pub fn push(&mut self, symbol: u16, bit_position: u64) -> Result<()> {
        if self.weight >= MAX_RUN_WEIGHT {
            return Err(BzError::corrupted(bit_position, "zero run too long"));
        }
        self.length += if symbol == RUNA {
            self.weight
        } else {
            self.weight << 1
        };
        self.weight <<= 1;
        Ok(())
    }

    /// Return the run length and start over.
    pub fn take(&mut self) -> u32 {
        let length = self.length;
        *self = Self::new();
        length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(run: u32) -> Vec<u16> {
        let mut out = Vec::new();
        encode_zero_run(run, |s| out.push(s));
        out
    }

    fn decode(symbols: &[u16]) -> u32 {
        let mut run = ZeroRun::new();
        for &s in symbols {
            run.push(s, 0).unwrap();
        }
        run.take()
    }

    #[test]
    fn test_zero_run_encoding() {
        assert_eq!(encode(1), vec![RUNA]);
        assert_eq!(encode(2), vec![RUNB]);
        assert_eq!(encode(3), vec![RUNA, RUNA]);
        assert_eq!(encode(4), vec![RUNB, RUNA]);
        assert_eq!(encode(5), vec![RUNA, RUNB]);
        assert_eq!(encode(6), vec![RUNB, RUNB]);
        assert_eq!(encode(7), vec![RUNA, RUNA, RUNA]);
    }

    #[test]
    fn test_zero_run_roundtrip() {
        for run in (1..2000).chain([65_535, 65_536, 900_000]) {
            assert_eq!(decode(&encode(run)), run, "run {}", run);
        }
    }

    #[test]
    fn test_take_resets() {
        let mut run = ZeroRun::new();
        run.push(RUNB, 0).unwrap();
        assert!(!run.is_empty());
        assert_eq!(run.take(), 2);
        assert!(run.is_empty());
        run.push(RUNA, 0).unwrap();
        assert_eq!(run.take(), 1);
    }

    #[test]
    fn test_overlong_run_rejected() {
        let mut run = ZeroRun::new();
        let mut result = Ok(());
        for _ in 0..30 {
            result = run.push(RUNA, 0);
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }
}
