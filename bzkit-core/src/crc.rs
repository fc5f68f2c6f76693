//! CRC-32 as used by the BZip2 format.
//!
//! BZip2 uses the CRC-32 polynomial 0x04C11DB7 in its *non-reflected*
//! (MSB-first) form, known as CRC-32/BZIP2:
//!
//! - Polynomial: 0x04C11DB7
//! - Initial value: 0xFFFFFFFF
//! - Final XOR: 0xFFFFFFFF
//! - Reflected input/output: No
//!
//! Every block carries the CRC of its uncompressed bytes, and the stream
//! trailer carries a combined CRC folded from the block CRCs in order
//! (see [`combine`]).
//!
//! ## Performance
//!
//! Bulk updates of 16 bytes or more use the "slicing-by-8" technique with
//! eight pre-computed tables. Shorter updates use the single-table loop.

/// CRC-32/BZIP2 lookup table (polynomial 0x04C11DB7, MSB-first).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = (i as u32) << 24;
        let mut j = 0;
        while j < 8 {
            if crc & 0x8000_0000 != 0 {
                crc = (crc << 1) ^ 0x04C1_1DB7;
            } else {
                crc <<= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Slicing-by-8 tables. `tables[t][i]` is the CRC of byte `i` followed by
/// `t` zero bytes.
const CRC32_TABLE_SLICE: [[u32; 256]; 8] = {
    let mut tables = [[0u32; 256]; 8];

    let mut i = 0usize;
    while i < 256 {
        tables[0][i] = CRC32_TABLE[i];
        i += 1;
    }

    let mut t = 1;
    while t < 8 {
        let mut i = 0usize;
        while i < 256 {
            let prev = tables[t - 1][i];
            tables[t][i] = (prev << 8) ^ tables[0][(prev >> 24) as usize];
            i += 1;
        }
        t += 1;
    }

    tables
};

/// Running CRC-32/BZIP2 accumulator.
///
/// # Example
///
/// ```
/// use bzkit_core::crc::Crc32;
///
/// let mut crc = Crc32::new();
/// crc.update(b"1234");
/// crc.update(b"56789");
/// assert_eq!(crc.finalize(), 0xFC891918);
/// ```
#[derive(Debug, Clone)]
pub struct Crc32 {
    crc: u32,
}

impl Crc32 {
    /// Create a new accumulator.
    pub fn new() -> Self {
        Self { crc: 0xFFFF_FFFF }
    }

    /// Reset to the initial state.
    pub fn reset(&mut self) {
        self.crc = 0xFFFF_FFFF;
    }

    /// Feed a slice of bytes.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        if data.len() >= 16 {
            crc32_slice8(&mut self.crc, data);
        } else {
            crc32_sw(&mut self.crc, data);
        }
    }

    /// Feed a single byte.
    #[inline(always)]
    pub fn update_byte(&mut self, byte: u8) {
        self.crc = (self.crc << 8) ^ CRC32_TABLE[((self.crc >> 24) ^ byte as u32) as usize];
    }

    /// Feed `count` copies of `byte`.
    #[inline]
    pub fn update_repeated(&mut self, byte: u8, count: usize) {
        for _ in 0..count {
            self.update_byte(byte);
        }
    }

    /// Current CRC value (without consuming the accumulator).
    #[inline(always)]
    pub fn value(&self) -> u32 {
        !self.crc
    }

    /// Finalize and return the CRC value.
    #[inline(always)]
    pub fn finalize(self) -> u32 {
        !self.crc
    }

    /// Compute the CRC of a slice in one call.
    #[inline]
    pub fn compute(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold a block CRC into the stream's combined CRC.
///
/// The fold is order-sensitive, so blocks must be combined in stream order.
#[inline]
pub fn combine(combined: u32, block_crc: u32) -> u32 {
    combined.rotate_left(1) ^ block_crc
}

#[inline]
fn crc32_sw(crc: &mut u32, data: &[u8]) {
    let mut c = *crc;
    for &byte in data {
        c = (c << 8) ^ CRC32_TABLE[((c >> 24) ^ byte as u32) as usize];
    }
    *crc = c;
}

#[inline]
fn crc32_slice8(crc: &mut u32, data: &[u8]) {
    let mut c = *crc;
    let mut chunks = data.chunks_exact(8);

    for bytes in &mut chunks {
        let x = c ^ u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        c = CRC32_TABLE_SLICE[7][(x >> 24) as usize]
            ^ CRC32_TABLE_SLICE[6][((x >> 16) & 0xFF) as usize]
            ^ CRC32_TABLE_SLICE[5][((x >> 8) & 0xFF) as usize]
            ^ CRC32_TABLE_SLICE[4][(x & 0xFF) as usize]
            ^ CRC32_TABLE_SLICE[3][bytes[4] as usize]
            ^ CRC32_TABLE_SLICE[2][bytes[5] as usize]
            ^ CRC32_TABLE_SLICE[1][bytes[6] as usize]
            ^ CRC32_TABLE_SLICE[0][bytes[7] as usize];
    }

    *crc = c;
    crc32_sw(crc, chunks.remainder());
}
