//! Burrows-Wheeler Transform for BZip2.
//!
//! The forward transform sorts every rotation of a block and keeps the
//! last column. [`BlockSorter`] does the sorting the way the reference
//! encoder does:
//!
//! 1. A radix pass buckets every rotation by its first two bytes.
//! 2. Big buckets (first byte) are finished smallest first. Each small
//!    bucket `[ss, j]` still unsorted is quicksorted on the byte at the
//!    current depth, dropping to a shell sort for small or deep ranges.
//! 3. A finished big bucket `ss` fixes the order of every bucket `[t, ss]`
//!    by pointer scanning, so most buckets are never sorted directly.
//! 4. The rank of each rotation inside its finished big bucket is cached in
//!    `quadrant` and used to cut long comparisons short.
//!
//! Comparisons are charged against a work budget. Highly repetitive blocks
//! exhaust it; such blocks are randomised and sorted again with a prefix
//! doubling sort, which needs no budget: it refines buckets by the first 1,
//! 2, 4, ... bytes and so takes at most `log2(n)` passes whatever the
//! input looks like.

use crate::block::Block;
use bzkit_core::{BzError, Result};
use log::{trace, warn};

/// Budget units per block byte before the block is randomised.
///
/// Each unit is one 8-byte stride of a rotation comparison. Text and
/// binary data finish well under it; short-period input runs out and pays
/// for the budgeted attempt plus a prefix doubling sort.
pub const WORK_FACTOR: i64 = 30;

/// Extra bytes a sort buffer needs past the end of the block.
pub use crate::block::BLOCK_OVERSHOOT;

const N_RADIX: usize = 2;
const QSORT_SMALL_THRESH: isize = 20;
const QSORT_DEPTH_THRESH: usize = N_RADIX + 12;
const QSORT_STACK_SIZE: usize = 100;
const SETMASK: u32 = 1 << 21;
const CLEARMASK: u32 = !SETMASK;

/// Shell sort increments (Knuth, `h = 3h + 1`).
const INCS: [usize; 14] = [
    1, 4, 13, 40, 121, 364, 1093, 3280, 9841, 29524, 88573, 265720, 797161, 2391484,
];

/// Block sorter with reusable scratch arrays.
#[derive(Debug, Clone)]
pub struct BlockSorter {
    ptr: Vec<u32>,
    quadrant: Vec<u16>,
    ftab: Vec<u32>,
    /// Prefix doubling scratch, allocated on first use.
    eclass: Vec<u32>,
    heads: Vec<bool>,
    len: usize,
}

impl BlockSorter {
    /// Create a sorter for blocks of up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            ptr: vec![0; capacity],
            quadrant: vec![0; capacity + BLOCK_OVERSHOOT],
            ftab: vec![0; 65537],
            eclass: Vec::new(),
            heads: Vec::new(),
            len: 0,
        }
    }

    /// Sorted rotation start offsets from the last sort.
    pub fn ptr(&self) -> &[u32] {
        &self.ptr[..self.len]
    }

    /// Sort the first `n` bytes of `data`.
    ///
    /// `data` must hold at least `n + BLOCK_OVERSHOOT` bytes; the overshoot
    /// area is overwritten. With a `budget`, the block sorter runs and
    /// `None` is returned once the budget is spent. Without one, the prefix
    /// doubling sort runs instead. Either way the result is the original
    /// pointer (the position of rotation 0 in sorted order).
    pub fn sort(&mut self, data: &mut [u8], n: usize, budget: Option<i64>) -> Option<u32> {
        assert!(data.len() >= n + BLOCK_OVERSHOOT, "sort buffer lacks overshoot");
        if self.ptr.len() < n {
            self.ptr.resize(n, 0);
            self.quadrant.resize(n + BLOCK_OVERSHOOT, 0);
        }
        self.len = n;

        if n == 0 {
            return Some(0);
        }

        for i in 0..BLOCK_OVERSHOOT {
            data[n + i] = data[i % n];
        }

        match budget {
            Some(initial) => {
                let mut ctx = SortContext {
                    ptr: &mut self.ptr[..n],
                    block: &data[..n + BLOCK_OVERSHOOT],
                    quadrant: &mut self.quadrant[..n + BLOCK_OVERSHOOT],
                    ftab: &mut self.ftab,
                    n,
                    budget: initial,
                };
                ctx.main_sort();
                let remaining = ctx.budget;
                if remaining < 0 {
                    return None;
                }
                trace!("sorted {} bytes using {} budget units", n, initial - remaining);
            }
            None => {
                let passes = doubling_sort(
                    &mut self.ptr[..n],
                    &data[..n],
                    &mut self.eclass,
                    &mut self.heads,
                );
                trace!("sorted {} bytes in {} doubling passes", n, passes);
            }
        }

        self.ptr[..n]
            .iter()
            .position(|&p| p == 0)
            .map(|pos| pos as u32)
    }

    /// Sort a block, randomising it when the first attempt runs out of
    /// budget. Returns the original pointer.
    pub(crate) fn sort_block(&mut self, block: &mut Block) -> Result<u32> {
        let n = block.len();
        let budget = WORK_FACTOR * n as i64;

        if let Some(orig_ptr) = self.sort(block.bytes_with_overshoot_mut(), n, Some(budget)) {
            return Ok(orig_ptr);
        }

        warn!("block of {} bytes is too repetitive to sort, randomising", n);
        block.randomise();
        self.sort(block.bytes_with_overshoot_mut(), n, None)
            .ok_or_else(|| BzError::internal("rotation 0 missing from sorted block"))
    }
}

/// Sort the rotations of `block` into `ptr` by prefix doubling.
///
/// `heads[i]` marks the first slot of a bucket of rotations that agree on
/// the first `h` bytes. Each pass ranks every rotation by the bucket of the
/// rotation `h` bytes later and re-sorts the unfinished buckets on that rank,
/// doubling `h`. Returns the number of passes.
fn doubling_sort(
    ptr: &mut [u32],
    block: &[u8],
    eclass: &mut Vec<u32>,
    heads: &mut Vec<bool>,
) -> usize {
    let n = ptr.len();

    let mut ftab = [0usize; 257];
    for &b in block {
        ftab[b as usize + 1] += 1;
    }
    for i in 1..257 {
        ftab[i] += ftab[i - 1];
    }

    heads.clear();
    heads.resize(n + 1, false);
    for &start in &ftab {
        heads[start] = true;
    }
    let mut next = ftab;
    for (i, &b) in block.iter().enumerate() {
        ptr[next[b as usize]] = i as u32;
        next[b as usize] += 1;
    }

    eclass.clear();
    eclass.resize(n, 0);

    let mut h = 1;
    let mut passes = 0;
    loop {
        passes += 1;

        let mut bucket = 0;
        for i in 0..n {
            if heads[i] {
                bucket = i as u32;
            }
            let p = ptr[i] as usize;
            let k = if p >= h { p - h } else { p + n - h };
            eclass[k] = bucket;
        }

        let mut unsorted = 0;
        let mut lo = 0;
        while lo < n {
            // heads[n] is always set.
            let mut hi = lo + 1;
            while !heads[hi] {
                hi += 1;
            }
            if hi - lo > 1 {
                unsorted += hi - lo;
                let ranks = &eclass[..];
                ptr[lo..hi].sort_unstable_by_key(|&p| ranks[p as usize]);
                let mut prev = ranks[ptr[lo] as usize];
                for i in lo + 1..hi {
                    let rank = ranks[ptr[i] as usize];
                    if rank != prev {
                        heads[i] = true;
                        prev = rank;
                    }
                }
            }
            lo = hi;
        }

        h *= 2;
        if h > n || unsorted == 0 {
            return passes;
        }
    }
}

struct SortContext<'a> {
    ptr: &'a mut [u32],
    block: &'a [u8],
    quadrant: &'a mut [u16],
    ftab: &'a mut [u32],
    n: usize,
    budget: i64,
}

#[inline(always)]
fn med3(mut a: u8, mut b: u8, c: u8) -> u8 {
    if a > b {
        std::mem::swap(&mut a, &mut b);
    }
    if b > c {
        b = c;
        if a > b {
            b = a;
        }
    }
    b
}

impl SortContext<'_> {
    #[inline(always)]
    fn big_freq(&self, b: usize) -> u32 {
        (self.ftab[(b + 1) << 8] & CLEARMASK) - (self.ftab[b << 8] & CLEARMASK)
    }

    #[inline(always)]
    fn wrap(&self, i: usize) -> usize {
        if i < self.n { i } else { i % self.n }
    }

    /// Is rotation `i1` greater than rotation `i2`?
    ///
    /// Both may point up to the sort depth past the rotation start.
    fn main_gt_u(&mut self, mut i1: usize, mut i2: usize) -> bool {
        let block = self.block;

        for _ in 0..12 {
            let (c1, c2) = (block[i1], block[i2]);
            if c1 != c2 {
                return c1 > c2;
            }
            i1 += 1;
            i2 += 1;
        }

        let mut k = self.n as i64 + 8;
        while k >= 0 {
            for _ in 0..8 {
                let (c1, c2) = (block[i1], block[i2]);
                if c1 != c2 {
                    return c1 > c2;
                }
                let (s1, s2) = (self.quadrant[i1], self.quadrant[i2]);
                if s1 != s2 {
                    return s1 > s2;
                }
                i1 += 1;
                i2 += 1;
            }
            i1 = self.wrap(i1);
            i2 = self.wrap(i2);
            k -= 8;
            self.budget -= 1;
        }

        false
    }

    fn simple_sort(&mut self, lo: isize, hi: isize, d: usize) {
        let big_n = hi - lo + 1;
        if big_n < 2 {
            return;
        }
        let (lo, hi) = (lo as usize, hi as usize);

        let mut hp = 0;
        while INCS[hp] < big_n as usize {
            hp += 1;
        }

        for &h in INCS[..hp].iter().rev() {
            for i in (lo + h)..=hi {
                let v = self.ptr[i];
                let mut j = i;
                loop {
                    let other = self.ptr[j - h];
                    if !self.main_gt_u(other as usize + d, v as usize + d) {
                        break;
                    }
                    self.ptr[j] = other;
                    j -= h;
                    if j < lo + h {
                        break;
                    }
                }
                self.ptr[j] = v;
                if self.budget < 0 {
                    return;
                }
            }
        }
    }

    #[inline(always)]
    fn byte_at(&self, slot: isize, d: usize) -> u8 {
        self.block[self.ptr[slot as usize] as usize + d]
    }

    #[inline(always)]
    fn swap_ranges(&mut self, a: isize, b: isize, count: isize) {
        for i in 0..count {
            self.ptr.swap((a + i) as usize, (b + i) as usize);
        }
    }

    /// Three-way radix quicksort of `ptr[lo..=hi]` from depth `d`.
    fn qsort3(&mut self, lo_start: isize, hi_start: isize, d_start: usize) {
        let mut stack: Vec<(isize, isize, usize)> = Vec::with_capacity(QSORT_STACK_SIZE);
        stack.push((lo_start, hi_start, d_start));

        while let Some((lo, hi, d)) = stack.pop() {
            if hi - lo < QSORT_SMALL_THRESH || d > QSORT_DEPTH_THRESH {
                self.simple_sort(lo, hi, d);
                if self.budget < 0 {
                    return;
                }
                continue;
            }

            let med = med3(
                self.byte_at(lo, d),
                self.byte_at(hi, d),
                self.byte_at((lo + hi) >> 1, d),
            ) as i32;

            let (mut un_lo, mut lt_lo) = (lo, lo);
            let (mut un_hi, mut gt_hi) = (hi, hi);

            loop {
                while un_lo <= un_hi {
                    let diff = self.byte_at(un_lo, d) as i32 - med;
                    if diff == 0 {
                        self.ptr.swap(un_lo as usize, lt_lo as usize);
                        lt_lo += 1;
                        un_lo += 1;
                        continue;
                    }
                    if diff > 0 {
                        break;
                    }
                    un_lo += 1;
                }
                while un_lo <= un_hi {
                    let diff = self.byte_at(un_hi, d) as i32 - med;
                    if diff == 0 {
                        self.ptr.swap(un_hi as usize, gt_hi as usize);
                        gt_hi -= 1;
                        un_hi -= 1;
                        continue;
                    }
                    if diff < 0 {
                        break;
                    }
                    un_hi -= 1;
                }
                if un_lo > un_hi {
                    break;
                }
                self.ptr.swap(un_lo as usize, un_hi as usize);
                un_lo += 1;
                un_hi -= 1;
            }

            if gt_hi < lt_lo {
                // Every element matched the median at this depth.
                stack.push((lo, hi, d + 1));
                continue;
            }

            let n = (lt_lo - lo).min(un_lo - lt_lo);
            self.swap_ranges(lo, un_lo - n, n);
            let m = (hi - gt_hi).min(gt_hi - un_hi);
            self.swap_ranges(un_lo, hi - m + 1, m);

            let n = lo + un_lo - lt_lo - 1;
            let m = hi - (gt_hi - un_hi) + 1;

            let mut next = [(lo, n, d), (m, hi, d), (n + 1, m - 1, d + 1)];
            let size = |r: &(isize, isize, usize)| r.1 - r.0;
            if size(&next[0]) < size(&next[1]) {
                next.swap(0, 1);
            }
            if size(&next[1]) < size(&next[2]) {
                next.swap(1, 2);
            }
            if size(&next[0]) < size(&next[1]) {
                next.swap(0, 1);
            }
            stack.extend_from_slice(&next);
        }
    }

    fn main_sort(&mut self) {
        let n = self.n;
        let block = self.block;

        // Two-byte frequency table.
        self.ftab.fill(0);
        let mut j = (block[0] as usize) << 8;
        for i in (0..n).rev() {
            self.quadrant[i] = 0;
            j = (j >> 8) | ((block[i] as usize) << 8);
            self.ftab[j] += 1;
        }
        for q in &mut self.quadrant[n..n + BLOCK_OVERSHOOT] {
            *q = 0;
        }

        for i in 1..=65536 {
            self.ftab[i] += self.ftab[i - 1];
        }

        let mut s = (block[0] as usize) << 8;
        for i in (0..n).rev() {
            s = (s >> 8) | ((block[i] as usize) << 8);
            self.ftab[s] -= 1;
            self.ptr[self.ftab[s] as usize] = i as u32;
        }

        // Big buckets, smallest first.
        let mut running_order: [usize; 256] = std::array::from_fn(|i| i);
        let mut h = 1;
        while h <= 256 {
            h = 3 * h + 1;
        }
        while h != 1 {
            h /= 3;
            for i in h..256 {
                let vv = running_order[i];
                let mut j = i;
                while self.big_freq(running_order[j - h]) > self.big_freq(vv) {
                    running_order[j] = running_order[j - h];
                    j -= h;
                    if j < h {
                        break;
                    }
                }
                running_order[j] = vv;
            }
        }

        let mut big_done = [false; 256];
        let mut copy_start = [0usize; 256];
        let mut copy_end = [0isize; 256];

        for (round, &ss) in running_order.iter().enumerate() {
            // Step 1: quicksort the unsorted small buckets [ss, j].
            for j in (0..256).filter(|&j| j != ss) {
                let sb = (ss << 8) + j;
                if self.ftab[sb] & SETMASK == 0 {
                    let lo = (self.ftab[sb] & CLEARMASK) as isize;
                    let hi = (self.ftab[sb + 1] & CLEARMASK) as isize - 1;
                    if hi > lo {
                        self.qsort3(lo, hi, N_RADIX);
                        if self.budget < 0 {
                            return;
                        }
                    }
                }
                self.ftab[sb] |= SETMASK;
            }

            // Step 2: derive the order of every [t, ss] bucket from [ss].
            for t in 0..256 {
                copy_start[t] = (self.ftab[(t << 8) + ss] & CLEARMASK) as usize;
                copy_end[t] = (self.ftab[(t << 8) + ss + 1] & CLEARMASK) as isize - 1;
            }
            // copy_start[ss] can grow while scanning, so the bound is re-read.
            let mut j = (self.ftab[ss << 8] & CLEARMASK) as usize;
            while j < copy_start[ss] {
                let p = self.ptr[j];
                let k = if p == 0 { n - 1 } else { p as usize - 1 };
                let c1 = block[k] as usize;
                if !big_done[c1] {
                    self.ptr[copy_start[c1]] = k as u32;
                    copy_start[c1] += 1;
                }
                j += 1;
            }
            let bucket_hi = (self.ftab[(ss + 1) << 8] & CLEARMASK) as isize - 1;
            let mut j = bucket_hi;
            while j > copy_end[ss] {
                let p = self.ptr[j as usize];
                let k = if p == 0 { n - 1 } else { p as usize - 1 };
                let c1 = block[k] as usize;
                if !big_done[c1] {
                    self.ptr[copy_end[c1] as usize] = k as u32;
                    copy_end[c1] -= 1;
                }
                j -= 1;
            }

            for t in 0..256 {
                self.ftab[(t << 8) + ss] |= SETMASK;
            }

            // Step 3: record ranks inside the finished big bucket.
            big_done[ss] = true;

            if round < 255 {
                let bb_start = (self.ftab[ss << 8] & CLEARMASK) as usize;
                let bb_size = (self.ftab[(ss + 1) << 8] & CLEARMASK) as usize - bb_start;
                let mut shifts = 0;
                while (bb_size >> shifts) > 65534 {
                    shifts += 1;
                }

                for j in (0..bb_size).rev() {
                    let a2update = self.ptr[bb_start + j] as usize;
                    let q_val = (j >> shifts) as u16;
                    // Every copy of the position inside the overshoot area.
                    let mut pos = a2update;
                    while pos < n + BLOCK_OVERSHOOT {
                        self.quadrant[pos] = q_val;
                        pos += n;
                    }
                }
            }
        }
    }
}

/// Perform the Burrows-Wheeler Transform.
///
/// Returns the last column of the sorted rotation matrix and the index of
/// the original string in it.
pub fn transform(data: &[u8]) -> (Vec<u8>, u32) {
    if data.is_empty() {
        return (Vec::new(), 0);
    }

    let n = data.len();
    let mut buffer = Vec::with_capacity(n + BLOCK_OVERSHOOT);
    buffer.extend_from_slice(data);
    buffer.resize(n + BLOCK_OVERSHOOT, 0);

    let mut sorter = BlockSorter::new(n);
    let orig_ptr = sorter.sort(&mut buffer, n, None).unwrap_or(0);

    let transformed = sorter
        .ptr()
        .iter()
        .map(|&p| data[if p == 0 { n - 1 } else { p as usize - 1 }])
        .collect();

    (transformed, orig_ptr)
}

/// Invert the Burrows-Wheeler Transform.
pub fn inverse_transform(data: &[u8], orig_ptr: u32) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let n = data.len();
    if orig_ptr as usize >= n {
        return Err(BzError::corrupted(
            0,
            format!("original pointer {} outside block of {}", orig_ptr, n),
        ));
    }

    let mut cftab = [0usize; 257];
    for &b in data {
        cftab[b as usize + 1] += 1;
    }
    for i in 1..257 {
        cftab[i] += cftab[i - 1];
    }

    let mut next = vec![0u32; n];
    for (i, &b) in data.iter().enumerate() {
        next[cftab[b as usize]] = i as u32;
        cftab[b as usize] += 1;
    }

    let mut result = Vec::with_capacity(n);
    let mut pos = next[orig_ptr as usize] as usize;
    for _ in 0..n {
        result.push(data[pos]);
        pos = next[pos] as usize;
    }

    Ok(result)
}
