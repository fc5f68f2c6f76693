//! The parallel encoder must produce the serial encoder's exact bytes.

#![cfg(feature = "parallel")]

use bzkit_bzip2::{
    CompressionLevel, ParallelBzEncoder, ParallelOptions, compress, compress_parallel,
    decompress,
};
use std::io::Write;

fn corpus(len: usize) -> Vec<u8> {
    let mut state = 0x0bad_5eedu64;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let r = (state >> 33) as u32;
        match r % 8 {
            0 => out.extend(std::iter::repeat_n(b'-', (r >> 4) as usize % 400)),
            1..=5 => {
                let word = b"alpha beta gamma delta epsilon zeta eta theta ";
                let start = (r >> 8) as usize % 40;
                out.extend_from_slice(&word[start..start + 6]);
            }
            _ => out.extend_from_slice(&r.to_be_bytes()),
        }
    }
    out.truncate(len);
    out
}

fn options(level: u8, max_workers: usize, buffers_per_core: usize) -> ParallelOptions {
    ParallelOptions::new()
        .with_level(CompressionLevel::new(level).unwrap())
        .with_max_workers(max_workers)
        .unwrap()
        .with_buffers_per_core(buffers_per_core)
        .unwrap()
}

#[test]
fn test_matches_serial_across_levels() {
    let data = corpus(1_300_000);
    for level in [1u8, 3, 9] {
        let serial = compress(&data, CompressionLevel::new(level).unwrap()).unwrap();
        let parallel = compress_parallel(&data, options(level, 8, 2)).unwrap();
        assert_eq!(parallel, serial, "level {}", level);
    }
}

#[test]
fn test_pool_sizes_do_not_change_output() {
    let data = corpus(900_000);
    let expected = compress(&data, CompressionLevel::FASTEST).unwrap();
    for (max_workers, buffers) in [(4, 1), (5, 3), (16, 4), (64, 16)] {
        let got = compress_parallel(&data, options(1, max_workers, buffers)).unwrap();
        assert_eq!(got, expected, "{} workers, {} per core", max_workers, buffers);
    }
}

#[test]
fn test_uneven_writes() {
    let data = corpus(750_000);
    let expected = compress(&data, CompressionLevel::FASTEST).unwrap();

    let mut encoder = ParallelBzEncoder::new(Vec::new(), options(1, 4, 1)).unwrap();
    let mut offset = 0;
    let mut step = 1;
    while offset < data.len() {
        let end = (offset + step).min(data.len());
        encoder.write_all(&data[offset..end]).unwrap();
        offset = end;
        step = step * 3 % 97_711 + 1;
    }
    assert_eq!(encoder.total_in(), data.len() as u64);
    let compressed = encoder.finish().unwrap();
    assert_eq!(compressed, expected);
    assert_eq!(decompress(&compressed[..]).unwrap(), data);
}

#[test]
fn test_runs_spanning_blocks() {
    let level = CompressionLevel::FASTEST;
    let mut data = corpus(level.max_block_len() - 3);
    data.extend(std::iter::repeat_n(b'r', 1_000));
    data.extend(corpus(150_000));
    data.extend(std::iter::repeat_n(0u8, 2_000_000));

    let expected = compress(&data, level).unwrap();
    let got = compress_parallel(&data, options(1, 4, 4)).unwrap();
    assert_eq!(got, expected);
}

#[test]
fn test_flush_does_not_change_output() {
    let data = corpus(400_000);
    let expected = compress(&data, CompressionLevel::FASTEST).unwrap();

    let mut encoder = ParallelBzEncoder::new(Vec::new(), options(1, 4, 2)).unwrap();
    for chunk in data.chunks(33_333) {
        encoder.write_all(chunk).unwrap();
        encoder.flush().unwrap();
    }
    assert_eq!(encoder.finish().unwrap(), expected);
}
