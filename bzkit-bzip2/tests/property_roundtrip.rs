use bzkit_bzip2::{BzEncoder, CompressionLevel, compress, decompress, decompress_multi};
use proptest::collection::vec;
use proptest::prelude::*;
use std::io::Write;

/// Bytes drawn from a small alphabet with long runs mixed in, so RLE1 and
/// zero-run coding both get exercised.
fn runny_bytes() -> impl Strategy<Value = Vec<u8>> {
    vec((0u8..6, 1usize..400), 0..60).prop_map(|pieces| {
        let mut out = Vec::new();
        for (byte, len) in pieces {
            out.extend(std::iter::repeat_n(b'a' + byte, len));
        }
        out
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_roundtrip_arbitrary(data in vec(any::<u8>(), 0..4096), level in 1u8..=9) {
        let compressed = compress(&data, CompressionLevel::new(level).unwrap()).unwrap();
        prop_assert_eq!(decompress(&compressed[..]).unwrap(), data);
    }

    #[test]
    fn prop_roundtrip_runs(data in runny_bytes()) {
        let compressed = compress(&data, CompressionLevel::FASTEST).unwrap();
        prop_assert_eq!(decompress(&compressed[..]).unwrap(), data);
    }

    #[test]
    fn prop_chunking_is_invisible(data in runny_bytes(), chunk in 1usize..500) {
        let expected = compress(&data, CompressionLevel::FASTEST).unwrap();
        let mut encoder = BzEncoder::new(Vec::new(), CompressionLevel::FASTEST).unwrap();
        for piece in data.chunks(chunk) {
            encoder.write_all(piece).unwrap();
        }
        prop_assert_eq!(encoder.finish().unwrap(), expected);
    }

    #[test]
    fn prop_concatenation(a in vec(any::<u8>(), 0..1024), b in runny_bytes()) {
        let mut joined = compress(&a, CompressionLevel::FASTEST).unwrap();
        joined.extend(compress(&b, CompressionLevel::BEST).unwrap());
        let mut expected = a.clone();
        expected.extend_from_slice(&b);
        prop_assert_eq!(decompress_multi(&joined[..]).unwrap(), expected);
    }

    #[test]
    fn prop_reference_decodes(data in runny_bytes()) {
        let compressed = compress(&data, CompressionLevel::FASTEST).unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut bzip2::read::BzDecoder::new(&compressed[..]), &mut out)
            .unwrap();
        prop_assert_eq!(out, data);
    }
}
