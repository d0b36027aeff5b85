// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use assert_matches::assert_matches;

use squashmerge::format::codec::{Codec, Error, Family};

fn compress(codec: &Codec, data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; data.len() * 2 + 64];
    let n = codec.compress(data, &mut buf).unwrap();
    buf.truncate(n);
    buf
}

#[test]
fn parse_ids() {
    assert_eq!(
        Codec::from_id(0x0100_0009).unwrap(),
        Codec::Lzo {
            level: 9,
            optimized: false,
        },
    );
    assert_eq!(
        Codec::from_id(0x0200_0001).unwrap(),
        Codec::Lz4 {
            high_compression: true,
        },
    );
    assert_eq!(Codec::from_id(0x0200_0000).unwrap().family(), Family::Lz4);
}

#[test]
fn reject_unknown_ids() {
    assert_matches!(Codec::from_id(0x0300_0000), Err(Error::UnknownFamily(3)));
    assert_matches!(Codec::from_id(0), Err(Error::UnknownFamily(0)));
    assert_matches!(
        Codec::from_id(0x0100_0000),
        Err(Error::UnsupportedLzoLevel(0))
    );
    assert_matches!(
        Codec::from_id(0x0100_000a),
        Err(Error::UnsupportedLzoLevel(10))
    );
    assert_matches!(
        Codec::from_id(0x0101_0001),
        Err(Error::UnknownLzoFlags(0x1_0000))
    );
    assert_matches!(Codec::from_id(0x0200_0002), Err(Error::UnknownLz4Flags(2)));
}

fn round_trip(codec: Codec) {
    let data = b"squashfs block data ".repeat(200);

    let mut compressed = vec![0u8; data.len() * 2];
    let n = codec.compress(&data, &mut compressed).unwrap();
    assert!(n < data.len());

    let mut decompressed = vec![0u8; data.len()];
    let m = codec.decompress(&compressed[..n], &mut decompressed).unwrap();
    assert_eq!(m, data.len());
    assert_eq!(decompressed, data);
}

#[test]
fn round_trip_lzo() {
    round_trip(Codec::from_id(0x0100_0001).unwrap());
}

#[test]
fn round_trip_lz4() {
    round_trip(Codec::from_id(0x0200_0000).unwrap());
}

#[test]
fn matches_reference_encoders() {
    let data = common::text(1, 4096);

    for id in [
        common::LZO_ID,
        0x0100_0009,
        common::LZO_999_OPT_ID,
        common::LZ4_ID,
        common::LZ4_HC_ID,
    ] {
        let codec = Codec::from_id(id).unwrap();
        assert_eq!(
            compress(&codec, &data),
            common::compress(&codec, &data),
            "codec: {id:#010x}"
        );
    }
}

#[test]
fn options_change_output() {
    let data = common::text(2, 4096);

    let lz4 = compress(&Codec::from_id(common::LZ4_ID).unwrap(), &data);
    let lz4_hc = compress(&Codec::from_id(common::LZ4_HC_ID).unwrap(), &data);
    assert!(lz4_hc.len() < lz4.len(), "{} >= {}", lz4_hc.len(), lz4.len());

    let lzo_1 = compress(&Codec::from_id(common::LZO_ID).unwrap(), &data);
    let lzo_9 = compress(&Codec::from_id(common::LZO_999_OPT_ID).unwrap(), &data);
    assert_ne!(lzo_1, lzo_9);

    for (id, compressed) in [
        (common::LZ4_HC_ID, &lz4_hc),
        (common::LZO_999_OPT_ID, &lzo_9),
    ] {
        let mut decompressed = vec![0u8; data.len()];
        let n = Codec::from_id(id)
            .unwrap()
            .decompress(compressed, &mut decompressed)
            .unwrap();
        assert_eq!(n, data.len());
        assert_eq!(decompressed, data);
    }
}

#[test]
fn compress_output_too_small() {
    let codec = Codec::from_id(0x0200_0000).unwrap();
    let data = (0..=255u8).collect::<Vec<_>>();
    let mut buf = [0u8; 16];

    assert_matches!(
        codec.compress(&data, &mut buf),
        Err(Error::OutputTooLarge { capacity: 16, .. })
    );
}

#[test]
fn decompress_into_small_buffer() {
    let data = b"squashfs block data ".repeat(10);
    let mut buf = vec![0u8; 8];

    for id in [0x0100_0001, 0x0200_0000] {
        let codec = Codec::from_id(id).unwrap();

        let mut compressed = vec![0u8; data.len() * 2];
        let n = codec.compress(&data, &mut compressed).unwrap();

        assert!(codec.decompress(&compressed[..n], &mut buf).is_err());
    }
}
