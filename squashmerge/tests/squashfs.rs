// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use assert_matches::assert_matches;

use squashmerge::format::{
    codec::Family,
    squashfs::{
        COMPRESSOR_LZ4, COMPRESSOR_LZO, Error, PREFIX_SIZE, SQUASHFS_MAGIC,
        SQUASHFS_MAGIC_SWAPPED, SquashfsPrefix,
    },
};

fn prefix(magic: [u8; 4], compressor: [u8; 2]) -> Vec<u8> {
    let mut data = vec![0u8; 96];
    data[0..4].copy_from_slice(&magic);
    data[20..22].copy_from_slice(&compressor);
    data
}

#[test]
fn native_byte_order() {
    let data = prefix(*b"hsqs", COMPRESSOR_LZ4.to_le_bytes());

    let parsed = SquashfsPrefix::parse(&data).unwrap();
    assert!(!parsed.byte_swapped);
    assert_eq!(parsed.compressor, COMPRESSOR_LZ4);
    assert_eq!(parsed.family, Family::Lz4);
}

#[test]
fn swapped_byte_order() {
    let data = prefix(*b"sqsh", COMPRESSOR_LZO.to_be_bytes());

    let parsed = SquashfsPrefix::parse(&data).unwrap();
    assert!(parsed.byte_swapped);
    assert_eq!(parsed.compressor, COMPRESSOR_LZO);
    assert_eq!(parsed.family, Family::Lzo);
    assert_eq!(
        format!("{parsed:?}"),
        "SquashfsPrefix { byte_swapped: true, compressor: 3, family: Lzo }",
    );
}

#[test]
fn magic_constants() {
    assert_eq!(SQUASHFS_MAGIC.to_le_bytes(), *b"hsqs");
    assert_eq!(SQUASHFS_MAGIC_SWAPPED.to_le_bytes(), *b"sqsh");
    assert_eq!(PREFIX_SIZE, 22);
}

#[test]
fn reject_bad_prefix() {
    let data = prefix(*b"hsqx", COMPRESSOR_LZ4.to_le_bytes());
    assert_matches!(SquashfsPrefix::parse(&data), Err(Error::InvalidMagic(_)));

    // gzip is a valid squashfs compressor, but has no codec here.
    let data = prefix(*b"hsqs", 1u16.to_le_bytes());
    assert_matches!(
        SquashfsPrefix::parse(&data),
        Err(Error::UnsupportedCompressor(1))
    );

    // Native magic with a big endian compressor ID.
    let data = prefix(*b"hsqs", COMPRESSOR_LZ4.to_be_bytes());
    assert_matches!(
        SquashfsPrefix::parse(&data),
        Err(Error::UnsupportedCompressor(0x0500))
    );

    let data = prefix(*b"hsqs", COMPRESSOR_LZ4.to_le_bytes());
    assert_matches!(
        SquashfsPrefix::parse(&data[..PREFIX_SIZE - 1]),
        Err(Error::TooSmall(21))
    );
}
