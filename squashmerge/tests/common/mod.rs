// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use lz4::block::CompressionMode;
use squashmerge::format::{
    codec::Codec,
    delta::{BlockDescriptor, DeltaHeader},
    lzo,
    squashfs::SQUASHFS_MAGIC,
};

pub const LZO_ID: u32 = 0x0100_0001;
/// LZO1X-999 level 9, passed through `lzo1x_optimize()`.
pub const LZO_999_OPT_ID: u32 = 0x0100_0019;
pub const LZ4_ID: u32 = 0x0200_0000;
pub const LZ4_HC_ID: u32 = 0x0200_0001;

/// Filler data with a valid little endian superblock prefix.
pub fn squashfs_image(size: usize, compressor: u16, seed: u8) -> Vec<u8> {
    let mut data = (0..size)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect::<Vec<_>>();
    data[0..4].copy_from_slice(&SQUASHFS_MAGIC.to_le_bytes());
    data[20..22].copy_from_slice(&compressor.to_le_bytes());
    data
}

/// Repetitive, and thus compressible, block contents.
pub fn plaintext(seed: u8, size: usize) -> Vec<u8> {
    (0..size).map(|i| seed.wrapping_add((i % 8) as u8)).collect()
}

/// Pseudo-random words from a small vocabulary. Unlike [`plaintext`], the
/// encoders have real choices to make on this data, so different modes and
/// levels produce different output.
pub fn text(seed: u32, size: usize) -> Vec<u8> {
    const WORDS: [&[u8]; 12] = [
        b"inode ", b"block ", b"fragment ", b"xattr ", b"directory ", b"table ",
        b"superblock ", b"id ", b"export ", b"lookup ", b"data ", b"compressor ",
    ];

    let mut state = seed;
    let mut data = Vec::with_capacity(size + 16);

    while data.len() < size {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
        let n = (state >> 16) as usize;
        data.extend_from_slice(WORDS[n % WORDS.len()]);
        if n % 7 == 0 {
            data.extend_from_slice(format!("{} ", n % 1000).as_bytes());
        }
    }

    data.truncate(size);
    data
}

/// Compress `data` the way mksquashfs does, calling the encoders directly
/// instead of going through [`Codec::compress`].
pub fn compress(codec: &Codec, data: &[u8]) -> Vec<u8> {
    match *codec {
        Codec::Lzo { level, optimized } => {
            let mut compressed = lzo::compress_999(data, level).unwrap();
            if optimized {
                let mut scratch = data.to_vec();
                let n = lzo::optimize(&mut compressed, &mut scratch).unwrap();
                assert_eq!(n, data.len());
            }
            compressed
        }
        Codec::Lz4 { high_compression } => {
            let mode = if high_compression {
                CompressionMode::HIGHCOMPRESSION(9)
            } else {
                CompressionMode::DEFAULT
            };
            lz4::block::compress(data, Some(mode), false).unwrap()
        }
    }
}

/// Compress each plaintext into `image` at the given offset and return the
/// matching descriptors.
pub fn insert_blocks(
    image: &mut [u8],
    codec: &Codec,
    blocks: &[(u32, &[u8])],
) -> Vec<BlockDescriptor> {
    blocks
        .iter()
        .map(|(offset, data)| {
            let compressed = compress(codec, data);
            let start = *offset as usize;
            image[start..start + compressed.len()].copy_from_slice(&compressed);

            BlockDescriptor {
                offset: *offset,
                length: compressed.len() as u32,
                uncompressed_length: data.len() as u32,
            }
        })
        .collect()
}

pub fn header(codec_id: u32, descriptors: &[BlockDescriptor]) -> DeltaHeader {
    DeltaHeader {
        flags: 0,
        compression: codec_id,
        block_count: descriptors.len() as u32,
    }
}

/// A delta file: header, descriptors, then the instruction stream.
pub fn patch(codec_id: u32, descriptors: &[BlockDescriptor], stream: &[u8]) -> Vec<u8> {
    let mut data = header(codec_id, descriptors).to_bytes().to_vec();
    data.extend(BlockDescriptor::encode_list(descriptors));
    data.extend(stream);
    data
}

/// The expanded form of `image`: the image with its blocks zeroed, then the
/// plaintexts, the descriptors, and the header.
pub fn expanded(
    image: &[u8],
    codec_id: u32,
    descriptors: &[BlockDescriptor],
    plaintexts: &[&[u8]],
) -> Vec<u8> {
    let mut data = image.to_vec();

    for d in descriptors {
        let range = d.range();
        data[range.start as usize..range.end as usize].fill(0);
    }

    for p in plaintexts {
        data.extend_from_slice(p);
    }

    data.extend(BlockDescriptor::encode_list(descriptors));
    data.extend(header(codec_id, descriptors).to_bytes());
    data
}
