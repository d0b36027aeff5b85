// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{ffi::c_int, fmt, io};

use lz4::block::CompressionMode;
use thiserror::Error;

use crate::format::lzo;

/// Mask for the family tag in the top byte of a codec ID.
const FAMILY_MASK: u32 = 0xff00_0000;
/// Mask for the family-specific option bits.
const OPTIONS_MASK: u32 = 0x00ff_ffff;

const FAMILY_LZO: u32 = 0x01 << 24;
const FAMILY_LZ4: u32 = 0x02 << 24;

/// LZO1X-999 compression level. Only [`LZO_LEVEL_MIN`] through
/// [`LZO_LEVEL_MAX`] are valid.
const LZO_LEVEL_MASK: u32 = 0x0f;
const LZO_LEVEL_MIN: u32 = 1;
const LZO_LEVEL_MAX: u32 = 9;
/// Compressed output was passed through `lzo1x_optimize()`.
const LZO_OPTIMIZED: u32 = 0x10;
const LZO_FLAG_MASK: u32 = OPTIONS_MASK & !LZO_LEVEL_MASK;
const LZO_KNOWN_FLAGS: u32 = LZO_OPTIMIZED;

/// Blocks were compressed with LZ4HC.
const LZ4_HIGH_COMPRESSION: u32 = 0x01;
const LZ4_KNOWN_FLAGS: u32 = LZ4_HIGH_COMPRESSION;
/// `LZ4HC_CLEVEL_DEFAULT` from lz4hc.h.
const LZ4HC_LEVEL: i32 = 9;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown compressor {0:#04x} requested")]
    UnknownFamily(u8),
    #[error("Unsupported LZO variant {0:#04x}")]
    UnsupportedLzoLevel(u32),
    #[error("Unknown LZO flags enabled: {0:#08x}")]
    UnknownLzoFlags(u32),
    #[error("Unknown LZ4 flags enabled: {0:#08x}")]
    UnknownLz4Flags(u32),
    #[error("LZO compression failed: error {0}")]
    LzoCompress(c_int),
    #[error("LZO optimization failed: error {0}")]
    LzoOptimize(c_int),
    #[error("LZO optimization produced {actual} bytes, but expected {expected} bytes")]
    LzoOptimizeLength { expected: usize, actual: usize },
    #[error("LZO decompression failed (corrupted data?): error {0}")]
    LzoDecompress(c_int),
    #[error("LZ4 compression failed")]
    Lz4Compress(#[source] io::Error),
    #[error("LZ4 decompression failed (corrupted data?)")]
    Lz4Decompress(#[source] lz4_flex::block::DecompressError),
    #[error("Compressed data ({actual} bytes) exceeds output capacity ({capacity} bytes)")]
    OutputTooLarge { capacity: usize, actual: usize },
}

type Result<T> = std::result::Result<T, Error>;

/// Compression algorithm family, selected by the top byte of a codec ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Lzo,
    Lz4,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lzo => f.write_str("LZO"),
            Self::Lz4 => f.write_str("LZ4"),
        }
    }
}

/// A validated codec. Constructing one with [`Codec::from_id`] is the
/// initialization step: unknown families, out-of-range levels, and unknown
/// option bits are all rejected there so that newer delta files fail early
/// instead of producing garbage.
///
/// Compression goes through the same libraries mksquashfs links against:
/// liblzo2's LZO1X-999 and liblz4 (HC at the default level when requested).
/// The output is deterministic for a given input and codec, so a recompressed
/// block reproduces the original bytes. Decompression of LZ4 uses `lz4_flex`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Lzo { level: u8, optimized: bool },
    Lz4 { high_compression: bool },
}

impl Codec {
    /// Parse and validate a 32-bit codec ID.
    pub fn from_id(id: u32) -> Result<Self> {
        let options = id & OPTIONS_MASK;

        match id & FAMILY_MASK {
            FAMILY_LZO => {
                let level = options & LZO_LEVEL_MASK;
                if !(LZO_LEVEL_MIN..=LZO_LEVEL_MAX).contains(&level) {
                    return Err(Error::UnsupportedLzoLevel(level));
                }

                let unknown = options & LZO_FLAG_MASK & !LZO_KNOWN_FLAGS;
                if unknown != 0 {
                    return Err(Error::UnknownLzoFlags(unknown));
                }

                Ok(Self::Lzo {
                    level: level as u8,
                    optimized: options & LZO_OPTIMIZED != 0,
                })
            }
            FAMILY_LZ4 => {
                let unknown = options & !LZ4_KNOWN_FLAGS;
                if unknown != 0 {
                    return Err(Error::UnknownLz4Flags(unknown));
                }

                Ok(Self::Lz4 {
                    high_compression: options & LZ4_HIGH_COMPRESSION != 0,
                })
            }
            f => Err(Error::UnknownFamily((f >> 24) as u8)),
        }
    }

    /// Encode back into a 32-bit codec ID.
    pub fn id(&self) -> u32 {
        match *self {
            Self::Lzo { level, optimized } => {
                let mut id = FAMILY_LZO | u32::from(level);
                if optimized {
                    id |= LZO_OPTIMIZED;
                }
                id
            }
            Self::Lz4 { high_compression } => {
                let mut id = FAMILY_LZ4;
                if high_compression {
                    id |= LZ4_HIGH_COMPRESSION;
                }
                id
            }
        }
    }

    pub fn family(&self) -> Family {
        match self {
            Self::Lzo { .. } => Family::Lzo,
            Self::Lz4 { .. } => Family::Lz4,
        }
    }

    /// Compress `src` into `dest` and return the number of bytes written.
    /// Fails if the compressed data does not fit in `dest`.
    pub fn compress(&self, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        match *self {
            Self::Lzo { level, optimized } => {
                let mut buf = lzo::compress_999(src, level).map_err(Error::LzoCompress)?;

                if optimized {
                    // lzo1x_optimize() needs the plaintext as scratch space.
                    let mut scratch = src.to_vec();
                    let n = lzo::optimize(&mut buf, &mut scratch).map_err(Error::LzoOptimize)?;
                    if n != src.len() {
                        return Err(Error::LzoOptimizeLength {
                            expected: src.len(),
                            actual: n,
                        });
                    }
                }

                copy_into(&buf, dest)
            }
            Self::Lz4 { high_compression } => {
                let mode = if high_compression {
                    CompressionMode::HIGHCOMPRESSION(LZ4HC_LEVEL)
                } else {
                    CompressionMode::DEFAULT
                };
                let buf =
                    lz4::block::compress(src, Some(mode), false).map_err(Error::Lz4Compress)?;

                copy_into(&buf, dest)
            }
        }
    }

    /// Decompress `src` into `dest` and return the number of bytes written.
    /// Fails if the data is corrupt or does not fit in `dest`.
    pub fn decompress(&self, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        match self {
            Self::Lzo { .. } => lzo::decompress_safe(src, dest).map_err(Error::LzoDecompress),
            Self::Lz4 { .. } => {
                lz4_flex::block::decompress_into(src, dest).map_err(Error::Lz4Decompress)
            }
        }
    }
}

fn copy_into(data: &[u8], dest: &mut [u8]) -> Result<usize> {
    if data.len() > dest.len() {
        return Err(Error::OutputTooLarge {
            capacity: dest.len(),
            actual: data.len(),
        });
    }

    dest[..data.len()].copy_from_slice(data);

    Ok(data.len())
}
