// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::mem;

use thiserror::Error;
use zerocopy::{FromBytes, little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::format::codec::Family;

/// Magic value for [`RawPrefix::magic`] ("hsqs" when stored little endian).
pub const SQUASHFS_MAGIC: u32 = 0x73717368;
/// [`SQUASHFS_MAGIC`] as seen when reading a big endian image.
pub const SQUASHFS_MAGIC_SWAPPED: u32 = 0x68737173;

/// SquashFS compressor IDs that map to a supported codec family.
pub const COMPRESSOR_LZO: u16 = 3;
pub const COMPRESSOR_LZ4: u16 = 5;

/// Number of bytes of the superblock that are parsed.
pub const PREFIX_SIZE: usize = mem::size_of::<RawPrefix>();

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid magic in squashfs input: {0:#010x}")]
    InvalidMagic(u32),
    #[error("Unsupported compression method in squashfs input: compressor id {0}")]
    UnsupportedCompressor(u16),
    #[error("Squashfs superblock too small: {0} < {size}", size = PREFIX_SIZE)]
    TooSmall(usize),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the start of the superblock. Only the fields needed
/// to find the compressor are declared.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPrefix {
    /// Magic value. Either [`SQUASHFS_MAGIC`] or [`SQUASHFS_MAGIC_SWAPPED`].
    magic: little_endian::U32,
    /// Inode count, modification time, block size, and fragment count.
    unused: [little_endian::U32; 4],
    /// Compressor ID. Byte swapped if the magic is swapped.
    compressor: little_endian::U16,
}

/// The parsed start of a SquashFS superblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SquashfsPrefix {
    /// Whether the image was written with the opposite byte order.
    pub byte_swapped: bool,
    /// Compressor ID, normalized to host order.
    pub compressor: u16,
    pub family: Family,
}

impl SquashfsPrefix {
    /// Parse the superblock prefix from the start of `data`. Bytes past
    /// [`PREFIX_SIZE`] are ignored.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, _) =
            RawPrefix::read_from_prefix(data).map_err(|_| Error::TooSmall(data.len()))?;

        let (byte_swapped, compressor) = match raw.magic.get() {
            SQUASHFS_MAGIC => (false, raw.compressor.get()),
            SQUASHFS_MAGIC_SWAPPED => (true, raw.compressor.get().swap_bytes()),
            m => return Err(Error::InvalidMagic(m)),
        };

        let family = match compressor {
            COMPRESSOR_LZO => Family::Lzo,
            COMPRESSOR_LZ4 => Family::Lz4,
            c => return Err(Error::UnsupportedCompressor(c)),
        };

        Ok(Self {
            byte_swapped,
            compressor,
            family,
        })
    }
}
