// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Delta container layout. All integers are big endian.
//!
//! | Offset | Field                                            |
//! |--------|--------------------------------------------------|
//! | 0      | Magic ([`DELTA_MAGIC`])                          |
//! | 4      | Flags (must be 0)                                |
//! | 8      | Codec ID (see [`crate::format::codec`])          |
//! | 12     | Block count                                      |
//! | 16     | Block count × [`BlockDescriptor`]                |
//! | ...    | xdelta3 instruction stream                       |
//!
//! The expanded source and the expanded target carry the same descriptor list
//! and header as a trailer, in the opposite order: descriptors first, then the
//! header at the very end of the file.

use std::{fmt, mem, ops::Range};

use thiserror::Error;
use zerocopy::{FromBytes, IntoBytes, big_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::format::codec::{self, Codec};

/// Magic value for [`RawHeader::magic`].
pub const DELTA_MAGIC: u32 = 0x5371ceb4;

/// Size of the delta header.
pub const HEADER_SIZE: usize = mem::size_of::<RawHeader>();
/// Size of a single block descriptor.
pub const DESCRIPTOR_SIZE: usize = mem::size_of::<RawDescriptor>();

#[derive(Debug, Error)]
pub enum Error {
    #[error("Incorrect magic in patch file: {magic:#010x}, expected: {expected:#010x}", expected = DELTA_MAGIC)]
    InvalidMagic { magic: u32 },
    #[error("Unknown flag enabled in patch file: {0:#010x}")]
    UnknownFlags(u32),
    #[error("Delta header too small: {0} < {size}", size = HEADER_SIZE)]
    HeaderTooSmall(usize),
    #[error("Descriptor list has {actual} bytes, but {count} descriptors need {expected}")]
    InvalidDescriptorListSize {
        count: u32,
        expected: u64,
        actual: usize,
    },
    #[error("Block #{index}: Empty block at offset {offset:#010x}")]
    EmptyBlock { index: usize, offset: u32 },
    #[error("Block #{index}: Offset {offset:#010x} overlaps or precedes previous block ending at {prev_end:#010x}")]
    Unordered {
        index: usize,
        offset: u32,
        prev_end: u64,
    },
    #[error("Block #{index}: Range {start:#x}..{end:#x} exceeds image size {limit:#x}")]
    OutOfBounds {
        index: usize,
        start: u64,
        end: u64,
        limit: u64,
    },
    #[error("Invalid codec in delta header")]
    Codec(#[from] codec::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw on-disk layout for the header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// Magic value. This should be equal to [`DELTA_MAGIC`].
    magic: big_endian::U32,
    /// Reserved for future use. Must be 0.
    flags: big_endian::U32,
    /// Codec ID used for the changed blocks.
    compression: big_endian::U32,
    /// Number of [`RawDescriptor`]s following the header.
    block_count: big_endian::U32,
}

/// Raw on-disk layout for a changed block.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawDescriptor {
    /// Offset of the compressed block in the image.
    offset: big_endian::U32,
    /// Size of the compressed block.
    length: big_endian::U32,
    /// Size of the block after decompression.
    uncompressed_length: big_endian::U32,
}

/// Delta header.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DeltaHeader {
    /// Always 0 for a successfully parsed header.
    pub flags: u32,
    /// Raw codec ID. Use [`Self::codec`] to validate it.
    pub compression: u32,
    pub block_count: u32,
}

impl fmt::Debug for DeltaHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaHeader")
            .field("flags", &format_args!("{:#010x}", self.flags))
            .field("compression", &format_args!("{:#010x}", self.compression))
            .field("block_count", &self.block_count)
            .finish()
    }
}

impl DeltaHeader {
    /// Parse and validate a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (raw, _) =
            RawHeader::read_from_prefix(data).map_err(|_| Error::HeaderTooSmall(data.len()))?;

        if raw.magic.get() != DELTA_MAGIC {
            return Err(Error::InvalidMagic {
                magic: raw.magic.get(),
            });
        }

        if raw.flags.get() != 0 {
            return Err(Error::UnknownFlags(raw.flags.get()));
        }

        Ok(Self {
            flags: raw.flags.get(),
            compression: raw.compression.get(),
            block_count: raw.block_count.get(),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let raw = RawHeader {
            magic: DELTA_MAGIC.into(),
            flags: self.flags.into(),
            compression: self.compression.into(),
            block_count: self.block_count.into(),
        };

        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(raw.as_bytes());
        buf
    }

    /// Validate the codec ID and initialize the codec.
    pub fn codec(&self) -> Result<Codec> {
        Ok(Codec::from_id(self.compression)?)
    }

    /// Size of the descriptor list in bytes.
    pub fn descriptor_list_size(&self) -> u64 {
        u64::from(self.block_count) * DESCRIPTOR_SIZE as u64
    }

    /// Size of the descriptor list plus the header.
    pub fn trailer_size(&self) -> u64 {
        self.descriptor_list_size() + HEADER_SIZE as u64
    }
}

/// A changed block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub offset: u32,
    pub length: u32,
    pub uncompressed_length: u32,
}

impl fmt::Debug for BlockDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockDescriptor")
            .field("offset", &format_args!("{:#010x}", self.offset))
            .field("length", &self.length)
            .field("uncompressed_length", &self.uncompressed_length)
            .finish()
    }
}

impl BlockDescriptor {
    /// Byte range of the compressed block within the image.
    pub fn range(&self) -> Range<u64> {
        let start = u64::from(self.offset);
        start..start + u64::from(self.length)
    }

    /// Parse `count` descriptors from `data`, which must be exactly the size
    /// of the list.
    pub fn parse_list(data: &[u8], count: u32) -> Result<Vec<Self>> {
        let expected = u64::from(count) * DESCRIPTOR_SIZE as u64;
        let size_error = || Error::InvalidDescriptorListSize {
            count,
            expected,
            actual: data.len(),
        };

        if data.len() as u64 != expected {
            return Err(size_error());
        }

        let raw = <[RawDescriptor]>::ref_from_bytes(data).map_err(|_| size_error())?;

        Ok(raw
            .iter()
            .map(|d| Self {
                offset: d.offset.get(),
                length: d.length.get(),
                uncompressed_length: d.uncompressed_length.get(),
            })
            .collect())
    }

    /// Serialize descriptors into their on-disk form.
    pub fn encode_list(descriptors: &[Self]) -> Vec<u8> {
        let raw = descriptors
            .iter()
            .map(|d| RawDescriptor {
                offset: d.offset.into(),
                length: d.length.into(),
                uncompressed_length: d.uncompressed_length.into(),
            })
            .collect::<Vec<_>>();

        raw.as_bytes().to_vec()
    }

    /// Ensure that the compressed ranges are non-empty, strictly ascending,
    /// non-overlapping, and end at or before `limit`. Every later stage relies
    /// on this to hand out disjoint regions of the image.
    pub fn validate_list(descriptors: &[Self], limit: u64) -> Result<()> {
        let mut prev_end = 0;

        for (index, d) in descriptors.iter().enumerate() {
            if d.length == 0 || d.uncompressed_length == 0 {
                return Err(Error::EmptyBlock {
                    index,
                    offset: d.offset,
                });
            }

            let range = d.range();

            if index > 0 && range.start < prev_end {
                return Err(Error::Unordered {
                    index,
                    offset: d.offset,
                    prev_end,
                });
            }

            if range.end > limit {
                return Err(Error::OutOfBounds {
                    index,
                    start: range.start,
                    end: range.end,
                    limit,
                });
            }

            prev_end = range.end;
        }

        Ok(())
    }

    /// Total size of all blocks after decompression.
    pub fn total_uncompressed(descriptors: &[Self]) -> u64 {
        descriptors
            .iter()
            .map(|d| u64::from(d.uncompressed_length))
            .sum()
    }
}
