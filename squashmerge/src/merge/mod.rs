// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Applying a delta to a SquashFS image happens in three stages:
//!
//! 1. [`expand`]: The changed blocks of the source image are decompressed into
//!    a scratch file laid out as `[source image][block plaintexts][descriptor
//!    list][header]`.
//! 2. [`xdelta`]: xdelta3 turns the scratch file into the expanded target,
//!    which has the same layout, but describes the target's blocks.
//! 3. [`recompress`]: The target's blocks are compressed back into place and
//!    the file is truncated to the size of the target image.

pub mod expand;
pub mod recompress;
pub mod xdelta;

use std::{
    ffi::OsString,
    io::{self, Seek, SeekFrom},
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    format::{
        codec::{self, Family},
        delta::{self, BlockDescriptor, DeltaHeader, HEADER_SIZE},
        squashfs::{self, PREFIX_SIZE, SquashfsPrefix},
    },
    mmap::{self, MappedFile},
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid squashfs image: {0:?}")]
    Squashfs(PathBuf, #[source] squashfs::Error),
    #[error("Invalid delta header or block list: {0:?}")]
    Delta(PathBuf, #[source] delta::Error),
    #[error("Image compressor ({image}) does not match delta compressor ({delta})")]
    FamilyMismatch { image: Family, delta: Family },
    #[error("Block #{index} at {offset:#010x}: codec error")]
    BlockCodec {
        index: usize,
        offset: u32,
        #[source]
        source: codec::Error,
    },
    #[error(
        "Block decompression resulted in different size: \
        offset {offset:#010x}, length {length}, \
        expected unpacked length {expected}, real unpacked length {actual}"
    )]
    DecompressedSize {
        offset: u32,
        length: u32,
        expected: u32,
        actual: usize,
    },
    #[error(
        "Block compression resulted in different size: \
        offset {offset:#010x}, expected packed length {expected}, \
        real packed length {actual}, unpacked length {uncompressed_length}"
    )]
    CompressedSize {
        offset: u32,
        expected: u32,
        actual: usize,
        uncompressed_length: u32,
    },
    #[error("Expanded target ({size} bytes) is too small for its {needed} byte trailer")]
    TargetTooSmall { size: u64, needed: u64 },
    #[error("Scratch file size mismatch: wrote {written} bytes, but allocated {allocated}")]
    ScratchSize { written: u64, allocated: u64 },
    #[error("Unable to start recompression worker #{0}")]
    ThreadSpawn(usize, #[source] io::Error),
    #[error("Unable to seek patch file for applying")]
    PatchSeek(#[source] io::Error),
    #[error("Failed to run xdelta3")]
    Xdelta(#[from] xdelta::Error),
    #[error("I/O error")]
    Mmap(#[from] mmap::Error),
    #[error("Operation cancelled")]
    Cancelled(#[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Settings for [`merge`].
#[derive(Clone, Debug)]
pub struct MergeOptions {
    /// Directory where the scratch file is created.
    pub temp_dir: PathBuf,
    /// xdelta3 executable. Resolved through `PATH` if it is not a path.
    pub xdelta3: OsString,
    /// Number of recompression workers. Defaults to the available parallelism.
    pub threads: Option<NonZeroUsize>,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            xdelta3: "xdelta3".into(),
            threads: None,
        }
    }
}

/// Parse the SquashFS superblock prefix of an image.
pub fn read_squashfs_prefix(file: &MappedFile) -> Result<SquashfsPrefix> {
    let path = || file.path().to_owned();

    let data = file.read(0, PREFIX_SIZE as u64).map_err(|e| match e {
        mmap::Error::OutOfBounds { file_len, .. } => {
            Error::Squashfs(path(), squashfs::Error::TooSmall(file_len as usize))
        }
        e => e.into(),
    })?;

    SquashfsPrefix::parse(data).map_err(|e| Error::Squashfs(path(), e))
}

/// Parse and validate the delta header at `offset`. This is the start of the
/// patch file or the end of an expanded image.
pub fn read_delta_header(file: &MappedFile, offset: u64) -> Result<DeltaHeader> {
    let data = file.read(offset, HEADER_SIZE as u64)?;

    DeltaHeader::parse(data).map_err(|e| Error::Delta(file.path().to_owned(), e))
}

/// Read the `header.block_count` descriptors at `offset`.
pub fn read_descriptors(
    file: &MappedFile,
    offset: u64,
    header: &DeltaHeader,
) -> Result<Vec<BlockDescriptor>> {
    let data = file.read(offset, header.descriptor_list_size())?;

    BlockDescriptor::parse_list(data, header.block_count)
        .map_err(|e| Error::Delta(file.path().to_owned(), e))
}

fn check_family(image: Family, delta: Family) -> Result<()> {
    if image != delta {
        return Err(Error::FamilyMismatch { image, delta });
    }

    Ok(())
}

/// Apply the delta at `patch_path` to `source_path`, writing the new image to
/// `target_path`. On failure, the scratch file is removed, but `target_path`
/// is left behind in an unspecified state.
pub fn merge(
    source_path: &Path,
    patch_path: &Path,
    target_path: &Path,
    options: &MergeOptions,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    info!("Reading source image: {source_path:?}");

    let source = MappedFile::open(source_path)?;
    let prefix = read_squashfs_prefix(&source)?;
    debug!("Source superblock: {prefix:?}");

    info!("Reading delta: {patch_path:?}");

    let patch = MappedFile::open(patch_path)?;
    let header = read_delta_header(&patch, 0)?;
    debug!("Delta header: {header:?}");

    let codec = header
        .codec()
        .map_err(|e| Error::Delta(patch_path.to_owned(), e))?;
    check_family(prefix.family, codec.family())?;

    let descriptors = read_descriptors(&patch, HEADER_SIZE as u64, &header)?;
    BlockDescriptor::validate_list(&descriptors, source.len())
        .map_err(|e| Error::Delta(patch_path.to_owned(), e))?;

    // Opened before any other work so that a bad output path fails early.
    let mut target = MappedFile::create_unmapped(target_path)?;

    let scratch_size = expand::scratch_size(source.len(), &header, &descriptors);
    debug!("Scratch file size: {:?}", NumBytes(scratch_size));

    let (mut scratch, scratch_path) = MappedFile::create_temp(&options.temp_dir, scratch_size)?;

    info!(
        "Expanding {} changed blocks into {:?}",
        descriptors.len(),
        scratch.path(),
    );

    expand::expand_source(
        &codec,
        &source,
        &patch,
        &descriptors,
        &mut scratch,
        cancel_signal,
    )?;
    scratch.sync()?;
    scratch.close();
    drop(source);

    // xdelta3 reads the instruction stream from the shared file position.
    let mut patch_file = patch.file();
    patch_file
        .seek(SeekFrom::Start(header.trailer_size()))
        .map_err(Error::PatchSeek)?;

    info!("Applying delta with {:?}", options.xdelta3);

    xdelta::run_xdelta3(&options.xdelta3, patch.file(), target.file(), &scratch_path)?;

    drop(scratch_path);
    drop(patch);

    target.map_existing()?;

    info!("Recompressing target image: {target_path:?}");

    let threads = options.threads.map_or_else(recompress::default_threads, |n| n.get());
    let size = recompress::recompress_target(target, threads, cancel_signal)?;

    info!("Wrote {:?} to {target_path:?}", NumBytes(size));

    Ok(size)
}
