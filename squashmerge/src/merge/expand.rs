// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{mem, sync::atomic::AtomicBool};

use rayon::prelude::{IntoParallelIterator, ParallelIterator};
use tracing::{debug, trace};

use crate::{
    format::{
        codec::Codec,
        delta::{BlockDescriptor, DESCRIPTOR_SIZE, DeltaHeader, HEADER_SIZE},
    },
    merge::{Error, Result},
    mmap::MappedFile,
    stream,
    util::NumBytes,
};

/// Size of the scratch file: the whole source image, followed by every changed
/// block's plaintext, the descriptor list, and the header.
pub fn scratch_size(source_len: u64, header: &DeltaHeader, descriptors: &[BlockDescriptor]) -> u64 {
    source_len + BlockDescriptor::total_uncompressed(descriptors) + header.trailer_size()
}

/// Copy the unchanged regions of `source` to the same offsets in `scratch`.
/// The regions covered by changed blocks are left untouched.
fn copy_unchanged(
    source: &MappedFile,
    descriptors: &[BlockDescriptor],
    scratch: &mut MappedFile,
) -> Result<()> {
    let mut prev_end = 0;
    let gaps = descriptors
        .iter()
        .map(|d| d.range())
        .chain(std::iter::once(source.len()..source.len()));

    for range in gaps {
        let size = range.start - prev_end;

        if size > 0 {
            trace!("Copying unchanged range {prev_end:#x}..{:#x}", range.start);

            let data = source.read(prev_end, size)?;
            scratch.write(prev_end, size)?.copy_from_slice(data);
        }

        prev_end = range.end;
    }

    Ok(())
}

/// Decompress each changed block of `source` into its own slice of `output`,
/// in descriptor order. This is multithreaded and uses rayon's global thread
/// pool.
fn decompress_blocks(
    codec: &Codec,
    source: &MappedFile,
    descriptors: &[BlockDescriptor],
    mut output: &mut [u8],
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut jobs = Vec::with_capacity(descriptors.len());

    for (index, d) in descriptors.iter().enumerate() {
        let input = source.read(u64::from(d.offset), u64::from(d.length))?;
        let (block, rest) = mem::take(&mut output).split_at_mut(d.uncompressed_length as usize);
        output = rest;

        jobs.push((index, d, input, block));
    }

    jobs.into_par_iter()
        .map(|(index, d, input, block)| -> Result<()> {
            stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;

            trace!("Decompressing block #{index}: {d:?}");

            let n = codec
                .decompress(input, block)
                .map_err(|source| Error::BlockCodec {
                    index,
                    offset: d.offset,
                    source,
                })?;

            if n != block.len() {
                return Err(Error::DecompressedSize {
                    offset: d.offset,
                    length: d.length,
                    expected: d.uncompressed_length,
                    actual: n,
                });
            }

            Ok(())
        })
        .collect()
}

/// Build the scratch file for xdelta3. `scratch` must be exactly
/// [`scratch_size`] bytes and `descriptors` must be the list stored in
/// `patch`.
///
/// The resulting layout is:
///
/// * `[0, source_len)`: The source image. Changed blocks are left zeroed.
/// * The plaintext of every changed block, in descriptor order.
/// * The descriptor list, copied verbatim from `patch`.
/// * The header, copied verbatim from `patch`.
pub fn expand_source(
    codec: &Codec,
    source: &MappedFile,
    patch: &MappedFile,
    descriptors: &[BlockDescriptor],
    scratch: &mut MappedFile,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    BlockDescriptor::validate_list(descriptors, source.len())
        .map_err(|e| Error::Delta(patch.path().to_owned(), e))?;

    copy_unchanged(source, descriptors, scratch)?;

    let mut offset = source.len();

    let plaintext_size = BlockDescriptor::total_uncompressed(descriptors);
    debug!(
        "Decompressing {} blocks into {:?}",
        descriptors.len(),
        NumBytes(plaintext_size),
    );

    let plaintext = scratch.write(offset, plaintext_size)?;
    decompress_blocks(codec, source, descriptors, plaintext, cancel_signal)?;
    offset += plaintext_size;

    let list_size = descriptors.len() as u64 * DESCRIPTOR_SIZE as u64;
    let list = patch.read(HEADER_SIZE as u64, list_size)?;
    scratch.write(offset, list_size)?.copy_from_slice(list);
    offset += list_size;

    let header = patch.read(0, HEADER_SIZE as u64)?;
    scratch
        .write(offset, HEADER_SIZE as u64)?
        .copy_from_slice(header);
    offset += HEADER_SIZE as u64;

    if offset != scratch.len() {
        return Err(Error::ScratchSize {
            written: offset,
            allocated: scratch.len(),
        });
    }

    Ok(())
}
