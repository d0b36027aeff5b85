// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    mem,
    num::NonZeroUsize,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use tracing::{debug, trace, warn};

use crate::{
    format::{
        codec::{self, Codec},
        delta::{BlockDescriptor, HEADER_SIZE},
    },
    merge::{self, Error, Result},
    mmap::MappedFile,
    stream,
    util::NumBytes,
};

/// Number of workers to use when none is specified.
pub fn default_threads() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// A single block to compress back into the image.
struct Job<'a> {
    index: usize,
    descriptor: BlockDescriptor,
    plaintext: &'a [u8],
    output: &'a mut [u8],
}

/// Where each block's plaintext lives in the expanded target. The plaintexts
/// are stored in descriptor order immediately before the descriptor list, so
/// walking the list backwards from there and subtracting each block's
/// uncompressed size yields every block's start. The final cursor is the end
/// of the target image.
fn plaintext_offsets(descriptors: &[BlockDescriptor], list_offset: u64) -> (Vec<u64>, u64) {
    let mut cursor = list_offset;
    let mut offsets = vec![0; descriptors.len()];

    for (index, d) in descriptors.iter().enumerate().rev() {
        cursor -= u64::from(d.uncompressed_length);
        offsets[index] = cursor;
    }

    (offsets, cursor)
}

fn compress_block(codec: &Codec, job: &mut Job<'_>) -> Result<()> {
    let d = &job.descriptor;

    trace!("Compressing block #{}: {d:?}", job.index);

    let n = match codec.compress(job.plaintext, job.output) {
        Ok(n) => n,
        Err(codec::Error::OutputTooLarge { actual, .. }) => actual,
        Err(source) => {
            return Err(Error::BlockCodec {
                index: job.index,
                offset: d.offset,
                source,
            });
        }
    };

    if n != job.output.len() {
        return Err(Error::CompressedSize {
            offset: d.offset,
            expected: d.length,
            actual: n,
            uncompressed_length: d.uncompressed_length,
        });
    }

    Ok(())
}

/// Run `compress` for every job on `threads` workers. Job `i` is always
/// handled by worker `i % threads`, and each worker processes its jobs in
/// descending index order.
///
/// A worker that returns an error fails the whole operation. A worker that
/// panics is only logged: its join failure does not turn an otherwise
/// successful run into a failure.
fn run_workers<'a, F>(
    jobs: Vec<Job<'a>>,
    threads: usize,
    cancel_signal: &AtomicBool,
    compress: F,
) -> Result<()>
where
    F: Fn(&mut Job<'a>) -> Result<()> + Sync,
{
    let threads = threads.max(1);
    let mut buckets = (0..threads).map(|_| Vec::new()).collect::<Vec<_>>();

    for job in jobs.into_iter().rev() {
        buckets[job.index % threads].push(job);
    }

    // Tells already running workers to stop if a later spawn fails.
    let abort = AtomicBool::new(false);

    thread::scope(|s| {
        let mut handles = Vec::with_capacity(threads);
        let mut error = None;

        for (id, mut bucket) in buckets.into_iter().enumerate() {
            let compress = &compress;
            let abort = &abort;

            let result = thread::Builder::new()
                .name(format!("recompress-{id}"))
                .spawn_scoped(s, move || -> Result<()> {
                    for job in &mut bucket {
                        if abort.load(Ordering::SeqCst) {
                            break;
                        }

                        stream::check_cancel(cancel_signal).map_err(Error::Cancelled)?;
                        compress(job)?;
                    }

                    Ok(())
                });

            match result {
                Ok(handle) => handles.push((id, handle)),
                Err(e) => {
                    abort.store(true, Ordering::SeqCst);
                    error = Some(Error::ThreadSpawn(id, e));
                    break;
                }
            }
        }

        for (id, handle) in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if error.is_none() {
                        error = Some(e);
                    } else {
                        debug!("Worker #{id} also failed: {e}");
                    }
                }
                Err(_) => warn!("Worker #{id} panicked; ignoring"),
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
}

/// Compress the blocks of a fully expanded target back into place and truncate
/// it to the size of the target image. `target` must be mapped read-write and
/// end with the trailer written by the delta: the block plaintexts, then the
/// descriptor list, then the header.
///
/// On failure, the file is not truncated. Returns the final size.
pub fn recompress_target(
    mut target: MappedFile,
    threads: usize,
    cancel_signal: &AtomicBool,
) -> Result<u64> {
    let file_size = target.len();
    let header_offset =
        file_size
            .checked_sub(HEADER_SIZE as u64)
            .ok_or_else(|| Error::TargetTooSmall {
                size: file_size,
                needed: HEADER_SIZE as u64,
            })?;

    let header = merge::read_delta_header(&target, header_offset)?;
    debug!("Target trailer header: {header:?}");

    let codec = header
        .codec()
        .map_err(|e| Error::Delta(target.path().to_owned(), e))?;

    let list_offset =
        file_size
            .checked_sub(header.trailer_size())
            .ok_or_else(|| Error::TargetTooSmall {
                size: file_size,
                needed: header.trailer_size(),
            })?;
    let descriptors = merge::read_descriptors(&target, list_offset, &header)?;

    let plaintext_size = BlockDescriptor::total_uncompressed(&descriptors);
    if plaintext_size > list_offset {
        return Err(Error::TargetTooSmall {
            size: file_size,
            needed: header.trailer_size() + plaintext_size,
        });
    }

    let (offsets, image_size) = plaintext_offsets(&descriptors, list_offset);

    BlockDescriptor::validate_list(&descriptors, image_size)
        .map_err(|e| Error::Delta(target.path().to_owned(), e))?;

    let prefix = merge::read_squashfs_prefix(&target)?;
    merge::check_family(prefix.family, codec.family())?;

    debug!(
        "Compressing {} blocks from {:?} of plaintext; image size: {:?}",
        descriptors.len(),
        NumBytes(plaintext_size),
        NumBytes(image_size),
    );

    {
        let data = target.write(0, list_offset)?;
        let (mut image, plaintext) = data.split_at_mut(image_size as usize);
        let plaintext = &*plaintext;
        let mut consumed = 0;
        let mut jobs = Vec::with_capacity(descriptors.len());

        for (index, (d, offset)) in descriptors.iter().zip(&offsets).enumerate() {
            let gap = u64::from(d.offset) - consumed;
            let (_, rest) = mem::take(&mut image).split_at_mut(gap as usize);
            let (output, rest) = rest.split_at_mut(d.length as usize);
            image = rest;
            consumed = d.range().end;

            let start = (offset - image_size) as usize;
            let end = start + d.uncompressed_length as usize;

            jobs.push(Job {
                index,
                descriptor: *d,
                plaintext: &plaintext[start..end],
                output,
            });
        }

        run_workers(jobs, threads, cancel_signal, |job| {
            compress_block(&codec, job)
        })?;
    }

    target.truncate(image_size)?;

    Ok(image_size)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn make_jobs<'a>(outputs: &'a mut [[u8; 4]], plaintext: &'a [u8]) -> Vec<Job<'a>> {
        outputs
            .iter_mut()
            .enumerate()
            .map(|(index, output)| Job {
                index,
                descriptor: BlockDescriptor {
                    offset: index as u32 * 4,
                    length: 4,
                    uncompressed_length: plaintext.len() as u32,
                },
                plaintext,
                output,
            })
            .collect()
    }

    #[test]
    fn cursor_walk() {
        let descriptors = [
            BlockDescriptor {
                offset: 0,
                length: 10,
                uncompressed_length: 20,
            },
            BlockDescriptor {
                offset: 50,
                length: 5,
                uncompressed_length: 30,
            },
        ];

        let (offsets, cursor) = plaintext_offsets(&descriptors, 150);
        assert_eq!(offsets, [100, 120]);
        assert_eq!(cursor, 100);
    }

    #[test]
    fn static_partitioning() {
        let mut outputs = [[0u8; 4]; 7];
        let jobs = make_jobs(&mut outputs, b"data");
        let seen = Mutex::new(Vec::new());

        run_workers(jobs, 3, &AtomicBool::new(false), |job| {
            let name = thread::current().name().unwrap().to_owned();
            seen.lock().unwrap().push((job.index, name));
            job.output.copy_from_slice(job.plaintext);
            Ok(())
        })
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen.len(), 7);
        for (index, name) in seen {
            assert_eq!(name, format!("recompress-{}", index % 3));
        }

        assert!(outputs.iter().all(|o| o == b"data"));
    }

    #[test]
    fn worker_error_is_fatal() {
        let mut outputs = [[0u8; 4]; 4];
        let jobs = make_jobs(&mut outputs, b"data");

        let result = run_workers(jobs, 2, &AtomicBool::new(false), |job| {
            if job.index == 2 {
                return Err(Error::CompressedSize {
                    offset: job.descriptor.offset,
                    expected: 4,
                    actual: 5,
                    uncompressed_length: 4,
                });
            }
            Ok(())
        });

        assert!(matches!(result, Err(Error::CompressedSize { offset: 8, .. })));
    }

    /// A panicking worker is logged but does not fail the run.
    #[test]
    fn worker_panic_is_not_fatal() {
        let mut outputs = [[0u8; 4]; 4];
        let jobs = make_jobs(&mut outputs, b"data");

        let result = run_workers(jobs, 2, &AtomicBool::new(false), |job| {
            if job.index == 1 {
                panic!("Simulated worker crash");
            }
            job.output.copy_from_slice(job.plaintext);
            Ok(())
        });

        assert!(result.is_ok());
        assert_eq!(&outputs[0], b"data");
        assert_eq!(&outputs[2], b"data");
    }

    #[test]
    fn cancelled() {
        let mut outputs = [[0u8; 4]; 2];
        let jobs = make_jobs(&mut outputs, b"data");

        let result = run_workers(jobs, 1, &AtomicBool::new(true), |_| Ok(()));

        assert!(matches!(result, Err(Error::Cancelled(_))));
    }
}
