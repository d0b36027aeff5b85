// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Memory-mapped files with bounds-checked access. Both the patch and the
//! images are untrusted, so every byte range goes through [`MappedFile::read`]
//! or [`MappedFile::write`] before use.

use std::{
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use memmap2::{Mmap, MmapMut, MmapOptions};
use num_traits::ToPrimitive;
use tempfile::TempPath;
use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to open file: {0:?}")]
    Open(PathBuf, #[source] io::Error),
    #[error("Unable to seek file (is it a regular file?): {0:?}")]
    Seek(PathBuf, #[source] io::Error),
    #[error("Unable to mmap() file: {0:?}")]
    Map(PathBuf, #[source] io::Error),
    #[error("Unable to create a temporary file in: {0:?}")]
    CreateTemp(PathBuf, #[source] io::Error),
    #[error("Unable to resize file to {1} bytes: {0:?}")]
    Resize(PathBuf, u64, #[source] io::Error),
    #[error("File update failed: {0:?}")]
    Sync(PathBuf, #[source] io::Error),
    #[error("File too large to map: {0:?}: {1} bytes")]
    TooLarge(PathBuf, u64),
    #[error("Trying to access past end of file: {offset:#x} + {length} > {file_len}: {path:?}")]
    OutOfBounds {
        path: PathBuf,
        offset: u64,
        length: u64,
        file_len: u64,
    },
    #[error("File is mapped read-only: {0:?}")]
    ReadOnly(PathBuf),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
enum Mapping {
    /// Nothing mapped yet. Behaves like an empty file.
    None,
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

/// An open file with an optional mapping over its full length.
///
/// Dropping the instance flushes dirty pages, unmaps, and closes the file.
/// Failures during that step are logged, not returned, because by then the
/// data is either already durable or the caller is handling another error.
#[derive(Debug)]
pub struct MappedFile {
    path: PathBuf,
    file: File,
    map: Mapping,
    len: u64,
}

impl MappedFile {
    /// Open an existing file and map it read-only.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::Open(path.to_owned(), e))?;
        let mut result = Self {
            path: path.to_owned(),
            file,
            map: Mapping::None,
            len: 0,
        };

        result.len = result.measure()?;

        let len = result.map_len()?;
        // SAFETY: The file is opened read-only and the mapping is never handed
        // out beyond the lifetime of `self`. Concurrent modification by other
        // processes is outside of our control, same as for any mmap user.
        let map = unsafe { MmapOptions::new().len(len).map(&result.file) }
            .map_err(|e| Error::Map(path.to_owned(), e))?;
        result.map = Mapping::ReadOnly(map);

        Ok(result)
    }

    /// Create a uniquely named temporary file in `dir`, resize it to exactly
    /// `size` bytes, and map it read-write. The file is deleted when the
    /// returned [`TempPath`] is dropped.
    pub fn create_temp(dir: &Path, size: u64) -> Result<(Self, TempPath)> {
        let temp = tempfile::Builder::new()
            .prefix("tmp.")
            .tempfile_in(dir)
            .map_err(|e| Error::CreateTemp(dir.to_owned(), e))?;
        let (file, temp_path) = temp.into_parts();
        let path = temp_path.to_path_buf();

        file.set_len(size)
            .map_err(|e| Error::Resize(path.clone(), size, e))?;

        let mut result = Self {
            path,
            file,
            map: Mapping::None,
            len: size,
        };
        result.map_read_write()?;

        Ok((result, temp_path))
    }

    /// Create or truncate a file for writing without mapping it. Mapping an
    /// empty file is not useful, so the caller fills it through
    /// [`Self::file`] first and then calls [`Self::map_existing`].
    pub fn create_unmapped(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Open(path.to_owned(), e))?;

        Ok(Self {
            path: path.to_owned(),
            file,
            map: Mapping::None,
            len: 0,
        })
    }

    /// Re-measure a file that has been written to externally and map it
    /// read-write.
    pub fn map_existing(&mut self) -> Result<()> {
        self.unmap();
        self.len = self.measure()?;
        self.map_read_write()
    }

    fn measure(&mut self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(|e| Error::Seek(self.path.clone(), e))?;
        if !metadata.is_file() {
            return Err(Error::Seek(
                self.path.clone(),
                io::Error::new(io::ErrorKind::InvalidInput, "Not a regular file"),
            ));
        }

        self.file
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::Seek(self.path.clone(), e))
    }

    fn map_len(&self) -> Result<usize> {
        self.len
            .to_usize()
            .ok_or_else(|| Error::TooLarge(self.path.clone(), self.len))
    }

    fn map_read_write(&mut self) -> Result<()> {
        let len = self.map_len()?;
        // SAFETY: The file is exclusively owned by this instance and the
        // mapping's lifetime is tied to `self`.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&self.file) }
            .map_err(|e| Error::Map(self.path.clone(), e))?;
        self.map = Mapping::ReadWrite(map);

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying file. Its file position is shared with any handle
    /// cloned from it.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Length of the file when it was last measured.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check_bounds(&self, offset: u64, length: u64) -> Result<(usize, usize)> {
        let bounds_error = || Error::OutOfBounds {
            path: self.path.clone(),
            offset,
            length,
            file_len: self.len,
        };

        let end = offset.checked_add(length).ok_or_else(bounds_error)?;
        if end > self.len {
            return Err(bounds_error());
        }

        // Both fit because self.len fits in a usize.
        Ok((offset as usize, end as usize))
    }

    /// Get a view of `length` bytes starting at `offset`. Fails if the range
    /// extends past the end of the file.
    pub fn read(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let (start, end) = self.check_bounds(offset, length)?;

        let data: &[u8] = match &self.map {
            Mapping::None => &[],
            Mapping::ReadOnly(m) => &m[..],
            Mapping::ReadWrite(m) => &m[..],
        };

        Ok(&data[start..end])
    }

    /// Get a mutable view of `length` bytes starting at `offset`. Fails if the
    /// range extends past the end of the file or if the file is read-only.
    pub fn write(&mut self, offset: u64, length: u64) -> Result<&mut [u8]> {
        let (start, end) = self.check_bounds(offset, length)?;

        match &mut self.map {
            Mapping::None => Ok(&mut [][..]),
            Mapping::ReadOnly(_) => Err(Error::ReadOnly(self.path.clone())),
            Mapping::ReadWrite(m) => Ok(&mut m[start..end]),
        }
    }

    /// Flush dirty pages to disk.
    pub fn sync(&self) -> Result<()> {
        if let Mapping::ReadWrite(m) = &self.map {
            m.flush().map_err(|e| Error::Sync(self.path.clone(), e))?;
        }

        Ok(())
    }

    fn unmap(&mut self) {
        if let Mapping::ReadWrite(m) = &self.map {
            if let Err(e) = m.flush() {
                warn!("File update failed: {:?}: {e}", self.path);
            }
        }

        self.map = Mapping::None;
    }

    /// Unmap the file and truncate it to `size` bytes. The file is closed
    /// afterwards.
    pub fn truncate(mut self, size: u64) -> Result<()> {
        self.sync()?;
        self.map = Mapping::None;

        self.file
            .set_len(size)
            .map_err(|e| Error::Resize(self.path.clone(), size, e))?;
        self.len = size;

        Ok(())
    }

    /// Flush, unmap, and close the file. Equivalent to dropping it.
    pub fn close(self) {}
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        trace!("Closing {:?}", self.path);
        self.unmap();
    }
}
