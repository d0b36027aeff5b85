// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Safe wrappers around the LZO1X functions of liblzo2, the library that
//! mksquashfs uses. Only liblzo2's LZO1X-999 encoder reproduces the compressed
//! blocks of existing images byte for byte.
//!
//! `lzo_init()` is not called. It only performs ABI self-checks and none of the
//! functions used here depend on it.

use std::{
    ffi::{c_int, c_void},
    mem, ptr,
};

/// `LZO_E_OK` from lzoconf.h.
const LZO_E_OK: c_int = 0;

/// `LZO1X_999_MEM_COMPRESS` from lzo1x.h.
const LZO1X_999_MEM_COMPRESS: usize = 14 * 16384 * mem::size_of::<i16>();

// lzo_uint is defined to have the same size as size_t.
#[link(name = "lzo2")]
unsafe extern "C" {
    fn lzo1x_999_compress_level(
        src: *const u8,
        src_len: usize,
        dst: *mut u8,
        dst_len: *mut usize,
        wrkmem: *mut c_void,
        dict: *const u8,
        dict_len: usize,
        cb: *mut c_void,
        compression_level: c_int,
    ) -> c_int;

    fn lzo1x_optimize(
        src: *mut u8,
        src_len: usize,
        dst: *mut u8,
        dst_len: *mut usize,
        wrkmem: *mut c_void,
    ) -> c_int;

    fn lzo1x_decompress_safe(
        src: *const u8,
        src_len: usize,
        dst: *mut u8,
        dst_len: *mut usize,
        wrkmem: *mut c_void,
    ) -> c_int;
}

/// Maximum size of LZO1X output for `len` bytes of input.
pub fn worst_compress(len: usize) -> usize {
    len + len / 16 + 64 + 3
}

/// Compress `src` with LZO1X-999 at `level` (1 through 9). On failure, the
/// liblzo2 error code is returned.
pub fn compress_999(src: &[u8], level: u8) -> Result<Vec<u8>, c_int> {
    let mut out = vec![0u8; worst_compress(src.len())];
    let mut out_len = out.len();
    // u64 elements keep the work memory aligned for lzo_align_t.
    let mut wrkmem = vec![0u64; LZO1X_999_MEM_COMPRESS.div_ceil(mem::size_of::<u64>())];

    // SAFETY: `out` is sized for the worst case, so the encoder cannot write
    // past it. `wrkmem` has at least LZO1X_999_MEM_COMPRESS bytes. No
    // dictionary or callback is passed.
    let ret = unsafe {
        lzo1x_999_compress_level(
            src.as_ptr(),
            src.len(),
            out.as_mut_ptr(),
            &mut out_len,
            wrkmem.as_mut_ptr().cast(),
            ptr::null(),
            0,
            ptr::null_mut(),
            c_int::from(level),
        )
    };
    if ret != LZO_E_OK {
        return Err(ret);
    }

    out.truncate(out_len);

    Ok(out)
}

/// Rewrite LZO1X compressed data in place so that it decompresses faster. The
/// size of the compressed data does not change. `original` must hold a copy of
/// the uncompressed data, which gets overwritten while optimizing. Returns the
/// number of bytes the data decompressed to.
pub fn optimize(compressed: &mut [u8], original: &mut [u8]) -> Result<usize, c_int> {
    let mut original_len = original.len();

    // SAFETY: lzo1x_optimize() decompresses into `original` while rewriting
    // `compressed`. The data was produced from exactly `original.len()` bytes,
    // so neither buffer is overrun.
    let ret = unsafe {
        lzo1x_optimize(
            compressed.as_mut_ptr(),
            compressed.len(),
            original.as_mut_ptr(),
            &mut original_len,
            ptr::null_mut(),
        )
    };
    if ret != LZO_E_OK {
        return Err(ret);
    }

    Ok(original_len)
}

/// Decompress LZO1X data into `dest`. Corrupt input or an undersized `dest`
/// produce an error instead of an overrun.
pub fn decompress_safe(src: &[u8], dest: &mut [u8]) -> Result<usize, c_int> {
    let mut dest_len = dest.len();

    // SAFETY: The safe decoder bounds checks both buffers against the lengths
    // passed in.
    let ret = unsafe {
        lzo1x_decompress_safe(
            src.as_ptr(),
            src.len(),
            dest.as_mut_ptr(),
            &mut dest_len,
            ptr::null_mut(),
        )
    };
    if ret != LZO_E_OK {
        return Err(ret);
    }

    Ok(dest_len)
}
