/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! squashmerge applies a block-level delta to a compressed SquashFS image. The
//! semver versioning covers the CLI only. All Rust APIs can change at any time,
//! even in patch releases.
//!
//! The on-disk formats live in [`format`], the merge pipeline in [`merge`], and
//! bounds-checked file access in [`mmap`].

pub mod cli;
pub mod format;
pub mod merge;
pub mod mmap;
pub mod stream;
pub mod util;
