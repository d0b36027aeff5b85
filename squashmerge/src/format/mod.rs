/*
 * SPDX-FileCopyrightText: 2023 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod codec;
pub mod delta;
pub mod lzo;
pub mod squashfs;
