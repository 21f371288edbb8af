/*
 * SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod ext4;
pub mod payload;
pub mod probe;
pub mod sparse;
