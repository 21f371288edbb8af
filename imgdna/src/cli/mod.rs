/*
 * SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

pub mod args;
pub mod ext4;
pub mod payload;
pub mod probe;
pub mod sparse;

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

macro_rules! warning {
    ($($arg:tt)*) => {
        println!("\x1b[1;31m[WARNING] {}\x1b[0m", format!($($arg)+))
    }
}

pub(crate) use status;
pub(crate) use warning;

use crate::report::Report;

/// Print every recorded problem as a user-facing warning.
pub(crate) fn print_report(report: &Report) {
    for w in report.warnings() {
        warning!("{w}");
    }
}
