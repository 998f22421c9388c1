// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog::{Drain, Logger};
use std::fs::File;
use std::io::Write;

/// Bunyan formatted JSON records on stdout.
pub fn init_logger() -> Logger {
    build_logger(std::io::stdout())
}

/// Bunyan formatted JSON records written to `filename`, which is truncated.
pub fn init_file_logger(filename: &str) -> std::io::Result<Logger> {
    Ok(build_logger(File::create(filename)?))
}

pub fn build_logger<W: Write + Send + 'static>(w: W) -> Logger {
    let drain = slog_bunyan::new(w).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x8000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Human readable terminal output, filtered through `RUST_LOG`.
pub fn init_term_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x2000)
        .build()
        .fuse();
    slog::Logger::root(drain, slog::o!())
}

/// A logger that drops everything. Used by unit tests that don't care about
/// log output.
pub fn discard_logger() -> Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
