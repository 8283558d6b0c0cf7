//! Log line formatting.
//!
//! Every component logs through the `log` facade with a module target
//! (`log::debug!(target: "mmu", …)`).  This module wires the facade to
//! `env_logger` with one line shape for the whole emulator:
//!
//! ```text
//! [2025-06-01T12:00:00Z][INFO][vm][src/vm.rs:121] VM ready: …
//! ```
//!
//! Runtime filtering follows `RUST_LOG` with a default of `info`.
//! Below-threshold `trace!`/`debug!` calls on the hot path compile out
//! of release builds via the `log` crate's level features.  Each record
//! is emitted as a single `writeln!`, so one message is one write to
//! the sink.

use std::io::Write;

/// Install the emulator's logger.  Panics if a logger is already set;
/// binaries call this exactly once at startup.
pub fn init() {
    builder().init();
}

/// Like [`init`], but tolerates an already-installed logger.  Useful
/// from tests and embedders that own their own logging setup.
pub fn try_init() -> Result<(), log::SetLoggerError> {
    builder().try_init()
}

fn builder() -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}][{}][{}][{}:{}] {}",
            buf.timestamp(),
            record.level(),
            record.target(),
            record.file().unwrap_or("<unknown>"),
            record.line().unwrap_or(0),
            record.args(),
        )
    });
    builder
}
