//! Logging utils. See ["log" crate documentation](https://docs.rs/log/) for details
//!
//! The runtime itself logs under the `system` target. Install the logger once
//! at startup:
//!
//! ```rust
//! use spindle::log::{init, set_level, Severity};
//!
//! init().unwrap();
//! set_level(Severity::Debug);
//! ```
use std::io::{self, Write};

use log::{Level, Log, Metadata, Record, SetLoggerError};
use num_traits::FromPrimitive;

use crate::clock;
use crate::util;

static LOG_LEVEL: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(3);

/// Severity ladder of the runtime logger.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, ToPrimitive, FromPrimitive)]
pub enum Severity {
    Fatal = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl From<Level> for Severity {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => Severity::Error,
            Level::Warn => Severity::Warn,
            Level::Info => Severity::Info,
            Level::Debug => Severity::Debug,
            Level::Trace => Severity::Trace,
        }
    }
}

impl Severity {
    fn tag(self) -> &'static str {
        match self {
            Severity::Fatal => "F",
            Severity::Error => "E",
            Severity::Warn => "W",
            Severity::Info => "I",
            Severity::Debug => "D",
            Severity::Trace => "T",
        }
    }
}

/// [Log](https://docs.rs/log/latest/log/trait.Log.html) trait implementation.
/// Wraps [say()](fn.say.html).
pub struct RuntimeLogger {}

impl Log for RuntimeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let level: Severity = metadata.level().into();
        let gate = Severity::from_i32(LOG_LEVEL.load(std::sync::atomic::Ordering::Relaxed))
            .unwrap_or(Severity::Info);
        level <= gate
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        say(
            record.level().into(),
            record.target(),
            record.file().unwrap_or_default(),
            record.line().unwrap_or(0),
            &record.args().to_string(),
        )
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

static LOGGER: RuntimeLogger = RuntimeLogger {};

/// Install the runtime logger as the `log` crate backend. Idempotent callers
/// should ignore the error from a second installation.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

/// Adjust the process-wide severity gate.
pub fn set_level(level: Severity) {
    LOG_LEVEL.store(level as i32, std::sync::atomic::Ordering::Relaxed);
}

/// Format and print one diagnostic line to stderr.
///
/// One write per line so concurrent workers do not interleave mid-record.
pub fn say(level: Severity, target: &str, file: &str, line: u32, message: &str) {
    let text = format!(
        "{:.3} {} {} [{}:{}] {}:{} {}\n",
        clock::time(),
        level.tag(),
        target,
        util::thread_id(),
        util::fiber_id(),
        file,
        line,
        message
    );
    let _ = io::stderr().write_all(text.as_bytes());
}
