//! Levelled file logging for mosaic runs.
//!
//! Log levels:
//! - ERROR: A step or run failed without a recovery path
//! - WARN: Recoverable conditions (tool rejected, sandbox reset, subtask failure)
//! - INFO: Run and step lifecycle, model and tool transcripts
//! - DEBUG: Scheduling decisions, config resolution
//! - TRACE: Raw request/response payloads
//!
//! Everything goes to `~/.mosaic/mosaic.log`. Once a run has picked its
//! output directory, lines are mirrored to `<output_dir>/mosaic.log` too.
//!
//! Debug mode can be enabled with `--debug` flag or `MOSAIC_DEBUG=1` env var.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{OnceLock, RwLock};

pub const LOG_FILE: &str = "mosaic.log";

static HOME_LOG: OnceLock<PathBuf> = OnceLock::new();
static RUN_LOG: RwLock<Option<PathBuf>> = RwLock::new(None);
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

fn debug_from_env() -> bool {
    std::env::var("MOSAIC_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Start logging to `~/.mosaic/mosaic.log`, truncating any previous log.
pub fn init_with_debug(debug: bool) {
    let level = if debug || debug_from_env() {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    MAX_LEVEL.store(level as u8, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".mosaic")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join(LOG_FILE);
        let _ = std::fs::write(&path, "");
        HOME_LOG.set(path).ok();
    }
}

/// Mirror subsequent log lines into `<output_dir>/mosaic.log`.
pub fn attach_run_log(output_dir: &Path) {
    if let Ok(mut slot) = RUN_LOG.write() {
        *slot = Some(output_dir.join(LOG_FILE));
    }
}

pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

fn append(path: &Path, line: &str) {
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", line);
    }
}

/// Write `msg` at `level`. Use the `mlog*` macros instead of calling this.
pub fn write(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let line = format!(
        "[{}] [{}] {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        level.label(),
        msg
    );
    if let Some(path) = HOME_LOG.get() {
        append(path, &line);
    }
    if let Ok(slot) = RUN_LOG.read() {
        if let Some(path) = slot.as_deref() {
            append(path, &line);
        }
    }
}

/// Log multi-line model or tool output, one `[tag]` prefixed entry per line.
///
/// Models frequently return escaped newlines inside JSON strings, so literal
/// `\n` sequences are split as well.
pub fn tagged(tag: &str, content: &str) {
    for line in tagged_lines(tag, content) {
        write(LogLevel::Info, &line);
    }
}

fn tagged_lines(tag: &str, content: &str) -> Vec<String> {
    content
        .split('\n')
        .flat_map(|line| line.split("\\n"))
        .map(|line| format!("[{}] {}", tag, line))
        .collect()
}

/// Render a credential for display without leaking it.
pub fn redact(secret: &str) -> String {
    if secret.is_empty() {
        String::new()
    } else {
        "***".to_string()
    }
}

#[macro_export]
macro_rules! mlog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! mlog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Only written in debug mode.
#[macro_export]
macro_rules! mlog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::write($crate::log::LogLevel::Debug, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! mlog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::write($crate::log::LogLevel::Trace, &format!($($arg)*))
        }
    };
}
