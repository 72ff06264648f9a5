//! Structured file logging for the coordination core.
//!
//! Log levels:
//! - ERROR: Failures a caller could not recover from
//! - WARN: Recorded failures (restart commands, lost updates)
//! - INFO: Chatroom, task and restart lifecycle events
//! - DEBUG: Every FSM and task transition, queue allocation
//! - TRACE: Store reads and writes
//!
//! Each line carries the emitting module:
//! `[12:00:01.250] [DEBUG] [agentroom::queue] chatroom=1a2b3c4d position=6`
//!
//! Debug mode is enabled with `init_with_debug(true)` or `AGENTROOM_DEBUG=1`.
//! Nothing is written until one of the `init*` functions has run.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels for filtering messages.
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
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Initialize logging to ~/.agentroom/agentroom.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    match dirs::home_dir() {
        Some(home) => init_at(&home.join(".agentroom").join("agentroom.log"), debug),
        None => apply_debug(debug),
    }
}

/// Initialize logging to an explicit file, truncating it.
///
/// The first path set wins for the lifetime of the process.
pub fn init_at(path: &Path, debug: bool) {
    apply_debug(debug);

    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

fn apply_debug(debug: bool) {
    let env_debug = std::env::var("AGENTROOM_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let level = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    set_level(level);
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    get_level() >= LogLevel::Debug
}

/// Set the minimum log level for output.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current log level.
pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

fn format_line(level: LogLevel, target: &str, msg: &str) -> String {
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    format!("[{}] [{}] [{}] {}", timestamp, level.as_str(), target, msg)
}

/// Write `msg` from module `target` if `level` passes the filter.
pub fn log_at(level: LogLevel, target: &str, msg: &str) {
    if level > get_level() {
        return;
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", format_line(level, target, msg));
        }
    }
}

/// Log macro for INFO level.
#[macro_export]
macro_rules! alog {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Info, module_path!(), &format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! alog_error {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Error, module_path!(), &format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! alog_warn {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Warn, module_path!(), &format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! alog_debug {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Debug, module_path!(), &format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! alog_trace {
    ($($arg:tt)*) => {
        $crate::log::log_at($crate::log::LogLevel::Trace, module_path!(), &format!($($arg)*))
    };
}
