//! Leveled logging for the partclone-nbd workspace.
//!
//! The daemon writes a full transcript of what it is doing (every handshake
//! step, every rejected request) to a log file, while echoing a filtered view
//! to the console. Alternatively the whole stream can be routed to syslog,
//! which is the usual choice when the daemon runs under an init system.
//!
//! The crate exposes a process-global logger configured once at startup via
//! [`init`] and torn down with [`shutdown`]. Call sites use the `log_*!`
//! macros:
//!
//! ```
//! logging::log_info!("image loaded: {} blocks", 1024);
//! ```
//!
//! Before [`init`] runs (and in unit tests) messages fall back to plain
//! console output with debug suppressed, so library crates can log freely
//! without arranging global state first.

use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

mod sink;

use sink::Sink;

/// Severity of a log message, ordered from chattiest to most severe.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    /// Step-by-step trace of what the daemon is doing.
    Debug,
    /// Lifecycle events: image loaded, listening, connection made.
    Info,
    /// Something unexpected that does not affect service.
    Warning,
    /// A failed operation; the context decides whether it is fatal.
    Error,
}

impl Level {
    /// Returns the fixed-width tag written at the start of each line.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Debug => "[ DBG ]",
            Self::Info => "[ INF ]",
            Self::Warning => "[ WRN ]",
            Self::Error => "[ ERR ]",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Where the log stream goes and how much of it reaches the console.
#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    /// Path of the log file. Ignored when `syslog` is set.
    pub file: Option<PathBuf>,
    /// Route everything through syslog instead of a file.
    pub syslog: bool,
    /// Suppress debug messages on the console.
    pub quiet: bool,
    /// Echo debug messages to the console.
    pub debug: bool,
}

/// Failure to set up the configured sink.
#[derive(Debug)]
pub struct InitError {
    path: PathBuf,
    source: std::io::Error,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to open log file {}: {}",
            self.path.display(),
            self.source
        )
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

struct Logger {
    sink: Sink,
    console_debug: bool,
}

static LOGGER: Mutex<Option<Logger>> = Mutex::new(None);

/// Installs the process-global logger.
///
/// With `syslog` set the stream goes to the system logger; otherwise the
/// configured file (when any) receives every message and the console receives
/// info and above, plus debug when `debug` is set and `quiet` is not.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    let sink = if config.syslog {
        Sink::syslog()
    } else {
        let file = match &config.file {
            Some(path) => Some(File::create(path).map_err(|source| InitError {
                path: path.clone(),
                source,
            })?),
            None => None,
        };
        Sink::file(file)
    };

    let logger = Logger {
        sink,
        console_debug: config.debug && !config.quiet,
    };

    *LOGGER.lock().expect("logger lock poisoned") = Some(logger);
    Ok(())
}

/// Flushes and removes the global logger. Safe to call when [`init`] never ran.
pub fn shutdown() {
    let mut guard = LOGGER.lock().expect("logger lock poisoned");
    if let Some(logger) = guard.take() {
        logger.sink.close();
    }
}

/// Dispatches one message. Prefer the `log_*!` macros over calling this
/// directly.
pub fn log(level: Level, args: fmt::Arguments<'_>) {
    let message = args.to_string();
    let mut guard = LOGGER.lock().expect("logger lock poisoned");

    match guard.as_mut() {
        Some(logger) => {
            logger.sink.write(level, &message);
            if logger.sink.wants_console_echo()
                && (level > Level::Debug || logger.console_debug)
            {
                echo_console(level, &message);
            }
        }
        // Not initialized yet: console only, debug dropped.
        None => {
            if level > Level::Debug {
                echo_console(level, &message);
            }
        }
    }
}

fn echo_console(level: Level, message: &str) {
    let color = match level {
        Level::Debug => "\x1b[1;36m",
        Level::Info => "\x1b[1;37m",
        Level::Warning => "\x1b[1;33m",
        Level::Error => "\x1b[1;31m",
    };
    let line = format!("{color}{}\x1b[0m {message}", level.tag());
    if level == Level::Error {
        let _ = writeln!(std::io::stderr(), "{line}");
    } else {
        let _ = writeln!(std::io::stdout(), "{line}");
    }
}

/// Logs at [`Level::Debug`].
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Debug, ::std::format_args!($($arg)*))
    };
}

/// Logs at [`Level::Info`].
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Info, ::std::format_args!($($arg)*))
    };
}

/// Logs at [`Level::Warning`].
#[macro_export]
macro_rules! log_warning {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Warning, ::std::format_args!($($arg)*))
    };
}

/// Logs at [`Level::Error`].
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::log($crate::Level::Error, ::std::format_args!($($arg)*))
    };
}
