//! Sink backends: a plain log file or the system logger.

use std::fs::File;
use std::io::Write;

use crate::Level;

pub(crate) enum Sink {
    /// Append to a file (or nowhere when `None`), echoing to the console.
    File(Option<File>),
    /// Route through syslog. The console stays silent: syslog-managed
    /// daemons have no terminal to speak of.
    #[cfg(unix)]
    Syslog,
}

impl Sink {
    pub(crate) fn file(file: Option<File>) -> Self {
        Self::File(file)
    }

    #[cfg(unix)]
    pub(crate) fn syslog() -> Self {
        // SAFETY: openlog keeps the ident pointer, so it must outlive the
        // logger; a static C string satisfies that for the process lifetime.
        unsafe {
            libc::openlog(
                c"partclone-nbd".as_ptr(),
                libc::LOG_NDELAY,
                libc::LOG_USER,
            );
        }
        Self::Syslog
    }

    #[cfg(not(unix))]
    pub(crate) fn syslog() -> Self {
        Self::File(None)
    }

    pub(crate) fn wants_console_echo(&self) -> bool {
        matches!(self, Self::File(_))
    }

    pub(crate) fn write(&mut self, level: Level, message: &str) {
        match self {
            Self::File(file) => {
                if let Some(file) = file.as_mut() {
                    let _ = writeln!(file, "{} {message}", level.tag());
                }
            }
            #[cfg(unix)]
            Self::Syslog => {
                let priority = match level {
                    Level::Debug => libc::LOG_DEBUG,
                    Level::Info => libc::LOG_INFO,
                    Level::Warning => libc::LOG_WARNING,
                    Level::Error => libc::LOG_ERR,
                };
                // NUL bytes inside the message are stripped so they cannot
                // truncate the syslog record.
                let text: Vec<u8> = message
                    .bytes()
                    .filter(|&b| b != 0)
                    .chain(std::iter::once(0))
                    .collect();
                // SAFETY: both format and argument are valid NUL-terminated
                // strings for the duration of the call.
                unsafe {
                    libc::syslog(priority, c"%s".as_ptr(), text.as_ptr());
                }
            }
        }
    }

    pub(crate) fn close(self) {
        match self {
            Self::File(file) => {
                if let Some(mut file) = file {
                    let _ = file.flush();
                }
            }
            #[cfg(unix)]
            Self::Syslog => {
                // SAFETY: closes the connection opened in `syslog()`.
                unsafe { libc::closelog() };
            }
        }
    }
}
