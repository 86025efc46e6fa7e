//! Startup and transport errors fatal to the daemon.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop the daemon (as opposed to per-connection failures,
/// which only close their connection).
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The listening socket could not be created or bound.
    #[error("failed to listen on port {port}: {source}")]
    Bind {
        /// Requested TCP port.
        port: u16,
        /// Underlying socket error.
        source: io::Error,
    },

    /// The local NBD device node could not be opened.
    #[error("cannot open NBD device {}: {source}", .path.display())]
    DeviceOpen {
        /// Device path, e.g. `/dev/nbd0`.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// An NBD ioctl on the device failed.
    #[error("NBD ioctl {name} failed: {source}")]
    DeviceSetup {
        /// Symbolic ioctl name for diagnostics.
        name: &'static str,
        /// Errno captured after the call.
        source: io::Error,
    },

    /// The kernel-facing socketpair could not be created.
    #[error("failed to create a socketpair: {0}")]
    SocketPair(#[source] io::Error),

    /// Signal handlers could not be installed.
    #[error("cannot install signal handler for {name}: {source}")]
    Signals {
        /// Signal name, e.g. `SIGTERM`.
        name: &'static str,
        /// Errno captured after `sigaction`.
        source: io::Error,
    },

    /// Client mode was requested on a platform without the kernel NBD
    /// driver.
    #[error("client mode is only available on Linux")]
    ClientModeUnsupported,

    /// The image layer failed underneath the transport.
    #[error(transparent)]
    Image(#[from] image::ImageError),

    /// The kernel-attached connection failed underneath the driver.
    #[error("kernel connection failed: {0}")]
    Connection(#[from] crate::connection::ConnectionError),
}
