//! Local kernel-client transport: attach the image to `/dev/nbdX`.
//!
//! One end of a socketpair is handed to the kernel NBD driver with a series
//! of ioctls; the driver then speaks the transmission phase over it while a
//! helper thread sits in the `NBD_DO_IT` ioctl (which only returns at
//! disconnect time). The other end is served by the same request loop as a
//! TCP client. No handshake happens on this path: the ioctl setup carries
//! the geometry that the negotiation would have, and the kernel starts
//! straight with request frames.

use std::path::PathBuf;
use std::sync::Arc;

#[cfg(target_os = "linux")]
use std::fs::OpenOptions;
#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
#[cfg(target_os = "linux")]
use std::os::unix::net::UnixStream;

use image::Image;

use crate::error::DaemonError;

/// Parameters for client mode.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// NBD device node to attach, e.g. `/dev/nbd0`.
    pub device: PathBuf,
}

/// Attaches the image to the local NBD device and serves it until the
/// device is disconnected or a terminating signal arrives.
#[cfg(target_os = "linux")]
pub fn run_client(image: Arc<Image>, config: &ClientConfig) -> Result<(), DaemonError> {
    use crate::connection::serve_requests;

    let (mut server_end, kernel_end) = UnixStream::pair().map_err(DaemonError::SocketPair)?;

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.device)
        .map_err(|source| DaemonError::DeviceOpen {
            path: config.device.clone(),
            source,
        })?;
    logging::log_debug!("NBD device {} opened", config.device.display());

    let size_blocks = image.device_size() / u64::from(image.block_size());
    ioctl::set_blksize(&device, u64::from(image.block_size()))?;
    ioctl::set_size_blocks(&device, size_blocks)?;
    ioctl::set_read_only_flags(&device)?;
    ioctl::set_sock(&device, kernel_end.as_raw_fd())?;
    logging::log_info!(
        "device {} configured: {size_blocks} blocks of {} bytes, read-only",
        config.device.display(),
        image.block_size()
    );

    // The DO_IT ioctl blocks for the whole lifetime of the attachment; park
    // it on its own thread while the request loop runs here.
    let doit = std::thread::spawn(move || {
        let result = ioctl::do_it(&device);
        if let Err(e) = &result {
            logging::log_error!("NBD_DO_IT returned early: {e}");
        }
        // Returning from DO_IT means the device is disconnecting; release
        // the kernel-side socket.
        let _ = ioctl::clear_sock(&device);
        drop(kernel_end);
        result
    });

    let served = serve_requests(&mut server_end, &image);
    match &served {
        Ok(()) => logging::log_info!("kernel client disconnected"),
        Err(e) => logging::log_error!("kernel connection failed: {e}"),
    }

    // Whether the loop ended through NBD_CMD_DISC, a signal or an error,
    // ask the driver to wind down so the DO_IT thread comes home. After a
    // kernel-initiated disconnect the device is already detached and the
    // ioctl fails; that is expected noise.
    match OpenOptions::new()
        .read(true)
        .write(true)
        .open(&config.device)
    {
        Ok(device) => {
            if let Err(e) = ioctl::disconnect(&device) {
                logging::log_debug!("NBD_DISCONNECT declined: {e}");
            }
        }
        Err(e) => logging::log_debug!("could not reopen device for disconnect: {e}"),
    }

    let _ = doit.join();
    logging::log_debug!("DO_IT thread joined");

    served?;
    Ok(())
}

/// Client mode needs the Linux NBD driver.
#[cfg(not(target_os = "linux"))]
pub fn run_client(_image: Arc<Image>, _config: &ClientConfig) -> Result<(), DaemonError> {
    Err(DaemonError::ClientModeUnsupported)
}

#[cfg(target_os = "linux")]
mod ioctl {
    //! Thin wrappers over the NBD character-device ioctls.
    //!
    //! The request numbers are `_IO(0xab, n)` from `linux/nbd.h`; none of
    //! them carry direction bits.

    use std::fs::File;
    use std::os::unix::io::{AsRawFd, RawFd};

    use crate::error::DaemonError;

    const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    const NBD_DO_IT: libc::c_ulong = 0xab03;
    const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;

    /// `HAS_FLAGS | READ_ONLY`, the transmission flags the kernel applies
    /// to the block device.
    const READ_ONLY_FLAGS: libc::c_ulong = 0x0003;

    fn call(device: &File, request: libc::c_ulong, argument: libc::c_ulong, name: &'static str)
        -> Result<(), DaemonError>
    {
        // SAFETY: the device descriptor is open and the argument is passed
        // by value, as these ioctls expect.
        let rc = unsafe { libc::ioctl(device.as_raw_fd(), request, argument) };
        if rc == -1 {
            return Err(DaemonError::DeviceSetup {
                name,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    pub(super) fn set_blksize(device: &File, block_size: u64) -> Result<(), DaemonError> {
        call(device, NBD_SET_BLKSIZE, block_size as libc::c_ulong, "NBD_SET_BLKSIZE")
    }

    pub(super) fn set_size_blocks(device: &File, blocks: u64) -> Result<(), DaemonError> {
        call(device, NBD_SET_SIZE_BLOCKS, blocks as libc::c_ulong, "NBD_SET_SIZE_BLOCKS")
    }

    pub(super) fn set_read_only_flags(device: &File) -> Result<(), DaemonError> {
        call(device, NBD_SET_FLAGS, READ_ONLY_FLAGS, "NBD_SET_FLAGS")
    }

    pub(super) fn set_sock(device: &File, socket: RawFd) -> Result<(), DaemonError> {
        call(device, NBD_SET_SOCK, socket as libc::c_ulong, "NBD_SET_SOCK")
    }

    pub(super) fn do_it(device: &File) -> Result<(), DaemonError> {
        call(device, NBD_DO_IT, 0, "NBD_DO_IT")
    }

    pub(super) fn clear_sock(device: &File) -> Result<(), DaemonError> {
        call(device, NBD_CLEAR_SOCK, 0, "NBD_CLEAR_SOCK")
    }

    pub(super) fn disconnect(device: &File) -> Result<(), DaemonError> {
        call(device, NBD_DISCONNECT, 0, "NBD_DISCONNECT")
    }
}
