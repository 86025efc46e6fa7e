//! One connection's worth of work: handshake, then the request loop.
//!
//! Payload emission walks the image cursor block by block. Hole blocks cost
//! nothing but zeros from a reusable buffer; present blocks go out through
//! `sendfile` straight from the image descriptor on Linux, with a buffered
//! read/write fallback for platforms and stream types the syscall refuses.

use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use image::{Cursor, Image, ImageError};
use protocol::{
    negotiate, send_reply, HandshakeError, Request, RequestKind, ERR_INVAL, ERR_PERM,
};

use crate::signal;

/// Why a connection ended. Only [`ConnectionError::Handshake`] and plain
/// disconnects are everyday events; the rest are logged as errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The client never completed the negotiation.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The socket failed mid-conversation.
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The image could not be read or seeked underneath a request.
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// How block payloads reach the socket.
enum CopyMode {
    /// Kernel-side copy from the image descriptor to the socket.
    #[cfg(target_os = "linux")]
    Sendfile,
    /// Read into a per-connection buffer, then write.
    Buffered,
}

impl CopyMode {
    fn initial() -> Self {
        #[cfg(target_os = "linux")]
        {
            Self::Sendfile
        }
        #[cfg(not(target_os = "linux"))]
        {
            Self::Buffered
        }
    }
}

/// Runs the handshake and then serves requests until the peer disconnects,
/// a fatal transport error occurs, or a signal interrupts the connection.
pub fn handle_connection<S: Read + Write + AsRawFd>(
    stream: &mut S,
    image: &Arc<Image>,
) -> Result<(), ConnectionError> {
    negotiate(stream, image.device_size())?;
    logging::log_debug!("handshake finished");
    serve_requests(stream, image)
}

/// The request loop of the transmission phase. Assumes the handshake (or
/// the kernel ioctl setup that replaces it) already happened.
pub fn serve_requests<S: Read + Write + AsRawFd>(
    stream: &mut S,
    image: &Arc<Image>,
) -> Result<(), ConnectionError> {
    let mut cursor = Cursor::new(Arc::clone(image))?;
    let mut copy_mode = CopyMode::initial();
    let block_size = image.block_size() as usize;
    let mut buffer = vec![0_u8; block_size];
    let zeros = vec![0_u8; block_size];
    let generation = signal::interrupt_generation();

    loop {
        if signal::terminating() || signal::interrupt_generation() != generation {
            logging::log_info!("connection interrupted by a signal");
            return Ok(());
        }

        // A peer that goes away between requests is a normal end of
        // service, not a transport failure.
        let request = match Request::receive(stream) {
            Ok(request) => request,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                logging::log_info!("client closed the connection");
                return Ok(());
            }
            Err(e) => return Err(ConnectionError::Io(e)),
        };

        // Bounds come first: even a misdirected write outside the device is
        // answered as EINVAL, like the kernel itself would.
        let in_bounds = request.offset <= image.device_size()
            && request
                .end()
                .is_some_and(|end| end <= image.device_size());
        if !in_bounds {
            logging::log_error!(
                "request past the end of the device (offset {}, length {})",
                request.offset,
                request.length
            );
            send_reply(stream, request.handle, ERR_INVAL)?;
            continue;
        }

        match request.classify() {
            RequestKind::Write | RequestKind::Flush | RequestKind::Trim => {
                logging::log_error!(
                    "rejecting request type {} on a read-only export",
                    request.kind
                );
                send_reply(stream, request.handle, ERR_PERM)?;
                continue;
            }
            RequestKind::Disconnect => {
                logging::log_info!("client sent a disconnect request");
                return Ok(());
            }
            RequestKind::Other(kind) => {
                logging::log_error!("unexpected request type {kind}, closing connection");
                return Ok(());
            }
            RequestKind::Read => {}
        }

        send_reply(stream, request.handle, 0)?;

        emit_payload(
            stream,
            &mut cursor,
            &mut copy_mode,
            &mut buffer,
            &zeros,
            request.offset,
            request.length,
        )?;
    }
}

/// Streams `length` bytes of device content starting at `offset`.
///
/// The reply header is already on the wire, so any failure here tears the
/// connection down; the client observes truncation as a socket error.
fn emit_payload<S: Read + Write + AsRawFd>(
    stream: &mut S,
    cursor: &mut Cursor,
    copy_mode: &mut CopyMode,
    buffer: &mut [u8],
    zeros: &[u8],
    offset: u64,
    length: u32,
) -> Result<(), ConnectionError> {
    if length == 0 {
        return Ok(());
    }

    let block_size = zeros.len() as u64;
    cursor.set_block(offset / block_size)?;
    cursor.seek_within_current_block((offset % block_size) as u32)?;

    let mut left = length;
    loop {
        let chunk = cursor.remaining_bytes().min(left);

        if cursor.present() {
            copy_present_chunk(stream, cursor, copy_mode, buffer, chunk)?;
        } else {
            protocol::write_full(stream, &zeros[..chunk as usize])?;
        }
        cursor.consume(chunk);
        left -= chunk;

        if left == 0 {
            return Ok(());
        }
        cursor.advance()?;
    }
}

/// Moves `chunk` stored bytes from the image descriptor to the socket.
#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
fn copy_present_chunk<S: Read + Write + AsRawFd>(
    stream: &mut S,
    cursor: &mut Cursor,
    copy_mode: &mut CopyMode,
    buffer: &mut [u8],
    chunk: u32,
) -> Result<(), ConnectionError> {
    #[cfg(target_os = "linux")]
    if matches!(copy_mode, CopyMode::Sendfile) {
        match sendfile_chunk(stream, cursor, chunk)? {
            SendfileOutcome::Done => return Ok(()),
            // The stream cannot take sendfile (a non-socket, or an exotic
            // kernel): nothing was transferred and the image offset did not
            // move, so the buffered path can take over for the rest of the
            // connection.
            SendfileOutcome::Unsupported => {
                logging::log_debug!("sendfile unavailable, using buffered copies");
                *copy_mode = CopyMode::Buffered;
            }
        }
    }

    let chunk_buf = &mut buffer[..chunk as usize];
    cursor.read_data(chunk_buf)?;
    protocol::write_full(stream, chunk_buf)?;
    Ok(())
}

#[cfg(target_os = "linux")]
enum SendfileOutcome {
    Done,
    Unsupported,
}

/// Zero-copy transfer of one chunk, retrying short transfers.
///
/// "Not supported" errnos before the first byte report
/// [`SendfileOutcome::Unsupported`] instead of failing, so the caller can
/// switch strategies; after partial progress every error is fatal.
#[cfg(target_os = "linux")]
fn sendfile_chunk<S: AsRawFd>(
    stream: &S,
    cursor: &Cursor,
    chunk: u32,
) -> io::Result<SendfileOutcome> {
    let out_fd = stream.as_raw_fd();
    let in_fd = cursor.file().as_raw_fd();

    let mut left = chunk as usize;
    while left > 0 {
        // SAFETY: both descriptors are owned by this connection and stay
        // open across the call; a null offset makes the kernel advance the
        // image descriptor, keeping it in lockstep with the cursor.
        let sent = unsafe { libc::sendfile(out_fd, in_fd, std::ptr::null_mut(), left) };
        if sent < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            let untouched = left == chunk as usize;
            let unsupported = matches!(
                error.raw_os_error(),
                Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
            );
            if untouched && unsupported {
                return Ok(SendfileOutcome::Unsupported);
            }
            return Err(error);
        }
        if sent == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "sendfile made no progress",
            ));
        }
        left -= sent as usize;
    }
    Ok(SendfileOutcome::Done)
}
