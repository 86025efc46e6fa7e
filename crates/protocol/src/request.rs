//! Request frames and reply headers of the transmission phase.

use std::io::{self, Read, Write};

use crate::consts::{
    CMD_DISC, CMD_FLUSH, CMD_READ, CMD_TRIM, CMD_WRITE, REPLY_MAGIC, REQUEST_MAGIC,
};
use crate::io::{read_u32, read_u64, write_u32, write_u64};

/// One decoded 28-byte request frame.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Request {
    /// Raw request type field.
    pub kind: u32,
    /// Opaque client cookie, echoed in the reply.
    pub handle: u64,
    /// Starting byte on the exported device.
    pub offset: u64,
    /// Number of bytes requested.
    pub length: u32,
}

/// Classified request type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RequestKind {
    /// Serve bytes.
    Read,
    /// Mutation; always refused.
    Write,
    /// Orderly shutdown of this connection.
    Disconnect,
    /// Flush; refused (nothing is ever dirty).
    Flush,
    /// Trim; refused.
    Trim,
    /// Anything else; the connection is dropped.
    Other(u32),
}

impl Request {
    /// Reads and decodes one frame.
    ///
    /// A frame with the wrong magic is logged and still decoded: the header
    /// is fixed-size, so the stream stays in sync, and dropping a live
    /// client over a single damaged frame helps nobody.
    pub fn receive<S: Read + ?Sized>(stream: &mut S) -> io::Result<Self> {
        let magic = read_u32(stream)?;
        if magic != REQUEST_MAGIC {
            logging::log_error!("request has bad magic {magic:#010x}, serving it anyway");
        }

        let kind = read_u32(stream)?;
        let handle = read_u64(stream)?;
        let offset = read_u64(stream)?;
        let length = read_u32(stream)?;

        Ok(Self {
            kind,
            handle,
            offset,
            length,
        })
    }

    /// Classifies the raw type field.
    pub fn classify(&self) -> RequestKind {
        match self.kind {
            CMD_READ => RequestKind::Read,
            CMD_WRITE => RequestKind::Write,
            CMD_DISC => RequestKind::Disconnect,
            CMD_FLUSH => RequestKind::Flush,
            CMD_TRIM => RequestKind::Trim,
            other => RequestKind::Other(other),
        }
    }

    /// The exclusive end of the requested range, unless it overflows.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.length))
    }
}

/// Sends a reply header: magic, errno, echoed handle. For successful reads
/// the payload follows immediately after.
pub fn send_reply<S: Write + ?Sized>(stream: &mut S, handle: u64, errno: u32) -> io::Result<()> {
    write_u32(stream, REPLY_MAGIC)?;
    write_u32(stream, errno)?;
    write_u64(stream, handle)
}
