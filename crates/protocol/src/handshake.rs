//! Server side of the nonfixed newstyle negotiation.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::consts::{
    CLIENT_FLAG_NO_ZEROES, EXPORT_FLAGS, EXPORT_PAD, GREETING_MAGIC, OPTION_MAGIC,
    OPT_EXPORT_NAME, SERVER_FLAGS,
};
use crate::io::{read_u32, read_u64, write_u16, write_u64, write_full};

/// Why a negotiation was abandoned. Any of these closes the connection; the
/// accept loop carries on.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The socket failed mid-negotiation.
    #[error("handshake I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The client set `C_NO_ZEROES`, which must not be set when the server
    /// did not advertise `NO_ZEROES`.
    #[error("client set NBD_FLAG_C_NO_ZEROES")]
    NoZeroes,

    /// The option was not prefixed with `IHAVEOPT`.
    #[error("unrecognized option magic {0:#018x}")]
    BadOptionMagic(u64),

    /// The client sent an option other than `EXPORT_NAME`.
    #[error("unsupported option {0}")]
    UnsupportedOption(u32),

    /// The client asked for a named export; only the implicit one exists.
    #[error("custom exports are not supported ({0}-byte name)")]
    NamedExport(u32),
}

/// Runs the negotiation on a fresh connection.
///
/// In order: greeting magic, `IHAVEOPT`, zero server flags; then the client
/// flags come back (`C_NO_ZEROES` is rejected), followed by the one
/// acceptable option, `EXPORT_NAME` with an empty name. The reply is the
/// device size, the read-only export flags and 124 bytes of zero padding.
pub fn negotiate<S: Read + Write>(stream: &mut S, device_size: u64) -> Result<(), HandshakeError> {
    write_full(stream, GREETING_MAGIC)?;
    write_u64(stream, OPTION_MAGIC)?;
    write_u16(stream, SERVER_FLAGS)?;
    logging::log_debug!("greeting and server flags sent");

    let client_flags = read_u32(stream)?;
    if client_flags & CLIENT_FLAG_NO_ZEROES != 0 {
        return Err(HandshakeError::NoZeroes);
    }
    logging::log_debug!("client flags {client_flags:#010x} accepted");

    let option_magic = read_u64(stream)?;
    let option = read_u32(stream)?;
    let length = read_u32(stream)?;

    if option_magic != OPTION_MAGIC {
        return Err(HandshakeError::BadOptionMagic(option_magic));
    }
    if option != OPT_EXPORT_NAME {
        return Err(HandshakeError::UnsupportedOption(option));
    }
    if length != 0 {
        return Err(HandshakeError::NamedExport(length));
    }
    logging::log_debug!("export selected, advertising {device_size} bytes read-only");

    write_u64(stream, device_size)?;
    write_u16(stream, EXPORT_FLAGS)?;
    write_full(stream, &[0_u8; EXPORT_PAD])?;

    Ok(())
}
