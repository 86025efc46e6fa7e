//! Error type for image loading and cursor movement.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading a Partclone image or reading through it.
///
/// Loading errors are fatal to the process (there is nothing to serve
/// without an image); cursor errors are fatal to the connection that hit
/// them.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The image file could not be opened.
    #[error("cannot open image file {}: {source}", .path.display())]
    Open {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The header could not be read in full.
    #[error("cannot read image header: {0}")]
    HeaderRead(#[source] io::Error),

    /// The file does not start with the Partclone magic.
    #[error("incorrect image signature")]
    BadMagic,

    /// The version string is neither "0001" nor "0002".
    #[error("unsupported image version {0:?}")]
    UnsupportedVersion(String),

    /// The v2 endianness marker does not match this host.
    #[error("image was written with incompatible endianness")]
    IncompatibleEndianness,

    /// The byte bitmap is not followed by the `BiTmAgIc` signature.
    #[error("incorrect bitmap signature")]
    BadBitmapSignature,

    /// The header declares bitmap mode "none", which this server does not
    /// serve.
    #[error("bitmap mode \"none\" is not supported")]
    UnsupportedBitmapMode,

    /// The header declares a bitmap mode value outside the known set.
    #[error("unrecognized bitmap mode {0:#04x}")]
    UnknownBitmapMode(u8),

    /// The on-disk bitmap could not be read or mapped.
    #[error("cannot load bitmap: {0}")]
    BitmapRead(#[source] io::Error),

    /// Header fields describe an image no device could have.
    #[error("invalid image geometry: {0}")]
    InvalidGeometry(&'static str),

    /// A seek on the image descriptor failed.
    #[error("lseek to offset {offset} failed: {source}")]
    Seek {
        /// Absolute target offset, or the relative delta for cursor moves.
        offset: i64,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// A read from the packed data region failed.
    #[error("cannot read image data: {0}")]
    DataRead(#[source] io::Error),
}
