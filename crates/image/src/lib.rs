//! Random-access layer over sparse Partclone images.
//!
//! A Partclone image stores only the *used* blocks of the source device,
//! packed back to back and interleaved with periodic checksum records, plus a
//! bitmap saying which source blocks made it into the file. This crate turns
//! that layout into something a block server can use: an immutable [`Image`]
//! (geometry, bitmap, rank cache) shared by every connection, and a cheap
//! per-connection [`Cursor`] that maps "device block B" to "file offset in
//! the packed data region" without scanning the bitmap on every request.
//!
//! # Design
//!
//! - [`Image::load`] recognises the `0001` and `0002` on-disk layouts,
//!   materialises the bitmap as 64-bit words and builds a bucketed prefix-sum
//!   cache over it, making `rank(B)` (how many used blocks precede `B`) a
//!   constant-cost query.
//! - [`Cursor`] owns a private read-only file handle whose seek position is
//!   kept in lockstep with the logical block position, so sequential service
//!   never recomputes a rank and a zero-copy send can run straight off the
//!   descriptor.
//!
//! The image file is opened read-only and never modified.

mod bitmap;
mod cursor;
mod error;
mod header;
mod image;
mod io;
#[cfg(test)]
mod testutil;

pub use bitmap::{Bitmap, RankCache};
pub use cursor::Cursor;
pub use error::ImageError;
pub use header::{BitmapMode, ChecksumMode, ImageVersion};
pub use image::Image;

/// Default number of bitmap words folded into one rank-cache bucket.
pub const DEFAULT_ELEMS_PER_CACHE: u64 = 512;
