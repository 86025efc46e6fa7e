//! Short-read-safe file helpers with seek diagnostics.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use crate::error::ImageError;

/// Reads until `buf` is full or the file ends, retrying on interruption.
/// Returns the number of bytes actually read.
pub(crate) fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Absolute seek, reporting the target offset on failure.
pub(crate) fn seek_to(file: &mut File, offset: u64) -> Result<(), ImageError> {
    file.seek(SeekFrom::Start(offset))
        .map(|_| ())
        .map_err(|source| ImageError::Seek {
            offset: offset as i64,
            source,
        })
}

/// Relative seek, reporting the delta on failure.
pub(crate) fn seek_by(file: &mut File, delta: i64) -> Result<(), ImageError> {
    if delta == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Current(delta))
        .map(|_| ())
        .map_err(|source| ImageError::Seek {
            offset: delta,
            source,
        })
}
