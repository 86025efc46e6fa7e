//! Short-operation-safe socket primitives.
//!
//! Kernel sockets are free to accept or deliver fewer bytes than asked;
//! every exchange in this crate goes through these two loops so partial
//! operations and `EINTR` never surface as protocol errors.

use std::io::{self, Read, Write};

/// Reads exactly `buf.len()` bytes, retrying on interruption.
///
/// A peer that closes mid-frame yields `UnexpectedEof`.
pub fn read_full<S: Read + ?Sized>(stream: &mut S, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes all of `buf`, retrying on interruption.
pub fn write_full<S: Write + ?Sized>(stream: &mut S, buf: &[u8]) -> io::Result<()> {
    let mut sent = 0;
    while sent < buf.len() {
        match stream.write(&buf[sent..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting data",
                ))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub(crate) fn read_u32<S: Read + ?Sized>(stream: &mut S) -> io::Result<u32> {
    let mut raw = [0_u8; 4];
    read_full(stream, &mut raw)?;
    Ok(u32::from_be_bytes(raw))
}

pub(crate) fn read_u64<S: Read + ?Sized>(stream: &mut S) -> io::Result<u64> {
    let mut raw = [0_u8; 8];
    read_full(stream, &mut raw)?;
    Ok(u64::from_be_bytes(raw))
}

pub(crate) fn write_u16<S: Write + ?Sized>(stream: &mut S, value: u16) -> io::Result<()> {
    write_full(stream, &value.to_be_bytes())
}

pub(crate) fn write_u32<S: Write + ?Sized>(stream: &mut S, value: u32) -> io::Result<()> {
    write_full(stream, &value.to_be_bytes())
}

pub(crate) fn write_u64<S: Write + ?Sized>(stream: &mut S, value: u64) -> io::Result<()> {
    write_full(stream, &value.to_be_bytes())
}
