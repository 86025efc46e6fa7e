//! NBD wire engine: nonfixed newstyle handshake and the request frame codec.
//!
//! This crate owns everything that touches bytes on the socket and nothing
//! that touches the image: the greeting/option exchange of the nonfixed
//! newstyle handshake, the 28-byte request frames, reply headers, and the
//! short-read-safe primitives underneath them. All multi-byte integers are
//! network byte order.
//!
//! Streams are plain `Read + Write` objects, so the same code drives a TCP
//! socket, one end of a socketpair wired to the kernel NBD client, or an
//! in-memory double in tests.

mod consts;
mod handshake;
mod io;
mod request;

pub use consts::*;
pub use handshake::{negotiate, HandshakeError};
pub use request::{send_reply, Request, RequestKind};

pub use io::{read_full, write_full};
