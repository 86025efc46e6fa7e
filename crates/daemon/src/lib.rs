//! Transports and request service: the part of partclone-nbd that owns
//! sockets and threads.
//!
//! Two transports share one request loop:
//!
//! - **Server mode** ([`run_server`]) listens on a TCP port and serves every
//!   accepted client on its own OS thread. The [`image::Image`] is shared
//!   read-only behind an [`std::sync::Arc`]; each worker owns a private
//!   [`image::Cursor`], so no lock is taken on the hot path.
//! - **Client mode** ([`run_client`], Linux only) wires one end of a
//!   socketpair into the local kernel NBD device via ioctl and serves the
//!   kernel's requests on the other end.
//!
//! Signal handling is a quit flag, not a longjmp: handlers mark the process
//! state and the accept/request loops notice at their next boundary.

#[cfg(not(unix))]
compile_error!("the NBD daemon requires a unix platform");

mod client;
mod connection;
mod error;
mod server;
pub mod signal;

pub use client::{run_client, ClientConfig};
pub use connection::{handle_connection, serve_requests, ConnectionError};
pub use error::DaemonError;
pub use server::{run_server, ServerConfig};
