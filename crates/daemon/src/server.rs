//! TCP transport: listener setup and the accept loop.

use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Arc;
use std::thread;

use socket2::{Domain, Protocol, Socket, Type};

use image::Image;

use crate::connection::handle_connection;
use crate::error::DaemonError;
use crate::signal;

/// Listener parameters for server mode.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// TCP port to listen on; the wildcard address is always used.
    pub port: u16,
}

/// Pending-connection queue length, as small as the workload: block-device
/// clients connect once and stay.
const LISTEN_BACKLOG: i32 = 5;

/// Binds the listener and serves until a terminating signal arrives.
///
/// Every accepted connection gets its own worker thread holding a clone of
/// the shared image; workers never touch each other's state, so a slow or
/// hostile client only costs its own thread.
pub fn run_server(image: Arc<Image>, config: &ServerConfig) -> Result<(), DaemonError> {
    let listener = bind_listener(config.port)?;
    logging::log_info!("server initialized, listening on port {}", config.port);

    let mut workers = Vec::new();

    loop {
        if signal::terminating() {
            logging::log_info!("shutdown requested, leaving the accept loop");
            break;
        }

        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            // Interrupted covers the signal case; other failures (fd
            // exhaustion, aborted connections) are logged and the loop
            // keeps serving whoever can still connect.
            Err(e) => {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    logging::log_error!("failed to accept a connection: {e}");
                }
                continue;
            }
        };

        logging::log_info!("connection made with {peer}");

        let image = Arc::clone(&image);
        workers.push(thread::spawn(move || {
            let mut stream = stream;
            match handle_connection(&mut stream, &image) {
                Ok(()) => logging::log_info!("connection with {peer} closed"),
                Err(e) => logging::log_error!("connection with {peer} failed: {e}"),
            }
            logging::log_info!("waiting for new connections ...");
        }));

        // Reap workers that already finished so the list stays short on
        // long-running servers.
        workers.retain(|handle| !handle.is_finished());
    }

    // Workers blocked on an idle client would stall a join indefinitely;
    // termination means the process exits and tears the sockets down with
    // it, which is what NBD clients expect from a dying server.
    workers.retain(|handle| !handle.is_finished());
    if !workers.is_empty() {
        logging::log_info!("terminating with {} connection(s) still open", workers.len());
    }

    Ok(())
}

/// Creates the listening socket with `SO_REUSEADDR`, bound to
/// `INADDR_ANY:port`.
fn bind_listener(port: u16) -> Result<TcpListener, DaemonError> {
    let wrap = |source: std::io::Error| DaemonError::Bind { port, source };

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(wrap)?;
    socket.set_reuse_address(true).map_err(wrap)?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())
        .map_err(wrap)?;
    socket.listen(LISTEN_BACKLOG).map_err(wrap)?;

    Ok(socket.into())
}
