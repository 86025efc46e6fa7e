//! Command-line front-end for partclone-nbd.
//!
//! The crate is intentionally thin: it recognises the daemon's switches,
//! assembles a configuration, initialises logging, loads the image and
//! dispatches to the requested transport in the `daemon` crate. The primary
//! entry point is [`run`], which accepts the argument iterator together
//! with handles for standard output and error so the binary stays a
//! two-line `main` and tests can capture every byte the program prints.
//!
//! # Invariants
//!
//! - [`run`] never panics; failures surface as a nonzero exit code with a
//!   diagnostic on the error stream or in the log.
//! - `--help` and `--version` print to standard output and exit 0 without
//!   touching the image or the network.

mod frontend;

pub use frontend::{Mode, Options};

use std::ffi::OsString;
use std::io::Write;
use std::sync::Arc;

use daemon::{run_client, run_server, ClientConfig, ServerConfig};
use image::Image;

use frontend::Parsed;

/// Process exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Process exit code for initialization or runtime failure.
pub const EXIT_FAILURE: i32 = 1;

/// Parses arguments and runs the daemon until shutdown.
///
/// The first argument is the program name, as in `std::env::args_os`.
pub fn run<I, T>(arguments: I, stdout: &mut dyn Write, stderr: &mut dyn Write) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let options = match frontend::parse(arguments) {
        Ok(Parsed::Help(text)) => {
            let _ = writeln!(stdout, "{text}");
            return EXIT_OK;
        }
        Ok(Parsed::Version(banner)) => {
            let _ = writeln!(stdout, "{banner}");
            return EXIT_OK;
        }
        Ok(Parsed::Run(options)) => options,
        Err(message) => {
            let _ = writeln!(stderr, "{message}");
            return EXIT_FAILURE;
        }
    };

    if let Err(e) = logging::init(&logging::LogConfig {
        file: Some(options.log_file.clone()),
        syslog: options.syslog,
        quiet: options.quiet,
        debug: options.debug,
    }) {
        let _ = writeln!(stderr, "{e}");
        return EXIT_FAILURE;
    }

    let status = serve(&options);

    if status != EXIT_OK {
        logging::log_error!("errors occurred - see the log for details");
    } else {
        logging::log_debug!("closing program with status 0");
    }
    logging::shutdown();
    status
}

/// Loads the image and drives the selected transport.
fn serve(options: &Options) -> i32 {
    if let Err(e) = daemon::signal::install_handlers() {
        logging::log_error!("{e}");
        return EXIT_FAILURE;
    }

    let image = match Image::load(&options.image_path, options.elems_per_cache) {
        Ok(image) => Arc::new(image),
        Err(e) => {
            logging::log_error!("cannot load image: {e}");
            return EXIT_FAILURE;
        }
    };

    let served = match options.mode {
        Mode::Server => run_server(
            image,
            &ServerConfig {
                port: options.port,
            },
        ),
        Mode::Client => run_client(
            image,
            &ClientConfig {
                device: options.device.clone(),
            },
        ),
    };

    match served {
        Ok(()) => EXIT_OK,
        Err(e) => {
            logging::log_error!("{e}");
            EXIT_FAILURE
        }
    }
}
