//! Argument parsing: a light-weight `clap` command with custom help and
//! version rendering.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command as ClapCommand};

/// Which transport to run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Listen on TCP for remote NBD clients.
    Server,
    /// Attach the image to the local kernel NBD device.
    Client,
}

/// Fully validated invocation.
#[derive(Clone, Debug)]
pub struct Options {
    /// Selected transport.
    pub mode: Mode,
    /// Path of the Partclone image to serve.
    pub image_path: PathBuf,
    /// TCP port for server mode.
    pub port: u16,
    /// NBD device node for client mode.
    pub device: PathBuf,
    /// Bitmap words per rank-cache bucket.
    pub elems_per_cache: u64,
    /// Log file path.
    pub log_file: PathBuf,
    /// Route logging through syslog instead of the log file.
    pub syslog: bool,
    /// Suppress debug messages on the console.
    pub quiet: bool,
    /// Echo debug messages to the console.
    pub debug: bool,
}

/// What an invocation asked for.
#[derive(Debug)]
pub enum Parsed {
    /// Print this help text and exit 0.
    Help(String),
    /// Print this version banner and exit 0.
    Version(String),
    /// Serve with these options.
    Run(Options),
}

const DEFAULT_PORT: &str = "10809";
const DEFAULT_DEVICE: &str = "/dev/nbd0";
const DEFAULT_ELEMS_PER_CACHE: &str = "512";
const DEFAULT_LOG_FILE: &str = "/var/log/partclone-nbd.log";

/// Builds the `clap` command used for parsing.
fn clap_command() -> ClapCommand {
    ClapCommand::new("partclone-nbd")
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new("server-mode")
                .short('s')
                .long("server-mode")
                .help("Serve the image to remote NBD clients over TCP.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("client-mode")
                .short('c')
                .long("client-mode")
                .help("Attach the image to the local NBD device.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("NUM")
                .help("TCP port for server mode.")
                .num_args(1)
                .default_value(DEFAULT_PORT)
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("PATH")
                .help("NBD device for client mode.")
                .num_args(1)
                .default_value(DEFAULT_DEVICE)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("elems-per-cache")
                .short('x')
                .long("elems-per-cache")
                .value_name("NUM")
                .help("Bitmap elements per cache element.")
                .num_args(1)
                .default_value(DEFAULT_ELEMS_PER_CACHE)
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("log-file")
                .short('L')
                .long("log-file")
                .value_name("FILE")
                .help("Write the log to FILE.")
                .num_args(1)
                .default_value(DEFAULT_LOG_FILE)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("syslog")
                .short('S')
                .long("syslog")
                .help("Use syslog instead of a log file.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Do not print debug messages.")
                .action(ArgAction::SetTrue)
                .overrides_with("debug"),
        )
        .arg(
            Arg::new("debug")
                .short('D')
                .long("debug")
                .help("Print debug messages on the console.")
                .action(ArgAction::SetTrue)
                .overrides_with("quiet"),
        )
        .arg(
            Arg::new("help")
                .short('h')
                .long("help")
                .help("Give this help list.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("version")
                .short('V')
                .long("version")
                .help("Print program version.")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("image")
                .value_name("IMAGE")
                .help("Partclone image to serve.")
                .num_args(0..=1)
                .value_parser(clap::value_parser!(PathBuf)),
        )
}

/// Parses an invocation into [`Parsed`], or a message for standard error.
pub fn parse<I, T>(arguments: I) -> Result<Parsed, String>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = clap_command()
        .try_get_matches_from(arguments)
        .map_err(|e| e.to_string().trim_end().to_string())?;

    if matches.get_flag("help") {
        return Ok(Parsed::Help(render_help()));
    }
    if matches.get_flag("version") {
        return Ok(Parsed::Version(render_version()));
    }

    let server = matches.get_flag("server-mode");
    let client = matches.get_flag("client-mode");
    let mode = match (server, client) {
        (true, false) => Mode::Server,
        (false, true) => Mode::Client,
        (true, true) => {
            return Err("choose one of --server-mode and --client-mode, not both".to_string())
        }
        (false, false) => {
            return Err(
                "one of --server-mode (-s) or --client-mode (-c) is required".to_string(),
            )
        }
    };

    let Some(image_path) = matches.get_one::<PathBuf>("image").cloned() else {
        return Err("no image file specified".to_string());
    };

    Ok(Parsed::Run(Options {
        mode,
        image_path,
        port: *matches.get_one::<u16>("port").expect("port has a default"),
        device: matches
            .get_one::<PathBuf>("device")
            .expect("device has a default")
            .clone(),
        elems_per_cache: *matches
            .get_one::<u64>("elems-per-cache")
            .expect("elems-per-cache has a default"),
        log_file: matches
            .get_one::<PathBuf>("log-file")
            .expect("log-file has a default")
            .clone(),
        syslog: matches.get_flag("syslog"),
        quiet: matches.get_flag("quiet"),
        debug: matches.get_flag("debug"),
    }))
}

/// The static help snapshot, organized the way the daemon's manual is.
fn render_help() -> String {
    format!(
        "Usage: partclone-nbd [OPTION...] -s|-c partclone_image\n\
         Serve a Partclone image as a read-only block device.\n\
         \n\
         modes (exactly one is required):\n\
         \x20 -s, --server-mode          Listen for remote NBD clients over TCP.\n\
         \x20 -c, --client-mode          Attach the image to a local NBD device.\n\
         \n\
         log options:\n\
         \x20 -L, --log-file=FILE        Specify an alternative path for the log file.\n\
         \x20                            Default: {DEFAULT_LOG_FILE}.\n\
         \x20 -S, --syslog               Use syslog instead of a log file.\n\
         \x20 -q, --quiet                Do not print debug messages.\n\
         \x20 -D, --debug                Print debug messages on the console.\n\
         \n\
         image options:\n\
         \x20 -x, --elems-per-cache=NUM  Specify a number of bitmap elements per one\n\
         \x20                            cache element (default: {DEFAULT_ELEMS_PER_CACHE}). Higher values mean\n\
         \x20                            less RAM and slower random access.\n\
         \n\
         NBD options:\n\
         \x20 -p, --port=NUM             Specify a port for server mode (default: {DEFAULT_PORT}).\n\
         \x20 -d, --device=PATH          Specify an NBD device for client mode\n\
         \x20                            (default: {DEFAULT_DEVICE}).\n\
         \n\
         other options:\n\
         \x20 -h, --help                 Give this help list.\n\
         \x20 -V, --version              Print program version."
    )
}

/// The version banner.
fn render_version() -> String {
    format!("partclone-nbd v{}", env!("CARGO_PKG_VERSION"))
}
