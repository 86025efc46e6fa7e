use std::{env, io, process::ExitCode};

fn main() -> ExitCode {
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    let status = cli::run(env::args_os(), &mut stdout, &mut stderr);
    ExitCode::from(status.clamp(0, 255) as u8)
}
