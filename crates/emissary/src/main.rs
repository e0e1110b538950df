//! Entrypoint for the `emissary` binary.

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    emissary::run(std::env::args_os(), &mut io::stdout(), &mut io::stderr())
}
