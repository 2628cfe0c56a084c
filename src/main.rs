use clap::Parser;

use layerbrush::cli::{self, CliArgs};

fn main() -> std::process::ExitCode {
    let args = CliArgs::parse();
    cli::run(args)
}
