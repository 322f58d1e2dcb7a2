use clap::Parser;
use tracing_subscriber::EnvFilter;

use cloak::{
    cli::{run, Cli},
    error::classify_error_code,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cloak=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("error[{}]: {error}", classify_error_code(&error));
            std::process::exit(1);
        }
    }
}
