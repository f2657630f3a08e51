use clap::Parser;

use ci_autoinstall::cli::{self, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The daemon sets up its own stderr + file logging.
    if !cli.runs_daemon() {
        let filter = if cli.verbose { "debug" } else { "warn" };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Err(e) = cli::dispatch(&cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
