pub mod daemon;
pub mod packages;

use anyhow::Context;
use clap::{Parser, Subcommand};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// CI build auto-installer
#[derive(Parser, Debug)]
#[command(
    name = "autoinstall",
    version,
    about = "Keeps this machine on the latest successful CI build"
)]
pub struct Cli {
    /// Daemon host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Daemon port
    #[arg(long, default_value_t = 8378, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the daemon in the foreground
    Start {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long)]
        port: Option<u16>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },

    /// Stop the daemon
    Stop,

    /// Show daemon status
    Status,

    /// Install a job's last successful build (or a given build)
    Install {
        /// CI job name
        job: String,

        /// Build number to install instead of the last successful one
        #[arg(short = 'b', long)]
        build: Option<u64>,
    },

    /// Uninstall a job's package
    Uninstall {
        /// CI job name
        job: String,
    },

    /// List installed packages
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compare the installed build with the latest successful build
    Check {
        /// CI job name
        job: String,
    },

    /// Ask the daemon to poll all watched jobs now
    Poll,

    /// Run under the Windows Service Control Manager
    #[cfg(windows)]
    #[command(hide = true)]
    Service,
}

impl Cli {
    /// Whether this invocation runs the daemon in-process. The daemon sets up
    /// its own logging.
    pub fn runs_daemon(&self) -> bool {
        match self.command {
            Some(Commands::Start { .. }) => true,
            #[cfg(windows)]
            Some(Commands::Service) => true,
            _ => false,
        }
    }
}

/// Build the base URL for the daemon HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Format a connection error message for when the daemon is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to daemon at {}:{}. Is it running? (try: autoinstall start)",
        host, port
    )
}

/// Turn reqwest errors into a user-friendly connection error.
pub fn handle_request_error(err: reqwest::Error, host: &str, port: u16) -> anyhow::Error {
    if err.is_connect() || err.is_timeout() {
        anyhow::anyhow!("{}", connection_error_message(host, port))
    } else {
        anyhow::anyhow!("Request failed: {}", err)
    }
}

/// Send `request` and decode a successful JSON body. Error responses become
/// an error carrying the daemon's message.
pub async fn send_json<T: DeserializeOwned>(
    request: RequestBuilder,
    host: &str,
    port: u16,
) -> anyhow::Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| handle_request_error(e, host, port))?;

    let status = response.status();
    if !status.is_success() {
        let body: Value = response.json().await.unwrap_or(Value::Null);
        let message = body["message"]
            .as_str()
            .unwrap_or("Daemon returned an error");
        anyhow::bail!("{} (HTTP {})", message, status.as_u16());
    }

    response.json::<T>().await.context("Failed to parse response")
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Start {
            config,
            port,
            data_dir,
        }) => daemon::cmd_start(&cli.host, config.as_deref(), *port, data_dir.as_deref()).await,
        Some(Commands::Stop) => daemon::cmd_stop(&cli.host, cli.port).await,
        Some(Commands::Status) => daemon::cmd_status(&cli.host, cli.port, cli.verbose).await,
        Some(Commands::Install { job, build }) => {
            packages::cmd_install(&cli.host, cli.port, job, *build).await
        }
        Some(Commands::Uninstall { job }) => {
            packages::cmd_uninstall(&cli.host, cli.port, job).await
        }
        Some(Commands::List { json }) => packages::cmd_list(&cli.host, cli.port, *json).await,
        Some(Commands::Check { job }) => packages::cmd_check(&cli.host, cli.port, job).await,
        Some(Commands::Poll) => packages::cmd_poll(&cli.host, cli.port).await,
        #[cfg(windows)]
        Some(Commands::Service) => {
            crate::daemon::windows_service::run().context("Service dispatcher failed")
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}
