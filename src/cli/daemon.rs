// CLI daemon commands: start, stop, status

use reqwest::Client;
use serde_json::Value;

use super::{base_url, send_json};
use crate::server::health::HealthResponse;

/// autoinstall start
pub async fn cmd_start(
    host: &str,
    config: Option<&str>,
    port_override: Option<u16>,
    data_dir: Option<&str>,
) -> anyhow::Result<()> {
    let config_path = config.map(std::path::Path::new);
    let data_dir_path = data_dir.map(std::path::Path::new);

    // The global --host only overrides the config when it was changed.
    let host_override = if host != "127.0.0.1" {
        Some(host)
    } else {
        None
    };

    crate::daemon::start_daemon(config_path, data_dir_path, host_override, port_override).await
}

/// autoinstall stop
pub async fn cmd_stop(host: &str, port: u16) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/shutdown", base_url(host, port));

    let body: Value = send_json(client.post(&url), host, port).await?;
    let message = body["message"].as_str().unwrap_or("Shutdown initiated");
    println!("{}", message);
    Ok(())
}

/// autoinstall status
pub async fn cmd_status(host: &str, port: u16, verbose: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/health", base_url(host, port));

    let health: HealthResponse = send_json(client.get(&url), host, port).await?;

    println!("Daemon Status: {}", health.status);
    println!("  API:         http://{}:{}", host, port);
    println!("  CI Server:   {}", health.server_url);
    if health.watched_jobs.is_empty() {
        println!("  Watching:    (no jobs)");
    } else {
        println!("  Watching:    {}", health.watched_jobs.join(", "));
    }
    println!("  Installed:   {} package(s)", health.installed_packages);
    println!("  Uptime:      {}", format_uptime(health.uptime_seconds));
    println!("  Version:     {}", health.version);

    if verbose {
        println!("\nRaw response:");
        println!("{}", serde_json::to_string_pretty(&health)?);
    }

    Ok(())
}

/// Format uptime seconds into a human-readable string.
fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
