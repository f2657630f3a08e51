// CLI package commands: install, uninstall, list, check, poll

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;

use super::{base_url, send_json};
use crate::models::{InstallOutcome, ItemOutcome, JobStatus, Outcome, Package};
use crate::server::routes::UninstallResponse;

/// Format a past time as "5 minutes ago".
fn format_relative_time(dt: &DateTime<Utc>) -> String {
    let secs = Utc::now().signed_duration_since(*dt).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else {
        format!("{} days ago", secs / 86400)
    }
}

fn describe_item(item: &ItemOutcome) -> String {
    let file = item
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| item.path.display().to_string());
    match item.outcome {
        Outcome::Success => format!("  ok       {}", file),
        Outcome::Failed(ref reason) => format!("  FAILED   {} ({})", file, reason),
        Outcome::Skipped(ref reason) => format!("  skipped  {} ({})", file, reason),
    }
}

/// Human-readable summary of an install outcome, one line per package file.
pub fn format_outcome(outcome: &InstallOutcome) -> String {
    match outcome {
        InstallOutcome::NoChange { job, build_number } => {
            format!("'{}' is already at build #{}.", job, build_number)
        }
        InstallOutcome::Installed(report) => {
            let mut lines = vec![match report.previous_build {
                Some(previous) => format!(
                    "Installed '{}' build #{} (replaced #{}).",
                    report.job, report.build.number, previous
                ),
                None => format!("Installed '{}' build #{}.", report.job, report.build.number),
            }];
            if !report.uninstalled.is_empty() {
                lines.push("Uninstalled:".to_string());
                lines.extend(report.uninstalled.iter().map(describe_item));
            }
            if !report.installed.is_empty() {
                lines.push("Installed:".to_string());
                lines.extend(report.installed.iter().map(describe_item));
            }
            lines.join("\n")
        }
    }
}

/// autoinstall install
pub async fn cmd_install(
    host: &str,
    port: u16,
    job: &str,
    build: Option<u64>,
) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/{}/install", base_url(host, port), job);
    let mut request = client.post(&url);
    if let Some(number) = build {
        request = request.query(&[("build", number)]);
    }

    let outcome: InstallOutcome = send_json(request, host, port).await?;
    println!("{}", format_outcome(&outcome));

    if let InstallOutcome::Installed(ref report) = outcome {
        let failed = report.installed.iter().filter(|o| o.is_failed()).count();
        if failed > 0 {
            anyhow::bail!("{} package(s) failed to install", failed);
        }
    }
    Ok(())
}

/// autoinstall uninstall
pub async fn cmd_uninstall(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/{}/uninstall", base_url(host, port), job);

    let response: UninstallResponse = send_json(client.post(&url), host, port).await?;
    if response.uninstalled {
        println!("Uninstalled '{}'.", job);
    } else {
        println!("Nothing installed for '{}'.", job);
    }
    Ok(())
}

/// autoinstall list
pub async fn cmd_list(host: &str, port: u16, json: bool) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/packages", base_url(host, port));

    let packages: Vec<Package> = send_json(client.get(&url), host, port).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&packages)?);
        return Ok(());
    }

    if packages.is_empty() {
        println!("No packages installed.");
        return Ok(());
    }

    println!("{:<24}{:<8}{:<18}{}", "JOB", "BUILD", "INSTALLED", "URL");
    for package in &packages {
        let display_job = if package.job.chars().count() > 23 {
            format!("{}...", package.job.chars().take(20).collect::<String>())
        } else {
            package.job.clone()
        };
        println!(
            "{:<24}{:<8}{:<18}{}",
            display_job,
            format!("#{}", package.build_number()),
            format_relative_time(&package.date),
            package.url
        );
    }
    Ok(())
}

/// autoinstall check
pub async fn cmd_check(host: &str, port: u16, job: &str) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/jobs/{}/status", base_url(host, port), job);

    let status: JobStatus = send_json(client.get(&url), host, port).await?;

    let installed = match (status.installed_build, status.installed_at) {
        (Some(number), Some(at)) => format!("#{} ({})", number, format_relative_time(&at)),
        (Some(number), None) => format!("#{}", number),
        _ => "-".to_string(),
    };
    let latest = status
        .latest_successful_build
        .map(|n| format!("#{}", n))
        .unwrap_or_else(|| "-".to_string());

    println!("Job:        {}", status.job);
    println!("Installed:  {}", installed);
    println!("Latest:     {}", latest);
    if status.up_to_date() {
        println!("Up to date.");
    } else if status.latest_successful_build.is_some() {
        println!("Update available (run: autoinstall install {}).", status.job);
    } else {
        println!("The job has no successful build.");
    }
    Ok(())
}

/// autoinstall poll
pub async fn cmd_poll(host: &str, port: u16) -> anyhow::Result<()> {
    let client = Client::new();
    let url = format!("{}/api/poll", base_url(host, port));

    let body: Value = send_json(client.post(&url), host, port).await?;
    println!("{}", body["message"].as_str().unwrap_or("Poll scheduled"));
    Ok(())
}
