use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    /// Job names the daemon polls.
    #[serde(default)]
    pub jobs: Vec<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub artifacts_dir: Option<PathBuf>,
    #[serde(default = "default_installer_path")]
    pub installer_path: PathBuf,
    #[serde(default = "default_installer_args")]
    pub install_args: String,
    #[serde(default = "default_installer_args")]
    pub uninstall_args: String,
    #[serde(default = "default_package_extensions")]
    pub package_extensions: Vec<String>,
    #[serde(default)]
    pub pre_uninstall_script: Option<PathBuf>,
    #[serde(default)]
    pub post_install_script: Option<PathBuf>,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_installer_timeout_secs")]
    pub installer_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_true")]
    pub cleanup_artifacts: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default)]
    pub network_drive: Option<NetworkDriveConfig>,
    #[serde(default)]
    pub notification: NotificationConfig,
}

/// A UNC share that has to be mapped before artifacts under it are touched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkDriveConfig {
    pub share: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_from")]
    pub from: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    /// Template file for the message body; a built-in template is used when unset.
    #[serde(default)]
    pub body_template: Option<PathBuf>,
    /// SMTP relay. When unset, messages go to the pickup directory instead.
    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_username: Option<String>,
    #[serde(default)]
    pub smtp_password: Option<String>,
    /// Upgrade the SMTP connection with STARTTLS.
    #[serde(default)]
    pub smtp_starttls: bool,
    /// Mail pickup directory; defaults to `<data_dir>/mail`.
    #[serde(default)]
    pub pickup_dir: Option<PathBuf>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from: default_from(),
            to: Vec::new(),
            subject: default_subject(),
            body_template: None,
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            smtp_starttls: false,
            pickup_dir: None,
        }
    }
}

fn default_smtp_port() -> u16 {
    25
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_installer_path() -> PathBuf {
    PathBuf::from("msiexec")
}

fn default_installer_args() -> String {
    "/quiet /norestart".to_string()
}

fn default_package_extensions() -> Vec<String> {
    vec!["msi".to_string()]
}

fn default_http_timeout_secs() -> u64 {
    90
}

fn default_installer_timeout_secs() -> u64 {
    3600
}

fn default_max_concurrent_downloads() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8378
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_from() -> String {
    "autoinstall@localhost".to_string()
}

fn default_subject() -> String {
    "[autoinstall] {{job}} #{{build}} installed".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            username: None,
            api_token: None,
            jobs: Vec::new(),
            poll_interval_secs: default_poll_interval_secs(),
            data_dir: None,
            artifacts_dir: None,
            installer_path: default_installer_path(),
            install_args: default_installer_args(),
            uninstall_args: default_installer_args(),
            package_extensions: default_package_extensions(),
            pre_uninstall_script: None,
            post_install_script: None,
            http_timeout_secs: default_http_timeout_secs(),
            installer_timeout_secs: default_installer_timeout_secs(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            cleanup_artifacts: true,
            host: default_host(),
            port: default_port(),
            broadcast_capacity: default_broadcast_capacity(),
            network_drive: None,
            notification: NotificationConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Directory artifacts are downloaded into. Falls back to
    /// `<data_dir>/artifacts`, or `./artifacts` when no data dir is set.
    pub fn artifacts_root(&self) -> PathBuf {
        match (&self.artifacts_dir, &self.data_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(data)) => data.join("artifacts"),
            (None, None) => PathBuf::from("artifacts"),
        }
    }
}
