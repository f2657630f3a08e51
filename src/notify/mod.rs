//! Install notifications.
//!
//! Messages are rendered from the installed [`Package`] with `lettre` and
//! either sent to an SMTP relay or written as `.eml` files into a mail
//! pickup directory that a relay service collects.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use uuid::Uuid;

use crate::errors::InstallError;
use crate::models::{AgentConfig, NotificationConfig, Package};

const DEFAULT_BODY_TEMPLATE: &str = "\
Job {{job}} build #{{build}} was installed on {{date}}.

Build: {{url}}

Changes:
{{changes}}

Culprits: {{culprits}}
";

const SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, package: &Package) -> Result<(), InstallError>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _package: &Package) -> Result<(), InstallError> {
        Ok(())
    }
}

async fn body_template(config: &NotificationConfig) -> Result<String, InstallError> {
    match config.body_template {
        Some(ref path) => tokio::fs::read_to_string(path).await.map_err(|e| {
            InstallError::Notification(format!(
                "Failed to read body template {}: {}",
                path.display(),
                e
            ))
        }),
        None => Ok(DEFAULT_BODY_TEMPLATE.to_string()),
    }
}

fn mailbox(address: &str) -> Result<Mailbox, InstallError> {
    address.trim().parse::<Mailbox>().map_err(|e| {
        InstallError::Notification(format!("Invalid mail address '{}': {}", address, e))
    })
}

/// Render the notification for `package`. Non-ASCII headers are
/// RFC 2047 encoded by the builder.
pub async fn build_message(
    config: &NotificationConfig,
    package: &Package,
) -> Result<Message, InstallError> {
    if config.to.is_empty() {
        return Err(InstallError::Notification(
            "No notification recipients configured".to_string(),
        ));
    }

    let subject = render_template(&config.subject, package)?;
    let body = render_template(&body_template(config).await?, package)?;
    let body: String = body.lines().map(|line| format!("{}\r\n", line)).collect();

    let mut builder = Message::builder()
        .from(mailbox(&config.from)?)
        .subject(single_line(&subject))
        .date_now()
        .message_id(Some(format!("<{}@autoinstall>", Uuid::now_v7())))
        .header(ContentType::TEXT_PLAIN);
    for to in &config.to {
        builder = builder.to(mailbox(to)?);
    }

    builder
        .body(body)
        .map_err(|e| InstallError::Notification(format!("Failed to build message: {}", e)))
}

/// Sends messages through an SMTP relay.
pub struct SmtpNotifier {
    config: NotificationConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: NotificationConfig) -> Result<Self, InstallError> {
        let host = config.smtp_host.clone().ok_or_else(|| {
            InstallError::Validation("notification.smtp_host is not set".to_string())
        })?;

        let builder = if config.smtp_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&host).map_err(|e| {
                InstallError::Validation(format!("Invalid SMTP relay '{}': {}", host, e))
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host.as_str())
        };
        let mut builder = builder.port(config.smtp_port).timeout(Some(SMTP_TIMEOUT));
        if let Some(ref username) = config.smtp_username {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                config.smtp_password.clone().unwrap_or_default(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            config,
        })
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, package: &Package) -> Result<(), InstallError> {
        let message = build_message(&self.config, package).await?;
        let host = self.config.smtp_host.as_deref().unwrap_or_default();

        self.transport.send(message).await.map_err(|e| {
            InstallError::Notification(format!(
                "SMTP delivery to {}:{} failed: {}",
                host, self.config.smtp_port, e
            ))
        })?;

        tracing::info!(
            "Sent notification for {} #{} via {}:{}",
            package.job,
            package.build_number(),
            host,
            self.config.smtp_port
        );
        Ok(())
    }
}

/// Writes `.eml` files into a pickup directory.
pub struct PickupDirNotifier {
    config: NotificationConfig,
    pickup_dir: PathBuf,
}

impl PickupDirNotifier {
    pub fn new(config: NotificationConfig, pickup_dir: PathBuf) -> Self {
        Self { config, pickup_dir }
    }

    pub fn pickup_dir(&self) -> &Path {
        &self.pickup_dir
    }
}

#[async_trait]
impl Notifier for PickupDirNotifier {
    async fn notify(&self, package: &Package) -> Result<(), InstallError> {
        let message = build_message(&self.config, package).await?;

        tokio::fs::create_dir_all(&self.pickup_dir).await.map_err(|e| {
            InstallError::Notification(format!(
                "Failed to create pickup directory {}: {}",
                self.pickup_dir.display(),
                e
            ))
        })?;

        // Relay services pick up *.eml eagerly, so the file appears complete via rename.
        let name = Uuid::now_v7().to_string();
        let tmp_path = self.pickup_dir.join(format!("{}.tmp", name));
        let final_path = self.pickup_dir.join(format!("{}.eml", name));
        tokio::fs::write(&tmp_path, message.formatted())
            .await
            .map_err(|e| InstallError::Notification(format!("Failed to write message: {}", e)))?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| InstallError::Notification(format!("Failed to write message: {}", e)))?;

        tracing::info!(
            "Queued notification for {} #{} at {}",
            package.job,
            package.build_number(),
            final_path.display()
        );
        Ok(())
    }
}

/// Build the notifier described by the config: SMTP when a relay host is
/// set, the pickup directory otherwise. Disabled notifications give a
/// [`NoopNotifier`].
pub fn notifier_from_config(
    config: &AgentConfig,
    data_dir: &Path,
) -> Result<Arc<dyn Notifier>, InstallError> {
    let notification = &config.notification;
    if !notification.enabled {
        return Ok(Arc::new(NoopNotifier));
    }
    if notification.smtp_host.is_some() {
        return Ok(Arc::new(SmtpNotifier::new(notification.clone())?));
    }
    let pickup_dir = notification
        .pickup_dir
        .clone()
        .unwrap_or_else(|| data_dir.join("mail"));
    Ok(Arc::new(PickupDirNotifier::new(notification.clone(), pickup_dir)))
}

/// Substitute `{{job}}`, `{{build}}`, `{{url}}`, `{{date}}`, `{{changes}}`,
/// `{{culprits}}` and `{{package}}`.
pub fn render_template(template: &str, package: &Package) -> Result<String, InstallError> {
    let changes: Vec<String> = package
        .change_set
        .items
        .iter()
        .map(|item| match item.author {
            Some(ref author) => format!("- {} ({})", item.msg.trim(), author.full_name),
            None => format!("- {}", item.msg.trim()),
        })
        .collect();
    let changes = if changes.is_empty() {
        "(no changes)".to_string()
    } else {
        changes.join("\n")
    };

    let culprits = package
        .build
        .culprits
        .iter()
        .map(|u| u.full_name.as_str())
        .collect::<Vec<_>>()
        .join(", ");

    let package_json = serde_json::to_string_pretty(package)
        .map_err(|e| InstallError::Notification(format!("Failed to serialize package: {}", e)))?;

    Ok(template
        .replace("{{job}}", &package.job)
        .replace("{{build}}", &package.build_number().to_string())
        .replace("{{url}}", &package.url)
        .replace("{{date}}", &package.date.to_rfc2822())
        .replace("{{changes}}", &changes)
        .replace("{{culprits}}", &culprits)
        .replace("{{package}}", &package_json))
}

fn single_line(s: &str) -> String {
    s.lines().map(str::trim).collect::<Vec<_>>().join(" ")
}
