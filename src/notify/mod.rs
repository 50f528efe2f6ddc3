// backuptool/src/notify/mod.rs
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::EmailConfig;
use crate::errors::{BackupError, Result};

const SENDGRID_SEND_URL: &str = "https://api.sendgrid.com/v3/mail/send";

/// Outcome of a delivery attempt. `delivered: false` with a message is the
/// normal result when no credential is configured; it is never an error.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub delivered: bool,
    pub message: String,
    pub recipient: Option<String>,
}

impl DeliveryOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            delivered: false,
            message: reason.into(),
            recipient: None,
        }
    }
}

/// Delivers finalized archives by email through the SendGrid v3 API.
pub struct Notifier {
    config: EmailConfig,
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Sends the archive as a ZIP attachment with a subject derived from the
    /// date label. Unconfigured delivery is reported, not raised.
    pub async fn deliver(&self, zip_path: &Path, date: &str) -> Result<DeliveryOutcome> {
        let Some(api_key) = self.config.api_key.clone() else {
            warn!("SendGrid API key not configured, skipping email notification");
            return Ok(DeliveryOutcome::skipped("SendGrid not configured"));
        };

        let zip_bytes = tokio::fs::read(zip_path).await.map_err(|e| {
            BackupError::Delivery(format!(
                "Failed to read archive {}: {}",
                zip_path.display(),
                e
            ))
        })?;
        let zip_file_name = zip_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}-backup.zip", date));

        let body = json!({
            "personalizations": [{ "to": [{ "email": self.config.to_email }] }],
            "from": { "email": self.config.from_email },
            "subject": format!("Daily DB Backup - {}", date),
            "content": [
                {
                    "type": "text/plain",
                    "value": format!(
                        "Daily database backup for {} is attached.\n\nBackup file: {}",
                        date, zip_file_name
                    ),
                },
                {
                    "type": "text/html",
                    "value": html_body(date, &zip_file_name),
                },
            ],
            "attachments": [{
                "content": BASE64.encode(&zip_bytes),
                "filename": zip_file_name,
                "type": "application/zip",
                "disposition": "attachment",
            }],
        });

        self.send(&api_key, &body).await?;
        info!(recipient = %self.config.to_email, "Backup email sent");
        Ok(DeliveryOutcome {
            delivered: true,
            message: "Email sent successfully".to_string(),
            recipient: Some(self.config.to_email.clone()),
        })
    }

    /// Sends a plain test message. Unlike `deliver`, a missing credential is
    /// a hard configuration error: the whole point of this call is to
    /// validate the delivery setup.
    pub async fn test_deliver(&self) -> Result<DeliveryOutcome> {
        let Some(api_key) = self.config.api_key.clone() else {
            return Err(BackupError::Config(
                "SENDGRID_API_KEY is not configured".to_string(),
            ));
        };

        let body = json!({
            "personalizations": [{ "to": [{ "email": self.config.to_email }] }],
            "from": { "email": self.config.from_email },
            "subject": "Test Email - Backup Service",
            "content": [{
                "type": "text/plain",
                "value": "This is a test email from the backup service.",
            }],
        });

        self.send(&api_key, &body).await?;
        Ok(DeliveryOutcome {
            delivered: true,
            message: "Test email sent successfully".to_string(),
            recipient: Some(self.config.to_email.clone()),
        })
    }

    async fn send(&self, api_key: &str, body: &serde_json::Value) -> Result<()> {
        let response = self
            .client
            .post(SENDGRID_SEND_URL)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackupError::Delivery(format!(
                "SendGrid API returned {}: {}",
                status, detail
            )));
        }
        Ok(())
    }
}

fn html_body(date: &str, zip_file_name: &str) -> String {
    format!(
        "<div style=\"font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;\">\
         <h2>Daily Database Backup</h2>\
         <p>Your daily database backup for <strong>{}</strong> is ready.</p>\
         <p><strong>Backup file:</strong> {}</p>\
         <p>The ZIP file contains:</p>\
         <ul>\
         <li>PostgreSQL database export (SQL format)</li>\
         <li>MongoDB database export (JSON format)</li>\
         </ul>\
         <p style=\"color: #666; font-size: 12px;\">This is an automated message. Please do not reply.</p>\
         </div>",
        date, zip_file_name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn unconfigured_notifier() -> Notifier {
        Notifier::new(EmailConfig {
            api_key: None,
            from_email: "noreply@example.com".to_string(),
            to_email: "admin@example.com".to_string(),
        })
    }

    #[tokio::test]
    async fn test_deliver_without_credential_is_non_fatal() -> Result<()> {
        let outcome = unconfigured_notifier()
            .deliver(&PathBuf::from("/nonexistent.zip"), "2024-06-01")
            .await?;

        assert!(!outcome.delivered);
        assert_eq!(outcome.message, "SendGrid not configured");
        assert!(outcome.recipient.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_test_deliver_without_credential_is_config_error() {
        let result = unconfigured_notifier().test_deliver().await;
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_html_body_mentions_date_and_attachment() {
        let body = html_body("2024-06-01", "2024-06-01-backup.zip");
        assert!(body.contains("2024-06-01"));
        assert!(body.contains("2024-06-01-backup.zip"));
    }
}
