/// Destination uploader
///
/// The single dispatch point over `DeliveryTarget`. Adding a target means
/// adding a match arm here.

use reqwest::Client;
use std::path::Path;
use tracing::{info, warn};

use crate::core::config::{DeliveryTarget, Endpoints};
use crate::core::error::{BackupError, Result};
use crate::core::gdrive::{DriveUploader, GoogleAuth};
use crate::core::telegram::Notifier;

/// What a successful delivery produced
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub destination: &'static str,
    /// Provider-issued object id, when the destination hands one out
    pub remote_id: Option<String>,
    /// Whether the operator saw a bot message for this delivery
    pub operator_notified: bool,
}

/// Ship an archive to the configured target.
///
/// `caption` must already be escaped for MarkdownV2. For the bot channel it
/// travels with the document; for Drive it is sent afterwards as a separate
/// confirmation whose failure does not fail the delivery.
pub async fn deliver(
    target: &DeliveryTarget,
    archive: &Path,
    caption: &str,
    notifier: &dyn Notifier,
    client: &Client,
    endpoints: &Endpoints,
) -> Result<DeliveryReceipt> {
    match target {
        DeliveryTarget::Telegram => {
            if !notifier.is_configured() {
                return Err(BackupError::Delivery("bot token or chat id not configured".to_string()));
            }
            notifier
                .send_document(archive, caption)
                .await
                .map_err(|e| BackupError::Delivery(e.to_string()))?;

            info!(archive = %archive.display(), "archive sent to Telegram");
            Ok(DeliveryReceipt {
                destination: target.label(),
                remote_id: None,
                operator_notified: true,
            })
        }
        DeliveryTarget::GoogleDrive(credentials) => {
            let auth = GoogleAuth::new(client.clone(), endpoints.google_token.clone(), credentials.clone());
            let token = auth.access_token().await?;

            let file_id = DriveUploader::from_endpoints(client.clone(), endpoints)
                .upload(archive, &token, auth.folder_id())
                .await?;

            let operator_notified = if notifier.is_configured() {
                match notifier.send_message(caption).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(error = %e, "archive uploaded but confirmation message failed");
                        false
                    }
                }
            } else {
                false
            };

            Ok(DeliveryReceipt {
                destination: target.label(),
                remote_id: Some(file_id),
                operator_notified,
            })
        }
    }
}
