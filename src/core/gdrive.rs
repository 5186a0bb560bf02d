/// Google Drive delivery
///
/// Access tokens come from the OAuth2 refresh-token grant and are requested
/// fresh for every upload; nothing is cached between runs. The upload is a
/// single `multipart/form-data` request: JSON metadata followed by the archive.

use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::core::config::{DriveCredentials, Endpoints};
use crate::core::error::{BackupError, Result};

/// Short-lived bearer credential
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// Lifetime declared by the provider
    pub expires_in: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Exchanges the stored refresh token for access tokens
pub struct GoogleAuth {
    client: Client,
    token_url: String,
    credentials: DriveCredentials,
}

impl GoogleAuth {
    pub fn new(client: Client, token_url: impl Into<String>, credentials: DriveCredentials) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            credentials,
        }
    }

    pub fn folder_id(&self) -> Option<&str> {
        self.credentials.folder_id.as_deref()
    }

    #[instrument(skip_all)]
    pub async fn access_token(&self) -> Result<AccessToken> {
        let creds = &self.credentials;
        for (name, value) in [
            ("client id", &creds.client_id),
            ("client secret", &creds.client_secret),
            ("refresh token", &creds.refresh_token),
        ] {
            if value.trim().is_empty() {
                return Err(BackupError::Auth(format!("{} is empty", name)));
            }
        }

        let params = [
            ("client_id", creds.client_id.as_str()),
            ("client_secret", creds.client_secret.as_str()),
            ("refresh_token", creds.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        debug!(url = %self.token_url, "requesting Google access token");
        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| BackupError::Auth(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackupError::Auth(format!("reading token response: {}", e)))?;
        let parsed: Option<TokenResponse> = serde_json::from_str(&body).ok();

        match parsed {
            Some(TokenResponse {
                access_token: Some(token),
                expires_in,
                ..
            }) if status.is_success() && !token.is_empty() => Ok(AccessToken {
                token,
                expires_in: expires_in.map(Duration::from_secs),
            }),
            Some(TokenResponse {
                error_description: Some(description),
                ..
            }) => Err(BackupError::Auth(description)),
            Some(TokenResponse { error: Some(error), .. }) => Err(BackupError::Auth(error)),
            _ => Err(BackupError::Auth(format!("token endpoint returned HTTP {}", status.as_u16()))),
        }
    }
}

/// Multipart uploader for the Drive v3 files endpoint
pub struct DriveUploader {
    client: Client,
    upload_url: String,
}

impl DriveUploader {
    pub fn new(client: Client, upload_url: impl Into<String>) -> Self {
        Self {
            client,
            upload_url: upload_url.into(),
        }
    }

    pub fn from_endpoints(client: Client, endpoints: &Endpoints) -> Self {
        Self::new(client, endpoints.google_upload.clone())
    }

    /// Upload `path` and return the file id Drive assigned to it.
    ///
    /// A response without an `id` is a failure even when the status is 200.
    #[instrument(skip_all, fields(archive = %path.display()))]
    pub async fn upload(&self, path: &Path, token: &AccessToken, folder_id: Option<&str>) -> Result<String> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| BackupError::Delivery(format!("{} has no file name", path.display())))?;

        let mut metadata = json!({
            "name": file_name,
            "mimeType": "application/gzip",
        });
        if let Some(folder) = folder_id.filter(|f| !f.is_empty()) {
            metadata["parents"] = json!([folder]);
        }

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| BackupError::archive(format!("opening {}", path.display()), e))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| BackupError::archive(format!("reading {}", path.display()), e))?
            .len();

        let form = Form::new()
            .part(
                "metadata",
                Part::text(metadata.to_string())
                    .mime_str("application/json; charset=UTF-8")
                    .map_err(|e| BackupError::Delivery(e.to_string()))?,
            )
            .part(
                "file",
                Part::stream_with_length(Body::from(file), length)
                    .file_name(file_name.clone())
                    .mime_str("application/gzip")
                    .map_err(|e| BackupError::Delivery(e.to_string()))?,
            );

        debug!(bytes = length, "uploading archive to Google Drive");
        let response = self
            .client
            .post(&self.upload_url)
            .bearer_auth(&token.token)
            .timeout(Duration::from_secs(30 * 60))
            .multipart(form)
            .send()
            .await
            .map_err(|e| BackupError::Delivery(format!("upload request failed: {}", e)))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

        if let Some(id) = parsed.get("id").and_then(Value::as_str).filter(|id| !id.is_empty()) {
            info!(file_id = id, "archive uploaded to Google Drive");
            return Ok(id.to_string());
        }

        let reason = parsed
            .pointer("/error/message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {} without file id: {}", status.as_u16(), body.trim()));
        Err(BackupError::Delivery(format!("Google Drive: {}", reason)))
    }
}
