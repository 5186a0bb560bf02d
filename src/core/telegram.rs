/// Telegram bot channel
///
/// Operator notifications and document delivery both go through the Bot API
/// (`sendMessage` and `sendDocument`). Message text is sent with
/// `parse_mode=MarkdownV2`; callers escape every interpolated value with
/// `escape_markdown_v2` before building the text.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::config::{BotIdentity, Config};

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("bot token or chat id not configured")]
    NotConfigured,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Telegram API returned HTTP {status}: {description}")]
    Api { status: u16, description: String },

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Operator-facing message channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Whether bot credentials are available at all
    fn is_configured(&self) -> bool;

    /// Send a MarkdownV2 text message
    async fn send_message(&self, text: &str) -> Result<(), TelegramError>;

    /// Upload a file as a document with a MarkdownV2 caption
    async fn send_document(&self, path: &Path, caption: &str) -> Result<(), TelegramError>;
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    description: Option<String>,
}

/// Bot API client bound to one chat (and optionally one forum thread)
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot: Option<BotIdentity>,
}

impl TelegramNotifier {
    pub fn new(client: Client, api_base: impl Into<String>, bot: Option<BotIdentity>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            bot,
        }
    }

    pub fn from_config(config: &Config, client: Client) -> Self {
        Self::new(client, config.endpoints.telegram_api.clone(), config.bot.clone())
    }

    fn bot(&self) -> Result<&BotIdentity, TelegramError> {
        self.bot.as_ref().ok_or(TelegramError::NotConfigured)
    }

    fn method_url(&self, bot: &BotIdentity, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, bot.token, method)
    }

    async fn check(response: reqwest::Response) -> Result<(), TelegramError> {
        let status = response.status();
        if status == reqwest::StatusCode::OK {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let description = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.description)
            .unwrap_or(body);

        Err(TelegramError::Api {
            status: status.as_u16(),
            description,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn is_configured(&self) -> bool {
        self.bot.is_some()
    }

    #[instrument(skip_all)]
    async fn send_message(&self, text: &str) -> Result<(), TelegramError> {
        let bot = self.bot()?;

        let mut params = vec![
            ("chat_id", bot.chat_id.as_str()),
            ("text", text),
            ("parse_mode", "MarkdownV2"),
        ];
        if let Some(thread) = &bot.thread_id {
            params.push(("message_thread_id", thread.as_str()));
        }

        debug!(chat = %bot.chat_id, "sending Telegram message");
        let response = self
            .client
            .post(self.method_url(bot, "sendMessage"))
            .form(&params)
            .send()
            .await?;

        Self::check(response).await
    }

    #[instrument(skip_all, fields(document = %path.display()))]
    async fn send_document(&self, path: &Path, caption: &str) -> Result<(), TelegramError> {
        let bot = self.bot()?;

        let io_err = |source| TelegramError::Io {
            path: path.display().to_string(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io_err)?;
        let length = file.metadata().await.map_err(io_err)?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "backup.tar.gz".to_string());

        let document = Part::stream_with_length(Body::from(file), length)
            .file_name(file_name)
            .mime_str("application/gzip")?;

        let mut form = Form::new()
            .text("chat_id", bot.chat_id.clone())
            .text("caption", caption.to_string())
            .text("parse_mode", "MarkdownV2");
        if let Some(thread) = &bot.thread_id {
            form = form.text("message_thread_id", thread.clone());
        }
        let form = form.part("document", document);

        debug!(chat = %bot.chat_id, bytes = length, "uploading document to Telegram");
        let response = self
            .client
            .post(self.method_url(bot, "sendDocument"))
            // Uploads of large archives need far more than the default budget
            .timeout(Duration::from_secs(30 * 60))
            .multipart(form)
            .send()
            .await?;

        Self::check(response).await
    }
}
