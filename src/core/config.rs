/// Configuration management for config.env
///
/// The file is a flat list of KEY=value lines. It is read once at startup into
/// an immutable `Config`; changes go through `Config::save`, which rewrites the
/// whole file with owner-only permissions and hands back the persisted value.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::utils::{
    mask_sensitive, DEFAULT_APP_CONTAINER, DEFAULT_BACKUP_DIR, DEFAULT_DB_CONTAINER,
    DEFAULT_DB_READY_TIMEOUT, DEFAULT_DB_USER, DEFAULT_DB_VOLUME, DEFAULT_REMNAWAVE_DIR,
    DEFAULT_RETENTION_DAYS, GOOGLE_TOKEN_URL, GOOGLE_UPLOAD_URL, TELEGRAM_API_URL,
};

/// Keys written by `save`, in file order. Anything else is carried through untouched.
const KNOWN_KEYS: &[&str] = &[
    "BOT_TOKEN",
    "CHAT_ID",
    "TG_MESSAGE_THREAD_ID",
    "DB_USER",
    "UPLOAD_METHOD",
    "GD_CLIENT_ID",
    "GD_CLIENT_SECRET",
    "GD_REFRESH_TOKEN",
    "GD_FOLDER_ID",
    "BACKUP_DIR",
    "REMNAWAVE_DIR",
    "DB_CONTAINER",
    "APP_CONTAINER",
    "DB_VOLUME",
    "RETENTION_DAYS",
    "DB_READY_TIMEOUT",
    "TG_API_URL",
    "GD_TOKEN_URL",
    "GD_UPLOAD_URL",
];

/// Telegram bot identity used for notifications and document delivery
#[derive(Debug, Clone, PartialEq)]
pub struct BotIdentity {
    pub token: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
}

/// Complete Google Drive credential triple plus optional target folder
#[derive(Debug, Clone, PartialEq)]
pub struct DriveCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub folder_id: Option<String>,
}

/// Where archives are shipped. Exactly one is active.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryTarget {
    Telegram,
    GoogleDrive(DriveCredentials),
}

impl DeliveryTarget {
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryTarget::Telegram => "Telegram",
            DeliveryTarget::GoogleDrive(_) => "Google Drive",
        }
    }

    fn method_key(&self) -> &'static str {
        match self {
            DeliveryTarget::Telegram => "telegram",
            DeliveryTarget::GoogleDrive(_) => "google_drive",
        }
    }
}

/// Raw Drive settings as stored; kept even when another target is active
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriveSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub folder_id: Option<String>,
}

impl DriveSettings {
    /// Credentials, only when the whole triple is present
    pub fn credentials(&self) -> Option<DriveCredentials> {
        Some(DriveCredentials {
            client_id: self.client_id.clone()?,
            client_secret: self.client_secret.clone()?,
            refresh_token: self.refresh_token.clone()?,
            folder_id: self.folder_id.clone(),
        })
    }

    fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.client_id.is_none() {
            missing.push("GD_CLIENT_ID");
        }
        if self.client_secret.is_none() {
            missing.push("GD_CLIENT_SECRET");
        }
        if self.refresh_token.is_none() {
            missing.push("GD_REFRESH_TOKEN");
        }
        missing
    }
}

/// Remote API base URLs
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub telegram_api: String,
    pub google_token: String,
    pub google_upload: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            telegram_api: TELEGRAM_API_URL.to_string(),
            google_token: GOOGLE_TOKEN_URL.to_string(),
            google_upload: GOOGLE_UPLOAD_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    path: PathBuf,
    pub bot: Option<BotIdentity>,
    pub db_user: String,
    pub target: DeliveryTarget,
    pub drive: DriveSettings,
    pub backup_dir: PathBuf,
    pub remnawave_dir: PathBuf,
    pub db_container: String,
    pub app_container: String,
    pub db_volume: String,
    pub retention_days: u64,
    pub db_ready_timeout: Duration,
    pub endpoints: Endpoints,
    extra: BTreeMap<String, String>,
    degraded: bool,
}

impl Config {
    /// Load configuration from file.
    ///
    /// A Google Drive target with an incomplete credential triple is switched
    /// to Telegram and written back before returning, so the fallback happens
    /// once rather than on every run.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            return Err(anyhow!(
                "Configuration not found at {}\n\n\
                Create it with at least:\n\
                  BOT_TOKEN=<telegram bot token>\n\
                  CHAT_ID=<telegram chat id>\n\
                  DB_USER=postgres\n\
                  UPLOAD_METHOD=telegram",
                path.display()
            ));
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let config = Self::parse(path, &content)?;

        if config.degraded {
            warn!(path = %config.path.display(), "persisting fallback to Telegram delivery");
            return config.save();
        }

        Ok(config)
    }

    /// Parse file contents without touching the disk
    pub fn parse(path: PathBuf, content: &str) -> Result<Self> {
        let mut values: BTreeMap<String, String> = BTreeMap::new();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                values.insert(key.trim().to_string(), value.to_string());
            }
        }

        let mut take = |key: &str| values.remove(key).filter(|v| !v.is_empty());

        let bot = match (take("BOT_TOKEN"), take("CHAT_ID")) {
            (Some(token), Some(chat_id)) => Some(BotIdentity {
                token,
                chat_id,
                thread_id: take("TG_MESSAGE_THREAD_ID"),
            }),
            _ => {
                take("TG_MESSAGE_THREAD_ID");
                None
            }
        };

        let db_user = take("DB_USER").unwrap_or_else(|| DEFAULT_DB_USER.to_string());
        let method = take("UPLOAD_METHOD").unwrap_or_else(|| "telegram".to_string());

        let drive = DriveSettings {
            client_id: take("GD_CLIENT_ID"),
            client_secret: take("GD_CLIENT_SECRET"),
            refresh_token: take("GD_REFRESH_TOKEN"),
            folder_id: take("GD_FOLDER_ID"),
        };

        let mut degraded = false;
        let target = match method.as_str() {
            "telegram" => DeliveryTarget::Telegram,
            "google_drive" => match drive.credentials() {
                Some(credentials) => DeliveryTarget::GoogleDrive(credentials),
                None => {
                    warn!(
                        missing = ?drive.missing(),
                        "Google Drive credentials incomplete, falling back to Telegram"
                    );
                    degraded = true;
                    DeliveryTarget::Telegram
                }
            },
            other => return Err(anyhow!("Unknown UPLOAD_METHOD '{}' (expected telegram or google_drive)", other)),
        };

        let retention_days = match take("RETENTION_DAYS") {
            Some(days) => days
                .parse()
                .with_context(|| format!("RETENTION_DAYS must be a whole number of days, got '{}'", days))?,
            None => DEFAULT_RETENTION_DAYS,
        };

        let timeout = take("DB_READY_TIMEOUT").unwrap_or_else(|| DEFAULT_DB_READY_TIMEOUT.to_string());
        let db_ready_timeout = humantime::parse_duration(&timeout)
            .with_context(|| format!("Invalid DB_READY_TIMEOUT '{}'", timeout))?;

        let defaults = Endpoints::default();
        let endpoints = Endpoints {
            telegram_api: take("TG_API_URL").unwrap_or(defaults.telegram_api),
            google_token: take("GD_TOKEN_URL").unwrap_or(defaults.google_token),
            google_upload: take("GD_UPLOAD_URL").unwrap_or(defaults.google_upload),
        };

        let backup_dir = take("BACKUP_DIR").unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_string());
        let remnawave_dir = take("REMNAWAVE_DIR").unwrap_or_else(|| DEFAULT_REMNAWAVE_DIR.to_string());
        let db_container = take("DB_CONTAINER").unwrap_or_else(|| DEFAULT_DB_CONTAINER.to_string());
        let app_container = take("APP_CONTAINER").unwrap_or_else(|| DEFAULT_APP_CONTAINER.to_string());
        let db_volume = take("DB_VOLUME").unwrap_or_else(|| DEFAULT_DB_VOLUME.to_string());

        let config = Self {
            path,
            bot,
            db_user,
            target,
            drive,
            backup_dir: PathBuf::from(backup_dir),
            remnawave_dir: PathBuf::from(remnawave_dir),
            db_container,
            app_container,
            db_volume,
            retention_days,
            db_ready_timeout,
            endpoints,
            extra: values,
            degraded,
        };

        debug!(
            bot = ?config.bot.as_ref().map(|b| mask_sensitive(&b.token, 4)),
            target = config.target.label(),
            backup_dir = %config.backup_dir.display(),
            "configuration parsed"
        );

        Ok(config)
    }

    /// Write the whole file (mode 0600) and return the persisted snapshot
    pub fn save(self) -> Result<Self> {
        let rendered = self.render();

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let staging = self.path.with_extension("env.tmp");
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&staging)
                .with_context(|| format!("Failed to open {}", staging.display()))?;
            file.write_all(rendered.as_bytes())
                .context("Failed to write configuration")?;
            file.sync_all().context("Failed to flush configuration")?;
        }
        fs::rename(&staging, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        Ok(Self {
            degraded: false,
            ..self
        })
    }

    /// Parent for temporary working directories. Never the archive directory
    /// itself, so an interrupted run leaves nothing among the archives.
    pub fn scratch_dir(&self) -> PathBuf {
        self.backup_dir
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Whether loading had to fall back from Google Drive to Telegram
    pub fn was_degraded(&self) -> bool {
        self.degraded
    }

    /// Host paths of the optional files bundled into every archive
    pub fn aux_file_paths(&self) -> Vec<PathBuf> {
        crate::utils::AUX_FILES
            .iter()
            .map(|name| self.remnawave_dir.join(name))
            .collect()
    }

    fn render(&self) -> String {
        let mut values: BTreeMap<&str, String> = BTreeMap::new();

        if let Some(bot) = &self.bot {
            values.insert("BOT_TOKEN", bot.token.clone());
            values.insert("CHAT_ID", bot.chat_id.clone());
            if let Some(thread) = &bot.thread_id {
                values.insert("TG_MESSAGE_THREAD_ID", thread.clone());
            }
        }
        values.insert("DB_USER", self.db_user.clone());
        values.insert("UPLOAD_METHOD", self.target.method_key().to_string());
        for (key, value) in [
            ("GD_CLIENT_ID", &self.drive.client_id),
            ("GD_CLIENT_SECRET", &self.drive.client_secret),
            ("GD_REFRESH_TOKEN", &self.drive.refresh_token),
            ("GD_FOLDER_ID", &self.drive.folder_id),
        ] {
            if let Some(value) = value {
                values.insert(key, value.clone());
            }
        }
        values.insert("BACKUP_DIR", self.backup_dir.display().to_string());
        values.insert("REMNAWAVE_DIR", self.remnawave_dir.display().to_string());
        values.insert("DB_CONTAINER", self.db_container.clone());
        values.insert("APP_CONTAINER", self.app_container.clone());
        values.insert("DB_VOLUME", self.db_volume.clone());
        values.insert("RETENTION_DAYS", self.retention_days.to_string());
        values.insert("DB_READY_TIMEOUT", humantime::format_duration(self.db_ready_timeout).to_string());

        let defaults = Endpoints::default();
        if self.endpoints.telegram_api != defaults.telegram_api {
            values.insert("TG_API_URL", self.endpoints.telegram_api.clone());
        }
        if self.endpoints.google_token != defaults.google_token {
            values.insert("GD_TOKEN_URL", self.endpoints.google_token.clone());
        }
        if self.endpoints.google_upload != defaults.google_upload {
            values.insert("GD_UPLOAD_URL", self.endpoints.google_upload.clone());
        }

        let mut lines = vec!["# rw-backup configuration".to_string()];
        for key in KNOWN_KEYS {
            if let Some(value) = values.get(key) {
                lines.push(format!("{}={}", key, value));
            }
        }
        for (key, value) in &self.extra {
            lines.push(format!("{}={}", key, value));
        }

        let mut rendered = lines.join("\n");
        rendered.push('\n');
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.env");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_defaults_and_bot() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "# bot\nBOT_TOKEN=123:abc\nCHAT_ID=-100500\n\nUPLOAD_METHOD=telegram\n");

        let config = Config::load(&path).unwrap();

        assert_eq!(
            config.bot,
            Some(BotIdentity {
                token: "123:abc".into(),
                chat_id: "-100500".into(),
                thread_id: None,
            })
        );
        assert_eq!(config.db_user, "postgres");
        assert_eq!(config.target, DeliveryTarget::Telegram);
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.db_ready_timeout, Duration::from_secs(60));
        assert_eq!(config.db_container, "remnawave-db");
        assert!(!config.was_degraded());
    }

    #[test]
    fn test_complete_drive_credentials_select_drive() {
        let content = "BOT_TOKEN=t\nCHAT_ID=1\nUPLOAD_METHOD=google_drive\n\
                       GD_CLIENT_ID=id\nGD_CLIENT_SECRET=secret\nGD_REFRESH_TOKEN=refresh\nGD_FOLDER_ID=folder\n";
        let config = Config::parse(PathBuf::from("/nonexistent/config.env"), content).unwrap();

        match &config.target {
            DeliveryTarget::GoogleDrive(creds) => {
                assert_eq!(creds.client_id, "id");
                assert_eq!(creds.folder_id.as_deref(), Some("folder"));
            }
            other => panic!("expected Google Drive, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_drive_credentials_degrade_and_persist() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "BOT_TOKEN=t\nCHAT_ID=1\nUPLOAD_METHOD=google_drive\nGD_CLIENT_ID=id\nGD_CLIENT_SECRET=secret\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.target, DeliveryTarget::Telegram);

        let saved = fs::read_to_string(&path).unwrap();
        assert!(saved.contains("UPLOAD_METHOD=telegram"));
        // Partial credentials are kept so the operator can finish them later
        assert!(saved.contains("GD_CLIENT_ID=id"));

        // Second load sees the persisted fallback and does not degrade again
        let reloaded = Config::parse(path.clone(), &saved).unwrap();
        assert!(!reloaded.was_degraded());
        assert_eq!(reloaded.target, DeliveryTarget::Telegram);
    }

    #[test]
    fn test_save_is_owner_only_and_preserves_unknown_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "BOT_TOKEN=t\nCHAT_ID=1\nCRON_TIMES=0 3 * * *\nRETENTION_DAYS=14\n");

        let config = Config::load(&path).unwrap().save().unwrap();
        assert_eq!(config.retention_days, 14);

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        let saved = fs::read_to_string(&path).unwrap();
        assert!(saved.contains("CRON_TIMES=0 3 * * *"));
        assert!(saved.contains("RETENTION_DAYS=14"));
        assert_eq!(Config::parse(path, &saved).unwrap(), config);
    }

    #[test]
    fn test_drive_target_round_trips_through_save() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "BOT_TOKEN=t\nCHAT_ID=1\nUPLOAD_METHOD=google_drive\n\
             GD_CLIENT_ID=id\nGD_CLIENT_SECRET=secret\nGD_REFRESH_TOKEN=refresh\n",
        );
        let creds = DriveCredentials {
            client_id: "id".into(),
            client_secret: "secret".into(),
            refresh_token: "refresh".into(),
            folder_id: None,
        };

        let config = Config::load(&path).unwrap().save().unwrap();

        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.target, DeliveryTarget::GoogleDrive(creds));
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_scratch_dir_is_outside_backup_dir() {
        let config = Config::parse(PathBuf::from("c.env"), "BACKUP_DIR=/srv/rw/backup\n").unwrap();
        assert_eq!(config.scratch_dir(), PathBuf::from("/srv/rw"));

        let config = Config::parse(PathBuf::from("c.env"), "BACKUP_DIR=/\n").unwrap();
        assert_eq!(config.scratch_dir(), std::env::temp_dir());
    }

    #[test]
    fn test_missing_file_and_bad_values() {
        let err = Config::load("/nonexistent/rw-backup/config.env").unwrap_err();
        assert!(err.to_string().contains("Configuration not found"));

        let err = Config::parse(PathBuf::from("c.env"), "UPLOAD_METHOD=ftp\n").unwrap_err();
        assert!(err.to_string().contains("Unknown UPLOAD_METHOD"));

        assert!(Config::parse(PathBuf::from("c.env"), "RETENTION_DAYS=week\n").is_err());
        assert!(Config::parse(PathBuf::from("c.env"), "DB_READY_TIMEOUT=soon\n").is_err());
    }
}
