/// Version checking and self-update
///
/// Release lookups go to the GitHub releases API and are cached on disk for a
/// few hours so scheduled backups do not hit the API on every run.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::telegram::Notifier;
use crate::utils::{escape_markdown_v2, GITHUB_API_URL, REPO_URL, UPDATE_CHECK_TTL_SECS};

pub const CURRENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const CACHE_FILE: &str = ".update_check.json";
const ASSET_MARKER: &str = "linux-x86_64";

/// Result of one release lookup
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionInfo {
    pub current_version: String,
    pub latest_version: Option<String>,
    pub update_available: bool,
    pub release_url: Option<String>,
    pub download_url: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// GitHub release API response
#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    html_url: String,
    assets: Vec<GitHubAsset>,
}

#[derive(Debug, Deserialize)]
struct GitHubAsset {
    name: String,
    browser_download_url: String,
}

/// Whether `latest_tag` (with or without a leading `v`) is newer than `current`
pub fn is_newer(current: &str, latest_tag: &str) -> Result<bool> {
    let current = Version::parse(current).context("Failed to parse current version")?;
    let latest = Version::parse(latest_tag.trim_start_matches('v'))
        .with_context(|| format!("Failed to parse release tag '{}'", latest_tag))?;
    Ok(latest > current)
}

/// Cache file location: next to the archive directory, inside the install dir
pub fn cache_path_for(config: &Config) -> PathBuf {
    config
        .backup_dir
        .parent()
        .unwrap_or(&config.backup_dir)
        .join(CACHE_FILE)
}

pub struct UpdateChecker {
    client: Client,
    api_url: String,
    cache_path: Option<PathBuf>,
    current_version: String,
}

impl UpdateChecker {
    pub fn new(api_url: impl Into<String>, cache_path: Option<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(format!("rw-backup/{}", CURRENT_VERSION))
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            cache_path,
            current_version: CURRENT_VERSION.to_string(),
        })
    }

    pub fn for_config(config: &Config) -> Result<Self> {
        Self::new(GITHUB_API_URL, Some(cache_path_for(config)))
    }

    #[cfg(test)]
    fn with_current_version(mut self, version: &str) -> Self {
        self.current_version = version.to_string();
        self
    }

    /// Look up the latest release, using the cache unless `force` is set
    pub async fn check(&self, force: bool) -> Result<VersionInfo> {
        if !force {
            if let Some(cached) = self.read_cache(Utc::now()) {
                debug!(latest = ?cached.latest_version, "using cached release lookup");
                return Ok(cached);
            }
        }

        let info = self.fetch().await?;
        self.write_cache(&info);
        Ok(info)
    }

    async fn fetch(&self) -> Result<VersionInfo> {
        let response = self
            .client
            .get(&self.api_url)
            .send()
            .await
            .context("Failed to fetch latest release from GitHub")?;

        if !response.status().is_success() {
            bail!("GitHub releases API returned HTTP {}", response.status());
        }

        let release: GitHubRelease = response
            .json()
            .await
            .context("Failed to parse GitHub release response")?;

        let update_available = is_newer(&self.current_version, &release.tag_name)?;
        let download_url = release
            .assets
            .iter()
            .find(|asset| asset.name.contains(ASSET_MARKER))
            .map(|asset| asset.browser_download_url.clone());

        Ok(VersionInfo {
            current_version: self.current_version.clone(),
            latest_version: Some(release.tag_name.trim_start_matches('v').to_string()),
            update_available,
            release_url: Some(release.html_url),
            download_url,
            checked_at: Utc::now(),
        })
    }

    fn read_cache(&self, now: DateTime<Utc>) -> Option<VersionInfo> {
        let path = self.cache_path.as_ref()?;
        let content = std::fs::read_to_string(path).ok()?;
        let info: VersionInfo = serde_json::from_str(&content).ok()?;

        let age = now.signed_duration_since(info.checked_at).num_seconds();
        // A cache written by another build says nothing about this one
        if !(0..UPDATE_CHECK_TTL_SECS).contains(&age) || info.current_version != self.current_version {
            return None;
        }
        Some(info)
    }

    fn write_cache(&self, info: &VersionInfo) {
        let Some(path) = &self.cache_path else { return };
        let result = serde_json::to_string_pretty(info)
            .map_err(anyhow::Error::from)
            .and_then(|json| std::fs::write(path, json).map_err(anyhow::Error::from));
        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "could not write update cache");
        }
    }

    /// Download the release asset to `target`, replacing it atomically
    pub async fn download_to(&self, info: &VersionInfo, target: &Path) -> Result<()> {
        let download_url = info
            .download_url
            .as_deref()
            .ok_or_else(|| anyhow!("No {} binary attached to the latest release", ASSET_MARKER))?;

        let response = self
            .client
            .get(download_url)
            .timeout(Duration::from_secs(300))
            .send()
            .await
            .context("Failed to download release")?;

        if !response.status().is_success() {
            bail!("Failed to download release: HTTP {}", response.status());
        }

        let bytes = response.bytes().await.context("Failed to read release bytes")?;

        let staging = target.with_extension("new");
        std::fs::write(&staging, &bytes)
            .with_context(|| format!("Failed to write {}", staging.display()))?;
        std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))
            .context("Failed to mark new binary executable")?;
        std::fs::rename(&staging, target)
            .with_context(|| format!("Failed to replace {}", target.display()))?;

        info!(target = %target.display(), bytes = bytes.len(), "binary updated");
        Ok(())
    }

    /// Replace the running executable with the latest release
    pub async fn apply_update(&self, info: &VersionInfo) -> Result<PathBuf> {
        let exe = std::env::current_exe().context("Cannot locate the running executable")?;
        let exe = exe.canonicalize().unwrap_or(exe);
        self.download_to(info, &exe).await?;
        Ok(exe)
    }
}

/// Operator message announcing a newer release
pub fn update_message(info: &VersionInfo) -> String {
    let latest = info.latest_version.as_deref().unwrap_or("?");
    let url = info
        .release_url
        .clone()
        .unwrap_or_else(|| format!("{}/releases", REPO_URL));
    format!(
        "🆕 *{}*\n{} → {}\n{}\n\n{}",
        escape_markdown_v2("Update available"),
        escape_markdown_v2(&info.current_version),
        escape_markdown_v2(latest),
        escape_markdown_v2(&url),
        escape_markdown_v2("Run: rw-backup update"),
    )
}

/// Fire-and-forget update check that only ever informs the operator.
///
/// The handle is returned for tests; callers are not expected to await it.
pub fn spawn_background_check(checker: UpdateChecker, notifier: Arc<dyn Notifier>) -> JoinHandle<()> {
    tokio::spawn(async move {
        match checker.check(false).await {
            Ok(info) if info.update_available => {
                info!(latest = ?info.latest_version, "newer release available");
                if notifier.is_configured() {
                    if let Err(e) = notifier.send_message(&update_message(&info)).await {
                        debug!(error = %e, "update notice not sent");
                    }
                }
            }
            Ok(_) => debug!("already on the latest release"),
            Err(e) => warn!(error = %format!("{:#}", e), "update check failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::telegram::MockNotifier;
    use crate::core::test_support::MockHttpServer;
    use tempfile::TempDir;

    fn release_json(tag: &str, asset_url: &str) -> String {
        format!(
            r#"{{"tag_name":"{tag}","html_url":"https://example.invalid/r","assets":[
                {{"name":"rw-backup-linux-aarch64","browser_download_url":"{asset_url}/arm"}},
                {{"name":"rw-backup-linux-x86_64","browser_download_url":"{asset_url}/x86"}}]}}"#
        )
    }

    #[test]
    fn test_current_version_parsing() {
        assert!(Version::parse(CURRENT_VERSION).is_ok());
    }

    #[test]
    fn test_is_newer() {
        assert!(is_newer("0.4.0", "v0.5.0").unwrap());
        assert!(!is_newer("0.4.0", "0.4.0").unwrap());
        assert!(!is_newer("1.0.0", "v0.9.9").unwrap());
        assert!(is_newer("0.4.0", "latest").is_err());
    }

    #[tokio::test]
    async fn test_check_fetches_then_uses_cache() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join(CACHE_FILE);

        let server = MockHttpServer::start().await;
        let checker = UpdateChecker::new(format!("{}/latest", server.base_url), Some(cache.clone()))
            .unwrap()
            .with_current_version("0.4.0");
        let body = release_json("v0.5.1", &server.base_url);
        // Only one response: a second network call would hang the test
        let handle = tokio::spawn(server.respond_once(200, body));

        let first = checker.check(false).await.unwrap();
        handle.await.unwrap();
        assert!(first.update_available);
        assert_eq!(first.latest_version.as_deref(), Some("0.5.1"));
        assert!(first.download_url.unwrap().ends_with("/x86"));
        assert!(cache.exists());

        let second = checker.check(false).await.unwrap();
        assert_eq!(second.latest_version.as_deref(), Some("0.5.1"));
    }

    #[test]
    fn test_stale_cache_is_ignored() {
        let dir = TempDir::new().unwrap();
        let cache = dir.path().join(CACHE_FILE);
        let checker = UpdateChecker::new("http://127.0.0.1:9", Some(cache.clone()))
            .unwrap()
            .with_current_version("0.4.0");

        let info = VersionInfo {
            current_version: "0.4.0".into(),
            latest_version: Some("0.4.0".into()),
            update_available: false,
            release_url: None,
            download_url: None,
            checked_at: Utc::now() - chrono::Duration::hours(7),
        };
        std::fs::write(&cache, serde_json::to_string(&info).unwrap()).unwrap();

        assert!(checker.read_cache(Utc::now()).is_none());
        assert!(checker
            .read_cache(info.checked_at + chrono::Duration::hours(1))
            .is_some());
    }

    #[tokio::test]
    async fn test_download_replaces_target_executable() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("rw-backup");
        std::fs::write(&target, b"old").unwrap();

        let server = MockHttpServer::start().await;
        let checker = UpdateChecker::new("http://127.0.0.1:9", None).unwrap();
        let info = VersionInfo {
            current_version: "0.4.0".into(),
            latest_version: Some("0.5.0".into()),
            update_available: true,
            release_url: None,
            download_url: Some(format!("{}/x86", server.base_url)),
            checked_at: Utc::now(),
        };
        let handle = tokio::spawn(server.respond_once(200, "NEW-BINARY"));

        checker.download_to(&info, &target).await.unwrap();
        handle.await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"NEW-BINARY");
        let mode = std::fs::metadata(&target).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        assert!(!target.with_extension("new").exists());
    }

    #[tokio::test]
    async fn test_background_check_notifies_when_newer() {
        let server = MockHttpServer::start().await;
        let checker = UpdateChecker::new(server.base_url.clone(), None)
            .unwrap()
            .with_current_version("0.1.0");
        let body = release_json("v0.2.0", &server.base_url);
        let server_handle = tokio::spawn(server.respond_once(200, body));

        let mut notifier = MockNotifier::new();
        notifier.expect_is_configured().return_const(true);
        notifier
            .expect_send_message()
            .withf(|text| text.contains("0\\.2\\.0"))
            .times(1)
            .returning(|_| Ok(()));

        spawn_background_check(checker, Arc::new(notifier)).await.unwrap();
        server_handle.await.unwrap();
    }
}
