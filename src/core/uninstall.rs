/// Self-removal
///
/// Undoes what the installer set up: the cron schedule, the PATH symlink and
/// the install directory. Archives can be kept.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::utils::{INSTALL_DIR, SYMLINK_PATH};

/// What to remove
#[derive(Debug, Clone)]
pub struct RemovalPlan {
    pub install_dir: PathBuf,
    pub symlink: PathBuf,
    pub backup_dir: PathBuf,
    pub keep_backups: bool,
}

impl RemovalPlan {
    pub fn for_config(config: &Config, keep_backups: bool) -> Self {
        Self {
            install_dir: PathBuf::from(INSTALL_DIR),
            symlink: PathBuf::from(SYMLINK_PATH),
            backup_dir: config.backup_dir.clone(),
            keep_backups,
        }
    }
}

#[derive(Debug, Default)]
pub struct RemovalReport {
    pub cron_lines_removed: usize,
    pub symlink_removed: bool,
    pub removed_paths: Vec<PathBuf>,
}

/// Split a crontab into the lines to keep and the number dropped
pub fn filter_crontab(existing: &str, markers: &[&str]) -> (String, usize) {
    let mut kept = String::new();
    let mut removed = 0;
    for line in existing.lines() {
        let is_ours = !line.trim_start().starts_with('#') && markers.iter().any(|m| line.contains(m));
        if is_ours {
            removed += 1;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    (kept, removed)
}

fn remove_cron_entries(markers: &[&str]) -> Result<usize> {
    let listing = match Command::new("crontab").arg("-l").output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).to_string(),
        Ok(_) => {
            debug!("no crontab for this user");
            return Ok(0);
        }
        Err(e) => {
            warn!(error = %e, "crontab not available");
            return Ok(0);
        }
    };

    let (kept, removed) = filter_crontab(&listing, markers);
    if removed == 0 {
        return Ok(0);
    }

    let mut child = Command::new("crontab")
        .arg("-")
        .stdin(Stdio::piped())
        .spawn()
        .context("Failed to run crontab")?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(kept.as_bytes())
            .context("Failed to write new crontab")?;
    }
    let status = child.wait().context("Failed to wait for crontab")?;
    if !status.success() {
        bail!("crontab exited with {}", status);
    }
    Ok(removed)
}

/// Remove `path` only when it is a symlink
pub fn remove_symlink(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
            Ok(true)
        }
        Ok(_) => {
            warn!(path = %path.display(), "not a symlink, leaving it in place");
            Ok(false)
        }
        Err(_) => Ok(false),
    }
}

/// Delete the install directory, sparing `backup_dir` when asked to
pub fn remove_install_dir(install_dir: &Path, backup_dir: &Path, keep_backups: bool) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    if !install_dir.exists() {
        return Ok(removed);
    }

    if keep_backups && backup_dir.starts_with(install_dir) {
        for entry in fs::read_dir(install_dir)
            .with_context(|| format!("Failed to read {}", install_dir.display()))?
        {
            let path = entry?.path();
            if backup_dir.starts_with(&path) {
                continue;
            }
            if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .with_context(|| format!("Failed to remove {}", path.display()))?;
            removed.push(path);
        }
        return Ok(removed);
    }

    fs::remove_dir_all(install_dir)
        .with_context(|| format!("Failed to remove {}", install_dir.display()))?;
    removed.push(install_dir.to_path_buf());

    if !keep_backups && backup_dir.exists() {
        fs::remove_dir_all(backup_dir)
            .with_context(|| format!("Failed to remove {}", backup_dir.display()))?;
        removed.push(backup_dir.to_path_buf());
    }
    Ok(removed)
}

pub fn uninstall(plan: &RemovalPlan) -> Result<RemovalReport> {
    let install = plan.install_dir.display().to_string();
    let markers = ["rw-backup", install.as_str()];

    let cron_lines_removed = remove_cron_entries(&markers)?;
    let symlink_removed = remove_symlink(&plan.symlink)?;
    let removed_paths = remove_install_dir(&plan.install_dir, &plan.backup_dir, plan.keep_backups)?;

    info!(cron_lines_removed, symlink_removed, removed = removed_paths.len(), "uninstalled");
    Ok(RemovalReport {
        cron_lines_removed,
        symlink_removed,
        removed_paths,
    })
}
