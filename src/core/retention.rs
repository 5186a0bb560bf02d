/// Retention sweeper
///
/// Deletes archives whose modification time is at least `max_age_days` old.
/// Only names matching the archive pattern are considered. Never fails: an
/// unreadable directory or a file that cannot be removed is logged and skipped.

use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::utils::parse_archive_stamp;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Sweep `dir` relative to the current time
pub fn sweep(dir: &Path, max_age_days: u64) -> usize {
    sweep_at(dir, max_age_days, SystemTime::now())
}

/// Sweep `dir` as if the current time were `now`; returns the number removed
pub fn sweep_at(dir: &Path, max_age_days: u64, now: SystemTime) -> usize {
    let max_age = Duration::from_secs(max_age_days.saturating_mul(SECONDS_PER_DAY));

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "nothing to sweep");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if parse_archive_stamp(name).is_none() {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };

        // Timestamps in the future count as age zero
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(archive = name, age_days = age.as_secs() / SECONDS_PER_DAY, "removed expired archive");
                removed += 1;
            }
            Err(e) => warn!(archive = name, error = %e, "could not remove expired archive"),
        }
    }

    if removed > 0 {
        info!(removed, max_age_days, "retention sweep finished");
    }
    removed
}
