// backuptool/src/retention/mod.rs
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::errors::{BackupError, Result};

/// Removes every file directly under `dir` whose age exceeds `max_age`.
///
/// The comparison is strict: a file aged exactly `max_age` is kept. Entries
/// that cannot be inspected or removed are logged and skipped; only a failure
/// to list the directory itself surfaces to the caller. Returns the number of
/// files removed.
pub fn clean(dir: &Path, max_age: Duration) -> Result<usize> {
    clean_at(dir, max_age, SystemTime::now())
}

pub(crate) fn clean_at(dir: &Path, max_age: Duration, now: SystemTime) -> Result<usize> {
    let entries = fs::read_dir(dir).map_err(|e| {
        BackupError::Retention(format!(
            "Failed to list backup directory {}: {}",
            dir.display(),
            e
        ))
    })?;

    let mut removed = 0usize;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                continue;
            }
        };
        let path = entry.path();

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot stat entry, skipping");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "No modification time, skipping");
                continue;
            }
        };
        // A file modified in the future has no meaningful age; keep it.
        let age = match now.duration_since(modified) {
            Ok(age) => age,
            Err(_) => continue,
        };

        if age > max_age {
            match fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "Deleted expired backup file");
                    removed += 1;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove expired file");
                }
            }
        }
    }

    Ok(removed)
}
