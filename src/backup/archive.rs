// backuptool/src/backup/archive.rs
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::errors::{BackupError, Result};

/// One file to place into the archive under a fixed in-archive name.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub name: String,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

/// Creates a ZIP archive at `dest_path` containing each input file under its
/// in-archive name, at maximum deflate compression.
///
/// Input files that do not exist at bundle time are skipped; the archive is
/// written to a temporary file in the destination directory and renamed into
/// place only once fully finalized, so a partial archive is never visible
/// under the final name.
pub fn bundle(entries: &[ArchiveEntry], dest_path: &Path) -> Result<PathBuf> {
    let parent = dest_path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        std::fs::create_dir_all(parent).map_err(|e| {
            BackupError::Archive(format!(
                "Failed to create archive directory {}: {}",
                parent.display(),
                e
            ))
        })?;
    }

    let tmp = NamedTempFile::new_in(parent).map_err(|e| {
        BackupError::Archive(format!(
            "Failed to create temporary archive in {}: {}",
            parent.display(),
            e
        ))
    })?;

    let mut zip = ZipWriter::new(tmp.as_file());
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9));

    let mut bundled = 0usize;
    for entry in entries {
        if !entry.path.is_file() {
            warn!(
                path = %entry.path.display(),
                "Skipping missing input file during archive bundling"
            );
            continue;
        }

        zip.start_file(&entry.name, options)?;
        let mut input = File::open(&entry.path).map_err(|e| {
            BackupError::Archive(format!("Failed to open {}: {}", entry.path.display(), e))
        })?;
        io::copy(&mut input, &mut zip).map_err(|e| {
            BackupError::Archive(format!(
                "Failed to write {} into archive: {}",
                entry.name, e
            ))
        })?;
        bundled += 1;
    }

    zip.finish()?;

    tmp.persist(dest_path).map_err(|e| {
        BackupError::Archive(format!(
            "Failed to finalize archive at {}: {}",
            dest_path.display(),
            e
        ))
    })?;

    info!(
        archive = %dest_path.display(),
        files = bundled,
        "Archive created"
    );
    Ok(dest_path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("create fixture");
        file.write_all(contents).expect("write fixture");
        path
    }

    #[test]
    fn test_bundle_skips_missing_inputs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let existing = write_file(dir.path(), "present.sql", b"SELECT 1;\n");

        let entries = [
            ArchiveEntry::new(&existing, "postgresql-2024-01-01.sql"),
            ArchiveEntry::new(dir.path().join("absent.json"), "mongodb-2024-01-01.json"),
        ];
        let dest = dir.path().join("2024-01-01-backup.zip");
        bundle(&entries, &dest)?;

        let mut archive = zip::ZipArchive::new(File::open(&dest)?)
            .map_err(|e| BackupError::Archive(e.to_string()))?;
        assert_eq!(archive.len(), 1);

        let mut contents = String::new();
        archive
            .by_name("postgresql-2024-01-01.sql")
            .map_err(|e| BackupError::Archive(e.to_string()))?
            .read_to_string(&mut contents)?;
        assert_eq!(contents, "SELECT 1;\n");
        Ok(())
    }

    #[test]
    fn test_bundle_round_trips_multiple_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sql = write_file(dir.path(), "a.sql", b"-- dump\n");
        let json = write_file(dir.path(), "b.json", b"{\"count\":0}\n");

        let entries = [
            ArchiveEntry::new(&sql, "postgresql-2024-01-01.sql"),
            ArchiveEntry::new(&json, "mongodb-2024-01-01.json"),
        ];
        let dest = dir.path().join("2024-01-01-backup.zip");
        bundle(&entries, &dest)?;

        let archive = zip::ZipArchive::new(File::open(&dest)?)
            .map_err(|e| BackupError::Archive(e.to_string()))?;
        let names: Vec<_> = archive.file_names().collect();
        assert!(names.contains(&"postgresql-2024-01-01.sql"));
        assert!(names.contains(&"mongodb-2024-01-01.json"));
        Ok(())
    }

    #[test]
    fn test_bundle_leaves_no_partial_archive_in_temp_name() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("empty-backup.zip");
        bundle(&[], &dest)?;

        // Only the finalized archive remains in the directory.
        let names: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["empty-backup.zip".to_string()]);
        Ok(())
    }
}
