// backuptool/src/backup/logic.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::backup::archive::{self, ArchiveEntry};
use crate::backup::mongo_export::MongoExporter;
use crate::backup::pg_export::PgExporter;
use crate::config::Config;
use crate::errors::{BackupError, Result};
use crate::utils::command::CommandRunner;

/// Result of one backup run. Referenced artifacts live on disk; the run
/// itself is returned to the caller and not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    /// Millisecond timestamp the run started at; also part of the export
    /// file names, keeping concurrent runs on distinct files.
    pub run_id: i64,
    pub date: String,
    pub sql_path: PathBuf,
    pub mongo_path: PathBuf,
    pub zip_path: PathBuf,
    pub success: bool,
}

/// Sequences one backup run: export both stores, then bundle the outputs.
///
/// Notification is deliberately not part of this sequence; the calling layer
/// attaches the delivery outcome so a notifier failure can never mask a
/// successful backup.
pub struct Orchestrator {
    backup_dir: PathBuf,
    pg: PgExporter,
    mongo: MongoExporter,
}

impl Orchestrator {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            backup_dir: config.backup_dir.clone(),
            pg: PgExporter::new(config.postgres.clone(), runner),
            mongo: MongoExporter::new(config.mongo.clone()),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub async fn perform_backup(&self) -> Result<BackupRun> {
        fs::create_dir_all(&self.backup_dir).map_err(|e| {
            BackupError::Export(format!(
                "Failed to create backup directory {}: {}",
                self.backup_dir.display(),
                e
            ))
        })?;

        let started_at = Utc::now();
        let names = RunNames::new(started_at);
        let sql_path = self.backup_dir.join(&names.sql_file);
        let mongo_path = self.backup_dir.join(&names.mongo_file);
        let zip_path = self.backup_dir.join(&names.zip_file);

        info!(date = %names.date, run_id = names.run_id, "Starting backup run");

        // The exporters touch disjoint stores and disjoint output files, so
        // they run concurrently within the strictly ordered run.
        tokio::try_join!(self.pg.export(&sql_path), self.mongo.export(&mongo_path))?;

        archive::bundle(
            &[
                ArchiveEntry::new(&sql_path, &names.sql_archive_name),
                ArchiveEntry::new(&mongo_path, &names.mongo_archive_name),
            ],
            &zip_path,
        )?;

        info!(archive = %zip_path.display(), "Backup run completed");
        Ok(BackupRun {
            run_id: names.run_id,
            date: names.date,
            sql_path,
            mongo_path,
            zip_path,
            success: true,
        })
    }
}

/// Timestamp-derived file names for one run.
struct RunNames {
    run_id: i64,
    date: String,
    sql_file: String,
    mongo_file: String,
    zip_file: String,
    sql_archive_name: String,
    mongo_archive_name: String,
}

impl RunNames {
    fn new(now: DateTime<Utc>) -> Self {
        let date = now.format("%Y-%m-%d").to_string();
        let run_id = now.timestamp_millis();
        Self {
            sql_file: format!("postgresql-{}-{}.sql", date, run_id),
            mongo_file: format!("mongodb-{}-{}.json", date, run_id),
            zip_file: format!("{}-backup.zip", date),
            sql_archive_name: format!("postgresql-{}.sql", date),
            mongo_archive_name: format!("mongodb-{}.json", date),
            run_id,
            date,
        }
    }
}
