// backuptool/src/backup/pg_export.rs
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{Connection, PgConnection, Row};
use tempfile::NamedTempFile;
use tracing::{info, warn};
use which::which;

use crate::config::PostgresConfig;
use crate::errors::{BackupError, Result};
use crate::utils::command::CommandRunner;

const TABLE_SCHEMA_SQL: &str = "\
DROP TABLE IF EXISTS keypoints CASCADE;

CREATE TABLE keypoints (
  id SERIAL PRIMARY KEY,
  image_id VARCHAR(255) UNIQUE NOT NULL,
  keypoints JSONB NOT NULL,
  created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
  updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_image_id ON keypoints(image_id);
CREATE INDEX IF NOT EXISTS idx_created_at ON keypoints(created_at);
";

/// Exports the relational store to a self-contained SQL script.
///
/// The primary strategy shells out to pg_dump; when that fails (non-zero
/// exit, spawn error, or timeout) the exporter transparently falls back to a
/// manual row-by-row export over a single dedicated connection. Both
/// strategies write to a temporary file and rename into place on success, so
/// a failed attempt never leaves valid-looking partial output.
pub struct PgExporter {
    config: PostgresConfig,
    runner: Arc<dyn CommandRunner>,
    rows: Arc<dyn RowSource>,
}

impl PgExporter {
    pub fn new(config: PostgresConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let rows = Arc::new(PgRowSource {
            config: config.clone(),
        });
        Self::with_row_source(config, runner, rows)
    }

    pub fn with_row_source(
        config: PostgresConfig,
        runner: Arc<dyn CommandRunner>,
        rows: Arc<dyn RowSource>,
    ) -> Self {
        Self {
            config,
            runner,
            rows,
        }
    }

    pub async fn export(&self, dest_path: &Path) -> Result<()> {
        match self.dump_with_pg_dump(dest_path).await {
            Ok(()) => {
                info!(dest = %dest_path.display(), "PostgreSQL export completed via pg_dump");
                Ok(())
            }
            Err(primary_err) => {
                warn!(
                    error = %primary_err,
                    "pg_dump export failed, falling back to manual row export"
                );
                self.dump_manually(dest_path).await.map_err(|fallback_err| {
                    BackupError::Export(format!(
                        "both export strategies failed; pg_dump: {}; manual export: {}",
                        primary_err, fallback_err
                    ))
                })?;
                info!(dest = %dest_path.display(), "PostgreSQL export completed via manual fallback");
                Ok(())
            }
        }
    }

    fn pg_dump_executable(&self) -> Result<PathBuf> {
        match &self.config.dump_path {
            Some(path) => Ok(path.clone()),
            None => which("pg_dump").map_err(|e| {
                BackupError::Export(format!("pg_dump executable not found in PATH: {}", e))
            }),
        }
    }

    async fn dump_with_pg_dump(&self, dest_path: &Path) -> Result<()> {
        let program = self.pg_dump_executable()?;
        let parent = dest_path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(parent)?;

        let args = vec![
            "-f".to_string(),
            tmp.path().display().to_string(),
            self.config.connection_url()?,
        ];
        let mut envs = Vec::new();
        if let Some(password) = &self.config.password {
            envs.push(("PGPASSWORD".to_string(), password.clone()));
        }

        let output = self
            .runner
            .run(&program, &args, &envs, self.config.dump_timeout)
            .await?;
        if !output.success() {
            return Err(BackupError::Command {
                status: output
                    .status_code
                    .map(|c| format!("exit code {}", c))
                    .unwrap_or_else(|| "killed".to_string()),
                stderr: output.stderr_lossy(),
            });
        }

        tmp.persist(dest_path).map_err(|e| {
            BackupError::Export(format!(
                "Failed to finalize SQL export at {}: {}",
                dest_path.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Manual export: reads every row ordered by creation time and emits a
    /// loadable script with the table DDL and one INSERT per row.
    async fn dump_manually(&self, dest_path: &Path) -> Result<()> {
        let rows = self.rows.fetch_keypoints().await?;

        let parent = dest_path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(parent)?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            writer.write_all(script_header(Utc::now()).as_bytes())?;
            writer.write_all(TABLE_SCHEMA_SQL.as_bytes())?;
            writer.write_all(b"\n")?;

            for row in &rows {
                writeln!(
                    writer,
                    "{}",
                    insert_statement(
                        row.id,
                        &row.image_id,
                        &row.keypoints,
                        row.created_at,
                        row.updated_at
                    )
                )?;
            }
            writer.flush()?;
        }

        tmp.persist(dest_path).map_err(|e| {
            BackupError::Export(format!(
                "Failed to finalize SQL export at {}: {}",
                dest_path.display(),
                e
            ))
        })?;
        Ok(())
    }
}

/// One row of the keypoints table as the manual exporter consumes it.
#[derive(Debug, Clone)]
pub struct KeypointRow {
    pub id: i32,
    pub image_id: String,
    pub keypoints: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

/// Source of keypoints rows for the manual export strategy, so the fallback
/// can run against a substitute store in tests.
#[async_trait]
pub trait RowSource: Send + Sync {
    async fn fetch_keypoints(&self) -> Result<Vec<KeypointRow>>;
}

struct PgRowSource {
    config: PostgresConfig,
}

#[async_trait]
impl RowSource for PgRowSource {
    async fn fetch_keypoints(&self) -> Result<Vec<KeypointRow>> {
        let url = self.config.connection_url()?;
        let mut conn = PgConnection::connect(&url).await.map_err(|e| {
            BackupError::Connection(format!(
                "Failed to connect to database {}: {}",
                self.config.database, e
            ))
        })?;

        let rows = sqlx::query(
            "SELECT id, image_id, keypoints, created_at, updated_at \
             FROM keypoints ORDER BY created_at",
        )
        .fetch_all(&mut conn)
        .await
        .map_err(|e| BackupError::Export(format!("Failed to read keypoints rows: {}", e)));
        // The connection is dedicated to this scan; close it before decoding
        // so it is released on the error path too.
        conn.close().await.ok();

        rows?
            .iter()
            .map(|row| {
                Ok(KeypointRow {
                    id: row
                        .try_get("id")
                        .map_err(|e| BackupError::Export(format!("Bad 'id' column: {}", e)))?,
                    image_id: row.try_get("image_id").map_err(|e| {
                        BackupError::Export(format!("Bad 'image_id' column: {}", e))
                    })?,
                    keypoints: row.try_get("keypoints").map_err(|e| {
                        BackupError::Export(format!("Bad 'keypoints' column: {}", e))
                    })?,
                    created_at: row.try_get("created_at").map_err(|e| {
                        BackupError::Export(format!("Bad 'created_at' column: {}", e))
                    })?,
                    updated_at: row.try_get("updated_at").map_err(|e| {
                        BackupError::Export(format!("Bad 'updated_at' column: {}", e))
                    })?,
                })
            })
            .collect()
    }
}

fn script_header(now: DateTime<Utc>) -> String {
    format!(
        "-- PostgreSQL Database Backup\n-- Generated: {}\n\n",
        now.to_rfc3339()
    )
}

/// Quotes a string for use as a SQL literal.
///
/// Values without quote or backslash characters use plain single quotes.
/// Anything else is dollar-quoted with a tag verified absent from the value,
/// so payload content cannot break out of the literal.
pub(crate) fn quote_literal(value: &str) -> String {
    if !value.contains('\'') && !value.contains('\\') {
        return format!("'{}'", value);
    }
    let mut tag = "$q$".to_string();
    let mut n = 0u32;
    while value.contains(&tag) {
        n += 1;
        tag = format!("$q{}$", n);
    }
    format!("{tag}{value}{tag}")
}

fn insert_statement(
    id: i32,
    image_id: &str,
    keypoints: &serde_json::Value,
    created_at: NaiveDateTime,
    updated_at: NaiveDateTime,
) -> String {
    format!(
        "INSERT INTO keypoints (id, image_id, keypoints, created_at, updated_at) \
         VALUES ({}, {}, {}::jsonb, '{}', '{}');",
        id,
        quote_literal(image_id),
        quote_literal(&keypoints.to_string()),
        created_at.format("%Y-%m-%d %H:%M:%S%.f"),
        updated_at.format("%Y-%m-%d %H:%M:%S%.f"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::command::{CommandOutput, CommandRunner};
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeRunner {
        exit_code: i32,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            _program: &Path,
            _args: &[String],
            _envs: &[(String, String)],
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            Ok(CommandOutput {
                status_code: Some(self.exit_code),
                stdout: Vec::new(),
                stderr: b"simulated".to_vec(),
            })
        }
    }

    struct FakeRows(Vec<KeypointRow>);

    #[async_trait]
    impl RowSource for FakeRows {
        async fn fetch_keypoints(&self) -> Result<Vec<KeypointRow>> {
            Ok(self.0.clone())
        }
    }

    struct UnreachableRows;

    #[async_trait]
    impl RowSource for UnreachableRows {
        async fn fetch_keypoints(&self) -> Result<Vec<KeypointRow>> {
            Err(BackupError::Connection(
                "connection refused (simulated)".to_string(),
            ))
        }
    }

    fn test_pg_config() -> PostgresConfig {
        PostgresConfig {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: None,
            database: "keypoints_db".to_string(),
            dump_path: Some(PathBuf::from("/usr/bin/pg_dump")),
            dump_timeout: Duration::from_secs(5),
        }
    }

    fn exporter(exit_code: i32) -> PgExporter {
        PgExporter::new(test_pg_config(), Arc::new(FakeRunner { exit_code }))
    }

    fn exporter_with_rows(exit_code: i32, rows: Arc<dyn RowSource>) -> PgExporter {
        PgExporter::with_row_source(test_pg_config(), Arc::new(FakeRunner { exit_code }), rows)
    }

    fn sample_row() -> KeypointRow {
        let ts = NaiveDateTime::parse_from_str("2024-06-01 12:30:00", "%Y-%m-%d %H:%M:%S")
            .expect("parse timestamp");
        KeypointRow {
            id: 7,
            image_id: "img-1".to_string(),
            keypoints: serde_json::json!({"points": [1, 2]}),
            created_at: ts,
            updated_at: ts,
        }
    }

    #[tokio::test]
    async fn test_primary_strategy_rejects_nonzero_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("out.sql");
        let result = exporter(1).dump_with_pg_dump(&dest).await;

        assert!(matches!(result, Err(BackupError::Command { .. })));
        assert!(!dest.exists(), "failed attempt must not leave output behind");
    }

    #[tokio::test]
    async fn test_primary_strategy_finalizes_on_success() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.sql");
        exporter(0).dump_with_pg_dump(&dest).await?;
        assert!(dest.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_export_falls_back_when_primary_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.sql");
        let exporter = exporter_with_rows(1, Arc::new(FakeRows(vec![sample_row()])));

        exporter.export(&dest).await?;

        let script = std::fs::read_to_string(&dest)?;
        assert!(script.contains("CREATE TABLE keypoints"));
        assert!(script.contains("VALUES (7, 'img-1'"));
        Ok(())
    }

    #[tokio::test]
    async fn test_export_reports_both_failures() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dest = dir.path().join("out.sql");
        let exporter = exporter_with_rows(1, Arc::new(UnreachableRows));

        let err = exporter.export(&dest).await.expect_err("both strategies fail");
        match err {
            BackupError::Export(message) => {
                assert!(message.contains("both export strategies failed"));
                assert!(message.contains("exit code 1"));
                assert!(message.contains("connection refused (simulated)"));
            }
            other => panic!("expected Export error, got {other:?}"),
        }
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_export_skips_fallback_when_primary_succeeds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dest = dir.path().join("out.sql");
        let exporter = exporter_with_rows(0, Arc::new(UnreachableRows));

        exporter.export(&dest).await?;
        assert!(dest.exists());
        Ok(())
    }

    #[test]
    fn test_quote_literal_plain() {
        assert_eq!(quote_literal("abc-123"), "'abc-123'");
    }

    #[test]
    fn test_quote_literal_dollar_quotes_awkward_content() {
        assert_eq!(quote_literal("it's"), "$q$it's$q$");
        assert_eq!(quote_literal(r"back\slash"), r"$q$back\slash$q$");
    }

    #[test]
    fn test_quote_literal_avoids_tag_collision() {
        let quoted = quote_literal("payload with $q$ inside'");
        assert_eq!(quoted, "$q1$payload with $q$ inside'$q1$");
    }

    #[test]
    fn test_insert_statement_shape() {
        let ts = NaiveDateTime::parse_from_str("2024-06-01 12:30:00", "%Y-%m-%d %H:%M:%S")
            .expect("parse timestamp");
        let keypoints = serde_json::json!({"points": [1, 2]});
        let stmt = insert_statement(7, "img-1", &keypoints, ts, ts);
        assert_eq!(
            stmt,
            "INSERT INTO keypoints (id, image_id, keypoints, created_at, updated_at) \
             VALUES (7, 'img-1', '{\"points\":[1,2]}'::jsonb, \
             '2024-06-01 12:30:00', '2024-06-01 12:30:00');"
        );
    }

    #[test]
    fn test_schema_script_is_self_contained() {
        assert!(TABLE_SCHEMA_SQL.contains("DROP TABLE IF EXISTS keypoints CASCADE;"));
        assert!(TABLE_SCHEMA_SQL.contains("CREATE TABLE keypoints"));
        assert!(TABLE_SCHEMA_SQL.contains("idx_image_id"));
        assert!(TABLE_SCHEMA_SQL.contains("idx_created_at"));
    }
}
