// backuptool/src/service.rs
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tracing::{error, info};

use crate::backup::{BackupRun, Orchestrator};
use crate::config::Config;
use crate::errors::{BackupError, Result};
use crate::notify::{DeliveryOutcome, Notifier};
use crate::retention;
use crate::scheduler::{JobSpec, JobStatus, Scheduler};
use crate::utils::command::{CommandRunner, SystemRunner};
use crate::utils::singleflight::SingleFlight;

pub const DAILY_BACKUP_JOB: &str = "daily-backup";
pub const CLEANUP_JOB: &str = "backup-cleanup";

/// Daily backup at 23:59, weekly cleanup on Sunday at 02:00.
pub const DAILY_BACKUP_CRON: &str = "59 23 * * *";
pub const CLEANUP_CRON: &str = "0 2 * * 0";

/// Result of an on-demand backup trigger: the backup run plus the delivery
/// outcome. `email.delivered == false` never implies the backup failed.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    pub backup: BackupRun,
    pub email: Option<DeliveryOutcome>,
}

/// Single entry point for backup operations, used identically by the
/// scheduler's ticks and by on-demand callers.
///
/// Backup and retention cleanup both mutate the backup directory, so both
/// paths take the same single-flight lock keyed by that directory; an
/// overlapping trigger is rejected with [`BackupError::Busy`].
pub struct BackupService {
    config: Config,
    orchestrator: Orchestrator,
    notifier: Notifier,
    flight: SingleFlight,
    scheduler: Mutex<Weak<Scheduler>>,
}

impl BackupService {
    pub fn new(config: Config) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        let orchestrator = Orchestrator::new(&config, runner);
        let notifier = Notifier::new(config.email.clone());
        Self {
            config,
            orchestrator,
            notifier,
            flight: SingleFlight::new(),
            scheduler: Mutex::new(Weak::new()),
        }
    }

    /// Builds the scheduler for this service's production jobs and remembers
    /// it, so [`status`](Self::status) can report on it for as long as the
    /// caller keeps it alive.
    pub fn scheduler(self: &Arc<Self>) -> Arc<Scheduler> {
        let scheduler = Arc::new(Scheduler::new(scheduled_jobs(self.clone())));
        *self.scheduler.lock().expect("scheduler slot poisoned") = Arc::downgrade(&scheduler);
        scheduler
    }

    /// Reports the registered scheduled jobs and whether each is running.
    /// Empty when no scheduler has been built or it has been dropped.
    pub fn status(&self) -> Vec<JobStatus> {
        self.scheduler
            .lock()
            .expect("scheduler slot poisoned")
            .upgrade()
            .map(|scheduler| scheduler.status())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn directory_key(&self) -> String {
        self.config.backup_dir.display().to_string()
    }

    /// Performs a full backup run and then attempts email delivery.
    ///
    /// A delivery failure is folded into the outcome and logged; only an
    /// export or archive failure makes this return an error.
    pub async fn trigger_backup(&self) -> Result<TriggerOutcome> {
        let _guard = self.flight.try_acquire(&self.directory_key()).ok_or_else(|| {
            BackupError::Busy(format!(
                "a backup or cleanup is already running against {}",
                self.config.backup_dir.display()
            ))
        })?;

        let backup = self.orchestrator.perform_backup().await?;
        let email = match self.notifier.deliver(&backup.zip_path, &backup.date).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(error = %e, "Backup completed but email notification failed");
                Some(DeliveryOutcome::skipped(e.to_string()))
            }
        };

        Ok(TriggerOutcome { backup, email })
    }

    /// Deletes backup artifacts older than the configured retention window.
    pub async fn run_cleanup(&self) -> Result<usize> {
        let _guard = self.flight.try_acquire(&self.directory_key()).ok_or_else(|| {
            BackupError::Busy(format!(
                "a backup or cleanup is already running against {}",
                self.config.backup_dir.display()
            ))
        })?;

        retention::clean(&self.config.backup_dir, self.config.retention_window)
    }

    pub async fn test_email(&self) -> Result<DeliveryOutcome> {
        self.notifier.test_deliver().await
    }
}

/// Builds the two production job specs wired to a shared service: the daily
/// backup (with notification) and the weekly retention cleanup.
pub fn scheduled_jobs(service: Arc<BackupService>) -> Vec<JobSpec> {
    let timezone = service.config.timezone;

    let backup_service = service.clone();
    let daily = JobSpec {
        name: DAILY_BACKUP_JOB.to_string(),
        expression: DAILY_BACKUP_CRON.to_string(),
        timezone,
        callback: Arc::new(move || {
            let service = backup_service.clone();
            Box::pin(async move {
                match service.trigger_backup().await {
                    Ok(outcome) => info!(
                        archive = %outcome.backup.zip_path.display(),
                        delivered = outcome.email.as_ref().map(|e| e.delivered).unwrap_or(false),
                        "Scheduled backup completed"
                    ),
                    Err(e) => error!(error = %e, "Scheduled backup failed"),
                }
            })
        }),
    };

    let cleanup_service = service;
    let weekly = JobSpec {
        name: CLEANUP_JOB.to_string(),
        expression: CLEANUP_CRON.to_string(),
        timezone,
        callback: Arc::new(move || {
            let service = cleanup_service.clone();
            Box::pin(async move {
                match service.run_cleanup().await {
                    Ok(removed) => info!(removed, "Scheduled backup cleanup completed"),
                    Err(e) => error!(error = %e, "Scheduled backup cleanup failed"),
                }
            })
        }),
    };

    vec![daily, weekly]
}
