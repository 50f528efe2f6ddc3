// backuptool/src/scheduler/mod.rs
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::{BackupError, Result};

pub type JobCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A named recurring job: a cron expression evaluated in a timezone, and the
/// callback fired once per scheduled tick.
#[derive(Clone)]
pub struct JobSpec {
    pub name: String,
    pub expression: String,
    pub timezone: Tz,
    pub callback: JobCallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub running: bool,
}

struct RegisteredJob {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fires named cron jobs on a shared tokio runtime.
///
/// Each registered job runs in its own task, so a slow tick on one job never
/// delays the others. A failed tick is the callback's problem to log; the
/// next tick proceeds independently.
pub struct Scheduler {
    jobs: Vec<JobSpec>,
    registered: Mutex<Vec<RegisteredJob>>,
}

impl Scheduler {
    pub fn new(jobs: Vec<JobSpec>) -> Self {
        Self {
            jobs,
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Registers every job and starts its timer task. All expressions are
    /// validated before anything spawns. Calling `start` again without an
    /// intervening `stop` is rejected.
    pub fn start(&self) -> Result<()> {
        let mut registered = self.registered.lock().expect("scheduler registry poisoned");
        if !registered.is_empty() {
            return Err(BackupError::Busy("scheduler already started".to_string()));
        }

        let mut parsed = Vec::with_capacity(self.jobs.len());
        for spec in &self.jobs {
            parsed.push((spec.clone(), parse_cron(&spec.expression)?));
        }

        for (spec, schedule) in parsed {
            let token = CancellationToken::new();
            let handle = tokio::spawn(run_job(
                spec.name.clone(),
                schedule,
                spec.timezone,
                spec.callback,
                token.clone(),
            ));
            info!(
                job = %spec.name,
                expression = %spec.expression,
                timezone = %spec.timezone,
                "Scheduled job registered"
            );
            registered.push(RegisteredJob {
                name: spec.name,
                token,
                handle,
            });
        }
        Ok(())
    }

    /// Stops all registered jobs and clears the registry.
    pub fn stop(&self) {
        let mut registered = self.registered.lock().expect("scheduler registry poisoned");
        for job in registered.drain(..) {
            job.token.cancel();
            job.handle.abort();
            info!(job = %job.name, "Stopped scheduled job");
        }
    }

    /// Reports `{name, running}` for each registered job; empty before
    /// `start` and after `stop`.
    pub fn status(&self) -> Vec<JobStatus> {
        let registered = self.registered.lock().expect("scheduler registry poisoned");
        registered
            .iter()
            .map(|job| JobStatus {
                name: job.name.clone(),
                running: !job.token.is_cancelled(),
            })
            .collect()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_job(
    name: String,
    schedule: Schedule,
    timezone: Tz,
    callback: JobCallback,
    token: CancellationToken,
) {
    loop {
        let now = Utc::now().with_timezone(&timezone);
        let Some(next) = schedule.upcoming(timezone).next() else {
            error!(job = %name, "Cron expression yields no further fire times");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                info!(job = %name, "Scheduled tick firing");
                callback().await;
            }
        }
    }
}

/// Parses a five-field Unix cron expression (minute granularity, day-of-week
/// 0 = Sunday) into the `cron` crate's schedule type, which expects a seconds
/// field and numbers days of the week differently. Expressions that already
/// carry a seconds field pass through unchanged.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let full = if fields.len() == 5 {
        format!(
            "0 {} {} {} {} {}",
            fields[0],
            fields[1],
            fields[2],
            fields[3],
            normalize_dow(fields[4])
        )
    } else {
        fields.join(" ")
    };
    Schedule::from_str(&full)
        .map_err(|e| BackupError::Config(format!("Invalid cron expression '{}': {}", expression, e)))
}

/// Rewrites numeric day-of-week ordinals from the Unix convention (0-7 with
/// both 0 and 7 meaning Sunday) to unambiguous day names, since numeric
/// conventions differ between cron dialects. Names, wildcards, and step
/// denominators are left untouched.
fn normalize_dow(field: &str) -> String {
    const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let mapped = range
                .split('-')
                .map(|bound| match bound.parse::<usize>() {
                    Ok(n) if n <= 7 => DAY_NAMES[n % 7].to_string(),
                    _ => bound.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{}/{}", mapped, step),
                None => mapped,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
