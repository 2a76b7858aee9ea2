// housekeeper/src/scheduler/mod.rs
use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backup::BackupService;
use crate::errors::Result;

/// Runs backups on the configured cron schedule, one at a time. A fire that
/// finds a run in progress is skipped.
pub struct BackupScheduler {
    scheduler: JobScheduler,
    /// Held for the duration of every run.
    run_lock: Arc<Mutex<()>>,
    /// Set once `stop` was called; fires after that do nothing.
    stopping: Arc<AtomicBool>,
}

impl BackupScheduler {
    /// Registers the backup job (unless backups are disabled or the schedule is
    /// empty) and starts ticking.
    pub async fn start(service: BackupService) -> Result<Self> {
        let mut scheduler = JobScheduler::new().await?;
        let run_lock = Arc::new(Mutex::new(()));
        let stopping = Arc::new(AtomicBool::new(false));

        let schedule = service.config().schedule.trim().to_string();
        let mut job_id = None;
        if service.is_enabled() && !schedule.is_empty() {
            let expression = normalize_schedule(&schedule);
            let job_lock = Arc::clone(&run_lock);
            let job_stopping = Arc::clone(&stopping);
            let job = Job::new_async_tz(expression.as_str(), Local, move |uuid, mut scheduler| {
                let service = service.clone();
                let run_lock = Arc::clone(&job_lock);
                let stopping = Arc::clone(&job_stopping);
                Box::pin(async move {
                    let Ok(guard) = run_lock.try_lock() else {
                        warn!("Skipping scheduled backup: previous run still in progress");
                        return;
                    };
                    // checked under the lock so stop never misses a run that got in first
                    if stopping.load(Ordering::SeqCst) {
                        debug!("Skipping scheduled backup: scheduler is stopping");
                        return;
                    }
                    info!("Starting scheduled backup");
                    if let Err(e) = service.backup().await {
                        error!(error = %format!("{:#}", e), "Backup failed");
                    }
                    drop(guard);
                    log_next_run(&mut scheduler, uuid).await;
                })
            })?;
            job_id = Some(scheduler.add(job).await?);
            info!(schedule = %expression, "Backup schedule registered");
        } else {
            info!("Backup schedule disabled");
        }

        scheduler.start().await?;
        if let Some(id) = job_id {
            log_next_run(&mut scheduler, id).await;
        }

        Ok(Self {
            scheduler,
            run_lock,
            stopping,
        })
    }

    /// Stops firing and waits up to `timeout` for a running backup. A run that
    /// outlives the timeout is abandoned, not cancelled.
    pub async fn stop(mut self, timeout: Duration) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.scheduler.shutdown().await?;
        match tokio::time::timeout(timeout, self.run_lock.lock()).await {
            Ok(_idle) => info!("Backup schedule stopped"),
            Err(_) => warn!(?timeout, "Backup still running at shutdown, not waiting any longer"),
        }
        Ok(())
    }
}

/// Five-field cron expressions get a leading seconds field; everything else
/// (six fields, `@daily` and friends) is used as is.
fn normalize_schedule(schedule: &str) -> String {
    let schedule = schedule.trim();
    if !schedule.starts_with('@') && schedule.split_whitespace().count() == 5 {
        format!("0 {}", schedule)
    } else {
        schedule.to_string()
    }
}

async fn log_next_run(scheduler: &mut JobScheduler, job: Uuid) {
    match scheduler.next_tick_for_job(job).await {
        Ok(Some(next)) => info!(next = %next.with_timezone(&Local), "Next backup"),
        Ok(None) => debug!("No further backup scheduled"),
        Err(e) => warn!(error = %e, "Could not determine next backup time"),
    }
}
