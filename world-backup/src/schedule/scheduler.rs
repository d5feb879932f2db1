use super::cron::Schedule;
use crate::executor::{BackupManager, BackupOutcome};
use chrono::{Local, NaiveDateTime};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Polls the configured cron schedule and starts scheduled backups
pub struct BackupScheduler {
    scheduler: tokio::sync::Mutex<JobScheduler>,
    manager: Arc<BackupManager>,
    schedule: Arc<Mutex<Schedule>>,
}

impl BackupScheduler {
    pub async fn new(manager: Arc<BackupManager>) -> anyhow::Result<Self> {
        let expression = manager.config().backup.schedule.clone();
        let schedule = Schedule::configure(&expression, Local::now().naive_local())?;
        tracing::info!(
            cron = %schedule.expression(),
            next = %schedule.next_fire(),
            "Configured the backup schedule"
        );

        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: tokio::sync::Mutex::new(scheduler),
            manager,
            schedule: Arc::new(Mutex::new(schedule)),
        })
    }

    /// Register the repeating poll job
    pub async fn init_schedule(&self) -> anyhow::Result<()> {
        let interval = Duration::from_secs(self.manager.config().backup.poll_interval_secs);
        let manager = self.manager.clone();
        let schedule = self.schedule.clone();

        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let manager = manager.clone();
            let schedule = schedule.clone();
            Box::pin(async move {
                poll_schedule(&manager, &schedule, Local::now().naive_local());
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(interval_secs = interval.as_secs(), "Schedule poll job added");
        Ok(())
    }

    /// Check the schedule once at `now`, starting a backup if it is due
    pub fn tick(&self, now: NaiveDateTime) -> Option<JoinHandle<BackupOutcome>> {
        poll_schedule(&self.manager, &self.schedule, now)
    }

    pub fn next_fire(&self) -> NaiveDateTime {
        self.schedule.lock().unwrap_or_else(|e| e.into_inner()).next_fire()
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

fn poll_schedule(
    manager: &Arc<BackupManager>,
    schedule: &Mutex<Schedule>,
    now: NaiveDateTime,
) -> Option<JoinHandle<BackupOutcome>> {
    let due = {
        let mut schedule = schedule.lock().unwrap_or_else(|e| e.into_inner());
        let due = schedule.poll(now);
        if due {
            tracing::debug!(next = %schedule.next_fire(), "Schedule fired");
        }
        due
    };
    if !due {
        return None;
    }

    let upload = manager.config().backup.upload_scheduled;
    Some(manager.trigger_backup(upload, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::directory::DirectoryHost;
    use tempfile::TempDir;

    fn scheduled_manager(root: &std::path::Path, cron: &str) -> Arc<BackupManager> {
        let mut config = Config::default();
        config.server.root = root.to_path_buf();
        config.backup.schedule = cron.to_string();
        let host = Arc::new(DirectoryHost::from_config(&config.server).unwrap());
        Arc::new(BackupManager::new(host, config))
    }

    #[tokio::test]
    async fn test_tick_runs_backup_only_when_due() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(temp_dir.path().join("server.properties"), b"motd=hi")?;
        let scheduler = BackupScheduler::new(scheduled_manager(temp_dir.path(), "* * * * *")).await?;

        let next = scheduler.next_fire();
        assert!(scheduler.tick(next - chrono::Duration::seconds(1)).is_none());

        let handle = scheduler.tick(next).expect("backup should start when due");
        assert!(matches!(handle.await?, BackupOutcome::Completed { .. }));
        assert_eq!(scheduler.next_fire(), next + chrono::Duration::minutes(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_rejected() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let result = BackupScheduler::new(scheduled_manager(temp_dir.path(), "0 0 30 2 *")).await;
        assert!(result.is_err());
        Ok(())
    }
}
