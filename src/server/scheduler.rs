//! Deferred jobs. Each job owns a timer task; whoever removes the job from
//! the table first (the timer or `cancel`) decides its fate, so a job fires
//! at most once and never after a successful cancel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use sqlx::Row;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::common::error::Result;
use crate::common::models::{ScheduledNotification, UserId};
use crate::server::database::Database;

pub const NOTIFICATION_JOB: &str = "scheduled_notification";

#[async_trait]
pub trait JobScheduler: Send + Sync {
    async fn schedule(&self, job_type: &str, job: ScheduledNotification) -> Result<String>;
    async fn cancel(&self, job_type: &str, id: &str) -> Result<bool>;
    async fn list(&self, job_type: &str, user_id: Option<UserId>) -> Result<Vec<ScheduledNotification>>;
}

struct ArmedJob {
    job_type: String,
    job: ScheduledNotification,
    cancel: CancellationToken,
}

/// In-process scheduler; jobs that come due are handed out on a channel.
pub struct LocalScheduler {
    jobs: Arc<DashMap<String, ArmedJob>>,
    due_tx: UnboundedSender<ScheduledNotification>,
    db: Option<Arc<Database>>,
}

impl LocalScheduler {
    /// `db` makes jobs survive restarts via [`LocalScheduler::restore`].
    pub fn new(db: Option<Arc<Database>>) -> (Self, UnboundedReceiver<ScheduledNotification>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let scheduler = Self { jobs: Arc::new(DashMap::new()), due_tx, db };
        (scheduler, due_rx)
    }

    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    fn arm(&self, job_type: &str, job: ScheduledNotification) {
        let id = job.id.clone();
        let cancel = CancellationToken::new();
        let delay = (job.deliver_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.jobs.insert(
            id.clone(),
            ArmedJob { job_type: job_type.to_string(), job, cancel: cancel.clone() },
        );

        let jobs = self.jobs.clone();
        let due_tx = self.due_tx.clone();
        let db = self.db.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some((_, armed)) = jobs.remove(&id) else { return };
            if let Some(db) = db {
                if let Err(e) = delete_row(&db, &id).await {
                    warn!("[SCHED] Could not remove fired job {}: {}", id, e);
                }
            }
            debug!("[SCHED] Job {} ({}) is due", id, armed.job_type);
            if due_tx.send(armed.job).is_err() {
                warn!("[SCHED] Job {} fired but nobody is listening", id);
            }
        });
    }

    /// Re-arms persisted jobs. Jobs already past their time fire right away.
    pub async fn restore(&self) -> Result<usize> {
        let Some(db) = &self.db else { return Ok(0) };
        let rows = sqlx::query("SELECT id, job_type, job FROM scheduled_notifications")
            .fetch_all(&db.pool)
            .await?;

        let mut restored = 0;
        for row in rows {
            let id: String = row.get("id");
            if self.jobs.contains_key(&id) {
                continue;
            }
            let job_type: String = row.get("job_type");
            match serde_json::from_str::<ScheduledNotification>(row.get("job")) {
                Ok(job) => {
                    self.arm(&job_type, job);
                    restored += 1;
                }
                Err(e) => warn!("[SCHED] Dropping unreadable job {}: {}", id, e),
            }
        }
        if restored > 0 {
            info!("[SCHED] Restored {} scheduled jobs", restored);
        }
        Ok(restored)
    }
}

async fn delete_row(db: &Database, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM scheduled_notifications WHERE id = ?")
        .bind(id)
        .execute(&db.pool)
        .await?;
    Ok(())
}

#[async_trait]
impl JobScheduler for LocalScheduler {
    async fn schedule(&self, job_type: &str, job: ScheduledNotification) -> Result<String> {
        if let Some(db) = &self.db {
            sqlx::query("INSERT INTO scheduled_notifications (id, job_type, job, deliver_at) VALUES (?, ?, ?, ?)")
                .bind(&job.id)
                .bind(job_type)
                .bind(serde_json::to_string(&job)?)
                .bind(job.deliver_at.timestamp_millis())
                .execute(&db.pool)
                .await?;
        }
        let id = job.id.clone();
        info!("[SCHED] Scheduled job {} for {}", id, job.deliver_at);
        self.arm(job_type, job);
        Ok(id)
    }

    async fn cancel(&self, job_type: &str, id: &str) -> Result<bool> {
        let Some((_, armed)) = self.jobs.remove_if(id, |_, armed| armed.job_type == job_type) else {
            return Ok(false);
        };
        armed.cancel.cancel();
        if let Some(db) = &self.db {
            delete_row(db, id).await?;
        }
        info!("[SCHED] Cancelled job {}", id);
        Ok(true)
    }

    async fn list(&self, job_type: &str, user_id: Option<UserId>) -> Result<Vec<ScheduledNotification>> {
        let mut jobs: Vec<ScheduledNotification> = self
            .jobs
            .iter()
            .filter(|entry| entry.job_type == job_type)
            .filter(|entry| user_id.map_or(true, |user| entry.job.targets(user)))
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.deliver_at);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn job(in_secs: i64, users: Vec<UserId>) -> ScheduledNotification {
        let now = Utc::now();
        ScheduledNotification {
            id: Uuid::new_v4().to_string(),
            user_ids: users,
            title: "Reminder".into(),
            body: "Timesheet due".into(),
            category: "reminder".into(),
            payload: None,
            deliver_at: now + chrono::Duration::seconds(in_secs),
            created_at: now,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn job_fires_once_when_due() {
        let (scheduler, mut due) = LocalScheduler::new(None);
        let id = scheduler.schedule(NOTIFICATION_JOB, job(30, vec![1])).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        let fired = due.recv().await.unwrap();
        assert_eq!(fired.id, id);
        assert_eq!(scheduler.pending(), 0);
        assert!(!scheduler.cancel(NOTIFICATION_JOB, &id).await.unwrap());
        assert!(due.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_job_never_fires() {
        let (scheduler, mut due) = LocalScheduler::new(None);
        let id = scheduler.schedule(NOTIFICATION_JOB, job(30, vec![1])).await.unwrap();

        assert!(!scheduler.cancel("other_type", &id).await.unwrap());
        assert!(scheduler.cancel(NOTIFICATION_JOB, &id).await.unwrap());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(due.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn list_filters_by_user_and_orders_by_time() {
        let (scheduler, _due) = LocalScheduler::new(None);
        let late = scheduler.schedule(NOTIFICATION_JOB, job(300, vec![1, 2])).await.unwrap();
        let early = scheduler.schedule(NOTIFICATION_JOB, job(100, vec![1])).await.unwrap();
        scheduler.schedule(NOTIFICATION_JOB, job(200, vec![3])).await.unwrap();

        let for_one: Vec<String> = scheduler
            .list(NOTIFICATION_JOB, Some(1))
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(for_one, vec![early, late]);
        assert_eq!(scheduler.list(NOTIFICATION_JOB, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn persisted_jobs_are_restored() {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        let (first, _due) = LocalScheduler::new(Some(db.clone()));
        let overdue = job(-5, vec![4]);
        let id = first.schedule(NOTIFICATION_JOB, job(3600, vec![4])).await.unwrap();
        sqlx::query("INSERT INTO scheduled_notifications (id, job_type, job, deliver_at) VALUES (?, ?, ?, ?)")
            .bind(&overdue.id)
            .bind(NOTIFICATION_JOB)
            .bind(serde_json::to_string(&overdue).unwrap())
            .bind(overdue.deliver_at.timestamp_millis())
            .execute(&db.pool)
            .await
            .unwrap();

        let (second, mut due) = LocalScheduler::new(Some(db));
        assert_eq!(second.restore().await.unwrap(), 2);
        let fired = tokio::time::timeout(Duration::from_secs(5), due.recv()).await.unwrap().unwrap();
        assert_eq!(fired.id, overdue.id);
        assert!(second.list(NOTIFICATION_JOB, Some(4)).await.unwrap().iter().any(|j| j.id == id));
    }
}
