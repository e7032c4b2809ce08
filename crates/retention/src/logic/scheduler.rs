use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use shared::error::CommonError;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use crate::logic::lifecycle::DeletionLifecycle;
use crate::repository::RetentionRepositoryLike;

/// Handle for nudging the cleanup loop outside its daily schedule.
#[derive(Clone)]
pub struct CleanupScheduler {
    trigger_tx: mpsc::Sender<()>,
}

impl CleanupScheduler {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        // Capacity 1: a pending trigger already covers any further requests
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        (Self { trigger_tx }, trigger_rx)
    }

    pub fn trigger_now(&self) -> Result<(), CommonError> {
        use tokio::sync::mpsc::error::TrySendError;
        match self.trigger_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => Ok(()),
            Err(e @ TrySendError::Closed(())) => Err(CommonError::TokioChannelError {
                source: Box::new(e),
            }),
        }
    }
}

fn next_run_at(now: DateTime<Utc>, run_hour_utc: u32) -> Result<DateTime<Utc>, CommonError> {
    if run_hour_utc > 23 {
        return Err(CommonError::Validation {
            msg: format!("run hour must be in [0, 23], got {run_hour_utc}"),
            source: None,
        });
    }
    let candidate = now
        .date_naive()
        .and_hms_opt(run_hour_utc, 0, 0)
        .ok_or_else(|| CommonError::Validation {
            msg: format!("invalid run hour: {run_hour_utc}"),
            source: None,
        })?
        .and_utc();
    if candidate <= now {
        Ok(candidate + Duration::days(1))
    } else {
        Ok(candidate)
    }
}

/// Daily cleanup loop. Wakes at `run_hour_utc`, on an explicit trigger, or
/// on shutdown; an in-flight pass always runs to completion before the
/// select is re-entered. Pass failures are logged and the loop keeps going.
pub async fn cleanup_scheduler_task<R>(
    lifecycle: Arc<DeletionLifecycle<R>>,
    run_hour_utc: u32,
    mut trigger_rx: mpsc::Receiver<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), CommonError>
where
    R: RetentionRepositoryLike + Send + Sync,
{
    loop {
        let now = Utc::now();
        let next = next_run_at(now, run_hour_utc)?;
        let until_next = (next - now).to_std().unwrap_or(std::time::Duration::ZERO);

        tokio::select! {
            _ = tokio::time::sleep(until_next) => {
                run_pass(&lifecycle).await;
            }
            received = trigger_rx.recv() => {
                match received {
                    Some(()) => run_pass(&lifecycle).await,
                    None => {
                        info!("cleanup trigger channel closed, stopping scheduler");
                        return Ok(());
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("cleanup scheduler shutting down");
                return Ok(());
            }
        }
    }
}

async fn run_pass<R: RetentionRepositoryLike>(lifecycle: &DeletionLifecycle<R>) {
    match lifecycle.run_cleanup_pass(Utc::now()).await {
        Ok(report) => info!(
            notified = report.notified,
            hard_deleted = report.hard_deleted,
            "cleanup pass complete"
        ),
        Err(e) => error!(error = ?e, "cleanup pass failed"),
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use std::sync::Arc;

    use audit::channel::RecordingChannel;
    use audit::AuditPublisher;
    use chrono::{Duration, TimeZone, Utc};
    use field_cipher::{FieldCipher, LocalKeyService};
    use shared::primitives::{SqlMigrationLoader, WrappedChronoDateTime};
    use shared::test_utils::setup_in_memory_database;
    use tokio::sync::broadcast;

    use super::{CleanupScheduler, cleanup_scheduler_task, next_run_at};
    use crate::logic::lifecycle::{DeletionLifecycle, LifecycleSettings, LogNoticeSender};
    use crate::repository::{Repository, RetentionRepositoryLike};

    async fn setup_lifecycle() -> (
        tempfile::TempDir,
        libsql::Database,
        Repository,
        Arc<DeletionLifecycle<Repository>>,
    ) {
        let (db, conn) = setup_in_memory_database(vec![
            Repository::load_sql_migrations(),
            audit::repository::Repository::load_sql_migrations(),
        ])
        .await
        .unwrap();

        let key_dir = tempfile::TempDir::new().unwrap();
        let key_service =
            LocalKeyService::get_or_create(&key_dir.path().join("field.key"), "test-key").unwrap();
        let cipher =
            Arc::new(FieldCipher::new(Arc::new(key_service), b"search-secret".to_vec()).unwrap());

        let repository = Repository::new(conn);
        let lifecycle = DeletionLifecycle::new(
            repository.clone(),
            cipher,
            AuditPublisher::new(Arc::new(RecordingChannel::new()), "scheduler-test"),
            Arc::new(LogNoticeSender),
            LifecycleSettings::default(),
        )
        .unwrap();

        (key_dir, db, repository, Arc::new(lifecycle))
    }

    #[test]
    fn test_next_run_at_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let later_today = next_run_at(now, 15).unwrap();
        assert_eq!(later_today, Utc.with_ymd_and_hms(2025, 6, 1, 15, 0, 0).unwrap());

        let tomorrow = next_run_at(now, 3).unwrap();
        assert_eq!(tomorrow, Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap());

        assert!(next_run_at(now, 24).is_err());
    }

    #[tokio::test]
    async fn test_trigger_now_runs_cleanup_pass() {
        shared::setup_test!();
        let (_key_dir, _db, repository, lifecycle) = setup_lifecycle().await;

        let subject = lifecycle
            .register_subject("tenant-1", "old@example.com", None)
            .await
            .unwrap();
        repository
            .mark_subject_deleted(
                &subject.id,
                WrappedChronoDateTime::new(Utc::now() - Duration::days(91)),
            )
            .await
            .unwrap();

        let (scheduler, trigger_rx) = CleanupScheduler::channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(cleanup_scheduler_task(lifecycle, 3, trigger_rx, shutdown_rx));

        scheduler.trigger_now().unwrap();

        // Poll until the pass has run
        let mut deleted = false;
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if repository
                .get_subject_by_id(&subject.id)
                .await
                .unwrap()
                .is_none()
            {
                deleted = true;
                break;
            }
        }
        assert!(deleted, "triggered pass should hard-delete the subject");

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("scheduler should stop on shutdown")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_stops_when_trigger_handle_dropped() {
        shared::setup_test!();
        let (_key_dir, _db, _repository, lifecycle) = setup_lifecycle().await;

        let (scheduler, trigger_rx) = CleanupScheduler::channel();
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(cleanup_scheduler_task(lifecycle, 3, trigger_rx, shutdown_rx));

        drop(scheduler);
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("scheduler should stop when all triggers are gone")
            .unwrap()
            .unwrap();

        // A dropped receiver surfaces as an error on the handle side too
        let (scheduler, trigger_rx) = CleanupScheduler::channel();
        drop(trigger_rx);
        assert!(scheduler.trigger_now().is_err());
    }
}
