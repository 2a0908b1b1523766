use crate::errors::TrellisError;
use crate::storage;
use sea_orm::DatabaseConnection;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Initialize and start the job scheduler with all background tasks
pub async fn init_scheduler(db: DatabaseConnection) -> Result<JobScheduler, TrellisError> {
    let sched = JobScheduler::new()
        .await
        .map_err(|e| TrellisError::Other(format!("Failed to create job scheduler: {}", e)))?;

    let db_clone = db.clone();

    // Cleanup expired sessions job - runs every hour
    let cleanup_sessions_job = Job::new_async("0 0 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        Box::pin(async move {
            info!("Running cleanup_expired_sessions job");
            match storage::cleanup_expired_sessions(&db).await {
                Ok(count) => info!("Cleaned up {} expired sessions", count),
                Err(e) => error!("Failed to cleanup expired sessions: {}", e),
            }
        })
    })
    .map_err(|e| TrellisError::Other(format!("Failed to create cleanup sessions job: {}", e)))?;

    sched
        .add(cleanup_sessions_job)
        .await
        .map_err(|e| TrellisError::Other(format!("Failed to add cleanup sessions job: {}", e)))?;

    let db_clone = db.clone();

    // Cleanup expired device logins job - runs every hour at 30 minutes past
    let cleanup_device_logins_job = Job::new_async("0 30 * * * *", move |_uuid, _l| {
        let db = db_clone.clone();
        Box::pin(async move {
            info!("Running cleanup_expired_device_logins job");
            match storage::cleanup_expired_device_logins(&db).await {
                Ok(count) => info!("Cleaned up {} expired device logins", count),
                Err(e) => error!("Failed to cleanup expired device logins: {}", e),
            }
        })
    })
    .map_err(|e| {
        TrellisError::Other(format!("Failed to create cleanup device logins job: {}", e))
    })?;

    sched
        .add(cleanup_device_logins_job)
        .await
        .map_err(|e| {
            TrellisError::Other(format!("Failed to add cleanup device logins job: {}", e))
        })?;

    // Start the scheduler
    sched
        .start()
        .await
        .map_err(|e| TrellisError::Other(format!("Failed to start job scheduler: {}", e)))?;

    info!("Job scheduler started with {} jobs", 2);

    Ok(sched)
}
