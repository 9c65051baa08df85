use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use uuid::Uuid;

use crate::billing::BillingEngine;

/// Work items delivered at least once to the billing engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    DispatchScan,
    ExecuteOccurrence { occurrence_id: Uuid },
    ExpireSubscription { subscription_id: Uuid },
    CreatePendingOccurrences { subscription_id: Uuid },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::DispatchScan => "dispatch_scan",
            Task::ExecuteOccurrence { .. } => "execute_occurrence",
            Task::ExpireSubscription { .. } => "expire_subscription",
            Task::CreatePendingOccurrences { .. } => "create_pending_occurrences",
        }
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &Task) -> Result<()>;
}

// key: job-queue -> postgres-backed at-least-once queue
#[derive(Clone)]
pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: &Task) -> Result<()> {
        let payload = serde_json::to_value(task)?;
        sqlx::query("INSERT INTO job_queue (payload) VALUES ($1)")
            .bind(payload)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to enqueue {} task", task.kind()))?;
        Ok(())
    }
}

/// Attempts after which a failing task is parked as `dead` instead of requeued.
pub const MAX_TASK_ATTEMPTS: i32 = 8;

const RETRY_BASE_SECS: u64 = 5;
const RETRY_CAP_SECS: u64 = 3_600;

/// Delay before a task that failed `attempts` times becomes claimable again.
pub fn retry_backoff(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 16) as u32;
    let secs = RETRY_BASE_SECS.saturating_mul(1u64 << exponent);
    Duration::from_secs(secs.min(RETRY_CAP_SECS))
}

async fn claim_next(pool: &PgPool) -> Result<Option<(i32, i32, Value)>> {
    let row = sqlx::query(
        r#"
        UPDATE job_queue
        SET status = 'processing', attempts = attempts + 1, updated_at = NOW()
        WHERE id = (
            SELECT id FROM job_queue
            WHERE status = 'queued' AND available_at <= NOW()
            ORDER BY available_at, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, attempts, payload
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| (row.get("id"), row.get("attempts"), row.get("payload"))))
}

/// Puts rows stuck in `processing` (worker crashed mid-task) back on the queue.
async fn requeue_stale(pool: &PgPool, older_than: Duration) -> Result<u64> {
    let seconds = older_than.as_secs() as f64;
    let requeued = sqlx::query(
        r#"
        UPDATE job_queue SET status = 'queued', available_at = NOW(), updated_at = NOW()
        WHERE status = 'processing'
          AND updated_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(seconds)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(requeued)
}

async fn complete(pool: &PgPool, id: i32) -> Result<()> {
    sqlx::query("DELETE FROM job_queue WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Requeues a failed task behind its backoff, or parks it once attempts run out.
async fn fail(pool: &PgPool, id: i32, attempts: i32, error: &str) -> Result<()> {
    if attempts >= MAX_TASK_ATTEMPTS {
        sqlx::query(
            "UPDATE job_queue SET status = 'dead', last_error = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;
        return Ok(());
    }

    let delay = retry_backoff(attempts).as_secs() as f64;
    sqlx::query(
        r#"
        UPDATE job_queue
        SET status = 'queued', last_error = $2, updated_at = NOW(),
            available_at = NOW() + make_interval(secs => $3)
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(error)
    .bind(delay)
    .execute(pool)
    .await?;
    Ok(())
}

/// Runs every claimable task once and returns how many were claimed. A failed
/// task is pushed back by its backoff, so it cannot be claimed again in the
/// same pass.
pub async fn drain_queue(pool: &PgPool, engine: &BillingEngine) -> Result<usize> {
    let mut claimed_count = 0;
    while let Some((id, attempts, payload)) = claim_next(pool).await? {
        claimed_count += 1;

        let task = match serde_json::from_value::<Task>(payload) {
            Ok(task) => task,
            Err(err) => {
                tracing::error!(?err, job = id, "parking undecodable billing task");
                fail(pool, id, MAX_TASK_ATTEMPTS, &err.to_string()).await?;
                continue;
            }
        };

        match engine.handle(&task).await {
            Ok(()) => complete(pool, id).await?,
            Err(err) => {
                if attempts >= MAX_TASK_ATTEMPTS {
                    tracing::error!(?err, job = id, attempts, kind = task.kind(), "billing task exhausted its attempts");
                } else {
                    tracing::warn!(?err, job = id, attempts, kind = task.kind(), "billing task failed");
                }
                fail(pool, id, attempts, &format!("{err:#}")).await?;
            }
        }
    }
    Ok(claimed_count)
}

/// Polls the queue and runs each task through the engine. A task is deleted
/// only after it completes; failures are redelivered with exponential backoff
/// until [`MAX_TASK_ATTEMPTS`].
pub fn start_worker(
    pool: PgPool,
    engine: Arc<BillingEngine>,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match requeue_stale(&pool, poll_interval * 60).await {
                Ok(0) => {}
                Ok(count) => tracing::warn!(count, "requeued stale billing tasks"),
                Err(err) => tracing::warn!(?err, "failed to requeue stale billing tasks"),
            }

            if let Err(err) = drain_queue(&pool, &engine).await {
                tracing::warn!(?err, "billing task worker pass failed");
            }

            sleep(poll_interval).await;
        }
    })
}
