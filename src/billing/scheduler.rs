use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::config::BillingConfig;
use crate::job_queue::{Task, TaskQueue};

use super::store::BillingStore;

/// Counts from one scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub charges_enqueued: usize,
    pub expiries_enqueued: usize,
    pub pregenerations_enqueued: usize,
    pub enqueue_failures: usize,
    pub scan_failures: usize,
}

// key: billing-scheduler -> due scans feeding the task queue
/// Read-only against the store: overlapping ticks can only enqueue the same
/// task twice, which the consumers tolerate.
#[derive(Clone)]
pub struct BillingScheduler {
    store: Arc<dyn BillingStore>,
    queue: Arc<dyn TaskQueue>,
    config: BillingConfig,
}

impl BillingScheduler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        queue: Arc<dyn TaskQueue>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let interval = self.config.scan_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let summary = self.process_tick(Utc::now()).await;
                if summary.scan_failures > 0 || summary.enqueue_failures > 0 {
                    warn!(?summary, "billing dispatch tick completed with failures");
                } else {
                    debug!(?summary, "billing dispatch tick completed");
                }
            }
        })
    }

    // key: billing-scheduler -> tick handler
    pub async fn process_tick(&self, now: DateTime<Utc>) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let limit = self.config.due_batch_limit;

        match self.store.due_occurrences(now, limit).await {
            Ok(due) => {
                for row in due {
                    let task = Task::ExecuteOccurrence {
                        occurrence_id: row.occurrence_id,
                    };
                    if self.enqueue(&task, &mut summary).await {
                        summary.charges_enqueued += 1;
                    }
                }
            }
            Err(err) => {
                warn!(?err, "due occurrence scan failed");
                summary.scan_failures += 1;
            }
        }

        match self.store.subscriptions_due_for_expiry(now, limit).await {
            Ok(due) => {
                for subscription_id in due {
                    let task = Task::ExpireSubscription { subscription_id };
                    if self.enqueue(&task, &mut summary).await {
                        summary.expiries_enqueued += 1;
                    }
                }
            }
            Err(err) => {
                warn!(?err, "expiry scan failed");
                summary.scan_failures += 1;
            }
        }

        match self.store.subscriptions_missing_occurrences(limit).await {
            Ok(missing) => {
                for subscription_id in missing {
                    let task = Task::CreatePendingOccurrences { subscription_id };
                    if self.enqueue(&task, &mut summary).await {
                        summary.pregenerations_enqueued += 1;
                    }
                }
            }
            Err(err) => {
                warn!(?err, "pre-generation scan failed");
                summary.scan_failures += 1;
            }
        }

        if summary.charges_enqueued + summary.expiries_enqueued + summary.pregenerations_enqueued
            > 0
        {
            info!(
                charges = summary.charges_enqueued,
                expiries = summary.expiries_enqueued,
                pregenerations = summary.pregenerations_enqueued,
                "billing work dispatched"
            );
        }
        summary
    }

    async fn enqueue(&self, task: &Task, summary: &mut DispatchSummary) -> bool {
        match self.queue.enqueue(task).await {
            Ok(()) => true,
            Err(err) => {
                warn!(?err, kind = task.kind(), "failed to enqueue billing task; next scan retries");
                summary.enqueue_failures += 1;
                false
            }
        }
    }
}
