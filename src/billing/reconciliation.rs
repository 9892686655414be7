use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{PgPool, Row};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;

use super::orchestrator::PaymentOrchestrator;

/// Durable billing work. Jobs are enqueued inside the transaction that
/// creates the rows they act on, so a crash between commit and processing
/// only delays them.
#[derive(Debug, Serialize, Deserialize)]
pub enum BillingJob {
    InitiatePayment { payment_id: Uuid },
    CheckPayment { payment_id: Uuid },
}

pub async fn enqueue<'c, E>(executor: E, job: &BillingJob) -> sqlx::Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let payload = serde_json::to_value(job).map_err(|err| sqlx::Error::Decode(err.into()))?;
    sqlx::query("INSERT INTO billing_jobs (payload) VALUES ($1)")
        .bind(payload)
        .execute(executor)
        .await?;
    Ok(())
}

/// Handle for waking the worker right after an enqueue; the periodic drain
/// picks up anything a missed nudge leaves behind.
#[derive(Clone)]
pub struct ReconciliationHandle {
    sender: Sender<()>,
}

impl ReconciliationHandle {
    pub fn nudge(&self) {
        let _ = self.sender.try_send(());
    }
}

/// key: billing-job-worker -> at-least-once drain of billing_jobs
///
/// Rows are deleted only after the handler succeeds or fails fatally;
/// retryable provider errors leave the row queued for the next pass, so
/// every job runs at least once and handlers must stay idempotent.
pub fn start_worker(pool: PgPool, orchestrator: PaymentOrchestrator) -> ReconciliationHandle {
    let (tx, mut rx): (Sender<()>, Receiver<()>) = channel(32);

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                nudge = rx.recv() => {
                    if nudge.is_none() {
                        break;
                    }
                }
            }
            drain_queued(&pool, &orchestrator).await;
        }
    });

    ReconciliationHandle { sender: tx }
}

pub async fn drain_queued(pool: &PgPool, orchestrator: &PaymentOrchestrator) {
    let rows = match sqlx::query(
        "SELECT id, payload FROM billing_jobs WHERE status = 'queued' ORDER BY id",
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(?err, "billing job fetch failed");
            return;
        }
    };

    for row in rows {
        let id: i64 = row.get("id");
        let payload: Value = row.get("payload");
        let job = match serde_json::from_value::<BillingJob>(payload) {
            Ok(job) => job,
            Err(err) => {
                // Unparseable payloads can never succeed; drop them.
                warn!(%id, ?err, "discarding malformed billing job");
                let _ = delete_job(pool, id).await;
                continue;
            }
        };

        match run_job(orchestrator, &job).await {
            Ok(()) => {
                if let Err(err) = delete_job(pool, id).await {
                    warn!(%id, ?err, "billing job delete failed");
                }
            }
            Err(err) if job_error_is_retryable(&err) => {
                info!(%id, ?job, ?err, "billing job retrying");
                let _ = sqlx::query(
                    "UPDATE billing_jobs SET attempts = attempts + 1 WHERE id = $1",
                )
                .bind(id)
                .execute(pool)
                .await;
            }
            Err(err) => {
                // Fatal for the job itself; the handler already recorded the
                // payment-side outcome where one exists.
                warn!(%id, ?job, ?err, "billing job failed");
                let _ = delete_job(pool, id).await;
            }
        }
    }
}

/// Jobs survive anything that a later pass can succeed at: retryable
/// provider failures and database errors alike. Only errors that can never
/// resolve (decline, missing row, illegal transition) drop the row.
fn job_error_is_retryable(err: &AppError) -> bool {
    match err {
        AppError::Provider(provider_err) => provider_err.is_retryable(),
        AppError::Db(_) => true,
        _ => false,
    }
}

async fn run_job(orchestrator: &PaymentOrchestrator, job: &BillingJob) -> Result<(), AppError> {
    match job {
        BillingJob::InitiatePayment { payment_id } => orchestrator.initiate(*payment_id).await,
        BillingJob::CheckPayment { payment_id } => {
            orchestrator.check(*payment_id).await.map(|_| ())
        }
    }
}

async fn delete_job(pool: &PgPool, id: i64) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM billing_jobs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::adapters::ProviderError;

    #[test]
    fn transient_failures_keep_the_job_queued() {
        assert!(job_error_is_retryable(&AppError::Provider(
            ProviderError::Timeout
        )));
        assert!(job_error_is_retryable(&AppError::Provider(
            ProviderError::Unavailable("503".to_string())
        )));
        assert!(job_error_is_retryable(&AppError::Db(
            sqlx::Error::PoolTimedOut
        )));
    }

    #[test]
    fn unresolvable_failures_drop_the_job() {
        assert!(!job_error_is_retryable(&AppError::Provider(
            ProviderError::Declined("card declined".to_string())
        )));
        assert!(!job_error_is_retryable(&AppError::NotFound));
        assert!(!job_error_is_retryable(&AppError::InvalidState(
            "already terminal".to_string()
        )));
    }
}
