use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::notify::{self, NotificationKind};

use super::orchestrator::PaymentOrchestrator;
use super::service::SubscriptionService;

/// key: reconciliation-scheduler -> three independent idempotent sweeps
///
/// Every mutation behind a sweep is a conditional transition, so overlapping
/// sweeps and live traffic degrade to no-ops instead of double-counting.
pub fn spawn(pool: PgPool, orchestrator: PaymentOrchestrator) {
    let expiry_pool = pool.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(*config::EXPIRY_SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            process_expiry_tick(&expiry_pool, Utc::now()).await;
        }
    });

    let poll_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(*config::PAYMENT_POLL_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            process_payment_poll_tick(
                &poll_orchestrator,
                Utc::now(),
                *config::PAYMENT_POLL_GRACE_SECS,
            )
            .await;
        }
    });

    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(*config::HOUSEKEEPING_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            process_housekeeping_tick(&pool, &orchestrator, Utc::now()).await;
        }
    });
}

/// Expires every active subscription past its end date or out of quota.
/// Safe to rerun and to overlap with itself: `expire_if_due` only moves
/// rows that still match the predicate.
pub async fn process_expiry_tick(pool: &PgPool, now: DateTime<Utc>) {
    let service = SubscriptionService::new(pool.clone());
    let due: Vec<(Uuid, i32)> = match sqlx::query_as(
        r#"
        SELECT id, user_id FROM subscriptions
        WHERE status = 'active'
          AND (end_date < $1
               OR (downloads_limit IS NOT NULL AND downloads_used >= downloads_limit))
        "#,
    )
    .bind(now)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(?err, "expiry sweep query failed");
            return;
        }
    };

    let mut expired = 0usize;
    for (subscription_id, user_id) in due {
        match service.expire_if_due(subscription_id, now).await {
            Ok(true) => {
                expired += 1;
                notify::dispatch(
                    user_id,
                    NotificationKind::SubscriptionExpired,
                    serde_json::json!({ "subscription_id": subscription_id }),
                );
            }
            Ok(false) => {}
            Err(err) => {
                warn!(%subscription_id, ?err, "expiry transition failed");
            }
        }
    }
    if expired > 0 {
        info!(expired, "expiry sweep finished");
    }
}

/// Polls the provider for every pending non-manual payment older than the
/// grace period. Per-record failures are logged and skipped.
pub async fn process_payment_poll_tick(
    orchestrator: &PaymentOrchestrator,
    now: DateTime<Utc>,
    grace_secs: i64,
) {
    let stale = match orchestrator.stale_pending(now, grace_secs).await {
        Ok(payments) => payments,
        Err(err) => {
            warn!(?err, "payment poll query failed");
            return;
        }
    };

    for payment in stale {
        if let Err(err) = orchestrator.check(payment.id).await {
            warn!(payment_id = %payment.id, ?err, "payment poll failed");
        }
    }
}

/// Daily cleanup: payments abandoned at the checkout page are canceled at
/// the provider and failed locally, and expired return tokens are dropped.
pub async fn process_housekeeping_tick(
    pool: &PgPool,
    orchestrator: &PaymentOrchestrator,
    now: DateTime<Utc>,
) {
    let cutoff = now - ChronoDuration::hours(*config::PAYMENT_ABANDON_HOURS);
    let abandoned: Vec<(Uuid,)> = match sqlx::query_as(
        "SELECT id FROM payments WHERE status = 'pending' AND created_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    {
        Ok(rows) => rows,
        Err(err) => {
            warn!(?err, "abandoned payment query failed");
            return;
        }
    };

    for (payment_id,) in abandoned {
        if let Err(err) = orchestrator.abandon(payment_id).await {
            warn!(%payment_id, ?err, "abandoning payment failed");
        }
    }

    let purged = orchestrator.tokens().purge_expired();
    if purged > 0 {
        info!(purged, "expired return tokens purged");
    }
}
