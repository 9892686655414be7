use std::sync::Arc;

use backend::billing::adapters::BackendRegistry;
use backend::billing::ledger::QuotaLedger;
use backend::billing::models::{PaymentMethod, PaymentStatus, PlanKind, SubscriptionStatus};
use backend::billing::orchestrator::PaymentOrchestrator;
use backend::billing::scheduler;
use backend::billing::service::SubscriptionService;
use backend::state_store::TtlStore;
use chrono::{Duration, Utc};
use sqlx::PgPool;

// key: scheduler-tests -> idempotent sweeps

fn orchestrator(pool: PgPool) -> PaymentOrchestrator {
    let registry = Arc::new(BackendRegistry::from_config().unwrap());
    PaymentOrchestrator::new(pool, registry, Arc::new(TtlStore::new()))
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expiry_sweep_expires_past_end_date(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone());

    let expired_sub = service
        .create_granted(20, PlanKind::Monthly, None, Some(Utc::now() - Duration::days(1)))
        .await
        .unwrap();
    let live_sub = service
        .create_granted(21, PlanKind::Monthly, None, Some(Utc::now() + Duration::days(10)))
        .await
        .unwrap();

    scheduler::process_expiry_tick(&pool, Utc::now()).await;

    let expired = service.get(expired_sub.id).await.unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    let live = service.get(live_sub.id).await.unwrap();
    assert_eq!(live.status, SubscriptionStatus::Active);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn overlapping_expiry_sweeps_are_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone());

    let subscription = service
        .create_granted(22, PlanKind::Monthly, None, Some(Utc::now() - Duration::hours(1)))
        .await
        .unwrap();

    let now = Utc::now();
    tokio::join!(
        scheduler::process_expiry_tick(&pool, now),
        scheduler::process_expiry_tick(&pool, now),
    );
    let after_first = service.get(subscription.id).await.unwrap();
    assert_eq!(after_first.status, SubscriptionStatus::Expired);

    // A later sweep sees no matching active row and must not touch it again.
    scheduler::process_expiry_tick(&pool, Utc::now()).await;
    let after_second = service.get(subscription.id).await.unwrap();
    assert_eq!(after_first.updated_at, after_second.updated_at);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn expiry_sweep_catches_exhausted_quota(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let service = SubscriptionService::new(pool.clone());
    let ledger = QuotaLedger::new(pool.clone());

    let subscription = service
        .create_granted(23, PlanKind::Pack10, Some(1), None)
        .await
        .unwrap();
    assert!(ledger.try_consume(subscription.id).await.unwrap().ok);

    scheduler::process_expiry_tick(&pool, Utc::now()).await;

    let row = service.get(subscription.id).await.unwrap();
    assert_eq!(row.status, SubscriptionStatus::Expired);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn housekeeping_fails_abandoned_payments(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool.clone());
    let service = SubscriptionService::new(pool.clone());

    let (subscription, payment) = orchestrator
        .purchase(24, PlanKind::Monthly, PaymentMethod::Card)
        .await
        .unwrap();
    sqlx::query("UPDATE payments SET created_at = NOW() - INTERVAL '3 days' WHERE id = $1")
        .bind(payment.id)
        .execute(&pool)
        .await
        .unwrap();

    scheduler::process_housekeeping_tick(&pool, &orchestrator, Utc::now()).await;

    let failed = orchestrator.get_payment(payment.id).await.unwrap();
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("abandoned"));

    let canceled = service.get(subscription.id).await.unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn housekeeping_leaves_fresh_pending_payments_alone(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool.clone());

    let (_, payment) = orchestrator
        .purchase(25, PlanKind::Monthly, PaymentMethod::Card)
        .await
        .unwrap();

    scheduler::process_housekeeping_tick(&pool, &orchestrator, Utc::now()).await;

    let row = orchestrator.get_payment(payment.id).await.unwrap();
    assert_eq!(row.status, PaymentStatus::Pending);
}
