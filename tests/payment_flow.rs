use std::sync::Arc;

use backend::billing::adapters::BackendRegistry;
use backend::billing::models::{
    PaymentMethod, PaymentStatus, PlanKind, SubscriptionStatus,
};
use backend::billing::orchestrator::PaymentOrchestrator;
use backend::billing::service::SubscriptionService;
use backend::error::AppError;
use backend::state_store::TtlStore;
use sqlx::PgPool;

// key: payment-tests -> guarded status transitions, activation side effect

fn orchestrator(pool: PgPool) -> PaymentOrchestrator {
    let registry = Arc::new(BackendRegistry::from_config().unwrap());
    PaymentOrchestrator::new(pool, registry, Arc::new(TtlStore::new()))
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn purchase_creates_pending_pair_and_job(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool.clone());

    let (subscription, payment) = orchestrator
        .purchase(10, PlanKind::Pack10, PaymentMethod::Card)
        .await
        .unwrap();

    assert_eq!(subscription.status, SubscriptionStatus::Pending);
    assert_eq!(subscription.downloads_limit, Some(10));
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, 799);
    assert_eq!(payment.subscription_id, subscription.id);
    assert!(payment.transaction_id.is_none());

    let queued: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM billing_jobs WHERE status = 'queued'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(queued, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn completed_payment_activates_subscription(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool.clone());
    let service = SubscriptionService::new(pool);

    let (subscription, payment) = orchestrator
        .purchase(11, PlanKind::Pack10, PaymentMethod::Card)
        .await
        .unwrap();

    let completed = orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(completed.status, PaymentStatus::Completed);

    let active = service.get(subscription.id).await.unwrap();
    assert_eq!(active.status, SubscriptionStatus::Active);
    assert_eq!(active.downloads_limit, Some(10));
    assert_eq!(active.downloads_used, 0);
    assert!(active.payment_ref.is_some());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn repeated_completion_report_is_a_noop(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool.clone());
    let service = SubscriptionService::new(pool);

    let (subscription, payment) = orchestrator
        .purchase(12, PlanKind::Monthly, PaymentMethod::Qr)
        .await
        .unwrap();

    orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Completed, None)
        .await
        .unwrap();
    let first_activation = service.get(subscription.id).await.unwrap();

    let again = orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(again.status, PaymentStatus::Completed);

    let second_activation = service.get(subscription.id).await.unwrap();
    assert_eq!(first_activation.end_date, second_activation.end_date);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn terminal_payment_cannot_move_back_to_pending(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool);

    let (_, payment) = orchestrator
        .purchase(13, PlanKind::OneTime, PaymentMethod::Card)
        .await
        .unwrap();
    orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Completed, None)
        .await
        .unwrap();

    let err = orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Pending, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let err = orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Failed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn failed_payment_cancels_the_pending_subscription(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool.clone());
    let service = SubscriptionService::new(pool);

    let (subscription, payment) = orchestrator
        .purchase(14, PlanKind::Monthly, PaymentMethod::Card)
        .await
        .unwrap();

    orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Failed, Some("card declined"))
        .await
        .unwrap();

    let canceled = service.get(subscription.id).await.unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert_eq!(canceled.cancellation_reason.as_deref(), Some("payment failed"));

    let failed = orchestrator.get_payment(payment.id).await.unwrap();
    assert_eq!(failed.error_message.as_deref(), Some("card declined"));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn refund_cancels_the_activated_subscription(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool.clone());
    let service = SubscriptionService::new(pool);

    let (subscription, payment) = orchestrator
        .purchase(15, PlanKind::Yearly, PaymentMethod::Card)
        .await
        .unwrap();
    orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Completed, None)
        .await
        .unwrap();

    orchestrator
        .report_status_by_id(payment.id, PaymentStatus::Refunded, None)
        .await
        .unwrap();

    let canceled = service.get(subscription.id).await.unwrap();
    assert_eq!(canceled.status, SubscriptionStatus::Canceled);
    assert_eq!(
        canceled.cancellation_reason.as_deref(),
        Some("payment refunded")
    );
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn trial_cannot_be_purchased(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool);

    let err = orchestrator
        .purchase(16, PlanKind::Trial, PaymentMethod::Card)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn admin_grant_is_active_with_completed_manual_payment(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let orchestrator = orchestrator(pool);

    let (subscription, payment) = orchestrator
        .grant(17, PlanKind::Pack10, Some(25), None)
        .await
        .unwrap();

    assert_eq!(subscription.status, SubscriptionStatus::Active);
    assert_eq!(subscription.downloads_limit, Some(25));
    assert_eq!(payment.method, PaymentMethod::Manual);
    assert_eq!(payment.status, PaymentStatus::Completed);
    assert_eq!(payment.amount, 0);
}
