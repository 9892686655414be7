use sqlx::PgPool;
use uuid::Uuid;

use crate::config;

/// Outbound notification kinds the billing core emits. Delivery is an
/// external collaborator; failures here never roll back the transition
/// that triggered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    PaymentCompleted,
    TrialExhausted,
    SubscriptionExpired,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::PaymentCompleted => "payment_completed",
            NotificationKind::TrialExhausted => "trial_exhausted",
            NotificationKind::SubscriptionExpired => "subscription_expired",
        }
    }
}

/// Fire-and-forget dispatch keyed by user id.
pub fn dispatch(user_id: i32, kind: NotificationKind, detail: serde_json::Value) {
    tokio::spawn(async move {
        if let Err(err) = deliver(user_id, kind, &detail).await {
            tracing::warn!(?err, %user_id, kind = kind.as_str(), "notification delivery failed");
        }
    });
}

/// Variant used where only the subscription id is at hand.
pub fn dispatch_for_subscription(pool: &PgPool, subscription_id: Uuid, kind: NotificationKind) {
    let pool = pool.clone();
    tokio::spawn(async move {
        let user_id: Result<i32, sqlx::Error> =
            sqlx::query_scalar("SELECT user_id FROM subscriptions WHERE id = $1")
                .bind(subscription_id)
                .fetch_one(&pool)
                .await;
        match user_id {
            Ok(user_id) => {
                let detail = serde_json::json!({ "subscription_id": subscription_id });
                if let Err(err) = deliver(user_id, kind, &detail).await {
                    tracing::warn!(
                        ?err,
                        %user_id,
                        kind = kind.as_str(),
                        "notification delivery failed"
                    );
                }
            }
            Err(err) => tracing::warn!(
                ?err,
                %subscription_id,
                "notification skipped: subscription lookup failed"
            ),
        }
    });
}

async fn deliver(
    user_id: i32,
    kind: NotificationKind,
    detail: &serde_json::Value,
) -> anyhow::Result<()> {
    let Some(endpoint) = config::NOTIFY_ENDPOINT.as_deref() else {
        tracing::info!(%user_id, kind = kind.as_str(), %detail, "notification (log only)");
        return Ok(());
    };

    let client = reqwest::Client::new();
    client
        .post(endpoint)
        .json(&serde_json::json!({
            "user_id": user_id,
            "kind": kind.as_str(),
            "detail": detail,
        }))
        .timeout(std::time::Duration::from_secs(10))
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}
