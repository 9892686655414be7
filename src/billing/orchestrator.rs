use std::sync::Arc;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::notify::{self, NotificationKind};
use crate::state_store::TtlStore;

use super::adapters::BackendRegistry;
use super::models::{Payment, PaymentMethod, PaymentStatus, PlanKind, Subscription};
use super::plans;
use super::reconciliation::{self, BillingJob};
use super::service::SubscriptionService;

/// key: payment-orchestrator -> drives payments through the pending ->
/// terminal lifecycle and keeps subscriptions in step.
///
/// All status writes go through [`apply_status`](Self::apply_status), a
/// guarded conditional update, so concurrent webhooks, polls and return
/// redirects converge on one terminal status.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    pool: PgPool,
    registry: Arc<BackendRegistry>,
    tokens: Arc<TtlStore>,
    service: SubscriptionService,
}

impl PaymentOrchestrator {
    pub fn new(pool: PgPool, registry: Arc<BackendRegistry>, tokens: Arc<TtlStore>) -> Self {
        let service = SubscriptionService::new(pool.clone());
        Self {
            pool,
            registry,
            tokens,
            service,
        }
    }

    pub fn service(&self) -> &SubscriptionService {
        &self.service
    }

    pub fn tokens(&self) -> &Arc<TtlStore> {
        &self.tokens
    }

    /// Creates the pending subscription, the pending payment and the
    /// initiation job in one transaction. Provider calls happen later, on
    /// the reconciliation worker, so a gateway outage cannot lose the
    /// purchase.
    pub async fn purchase(
        &self,
        user_id: i32,
        kind: PlanKind,
        method: PaymentMethod,
    ) -> AppResult<(Subscription, Payment)> {
        if kind == PlanKind::Trial {
            return Err(AppError::Validation(
                "trial is granted automatically and cannot be purchased".to_string(),
            ));
        }
        let plan = plans::plan(kind);

        let mut tx = self.pool.begin().await?;
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (id, user_id, kind, status, start_date, downloads_limit, price)
            VALUES ($1, $2, $3, 'pending', NOW(), $4, $5)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(kind)
        .bind(plan.downloads_limit)
        .bind(plan.price)
        .fetch_one(&mut tx)
        .await?;

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (id, user_id, subscription_id, amount, method, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(subscription.id)
        .bind(plan.price)
        .bind(method)
        .fetch_one(&mut tx)
        .await?;

        reconciliation::enqueue(
            &mut tx,
            &BillingJob::InitiatePayment {
                payment_id: payment.id,
            },
        )
        .await?;
        tx.commit().await?;

        info!(
            user_id,
            payment_id = %payment.id,
            kind = kind.as_str(),
            method = method.as_str(),
            "purchase created"
        );
        Ok((subscription, payment))
    }

    /// Creates the provider intent for a pending payment. Idempotent: a
    /// payment that already carries a transaction id or reached a terminal
    /// status is left alone. Fatal provider errors mark the payment failed;
    /// retryable ones propagate so the job stays queued.
    pub async fn initiate(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.get_payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending || payment.transaction_id.is_some() {
            return Ok(());
        }

        let token = Uuid::new_v4().to_string();
        self.tokens.put(
            token.clone(),
            payment.id.to_string(),
            *config::RETURN_TOKEN_TTL_SECS,
        );
        let return_url = format!("{}/{}", config::GATEWAY_RETURN_URL.as_str(), token);

        let plan = plans::plan(self.service.get(payment.subscription_id).await?.kind);
        let backend = self.registry.select(payment.method);
        let intent = match backend.initiate(&payment, plan.name, &return_url).await {
            Ok(intent) => intent,
            Err(err) if err.is_retryable() => return Err(err.into()),
            Err(err) => {
                warn!(payment_id = %payment.id, error = %err, "payment declined at initiation");
                self.apply_status(payment, PaymentStatus::Failed, Some(&err.to_string()))
                    .await?;
                return Ok(());
            }
        };

        let stamped = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET transaction_id = $2, payment_data = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND transaction_id IS NULL
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(&intent.transaction_id)
        .bind(serde_json::json!({ "confirmation_url": intent.confirmation_url }))
        .fetch_optional(&self.pool)
        .await?;

        let Some(stamped) = stamped else {
            // Lost the race to a concurrent initiation; the winner's intent
            // stands.
            return Ok(());
        };

        if intent.status == PaymentStatus::Completed {
            self.apply_status(stamped, PaymentStatus::Completed, None)
                .await?;
        }
        Ok(())
    }

    /// Applies a provider-reported status by transaction id (webhooks).
    pub async fn report_status(
        &self,
        transaction_id: &str,
        new_status: PaymentStatus,
    ) -> AppResult<Payment> {
        let payment = self.get_payment_by_transaction(transaction_id).await?;
        self.apply_status(payment, new_status, None).await
    }

    pub async fn report_status_by_id(
        &self,
        payment_id: Uuid,
        new_status: PaymentStatus,
        error_message: Option<&str>,
    ) -> AppResult<Payment> {
        let payment = self.get_payment(payment_id).await?;
        self.apply_status(payment, new_status, error_message).await
    }

    /// Single transition point for payment status. Same-status reports are
    /// no-ops, backward transitions are rejected, and the subscription side
    /// effect runs exactly once because only the guarded update's winner
    /// reaches it.
    async fn apply_status(
        &self,
        payment: Payment,
        new_status: PaymentStatus,
        error_message: Option<&str>,
    ) -> AppResult<Payment> {
        if payment.status == new_status {
            return Ok(payment);
        }
        if !payment.status.can_transition(new_status) {
            return Err(AppError::InvalidState(format!(
                "payment {} cannot move from {} to {}",
                payment.id,
                payment.status.as_str(),
                new_status.as_str()
            )));
        }

        let updated = sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = $2, error_message = COALESCE($3, error_message), updated_at = NOW()
            WHERE id = $1 AND status = $4
            RETURNING *
            "#,
        )
        .bind(payment.id)
        .bind(new_status)
        .bind(error_message)
        .bind(payment.status)
        .fetch_optional(&self.pool)
        .await?;

        let Some(updated) = updated else {
            // Someone else transitioned first. Converged on the same status
            // means success; anything else is a conflicting report.
            let current = self.get_payment(payment.id).await?;
            if current.status == new_status {
                return Ok(current);
            }
            return Err(AppError::InvalidState(format!(
                "payment {} already in status {}",
                current.id,
                current.status.as_str()
            )));
        };

        match updated.status {
            PaymentStatus::Completed => {
                let reference = updated
                    .transaction_id
                    .clone()
                    .unwrap_or_else(|| updated.id.to_string());
                self.service.activate(updated.subscription_id, &reference).await?;
                notify::dispatch(
                    updated.user_id,
                    NotificationKind::PaymentCompleted,
                    serde_json::json!({ "payment_id": updated.id, "amount": updated.amount }),
                );
                info!(payment_id = %updated.id, "payment completed, subscription activated");
            }
            PaymentStatus::Failed => {
                self.cancel_subscription_best_effort(updated.subscription_id, "payment failed")
                    .await;
            }
            PaymentStatus::Refunded => {
                self.cancel_subscription_best_effort(updated.subscription_id, "payment refunded")
                    .await;
            }
            PaymentStatus::Pending => {}
        }
        Ok(updated)
    }

    /// Polls the provider for a pending payment and folds the answer in.
    /// Terminal payments short-circuit without a provider call.
    pub async fn check(&self, payment_id: Uuid) -> AppResult<PaymentStatus> {
        let payment = self.get_payment(payment_id).await?;
        if payment.status.is_terminal() {
            return Ok(payment.status);
        }
        let Some(transaction_id) = payment.transaction_id.clone() else {
            return Ok(PaymentStatus::Pending);
        };

        let backend = self.registry.select(payment.method);
        let provider_status = backend.check(&transaction_id).await?;
        if provider_status == payment.status {
            return Ok(provider_status);
        }
        let updated = self.apply_status(payment, provider_status, None).await?;
        Ok(updated.status)
    }

    /// Cancels a stale pending payment at the provider and marks it failed.
    /// Used by housekeeping for payments abandoned at the checkout page.
    pub async fn abandon(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.get_payment(payment_id).await?;
        if payment.status != PaymentStatus::Pending {
            return Ok(());
        }
        if let Some(transaction_id) = payment.transaction_id.as_deref() {
            let backend = self.registry.select(payment.method);
            if let Err(err) = backend.cancel(transaction_id).await {
                warn!(payment_id = %payment.id, error = %err, "provider cancel failed");
            }
        }
        self.apply_status(payment, PaymentStatus::Failed, Some("abandoned"))
            .await?;
        Ok(())
    }

    /// Resolves a one-shot return token from the gateway redirect. The token
    /// is consumed on first use; a second redirect with the same token is a
    /// 404.
    pub async fn redeem_return_token(&self, token: &str) -> AppResult<Payment> {
        let payment_id = self
            .tokens
            .take_once(token)
            .ok_or(AppError::NotFound)?
            .parse::<Uuid>()
            .map_err(|_| AppError::NotFound)?;
        // The redirect often lands before the webhook; poll once so the
        // caller sees the freshest status.
        if let Err(err) = self.check(payment_id).await {
            warn!(payment_id = %payment_id, error = %err, "status check on return failed");
        }
        self.get_payment(payment_id).await
    }

    pub async fn get_payment(&self, payment_id: Uuid) -> AppResult<Payment> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn get_payment_by_transaction(&self, transaction_id: &str) -> AppResult<Payment> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE transaction_id = $1")
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    pub async fn list_for_user(&self, user_id: i32) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    pub async fn admin_list(
        &self,
        user_id: Option<i32>,
        status: Option<PaymentStatus>,
        method: Option<PaymentMethod>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE ($1::int IS NULL OR user_id = $1)
              AND ($2::payment_status IS NULL OR status = $2)
              AND ($3::payment_method IS NULL OR method = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(method)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    /// Grants a subscription without money movement: the subscription is
    /// created already active and paired with a completed manual payment.
    pub async fn grant(
        &self,
        user_id: i32,
        kind: PlanKind,
        downloads_limit: Option<i32>,
        end_date: Option<chrono::DateTime<Utc>>,
    ) -> AppResult<(Subscription, Payment)> {
        let subscription = self
            .service
            .create_granted(user_id, kind, downloads_limit, end_date)
            .await?;

        let payment_id = Uuid::new_v4();
        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (id, user_id, subscription_id, amount, method, status, transaction_id)
            VALUES ($1, $2, $3, 0, 'manual', 'completed', $4)
            RETURNING *
            "#,
        )
        .bind(payment_id)
        .bind(user_id)
        .bind(subscription.id)
        .bind(format!("manual-{payment_id}"))
        .fetch_one(&self.pool)
        .await?;

        info!(user_id, kind = kind.as_str(), subscription_id = %subscription.id, "manual grant");
        Ok((subscription, payment))
    }

    /// Pending payments old enough that the provider should have answered;
    /// candidates for the poll sweep.
    pub async fn stale_pending(
        &self,
        now: chrono::DateTime<Utc>,
        grace_secs: i64,
    ) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            r#"
            SELECT * FROM payments
            WHERE status = 'pending'
              AND method <> 'manual'
              AND transaction_id IS NOT NULL
              AND created_at < $1 - $2 * INTERVAL '1 second'
            ORDER BY created_at
            "#,
        )
        .bind(now)
        .bind(grace_secs as f64)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn cancel_subscription_best_effort(&self, subscription_id: Uuid, reason: &str) {
        match self.service.cancel(subscription_id, reason).await {
            Ok(_) => {}
            // Already terminal: the failure arrived after expiry or an
            // earlier cancellation. Nothing to do.
            Err(AppError::InvalidState(_)) => {}
            Err(err) => {
                warn!(subscription_id = %subscription_id, error = %err, "subscription cancel failed");
            }
        }
    }
}

/// Webhook status vocabulary; wider than the gateway's own poll replies
/// because some providers ship alternate names for the same transition.
pub fn map_webhook_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" | "paid" | "completed" => PaymentStatus::Completed,
        "canceled" | "failed" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}
