use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

use super::models::{PlanKind, Subscription, SubscriptionStatus};
use super::plans;

/// key: subscription-lifecycle -> guarded state-machine transitions
///
/// Every mutation is a conditional update keyed on the current status, so
/// concurrent actors (payment callback, scheduler, admin) degrade to
/// idempotent no-ops instead of overwriting each other.
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
}

impl SubscriptionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, subscription_id: Uuid) -> AppResult<Subscription> {
        sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::NotFound)
    }

    /// Whether the user ever held a trial, regardless of its status.
    pub async fn trial_used(&self, user_id: i32) -> AppResult<bool> {
        let used: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM subscriptions WHERE user_id = $1 AND kind = 'trial')",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(used)
    }

    /// Creates a subscription for the given plan. Paid plans start `pending`
    /// and expect a companion payment; the free trial starts `active` and is
    /// first-use only.
    pub async fn create(&self, user_id: i32, kind: PlanKind) -> AppResult<Subscription> {
        let plan = plans::plan(kind);

        if kind == PlanKind::Trial && self.trial_used(user_id).await? {
            return Err(AppError::TrialAlreadyUsed);
        }

        let status = if plan.price == 0 {
            SubscriptionStatus::Active
        } else {
            SubscriptionStatus::Pending
        };

        let inserted = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (id, user_id, kind, status, start_date, end_date, downloads_limit, price)
            VALUES
                ($1, $2, $3, $4, NOW(),
                 CASE WHEN $5::int IS NULL THEN NULL ELSE NOW() + $5 * INTERVAL '1 day' END,
                 $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(kind)
        .bind(status)
        .bind(plan.duration_days.map(|days| days as i32))
        .bind(plan.downloads_limit)
        .bind(plan.price)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(subscription) => Ok(subscription),
            // Lost the race on the one-trial-per-user unique index.
            Err(err) if is_unique_violation(&err) && kind == PlanKind::Trial => {
                Err(AppError::TrialAlreadyUsed)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Idempotent trial provisioning: returns the existing trial when the
    /// user already has one, in any status.
    pub async fn ensure_trial(&self, user_id: i32) -> AppResult<Subscription> {
        if let Some(existing) = self.find_trial(user_id).await? {
            return Ok(existing);
        }

        let plan = plans::plan(PlanKind::Trial);
        sqlx::query(
            r#"
            INSERT INTO subscriptions (id, user_id, kind, status, start_date, downloads_limit, price)
            VALUES ($1, $2, 'trial', 'active', NOW(), $3, 0)
            ON CONFLICT (user_id) WHERE kind = 'trial' DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(plan.downloads_limit)
        .execute(&self.pool)
        .await?;

        self.find_trial(user_id)
            .await?
            .ok_or_else(|| AppError::Message("trial provisioning raced and vanished".to_string()))
    }

    async fn find_trial(&self, user_id: i32) -> AppResult<Option<Subscription>> {
        let trial = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND kind = 'trial'",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(trial)
    }

    /// Admin grant: starts `active` immediately, with optional overrides for
    /// the plan's limit and end date.
    pub async fn create_granted(
        &self,
        user_id: i32,
        kind: PlanKind,
        downloads_limit: Option<i32>,
        end_date: Option<DateTime<Utc>>,
    ) -> AppResult<Subscription> {
        if kind == PlanKind::Trial && self.trial_used(user_id).await? {
            return Err(AppError::TrialAlreadyUsed);
        }
        let plan = plans::plan(kind);
        let limit = downloads_limit.or(plan.downloads_limit);
        let end = end_date.or_else(|| {
            plan.duration_days
                .map(|days| Utc::now() + chrono::Duration::days(days))
        });

        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions
                (id, user_id, kind, status, start_date, end_date, downloads_limit, price)
            VALUES ($1, $2, $3, 'active', NOW(), $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(kind)
        .bind(end)
        .bind(limit)
        .bind(plan.price)
        .fetch_one(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// `pending -> active`, stamping the payment reference and computing the
    /// end date from the plan duration. Reapplying with the same reference is
    /// a no-op.
    pub async fn activate(
        &self,
        subscription_id: Uuid,
        payment_ref: &str,
    ) -> AppResult<Subscription> {
        let current = self.get(subscription_id).await?;
        let duration_days = plans::plan(current.kind)
            .duration_days
            .map(|days| days as i32);

        let activated = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = 'active',
                start_date = NOW(),
                end_date = CASE WHEN $2::int IS NULL THEN NULL
                                ELSE NOW() + $2 * INTERVAL '1 day' END,
                payment_ref = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(duration_days)
        .bind(payment_ref)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(subscription) = activated {
            return Ok(subscription);
        }

        // Already transitioned by a concurrent actor: idempotent when the
        // reference matches, illegal otherwise.
        let current = self.get(subscription_id).await?;
        if current.status == SubscriptionStatus::Active
            && current.payment_ref.as_deref() == Some(payment_ref)
        {
            return Ok(current);
        }
        Err(AppError::InvalidState(format!(
            "cannot activate subscription in status {:?}",
            current.status
        )))
    }

    /// `active -> expired` when past the end date or out of quota. Idempotent;
    /// returns whether this call performed the transition.
    pub async fn expire_if_due(
        &self,
        subscription_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let expired = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'expired', updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
              AND ((end_date IS NOT NULL AND end_date < $2)
                   OR (downloads_limit IS NOT NULL AND downloads_used >= downloads_limit))
            "#,
        )
        .bind(subscription_id)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(expired > 0)
    }

    /// `active|pending -> canceled`. Fails loudly from terminal states.
    pub async fn cancel(&self, subscription_id: Uuid, reason: &str) -> AppResult<Subscription> {
        let canceled = sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', cancellation_reason = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('active', 'pending')
            RETURNING *
            "#,
        )
        .bind(subscription_id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match canceled {
            Some(subscription) => Ok(subscription),
            None => {
                let current = self.get(subscription_id).await?;
                Err(AppError::InvalidState(format!(
                    "cannot cancel subscription in status {:?}",
                    current.status
                )))
            }
        }
    }

    /// Selects the subscription a new download should charge against:
    /// first an unlimited plan with an unexpired window (latest end date
    /// first), else a counted plan with remaining quota (newest first).
    pub async fn current_entitled(
        &self,
        user_id: i32,
        now: DateTime<Utc>,
    ) -> AppResult<Option<Subscription>> {
        let unlimited = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1
              AND status = 'active'
              AND downloads_limit IS NULL
              AND (end_date IS NULL OR end_date > $2)
            ORDER BY end_date DESC NULLS FIRST
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if unlimited.is_some() {
            return Ok(unlimited);
        }

        let counted = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE user_id = $1
              AND status = 'active'
              AND downloads_limit IS NOT NULL
              AND downloads_used < downloads_limit
              AND (end_date IS NULL OR end_date > $2)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(counted)
    }

    pub async fn list_for_user(&self, user_id: i32) -> AppResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    /// Admin listing with optional user/status/kind filters.
    pub async fn admin_list(
        &self,
        user_id: Option<i32>,
        status: Option<SubscriptionStatus>,
        kind: Option<PlanKind>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE ($1::int IS NULL OR user_id = $1)
              AND ($2::subscription_status IS NULL OR status = $2)
              AND ($3::plan_kind IS NULL OR kind = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(user_id)
        .bind(status)
        .bind(kind)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(subscriptions)
    }

    /// Trial availability flag for the plan catalog.
    pub async fn trial_available(&self, user_id: i32) -> AppResult<bool> {
        Ok(!self.trial_used(user_id).await?)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}
