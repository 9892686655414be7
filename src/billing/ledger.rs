use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::notify::{self, NotificationKind};

use super::models::PlanKind;

const CONFLICT_RETRIES: u32 = 3;

/// key: quota-ledger -> atomic conditional increments on downloads_used
///
/// The only component allowed to mutate `downloads_used`. Every mutation is
/// a single conditional read-modify-write statement, so concurrent callers
/// for the same subscription serialize on the row and the limit invariant
/// holds at every observable point.
#[derive(Clone)]
pub struct QuotaLedger {
    pool: PgPool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsumeOutcome {
    pub ok: bool,
    /// Remaining downloads after the call; `None` for unlimited plans.
    pub remaining: Option<i32>,
}

impl QuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically checks and increments `downloads_used`. Returns
    /// `{ok: false}` without mutation when the quota is already exhausted
    /// or the subscription is not active.
    pub async fn try_consume(&self, subscription_id: Uuid) -> AppResult<ConsumeOutcome> {
        let mut attempt = 0;
        loop {
            match self.try_consume_once(subscription_id).await {
                Err(AppError::Db(err)) if is_serialization_conflict(&err) => {
                    attempt += 1;
                    if attempt >= CONFLICT_RETRIES {
                        let row: Option<(Option<i32>, i32)> = sqlx::query_as(
                            "SELECT downloads_limit, downloads_used FROM subscriptions WHERE id = $1",
                        )
                        .bind(subscription_id)
                        .fetch_optional(&self.pool)
                        .await?;
                        return Err(conflict_outcome(row, err));
                    }
                }
                other => return other,
            }
        }
    }

    async fn try_consume_once(&self, subscription_id: Uuid) -> AppResult<ConsumeOutcome> {
        let row: Option<(Option<i32>, i32, PlanKind)> = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET downloads_used = downloads_used + 1, updated_at = NOW()
            WHERE id = $1
              AND status = 'active'
              AND (downloads_limit IS NULL OR downloads_used < downloads_limit)
            RETURNING downloads_limit, downloads_used, kind
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((limit, used, kind)) = row {
            let remaining = limit.map(|limit| (limit - used).max(0));
            if kind == PlanKind::Trial && remaining == Some(0) {
                notify::dispatch_for_subscription(
                    &self.pool,
                    subscription_id,
                    NotificationKind::TrialExhausted,
                );
            }
            return Ok(ConsumeOutcome {
                ok: true,
                remaining,
            });
        }

        // No row matched: distinguish exhaustion from a missing subscription.
        let existing: Option<(Option<i32>, i32)> = sqlx::query_as(
            "SELECT downloads_limit, downloads_used FROM subscriptions WHERE id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        match existing {
            Some((limit, used)) => Ok(ConsumeOutcome {
                ok: false,
                remaining: limit.map(|limit| (limit - used).max(0)),
            }),
            None => Err(AppError::NotFound),
        }
    }

    /// Compensating decrement for downloads that ultimately failed, so they
    /// never burn quota. No-op at zero.
    pub async fn release(&self, subscription_id: Uuid) -> AppResult<()> {
        let released = sqlx::query(
            r#"
            UPDATE subscriptions
            SET downloads_used = downloads_used - 1, updated_at = NOW()
            WHERE id = $1 AND downloads_used > 0
            "#,
        )
        .bind(subscription_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if released == 0 {
            let exists: Option<i32> =
                sqlx::query_scalar("SELECT 1 FROM subscriptions WHERE id = $1")
                    .bind(subscription_id)
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(AppError::NotFound);
            }
        }
        Ok(())
    }
}

fn is_serialization_conflict(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "40001" || code == "40P01")
        .unwrap_or(false)
}

/// After retries are spent: `QuotaExceeded` only when a concurrent winner
/// really drained the quota; an unexhausted row propagates the conflict as
/// a database error for the caller to retry.
fn conflict_outcome(row: Option<(Option<i32>, i32)>, err: sqlx::Error) -> AppError {
    match row {
        Some((Some(limit), used)) if used >= limit => AppError::QuotaExceeded,
        Some(_) => AppError::Db(err),
        None => AppError::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_conflicts_on_a_drained_row_are_quota_exhaustion() {
        let outcome = conflict_outcome(Some((Some(3), 3)), sqlx::Error::PoolTimedOut);
        assert!(matches!(outcome, AppError::QuotaExceeded));
    }

    #[test]
    fn repeated_conflicts_with_quota_left_surface_the_conflict() {
        let outcome = conflict_outcome(Some((Some(3), 1)), sqlx::Error::PoolTimedOut);
        assert!(matches!(outcome, AppError::Db(_)));

        let unlimited = conflict_outcome(Some((None, 17)), sqlx::Error::PoolTimedOut);
        assert!(matches!(unlimited, AppError::Db(_)));
    }

    #[test]
    fn conflicts_on_a_missing_row_are_not_found() {
        let outcome = conflict_outcome(None, sqlx::Error::PoolTimedOut);
        assert!(matches!(outcome, AppError::NotFound));
    }
}
