use axum::{
    body::Bytes,
    extract::{Extension, Path, Query},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{Principal, RequireAdmin, RequireUser};
use crate::config;
use crate::error::{AppError, AppResult};

use super::adapters::resolve_method;
use super::evaluator::{self, AnonymousPolicy};
use super::ledger::QuotaLedger;
use super::models::{
    Decision, DecisionReason, Payment, PaymentMethod, PaymentStatus, PlanKind, Subscription, Tier,
};
use super::orchestrator::{map_webhook_status, PaymentOrchestrator};
use super::plans::{self, Plan};
use super::reconciliation::ReconciliationHandle;
use super::service::SubscriptionService;

#[derive(Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
    pub trial_available: bool,
}

pub async fn list_plans(
    Extension(pool): Extension<PgPool>,
    principal: Principal,
) -> AppResult<Json<PlansResponse>> {
    let trial_available = match principal {
        Principal::User { user_id, .. } => {
            SubscriptionService::new(pool).trial_available(user_id).await?
        }
        Principal::Anonymous => false,
    };
    Ok(Json(PlansResponse {
        plans: plans::catalog(),
        trial_available,
    }))
}

#[derive(Deserialize)]
pub struct PurchaseRequest {
    pub kind: PlanKind,
    pub method: String,
}

#[derive(Serialize)]
pub struct PurchaseResponse {
    pub subscription: Subscription,
    pub payment: Payment,
}

pub async fn purchase(
    RequireUser(user_id): RequireUser,
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    Extension(jobs): Extension<ReconciliationHandle>,
    Json(payload): Json<PurchaseRequest>,
) -> AppResult<Json<PurchaseResponse>> {
    let method = resolve_method(&payload.method, *config::PAYMENT_FALLBACK_METHOD)
        .map_err(AppError::Validation)?;
    if method == PaymentMethod::Manual {
        return Err(AppError::Validation(
            "manual payments are admin-issued".to_string(),
        ));
    }
    let (subscription, payment) = orchestrator.purchase(user_id, payload.kind, method).await?;
    jobs.nudge();
    Ok(Json(PurchaseResponse {
        subscription,
        payment,
    }))
}

pub async fn list_payments(
    RequireUser(user_id): RequireUser,
    Extension(orchestrator): Extension<PaymentOrchestrator>,
) -> AppResult<Json<Vec<Payment>>> {
    Ok(Json(orchestrator.list_for_user(user_id).await?))
}

pub async fn get_payment(
    RequireUser(user_id): RequireUser,
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<Payment>> {
    let payment = orchestrator.get_payment(payment_id).await?;
    if payment.user_id != user_id {
        return Err(AppError::NotFound);
    }
    Ok(Json(payment))
}

#[derive(Serialize)]
pub struct PaymentStatusResponse {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
}

/// User-triggered poll of the provider, for the "did my payment go
/// through?" button.
pub async fn check_payment(
    RequireUser(user_id): RequireUser,
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<PaymentStatusResponse>> {
    let payment = orchestrator.get_payment(payment_id).await?;
    if payment.user_id != user_id {
        return Err(AppError::NotFound);
    }
    let status = orchestrator.check(payment_id).await?;
    Ok(Json(PaymentStatusResponse { payment_id, status }))
}

/// Landing endpoint for the gateway redirect. The token is single-use;
/// refreshing the page after redemption is a 404.
pub async fn payment_return(
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    Path(token): Path<String>,
) -> AppResult<Json<PaymentStatusResponse>> {
    let payment = orchestrator.redeem_return_token(&token).await?;
    Ok(Json(PaymentStatusResponse {
        payment_id: payment.id,
        status: payment.status,
    }))
}

#[derive(Deserialize)]
struct WebhookEnvelope {
    #[serde(default)]
    event: Option<String>,
    object: WebhookObject,
}

#[derive(Deserialize)]
struct WebhookObject {
    id: String,
    status: String,
}

/// Provider webhook. Signature verification runs over the raw body before
/// any parsing; unknown transaction ids are a 404 so the provider retries
/// once the purchase transaction lands.
pub async fn webhook(
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<serde_json::Value>> {
    if let Some(secret) = config::WEBHOOK_SIGNING_SECRET.as_deref() {
        let signature = headers
            .get("x-webhook-signature")
            .and_then(|value| value.to_str().ok())
            .ok_or(AppError::Unauthorized)?;
        verify_signature(secret, &body, signature)?;
    }

    let envelope: WebhookEnvelope = serde_json::from_slice(&body)
        .map_err(|err| AppError::Validation(format!("malformed webhook body: {err}")))?;
    let status = map_webhook_status(&envelope.object.status);
    info!(
        transaction_id = %envelope.object.id,
        event = envelope.event.as_deref().unwrap_or("-"),
        status = status.as_str(),
        "webhook received"
    );

    if status == PaymentStatus::Pending {
        // Informational event; nothing to transition.
        return Ok(Json(serde_json::json!({ "ok": true })));
    }
    orchestrator.report_status(&envelope.object.id, status).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

fn verify_signature(secret: &str, body: &[u8], signature: &str) -> AppResult<()> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Unauthorized)?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    if expected != signature.to_lowercase() {
        warn!("webhook signature mismatch");
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

pub async fn list_subscriptions(
    RequireUser(user_id): RequireUser,
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Vec<Subscription>>> {
    let service = SubscriptionService::new(pool);
    Ok(Json(service.list_for_user(user_id).await?))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn cancel_subscription(
    RequireUser(user_id): RequireUser,
    Extension(pool): Extension<PgPool>,
    Path(subscription_id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> AppResult<Json<Subscription>> {
    let service = SubscriptionService::new(pool);
    let subscription = service.get(subscription_id).await?;
    if subscription.user_id != user_id {
        return Err(AppError::NotFound);
    }
    let reason = payload.reason.as_deref().unwrap_or("user requested");
    Ok(Json(service.cancel(subscription_id, reason).await?))
}

#[derive(Deserialize)]
pub struct EntitlementQuery {
    pub tier: Tier,
    /// `deny` (default) or `downgrade`: what to do with anonymous requests
    /// above the ceiling.
    #[serde(default)]
    pub on_deny: Option<String>,
}

pub async fn evaluate_entitlement(
    principal: Principal,
    Extension(pool): Extension<PgPool>,
    Query(query): Query<EntitlementQuery>,
) -> AppResult<Json<Decision>> {
    let policy = match query.on_deny.as_deref() {
        Some("downgrade") => AnonymousPolicy::Downgrade,
        _ => AnonymousPolicy::Deny,
    };
    let service = SubscriptionService::new(pool);
    let decision = evaluator::evaluate(&service, &principal, query.tier, policy).await?;
    // Authenticated denial above the free band is a billing matter, not a
    // policy answer: surface it as 402. Anonymous denials keep the decision
    // body so the caller can apply its own ceiling handling.
    if !decision.allow && decision.reason == DecisionReason::NoActiveSubscription {
        return Err(AppError::PaymentRequired(format!(
            "no active subscription for tier {}",
            decision.tier
        )));
    }
    Ok(Json(decision))
}

#[derive(Deserialize)]
pub struct QuotaRequest {
    pub subscription_id: Uuid,
}

#[derive(Serialize)]
pub struct QuotaResponse {
    pub subscription_id: Uuid,
    pub remaining: Option<i32>,
}

/// Called once the download actually finished; this is the only place
/// quota is consumed.
pub async fn consume_quota(
    RequireUser(user_id): RequireUser,
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<QuotaRequest>,
) -> AppResult<Json<QuotaResponse>> {
    let service = SubscriptionService::new(pool.clone());
    if service.get(payload.subscription_id).await?.user_id != user_id {
        return Err(AppError::NotFound);
    }
    let outcome = QuotaLedger::new(pool).try_consume(payload.subscription_id).await?;
    if !outcome.ok {
        return Err(AppError::QuotaExceeded);
    }
    Ok(Json(QuotaResponse {
        subscription_id: payload.subscription_id,
        remaining: outcome.remaining,
    }))
}

/// Rolls one unit back after a failed download.
pub async fn release_quota(
    RequireUser(user_id): RequireUser,
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<QuotaRequest>,
) -> AppResult<Json<QuotaResponse>> {
    let service = SubscriptionService::new(pool.clone());
    if service.get(payload.subscription_id).await?.user_id != user_id {
        return Err(AppError::NotFound);
    }
    QuotaLedger::new(pool).release(payload.subscription_id).await?;
    let remaining = service
        .get(payload.subscription_id)
        .await?
        .remaining_downloads();
    Ok(Json(QuotaResponse {
        subscription_id: payload.subscription_id,
        remaining,
    }))
}

#[derive(Deserialize)]
pub struct GrantRequest {
    pub user_id: i32,
    pub kind: PlanKind,
    #[serde(default)]
    pub downloads_limit: Option<i32>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

pub async fn admin_grant(
    RequireAdmin(admin_id): RequireAdmin,
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    Json(payload): Json<GrantRequest>,
) -> AppResult<Json<PurchaseResponse>> {
    info!(admin_id, user_id = payload.user_id, kind = payload.kind.as_str(), "admin grant");
    let (subscription, payment) = orchestrator
        .grant(
            payload.user_id,
            payload.kind,
            payload.downloads_limit,
            payload.end_date,
        )
        .await?;
    Ok(Json(PurchaseResponse {
        subscription,
        payment,
    }))
}

#[derive(Deserialize)]
pub struct AdminPaymentUpdate {
    pub status: PaymentStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Manual override for stuck payments; goes through the same guarded
/// transition as webhooks and polls.
pub async fn admin_update_payment(
    RequireAdmin(admin_id): RequireAdmin,
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    Path(payment_id): Path<Uuid>,
    Json(payload): Json<AdminPaymentUpdate>,
) -> AppResult<Json<Payment>> {
    info!(admin_id, %payment_id, status = payload.status.as_str(), "admin payment override");
    let payment = orchestrator
        .report_status_by_id(payment_id, payload.status, payload.error_message.as_deref())
        .await?;
    Ok(Json(payment))
}

#[derive(Deserialize)]
pub struct AdminListQuery {
    #[serde(default)]
    pub user_id: Option<i32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub kind: Option<PlanKind>,
    #[serde(default)]
    pub method: Option<PaymentMethod>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl AdminListQuery {
    fn page(&self) -> (i64, i64) {
        (self.limit.unwrap_or(50).clamp(1, 500), self.offset.unwrap_or(0).max(0))
    }
}

pub async fn admin_list_subscriptions(
    RequireAdmin(_): RequireAdmin,
    Extension(pool): Extension<PgPool>,
    Query(query): Query<AdminListQuery>,
) -> AppResult<Json<Vec<Subscription>>> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            serde_json::from_value(serde_json::Value::String(raw.to_string()))
                .map_err(|_| AppError::Validation(format!("unknown status: {raw}")))
        })
        .transpose()?;
    let (limit, offset) = query.page();
    let service = SubscriptionService::new(pool);
    let subscriptions = service
        .admin_list(query.user_id, status, query.kind, limit, offset)
        .await?;
    Ok(Json(subscriptions))
}

pub async fn admin_list_payments(
    RequireAdmin(_): RequireAdmin,
    Extension(orchestrator): Extension<PaymentOrchestrator>,
    Query(query): Query<AdminListQuery>,
) -> AppResult<Json<Vec<Payment>>> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            serde_json::from_value(serde_json::Value::String(raw.to_string()))
                .map_err(|_| AppError::Validation(format!("unknown status: {raw}")))
        })
        .transpose()?;
    let (limit, offset) = query.page();
    let payments = orchestrator
        .admin_list(query.user_id, status, query.method, limit, offset)
        .await?;
    Ok(Json(payments))
}
