use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::billing::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/billing/plans", get(api::list_plans))
        .route("/api/billing/purchase", post(api::purchase))
        .route("/api/billing/payments", get(api::list_payments))
        .route("/api/billing/payments/:id", get(api::get_payment))
        .route("/api/billing/payments/:id/check", post(api::check_payment))
        .route(
            "/api/billing/payments/return/:token",
            get(api::payment_return),
        )
        .route("/api/billing/webhook", post(api::webhook))
        .route("/api/billing/subscriptions", get(api::list_subscriptions))
        .route(
            "/api/billing/subscriptions/:id/cancel",
            post(api::cancel_subscription),
        )
        .route("/api/billing/entitlement", get(api::evaluate_entitlement))
        .route("/api/billing/quota/consume", post(api::consume_quota))
        .route("/api/billing/quota/release", post(api::release_quota))
        .route("/api/billing/admin/grant", post(api::admin_grant))
        .route(
            "/api/billing/admin/payments",
            get(api::admin_list_payments),
        )
        .route(
            "/api/billing/admin/payments/:id",
            patch(api::admin_update_payment),
        )
        .route(
            "/api/billing/admin/subscriptions",
            get(api::admin_list_subscriptions),
        )
}
