use once_cell::sync::Lazy;

use crate::billing::models::{PaymentMethod, Tier};

/// Secret used for JWT signing. Must be set via the `JWT_SECRET` env variable.
pub static JWT_SECRET: Lazy<String> =
    Lazy::new(|| std::env::var("JWT_SECRET").expect("JWT_SECRET must be set"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// Highest tier served to anonymous principals. Defaults to `480p`.
pub static ANONYMOUS_MAX_TIER: Lazy<Tier> = Lazy::new(|| {
    std::env::var("ANONYMOUS_MAX_TIER")
        .ok()
        .and_then(|value| Tier::from_str(value.trim()))
        .unwrap_or(Tier::P480)
});

/// Upper bound of the unmetered free band for authenticated users. Defaults to `480p`.
pub static FREE_TIER_CEILING: Lazy<Tier> = Lazy::new(|| {
    std::env::var("FREE_TIER_CEILING")
        .ok()
        .and_then(|value| Tier::from_str(value.trim()))
        .unwrap_or(Tier::P480)
});

/// Downloads granted by the auto-provisioned trial subscription. Defaults to 3.
pub static TRIAL_DOWNLOADS_LIMIT: Lazy<i32> = Lazy::new(|| {
    std::env::var("TRIAL_DOWNLOADS_LIMIT")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

/// key: billing-config -> expiry sweep cadence
pub static EXPIRY_SWEEP_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("EXPIRY_SWEEP_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// key: billing-config -> pending payment poll cadence
pub static PAYMENT_POLL_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("PAYMENT_POLL_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(900)
});

/// key: billing-config -> housekeeping cadence
pub static HOUSEKEEPING_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("HOUSEKEEPING_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(86_400)
});

/// Pending payments younger than this are left alone by the poll sweep.
pub static PAYMENT_POLL_GRACE_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("PAYMENT_POLL_GRACE_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value >= 0)
        .unwrap_or(300)
});

/// Pending payments older than this are canceled at the provider and failed locally.
pub static PAYMENT_ABANDON_HOURS: Lazy<i64> = Lazy::new(|| {
    std::env::var("PAYMENT_ABANDON_HOURS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(24)
});

/// Base URL of the card/QR payment gateway API.
pub static GATEWAY_ENDPOINT: Lazy<String> = Lazy::new(|| {
    std::env::var("GATEWAY_ENDPOINT")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "http://127.0.0.1:9090/v3".to_string())
});

/// Shop identifier presented to the gateway as the basic-auth user.
pub static GATEWAY_SHOP_ID: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("GATEWAY_SHOP_ID"));

/// Secret key presented to the gateway as the basic-auth password.
pub static GATEWAY_SECRET_KEY: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("GATEWAY_SECRET_KEY"));

/// Bounded timeout for gateway calls. Defaults to 10 seconds.
pub static GATEWAY_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("GATEWAY_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(10)
});

/// URL the gateway redirects the payer back to after checkout.
pub static GATEWAY_RETURN_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("GATEWAY_RETURN_URL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "http://localhost:3000/payment/return".to_string())
});

/// Lifetime of one-shot payment return tokens. Defaults to one hour.
pub static RETURN_TOKEN_TTL_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("RETURN_TOKEN_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(3600)
});

/// HMAC secret for inbound webhook signatures. Unsigned webhooks are accepted when unset.
pub static WEBHOOK_SIGNING_SECRET: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("WEBHOOK_SIGNING_SECRET"));

/// key: billing-config -> backend used for unrecognized payment methods.
/// Empty string rejects unknown methods outright.
pub static PAYMENT_FALLBACK_METHOD: Lazy<Option<PaymentMethod>> = Lazy::new(|| {
    match std::env::var("PAYMENT_FALLBACK_METHOD") {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => PaymentMethod::from_str(value.trim()),
        Err(_) => Some(PaymentMethod::Card),
    }
});

/// Optional HTTP endpoint notifications are posted to. Log-only when unset.
pub static NOTIFY_ENDPOINT: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("NOTIFY_ENDPOINT"));

fn read_optional_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
