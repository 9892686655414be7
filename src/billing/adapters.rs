use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::config;

use super::models::{Payment, PaymentMethod, PaymentStatus};

/// Provider failures split into retryable (timeout, 5xx, malformed reply)
/// and fatal (explicit decline). Retryable errors leave the payment
/// `pending` for the next poll cycle.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider timeout")]
    Timeout,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("payment declined: {0}")]
    Declined(String),
    #[error("provider protocol error: {0}")]
    Protocol(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Declined(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Unavailable(err.to_string())
        }
    }
}

/// Result of creating an intent at the provider. Gateways come back
/// `pending` with a confirmation URL; the manual backend completes
/// synchronously.
#[derive(Debug, Clone)]
pub struct ProviderIntent {
    pub transaction_id: String,
    pub confirmation_url: Option<String>,
    pub status: PaymentStatus,
}

/// key: payment-backend -> provider capability {initiate, check, cancel}
#[async_trait]
pub trait PaymentBackend: Send + Sync {
    fn method(&self) -> PaymentMethod;

    async fn initiate(
        &self,
        payment: &Payment,
        description: &str,
        return_url: &str,
    ) -> Result<ProviderIntent, ProviderError>;

    async fn check(&self, transaction_id: &str) -> Result<PaymentStatus, ProviderError>;

    async fn cancel(&self, transaction_id: &str) -> Result<(), ProviderError>;
}

/// Card and QR checkout against the external gateway. The two methods share
/// the wire protocol and differ only in the confirmation type requested.
pub struct GatewayBackend {
    method: PaymentMethod,
    wire_method: &'static str,
    client: reqwest::Client,
    endpoint: String,
    shop_id: Option<String>,
    secret_key: Option<String>,
}

impl GatewayBackend {
    pub fn new(
        method: PaymentMethod,
        endpoint: impl Into<String>,
        shop_id: Option<String>,
        secret_key: Option<String>,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let wire_method = match method {
            PaymentMethod::Card => "bank_card",
            PaymentMethod::Qr => "qr",
            PaymentMethod::Manual => {
                anyhow::bail!("manual payments do not go through the gateway")
            }
        };
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            method,
            wire_method,
            client,
            endpoint: endpoint.into(),
            shop_id,
            secret_key,
        })
    }

    pub fn from_config(method: PaymentMethod) -> anyhow::Result<Self> {
        Self::new(
            method,
            config::GATEWAY_ENDPOINT.clone(),
            config::GATEWAY_SHOP_ID.clone(),
            config::GATEWAY_SECRET_KEY.clone(),
            *config::GATEWAY_TIMEOUT_SECS,
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.shop_id, &self.secret_key) {
            (Some(shop), secret) => request.basic_auth(shop, secret.as_deref()),
            _ => request,
        }
    }
}

#[async_trait]
impl PaymentBackend for GatewayBackend {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn initiate(
        &self,
        payment: &Payment,
        description: &str,
        return_url: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        let body = serde_json::json!({
            "amount": { "value": payment.amount.to_string(), "currency": "RUB" },
            "confirmation": { "type": "redirect", "return_url": return_url },
            "capture": true,
            "description": description,
            "payment_method_data": { "type": self.wire_method },
            "metadata": { "payment_id": payment.id.to_string() },
        });

        let response = self
            .authorize(self.client.post(format!("{}/payments", self.endpoint)))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await?;

        let payload = read_gateway_reply(response).await?;
        let transaction_id = payload
            .get("id")
            .and_then(|value| value.as_str())
            .ok_or_else(|| ProviderError::Protocol("intent reply missing id".to_string()))?
            .to_string();
        let confirmation_url = payload
            .pointer("/confirmation/confirmation_url")
            .and_then(|value| value.as_str())
            .map(ToString::to_string);

        Ok(ProviderIntent {
            transaction_id,
            confirmation_url,
            status: PaymentStatus::Pending,
        })
    }

    async fn check(&self, transaction_id: &str) -> Result<PaymentStatus, ProviderError> {
        let response = self
            .authorize(
                self.client
                    .get(format!("{}/payments/{}", self.endpoint, transaction_id)),
            )
            .send()
            .await?;

        let payload = read_gateway_reply(response).await?;
        let status = payload
            .get("status")
            .and_then(|value| value.as_str())
            .ok_or_else(|| ProviderError::Protocol("status reply missing status".to_string()))?;

        Ok(map_gateway_status(status))
    }

    async fn cancel(&self, transaction_id: &str) -> Result<(), ProviderError> {
        let response = self
            .authorize(self.client.post(format!(
                "{}/payments/{}/cancel",
                self.endpoint, transaction_id
            )))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .send()
            .await?;

        read_gateway_reply(response).await?;
        Ok(())
    }
}

/// Admin-issued payments with no real money movement: the intent completes
/// immediately and checks always come back completed.
pub struct ManualBackend;

#[async_trait]
impl PaymentBackend for ManualBackend {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Manual
    }

    async fn initiate(
        &self,
        payment: &Payment,
        _description: &str,
        _return_url: &str,
    ) -> Result<ProviderIntent, ProviderError> {
        Ok(ProviderIntent {
            transaction_id: format!("manual-{}", payment.id),
            confirmation_url: None,
            status: PaymentStatus::Completed,
        })
    }

    async fn check(&self, _transaction_id: &str) -> Result<PaymentStatus, ProviderError> {
        Ok(PaymentStatus::Completed)
    }

    async fn cancel(&self, _transaction_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Gateway status vocabulary normalized to the internal enum.
pub fn map_gateway_status(status: &str) -> PaymentStatus {
    match status {
        "succeeded" => PaymentStatus::Completed,
        "canceled" => PaymentStatus::Failed,
        // pending, waiting_for_capture, anything unknown: keep polling.
        _ => PaymentStatus::Pending,
    }
}

async fn read_gateway_reply(
    response: reqwest::Response,
) -> Result<serde_json::Value, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| ProviderError::Protocol(err.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ProviderError::Unavailable(format!("{status}: {body}")))
    } else {
        Err(ProviderError::Declined(format!("{status}: {body}")))
    }
}

/// Explicit dispatch over the closed method set; no lookup-table fallback.
pub struct BackendRegistry {
    card: GatewayBackend,
    qr: GatewayBackend,
    manual: ManualBackend,
}

impl BackendRegistry {
    pub fn from_config() -> anyhow::Result<Self> {
        Ok(Self {
            card: GatewayBackend::from_config(PaymentMethod::Card)?,
            qr: GatewayBackend::from_config(PaymentMethod::Qr)?,
            manual: ManualBackend,
        })
    }

    pub fn select(&self, method: PaymentMethod) -> &dyn PaymentBackend {
        match method {
            PaymentMethod::Card => &self.card,
            PaymentMethod::Qr => &self.qr,
            PaymentMethod::Manual => &self.manual,
        }
    }
}

/// Boundary adapter for raw method strings. Unknown methods use the
/// configured fallback (logged) or are rejected when no fallback is set.
pub fn resolve_method(
    raw: &str,
    fallback: Option<PaymentMethod>,
) -> Result<PaymentMethod, String> {
    if let Some(method) = PaymentMethod::from_str(raw) {
        return Ok(method);
    }
    match fallback {
        Some(method) => {
            tracing::warn!(raw, fallback = method.as_str(), "unknown payment method, using fallback");
            Ok(method)
        }
        None => Err(format!("unknown payment method: {raw}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_status_mapping_table() {
        assert_eq!(map_gateway_status("succeeded"), PaymentStatus::Completed);
        assert_eq!(map_gateway_status("canceled"), PaymentStatus::Failed);
        assert_eq!(map_gateway_status("pending"), PaymentStatus::Pending);
        assert_eq!(
            map_gateway_status("waiting_for_capture"),
            PaymentStatus::Pending
        );
        assert_eq!(map_gateway_status("weird"), PaymentStatus::Pending);
    }

    #[test]
    fn unknown_method_uses_explicit_fallback_policy() {
        assert_eq!(resolve_method("card", None), Ok(PaymentMethod::Card));
        assert_eq!(
            resolve_method("sbp", Some(PaymentMethod::Card)),
            Ok(PaymentMethod::Card)
        );
        assert!(resolve_method("sbp", None).is_err());
    }

    #[test]
    fn decline_is_fatal_everything_else_retries() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Unavailable("502".to_string()).is_retryable());
        assert!(ProviderError::Protocol("bad json".to_string()).is_retryable());
        assert!(!ProviderError::Declined("card declined".to_string()).is_retryable());
    }
}
