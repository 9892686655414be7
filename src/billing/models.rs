use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: billing-models -> canonical enums + subscription/payment rows

/// Requested output quality. Declaration order is the total order used for
/// ceiling comparisons: audio-only sorts below every numeric resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    #[serde(rename = "audio_only")]
    AudioOnly,
    #[serde(rename = "240p")]
    P240,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "1440p")]
    P1440,
    #[serde(rename = "2160p")]
    P2160,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::AudioOnly => "audio_only",
            Tier::P240 => "240p",
            Tier::P360 => "360p",
            Tier::P480 => "480p",
            Tier::P720 => "720p",
            Tier::P1080 => "1080p",
            Tier::P1440 => "1440p",
            Tier::P2160 => "2160p",
        }
    }

    pub fn from_str(raw: &str) -> Option<Tier> {
        match raw {
            "audio_only" => Some(Tier::AudioOnly),
            "240p" => Some(Tier::P240),
            "360p" => Some(Tier::P360),
            "480p" => Some(Tier::P480),
            "720p" => Some(Tier::P720),
            "1080p" => Some(Tier::P1080),
            "1440p" => Some(Tier::P1440),
            "2160p" => Some(Tier::P2160),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of purchasable plans. Prices, limits and durations live in
/// the static plan table (`plans.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "plan_kind", rename_all = "snake_case")]
pub enum PlanKind {
    Trial,
    OneTime,
    // snake_case would render "pack10"; the wire and column value is pack_10.
    #[serde(rename = "pack_10")]
    #[sqlx(rename = "pack_10")]
    Pack10,
    Monthly,
    Yearly,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Trial => "trial",
            PlanKind::OneTime => "one_time",
            PlanKind::Pack10 => "pack_10",
            PlanKind::Monthly => "monthly",
            PlanKind::Yearly => "yearly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Active,
    Expired,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }

    /// Monotonic transition guard: pending may complete or fail, a completed
    /// payment may only be refunded. Everything else is illegal.
    pub fn can_transition(&self, next: PaymentStatus) -> bool {
        matches!(
            (self, next),
            (PaymentStatus::Pending, PaymentStatus::Completed)
                | (PaymentStatus::Pending, PaymentStatus::Failed)
                | (PaymentStatus::Completed, PaymentStatus::Refunded)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    Qr,
    Manual,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::Qr => "qr",
            PaymentMethod::Manual => "manual",
        }
    }

    pub fn from_str(raw: &str) -> Option<PaymentMethod> {
        match raw {
            "card" => Some(PaymentMethod::Card),
            "qr" => Some(PaymentMethod::Qr),
            "manual" => Some(PaymentMethod::Manual),
            _ => None,
        }
    }
}

/// key: billing-subscription-model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: i32,
    pub kind: PlanKind,
    pub status: SubscriptionStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub downloads_limit: Option<i32>,
    pub downloads_used: i32,
    pub price: i64,
    pub payment_ref: Option<String>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Active status with an unexpired window and unexhausted quota.
    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        if self.status != SubscriptionStatus::Active {
            return false;
        }
        if let Some(end) = self.end_date {
            if end < now {
                return false;
            }
        }
        match self.downloads_limit {
            Some(limit) => self.downloads_used < limit,
            None => true,
        }
    }

    pub fn remaining_downloads(&self) -> Option<i32> {
        self.downloads_limit
            .map(|limit| (limit - self.downloads_used).max(0))
    }
}

/// key: billing-payment-model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: i32,
    pub subscription_id: Uuid,
    pub amount: i64,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub payment_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    WithinAnonymousCeiling,
    AboveAnonymousCeiling,
    DowngradedToCeiling,
    FreeBandUnmetered,
    TrialQuota,
    ActiveSubscription,
    NoActiveSubscription,
}

/// Transient output of entitlement evaluation; never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allow: bool,
    pub subscription_id: Option<Uuid>,
    /// The tier the caller may actually fetch (downgraded for anonymous
    /// principals when the downgrade policy is selected).
    pub tier: Tier,
    pub reason: DecisionReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_order_is_total_with_audio_only_lowest() {
        assert!(Tier::AudioOnly < Tier::P240);
        assert!(Tier::P240 < Tier::P360);
        assert!(Tier::P480 < Tier::P720);
        assert!(Tier::P1080 < Tier::P1440);
        assert!(Tier::P1440 < Tier::P2160);
        assert!(Tier::AudioOnly < Tier::P2160);
    }

    #[test]
    fn tier_string_round_trip() {
        for tier in [
            Tier::AudioOnly,
            Tier::P240,
            Tier::P360,
            Tier::P480,
            Tier::P720,
            Tier::P1080,
            Tier::P1440,
            Tier::P2160,
        ] {
            assert_eq!(Tier::from_str(tier.as_str()), Some(tier));
        }
        assert_eq!(Tier::from_str("4k"), None);
    }

    #[test]
    fn plan_kind_wire_names_match_canonical_strings() {
        for kind in [
            PlanKind::Trial,
            PlanKind::OneTime,
            PlanKind::Pack10,
            PlanKind::Monthly,
            PlanKind::Yearly,
        ] {
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, serde_json::Value::String(kind.as_str().to_string()));
            let back: PlanKind = serde_json::from_value(wire).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn payment_status_transitions_are_monotonic() {
        use PaymentStatus::*;
        assert!(Pending.can_transition(Completed));
        assert!(Pending.can_transition(Failed));
        assert!(Completed.can_transition(Refunded));

        assert!(!Completed.can_transition(Pending));
        assert!(!Completed.can_transition(Failed));
        assert!(!Failed.can_transition(Pending));
        assert!(!Failed.can_transition(Completed));
        assert!(!Refunded.can_transition(Completed));
        assert!(!Pending.can_transition(Refunded));
    }

    #[test]
    fn entitlement_respects_end_date_and_quota() {
        let now = Utc::now();
        let base = Subscription {
            id: Uuid::new_v4(),
            user_id: 1,
            kind: PlanKind::Pack10,
            status: SubscriptionStatus::Active,
            start_date: now,
            end_date: None,
            downloads_limit: Some(10),
            downloads_used: 0,
            price: 799,
            payment_ref: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };
        assert!(base.is_entitled(now));

        let exhausted = Subscription {
            downloads_used: 10,
            ..base.clone()
        };
        assert!(!exhausted.is_entitled(now));

        let expired = Subscription {
            downloads_limit: None,
            end_date: Some(now - chrono::Duration::hours(1)),
            ..base.clone()
        };
        assert!(!expired.is_entitled(now));

        let canceled = Subscription {
            status: SubscriptionStatus::Canceled,
            ..base
        };
        assert!(!canceled.is_entitled(now));
    }
}
