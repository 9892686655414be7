use chrono::Utc;

use crate::auth::Principal;
use crate::config;
use crate::error::AppResult;

use super::models::{Decision, DecisionReason, PlanKind, Tier};
use super::service::SubscriptionService;

/// What to do with an anonymous request above the ceiling: refuse it, or
/// serve the ceiling tier instead. The caller picks; there is no implicit
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymousPolicy {
    Deny,
    Downgrade,
}

/// Anonymous decisions never touch storage, so the rule is a plain function.
pub fn anonymous_decision(requested: Tier, ceiling: Tier, policy: AnonymousPolicy) -> Decision {
    if requested <= ceiling {
        return Decision {
            allow: true,
            subscription_id: None,
            tier: requested,
            reason: DecisionReason::WithinAnonymousCeiling,
        };
    }
    match policy {
        AnonymousPolicy::Deny => Decision {
            allow: false,
            subscription_id: None,
            tier: requested,
            reason: DecisionReason::AboveAnonymousCeiling,
        },
        AnonymousPolicy::Downgrade => Decision {
            allow: true,
            subscription_id: None,
            tier: ceiling,
            reason: DecisionReason::DowngradedToCeiling,
        },
    }
}

/// key: entitlement-evaluator -> read-path decision function
///
/// Mutates nothing except trial auto-provisioning; quota is only consumed
/// later, through the ledger, once the caller confirms the download.
pub async fn evaluate(
    service: &SubscriptionService,
    principal: &Principal,
    requested: Tier,
    anonymous_policy: AnonymousPolicy,
) -> AppResult<Decision> {
    let user_id = match principal {
        Principal::Anonymous => {
            return Ok(anonymous_decision(
                requested,
                *config::ANONYMOUS_MAX_TIER,
                anonymous_policy,
            ));
        }
        Principal::User { user_id, .. } => *user_id,
    };

    let now = Utc::now();
    let entitled = service.current_entitled(user_id, now).await?;

    if requested <= *config::FREE_TIER_CEILING {
        // A paid subscription, when present, still absorbs free-band
        // downloads so its counters reflect real usage.
        if let Some(subscription) = entitled.filter(|sub| sub.kind != PlanKind::Trial) {
            return Ok(Decision {
                allow: true,
                subscription_id: Some(subscription.id),
                tier: requested,
                reason: DecisionReason::ActiveSubscription,
            });
        }

        let trial = service.ensure_trial(user_id).await?;
        if trial.is_entitled(now) {
            return Ok(Decision {
                allow: true,
                subscription_id: Some(trial.id),
                tier: requested,
                reason: DecisionReason::TrialQuota,
            });
        }
        // Trial spent: the free band stays open, just unmetered.
        return Ok(Decision {
            allow: true,
            subscription_id: None,
            tier: requested,
            reason: DecisionReason::FreeBandUnmetered,
        });
    }

    match entitled {
        Some(subscription) => Ok(Decision {
            allow: true,
            subscription_id: Some(subscription.id),
            tier: requested,
            reason: DecisionReason::ActiveSubscription,
        }),
        None => Ok(Decision {
            allow: false,
            subscription_id: None,
            tier: requested,
            reason: DecisionReason::NoActiveSubscription,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_within_ceiling_allowed() {
        let decision = anonymous_decision(Tier::P360, Tier::P480, AnonymousPolicy::Deny);
        assert!(decision.allow);
        assert_eq!(decision.tier, Tier::P360);
        assert_eq!(decision.reason, DecisionReason::WithinAnonymousCeiling);
        assert!(decision.subscription_id.is_none());
    }

    #[test]
    fn anonymous_above_ceiling_denied() {
        let decision = anonymous_decision(Tier::P1080, Tier::P480, AnonymousPolicy::Deny);
        assert!(!decision.allow);
        assert_eq!(decision.reason, DecisionReason::AboveAnonymousCeiling);
    }

    #[test]
    fn anonymous_above_ceiling_downgraded_when_asked() {
        let decision = anonymous_decision(Tier::P2160, Tier::P480, AnonymousPolicy::Downgrade);
        assert!(decision.allow);
        assert_eq!(decision.tier, Tier::P480);
        assert_eq!(decision.reason, DecisionReason::DowngradedToCeiling);
    }

    #[test]
    fn ceiling_itself_is_allowed() {
        let decision = anonymous_decision(Tier::P480, Tier::P480, AnonymousPolicy::Deny);
        assert!(decision.allow);
        assert_eq!(decision.reason, DecisionReason::WithinAnonymousCeiling);
    }
}
