use serde::Serialize;

use crate::config;

use super::models::PlanKind;

/// Static, named bundle of price/quota/duration defining a subscription type.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub kind: PlanKind,
    pub name: &'static str,
    /// Price in minor currency units.
    pub price: i64,
    pub downloads_limit: Option<i32>,
    pub duration_days: Option<i64>,
}

/// key: billing-plans -> static plan table
pub fn plan(kind: PlanKind) -> Plan {
    match kind {
        PlanKind::Trial => Plan {
            kind,
            name: "Trial",
            price: 0,
            downloads_limit: Some(*config::TRIAL_DOWNLOADS_LIMIT),
            duration_days: None,
        },
        PlanKind::OneTime => Plan {
            kind,
            name: "Single download",
            price: 99,
            downloads_limit: Some(1),
            duration_days: None,
        },
        PlanKind::Pack10 => Plan {
            kind,
            name: "Pack of 10 downloads",
            price: 799,
            downloads_limit: Some(10),
            duration_days: None,
        },
        PlanKind::Monthly => Plan {
            kind,
            name: "Monthly unlimited",
            price: 1999,
            downloads_limit: None,
            duration_days: Some(30),
        },
        PlanKind::Yearly => Plan {
            kind,
            name: "Yearly unlimited",
            price: 15990,
            downloads_limit: None,
            duration_days: Some(365),
        },
    }
}

pub fn catalog() -> Vec<Plan> {
    [
        PlanKind::Trial,
        PlanKind::OneTime,
        PlanKind::Pack10,
        PlanKind::Monthly,
        PlanKind::Yearly,
    ]
    .into_iter()
    .map(plan)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_plans_carry_no_duration() {
        let trial = plan(PlanKind::Trial);
        assert_eq!(trial.price, 0);
        assert!(trial.duration_days.is_none());
        assert!(trial.downloads_limit.unwrap() > 0);
    }

    #[test]
    fn unlimited_plans_are_time_boxed() {
        for kind in [PlanKind::Monthly, PlanKind::Yearly] {
            let plan = plan(kind);
            assert!(plan.downloads_limit.is_none());
            assert!(plan.duration_days.unwrap() > 0);
            assert!(plan.price > 0);
        }
    }

    #[test]
    fn counted_plans_have_limits_and_prices() {
        assert_eq!(plan(PlanKind::OneTime).downloads_limit, Some(1));
        assert_eq!(plan(PlanKind::Pack10).downloads_limit, Some(10));
        assert_eq!(plan(PlanKind::Pack10).price, 799);
    }
}
