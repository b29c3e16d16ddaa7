//! The subscription state machine. Every path that changes a user's billing
//! state goes through [`apply_transition`]; handlers only translate payloads
//! into [`BillingEvent`]s and carry out the side effects it asks for.

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::user::{BillingPeriod, Role, SubscriptionState, SubscriptionStatus};
use crate::utils::stripe_payload::{
    extract_bool, extract_customer_id, extract_i64, extract_str, extract_timestamp, jget,
};

/// The subset of a processor subscription object the reconciler reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub subscription_id: String,
    /// Raw processor status (`active`, `trialing`, `past_due`, `incomplete`...).
    pub status: String,
    pub plan_name: Option<String>,
    pub interval: Option<String>,
    pub billing_period: Option<BillingPeriod>,
    /// Price of the first line item in minor units.
    pub unit_amount: Option<i64>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub customer_id: Option<String>,
    pub user_id: Option<Uuid>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionSnapshot {
    /// Returns `None` when the object carries no subscription id.
    pub fn from_object(object: &Value) -> Option<Self> {
        let subscription_id = extract_str(object, &["id"])?.to_string();
        let item = first_line_item(object);

        let interval = item.and_then(item_interval).map(str::to_string);
        let plan_name = item.and_then(plan_name_for_item);
        let billing_period = interval.as_deref().and_then(BillingPeriod::parse);

        let current_period_start = extract_timestamp(object, &["current_period_start"])
            .or_else(|| item.and_then(|i| extract_timestamp(i, &["current_period_start"])));
        let current_period_end = extract_timestamp(object, &["current_period_end"])
            .or_else(|| item.and_then(|i| extract_timestamp(i, &["current_period_end"])));

        Some(Self {
            subscription_id,
            status: extract_str(object, &["status"])
                .unwrap_or("incomplete")
                .to_string(),
            plan_name,
            interval,
            billing_period,
            unit_amount: item.and_then(|i| {
                extract_i64(i, &["price", "unit_amount"])
                    .or_else(|| extract_i64(i, &["plan", "amount"]))
            }),
            current_period_start,
            current_period_end,
            customer_id: extract_customer_id(object),
            user_id: extract_str(object, &["metadata", "user_id"])
                .and_then(|s| Uuid::parse_str(s).ok()),
            cancel_at_period_end: extract_bool(object, &["cancel_at_period_end"]).unwrap_or(false),
        })
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    /// Daily passes are subscriptions that must not renew.
    pub fn is_daily(&self) -> bool {
        self.interval.as_deref() == Some("day")
            || self
                .plan_name
                .as_deref()
                .is_some_and(|n| n.to_ascii_lowercase().contains("daily"))
    }
}

fn first_line_item(object: &Value) -> Option<&Value> {
    jget(object, &["items", "data"])?
        .as_array()?
        .first()
        .filter(|item| item.is_object())
}

fn item_interval(item: &Value) -> Option<&str> {
    extract_str(item, &["price", "recurring", "interval"])
        .or_else(|| extract_str(item, &["plan", "interval"]))
}

/// `price.nickname`, then `plan.nickname`, then a name derived from the
/// billing interval.
pub fn plan_name_for_item(item: &Value) -> Option<String> {
    if let Some(name) = extract_str(item, &["price", "nickname"])
        .or_else(|| extract_str(item, &["plan", "nickname"]))
    {
        return Some(name.to_string());
    }
    let derived = match item_interval(item)? {
        "day" => "Daily Pass",
        "week" => "Weekly Pass",
        "month" => "Basic Monthly",
        "year" => "Premium Yearly",
        _ => return None,
    };
    Some(derived.to_string())
}

/// Plan name of the first line item of a subscription object.
pub fn plan_name_for_subscription(object: &Value) -> Option<String> {
    first_line_item(object).and_then(plan_name_for_item)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingEvent {
    CheckoutCompleted {
        subscription_id: Option<String>,
        plan_type: Option<String>,
        billing_period: Option<BillingPeriod>,
    },
    SubscriptionCreated(SubscriptionSnapshot),
    SubscriptionUpdated(SubscriptionSnapshot),
    SubscriptionDeleted {
        subscription_id: String,
    },
    /// Period elapsed or the user cancelled.
    Expire,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SubscriptionState,
    /// Roles derived from `next`; always what gets stored alongside it.
    pub roles: Vec<Role>,
    pub changed: bool,
    /// A different subscription the user held before this one.
    pub cancel_previous: Option<String>,
    /// Subscription that must be flagged `cancel_at_period_end` at the processor.
    pub schedule_cancel_at_period_end: Option<String>,
    pub note: &'static str,
}

impl Transition {
    fn new(
        current: &SubscriptionState,
        next: SubscriptionState,
        now: OffsetDateTime,
        note: &'static str,
    ) -> Self {
        Self {
            changed: &next != current,
            roles: next.roles_at(now),
            next,
            cancel_previous: None,
            schedule_cancel_at_period_end: None,
            note,
        }
    }

    fn unchanged(current: &SubscriptionState, now: OffsetDateTime, note: &'static str) -> Self {
        Self::new(current, current.clone(), now, note)
    }
}

fn is_subscription_plan_type(plan_type: Option<&str>) -> bool {
    match plan_type {
        None => true,
        Some(raw) => !matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "payment" | "one-time" | "one_time" | "pass"
        ),
    }
}

fn previous_to_cancel(current: &SubscriptionState, new_id: &str) -> Option<String> {
    current
        .subscription_id
        .as_deref()
        .filter(|old| *old != new_id)
        .map(str::to_string)
}

/// Adopts an active subscription snapshot as the user's state. Shared by
/// `created` and by `updated` events that introduce a new subscription id.
fn adopt(
    current: &SubscriptionState,
    snapshot: &SubscriptionSnapshot,
    now: OffsetDateTime,
    note: &'static str,
) -> Transition {
    let same_subscription =
        current.subscription_id.as_deref() == Some(snapshot.subscription_id.as_str());
    // Bounds of the same subscription only move forward.
    let keep_stored_period = same_subscription
        && matches!(
            (current.current_period_end, snapshot.current_period_end),
            (Some(stored), Some(incoming)) if incoming < stored
        );
    let (period_start, period_end) = if keep_stored_period {
        (current.current_period_start, current.current_period_end)
    } else {
        (
            snapshot
                .current_period_start
                .or_else(|| same_subscription.then_some(current.current_period_start).flatten()),
            snapshot
                .current_period_end
                .or_else(|| same_subscription.then_some(current.current_period_end).flatten()),
        )
    };

    let next = SubscriptionState {
        subscription_id: Some(snapshot.subscription_id.clone()),
        status: SubscriptionStatus::Active,
        plan_name: snapshot
            .plan_name
            .clone()
            .or_else(|| same_subscription.then(|| current.plan_name.clone()).flatten()),
        plan_type: current
            .plan_type
            .clone()
            .or_else(|| Some("subscription".to_string())),
        billing_period: snapshot
            .billing_period
            .or_else(|| same_subscription.then_some(current.billing_period).flatten()),
        current_period_start: period_start,
        current_period_end: period_end,
        has_active_pass: false,
    };

    let mut transition = Transition::new(current, next, now, note);
    transition.cancel_previous = previous_to_cancel(current, &snapshot.subscription_id);
    if snapshot.is_daily() && !snapshot.cancel_at_period_end {
        transition.schedule_cancel_at_period_end = Some(snapshot.subscription_id.clone());
    }
    transition
}

/// Computes the next state for `event`. Pure: no I/O, and applying the same
/// event to its own output yields `changed == false`.
pub fn apply_transition(
    current: &SubscriptionState,
    event: &BillingEvent,
    now: OffsetDateTime,
) -> Transition {
    match event {
        BillingEvent::CheckoutCompleted {
            subscription_id,
            plan_type,
            billing_period,
        } => {
            let Some(sub_id) = subscription_id.as_deref() else {
                return Transition::unchanged(current, now, "checkout without subscription");
            };
            if !is_subscription_plan_type(plan_type.as_deref()) {
                return Transition::unchanged(current, now, "checkout for non-subscription plan");
            }
            if current.subscription_id.as_deref() == Some(sub_id)
                && current.status == SubscriptionStatus::Active
            {
                return Transition::unchanged(current, now, "checkout already applied");
            }

            let mut next = current.clone();
            next.subscription_id = Some(sub_id.to_string());
            next.status = SubscriptionStatus::Active;
            if plan_type.is_some() {
                next.plan_type = plan_type.clone();
            }
            if billing_period.is_some() {
                next.billing_period = *billing_period;
            }
            next.has_active_pass = false;

            let mut transition = Transition::new(current, next, now, "checkout completed");
            transition.cancel_previous = previous_to_cancel(current, sub_id);
            transition
        }

        BillingEvent::SubscriptionCreated(snapshot) => {
            if !snapshot.is_active() {
                return Transition::unchanged(current, now, "subscription created in non-active status");
            }
            // A checkout completion stores the id without bounds; anything
            // with bounds has already seen this creation.
            if current.subscription_id.as_deref() == Some(snapshot.subscription_id.as_str())
                && current.status == SubscriptionStatus::Active
                && current.current_period_end.is_some()
            {
                return Transition::unchanged(current, now, "subscription creation already applied");
            }
            adopt(current, snapshot, now, "subscription created")
        }

        BillingEvent::SubscriptionUpdated(snapshot) => {
            let stored = current.subscription_id.as_deref();
            let is_stored = stored == Some(snapshot.subscription_id.as_str());

            if !is_stored && stored.is_some() {
                if snapshot.is_active() {
                    return adopt(current, snapshot, now, "subscription replaced by update");
                }
                return Transition::unchanged(current, now, "stale update for another subscription");
            }

            if snapshot.is_active() {
                adopt(current, snapshot, now, "subscription renewed")
            } else {
                Transition::new(
                    current,
                    SubscriptionState::inactive(),
                    now,
                    "subscription no longer active",
                )
            }
        }

        BillingEvent::SubscriptionDeleted { subscription_id } => {
            let matches_stored = match current.subscription_id.as_deref() {
                Some(stored) => stored == subscription_id,
                None => current.status == SubscriptionStatus::Active,
            };
            if !matches_stored {
                return Transition::unchanged(current, now, "deletion for another subscription");
            }
            Transition::new(
                current,
                SubscriptionState::inactive(),
                now,
                "subscription deleted",
            )
        }

        BillingEvent::Expire => Transition::new(
            current,
            SubscriptionState::inactive(),
            now,
            "subscription expired",
        ),
    }
}
