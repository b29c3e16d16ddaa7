use core::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Audience,
    Organizer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Audience => "Audience",
            Role::Organizer => "Organizer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Audience" => Some(Role::Audience),
            "Organizer" => Some(Role::Organizer),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    #[default]
    Inactive,
    Canceled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(SubscriptionStatus::Active),
            "inactive" => Some(SubscriptionStatus::Inactive),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "past_due" => Some(SubscriptionStatus::PastDue),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingPeriod {
    #[serde(rename = "monthly")]
    Monthly,
    #[serde(rename = "yearly")]
    Yearly,
    #[serde(rename = "one-time")]
    OneTime,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Monthly => "monthly",
            BillingPeriod::Yearly => "yearly",
            BillingPeriod::OneTime => "one-time",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Some(BillingPeriod::Monthly),
            "yearly" | "year" | "annual" => Some(BillingPeriod::Yearly),
            "one-time" | "one_time" | "daily" | "day" => Some(BillingPeriod::OneTime),
            _ => None,
        }
    }
}

/// Billing fields of a user record. Always persisted as a unit so that a
/// transition never leaves half-updated state behind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub subscription_id: Option<String>,
    #[serde(rename = "subscription_status")]
    pub status: SubscriptionStatus,
    pub plan_name: Option<String>,
    pub plan_type: Option<String>,
    pub billing_period: Option<BillingPeriod>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    /// Legacy one-time-pass flag. Never grants access; only ever cleared.
    pub has_active_pass: bool,
}

impl SubscriptionState {
    /// The canonical shape every downgrade path converges on.
    pub fn inactive() -> Self {
        Self::default()
    }

    pub fn has_access_at(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Active
            && self.current_period_end.is_some_and(|end| end > now)
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.status == SubscriptionStatus::Active
            && self.current_period_end.is_some_and(|end| end <= now)
    }

    /// The only place `Organizer` is granted.
    pub fn roles_at(&self, now: OffsetDateTime) -> Vec<Role> {
        if self.has_access_at(now) {
            vec![Role::Audience, Role::Organizer]
        } else {
            vec![Role::Audience]
        }
    }

    /// True when there is nothing a user-initiated cancellation could act on.
    pub fn is_empty(&self) -> bool {
        self.subscription_id.is_none()
            && !matches!(
                self.status,
                SubscriptionStatus::Active | SubscriptionStatus::PastDue
            )
            && self.plan_name.is_none()
            && self.current_period_end.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub full_name: String,
    pub roles: Vec<Role>,
    pub stripe_customer_id: Option<String>,
    #[serde(flatten)]
    pub subscription: SubscriptionState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn active_until(end: OffsetDateTime) -> SubscriptionState {
        SubscriptionState {
            subscription_id: Some("sub_123".into()),
            status: SubscriptionStatus::Active,
            plan_name: Some("Basic Monthly".into()),
            plan_type: Some("subscription".into()),
            billing_period: Some(BillingPeriod::Monthly),
            current_period_start: Some(end - Duration::days(30)),
            current_period_end: Some(end),
            has_active_pass: false,
        }
    }

    #[test]
    fn organizer_granted_only_while_period_is_open() {
        let now = OffsetDateTime::now_utc();
        let open = active_until(now + Duration::days(3));
        assert_eq!(open.roles_at(now), vec![Role::Audience, Role::Organizer]);

        let elapsed = active_until(now - Duration::seconds(1));
        assert_eq!(elapsed.roles_at(now), vec![Role::Audience]);
        assert!(elapsed.is_expired_at(now));

        let mut no_end = active_until(now);
        no_end.current_period_end = None;
        assert_eq!(no_end.roles_at(now), vec![Role::Audience]);
    }

    #[test]
    fn non_active_status_never_grants_organizer() {
        let now = OffsetDateTime::now_utc();
        let mut past_due = active_until(now + Duration::days(3));
        past_due.status = SubscriptionStatus::PastDue;
        assert_eq!(past_due.roles_at(now), vec![Role::Audience]);
        assert!(!past_due.has_access_at(now));
    }

    #[test]
    fn inactive_shape_is_empty() {
        let state = SubscriptionState::inactive();
        assert!(state.is_empty());
        assert_eq!(state.status, SubscriptionStatus::Inactive);
        assert!(state.subscription_id.is_none());
        assert!(!state.has_active_pass);
    }

    #[test]
    fn billing_period_accepts_processor_intervals() {
        assert_eq!(BillingPeriod::parse("month"), Some(BillingPeriod::Monthly));
        assert_eq!(BillingPeriod::parse("Yearly"), Some(BillingPeriod::Yearly));
        assert_eq!(BillingPeriod::parse("day"), Some(BillingPeriod::OneTime));
        assert_eq!(BillingPeriod::parse("fortnight"), None);
    }

    #[test]
    fn user_serialization_hides_password_and_flattens_billing() {
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            email: "viewer@example.com".into(),
            password_hash: "secret-hash".into(),
            full_name: "Viewer".into(),
            roles: vec![Role::Audience],
            stripe_customer_id: None,
            subscription: SubscriptionState::inactive(),
            created_at: now,
            updated_at: now,
        };
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["subscription_status"], "inactive");
        assert_eq!(json["roles"], serde_json::json!(["Audience"]));
        assert!(json["subscription_id"].is_null());
    }
}
