use std::sync::Arc;

use time::OffsetDateTime;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{error, info};

use crate::config::SweepSettings;
use crate::services::billing::BillingService;

/// Spawns the expiration sweep. The first pass runs immediately.
pub fn start_subscription_sweep(
    billing: Arc<BillingService>,
    settings: SweepSettings,
) -> JoinHandle<()> {
    info!(
        interval_secs = settings.interval.as_secs(),
        batch_size = settings.batch_size,
        "starting subscription sweep worker"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            run_sweep_once(&billing, settings.batch_size).await;
        }
    })
}

async fn run_sweep_once(billing: &BillingService, batch_size: i64) {
    if let Err(err) = billing
        .sweep_expired(OffsetDateTime::now_utc(), batch_size)
        .await
    {
        error!(?err, "subscription sweep failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use time::{Duration, OffsetDateTime};

    use super::start_subscription_sweep;
    use crate::config::SweepSettings;
    use crate::db::mock_db::{sample_user, MockDb};
    use crate::db::mock_stripe_event_log_repository::MockStripeEventLogRepository;
    use crate::models::user::{Role, SubscriptionStatus};
    use crate::services::billing::BillingService;
    use crate::services::smtp_mailer::MockMailer;
    use crate::services::stripe::MockStripeService;

    #[tokio::test]
    async fn first_tick_downgrades_lapsed_subscribers() {
        let mut user = sample_user("lapsed@moviolive.test");
        user.subscription.status = SubscriptionStatus::Active;
        user.subscription.subscription_id = Some("sub_lapsed".into());
        user.subscription.current_period_end =
            Some(OffsetDateTime::now_utc() - Duration::days(1));
        user.roles = vec![Role::Audience, Role::Organizer];
        let user_id = user.id;

        let db = Arc::new(MockDb::with_user(user));
        let stripe = Arc::new(MockStripeService::new());
        let billing = Arc::new(BillingService::new(
            db.clone(),
            db.clone(),
            Arc::new(MockStripeEventLogRepository::default()),
            stripe.clone(),
            Arc::new(MockMailer::default()),
            "https://moviolive.test",
        ));

        let handle = start_subscription_sweep(
            billing,
            SweepSettings {
                interval: StdDuration::from_secs(3600),
                batch_size: 10,
            },
        );

        let mut downgraded = false;
        for _ in 0..50 {
            if db.user(user_id).unwrap().subscription.status == SubscriptionStatus::Inactive {
                downgraded = true;
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(20)).await;
        }
        handle.abort();

        assert!(downgraded);
        assert_eq!(db.user(user_id).unwrap().roles, vec![Role::Audience]);
        assert_eq!(stripe.cancelled(), vec!["sub_lapsed".to_string()]);
    }
}
