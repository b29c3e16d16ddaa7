use time::OffsetDateTime;

/// Subject and plain-text body of an outbound billing email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub body: String,
}

fn format_amount(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

pub fn payment_confirmation(
    full_name: &str,
    plan_name: &str,
    unit_amount: Option<i64>,
    period_end: Option<OffsetDateTime>,
    is_daily: bool,
) -> EmailContent {
    let mut body = format!(
        "Hi {full_name},\n\nYour payment has been processed successfully. Welcome to MovioLive Premium!\n\nPlan: {plan_name}\n"
    );
    if let Some(cents) = unit_amount {
        body.push_str(&format!("Amount: {}\n", format_amount(cents)));
    }
    match (period_end, is_daily) {
        (Some(end), true) => {
            body.push_str(&format!("Valid until: {} (24 hours)\n", end.date()));
            body.push_str("Note: daily plans end automatically after 24 hours and do not renew.\n");
        }
        (Some(end), false) => body.push_str(&format!("Next billing: {}\n", end.date())),
        (None, true) => {
            body.push_str("Note: daily plans end automatically after 24 hours and do not renew.\n")
        }
        (None, false) => {}
    }
    body.push_str(
        "\nYour Organizer privileges are now active: you can host movie events for your audience.\n\nThank you for choosing MovioLive!\n",
    );

    EmailContent {
        subject: "Payment Successful - Welcome to MovioLive Premium!".to_string(),
        body,
    }
}

pub fn cancellation_confirmation(
    full_name: &str,
    plan_name: &str,
    cancelled_at: OffsetDateTime,
) -> EmailContent {
    let body = format!(
        "Hi {full_name},\n\nWe've processed your cancellation request.\n\nCancelled plan: {plan_name}\nCancellation date: {}\n\n\
         Your refund is being processed and will be credited to your original payment method within 5-7 business days.\n\n\
         Your account is now on the free Audience role. You can still join movie events hosted by others, and you can resubscribe anytime.\n\n\
         Thank you for being part of MovioLive!\n",
        cancelled_at.date()
    );
    EmailContent {
        subject: "Subscription Cancelled - Refund Processing".to_string(),
        body,
    }
}
