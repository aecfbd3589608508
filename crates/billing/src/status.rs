//! Stripe subscription status mapping

use estate_shared::SubscriptionStatus;

/// Map a Stripe subscription status onto the internal status
///
/// Unlisted or missing statuses yield `fallback`.
pub fn map_status(provider_status: Option<&str>, fallback: SubscriptionStatus) -> SubscriptionStatus {
    match provider_status.map(str::trim) {
        Some("active") => SubscriptionStatus::Active,
        Some("trialing") => SubscriptionStatus::Trial,
        Some("past_due" | "unpaid" | "paused") => SubscriptionStatus::Suspended,
        Some("canceled" | "cancelled" | "incomplete_expired") => SubscriptionStatus::Cancelled,
        Some("incomplete") => SubscriptionStatus::Pending,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_status_maps() {
        let table = [
            ("active", SubscriptionStatus::Active),
            ("trialing", SubscriptionStatus::Trial),
            ("past_due", SubscriptionStatus::Suspended),
            ("unpaid", SubscriptionStatus::Suspended),
            ("paused", SubscriptionStatus::Suspended),
            ("canceled", SubscriptionStatus::Cancelled),
            ("cancelled", SubscriptionStatus::Cancelled),
            ("incomplete_expired", SubscriptionStatus::Cancelled),
            ("incomplete", SubscriptionStatus::Pending),
        ];
        for (provider, expected) in table {
            // The fallback must never leak through for listed statuses
            assert_eq!(
                map_status(Some(provider), SubscriptionStatus::Trial),
                expected,
                "{provider}"
            );
            assert_eq!(
                map_status(Some(provider), SubscriptionStatus::Pending),
                expected,
                "{provider}"
            );
        }
    }

    #[test]
    fn test_unlisted_or_missing_status_uses_fallback() {
        for fallback in [SubscriptionStatus::Pending, SubscriptionStatus::Active] {
            assert_eq!(map_status(None, fallback), fallback);
            assert_eq!(map_status(Some(""), fallback), fallback);
            assert_eq!(map_status(Some("ACTIVE"), fallback), fallback);
            assert_eq!(map_status(Some("something_new"), fallback), fallback);
        }
    }
}
