//! Billing-facing domain enums shared across crates

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or user-supplied enum value is not recognized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Internal subscription status of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Pending,
    Trial,
    Active,
    Suspended,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "PENDING",
            SubscriptionStatus::Trial => "TRIAL",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Suspended => "SUSPENDED",
            SubscriptionStatus::Cancelled => "CANCELLED",
        }
    }

    /// Whether the account currently has access to paid features
    pub fn is_entitled(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trial)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(SubscriptionStatus::Pending),
            "TRIAL" => Ok(SubscriptionStatus::Trial),
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "SUSPENDED" => Ok(SubscriptionStatus::Suspended),
            "CANCELLED" => Ok(SubscriptionStatus::Cancelled),
            _ => Err(ParseEnumError {
                kind: "subscription status",
                value: s.to_string(),
            }),
        }
    }
}

/// Subscription plan an account is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionPlan {
    FreeTrial,
    Basic,
    Professional,
    Enterprise,
}

impl SubscriptionPlan {
    /// Plans that can be purchased through checkout
    pub const PAID: [SubscriptionPlan; 3] = [
        SubscriptionPlan::Basic,
        SubscriptionPlan::Professional,
        SubscriptionPlan::Enterprise,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::FreeTrial => "FREE_TRIAL",
            SubscriptionPlan::Basic => "BASIC",
            SubscriptionPlan::Professional => "PROFESSIONAL",
            SubscriptionPlan::Enterprise => "ENTERPRISE",
        }
    }

    /// Lower-case form used in provider metadata
    pub fn metadata_value(&self) -> &'static str {
        match self {
            SubscriptionPlan::FreeTrial => "free_trial",
            SubscriptionPlan::Basic => "basic",
            SubscriptionPlan::Professional => "professional",
            SubscriptionPlan::Enterprise => "enterprise",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionPlan::FreeTrial)
    }
}

impl fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionPlan {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "FREE_TRIAL" | "FREE" | "TRIAL" => Ok(SubscriptionPlan::FreeTrial),
            "BASIC" => Ok(SubscriptionPlan::Basic),
            "PROFESSIONAL" | "PRO" => Ok(SubscriptionPlan::Professional),
            "ENTERPRISE" => Ok(SubscriptionPlan::Enterprise),
            _ => Err(ParseEnumError {
                kind: "subscription plan",
                value: s.to_string(),
            }),
        }
    }
}

/// Role of an account inside its organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountRole {
    Owner,
    Admin,
    Manager,
    Member,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Owner => "OWNER",
            AccountRole::Admin => "ADMIN",
            AccountRole::Manager => "MANAGER",
            AccountRole::Member => "MEMBER",
        }
    }

    /// Owners and admins may manage billing
    pub fn is_elevated(&self) -> bool {
        matches!(self, AccountRole::Owner | AccountRole::Admin)
    }
}

impl fmt::Display for AccountRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountRole {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OWNER" => Ok(AccountRole::Owner),
            "ADMIN" => Ok(AccountRole::Admin),
            "MANAGER" => Ok(AccountRole::Manager),
            "MEMBER" => Ok(AccountRole::Member),
            _ => Err(ParseEnumError {
                kind: "account role",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_storage_form() {
        for status in [
            SubscriptionStatus::Pending,
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::Suspended,
            SubscriptionStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_plan_parse_is_case_insensitive() {
        assert_eq!("basic".parse(), Ok(SubscriptionPlan::Basic));
        assert_eq!("Professional".parse(), Ok(SubscriptionPlan::Professional));
        assert_eq!("free-trial".parse(), Ok(SubscriptionPlan::FreeTrial));
        assert!("platinum".parse::<SubscriptionPlan>().is_err());
    }

    #[test]
    fn test_plan_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&SubscriptionPlan::FreeTrial).unwrap();
        assert_eq!(json, "\"FREE_TRIAL\"");
    }

    #[test]
    fn test_only_owner_and_admin_are_elevated() {
        assert!(AccountRole::Owner.is_elevated());
        assert!(AccountRole::Admin.is_elevated());
        assert!(!AccountRole::Manager.is_elevated());
        assert!(!AccountRole::Member.is_elevated());
    }

    #[test]
    fn test_entitled_statuses() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trial.is_entitled());
        assert!(!SubscriptionStatus::Suspended.is_entitled());
    }
}
