//! Target resolution
//!
//! Works out which account or organization an event or request pertains to:
//! checkout metadata first, then stored subscription records by provider id,
//! then the checkout customer's email.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{Account, BillingStore};

pub const META_ACCOUNT_ID: &str = "account_id";
pub const META_ORGANIZATION_ID: &str = "organization_id";
pub const META_PLAN: &str = "plan";
pub const META_PROMO_CODE_ID: &str = "promo_code_id";

/// Account or organization a billing change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Account(Uuid),
    /// Every member account of the organization
    Organization(Uuid),
}

impl Target {
    /// Target for an account that billing reaches through a stored record or email
    pub fn for_account(account: &Account) -> Self {
        match account.organization_id {
            Some(org_id) => Target::Organization(org_id),
            None => Target::Account(account.id),
        }
    }

    /// Whether `account` is covered by this target
    pub fn covers(&self, account: &Account) -> bool {
        match self {
            Target::Account(id) => *id == account.id,
            Target::Organization(org_id) => account.organization_id == Some(*org_id),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Account(id) => write!(f, "account:{}", id),
            Target::Organization(id) => write!(f, "organization:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetSource {
    Metadata,
    CustomerRecord,
    SubscriptionRecord,
    Email,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub target: Target,
    pub source: TargetSource,
    /// Account the target was derived from, when it was loaded
    pub account: Option<Account>,
}

/// Inputs available for resolving a target
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetHints<'a> {
    pub metadata: Option<&'a HashMap<String, String>>,
    pub customer_id: Option<&'a str>,
    pub subscription_id: Option<&'a str>,
    pub email: Option<&'a str>,
}

/// Target from metadata alone: organization id wins over account id
pub fn target_from_metadata(metadata: &HashMap<String, String>) -> Option<Target> {
    let parse = |key: &str| {
        let raw = metadata.get(key)?.trim();
        if raw.is_empty() {
            return None;
        }
        match Uuid::parse_str(raw) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(key = key, value = %raw, "Ignoring malformed id in metadata");
                None
            }
        }
    };

    parse(META_ORGANIZATION_ID)
        .map(Target::Organization)
        .or_else(|| parse(META_ACCOUNT_ID).map(Target::Account))
}

pub struct TargetResolver {
    store: Arc<dyn BillingStore>,
}

impl TargetResolver {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Resolve a target, `Ok(None)` when nothing matches
    ///
    /// Storage failures propagate so the caller can retry later rather than
    /// treat the event as unresolvable.
    pub async fn resolve(&self, hints: TargetHints<'_>) -> BillingResult<Option<Resolution>> {
        if let Some(target) = hints.metadata.and_then(target_from_metadata) {
            let account = match target {
                Target::Account(id) => self.store.find_account(id).await?,
                Target::Organization(_) => None,
            };
            return Ok(Some(Resolution {
                target,
                source: TargetSource::Metadata,
                account,
            }));
        }

        if let Some(customer_id) = hints.customer_id {
            if let Some(record) = self.store.find_record_by_customer_id(customer_id).await? {
                if let Some(resolution) = self
                    .from_account_id(record.account_id, TargetSource::CustomerRecord)
                    .await?
                {
                    return Ok(Some(resolution));
                }
            }
        }

        if let Some(subscription_id) = hints.subscription_id {
            if let Some(record) = self
                .store
                .find_record_by_subscription_id(subscription_id)
                .await?
            {
                if let Some(resolution) = self
                    .from_account_id(record.account_id, TargetSource::SubscriptionRecord)
                    .await?
                {
                    return Ok(Some(resolution));
                }
            }
        }

        if let Some(email) = hints.email.map(str::trim).filter(|e| !e.is_empty()) {
            if let Some(account) = self.store.find_account_by_email(email).await? {
                return Ok(Some(Resolution {
                    target: Target::for_account(&account),
                    source: TargetSource::Email,
                    account: Some(account),
                }));
            }
        }

        Ok(None)
    }

    async fn from_account_id(
        &self,
        account_id: Uuid,
        source: TargetSource,
    ) -> BillingResult<Option<Resolution>> {
        let Some(account) = self.store.find_account(account_id).await? else {
            tracing::warn!(
                account_id = %account_id,
                "Subscription record points at a missing account"
            );
            return Ok(None);
        };
        Ok(Some(Resolution {
            target: Target::for_account(&account),
            source,
            account: Some(account),
        }))
    }
}
