//! Plan and add-on price catalog
//!
//! Static mapping between internal plans and Stripe price ids. Pure lookups,
//! no network access.

use std::str::FromStr;

use estate_shared::SubscriptionPlan;
use serde::{Deserialize, Serialize};

/// Stripe price ids for the paid plans
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub basic: String,
    pub professional: String,
    pub enterprise: String,
}

/// Stripe price ids for purchasable add-ons
#[derive(Debug, Clone, Default)]
pub struct AddonPriceIds {
    pub extra_properties: Option<String>,
    pub priority_support: Option<String>,
    pub document_storage: Option<String>,
}

/// Add-ons that can be attached to a plan at checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddonType {
    ExtraProperties,
    PrioritySupport,
    DocumentStorage,
}

impl AddonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddonType::ExtraProperties => "extra_properties",
            AddonType::PrioritySupport => "priority_support",
            AddonType::DocumentStorage => "document_storage",
        }
    }
}

impl FromStr for AddonType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "extra_properties" => Ok(AddonType::ExtraProperties),
            "priority_support" => Ok(AddonType::PrioritySupport),
            "document_storage" => Ok(AddonType::DocumentStorage),
            _ => Err(()),
        }
    }
}

/// Plan catalog shared by checkout, confirmation and the webhook dispatcher
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: PriceIds,
    addons: AddonPriceIds,
}

impl PlanCatalog {
    pub fn new(plans: PriceIds, addons: AddonPriceIds) -> Self {
        Self { plans, addons }
    }

    /// Price id for a plan, `None` for the free trial or an unconfigured plan
    pub fn price_id_for_plan(&self, plan: SubscriptionPlan) -> Option<&str> {
        let price = match plan {
            SubscriptionPlan::FreeTrial => return None,
            SubscriptionPlan::Basic => &self.plans.basic,
            SubscriptionPlan::Professional => &self.plans.professional,
            SubscriptionPlan::Enterprise => &self.plans.enterprise,
        };
        (!price.is_empty()).then_some(price.as_str())
    }

    /// Reverse lookup from a Stripe price id
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<SubscriptionPlan> {
        if price_id.is_empty() {
            return None;
        }
        SubscriptionPlan::PAID
            .into_iter()
            .find(|plan| self.price_id_for_plan(*plan) == Some(price_id))
    }

    /// Price id for an add-on given its wire name
    ///
    /// Unknown or unconfigured add-ons return `None` so callers can drop them.
    pub fn price_id_for_addon(&self, addon_type: &str) -> Option<&str> {
        let addon = addon_type.parse::<AddonType>().ok()?;
        let price = match addon {
            AddonType::ExtraProperties => self.addons.extra_properties.as_deref(),
            AddonType::PrioritySupport => self.addons.priority_support.as_deref(),
            AddonType::DocumentStorage => self.addons.document_storage.as_deref(),
        };
        price.filter(|p| !p.is_empty())
    }
}
