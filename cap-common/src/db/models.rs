//! Database models

use crate::CapLevel;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of the tier registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDefinition {
    pub tier: CapLevel,
    /// Minimum accumulated score; `None` is always satisfied
    pub min_activity_score: Option<i64>,
    /// Minimum volunteer hours; `None` is always satisfied
    pub min_volunteer_hours: Option<i64>,
    pub requires_verification: bool,
    pub requires_nomination: bool,
    /// Share of a listing's promotion budget credited to an author (0-100)
    pub ad_share_percentage: Decimal,
    pub can_access_marketplace: bool,
    pub can_access_volunteer_hub: bool,
    pub can_receive_brand_deals: bool,
    pub description: String,
}

impl TierDefinition {
    pub fn rank(&self) -> i64 {
        self.tier.rank()
    }
}

/// A user as seen by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub guid: Uuid,
    pub tier: CapLevel,
    pub verified: bool,
}

/// Per-user engagement counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementMetrics {
    pub user_id: Uuid,
    pub accumulated_score: i64,
    pub volunteer_hours: i64,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// Incremented by every successful evaluation; compare-and-set token
    pub evaluation_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonetizedListing {
    pub guid: Uuid,
    pub promotion_budget: Decimal,
    pub spent: Decimal,
}

impl MonetizedListing {
    /// Budget still available for distribution (never negative)
    pub fn remaining(&self) -> Decimal {
        (self.promotion_budget - self.spent).max(Decimal::ZERO)
    }
}

/// Kind of revenue credit recorded in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RevenueType {
    AdShare,
}

impl RevenueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevenueType::AdShare => "AD_SHARE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AD_SHARE" => Some(RevenueType::AdShare),
            _ => None,
        }
    }
}

/// Immutable revenue credit to a post author
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevenueLedgerEntry {
    pub guid: Uuid,
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub listing_id: Uuid,
    pub amount: Decimal,
    pub entry_type: RevenueType,
}
