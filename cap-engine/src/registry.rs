//! Tier registry
//!
//! The ordered table of tier definitions: thresholds, eligibility gates,
//! ad-revenue share and capability flags. Definitions are only written by the
//! administrative seed/reset operations, never by evaluation.

use cap_common::db::TierDefinition;
use cap_common::{CapLevel, Error, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::{debug, info};

const SELECT_COLUMNS: &str = r#"
    SELECT tier, rank, min_activity_score, min_volunteer_hours,
           requires_verification, requires_nomination, ad_share_percentage,
           can_access_marketplace, can_access_volunteer_hub, can_receive_brand_deals,
           description
    FROM tier_definitions
"#;

/// Outcome of a seed operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    /// Definitions inserted or changed
    pub written: usize,
    /// Definitions already stored with identical values
    pub unchanged: usize,
}

/// Canonical tier table
pub fn canonical_definitions() -> Vec<TierDefinition> {
    let def = |tier: CapLevel,
               min_score: i64,
               min_hours: Option<i64>,
               verify: bool,
               nominate: bool,
               share: i64,
               flags: (bool, bool, bool),
               description: &str| TierDefinition {
        tier,
        min_activity_score: Some(min_score),
        min_volunteer_hours: min_hours,
        requires_verification: verify,
        requires_nomination: nominate,
        ad_share_percentage: Decimal::new(share, 0),
        can_access_marketplace: flags.0,
        can_access_volunteer_hub: flags.1,
        can_receive_brand_deals: flags.2,
        description: description.to_string(),
    };

    vec![
        def(CapLevel::None, 0, None, false, false, 0, (false, false, false),
            "New member without engagement history"),
        def(CapLevel::Green, 1, None, false, false, 2, (false, false, false),
            "Active member earning a small share of ad revenue"),
        def(CapLevel::Yellow, 50, None, false, false, 10, (true, false, false),
            "Regular contributor with marketplace access"),
        def(CapLevel::Red, 100, None, true, false, 15, (true, true, false),
            "Verified high-engagement member with volunteer hub access"),
        def(CapLevel::Black, 100, Some(320), true, false, 20, (true, true, true),
            "Verified member with 320+ volunteer hours, eligible for brand deals"),
        def(CapLevel::OstrichFeather, 100, Some(320), true, true, 25, (true, true, true),
            "Nominated community leader"),
    ]
}

/// Check a definition set before any of it is written
///
/// Rejects percentages outside 0-100, negative thresholds, duplicate tiers and
/// thresholds that decrease as rank increases. A null threshold counts as 0.
pub fn validate_definitions(definitions: &[TierDefinition]) -> Result<()> {
    let mut seen = HashSet::new();
    for def in definitions {
        if !seen.insert(def.tier) {
            return Err(Error::Config(format!("Duplicate tier definition: {}", def.tier)));
        }
        if def.ad_share_percentage < Decimal::ZERO || def.ad_share_percentage > Decimal::ONE_HUNDRED {
            return Err(Error::Config(format!(
                "{}: ad_share_percentage {} outside 0-100",
                def.tier, def.ad_share_percentage
            )));
        }
        if def.min_activity_score.is_some_and(|s| s < 0) {
            return Err(Error::Config(format!("{}: negative min_activity_score", def.tier)));
        }
        if def.min_volunteer_hours.is_some_and(|h| h < 0) {
            return Err(Error::Config(format!("{}: negative min_volunteer_hours", def.tier)));
        }
    }

    let mut ordered: Vec<&TierDefinition> = definitions.iter().collect();
    ordered.sort_by_key(|d| d.tier);
    for pair in ordered.windows(2) {
        let (lower, higher) = (pair[0], pair[1]);
        if higher.min_activity_score.unwrap_or(0) < lower.min_activity_score.unwrap_or(0) {
            return Err(Error::Config(format!(
                "{} min_activity_score is below {}",
                higher.tier, lower.tier
            )));
        }
        if higher.min_volunteer_hours.unwrap_or(0) < lower.min_volunteer_hours.unwrap_or(0) {
            return Err(Error::Config(format!(
                "{} min_volunteer_hours is below {}",
                higher.tier, lower.tier
            )));
        }
    }

    Ok(())
}

/// Tier registry backed by the `tier_definitions` table
#[derive(Clone)]
pub struct TierRegistry {
    db: SqlitePool,
}

impl TierRegistry {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Get one definition
    pub async fn get(&self, tier: CapLevel) -> Result<TierDefinition> {
        let row = sqlx::query(&format!("{} WHERE tier = ?", SELECT_COLUMNS))
            .bind(tier.as_str())
            .fetch_optional(&self.db)
            .await?;

        match row {
            Some(row) => definition_from_row(&row),
            None => Err(Error::NotFound(format!("Tier definition {}", tier))),
        }
    }

    /// All definitions, lowest rank first
    pub async fn list(&self) -> Result<Vec<TierDefinition>> {
        let rows = sqlx::query(&format!("{} ORDER BY rank ASC", SELECT_COLUMNS))
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(definition_from_row).collect()
    }

    /// All definitions, highest rank first (evaluation order)
    pub async fn list_descending(&self) -> Result<Vec<TierDefinition>> {
        let mut definitions = self.list().await?;
        definitions.reverse();
        Ok(definitions)
    }

    /// Upsert each definition by tier key
    ///
    /// The whole set is validated first; malformed input writes nothing.
    /// Each definition is then one atomic statement: a storage failure leaves
    /// earlier definitions committed and aborts the remainder.
    pub async fn seed(&self, definitions: &[TierDefinition]) -> Result<SeedReport> {
        validate_definitions(definitions)?;

        let mut report = SeedReport::default();
        for def in definitions {
            if upsert_definition(&self.db, def).await? {
                report.written += 1;
            } else {
                report.unchanged += 1;
            }
        }

        info!(
            written = report.written,
            unchanged = report.unchanged,
            "Tier definitions seeded"
        );
        Ok(report)
    }

    /// Seed the canonical defaults
    pub async fn seed_defaults(&self) -> Result<SeedReport> {
        self.seed(&canonical_definitions()).await
    }

    /// Delete every definition and reseed the canonical defaults atomically
    pub async fn reset(&self) -> Result<SeedReport> {
        let definitions = canonical_definitions();
        validate_definitions(&definitions)?;

        let mut tx = self.db.begin().await?;
        let deleted = sqlx::query("DELETE FROM tier_definitions")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let mut report = SeedReport::default();
        for def in &definitions {
            upsert_definition(&mut *tx, def).await?;
            report.written += 1;
        }
        tx.commit().await?;

        info!(deleted, written = report.written, "Tier definitions reset to defaults");
        Ok(report)
    }
}

/// Insert or update one definition; returns false when the stored row was identical
async fn upsert_definition<'e, E>(executor: E, def: &TierDefinition) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO tier_definitions (
            tier, rank, min_activity_score, min_volunteer_hours,
            requires_verification, requires_nomination, ad_share_percentage,
            can_access_marketplace, can_access_volunteer_hub, can_receive_brand_deals,
            description
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(tier) DO UPDATE SET
            rank = excluded.rank,
            min_activity_score = excluded.min_activity_score,
            min_volunteer_hours = excluded.min_volunteer_hours,
            requires_verification = excluded.requires_verification,
            requires_nomination = excluded.requires_nomination,
            ad_share_percentage = excluded.ad_share_percentage,
            can_access_marketplace = excluded.can_access_marketplace,
            can_access_volunteer_hub = excluded.can_access_volunteer_hub,
            can_receive_brand_deals = excluded.can_receive_brand_deals,
            description = excluded.description
        WHERE rank IS NOT excluded.rank
           OR min_activity_score IS NOT excluded.min_activity_score
           OR min_volunteer_hours IS NOT excluded.min_volunteer_hours
           OR requires_verification IS NOT excluded.requires_verification
           OR requires_nomination IS NOT excluded.requires_nomination
           OR ad_share_percentage IS NOT excluded.ad_share_percentage
           OR can_access_marketplace IS NOT excluded.can_access_marketplace
           OR can_access_volunteer_hub IS NOT excluded.can_access_volunteer_hub
           OR can_receive_brand_deals IS NOT excluded.can_receive_brand_deals
           OR description IS NOT excluded.description
        "#,
    )
    .bind(def.tier.as_str())
    .bind(def.rank())
    .bind(def.min_activity_score)
    .bind(def.min_volunteer_hours)
    .bind(def.requires_verification)
    .bind(def.requires_nomination)
    .bind(def.ad_share_percentage.normalize().to_string())
    .bind(def.can_access_marketplace)
    .bind(def.can_access_volunteer_hub)
    .bind(def.can_receive_brand_deals)
    .bind(&def.description)
    .execute(executor)
    .await?;

    let written = result.rows_affected() > 0;
    debug!(tier = %def.tier, written, "Upserted tier definition");
    Ok(written)
}

pub(crate) fn definition_from_row(row: &SqliteRow) -> Result<TierDefinition> {
    let tier: String = row.try_get("tier")?;
    let percentage: String = row.try_get("ad_share_percentage")?;

    Ok(TierDefinition {
        tier: tier.parse()?,
        min_activity_score: row.try_get("min_activity_score")?,
        min_volunteer_hours: row.try_get("min_volunteer_hours")?,
        requires_verification: row.try_get("requires_verification")?,
        requires_nomination: row.try_get("requires_nomination")?,
        ad_share_percentage: Decimal::from_str(&percentage)?,
        can_access_marketplace: row.try_get("can_access_marketplace")?,
        can_access_volunteer_hub: row.try_get("can_access_volunteer_hub")?,
        can_receive_brand_deals: row.try_get("can_receive_brand_deals")?,
        description: row.try_get("description")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::memory_db;

    #[test]
    fn test_canonical_definitions_are_valid() {
        let defs = canonical_definitions();
        assert_eq!(defs.len(), CapLevel::ALL.len());
        validate_definitions(&defs).unwrap();
    }

    #[test]
    fn test_validation_rejects_decreasing_threshold() {
        let mut defs = canonical_definitions();
        defs[3].min_activity_score = Some(10); // RED below YELLOW
        assert!(matches!(validate_definitions(&defs), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_bad_percentage_and_duplicates() {
        let mut defs = canonical_definitions();
        defs[1].ad_share_percentage = Decimal::new(101, 0);
        assert!(validate_definitions(&defs).is_err());

        let mut defs = canonical_definitions();
        defs.push(defs[0].clone());
        assert!(validate_definitions(&defs).is_err());
    }

    #[tokio::test]
    async fn test_seed_then_get_and_list() {
        let registry = TierRegistry::new(memory_db().await);
        let report = registry.seed_defaults().await.unwrap();
        assert_eq!(report.written, 6);

        let yellow = registry.get(CapLevel::Yellow).await.unwrap();
        assert_eq!(yellow.min_activity_score, Some(50));
        assert_eq!(yellow.ad_share_percentage, Decimal::new(10, 0));
        assert!(yellow.can_access_marketplace);

        let tiers: Vec<CapLevel> = registry.list().await.unwrap().iter().map(|d| d.tier).collect();
        assert_eq!(tiers, CapLevel::ALL.to_vec());

        let desc = registry.list_descending().await.unwrap();
        assert_eq!(desc[0].tier, CapLevel::OstrichFeather);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let registry = TierRegistry::new(memory_db().await);
        assert!(matches!(registry.get(CapLevel::Red).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_seed_twice_reports_unchanged() {
        let registry = TierRegistry::new(memory_db().await);
        registry.seed_defaults().await.unwrap();
        let second = registry.seed_defaults().await.unwrap();
        assert_eq!(second, SeedReport { written: 0, unchanged: 6 });
    }

    #[tokio::test]
    async fn test_malformed_seed_writes_nothing() {
        let registry = TierRegistry::new(memory_db().await);
        let mut defs = canonical_definitions();
        defs[5].min_volunteer_hours = Some(1); // below BLACK's 320

        assert!(registry.seed(&defs).await.is_err());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_restores_defaults() {
        let registry = TierRegistry::new(memory_db().await);
        let mut defs = canonical_definitions();
        defs[1].ad_share_percentage = Decimal::new(3, 0);
        defs[1].description = "custom".to_string();
        registry.seed(&defs).await.unwrap();

        registry.reset().await.unwrap();

        assert_eq!(registry.list().await.unwrap(), canonical_definitions());
    }
}
