//! Revenue distribution
//!
//! Turns a monetized listing's promotion budget into ad-share credits for the
//! authors of the newest eligible posts. Attachments, ledger entries and the
//! listing's `spent` increment are committed in one transaction, and `spent`
//! never exceeds `promotion_budget`. Distributions serialize on the listing
//! row's write lock.

use cap_common::db::retry::DEFAULT_LOCK_WAIT;
use cap_common::db::{retry_on_lock, MonetizedListing, RevenueLedgerEntry, RevenueType};
use cap_common::events::{EngineEvent, EventBus};
use cap_common::{CapLevel, Error, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Why a distribution wrote nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    NonPositiveBudget,
    NoEligiblePosts,
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionReport {
    pub listing_id: Uuid,
    pub entries: Vec<RevenueLedgerEntry>,
    pub total: Decimal,
    /// Listing's cumulative spend after this distribution
    pub spent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DistributionOutcome {
    Distributed(DistributionReport),
    NoOp { reason: NoOpReason },
}

/// A selected post with its author's ad-share percentage
struct EligiblePost {
    post_id: Uuid,
    author_id: Uuid,
    tier: CapLevel,
    percentage: Decimal,
}

#[derive(Clone)]
pub struct RevenueDistributor {
    db: SqlitePool,
    event_bus: EventBus,
    post_cap: usize,
    lock_wait: Duration,
}

impl RevenueDistributor {
    pub fn new(db: SqlitePool, event_bus: EventBus, post_cap: usize) -> Self {
        Self {
            db,
            event_bus,
            post_cap,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// How long a distribution keeps retrying while the database is locked
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Distribute a listing's budget to the newest eligible posts
    ///
    /// Posts whose share no longer fits in the remaining budget are left
    /// unattached. Any error rolls back every write of this call.
    pub async fn distribute(&self, listing_id: Uuid) -> Result<DistributionOutcome> {
        let outcome = retry_on_lock("revenue distribution", self.lock_wait, || {
            self.distribute_once(listing_id)
        })
        .await?;

        if let DistributionOutcome::Distributed(report) = &outcome {
            info!(
                listing_id = %listing_id,
                posts = report.entries.len(),
                total = %report.total,
                spent = %report.spent,
                "Revenue distributed"
            );
            self.event_bus.emit_lossy(EngineEvent::RevenueDistributed {
                listing_id,
                post_count: report.entries.len(),
                total: report.total,
                timestamp: cap_common::time::now(),
            });
        }

        Ok(outcome)
    }

    async fn distribute_once(&self, listing_id: Uuid) -> Result<DistributionOutcome> {
        let mut tx = self.db.begin().await?;

        // Writing first takes the database write lock before anything is
        // read, so concurrent distributions queue on the busy timeout instead
        // of failing on a stale snapshot. Early returns drop `tx`, rolling
        // the touch back.
        let row = sqlx::query(
            r#"
            UPDATE monetized_listings
            SET updated_at = CURRENT_TIMESTAMP
            WHERE guid = ?
            RETURNING promotion_budget, spent
            "#,
        )
        .bind(listing_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Monetized listing {}", listing_id)))?;
        let listing = MonetizedListing {
            guid: listing_id,
            promotion_budget: decimal_column(&row, "promotion_budget")?,
            spent: decimal_column(&row, "spent")?,
        };

        if listing.promotion_budget <= Decimal::ZERO {
            debug!(listing_id = %listing_id, "Listing has no promotion budget");
            return Ok(DistributionOutcome::NoOp {
                reason: NoOpReason::NonPositiveBudget,
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT p.guid AS post_id, p.author_id, u.tier, td.ad_share_percentage
            FROM posts p
            JOIN users u ON u.guid = p.author_id
            LEFT JOIN tier_definitions td ON td.tier = u.tier
            WHERE u.tier != ?
              AND NOT EXISTS (
                  SELECT 1 FROM post_ad_attachments a
                  WHERE a.post_id = p.guid AND a.active = 1
              )
            ORDER BY p.created_at DESC, p.guid DESC
            LIMIT ?
            "#,
        )
        .bind(CapLevel::LOWEST.as_str())
        .bind(i64::try_from(self.post_cap).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            debug!(listing_id = %listing_id, "No eligible posts");
            return Ok(DistributionOutcome::NoOp {
                reason: NoOpReason::NoEligiblePosts,
            });
        }

        let mut posts = Vec::with_capacity(rows.len());
        for row in &rows {
            let tier: CapLevel = row.try_get::<String, _>("tier")?.parse()?;
            let percentage: Option<String> = row.try_get("ad_share_percentage")?;
            let percentage = percentage
                .ok_or_else(|| Error::NotFound(format!("Tier definition {}", tier)))?;
            posts.push(EligiblePost {
                post_id: Uuid::parse_str(&row.try_get::<String, _>("post_id")?)?,
                author_id: Uuid::parse_str(&row.try_get::<String, _>("author_id")?)?,
                tier,
                percentage: Decimal::from_str(&percentage)?,
            });
        }

        let remaining = listing.remaining();
        let mut total = Decimal::ZERO;
        let mut entries = Vec::with_capacity(posts.len());
        for post in &posts {
            let amount = (post.percentage / Decimal::ONE_HUNDRED)
                .checked_mul(listing.promotion_budget)
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "{}% share of budget {} on listing {} overflows",
                        post.percentage, listing.promotion_budget, listing_id
                    ))
                })?
                .normalize();

            // An overflowing sum is necessarily past the remaining budget
            let fits = total.checked_add(amount).map_or(false, |sum| sum <= remaining);
            if !fits {
                debug!(
                    listing_id = %listing_id,
                    post_id = %post.post_id,
                    %amount,
                    "Share exceeds remaining budget, post left unattached"
                );
                continue;
            }
            total += amount;
            entries.push(RevenueLedgerEntry {
                guid: Uuid::new_v4(),
                user_id: post.author_id,
                post_id: post.post_id,
                listing_id,
                amount,
                entry_type: RevenueType::AdShare,
            });
            debug!(post_id = %post.post_id, tier = %post.tier, %amount, "Crediting author");
        }

        if entries.is_empty() {
            info!(listing_id = %listing_id, %remaining, "Remaining budget too small for any share");
            return Ok(DistributionOutcome::NoOp {
                reason: NoOpReason::BudgetExhausted,
            });
        }

        let spent = listing
            .spent
            .checked_add(total)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Spent {} plus {} on listing {} overflows",
                    listing.spent, total, listing_id
                ))
            })?
            .normalize();

        for entry in &entries {
            sqlx::query(
                "INSERT INTO post_ad_attachments (guid, post_id, listing_id, active) VALUES (?, ?, ?, 1)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(entry.post_id.to_string())
            .bind(listing_id.to_string())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO revenue_ledger (guid, user_id, post_id, listing_id, amount, entry_type)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.guid.to_string())
            .bind(entry.user_id.to_string())
            .bind(entry.post_id.to_string())
            .bind(listing_id.to_string())
            .bind(entry.amount.to_string())
            .bind(entry.entry_type.as_str())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE monetized_listings SET spent = ? WHERE guid = ?")
            .bind(spent.to_string())
            .bind(listing_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(DistributionOutcome::Distributed(DistributionReport {
            listing_id,
            entries,
            total,
            spent,
        }))
    }

    pub async fn listing(&self, listing_id: Uuid) -> Result<MonetizedListing> {
        let row = sqlx::query("SELECT promotion_budget, spent FROM monetized_listings WHERE guid = ?")
            .bind(listing_id.to_string())
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Monetized listing {}", listing_id)))?;

        Ok(MonetizedListing {
            guid: listing_id,
            promotion_budget: decimal_column(&row, "promotion_budget")?,
            spent: decimal_column(&row, "spent")?,
        })
    }

    /// Ledger entries credited from one listing, oldest first
    pub async fn ledger(&self, listing_id: Uuid) -> Result<Vec<RevenueLedgerEntry>> {
        self.listing(listing_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT guid, user_id, post_id, amount, entry_type
            FROM revenue_ledger
            WHERE listing_id = ?
            ORDER BY created_at, guid
            "#,
        )
        .bind(listing_id.to_string())
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| {
                let entry_type: String = row.try_get("entry_type")?;
                Ok(RevenueLedgerEntry {
                    guid: Uuid::parse_str(&row.try_get::<String, _>("guid")?)?,
                    user_id: Uuid::parse_str(&row.try_get::<String, _>("user_id")?)?,
                    post_id: Uuid::parse_str(&row.try_get::<String, _>("post_id")?)?,
                    listing_id,
                    amount: decimal_column(row, "amount")?,
                    entry_type: RevenueType::parse(&entry_type).ok_or_else(|| {
                        Error::Internal(format!("Unknown ledger entry type '{}'", entry_type))
                    })?,
                })
            })
            .collect()
    }
}

fn decimal_column(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Decimal> {
    let text: String = row.try_get(column)?;
    Ok(Decimal::from_str(&text)?)
}
