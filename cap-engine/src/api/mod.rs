//! HTTP API handlers for cap-engine

pub mod admin;
pub mod buildinfo;
pub mod health;
pub mod listings;
pub mod sse;
pub mod tiers;
pub mod users;

pub use admin::{queue_status, retry_job, trigger_evaluation};
pub use buildinfo::get_build_info;
pub use health::health_routes;
pub use listings::{distribute_revenue, get_ledger};
pub use sse::event_stream;
pub use tiers::{get_tier_definition, list_tiers, reset_tiers, seed_tiers};
pub use users::{get_user_score, get_user_tier, record_engagement};
