//! Core domain model for chartwatch: ranked-chart rows, usage samples and
//! the per-item rank bookkeeping records.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "chartwatch-core";

/// Opaque numeric identifier assigned by the external storefront. The only
/// local validation is "non-zero"; everything else is the source's business.
pub type ItemId = u32;

/// Unix-seconds element of the externally curated master time grid.
pub type MasterTs = i64;

/// Table names used by the persistence layer.
pub mod tables {
    pub const RANK_HISTORY: &str = "rank_history";
    pub const RANK_CURRENT: &str = "rank_current";
    pub const MARKET_PAGES: &str = "market_pages";
    pub const USAGE_POINTS: &str = "usage_points";
    pub const RANK_STATS: &str = "rank_stats";
    pub const MASTER_TIMESTAMPS: &str = "master_timestamps";
}

/// Conflict keys for idempotent upserts, one per long-lived table.
pub mod conflict_keys {
    pub const RANK_CURRENT: &str = "market,item_id";
    pub const MARKET_PAGES: &str = "market";
    pub const USAGE_POINTS: &str = "item_id,ts";
    pub const RANK_STATS: &str = "market,item_id";
}

/// One observation from a single scrape pass, immutable once written.
/// `rank` is 1-based and dense in scrape order within one pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub item_id: ItemId,
    pub market: String,
    pub rank: u32,
    pub observed_ts: i64,
}

/// Latest standing of one item in one market. Exactly one row per
/// (market, item_id); replaced wholesale by each successful scrape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentRow {
    pub market: String,
    pub item_id: ItemId,
    pub rank: u32,
    pub updated_ts: i64,
}

/// Per-market front-page count derived from the deduplicated item total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketPages {
    pub market: String,
    pub total_pages: u32,
    pub updated_ts: i64,
}

/// Raw external metric observation with source-controlled spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSample {
    pub item_id: ItemId,
    pub captured_ts: i64,
    pub value: i64,
}

/// A usage value aligned onto one master timestamp. At most one per
/// (item_id, ts); re-running reconciliation overwrites idempotently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridPoint {
    pub item_id: ItemId,
    pub ts: MasterTs,
    pub value: i64,
}

/// One (rank, ts) pair retained for sliding-window best-rank recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankObservation {
    pub rank: u32,
    pub ts: i64,
}

/// Cumulative best-rank bookkeeping for one (market, item_id) key.
///
/// `best_alltime_rank` is monotone: it never exceeds any rank ever observed
/// for the key. `window_samples` holds recent observations, pruned to the
/// trailing window and capped in length, so the window best can expire
/// rather than ratchet forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankStats {
    pub market: String,
    pub item_id: ItemId,
    pub rank_now: u32,
    pub best_window_rank: u32,
    pub best_window_ts: i64,
    pub best_alltime_rank: u32,
    pub best_alltime_ts: i64,
    pub updated_ts: i64,
    #[serde(default)]
    pub window_samples: Vec<RankObservation>,
}
