//! The snapshot/reconciliation pipeline: partition scraping, snapshot
//! assembly, time-grid reconciliation, rank tracking, scheduling and the
//! top-level orchestrator that loops forever.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chartwatch_core::{
    conflict_keys, tables, CurrentRow, GridPoint, HistoryRow, ItemId, MarketPages, MasterTs,
    RankObservation, RankStats, UsageSample,
};
use chartwatch_source::{
    spawn_session_refresh, ApiKeySession, BackoffPolicy, MetricHistoryProvider,
    RankedListingProvider, RetryingFetcher,
};
use chartwatch_store::{
    to_rows, BatchWriter, BatchWriterConfig, PostgrestConfig, PostgrestStore, TableStore,
    WriteMode,
};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chartwatch-sync";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_url: String,
    pub store_service_key: String,
    pub listing_url: String,
    pub metric_url: Option<String>,
    pub api_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub registry_path: PathBuf,
    pub progress_path: PathBuf,
    pub max_pages: u32,
    pub page_size: u32,
    pub page_delay_ms: u64,
    pub front_page_size: u32,
    pub min_valid_items: usize,
    pub fetch_concurrency: usize,
    pub chunk_size: usize,
    pub insert_concurrency: usize,
    pub reconcile_window_secs: i64,
    pub rank_window_secs: i64,
    pub max_window_samples: usize,
    pub metric_top_items: usize,
    pub clear_current_before_write: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    /// Environment-driven configuration. Missing credentials are the one
    /// unrecoverable startup error; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let store_url = match std::env::var("CHARTWATCH_STORE_URL") {
            Ok(v) if !v.is_empty() => v,
            _ => bail!("CHARTWATCH_STORE_URL is required"),
        };
        let store_service_key = match std::env::var("CHARTWATCH_STORE_SERVICE_KEY") {
            Ok(v) if !v.is_empty() => v,
            _ => bail!("CHARTWATCH_STORE_SERVICE_KEY is required"),
        };

        Ok(Self {
            store_url,
            store_service_key,
            listing_url: std::env::var("CHARTWATCH_LISTING_URL").unwrap_or_else(|_| {
                "https://api.storefront.example/IStoreQueryService/Query/v1/".to_string()
            }),
            metric_url: std::env::var("CHARTWATCH_METRIC_URL").ok().filter(|v| !v.is_empty()),
            api_key: std::env::var("CHARTWATCH_API_KEY").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("CHARTWATCH_USER_AGENT")
                .unwrap_or_else(|_| "chartwatch/0.1".to_string()),
            http_timeout_secs: env_or("CHARTWATCH_HTTP_TIMEOUT_SECS", 40),
            registry_path: std::env::var("CHARTWATCH_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("partitions.yaml")),
            progress_path: std::env::var("CHARTWATCH_PROGRESS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("backfill-progress.json")),
            max_pages: env_or("CHARTWATCH_MAX_PAGES", 100),
            page_size: env_or("CHARTWATCH_PAGE_SIZE", 100),
            page_delay_ms: env_or("CHARTWATCH_PAGE_DELAY_MS", 30),
            front_page_size: env_or("CHARTWATCH_FRONT_PAGE_SIZE", 10),
            min_valid_items: env_or("CHARTWATCH_MIN_VALID_ITEMS", 500),
            fetch_concurrency: env_or("CHARTWATCH_FETCH_CONCURRENCY", 4),
            chunk_size: env_or("CHARTWATCH_CHUNK_SIZE", 1000),
            insert_concurrency: env_or("CHARTWATCH_INSERT_CONCURRENCY", 2),
            reconcile_window_secs: env_or("CHARTWATCH_RECONCILE_WINDOW_SECS", 1800),
            rank_window_secs: env_or("CHARTWATCH_RANK_WINDOW_SECS", 86_400),
            max_window_samples: env_or("CHARTWATCH_MAX_WINDOW_SAMPLES", 288),
            metric_top_items: env_or("CHARTWATCH_METRIC_TOP_ITEMS", 50),
            clear_current_before_write: std::env::var("CHARTWATCH_CLEAR_CURRENT")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Partition registry + scheduling policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PartitionRegistry {
    pub policy: PolicyKind,
    #[serde(default = "default_interval_minutes")]
    pub group_interval_minutes: u32,
    #[serde(default)]
    pub slot_minutes: Vec<u32>,
    pub groups: Vec<MarketGroup>,
}

fn default_interval_minutes() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    FixedSlot,
    RotatingGroup,
    AllParallel,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketGroup {
    pub markets: Vec<String>,
}

pub async fn load_registry(path: &std::path::Path) -> Result<PartitionRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// One orchestrator, pluggable scheduling; the three deployment shapes are
/// variants, not forks of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingPolicy {
    FixedSlot {
        slot_minutes: Vec<u32>,
        markets: Vec<String>,
    },
    RotatingGroup {
        interval_minutes: u32,
        groups: Vec<Vec<String>>,
    },
    AllParallel {
        interval_minutes: u32,
        markets: Vec<String>,
    },
}

pub fn policy_from_registry(registry: &PartitionRegistry) -> Result<SchedulingPolicy> {
    let all_markets: Vec<String> = registry
        .groups
        .iter()
        .flat_map(|g| g.markets.iter().cloned())
        .collect();
    if all_markets.is_empty() {
        bail!("partition registry defines no markets");
    }

    match registry.policy {
        PolicyKind::RotatingGroup => {
            let groups: Vec<Vec<String>> = registry
                .groups
                .iter()
                .map(|g| g.markets.clone())
                .filter(|g| !g.is_empty())
                .collect();
            if groups.is_empty() {
                bail!("rotating_group policy needs at least one non-empty group");
            }
            Ok(SchedulingPolicy::RotatingGroup {
                interval_minutes: registry.group_interval_minutes,
                groups,
            })
        }
        PolicyKind::FixedSlot => {
            let mut slots = registry.slot_minutes.clone();
            slots.sort_unstable();
            slots.dedup();
            if slots.is_empty() || slots.iter().any(|m| *m >= 60) {
                bail!("fixed_slot policy needs slot minutes in 0..60");
            }
            Ok(SchedulingPolicy::FixedSlot {
                slot_minutes: slots,
                markets: all_markets,
            })
        }
        PolicyKind::AllParallel => Ok(SchedulingPolicy::AllParallel {
            interval_minutes: registry.group_interval_minutes,
            markets: all_markets,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct RotationScheduler {
    policy: SchedulingPolicy,
}

fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let into_hour = i64::from(now.minute()) * 60 + i64::from(now.second());
    now - ChronoDuration::seconds(into_hour) - ChronoDuration::nanoseconds(i64::from(now.nanosecond()))
}

impl RotationScheduler {
    pub fn new(policy: SchedulingPolicy) -> Result<Self> {
        match &policy {
            SchedulingPolicy::RotatingGroup { interval_minutes, groups } => {
                if *interval_minutes == 0 || *interval_minutes > 60 {
                    bail!("group interval must be in 1..=60 minutes");
                }
                if groups.is_empty() {
                    bail!("rotating group policy has no groups");
                }
            }
            SchedulingPolicy::AllParallel { interval_minutes, .. } => {
                if *interval_minutes == 0 || *interval_minutes > 60 {
                    bail!("interval must be in 1..=60 minutes");
                }
            }
            SchedulingPolicy::FixedSlot { slot_minutes, .. } => {
                if slot_minutes.is_empty() || slot_minutes.iter().any(|m| *m >= 60) {
                    bail!("fixed slots must be minutes in 0..60");
                }
            }
        }
        Ok(Self { policy })
    }

    /// Which markets run in the cycle that owns `now`.
    pub fn current_group(&self, now: DateTime<Utc>) -> (usize, Vec<String>) {
        match &self.policy {
            SchedulingPolicy::RotatingGroup { interval_minutes, groups } => {
                let index = (now.minute() / interval_minutes) as usize % groups.len();
                (index, groups[index].clone())
            }
            SchedulingPolicy::FixedSlot { markets, .. }
            | SchedulingPolicy::AllParallel { markets, .. } => (0, markets.clone()),
        }
    }

    /// Next wall-clock instant aligned to the policy's boundary, strictly
    /// after `now`.
    pub fn next_wake(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour = hour_start(now);
        match &self.policy {
            SchedulingPolicy::RotatingGroup { interval_minutes, .. }
            | SchedulingPolicy::AllParallel { interval_minutes, .. } => {
                let boundary = (now.minute() / interval_minutes + 1) * interval_minutes;
                hour + ChronoDuration::minutes(i64::from(boundary))
            }
            SchedulingPolicy::FixedSlot { slot_minutes, .. } => {
                for slot in slot_minutes {
                    let candidate = hour + ChronoDuration::minutes(i64::from(*slot));
                    if candidate > now {
                        return candidate;
                    }
                }
                hour + ChronoDuration::minutes(60 + i64::from(slot_minutes[0]))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Partition scraper
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ScrapeOutcome {
    pub rows: Vec<HistoryRow>,
    pub pages_fetched: u32,
    /// A page failed after retries and pagination stopped with partial data.
    pub stopped_early: bool,
}

/// Drives the listing provider across pages for one market. The rank
/// counter is owned here and never shared; callers only get the finished
/// row list back.
pub struct PartitionScraper<'a> {
    provider: &'a dyn RankedListingProvider,
    max_pages: u32,
    page_size: u32,
    page_delay: Duration,
}

impl<'a> PartitionScraper<'a> {
    pub fn new(
        provider: &'a dyn RankedListingProvider,
        max_pages: u32,
        page_size: u32,
        page_delay: Duration,
    ) -> Self {
        Self {
            provider,
            max_pages,
            page_size,
            page_delay,
        }
    }

    pub async fn scrape(&self, market: &str, observed_ts: i64) -> ScrapeOutcome {
        let mut outcome = ScrapeOutcome::default();
        let mut rank: u32 = 1;

        for page in 1..=self.max_pages {
            if !self.page_delay.is_zero() {
                tokio::time::sleep(self.page_delay).await;
            }

            let items = match self.provider.fetch_page(market, page, self.page_size).await {
                Ok(items) => items,
                Err(err) => {
                    warn!(market, page, error = %err, "page failed, keeping partial scrape");
                    outcome.stopped_early = true;
                    break;
                }
            };
            outcome.pages_fetched += 1;
            if items.is_empty() {
                break;
            }

            for item_id in items {
                outcome.rows.push(HistoryRow {
                    item_id,
                    market: market.to_string(),
                    rank,
                    observed_ts,
                });
                rank += 1;
            }
        }

        outcome
    }
}

// ---------------------------------------------------------------------------
// Snapshot assembler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledSnapshot {
    /// Deduplicated rows keeping the raw scrape-order ranks.
    pub history: Vec<HistoryRow>,
    /// Same items renumbered 1..N in first-seen order.
    pub current: Vec<CurrentRow>,
    pub pages: MarketPages,
}

/// Deduplicates a raw scrape by item id (first occurrence wins) and gates
/// on the minimum-size threshold. `None` means the scrape was partial or
/// garbage and nothing must be persisted for the market this cycle.
pub fn assemble(
    raw_rows: Vec<HistoryRow>,
    min_valid_items: usize,
    front_page_size: u32,
    updated_ts: i64,
) -> Option<AssembledSnapshot> {
    let mut seen: HashSet<ItemId> = HashSet::with_capacity(raw_rows.len());
    let mut history = Vec::with_capacity(raw_rows.len());
    for row in raw_rows {
        if seen.insert(row.item_id) {
            history.push(row);
        }
    }

    if history.len() < min_valid_items {
        return None;
    }

    let market = history
        .first()
        .map(|row| row.market.clone())
        .unwrap_or_default();
    let current: Vec<CurrentRow> = history
        .iter()
        .enumerate()
        .map(|(index, row)| CurrentRow {
            market: row.market.clone(),
            item_id: row.item_id,
            rank: index as u32 + 1,
            updated_ts,
        })
        .collect();
    let total_pages = (history.len() as u32).div_ceil(front_page_size.max(1));

    Some(AssembledSnapshot {
        history,
        current,
        pages: MarketPages {
            market,
            total_pages,
            updated_ts,
        },
    })
}

// ---------------------------------------------------------------------------
// Time-grid reconciler
// ---------------------------------------------------------------------------

/// Aligns irregular usage samples onto the shared master grid. For every
/// master timestamp below `cutoff_ts`: exact sample match wins, else the
/// smallest sample timestamp in `[master_ts, master_ts + window_secs]` is
/// forward-filled. Never back-fills, never fabricates values.
pub fn reconcile(
    master_ts: &[MasterTs],
    samples: &[UsageSample],
    window_secs: i64,
    cutoff_ts: i64,
) -> Vec<GridPoint> {
    let mut grid: Vec<MasterTs> = master_ts
        .iter()
        .copied()
        .filter(|ts| *ts < cutoff_ts)
        .collect();
    grid.sort_unstable();
    grid.dedup();

    let mut by_item: BTreeMap<ItemId, (HashMap<i64, i64>, Vec<i64>)> = BTreeMap::new();
    for sample in samples {
        let (values, stamps) = by_item.entry(sample.item_id).or_default();
        values.insert(sample.captured_ts, sample.value);
        stamps.push(sample.captured_ts);
    }

    let mut out = Vec::new();
    for (item_id, (values, mut stamps)) in by_item {
        stamps.sort_unstable();
        stamps.dedup();

        // Single monotone cursor over the ascending grid; never rescans.
        let mut cursor = 0usize;
        for &ts in &grid {
            if let Some(&value) = values.get(&ts) {
                out.push(GridPoint { item_id, ts, value });
                continue;
            }
            while cursor < stamps.len() && stamps[cursor] < ts {
                cursor += 1;
            }
            if cursor < stamps.len() && stamps[cursor] <= ts + window_secs {
                out.push(GridPoint {
                    item_id,
                    ts,
                    value: values[&stamps[cursor]],
                });
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Rank tracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RankTracker {
    pub window_secs: i64,
    pub max_window_samples: usize,
}

impl Default for RankTracker {
    fn default() -> Self {
        Self {
            window_secs: 86_400,
            max_window_samples: 288,
        }
    }
}

impl RankTracker {
    /// Merges this cycle's observations with prior stored records. The
    /// all-time best only ratchets (ties keep the older timestamp); the
    /// window best is recomputed from the retained trailing samples so an
    /// old best expires out instead of sticking forever.
    pub fn merge(
        &self,
        market: &str,
        observations: &[(ItemId, u32)],
        observed_ts: i64,
        prior: &HashMap<ItemId, RankStats>,
    ) -> Vec<RankStats> {
        let window_floor = observed_ts - self.window_secs;

        observations
            .iter()
            .map(|&(item_id, rank)| {
                let prior_record = prior.get(&item_id);

                let (best_alltime_rank, best_alltime_ts) = match prior_record {
                    Some(p) if p.best_alltime_rank <= rank => {
                        (p.best_alltime_rank, p.best_alltime_ts)
                    }
                    _ => (rank, observed_ts),
                };

                let mut window_samples: Vec<RankObservation> = prior_record
                    .map(|p| p.window_samples.clone())
                    .unwrap_or_default();
                window_samples.retain(|s| s.ts > window_floor);
                window_samples.push(RankObservation {
                    rank,
                    ts: observed_ts,
                });
                if window_samples.len() > self.max_window_samples {
                    let excess = window_samples.len() - self.max_window_samples;
                    window_samples.drain(..excess);
                }

                let mut best_window_rank = rank;
                let mut best_window_ts = observed_ts;
                for sample in &window_samples {
                    if sample.rank < best_window_rank {
                        best_window_rank = sample.rank;
                        best_window_ts = sample.ts;
                    }
                }

                RankStats {
                    market: market.to_string(),
                    item_id,
                    rank_now: rank,
                    best_window_rank,
                    best_window_ts,
                    best_alltime_rank,
                    best_alltime_ts,
                    updated_ts: observed_ts,
                    window_samples,
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Market comparison report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketList {
    pub market: String,
    /// Item ids in rank order, rank = position + 1.
    pub items: Vec<ItemId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairComparison {
    pub market_a: String,
    pub market_b: String,
    pub overlap: usize,
    pub only_a: usize,
    pub only_b: usize,
    pub total_a: usize,
    pub total_b: usize,
    pub same_order: bool,
    pub avg_rank_delta: f64,
    pub overlap_pct: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub generated_ts: i64,
    pub markets_compared: usize,
    pub pairwise: Vec<PairComparison>,
    pub vs_baseline: Vec<PairComparison>,
}

pub fn compare_two(a: &MarketList, b: &MarketList) -> PairComparison {
    let set_b: HashSet<ItemId> = b.items.iter().copied().collect();
    let set_a: HashSet<ItemId> = a.items.iter().copied().collect();
    let overlap = a.items.iter().filter(|id| set_b.contains(id)).count();
    let only_a = a.items.iter().filter(|id| !set_b.contains(id)).count();
    let only_b = b.items.iter().filter(|id| !set_a.contains(id)).count();

    let rank_in_b: HashMap<ItemId, usize> = b
        .items
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index + 1))
        .collect();
    let mut deltas = Vec::new();
    for (index, id) in a.items.iter().enumerate() {
        if let Some(rank_b) = rank_in_b.get(id) {
            deltas.push(*rank_b as i64 - (index as i64 + 1));
        }
    }
    let same_order = deltas.iter().all(|d| *d == 0);
    let avg = if deltas.is_empty() {
        0.0
    } else {
        deltas.iter().sum::<i64>() as f64 / deltas.len() as f64
    };

    PairComparison {
        market_a: a.market.clone(),
        market_b: b.market.clone(),
        overlap,
        only_a,
        only_b,
        total_a: a.items.len(),
        total_b: b.items.len(),
        same_order,
        avg_rank_delta: (avg * 100.0).round() / 100.0,
        overlap_pct: if a.items.is_empty() {
            0
        } else {
            ((overlap as f64 / a.items.len() as f64) * 100.0).round() as u32
        },
    }
}

/// Pairwise overlap/ordering report across markets, plus a versus-baseline
/// view when the baseline market is present.
pub fn compare_markets(
    lists: &[MarketList],
    baseline: Option<&str>,
    generated_ts: i64,
) -> ComparisonReport {
    let mut pairwise = Vec::new();
    for i in 0..lists.len() {
        for j in (i + 1)..lists.len() {
            pairwise.push(compare_two(&lists[i], &lists[j]));
        }
    }

    let vs_baseline = baseline
        .and_then(|code| lists.iter().find(|l| l.market == code))
        .map(|base| {
            lists
                .iter()
                .filter(|l| l.market != base.market)
                .map(|other| compare_two(base, other))
                .collect()
        })
        .unwrap_or_default();

    ComparisonReport {
        generated_ts,
        markets_compared: lists.len(),
        pairwise,
        vs_baseline,
    }
}

// ---------------------------------------------------------------------------
// Resumable metric backfill
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillProgress {
    pub item_index: usize,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub items_processed: usize,
    pub pages_fetched: usize,
    pub grid_points_written: usize,
}

/// Walks a list of items through the cursor-paginated metric history,
/// persisting `{item_index, cursor}` after every page so a restart resumes
/// where it left off. A corrupt progress file is treated as absent.
pub struct MetricBackfill {
    provider: Arc<dyn MetricHistoryProvider>,
    store: Arc<dyn TableStore>,
    writer: BatchWriter,
    progress_path: PathBuf,
    window_secs: i64,
    max_pages_per_item: usize,
}

impl MetricBackfill {
    pub fn new(
        provider: Arc<dyn MetricHistoryProvider>,
        store: Arc<dyn TableStore>,
        writer: BatchWriter,
        progress_path: PathBuf,
        window_secs: i64,
    ) -> Self {
        Self {
            provider,
            store,
            writer,
            progress_path,
            window_secs,
            max_pages_per_item: 200,
        }
    }

    pub async fn load_progress(&self) -> BackfillProgress {
        match tokio::fs::read_to_string(&self.progress_path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(progress) => progress,
                Err(err) => {
                    warn!(
                        path = %self.progress_path.display(),
                        error = %err,
                        "corrupt progress file, restarting from zero"
                    );
                    BackfillProgress::default()
                }
            },
            Err(_) => BackfillProgress::default(),
        }
    }

    async fn save_progress(&self, progress: &BackfillProgress) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(progress).context("serializing progress")?;
        tokio::fs::write(&self.progress_path, bytes)
            .await
            .with_context(|| format!("writing {}", self.progress_path.display()))?;
        Ok(())
    }

    pub async fn run(
        &self,
        items: &[ItemId],
        master_ts: &[MasterTs],
        cutoff_ts: i64,
    ) -> Result<BackfillSummary> {
        let mut progress = self.load_progress().await;
        if progress.item_index > 0 {
            info!(
                item_index = progress.item_index,
                cursor = ?progress.cursor,
                "resuming metric backfill"
            );
        }

        let mut summary = BackfillSummary::default();
        while progress.item_index < items.len() {
            let item_id = items[progress.item_index];
            let mut samples: Vec<UsageSample> = Vec::new();
            let mut cursor = progress.cursor.take();

            for _ in 0..self.max_pages_per_item {
                let page = self
                    .provider
                    .fetch_history(item_id, cursor.as_deref())
                    .await
                    .with_context(|| format!("fetching metric history for item {item_id}"))?;
                summary.pages_fetched += 1;
                samples.extend(page.samples);
                cursor = page.next_cursor;

                self.save_progress(&BackfillProgress {
                    item_index: progress.item_index,
                    cursor: cursor.clone(),
                })
                .await?;

                if cursor.is_none() {
                    break;
                }
            }

            let points = reconcile(master_ts, &samples, self.window_secs, cutoff_ts);
            summary.grid_points_written += points.len();
            self.writer
                .write_chunked(
                    self.store.as_ref(),
                    tables::USAGE_POINTS,
                    to_rows(&points)?,
                    WriteMode::Upsert {
                        conflict_key: conflict_keys::USAGE_POINTS,
                    },
                )
                .await?;

            summary.items_processed += 1;
            progress = BackfillProgress {
                item_index: progress.item_index + 1,
                cursor: None,
            };
            self.save_progress(&progress).await?;
        }

        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Snapshot orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub group_index: usize,
    pub markets_selected: usize,
    pub markets_persisted: usize,
    pub history_rows: usize,
    pub grid_points: usize,
    pub rank_stats_rows: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Top-level driver. One cycle: pick the scheduled markets, scrape them
/// with bounded fan-out, assemble, persist, then merge rank stats and
/// reconcile usage metrics when a metric provider is wired in. One failing
/// market never aborts its siblings; a tick that fires while the previous
/// cycle still runs is dropped.
pub struct SnapshotOrchestrator {
    config: SyncConfig,
    scheduler: RotationScheduler,
    listing: Arc<dyn RankedListingProvider>,
    metrics: Option<Arc<dyn MetricHistoryProvider>>,
    store: Arc<dyn TableStore>,
    writer: BatchWriter,
    tracker: RankTracker,
    cycle_guard: Arc<Mutex<()>>,
    /// Background credential refresh task; aborted when the orchestrator
    /// is dropped.
    session_refresh: Option<tokio::task::JoinHandle<()>>,
}

impl Drop for SnapshotOrchestrator {
    fn drop(&mut self) {
        if let Some(handle) = self.session_refresh.take() {
            handle.abort();
        }
    }
}

impl SnapshotOrchestrator {
    pub fn new(
        config: SyncConfig,
        scheduler: RotationScheduler,
        listing: Arc<dyn RankedListingProvider>,
        metrics: Option<Arc<dyn MetricHistoryProvider>>,
        store: Arc<dyn TableStore>,
        session_refresh: Option<tokio::task::JoinHandle<()>>,
    ) -> Arc<Self> {
        let writer = BatchWriter::new(BatchWriterConfig {
            chunk_size: config.chunk_size,
            write_concurrency: config.insert_concurrency,
        });
        let tracker = RankTracker {
            window_secs: config.rank_window_secs,
            max_window_samples: config.max_window_samples,
        };
        Arc::new(Self {
            config,
            scheduler,
            listing,
            metrics,
            store,
            writer,
            tracker,
            cycle_guard: Arc::new(Mutex::new(())),
            session_refresh,
        })
    }

    pub fn scheduler(&self) -> &RotationScheduler {
        &self.scheduler
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleSummary> {
        let started_at = now;
        let observed_ts = now.timestamp();
        let run_id = Uuid::new_v4();
        let (group_index, markets) = self.scheduler.current_group(now);
        info!(%run_id, group_index, markets = markets.len(), "cycle start");

        // Bounded fan-out: markets scrape in slices of the concurrency cap.
        let mut assembled: Vec<AssembledSnapshot> = Vec::new();
        let concurrency = self.config.fetch_concurrency.max(1);
        for batch in markets.chunks(concurrency) {
            let scrapes = batch.iter().map(|market| async move {
                let scraper = PartitionScraper::new(
                    self.listing.as_ref(),
                    self.config.max_pages,
                    self.config.page_size,
                    Duration::from_millis(self.config.page_delay_ms),
                );
                let outcome = scraper.scrape(market, observed_ts).await;
                (market.clone(), outcome)
            });
            for (market, outcome) in futures::future::join_all(scrapes).await {
                match assemble(
                    outcome.rows,
                    self.config.min_valid_items,
                    self.config.front_page_size,
                    observed_ts,
                ) {
                    Some(snapshot) => assembled.push(snapshot),
                    None => warn!(
                        market,
                        pages = outcome.pages_fetched,
                        stopped_early = outcome.stopped_early,
                        "below item threshold, skipping market this cycle"
                    ),
                }
            }
        }

        let mut history_rows: Vec<HistoryRow> = Vec::new();
        for snapshot in &assembled {
            if self.config.clear_current_before_write {
                self.store
                    .delete(
                        tables::RANK_CURRENT,
                        &[("market".to_string(), snapshot.pages.market.clone())],
                    )
                    .await?;
            }
            self.writer
                .write_chunked(
                    self.store.as_ref(),
                    tables::RANK_CURRENT,
                    to_rows(&snapshot.current)?,
                    WriteMode::Upsert {
                        conflict_key: conflict_keys::RANK_CURRENT,
                    },
                )
                .await?;
            self.store
                .upsert(
                    tables::MARKET_PAGES,
                    &to_rows(std::slice::from_ref(&snapshot.pages))?,
                    conflict_keys::MARKET_PAGES,
                )
                .await?;
            history_rows.extend(snapshot.history.iter().cloned());
        }

        self.writer
            .write_chunked(
                self.store.as_ref(),
                tables::RANK_HISTORY,
                to_rows(&history_rows)?,
                WriteMode::Insert,
            )
            .await?;

        let mut rank_stats_rows = 0usize;
        for snapshot in &assembled {
            rank_stats_rows += self.track_market(snapshot, observed_ts).await?;
        }

        let grid_points = if self.metrics.is_some() {
            self.reconcile_metrics(&assembled, observed_ts).await?
        } else {
            0
        };

        let summary = CycleSummary {
            run_id,
            group_index,
            markets_selected: markets.len(),
            markets_persisted: assembled.len(),
            history_rows: history_rows.len(),
            grid_points,
            rank_stats_rows,
            started_at,
            finished_at: Utc::now(),
        };
        info!(
            %run_id,
            persisted = summary.markets_persisted,
            history = summary.history_rows,
            grid_points = summary.grid_points,
            "cycle done"
        );
        Ok(summary)
    }

    /// Read-merge-write of the per-key rank stats for one market.
    async fn track_market(
        &self,
        snapshot: &AssembledSnapshot,
        observed_ts: i64,
    ) -> Result<usize> {
        let market = snapshot.pages.market.as_str();
        let prior_rows = self
            .store
            .select(
                tables::RANK_STATS,
                &[("market".to_string(), market.to_string())],
                None,
            )
            .await?;
        let mut prior: HashMap<ItemId, RankStats> = HashMap::with_capacity(prior_rows.len());
        for row in prior_rows {
            match serde_json::from_value::<RankStats>(row) {
                Ok(record) => {
                    prior.insert(record.item_id, record);
                }
                Err(err) => warn!(market, error = %err, "skipping malformed rank stats row"),
            }
        }

        let observations: Vec<(ItemId, u32)> = snapshot
            .current
            .iter()
            .map(|row| (row.item_id, row.rank))
            .collect();
        let merged = self
            .tracker
            .merge(market, &observations, observed_ts, &prior);
        let written = merged.len();
        self.writer
            .write_chunked(
                self.store.as_ref(),
                tables::RANK_STATS,
                to_rows(&merged)?,
                WriteMode::Upsert {
                    conflict_key: conflict_keys::RANK_STATS,
                },
            )
            .await?;
        Ok(written)
    }

    /// Fetches the latest metric history page for the top items of this
    /// cycle and aligns it onto the master grid.
    async fn reconcile_metrics(
        &self,
        assembled: &[AssembledSnapshot],
        cutoff_ts: i64,
    ) -> Result<usize> {
        let Some(provider) = &self.metrics else {
            return Ok(0);
        };

        let master = self.load_master_timestamps().await?;
        if master.is_empty() {
            warn!("master timestamp grid is empty, skipping reconciliation");
            return Ok(0);
        }

        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut top_items: Vec<ItemId> = Vec::new();
        for snapshot in assembled {
            for row in &snapshot.current {
                if top_items.len() >= self.config.metric_top_items {
                    break;
                }
                if seen.insert(row.item_id) {
                    top_items.push(row.item_id);
                }
            }
        }

        let mut samples: Vec<UsageSample> = Vec::new();
        for item_id in top_items {
            match provider.fetch_history(item_id, None).await {
                Ok(page) => samples.extend(page.samples),
                Err(err) => {
                    warn!(item_id, error = %err, "metric history fetch failed, skipping item")
                }
            }
        }

        let points = reconcile(&master, &samples, self.config.reconcile_window_secs, cutoff_ts);
        let written = points.len();
        self.writer
            .write_chunked(
                self.store.as_ref(),
                tables::USAGE_POINTS,
                to_rows(&points)?,
                WriteMode::Upsert {
                    conflict_key: conflict_keys::USAGE_POINTS,
                },
            )
            .await?;
        Ok(written)
    }

    async fn load_master_timestamps(&self) -> Result<Vec<MasterTs>> {
        let rows = self
            .store
            .select(tables::MASTER_TIMESTAMPS, &[], None)
            .await?;
        let mut out: Vec<MasterTs> = rows
            .iter()
            .filter_map(|row| row.get("ts").and_then(serde_json::Value::as_i64))
            .collect();
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    /// The forever loop. Sleeps to the next policy boundary, then runs one
    /// cycle off-loop under a try-lock so an overrunning cycle makes the
    /// next tick a no-op instead of a pile-up.
    pub async fn run_forever(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let wake = self.scheduler.next_wake(now);
            let wait = (wake - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            let Ok(guard) = self.cycle_guard.clone().try_lock_owned() else {
                warn!("previous cycle still running, dropping this tick");
                continue;
            };

            let orchestrator = self.clone();
            tokio::spawn(async move {
                let _running = guard;
                match orchestrator.run_cycle(Utc::now()).await {
                    Ok(summary) => info!(run_id = %summary.run_id, "cycle completed"),
                    Err(err) => warn!(error = %err, "cycle failed, waiting for next slot"),
                }
            });
        }
    }
}

/// How often the background task checks whether the session credential
/// needs refreshing.
const SESSION_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Wires the production orchestrator from environment configuration: the
/// PostgREST store, the retrying fetcher (with the API-key session when
/// configured, refreshed by a background task the orchestrator owns) and
/// both HTTP providers.
pub async fn build_orchestrator(config: SyncConfig) -> Result<Arc<SnapshotOrchestrator>> {
    let registry = load_registry(&config.registry_path).await?;
    let policy = policy_from_registry(&registry)?;
    let scheduler = RotationScheduler::new(policy)?;

    let store: Arc<dyn TableStore> = Arc::new(PostgrestStore::new(PostgrestConfig::new(
        config.store_url.clone(),
        config.store_service_key.clone(),
    ))?);

    let session = config
        .api_key
        .as_ref()
        .map(|key| ApiKeySession::new(key.clone()) as Arc<dyn chartwatch_source::SessionCredential>);
    let session_refresh = session
        .as_ref()
        .map(|s| spawn_session_refresh(s.clone(), SESSION_REFRESH_INTERVAL));
    let fetcher = RetryingFetcher::new(
        Duration::from_secs(config.http_timeout_secs),
        &config.user_agent,
        BackoffPolicy::default(),
        session,
    )?;

    let listing: Arc<dyn RankedListingProvider> = Arc::new(
        chartwatch_source::HttpListingProvider::new(fetcher.clone(), config.listing_url.clone()),
    );
    let metrics: Option<Arc<dyn MetricHistoryProvider>> = config.metric_url.as_ref().map(|url| {
        Arc::new(chartwatch_source::HttpMetricProvider::new(
            fetcher.clone(),
            url.clone(),
        )) as Arc<dyn MetricHistoryProvider>
    });

    Ok(SnapshotOrchestrator::new(
        config,
        scheduler,
        listing,
        metrics,
        store,
        session_refresh,
    ))
}

/// How many leading ranks the comparison report samples per market.
const COMPARE_SAMPLE_SIZE: u32 = 1000;

/// Fetches every configured market's leading ranks in parallel and writes
/// the pairwise overlap report as JSON. Markets that fail to fetch are
/// reported and left out of the comparison.
pub async fn run_market_comparison(
    config: &SyncConfig,
    baseline: Option<&str>,
    out_path: &std::path::Path,
) -> Result<ComparisonReport> {
    let registry = load_registry(&config.registry_path).await?;
    let markets: Vec<String> = registry
        .groups
        .iter()
        .flat_map(|g| g.markets.iter().cloned())
        .collect();

    let session = config
        .api_key
        .as_ref()
        .map(|key| ApiKeySession::new(key.clone()) as Arc<dyn chartwatch_source::SessionCredential>);
    let fetcher = RetryingFetcher::new(
        Duration::from_secs(config.http_timeout_secs),
        &config.user_agent,
        BackoffPolicy::default(),
        session,
    )?;
    let provider =
        chartwatch_source::HttpListingProvider::new(fetcher, config.listing_url.clone());

    let fetches = markets.iter().map(|market| {
        let provider = &provider;
        async move {
            let result = provider.fetch_page(market, 1, COMPARE_SAMPLE_SIZE).await;
            (market.clone(), result)
        }
    });

    let mut lists = Vec::new();
    for (market, result) in futures::future::join_all(fetches).await {
        match result {
            Ok(items) if !items.is_empty() => lists.push(MarketList { market, items }),
            Ok(_) => warn!(market, "empty listing, leaving market out of comparison"),
            Err(err) => warn!(market, error = %err, "fetch failed, leaving market out"),
        }
    }

    let report = compare_markets(&lists, baseline, Utc::now().timestamp());
    let bytes = serde_json::to_vec_pretty(&report).context("serializing comparison report")?;
    tokio::fs::write(out_path, bytes)
        .await
        .with_context(|| format!("writing {}", out_path.display()))?;
    Ok(report)
}

/// Bulk metric backfill over the currently charted items, resumable via the
/// configured progress file.
pub async fn run_backfill(config: SyncConfig) -> Result<BackfillSummary> {
    let Some(metric_url) = config.metric_url.clone() else {
        bail!("CHARTWATCH_METRIC_URL is required for backfill");
    };

    let store: Arc<dyn TableStore> = Arc::new(PostgrestStore::new(PostgrestConfig::new(
        config.store_url.clone(),
        config.store_service_key.clone(),
    ))?);
    let session = config
        .api_key
        .as_ref()
        .map(|key| ApiKeySession::new(key.clone()) as Arc<dyn chartwatch_source::SessionCredential>);
    let fetcher = RetryingFetcher::new(
        Duration::from_secs(config.http_timeout_secs),
        &config.user_agent,
        BackoffPolicy::default(),
        session,
    )?;
    let provider: Arc<dyn MetricHistoryProvider> = Arc::new(
        chartwatch_source::HttpMetricProvider::new(fetcher, metric_url),
    );

    let current_rows = store.select(tables::RANK_CURRENT, &[], None).await?;
    let mut seen: HashSet<ItemId> = HashSet::new();
    let mut items: Vec<ItemId> = Vec::new();
    for row in &current_rows {
        if let Some(item_id) = row.get("item_id").and_then(serde_json::Value::as_u64) {
            let item_id = item_id as ItemId;
            if item_id > 0 && seen.insert(item_id) {
                items.push(item_id);
            }
        }
    }

    let master_rows = store.select(tables::MASTER_TIMESTAMPS, &[], None).await?;
    let mut master: Vec<MasterTs> = master_rows
        .iter()
        .filter_map(|row| row.get("ts").and_then(serde_json::Value::as_i64))
        .collect();
    master.sort_unstable();
    master.dedup();

    let writer = BatchWriter::new(BatchWriterConfig {
        chunk_size: config.chunk_size,
        write_concurrency: config.insert_concurrency,
    });
    let backfill = MetricBackfill::new(
        provider,
        store,
        writer,
        config.progress_path.clone(),
        config.reconcile_window_secs,
    );
    backfill.run(&items, &master, Utc::now().timestamp()).await
}
