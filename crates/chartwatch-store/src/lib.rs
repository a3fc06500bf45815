//! Table-oriented persistence boundary for chartwatch: the `TableStore`
//! trait, a PostgREST-speaking HTTP implementation, an in-memory test
//! double, and the chunked idempotent batch writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "chartwatch-store";

/// Equality filter on a column, PostgREST `col=eq.value` style.
pub type EqFilter = (String, String);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store status {status} on table {table}: {detail}")]
    Status {
        status: u16,
        table: String,
        detail: String,
    },
    #[error("store payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Write disposition for one batch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode<'a> {
    /// Append-only insert; duplicate keys are a store-side error.
    Insert,
    /// Insert-or-replace on the given comma-separated conflict key.
    Upsert { conflict_key: &'a str },
}

/// The storage collaborator, specified only at its boundary. Rows travel as
/// JSON objects so every table shares one seam; callers keep their typed
/// structs and serialize at the edge.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), StoreError>;

    async fn upsert(
        &self,
        table: &str,
        rows: &[Value],
        conflict_key: &str,
    ) -> Result<(), StoreError>;

    async fn delete(&self, table: &str, filter: &[EqFilter]) -> Result<(), StoreError>;

    async fn select(
        &self,
        table: &str,
        filter: &[EqFilter],
        range: Option<(usize, usize)>,
    ) -> Result<Vec<Value>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    pub base_url: String,
    pub service_key: String,
    pub schema: String,
    pub timeout: Duration,
}

impl PostgrestConfig {
    pub fn new(base_url: impl Into<String>, service_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            service_key: service_key.into(),
            schema: "analytics".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// PostgREST-over-HTTP table store. Upserts use the
/// `Prefer: resolution=merge-duplicates` + `on_conflict` contract, which is
/// what makes repeated snapshot writes converge instead of accumulate.
#[derive(Debug)]
pub struct PostgrestStore {
    client: reqwest::Client,
    config: PostgrestConfig,
}

impl PostgrestStore {
    pub fn new(config: PostgrestConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client for table store")?;
        Ok(Self { client, config })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder, writing: bool) -> reqwest::RequestBuilder {
        let profile_header = if writing {
            "Content-Profile"
        } else {
            "Accept-Profile"
        };
        req.header("apikey", &self.config.service_key)
            .header(
                "Authorization",
                format!("Bearer {}", self.config.service_key),
            )
            .header(profile_header, &self.config.schema)
    }

    async fn check(resp: reqwest::Response, table: &str) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let detail = resp.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            table: table.to_string(),
            detail: detail.chars().take(200).collect(),
        })
    }

    fn filtered(req: reqwest::RequestBuilder, filter: &[EqFilter]) -> reqwest::RequestBuilder {
        let params: Vec<(String, String)> = filter
            .iter()
            .map(|(col, value)| (col.clone(), format!("eq.{value}")))
            .collect();
        req.query(&params)
    }
}

#[async_trait]
impl TableStore for PostgrestStore {
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let req = self
            .apply_auth(self.client.post(self.table_url(table)), true)
            .header("Prefer", "return=minimal")
            .json(rows);
        Self::check(req.send().await?, table).await?;
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Value],
        conflict_key: &str,
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let req = self
            .apply_auth(self.client.post(self.table_url(table)), true)
            .query(&[("on_conflict", conflict_key)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows);
        Self::check(req.send().await?, table).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &[EqFilter]) -> Result<(), StoreError> {
        if filter.is_empty() {
            // An unfiltered DELETE would truncate the table; refuse it.
            return Err(StoreError::Other(format!(
                "refusing unfiltered delete on {table}"
            )));
        }
        let req = Self::filtered(
            self.apply_auth(self.client.delete(self.table_url(table)), true),
            filter,
        );
        Self::check(req.send().await?, table).await?;
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        filter: &[EqFilter],
        range: Option<(usize, usize)>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut req = Self::filtered(
            self.apply_auth(self.client.get(self.table_url(table)), false),
            filter,
        );
        if let Some((from, to)) = range {
            req = req.header("Range", format!("{from}-{to}"));
        }
        let resp = Self::check(req.send().await?, table).await?;
        Ok(resp.json().await?)
    }
}

/// In-memory `TableStore` used by pipeline tests. Supports injecting a
/// failure after N successful write calls so partial-write behavior can be
/// observed.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Value>>,
    writes_before_failure: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// After `n` successful insert/upsert calls, every further write fails.
    pub async fn fail_after_writes(&self, n: usize) {
        self.inner.lock().await.writes_before_failure = Some(n);
    }

    pub async fn seed(&self, table: &str, rows: Vec<Value>) {
        self.inner
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    pub async fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .lock()
            .await
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    fn conflict_tuple(row: &Value, key_columns: &[&str]) -> Vec<String> {
        key_columns
            .iter()
            .map(|col| row.get(col).map(|v| v.to_string()).unwrap_or_default())
            .collect()
    }

    fn row_matches(row: &Value, filter: &[EqFilter]) -> bool {
        filter.iter().all(|(col, value)| {
            row.get(col)
                .map(|v| match v {
                    Value::String(s) => s == value,
                    other => other.to_string() == *value,
                })
                .unwrap_or(false)
        })
    }

    async fn consume_write_budget(&self) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        if let Some(remaining) = state.writes_before_failure {
            if remaining == 0 {
                return Err(StoreError::Other("injected write failure".to_string()));
            }
            state.writes_before_failure = Some(remaining - 1);
        }
        Ok(())
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        self.consume_write_budget().await?;
        self.inner
            .lock()
            .await
            .tables
            .entry(table.to_string())
            .or_default()
            .extend_from_slice(rows);
        Ok(())
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Value],
        conflict_key: &str,
    ) -> Result<(), StoreError> {
        self.consume_write_budget().await?;
        let key_columns: Vec<&str> = conflict_key.split(',').map(str::trim).collect();
        let mut state = self.inner.lock().await;
        let existing = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            let key = Self::conflict_tuple(row, &key_columns);
            match existing
                .iter_mut()
                .find(|r| Self::conflict_tuple(r, &key_columns) == key)
            {
                Some(slot) => *slot = row.clone(),
                None => existing.push(row.clone()),
            }
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &[EqFilter]) -> Result<(), StoreError> {
        let mut state = self.inner.lock().await;
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|row| !Self::row_matches(row, filter));
        }
        Ok(())
    }

    async fn select(
        &self,
        table: &str,
        filter: &[EqFilter],
        range: Option<(usize, usize)>,
    ) -> Result<Vec<Value>, StoreError> {
        let state = self.inner.lock().await;
        let mut rows: Vec<Value> = state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| Self::row_matches(row, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some((from, to)) = range {
            let from = from.min(rows.len());
            let to = (to + 1).min(rows.len());
            rows = rows[from..to].to_vec();
        }
        Ok(rows)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchWriterConfig {
    pub chunk_size: usize,
    /// How many chunks are in flight at once within one call.
    pub write_concurrency: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            write_concurrency: 2,
        }
    }
}

/// Splits row sets into fixed-size chunks and writes them with bounded
/// concurrency. A chunk failure aborts the remaining chunks of the call and
/// surfaces the error; completed chunks stay written, so callers rely on
/// conflict keys for idempotence, never on rollback.
#[derive(Debug, Clone, Copy)]
pub struct BatchWriter {
    config: BatchWriterConfig,
}

impl BatchWriter {
    pub fn new(config: BatchWriterConfig) -> Self {
        Self { config }
    }

    pub async fn write_chunked(
        &self,
        store: &dyn TableStore,
        table: &str,
        rows: Vec<Value>,
        mode: WriteMode<'_>,
    ) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let chunk_size = self.config.chunk_size.max(1);
        let chunks: Vec<&[Value]> = rows.chunks(chunk_size).collect();
        let total_chunks = chunks.len();
        let concurrency = self.config.write_concurrency.max(1);

        for batch in chunks.chunks(concurrency) {
            let writes = batch.iter().map(|chunk| async move {
                match mode {
                    WriteMode::Insert => store.insert(table, chunk).await,
                    WriteMode::Upsert { conflict_key } => {
                        store.upsert(table, chunk, conflict_key).await
                    }
                }
            });
            let results = futures::future::join_all(writes).await;
            for result in results {
                result?;
            }
        }

        debug!(table, rows = rows.len(), chunks = total_chunks, "batch write complete");
        Ok(total_chunks)
    }
}

/// Serialize a slice of typed rows into the JSON objects the store seam
/// carries.
pub fn to_rows<T: serde::Serialize>(items: &[T]) -> Result<Vec<Value>, StoreError> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).map_err(StoreError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: u32, rank: u32) -> Value {
        json!({ "market": "us", "item_id": id, "rank": rank })
    }

    #[tokio::test]
    async fn chunked_insert_issues_expected_chunk_count() {
        let store = MemoryStore::new();
        let writer = BatchWriter::new(BatchWriterConfig {
            chunk_size: 2,
            write_concurrency: 1,
        });
        let rows = (1..=5).map(|i| row(i, i)).collect();

        let chunks = writer
            .write_chunked(store.as_ref(), "rank_history", rows, WriteMode::Insert)
            .await
            .expect("write");

        assert_eq!(chunks, 3);
        assert_eq!(store.rows("rank_history").await.len(), 5);
    }

    #[tokio::test]
    async fn failing_chunk_keeps_earlier_chunks_and_surfaces_error() {
        let store = MemoryStore::new();
        store.fail_after_writes(1).await;
        let writer = BatchWriter::new(BatchWriterConfig {
            chunk_size: 2,
            write_concurrency: 1,
        });
        let rows = (1..=5).map(|i| row(i, i)).collect();

        let err = writer
            .write_chunked(store.as_ref(), "rank_history", rows, WriteMode::Insert)
            .await
            .expect_err("second chunk must fail");

        assert!(matches!(err, StoreError::Other(_)));
        // First chunk's effect is retained, nothing rolled back.
        assert_eq!(store.rows("rank_history").await.len(), 2);
    }

    #[tokio::test]
    async fn upsert_replaces_on_composite_conflict_key() {
        let store = MemoryStore::new();
        store
            .upsert("rank_current", &[row(7, 3)], "market,item_id")
            .await
            .expect("first upsert");
        store
            .upsert("rank_current", &[row(7, 1), row(8, 2)], "market,item_id")
            .await
            .expect("second upsert");

        let rows = store.rows("rank_current").await;
        assert_eq!(rows.len(), 2);
        let updated = rows
            .iter()
            .find(|r| r["item_id"] == 7)
            .expect("item 7 present");
        assert_eq!(updated["rank"], 1);
    }

    #[tokio::test]
    async fn delete_with_filter_removes_only_matching_rows() {
        let store = MemoryStore::new();
        store
            .insert(
                "rank_current",
                &[
                    json!({ "market": "us", "item_id": 1 }),
                    json!({ "market": "jp", "item_id": 2 }),
                ],
            )
            .await
            .expect("seed");

        store
            .delete("rank_current", &[("market".to_string(), "us".to_string())])
            .await
            .expect("delete");

        let rows = store.rows("rank_current").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["market"], "jp");
    }

    #[test]
    fn postgrest_delete_without_filter_is_refused() {
        let store = PostgrestStore::new(PostgrestConfig::new("http://localhost", "key"))
            .expect("store");
        let err = tokio::runtime::Runtime::new()
            .expect("rt")
            .block_on(store.delete("rank_current", &[]))
            .expect_err("unfiltered delete must be refused");
        assert!(matches!(err, StoreError::Other(_)));
    }
}
