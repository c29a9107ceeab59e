//! Token usage, cost estimation, and persistent running totals.
//!
//! A completed session reports one [`Usage`] snapshot. The
//! [`UsageAggregator`] folds it into the process-wide [`UsageTotals`] held
//! by a [`UsageStore`], which persists through an injected [`UsageBackend`].
//! The store holds one mutex across read-modify-write-persist so concurrent
//! sessions never lose updates.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Token usage reported by the terminal completion event.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub thinking_tokens: u64,
    /// Wall-clock generation time reported by the emitter.
    #[serde(rename = "time_elapsed", default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    /// Cost in USD as computed by the emitter, when it reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.thinking_tokens
    }
}

/// Per-model pricing for cost estimation (USD per 1M tokens).
#[derive(Debug, Clone, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub thinking_per_million: f64,
}

impl ModelPricing {
    /// Estimate cost for a usage snapshot.
    pub fn estimate_cost(&self, usage: &Usage) -> f64 {
        (usage.input_tokens as f64 / 1_000_000.0) * self.input_per_million
            + (usage.output_tokens as f64 / 1_000_000.0) * self.output_per_million
            + (usage.thinking_tokens as f64 / 1_000_000.0) * self.thinking_per_million
    }
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            thinking_per_million: 3.0,
        }
    }
}

/// Running totals across every completed session.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct UsageTotals {
    pub total_runs: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// RFC 3339 timestamp of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl UsageTotals {
    /// Format as a short summary string.
    pub fn summary(&self) -> String {
        format!(
            "runs: {}, tokens: {}, est. cost: ${:.4}",
            self.total_runs, self.total_tokens, self.total_cost,
        )
    }
}

// ── Backends ───────────────────────────────────────────────────────

/// Where [`UsageTotals`] are persisted.
pub trait UsageBackend: Send + Sync {
    /// Load previously saved totals. `None` if nothing has been saved yet.
    fn load(&self) -> Result<Option<UsageTotals>, String>;

    /// Persist `totals`, replacing whatever was saved before.
    fn save(&self, totals: &UsageTotals) -> Result<(), String>;
}

/// JSON file backend with atomic replace (temp file, then rename).
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "usage.json".to_string());
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}

impl UsageBackend for FileBackend {
    fn load(&self) -> Result<Option<UsageTotals>, String> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&self.path)
            .map_err(|e| format!("Failed to read usage file: {e}"))?;
        let totals =
            serde_json::from_str(&json).map_err(|e| format!("Failed to parse usage file: {e}"))?;
        Ok(Some(totals))
    }

    fn save(&self, totals: &UsageTotals) -> Result<(), String> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| format!("Failed to create usage dir: {e}"))?;
        }
        let tmp_path = self.tmp_path();
        let json = serde_json::to_string_pretty(totals)
            .map_err(|e| format!("Failed to serialize usage: {e}"))?;
        std::fs::write(&tmp_path, json).map_err(|e| format!("Failed to write temp usage: {e}"))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| format!("Failed to rename usage file: {e}"))?;
        Ok(())
    }
}

/// In-memory backend for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    saved: Mutex<Option<UsageTotals>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value passed to [`save`](UsageBackend::save).
    pub fn saved(&self) -> Option<UsageTotals> {
        self.saved.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl UsageBackend for MemoryBackend {
    fn load(&self) -> Result<Option<UsageTotals>, String> {
        Ok(self.saved())
    }

    fn save(&self, totals: &UsageTotals) -> Result<(), String> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some(totals.clone());
        Ok(())
    }
}

// ── UsageStore ─────────────────────────────────────────────────────

/// Process-wide usage totals with serialized read-modify-write-persist.
pub struct UsageStore {
    totals: Mutex<UsageTotals>,
    backend: Box<dyn UsageBackend>,
}

impl UsageStore {
    /// Open a store, loading any totals the backend already holds.
    pub fn open(backend: impl UsageBackend + 'static) -> Result<Self, String> {
        let totals = backend.load()?.unwrap_or_default();
        debug!("Opened usage store: {}", totals.summary());
        Ok(Self {
            totals: Mutex::new(totals),
            backend: Box::new(backend),
        })
    }

    /// An empty store backed by memory.
    pub fn in_memory() -> Self {
        Self {
            totals: Mutex::new(UsageTotals::default()),
            backend: Box::new(MemoryBackend::new()),
        }
    }

    /// Snapshot of the current totals.
    pub fn totals(&self) -> UsageTotals {
        self.totals.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Apply `f` to the totals and persist the result, all under one lock.
    ///
    /// If persisting fails the in-memory totals are left unchanged.
    pub fn update(&self, f: impl FnOnce(&mut UsageTotals)) -> Result<UsageTotals, String> {
        let mut guard = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.clone();
        f(&mut next);
        next.updated_at = Some(chrono::Utc::now().to_rfc3339());
        self.backend.save(&next)?;
        *guard = next.clone();
        Ok(next)
    }
}

// ── UsageAggregator ────────────────────────────────────────────────

/// Folds per-session [`Usage`] into a shared [`UsageStore`].
#[derive(Clone)]
pub struct UsageAggregator {
    store: Arc<UsageStore>,
    pricing: ModelPricing,
}

impl UsageAggregator {
    pub fn new(store: Arc<UsageStore>) -> Self {
        Self {
            store,
            pricing: ModelPricing::default(),
        }
    }

    /// Pricing used when a completion carries no `total_cost`.
    pub fn with_pricing(mut self, pricing: ModelPricing) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn store(&self) -> &Arc<UsageStore> {
        &self.store
    }

    /// Cost attributed to a usage snapshot.
    pub fn cost_of(&self, usage: &Usage) -> f64 {
        usage
            .total_cost
            .unwrap_or_else(|| self.pricing.estimate_cost(usage))
    }

    /// Merge one completed session's usage into the running totals.
    pub fn record(&self, usage: &Usage) -> Result<UsageTotals, String> {
        let tokens = usage.total_tokens();
        let cost = self.cost_of(usage);
        let totals = self.store.update(|t| {
            t.total_runs += 1;
            t.total_tokens += tokens;
            t.total_cost += cost;
        })?;
        debug!("Recorded usage ({tokens} tokens, ${cost:.4}): {}", totals.summary());
        Ok(totals)
    }

    /// [`record`](Self::record) on the blocking pool, so backend I/O under
    /// the store lock never stalls an async worker.
    pub async fn record_async(&self, usage: Usage) -> Result<UsageTotals, String> {
        let aggregator = self.clone();
        tokio::task::spawn_blocking(move || aggregator.record(&usage))
            .await
            .map_err(|e| format!("usage recording task failed: {e}"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(input: u64, output: u64, thinking: u64, cost: Option<f64>) -> Usage {
        Usage {
            input_tokens: input,
            output_tokens: output,
            thinking_tokens: thinking,
            elapsed_seconds: None,
            total_cost: cost,
        }
    }

    #[test]
    fn usage_deserializes_wire_names() {
        let json = r#"{"input_tokens":10,"output_tokens":20,"time_elapsed":1.5}"#;
        let u: Usage = serde_json::from_str(json).unwrap();
        assert_eq!(u.input_tokens, 10);
        assert_eq!(u.thinking_tokens, 0);
        assert_eq!(u.elapsed_seconds, Some(1.5));
        assert_eq!(u.total_tokens(), 30);
    }

    #[test]
    fn cost_estimation() {
        let cost = ModelPricing::default().estimate_cost(&usage(1_000_000, 100_000, 0, None));
        assert!((cost - 4.5).abs() < 0.01); // 3.0 + 1.5
    }

    #[test]
    fn aggregator_prefers_reported_cost() {
        let agg = UsageAggregator::new(Arc::new(UsageStore::in_memory()));
        assert!((agg.cost_of(&usage(1_000_000, 0, 0, Some(0.5))) - 0.5).abs() < f64::EPSILON);
        assert!((agg.cost_of(&usage(1_000_000, 0, 0, None)) - 3.0).abs() < 0.001);
    }

    #[test]
    fn record_accumulates() {
        let agg = UsageAggregator::new(Arc::new(UsageStore::in_memory()));
        agg.record(&usage(10, 20, 5, Some(0.01))).unwrap();
        let totals = agg.record(&usage(1, 2, 0, Some(0.02))).unwrap();
        assert_eq!(totals.total_runs, 2);
        assert_eq!(totals.total_tokens, 38);
        assert!((totals.total_cost - 0.03).abs() < 1e-9);
        assert!(totals.updated_at.is_some());
        assert_eq!(agg.store().totals(), totals);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let agg = UsageAggregator::new(Arc::new(UsageStore::in_memory()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        agg.record(&usage(1, 1, 0, Some(0.0))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let totals = agg.store().totals();
        assert_eq!(totals.total_runs, 200);
        assert_eq!(totals.total_tokens, 400);
    }

    #[test]
    fn file_backend_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("usage.json");

        let store = UsageStore::open(FileBackend::new(&path)).unwrap();
        let agg = UsageAggregator::new(Arc::new(store));
        agg.record(&usage(100, 50, 0, Some(0.25))).unwrap();
        assert!(path.exists());
        assert!(!tmp.path().join("nested").join(".usage.json.tmp").exists());

        let reopened = UsageStore::open(FileBackend::new(&path)).unwrap();
        let totals = reopened.totals();
        assert_eq!(totals.total_runs, 1);
        assert_eq!(totals.total_tokens, 150);
    }

    #[tokio::test]
    async fn record_async_persists_from_concurrent_tasks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.json");
        let store = UsageStore::open(FileBackend::new(&path)).unwrap();
        let agg = UsageAggregator::new(Arc::new(store));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let agg = agg.clone();
                tokio::spawn(async move { agg.record_async(usage(2, 3, 0, Some(0.0))).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = UsageStore::open(FileBackend::new(&path)).unwrap();
        assert_eq!(reopened.totals().total_runs, 4);
        assert_eq!(reopened.totals().total_tokens, 20);
    }

    #[test]
    fn file_backend_missing_file_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(tmp.path().join("absent.json"));
        assert!(backend.load().unwrap().is_none());
    }

    #[test]
    fn file_backend_rejects_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.json");
        std::fs::write(&path, "not json").unwrap();
        let err = UsageStore::open(FileBackend::new(&path)).err().unwrap();
        assert!(err.contains("parse"));
    }

    struct FailingBackend;

    impl UsageBackend for FailingBackend {
        fn load(&self) -> Result<Option<UsageTotals>, String> {
            Ok(None)
        }
        fn save(&self, _: &UsageTotals) -> Result<(), String> {
            Err("disk full".into())
        }
    }

    #[test]
    fn failed_save_leaves_totals_unchanged() {
        let store = UsageStore::open(FailingBackend).unwrap();
        let agg = UsageAggregator::new(Arc::new(store));
        assert!(agg.record(&usage(1, 1, 1, None)).is_err());
        assert_eq!(agg.store().totals().total_runs, 0);
    }
}
