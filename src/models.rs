//! Core domain types shared across the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// One normalized marketplace listing.
///
/// `key` is the platform-wide market hash name (`"AWP | Chromatic Aberration
/// (Minimal Wear)"`). When an upstream record omits it, the display name is
/// used as the key so identity stays total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketItem {
    pub key: String,
    pub name: String,
    /// Lowest asking price observed for this key. Always > 0; listings
    /// without a live sale price are dropped during parsing.
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_count: Option<u32>,
    pub market_url: String,
    pub fetched_at: DateTime<Utc>,
}

/// How a cross-market pair was joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSource {
    HashExact,
    NameExact,
}

/// One matched cross-market record with its computed differential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceDiffItem {
    pub key: String,
    pub name: String,
    pub buff_price: f64,
    pub youpin_price: f64,
    /// `youpin_price - buff_price`.
    pub price_diff: f64,
    /// `price_diff / buff_price`, as a fraction.
    pub profit_margin: f64,
    pub buff_url: String,
    pub matched_by: MatchSource,
    pub updated_at: DateTime<Utc>,
}

/// The published output of one refresh. Readers always see a complete set;
/// the orchestrator swaps the whole `Arc` and never mutates in place.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResultSet {
    pub items: Vec<PriceDiffItem>,
    pub built_at: Option<DateTime<Utc>>,
    pub hash_matches: u32,
    pub name_matches: u32,
}

/// Per-marketplace page counters emitted by a catalogue walk.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchStats {
    pub successful_pages: u32,
    pub failed_pages: u32,
    pub total_items: usize,
}

/// One marketplace catalogue as collected by a full page walk.
#[derive(Debug, Default)]
pub struct CatalogFetch {
    pub items: Vec<MarketItem>,
    pub stats: FetchStats,
}

/// Lifecycle of the update orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPhase {
    Idle,
    RunningFull,
    RunningIncremental,
}

/// Live progress counters for the in-flight refresh, shared between the
/// orchestrator and the two catalogue walks. Counters are monotone within
/// one cycle and reset when the next cycle starts.
#[derive(Debug, Default)]
pub struct RefreshProgress {
    pub pages_done: AtomicU32,
    pub pages_total: AtomicU32,
    pub matches_so_far: AtomicU32,
}

impl RefreshProgress {
    pub fn reset(&self) {
        self.pages_done.store(0, Ordering::Relaxed);
        self.pages_total.store(0, Ordering::Relaxed);
        self.matches_so_far.store(0, Ordering::Relaxed);
    }

    pub fn add_total(&self, pages: u32) {
        self.pages_total.fetch_add(pages, Ordering::Relaxed);
    }

    pub fn page_done(&self) {
        self.pages_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops planned pages that will never be walked (early end-of-stream)
    /// from the denominator.
    pub fn reduce_total(&self, pages: u32) {
        self.pages_total.fetch_sub(pages, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            pages_done: self.pages_done.load(Ordering::Relaxed),
            pages_total: self.pages_total.load(Ordering::Relaxed),
            matches_so_far: self.matches_so_far.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProgressSnapshot {
    pub pages_done: u32,
    pub pages_total: u32,
    pub matches_so_far: u32,
}

/// Process bootstrap configuration. Everything runtime-tunable lives in
/// [`crate::settings::SettingsStore`] instead; these values are fixed at
/// startup.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: String,
    pub api_base_path: String,
}

impl BootConfig {
    pub fn from_env() -> Self {
        let host = std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = std::env::var("API_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8000);
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "data".to_string());
        let api_base_path = std::env::var("API_BASE_PATH")
            .map(|v| {
                let trimmed = v.trim_end_matches('/').to_string();
                if trimmed.starts_with('/') || trimmed.is_empty() {
                    trimmed
                } else {
                    format!("/{trimmed}")
                }
            })
            .unwrap_or_else(|_| "/api".to_string());

        Self {
            host,
            port,
            data_dir,
            api_base_path,
        }
    }
}
