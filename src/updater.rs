//! Refresh orchestration.
//!
//! One refresh cycle fetches both catalogues, matches them, and publishes
//! the result set through an atomic pointer swap. Cycles are serialized by
//! a single exclusion gate; a cancelled or failed cycle leaves the
//! published set untouched.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analyzer::{self, FilterParams};
use crate::errors::{FetchError, RefreshError};
use crate::keycache::HashNameCache;
use crate::models::{
    CatalogFetch, FetchStats, MarketItem, ProgressSnapshot, RefreshPhase, RefreshProgress,
    ResultSet,
};
use crate::scrapers::{BuffClient, YoupinClient};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MarketFetchReport {
    pub successful_pages: u32,
    pub failed_pages: u32,
    pub total_items: usize,
}

impl From<FetchStats> for MarketFetchReport {
    fn from(s: FetchStats) -> Self {
        Self {
            successful_pages: s.successful_pages,
            failed_pages: s.failed_pages,
            total_items: s.total_items,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UpdateStatus {
    pub phase: RefreshPhase,
    pub progress: ProgressSnapshot,
    pub current_items: usize,
    pub result_built_at: Option<DateTime<Utc>>,
    pub hash_matches: u32,
    pub name_matches: u32,
    pub cached_hashnames: usize,
    pub last_full_update: Option<DateTime<Utc>>,
    pub last_incremental_update: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
    pub last_fetch: Option<FetchReports>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FetchReports {
    pub buff: MarketFetchReport,
    pub youpin: MarketFetchReport,
}

pub struct UpdateManager {
    buff: Arc<BuffClient>,
    youpin: Arc<YoupinClient>,
    settings: Arc<SettingsStore>,
    keycache: Arc<HashNameCache>,
    current: RwLock<Arc<ResultSet>>,
    refresh_gate: tokio::sync::Mutex<()>,
    cancel: Mutex<CancellationToken>,
    phase: Mutex<RefreshPhase>,
    progress: RefreshProgress,
    last_full_update: Mutex<Option<DateTime<Utc>>>,
    last_incremental_update: Mutex<Option<DateTime<Utc>>>,
    last_outcome: Mutex<Option<String>>,
    last_error: Mutex<Option<String>>,
    last_fetch: Mutex<Option<FetchReports>>,
}

impl UpdateManager {
    pub fn new(
        buff: Arc<BuffClient>,
        youpin: Arc<YoupinClient>,
        settings: Arc<SettingsStore>,
        keycache: Arc<HashNameCache>,
    ) -> Self {
        Self {
            buff,
            youpin,
            settings,
            keycache,
            current: RwLock::new(Arc::new(ResultSet::default())),
            refresh_gate: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(CancellationToken::new()),
            phase: Mutex::new(RefreshPhase::Idle),
            progress: RefreshProgress::default(),
            last_full_update: Mutex::new(None),
            last_incremental_update: Mutex::new(None),
            last_outcome: Mutex::new(None),
            last_error: Mutex::new(None),
            last_fetch: Mutex::new(None),
        }
    }

    /// The published result set. Readers get a complete snapshot; a running
    /// refresh never mutates it in place.
    pub fn current(&self) -> Arc<ResultSet> {
        self.current.read().clone()
    }

    pub fn phase(&self) -> RefreshPhase {
        *self.phase.lock()
    }

    pub fn is_running(&self) -> bool {
        self.phase() != RefreshPhase::Idle
    }

    /// Requests cooperative cancellation of the in-flight cycle, if any.
    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    pub fn status(&self) -> UpdateStatus {
        let current = self.current();
        UpdateStatus {
            phase: self.phase(),
            progress: self.progress.snapshot(),
            current_items: current.items.len(),
            result_built_at: current.built_at,
            hash_matches: current.hash_matches,
            name_matches: current.name_matches,
            cached_hashnames: self.keycache.len(),
            last_full_update: *self.last_full_update.lock(),
            last_incremental_update: *self.last_incremental_update.lock(),
            last_outcome: self.last_outcome.lock().clone(),
            last_error: self.last_error.lock().clone(),
            last_fetch: *self.last_fetch.lock(),
        }
    }

    /// Runs one full refresh. Fails fast with [`RefreshError::AlreadyRunning`]
    /// when another cycle holds the gate.
    pub async fn run_full_refresh(&self) -> Result<usize, RefreshError> {
        let _guard = self
            .refresh_gate
            .try_lock()
            .map_err(|_| RefreshError::AlreadyRunning)?;

        let cancel = self.begin(RefreshPhase::RunningFull);
        info!("🔄 Full refresh started");
        let result = self.full_cycle(&cancel).await;
        self.finish(&result);
        result
    }

    /// Runs one incremental refresh; degrades to a full cycle when the
    /// interesting-key set is empty (fresh boot or post-invalidation).
    pub async fn run_incremental_refresh(&self) -> Result<usize, RefreshError> {
        let _guard = self
            .refresh_gate
            .try_lock()
            .map_err(|_| RefreshError::AlreadyRunning)?;

        let degraded = self.keycache.is_empty();
        let phase = if degraded {
            RefreshPhase::RunningFull
        } else {
            RefreshPhase::RunningIncremental
        };
        let cancel = self.begin(phase);

        if degraded {
            info!("🔄 Incremental refresh degraded to full (no cached hash names)");
        } else {
            info!(keys = self.keycache.len(), "🔄 Incremental refresh started");
        }

        let result = if degraded {
            self.full_cycle(&cancel).await
        } else {
            self.incremental_cycle(&cancel).await
        };
        self.finish(&result);
        result
    }

    async fn full_cycle(&self, cancel: &CancellationToken) -> Result<usize, RefreshError> {
        let (buff_fetch, youpin_fetch) = self.fetch_both(cancel).await?;
        self.apply_full(buff_fetch.items, youpin_fetch.items)
    }

    async fn incremental_cycle(&self, cancel: &CancellationToken) -> Result<usize, RefreshError> {
        let (buff_fetch, youpin_fetch) = self.fetch_both(cancel).await?;
        self.apply_incremental(buff_fetch.items, youpin_fetch.items)
    }

    /// Drives both catalogue walks concurrently. The upstreams offer no
    /// key-scoped reads, so incremental cycles fetch the same pages and
    /// narrow afterwards.
    async fn fetch_both(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(CatalogFetch, CatalogFetch), RefreshError> {
        let settings = self.settings.snapshot();

        let (buff_result, youpin_result) = tokio::join!(
            self.buff.fetch_all(
                settings.buff_max_pages,
                settings.buff_page_size,
                Duration::from_secs_f64(settings.buff_min_delay_secs),
                cancel,
                &self.progress,
            ),
            self.youpin.fetch_all(
                settings.youpin_max_pages,
                settings.youpin_page_size,
                Duration::from_secs_f64(settings.youpin_min_delay_secs),
                cancel,
                &self.progress,
            ),
        );

        let buff_fetch = map_fetch_result(buff_result, "buff")?;
        let youpin_fetch = map_fetch_result(youpin_result, "youpin")?;

        *self.last_fetch.lock() = Some(FetchReports {
            buff: buff_fetch.stats.into(),
            youpin: youpin_fetch.stats.into(),
        });

        if cancel.is_cancelled() {
            return Err(RefreshError::Cancelled);
        }

        Ok((buff_fetch, youpin_fetch))
    }

    /// Matches two complete catalogues and publishes the result, replacing
    /// the interesting-key set with the published keys. This is the seam
    /// between fetching and publication; tests drive it with synthetic
    /// catalogues.
    pub fn apply_full(
        &self,
        buff_items: Vec<MarketItem>,
        youpin_items: Vec<MarketItem>,
    ) -> Result<usize, RefreshError> {
        if buff_items.is_empty() && youpin_items.is_empty() {
            return Err(RefreshError::UpstreamUnavailable);
        }

        let params = FilterParams::from(&self.settings.snapshot());
        let (pairs, counts) = analyzer::match_and_rank(&buff_items, &youpin_items, &params);
        self.progress
            .matches_so_far
            .store(pairs.len() as u32, std::sync::atomic::Ordering::Relaxed);

        let keys = pairs.iter().map(|p| p.key.clone()).collect();
        let result = ResultSet {
            items: pairs,
            built_at: Some(Utc::now()),
            hash_matches: counts.hash_exact,
            name_matches: counts.name_exact,
        };
        let count = result.items.len();

        *self.current.write() = Arc::new(result);
        if let Err(e) = self.keycache.replace(keys) {
            warn!(error = %e, "Failed to persist hash name cache");
        }
        *self.last_full_update.lock() = Some(Utc::now());

        info!(
            items = count,
            hash_matches = counts.hash_exact,
            name_matches = counts.name_exact,
            "✅ Full refresh published"
        );
        Ok(count)
    }

    /// Narrows the buy side to the interesting keys, matches, and merges
    /// into the published set: rescanned keys are replaced, keys that are
    /// still interesting but missing from this scan are kept. Degrades to
    /// [`Self::apply_full`] when the key set is empty.
    pub fn apply_incremental(
        &self,
        buff_items: Vec<MarketItem>,
        youpin_items: Vec<MarketItem>,
    ) -> Result<usize, RefreshError> {
        let (keys, _) = self.keycache.snapshot();
        if keys.is_empty() {
            return self.apply_full(buff_items, youpin_items);
        }

        if buff_items.is_empty() && youpin_items.is_empty() {
            return Err(RefreshError::UpstreamUnavailable);
        }

        let interesting: Vec<MarketItem> = buff_items
            .into_iter()
            .filter(|item| keys.contains(&item.key))
            .collect();

        let params = FilterParams::from(&self.settings.snapshot());
        let (fresh_pairs, _) =
            analyzer::match_and_rank(&interesting, &youpin_items, &params);
        self.progress
            .matches_so_far
            .store(fresh_pairs.len() as u32, std::sync::atomic::Ordering::Relaxed);

        let prior = self.current();
        let mut merged: HashMap<String, crate::models::PriceDiffItem> = prior
            .items
            .iter()
            .filter(|p| keys.contains(&p.key))
            .cloned()
            .map(|p| (p.key.clone(), p))
            .collect();
        let fresh_count = fresh_pairs.len();
        for pair in fresh_pairs {
            merged.insert(pair.key.clone(), pair);
        }

        let mut items: Vec<_> = merged.into_values().collect();
        analyzer::sort_pairs(&mut items);
        items.truncate(params.max_output_items);
        let count = items.len();

        let hash_matches = items
            .iter()
            .filter(|p| p.matched_by == crate::models::MatchSource::HashExact)
            .count() as u32;
        let result = ResultSet {
            items,
            built_at: Some(Utc::now()),
            hash_matches,
            name_matches: count as u32 - hash_matches,
        };

        *self.current.write() = Arc::new(result);
        *self.last_incremental_update.lock() = Some(Utc::now());

        info!(
            rescanned = fresh_count,
            published = count,
            "✅ Incremental refresh merged"
        );
        Ok(count)
    }

    fn begin(&self, phase: RefreshPhase) -> CancellationToken {
        self.progress.reset();
        *self.phase.lock() = phase;
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();
        token
    }

    fn finish(&self, result: &Result<usize, RefreshError>) {
        *self.phase.lock() = RefreshPhase::Idle;
        match result {
            Ok(count) => {
                *self.last_outcome.lock() = Some(format!("ok ({count} items)"));
                *self.last_error.lock() = None;
            }
            Err(RefreshError::Cancelled) => {
                *self.last_outcome.lock() = Some("cancelled".to_string());
                info!("🛑 Refresh cancelled, published set untouched");
            }
            Err(e) => {
                *self.last_outcome.lock() = Some("failed".to_string());
                *self.last_error.lock() = Some(e.to_string());
                warn!(error = %e, "Refresh failed, published set untouched");
            }
        }
    }
}

fn map_fetch_result(
    result: Result<CatalogFetch, FetchError>,
    marketplace: &'static str,
) -> Result<CatalogFetch, RefreshError> {
    match result {
        Ok(fetch) => Ok(fetch),
        Err(FetchError::Cancelled) => Err(RefreshError::Cancelled),
        Err(e) if e.is_auth() => Err(RefreshError::AuthFailed {
            marketplace,
            message: e.to_string(),
        }),
        // Page-level faults are absorbed inside the walk; anything else
        // surfacing here is treated as that marketplace being empty.
        Err(e) => {
            warn!(marketplace, error = %e, "Catalogue walk failed");
            Ok(CatalogFetch::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::TokenStore;
    use chrono::Utc;

    fn manager() -> (tempfile::TempDir, Arc<HashNameCache>, Arc<SettingsStore>, UpdateManager) {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::load(dir.path().join("tokens.json")));
        let keycache = Arc::new(HashNameCache::load(dir.path().join("cache.json")));
        let settings = Arc::new(SettingsStore::new(keycache.clone()));
        let buff = Arc::new(BuffClient::new(tokens.clone()).unwrap());
        let youpin = Arc::new(YoupinClient::new(tokens).unwrap());
        let manager = UpdateManager::new(buff, youpin, settings.clone(), keycache.clone());
        (dir, keycache, settings, manager)
    }

    fn buff_item(key: &str, price: f64) -> MarketItem {
        MarketItem {
            key: key.to_string(),
            name: key.to_string(),
            price,
            sell_count: None,
            market_url: format!("https://buff.163.com/goods/{key}"),
            fetched_at: Utc::now(),
        }
    }

    fn youpin_item(key: &str, price: f64) -> MarketItem {
        MarketItem {
            market_url: "https://www.youpin898.com/market/csgo".to_string(),
            ..buff_item(key, price)
        }
    }

    #[test]
    fn full_refresh_publishes_and_seeds_key_cache() {
        let (_dir, keycache, _settings, manager) = manager();

        let count = manager
            .apply_full(
                vec![buff_item("K1", 100.0), buff_item("K2", 50.0)],
                vec![youpin_item("K1", 104.0), youpin_item("K2", 60.0)],
            )
            .unwrap();

        assert_eq!(count, 1);
        let current = manager.current();
        assert_eq!(current.items[0].key, "K1");
        assert_eq!(current.items[0].price_diff, 4.0);

        let (keys, built_at) = keycache.snapshot();
        assert!(keys.contains("K1"));
        assert_eq!(keys.len(), 1);
        assert!(built_at.is_some());
    }

    #[test]
    fn consecutive_full_refreshes_are_identical() {
        let (_dir, _keycache, _settings, manager) = manager();
        let buff_items = vec![buff_item("K1", 100.0), buff_item("K2", 50.0)];
        let youpin_items = vec![youpin_item("K1", 104.0), youpin_item("K2", 54.0)];

        manager
            .apply_full(buff_items.clone(), youpin_items.clone())
            .unwrap();
        let first = manager.current();

        manager.apply_full(buff_items, youpin_items).unwrap();
        let second = manager.current();

        assert_eq!(first.items.len(), second.items.len());
        for (a, b) in first.items.iter().zip(second.items.iter()) {
            assert_eq!(a.key, b.key);
            assert_eq!(a.price_diff, b.price_diff);
            assert_eq!(a.profit_margin, b.profit_margin);
        }
    }

    #[test]
    fn empty_upstreams_preserve_the_previous_result() {
        let (_dir, _keycache, _settings, manager) = manager();
        manager
            .apply_full(
                vec![buff_item("K1", 100.0)],
                vec![youpin_item("K1", 104.0)],
            )
            .unwrap();

        let err = manager.apply_full(Vec::new(), Vec::new()).unwrap_err();
        assert!(matches!(err, RefreshError::UpstreamUnavailable));
        assert_eq!(manager.current().items.len(), 1);
    }

    #[test]
    fn one_sided_empty_publishes_an_empty_set() {
        let (_dir, keycache, _settings, manager) = manager();
        let count = manager
            .apply_full(vec![buff_item("K1", 100.0)], Vec::new())
            .unwrap();

        assert_eq!(count, 0);
        assert!(manager.current().items.is_empty());
        assert!(keycache.is_empty());
    }

    #[test]
    fn incremental_restricts_to_interesting_keys() {
        let (_dir, _keycache, _settings, manager) = manager();

        // Full refresh finds K1 only; K1 becomes the interesting set.
        manager
            .apply_full(
                vec![buff_item("K1", 100.0), buff_item("K2", 50.0)],
                vec![youpin_item("K1", 104.0), youpin_item("K2", 60.0)],
            )
            .unwrap();

        // The next scan also carries K3 with a valid diff, but K3 is not
        // interesting yet, so it stays out until the next full cycle.
        let count = manager
            .apply_incremental(
                vec![
                    buff_item("K1", 100.0),
                    buff_item("K3", 20.0),
                ],
                vec![
                    youpin_item("K1", 103.5),
                    youpin_item("K3", 24.0),
                ],
            )
            .unwrap();

        assert_eq!(count, 1);
        let current = manager.current();
        assert_eq!(current.items[0].key, "K1");
        assert_eq!(current.items[0].price_diff, 3.5);
    }

    #[test]
    fn incremental_keeps_unscanned_interesting_keys() {
        let (_dir, _keycache, _settings, manager) = manager();

        manager
            .apply_full(
                vec![buff_item("K1", 100.0), buff_item("K2", 50.0)],
                vec![youpin_item("K1", 104.0), youpin_item("K2", 54.0)],
            )
            .unwrap();
        assert_eq!(manager.current().items.len(), 2);

        // K2 is missing from this scan but still interesting: retained
        // with its previous differential.
        manager
            .apply_incremental(
                vec![buff_item("K1", 100.0)],
                vec![youpin_item("K1", 104.5)],
            )
            .unwrap();

        let current = manager.current();
        assert_eq!(current.items.len(), 2);
        let k1 = current.items.iter().find(|p| p.key == "K1").unwrap();
        let k2 = current.items.iter().find(|p| p.key == "K2").unwrap();
        assert_eq!(k1.price_diff, 4.5);
        assert_eq!(k2.price_diff, 4.0);
    }

    #[test]
    fn incremental_with_empty_cache_degrades_to_full() {
        let (_dir, keycache, _settings, manager) = manager();
        assert!(keycache.is_empty());

        let count = manager
            .apply_incremental(
                vec![buff_item("K1", 100.0)],
                vec![youpin_item("K1", 104.0)],
            )
            .unwrap();

        assert_eq!(count, 1);
        // Degraded cycle behaves like a full one: key cache is seeded.
        assert_eq!(keycache.len(), 1);
    }

    #[test]
    fn filter_change_forces_next_cycle_full() {
        let (_dir, keycache, settings, manager) = manager();
        manager
            .apply_full(
                vec![buff_item("K1", 100.0)],
                vec![youpin_item("K1", 104.0)],
            )
            .unwrap();
        assert!(!keycache.is_empty());

        settings.set_price_diff_range(10.0, 20.0).unwrap();
        assert!(keycache.is_empty());

        // The next incremental apply therefore runs the full path under
        // the new band, which K1's diff of 4 no longer satisfies.
        let count = manager
            .apply_incremental(
                vec![buff_item("K1", 100.0)],
                vec![youpin_item("K1", 104.0)],
            )
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn second_refresh_request_is_rejected_while_running() {
        let (_dir, _keycache, _settings, manager) = manager();

        let guard = manager.refresh_gate.try_lock().unwrap();
        let err = manager.run_full_refresh().await.unwrap_err();
        assert!(matches!(err, RefreshError::AlreadyRunning));
        drop(guard);
    }

    #[test]
    fn cancelled_cycle_leaves_state_clean() {
        let (_dir, _keycache, _settings, manager) = manager();
        manager
            .apply_full(
                vec![buff_item("K1", 100.0)],
                vec![youpin_item("K1", 104.0)],
            )
            .unwrap();
        let before = manager.current();

        let _token = manager.begin(RefreshPhase::RunningFull);
        assert!(manager.is_running());
        manager.finish(&Err(RefreshError::Cancelled));

        assert_eq!(manager.phase(), RefreshPhase::Idle);
        assert!(Arc::ptr_eq(&before, &manager.current()));
        let status = manager.status();
        assert_eq!(status.last_outcome.as_deref(), Some("cancelled"));
        assert!(status.last_error.is_none());
    }

    #[test]
    fn upstream_failure_is_recorded_in_status() {
        let (_dir, _keycache, _settings, manager) = manager();
        let _token = manager.begin(RefreshPhase::RunningFull);
        manager.finish(&Err(RefreshError::UpstreamUnavailable));

        let status = manager.status();
        assert_eq!(status.last_outcome.as_deref(), Some("failed"));
        assert!(status.last_error.unwrap().contains("no items"));
    }

    #[test]
    fn published_sets_honour_band_and_ordering_invariants() {
        let (_dir, _keycache, settings, manager) = manager();
        settings.set_price_diff_range(0.0, 50.0).unwrap();

        let buff_items: Vec<_> = (0..40)
            .map(|i| buff_item(&format!("K{i:02}"), 10.0 + i as f64))
            .collect();
        let youpin_items: Vec<_> = (0..40)
            .map(|i| youpin_item(&format!("K{i:02}"), 12.0 + i as f64 * 1.3))
            .collect();

        manager.apply_full(buff_items, youpin_items).unwrap();
        let current = manager.current();
        let snapshot = settings.snapshot();

        for pair in &current.items {
            assert!(pair.buff_price > 0.0);
            assert!(pair.price_diff >= snapshot.price_diff_min);
            assert!(pair.price_diff <= snapshot.price_diff_max);
        }
        for pair in current.items.windows(2) {
            assert!(
                crate::analyzer::pair_order(&pair[0], &pair[1])
                    != std::cmp::Ordering::Greater
            );
        }
        assert!(current.items.len() <= snapshot.max_output_items);
    }
}
