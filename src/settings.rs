//! Runtime-mutable analysis parameters.
//!
//! Filter parameters (diff band, buy-side price band, output cap, minimum
//! sale count) select which keys are "interesting"; mutating any of them
//! invalidates the hash name cache so the next cycle runs full.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::errors::StoreError;
use crate::keycache::HashNameCache;

#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub price_diff_min: f64,
    pub price_diff_max: f64,
    pub buff_price_min: f64,
    /// `None` means unbounded.
    pub buff_price_max: Option<f64>,
    pub buff_sell_num_min: u32,
    pub max_output_items: usize,
    pub buff_max_pages: u32,
    pub youpin_max_pages: u32,
    pub buff_page_size: u32,
    pub youpin_page_size: u32,
    pub buff_min_delay_secs: f64,
    pub youpin_min_delay_secs: f64,
    pub full_update_interval_secs: u64,
    pub incremental_update_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            price_diff_min: 3.0,
            price_diff_max: 5.0,
            buff_price_min: 0.0,
            buff_price_max: None,
            buff_sell_num_min: 0,
            max_output_items: 300,
            buff_max_pages: 100,
            youpin_max_pages: 50,
            buff_page_size: 80,
            youpin_page_size: 100,
            buff_min_delay_secs: 1.0,
            youpin_min_delay_secs: 3.0,
            full_update_interval_secs: 3600,
            incremental_update_interval_secs: 300,
        }
    }
}

/// Partial update accepted by the settings endpoint; absent fields keep
/// their current values.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct SettingsPatch {
    pub price_diff_min: Option<f64>,
    pub price_diff_max: Option<f64>,
    pub buff_price_min: Option<f64>,
    /// `Some(None)` (an explicit JSON `null`) removes the upper bound.
    #[serde(default, with = "double_option")]
    pub buff_price_max: Option<Option<f64>>,
    pub buff_sell_num_min: Option<u32>,
    pub max_output_items: Option<usize>,
    pub buff_max_pages: Option<u32>,
    pub youpin_max_pages: Option<u32>,
    pub buff_page_size: Option<u32>,
    pub youpin_page_size: Option<u32>,
    pub buff_min_delay_secs: Option<f64>,
    pub youpin_min_delay_secs: Option<f64>,
    pub full_update_interval_secs: Option<u64>,
    pub incremental_update_interval_secs: Option<u64>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<f64>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<f64>::deserialize(de).map(Some)
    }
}

impl SettingsPatch {
    fn touches_filters(&self) -> bool {
        self.price_diff_min.is_some()
            || self.price_diff_max.is_some()
            || self.buff_price_min.is_some()
            || self.buff_price_max.is_some()
            || self.buff_sell_num_min.is_some()
            || self.max_output_items.is_some()
    }
}

pub struct SettingsStore {
    inner: RwLock<Settings>,
    keycache: Arc<HashNameCache>,
}

impl SettingsStore {
    pub fn new(keycache: Arc<HashNameCache>) -> Self {
        Self {
            inner: RwLock::new(Settings::default()),
            keycache,
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    /// Validates and applies a partial update. When any filter parameter
    /// changes, the hash name cache is cleared so the next refresh runs
    /// full against the new filters.
    pub fn apply(&self, patch: SettingsPatch) -> Result<Settings, StoreError> {
        let mut next = self.snapshot();

        if let Some(v) = patch.price_diff_min {
            next.price_diff_min = v;
        }
        if let Some(v) = patch.price_diff_max {
            next.price_diff_max = v;
        }
        if let Some(v) = patch.buff_price_min {
            next.buff_price_min = v;
        }
        if let Some(v) = patch.buff_price_max {
            next.buff_price_max = v;
        }
        if let Some(v) = patch.buff_sell_num_min {
            next.buff_sell_num_min = v;
        }
        if let Some(v) = patch.max_output_items {
            next.max_output_items = v;
        }
        if let Some(v) = patch.buff_max_pages {
            next.buff_max_pages = v;
        }
        if let Some(v) = patch.youpin_max_pages {
            next.youpin_max_pages = v;
        }
        if let Some(v) = patch.buff_page_size {
            next.buff_page_size = v;
        }
        if let Some(v) = patch.youpin_page_size {
            next.youpin_page_size = v;
        }
        if let Some(v) = patch.buff_min_delay_secs {
            next.buff_min_delay_secs = v;
        }
        if let Some(v) = patch.youpin_min_delay_secs {
            next.youpin_min_delay_secs = v;
        }
        if let Some(v) = patch.full_update_interval_secs {
            next.full_update_interval_secs = v;
        }
        if let Some(v) = patch.incremental_update_interval_secs {
            next.incremental_update_interval_secs = v;
        }

        validate(&next)?;

        *self.inner.write() = next.clone();

        if patch.touches_filters() {
            info!("⚙️ Filter parameters changed, invalidating hash name cache");
            self.keycache.clear();
        }

        Ok(next)
    }

    pub fn set_price_diff_range(&self, min: f64, max: f64) -> Result<Settings, StoreError> {
        self.apply(SettingsPatch {
            price_diff_min: Some(min),
            price_diff_max: Some(max),
            ..Default::default()
        })
    }

    pub fn set_buff_price_range(
        &self,
        min: f64,
        max: Option<f64>,
    ) -> Result<Settings, StoreError> {
        self.apply(SettingsPatch {
            buff_price_min: Some(min),
            buff_price_max: Some(max),
            ..Default::default()
        })
    }
}

fn validate(s: &Settings) -> Result<(), StoreError> {
    let fail = |msg: String| Err(StoreError::ValidationFailed(msg));

    if !(s.price_diff_min >= 0.0 && s.price_diff_min <= s.price_diff_max) {
        return fail(format!(
            "price diff range must satisfy 0 <= min <= max, got [{}, {}]",
            s.price_diff_min, s.price_diff_max
        ));
    }
    if s.buff_price_min < 0.0 {
        return fail(format!(
            "buff price minimum must be >= 0, got {}",
            s.buff_price_min
        ));
    }
    if let Some(max) = s.buff_price_max {
        if max < s.buff_price_min {
            return fail(format!(
                "buff price range must satisfy min <= max, got [{}, {}]",
                s.buff_price_min, max
            ));
        }
    }
    if !(1..=10_000).contains(&s.max_output_items) {
        return fail(format!(
            "max_output_items must be in 1..=10000, got {}",
            s.max_output_items
        ));
    }
    if s.buff_max_pages < 1 || s.youpin_max_pages < 1 {
        return fail("max pages must be >= 1".to_string());
    }
    if !(1..=200).contains(&s.buff_page_size) || !(1..=200).contains(&s.youpin_page_size) {
        return fail("page size must be in 1..=200".to_string());
    }
    if s.buff_min_delay_secs < 0.0 || s.youpin_min_delay_secs < 0.0 {
        return fail("request delays must be >= 0".to_string());
    }
    if s.full_update_interval_secs < 30 || s.incremental_update_interval_secs < 30 {
        return fail("update intervals must be >= 30 seconds".to_string());
    }

    Ok(())
}
