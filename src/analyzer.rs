//! Cross-market matching and ranking.
//!
//! Joins the Buff catalogue against the Youpin catalogue on the market hash
//! name, with an exact display-name fallback for the small tail of listings
//! that carry no hash name. Similarity-based matching was removed long ago;
//! only exact joins survive.

use chrono::Utc;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{MarketItem, MatchSource, PriceDiffItem};
use crate::settings::Settings;

/// Filter parameters the matcher actually consumes, snapshotted from the
/// settings store at the start of a refresh.
#[derive(Debug, Clone)]
pub struct FilterParams {
    pub diff_min: f64,
    pub diff_max: f64,
    pub buff_price_min: f64,
    pub buff_price_max: Option<f64>,
    pub buff_sell_num_min: u32,
    pub max_output_items: usize,
}

impl From<&Settings> for FilterParams {
    fn from(s: &Settings) -> Self {
        Self {
            diff_min: s.price_diff_min,
            diff_max: s.price_diff_max,
            buff_price_min: s.buff_price_min,
            buff_price_max: s.buff_price_max,
            buff_sell_num_min: s.buff_sell_num_min,
            max_output_items: s.max_output_items,
        }
    }
}

impl FilterParams {
    fn buff_price_in_range(&self, price: f64) -> bool {
        price >= self.buff_price_min
            && self.buff_price_max.map_or(true, |max| price <= max)
    }

    fn diff_in_range(&self, diff: f64) -> bool {
        diff >= self.diff_min && diff <= self.diff_max
    }

    fn sell_num_acceptable(&self, sell_count: Option<u32>) -> bool {
        match sell_count {
            Some(n) => n >= self.buff_sell_num_min,
            // Upstream omitted the counter; don't punish the listing.
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchCounts {
    pub hash_exact: u32,
    pub name_exact: u32,
}

/// Joins, filters, ranks, truncates.
///
/// Both Youpin lookup maps keep the lowest price on key collisions; the
/// Buff side is deduplicated the same way so no two emitted pairs share a
/// key. Ordering: profit margin desc, then price diff desc, then key asc.
pub fn match_and_rank(
    buff_items: &[MarketItem],
    youpin_items: &[MarketItem],
    params: &FilterParams,
) -> (Vec<PriceDiffItem>, MatchCounts) {
    let mut youpin_by_hash: HashMap<&str, f64> = HashMap::with_capacity(youpin_items.len());
    let mut youpin_by_name: HashMap<&str, f64> = HashMap::with_capacity(youpin_items.len());
    for item in youpin_items {
        youpin_by_hash
            .entry(item.key.as_str())
            .and_modify(|p| *p = p.min(item.price))
            .or_insert(item.price);
        youpin_by_name
            .entry(item.name.as_str())
            .and_modify(|p| *p = p.min(item.price))
            .or_insert(item.price);
    }

    // Lowest asking price wins when the same key shows up on several pages.
    let mut buff_by_key: HashMap<&str, &MarketItem> = HashMap::with_capacity(buff_items.len());
    for item in buff_items {
        buff_by_key
            .entry(item.key.as_str())
            .and_modify(|existing| {
                if item.price < existing.price {
                    *existing = item;
                }
            })
            .or_insert(item);
    }

    let observed_at = Utc::now();
    let mut pairs: Vec<PriceDiffItem> = buff_by_key
        .par_iter()
        .filter_map(|(_, buff)| {
            if buff.price <= 0.0 || !params.buff_price_in_range(buff.price) {
                return None;
            }
            if !params.sell_num_acceptable(buff.sell_count) {
                return None;
            }

            let (youpin_price, matched_by) =
                match youpin_by_hash.get(buff.key.as_str()) {
                    Some(price) => (*price, MatchSource::HashExact),
                    None => match youpin_by_name.get(buff.name.as_str()) {
                        Some(price) => (*price, MatchSource::NameExact),
                        None => return None,
                    },
                };

            let price_diff = youpin_price - buff.price;
            if !params.diff_in_range(price_diff) {
                return None;
            }

            Some(PriceDiffItem {
                key: buff.key.clone(),
                name: buff.name.clone(),
                buff_price: buff.price,
                youpin_price,
                price_diff,
                profit_margin: price_diff / buff.price,
                buff_url: buff.market_url.clone(),
                matched_by,
                updated_at: observed_at,
            })
        })
        .collect();

    let counts = MatchCounts {
        hash_exact: pairs
            .iter()
            .filter(|p| p.matched_by == MatchSource::HashExact)
            .count() as u32,
        name_exact: pairs
            .iter()
            .filter(|p| p.matched_by == MatchSource::NameExact)
            .count() as u32,
    };

    sort_pairs(&mut pairs);
    pairs.truncate(params.max_output_items);

    (pairs, counts)
}

/// Profit margin desc, price diff desc, key asc. Total and deterministic.
pub fn sort_pairs(pairs: &mut [PriceDiffItem]) {
    pairs.sort_by(pair_order);
}

/// The published ordering, shared by the ranker and the incremental merge.
pub fn pair_order(a: &PriceDiffItem, b: &PriceDiffItem) -> Ordering {
    b.profit_margin
        .total_cmp(&a.profit_margin)
        .then_with(|| b.price_diff.total_cmp(&a.price_diff))
        .then_with(|| a.key.cmp(&b.key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn buff(key: &str, price: f64) -> MarketItem {
        MarketItem {
            key: key.to_string(),
            name: key.to_string(),
            price,
            sell_count: None,
            market_url: format!("https://buff.163.com/goods/{key}"),
            fetched_at: Utc::now(),
        }
    }

    fn buff_named(key: &str, name: &str, price: f64) -> MarketItem {
        MarketItem {
            name: name.to_string(),
            ..buff(key, price)
        }
    }

    fn youpin(key: &str, price: f64) -> MarketItem {
        MarketItem {
            key: key.to_string(),
            name: key.to_string(),
            price,
            sell_count: None,
            market_url: "https://www.youpin898.com/market/csgo".to_string(),
            fetched_at: Utc::now(),
        }
    }

    fn params(diff_min: f64, diff_max: f64) -> FilterParams {
        FilterParams {
            diff_min,
            diff_max,
            buff_price_min: 0.0,
            buff_price_max: None,
            buff_sell_num_min: 0,
            max_output_items: 10,
        }
    }

    #[test]
    fn happy_path_keeps_in_band_pair_only() {
        let buff_items = vec![buff("K1", 100.0), buff("K2", 50.0)];
        let youpin_items = vec![youpin("K1", 104.0), youpin("K2", 60.0)];

        let (pairs, counts) = match_and_rank(&buff_items, &youpin_items, &params(3.0, 5.0));

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "K1");
        assert_eq!(pairs[0].price_diff, 4.0);
        assert!((pairs[0].profit_margin - 0.04).abs() < 1e-12);
        assert_eq!(counts.hash_exact, 1);
        assert_eq!(counts.name_exact, 0);
    }

    #[test]
    fn name_match_is_a_fallback_only() {
        let buff_items = vec![buff_named("K1", "Foo", 10.0)];
        let youpin_items = vec![MarketItem {
            key: "other-key".to_string(),
            ..youpin("Foo", 14.0)
        }];

        let (pairs, counts) = match_and_rank(&buff_items, &youpin_items, &params(3.0, 5.0));

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].matched_by, MatchSource::NameExact);
        assert_eq!(pairs[0].price_diff, 4.0);
        assert_eq!(counts.name_exact, 1);
    }

    #[test]
    fn buff_price_band_filters_the_buy_side() {
        let buff_items = vec![buff("K1", 3.0), buff("K2", 10.0)];
        let youpin_items = vec![youpin("K1", 7.0), youpin("K2", 14.0)];

        let mut p = params(3.0, 5.0);
        p.buff_price_min = 5.0;
        p.buff_price_max = Some(20.0);

        let (pairs, _) = match_and_rank(&buff_items, &youpin_items, &p);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key, "K2");
    }

    #[test]
    fn diff_band_bounds_are_inclusive() {
        let buff_items = vec![buff("LO", 10.0), buff("HI", 10.0), buff("OUT", 10.0)];
        let youpin_items = vec![youpin("LO", 13.0), youpin("HI", 15.0), youpin("OUT", 15.01)];

        let (pairs, _) = match_and_rank(&buff_items, &youpin_items, &params(3.0, 5.0));
        let keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
        assert!(keys.contains(&"LO"));
        assert!(keys.contains(&"HI"));
        assert!(!keys.contains(&"OUT"));
    }

    #[test]
    fn collisions_keep_the_lowest_price_on_both_sides() {
        let buff_items = vec![buff("K1", 100.0), buff("K1", 96.0)];
        let youpin_items = vec![youpin("K1", 105.0), youpin("K1", 100.0)];

        let (pairs, _) = match_and_rank(&buff_items, &youpin_items, &params(0.0, 100.0));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].buff_price, 96.0);
        assert_eq!(pairs[0].youpin_price, 100.0);
    }

    #[test]
    fn no_two_pairs_share_a_key() {
        let buff_items = vec![buff("K1", 10.0), buff("K1", 11.0), buff("K2", 20.0)];
        let youpin_items = vec![youpin("K1", 14.0), youpin("K2", 24.0)];

        let (pairs, _) = match_and_rank(&buff_items, &youpin_items, &params(0.0, 100.0));
        let mut keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), pairs.len());
    }

    #[test]
    fn ranking_is_margin_then_diff_then_key() {
        // Same margin, different diff: bigger diff first.
        let buff_items = vec![buff("A", 100.0), buff("B", 200.0), buff("C", 100.0)];
        let youpin_items = vec![youpin("A", 110.0), youpin("B", 220.0), youpin("C", 110.0)];

        let (pairs, _) = match_and_rank(&buff_items, &youpin_items, &params(0.0, 100.0));
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].key, "B"); // margin 0.10, diff 20
        assert_eq!(pairs[1].key, "A"); // margin 0.10, diff 10, key A < C
        assert_eq!(pairs[2].key, "C");
    }

    #[test]
    fn output_is_capped() {
        let buff_items: Vec<_> = (0..50).map(|i| buff(&format!("K{i:02}"), 10.0)).collect();
        let youpin_items: Vec<_> = (0..50).map(|i| youpin(&format!("K{i:02}"), 14.0)).collect();

        let mut p = params(0.0, 100.0);
        p.max_output_items = 7;

        let (pairs, counts) = match_and_rank(&buff_items, &youpin_items, &p);
        assert_eq!(pairs.len(), 7);
        // Counts reflect everything that matched, not just the survivors.
        assert_eq!(counts.hash_exact, 50);
    }

    #[test]
    fn sell_count_floor_drops_thin_listings() {
        let mut thin = buff("THIN", 10.0);
        thin.sell_count = Some(2);
        let mut thick = buff("THICK", 10.0);
        thick.sell_count = Some(50);
        let unknown = buff("UNKNOWN", 10.0);

        let youpin_items = vec![
            youpin("THIN", 14.0),
            youpin("THICK", 14.0),
            youpin("UNKNOWN", 14.0),
        ];

        let mut p = params(0.0, 100.0);
        p.buff_sell_num_min = 10;

        let (pairs, _) = match_and_rank(&[thin, thick, unknown], &youpin_items, &p);
        let keys: Vec<&str> = pairs.iter().map(|p| p.key.as_str()).collect();
        assert!(!keys.contains(&"THIN"));
        assert!(keys.contains(&"THICK"));
        assert!(keys.contains(&"UNKNOWN"));
    }

    #[test]
    fn one_sided_catalogue_produces_empty_result() {
        let buff_items = vec![buff("K1", 10.0)];
        let (pairs, counts) = match_and_rank(&buff_items, &[], &params(0.0, 100.0));
        assert!(pairs.is_empty());
        assert_eq!(counts.hash_exact + counts.name_exact, 0);
    }
}
