//! Buff (buff.163.com) catalogue client.
//!
//! Paginated GET against `/api/market/goods`. Credentials are read from the
//! token store on every request so rotated cookies take effect without a
//! restart.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::FetchError;
use crate::models::{CatalogFetch, MarketItem, RefreshProgress};
use crate::scrapers::{Pacer, RetryPolicy};
use crate::tokens::TokenStore;

const BUFF_BASE: &str = "https://buff.163.com";

pub struct BuffClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    pacer: Pacer,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct GoodsEnvelope {
    data: Option<GoodsData>,
}

#[derive(Debug, Deserialize)]
struct GoodsData {
    #[serde(default)]
    items: Vec<GoodsItem>,
    #[serde(default)]
    total_page: u32,
    #[serde(default)]
    total_count: u64,
}

#[derive(Debug, Deserialize)]
struct GoodsItem {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    market_hash_name: String,
    #[serde(default)]
    sell_min_price: Value,
    #[serde(default)]
    sell_reference_price: Value,
    #[serde(default)]
    sell_num: Option<u32>,
}

/// One fetched page: parsed items plus the advertised catalogue size.
#[derive(Debug)]
pub struct BuffPage {
    pub items: Vec<MarketItem>,
    pub total_pages: u32,
    pub total_count: u64,
}

impl BuffClient {
    pub fn new(tokens: Arc<TokenStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .gzip(true)
            .build()
            .context("Failed to build Buff HTTP client")?;

        Ok(Self {
            client,
            base_url: BUFF_BASE.to_string(),
            tokens,
            pacer: Pacer::new(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn buy_url(&self, goods_id: &str) -> String {
        format!("{}/goods/{}", self.base_url, goods_id)
    }

    fn request_headers(&self) -> HeaderMap {
        let creds = self.tokens.buff();
        let mut headers = HeaderMap::new();

        for (name, value) in &creds.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let cookie_line = creds
            .cookies
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        if !cookie_line.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&cookie_line) {
                headers.insert(COOKIE, value);
            }
        }

        headers
    }

    /// Fetches one catalogue page through the pacing clock and the retry
    /// budget. HTTP 403 is retried exactly once (stale credentials rarely
    /// recover); 429 and transport errors burn the full budget.
    pub async fn fetch_page(
        &self,
        page_num: u32,
        page_size: u32,
        min_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<BuffPage, FetchError> {
        let url = format!("{}/api/market/goods", self.base_url);
        let mut rate_limited_attempts = 0u32;
        let mut last_error: Option<FetchError> = None;

        for attempt in 1..=self.retry.max_retries {
            if attempt > 1 {
                self.retry.wait(attempt - 1, cancel).await?;
            }
            self.pacer.pace(min_delay, cancel).await?;

            let page_num_param = page_num.to_string();
            let page_size_param = page_size.to_string();
            let cache_buster = Utc::now().timestamp_millis().to_string();
            let params = [
                ("game", "csgo"),
                ("page_num", page_num_param.as_str()),
                ("page_size", page_size_param.as_str()),
                ("tab", "selling"),
                ("_", cache_buster.as_str()),
            ];

            let response = match self
                .client
                .get(&url)
                .headers(self.request_headers())
                .query(&params)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(page = page_num, attempt, error = %e, "Buff request failed");
                    last_error = Some(FetchError::Transport(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                rate_limited_attempts += 1;
                warn!(page = page_num, attempt, "Buff rate limited (429)");
                continue;
            }
            if status.as_u16() == 403 || status.as_u16() == 401 {
                warn!(page = page_num, attempt, status = status.as_u16(), "Buff auth rejected");
                if attempt >= 2 {
                    return Err(FetchError::AuthFailed {
                        status: status.as_u16(),
                    });
                }
                continue;
            }
            if !status.is_success() {
                let body: String = response
                    .text()
                    .await
                    .unwrap_or_default()
                    .chars()
                    .take(200)
                    .collect();
                warn!(
                    page = page_num,
                    attempt,
                    status = status.as_u16(),
                    body = %body,
                    "Buff HTTP error"
                );
                last_error = Some(FetchError::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                });
                continue;
            }

            let envelope: GoodsEnvelope = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(page = page_num, attempt, error = %e, "Buff response not JSON");
                    last_error = Some(FetchError::Decode(e.to_string()));
                    continue;
                }
            };

            let Some(data) = envelope.data else {
                warn!(page = page_num, attempt, "Buff response missing data envelope");
                last_error = Some(FetchError::Decode("missing data envelope".to_string()));
                continue;
            };

            return Ok(self.parse_page(data));
        }

        if rate_limited_attempts > 0 {
            return Err(FetchError::RateLimited {
                attempts: rate_limited_attempts,
            });
        }
        Err(last_error.unwrap_or_else(|| {
            FetchError::Decode(format!(
                "page {page_num} failed after {} attempts",
                self.retry.max_retries
            ))
        }))
    }

    fn parse_page(&self, data: GoodsData) -> BuffPage {
        let fetched_at = Utc::now();
        let items = data
            .items
            .into_iter()
            .filter_map(|raw| self.parse_item(raw, fetched_at))
            .collect();

        BuffPage {
            items,
            total_pages: data.total_page,
            total_count: data.total_count,
        }
    }

    fn parse_item(
        &self,
        raw: GoodsItem,
        fetched_at: chrono::DateTime<Utc>,
    ) -> Option<MarketItem> {
        let goods_id = value_to_string(&raw.id)?;
        if raw.name.is_empty() {
            return None;
        }

        let mut price = value_to_f64(&raw.sell_min_price);
        if price <= 0.0 {
            price = value_to_f64(&raw.sell_reference_price);
        }
        // Not on sale: no joinable price, drop the listing.
        if price <= 0.0 {
            return None;
        }

        let key = if raw.market_hash_name.is_empty() {
            raw.name.clone()
        } else {
            raw.market_hash_name
        };

        Some(MarketItem {
            key,
            name: raw.name,
            price,
            sell_count: raw.sell_num,
            market_url: self.buy_url(&goods_id),
            fetched_at,
        })
    }

    /// Walks the catalogue: page 1 advertises the page count, the walk is
    /// capped at `max_pages`, and failed pages are counted but do not stop
    /// the walk. Auth rejection aborts; cancellation returns what has been
    /// collected (the orchestrator discards it).
    pub async fn fetch_all(
        &self,
        max_pages: u32,
        page_size: u32,
        min_delay: Duration,
        cancel: &CancellationToken,
        progress: &RefreshProgress,
    ) -> Result<CatalogFetch, FetchError> {
        info!(max_pages, page_size, "📦 Starting Buff catalogue walk");
        let mut fetch = CatalogFetch::default();

        let first = match self.fetch_page(1, page_size, min_delay, cancel).await {
            Ok(page) => page,
            Err(FetchError::Cancelled) => return Ok(fetch),
            Err(e) if e.is_auth() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Buff first page failed, aborting walk");
                fetch.stats.failed_pages = 1;
                return Ok(fetch);
            }
        };

        let pages = first.total_pages.min(max_pages).max(1);
        progress.add_total(pages);
        progress.page_done();

        info!(
            total_count = first.total_count,
            advertised_pages = first.total_pages,
            planned_pages = pages,
            "Buff catalogue sized"
        );

        fetch.stats.successful_pages = 1;
        fetch.items.extend(first.items);

        for page_num in 2..=pages {
            if cancel.is_cancelled() {
                debug!(page = page_num, "Buff walk cancelled");
                return Ok(fetch);
            }

            match self.fetch_page(page_num, page_size, min_delay, cancel).await {
                Ok(page) => {
                    fetch.stats.successful_pages += 1;
                    fetch.items.extend(page.items);
                }
                Err(FetchError::Cancelled) => return Ok(fetch),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    fetch.stats.failed_pages += 1;
                    warn!(page = page_num, error = %e, "Buff page failed");
                }
            }
            progress.page_done();

            if page_num % 10 == 0 {
                info!(
                    page = page_num,
                    of = pages,
                    items = fetch.items.len(),
                    "Buff walk progress"
                );
            }
        }

        fetch.stats.total_items = fetch.items.len();
        info!(
            successful = fetch.stats.successful_pages,
            failed = fetch.stats.failed_pages,
            items = fetch.stats.total_items,
            "✅ Buff catalogue walk done"
        );
        Ok(fetch)
    }

    /// One small authenticated read used by the token test endpoint.
    pub async fn probe(&self) -> Result<usize, FetchError> {
        let cancel = CancellationToken::new();
        let page = self
            .fetch_page(1, 10, Duration::from_secs(1), &cancel)
            .await?;
        Ok(page.items.len())
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> (tempfile::TempDir, BuffClient) {
        let dir = tempfile::tempdir().unwrap();
        let tokens = Arc::new(TokenStore::load(dir.path().join("tokens.json")));
        let client = BuffClient::new(tokens).unwrap();
        (dir, client)
    }

    #[test]
    fn parses_string_and_numeric_prices() {
        let (_dir, client) = client();
        let data: GoodsData = serde_json::from_value(serde_json::json!({
            "items": [
                {"id": 33815, "name": "AK-47 | Redline (Field-Tested)",
                 "market_hash_name": "AK-47 | Redline (Field-Tested)",
                 "sell_min_price": "45.5", "sell_num": 120},
                {"id": "900123", "name": "AWP | Asiimov (Field-Tested)",
                 "market_hash_name": "AWP | Asiimov (Field-Tested)",
                 "sell_min_price": 0, "sell_reference_price": 310.0},
            ],
            "total_page": 42,
            "total_count": 3360
        }))
        .unwrap();

        let page = client.parse_page(data);
        assert_eq!(page.total_pages, 42);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].price, 45.5);
        assert_eq!(page.items[0].sell_count, Some(120));
        assert_eq!(
            page.items[0].market_url,
            "https://buff.163.com/goods/33815"
        );
        // Reference price fallback when the minimum sale price is absent.
        assert_eq!(page.items[1].price, 310.0);
    }

    #[test]
    fn drops_unsaleable_and_nameless_items() {
        let (_dir, client) = client();
        let data: GoodsData = serde_json::from_value(serde_json::json!({
            "items": [
                {"id": 1, "name": "P250 | Sand Dune (Field-Tested)", "sell_min_price": "0"},
                {"id": 2, "name": "", "sell_min_price": "10"},
                {"id": 3, "name": "Glock-18 | Fade (Factory New)", "sell_min_price": "1200.00",
                 "market_hash_name": "Glock-18 | Fade (Factory New)"},
            ],
            "total_page": 1,
            "total_count": 3
        }))
        .unwrap();

        let page = client.parse_page(data);
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].key, "Glock-18 | Fade (Factory New)");
    }

    #[test]
    fn missing_hash_name_falls_back_to_display_name() {
        let (_dir, client) = client();
        let data: GoodsData = serde_json::from_value(serde_json::json!({
            "items": [{"id": 7, "name": "Sticker | Crown (Foil)", "sell_min_price": "800"}],
            "total_page": 1,
            "total_count": 1
        }))
        .unwrap();

        let page = client.parse_page(data);
        assert_eq!(page.items[0].key, "Sticker | Crown (Foil)");
    }
}
