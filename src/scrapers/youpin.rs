//! Youpin (youpin898.com) catalogue client.
//!
//! Paginated POST against the sale-template query endpoint. The upstream
//! never advertises a page count; the walk ends at the first empty page.

use anyhow::{Context, Result};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
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

const YOUPIN_API_BASE: &str = "https://api.youpin898.com";
const MARKET_PAGE_BASE: &str = "https://www.youpin898.com";

pub struct YoupinClient {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenStore>,
    pacer: Pacer,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct SaleTemplateEnvelope {
    #[serde(rename = "Data", default)]
    data: Option<Vec<SaleTemplateItem>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaleTemplateItem {
    #[serde(default)]
    commodity_hash_name: String,
    #[serde(default)]
    commodity_name: String,
    #[serde(default)]
    price: Value,
    #[serde(default)]
    on_sale_count: Option<u32>,
}

impl YoupinClient {
    pub fn new(tokens: Arc<TokenStore>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .gzip(true)
            .build()
            .context("Failed to build Youpin HTTP client")?;

        Ok(Self {
            client,
            base_url: YOUPIN_API_BASE.to_string(),
            tokens,
            pacer: Pacer::new(),
            retry: RetryPolicy::default(),
        })
    }

    fn request_headers(&self) -> HeaderMap {
        let creds = self.tokens.youpin();
        let mut headers = HeaderMap::new();

        for (name, value) in &creds.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let device_fields = [
            ("DeviceId", creds.device_id.as_str()),
            ("DeviceUk", creds.device_uk.as_str()),
            ("Uk", creds.uk.as_str()),
            ("B3", creds.b3.as_str()),
            ("Authorization", creds.authorization.as_str()),
        ];
        for (name, value) in device_fields {
            if value.is_empty() {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        if let Some(traceparent) = creds.traceparent() {
            if let Ok(value) = HeaderValue::from_str(&traceparent) {
                headers.insert(HeaderName::from_static("traceparent"), value);
            }
        }

        headers
    }

    /// Fetches one page of the sale catalogue. Same retry discipline as the
    /// Buff client: 403 retried once, 429 and transport errors burn the
    /// full budget.
    pub async fn fetch_page(
        &self,
        page_index: u32,
        page_size: u32,
        min_delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<MarketItem>, FetchError> {
        let url = format!(
            "{}/api/homepage/pc/goods/market/querySaleTemplate",
            self.base_url
        );
        let payload = serde_json::json!({
            "listSortType": 0,
            "sortType": 0,
            "pageSize": page_size,
            "pageIndex": page_index,
        });
        let mut rate_limited_attempts = 0u32;
        let mut last_error: Option<FetchError> = None;

        for attempt in 1..=self.retry.max_retries {
            if attempt > 1 {
                self.retry.wait(attempt - 1, cancel).await?;
            }
            self.pacer.pace(min_delay, cancel).await?;

            let response = match self
                .client
                .post(&url)
                .headers(self.request_headers())
                .json(&payload)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(page = page_index, attempt, error = %e, "Youpin request failed");
                    last_error = Some(FetchError::Transport(e));
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                rate_limited_attempts += 1;
                let body = response.text().await.unwrap_or_default();
                warn!(
                    page = page_index,
                    attempt,
                    body = %body.chars().take(200).collect::<String>(),
                    "Youpin rate limited (429)"
                );
                continue;
            }
            if status.as_u16() == 403 || status.as_u16() == 401 {
                warn!(page = page_index, attempt, status = status.as_u16(), "Youpin auth rejected");
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
                    page = page_index,
                    attempt,
                    status = status.as_u16(),
                    body = %body,
                    "Youpin HTTP error"
                );
                last_error = Some(FetchError::UnexpectedStatus {
                    status: status.as_u16(),
                    body,
                });
                continue;
            }

            let envelope: SaleTemplateEnvelope = match response.json().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(page = page_index, attempt, error = %e, "Youpin response not JSON");
                    last_error = Some(FetchError::Decode(e.to_string()));
                    continue;
                }
            };

            let Some(raw_items) = envelope.data else {
                warn!(page = page_index, attempt, "Youpin response missing Data list");
                last_error = Some(FetchError::Decode("missing Data list".to_string()));
                continue;
            };

            return Ok(parse_items(raw_items));
        }

        if rate_limited_attempts > 0 {
            return Err(FetchError::RateLimited {
                attempts: rate_limited_attempts,
            });
        }
        Err(last_error.unwrap_or_else(|| {
            FetchError::Decode(format!(
                "page {page_index} failed after {} attempts",
                self.retry.max_retries
            ))
        }))
    }

    /// Walks the catalogue up to `max_pages`. A page with zero items means
    /// end-of-stream; a failed page is counted and skipped. Auth rejection
    /// aborts; cancellation returns what has been collected.
    pub async fn fetch_all(
        &self,
        max_pages: u32,
        page_size: u32,
        min_delay: Duration,
        cancel: &CancellationToken,
        progress: &RefreshProgress,
    ) -> Result<CatalogFetch, FetchError> {
        info!(max_pages, page_size, "📦 Starting Youpin catalogue walk");
        let mut fetch = CatalogFetch::default();
        progress.add_total(max_pages);
        let mut pages_walked = 0u32;

        for page_index in 1..=max_pages {
            if cancel.is_cancelled() {
                debug!(page = page_index, "Youpin walk cancelled");
                return Ok(fetch);
            }

            match self
                .fetch_page(page_index, page_size, min_delay, cancel)
                .await
            {
                Ok(items) => {
                    pages_walked += 1;
                    progress.page_done();
                    if items.is_empty() {
                        info!(page = page_index, "Youpin returned an empty page, end of stream");
                        break;
                    }
                    fetch.stats.successful_pages += 1;
                    fetch.items.extend(items);
                }
                Err(FetchError::Cancelled) => return Ok(fetch),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    pages_walked += 1;
                    progress.page_done();
                    fetch.stats.failed_pages += 1;
                    warn!(page = page_index, error = %e, "Youpin page failed");
                }
            }

            if page_index % 10 == 0 {
                info!(
                    page = page_index,
                    of = max_pages,
                    items = fetch.items.len(),
                    "Youpin walk progress"
                );
            }
        }

        // Pages never reached (early end-of-stream) should not linger in
        // the denominator of the progress display.
        if pages_walked < max_pages {
            progress.reduce_total(max_pages - pages_walked);
        }

        fetch.stats.total_items = fetch.items.len();
        info!(
            successful = fetch.stats.successful_pages,
            failed = fetch.stats.failed_pages,
            items = fetch.stats.total_items,
            "✅ Youpin catalogue walk done"
        );
        Ok(fetch)
    }

    /// One small authenticated read used by the token test endpoint.
    pub async fn probe(&self) -> Result<usize, FetchError> {
        let cancel = CancellationToken::new();
        let items = self
            .fetch_page(1, 10, Duration::from_secs(1), &cancel)
            .await?;
        Ok(items.len())
    }
}

fn parse_items(raw_items: Vec<SaleTemplateItem>) -> Vec<MarketItem> {
    let fetched_at = Utc::now();
    raw_items
        .into_iter()
        .filter_map(|raw| {
            if raw.commodity_name.is_empty() && raw.commodity_hash_name.is_empty() {
                return None;
            }
            let price = match &raw.price {
                Value::Number(n) => n.as_f64().unwrap_or(0.0),
                Value::String(s) => s.trim().parse().unwrap_or(0.0),
                _ => 0.0,
            };
            if price <= 0.0 {
                return None;
            }

            let name = if raw.commodity_name.is_empty() {
                raw.commodity_hash_name.clone()
            } else {
                raw.commodity_name
            };
            let key = if raw.commodity_hash_name.is_empty() {
                name.clone()
            } else {
                raw.commodity_hash_name
            };

            Some(MarketItem {
                key,
                name,
                price,
                sell_count: raw.on_sale_count,
                market_url: format!("{MARKET_PAGE_BASE}/market/csgo"),
                fetched_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sale_template_items() {
        let raw: Vec<SaleTemplateItem> = serde_json::from_value(serde_json::json!([
            {"commodityHashName": "AK-47 | Redline (Field-Tested)",
             "commodityName": "AK-47 | 红线 (久经沙场)",
             "price": "48.8", "onSaleCount": 3200},
            {"commodityHashName": "AWP | Asiimov (Field-Tested)",
             "commodityName": "AWP | 二西莫夫 (久经沙场)",
             "price": 315.5},
        ]))
        .unwrap();

        let items = parse_items(raw);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].key, "AK-47 | Redline (Field-Tested)");
        assert_eq!(items[0].name, "AK-47 | 红线 (久经沙场)");
        assert_eq!(items[0].price, 48.8);
        assert_eq!(items[0].sell_count, Some(3200));
        assert_eq!(items[1].price, 315.5);
    }

    #[test]
    fn drops_unpriced_and_anonymous_items() {
        let raw: Vec<SaleTemplateItem> = serde_json::from_value(serde_json::json!([
            {"commodityHashName": "M4A4 | Howl (Field-Tested)", "commodityName": "M4A4", "price": 0},
            {"price": "12.0"},
            {"commodityHashName": "Tec-9 | Nuclear Threat (Well-Worn)",
             "commodityName": "Tec-9", "price": "88"},
        ]))
        .unwrap();

        let items = parse_items(raw);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "Tec-9 | Nuclear Threat (Well-Worn)");
    }

    #[test]
    fn hash_name_backfills_missing_display_name() {
        let raw: Vec<SaleTemplateItem> = serde_json::from_value(serde_json::json!([
            {"commodityHashName": "Five-SeveN | Case Hardened (Minimal Wear)", "price": "30"},
        ]))
        .unwrap();

        let items = parse_items(raw);
        assert_eq!(items[0].name, "Five-SeveN | Case Hardened (Minimal Wear)");
        assert_eq!(items[0].key, items[0].name);
    }
}
