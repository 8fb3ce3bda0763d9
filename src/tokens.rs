//! Credential store for the two marketplaces.
//!
//! Both upstreams authenticate with rotating browser material (cookies,
//! device identifiers, bearer tokens). The store owns a single JSON file,
//! hands out snapshots to the HTTP clients at request time, and accepts
//! updates from the token endpoints without a restart.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::errors::StoreError;
use crate::keycache::write_json_atomic;

pub const MARKET_BUFF: &str = "buff";
pub const MARKET_YOUPIN: &str = "youpin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuffCredentials {
    pub cookies: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub configured: bool,
}

impl Default for BuffCredentials {
    fn default() -> Self {
        let mut cookies = BTreeMap::new();
        for key in ["Device-Id", "remember_me", "session", "csrf_token"] {
            cookies.insert(key.to_string(), String::new());
        }
        cookies.insert("Locale-Supported".to_string(), "zh-Hans".to_string());
        cookies.insert("game".to_string(), "csgo".to_string());

        let mut headers = BTreeMap::new();
        headers.insert(
            "Accept".to_string(),
            "application/json, text/javascript, */*; q=0.01".to_string(),
        );
        headers.insert(
            "Accept-Language".to_string(),
            "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
        );
        headers.insert(
            "Referer".to_string(),
            "https://buff.163.com/market/csgo".to_string(),
        );
        headers.insert(
            "User-Agent".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36".to_string(),
        );
        headers.insert("X-Requested-With".to_string(), "XMLHttpRequest".to_string());

        Self {
            cookies,
            headers,
            last_updated: None,
            configured: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoupinCredentials {
    pub device_id: String,
    pub device_uk: String,
    pub uk: String,
    pub b3: String,
    pub authorization: String,
    pub headers: BTreeMap<String, String>,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub configured: bool,
}

impl Default for YoupinCredentials {
    fn default() -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(
            "Accept".to_string(),
            "application/json, text/plain, */*".to_string(),
        );
        headers.insert(
            "Accept-Language".to_string(),
            "zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
        );
        headers.insert("App-Version".to_string(), "6.12.0".to_string());
        headers.insert("AppType".to_string(), "1".to_string());
        headers.insert("AppVersion".to_string(), "6.12.0".to_string());
        headers.insert("Platform".to_string(), "pc".to_string());
        headers.insert("Secret-V".to_string(), "h5_v1".to_string());
        headers.insert(
            "Origin".to_string(),
            "https://www.youpin898.com".to_string(),
        );
        headers.insert(
            "Referer".to_string(),
            "https://www.youpin898.com/".to_string(),
        );
        headers.insert(
            "User-Agent".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36".to_string(),
        );

        Self {
            device_id: String::new(),
            device_uk: String::new(),
            uk: String::new(),
            b3: String::new(),
            authorization: String::new(),
            headers,
            last_updated: None,
            configured: false,
        }
    }
}

impl YoupinCredentials {
    /// W3C traceparent derived from the `b3` field, when it carries at
    /// least `trace_id-span_id`.
    pub fn traceparent(&self) -> Option<String> {
        let mut parts = self.b3.split('-');
        let trace = parts.next().filter(|s| !s.is_empty())?;
        let span = parts.next().filter(|s| !s.is_empty())?;
        Some(format!("00-{trace}-{span}-01"))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TokensFile {
    buff: BuffCredentials,
    youpin: YoupinCredentials,
}

/// Body of `POST /tokens/buff`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuffCredentialsUpdate {
    pub cookies: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

/// Body of `POST /tokens/youpin`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct YoupinCredentialsUpdate {
    pub device_id: Option<String>,
    pub device_uk: Option<String>,
    pub uk: Option<String>,
    pub b3: Option<String>,
    pub authorization: Option<String>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct MarketTokenStatus {
    pub configured: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub fields: Value,
}

#[derive(Debug, Serialize)]
pub struct TokensStatus {
    pub buff: MarketTokenStatus,
    pub youpin: MarketTokenStatus,
}

pub struct TokenStore {
    path: PathBuf,
    inner: RwLock<TokensFile>,
}

impl TokenStore {
    /// Loads the store from `path`; on first boot the default template is
    /// written out so operators can see which fields to fill in.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<TokensFile>(&bytes) {
                Ok(file) => {
                    info!(path = %path.display(), "🔑 Token store loaded");
                    file
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Token store unreadable, using defaults");
                    TokensFile::default()
                }
            },
            Err(_) => {
                let file = TokensFile::default();
                if let Err(e) = write_json_atomic(&path, &file) {
                    warn!(error = %e, "Failed to write default token store");
                } else {
                    info!(path = %path.display(), "🔑 Created default token store");
                }
                file
            }
        };

        Self {
            path,
            inner: RwLock::new(inner),
        }
    }

    pub fn buff(&self) -> BuffCredentials {
        self.inner.read().buff.clone()
    }

    pub fn youpin(&self) -> YoupinCredentials {
        self.inner.read().youpin.clone()
    }

    /// Merges a Buff credential update, persists, and commits. The live
    /// record is left untouched when validation or the write fails.
    pub fn update_buff(&self, update: BuffCredentialsUpdate) -> Result<(), StoreError> {
        let required = ["session", "csrf_token"];
        for field in required {
            let value = update.cookies.get(field).map(String::as_str).unwrap_or("");
            if value.trim().is_empty() {
                return Err(StoreError::ValidationFailed(format!(
                    "buff cookie '{field}' must not be blank"
                )));
            }
        }

        let mut next = self.inner.read().clone();
        next.buff.cookies.extend(update.cookies);
        if let Some(headers) = update.headers {
            next.buff.headers.extend(headers);
        }
        next.buff.last_updated = Some(Utc::now());
        next.buff.configured = true;

        write_json_atomic(&self.path, &next)?;
        *self.inner.write() = next;
        info!("🔑 Buff credentials updated");
        Ok(())
    }

    /// Merges a Youpin credential update; same commit discipline as
    /// [`Self::update_buff`].
    pub fn update_youpin(&self, update: YoupinCredentialsUpdate) -> Result<(), StoreError> {
        let mut next = self.inner.read().clone();
        let record = &mut next.youpin;

        if let Some(v) = update.device_id {
            record.device_id = v;
        }
        if let Some(v) = update.device_uk {
            record.device_uk = v;
        }
        if let Some(v) = update.uk {
            record.uk = v;
        }
        if let Some(v) = update.b3 {
            record.b3 = v;
        }
        if let Some(v) = update.authorization {
            record.authorization = v;
        }
        if let Some(headers) = update.headers {
            record.headers.extend(headers);
        }

        for (field, value) in [
            ("device_id", &record.device_id),
            ("uk", &record.uk),
            ("authorization", &record.authorization),
        ] {
            if value.trim().is_empty() {
                return Err(StoreError::ValidationFailed(format!(
                    "youpin field '{field}' must not be blank"
                )));
            }
        }

        record.last_updated = Some(Utc::now());
        record.configured = true;

        write_json_atomic(&self.path, &next)?;
        *self.inner.write() = next;
        info!("🔑 Youpin credentials updated");
        Ok(())
    }

    pub fn status(&self) -> TokensStatus {
        let inner = self.inner.read();

        let buff_has = |cookie: &str| {
            !inner
                .buff
                .cookies
                .get(cookie)
                .map(String::as_str)
                .unwrap_or("")
                .trim()
                .is_empty()
        };

        TokensStatus {
            buff: MarketTokenStatus {
                configured: inner.buff.configured,
                last_updated: inner.buff.last_updated,
                fields: serde_json::json!({
                    "has_session": buff_has("session"),
                    "has_csrf_token": buff_has("csrf_token"),
                }),
            },
            youpin: MarketTokenStatus {
                configured: inner.youpin.configured,
                last_updated: inner.youpin.last_updated,
                fields: serde_json::json!({
                    "has_device_id": !inner.youpin.device_id.trim().is_empty(),
                    "has_uk": !inner.youpin.uk.trim().is_empty(),
                    "has_authorization": !inner.youpin.authorization.trim().is_empty(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::load(dir.path().join("tokens_config.json"));
        (dir, store)
    }

    fn buff_update() -> BuffCredentialsUpdate {
        BuffCredentialsUpdate {
            cookies: [
                ("session".to_string(), "sess-abc".to_string()),
                ("csrf_token".to_string(), "csrf-xyz".to_string()),
            ]
            .into_iter()
            .collect(),
            headers: None,
        }
    }

    #[test]
    fn first_boot_writes_default_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens_config.json");
        let store = TokenStore::load(&path);

        assert!(path.exists());
        assert!(!store.buff().configured);
        assert_eq!(store.buff().cookies.get("game").unwrap(), "csgo");
    }

    #[test]
    fn update_then_get_returns_written_fields() {
        let (_dir, store) = temp_store();
        store.update_buff(buff_update()).unwrap();

        let buff = store.buff();
        assert!(buff.configured);
        assert_eq!(buff.cookies.get("session").unwrap(), "sess-abc");
        assert!(buff.last_updated.is_some());
        // Untouched defaults survive the merge.
        assert_eq!(buff.cookies.get("game").unwrap(), "csgo");
    }

    #[test]
    fn update_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens_config.json");

        TokenStore::load(&path).update_buff(buff_update()).unwrap();

        let reloaded = TokenStore::load(&path);
        assert_eq!(reloaded.buff().cookies.get("csrf_token").unwrap(), "csrf-xyz");
        assert!(reloaded.status().buff.configured);
    }

    #[test]
    fn blank_required_buff_cookie_is_rejected() {
        let (_dir, store) = temp_store();
        let mut update = buff_update();
        update.cookies.insert("csrf_token".to_string(), "  ".to_string());

        let err = store.update_buff(update).unwrap_err();
        assert!(matches!(err, StoreError::ValidationFailed(_)));
        assert!(!store.buff().configured);
    }

    #[test]
    fn youpin_requires_device_id_uk_and_authorization() {
        let (_dir, store) = temp_store();
        let err = store
            .update_youpin(YoupinCredentialsUpdate {
                device_id: Some("dev-1".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::ValidationFailed(_)));

        store
            .update_youpin(YoupinCredentialsUpdate {
                device_id: Some("dev-1".to_string()),
                uk: Some("uk-1".to_string()),
                authorization: Some("Bearer tok".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(store.youpin().configured);
    }

    #[test]
    fn traceparent_derived_from_b3() {
        let creds = YoupinCredentials {
            b3: "abcd1234-ef567890-1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            creds.traceparent().unwrap(),
            "00-abcd1234-ef567890-01"
        );

        let empty = YoupinCredentials::default();
        assert!(empty.traceparent().is_none());
    }

    #[test]
    fn status_reflects_populated_fields() {
        let (_dir, store) = temp_store();
        let status = store.status();
        assert!(!status.buff.configured);
        assert_eq!(status.buff.fields["has_session"], false);

        store.update_buff(buff_update()).unwrap();
        let status = store.status();
        assert_eq!(status.buff.fields["has_session"], true);
        assert_eq!(status.buff.fields["has_csrf_token"], true);
    }
}
