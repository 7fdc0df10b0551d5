//! OAuth2 bearer token lifecycle.
//!
//! Each credential key maps to one token endpoint and one JSON backing file.
//! Tokens are cached in memory, refreshed synchronously when they are about to
//! expire, and refreshed ahead of time by a background timer.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::{
    errors::Error,
    fsutil,
    logging::Logger,
    scheduler::{lock, Scheduler, TimerHandle},
    Result,
};

const COMPONENT: &str = "TokenManager";

pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);
const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// A background refresh finding the token this far beyond the buffer assumes a
/// foreground call already refreshed it.
const BACKGROUND_SLACK_MS: i64 = 5_000;

/// Where and how to refresh one credential key. Immutable once registered.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSourceConfig {
    pub client_id: String,
    pub token_endpoint: String,
    pub backing_file: PathBuf,
}

/// Cached bearer token. `expires_at` is always absolute (epoch milliseconds).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl TokenRecord {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.expires_at).single()
    }

    /// Expired, or within `buffer` of expiring, at `now`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        now.timestamp_millis() >= self.expires_at.saturating_sub(buffer_ms(buffer))
    }
}

/// On-disk shape as provisioned by hand: `expires_at` may be missing.
#[derive(Deserialize)]
struct StoredToken {
    access_token: String,
    #[serde(default)]
    refresh_token: String,
    expires_at: Option<i64>,
    expires_in: Option<i64>,
    scope: Option<String>,
}

/// Form body of a `grant_type=refresh_token` request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RefreshRequest {
    pub grant_type: &'static str,
    pub refresh_token: String,
    pub client_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
    pub expires_at: Option<i64>,
    pub scope: Option<String>,
}

/// HTTP capability used for refresh calls.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    /// POST the refresh form. A non-success status maps to [`Error::Auth`].
    async fn refresh(&self, token_endpoint: &str, request: &RefreshRequest)
        -> Result<RefreshResponse>;
}

pub struct HttpTokenEndpoint {
    http: reqwest::Client,
}

impl HttpTokenEndpoint {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("relay/0.1")
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn refresh(
        &self,
        token_endpoint: &str,
        request: &RefreshRequest,
    ) -> Result<RefreshResponse> {
        let resp = self
            .http
            .post(token_endpoint)
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .form(request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "token endpoint rejected refresh ({status}): {}",
                body.trim()
            )));
        }

        Ok(resp.json::<RefreshResponse>().await?)
    }
}

/// Per-credential-key bearer token cache with scheduled refresh.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    endpoint: Arc<dyn TokenEndpoint>,
    scheduler: Arc<dyn Scheduler>,
    logger: Logger,
    buffer: Duration,
    stopped: AtomicBool,
    sources: Mutex<HashMap<String, TokenSourceConfig>>,
    tokens: Mutex<HashMap<String, TokenRecord>>,
    timers: Mutex<HashMap<String, TimerHandle>>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        scheduler: Arc<dyn Scheduler>,
        logger: Logger,
    ) -> Self {
        Self::with_buffer(endpoint, scheduler, logger, DEFAULT_REFRESH_BUFFER)
    }

    pub fn with_buffer(
        endpoint: Arc<dyn TokenEndpoint>,
        scheduler: Arc<dyn Scheduler>,
        logger: Logger,
        buffer: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                endpoint,
                scheduler,
                logger,
                buffer,
                stopped: AtomicBool::new(false),
                sources: Mutex::new(HashMap::new()),
                tokens: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                key_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Associate `key` with its client id, token endpoint and backing file.
    ///
    /// Registering the same key again is a no-op; a conflicting config is
    /// ignored with a warning.
    pub fn register(&self, key: impl Into<String>, config: TokenSourceConfig) {
        let key = key.into();
        let mut sources = lock(&self.inner.sources);
        match sources.get(&key) {
            Some(existing) if existing == &config => {}
            Some(_) => self.inner.logger.warn(
                COMPONENT,
                format!("Ignoring conflicting registration for {key}"),
            ),
            None => {
                sources.insert(key, config);
            }
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        lock(&self.inner.sources).contains_key(key)
    }

    /// Expiry of the in-memory record, if one is cached.
    pub fn cached_expiry(&self, key: &str) -> Option<DateTime<Utc>> {
        lock(&self.inner.tokens)
            .get(key)
            .and_then(|r| r.expires_at())
    }

    /// A currently valid bearer token for `key`, refreshing first if needed.
    ///
    /// Fails with [`Error::Config`] for unregistered keys (no I/O), and with
    /// [`Error::Auth`] when no token was ever provisioned or the endpoint
    /// rejects the refresh. Nothing is retried here.
    pub async fn get_access_token(&self, key: &str) -> Result<String> {
        self.inner.get_access_token(key).await
    }

    /// Cancel every background refresh. Later calls no longer schedule timers.
    pub fn stop_all(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let timers: Vec<TimerHandle> = lock(&self.inner.timers).drain().map(|(_, h)| h).collect();
        for h in &timers {
            self.inner.scheduler.cancel(*h);
        }
        self.inner.logger.info(
            COMPONENT,
            format!("Stopped {} refresh timer(s)", timers.len()),
        );
    }
}

impl TokenInner {
    fn source(&self, key: &str) -> Result<TokenSourceConfig> {
        lock(&self.sources)
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Config(format!("token source not registered: {key}")))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.key_locks)
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn get_access_token(self: &Arc<Self>, key: &str) -> Result<String> {
        let cfg = self.source(key)?;

        // One refresh per expiry: later callers wait here and then find a fresh record.
        let key_lock = self.key_lock(key);
        let _guard = key_lock.lock().await;

        let cached = lock(&self.tokens).get(key).cloned();
        let mut record = match cached {
            Some(r) => r,
            None => {
                let r = self.load_record(key, &cfg).await?;
                lock(&self.tokens).insert(key.to_string(), r.clone());
                r
            }
        };

        if record.needs_refresh(self.scheduler.now(), self.buffer) {
            record = self.refresh(key, &cfg, &record).await?;
        }

        self.schedule_refresh(key, &record);
        Ok(record.access_token)
    }

    async fn load_record(&self, key: &str, cfg: &TokenSourceConfig) -> Result<TokenRecord> {
        let Some(raw) = fsutil::read_if_exists(&cfg.backing_file).await? else {
            return Err(Error::Auth(format!(
                "no token data for {key}; provision {}",
                cfg.backing_file.display()
            )));
        };

        let stored: StoredToken = serde_json::from_str(&raw)?;
        let derived = stored.expires_at.is_none();
        let record = normalize(stored, self.scheduler.now());

        if derived {
            // Persist the absolute expiry so later loads skip the derivation.
            save_record(cfg, &record).await?;
            self.logger.info(
                COMPONENT,
                format!("Derived absolute expiry for {key}: {}", describe_expiry(&record)),
            );
        }

        Ok(record)
    }

    async fn refresh(
        &self,
        key: &str,
        cfg: &TokenSourceConfig,
        current: &TokenRecord,
    ) -> Result<TokenRecord> {
        let request = RefreshRequest {
            grant_type: "refresh_token",
            refresh_token: current.refresh_token.clone(),
            client_id: cfg.client_id.clone(),
        };

        let resp = self
            .endpoint
            .refresh(&cfg.token_endpoint, &request)
            .await?;

        let now_ms = self.scheduler.now().timestamp_millis();
        let record = TokenRecord {
            access_token: resp.access_token,
            refresh_token: resp
                .refresh_token
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| current.refresh_token.clone()),
            expires_at: resp
                .expires_at
                .unwrap_or_else(|| expiry_after(now_ms, resp.expires_in)),
            scope: resp.scope.or_else(|| current.scope.clone()),
        };

        lock(&self.tokens).insert(key.to_string(), record.clone());

        // The new token is usable even if the mirror write fails.
        if let Err(e) = save_record(cfg, &record).await {
            self.logger.error(
                COMPONENT,
                format!(
                    "Refreshed {key} but failed to write {}: {e}",
                    cfg.backing_file.display()
                ),
            );
        }

        self.logger.info(
            COMPONENT,
            format!("Refreshed token for {key}, {}", describe_expiry(&record)),
        );
        Ok(record)
    }

    fn schedule_refresh(self: &Arc<Self>, key: &str, record: &TokenRecord) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let now_ms = self.scheduler.now().timestamp_millis();
        let delay_ms = record
            .expires_at
            .saturating_sub(now_ms)
            .saturating_sub(buffer_ms(self.buffer))
            .max(0);

        let mut timers = lock(&self.timers);
        if let Some(old) = timers.remove(key) {
            self.scheduler.cancel(old);
        }

        let inner = self.clone();
        let owned_key = key.to_string();
        let handle = self.scheduler.schedule_once(
            Duration::from_millis(delay_ms as u64),
            Box::pin(async move { inner.background_refresh(owned_key).await }),
        );
        timers.insert(key.to_string(), handle);
    }

    async fn background_refresh(self: Arc<Self>, key: String) {
        let Ok(cfg) = self.source(&key) else {
            return;
        };

        let key_lock = self.key_lock(&key);
        let _guard = key_lock.lock().await;

        let Some(current) = lock(&self.tokens).get(&key).cloned() else {
            return;
        };

        let now_ms = self.scheduler.now().timestamp_millis();
        let ahead_ms = current.expires_at.saturating_sub(now_ms);
        if ahead_ms > buffer_ms(self.buffer).saturating_add(BACKGROUND_SLACK_MS) {
            return;
        }

        if let Err(e) = self.refresh(&key, &cfg, &current).await {
            self.logger
                .error(COMPONENT, format!("Auto-refresh failed for {key}: {e}"));
        }
    }
}

fn buffer_ms(buffer: Duration) -> i64 {
    i64::try_from(buffer.as_millis()).unwrap_or(i64::MAX)
}

/// Absolute expiry for a relative lifetime. Missing or negative lifetimes
/// use the default; huge ones clamp instead of wrapping.
fn expiry_after(now_ms: i64, expires_in: Option<i64>) -> i64 {
    let secs = expires_in
        .filter(|s| *s >= 0)
        .unwrap_or(DEFAULT_LIFETIME_SECS);
    now_ms.saturating_add(secs.saturating_mul(1000))
}

fn describe_expiry(record: &TokenRecord) -> String {
    match record.expires_at() {
        Some(at) => format!("expires at {}", at.to_rfc3339()),
        None => format!("expires at {}ms", record.expires_at),
    }
}

fn normalize(stored: StoredToken, now: DateTime<Utc>) -> TokenRecord {
    let expires_at = stored
        .expires_at
        .or_else(|| jwt_expiry_ms(&stored.access_token))
        .unwrap_or_else(|| expiry_after(now.timestamp_millis(), stored.expires_in));

    TokenRecord {
        access_token: stored.access_token,
        refresh_token: stored.refresh_token,
        expires_at,
        scope: stored.scope,
    }
}

/// `exp` claim of a JWT access token, in epoch milliseconds.
fn jwt_expiry_ms(token: &str) -> Option<i64> {
    let mut parts = token.split('.');
    let (_, payload, _) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let payload = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_f64()?;
    Some((exp * 1000.0) as i64)
}

async fn save_record(cfg: &TokenSourceConfig, record: &TokenRecord) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(record)?;
    fsutil::write_atomic(&cfg.backing_file, &bytes).await?;
    Ok(())
}
