//! Discord-style webhook dispatcher.
//!
//! Other modules push embeds tagged with an event type; the dispatcher batches
//! them for a short delay, routes each batch to the webhooks subscribed to that
//! event, and posts at most ten embeds per request.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    errors::Error,
    logging::Logger,
    module::{Module, ModuleConfig, ModuleDependencies, WebhookDispatch, WebhookParts},
    scheduler::{lock, Scheduler, TimerHandle},
    Result,
};

pub const KIND: &str = "discord-webhooks";

const MAX_EMBEDS_PER_MESSAGE: usize = 10;
const MAX_RATE_LIMIT_RETRIES: usize = 3;
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

fn default_batch_delay_ms() -> u64 {
    100
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhookTarget {
    pub name: String,
    pub url: String,
    /// Event types to forward; `"*"` matches everything.
    #[serde(default)]
    pub events: Vec<String>,
}

impl WebhookTarget {
    fn wants(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event_type)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct WebhooksConfig {
    pub webhooks: Vec<WebhookTarget>,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostOutcome {
    Delivered,
    RateLimited { retry_after: Duration },
}

/// Transport for one webhook POST.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, url: &str, payload: &Value) -> Result<PostOutcome>;
}

pub struct HttpWebhookTransport {
    http: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("relay/0.1")
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(&self, url: &str, payload: &Value) -> Result<PostOutcome> {
        let resp = self.http.post(url).json(payload).send().await?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            return Ok(PostOutcome::RateLimited { retry_after });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http(format!(
                "webhook failed with {status}: {}",
                body.trim()
            )));
        }

        Ok(PostOutcome::Delivered)
    }
}

struct Queued {
    event_type: String,
    embed: Value,
}

#[derive(Default)]
struct Outbox {
    queue: Vec<Queued>,
    timer: Option<TimerHandle>,
}

struct WebhooksInner {
    name: String,
    cfg: WebhooksConfig,
    transport: Arc<dyn WebhookTransport>,
    scheduler: Arc<dyn Scheduler>,
    logger: Logger,
    running: AtomicBool,
    outbox: Mutex<Outbox>,
}

pub struct WebhooksModule {
    inner: Arc<WebhooksInner>,
}

impl WebhooksModule {
    pub fn new(
        cfg: WebhooksConfig,
        transport: Arc<dyn WebhookTransport>,
        deps: &ModuleDependencies,
    ) -> Self {
        Self {
            inner: Arc::new(WebhooksInner {
                name: KIND.to_string(),
                cfg,
                transport,
                scheduler: deps.scheduler.clone(),
                logger: deps.logger.clone(),
                running: AtomicBool::new(false),
                outbox: Mutex::new(Outbox::default()),
            }),
        }
    }

    /// Embeds waiting for the next batch.
    pub fn queued(&self) -> usize {
        lock(&self.inner.outbox).queue.len()
    }
}

/// Factory for the module registry, posting over HTTP with `timeout`.
pub fn factory(
    timeout: Duration,
) -> impl Fn(&ModuleConfig, &ModuleDependencies) -> Result<WebhookParts> + Send + Sync + 'static {
    move |cfg, deps| {
        let settings: WebhooksConfig = cfg.parse()?;
        let transport = Arc::new(HttpWebhookTransport::new(timeout)?);
        Ok(WebhookParts::from_arc(Arc::new(WebhooksModule::new(
            settings, transport, deps,
        ))))
    }
}

#[async_trait]
impl Module for WebhooksModule {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.logger.info(
            &self.inner.name,
            format!("Starting with {} webhook(s)", self.inner.cfg.webhooks.len()),
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let timer = lock(&self.inner.outbox).timer.take();
        if let Some(h) = timer {
            self.inner.scheduler.cancel(h);
        }
        self.inner.flush().await;

        self.inner.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebhookDispatch for WebhooksModule {
    async fn send(&self, event_type: &str, embed: Value) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut outbox = lock(&self.inner.outbox);
        outbox.queue.push(Queued {
            event_type: event_type.to_string(),
            embed,
        });

        if outbox.timer.is_none() {
            let inner = self.inner.clone();
            let handle = self.inner.scheduler.schedule_once(
                Duration::from_millis(self.inner.cfg.batch_delay_ms),
                Box::pin(async move {
                    lock(&inner.outbox).timer = None;
                    inner.flush().await;
                }),
            );
            outbox.timer = Some(handle);
        }
        Ok(())
    }
}

impl WebhooksInner {
    async fn flush(&self) {
        let messages = std::mem::take(&mut lock(&self.outbox).queue);
        if messages.is_empty() {
            return;
        }

        for target in &self.cfg.webhooks {
            let embeds: Vec<Value> = messages
                .iter()
                .filter(|m| target.wants(&m.event_type))
                .map(|m| m.embed.clone())
                .collect();
            if embeds.is_empty() {
                continue;
            }

            match self.deliver(&target.url, &embeds).await {
                Ok(()) => self.logger.info(
                    &self.name,
                    format!("Sent {} embed(s) to {}", embeds.len(), target.name),
                ),
                Err(e) => self
                    .logger
                    .error(&self.name, format!("Failed to send to {}: {e}", target.name)),
            }
        }
    }

    async fn deliver(&self, url: &str, embeds: &[Value]) -> Result<()> {
        for batch in embeds.chunks(MAX_EMBEDS_PER_MESSAGE) {
            let payload = json!({ "embeds": batch });
            self.post_with_retry(url, &payload).await?;
        }
        Ok(())
    }

    async fn post_with_retry(&self, url: &str, payload: &Value) -> Result<()> {
        let mut retries = 0usize;
        loop {
            match self.transport.post(url, payload).await? {
                PostOutcome::Delivered => return Ok(()),
                PostOutcome::RateLimited { retry_after } if retries < MAX_RATE_LIMIT_RETRIES => {
                    retries += 1;
                    self.scheduler.sleep(retry_after).await;
                }
                PostOutcome::RateLimited { .. } => {
                    return Err(Error::Http(format!(
                        "still rate limited after {MAX_RATE_LIMIT_RETRIES} retries"
                    )));
                }
            }
        }
    }
}
