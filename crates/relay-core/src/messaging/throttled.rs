use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatDestination, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{MessagingCapabilities, SendOptions},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls per chat (Telegram 1 msg/sec style limits).
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// MessagingPort decorator that rate-limits outbound sends.
///
/// Trackers that find several updates in one poll fan out bursts of messages to
/// the same chats; spacing them keeps the bot clear of 429s.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(
        &self,
        dest: ChatDestination,
        html: &str,
        opts: SendOptions,
    ) -> Result<MessageRef> {
        self.throttle_chat(dest.chat_id.0).await;
        self.inner.send_html(dest, html, opts).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageId;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        sent: StdMutex<Vec<(ChatDestination, Instant)>>,
    }

    #[async_trait::async_trait]
    impl MessagingPort for Recorder {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_html: true,
                supports_topics: true,
                max_message_len: 4096,
            }
        }

        async fn send_html(
            &self,
            dest: ChatDestination,
            _html: &str,
            _opts: SendOptions,
        ) -> Result<MessageRef> {
            let mut sent = self.sent.lock().unwrap();
            sent.push((dest, Instant::now()));
            Ok(MessageRef {
                chat_id: dest.chat_id,
                message_id: MessageId(sent.len() as i32),
            })
        }
    }

    #[tokio::test]
    async fn spaces_sends_to_the_same_chat() {
        let rec = Arc::new(Recorder::default());
        let throttled = ThrottledMessenger::new(
            rec.clone(),
            ThrottleConfig {
                global_min_interval: Duration::from_millis(1),
                per_chat_min_interval: Duration::from_millis(50),
            },
        );

        let dest = ChatDestination::chat(1);
        throttled
            .send_html(dest, "a", SendOptions::default())
            .await
            .unwrap();
        throttled
            .send_html(dest, "b", SendOptions::default())
            .await
            .unwrap();

        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.duration_since(sent[0].1) >= Duration::from_millis(45));
    }
}
