use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{sync::Mutex, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    module::{Module, ModuleDependencies},
    Result,
};

/// One poll of an upstream: fetch, diff against state, notify.
#[async_trait]
pub trait Check: Send + Sync + 'static {
    async fn check(&self, deps: &ModuleDependencies) -> Result<()>;
}

#[derive(Default)]
struct PollLoop {
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Module skeleton for trackers: one check on start, then one per interval.
///
/// A failing initial check fails `start()`. Failures inside the loop are
/// logged and the loop keeps going.
pub struct PollingModule<C: Check> {
    name: String,
    interval: Duration,
    check: Arc<C>,
    deps: ModuleDependencies,
    running: AtomicBool,
    lifecycle: Mutex<PollLoop>,
}

impl<C: Check> PollingModule<C> {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        check: C,
        deps: ModuleDependencies,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            check: Arc::new(check),
            deps,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(PollLoop::default()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[async_trait]
impl<C: Check> Module for PollingModule<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.deps.logger.info(
            &self.name,
            format!("Starting (poll interval: {}s)", self.interval.as_secs()),
        );

        self.check.check(&self.deps).await?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let check = self.check.clone();
        let deps = self.deps.clone();
        let name = self.name.clone();
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                  _ = token.cancelled() => break,
                  _ = sleep(interval) => {
                    if let Err(e) = check.check(&deps).await {
                      deps.logger.error(&name, format!("Check failed: {e}"));
                    }
                  }
                }
            }
        });

        lc.cancel = Some(cancel);
        lc.handle = Some(handle);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(tok) = lc.cancel.take() {
            tok.cancel();
        }
        if let Some(handle) = lc.handle.take() {
            // A check in progress finishes its current await point first.
            let _ = handle.await;
        }

        self.running.store(false, Ordering::SeqCst);
        self.deps.logger.info(&self.name, "Stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChatDestination, MessageId, MessageRef},
        errors::Error,
        logging::Logger,
        messaging::{
            port::MessagingPort,
            types::{MessagingCapabilities, SendOptions},
        },
        scheduler::ManualScheduler,
        state::StateStore,
        token::{RefreshRequest, RefreshResponse, TokenEndpoint, TokenManager},
    };
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct NullMessenger;

    #[async_trait]
    impl MessagingPort for NullMessenger {
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
            Ok(MessageRef {
                chat_id: dest.chat_id,
                message_id: MessageId(1),
            })
        }
    }

    struct NoEndpoint;

    #[async_trait]
    impl TokenEndpoint for NoEndpoint {
        async fn refresh(&self, _: &str, _: &RefreshRequest) -> Result<RefreshResponse> {
            Err(Error::Auth("no endpoint in tests".into()))
        }
    }

    fn deps(dir: &std::path::Path) -> (ModuleDependencies, Arc<crate::logging::MemorySink>) {
        let sched = Arc::new(ManualScheduler::new());
        let (logger, logs) = Logger::memory();
        let deps = ModuleDependencies {
            telegram: Arc::new(NullMessenger),
            tokens: TokenManager::new(Arc::new(NoEndpoint), sched.clone(), logger.clone()),
            state: StateStore::new(dir.join("state.json"), sched.clone(), logger.clone()),
            logger,
            scheduler: sched,
            webhooks: None,
        };
        (deps, logs)
    }

    struct CountingCheck {
        calls: Arc<AtomicUsize>,
        fail_after: usize,
    }

    #[async_trait]
    impl Check for CountingCheck {
        async fn check(&self, deps: &ModuleDependencies) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n > self.fail_after {
                return Err(Error::External("upstream unavailable".into()));
            }
            deps.state.set("poll", json!({ "count": n }));
            Ok(())
        }
    }

    #[tokio::test]
    async fn start_twice_initializes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, logs) = deps(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let module = PollingModule::new(
            "hytale-blog",
            Duration::from_secs(3600),
            CountingCheck {
                calls: calls.clone(),
                fail_after: usize::MAX,
            },
            deps.clone(),
        );

        module.start().await.unwrap();
        module.start().await.unwrap();

        assert!(module.is_running());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(logs.for_component("hytale-blog").len(), 1);
        assert_eq!(deps.state.get("poll"), Some(json!({ "count": 1 })));

        module.stop().await.unwrap();
        module.stop().await.unwrap();
        assert!(!module.is_running());
        assert_eq!(logs.for_component("hytale-blog").len(), 2);
    }

    #[tokio::test]
    async fn failing_initial_check_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, _) = deps(dir.path());
        let module = PollingModule::new(
            "hytale-server",
            Duration::from_secs(60),
            CountingCheck {
                calls: Arc::new(AtomicUsize::new(0)),
                fail_after: 0,
            },
            deps,
        );

        assert!(module.start().await.is_err());
        assert!(!module.is_running());
    }

    #[tokio::test]
    async fn loop_keeps_polling_after_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (deps, logs) = deps(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let module = PollingModule::new(
            "hytale-patches",
            Duration::from_millis(10),
            CountingCheck {
                calls: calls.clone(),
                fail_after: 1,
            },
            deps,
        );

        module.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        module.stop().await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(logs
            .for_component("hytale-patches")
            .iter()
            .any(|r| r.message.starts_with("Check failed")));
    }
}
