//! Boot, start and shutdown of the module set.

use std::{
    collections::{BTreeMap, HashSet},
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    errors::Error,
    logging::Logger,
    messaging::port::MessagingPort,
    module::{Module, ModuleConfig, ModuleDependencies, ModuleRegistry},
    scheduler::Scheduler,
    signals,
    state::{FsSnapshotWriter, StateStore, StoreOptions},
    token::{TokenEndpoint, TokenManager, TokenSourceConfig, DEFAULT_REFRESH_BUFFER},
    Result,
};

const COMPONENT: &str = "Supervisor";

/// What to build at boot.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub state_file: PathBuf,
    pub store_options: StoreOptions,
    pub refresh_buffer: Duration,
    pub credentials: BTreeMap<String, TokenSourceConfig>,
    pub modules: Vec<ModuleConfig>,
}

impl SupervisorConfig {
    pub fn new(state_file: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            store_options: StoreOptions::default(),
            refresh_buffer: DEFAULT_REFRESH_BUFFER,
            credentials: BTreeMap::new(),
            modules: Vec::new(),
        }
    }
}

/// External capabilities the supervisor wires into every module.
#[derive(Clone)]
pub struct Services {
    pub telegram: Arc<dyn MessagingPort>,
    pub token_endpoint: Arc<dyn TokenEndpoint>,
    pub scheduler: Arc<dyn Scheduler>,
    pub logger: Logger,
}

pub struct Supervisor {
    deps: ModuleDependencies,
    modules: Vec<Arc<dyn Module>>,
    shut_down: AtomicBool,
}

impl Supervisor {
    /// Build the shared services and every enabled module.
    ///
    /// The webhook dispatcher, when enabled, is built and started here so the
    /// other factories receive it in their dependency bundle.
    pub async fn boot(
        cfg: SupervisorConfig,
        registry: &ModuleRegistry,
        services: Services,
    ) -> Result<Self> {
        let logger = services.logger.clone();

        let state = StateStore::with_parts(
            cfg.state_file,
            cfg.store_options,
            services.scheduler.clone(),
            Arc::new(FsSnapshotWriter),
            logger.clone(),
        );
        let tokens = TokenManager::with_buffer(
            services.token_endpoint,
            services.scheduler.clone(),
            logger.clone(),
            cfg.refresh_buffer,
        );

        state.load().await?;
        logger.info(COMPONENT, format!("Loaded {} state key(s)", state.len()));

        for (key, source) in cfg.credentials {
            tokens.register(key, source);
        }

        let mut deps = ModuleDependencies {
            telegram: services.telegram,
            tokens,
            state,
            logger: logger.clone(),
            scheduler: services.scheduler,
            webhooks: None,
        };

        let enabled: Vec<&ModuleConfig> = cfg.modules.iter().filter(|m| m.enabled).collect();
        for m in &enabled {
            if !registry.knows(&m.kind) {
                return Err(Error::Config(format!("unknown module type: {}", m.kind)));
            }
        }

        let mut modules: Vec<Arc<dyn Module>> = Vec::new();
        let mut names = HashSet::new();

        let mut hooks = enabled.iter().filter(|m| registry.is_webhook_kind(&m.kind));
        if let Some(hook_cfg) = hooks.next() {
            if hooks.next().is_some() {
                return Err(Error::Config(format!(
                    "{} may only be enabled once",
                    hook_cfg.kind
                )));
            }
            let parts = registry.build_webhooks(hook_cfg, &deps)?;
            start_module(&parts.module, &logger).await?;
            names.insert(parts.module.name().to_string());
            deps.webhooks = Some(parts.dispatch);
            modules.push(parts.module);
        }

        for m in enabled.iter().filter(|m| !registry.is_webhook_kind(&m.kind)) {
            let module = registry.build(m, &deps)?;
            if !names.insert(module.name().to_string()) {
                return Err(Error::Config(format!(
                    "duplicate module name: {}",
                    module.name()
                )));
            }
            modules.push(module);
        }

        logger.info(
            COMPONENT,
            format!(
                "Built {} module(s): {}",
                modules.len(),
                modules
                    .iter()
                    .map(|m| m.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        Ok(Self {
            deps,
            modules,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn dependencies(&self) -> &ModuleDependencies {
        &self.deps
    }

    pub fn modules(&self) -> &[Arc<dyn Module>] {
        &self.modules
    }

    pub fn module(&self, name: &str) -> Option<&Arc<dyn Module>> {
        self.modules.iter().find(|m| m.name() == name)
    }

    /// Start modules in build order. The first failure aborts startup.
    pub async fn start(&self) -> Result<()> {
        for module in &self.modules {
            start_module(module, &self.deps.logger).await?;
        }
        self.deps.logger.info(
            COMPONENT,
            format!("All {} module(s) running", self.modules.len()),
        );
        Ok(())
    }

    /// Drain state, stop refresh timers, close the messenger, stop modules.
    ///
    /// Runs once; later calls return immediately. Module stop failures are
    /// logged and do not interrupt the sequence.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let logger = &self.deps.logger;
        logger.info(COMPONENT, "Shutting down...");

        if let Err(e) = self.deps.state.flush().await {
            logger.error(COMPONENT, format!("State flush failed: {e}"));
        }

        self.deps.tokens.stop_all();

        if let Err(e) = self.deps.telegram.shutdown().await {
            logger.error(COMPONENT, format!("Messenger shutdown failed: {e}"));
        }

        for module in &self.modules {
            if let Err(e) = module.stop().await {
                logger.error(
                    COMPONENT,
                    format!("Failed to stop {}: {e}", module.name()),
                );
            }
        }

        // Modules may persist their last positions while stopping.
        if self.deps.state.dirty_len() > 0 {
            if let Err(e) = self.deps.state.flush().await {
                logger.error(COMPONENT, format!("Final state flush failed: {e}"));
            }
        }

        logger.info(COMPONENT, "Shutdown complete");
    }

    /// Block until a termination signal, then shut down.
    pub async fn run_until_signal(&self) -> Result<()> {
        self.run_until(signals::wait_for_shutdown_signal()).await
    }

    /// Shut down once `signal` resolves. The shutdown also runs when waiting
    /// fails, so state is drained either way.
    pub async fn run_until<F>(&self, signal: F) -> Result<()>
    where
        F: Future<Output = std::io::Result<&'static str>>,
    {
        let outcome = signal.await;
        match &outcome {
            Ok(name) => self
                .deps
                .logger
                .info(COMPONENT, format!("Received {name}")),
            Err(e) => self
                .deps
                .logger
                .error(COMPONENT, format!("Cannot wait for signals: {e}")),
        }
        self.shutdown().await;
        outcome.map(|_| ()).map_err(Error::from)
    }
}

async fn start_module(module: &Arc<dyn Module>, logger: &Logger) -> Result<()> {
    module.start().await.map_err(|e| {
        logger.error(
            COMPONENT,
            format!("Failed to start {}: {e}", module.name()),
        );
        Error::ModuleStart {
            module: module.name().to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChatDestination, MessageId, MessageRef},
        logging::MemorySink,
        messaging::types::{MessagingCapabilities, SendOptions},
        module::{WebhookDispatch, WebhookParts},
        scheduler::ManualScheduler,
        token::{RefreshRequest, RefreshResponse},
    };
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct JournalMessenger {
        journal: Journal,
    }

    #[async_trait]
    impl MessagingPort for JournalMessenger {
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

        async fn shutdown(&self) -> Result<()> {
            self.journal.lock().unwrap().push("messenger:shutdown".into());
            Ok(())
        }
    }

    struct NoEndpoint;

    #[async_trait]
    impl TokenEndpoint for NoEndpoint {
        async fn refresh(&self, _: &str, _: &RefreshRequest) -> Result<RefreshResponse> {
            Err(Error::Auth("no endpoint in tests".into()))
        }
    }

    #[derive(Deserialize)]
    struct FakeSettings {
        name: String,
        #[serde(default)]
        fail_start: bool,
        #[serde(default)]
        fail_stop: bool,
    }

    struct FakeModule {
        name: String,
        settings: FakeSettings,
        running: AtomicBool,
        journal: Journal,
        deps: ModuleDependencies,
    }

    #[async_trait]
    impl Module for FakeModule {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:start", self.name));
            if self.settings.fail_start {
                return Err(Error::External("login rejected".into()));
            }
            self.running.store(true, Ordering::SeqCst);
            if let Some(hooks) = &self.deps.webhooks {
                hooks.send("started", json!({ "title": self.name })).await?;
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:stop", self.name));
            self.deps.state.set(format!("{}:last", self.name), json!(true));
            self.running.store(false, Ordering::SeqCst);
            if self.settings.fail_stop {
                return Err(Error::External("stuck".into()));
            }
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    struct FakeHooks {
        running: AtomicBool,
        journal: Journal,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Module for FakeHooks {
        fn name(&self) -> &str {
            "hooks"
        }

        async fn start(&self) -> Result<()> {
            if self.running.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.journal.lock().unwrap().push("hooks:start".into());
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            if !self.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.journal.lock().unwrap().push("hooks:stop".into());
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WebhookDispatch for FakeHooks {
        async fn send(&self, event_type: &str, _embed: Value) -> Result<()> {
            if !self.running.load(Ordering::SeqCst) {
                return Err(Error::External("hooks not started".into()));
            }
            self.sent.lock().unwrap().push(event_type.to_string());
            Ok(())
        }
    }

    struct Harness {
        journal: Journal,
        hooks: Arc<FakeHooks>,
        logs: Arc<MemorySink>,
        dir: tempfile::TempDir,
        cfg: SupervisorConfig,
        services: Services,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let journal: Journal = Arc::default();
        let hooks = Arc::new(FakeHooks {
            running: AtomicBool::new(false),
            journal: journal.clone(),
            sent: Mutex::new(Vec::new()),
        });
        let (logger, logs) = Logger::memory();
        let services = Services {
            telegram: Arc::new(JournalMessenger {
                journal: journal.clone(),
            }),
            token_endpoint: Arc::new(NoEndpoint),
            scheduler: Arc::new(ManualScheduler::new()),
            logger,
        };
        let cfg = SupervisorConfig::new(dir.path().join("state.json"));
        Harness {
            journal,
            hooks,
            logs,
            dir,
            cfg,
            services,
        }
    }

    fn registry(h: &Harness) -> ModuleRegistry {
        let mut reg = ModuleRegistry::new();
        let journal = h.journal.clone();
        reg.register("fake", move |cfg, deps| {
            let settings: FakeSettings = cfg.parse()?;
            Ok(Arc::new(FakeModule {
                name: settings.name.clone(),
                settings,
                running: AtomicBool::new(false),
                journal: journal.clone(),
                deps: deps.clone(),
            }) as Arc<dyn Module>)
        })
        .unwrap();
        let hooks = h.hooks.clone();
        reg.register_webhooks("hooks", move |_, _| Ok(WebhookParts::from_arc(hooks.clone())))
            .unwrap();
        reg
    }

    fn fake(name: &str, extra: Value) -> ModuleConfig {
        let mut settings = json!({ "name": name });
        if let (Some(obj), Value::Object(more)) = (settings.as_object_mut(), extra) {
            obj.extend(more);
        }
        ModuleConfig::new("fake", settings)
    }

    fn journal(h: &Harness) -> Vec<String> {
        h.journal.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn webhook_dispatcher_starts_first_and_is_injected() {
        let mut h = harness();
        h.cfg.modules = vec![
            fake("patches", json!({})),
            ModuleConfig::new("hooks", json!({})),
            fake("blog", json!({})),
        ];
        let reg = registry(&h);

        let sup = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .unwrap();
        assert_eq!(journal(&h), vec!["hooks:start"]);
        assert!(sup.dependencies().webhooks.is_some());

        sup.start().await.unwrap();
        assert_eq!(
            journal(&h),
            vec!["hooks:start", "patches:start", "blog:start"]
        );
        assert_eq!(*h.hooks.sent.lock().unwrap(), vec!["started", "started"]);
        assert!(sup.modules().iter().all(|m| m.is_running()));
    }

    #[tokio::test]
    async fn disabled_modules_are_not_built() {
        let mut h = harness();
        let mut off = fake("off", json!({}));
        off.enabled = false;
        h.cfg.modules = vec![fake("on", json!({})), off];
        let reg = registry(&h);

        let sup = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .unwrap();
        assert!(sup.module("on").is_some());
        assert!(sup.module("off").is_none());
        assert!(sup.dependencies().webhooks.is_none());
    }

    #[tokio::test]
    async fn unknown_module_type_fails_boot() {
        let mut h = harness();
        h.cfg.modules = vec![ModuleConfig::new("hytale-blog", json!({}))];
        let reg = registry(&h);

        let err = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(msg) if msg.contains("hytale-blog")));
    }

    #[tokio::test]
    async fn failing_start_is_fatal_and_stops_the_sequence() {
        let mut h = harness();
        h.cfg.modules = vec![
            fake("a", json!({})),
            fake("b", json!({ "fail_start": true })),
            fake("c", json!({})),
        ];
        let reg = registry(&h);
        let sup = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .unwrap();

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, Error::ModuleStart { ref module, .. } if module == "b"));
        assert_eq!(journal(&h), vec!["a:start", "b:start"]);
        assert!(h
            .logs
            .for_component(COMPONENT)
            .iter()
            .any(|r| r.message.starts_with("Failed to start b")));
    }

    #[tokio::test]
    async fn shutdown_is_ordered_best_effort_and_runs_once() {
        let mut h = harness();
        h.cfg.modules = vec![
            ModuleConfig::new("hooks", json!({})),
            fake("a", json!({ "fail_stop": true })),
            fake("b", json!({})),
        ];
        let state_file = h.cfg.state_file.clone();
        let reg = registry(&h);
        let sup = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .unwrap();
        sup.start().await.unwrap();
        sup.dependencies().state.set("cursor", json!(42));
        h.journal.lock().unwrap().clear();

        sup.shutdown().await;
        sup.shutdown().await;

        assert_eq!(
            journal(&h),
            vec!["messenger:shutdown", "hooks:stop", "a:stop", "b:stop"]
        );
        assert!(h
            .logs
            .for_component(COMPONENT)
            .iter()
            .any(|r| r.message.starts_with("Failed to stop a")));

        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(state_file).unwrap()).unwrap();
        assert_eq!(on_disk["cursor"], json!(42));
        assert_eq!(on_disk["a:last"], json!(true));
        assert_eq!(on_disk["b:last"], json!(true));
    }

    #[tokio::test]
    async fn boot_loads_state_and_registers_credentials() {
        let mut h = harness();
        std::fs::write(&h.cfg.state_file, r#"{"seen": ["v1"]}"#).unwrap();
        h.cfg.credentials.insert(
            "hytale".into(),
            TokenSourceConfig {
                client_id: "client".into(),
                token_endpoint: "https://auth.test/token".into(),
                backing_file: h.dir.path().join("hytale.json"),
            },
        );
        let reg = registry(&h);

        let sup = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .unwrap();
        let deps = sup.dependencies();
        assert_eq!(deps.state.get("seen"), Some(json!(["v1"])));
        assert!(deps.tokens.is_registered("hytale"));
        assert!(matches!(
            deps.tokens.get_access_token("other").await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn failed_signal_wait_still_drains_state() {
        let mut h = harness();
        h.cfg.modules = vec![fake("a", json!({}))];
        let state_file = h.cfg.state_file.clone();
        let reg = registry(&h);
        let sup = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .unwrap();
        sup.start().await.unwrap();
        sup.dependencies().state.set("cursor", json!(7));

        let err = sup
            .run_until(async {
                Err::<&'static str, _>(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "no signal driver",
                ))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Io(_)));
        assert!(journal(&h).contains(&"a:stop".to_string()));
        let on_disk: Value =
            serde_json::from_str(&std::fs::read_to_string(state_file).unwrap()).unwrap();
        assert_eq!(on_disk["cursor"], json!(7));
    }

    #[tokio::test]
    async fn run_until_signal_shuts_down_once() {
        let mut h = harness();
        h.cfg.modules = vec![fake("a", json!({}))];
        let reg = registry(&h);
        let sup = Supervisor::boot(h.cfg.clone(), &reg, h.services.clone())
            .await
            .unwrap();
        sup.start().await.unwrap();

        sup.run_until(async { Ok::<_, std::io::Error>("SIGTERM") }).await.unwrap();
        sup.shutdown().await;

        let stops = journal(&h).iter().filter(|e| *e == "a:stop").count();
        assert_eq!(stops, 1);
        assert!(h
            .logs
            .for_component(COMPONENT)
            .iter()
            .any(|r| r.message == "Received SIGTERM"));
    }
}
