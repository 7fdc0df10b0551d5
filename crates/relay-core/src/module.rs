//! Module contract and the explicit type-name → factory registry.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{Map, Value};

use crate::{
    errors::Error,
    logging::Logger,
    messaging::port::MessagingPort,
    scheduler::Scheduler,
    state::StateStore,
    token::TokenManager,
    Result,
};

/// A start/stop-able unit of work (tracker, forwarder, dispatcher, API server).
///
/// `start()` and `stop()` are no-ops when the module is already in the target
/// state. Lifecycle only moves Stopped → Running → Stopped.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn is_running(&self) -> bool;
}

/// Fan-out of rich notifications to webhook sinks, keyed by event type.
#[async_trait]
pub trait WebhookDispatch: Send + Sync {
    async fn send(&self, event_type: &str, embed: Value) -> Result<()>;
}

/// Shared services handed to every module factory.
#[derive(Clone)]
pub struct ModuleDependencies {
    pub telegram: Arc<dyn MessagingPort>,
    pub tokens: TokenManager,
    pub state: StateStore,
    pub logger: Logger,
    pub scheduler: Arc<dyn Scheduler>,
    /// Present when a webhook dispatcher module is enabled; it is started
    /// before any other module is built.
    pub webhooks: Option<Arc<dyn WebhookDispatch>>,
}

fn default_enabled() -> bool {
    true
}

/// One entry of the `modules` array in the config file.
#[derive(Clone, Debug, Deserialize)]
pub struct ModuleConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Everything else in the entry, handed to the factory untouched.
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl ModuleConfig {
    pub fn new(kind: impl Into<String>, settings: Value) -> Self {
        let settings = match settings {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.into(),
            enabled: true,
            settings,
        }
    }

    /// Decode the module-specific settings.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.settings.clone())).map_err(|e| {
            Error::Config(format!("invalid settings for module {}: {e}", self.kind))
        })
    }
}

pub type ModuleFactory =
    Box<dyn Fn(&ModuleConfig, &ModuleDependencies) -> Result<Arc<dyn Module>> + Send + Sync>;

/// The two faces of a webhook dispatcher: lifecycle and dispatch.
pub struct WebhookParts {
    pub module: Arc<dyn Module>,
    pub dispatch: Arc<dyn WebhookDispatch>,
}

impl WebhookParts {
    pub fn from_arc<T>(m: Arc<T>) -> Self
    where
        T: Module + WebhookDispatch + 'static,
    {
        Self {
            module: m.clone(),
            dispatch: m,
        }
    }
}

pub type WebhookFactory =
    Box<dyn Fn(&ModuleConfig, &ModuleDependencies) -> Result<WebhookParts> + Send + Sync>;

/// Explicit map from module type name to factory, built at boot.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, ModuleFactory>,
    webhooks: Option<(String, WebhookFactory)>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ModuleConfig, &ModuleDependencies) -> Result<Arc<dyn Module>>
            + Send
            + Sync
            + 'static,
    {
        let kind = kind.into();
        if self.knows(&kind) {
            return Err(Error::Config(format!(
                "module type registered twice: {kind}"
            )));
        }
        self.factories.insert(kind, Box::new(factory));
        Ok(())
    }

    /// Register the webhook dispatcher factory. At most one per registry.
    pub fn register_webhooks<F>(&mut self, kind: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&ModuleConfig, &ModuleDependencies) -> Result<WebhookParts>
            + Send
            + Sync
            + 'static,
    {
        let kind = kind.into();
        if self.webhooks.is_some() || self.knows(&kind) {
            return Err(Error::Config(format!(
                "webhook dispatcher already registered (while adding {kind})"
            )));
        }
        self.webhooks = Some((kind, Box::new(factory)));
        Ok(())
    }

    pub fn knows(&self, kind: &str) -> bool {
        self.factories.contains_key(kind) || self.is_webhook_kind(kind)
    }

    pub fn is_webhook_kind(&self, kind: &str) -> bool {
        matches!(&self.webhooks, Some((k, _)) if k == kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut out: Vec<String> = self.factories.keys().cloned().collect();
        if let Some((k, _)) = &self.webhooks {
            out.push(k.clone());
        }
        out.sort();
        out
    }

    pub fn build(&self, cfg: &ModuleConfig, deps: &ModuleDependencies) -> Result<Arc<dyn Module>> {
        let factory = self.factories.get(&cfg.kind).ok_or_else(|| {
            Error::Config(format!("no factory registered for module type {}", cfg.kind))
        })?;
        factory(cfg, deps)
    }

    pub fn build_webhooks(
        &self,
        cfg: &ModuleConfig,
        deps: &ModuleDependencies,
    ) -> Result<WebhookParts> {
        match &self.webhooks {
            Some((kind, factory)) if *kind == cfg.kind => factory(cfg, deps),
            _ => Err(Error::Config(format!(
                "{} is not the registered webhook dispatcher",
                cfg.kind
            ))),
        }
    }
}
