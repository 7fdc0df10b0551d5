use std::sync::Arc;

use anyhow::Context;

use relay_core::{
    config::Config,
    logging::Logger,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    module::ModuleRegistry,
    modules::webhooks,
    scheduler::TokioScheduler,
    supervisor::{Services, Supervisor},
    token::HttpTokenEndpoint,
};
use relay_telegram::TelegramMessenger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_core::logging::init("relay")?;
    let logger = Logger::console();

    let cfg = Config::load()?;
    logger.info(
        "relay",
        format!("Using config {}", cfg.config_file.display()),
    );

    let telegram = TelegramMessenger::from_token(cfg.telegram_bot_token.clone());
    let username = telegram
        .whoami()
        .await
        .context("telegram login failed")?;
    logger.info("relay", format!("Logged in as @{username}"));

    // Trackers fan out bursts after a poll; keep them under Telegram's flood limits.
    let telegram: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        Arc::new(telegram),
        ThrottleConfig::default(),
    ));

    let mut registry = ModuleRegistry::new();
    registry.register_webhooks(webhooks::KIND, webhooks::factory(cfg.http_timeout))?;

    let services = Services {
        telegram,
        token_endpoint: Arc::new(HttpTokenEndpoint::new(cfg.http_timeout)?),
        scheduler: Arc::new(TokioScheduler::new()),
        logger: logger.clone(),
    };

    let supervisor = Supervisor::boot(cfg.supervisor_config(), &registry, services)
        .await
        .context("boot failed")?;

    if let Err(e) = supervisor.start().await {
        supervisor.shutdown().await;
        return Err(e).context("startup aborted");
    }

    supervisor
        .run_until_signal()
        .await
        .context("signal handling failed")?;
    Ok(())
}
