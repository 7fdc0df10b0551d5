//! Telegram adapter (teloxide).
//!
//! Implements the `relay-core` MessagingPort over the Telegram Bot API.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode};

use tokio::time::sleep;

use relay_core::{
    domain::{ChatDestination, ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{MessagingCapabilities, SendOptions},
    },
    Result,
};

pub struct TelegramMessenger {
    bot: Bot,
    closed: AtomicBool,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self::new(Bot::new(token))
    }

    /// Resolve the bot's username; fails fast on a bad token.
    pub async fn whoami(&self) -> Result<String> {
        let me = self.with_retry(|| self.bot.get_me()).await?;
        Ok(me.username().to_string())
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::External(format!("telegram error: {e}"))
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
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
        html: &str,
        opts: SendOptions,
    ) -> Result<MessageRef> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::External("telegram messenger is shut down".into()));
        }

        let msg = self
            .with_retry(|| {
                let mut req = self
                    .bot
                    .send_message(Self::tg_chat(dest.chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(opts.disable_link_preview);
                if let Some(topic) = dest.topic_id {
                    req = req.message_thread_id(topic);
                }
                req
            })
            .await?;

        Ok(MessageRef {
            chat_id: dest.chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        // The Bot API client is stateless HTTP; refuse further sends.
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
