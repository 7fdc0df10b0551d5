use async_trait::async_trait;

use crate::{
    domain::{ChatDestination, MessageRef},
    messaging::types::{MessagingCapabilities, SendOptions},
    Result,
};

/// Outbound messenger handed to modules through the dependency bundle.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(
        &self,
        dest: ChatDestination,
        html: &str,
        opts: SendOptions,
    ) -> Result<MessageRef>;

    /// Release client resources. Called once by the supervisor at shutdown.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Send the same message to every destination, stopping at the first failure.
pub async fn send_to_all(
    port: &dyn MessagingPort,
    dests: &[ChatDestination],
    html: &str,
    opts: SendOptions,
) -> Result<Vec<MessageRef>> {
    let mut sent = Vec::with_capacity(dests.len());
    for dest in dests {
        sent.push(port.send_html(*dest, html, opts).await?);
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::MessageId, errors::Error};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(ChatDestination, SendOptions)>>,
    }

    #[async_trait]
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
            opts: SendOptions,
        ) -> Result<MessageRef> {
            if dest.chat_id.0 == 0 {
                return Err(Error::External("chat not found".into()));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push((dest, opts));
            Ok(MessageRef {
                chat_id: dest.chat_id,
                message_id: MessageId(sent.len() as i32),
            })
        }
    }

    #[tokio::test]
    async fn send_to_all_keeps_destination_order() {
        let rec = Recorder::default();
        let dests = [ChatDestination::topic(-100, 3), ChatDestination::chat(42)];

        let refs = send_to_all(&rec, &dests, "<b>v1.2</b>", SendOptions::without_preview())
            .await
            .unwrap();

        assert_eq!(refs.len(), 2);
        assert_eq!(refs[1].message_id, MessageId(2));
        let sent = rec.sent.lock().unwrap();
        assert_eq!(sent[0].0, dests[0]);
        assert!(sent.iter().all(|(_, o)| o.disable_link_preview));
    }

    #[tokio::test]
    async fn send_to_all_stops_at_first_failure() {
        let rec = Recorder::default();
        let dests = [
            ChatDestination::chat(1),
            ChatDestination::chat(0),
            ChatDestination::chat(2),
        ];

        assert!(send_to_all(&rec, &dests, "x", SendOptions::default())
            .await
            .is_err());
        assert_eq!(rec.sent.lock().unwrap().len(), 1);
    }
}
