use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric; channels and supergroups are negative).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a sent message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Where a notification goes: a chat, optionally a forum topic inside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatDestination {
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i32>,
}

impl ChatDestination {
    pub fn chat(chat_id: i64) -> Self {
        Self {
            chat_id: ChatId(chat_id),
            topic_id: None,
        }
    }

    pub fn topic(chat_id: i64, topic_id: i32) -> Self {
        Self {
            chat_id: ChatId(chat_id),
            topic_id: Some(topic_id),
        }
    }
}
