use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("Unknown message role: {}", other)),
        }
    }
}

/// Body of a message. Only plain text is modelled; attachments and tool
/// calls would be further variants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageContent {
    Text { text: String },
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            MessageContent::Text { text } => text,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(conversation_id: &str, role: Role, text: impl Into<String>) -> Self {
        Self {
            id: ids::new_message_id(),
            conversation_id: conversation_id.to_string(),
            role,
            content: MessageContent::text(text),
            created_at: Utc::now(),
            edited_at: None,
        }
    }

    pub fn user(conversation_id: &str, text: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::User, text)
    }

    pub fn assistant(conversation_id: &str, text: impl Into<String>) -> Self {
        Self::new(conversation_id, Role::Assistant, text)
    }

    pub fn text(&self) -> &str {
        self.content.as_text()
    }

    /// Replace the body and stamp `edited_at`.
    pub fn edit(&mut self, text: impl Into<String>, at: DateTime<Utc>) {
        self.content = MessageContent::text(text);
        self.edited_at = Some(at);
    }

    pub fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!("user".parse::<Role>(), Ok(Role::User));
        assert_eq!("assistant".parse::<Role>(), Ok(Role::Assistant));
        assert!("system".parse::<Role>().is_err());
    }

    #[test]
    fn test_edit_sets_timestamp() {
        let mut msg = Message::user("conv_1_a", "foo");
        assert!(!msg.is_edited());
        let at = Utc::now();
        msg.edit("bar", at);
        assert_eq!(msg.text(), "bar");
        assert_eq!(msg.edited_at, Some(at));
    }

    #[test]
    fn test_content_serializes_as_tagged_variant() {
        let json = serde_json::to_value(MessageContent::text("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "text", "text": "hi"}));
    }
}
