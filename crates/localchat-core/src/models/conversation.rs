use chrono::{DateTime, Utc};

use super::message::{Message, Role};
use crate::ids;

pub const DEFAULT_TITLE: &str = "New Chat";
pub const DEFAULT_FOLDER: &str = "Work Projects";
/// Preview shown for a conversation with no messages yet.
pub const EMPTY_CONVERSATION_PREVIEW: &str = "Say hello to start...";
/// Preview shown when the model answered with no text.
pub const EMPTY_REPLY_PREVIEW: &str = "system: no message content.";

pub const PREVIEW_MAX_CHARS: usize = 80;
pub const TITLE_MAX_CHARS: usize = 50;

/// Truncate text to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Title derived from the first user message of a conversation.
pub fn title_from_message(text: &str) -> String {
    let title = truncate_chars(text.trim(), TITLE_MAX_CHARS);
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

/// A conversation in the engine's working set.
///
/// `message_count` and `preview` are caches over `messages` and are refreshed
/// by every mutating method. Until the message bodies are loaded from the
/// store (`is_loaded() == false`) both come from the store summary instead.
#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    id: String,
    title: String,
    pinned: bool,
    folder: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    messages: Vec<Message>,
    message_count: usize,
    preview: String,
    loaded: bool,
    persisted: bool,
}

impl Conversation {
    /// Placeholder for a brand new chat. Never durable until its first message.
    pub fn placeholder() -> Self {
        let now = Utc::now();
        Self {
            id: ids::new_conversation_id(),
            title: DEFAULT_TITLE.to_string(),
            pinned: false,
            folder: DEFAULT_FOLDER.to_string(),
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
            message_count: 0,
            preview: EMPTY_CONVERSATION_PREVIEW.to_string(),
            loaded: true,
            persisted: false,
        }
    }

    /// Rebuild a conversation known to the store whose messages are not loaded.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored(
        id: String,
        title: String,
        pinned: bool,
        folder: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        message_count: usize,
        last_message: Option<&str>,
    ) -> Self {
        let preview = match last_message {
            Some(text) if !text.is_empty() => truncate_chars(text, PREVIEW_MAX_CHARS),
            Some(_) => EMPTY_REPLY_PREVIEW.to_string(),
            None => EMPTY_CONVERSATION_PREVIEW.to_string(),
        };

        Self {
            id,
            title,
            pinned,
            folder: folder.unwrap_or_else(|| DEFAULT_FOLDER.to_string()),
            created_at,
            updated_at,
            messages: Vec::new(),
            message_count,
            preview,
            loaded: false,
            persisted: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn set_title(&mut self, title: String) {
        self.title = title;
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn toggle_pinned(&mut self) -> bool {
        self.pinned = !self.pinned;
        self.pinned
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    #[cfg(test)]
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message(&self, message_id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    pub fn preview(&self) -> &str {
        &self.preview
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Whether the conversation row exists in the store.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn mark_persisted(&mut self) {
        self.persisted = true;
    }

    /// Append in insertion order and refresh the cached fields.
    pub fn push_message(&mut self, message: Message) {
        self.updated_at = self.updated_at.max(message.created_at);
        self.messages.push(message);
        self.refresh_derived();
    }

    /// Edit a message in place. Returns false when the id is unknown.
    pub fn edit_message(&mut self, message_id: &str, text: &str, at: DateTime<Utc>) -> bool {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == message_id) else {
            return false;
        };
        message.edit(text, at);
        self.refresh_derived();
        true
    }

    /// Replace the message list wholesale with what the store returned.
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.loaded = true;
        self.refresh_derived();
    }

    fn refresh_derived(&mut self) {
        if !self.loaded {
            return;
        }
        self.message_count = self.messages.len();

        let Some(last) = self.messages.last() else {
            self.preview = EMPTY_CONVERSATION_PREVIEW.to_string();
            return;
        };
        let text = last.text();
        if !text.is_empty() {
            self.preview = truncate_chars(text, PREVIEW_MAX_CHARS);
        } else if last.role == Role::Assistant {
            self.preview = EMPTY_REPLY_PREVIEW.to_string();
        }
    }

    /// Case-insensitive match on title or preview.
    pub fn matches_query(&self, query: &str) -> bool {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        self.title.to_lowercase().contains(&query) || self.preview.to_lowercase().contains(&query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_defaults() {
        let conv = Conversation::placeholder();
        assert!(conv.id().starts_with("conv_"));
        assert_eq!(conv.title(), DEFAULT_TITLE);
        assert_eq!(conv.folder(), DEFAULT_FOLDER);
        assert_eq!(conv.preview(), EMPTY_CONVERSATION_PREVIEW);
        assert_eq!(conv.message_count(), 0);
        assert!(conv.is_loaded());
        assert!(!conv.is_persisted());
    }

    #[test]
    fn test_push_refreshes_preview_and_count() {
        let mut conv = Conversation::placeholder();
        let long = "x".repeat(200);
        conv.push_message(Message::user(conv.id(), long.clone()));
        assert_eq!(conv.message_count(), 1);
        assert_eq!(conv.preview().chars().count(), PREVIEW_MAX_CHARS);
    }

    #[test]
    fn test_empty_assistant_reply_uses_fallback_preview() {
        let mut conv = Conversation::placeholder();
        conv.push_message(Message::user(conv.id(), "Hello"));
        conv.push_message(Message::assistant(conv.id(), ""));
        assert_eq!(conv.preview(), EMPTY_REPLY_PREVIEW);
        assert_eq!(conv.message_count(), 2);
    }

    #[test]
    fn test_edit_unknown_message_is_noop() {
        let mut conv = Conversation::placeholder();
        conv.push_message(Message::user(conv.id(), "Hello"));
        let before = conv.clone();
        assert!(!conv.edit_message("msg_missing", "changed", Utc::now()));
        assert_eq!(conv, before);
    }

    #[test]
    fn test_edit_recomputes_preview_from_last_message() {
        let mut conv = Conversation::placeholder();
        let msg = Message::user(conv.id(), "foo");
        let id = msg.id.clone();
        conv.push_message(msg);
        assert!(conv.edit_message(&id, "bar", Utc::now()));
        assert_eq!(conv.preview(), "bar");
        assert!(conv.message(&id).unwrap().is_edited());
    }

    #[test]
    fn test_stored_conversation_keeps_summary_until_loaded() {
        let now = Utc::now();
        let mut conv = Conversation::from_stored(
            "conv_1_abc".to_string(),
            "Stored".to_string(),
            false,
            None,
            now,
            now,
            4,
            Some("last words"),
        );
        assert_eq!(conv.message_count(), 4);
        assert_eq!(conv.preview(), "last words");
        assert!(!conv.is_loaded());

        conv.replace_messages(vec![Message::user("conv_1_abc", "only one")]);
        assert_eq!(conv.message_count(), 1);
        assert_eq!(conv.preview(), "only one");
    }

    #[test]
    fn test_title_from_message() {
        assert_eq!(title_from_message("Hello"), "Hello");
        assert_eq!(title_from_message(&"a".repeat(60)).len(), TITLE_MAX_CHARS);
        assert_eq!(title_from_message("   "), DEFAULT_TITLE);
    }

    #[test]
    fn test_matches_query() {
        let mut conv = Conversation::placeholder();
        conv.set_title("Rust lifetimes".to_string());
        assert!(conv.matches_query("rust"));
        assert!(conv.matches_query("  "));
        assert!(conv.matches_query("say hello"));
        assert!(!conv.matches_query("python"));
    }
}
