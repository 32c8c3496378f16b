use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::conversation::Conversation;

/// Maximum number of unpinned conversations shown in the sidebar.
pub const RECENT_LIMIT: usize = 10;

/// Row of the conversation sidebar.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationListItem {
    pub id: String,
    pub title: String,
    pub pinned: bool,
    pub folder: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub preview: String,
}

impl From<&Conversation> for ConversationListItem {
    fn from(conv: &Conversation) -> Self {
        Self {
            id: conv.id().to_string(),
            title: conv.title().to_string(),
            pinned: conv.is_pinned(),
            folder: conv.folder().to_string(),
            updated_at: conv.updated_at(),
            message_count: conv.message_count(),
            preview: conv.preview().to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConversationList {
    pub pinned: Vec<ConversationListItem>,
    pub recent: Vec<ConversationListItem>,
}

impl ConversationList {
    /// Pinned conversations newest first, then at most [`RECENT_LIMIT`]
    /// unpinned ones newest first. Only conversations matching `query` are kept.
    pub fn derive<'a>(conversations: impl IntoIterator<Item = &'a Conversation>, query: &str) -> Self {
        let (mut pinned, mut recent): (Vec<_>, Vec<_>) = conversations
            .into_iter()
            .filter(|c| c.matches_query(query))
            .map(ConversationListItem::from)
            .partition(|item| item.pinned);

        pinned.sort_by(newest_first);
        recent.sort_by(newest_first);
        recent.truncate(RECENT_LIMIT);

        Self { pinned, recent }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pinned.iter().chain(self.recent.iter()).any(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.pinned.len() + self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Ids embed the creation time, so they break ties chronologically too.
fn newest_first(a: &ConversationListItem, b: &ConversationListItem) -> Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Number of conversations per known folder. Unknown folders are not counted.
pub fn folder_counts<'a>(
    conversations: impl IntoIterator<Item = &'a Conversation>,
    folders: &[String],
) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = folders.iter().map(|f| (f.clone(), 0)).collect();
    for conv in conversations {
        if let Some(count) = counts.get_mut(conv.folder()) {
            *count += 1;
        }
    }
    counts
}

/// Human readable age of a timestamp relative to `now`.
///
/// Missing or future timestamps read as "Just now".
pub fn time_ago(at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = at else {
        return "Just now".to_string();
    };
    let millis = (now - at).num_milliseconds();
    if millis < 0 {
        return "Just now".to_string();
    }

    let seconds = (millis as f64 / 1000.0).round() as i64;
    if seconds == 0 {
        return "now".to_string();
    }
    if seconds < 60 {
        return ago(seconds, "second");
    }

    let minutes = (seconds as f64 / 60.0).round() as i64;
    if minutes < 60 {
        return ago(minutes, "minute");
    }

    let hours = (minutes as f64 / 60.0).round() as i64;
    if hours < 24 {
        return ago(hours, "hour");
    }

    let days = (hours as f64 / 24.0).round() as i64;
    if days < 7 {
        return ago(days, "day");
    }

    let weeks = (days as f64 / 7.0).round() as i64;
    if weeks < 4 {
        return ago(weeks, "week");
    }

    let months = (days as f64 / 30.0).round() as i64;
    if months < 12 {
        return ago(months, "month");
    }

    let years = (days as f64 / 365.0).round() as i64;
    ago(years, "year")
}

fn ago(amount: i64, unit: &str) -> String {
    if amount == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", amount, unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn conversation_at(title: &str, minutes_ago: i64, pinned: bool) -> Conversation {
        let mut conv = Conversation::placeholder();
        conv.set_title(title.to_string());
        conv.touch(Utc::now() - Duration::minutes(minutes_ago));
        if pinned {
            conv.toggle_pinned();
        }
        conv
    }

    #[test]
    fn test_pinned_and_recent_are_sorted_newest_first() {
        let convs = vec![
            conversation_at("old pinned", 30, true),
            conversation_at("new pinned", 1, true),
            conversation_at("old", 20, false),
            conversation_at("new", 2, false),
        ];

        let list = ConversationList::derive(&convs, "");
        let pinned: Vec<_> = list.pinned.iter().map(|i| i.title.as_str()).collect();
        let recent: Vec<_> = list.recent.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(pinned, vec!["new pinned", "old pinned"]);
        assert_eq!(recent, vec!["new", "old"]);
    }

    #[test]
    fn test_recent_is_capped() {
        let convs: Vec<_> = (0..15)
            .map(|i| conversation_at(&format!("chat {}", i), i, false))
            .collect();
        let list = ConversationList::derive(&convs, "");
        assert_eq!(list.recent.len(), RECENT_LIMIT);
        assert_eq!(list.recent[0].title, "chat 0");
        assert!(list.pinned.is_empty());
    }

    #[test]
    fn test_pinned_is_not_capped() {
        let convs: Vec<_> = (0..12)
            .map(|i| conversation_at(&format!("pin {}", i), i, true))
            .collect();
        let list = ConversationList::derive(&convs, "");
        assert_eq!(list.pinned.len(), 12);
    }

    #[test]
    fn test_query_filters_before_partition() {
        let convs = vec![
            conversation_at("Rust question", 1, false),
            conversation_at("Groceries", 2, true),
        ];
        let list = ConversationList::derive(&convs, "RUST");
        assert_eq!(list.len(), 1);
        assert_eq!(list.recent[0].title, "Rust question");
    }

    #[test]
    fn test_folder_counts_only_known_folders() {
        let convs = vec![Conversation::placeholder(), Conversation::placeholder()];
        let counts = folder_counts(&convs, &["Work Projects".to_string(), "Personal".to_string()]);
        assert_eq!(counts.get("Work Projects"), Some(&2));
        assert_eq!(counts.get("Personal"), Some(&0));
        assert_eq!(counts.len(), 2);
    }

    #[test]
    fn test_time_ago() {
        let now = Utc::now();
        assert_eq!(time_ago(None, now), "Just now");
        assert_eq!(time_ago(Some(now + Duration::seconds(10)), now), "Just now");
        assert_eq!(time_ago(Some(now), now), "now");
        assert_eq!(time_ago(Some(now - Duration::seconds(5)), now), "5 seconds ago");
        assert_eq!(time_ago(Some(now - Duration::minutes(1)), now), "1 minute ago");
        assert_eq!(time_ago(Some(now - Duration::hours(3)), now), "3 hours ago");
        assert_eq!(time_ago(Some(now - Duration::days(2)), now), "2 days ago");
        assert_eq!(time_ago(Some(now - Duration::days(14)), now), "2 weeks ago");
        assert_eq!(time_ago(Some(now - Duration::days(90)), now), "3 months ago");
        assert_eq!(time_ago(Some(now - Duration::days(800)), now), "2 years ago");
    }
}
