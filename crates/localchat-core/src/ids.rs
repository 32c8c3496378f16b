//! Client-side identifiers.
//!
//! Both conversations and messages use `<prefix>_<epoch millis>_<random>`, the
//! same scheme the store uses, so ids never collide and sort by creation time.

use chrono::{DateTime, Utc};

const CONVERSATION_PREFIX: &str = "conv";
const MESSAGE_PREFIX: &str = "msg";
const SUFFIX_LEN: usize = 8;

pub fn new_conversation_id() -> String {
    generate(CONVERSATION_PREFIX, Utc::now())
}

pub fn new_message_id() -> String {
    generate(MESSAGE_PREFIX, Utc::now())
}

fn generate(prefix: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}_{}", prefix, now.timestamp_millis(), random_suffix())
}

fn random_suffix() -> String {
    let mut suffix = uuid::Uuid::new_v4().simple().to_string();
    suffix.truncate(SUFFIX_LEN);
    suffix
}

/// Creation time embedded in an id produced by this module.
#[cfg(test)]
fn embedded_millis(id: &str) -> Option<i64> {
    let mut parts = id.splitn(3, '_');
    let _prefix = parts.next()?;
    parts.next()?.parse().ok()
}
