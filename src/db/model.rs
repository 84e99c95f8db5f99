//! Row view models returned by repositories.

/// A due follow-up call waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxItem {
    pub id: i64,
    pub entry_id: i64,
    pub payload: String,
    pub attempt: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedErrorRow {
    pub id: i64,
    pub feed_id: i64,
    pub entry_id: i64,
    pub form_id: i64,
    pub message: String,
}

/// Raw settings row; `data` is the JSON settings record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsRow {
    pub data: String,
    pub revision: i64,
    pub version: String,
}
