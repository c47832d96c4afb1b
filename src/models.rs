use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A paste as persisted in the store. Timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paste {
    pub content: String,
    pub created_at: i64,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub max_views: Option<u64>,
    #[serde(default)]
    pub remaining_views: Option<i64>,
}

impl Paste {
    pub fn new(
        content: String,
        now: DateTime<Utc>,
        ttl_seconds: Option<u64>,
        max_views: Option<u64>,
    ) -> Self {
        let created_at = now.timestamp_millis();
        Paste {
            content,
            created_at,
            expires_at: ttl_seconds.map(|ttl| created_at.saturating_add(ttl_millis(ttl))),
            max_views,
            remaining_views: max_views.map(|max| i64::try_from(max).unwrap_or(i64::MAX)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now.timestamp_millis() >= expires_at)
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.remaining_views, Some(remaining) if remaining <= 0)
    }
}

fn ttl_millis(ttl_seconds: u64) -> i64 {
    i64::try_from(ttl_seconds)
        .unwrap_or(i64::MAX)
        .saturating_mul(1000)
}

/// What a successful retrieval hands back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasteView {
    pub content: String,
    pub remaining_views: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<Paste> for PasteView {
    fn from(paste: Paste) -> Self {
        PasteView {
            content: paste.content,
            remaining_views: paste.remaining_views,
            expires_at: paste
                .expires_at
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        }
    }
}

/// Why a paste could not be served. Only used internally; clients see one
/// message for all of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundReason {
    NoSuchId,
    Expired,
    ViewLimit,
}

impl NotFoundReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotFoundReason::NoSuchId => "no_such_id",
            NotFoundReason::Expired => "expired",
            NotFoundReason::ViewLimit => "view_limit",
        }
    }
}
