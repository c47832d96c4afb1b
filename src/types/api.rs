use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::PasteView;

/// Body of `POST /api/pastes`. Fields are kept loosely typed so validation
/// can point at the offending field instead of failing the whole body.
#[derive(Debug, Default, Deserialize)]
pub struct CreatePaste {
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub ttl_seconds: Option<Value>,
    #[serde(default)]
    pub max_views: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedPaste {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchedPaste {
    pub content: String,
    pub remaining_views: Option<i64>,
    pub expires_at: Option<String>,
}

impl From<PasteView> for FetchedPaste {
    fn from(view: PasteView) -> Self {
        FetchedPaste {
            content: view.content,
            remaining_views: view.remaining_views,
            expires_at: view.expires_at.as_ref().map(iso8601),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Health {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// ISO-8601 in UTC with millisecond precision, e.g. `2024-01-01T00:00:00.000Z`.
pub fn iso8601(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}
