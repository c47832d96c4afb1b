use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::info;

use crate::error::AppError;
use crate::ids::generate_id;
use crate::models::{NotFoundReason, Paste, PasteView};
use crate::storage::PasteStore;
use crate::types::api::CreatePaste;

/// A validated creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPaste {
    pub content: String,
    pub ttl_seconds: Option<u64>,
    pub max_views: Option<u64>,
}

impl TryFrom<CreatePaste> for NewPaste {
    type Error = AppError;

    fn try_from(request: CreatePaste) -> crate::AppResult<Self> {
        let content = match request.content {
            Some(Value::String(content)) if !content.trim().is_empty() => content,
            _ => {
                return Err(AppError::validation(
                    "content",
                    "content is required and must be a non-empty string",
                ))
            }
        };

        Ok(NewPaste {
            content,
            ttl_seconds: bounded_integer("ttl_seconds", request.ttl_seconds, MAX_TTL_SECONDS)?,
            max_views: bounded_integer("max_views", request.max_views, u64::MAX)?,
        })
    }
}

/// Longest accepted lifetime, about 10,000 years. Keeps `expires_at` within
/// the range of a `DateTime<Utc>`.
const MAX_TTL_SECONDS: u64 = 10_000 * 365 * 24 * 60 * 60;

/// An optional field that, when present, must be an integer between 1 and
/// `max`. `null` counts as absent. Integral floats such as `10.0` count as
/// integers.
fn bounded_integer(
    field: &'static str,
    value: Option<Value>,
    max: u64,
) -> crate::AppResult<Option<u64>> {
    let Some(value) = value else {
        return Ok(None);
    };

    match as_integer(&value) {
        Some(n) if (1..=max).contains(&n) => Ok(Some(n)),
        _ if max == u64::MAX => Err(AppError::validation(
            field,
            format!("{field} must be an integer >= 1"),
        )),
        _ => Err(AppError::validation(
            field,
            format!("{field} must be an integer between 1 and {max}"),
        )),
    }
}

/// Non-negative integral JSON numbers, whether written as `10` or `10.0`.
fn as_integer(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let n = value.as_f64()?;
    // u64::MAX as f64 rounds up to 2^64, which is out of range
    (n.fract() == 0.0 && n >= 0.0 && n < u64::MAX as f64).then(|| n as u64)
}

/// Store a new paste and return its id.
pub async fn create(
    store: &PasteStore,
    new: NewPaste,
    now: DateTime<Utc>,
) -> crate::AppResult<String> {
    let id = generate_id();
    let paste = Paste::new(new.content, now, new.ttl_seconds, new.max_views);

    info!(
        "new paste: id='{id}', size={size}, ttl={ttl:?}, max_views={max_views:?}",
        size = paste.content.len(),
        ttl = new.ttl_seconds,
        max_views = new.max_views,
    );

    store
        .put(&id, &paste, new.ttl_seconds.map(Duration::from_secs))
        .await?;

    Ok(id)
}

/// What a retrieval does to the stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteBack {
    /// Nothing changed.
    Keep,
    /// Persist the decremented record.
    Store(Paste),
    /// The record is gone for good.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Serve { view: PasteView, write_back: WriteBack },
    Gone(NotFoundReason),
}

/// Decide what a retrieval at `now` of `paste` yields. Expiry is checked
/// before the view limit, and both before the decrement.
pub fn evaluate(mut paste: Paste, now: DateTime<Utc>) -> Verdict {
    if paste.is_expired(now) {
        return Verdict::Gone(NotFoundReason::Expired);
    }
    if paste.is_exhausted() {
        return Verdict::Gone(NotFoundReason::ViewLimit);
    }

    let write_back = match paste.remaining_views {
        None => WriteBack::Keep,
        Some(remaining) => {
            let remaining = remaining - 1;
            paste.remaining_views = Some(remaining);
            if remaining <= 0 {
                WriteBack::Delete
            } else {
                WriteBack::Store(paste.clone())
            }
        }
    };

    Verdict::Serve {
        view: paste.into(),
        write_back,
    }
}

/// Fetch a paste, consuming one view.
///
/// The read and the write back are separate store calls, so two concurrent
/// retrievals of a paste with one view left can both be served.
pub async fn retrieve(
    store: &PasteStore,
    id: &str,
    now: DateTime<Utc>,
) -> crate::AppResult<PasteView> {
    let Some(paste) = store.get(id).await? else {
        return Err(AppError::NotFound(NotFoundReason::NoSuchId));
    };

    match evaluate(paste, now) {
        Verdict::Gone(reason) => {
            info!("deleting paste: id='{id}', reason={}", reason.as_str());
            store.delete(id).await?;
            Err(AppError::NotFound(reason))
        }
        Verdict::Serve { view, write_back } => {
            match write_back {
                WriteBack::Keep => {}
                WriteBack::Store(paste) => {
                    // keep the store-level eviction aligned with the paste's expiry
                    let ttl = paste
                        .expires_at
                        .map(|expires_at| remaining_ttl(expires_at, now));
                    store.put(id, &paste, ttl).await?;
                }
                WriteBack::Delete => {
                    info!("deleting paste: id='{id}', reason=last view");
                    store.delete(id).await?;
                }
            }
            Ok(view)
        }
    }
}

fn remaining_ttl(expires_at: i64, now: DateTime<Utc>) -> Duration {
    let millis = expires_at.saturating_sub(now.timestamp_millis()).max(0);
    Duration::from_millis(millis.unsigned_abs())
}
