//! Upstash Redis over its REST API: each command is a JSON array POSTed to
//! the database URL with a bearer token, answered by `{"result": ...}` or
//! `{"error": "..."}`.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use super::Store;
use crate::error::AppError;

#[derive(Deserialize)]
struct Reply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct UpstashStore {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl UpstashStore {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        UpstashStore {
            client: reqwest::Client::new(),
            url: url.into(),
            token: token.into(),
        }
    }

    async fn command(&self, args: &[&str]) -> crate::AppResult<Value> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(args)
            .send()
            .await
            .map_err(AppError::unavailable)?;

        let status = response.status();
        // bad credentials or a failing database: nothing this request can fix
        if status == StatusCode::UNAUTHORIZED
            || status == StatusCode::FORBIDDEN
            || status.is_server_error()
        {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::StoreUnavailable {
                source: format!("upstash replied with status {status}: {body}").into(),
            });
        }

        let reply: Reply = response.json().await.map_err(AppError::unavailable)?;

        match reply {
            Reply {
                error: Some(message),
                ..
            } => Err(AppError::Upstash {
                status: status.as_u16(),
                message,
            }),
            Reply { result, .. } if status.is_success() => Ok(result.unwrap_or(Value::Null)),
            _ => Err(AppError::Upstash {
                status: status.as_u16(),
                message: "unexpected reply".to_owned(),
            }),
        }
    }
}

impl Store for UpstashStore {
    async fn get(&self, key: &str) -> crate::AppResult<Option<String>> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(data) => Ok(Some(data)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn put(&self, key: &str, data: String, ttl: Option<Duration>) -> crate::AppResult<()> {
        match ttl {
            Some(ttl) => {
                // EX must be at least one second
                let secs = ttl.as_secs().max(1).to_string();
                self.command(&["SET", key, &data, "EX", &secs]).await?;
            }
            None => {
                self.command(&["SET", key, &data]).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> crate::AppResult<()> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }

    async fn ping(&self) -> crate::AppResult<()> {
        self.command(&["PING"]).await?;
        Ok(())
    }
}
