use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use super::backend::StateBackend;
use crate::error::StoreError;

const SCAN_PAGE_LIMIT: usize = 1_000;

/// Backend speaking the Redis-over-REST protocol: each command is a JSON
/// array POSTed to the base URL, compound writes go through `/pipeline`.
///
/// Requests carry a bearer token and a bounded timeout, so an unreachable
/// store turns into `StoreError::Unavailable` instead of a hung dispatch.
pub struct RestBackend {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RestBackend {
    #[must_use]
    pub fn new(base_url: &str, token: &str, timeout_ms: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn command(&self, command: &[&str]) -> Result<Value, StoreError> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "store returned {}",
                response.status()
            )));
        }

        let reply: CommandReply = response
            .json()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if let Some(error) = reply.error {
            return Err(StoreError::Unavailable(format!("store error: {error}")));
        }
        Ok(reply.result.unwrap_or(Value::Null))
    }

    async fn pipeline(&self, commands: &[Vec<String>]) -> Result<Vec<Value>, StoreError> {
        let url = format!("{}/pipeline", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&commands)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Unavailable(format!(
                "store returned {}",
                response.status()
            )));
        }

        let replies: Vec<CommandReply> = response
            .json()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let mut results = Vec::with_capacity(replies.len());
        for reply in replies {
            if let Some(error) = reply.error {
                return Err(StoreError::Unavailable(format!("store error: {error}")));
            }
            results.push(reply.result.unwrap_or(Value::Null));
        }
        Ok(results)
    }
}

fn as_member_list(key: &str, value: Value) -> Result<Vec<String>, StoreError> {
    let Value::Array(items) = value else {
        return Err(StoreError::Corrupt {
            key: key.to_string(),
            message: "expected an array of members".to_string(),
        });
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(member) => Ok(member),
            other => Err(StoreError::Corrupt {
                key: key.to_string(),
                message: format!("unexpected member {other}"),
            }),
        })
        .collect()
}

fn as_score(value: Value) -> Option<f64> {
    match value {
        Value::String(text) => text.parse().ok(),
        Value::Number(number) => number.as_f64(),
        _ => None,
    }
}

impl StateBackend for RestBackend {
    fn name(&self) -> &str {
        "rest"
    }

    fn ping<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let result = self.command(&["PING"]).await?;
            if result.as_str() == Some("PONG") {
                Ok(())
            } else {
                Err(StoreError::Unavailable(format!(
                    "unexpected ping reply {result}"
                )))
            }
        })
    }

    fn get<'a>(
        &'a self,
        key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            match self.command(&["GET", key]).await? {
                Value::Null => Ok(None),
                Value::String(value) => Ok(Some(value)),
                other => Err(StoreError::Corrupt {
                    key: key.to_string(),
                    message: format!("unexpected GET reply {other}"),
                }),
            }
        })
    }

    fn get_many<'a>(
        &'a self,
        keys: &'a [String],
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Option<String>>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(Vec::new());
            }
            let mut command = vec!["MGET"];
            command.extend(keys.iter().map(String::as_str));

            let Value::Array(items) = self.command(&command).await? else {
                return Err(StoreError::Unavailable("malformed MGET reply".to_string()));
            };
            Ok(items
                .into_iter()
                .map(|item| match item {
                    Value::String(value) => Some(value),
                    _ => None,
                })
                .collect())
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            self.command(&["SET", key, value]).await?;
            Ok(())
        })
    }

    fn zadd<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
        score: f64,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let score = score.to_string();
            self.command(&["ZADD", key, &score, member]).await?;
            Ok(())
        })
    }

    fn zscore<'a>(
        &'a self,
        key: &'a str,
        member: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<f64>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let result = self.command(&["ZSCORE", key, member]).await?;
            Ok(as_score(result))
        })
    }

    fn zrange_desc<'a>(
        &'a self,
        key: &'a str,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let stop = limit.saturating_sub(1).to_string();
            let result = self.command(&["ZREVRANGE", key, "0", &stop]).await?;
            as_member_list(key, result)
        })
    }

    fn scan<'a>(
        &'a self,
        prefix: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>, StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let pattern = format!("{prefix}*");
            let mut cursor = "0".to_string();
            let mut keys = Vec::new();

            for _ in 0..SCAN_PAGE_LIMIT {
                let result = self
                    .command(&["SCAN", &cursor, "MATCH", &pattern, "COUNT", "1000"])
                    .await?;
                let Value::Array(mut parts) = result else {
                    return Err(StoreError::Unavailable("malformed SCAN reply".to_string()));
                };
                if parts.len() != 2 {
                    return Err(StoreError::Unavailable("malformed SCAN reply".to_string()));
                }
                let page = parts.pop().unwrap_or(Value::Null);
                let next_cursor = parts.pop().unwrap_or(Value::Null);

                keys.extend(as_member_list(prefix, page)?);
                cursor = match next_cursor {
                    Value::String(text) => text,
                    Value::Number(number) => number.to_string(),
                    _ => {
                        return Err(StoreError::Unavailable(
                            "malformed SCAN cursor".to_string(),
                        ));
                    }
                };
                if cursor == "0" {
                    keys.sort();
                    return Ok(keys);
                }
            }
            Err(StoreError::Unavailable(
                "scan cursor did not terminate".to_string(),
            ))
        })
    }

    fn transition<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        removals: &'a [(String, String)],
        additions: &'a [(String, String, f64)],
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
        Box::pin(async move {
            let mut commands = Vec::with_capacity(1 + removals.len() + additions.len());
            commands.push(vec![
                "SET".to_string(),
                key.to_string(),
                value.to_string(),
            ]);
            for (set_key, member) in removals {
                commands.push(vec![
                    "ZREM".to_string(),
                    set_key.clone(),
                    member.clone(),
                ]);
            }
            for (set_key, member, score) in additions {
                commands.push(vec![
                    "ZADD".to_string(),
                    set_key.clone(),
                    score.to_string(),
                    member.clone(),
                ]);
            }
            self.pipeline(&commands).await?;
            Ok(())
        })
    }
}
