use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use crate::config::AppConfig;

/// Upstash Redis over its REST interface: one command per POST, body is the
/// command as a JSON array, response is `{"result": ...}`.
pub struct UpstashClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl UpstashClient {
    pub fn new(http: reqwest::Client, base_url: &str, token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    async fn command(&self, cmd: Value) -> Result<Value, String> {
        let response = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&cmd)
            .send()
            .await
            .map_err(|err| format!("upstash request failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("upstash returned {status}: {body}"));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("upstash parse failed: {err}"))?;
        if let Some(error) = payload.get("error").and_then(Value::as_str) {
            return Err(format!("upstash error: {error}"));
        }
        Ok(payload.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let result = self.command(json!(["GET", key])).await?;
        Ok(result.as_str().map(str::to_string))
    }

    pub async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) -> Result<(), String> {
        let cmd = match ttl_seconds {
            Some(ttl) => json!(["SET", key, value, "EX", ttl.to_string()]),
            None => json!(["SET", key, value]),
        };
        self.command(cmd).await.map(|_| ())
    }

    pub async fn del(&self, key: &str) -> Result<(), String> {
        self.command(json!(["DEL", key])).await.map(|_| ())
    }

    pub async fn keys(&self, pattern: &str) -> Result<Vec<String>, String> {
        let result = self.command(json!(["KEYS", pattern])).await?;
        Ok(result
            .as_array()
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct FallbackEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl FallbackEntry {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Two-tier key-value store: the remote Upstash client when configured and
/// reachable, a process-local map otherwise. Fallback state is not shared
/// across instances; expired fallback entries are dropped lazily on read.
pub struct KvStore {
    remote: Option<UpstashClient>,
    fallback: Mutex<HashMap<String, FallbackEntry>>,
}

impl KvStore {
    pub fn new(http: reqwest::Client, config: &AppConfig) -> Self {
        let remote = if config.upstash_configured() {
            Some(UpstashClient::new(
                http,
                &config.upstash_redis_rest_url,
                &config.upstash_redis_rest_token,
            ))
        } else {
            tracing::warn!("upstash not configured, using in-memory storage only");
            None
        };
        Self {
            remote,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    pub fn unconfigured() -> Self {
        Self {
            remote: None,
            fallback: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(remote) = &self.remote {
            match remote.get(key).await {
                Ok(value) => return value,
                Err(err) => {
                    tracing::warn!(key, %err, "kv get degraded to in-memory fallback");
                }
            }
        }
        let now = Utc::now();
        let mut map = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(key) {
            Some(entry) if entry.expired(now) => {
                map.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl_seconds: Option<u64>) {
        if let Some(remote) = &self.remote {
            match remote.set(key, value, ttl_seconds).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::warn!(key, %err, "kv set degraded to in-memory fallback");
                }
            }
        }
        let expires_at = ttl_seconds.map(|ttl| Utc::now() + Duration::seconds(ttl as i64));
        let mut map = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(
            key.to_string(),
            FallbackEntry {
                value: value.to_string(),
                expires_at,
            },
        );
    }

    pub async fn del(&self, key: &str) {
        if let Some(remote) = &self.remote {
            if let Err(err) = remote.del(key).await {
                tracing::warn!(key, %err, "kv del failed on remote tier");
            }
        }
        let mut map = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }

    /// All live keys starting with `prefix`, merged across both tiers.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(remote) = &self.remote {
            match remote.keys(&format!("{prefix}*")).await {
                Ok(remote_keys) => keys = remote_keys,
                Err(err) => {
                    tracing::warn!(prefix, %err, "kv keys degraded to in-memory fallback");
                }
            }
        }
        let now = Utc::now();
        let mut map = self.fallback.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, entry| !entry.expired(now));
        for key in map.keys() {
            if key.starts_with(prefix) && !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Typed convenience over `get`, tolerating undecodable stored JSON.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(key, %err, "kv entry is not valid JSON for its type");
                None
            }
        }
    }

    pub async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T, ttl_seconds: Option<u64>) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw, ttl_seconds).await,
            Err(err) => tracing::warn!(key, %err, "kv value failed to serialize"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fallback_round_trips_without_remote() {
        let store = KvStore::unconfigured();
        store.set("customer:5511999990000", "{\"a\":1}", None).await;
        assert_eq!(
            store.get("customer:5511999990000").await.as_deref(),
            Some("{\"a\":1}")
        );
        store.del("customer:5511999990000").await;
        assert_eq!(store.get("customer:5511999990000").await, None);
    }

    #[tokio::test]
    async fn fallback_prefix_listing_skips_expired_entries() {
        let store = KvStore::unconfigured();
        store.set("reminder:a", "1", Some(3600)).await;
        store.set("reminder:b", "2", None).await;
        store.set("conversation:c", "3", None).await;
        {
            let mut map = store.fallback.lock().unwrap();
            map.get_mut("reminder:a").unwrap().expires_at =
                Some(Utc::now() - Duration::seconds(1));
        }
        let mut keys = store.keys_with_prefix("reminder:").await;
        keys.sort();
        assert_eq!(keys, vec!["reminder:b".to_string()]);
    }

    #[tokio::test]
    async fn expired_fallback_entry_reads_as_absent() {
        let store = KvStore::unconfigured();
        store.set("typebot:lead:55119", "x", Some(60)).await;
        {
            let mut map = store.fallback.lock().unwrap();
            map.get_mut("typebot:lead:55119").unwrap().expires_at =
                Some(Utc::now() - Duration::seconds(1));
        }
        assert_eq!(store.get("typebot:lead:55119").await, None);
    }

    #[tokio::test]
    async fn remote_get_and_set_speak_the_rest_protocol() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_partial_json(serde_json::json!(["GET", "conversation:55"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": "{\"history\":[]}"
            })))
            .mount(&server)
            .await;

        let client = UpstashClient::new(reqwest::Client::new(), &server.uri(), "token");
        let value = client.get("conversation:55").await.unwrap();
        assert_eq!(value.as_deref(), Some("{\"history\":[]}"));
    }

    #[tokio::test]
    async fn remote_failure_degrades_to_fallback_on_set_and_get() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let store = KvStore {
            remote: Some(UpstashClient::new(
                reqwest::Client::new(),
                &server.uri(),
                "token",
            )),
            fallback: Mutex::new(HashMap::new()),
        };
        store.set("customer:1", "fallback", None).await;
        assert_eq!(store.get("customer:1").await.as_deref(), Some("fallback"));
    }
}
