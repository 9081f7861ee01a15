//! Consul metadata store
//!
//! Talks to the agent's HTTP API: KV reads use `?raw` plus the
//! `X-Consul-Index` header as the modify index for `?cas=`; locks are KV keys
//! acquired with a TTL session whose behavior deletes the key on expiry.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{LockEvent, LockWatch, MetadataStore, StoreError, StoreResult};
use crate::config::ConsulConfig;

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";
/// Blocking query wait used by lock watches
const WATCH_WAIT: Duration = Duration::from_secs(30);

fn unavailable(context: &str, e: reqwest::Error) -> StoreError {
    StoreError::Unavailable(format!("consul {}: {}", context, e))
}

fn index_of(resp: &Response) -> u64 {
    resp.headers()
        .get(INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Consul keys carry no leading slash
fn kv_path(key: &str) -> &str {
    key.trim_start_matches('/')
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SessionRequest<'a> {
    name: &'a str,
    #[serde(rename = "TTL")]
    ttl: String,
    behavior: &'a str,
    lock_delay: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Debug, Clone)]
struct HeldSession {
    holder: String,
    session: String,
}

pub struct ConsulStore {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    lock_prefix: String,
    sessions: Mutex<HashMap<String, HeldSession>>,
}

impl ConsulStore {
    pub fn new(config: &ConsulConfig, lock_prefix: &str) -> StoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| StoreError::Internal(format!("consul http client: {}", e)))?;
        Ok(Self {
            http,
            base: config.addr.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            lock_prefix: lock_prefix.to_string(),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.base, kv_path(key))
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}/{}", self.lock_prefix, name)
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.header(TOKEN_HEADER, token),
            None => req,
        }
    }

    /// Raw value and modify index
    async fn read(&self, key: &str) -> StoreResult<Option<(Vec<u8>, u64)>> {
        let resp = self
            .auth(self.http.get(format!("{}?raw", self.kv_url(key))))
            .send()
            .await
            .map_err(|e| unavailable("get", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status().map_err(|e| unavailable("get", e))?;
        let index = index_of(&resp);
        let body = resp.bytes().await.map_err(|e| unavailable("get", e))?;
        Ok(Some((body.to_vec(), index)))
    }

    /// PUT returning Consul's boolean verdict
    async fn put_bool(&self, url: String, body: Vec<u8>, context: &str) -> StoreResult<bool> {
        let resp = self
            .auth(self.http.put(url))
            .body(body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unavailable(context, e))?;
        let text = resp.text().await.map_err(|e| unavailable(context, e))?;
        Ok(text.trim() == "true")
    }

    async fn create_session(&self, holder: &str, ttl: Duration) -> StoreResult<String> {
        let request = SessionRequest {
            name: holder,
            ttl: format!("{}s", ttl.as_secs().max(10)),
            behavior: "delete",
            lock_delay: "0s",
        };
        let resp: SessionResponse = self
            .auth(self.http.put(format!("{}/v1/session/create", self.base)))
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unavailable("create session", e))?
            .json()
            .await
            .map_err(|e| unavailable("create session", e))?;
        Ok(resp.id)
    }

    async fn destroy_session(&self, session: &str) {
        let url = format!("{}/v1/session/destroy/{}", self.base, session);
        if let Err(e) = self.auth(self.http.put(url)).send().await {
            warn!("Failed to destroy consul session {}: {}", session, e);
        }
    }

    fn held_session(&self, name: &str, holder: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(name)
            .filter(|s| s.holder == holder)
            .map(|s| s.session.clone())
    }
}

#[async_trait]
impl MetadataStore for ConsulStore {
    fn backend(&self) -> &'static str {
        "consul"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.read(key).await?.map(|(value, _)| value))
    }

    async fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if self.put_bool(self.kv_url(key), value.to_vec(), "put").await? {
            Ok(())
        } else {
            Err(StoreError::Internal(format!("consul rejected put of {}", key)))
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.auth(self.http.delete(self.kv_url(key)))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| unavailable("delete", e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let url = format!("{}/?keys&separator=/", self.kv_url(prefix));
        let resp = self
            .auth(self.http.get(url))
            .send()
            .await
            .map_err(|e| unavailable("list", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let mut keys: Vec<String> = resp
            .error_for_status()
            .map_err(|e| unavailable("list", e))?
            .json()
            .await
            .map_err(|e| unavailable("list", e))?;
        keys.sort();

        let mut result = Vec::with_capacity(keys.len());
        // folders come back with a trailing separator
        for key in keys.into_iter().filter(|k| !k.ends_with('/')) {
            let key = format!("/{}", key);
            if let Some((value, _)) = self.read(&key).await? {
                result.push((key, value));
            }
        }
        Ok(result)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> StoreResult<()> {
        let conflict = || StoreError::Conflict(key.to_string());
        let index = match (expected, self.read(key).await?) {
            (None, None) => 0,
            (Some(expected), Some((current, index))) if current == expected => index,
            _ => return Err(conflict()),
        };
        let url = format!("{}?cas={}", self.kv_url(key), index);
        if self.put_bool(url, value.to_vec(), "cas").await? {
            Ok(())
        } else {
            Err(conflict())
        }
    }

    async fn acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<()> {
        if self.held_session(name, holder).is_some() {
            return self.renew_lock(name, holder, ttl).await;
        }
        let session = self.create_session(holder, ttl).await?;
        let url = format!("{}?acquire={}", self.kv_url(&self.lock_key(name)), session);
        let acquired = match self.put_bool(url, holder.as_bytes().to_vec(), "acquire").await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.destroy_session(&session).await;
                return Err(e);
            }
        };
        if acquired {
            debug!("Acquired consul lock {} with session {}", name, session);
            self.sessions.lock().insert(
                name.to_string(),
                HeldSession {
                    holder: holder.to_string(),
                    session,
                },
            );
            return Ok(());
        }

        self.destroy_session(&session).await;
        let current = self
            .read(&self.lock_key(name))
            .await?
            .map(|(value, _)| String::from_utf8_lossy(&value).into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Err(StoreError::AlreadyHeld {
            name: name.to_string(),
            holder: current,
        })
    }

    async fn renew_lock(&self, name: &str, holder: &str, _ttl: Duration) -> StoreResult<()> {
        let lost = || StoreError::LockLost(name.to_string());
        let session = self.held_session(name, holder).ok_or_else(lost)?;
        let url = format!("{}/v1/session/renew/{}", self.base, session);
        let resp = self
            .auth(self.http.put(url))
            .send()
            .await
            .map_err(|e| unavailable("renew session", e))?;
        if resp.status() == StatusCode::NOT_FOUND {
            self.sessions.lock().remove(name);
            return Err(lost());
        }
        resp.error_for_status()
            .map_err(|e| unavailable("renew session", e))?;
        Ok(())
    }

    async fn release_lock(&self, name: &str, holder: &str) -> StoreResult<()> {
        let held = {
            let mut sessions = self.sessions.lock();
            match sessions.get(name) {
                Some(s) if s.holder == holder => sessions.remove(name),
                _ => None,
            }
        };
        let Some(held) = held else { return Ok(()) };
        let url = format!(
            "{}?release={}",
            self.kv_url(&self.lock_key(name)),
            held.session
        );
        self.put_bool(url, holder.as_bytes().to_vec(), "release").await?;
        // the session's delete behavior removes the key
        self.destroy_session(&held.session).await;
        Ok(())
    }

    async fn watch_lock(&self, name: &str) -> StoreResult<LockWatch> {
        let http = self.http.clone();
        let token = self.token.clone();
        let url = format!("{}?raw", self.kv_url(&self.lock_key(name)));
        let (tx, watch) = LockWatch::channel();

        tokio::spawn(async move {
            let mut index = 0u64;
            let mut last: Option<LockEvent> = None;
            loop {
                let mut req = http
                    .get(format!("{}&index={}&wait={}s", url, index, WATCH_WAIT.as_secs()))
                    .timeout(WATCH_WAIT + Duration::from_secs(10));
                if let Some(token) = &token {
                    req = req.header(TOKEN_HEADER, token);
                }
                let resp = match req.send().await {
                    Ok(resp) => resp,
                    Err(e) => {
                        warn!("consul watch on {} ended: {}", url, e);
                        return;
                    }
                };
                let next_index = index_of(&resp);
                let event = if resp.status() == StatusCode::NOT_FOUND {
                    LockEvent::released()
                } else {
                    match resp.error_for_status() {
                        Ok(resp) => match resp.bytes().await {
                            Ok(body) if !body.is_empty() => {
                                LockEvent::held(String::from_utf8_lossy(&body))
                            }
                            Ok(_) => LockEvent::released(),
                            Err(e) => {
                                warn!("consul watch on {} ended: {}", url, e);
                                return;
                            }
                        },
                        Err(e) => {
                            warn!("consul watch on {} ended: {}", url, e);
                            return;
                        }
                    }
                };
                // an index going backwards means the raft state was reset
                index = if next_index < index { 0 } else { next_index };
                if last.as_ref() != Some(&event) {
                    last = Some(event.clone());
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(watch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_url() {
        let store = ConsulStore::new(&ConsulConfig::default(), "/kvrocks/locks").unwrap();
        assert_eq!(
            store.kv_url("/kvrocks/namespaces/ns"),
            "http://127.0.0.1:8500/v1/kv/kvrocks/namespaces/ns"
        );
        assert_eq!(store.lock_key("leader"), "/kvrocks/locks/leader");
    }
}
