//! HTTP store client with failover
//!
//! Implements the store contract over the Consul-compatible HTTP API.
//! Blocking reads are expressed as `index`/`wait` query parameters and the
//! `X-Consul-Index` response header.

use std::sync::RwLock;
use std::time::Duration;

use anyhow::anyhow;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::warn;
use turnstile_api::{KvPair, QueryMeta, QueryOptions, SessionEntry};

use crate::config::StoreConfig;
use crate::constants::api_path;
use crate::store::{KvStore, SessionStore};

/// Extra slack added to a blocking request's timeout on top of its wait
/// time, covering the jitter the server may add before answering.
const BLOCKING_GRACE: Duration = Duration::from_secs(16);

/// HTTP store client with failover support
pub struct HttpStore {
    client: Client,
    config: StoreConfig,
    current_server_index: RwLock<usize>,
}

impl HttpStore {
    /// Create a new HTTP store
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        if config.server_addrs.is_empty() {
            return Err(anyhow!("no server addresses configured"));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            config,
            current_server_index: RwLock::new(0),
        })
    }

    /// Get the current server URL
    fn current_server(&self) -> String {
        let index = *self
            .current_server_index
            .read()
            .unwrap_or_else(|e| e.into_inner());
        self.config.server_addrs[index].clone()
    }

    /// Switch to the next server (for failover)
    fn switch_to_next_server(&self) {
        let mut index = self
            .current_server_index
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *index = (*index + 1) % self.config.server_addrs.len();
    }

    /// Run `build` against the current server, rotating through the
    /// configured addresses on transport errors.
    async fn send_with_failover<F>(&self, build: F) -> anyhow::Result<Response>
    where
        F: Fn(&Client, &str) -> reqwest::RequestBuilder,
    {
        let attempts = self.config.server_addrs.len();
        let mut last_error = None;

        for _ in 0..attempts {
            let base = self.current_server();
            match build(&self.client, &base).send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("request to {} failed: {}, switching to next server", base, e);
                    self.switch_to_next_server();
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(Into::into)
            .unwrap_or_else(|| anyhow!("all servers failed")))
    }

    /// Query parameters for a read
    fn query_params(opts: &QueryOptions) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if opts.wait_index > 0 {
            params.push(("index".to_string(), opts.wait_index.to_string()));
            if let Some(wait) = opts.wait_time {
                params.push(("wait".to_string(), format!("{}ms", wait.as_millis())));
            }
        }
        if opts.require_consistent {
            params.push(("consistent".to_string(), String::new()));
        }
        params
    }

    /// Widened per-request timeout for blocking reads
    fn read_timeout(&self, opts: &QueryOptions) -> Duration {
        let base = Duration::from_millis(self.config.read_timeout_ms);
        match opts.wait_time {
            Some(wait) if opts.wait_index > 0 => base + wait + BLOCKING_GRACE,
            _ => base,
        }
    }

    fn parse_meta(response: &Response) -> QueryMeta {
        let last_index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        QueryMeta { last_index }
    }

    async fn error_for_status(response: Response) -> anyhow::Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow!("request failed with status {}: {}", status, body)
    }

    async fn read_bool(response: Response) -> anyhow::Result<bool> {
        if response.status().is_success() {
            Ok(response.json::<bool>().await?)
        } else {
            Err(Self::error_for_status(response).await)
        }
    }

    /// PUT a KV entry with the given extra query parameters
    /// (cas / acquire / release verbs).
    async fn put_with(&self, pair: &KvPair, extra: &[(String, String)]) -> anyhow::Result<bool> {
        let mut params: Vec<(String, String)> = Vec::new();
        if pair.flags != 0 {
            params.push(("flags".to_string(), pair.flags.to_string()));
        }
        params.extend_from_slice(extra);

        let body = pair.value.clone().unwrap_or_default();
        let response = self
            .send_with_failover(|client, base| {
                client
                    .put(format!("{}{}{}", base, api_path::KV, pair.key))
                    .query(&params)
                    .body(body.clone())
            })
            .await?;
        Self::read_bool(response).await
    }
}

#[async_trait::async_trait]
impl KvStore for HttpStore {
    async fn get(
        &self,
        key: &str,
        opts: &QueryOptions,
    ) -> anyhow::Result<(Option<KvPair>, QueryMeta)> {
        let params = Self::query_params(opts);
        let timeout = self.read_timeout(opts);
        let response = self
            .send_with_failover(|client, base| {
                client
                    .get(format!("{}{}{}", base, api_path::KV, key))
                    .query(&params)
                    .timeout(timeout)
            })
            .await?;

        let meta = Self::parse_meta(&response);
        match response.status() {
            StatusCode::NOT_FOUND => Ok((None, meta)),
            status if status.is_success() => {
                let mut pairs: Vec<KvPair> = response.json().await?;
                Ok((pairs.drain(..).next(), meta))
            }
            _ => Err(Self::error_for_status(response).await),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        opts: &QueryOptions,
    ) -> anyhow::Result<(Vec<KvPair>, QueryMeta)> {
        let mut params = Self::query_params(opts);
        params.push(("recurse".to_string(), String::new()));
        let timeout = self.read_timeout(opts);
        let response = self
            .send_with_failover(|client, base| {
                client
                    .get(format!("{}{}{}", base, api_path::KV, prefix))
                    .query(&params)
                    .timeout(timeout)
            })
            .await?;

        let meta = Self::parse_meta(&response);
        match response.status() {
            StatusCode::NOT_FOUND => Ok((Vec::new(), meta)),
            status if status.is_success() => {
                let mut pairs: Vec<KvPair> = response.json().await?;
                pairs.sort_by(|a, b| a.key.cmp(&b.key));
                Ok((pairs, meta))
            }
            _ => Err(Self::error_for_status(response).await),
        }
    }

    async fn put(&self, pair: &KvPair) -> anyhow::Result<bool> {
        self.put_with(pair, &[]).await
    }

    async fn acquire(&self, pair: &KvPair) -> anyhow::Result<bool> {
        let session = pair
            .session
            .clone()
            .ok_or_else(|| anyhow!("acquire requires a session"))?;
        self.put_with(pair, &[("acquire".to_string(), session)])
            .await
    }

    async fn release(&self, pair: &KvPair) -> anyhow::Result<bool> {
        let session = pair
            .session
            .clone()
            .ok_or_else(|| anyhow!("release requires a session"))?;
        self.put_with(pair, &[("release".to_string(), session)])
            .await
    }

    async fn cas(&self, pair: &KvPair) -> anyhow::Result<bool> {
        self.put_with(pair, &[("cas".to_string(), pair.modify_index.to_string())])
            .await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let response = self
            .send_with_failover(|client, base| {
                client.delete(format!("{}{}{}", base, api_path::KV, key))
            })
            .await?;
        Self::read_bool(response).await
    }

    async fn delete_cas(&self, pair: &KvPair) -> anyhow::Result<bool> {
        let params = [("cas".to_string(), pair.modify_index.to_string())];
        let response = self
            .send_with_failover(|client, base| {
                client
                    .delete(format!("{}{}{}", base, api_path::KV, pair.key))
                    .query(&params)
            })
            .await?;
        Self::read_bool(response).await
    }
}

#[derive(Debug, Deserialize)]
struct SessionCreateResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[async_trait::async_trait]
impl SessionStore for HttpStore {
    async fn create(&self, entry: &SessionEntry) -> anyhow::Result<String> {
        let response = self
            .send_with_failover(|client, base| {
                client
                    .put(format!("{}{}", base, api_path::SESSION_CREATE))
                    .json(entry)
            })
            .await?;

        if response.status().is_success() {
            let created: SessionCreateResponse = response.json().await?;
            Ok(created.id)
        } else {
            Err(Self::error_for_status(response).await)
        }
    }

    async fn renew(&self, id: &str) -> anyhow::Result<Option<SessionEntry>> {
        let response = self
            .send_with_failover(|client, base| {
                client.put(format!("{}{}{}", base, api_path::SESSION_RENEW, id))
            })
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let mut entries: Vec<SessionEntry> = response.json().await?;
                Ok(entries.drain(..).next())
            }
            _ => Err(Self::error_for_status(response).await),
        }
    }

    async fn destroy(&self, id: &str) -> anyhow::Result<bool> {
        let response = self
            .send_with_failover(|client, base| {
                client.put(format!("{}{}{}", base, api_path::SESSION_DESTROY, id))
            })
            .await?;
        Self::read_bool(response).await
    }
}
