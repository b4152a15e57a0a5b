use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, Method, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;

use crate::{SandhiveError, SandhiveResult};

use super::{KvEntry, KvStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const CONSUL_TOKEN_HEADER: &str = "X-Consul-Token";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`KvStore`] backed by the Consul KV HTTP API.
///
/// Transient failures are retried by the client. A retried `cas=0` create can therefore observe
/// its own earlier write and report `false`; callers re-read the key to tell the two apart.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    client: ClientWithMiddleware,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConsulEntry {
    key: String,
    value: Option<String>,
    modify_index: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ConsulKv {
    /// Creates a client for the agent at `base_url`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, key: &str) -> RequestBuilder {
        let url = format!("{}/v1/kv/{}", self.base_url, key);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.header(CONSUL_TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn bool_response(response: reqwest::Response) -> SandhiveResult<bool> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SandhiveError::KvStore(format!("{status}: {}", body.trim())));
        }

        Ok(body.trim() == "true")
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn decode_entry(entry: ConsulEntry) -> SandhiveResult<KvEntry> {
    let value = match entry.value {
        Some(encoded) => {
            let bytes = STANDARD
                .decode(encoded)
                .map_err(|e| SandhiveError::KvStore(format!("bad value for {}: {e}", entry.key)))?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
        None => String::new(),
    };

    Ok(KvEntry {
        key: entry.key,
        value,
        modify_index: entry.modify_index,
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl KvStore for ConsulKv {
    async fn create_cas(&self, key: &str, value: &str) -> SandhiveResult<bool> {
        let response = self
            .request(Method::PUT, key)
            .query(&[("cas", "0")])
            .body(value.to_string())
            .send()
            .await?;

        Self::bool_response(response).await
    }

    async fn get(&self, key: &str) -> SandhiveResult<Option<KvEntry>> {
        let response = self.request(Method::GET, key).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SandhiveError::KvStore(format!(
                "get {key}: {}",
                response.status()
            )));
        }

        let entries: Vec<ConsulEntry> = response.json().await?;
        match entries.into_iter().find(|e| e.key == key) {
            Some(entry) => decode_entry(entry).map(Some),
            None => Ok(None),
        }
    }

    async fn delete_cas(&self, key: &str, modify_index: u64) -> SandhiveResult<bool> {
        let response = self
            .request(Method::DELETE, key)
            .query(&[("cas", modify_index.to_string())])
            .send()
            .await?;

        Self::bool_response(response).await
    }

    async fn list_keys(&self, prefix: &str) -> SandhiveResult<Vec<String>> {
        let response = self
            .request(Method::GET, prefix)
            .query(&[("keys", "")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(SandhiveError::KvStore(format!(
                "list {prefix}: {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_entry() -> anyhow::Result<()> {
        let raw = r#"[{"LockIndex":0,"Key":"abcdefgh/42","Flags":0,"Value":"c2J4LTE=","CreateIndex":7,"ModifyIndex":9}]"#;
        let mut entries: Vec<ConsulEntry> = serde_json::from_str(raw)?;
        let entry = decode_entry(entries.remove(0))?;

        assert_eq!(entry.key, "abcdefgh/42");
        assert_eq!(entry.value, "sbx-1");
        assert_eq!(entry.modify_index, 9);
        Ok(())
    }

    #[test]
    fn test_decode_entry_without_value() -> anyhow::Result<()> {
        let raw = r#"{"Key":"n/1","Value":null,"ModifyIndex":3}"#;
        let entry = decode_entry(serde_json::from_str(raw)?)?;
        assert!(entry.value.is_empty());
        Ok(())
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let kv = ConsulKv::new("http://127.0.0.1:8500/", None);
        assert_eq!(kv.base_url, "http://127.0.0.1:8500");
    }
}
