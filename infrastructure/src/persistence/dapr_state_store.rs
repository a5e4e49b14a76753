// ./infrastructure/src/persistence/dapr_state_store.rs
use application::{ETag, StateStore, StateStoreError, Versioned};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url, header};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

const API_VERSION: &str = "v1.0";

/// One entry of a Dapr bulk save request.
#[derive(Serialize, Debug)]
struct StateItem<'a> {
    key: &'a str,
    value: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<StateOptions>,
}

#[derive(Serialize, Debug)]
struct StateOptions {
    concurrency: &'static str,
}

/// State store reached through a Dapr sidecar's HTTP state API.
///
/// Values are written as JSON strings, matching what the Dapr SDKs do for
/// string state. Version tokens come from the `ETag` response header. Note
/// that Dapr treats a save without an ETag as unconditional, so a
/// compare-and-swap against a key that does not exist yet cannot detect a
/// racing creator.
#[derive(Debug, Clone)]
pub struct DaprStateStore {
    client: Client,
    endpoint: Url,
}

impl DaprStateStore {
    /// `endpoint` is the sidecar base URL, e.g. `http://localhost:3500`.
    pub fn new(endpoint: &str) -> Result<Self, StateStoreError> {
        Self::with_client(Client::new(), endpoint)
    }

    pub fn with_client(client: Client, endpoint: &str) -> Result<Self, StateStoreError> {
        let parsed = Url::parse(endpoint).map_err(|e| {
            StateStoreError::Protocol(format!("Invalid Dapr endpoint '{}': {}", endpoint, e))
        })?;
        if parsed.cannot_be_a_base() {
            return Err(StateStoreError::Protocol(format!(
                "Dapr endpoint '{}' cannot be used as a base URL",
                endpoint
            )));
        }
        Ok(Self {
            client,
            endpoint: parsed,
        })
    }

    /// `{endpoint}/v1.0/state/{store}[/{key}]`, with segments percent-encoded.
    fn state_url(&self, store_name: &str, key: Option<&str>) -> Result<Url, StateStoreError> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                StateStoreError::Protocol("Dapr endpoint cannot carry a path".to_string())
            })?;
            segments
                .pop_if_empty()
                .extend([API_VERSION, "state", store_name]);
            if let Some(key) = key {
                segments.push(key);
            }
        }
        Ok(url)
    }

    fn unavailable(store_name: &str, error: reqwest::Error) -> StateStoreError {
        StateStoreError::Unavailable {
            store: store_name.to_string(),
            reason: error.to_string(),
        }
    }

    async fn rejected(key: &str, response: Response) -> StateStoreError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(key = %key, status = %status, "Dapr state API rejected request");
        StateStoreError::Rejected {
            key: key.to_string(),
            reason: format!("HTTP {}: {}", status, body.trim()),
        }
    }

    async fn fetch(
        &self,
        store_name: &str,
        key: &str,
    ) -> Result<Option<Versioned>, StateStoreError> {
        let url = self.state_url(store_name, Some(key))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::unavailable(store_name, e))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(ETag::new);
                let body = response
                    .text()
                    .await
                    .map_err(|e| Self::unavailable(store_name, e))?;
                Ok(decode_state_body(&body).map(|value| Versioned { value, etag }))
            }
            _ => Err(Self::rejected(key, response).await),
        }
    }

    async fn save(
        &self,
        store_name: &str,
        item: StateItem<'_>,
    ) -> Result<Response, StateStoreError> {
        let url = self.state_url(store_name, None)?;
        self.client
            .post(url)
            .json(&[item])
            .send()
            .await
            .map_err(|e| Self::unavailable(store_name, e))
    }
}

/// Turns a state API response body into the stored string. String state comes
/// back JSON-encoded; anything else is passed through as raw text.
fn decode_state_body(body: &str) -> Option<String> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(body) {
        Ok(Value::String(value)) => Some(value),
        Ok(Value::Null) => None,
        _ => Some(body.to_string()),
    }
}

#[async_trait]
impl StateStore for DaprStateStore {
    #[instrument(skip(self))]
    async fn get(&self, store_name: &str, key: &str) -> Result<Option<String>, StateStoreError> {
        debug!("Getting state from Dapr sidecar");
        Ok(self
            .fetch(store_name, key)
            .await?
            .map(|versioned| versioned.value))
    }

    #[instrument(skip(self, value))]
    async fn put(&self, store_name: &str, key: &str, value: &str) -> Result<(), StateStoreError> {
        debug!(bytes = value.len(), "Saving state to Dapr sidecar");
        let item = StateItem {
            key,
            value,
            etag: None,
            options: None,
        };
        let response = self.save(store_name, item).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::rejected(key, response).await)
        }
    }

    #[instrument(skip(self))]
    async fn get_with_etag(
        &self,
        store_name: &str,
        key: &str,
    ) -> Result<Option<Versioned>, StateStoreError> {
        debug!("Getting versioned state from Dapr sidecar");
        self.fetch(store_name, key).await
    }

    #[instrument(skip(self, value))]
    async fn try_put(
        &self,
        store_name: &str,
        key: &str,
        value: &str,
        expected: Option<&ETag>,
    ) -> Result<bool, StateStoreError> {
        let item = StateItem {
            key,
            value,
            etag: expected.map(ETag::as_str),
            options: Some(StateOptions {
                concurrency: "first-write",
            }),
        };
        let response = self.save(store_name, item).await?;
        match response.status() {
            StatusCode::CONFLICT => {
                debug!("Dapr reported an ETag mismatch");
                Ok(false)
            }
            status if status.is_success() => Ok(true),
            _ => Err(Self::rejected(key, response).await),
        }
    }
}
