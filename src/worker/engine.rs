//! Client for the accessory engine's local HTTP API.

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EngineClient {
    base: String,
    http: reqwest::Client,
}

impl EngineClient {
    pub fn new(port: u16) -> anyhow::Result<Self> {
        Self::with_base(format!("http://127.0.0.1:{port}"))
    }

    pub fn with_base(base: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("bridgehub/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub async fn status(&self) -> Option<Value> {
        self.get("/api/status").await
    }

    pub async fn accessories(&self) -> Option<Value> {
        self.get("/api/accessories").await
    }

    pub async fn accessory(&self, id: &str) -> Option<Value> {
        self.get(&format!("/api/accessory/{id}")).await
    }

    /// Apply a state change; the engine answers with the accessory's new state.
    pub async fn set(&self, id: &str, state: &Value) -> Option<Value> {
        let url = format!("{}/api/accessory/{id}", self.base);
        let response = self.http.put(&url).json(state).send().await;
        decode(&url, response).await
    }

    async fn get(&self, path: &str) -> Option<Value> {
        let url = format!("{}{}", self.base, path);
        let response = self.http.get(&url).send().await;
        decode(&url, response).await
    }
}

/// Every failure collapses to `None`.
async fn decode(url: &str, response: reqwest::Result<reqwest::Response>) -> Option<Value> {
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            debug!(url, "Engine unreachable: {}", e);
            return None;
        }
    };
    if !response.status().is_success() {
        debug!(url, status = %response.status(), "Engine refused request");
        return None;
    }
    match response.json::<Value>().await {
        Ok(Value::Null) => None,
        Ok(value) => Some(value),
        Err(e) => {
            debug!(url, "Engine sent unreadable body: {}", e);
            None
        }
    }
}
