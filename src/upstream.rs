use crate::constants::{
    CHAT_TIMEOUT_SECS, CONNECT_TIMEOUT_SECS, SEARCH_TIMEOUT_SECS, STREAM_TIMEOUT_SECS,
    TCG_APP_VERSION,
};
use crate::hardening::RetryPolicy;
use crate::types::{AgentMode, ObservedError, RelayError, Result};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Agent base URLs, picked per request from the client's `appVersion`, plus
/// the image search service.
#[derive(Debug, Clone)]
pub struct AgentEndpoints {
    pub default: String,
    pub tcg: Option<String>,
    pub search: Option<String>,
}

impl AgentEndpoints {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            tcg: None,
            search: None,
        }
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn from_env() -> Option<Self> {
        let default = non_empty_env("AGENT_ENDPOINT")?;
        Some(Self {
            default,
            tcg: non_empty_env("AGENT_TCG_ENDPOINT"),
            search: non_empty_env("SEARCH_ENDPOINT"),
        })
    }

    pub fn resolve(&self, app_version: Option<&str>) -> &str {
        match (app_version, &self.tcg) {
            (Some(v), Some(tcg)) if v.eq_ignore_ascii_case(TCG_APP_VERSION) => tcg,
            _ => &self.default,
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub stream_timeout: Duration,
    pub chat_timeout: Duration,
    pub search_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            stream_timeout: Duration::from_secs(STREAM_TIMEOUT_SECS),
            chat_timeout: Duration::from_secs(CHAT_TIMEOUT_SECS),
            search_timeout: Duration::from_secs(SEARCH_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            max_attempts: 3,
            retry_base_delay_ms: 250,
        }
    }
}

/// HTTP client for the agent service. One instance is built at start-up and
/// shared; timeouts and retry behaviour come from [`UpstreamConfig`].
///
/// Each call has one time budget that covers all of its retry attempts and
/// their backoff.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    retry: RetryPolicy,
    stream_timeout: Duration,
    chat_timeout: Duration,
    search_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &UpstreamConfig) -> Self {
        Self {
            client,
            retry: RetryPolicy::new(config.max_attempts, config.retry_base_delay_ms),
            stream_timeout: config.stream_timeout,
            chat_timeout: config.chat_timeout,
            search_timeout: config.search_timeout,
        }
    }

    /// Budget for each wait on the streaming path: response headers and
    /// every subsequent chunk.
    pub fn stream_timeout(&self) -> Duration {
        self.stream_timeout
    }

    /// Opens `POST {endpoint}/{chat|ops}/stream`. Any status other than 200
    /// comes back as [`RelayError::Upstream`] once retries are spent.
    pub async fn open_stream(
        &self,
        endpoint: &str,
        mode: AgentMode,
        body: &Value,
    ) -> Result<reqwest::Response> {
        let url = join_url(endpoint, mode.stream_path());
        let client = &self.client;
        let timeout = self.stream_timeout;
        let target = url.as_str();

        tracing::info!("[⚙️  -> ☁️ ] POST {} ({})", target, mode);
        within(
            timeout,
            self.retry.execute_with_retry(move || async move {
                let response = client
                    .post(target)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| classify(e, timeout))?;
                check_status(response).await
            }),
        )
        .await
    }

    /// Synchronous `POST {endpoint}/chat`; the reply must be JSON.
    pub async fn chat(&self, endpoint: &str, body: &Value) -> Result<Value> {
        self.post_json(&join_url(endpoint, "chat"), body, self.chat_timeout)
            .await
    }

    /// `POST {endpoint}/search/` on the image similarity service.
    pub async fn search(&self, endpoint: &str, body: &Value) -> Result<Value> {
        self.post_json(&join_url(endpoint, "search/"), body, self.search_timeout)
            .await
    }

    async fn post_json(&self, url: &str, body: &Value, timeout: Duration) -> Result<Value> {
        let client = &self.client;

        tracing::info!("[⚙️  -> ☁️ ] POST {}", url);
        within(
            timeout,
            self.retry.execute_with_retry(move || async move {
                let response = client
                    .post(url)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| classify(e, timeout))?;
                let response = check_status(response).await?;

                let is_json = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .is_some_and(|v| v.starts_with("application/json"));
                if !is_json {
                    return Err(RelayError::Upstream(
                        response.status(),
                        "Unsupported content type".to_string(),
                    )
                    .into());
                }

                let value: Value = response.json().await.map_err(|e| classify(e, timeout))?;
                Ok::<Value, ObservedError>(value)
            }),
        )
        .await
    }
}

/// Runs `call`, retries included, inside a single `timeout`.
async fn within<T>(timeout: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::UpstreamTimeout(timeout).into()),
    }
}

fn join_url(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path)
}

fn classify(err: reqwest::Error, timeout: Duration) -> RelayError {
    if err.is_timeout() {
        RelayError::UpstreamTimeout(timeout)
    } else {
        RelayError::Network(err)
    }
}

/// Only a plain 200 counts as an answer.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    tracing::info!("[☁️  -> ⚙️ ] Status: {}", status);
    if status == reqwest::StatusCode::OK {
        return Ok(response);
    }

    let error_body = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Failed to read error body: {}", e);
            format!("Upstream error (body unreadable): {}", e)
        }
    };
    tracing::error!("[☁️  -> ⚙️ ] Upstream Error ({}): {}", status, error_body);
    Err(RelayError::Upstream(status, error_body).into())
}
