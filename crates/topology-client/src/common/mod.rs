//! Common utilities for the heketi API client
//!
//! Provides request signing, status handling and polling of heketi's
//! asynchronous operation queue.

pub mod auth;

use crate::error::TopologyError;
use reqwest::header::LOCATION;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// HTTP client wrapper with request signing
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    user: String,
    key: Option<String>,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl HttpClient {
    /// Create a new HTTP client wrapper.
    ///
    /// `key` is `None` when the topology manager runs without authentication.
    pub fn new(client: Client, base_url: String, user: String, key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            user,
            key,
            poll_interval: Duration::from_millis(500),
            poll_timeout: Duration::from_secs(300),
        }
    }

    /// Override how asynchronous operations are polled.
    #[must_use]
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build a full URL from a path
    pub fn build_url(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// Send a signed request and return the raw response.
    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Response, TopologyError> {
        let url = self.build_url(path);
        debug!("{} {}", method, url);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Accept", "application/json");

        if let Some(key) = &self.key {
            let signed_path = reqwest::Url::parse(&url)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| path.to_string());
            request = request.header(
                "Authorization",
                auth::bearer_token(&self.user, key, method.as_str(), &signed_path)?,
            );
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(TopologyError::Http)
    }

    /// Map a non-success response onto an error.
    async fn error_for(path: &str, response: Response) -> TopologyError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => TopologyError::NotFound(format!("{path} - {}", body.trim())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                TopologyError::Authentication(format!("{path}: {status} - {}", body.trim()))
            }
            _ => TopologyError::Api(format!("{path} failed: {status} - {}", body.trim())),
        }
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, TopologyError> {
        let response = self.send::<()>(Method::GET, path, None).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(path, response).await);
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(TopologyError::Serialization)
    }

    /// Make a synchronous POST request returning a JSON body
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, TopologyError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        if !response.status().is_success() {
            return Err(Self::error_for(path, response).await);
        }
        let text = response.text().await?;
        serde_json::from_str(&text).map_err(TopologyError::Serialization)
    }

    /// Make a POST request that heketi answers with `202 Accepted`.
    ///
    /// Follows the operation queue until the operation finishes. Returns the
    /// path of the created resource when heketi redirects to one.
    pub async fn post_async<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<String>, TopologyError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        match response.status() {
            StatusCode::ACCEPTED => {
                let location = Self::location(&response).ok_or_else(|| {
                    TopologyError::Api(format!("{path}: 202 without Location header"))
                })?;
                self.wait_for_operation(&location).await
            }
            status if status.is_success() => Ok(None),
            _ => Err(Self::error_for(path, response).await),
        }
    }

    /// Poll a queued operation until it completes or the poll budget runs out.
    async fn wait_for_operation(&self, location: &str) -> Result<Option<String>, TopologyError> {
        let deadline = Instant::now() + self.poll_timeout;

        loop {
            let response = self.send::<()>(Method::GET, location, None).await?;
            match response.status() {
                StatusCode::SEE_OTHER => return Ok(Self::location(&response)),
                StatusCode::NO_CONTENT => return Ok(None),
                StatusCode::OK => {
                    debug!("Operation {} still pending", location);
                }
                _ => return Err(Self::error_for(location, response).await),
            }

            if Instant::now() >= deadline {
                return Err(TopologyError::Timeout(location.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn location(response: &Response) -> Option<String> {
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}
