//! Keel HTTP Client
//!
//! A simple, type-safe HTTP client for the runner-facing endpoints of the Keel
//! coordinator.
//!
//! # Example
//!
//! ```no_run
//! use keel_client::CoordinatorClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel_client::ClientError> {
//!     let client = CoordinatorClient::new("http://localhost:8080").with_token("secret");
//!
//!     if let Some(job) = client.get_next_available_job().await? {
//!         println!("Claimed job: {}", job.id);
//!     }
//!     Ok(())
//! }
//! ```

mod containers;
mod environment;
pub mod error;
mod jobs;

pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;

/// HTTP client for the Keel coordinator API
///
/// Methods are grouped by concern:
/// - Job lifecycle (claim next job, set state, cancellation check, job logs)
/// - Stage and container progress reporting
/// - Environment value and secret lookup
#[derive(Debug, Clone)]
pub struct CoordinatorClient {
    /// Base URL of the coordinator (e.g., "http://localhost:8080")
    base_url: String,
    /// Bearer token sent with every request, if any
    token: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl CoordinatorClient {
    /// Create a new coordinator client
    ///
    /// # Example
    /// ```
    /// use keel_client::CoordinatorClient;
    ///
    /// let client = CoordinatorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a new coordinator client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        }
    }

    /// Authenticate every request with the given bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Get the base URL of the coordinator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    fn put(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.put(self.url(path)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        debug!("Coordinator responded {} for {}", status, response.url());

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}
