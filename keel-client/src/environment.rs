//! Environment lookup endpoints

use crate::CoordinatorClient;
use crate::error::Result;
use keel_core::dto::environment::{SearchRequest, SearchResponse};

impl CoordinatorClient {
    /// Search for a plain value along the given search path
    ///
    /// # Arguments
    /// * `search_path` - Scopes to search, most specific first (e.g. `[project, repository]`)
    /// * `name` - Name of the variable
    pub async fn search_for_value(&self, search_path: &[String], name: &str) -> Result<String> {
        self.search("/api/runner/environment/values/search", search_path, name)
            .await
    }

    /// Search for a secret along the given search path
    pub async fn search_for_secret(&self, search_path: &[String], name: &str) -> Result<String> {
        self.search("/api/runner/environment/secrets/search", search_path, name)
            .await
    }

    async fn search(&self, path: &str, search_path: &[String], name: &str) -> Result<String> {
        let response = self
            .post(path)
            .json(&SearchRequest {
                search_path: search_path.to_vec(),
                name: name.to_string(),
            })
            .send()
            .await?;

        let found: SearchResponse = self.handle_response(response).await?;
        Ok(found.value)
    }
}
