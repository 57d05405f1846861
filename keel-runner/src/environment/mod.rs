//! Values and secrets for pipeline interpolation

mod local;
mod remote;

pub use local::LocalEnvironmentFactory;
pub use remote::RemoteEnvironmentFactory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

/// Resolves named values and secrets for one repository
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    async fn get_value(&self, name: &str) -> Result<String>;

    async fn get_secret(&self, name: &str) -> Result<String>;
}

/// Creates a provider scoped to a search path such as `[project, name]`
pub trait EnvironmentFactory: Send + Sync {
    fn create(&self, search_path: Vec<String>) -> Arc<dyn EnvironmentProvider>;
}
