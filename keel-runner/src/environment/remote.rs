use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::{EnvironmentFactory, EnvironmentProvider};
use crate::remote::Remote;

/// Resolves names through the coordinator's environment search
#[derive(Clone)]
pub struct RemoteEnvironmentFactory {
    remote: Arc<dyn Remote>,
}

impl RemoteEnvironmentFactory {
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        Self { remote }
    }
}

impl EnvironmentFactory for RemoteEnvironmentFactory {
    fn create(&self, search_path: Vec<String>) -> Arc<dyn EnvironmentProvider> {
        Arc::new(RemoteEnvironment {
            remote: self.remote.clone(),
            search_path,
        })
    }
}

struct RemoteEnvironment {
    remote: Arc<dyn Remote>,
    search_path: Vec<String>,
}

#[async_trait]
impl EnvironmentProvider for RemoteEnvironment {
    async fn get_value(&self, name: &str) -> Result<String> {
        self.remote.search_for_value(&self.search_path, name).await
    }

    async fn get_secret(&self, name: &str) -> Result<String> {
        self.remote.search_for_secret(&self.search_path, name).await
    }
}
