//! Environment DTOs for runner/coordinator communication

use serde::{Deserialize, Serialize};

/// Looks up a named value or secret along a search path
///
/// The coordinator walks `search_path` from the most specific scope to the
/// least specific one and returns the first match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub search_path: Vec<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub value: String,
}
