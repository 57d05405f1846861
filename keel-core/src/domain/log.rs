//! Log domain types

use serde::{Deserialize, Serialize};

/// Which output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
}
