//! Configuration for the undo engine.

use serde::{Deserialize, Serialize};

/// Default number of history entries kept per document.
const DEFAULT_MAX_UNDO_LEVEL: usize = 200;

/// Configuration for the undo engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Max history entries per document; oldest entries are evicted when
    /// the limit is exceeded.
    pub max_undo_level: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_undo_level: DEFAULT_MAX_UNDO_LEVEL,
        }
    }
}
