use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings of the shared validation result cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Entries kept before the least recently used one is evicted.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Default for validators that do not set their own cache flag.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
}

impl ValidationConfig {
    pub const DEFAULT_CACHE_SIZE: usize = 1_000;

    /// Validates the validation settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.use_cache && self.cache_size == 0 {
            return Err(ValidationError::invalid(
                "validation.cacheSize",
                "must be greater than 0 when the cache is enabled",
            ));
        }

        Ok(())
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            cache_size: default_cache_size(),
            use_cache: default_use_cache(),
        }
    }
}

fn default_cache_size() -> usize {
    ValidationConfig::DEFAULT_CACHE_SIZE
}

fn default_use_cache() -> bool {
    true
}
