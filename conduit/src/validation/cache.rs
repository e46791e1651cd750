use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use conduit_config::shared::ValidationConfig;
use indexmap::IndexMap;
use metrics::counter;
use serde::Serialize;
use serde_json::Value as Json;

use crate::metrics::{
    CONDUIT_VALIDATION_CACHE_HITS_TOTAL, CONDUIT_VALIDATION_CACHE_MISSES_TOTAL,
};
use crate::validation::result::ValidationResult;
use crate::validation::validator::{ValidationContext, Validator};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    entries: Mutex<IndexMap<u64, ValidationResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Least recently used cache of validation results, shared across runs.
///
/// Entries are keyed by a hash of the validator name, the strictness of the call and the
/// document. The most recently used entry sits at the end of the map; eviction removes the
/// front.
#[derive(Debug, Clone)]
pub struct ValidationCache {
    inner: Arc<Inner>,
}

impl ValidationCache {
    /// Creates a new cache holding up to `capacity` results.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                entries: Mutex::new(IndexMap::new()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a new cache sized from `config`.
    pub fn from_config(config: &ValidationConfig) -> Self {
        Self::new(config.cache_size)
    }

    fn lock_entries(&self) -> MutexGuard<'_, IndexMap<u64, ValidationResult>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cache key of validating `data` with `validator` in `context`.
    pub fn key(validator: &str, data: &Json, context: &ValidationContext) -> u64 {
        let mut hasher = DefaultHasher::new();
        validator.hash(&mut hasher);
        context.strict.hash(&mut hasher);
        context.path.hash(&mut hasher);
        data.to_string().hash(&mut hasher);
        hasher.finish()
    }

    /// Returns the cached result of `key`, counting a hit or a miss.
    pub fn get(&self, key: u64) -> Option<ValidationResult> {
        let mut entries = self.lock_entries();
        let found = entries.shift_remove(&key);
        match found {
            Some(result) => {
                entries.insert(key, result.clone());
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                counter!(CONDUIT_VALIDATION_CACHE_HITS_TOTAL).increment(1);
                Some(result)
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                counter!(CONDUIT_VALIDATION_CACHE_MISSES_TOTAL).increment(1);
                None
            }
        }
    }

    /// Caches `result` under `key`, evicting the least recently used entry when full.
    pub fn insert(&self, key: u64, result: ValidationResult) {
        let mut entries = self.lock_entries();
        entries.shift_remove(&key);
        entries.insert(key, result);
        while entries.len() > self.inner.capacity {
            entries.shift_remove_index(0);
        }
    }

    /// Validates through the cache. With `use_cache` unset the validator always runs and the
    /// cache is left untouched.
    pub fn validate(
        &self,
        validator: &dyn Validator,
        data: &Json,
        context: &ValidationContext,
        use_cache: bool,
    ) -> ValidationResult {
        if !use_cache {
            return validator.validate(data, context);
        }

        let key = Self::key(validator.name(), data, context);
        if let Some(result) = self.get(key) {
            return result;
        }

        let result = validator.validate(data, context);
        self.insert(key, result.clone());

        result
    }

    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    /// Returns the hit and miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            size: self.lock_entries().len(),
            capacity: self.inner.capacity,
        }
    }
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::from_config(&ValidationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::validation::schema::JsonType;
    use crate::validation::type_check::TypeValidator;

    #[test]
    fn caches_results_and_counts_lookups() {
        let cache = ValidationCache::new(10);
        let validator = TypeValidator::new("int", JsonType::Integer);
        let context = ValidationContext::default();

        assert!(cache.validate(&validator, &json!(1), &context, true).valid);
        assert!(cache.validate(&validator, &json!(1), &context, true).valid);
        assert!(!cache.validate(&validator, &json!("x"), &context, true).valid);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.size), (1, 2, 2));
        assert_eq!(validator.metrics().validations, 2);
    }

    #[test]
    fn evicts_the_least_recently_used_entry() {
        let cache = ValidationCache::new(2);
        cache.insert(1, ValidationResult::valid());
        cache.insert(2, ValidationResult::valid());
        assert!(cache.get(1).is_some());

        cache.insert(3, ValidationResult::valid());

        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
    }

    #[test]
    fn bypassing_the_cache_leaves_it_untouched() {
        let cache = ValidationCache::new(2);
        let validator = TypeValidator::new("int", JsonType::Integer);

        cache.validate(&validator, &json!(1), &ValidationContext::default(), false);

        assert_eq!(cache.stats().size, 0);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn keys_depend_on_strictness() {
        let data = json!({"a": 1});
        assert_ne!(
            ValidationCache::key("v", &data, &ValidationContext::default()),
            ValidationCache::key("v", &data, &ValidationContext::strict())
        );
    }
}
