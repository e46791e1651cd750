use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::types::Schema;

/// Time a discovered schema stays fresh.
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct Entry {
    schema: Arc<Schema>,
    cached_at: Instant,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<(String, String), Entry>,
}

/// Discovered schemas of one adapter, keyed by namespace and name.
#[derive(Debug, Clone)]
pub struct SchemaCache {
    ttl: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl SchemaCache {
    /// Creates a new empty cache whose entries expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::new(),
            })),
        }
    }

    /// Returns the cached schema if it has not expired. Expired entries are evicted.
    pub async fn get(&self, namespace: &str, name: &str) -> Option<Arc<Schema>> {
        let mut inner = self.inner.lock().await;
        let key = (namespace.to_string(), name.to_string());

        match inner.entries.get(&key) {
            Some(entry) if entry.cached_at.elapsed() < self.ttl => Some(Arc::clone(&entry.schema)),
            Some(_) => {
                inner.entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Caches `schema`, replacing a previous entry, and returns the shared copy.
    pub async fn insert(&self, schema: Schema) -> Arc<Schema> {
        let schema = Arc::new(schema);
        let mut inner = self.inner.lock().await;
        inner.entries.insert(
            (schema.namespace.clone(), schema.name.clone()),
            Entry {
                schema: Arc::clone(&schema),
                cached_at: Instant::now(),
            },
        );

        schema
    }

    /// Caches every schema of `schemas`.
    pub async fn insert_all(&self, schemas: &[Schema]) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        for schema in schemas {
            inner.entries.insert(
                (schema.namespace.clone(), schema.name.clone()),
                Entry {
                    schema: Arc::new(schema.clone()),
                    cached_at: now,
                },
            );
        }
    }

    /// Removes the entry of one container.
    pub async fn invalidate(&self, namespace: &str, name: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .entries
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Removes every entry.
    pub async fn clear(&self) {
        self.inner.lock().await.entries.clear();
    }

    /// Returns the number of cached entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMA_TTL)
    }
}
