use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::ConduitResult;
use crate::execution::ExecutionContext;
use crate::store::base::ContextStore;

/// Keeps execution contexts in memory. Contexts are lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryContextStore {
    contexts: Arc<Mutex<HashMap<Uuid, ExecutionContext>>>,
}

impl MemoryContextStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored contexts.
    pub async fn len(&self) -> usize {
        self.contexts.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.contexts.lock().await.is_empty()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn save(&self, context: &ExecutionContext) -> ConduitResult<()> {
        let mut contexts = self.contexts.lock().await;
        contexts.insert(context.id, context.clone());

        Ok(())
    }

    async fn load(&self, id: Uuid) -> ConduitResult<Option<ExecutionContext>> {
        let contexts = self.contexts.lock().await;

        Ok(contexts.get(&id).cloned())
    }

    async fn list_children(&self, parent_id: Uuid) -> ConduitResult<Vec<ExecutionContext>> {
        let contexts = self.contexts.lock().await;
        let mut children: Vec<ExecutionContext> = contexts
            .values()
            .filter(|context| context.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|context| context.created_at);

        Ok(children)
    }

    async fn delete(&self, id: Uuid) -> ConduitResult<bool> {
        let mut contexts = self.contexts.lock().await;

        Ok(contexts.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use conduit_config::shared::ExecutionConfig;

    use super::*;
    use crate::execution::ChildOptions;

    #[tokio::test]
    async fn saves_loads_and_lists_children() {
        let store = MemoryContextStore::new();
        let parent = ExecutionContext::new("parent", ExecutionConfig::default());
        let first = parent.child(ChildOptions::default());
        let second = parent.child(ChildOptions::default());

        for context in [&parent, &second, &first] {
            store.save(context).await.unwrap();
        }

        assert_eq!(store.load(parent.id).await.unwrap(), Some(parent.clone()));
        let children = store.list_children(parent.id).await.unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|child| child.parent_id == Some(parent.id)));

        assert!(store.delete(first.id).await.unwrap());
        assert!(!store.delete(first.id).await.unwrap());
        assert_eq!(store.len().await, 2);
    }
}
