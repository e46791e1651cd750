use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ConduitResult;
use crate::execution::ExecutionContext;

/// Persists execution contexts in their self-describing JSON form.
///
/// Saving a context that already exists replaces it.
#[async_trait]
pub trait ContextStore: Send + Sync + fmt::Debug {
    async fn save(&self, context: &ExecutionContext) -> ConduitResult<()>;

    async fn load(&self, id: Uuid) -> ConduitResult<Option<ExecutionContext>>;

    /// Children of `parent_id`, oldest first.
    async fn list_children(&self, parent_id: Uuid) -> ConduitResult<Vec<ExecutionContext>>;

    /// Returns whether a context was deleted.
    async fn delete(&self, id: Uuid) -> ConduitResult<bool>;
}
