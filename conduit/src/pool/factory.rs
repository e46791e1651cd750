use async_trait::async_trait;

use crate::error::ConduitResult;

/// Creates, checks and disposes the connections of one pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn create(&self) -> ConduitResult<Self::Connection>;

    /// Cheap check run whenever a connection is released. Invalid connections are destroyed
    /// instead of going back to the idle list.
    fn is_valid(&self, _connection: &Self::Connection) -> bool {
        true
    }

    /// Liveness check run periodically on idle connections.
    async fn health_check(&self, connection: &mut Self::Connection) -> bool {
        self.is_valid(connection)
    }

    fn destroy(&self, connection: Self::Connection) {
        drop(connection);
    }
}
