use std::sync::Arc;

use async_trait::async_trait;
use conduit_config::shared::PgConnectionConfig;
use conduit_postgres::pool::connect_pool;
use serde_json::Value as Json;
use sqlx::{PgPool, Row};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ConduitError, ConduitResult};
use crate::execution::ExecutionContext;
use crate::store::base::ContextStore;

/// Connections kept by a store opened with [`PostgresContextStore::connect`].
const MAX_POOL_CONNECTIONS: u32 = 2;

/// Stores execution contexts in `conduit.execution_contexts`.
///
/// The table is created on first use. Each row keeps the full context as `jsonb` next to the
/// columns it is looked up by.
#[derive(Debug, Clone)]
pub struct PostgresContextStore {
    pool: PgPool,
    initialized: Arc<OnceCell<()>>,
}

impl PostgresContextStore {
    /// Creates a new store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            initialized: Default::default(),
        }
    }

    /// Creates a new store with its own pool to the database of `config`.
    pub async fn connect(config: &PgConnectionConfig) -> ConduitResult<Self> {
        let pool = connect_pool(config, 0, MAX_POOL_CONNECTIONS).await?;

        Ok(Self::new(pool))
    }

    async fn ensure_table(&self) -> ConduitResult<()> {
        self.initialized
            .get_or_try_init(|| async {
                info!("creating the execution context table if missing");

                sqlx::query("create schema if not exists conduit")
                    .execute(&self.pool)
                    .await?;
                sqlx::query(
                    r#"
                    create table if not exists conduit.execution_contexts (
                        id uuid primary key,
                        parent_id uuid,
                        status text not null,
                        body jsonb not null,
                        created_at timestamptz not null,
                        updated_at timestamptz not null
                    )
                    "#,
                )
                .execute(&self.pool)
                .await?;
                sqlx::query(
                    "create index if not exists execution_contexts_parent_id_idx on conduit.execution_contexts (parent_id)",
                )
                .execute(&self.pool)
                .await?;

                Ok::<_, ConduitError>(())
            })
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ContextStore for PostgresContextStore {
    async fn save(&self, context: &ExecutionContext) -> ConduitResult<()> {
        self.ensure_table().await?;
        debug!(context_id = %context.id, status = context.status().as_str(), "saving execution context");

        sqlx::query(
            r#"
            insert into conduit.execution_contexts (id, parent_id, status, body, created_at, updated_at)
            values ($1, $2, $3, $4, $5, $6)
            on conflict (id)
            do update set parent_id = excluded.parent_id, status = excluded.status,
                body = excluded.body, updated_at = excluded.updated_at
            "#,
        )
        .bind(context.id)
        .bind(context.parent_id)
        .bind(context.status().as_str())
        .bind(context.to_json()?)
        .bind(context.created_at)
        .bind(context.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load(&self, id: Uuid) -> ConduitResult<Option<ExecutionContext>> {
        self.ensure_table().await?;

        let row = sqlx::query("select body from conduit.execution_contexts where id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let body: Json = row.try_get("body")?;
                Ok(Some(ExecutionContext::from_json(body)?))
            }
            None => Ok(None),
        }
    }

    async fn list_children(&self, parent_id: Uuid) -> ConduitResult<Vec<ExecutionContext>> {
        self.ensure_table().await?;

        let rows = sqlx::query(
            "select body from conduit.execution_contexts where parent_id = $1 order by created_at, id",
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let body: Json = row.try_get("body")?;
                ExecutionContext::from_json(body)
            })
            .collect()
    }

    async fn delete(&self, id: Uuid) -> ConduitResult<bool> {
        self.ensure_table().await?;

        let result = sqlx::query("delete from conduit.execution_contexts where id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
