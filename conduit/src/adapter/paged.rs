use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use crate::adapter::base::Adapter;
use crate::adapter::options::{OrderBy, ReadOptions};
use crate::error::ConduitResult;
use crate::types::{Record, Schema};

/// Page size shared between a paged reader and whoever tunes it.
///
/// Changes apply from the next page on.
#[derive(Debug, Clone)]
pub struct PageSize(Arc<AtomicUsize>);

impl PageSize {
    /// Creates a new page size, never below one.
    pub fn new(size: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(size.max(1))))
    }

    /// Returns the current page size.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, size: usize) {
        self.0.store(size.max(1), Ordering::Relaxed);
    }
}

struct Paging {
    adapter: Arc<dyn Adapter>,
    schema: Schema,
    options: ReadOptions,
    page_size: PageSize,
    offset: u64,
    remaining: Option<u64>,
    single_page: bool,
    exhausted: bool,
}

/// Reads a container page by page with limit and offset.
///
/// The `limit` and `offset` of `options` bound the whole read. Without an explicit order, pages
/// are ordered by primary key so that they do not overlap. A container with neither an order
/// nor a primary key has no stable row order, so it is read in a single page.
pub fn read_paged(
    adapter: Arc<dyn Adapter>,
    schema: Schema,
    mut options: ReadOptions,
    page_size: PageSize,
) -> BoxStream<'static, ConduitResult<Vec<Record>>> {
    if options.order_by.is_empty() {
        options.order_by = schema.primary_keys.iter().map(OrderBy::asc).collect();
    }
    let single_page = options.order_by.is_empty();
    if single_page {
        debug!(
            namespace = %schema.namespace,
            name = %schema.name,
            "no stable row order, reading without paging"
        );
    }

    let paging = Paging {
        adapter,
        offset: options.offset.unwrap_or(0),
        remaining: options.limit,
        schema,
        options,
        page_size,
        single_page,
        exhausted: false,
    };

    stream::try_unfold(paging, |mut paging| async move {
        if paging.exhausted {
            return Ok(None);
        }

        let limit = if paging.single_page {
            paging.remaining
        } else {
            let size = paging.page_size.get() as u64;
            Some(paging.remaining.map_or(size, |remaining| size.min(remaining)))
        };
        if limit == Some(0) {
            return Ok(None);
        }

        let options = ReadOptions {
            limit,
            offset: Some(paging.offset),
            include_total_count: false,
            ..paging.options.clone()
        };
        let result = paging.adapter.read_data(&paging.schema, &options).await?;

        let fetched = result.rows.len() as u64;
        debug!(offset = paging.offset, fetched, "read page");
        paging.offset += fetched;
        if let Some(remaining) = paging.remaining.as_mut() {
            *remaining -= fetched.min(*remaining);
        }
        if paging.single_page || limit.is_some_and(|limit| fetched < limit) {
            paging.exhausted = true;
        }
        if fetched == 0 {
            return Ok(None);
        }

        Ok(Some((result.rows, paging)))
    })
    .boxed()
}

/// Counts the records matching the filters of `options`.
pub async fn count_rows(
    adapter: &dyn Adapter,
    schema: &Schema,
    options: &ReadOptions,
) -> ConduitResult<Option<u64>> {
    let options = ReadOptions {
        columns: Vec::new(),
        order_by: Vec::new(),
        limit: Some(0),
        offset: None,
        include_total_count: true,
        ..options.clone()
    };

    let result = adapter.read_data(schema, &options).await?;
    Ok(result.total_count)
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::adapter::MemoryAdapter;
    use crate::events::EventBus;
    use crate::types::{Column, SchemaKind, UniversalType, Value, record_from_pairs};

    async fn adapter(rows: i64) -> (Arc<MemoryAdapter>, Schema) {
        let schema = Schema::new(
            "mem",
            "public",
            "numbers",
            SchemaKind::Table,
            vec![Column::new("n", 1, "int8", UniversalType::Long).with_primary_key()],
        );
        let adapter = Arc::new(MemoryAdapter::new("mem", EventBus::default()));
        adapter.create_table(schema.clone()).await;
        // Stored in reverse so that paging has to rely on the key order.
        adapter
            .insert_rows(
                "public",
                "numbers",
                (0..rows)
                    .rev()
                    .map(|n| record_from_pairs([("n", Value::Long(n))]))
                    .collect(),
            )
            .await
            .unwrap();
        adapter.connect().await.unwrap();

        (adapter, schema)
    }

    #[tokio::test]
    async fn pages_follow_the_shared_page_size() {
        let (adapter, schema) = adapter(10).await;
        let page_size = PageSize::new(4);

        let mut pages = read_paged(adapter, schema, ReadOptions::default(), page_size.clone());
        let first = pages.try_next().await.unwrap().unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0]["n"], Value::Long(0));

        page_size.set(5);
        let second = pages.try_next().await.unwrap().unwrap();
        assert_eq!(second.len(), 5);
        assert_eq!(second[0]["n"], Value::Long(4));

        let rest: Vec<Vec<Record>> = pages.try_collect().await.unwrap();
        assert_eq!(rest.iter().map(Vec::len).collect::<Vec<_>>(), vec![1]);
    }

    #[tokio::test]
    async fn keyless_containers_are_read_in_one_page() {
        let schema = Schema::new(
            "mem",
            "public",
            "events",
            SchemaKind::Table,
            vec![Column::new("n", 1, "int8", UniversalType::Long)],
        );
        let adapter = Arc::new(MemoryAdapter::new("mem", EventBus::default()));
        adapter.create_table(schema.clone()).await;
        adapter
            .insert_rows(
                "public",
                "events",
                (0..10)
                    .map(|n| record_from_pairs([("n", Value::Long(n))]))
                    .collect(),
            )
            .await
            .unwrap();
        adapter.connect().await.unwrap();

        let pages: Vec<Vec<Record>> = read_paged(
            adapter.clone(),
            schema.clone(),
            ReadOptions::default(),
            PageSize::new(3),
        )
        .try_collect()
        .await
        .unwrap();
        assert_eq!(pages.iter().map(Vec::len).collect::<Vec<_>>(), vec![10]);

        let options = ReadOptions::default().with_offset(2).with_limit(4);
        let pages: Vec<Vec<Record>> = read_paged(adapter, schema, options, PageSize::new(3))
            .try_collect()
            .await
            .unwrap();
        let values: Vec<i64> = pages
            .into_iter()
            .flatten()
            .filter_map(|record| record["n"].as_i64())
            .collect();
        assert_eq!(values, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn limit_bounds_the_whole_read() {
        let (adapter, schema) = adapter(10).await;
        let options = ReadOptions::default().with_offset(2).with_limit(5);

        let pages: Vec<Vec<Record>> = read_paged(adapter.clone(), schema.clone(), options, PageSize::new(3))
            .try_collect()
            .await
            .unwrap();
        let values: Vec<i64> = pages
            .into_iter()
            .flatten()
            .filter_map(|record| record["n"].as_i64())
            .collect();
        assert_eq!(values, vec![2, 3, 4, 5, 6]);

        let total = count_rows(adapter.as_ref(), &schema, &ReadOptions::default())
            .await
            .unwrap();
        assert_eq!(total, Some(10));
    }
}
