use std::collections::HashMap;

use tokio_postgres::Client;
use tracing::debug;

use crate::adapter::filter::like_regex;
use crate::adapter::options::DiscoverOptions;
use crate::adapter::postgres::types::universal_type_for;
use crate::error::ConduitResult;
use crate::types::{Column, ForeignKey, IndexSchema, Schema, SchemaKind};

const RELATIONS_QUERY: &str = r#"
select c.oid,
       n.nspname::text,
       c.relname::text,
       c.relkind::text,
       obj_description(c.oid, 'pg_class'),
       greatest(c.reltuples, 0)::int8,
       case when c.relkind in ('v', 'm') then pg_get_viewdef(c.oid, true) end
from pg_catalog.pg_class c
join pg_catalog.pg_namespace n on n.oid = c.relnamespace
where c.relkind::text = any($1)
  and n.nspname not in ('pg_catalog', 'information_schema')
  and n.nspname not like 'pg\_toast%'
  and n.nspname not like 'pg\_temp%'
  and ($2::text is null or n.nspname = $2)
  and ($3::text is null or c.relname = $3)
order by n.nspname, c.relname
"#;

const COLUMNS_QUERY: &str = r#"
select a.attrelid,
       a.attname::text,
       a.attnum::int4,
       t.typname::text,
       not a.attnotnull,
       pg_get_expr(d.adbin, d.adrelid),
       exists (
           select 1 from pg_catalog.pg_index i
           where i.indrelid = a.attrelid and i.indisprimary and a.attnum = any(i.indkey)
       ),
       case when t.typname in ('varchar', 'bpchar') and a.atttypmod > 0
            then a.atttypmod - 4 end,
       case when t.typname = 'numeric' and a.atttypmod > 0
            then ((a.atttypmod - 4) >> 16) & 65535 end,
       case when t.typname = 'numeric' and a.atttypmod > 0
            then (a.atttypmod - 4) & 65535 end
from pg_catalog.pg_attribute a
join pg_catalog.pg_type t on t.oid = a.atttypid
left join pg_catalog.pg_attrdef d on d.adrelid = a.attrelid and d.adnum = a.attnum
where a.attrelid = any($1) and a.attnum > 0 and not a.attisdropped
order by a.attrelid, a.attnum
"#;

const FOREIGN_KEYS_QUERY: &str = r#"
select con.conrelid,
       con.conname::text,
       a.attname::text,
       rn.nspname::text,
       rc.relname::text,
       ra.attname::text,
       con.confdeltype::text,
       con.confupdtype::text
from pg_catalog.pg_constraint con
cross join lateral unnest(con.conkey, con.confkey) with ordinality as k(attnum, refnum, ord)
join pg_catalog.pg_attribute a on a.attrelid = con.conrelid and a.attnum = k.attnum
join pg_catalog.pg_class rc on rc.oid = con.confrelid
join pg_catalog.pg_namespace rn on rn.oid = rc.relnamespace
join pg_catalog.pg_attribute ra on ra.attrelid = con.confrelid and ra.attnum = k.refnum
where con.contype = 'f' and con.conrelid = any($1)
order by con.conrelid, con.conname, k.ord
"#;

const INDEXES_QUERY: &str = r#"
select i.indrelid,
       ic.relname::text,
       am.amname::text,
       i.indisunique,
       array(
           select a.attname::text
           from unnest(i.indkey) with ordinality as k(attnum, ord)
           join pg_catalog.pg_attribute a on a.attrelid = i.indrelid and a.attnum = k.attnum
           order by k.ord
       )
from pg_catalog.pg_index i
join pg_catalog.pg_class ic on ic.oid = i.indexrelid
join pg_catalog.pg_am am on am.oid = ic.relam
where i.indrelid = any($1) and not i.indisprimary
order by i.indrelid, ic.relname
"#;

fn referential_action(code: &str) -> Option<String> {
    let action = match code {
        "a" => "NO ACTION",
        "r" => "RESTRICT",
        "c" => "CASCADE",
        "n" => "SET NULL",
        "d" => "SET DEFAULT",
        _ => return None,
    };

    Some(action.to_string())
}

fn schema_kind(relkind: &str) -> SchemaKind {
    match relkind {
        "v" | "m" => SchemaKind::View,
        "p" => SchemaKind::Partitioned,
        _ => SchemaKind::Table,
    }
}

/// Reads the schemas matching `options` from the system catalog.
///
/// When `exact_name` is given only that relation is read and the name pattern is ignored.
pub(super) async fn discover(
    client: &Client,
    system_id: &str,
    options: &DiscoverOptions,
    exact_name: Option<&str>,
) -> ConduitResult<Vec<Schema>> {
    let mut relkinds = vec!["r".to_string(), "p".to_string(), "f".to_string()];
    if options.include_views {
        relkinds.extend(["v".to_string(), "m".to_string()]);
    }

    let relation_rows = client
        .query(
            RELATIONS_QUERY,
            &[&relkinds, &options.namespace, &exact_name],
        )
        .await?;

    // The pattern uses LIKE semantics, evaluated here so that it shares the filter grammar.
    let name_pattern = match (exact_name, options.name_pattern.as_deref()) {
        (None, Some(pattern)) => Some(like_regex(pattern, false)?),
        _ => None,
    };

    let mut oids = Vec::new();
    let mut schemas: Vec<Schema> = Vec::new();
    for row in relation_rows {
        let name: String = row.try_get(2)?;
        if name_pattern
            .as_ref()
            .is_some_and(|pattern| !pattern.is_match(&name))
        {
            continue;
        }
        if options.limit.is_some_and(|limit| schemas.len() >= limit) {
            break;
        }

        let oid: u32 = row.try_get(0)?;
        let relkind: String = row.try_get(3)?;
        let mut schema = Schema::new(
            system_id,
            row.try_get::<_, String>(1)?,
            name,
            schema_kind(&relkind),
            Vec::new(),
        );
        schema.comment = row.try_get(4)?;
        schema.estimated_rows = row.try_get(5)?;
        schema.definition = row.try_get(6)?;

        oids.push(oid);
        schemas.push(schema);
    }

    if schemas.is_empty() {
        return Ok(schemas);
    }

    let positions: HashMap<u32, usize> = oids
        .iter()
        .enumerate()
        .map(|(position, oid)| (*oid, position))
        .collect();

    for row in client.query(COLUMNS_QUERY, &[&oids]).await? {
        let oid: u32 = row.try_get(0)?;
        let Some(schema) = positions.get(&oid).map(|position| &mut schemas[*position]) else {
            continue;
        };

        let native_type: String = row.try_get(3)?;
        let universal_type = universal_type_for(&native_type);
        let mut column = Column::new(
            row.try_get::<_, String>(1)?,
            row.try_get(2)?,
            native_type,
            universal_type,
        );
        column.nullable = row.try_get(4)?;
        column.default_value = row.try_get(5)?;
        column.primary_key = row.try_get(6)?;
        column.max_length = row.try_get(7)?;
        column.numeric_precision = row.try_get(8)?;
        column.numeric_scale = row.try_get(9)?;

        if column.primary_key {
            schema.primary_keys.push(column.name.clone());
        }
        schema.columns.push(column);
    }

    for row in client.query(FOREIGN_KEYS_QUERY, &[&oids]).await? {
        let oid: u32 = row.try_get(0)?;
        let Some(schema) = positions.get(&oid).map(|position| &mut schemas[*position]) else {
            continue;
        };

        let foreign_key = ForeignKey {
            constraint_name: row.try_get(1)?,
            column: row.try_get(2)?,
            referenced_namespace: row.try_get(3)?,
            referenced_table: row.try_get(4)?,
            referenced_column: row.try_get(5)?,
            on_delete: referential_action(&row.try_get::<_, String>(6)?),
            on_update: referential_action(&row.try_get::<_, String>(7)?),
        };
        if let Some(column) = schema
            .columns
            .iter_mut()
            .find(|column| column.name == foreign_key.column)
        {
            column.foreign_keys.push(foreign_key.clone());
        }
        schema.foreign_keys.push(foreign_key);
    }

    if options.include_indexes {
        for row in client.query(INDEXES_QUERY, &[&oids]).await? {
            let oid: u32 = row.try_get(0)?;
            let Some(schema) = positions.get(&oid).map(|position| &mut schemas[*position]) else {
                continue;
            };

            schema.indexes.push(IndexSchema {
                name: row.try_get(1)?,
                method: row.try_get(2)?,
                unique: row.try_get(3)?,
                columns: row.try_get(4)?,
            });
        }
    }

    debug!(count = schemas.len(), "discovered postgres schemas");

    Ok(schemas)
}
