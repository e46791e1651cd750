//! Builders of parameterized SQL statements.
//!
//! Identifiers are always quoted. User data only reaches a statement as a parameter, except for
//! `LIMIT` and `OFFSET`, which are integers.

use std::fmt::Write;

use conduit_postgres::table::{TableName, quote_column_reference};
use pg_escape::quote_identifier;

use crate::adapter::filter::{Filter, FilterCondition};
use crate::adapter::options::{JoinKind, ReadOptions, SortDirection, WriteOptions};
use crate::adapter::postgres::types::{TextParam, select_expression};
use crate::bail;
use crate::error::{ConduitResult, ErrorKind};
use crate::types::{Record, Schema, Value};

/// SQL text together with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<TextParam>,
}

#[derive(Debug, Default)]
struct Params(Vec<TextParam>);

impl Params {
    /// Adds a parameter and returns its placeholder.
    fn push(&mut self, value: &Value) -> String {
        self.0.push(TextParam::from(value));
        format!("${}", self.0.len())
    }
}

/// Conflict clause of an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertConflict<'a> {
    Fail,
    DoNothing,
    DoUpdate {
        target: &'a [String],
        update_columns: &'a [String],
    },
}

/// Returns the quoted, schema qualified name of the container.
pub fn table_name(schema: &Schema) -> String {
    TableName::new(&schema.namespace, &schema.name).as_quoted_identifier()
}

fn select_list(schema: &Schema, options: &ReadOptions) -> String {
    let qualify = !options.joins.is_empty();

    if options.columns.is_empty() {
        return schema
            .columns
            .iter()
            .map(|column| {
                let quoted = quote_identifier(&column.name);
                let reference = if qualify {
                    format!("{}.{quoted}", quote_identifier(&schema.name))
                } else {
                    quoted.to_string()
                };
                match select_expression(&reference, &column.native_type) {
                    Some(expression) => format!("{expression} AS {quoted}"),
                    None => reference,
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
    }

    options
        .columns
        .iter()
        .map(|name| {
            let reference = quote_column_reference(name);
            let cast = schema
                .column(name)
                .and_then(|column| select_expression(&reference, &column.native_type));
            match cast {
                Some(expression) => format!("{expression} AS {}", quote_identifier(name)),
                None => reference,
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Appends the `FROM`, `JOIN`, `WHERE`, `GROUP BY` and `HAVING` clauses.
fn push_source(sql: &mut String, schema: &Schema, options: &ReadOptions, params: &mut Params) {
    let _ = write!(sql, " FROM {}", table_name(schema));

    for join in &options.joins {
        let keyword = match join.kind {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
        };
        let _ = write!(
            sql,
            " {keyword} {}",
            TableName::new(&join.namespace, &join.table).as_quoted_identifier()
        );
        if let Some(alias) = &join.alias {
            let _ = write!(sql, " AS {}", quote_identifier(alias));
        }

        let on = if join.on.is_empty() {
            "TRUE".to_string()
        } else {
            join.on
                .iter()
                .map(|condition| {
                    format!(
                        "{} = {}",
                        quote_column_reference(&condition.left),
                        quote_column_reference(&condition.right)
                    )
                })
                .collect::<Vec<_>>()
                .join(" AND ")
        };
        let _ = write!(sql, " ON {on}");
    }

    if !options.filters.is_empty() {
        let _ = write!(sql, " WHERE {}", filters_sql(&options.filters, params));
    }

    if !options.group_by.is_empty() {
        let columns = options
            .group_by
            .iter()
            .map(|column| quote_column_reference(column))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(sql, " GROUP BY {columns}");

        if !options.having.is_empty() {
            let _ = write!(sql, " HAVING {}", filters_sql(&options.having, params));
        }
    }
}

/// Builds the `SELECT` for a read, without the total count.
pub fn build_select(schema: &Schema, options: &ReadOptions) -> Statement {
    let mut params = Params::default();
    let mut sql = format!("SELECT {}", select_list(schema, options));
    push_source(&mut sql, schema, options, &mut params);

    if !options.order_by.is_empty() {
        let order = options
            .order_by
            .iter()
            .map(|order| {
                let direction = match order.direction {
                    SortDirection::Asc => "ASC",
                    SortDirection::Desc => "DESC",
                };
                format!("{} {direction}", quote_column_reference(&order.column))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let _ = write!(sql, " ORDER BY {order}");
    }
    if let Some(limit) = options.limit {
        let _ = write!(sql, " LIMIT {limit}");
    }
    if let Some(offset) = options.offset {
        let _ = write!(sql, " OFFSET {offset}");
    }

    Statement {
        sql,
        params: params.0,
    }
}

/// Counts the rows `build_select` would return without limit and offset.
pub fn build_count(schema: &Schema, options: &ReadOptions) -> Statement {
    let mut params = Params::default();
    let mut sql = String::from("SELECT count(*)");

    if options.group_by.is_empty() {
        push_source(&mut sql, schema, options, &mut params);
    } else {
        let mut inner = String::from("SELECT 1");
        push_source(&mut inner, schema, options, &mut params);
        let _ = write!(sql, " FROM ({inner}) AS grouped");
    }

    Statement {
        sql,
        params: params.0,
    }
}

fn filters_sql(filters: &[Filter], params: &mut Params) -> String {
    filters
        .iter()
        .map(|filter| filter_sql(filter, params))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn filter_sql(filter: &Filter, params: &mut Params) -> String {
    let column = quote_column_reference(&filter.column);

    match &filter.condition {
        FilterCondition::Eq(Value::Null) => format!("{column} IS NULL"),
        FilterCondition::Ne(Value::Null) => format!("{column} IS NOT NULL"),
        FilterCondition::Eq(value) => format!("{column} = {}", params.push(value)),
        // Null never equals a value, so it differs from every one.
        FilterCondition::Ne(value) => {
            format!("{column} IS DISTINCT FROM {}", params.push(value))
        }
        FilterCondition::Gt(value) => format!("{column} > {}", params.push(value)),
        FilterCondition::Gte(value) => format!("{column} >= {}", params.push(value)),
        FilterCondition::Lt(value) => format!("{column} < {}", params.push(value)),
        FilterCondition::Lte(value) => format!("{column} <= {}", params.push(value)),
        FilterCondition::Like(pattern) => {
            let value = Value::String(pattern.clone());
            format!("{column}::text LIKE {}", params.push(&value))
        }
        FilterCondition::ILike(pattern) => {
            let value = Value::String(pattern.clone());
            format!("{column}::text ILIKE {}", params.push(&value))
        }
        FilterCondition::In(values) if values.is_empty() => "FALSE".to_string(),
        FilterCondition::In(values) => {
            let placeholders = values
                .iter()
                .map(|value| params.push(value))
                .collect::<Vec<_>>()
                .join(", ");
            format!("{column} IN ({placeholders})")
        }
        FilterCondition::Between(low, high) => {
            let low = params.push(low);
            let high = params.push(high);
            format!("{column} BETWEEN {low} AND {high}")
        }
        FilterCondition::Regex(pattern) => {
            let value = Value::String(pattern.clone());
            format!("{column}::text ~ {}", params.push(&value))
        }
        FilterCondition::JsonContains(document) => {
            let value = Value::Json(document.clone());
            format!("{column}::jsonb @> {}::jsonb", params.push(&value))
        }
        FilterCondition::JsonPath(path) => {
            let value = Value::String(to_jsonpath(path));
            format!(
                "jsonb_path_exists({column}::jsonb, {}::jsonpath)",
                params.push(&value)
            )
        }
    }
}

/// Converts a dot separated path such as `$.tags.0` into a SQL/JSON path such as `$."tags"[0]`.
pub fn to_jsonpath(path: &str) -> String {
    let trimmed = path.trim_start_matches('$').trim_start_matches('.');
    let mut jsonpath = String::from("$");

    for segment in trimmed.split('.').filter(|segment| !segment.is_empty()) {
        if segment.parse::<usize>().is_ok() {
            let _ = write!(jsonpath, "[{segment}]");
        } else {
            let escaped = segment.replace('\\', "\\\\").replace('"', "\\\"");
            let _ = write!(jsonpath, ".\"{escaped}\"");
        }
    }

    jsonpath
}

/// Columns of a batch in first-seen order.
pub fn batch_columns(rows: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for name in row.keys() {
            if !columns.contains(name) {
                columns.push(name.clone());
            }
        }
    }

    columns
}

fn returning_sql(returning: &[String]) -> String {
    if returning.is_empty() {
        return String::new();
    }

    let columns = returning
        .iter()
        .map(|column| quote_identifier(column).into_owned())
        .collect::<Vec<_>>()
        .join(", ");
    format!(" RETURNING {columns}")
}

fn quoted_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| quote_identifier(column).into_owned())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds a multi-row insert. Columns missing from a row take their default.
pub fn build_insert(
    schema: &Schema,
    rows: &[Record],
    conflict: InsertConflict<'_>,
    returning: &[String],
) -> ConduitResult<Statement> {
    let columns = batch_columns(rows);
    if columns.is_empty() {
        bail!(
            ErrorKind::QueryInvalid,
            "Insert has no columns",
            table_name(schema)
        );
    }

    let mut params = Params::default();
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ",
        table_name(schema),
        quoted_list(&columns)
    );

    let tuples = rows
        .iter()
        .map(|row| {
            let values = columns
                .iter()
                .map(|column| match row.get(column) {
                    Some(value) => params.push(value),
                    None => "DEFAULT".to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({values})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&tuples);

    match conflict {
        InsertConflict::Fail => {}
        InsertConflict::DoNothing => sql.push_str(" ON CONFLICT DO NOTHING"),
        InsertConflict::DoUpdate {
            target,
            update_columns,
        } => {
            let updated: Vec<&String> = if update_columns.is_empty() {
                columns
                    .iter()
                    .filter(|column| !target.contains(*column))
                    .collect()
            } else {
                update_columns.iter().collect()
            };

            let _ = write!(sql, " ON CONFLICT ({})", quoted_list(target));
            if updated.is_empty() {
                sql.push_str(" DO NOTHING");
            } else {
                let assignments = updated
                    .iter()
                    .map(|column| {
                        let quoted = quote_identifier(column);
                        format!("{quoted} = EXCLUDED.{quoted}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let _ = write!(sql, " DO UPDATE SET {assignments}");
            }
        }
    }

    sql.push_str(&returning_sql(returning));

    Ok(Statement {
        sql,
        params: params.0,
    })
}

fn key_predicate(row: &Record, keys: &[String], params: &mut Params) -> String {
    keys.iter()
        .map(|key| {
            let column = quote_identifier(key);
            match row.get(key) {
                None | Some(Value::Null) => format!("{column} IS NULL"),
                Some(value) => format!("{column} = {}", params.push(value)),
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Deletes every row whose key columns equal those of one of `rows`.
pub fn build_delete_keys(
    schema: &Schema,
    rows: &[Record],
    keys: &[String],
) -> ConduitResult<Statement> {
    if keys.is_empty() {
        bail!(
            ErrorKind::QueryInvalid,
            "Delete requires key columns",
            table_name(schema)
        );
    }

    let mut params = Params::default();
    let predicate = rows
        .iter()
        .map(|row| format!("({})", key_predicate(row, keys, &mut params)))
        .collect::<Vec<_>>()
        .join(" OR ");

    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {predicate}", table_name(schema)),
        params: params.0,
    })
}

/// Updates the rows identified by the values of `where_columns` in `row`, narrowed by the
/// static filters of `options`. Returns `None` when the row has nothing to set.
pub fn build_update(
    schema: &Schema,
    row: &Record,
    where_columns: &[String],
    options: &WriteOptions,
) -> ConduitResult<Option<Statement>> {
    if where_columns.is_empty() && options.where_filters.is_empty() {
        bail!(
            ErrorKind::QueryInvalid,
            "Update requires a where clause",
            table_name(schema)
        );
    }

    let assigned: Vec<&String> = row
        .keys()
        .filter(|column| !where_columns.contains(*column))
        .filter(|column| {
            options.update_columns.is_empty() || options.update_columns.contains(*column)
        })
        .collect();
    if assigned.is_empty() {
        return Ok(None);
    }

    let mut params = Params::default();
    let assignments = assigned
        .iter()
        .map(|column| {
            let placeholder = params.push(&row[column.as_str()]);
            format!("{} = {placeholder}", quote_identifier(column))
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut predicates = Vec::new();
    if !where_columns.is_empty() {
        predicates.push(key_predicate(row, where_columns, &mut params));
    }
    if !options.where_filters.is_empty() {
        predicates.push(filters_sql(&options.where_filters, &mut params));
    }

    let sql = format!(
        "UPDATE {} SET {assignments} WHERE {}{}",
        table_name(schema),
        predicates.join(" AND "),
        returning_sql(&options.returning)
    );

    Ok(Some(Statement {
        sql,
        params: params.0,
    }))
}
