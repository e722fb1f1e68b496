//! OLAP (ClickHouse) table management and batched row insertion. Table
//! creation and the `ADD COLUMN` statements live alongside the schema
//! reconciler's engine-naming helpers (`ddl::merge_tree_engine` /
//! `replacing_merge_tree_engine`); this module owns the mandatory-column
//! `CREATE TABLE` statement and the dynamic-column `INSERT` built from each
//! record's resolved `TypedValue`s.

use std::collections::BTreeMap;

use tracing::info;

use crate::ddl::{cluster_sql, merge_tree_engine, replacing_merge_tree_engine};
use crate::errors::Result;
use crate::sink::FlushFailure;
use crate::types::TypedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Event,
    User,
}

impl ReportType {
    pub fn table_name(self, table_id: i64) -> String {
        match self {
            ReportType::Event => format!("event_{table_id}"),
            ReportType::User => format!("user_{table_id}"),
        }
    }
}

/// One resolved row destined for an OLAP table. Column set varies row to
/// row since the schema is extended on demand; `BTreeMap` gives a stable
/// iteration order when grouping a batch by column union.
#[derive(Debug, Clone)]
pub struct OlapRow {
    pub table: String,
    pub columns: BTreeMap<String, TypedValue>,
}

/// Issues `CREATE TABLE IF NOT EXISTS` with the mandatory bookkeeping
/// columns for a freshly observed `(table_id, report_type)`.
pub async fn ensure_table_exists(
    ch: &clickhouse::Client,
    db: &str,
    cluster_name: &str,
    shard_key: &str,
    replica_key: &str,
    report_type: ReportType,
    table_id: i64,
) -> Result<()> {
    let table = report_type.table_name(table_id);
    let cluster = cluster_sql(cluster_name);

    let (extra_columns, engine) = match report_type {
        ReportType::Event => (
            String::new(),
            merge_tree_engine(cluster_name, db, shard_key, replica_key, &table),
        ),
        ReportType::User => (
            ", `xwl_update_time` DateTime".to_string(),
            replacing_merge_tree_engine(
                cluster_name,
                db,
                shard_key,
                replica_key,
                &table,
                "xwl_update_time",
            ),
        ),
    };

    let stmt = format!(
        "CREATE TABLE IF NOT EXISTS {db}.{table} {cluster}(\
         `xwl_distinct_id` String, \
         `xwl_part_event` String, \
         `xwl_part_date` DateTime, \
         `xwl_server_time` DateTime, \
         `xwl_kafka_offset` Int64, \
         `xwl_kafka_partition` Int32{extra_columns}\
         ) ENGINE = {engine} PARTITION BY toYYYYMM(xwl_part_date) ORDER BY (xwl_distinct_id, xwl_part_date)"
    );

    info!("executing sql=> {stmt}");
    ch.query(&stmt).execute().await?;
    Ok(())
}

fn sql_literal(value: &TypedValue) -> String {
    match value {
        TypedValue::Int(i) => i.to_string(),
        TypedValue::Float(f) => f.to_string(),
        TypedValue::String(s) => format!("'{}'", escape(s)),
        TypedValue::DateTime(s) => format!("'{}'", escape(s)),
        TypedValue::IntArray(v) => array_literal(v.iter().map(|i| i.to_string())),
        TypedValue::FloatArray(v) => array_literal(v.iter().map(|f| f.to_string())),
        TypedValue::StringArray(v) => array_literal(v.iter().map(|s| format!("'{}'", escape(s)))),
        TypedValue::DateTimeArray(v) => array_literal(v.iter().map(|s| format!("'{}'", escape(s)))),
    }
}

fn array_literal(items: impl Iterator<Item = String>) -> String {
    format!("[{}]", items.collect::<Vec<_>>().join(", "))
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Groups `rows` by table and issues one multi-row `INSERT` per table,
/// building the column list from the union of keys present in that group.
pub async fn write_batch(ch: &clickhouse::Client, db: &str, rows: Vec<OlapRow>) -> std::result::Result<(), FlushFailure<OlapRow>> {
    let mut by_table: BTreeMap<String, Vec<OlapRow>> = BTreeMap::new();
    for row in rows {
        by_table.entry(row.table.clone()).or_default().push(row);
    }

    let mut flushed = Vec::new();
    for (table, group) in by_table {
        match insert_group(ch, db, &table, &group).await {
            Ok(()) => flushed.extend(group),
            Err(e) => {
                let mut rows_back = group;
                rows_back.extend(flushed);
                return Err(FlushFailure {
                    rows: rows_back,
                    source: e,
                });
            }
        }
    }
    Ok(())
}

async fn insert_group(ch: &clickhouse::Client, db: &str, table: &str, rows: &[OlapRow]) -> Result<()> {
    let mut columns: Vec<String> = rows
        .iter()
        .flat_map(|r| r.columns.keys().cloned())
        .collect();
    columns.sort();
    columns.dedup();

    if columns.is_empty() {
        return Ok(());
    }

    let col_list = columns
        .iter()
        .map(|c| format!("`{c}`"))
        .collect::<Vec<_>>()
        .join(", ");

    let values_clause = rows
        .iter()
        .map(|row| {
            let tuple = columns
                .iter()
                .map(|c| {
                    row.columns
                        .get(c)
                        .map(sql_literal)
                        .unwrap_or_else(|| "NULL".to_string())
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("({tuple})")
        })
        .collect::<Vec<_>>()
        .join(", ");

    let stmt = format!("INSERT INTO {db}.{table} ({col_list}) VALUES {values_clause}");
    ch.query(&stmt).execute().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_matches_report_type() {
        assert_eq!(ReportType::Event.table_name(17), "event_17");
        assert_eq!(ReportType::User.table_name(17), "user_17");
    }

    #[test]
    fn sql_literal_escapes_quotes() {
        assert_eq!(sql_literal(&TypedValue::String("o'brien".to_string())), "'o\\'brien'");
    }

    #[test]
    fn sql_literal_formats_array() {
        assert_eq!(
            sql_literal(&TypedValue::IntArray(vec![1, 2, 3])),
            "[1, 2, 3]"
        );
    }
}
