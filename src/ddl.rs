//! Schema Reconciler and DDL Serializer: computes the delta between a
//! record's attribute set and a table's cached columns, and serializes the
//! resulting `ADD COLUMN IF NOT EXISTS` statements through a single writer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::cache::{ColumnDescriptor, ColumnMetadataCache};
use crate::errors::{Result, SinkerError};
use crate::types::classify;

/// Columns that are always present on auto-created tables and must never be
/// auto-added by the reconciler, even if a stale cache snapshot momentarily
/// omits them.
pub const DENYLIST: &[&str] = &[
    "xwl_distinct_id",
    "xwl_update_time",
    "xwl_part_event",
    "xwl_part_date",
    "xwl_server_time",
    "xwl_kafka_offset",
    "xwl_kafka_partition",
];

#[derive(Debug, Clone)]
pub struct DdlTask {
    pub database: String,
    pub table: String,
    pub column_name: String,
    pub column_type: String,
}

struct DdlRequest {
    tasks: Vec<DdlTask>,
    respond_to: oneshot::Sender<Result<()>>,
}

/// Distinguishes a genuine schema conflict — `ADD COLUMN IF NOT EXISTS`
/// rejecting a column that already exists with an incompatible type, which
/// can only really arise from two workers racing to classify the same new
/// attribute differently — from a transient, connection-level failure.
/// `clickhouse.rs` does not expose a typed variant for this distinction, so
/// it is read off the server's error text; false negatives fall back to the
/// transient (retry) path, which is the safer default.
fn is_schema_conflict(err: &clickhouse::error::Error) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    text.contains("already exists")
        || text.contains("duplicate column")
        || text.contains("cannot add column")
        || text.contains("type mismatch")
        || text.contains("incompatible")
}

/// Returns ` on cluster <name> ` when a cluster is configured, else a
/// single space, mirroring the original `GetClusterSql` helper.
pub fn cluster_sql(cluster_name: &str) -> String {
    if cluster_name.is_empty() {
        " ".to_string()
    } else {
        format!(" on cluster {cluster_name} ")
    }
}

pub fn merge_tree_engine(cluster_name: &str, db_name: &str, shard_key: &str, replica_key: &str, table: &str) -> String {
    if cluster_name.is_empty() {
        "MergeTree".to_string()
    } else {
        format!("ReplicatedMergeTree('/clickhouse/{db_name}/tables/{{{shard_key}}}/{table}', '{{{replica_key}}}')")
    }
}

pub fn replacing_merge_tree_engine(
    cluster_name: &str,
    db_name: &str,
    shard_key: &str,
    replica_key: &str,
    table: &str,
    version_column: &str,
) -> String {
    if cluster_name.is_empty() {
        format!("ReplacingMergeTree({version_column})")
    } else {
        format!(
            "ReplicatedReplacingMergeTree('/clickhouse/{db_name}/tables/{{{shard_key}}}/{table}', '{{{replica_key}}}', {version_column})"
        )
    }
}

/// Handle to the single-writer DDL queue. Cloning shares the same channel
/// and in-memory issued-statement set.
#[derive(Clone)]
pub struct DdlSerializer {
    tx: mpsc::Sender<DdlRequest>,
}

impl DdlSerializer {
    /// Spawns the background task that owns the OLAP handle and is the sole
    /// writer of schema changes. `issued` deduplicates `(table, column)`
    /// pairs for the lifetime of the process — stronger than the "short
    /// window" the source used, and safe since a column, once added, never
    /// needs to be added again.
    pub fn spawn(ch: clickhouse::Client, cluster_name: String, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<DdlRequest>(buffer);
        let handle = tokio::spawn(async move {
            let cluster = cluster_sql(&cluster_name);
            let mut issued: HashSet<(String, String)> = HashSet::new();

            while let Some(req) = rx.recv().await {
                let mut outcome = Ok(());
                for task in req.tasks {
                    let key = (task.table.clone(), task.column_name.clone());
                    if issued.contains(&key) {
                        continue;
                    }
                    let stmt = format!(
                        "ALTER TABLE {}.{} {}ADD COLUMN IF NOT EXISTS `{}` {}",
                        task.database, task.table, cluster, task.column_name, task.column_type
                    );
                    info!(table = %task.table, "executing sql=> {stmt}");
                    match ch.query(&stmt).execute().await {
                        Ok(()) => {
                            issued.insert(key);
                        }
                        Err(e) if is_schema_conflict(&e) => {
                            error!(
                                table = %task.table,
                                column = %task.column_name,
                                "schema conflict, dropping this attribute from the batch: {e}",
                            );
                            // Not inserted into `issued`: the reconciler's
                            // post-DDL re-fetch will simply not find this
                            // column, and the record proceeds without it.
                        }
                        Err(e) => {
                            error!(table = %task.table, column = %task.column_name, "transient ddl failure: {e}");
                            outcome = Err(SinkerError::DdlTransient(format!("{stmt}: {e}")));
                            break;
                        }
                    }
                }
                let _ = req.respond_to.send(outcome);
            }
        });
        (Self { tx }, handle)
    }

    /// Submits a batch of tasks and blocks until the serializer has drained
    /// them (or hit the first non-idempotent failure).
    pub async fn submit(&self, tasks: Vec<DdlTask>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(DdlRequest { tasks, respond_to })
            .await
            .map_err(|_| SinkerError::Config("ddl serializer channel closed".to_string()))?;
        rx.await
            .map_err(|_| SinkerError::Config("ddl serializer dropped response".to_string()))?
    }
}

/// Computes the unknown-attribute set, resolves their types, and drives the
/// DDL Serializer to extend the table before returning the refreshed column
/// list.
pub struct SchemaReconciler {
    cache: Arc<ColumnMetadataCache>,
    ddl: DdlSerializer,
    database: String,
}

impl SchemaReconciler {
    pub fn new(cache: Arc<ColumnMetadataCache>, ddl: DdlSerializer, database: String) -> Self {
        Self { cache, ddl, database }
    }

    pub async fn reconcile(
        &self,
        table: &str,
        payload: &Map<String, Value>,
    ) -> Result<Vec<ColumnDescriptor>> {
        let dims = self.cache.lookup(table, DENYLIST, false).await?;
        let known: HashMap<&str, ()> = dims.iter().map(|d| (d.name.as_str(), ())).collect();

        let mut tasks = Vec::new();
        for (key, value) in payload {
            if known.contains_key(key.as_str()) || DENYLIST.contains(&key.as_str()) {
                continue;
            }
            let ty = classify(value);
            tasks.push(DdlTask {
                database: self.database.clone(),
                table: table.to_string(),
                column_name: key.clone(),
                column_type: ty.olap_type().to_string(),
            });
        }

        if tasks.is_empty() {
            return Ok(dims);
        }

        self.ddl.submit(tasks).await?;
        self.cache.invalidate_local(table);
        self.cache.lookup(table, DENYLIST, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_sql_disabled_is_single_space() {
        assert_eq!(cluster_sql(""), " ");
    }

    #[test]
    fn cluster_sql_enabled_wraps_name() {
        assert_eq!(cluster_sql("bi_cluster"), " on cluster bi_cluster ");
    }

    #[test]
    fn merge_tree_falls_back_without_cluster() {
        assert_eq!(merge_tree_engine("", "bi", "shard", "replica", "event_1"), "MergeTree");
    }

    #[test]
    fn merge_tree_replicated_with_cluster() {
        let engine = merge_tree_engine("bi_cluster", "bi", "shard", "replica", "event_1");
        assert_eq!(
            engine,
            "ReplicatedMergeTree('/clickhouse/bi/tables/{shard}/event_1', '{replica}')"
        );
    }
}
