//! Relational metadata store: a thin registry of which event names have
//! been observed for which table, used purely for operator-facing
//! discovery (e.g. listing known event types in the admin surface, which
//! is itself out of scope here). Connected during the ordered startup
//! sequence in §4.8, between the OLAP client and the key/value store
//! client.

use sqlx::mysql::MySqlPoolOptions;
use sqlx::MySqlPool;

use crate::errors::Result;

#[derive(Clone)]
pub struct MetadataClient {
    pool: MySqlPool,
}

impl MetadataClient {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new().max_connections(10).connect(dsn).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meta_event (\
             table_id BIGINT NOT NULL, \
             report_type VARCHAR(16) NOT NULL, \
             event_name VARCHAR(255) NOT NULL, \
             PRIMARY KEY (table_id, report_type, event_name))",
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }

    /// Records that `event_name` has been observed for `table_id`; a no-op
    /// if already present.
    pub async fn record_event(&self, table_id: i64, report_type: &str, event_name: &str) -> Result<()> {
        sqlx::query(
            "INSERT IGNORE INTO meta_event (table_id, report_type, event_name) VALUES (?, ?, ?)",
        )
        .bind(table_id)
        .bind(report_type)
        .bind(event_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
