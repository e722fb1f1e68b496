//! The "report accept status" audit sink: one row per processed message
//! recording SUCCESS/FAIL plus, for FAIL rows, a reason and the original
//! payload for manual replay.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::ddl::cluster_sql;
use crate::errors::Result;
use crate::sink::FlushFailure;

pub const EMPTY_DISTINCT_ID: &str = "xwl_distinct_id 不能为空";
pub const CLOCK_SKEW: &str = "客户端上报时间误差大于十分钟";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditStatus {
    Success,
    Fail,
}

impl AuditStatus {
    fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Success => "SUCCESS",
            AuditStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, clickhouse::Row, Serialize)]
pub struct AuditRow {
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub part_date: DateTime<Utc>,
    pub table_id: i64,
    pub report_type: String,
    pub data_name: String,
    pub error_reason: String,
    pub error_handling: String,
    pub report_data: String,
    pub xwl_kafka_offset: i64,
    pub status: String,
}

impl AuditRow {
    pub fn success(
        part_date: DateTime<Utc>,
        table_id: i64,
        report_type: &str,
        data_name: &str,
        report_data: &str,
        kafka_offset: i64,
    ) -> Self {
        Self {
            part_date,
            table_id,
            report_type: report_type.to_string(),
            data_name: data_name.to_string(),
            error_reason: String::new(),
            error_handling: String::new(),
            report_data: report_data.to_string(),
            xwl_kafka_offset: kafka_offset,
            status: AuditStatus::Success.as_str().to_string(),
        }
    }

    /// A coercion mismatch that did not cost the record: the attribute is
    /// still inserted, as a string, alongside the rest of the row. Distinct
    /// from `fail` — the record as a whole succeeds, only one column's
    /// typed value was discarded.
    #[allow(clippy::too_many_arguments)]
    pub fn coerced_to_string(
        part_date: DateTime<Utc>,
        table_id: i64,
        report_type: &str,
        data_name: &str,
        column: &str,
        report_data: &str,
        kafka_offset: i64,
    ) -> Self {
        Self {
            part_date,
            table_id,
            report_type: report_type.to_string(),
            data_name: data_name.to_string(),
            error_reason: format!("column `{column}` did not match its inferred type"),
            error_handling: "coerced_to_string".to_string(),
            report_data: report_data.to_string(),
            xwl_kafka_offset: kafka_offset,
            status: AuditStatus::Success.as_str().to_string(),
        }
    }

    pub fn fail(
        part_date: DateTime<Utc>,
        table_id: i64,
        report_type: &str,
        data_name: &str,
        error_reason: &str,
        report_data: &str,
        kafka_offset: i64,
    ) -> Self {
        Self {
            part_date,
            table_id,
            report_type: report_type.to_string(),
            data_name: data_name.to_string(),
            error_reason: error_reason.to_string(),
            error_handling: "dropped".to_string(),
            report_data: report_data.to_string(),
            xwl_kafka_offset: kafka_offset,
            status: AuditStatus::Fail.as_str().to_string(),
        }
    }
}

pub const AUDIT_TABLE: &str = "report_accept_status";

pub async fn ensure_audit_table_exists(ch: &clickhouse::Client, db: &str, cluster_name: &str) -> Result<()> {
    let cluster = cluster_sql(cluster_name);
    let engine = if cluster_name.is_empty() { "MergeTree" } else { "ReplicatedMergeTree" };
    let stmt = format!(
        "CREATE TABLE IF NOT EXISTS {db}.{AUDIT_TABLE} {cluster}(\
         `part_date` DateTime, \
         `table_id` Int64, \
         `report_type` String, \
         `data_name` String, \
         `error_reason` String, \
         `error_handling` String, \
         `report_data` String, \
         `xwl_kafka_offset` Int64, \
         `status` String\
         ) ENGINE = {engine} PARTITION BY toYYYYMM(part_date) ORDER BY (table_id, part_date)"
    );
    info!("executing sql=> {stmt}");
    ch.query(&stmt).execute().await?;
    Ok(())
}

pub async fn write_batch(ch: &clickhouse::Client, db: &str, rows: Vec<AuditRow>) -> std::result::Result<(), FlushFailure<AuditRow>> {
    let mut insert = match ch.insert(&format!("{db}.{AUDIT_TABLE}")) {
        Ok(i) => i,
        Err(e) => {
            return Err(FlushFailure {
                rows,
                source: e.into(),
            })
        }
    };

    for row in &rows {
        if let Err(e) = insert.write(row).await {
            return Err(FlushFailure {
                rows,
                source: e.into(),
            });
        }
    }

    if let Err(e) = insert.end().await {
        return Err(FlushFailure {
            rows,
            source: e.into(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_row_carries_canonical_reasons() {
        let now = Utc::now();
        let row = AuditRow::fail(now, 17, "EVENT", "purchase", EMPTY_DISTINCT_ID, "{}", 5);
        assert_eq!(row.error_reason, "xwl_distinct_id 不能为空");
        assert_eq!(row.status, "FAIL");

        let row = AuditRow::fail(now, 17, "EVENT", "purchase", CLOCK_SKEW, "{}", 6);
        assert_eq!(row.error_reason, "客户端上报时间误差大于十分钟");
    }

    #[test]
    fn success_row_has_no_error_reason() {
        let row = AuditRow::success(Utc::now(), 17, "EVENT", "purchase", "{}", 5);
        assert_eq!(row.status, "SUCCESS");
        assert!(row.error_reason.is_empty());
    }
}
