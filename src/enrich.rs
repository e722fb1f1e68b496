//! Enricher: validates identity/time-skew business rules, injects geo and
//! bookkeeping fields, and classifies the outcome of processing one inbound
//! record before it reaches the Schema Reconciler and the sinks.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::audit::{AuditRow, CLOCK_SKEW, EMPTY_DISTINCT_ID};
use crate::geoip::GeoIp;
use crate::olap::ReportType;

const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const CLOCK_SKEW_LIMIT_MINUTES: i64 = 10;

/// The inbound message shape described in §6.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub table_id: String,
    #[serde(default)]
    pub event_name: String,
    pub report_type: i32,
    pub report_time: String,
    #[serde(default)]
    pub ip: Option<String>,
    pub req_data: Map<String, Value>,
}

pub enum EnrichOutcome {
    Accepted {
        table_id: i64,
        report_type: ReportType,
        event_name: String,
        payload: Map<String, Value>,
    },
    /// Malformed message: dropped and acknowledged without an audit row —
    /// there is no table/tenant to attribute one to.
    Unattributable,
    /// A validation rule fired: dropped, acknowledged, with a FAIL audit row.
    Rejected(Box<AuditRow>),
}

pub fn parse_canonical(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, CANONICAL_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

pub struct Enricher<'a> {
    geoip: Option<&'a GeoIp>,
}

impl<'a> Enricher<'a> {
    pub fn new(geoip: Option<&'a GeoIp>) -> Self {
        Self { geoip }
    }

    pub fn process(
        &self,
        msg: &InboundMessage,
        kafka_offset: i64,
        kafka_partition: i32,
        server_time: DateTime<Utc>,
    ) -> EnrichOutcome {
        let table_id: i64 = match msg.table_id.parse() {
            Ok(v) => v,
            Err(_) => return EnrichOutcome::Unattributable,
        };

        let report_type = match msg.report_type {
            1 => ReportType::Event,
            2 => ReportType::User,
            _ => return EnrichOutcome::Unattributable,
        };

        if report_type == ReportType::Event && msg.event_name.is_empty() {
            return EnrichOutcome::Unattributable;
        }

        let mut payload = msg.req_data.clone();
        let raw_payload_json = serde_json::to_string(&msg.req_data).unwrap_or_default();
        let report_type_str = match report_type {
            ReportType::Event => "EVENT",
            ReportType::User => "USER",
        };

        let distinct_id = payload
            .get("xwl_distinct_id")
            .and_then(Value::as_str)
            .unwrap_or("");
        if distinct_id.is_empty() {
            return EnrichOutcome::Rejected(Box::new(AuditRow::fail(
                server_time,
                table_id,
                report_type_str,
                &msg.event_name,
                EMPTY_DISTINCT_ID,
                &raw_payload_json,
                kafka_offset,
            )));
        }

        if let Some(ip) = msg.ip.as_deref().filter(|ip| !ip.is_empty()) {
            match self.geoip.and_then(|g| g.lookup(ip)) {
                Some((province, city)) => {
                    payload.insert("xwl_province".to_string(), json!(province));
                    payload.insert("xwl_city".to_string(), json!(city));
                    payload.insert("xwl_ip".to_string(), json!(ip));
                }
                None => debug!("geoip miss for {ip}"),
            }
        }

        let client_time_str = payload
            .get("xwl_client_time")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if let (Some(client_time), Some(report_time)) = (
            parse_canonical(&client_time_str),
            parse_canonical(&msg.report_time),
        ) {
            let skew_minutes = (report_time - client_time).num_minutes().abs();
            if skew_minutes > CLOCK_SKEW_LIMIT_MINUTES {
                return EnrichOutcome::Rejected(Box::new(AuditRow::fail(
                    server_time,
                    table_id,
                    report_type_str,
                    &msg.event_name,
                    CLOCK_SKEW,
                    &raw_payload_json,
                    kafka_offset,
                )));
            }
        }

        payload.insert("xwl_part_event".to_string(), json!(msg.event_name));
        payload.insert("xwl_part_date".to_string(), json!(client_time_str));
        payload.insert(
            "xwl_server_time".to_string(),
            json!(server_time.format(CANONICAL_FORMAT).to_string()),
        );
        payload.insert("xwl_kafka_offset".to_string(), json!(kafka_offset));
        payload.insert("xwl_kafka_partition".to_string(), json!(kafka_partition));

        EnrichOutcome::Accepted {
            table_id,
            report_type,
            event_name: msg.event_name.clone(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(req_data: Map<String, Value>) -> InboundMessage {
        InboundMessage {
            table_id: "17".to_string(),
            event_name: "purchase".to_string(),
            report_type: 1,
            report_time: "2024-01-02 10:00:00".to_string(),
            ip: None,
            req_data,
        }
    }

    fn req_data(distinct_id: &str, client_time: &str, extra: &[(&str, Value)]) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("xwl_distinct_id".to_string(), json!(distinct_id));
        m.insert("xwl_client_time".to_string(), json!(client_time));
        for (k, v) in extra {
            m.insert((*k).to_string(), v.clone());
        }
        m
    }

    #[test]
    fn s1_happy_path_accepts_and_injects_bookkeeping() {
        let enricher = Enricher::new(None);
        let m = msg(req_data("u1", "2024-01-02 09:59:55", &[("amount", json!(42))]));
        match enricher.process(&m, 5, 0, Utc::now()) {
            EnrichOutcome::Accepted { table_id, payload, .. } => {
                assert_eq!(table_id, 17);
                assert_eq!(payload.get("xwl_part_event").unwrap(), "purchase");
                assert_eq!(payload.get("xwl_kafka_offset").unwrap(), &json!(5));
            }
            _ => panic!("expected Accepted"),
        }
    }

    #[test]
    fn s3_empty_distinct_id_is_rejected_with_canonical_reason() {
        let enricher = Enricher::new(None);
        let m = msg(req_data("", "2024-01-02 09:59:55", &[]));
        match enricher.process(&m, 5, 0, Utc::now()) {
            EnrichOutcome::Rejected(audit) => assert_eq!(audit.error_reason, "xwl_distinct_id 不能为空"),
            _ => panic!("expected Rejected"),
        }
    }

    #[test]
    fn s4_clock_skew_is_rejected_with_canonical_reason() {
        let enricher = Enricher::new(None);
        let mut m = msg(req_data("u1", "2024-01-02 09:00:00", &[]));
        m.report_time = "2024-01-02 10:00:00".to_string();
        match enricher.process(&m, 5, 0, Utc::now()) {
            EnrichOutcome::Rejected(audit) => {
                assert_eq!(audit.error_reason, "客户端上报时间误差大于十分钟")
            }
            _ => panic!("expected Rejected"),
        }
    }

    #[test]
    fn malformed_table_id_is_unattributable() {
        let enricher = Enricher::new(None);
        let mut m = msg(req_data("u1", "2024-01-02 09:59:55", &[]));
        m.table_id = "not-a-number".to_string();
        assert!(matches!(enricher.process(&m, 5, 0, Utc::now()), EnrichOutcome::Unattributable));
    }

    #[test]
    fn empty_event_name_for_event_type_is_unattributable() {
        let enricher = Enricher::new(None);
        let mut m = msg(req_data("u1", "2024-01-02 09:59:55", &[]));
        m.event_name = String::new();
        assert!(matches!(enricher.process(&m, 5, 0, Utc::now()), EnrichOutcome::Unattributable));
    }
}
