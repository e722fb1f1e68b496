//! Layered configuration loading: file source (json/toml/yaml by extension)
//! plus environment overrides, deserialized into a typed tree mirroring the
//! recognized `sinker.*` / `comm.*` option set.

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, File, FileFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub sinker: SinkerConfig,
    pub comm: CommConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkerConfig {
    #[serde(default)]
    pub pprof_http_port: u16,
    pub real_time_warehousing: SinkTuning,
    pub report_accept_status: FlushTuning,
    pub report_data_to_ck: FlushTuning,
}

/// Batch-sink size/time trigger parameters shared by all three destinations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlushTuning {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkTuning {
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub index_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommConfig {
    pub kafka: KafkaConfig,
    pub clickhouse: ClickHouseConfig,
    pub mysql: MysqlConfig,
    pub redis: RedisConfig,
    pub geoip_mmdb_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub addresses: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub report_topic_name: String,
    pub real_time_data_group: String,
    pub report_data_to_ck_group: String,
    #[serde(default = "default_channel_buffer_size")]
    pub channel_buffer_size: usize,
}

fn default_channel_buffer_size() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub db_name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub macros_shard_key_name: String,
    #[serde(default)]
    pub macros_replica_key_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MysqlConfig {
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    pub dsn: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Build from `<dir>/<name>.<ext>` plus `SINKER__`-prefixed environment overrides.
    pub fn load(dir: &str, name: &str, ext: &str) -> Result<Self> {
        let path = format!("{dir}/{name}.{ext}");
        let format = match ext {
            "yaml" | "yml" => FileFormat::Yaml,
            "toml" => FileFormat::Toml,
            _ => FileFormat::Json,
        };

        let builder = ConfigBuilder::builder()
            .add_source(File::new(&path, format))
            .add_source(
                config::Environment::with_prefix("SINKER")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: Config = builder
            .build()
            .with_context(|| format!("failed to load configuration from {path}"))?
            .try_deserialize()
            .with_context(|| format!("failed to deserialize configuration from {path}"))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.comm.kafka.addresses.is_empty() {
            anyhow::bail!("comm.kafka.addresses must not be empty");
        }
        if self.sinker.report_data_to_ck.batch_size == 0 {
            anyhow::bail!("sinker.report_data_to_ck.batch_size must be greater than 0");
        }
        if self.sinker.report_accept_status.batch_size == 0 {
            anyhow::bail!("sinker.report_accept_status.batch_size must be greater than 0");
        }
        if self.sinker.real_time_warehousing.batch_size == 0 {
            anyhow::bail!("sinker.real_time_warehousing.batch_size must be greater than 0");
        }
        if self.comm.clickhouse.db_name.is_empty() {
            anyhow::bail!("comm.clickhouse.db_name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp_config(contents: &str) -> (tempfile::TempDir, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        (dir, "config".to_string(), "json".to_string())
    }

    const SAMPLE: &str = r#"{
        "sinker": {
            "pprof_http_port": 0,
            "real_time_warehousing": {"batch_size": 500, "flush_interval_ms": 1000, "index_name": "events"},
            "report_accept_status": {"batch_size": 500, "flush_interval_ms": 1000},
            "report_data_to_ck": {"batch_size": 500, "flush_interval_ms": 1000}
        },
        "comm": {
            "kafka": {
                "addresses": ["localhost:9092"],
                "report_topic_name": "report",
                "real_time_data_group": "real_time_group",
                "report_data_to_ck_group": "report_data_to_ck_group"
            },
            "clickhouse": {"url": "http://localhost:8123", "db_name": "bi"},
            "mysql": {"dsn": "mysql://root@localhost/bi"},
            "redis": {"dsn": "redis://localhost"},
            "geoip_mmdb_path": "/tmp/GeoLite2-City.mmdb"
        }
    }"#;

    #[test]
    fn load_from_file_applies_defaults() {
        let (dir, name, ext) = write_temp_config(SAMPLE);
        let cfg = Config::load(dir.path().to_str().unwrap(), &name, &ext).unwrap();
        assert_eq!(cfg.comm.kafka.channel_buffer_size, 1024);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.comm.kafka.addresses, vec!["localhost:9092".to_string()]);
    }

    #[test]
    fn validate_rejects_empty_brokers() {
        let (dir, name, ext) = write_temp_config(SAMPLE);
        let mut cfg = Config::load(dir.path().to_str().unwrap(), &name, &ext).unwrap();
        cfg.comm.kafka.addresses.clear();
        assert!(cfg.validate().is_err());
    }
}
