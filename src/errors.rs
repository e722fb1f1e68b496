use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("clickhouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("mysql error: {0}")]
    Mysql(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("geoip error: {0}")]
    GeoIp(#[from] maxminddb::MaxMindDBError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("transient ddl failure: {0}")]
    DdlTransient(String),

    #[error("table does not exist: {0}")]
    TableDoesNotExist(String),

    #[error("malformed message: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, SinkerError>;
