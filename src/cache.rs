//! Three-tier column-metadata cache: process-local map, shared key/value
//! store (gzip-compressed JSON blob, 6h TTL), OLAP `system.columns` query.
//! Grounded in the original process-local `sync.Map` + Redis + ClickHouse
//! lookup chain; reimplemented here as `dashmap::DashMap` plus a tokio-async
//! Redis connection manager, matching this codebase's concurrent-map idiom.

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{Result, SinkerError};
use crate::types::{which_type, ColumnType};

const DIMS_HASH_PREFIX: &str = "dimsHash_";
const REDIS_TTL_SECS: u64 = 6 * 60 * 60;
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub source_name: String,
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u8(match self {
            ColumnType::Int => 0,
            ColumnType::Float => 1,
            ColumnType::String => 2,
            ColumnType::DateTime => 3,
            ColumnType::IntArray => 4,
            ColumnType::FloatArray => 5,
            ColumnType::StringArray => 6,
            ColumnType::DateTimeArray => 7,
        })
    }
}

impl<'de> Deserialize<'de> for ColumnType {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = u8::deserialize(deserializer)?;
        Ok(match tag {
            0 => ColumnType::Int,
            1 => ColumnType::Float,
            2 => ColumnType::String,
            3 => ColumnType::DateTime,
            4 => ColumnType::IntArray,
            5 => ColumnType::FloatArray,
            6 => ColumnType::StringArray,
            _ => ColumnType::DateTimeArray,
        })
    }
}

/// Returns `dimsHash_<database>_<table>`.
pub fn cache_key(database: &str, table: &str) -> String {
    format!("{DIMS_HASH_PREFIX}{database}_{table}")
}

/// Escapes `.` for use in quoting contexts, matching the source column-name
/// escaping rule (`.` -> `\.`).
pub fn source_name(name: &str) -> String {
    name.replace('.', "\\.")
}

pub struct ColumnMetadataCache {
    local: DashMap<String, Vec<ColumnDescriptor>>,
    redis: redis::aio::ConnectionManager,
    ch: clickhouse::Client,
    db_name: String,
}

impl ColumnMetadataCache {
    pub fn new(redis: redis::aio::ConnectionManager, ch: clickhouse::Client, db_name: String) -> Self {
        Self {
            local: DashMap::new(),
            redis,
            ch,
            db_name,
        }
    }

    /// Looks up the column list for `table`, in order: local map, Redis,
    /// `system.columns`. `only_remote` bypasses the local tier on read
    /// (used right after a DDL commit to force a fresh remote fetch) but
    /// still repopulates it on success.
    pub async fn lookup(
        &self,
        table: &str,
        excluded: &[&str],
        only_remote: bool,
    ) -> Result<Vec<ColumnDescriptor>> {
        let key = cache_key(&self.db_name, table);

        if !only_remote {
            if let Some(dims) = self.local.get(&key) {
                return Ok(dims.clone());
            }
        }

        if let Some(dims) = self.lookup_redis(&key).await {
            self.local.insert(key.clone(), dims.clone());
            return Ok(dims);
        }

        let dims = self.lookup_clickhouse(table, excluded).await?;
        self.local.insert(key.clone(), dims.clone());
        self.store_redis(&key, &dims).await;
        Ok(dims)
    }

    async fn lookup_redis(&self, key: &str) -> Option<Vec<ColumnDescriptor>> {
        let mut conn = self.redis.clone();
        let blob: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| warn!("redis GET {key} failed: {e}"))
            .ok()?;
        let blob = blob?;
        let mut decoder = GzDecoder::new(&blob[..]);
        let mut json = String::new();
        decoder
            .read_to_string(&mut json)
            .map_err(|e| warn!("gzip decode of {key} failed: {e}"))
            .ok()?;
        serde_json::from_str(&json)
            .map_err(|e| warn!("json decode of {key} failed: {e}"))
            .ok()
    }

    async fn store_redis(&self, key: &str, dims: &[ColumnDescriptor]) {
        let json = match serde_json::to_vec(dims) {
            Ok(j) => j,
            Err(e) => {
                error!("failed to serialize dims for {key}: {e}");
                return;
            }
        };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if let Err(e) = encoder.write_all(&json) {
            error!("failed to gzip dims for {key}: {e}");
            return;
        }
        let compressed = match encoder.finish() {
            Ok(c) => c,
            Err(e) => {
                error!("failed to finalize gzip for {key}: {e}");
                return;
            }
        };
        let mut conn = self.redis.clone();
        if let Err(e) = redis::cmd("SETEX")
            .arg(key)
            .arg(REDIS_TTL_SECS)
            .arg(compressed)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            warn!("redis SETEX {key} failed: {e}");
        }
    }

    async fn lookup_clickhouse(
        &self,
        table: &str,
        excluded: &[&str],
    ) -> Result<Vec<ColumnDescriptor>> {
        #[derive(clickhouse::Row, Deserialize)]
        struct ColumnRow {
            name: String,
            #[serde(rename = "type")]
            type_: String,
            default_kind: String,
        }

        let rows = self
            .ch
            .query(
                "select name, type, default_kind from system.columns where database = ? and table = ?",
            )
            .bind(&self.db_name)
            .bind(table)
            .fetch_all::<ColumnRow>()
            .await?;

        let dims: Vec<ColumnDescriptor> = rows
            .into_iter()
            .filter(|r| r.default_kind != "MATERIALIZED" && !excluded.contains(&r.name.as_str()))
            .map(|r| {
                let (ty, nullable) = which_type(&r.type_);
                ColumnDescriptor {
                    source_name: source_name(&r.name),
                    name: r.name,
                    ty,
                    nullable,
                }
            })
            .collect();

        if dims.is_empty() {
            return Err(SinkerError::TableDoesNotExist(format!(
                "{}.{}",
                self.db_name, table
            )));
        }

        Ok(dims)
    }

    /// Deletes the local entry immediately; the Redis entry is left to
    /// expire naturally or to be cleared by the next sweep, matching the
    /// "lazily refreshed on next miss" invariant.
    pub fn invalidate_local(&self, table: &str) {
        self.local.remove(&cache_key(&self.db_name, table));
    }

    /// One sweep pass: for every locally-cached key, unlink (falling back
    /// to a plain delete) from Redis, then drop it locally.
    pub async fn sweep_once(&self) {
        let keys: Vec<String> = self.local.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let mut conn = self.redis.clone();
            let unlinked: redis::RedisResult<i64> =
                redis::cmd("UNLINK").arg(&key).query_async(&mut conn).await;
            if unlinked.is_err() {
                if let Err(e) = redis::cmd("DEL")
                    .arg(&key)
                    .query_async::<_, i64>(&mut conn)
                    .await
                {
                    error!("cache sweep: failed to clear {key} from redis: {e}");
                }
            }
            self.local.remove(&key);
        }
    }
}

/// Spawns the periodic eviction sweeper (default period: 30 minutes).
pub fn spawn_sweeper(cache: Arc<ColumnMetadataCache>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            debug!("running column-metadata cache sweep");
            cache.sweep_once().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_matches_expected_format() {
        assert_eq!(cache_key("bi", "event_17"), "dimsHash_bi_event_17");
    }

    #[test]
    fn source_name_escapes_dot() {
        assert_eq!(source_name("a.b"), "a\\.b");
    }

    #[test]
    fn column_type_roundtrips_through_serde() {
        let dims = vec![ColumnDescriptor {
            name: "amount".to_string(),
            ty: ColumnType::Float,
            nullable: false,
            source_name: "amount".to_string(),
        }];
        let json = serde_json::to_string(&dims).unwrap();
        let back: Vec<ColumnDescriptor> = serde_json::from_str(&json).unwrap();
        assert_eq!(dims, back);
    }
}
