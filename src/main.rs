mod audit;
mod cache;
mod config;
mod ddl;
mod enrich;
mod errors;
mod geoip;
mod kafka;
mod metadata;
mod metrics;
mod olap;
mod realtime;
mod sink;
mod types;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::audit::AuditRow;
use crate::cache::ColumnMetadataCache;
use crate::config::Config;
use crate::ddl::{DdlSerializer, SchemaReconciler};
use crate::enrich::{EnrichOutcome, Enricher, InboundMessage};
use crate::errors::Result;
use crate::geoip::GeoIp;
use crate::kafka::{ConsumerDriver, HandlerOutcome, KafkaMessage, MessageHandler};
use crate::metadata::MetadataClient;
use crate::metrics::Metrics;
use crate::olap::{OlapRow, ReportType};
use crate::realtime::{LoggingRealTimeIndexClient, RealTimeIndexClient, RealTimeRow};
use crate::sink::{spawn_ticker, BatchSink, BoxFuture};

#[derive(Parser, Debug)]
#[command(name = "sinker", about = "Ingestion core for the behavioural-analytics platform")]
struct Cli {
    #[arg(long = "configFileDir", default_value = "config")]
    config_file_dir: String,
    #[arg(long = "configFileName", default_value = "config")]
    config_file_name: String,
    #[arg(long = "configFileExt", default_value = "json")]
    config_file_ext: String,
}

fn init_logging(cfg: &config::LoggingConfig) {
    let filter = EnvFilter::try_new(&cfg.level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("sinker: startup failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config_file_dir, &cli.config_file_name, &cli.config_file_ext)?;
    init_logging(&config.logging);
    info!("configuration loaded, starting up");

    let ch = clickhouse::Client::default()
        .with_url(&config.comm.clickhouse.url)
        .with_user(&config.comm.clickhouse.username)
        .with_password(&config.comm.clickhouse.password)
        .with_database(&config.comm.clickhouse.db_name);
    info!("olap client constructed");

    let metadata = MetadataClient::connect(&config.comm.mysql.dsn).await?;
    info!("relational metadata store connected");

    let redis_client = redis::Client::open(config.comm.redis.dsn.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    info!("key/value store connected");

    let geoip: Option<Arc<GeoIp>> = if config.comm.geoip_mmdb_path.is_empty() {
        warn!("no geoip_mmdb_path configured; running without geo enrichment");
        None
    } else {
        Some(Arc::new(GeoIp::open(&config.comm.geoip_mmdb_path)?))
    };

    audit::ensure_audit_table_exists(&ch, &config.comm.clickhouse.db_name, &config.comm.clickhouse.cluster_name).await?;

    let cache = Arc::new(ColumnMetadataCache::new(
        redis_conn,
        ch.clone(),
        config.comm.clickhouse.db_name.clone(),
    ));
    let sweeper = cache::spawn_sweeper(Arc::clone(&cache), cache::DEFAULT_SWEEP_PERIOD);

    let (ddl, ddl_handle) = DdlSerializer::spawn(
        ch.clone(),
        config.comm.clickhouse.cluster_name.clone(),
        config.comm.kafka.channel_buffer_size,
    );
    let reconciler = Arc::new(SchemaReconciler::new(
        Arc::clone(&cache),
        ddl.clone(),
        config.comm.clickhouse.db_name.clone(),
    ));
    info!("ddl serializer started");

    let metrics = Arc::new(Metrics::default());

    let olap_sink = build_olap_sink(&config, ch.clone());
    let audit_sink = build_audit_sink(&config, ch.clone());
    let realtime_client: Arc<dyn RealTimeIndexClient> = Arc::new(LoggingRealTimeIndexClient);
    let realtime_sink = build_realtime_sink(&config, Arc::clone(&realtime_client));

    let olap_ticker = spawn_ticker(
        Arc::clone(&olap_sink),
        Duration::from_millis(config.sinker.report_data_to_ck.flush_interval_ms),
    );
    let audit_ticker = spawn_ticker(
        Arc::clone(&audit_sink),
        Duration::from_millis(config.sinker.report_accept_status.flush_interval_ms),
    );
    let realtime_ticker = spawn_ticker(
        Arc::clone(&realtime_sink),
        Duration::from_millis(config.sinker.real_time_warehousing.flush_interval_ms),
    );

    let cancel = CancellationToken::new();

    let real_time_driver = ConsumerDriver::new(&config.comm.kafka, &config.comm.kafka.real_time_data_group)?;
    let warehouse_driver = ConsumerDriver::new(&config.comm.kafka, &config.comm.kafka.report_data_to_ck_group)?;
    info!("consumer-group drivers constructed");

    let status_handle = metrics::maybe_spawn_status_server(Arc::clone(&metrics), config.sinker.pprof_http_port);

    let real_time_handler: MessageHandler = {
        let sink = Arc::clone(&realtime_sink);
        let index_name = config.sinker.real_time_warehousing.index_name.clone();
        let metrics = Arc::clone(&metrics);
        Arc::new(move |msg: KafkaMessage| -> BoxFuture<'static, HandlerOutcome> {
            let sink = Arc::clone(&sink);
            let index_name = index_name.clone();
            let metrics = Arc::clone(&metrics);
            Box::pin(async move { handle_real_time_message(msg, sink, index_name, metrics).await })
        })
    };

    let warehouse_handler: MessageHandler = {
        let olap_sink = Arc::clone(&olap_sink);
        let audit_sink = Arc::clone(&audit_sink);
        let reconciler = Arc::clone(&reconciler);
        let metadata = metadata.clone();
        let geoip = geoip.clone();
        let metrics = Arc::clone(&metrics);
        let db_name = config.comm.clickhouse.db_name.clone();
        let cluster_name = config.comm.clickhouse.cluster_name.clone();
        let shard_key = config.comm.clickhouse.macros_shard_key_name.clone();
        let replica_key = config.comm.clickhouse.macros_replica_key_name.clone();
        let ch = ch.clone();
        Arc::new(move |msg: KafkaMessage| -> BoxFuture<'static, HandlerOutcome> {
            let olap_sink = Arc::clone(&olap_sink);
            let audit_sink = Arc::clone(&audit_sink);
            let reconciler = Arc::clone(&reconciler);
            let metadata = metadata.clone();
            let geoip = geoip.clone();
            let metrics = Arc::clone(&metrics);
            let db_name = db_name.clone();
            let cluster_name = cluster_name.clone();
            let shard_key = shard_key.clone();
            let replica_key = replica_key.clone();
            let ch = ch.clone();
            Box::pin(async move {
                handle_warehouse_message(
                    msg,
                    olap_sink,
                    audit_sink,
                    reconciler,
                    metadata,
                    geoip.as_deref(),
                    metrics,
                    &db_name,
                    &cluster_name,
                    &shard_key,
                    &replica_key,
                    &ch,
                )
                .await
            })
        })
    };

    let real_time_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { real_time_driver.run(cancel, real_time_handler).await })
    };
    let warehouse_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { warehouse_driver.run(cancel, warehouse_handler).await })
    };

    info!("sinker running");
    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping consumer-group drivers");

    cancel.cancel();
    let _ = real_time_task.await;
    let _ = warehouse_task.await;

    olap_sink.flush_all().await;
    realtime_sink.flush_all().await;
    audit_sink.flush_all().await;

    olap_ticker.abort();
    audit_ticker.abort();
    realtime_ticker.abort();
    sweeper.abort();
    ddl_handle.abort();
    if let Some(h) = status_handle {
        h.abort();
    }

    metadata.close().await;
    info!("shutdown complete");
    Ok(())
}

fn build_olap_sink(config: &Config, ch: clickhouse::Client) -> Arc<BatchSink<OlapRow>> {
    let db = config.comm.clickhouse.db_name.clone();
    BatchSink::new(
        "olap",
        config.sinker.report_data_to_ck.batch_size,
        Duration::from_millis(config.sinker.report_data_to_ck.flush_interval_ms),
        Arc::new(move |rows: Vec<OlapRow>| {
            let ch = ch.clone();
            let db = db.clone();
            Box::pin(async move { olap::write_batch(&ch, &db, rows).await })
        }),
    )
}

fn build_audit_sink(config: &Config, ch: clickhouse::Client) -> Arc<BatchSink<AuditRow>> {
    let db = config.comm.clickhouse.db_name.clone();
    BatchSink::new(
        "audit",
        config.sinker.report_accept_status.batch_size,
        Duration::from_millis(config.sinker.report_accept_status.flush_interval_ms),
        Arc::new(move |rows: Vec<AuditRow>| {
            let ch = ch.clone();
            let db = db.clone();
            Box::pin(async move { audit::write_batch(&ch, &db, rows).await })
        }),
    )
}

fn build_realtime_sink(config: &Config, client: Arc<dyn RealTimeIndexClient>) -> Arc<BatchSink<RealTimeRow>> {
    BatchSink::new(
        "real_time_index",
        config.sinker.real_time_warehousing.batch_size,
        Duration::from_millis(config.sinker.real_time_warehousing.flush_interval_ms),
        Arc::new(move |rows: Vec<RealTimeRow>| {
            let client = Arc::clone(&client);
            Box::pin(async move { realtime::write_batch(client.as_ref(), rows).await })
        }),
    )
}

/// Real-time group: parses only enough to route the record, performs no
/// schema work and writes no audit row.
async fn handle_real_time_message(
    msg: KafkaMessage,
    sink: Arc<BatchSink<RealTimeRow>>,
    index_name: String,
    metrics: Arc<Metrics>,
) -> HandlerOutcome {
    metrics.consumed.fetch_add(1, Ordering::Relaxed);

    let inbound: InboundMessage = match serde_json::from_slice(&msg.payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("real-time group: malformed message, dropping: {e}");
            return HandlerOutcome::Commit;
        }
    };

    let table_id: i64 = match inbound.table_id.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(table_id = %inbound.table_id, "real-time group: non-numeric table_id, dropping");
            return HandlerOutcome::Commit;
        }
    };

    sink.add(RealTimeRow {
        index_name,
        table_id,
        event_name: inbound.event_name,
        payload: Value::Object(inbound.req_data),
    })
    .await;

    HandlerOutcome::Commit
}

/// Warehouse group: full Enricher -> Schema Reconciler -> OLAP sink + audit
/// sink, plus a relational-metadata record of the observed event name.
#[allow(clippy::too_many_arguments)]
async fn handle_warehouse_message(
    msg: KafkaMessage,
    olap_sink: Arc<BatchSink<OlapRow>>,
    audit_sink: Arc<BatchSink<AuditRow>>,
    reconciler: Arc<SchemaReconciler>,
    metadata: MetadataClient,
    geoip: Option<&GeoIp>,
    metrics: Arc<Metrics>,
    db_name: &str,
    cluster_name: &str,
    shard_key: &str,
    replica_key: &str,
    ch: &clickhouse::Client,
) -> HandlerOutcome {
    metrics.consumed.fetch_add(1, Ordering::Relaxed);

    let inbound: InboundMessage = match serde_json::from_slice(&msg.payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("warehouse group: malformed message, dropping: {e}");
            return HandlerOutcome::Commit;
        }
    };

    let enricher = Enricher::new(geoip);
    let outcome = enricher.process(&inbound, msg.offset, msg.partition, Utc::now());

    match outcome {
        EnrichOutcome::Unattributable => {
            metrics.dropped_unattributable.fetch_add(1, Ordering::Relaxed);
            HandlerOutcome::Commit
        }
        EnrichOutcome::Rejected(audit_row) => {
            metrics.dropped_validation.fetch_add(1, Ordering::Relaxed);
            audit_sink.add(*audit_row).await;
            HandlerOutcome::Commit
        }
        EnrichOutcome::Accepted {
            table_id,
            report_type,
            event_name,
            payload,
        } => {
            if let Err(e) = ensure_table_once(ch, db_name, cluster_name, shard_key, replica_key, report_type, table_id).await {
                error!(table_id, "failed to ensure table exists, will retry: {e}");
                return HandlerOutcome::SkipCommit;
            }

            let table = report_type.table_name(table_id);
            let dims = match reconciler.reconcile(&table, &payload).await {
                Ok(d) => d,
                Err(e) => {
                    // A genuine schema conflict never reaches here: ddl.rs
                    // swallows it and simply omits the column from `dims`.
                    // An `Err` means the DDL round-trip itself failed
                    // transiently, so the message is retried rather than
                    // dropped.
                    error!(table = %table, "schema reconciliation failed, will retry: {e}");
                    return HandlerOutcome::SkipCommit;
                }
            };

            let report_type_str = match report_type {
                ReportType::Event => "EVENT",
                ReportType::User => "USER",
            };
            let raw_payload_json = serde_json::to_string(&payload).unwrap_or_default();

            let mut columns = BTreeMap::new();
            let mut coercion_audits = Vec::new();
            for dim in &dims {
                if let Some(v) = payload.get(&dim.name) {
                    match types::coerce(v, dim.ty) {
                        Ok(typed) => {
                            columns.insert(dim.name.clone(), typed);
                        }
                        Err(_) => {
                            warn!(table = %table, column = %dim.name, "value does not match column type, coercing to string");
                            // String coercion of a scalar JSON value never fails.
                            if let Ok(typed) = types::coerce(v, ColumnType::String) {
                                columns.insert(dim.name.clone(), typed);
                            }
                            coercion_audits.push(AuditRow::coerced_to_string(
                                Utc::now(),
                                table_id,
                                report_type_str,
                                &event_name,
                                &dim.name,
                                &raw_payload_json,
                                msg.offset,
                            ));
                        }
                    }
                }
            }

            olap_sink.add(OlapRow { table, columns }).await;
            audit_sink
                .add(AuditRow::success(Utc::now(), table_id, report_type_str, &event_name, &raw_payload_json, msg.offset))
                .await;
            for row in coercion_audits {
                audit_sink.add(row).await;
            }

            if let Err(e) = metadata.record_event(table_id, report_type_str, &event_name).await {
                warn!(table_id, "failed to record event metadata: {e}");
            }

            metrics.enriched.fetch_add(1, Ordering::Relaxed);
            HandlerOutcome::Commit
        }
    }
}

async fn ensure_table_once(
    ch: &clickhouse::Client,
    db_name: &str,
    cluster_name: &str,
    shard_key: &str,
    replica_key: &str,
    report_type: ReportType,
    table_id: i64,
) -> Result<()> {
    olap::ensure_table_exists(ch, db_name, cluster_name, shard_key, replica_key, report_type, table_id).await
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate.recv() => {}
    }
}
