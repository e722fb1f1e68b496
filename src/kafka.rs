//! Consumer-Group Driver: a single generic consumer task parameterised by
//! a per-message handler, instantiated once per consumer group (real-time
//! and warehouse). Grounded in the source's `StreamConsumer` setup and the
//! original sarama session's mark-after-accept offset discipline.

use std::sync::Arc;

use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::ClientConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::KafkaConfig;
use crate::errors::Result;
use crate::sink::BoxFuture;

/// Owned snapshot of a delivered message's fields, taken immediately so the
/// handler never has to carry rdkafka's borrowed-message lifetime across an
/// `.await`.
pub struct KafkaMessage {
    pub payload: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
}

/// What the driver should do with the originating message's offset once the
/// handler returns. `SkipCommit` is reserved for failures the next delivery
/// should retry (a transient OLAP/DDL error); every other outcome — success,
/// a dropped malformed record, a schema conflict that only cost one column —
/// commits, matching the "never block the partition on one bad record"
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Commit,
    SkipCommit,
}

pub type MessageHandler =
    Arc<dyn Fn(KafkaMessage) -> BoxFuture<'static, HandlerOutcome> + Send + Sync>;

pub struct ConsumerDriver {
    consumer: StreamConsumer,
    group_id: String,
}

impl ConsumerDriver {
    /// Builds a fresh, independent consumer bound to `group_id`. The
    /// warehouse group's driver is constructed with a second call to this
    /// function against the same `KafkaConfig`, not by cloning a live
    /// session — the semantic need behind the source's `Clone()` is a new
    /// consumer, not shared runtime state.
    pub fn new(kafka: &KafkaConfig, group_id: &str) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", kafka.addresses.join(","))
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        if !kafka.username.is_empty() {
            client_config
                .set("security.protocol", "SASL_SSL")
                .set("sasl.mechanisms", "PLAIN")
                .set("sasl.username", &kafka.username)
                .set("sasl.password", &kafka.password);
        }

        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[kafka.report_topic_name.as_str()])?;

        Ok(Self {
            consumer,
            group_id: group_id.to_string(),
        })
    }

    /// Runs until `cancel` fires or the stream closes. `handler` is invoked
    /// for every delivered message and returns a `HandlerOutcome`; the
    /// offset is marked at most once, after `handler` returns, and only
    /// when that outcome is `Commit`. A `SkipCommit` leaves the stored
    /// offset where it was so the message is redelivered — used for the
    /// one failure mode (transient OLAP/DDL error) the partition should
    /// actually retry rather than skip past.
    pub async fn run(&self, cancel: CancellationToken, handler: MessageHandler) {
        let mut stream = self.consumer.stream();
        info!(group = %self.group_id, "consumer driver starting");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(group = %self.group_id, "consumer driver observed cancellation");
                    break;
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(borrowed)) => {
                            let msg = KafkaMessage {
                                payload: borrowed.payload().map(|p| p.to_vec()).unwrap_or_default(),
                                partition: borrowed.partition(),
                                offset: borrowed.offset(),
                            };
                            match handler(msg).await {
                                HandlerOutcome::Commit => {
                                    if let Err(e) = self.consumer.commit_message(&borrowed, CommitMode::Async) {
                                        error!(group = %self.group_id, "commit failed: {e}");
                                    }
                                }
                                HandlerOutcome::SkipCommit => {
                                    warn!(
                                        group = %self.group_id,
                                        partition = borrowed.partition(),
                                        offset = borrowed.offset(),
                                        "transient failure, leaving offset uncommitted for retry",
                                    );
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(group = %self.group_id, "stream error, retrying: {e}");
                        }
                        None => {
                            info!(group = %self.group_id, "consumer stream closed");
                            break;
                        }
                    }
                }
            }
        }
    }
}
