//! Redpanda tick-feed consumer.
//!
//! Reads market ticks from a single topic partition and submits them to the
//! ingestion pipeline. Offsets advance only after a fetched batch has been
//! accepted, so a crash or backpressure replays rather than loses ticks.
//!
//! Message values are either a JSON record or line-protocol text.

use crate::config::FeedConfig;
use crate::line_protocol;
use crate::pipeline::IngestionPipeline;
use chrono::Utc;
use engine_core::{Error, Record, Result};
use rskafka::client::{
    partition::{OffsetAt, PartitionClient, UnknownTopicHandling},
    ClientBuilder, Credentials, SaslConfig,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Creates a TLS configuration for Redpanda Cloud.
fn create_tls_config() -> Arc<rustls::ClientConfig> {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
}

/// Build a cluster client with TLS + SASL when credentials are configured.
pub(crate) async fn connect(config: &FeedConfig) -> Result<rskafka::client::Client> {
    let mut builder = ClientBuilder::new(config.brokers.clone());

    if let (Some(username), Some(password)) = (&config.sasl_username, &config.sasl_password) {
        builder = builder
            .tls_config(create_tls_config())
            .sasl_config(SaslConfig::ScramSha256(Credentials::new(
                username.clone(),
                password.clone(),
            )));
    }

    builder
        .build()
        .await
        .map_err(|e| Error::broker_unavailable(format!("Failed to connect to Redpanda: {}", e)))
}

/// Position to resume from after a batch is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    pub partition: i32,
    pub offset: i64,
}

/// Decode one message value.
pub fn decode_tick(value: &[u8]) -> Result<Vec<Record>> {
    if let Ok(record) = serde_json::from_slice::<Record>(value) {
        return Ok(vec![record]);
    }
    let text = std::str::from_utf8(value)
        .map_err(|e| Error::serialization(format!("tick is neither JSON nor UTF-8: {}", e)))?;
    line_protocol::parse(text, Utc::now())
}

/// Single-partition tick consumer.
pub struct TickFeed {
    config: FeedConfig,
    partition_client: RwLock<Option<Arc<PartitionClient>>>,
    /// Next offset to read; -1 until initialized.
    current_offset: AtomicI64,
}

impl TickFeed {
    pub fn new(config: FeedConfig) -> Self {
        info!(
            topic = %config.topic,
            partition = config.partition,
            batch_size = config.batch_size,
            "Creating tick feed consumer"
        );

        Self {
            config,
            partition_client: RwLock::new(None),
            current_offset: AtomicI64::new(-1),
        }
    }

    async fn ensure_connected(&self) -> Result<Arc<PartitionClient>> {
        if let Some(client) = self.partition_client.read().await.as_ref() {
            return Ok(client.clone());
        }

        let client = connect(&self.config).await?;
        let partition_client = client
            .partition_client(
                self.config.topic.clone(),
                self.config.partition,
                UnknownTopicHandling::Error,
            )
            .await
            .map_err(|e| {
                Error::broker_unavailable(format!("Failed to get partition client: {}", e))
            })?;
        let partition_client = Arc::new(partition_client);

        if self.current_offset.load(Ordering::SeqCst) < 0 {
            let at = if self.config.from_beginning {
                OffsetAt::Earliest
            } else {
                OffsetAt::Latest
            };
            let offset = partition_client
                .get_offset(at)
                .await
                .map_err(|e| Error::broker_unavailable(format!("Failed to get offset: {}", e)))?;
            self.current_offset.store(offset, Ordering::SeqCst);

            info!(
                topic = %self.config.topic,
                partition = self.config.partition,
                offset,
                "Tick feed initialized at offset"
            );
        }

        *self.partition_client.write().await = Some(partition_client.clone());
        Ok(partition_client)
    }

    /// Fetch the next batch of ticks.
    ///
    /// Returns the decoded records and the offset to commit once they are
    /// accepted. Undecodable messages are skipped and counted.
    pub async fn fetch_batch(&self) -> Result<(Vec<Record>, Option<Offset>)> {
        let client = self.ensure_connected().await?;

        let start = std::time::Instant::now();
        let max_wait_ms = self.config.batch_timeout_ms.min(i32::MAX as u64) as i32;
        let max_bytes = (self.config.batch_size * 1024).min(i32::MAX as usize) as i32;
        let current = self.current_offset.load(Ordering::SeqCst);

        let (fetched, _high_watermark) = client
            .fetch_records(current, 1..max_bytes, max_wait_ms)
            .await
            .map_err(|e| Error::broker_unavailable(format!("Failed to fetch ticks: {}", e)))?;

        if fetched.is_empty() {
            return Ok((Vec::new(), None));
        }

        let mut records = Vec::with_capacity(fetched.len());
        let mut errors = 0u64;
        let mut max_offset = current;

        for fetched_record in fetched {
            max_offset = max_offset.max(fetched_record.offset);
            let Some(value) = fetched_record.record.value else {
                continue;
            };
            match decode_tick(&value) {
                Ok(decoded) => records.extend(decoded),
                Err(e) => {
                    errors += 1;
                    warn!(offset = fetched_record.offset, error = %e, "Skipping undecodable tick");
                }
            }
        }

        metrics().feed_records_consumed.inc_by(records.len() as u64);
        if errors > 0 {
            metrics().feed_errors.inc_by(errors);
        }

        debug!(
            records = records.len(),
            errors,
            offset_start = current,
            offset_end = max_offset,
            latency_ms = %start.elapsed().as_millis(),
            "Fetched tick batch"
        );

        Ok((
            records,
            Some(Offset {
                partition: self.config.partition,
                offset: max_offset + 1,
            }),
        ))
    }

    /// Advance past a processed batch.
    pub fn commit(&self, offset: Offset) {
        let prev = self.current_offset.swap(offset.offset, Ordering::SeqCst);
        debug!(
            partition = offset.partition,
            prev_offset = prev,
            new_offset = offset.offset,
            "Committed tick offset"
        );
    }

    pub fn current_offset(&self) -> i64 {
        self.current_offset.load(Ordering::SeqCst)
    }

    /// Drop the cached connection after a transport error.
    pub async fn reset_connection(&self) {
        *self.partition_client.write().await = None;
        info!("Tick feed connection reset");
    }

    /// Spawn the consume loop feeding `pipeline`.
    pub fn start(
        self: Arc<Self>,
        pipeline: Arc<IngestionPipeline>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(topic = %self.config.topic, "Tick feed started");
            let mut pending: Option<(Vec<Record>, Option<Offset>)> = None;
            let mut error_backoff = Duration::from_millis(500);

            while !cancel.is_cancelled() {
                let (records, offset) = match pending.take() {
                    Some(batch) => batch,
                    None => {
                        let fetched = tokio::select! {
                            _ = cancel.cancelled() => break,
                            fetched = self.fetch_batch() => fetched,
                        };
                        match fetched {
                            Ok(batch) => {
                                error_backoff = Duration::from_millis(500);
                                batch
                            }
                            Err(e) => {
                                error!(error = %e, backoff_ms = %error_backoff.as_millis(), "Tick fetch failed");
                                self.reset_connection().await;
                                tokio::select! {
                                    _ = cancel.cancelled() => break,
                                    _ = tokio::time::sleep(error_backoff) => {}
                                }
                                error_backoff = (error_backoff * 2).min(Duration::from_secs(30));
                                continue;
                            }
                        }
                    }
                };

                match pipeline.submit_many(records.clone()) {
                    Ok(_) => {
                        if let Some(offset) = offset {
                            self.commit(offset);
                        }
                    }
                    Err(Error::Backpressure { occupancy, .. }) => {
                        // Hold the batch and offset until the buffer drains.
                        debug!(occupancy, "Tick feed paused by backpressure");
                        pending = Some((records, offset));
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pipeline.config().max_wait() / 4) => {}
                        }
                    }
                    Err(e) => {
                        // Invalid ticks: skip the batch rather than stall the feed.
                        warn!(records = records.len(), error = %e, "Dropping rejected tick batch");
                        if let Some(offset) = offset {
                            self.commit(offset);
                        }
                    }
                }
            }

            info!(offset = self.current_offset(), "Tick feed stopped");
        })
    }
}
