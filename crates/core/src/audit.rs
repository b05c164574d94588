use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::gateway::{AuditGateway, GatewayError};
use crate::retry::RetryPolicy;

/// Append-only record of one processed interaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub user: String,
    pub activity_type: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub correlation_id: String,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        user: impl Into<String>,
        activity_type: impl Into<String>,
        entity_type: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            activity_type: activity_type.into(),
            entity_type: entity_type.into(),
            entity_id: None,
            correlation_id: correlation_id.into(),
            metadata: BTreeMap::new(),
            occurred_at: Utc::now(),
        }
    }

    pub fn with_entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }
}

/// Fire-and-forget destination for audit entries. Implementations must not
/// block the caller on I/O.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditLogEntry);

    /// Writer health, for sinks that track it.
    fn health(&self) -> Option<AuditHealthSnapshot> {
        None
    }
}

#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    entries: Arc<Mutex<Vec<AuditLogEntry>>>,
}

impl InMemoryAuditSink {
    pub fn entries(&self) -> Vec<AuditLogEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AuditSink for InMemoryAuditSink {
    fn record(&self, entry: AuditLogEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Audit destination that writes entries to the structured log instead of the
/// database.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditGateway;

#[async_trait]
impl AuditGateway for TracingAuditGateway {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), GatewayError> {
        let metadata = serde_json::to_string(&entry.metadata)
            .map_err(|error| GatewayError::Corrupt(error.to_string()))?;
        info!(
            target: "dona::audit",
            event_name = "audit.entry.recorded",
            correlation_id = %entry.correlation_id,
            user = %entry.user,
            activity_type = %entry.activity_type,
            entity_type = %entry.entity_type,
            entity_id = entry.entity_id.as_deref().unwrap_or("none"),
            metadata = %metadata,
            occurred_at = %entry.occurred_at.to_rfc3339(),
            "audit entry"
        );
        Ok(())
    }

    async fn list_for_user(
        &self,
        _user: &str,
        _limit: u32,
    ) -> Result<Vec<AuditLogEntry>, GatewayError> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Debug)]
pub struct AuditWriterConfig {
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Consecutive failed writes after which the writer reports itself degraded.
    pub alert_after_failures: u64,
}

impl Default for AuditWriterConfig {
    fn default() -> Self {
        Self { queue_capacity: 1_024, retry: RetryPolicy::default(), alert_after_failures: 5 }
    }
}

#[derive(Debug, Default)]
struct AuditHealth {
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    consecutive_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuditHealthSnapshot {
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
    pub consecutive_failures: u64,
    pub degraded: bool,
}

enum AuditCommand {
    Record(AuditLogEntry),
    Flush(oneshot::Sender<()>),
}

/// Queues audit entries for a single background worker so that the request
/// path never waits on storage. One worker keeps entries in arrival order.
#[derive(Clone)]
pub struct AuditWriter {
    sender: mpsc::Sender<AuditCommand>,
    health: Arc<AuditHealth>,
    alert_after_failures: u64,
}

impl AuditWriter {
    pub fn spawn(
        gateway: Arc<dyn AuditGateway>,
        config: AuditWriterConfig,
    ) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let health = Arc::new(AuditHealth::default());
        let worker = AuditWorker {
            gateway,
            retry: config.retry,
            health: health.clone(),
            alert_after_failures: config.alert_after_failures,
        };
        let handle = tokio::spawn(worker.run(receiver));

        (Self { sender, health, alert_after_failures: config.alert_after_failures }, handle)
    }

    /// Resolves once every entry queued before this call has been handled.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(AuditCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    pub fn health(&self) -> AuditHealthSnapshot {
        let consecutive_failures = self.health.consecutive_failures.load(Ordering::Relaxed);
        AuditHealthSnapshot {
            written: self.health.written.load(Ordering::Relaxed),
            failed: self.health.failed.load(Ordering::Relaxed),
            dropped: self.health.dropped.load(Ordering::Relaxed),
            consecutive_failures,
            degraded: consecutive_failures >= self.alert_after_failures,
        }
    }
}

impl AuditSink for AuditWriter {
    fn health(&self) -> Option<AuditHealthSnapshot> {
        Some(AuditWriter::health(self))
    }

    fn record(&self, entry: AuditLogEntry) {
        let correlation_id = entry.correlation_id.clone();
        if let Err(error) = self.sender.try_send(AuditCommand::Record(entry)) {
            let dropped = self.health.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            let reason = match error {
                mpsc::error::TrySendError::Full(_) => "queue_full",
                mpsc::error::TrySendError::Closed(_) => "writer_stopped",
            };
            warn!(
                event_name = "audit.writer.entry_dropped",
                correlation_id = %correlation_id,
                reason,
                dropped_total = dropped,
                "audit entry dropped"
            );
        }
    }
}

struct AuditWorker {
    gateway: Arc<dyn AuditGateway>,
    retry: RetryPolicy,
    health: Arc<AuditHealth>,
    alert_after_failures: u64,
}

impl AuditWorker {
    async fn run(self, mut receiver: mpsc::Receiver<AuditCommand>) {
        while let Some(command) = receiver.recv().await {
            match command {
                AuditCommand::Record(entry) => self.write(entry).await,
                AuditCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!(event_name = "audit.writer.stopped", "audit writer queue closed");
    }

    async fn write(&self, entry: AuditLogEntry) {
        let gateway = self.gateway.as_ref();
        let pending = &entry;
        let result = self
            .retry
            .run("audit.append", GatewayError::is_transient, move || gateway.append(pending))
            .await;

        match result {
            Ok(()) => {
                self.health.written.fetch_add(1, Ordering::Relaxed);
                self.health.consecutive_failures.store(0, Ordering::Relaxed);
            }
            Err(write_error) => {
                self.health.failed.fetch_add(1, Ordering::Relaxed);
                let consecutive =
                    self.health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    event_name = "audit.writer.write_failed",
                    correlation_id = %entry.correlation_id,
                    activity_type = %entry.activity_type,
                    consecutive_failures = consecutive,
                    error = %write_error,
                    "audit entry could not be persisted"
                );
                if consecutive >= self.alert_after_failures {
                    error!(
                        event_name = "audit.writer.degraded",
                        consecutive_failures = consecutive,
                        threshold = self.alert_after_failures,
                        "audit trail is failing repeatedly"
                    );
                }
            }
        }
    }
}
