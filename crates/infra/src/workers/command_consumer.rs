use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use catalog_core::ProductId;
use catalog_events::{
    Action, CommandEnvelope, CommandSource, DeadLetter, DeadLetterSink, DecodeError, InboundRecord,
    PublishError, RecordError, RecordPosition, SourceError,
};

use crate::read_model::{ProjectionStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub poll_timeout: Duration,
    /// Decode failures tolerated for one record before it is dead-lettered.
    pub max_decode_attempts: u32,
    /// Pause after a failed record before polling again.
    pub retry_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            max_decode_attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Polling,
    Processing,
    Committing,
}

/// A record that reached the store and had its offset committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub action: Action,
    pub product_id: ProductId,
    /// Records touched by the store call; `0` for update/delete of a missing product.
    pub affected: u64,
    pub position: RecordPosition,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("failed to decode command: {0}")]
    Decode(#[from] DecodeError),

    #[error("failed to apply command: {0}")]
    Store(#[from] StoreError),

    #[error("failed to commit offset: {0}")]
    Commit(SourceError),

    #[error("failed to rewind for redelivery: {0}")]
    Rewind(SourceError),

    #[error("failed to dead-letter record: {0}")]
    DeadLetter(#[from] PublishError),
}

/// Outcome of one pass through the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The poll timed out with nothing to deliver.
    Idle,
    EndOfPartition { partition: i32 },
    BrokerError(RecordError),
    Committed(Applied),
    DeadLettered { position: RecordPosition, reason: String },
    /// Nothing was committed; the record will be delivered again.
    Failed { position: RecordPosition, error: ProcessError },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub applied: u64,
    pub committed: u64,
    pub dead_lettered: u64,
    pub failed: u64,
    pub broker_errors: u64,
    pub idle_polls: u64,
}

/// Single-consumer apply loop: poll, decode, apply to the store, commit.
///
/// - One record in flight at a time
/// - The offset is committed only after the store call succeeded
/// - Any failure rewinds the source so the same record comes back
/// - Records that never decode are dead-lettered after a bounded number of attempts
pub struct CommandConsumer<Src, St, Dlq> {
    source: Src,
    store: St,
    dead_letters: Dlq,
    settings: ConsumerSettings,
    state: LoopState,
    stats: ConsumerStats,
    /// Failed decodes per `(topic, partition)`: the offset that failed and how often.
    decode_failures: HashMap<(String, i32), (i64, u32)>,
    pending_rewind: Option<RecordPosition>,
}

impl<Src, St, Dlq> CommandConsumer<Src, St, Dlq>
where
    Src: CommandSource,
    St: ProjectionStore,
    Dlq: DeadLetterSink,
{
    pub fn new(source: Src, store: St, dead_letters: Dlq, settings: ConsumerSettings) -> Self {
        Self {
            source,
            store,
            dead_letters,
            settings,
            state: LoopState::Polling,
            stats: ConsumerStats::default(),
            decode_failures: HashMap::new(),
            pending_rewind: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Run until `shutdown` resolves, then close the source and the store.
    ///
    /// Shutdown only interrupts polling. A record already being processed
    /// always finishes (committed or left for redelivery) first.
    pub async fn run<F>(mut self, shutdown: F) -> ConsumerStats
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            poll_timeout_ms = u64::try_from(self.settings.poll_timeout.as_millis()).unwrap_or(u64::MAX),
            max_decode_attempts = self.settings.max_decode_attempts,
            "command consumer started"
        );

        loop {
            let polled = tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("shutdown requested; stopping command consumer");
                    break;
                }
                polled = self.poll_source() => polled,
            };

            if let Ok(record) = polled {
                self.process(record).await;
            }
        }

        self.source.close().await;
        self.store.close().await;

        let stats = self.stats;
        info!(
            applied = stats.applied,
            committed = stats.committed,
            dead_lettered = stats.dead_lettered,
            failed = stats.failed,
            broker_errors = stats.broker_errors,
            "command consumer stopped"
        );
        stats
    }

    /// Run exactly one poll/process/commit pass.
    pub async fn poll_once(&mut self) -> Step {
        match self.poll_source().await {
            Ok(record) => self.process(record).await,
            Err(step) => step,
        }
    }

    /// Poll for the next record. Anything other than a record is returned
    /// as the finished [`Step`].
    async fn poll_source(&mut self) -> Result<InboundRecord, Step> {
        self.state = LoopState::Polling;

        if let Some(position) = self.pending_rewind.clone() {
            if let Err(err) = self.source.rewind(&position).await {
                error!(%position, error = %err, "rewind still failing; holding position");
                self.stats.failed += 1;
                tokio::time::sleep(self.settings.retry_backoff).await;
                return Err(Step::Failed {
                    position,
                    error: ProcessError::Rewind(err),
                });
            }
            self.pending_rewind = None;
        }

        match self.source.poll(self.settings.poll_timeout).await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => {
                self.stats.idle_polls += 1;
                Err(Step::Idle)
            }
            Err(RecordError::EndOfPartition { partition }) => {
                debug!(partition, "reached end of partition");
                Err(Step::EndOfPartition { partition })
            }
            Err(err) => {
                self.stats.broker_errors += 1;
                error!(error = %err, "broker reported a record error");
                Err(Step::BrokerError(err))
            }
        }
    }

    async fn process(&mut self, record: InboundRecord) -> Step {
        self.state = LoopState::Processing;
        let position = record.position().clone();

        let envelope = match CommandEnvelope::decode(record.payload()) {
            Ok(envelope) => envelope,
            Err(err) => return self.on_decode_failure(&record, err).await,
        };

        let affected = match self.apply(&envelope).await {
            Ok(affected) => affected,
            Err(err) => return self.fail(position, ProcessError::Store(err)).await,
        };
        self.stats.applied += 1;

        if affected == 0 && envelope.action() != Action::Create {
            warn!(
                product_id = %envelope.product_id(),
                action = envelope.action().as_str(),
                "product not found; nothing applied"
            );
        }

        if let Err(err) = self.commit(&position).await {
            return self.fail(position, err).await;
        }

        info!(
            product_id = %envelope.product_id(),
            action = envelope.action().as_str(),
            affected,
            %position,
            "applied command"
        );
        self.state = LoopState::Polling;
        Step::Committed(Applied {
            action: envelope.action(),
            product_id: envelope.product_id().clone(),
            affected,
            position,
        })
    }

    async fn apply(&self, envelope: &CommandEnvelope) -> Result<u64, StoreError> {
        let product_id = envelope.product_id();
        match envelope.action() {
            Action::Create => self.store.upsert(product_id, envelope.payload()).await,
            Action::Update => self.store.merge(product_id, envelope.payload()).await,
            Action::Delete => self.store.remove(product_id).await,
        }
    }

    async fn commit(&mut self, position: &RecordPosition) -> Result<(), ProcessError> {
        self.state = LoopState::Committing;
        self.source
            .commit(position)
            .await
            .map_err(ProcessError::Commit)?;
        self.stats.committed += 1;

        let partition = (position.topic.clone(), position.partition);
        let passed_failure = self
            .decode_failures
            .get(&partition)
            .is_some_and(|&(failed_at, _)| failed_at <= position.offset);
        if passed_failure {
            self.decode_failures.remove(&partition);
        }
        Ok(())
    }

    async fn on_decode_failure(&mut self, record: &InboundRecord, err: DecodeError) -> Step {
        let position = record.position().clone();
        let partition = (position.topic.clone(), position.partition);
        let attempts = match self.decode_failures.get(&partition) {
            Some(&(failed_at, count)) if failed_at == position.offset => count + 1,
            _ => 1,
        };
        self.decode_failures.insert(partition, (position.offset, attempts));

        warn!(
            %position,
            attempts,
            max_attempts = self.settings.max_decode_attempts,
            error = %err,
            "failed to decode command"
        );
        if attempts < self.settings.max_decode_attempts {
            return self.fail(position, ProcessError::Decode(err)).await;
        }

        let reason = err.to_string();
        let letter = DeadLetter::from_record(record, reason.clone());
        if let Err(dlq_err) = self.dead_letters.dead_letter(&letter) {
            return self.fail(position, ProcessError::DeadLetter(dlq_err)).await;
        }

        if let Err(commit_err) = self.commit(&position).await {
            return self.fail(position, commit_err).await;
        }

        self.stats.dead_lettered += 1;
        error!(%position, reason = %reason, "dead-lettered undecodable command");
        self.state = LoopState::Polling;
        Step::DeadLettered { position, reason }
    }

    /// Leave the record uncommitted and arrange for it to be delivered again.
    async fn fail(&mut self, position: RecordPosition, error: ProcessError) -> Step {
        self.stats.failed += 1;
        error!(%position, error = %error, "command not committed; will retry");

        if let Err(err) = self.source.rewind(&position).await {
            error!(%position, error = %err, "failed to rewind source");
            self.pending_rewind = Some(position.clone());
        }

        tokio::time::sleep(self.settings.retry_backoff).await;
        self.state = LoopState::Polling;
        Step::Failed { position, error }
    }
}
