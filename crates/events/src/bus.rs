//! Command log abstraction (mechanics only).
//!
//! The write path hands envelopes to a [`CommandPublisher`]; a single consumer
//! pulls them back through a [`CommandSource`] and commits each record only
//! after it has been applied.
//!
//! ## Delivery contract
//!
//! - **At-least-once**: a record may be delivered again after a crash, a
//!   failed apply or an explicit [`CommandSource::rewind`]. Consumers must be
//!   idempotent.
//! - **FIFO per key**: publishers key records by `product_id`, so every
//!   envelope for one product lands on the same partition in publish order.
//! - **Manual commit**: nothing advances the committed offset except
//!   [`CommandSource::commit`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::CommandEnvelope;

/// Where a record lives in the log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl RecordPosition {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl core::fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A raw record pulled from the log (not yet decoded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    position: RecordPosition,
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

impl InboundRecord {
    pub fn new(position: RecordPosition, key: Option<Vec<u8>>, payload: Vec<u8>) -> Self {
        Self {
            position,
            key,
            payload,
        }
    }

    pub fn position(&self) -> &RecordPosition {
        &self.position
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Error reported by the broker in place of a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    /// Logical end of a partition; informational.
    #[error("reached end of partition {partition}")]
    EndOfPartition { partition: i32 },

    /// Any other broker-side failure.
    #[error("broker error: {0}")]
    Broker(String),
}

/// Failure to move the consumer-group cursor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("seek failed: {0}")]
    Seek(String),
}

/// The command did not reach the broker's durability boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("failed to enqueue record: {0}")]
    Enqueue(String),

    #[error("failed to flush producer: {0}")]
    Flush(String),
}

/// A record that could not be processed and is parked outside the main topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub position: RecordPosition,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub reason: String,
}

impl DeadLetter {
    pub fn from_record(record: &InboundRecord, reason: impl Into<String>) -> Self {
        Self {
            position: record.position().clone(),
            key: record.key().map(<[u8]>::to_vec),
            payload: record.payload().to_vec(),
            reason: reason.into(),
        }
    }
}

/// Write side of the command log.
///
/// `publish()` returns once the record has been handed to the broker client
/// and its local buffer flushed; it does not wait for the consumer to apply
/// it. Broker acknowledgement is reported out-of-band (logged by the
/// implementation), never to the caller.
///
/// Implementations must be safe to call concurrently from many request
/// handlers (`&self`, `Send + Sync`).
pub trait CommandPublisher: Send + Sync {
    fn publish(&self, envelope: &CommandEnvelope) -> Result<(), PublishError>;
}

impl<P> CommandPublisher for Arc<P>
where
    P: CommandPublisher + ?Sized,
{
    fn publish(&self, envelope: &CommandEnvelope) -> Result<(), PublishError> {
        (**self).publish(envelope)
    }
}

/// Destination for records the consumer gave up on.
pub trait DeadLetterSink: Send + Sync {
    fn dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError>;
}

impl<D> DeadLetterSink for Arc<D>
where
    D: DeadLetterSink + ?Sized,
{
    fn dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError> {
        (**self).dead_letter(letter)
    }
}

/// Read side of the command log, bound to one consumer group.
///
/// A source is owned by exactly one consumer loop; methods take `&mut self`.
#[async_trait::async_trait]
pub trait CommandSource: Send {
    /// Wait up to `timeout` for the next record.
    ///
    /// `Ok(None)` means the timeout elapsed with nothing to deliver.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>, RecordError>;

    /// Synchronously commit `position` as processed (the group resumes after it).
    async fn commit(&mut self, position: &RecordPosition) -> Result<(), SourceError>;

    /// Move the read cursor back so that `position` is delivered again.
    async fn rewind(&mut self, position: &RecordPosition) -> Result<(), SourceError>;

    /// Leave the group and release the underlying client.
    async fn close(&mut self);
}
