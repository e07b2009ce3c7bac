//! In-memory command log for tests/dev.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bus::{
    CommandPublisher, CommandSource, DeadLetter, DeadLetterSink, InboundRecord, PublishError,
    RecordError, RecordPosition, SourceError,
};
use crate::CommandEnvelope;

const PARTITION: i32 = 0;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct LogState {
    records: Vec<StoredRecord>,
    /// Next offset the group resumes from.
    committed: i64,
    commit_history: Vec<i64>,
    injected: VecDeque<RecordError>,
    failing_commits: u32,
    failing_publishes: u32,
    closed_sources: u32,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<LogState>,
    notify: Notify,
}

/// Single-partition, single-group command log.
///
/// - No IO
/// - Cloning yields another handle to the same log
/// - New sources resume from the committed offset (consumer-group semantics)
/// - Failure injection hooks for records, commits and publishes
#[derive(Debug, Clone)]
pub struct InMemoryCommandLog {
    topic: Arc<str>,
    shared: Arc<Shared>,
}

impl InMemoryCommandLog {
    pub fn new(topic: impl AsRef<str>) -> Self {
        Self {
            topic: Arc::from(topic.as_ref()),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append raw bytes, bypassing the envelope codec. Returns the offset.
    pub fn append_raw(&self, key: Option<&[u8]>, payload: impl Into<Vec<u8>>) -> i64 {
        let offset = {
            let mut state = self.state();
            state.records.push(StoredRecord {
                key: key.map(<[u8]>::to_vec),
                payload: payload.into(),
            });
            state.records.len() as i64 - 1
        };
        self.shared.notify.notify_one();
        offset
    }

    /// Deliver `error` on the next poll instead of a record.
    pub fn inject_error(&self, error: RecordError) {
        self.state().injected.push_back(error);
        self.shared.notify.notify_one();
    }

    pub fn fail_next_commits(&self, count: u32) {
        self.state().failing_commits = count;
    }

    pub fn fail_next_publishes(&self, count: u32) {
        self.state().failing_publishes = count;
    }

    /// Offset the group would resume from (one past the last committed record).
    pub fn committed_offset(&self) -> i64 {
        self.state().committed
    }

    /// Every successful commit, in order (as resume offsets).
    pub fn commits(&self) -> Vec<i64> {
        self.state().commit_history.clone()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw payload stored at `offset`.
    pub fn payload_at(&self, offset: i64) -> Option<Vec<u8>> {
        let index = usize::try_from(offset).ok()?;
        self.state().records.get(index).map(|r| r.payload.clone())
    }

    pub fn key_at(&self, offset: i64) -> Option<Vec<u8>> {
        let index = usize::try_from(offset).ok()?;
        self.state().records.get(index).and_then(|r| r.key.clone())
    }

    /// Number of sources that have been closed.
    pub fn closed_sources(&self) -> u32 {
        self.state().closed_sources
    }

    /// Join the consumer group; reading starts at the committed offset.
    pub fn subscribe(&self) -> InMemoryCommandSource {
        let position = self.committed_offset();
        InMemoryCommandSource {
            log: self.clone(),
            position,
            closed: false,
        }
    }
}

impl CommandPublisher for InMemoryCommandLog {
    fn publish(&self, envelope: &CommandEnvelope) -> Result<(), PublishError> {
        {
            let mut state = self.state();
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(PublishError::Enqueue("injected publish failure".to_string()));
            }
        }

        let bytes = envelope
            .encode()
            .map_err(|e| PublishError::Encode(e.to_string()))?;
        self.append_raw(Some(envelope.product_id().as_str().as_bytes()), bytes);
        Ok(())
    }
}

/// Consumer handle over an [`InMemoryCommandLog`].
#[derive(Debug)]
pub struct InMemoryCommandSource {
    log: InMemoryCommandLog,
    position: i64,
    closed: bool,
}

impl InMemoryCommandSource {
    /// Offset of the next record this source will deliver.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn next_delivery(&mut self) -> Option<Result<InboundRecord, RecordError>> {
        let mut state = self.log.state();
        if let Some(err) = state.injected.pop_front() {
            return Some(Err(err));
        }

        let index = usize::try_from(self.position).ok()?;
        let stored = state.records.get(index)?.clone();
        drop(state);

        let position = RecordPosition::new(self.log.topic(), PARTITION, self.position);
        self.position += 1;
        Some(Ok(InboundRecord::new(position, stored.key, stored.payload)))
    }
}

#[async_trait::async_trait]
impl CommandSource for InMemoryCommandSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>, RecordError> {
        if self.closed {
            return Err(RecordError::Broker("source is closed".to_string()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(delivery) = self.next_delivery() {
                return delivery.map(Some);
            }

            // notify_one() stores a permit, so a publish racing this wait is not lost.
            let wait = tokio::time::timeout_at(deadline, self.log.shared.notify.notified());
            if wait.await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, position: &RecordPosition) -> Result<(), SourceError> {
        let mut state = self.log.state();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(SourceError::Commit("injected commit failure".to_string()));
        }

        let resume_at = position.offset + 1;
        state.committed = state.committed.max(resume_at);
        state.commit_history.push(resume_at);
        Ok(())
    }

    async fn rewind(&mut self, position: &RecordPosition) -> Result<(), SourceError> {
        if position.offset < 0 {
            return Err(SourceError::Seek(format!("negative offset {}", position.offset)));
        }
        self.position = position.offset;
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.state().closed_sources += 1;
        }
    }
}

/// Collects dead letters in memory.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
    failing: Mutex<u32>,
}

impl InMemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    pub fn fail_next(&self, count: u32) {
        if let Ok(mut failing) = self.failing.lock() {
            *failing = count;
        }
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError> {
        if let Ok(mut failing) = self.failing.lock() {
            if *failing > 0 {
                *failing -= 1;
                return Err(PublishError::Enqueue("injected dead-letter failure".to_string()));
            }
        }

        self.letters
            .lock()
            .map_err(|_| PublishError::Enqueue("dead-letter store poisoned".to_string()))?
            .push(letter.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::ProductId;

    const TICK: Duration = Duration::from_millis(20);

    fn delete(id: &str) -> CommandEnvelope {
        CommandEnvelope::delete(ProductId::new(id).unwrap())
    }

    #[tokio::test]
    async fn publish_keys_records_by_product_id() {
        let log = InMemoryCommandLog::new("products");
        log.publish(&delete("prod_7")).unwrap();

        let mut source = log.subscribe();
        let record = source.poll(TICK).await.unwrap().unwrap();

        assert_eq!(record.key(), Some("prod_7".as_bytes()));
        assert_eq!(record.position(), &RecordPosition::new("products", 0, 0));
        assert_eq!(CommandEnvelope::decode(record.payload()).unwrap(), delete("prod_7"));
    }

    #[tokio::test]
    async fn poll_times_out_when_empty() {
        let log = InMemoryCommandLog::new("products");
        let mut source = log.subscribe();

        assert_eq!(source.poll(TICK).await, Ok(None));
    }

    #[tokio::test]
    async fn poll_wakes_up_on_publish() {
        let log = InMemoryCommandLog::new("products");
        let mut source = log.subscribe();

        let publisher = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(&delete("prod_1")).unwrap();
        });

        let record = source.poll(Duration::from_secs(2)).await.unwrap();
        assert!(record.is_some());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn new_subscriber_resumes_from_committed_offset() {
        let log = InMemoryCommandLog::new("products");
        log.publish(&delete("prod_1")).unwrap();
        log.publish(&delete("prod_2")).unwrap();

        let mut first = log.subscribe();
        let record = first.poll(TICK).await.unwrap().unwrap();
        first.commit(record.position()).await.unwrap();
        // Second record delivered but never committed.
        let _ = first.poll(TICK).await.unwrap().unwrap();
        first.close().await;

        let mut second = log.subscribe();
        let redelivered = second.poll(TICK).await.unwrap().unwrap();
        assert_eq!(redelivered.position().offset, 1);
        assert_eq!(log.committed_offset(), 1);
        assert_eq!(log.closed_sources(), 1);
    }

    #[tokio::test]
    async fn rewind_redelivers() {
        let log = InMemoryCommandLog::new("products");
        log.publish(&delete("prod_1")).unwrap();

        let mut source = log.subscribe();
        let record = source.poll(TICK).await.unwrap().unwrap();
        source.rewind(record.position()).await.unwrap();

        let again = source.poll(TICK).await.unwrap().unwrap();
        assert_eq!(again, record);
    }

    #[tokio::test]
    async fn injected_failures_surface_once() {
        let log = InMemoryCommandLog::new("products");
        log.inject_error(RecordError::EndOfPartition { partition: 0 });
        log.fail_next_commits(1);
        log.fail_next_publishes(1);

        assert!(matches!(log.publish(&delete("prod_1")), Err(PublishError::Enqueue(_))));
        log.publish(&delete("prod_1")).unwrap();

        let mut source = log.subscribe();
        assert_eq!(
            source.poll(TICK).await,
            Err(RecordError::EndOfPartition { partition: 0 })
        );

        let record = source.poll(TICK).await.unwrap().unwrap();
        assert!(source.commit(record.position()).await.is_err());
        assert_eq!(log.committed_offset(), 0);
        source.commit(record.position()).await.unwrap();
        assert_eq!(log.committed_offset(), 1);
    }

    #[test]
    fn dead_letters_are_collected() {
        let sink = InMemoryDeadLetters::new();
        let record = InboundRecord::new(RecordPosition::new("products", 0, 3), None, b"oops".to_vec());
        let letter = DeadLetter::from_record(&record, "malformed");

        sink.fail_next(1);
        assert!(sink.dead_letter(&letter).is_err());
        sink.dead_letter(&letter).unwrap();

        assert_eq!(sink.letters(), vec![letter]);
    }
}
