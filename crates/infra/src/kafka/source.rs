use std::sync::Arc;
use std::time::Duration;

use rdkafka::Message;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Offset, TopicPartitionList};
use tracing::{info, instrument};

use catalog_events::{CommandSource, InboundRecord, RecordError, RecordPosition, SourceError};

use super::consumer_config;
use crate::config::KafkaConfig;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer-group member reading the command topic with manual commits.
pub struct KafkaCommandSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    group_id: String,
    closed: bool,
}

impl KafkaCommandSource {
    /// Create the consumer and subscribe it to the command topic.
    pub fn subscribe(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = consumer_config(config).create()?;
        consumer.subscribe(&[config.topic.as_str()])?;
        info!(topic = %config.topic, group_id = %config.group_id, "subscribed to command topic");

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: config.topic.clone(),
            group_id: config.group_id.clone(),
            closed: false,
        })
    }
}

#[async_trait::async_trait]
impl CommandSource for KafkaCommandSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<InboundRecord>, RecordError> {
        if self.closed {
            return Err(RecordError::Broker("source is closed".to_string()));
        }

        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(message)) => Ok(Some(inbound_record(&message))),
            Ok(Err(err)) => Err(record_error(err)),
        }
    }

    #[instrument(skip(self), fields(group_id = %self.group_id), err)]
    async fn commit(&mut self, position: &RecordPosition) -> Result<(), SourceError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset + 1),
            )
            .map_err(|e| SourceError::Commit(e.to_string()))?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| SourceError::Commit(e.to_string()))?
            .map_err(|e| SourceError::Commit(e.to_string()))
    }

    #[instrument(skip(self), fields(group_id = %self.group_id), err)]
    async fn rewind(&mut self, position: &RecordPosition) -> Result<(), SourceError> {
        let consumer = Arc::clone(&self.consumer);
        let RecordPosition {
            topic,
            partition,
            offset,
        } = position.clone();

        tokio::task::spawn_blocking(move || {
            consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
        })
        .await
        .map_err(|e| SourceError::Seek(e.to_string()))?
        .map_err(|e| SourceError::Seek(e.to_string()))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.consumer.unsubscribe();
            self.closed = true;
            info!(topic = %self.topic, group_id = %self.group_id, "left consumer group");
        }
    }
}

/// Copy a broker message into a record the consumer loop owns.
fn inbound_record<M: Message>(message: &M) -> InboundRecord {
    let position = RecordPosition::new(message.topic(), message.partition(), message.offset());
    InboundRecord::new(
        position,
        message.key().map(<[u8]>::to_vec),
        message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
    )
}

fn record_error(err: KafkaError) -> RecordError {
    match err {
        KafkaError::PartitionEOF(partition) => RecordError::EndOfPartition { partition },
        err => RecordError::Broker(err.to_string()),
    }
}

#[cfg(all(test, feature = "kafka"))]
mod tests {
    use super::*;
    use rdkafka::Timestamp;
    use rdkafka::error::RDKafkaErrorCode;
    use rdkafka::message::OwnedMessage;

    fn message(key: Option<&[u8]>, payload: Option<&[u8]>) -> OwnedMessage {
        OwnedMessage::new(
            payload.map(<[u8]>::to_vec),
            key.map(<[u8]>::to_vec),
            "products".to_string(),
            Timestamp::NotAvailable,
            2,
            41,
            None,
        )
    }

    #[test]
    fn message_maps_to_inbound_record() {
        let record = inbound_record(&message(Some(b"prod_1"), Some(br#"{"action":"delete"}"#)));

        assert_eq!(record.position(), &RecordPosition::new("products", 2, 41));
        assert_eq!(record.key(), Some(&b"prod_1"[..]));
        assert_eq!(record.payload(), br#"{"action":"delete"}"#);
    }

    #[test]
    fn tombstone_maps_to_empty_payload() {
        let record = inbound_record(&message(None, None));

        assert_eq!(record.key(), None);
        assert!(record.payload().is_empty());
    }

    #[test]
    fn partition_eof_is_informational() {
        assert_eq!(
            record_error(KafkaError::PartitionEOF(3)),
            RecordError::EndOfPartition { partition: 3 }
        );
    }

    #[test]
    fn other_kafka_errors_are_broker_errors() {
        let err = record_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(matches!(err, RecordError::Broker(msg) if msg.contains("consumption")));
    }
}
