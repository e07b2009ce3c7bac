use std::time::Duration;

use rdkafka::ClientContext;
use rdkafka::Message;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer};
use tracing::{error, info, instrument};

use catalog_events::{CommandEnvelope, CommandPublisher, DeadLetter, DeadLetterSink, PublishError};

use super::client_config;
use crate::config::KafkaConfig;

/// Logs broker acknowledgements; never reports back to the publisher's caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        match result {
            Ok(message) => info!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                "message delivered"
            ),
            Err((err, message)) => error!(
                topic = message.topic(),
                partition = message.partition(),
                error = %err,
                "message delivery failed"
            ),
        }
    }
}

/// Publishes command envelopes (and dead letters) to Kafka.
///
/// Records are keyed by `product_id`, so all commands for one product share a
/// partition and keep their publish order.
pub struct KafkaCommandPublisher {
    producer: ThreadedProducer<DeliveryLogger>,
    topic: String,
    dlq_topic: String,
    flush_timeout: Duration,
}

impl KafkaCommandPublisher {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let producer = client_config(config).create_with_context(DeliveryLogger)?;
        info!(brokers = %config.brokers, topic = %config.topic, "kafka producer created");

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            dlq_topic: config.dlq_topic.clone(),
            flush_timeout: config.flush_timeout,
        })
    }

    fn flush(&self) -> Result<(), PublishError> {
        self.producer
            .flush(self.flush_timeout)
            .map_err(|e| PublishError::Flush(e.to_string()))
    }
}

impl CommandPublisher for KafkaCommandPublisher {
    #[instrument(
        skip(self, envelope),
        fields(
            topic = %self.topic,
            product_id = %envelope.product_id(),
            action = envelope.action().as_str()
        ),
        err
    )]
    fn publish(&self, envelope: &CommandEnvelope) -> Result<(), PublishError> {
        let payload = envelope
            .encode()
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        let record = BaseRecord::to(&self.topic)
            .key(envelope.product_id().as_str())
            .payload(&payload);
        self.producer
            .send(record)
            .map_err(|(e, _)| PublishError::Enqueue(e.to_string()))?;

        self.flush()
    }
}

impl DeadLetterSink for KafkaCommandPublisher {
    #[instrument(skip(self, letter), fields(dlq_topic = %self.dlq_topic, position = %letter.position), err)]
    fn dead_letter(&self, letter: &DeadLetter) -> Result<(), PublishError> {
        let partition = letter.position.partition.to_string();
        let offset = letter.position.offset.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "original_topic",
                value: Some(letter.position.topic.as_bytes()),
            })
            .insert(Header {
                key: "original_partition",
                value: Some(partition.as_bytes()),
            })
            .insert(Header {
                key: "original_offset",
                value: Some(offset.as_bytes()),
            })
            .insert(Header {
                key: "error",
                value: Some(letter.reason.as_bytes()),
            });

        let mut record = BaseRecord::to(&self.dlq_topic)
            .payload(letter.payload.as_slice())
            .headers(headers);
        if let Some(key) = &letter.key {
            record = record.key(key.as_slice());
        }

        self.producer
            .send(record)
            .map_err(|(e, _)| PublishError::Enqueue(e.to_string()))?;

        self.flush()
    }
}

impl Drop for KafkaCommandPublisher {
    fn drop(&mut self) {
        if let Err(err) = self.producer.flush(self.flush_timeout) {
            error!(error = %err, "failed to flush producer on shutdown");
        }
    }
}
