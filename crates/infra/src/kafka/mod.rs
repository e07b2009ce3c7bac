//! Kafka adapters for the command log (enabled with the `kafka` feature).
//!
//! - [`KafkaCommandPublisher`]: keyed publish + flush, delivery reports logged
//! - [`KafkaCommandSource`]: manual-commit consumer bound to one group
//! - [`KafkaBrokerProbe`]: the checks behind the readiness guard

mod probe;
mod publisher;
mod source;

pub use probe::KafkaBrokerProbe;
pub use publisher::{DeliveryLogger, KafkaCommandPublisher};
pub use source::KafkaCommandSource;

use rdkafka::config::ClientConfig;

use crate::config::KafkaConfig;

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", &config.brokers);
    client_config
}

/// Consumer settings shared by the command source and the readiness probe.
///
/// Offsets are only ever committed explicitly after a record was applied.
fn consumer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = client_config(config);
    client_config
        .set("group.id", &config.group_id)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", "10000")
        .set("heartbeat.interval.ms", "3000")
        .set("enable.partition.eof", "true");
    client_config
}
