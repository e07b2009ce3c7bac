//! Infrastructure layer: configuration, broker adapters, projection storage
//! and the command consumer loop.

pub mod config;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod read_model;
pub mod readiness;
pub mod workers;


pub use config::{ConfigError, KafkaConfig, PipelineConfig};
pub use read_model::{
    InMemoryProjectionStore, PostgresProjectionStore, ProductQuery, ProjectionStore, StoreError,
};
pub use readiness::{BrokerProbe, ProbeError, ReadinessGuard, ReadinessPolicy, Ready, Unavailable};
pub use workers::{CommandConsumer, ConsumerSettings, ConsumerStats, Step};
