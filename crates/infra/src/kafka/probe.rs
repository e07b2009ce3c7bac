use std::time::{Duration, Instant};

use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::types::RDKafkaErrorCode;
use tracing::debug;

use super::{client_config, consumer_config};
use crate::config::KafkaConfig;
use crate::readiness::{BrokerProbe, ProbeError, TopicSpec, tcp_reachable};

const ASSIGNMENT_POLL: Duration = Duration::from_millis(100);

/// Readiness checks against a live Kafka cluster.
#[derive(Debug, Clone)]
pub struct KafkaBrokerProbe {
    config: KafkaConfig,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl KafkaBrokerProbe {
    pub fn new(config: KafkaConfig, connect_timeout: Duration) -> Self {
        Self {
            config,
            connect_timeout,
            request_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait::async_trait]
impl BrokerProbe for KafkaBrokerProbe {
    async fn check_reachable(&self) -> Result<(), ProbeError> {
        let address = self
            .config
            .bootstrap_address()
            .ok_or_else(|| ProbeError::Unreachable {
                address: self.config.brokers.clone(),
                reason: "no bootstrap broker configured".to_string(),
            })?;
        tcp_reachable(address, self.connect_timeout).await
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, ProbeError> {
        let config = self.config.clone();
        let topic = topic.to_string();
        let timeout = self.request_timeout;

        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = client_config(&config)
                .create()
                .map_err(|e| ProbeError::Metadata(e.to_string()))?;
            let metadata = consumer
                .fetch_metadata(None, timeout)
                .map_err(|e| ProbeError::Metadata(e.to_string()))?;
            Ok(metadata.topics().iter().any(|t| t.name() == topic))
        })
        .await
        .map_err(|e| ProbeError::Metadata(e.to_string()))?
    }

    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), ProbeError> {
        let admin: AdminClient<DefaultClientContext> = client_config(&self.config)
            .create()
            .map_err(|e| ProbeError::CreateTopic(e.to_string()))?;
        let new_topic = NewTopic::new(
            &spec.name,
            spec.partitions,
            TopicReplication::Fixed(spec.replication),
        );
        let options = AdminOptions::new().operation_timeout(Some(self.request_timeout));

        let results = admin
            .create_topics(&[new_topic], &options)
            .await
            .map_err(|e| ProbeError::CreateTopic(e.to_string()))?;

        for result in results {
            match result {
                Ok(_) => {}
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!(topic = %name, "topic already exists");
                }
                Err((name, code)) => {
                    return Err(ProbeError::CreateTopic(format!("{name}: {code}")));
                }
            }
        }
        Ok(())
    }

    async fn trial_assignment(&self, topic: &str) -> Result<usize, ProbeError> {
        let config = self.config.clone();
        let topic = topic.to_string();
        let timeout = self.request_timeout;

        tokio::task::spawn_blocking(move || {
            let consumer: BaseConsumer = consumer_config(&config)
                .create()
                .map_err(|e| ProbeError::Subscription(e.to_string()))?;
            consumer
                .subscribe(&[topic.as_str()])
                .map_err(|e| ProbeError::Subscription(e.to_string()))?;

            let deadline = Instant::now() + timeout;
            let mut assigned = 0;
            while assigned == 0 && Instant::now() < deadline {
                // Polling drives the group join; nothing read here is committed.
                let _ = consumer.poll(ASSIGNMENT_POLL);
                assigned = consumer
                    .assignment()
                    .map_err(|e| ProbeError::Subscription(e.to_string()))?
                    .count();
            }

            consumer.unsubscribe();
            Ok(assigned)
        })
        .await
        .map_err(|e| ProbeError::Subscription(e.to_string()))?
    }
}
