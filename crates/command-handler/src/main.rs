//! Command handler process: applies product commands from Kafka to the
//! projection store.

use anyhow::Context;

use catalog_infra::kafka::{KafkaBrokerProbe, KafkaCommandPublisher, KafkaCommandSource};
use catalog_infra::{CommandConsumer, PipelineConfig, PostgresProjectionStore, ProjectionStore, ReadinessGuard};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    catalog_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        brokers = %config.kafka.brokers,
        topic = %config.kafka.topic,
        group_id = %config.kafka.group_id,
        "starting product command handler"
    );

    let probe = KafkaBrokerProbe::new(config.kafka.clone(), config.readiness.connect_timeout);
    let guard = ReadinessGuard::new(probe, config.kafka.topic_spec(), config.readiness.clone());
    let ready = guard.await_ready().await.context("kafka is not available")?;
    tracing::info!(attempts = ready.attempts, topic_created = ready.topic_created, "kafka is ready");

    let store = PostgresProjectionStore::connect(&config.database_url)
        .await
        .context("failed to connect to the projection store")?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare the projection store schema")?;

    let source = KafkaCommandSource::subscribe(&config.kafka).context("failed to subscribe to the command topic")?;
    let dead_letters = KafkaCommandPublisher::new(&config.kafka).context("failed to create the dead-letter producer")?;

    let consumer = CommandConsumer::new(source, store, dead_letters, config.consumer.clone());
    let stats = consumer.run(shutdown_signal()).await;

    tracing::info!(
        applied = stats.applied,
        dead_lettered = stats.dead_lettered,
        "product command handler stopped"
    );
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
