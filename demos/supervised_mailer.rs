use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mail_courier::{
    BrokerConfig, BrokerConnector, CourierError, DeliveryAction, MessageEnvelope, Publisher,
    ReliableConsumer, SupervisorConfig, TopologyConfig, WorkerSupervisor,
};
use serde_json::{json, Map};

// 1. Implement the delivery action for your transport
struct LoggingMailer;

#[async_trait]
impl DeliveryAction for LoggingMailer {
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<(), CourierError> {
        log::info!(
            "delivering '{}' to {} (attempt {})",
            envelope.subject,
            envelope.recipient,
            envelope.retry_count() + 1
        );

        // Simulate a flaky downstream: odd-length subjects fail.
        if envelope.subject.len() % 2 != 0 {
            return Err(CourierError::from("smtp refused the message"));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "logging_mailer"
    }
}

// 2. Wire topology, publisher, and supervised consumers
#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let broker = BrokerConfig::from_env();
    let topology = TopologyConfig::new("outbound_mail")
        .with_retry_ttl(Duration::from_secs(10))
        .with_max_retries(3);

    let publisher = Publisher::new(BrokerConnector::new(
        broker.clone(),
        topology.clone(),
        "mail-courier-publisher",
    ));

    let mut fields = Map::new();
    fields.insert("title".to_string(), json!("Welcome"));
    fields.insert("message".to_string(), json!("Your account is ready."));
    let envelope =
        MessageEnvelope::new("user@example.com", "Welcome", "noreply@example.com", fields)
            .with_priority(7);

    if let Err(e) = publisher.publish(&envelope).await {
        log::error!("could not enqueue job: {}", e);
    }

    let supervisor = WorkerSupervisor::new(SupervisorConfig::default());
    for name in ["mailer_1", "mailer_2"] {
        let broker = broker.clone();
        let topology = topology.clone();
        let tag = format!("{}_consumer", name);
        supervisor
            .register(
                name,
                move || {
                    let connector =
                        BrokerConnector::new(broker.clone(), topology.clone(), tag.clone());
                    Arc::new(ReliableConsumer::new(
                        connector,
                        Arc::new(LoggingMailer),
                        tag.clone(),
                    ))
                },
                true,
                true,
                Duration::from_secs(5),
            )
            .await;
    }

    if let Err(e) = supervisor.start_all().await {
        log::error!("failed to start workers: {}", e);
        return;
    }

    log::info!("workers running; press ctrl-c to shut down");
    let _ = tokio::signal::ctrl_c().await;

    supervisor.stop_all().await;
    for (name, status) in supervisor.get_status().await {
        log::info!(
            "{}: running={} restarts={}",
            name,
            status.running,
            status.restart_count
        );
    }
    log::info!("shut down cleanly");
}
