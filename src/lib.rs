//! # mail-courier
//! A supervised reliable-delivery worker library for RabbitMQ: durable
//! publish, bounded retry through a TTL-delayed retry queue, dead-letter
//! routing for exhausted and poison messages, broker-host failover, and
//! self-healing worker lifecycles.

pub mod config;
pub mod connect;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod supervisor;
pub mod topology;

// Re-export key components for easy access
pub use config::BrokerConfig;
pub use connect::{BrokerConnector, BrokerHandle};
pub use consumer::{Outcome, ReliableConsumer};
pub use envelope::MessageEnvelope;
pub use error::CourierError;
pub use handler::DeliveryAction;
pub use publisher::Publisher;
pub use supervisor::{SupervisorConfig, Worker, WorkerStatus, WorkerSupervisor};
pub use topology::TopologyConfig;
