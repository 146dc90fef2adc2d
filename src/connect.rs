//! Broker connection establishment with host failover.

use lapin::options::BasicQosOptions;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::time::timeout;

use crate::config::BrokerConfig;
use crate::error::CourierError;
use crate::topology::TopologyConfig;

/// A live connection to one broker host. The connection must outlive the
/// channel, so both travel together; whichever component opened the handle
/// owns it exclusively.
pub struct BrokerHandle {
    pub connection: Connection,
    pub channel: Channel,
    /// The candidate host that won.
    pub host: String,
}

/// Produces a working channel to the broker, tolerating host unavailability.
///
/// Each candidate host gets one bounded attempt: connect, open a channel,
/// declare the queue topology, set the prefetch limit. The first host that
/// completes all of it wins and the remaining candidates are abandoned.
/// Backoff between whole `connect` calls belongs to the caller.
#[derive(Clone)]
pub struct BrokerConnector {
    broker: BrokerConfig,
    topology: TopologyConfig,
    connection_name: String,
}

impl BrokerConnector {
    pub fn new(
        broker: BrokerConfig,
        topology: TopologyConfig,
        connection_name: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            topology,
            connection_name: connection_name.into(),
        }
    }

    pub fn topology(&self) -> &TopologyConfig {
        &self.topology
    }

    /// Resolves the candidate hosts and connects to the first one that works.
    /// Hosts are re-resolved on every call so failover tracks registry
    /// changes.
    pub async fn connect(&self) -> Result<BrokerHandle, CourierError> {
        let hosts = self.broker.candidate_hosts().await;
        self.connect_to(&hosts).await
    }

    /// Attempts each host in order; fails with `BrokerUnavailable` only when
    /// every candidate has failed.
    pub async fn connect_to(&self, hosts: &[String]) -> Result<BrokerHandle, CourierError> {
        for host in hosts {
            match self.try_host(host).await {
                Ok(handle) => {
                    log::info!(
                        "connected to broker at {} as '{}'",
                        self.broker.redacted_endpoint(host),
                        self.connection_name
                    );
                    return Ok(handle);
                }
                Err(e) => {
                    log::warn!(
                        "broker host {} unusable: {}",
                        self.broker.redacted_endpoint(host),
                        e
                    );
                }
            }
        }

        Err(CourierError::BrokerUnavailable {
            hosts: hosts.to_vec(),
        })
    }

    async fn try_host(&self, host: &str) -> Result<BrokerHandle, CourierError> {
        let url = self.broker.amqp_url(host);
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.as_str().into());

        let connection = timeout(
            self.broker.connect_timeout,
            Connection::connect(&url, properties),
        )
        .await
        .map_err(|_| CourierError::BrokerUnavailable {
            hosts: vec![host.to_string()],
        })??;

        let channel = connection.create_channel().await?;
        self.topology.declare(&channel).await?;
        channel
            .basic_qos(self.topology.prefetch_count, BasicQosOptions::default())
            .await?;

        Ok(BrokerHandle {
            connection,
            channel,
            host: host.to_string(),
        })
    }
}
