// src/rabbitmq/channel_manager.rs
// Hands out channels on the supervisor's current connection and keeps every
// one of them so a broker shutdown can close them all.

use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

use super::connection::{Broker, BrokerInner, ConnectionState};
use super::errors::{HutchError, Result};
use super::transport::BrokerChannel;

/// Channels created through the broker. Entries are only removed when the
/// broker shuts down, even if a channel was closed individually before.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: Mutex<Vec<Arc<dyn BrokerChannel>>>,
}

impl ChannelRegistry {
    pub fn track(&self, channel: Arc<dyn BrokerChannel>) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(channel);
    }

    pub fn drain(&self) -> Vec<Arc<dyn BrokerChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BrokerInner {
    pub(crate) async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.state.subscribe();

        loop {
            let current = state
                .wait_for(|s| matches!(s, ConnectionState::Connected) || s.is_terminal())
                .await
                .map(|s| *s)
                .map_err(|_| HutchError::BrokerClosed)?;

            if current != ConnectionState::Connected {
                return Err(HutchError::BrokerClosed);
            }

            // Lost the connection between the state change and this read.
            let Some(connection) = self.current_connection() else {
                tokio::task::yield_now().await;
                continue;
            };

            return match connection.create_channel().await {
                Ok(channel) => {
                    self.channels.track(channel.clone());
                    debug!(tracked = self.channels.len(), "Created channel");
                    Ok(channel)
                }
                Err(e) => {
                    error!("Failed to open a channel: {}", e);
                    Err(e)
                }
            };
        }
    }
}

impl Broker {
    /// Waits until the supervisor reports a live connection, then opens a
    /// channel on it. Fails with [`HutchError::BrokerClosed`] if the broker
    /// shuts down first.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.inner.create_channel().await
    }

    pub fn tracked_channels(&self) -> usize {
        self.inner.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::connection::BrokerOptions;
    use crate::rabbitmq::memory::MemoryBroker;
    use std::time::Duration;
    use tokio::time::{sleep, timeout, Instant};
    use tokio_util::sync::CancellationToken;

    #[tokio::test(start_paused = true)]
    async fn test_create_channel_waits_for_connection() {
        let memory = MemoryBroker::new();
        memory.fail_next_dials(2);
        let cancel = CancellationToken::new();
        let broker = Broker::start(
            "amqp://localhost",
            Arc::new(memory.clone()),
            BrokerOptions::default(),
            &cancel,
        );

        let started = Instant::now();
        let channel = broker.create_channel().await.unwrap();

        assert!(broker.is_connected());
        assert!(started.elapsed() >= Duration::from_secs(11));
        assert_eq!(memory.dial_attempts(), 3);
        assert_eq!(broker.tracked_channels(), 1);
        channel.queue_declare("ready").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_channel_fails_once_broker_closes() {
        let memory = MemoryBroker::new();
        memory.fail_next_dials(usize::MAX);
        let cancel = CancellationToken::new();
        let broker = Arc::new(Broker::start(
            "amqp://localhost",
            Arc::new(memory.clone()),
            BrokerOptions::default(),
            &cancel,
        ));

        let waiting = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.create_channel().await })
        };
        sleep(Duration::from_secs(3)).await;
        assert!(!waiting.is_finished());

        cancel.cancel();
        let result = timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(HutchError::BrokerClosed)));
        assert_eq!(broker.tracked_channels(), 0);
    }

    #[test]
    fn test_registry_drain_empties() {
        let registry = ChannelRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.drain().is_empty());
    }
}
