//! Producer/consumer graph
//!
//! Producers are indexed process-wide so any session can subscribe to any
//! other session's producer. Every producer records its dependent consumers;
//! closing a producer closes all of them before returning.

use crate::engine::EngineTransport;
use crate::error::{Result, SfuError};
use crate::manager::{ClosedConsumer, RelayState, SfuManager, Teardown};
use crate::rtp::{RtpCapabilities, RtpParameters};
use crate::transport::TransportState;
use crate::types::{ConnectionId, ConsumerId, MediaKind, ProducerId, SessionId, TransportId, TransportRole};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Consumer state. A closed consumer is removed from the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Paused,
    Flowing,
}

/// Returned to a subscriber by `consume`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

pub(crate) struct ProducerEntry {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub transport_id: TransportId,
    pub handle: Arc<dyn EngineTransport>,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumers: BTreeSet<ConsumerId>,
}

pub(crate) struct ConsumerEntry {
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub transport_id: TransportId,
    pub handle: Arc<dyn EngineTransport>,
    pub producer_id: ProducerId,
    pub state: ConsumerState,
}

#[derive(Default)]
pub(crate) struct MediaGraph {
    pub producers: HashMap<ProducerId, ProducerEntry>,
    pub consumers: HashMap<ConsumerId, ConsumerEntry>,
}

impl RelayState {
    /// Close a producer and, before returning, every consumer depending on it
    pub(crate) fn close_producer(&mut self, producer_id: &ProducerId, teardown: &mut Teardown) {
        let Some(producer) = self.graph.producers.remove(producer_id) else {
            return;
        };

        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(producer_id);
        }
        if let Some(session) = self
            .sessions
            .current_mut(&producer.connection_id, &producer.session_id)
        {
            session.producers.remove(producer_id);
        }

        for consumer_id in &producer.consumers {
            self.close_consumer(consumer_id, teardown);
        }

        producer.handle.close_producer(producer_id);
        debug!(
            producer_id = %producer_id,
            connection_id = %producer.connection_id,
            dependents = producer.consumers.len(),
            "Producer closed"
        );
        teardown.producers.push(producer_id.clone());
    }

    /// Close one consumer; its producer and sibling consumers are untouched
    pub(crate) fn close_consumer(&mut self, consumer_id: &ConsumerId, teardown: &mut Teardown) {
        let Some(consumer) = self.graph.consumers.remove(consumer_id) else {
            return;
        };

        if let Some(producer) = self.graph.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(consumer_id);
        }
        if let Some(session) = self
            .sessions
            .current_mut(&consumer.connection_id, &consumer.session_id)
        {
            session.consumers.remove(consumer_id);
        }

        consumer.handle.close_consumer(consumer_id);
        debug!(
            consumer_id = %consumer_id,
            producer_id = %consumer.producer_id,
            connection_id = %consumer.connection_id,
            "Consumer closed"
        );
        teardown.consumers.push(ClosedConsumer {
            consumer_id: consumer_id.clone(),
            producer_id: consumer.producer_id,
            connection_id: consumer.connection_id,
        });
    }
}

impl SfuManager {
    /// Publish a stream on the connection's (connected) producing transport
    pub async fn produce(
        &self,
        connection_id: &ConnectionId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        self.capabilities.validate_producer(kind, &rtp_parameters)?;

        let (session_id, transport_id, handle) = {
            let state = self.state.lock();
            let session = state
                .sessions
                .get(connection_id)
                .ok_or(SfuError::SessionNotFound)?;
            let transport_id = session
                .transport(TransportRole::Producing)
                .ok_or(SfuError::TransportNotFound(TransportRole::Producing))?;
            let transport = state
                .transports
                .get(transport_id)
                .ok_or(SfuError::TransportClosed)?;
            if transport.state != TransportState::Connected {
                return Err(SfuError::TransportNotConnected(TransportRole::Producing));
            }
            (session.id.clone(), transport_id.clone(), Arc::clone(&transport.handle))
        };

        let producer_id = ProducerId::random();
        handle.produce(&producer_id, kind, &rtp_parameters).await?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let registered = if !state.sessions.is_current(connection_id, &session_id) {
            Err(SfuError::SessionClosed)
        } else if !state.transports.contains_key(&transport_id) {
            Err(SfuError::TransportClosed)
        } else {
            Ok(())
        };

        if let Err(err) = registered {
            handle.close_producer(&producer_id);
            warn!(
                connection_id = %connection_id,
                producer_id = %producer_id,
                error = %err,
                "Owner went away during produce, released producer"
            );
            return Err(err);
        }

        if let Some(transport) = state.transports.get_mut(&transport_id) {
            transport.producers.insert(producer_id.clone());
        }
        if let Some(session) = state.sessions.get_mut(connection_id) {
            session.producers.insert(producer_id.clone());
        }
        state.graph.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                connection_id: connection_id.clone(),
                session_id,
                transport_id,
                handle,
                kind,
                rtp_parameters,
                consumers: BTreeSet::new(),
            },
        );
        drop(guard);

        info!(
            connection_id = %connection_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Subscribe the connection to any producer in the process.
    ///
    /// The consumer starts paused; the subscriber resumes it once its local
    /// pipeline is ready.
    pub async fn consume(
        &self,
        connection_id: &ConnectionId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerInfo> {
        let (session_id, transport_id, handle, kind, mut rtp_parameters) = {
            let state = self.state.lock();
            let session = state
                .sessions
                .get(connection_id)
                .ok_or(SfuError::SessionNotFound)?;
            let transport_id = session
                .transport(TransportRole::Consuming)
                .cloned()
                .ok_or(SfuError::TransportNotFound(TransportRole::Consuming))?;
            let session_id = session.id.clone();

            let producer = state
                .graph
                .producers
                .get(producer_id)
                .ok_or(SfuError::ProducerNotFound)?;
            let rtp_parameters = self
                .capabilities
                .consumer_parameters(producer.kind, &producer.rtp_parameters, rtp_capabilities)
                .ok_or_else(|| SfuError::CannotConsume(producer_id.clone()))?;
            let kind = producer.kind;

            let transport = state
                .transports
                .get(&transport_id)
                .ok_or(SfuError::TransportClosed)?;

            (session_id, transport_id, Arc::clone(&transport.handle), kind, rtp_parameters)
        };

        let consumer_id = ConsumerId::random();
        handle
            .consume(&consumer_id, producer_id, &rtp_parameters, true)
            .await?;

        let mut guard = self.state.lock();
        let state = &mut *guard;

        let registered = if !state.sessions.is_current(connection_id, &session_id) {
            Err(SfuError::SessionClosed)
        } else if !state.transports.contains_key(&transport_id) {
            Err(SfuError::TransportClosed)
        } else if !state.graph.producers.contains_key(producer_id) {
            Err(SfuError::ProducerNotFound)
        } else {
            Ok(())
        };

        if let Err(err) = registered {
            handle.close_consumer(&consumer_id);
            debug!(
                connection_id = %connection_id,
                consumer_id = %consumer_id,
                error = %err,
                "Consume lost a race with teardown, released consumer"
            );
            return Err(err);
        }

        if let Some(producer) = state.graph.producers.get_mut(producer_id) {
            producer.consumers.insert(consumer_id.clone());
        }
        // MIDs are handed out only to registered consumers so they stay dense
        if let Some(transport) = state.transports.get_mut(&transport_id) {
            transport.consumers.insert(consumer_id.clone());
            rtp_parameters.mid = Some(transport.next_mid());
        }
        if let Some(session) = state.sessions.get_mut(connection_id) {
            session.consumers.insert(consumer_id.clone());
        }
        state.graph.consumers.insert(
            consumer_id.clone(),
            ConsumerEntry {
                connection_id: connection_id.clone(),
                session_id,
                transport_id,
                handle,
                producer_id: producer_id.clone(),
                state: ConsumerState::Paused,
            },
        );
        drop(guard);

        info!(
            connection_id = %connection_id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Consumer created (paused)"
        );

        Ok(ConsumerInfo {
            id: consumer_id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    /// Start media flowing on a paused consumer owned by the connection.
    /// Resuming a flowing consumer succeeds without doing anything.
    pub async fn resume(&self, connection_id: &ConnectionId, consumer_id: &ConsumerId) -> Result<()> {
        let handle = {
            let state = self.state.lock();
            let session = state
                .sessions
                .get(connection_id)
                .ok_or(SfuError::SessionNotFound)?;
            if !session.consumers.contains(consumer_id) {
                return Err(SfuError::ConsumerNotFound);
            }
            let consumer = state
                .graph
                .consumers
                .get(consumer_id)
                .ok_or(SfuError::ConsumerNotFound)?;
            if consumer.state == ConsumerState::Flowing {
                return Ok(());
            }
            Arc::clone(&consumer.handle)
        };

        handle.resume_consumer(consumer_id).await?;

        let mut state = self.state.lock();
        let consumer = state
            .graph
            .consumers
            .get_mut(consumer_id)
            .ok_or(SfuError::ConsumerNotFound)?;
        consumer.state = ConsumerState::Flowing;
        drop(state);

        info!(
            connection_id = %connection_id,
            consumer_id = %consumer_id,
            "Consumer resumed"
        );
        Ok(())
    }

    /// Close a producer and all of its consumers, wherever they live
    pub fn close_producer(&self, producer_id: &ProducerId) -> Teardown {
        let teardown = {
            let mut state = self.state.lock();
            let mut teardown = Teardown::default();
            state.close_producer(producer_id, &mut teardown);
            teardown
        };
        self.finish_teardown(&teardown);
        teardown
    }

    /// Close a single consumer
    pub fn close_consumer(&self, consumer_id: &ConsumerId) -> Teardown {
        let teardown = {
            let mut state = self.state.lock();
            let mut teardown = Teardown::default();
            state.close_consumer(consumer_id, &mut teardown);
            teardown
        };
        self.finish_teardown(&teardown);
        teardown
    }

    #[must_use]
    pub fn producer_exists(&self, producer_id: &ProducerId) -> bool {
        self.state.lock().graph.producers.contains_key(producer_id)
    }

    /// State of a consumer as seen by its owning connection
    #[must_use]
    pub fn consumer_state(
        &self,
        connection_id: &ConnectionId,
        consumer_id: &ConsumerId,
    ) -> Option<ConsumerState> {
        let state = self.state.lock();
        state
            .graph
            .consumers
            .get(consumer_id)
            .filter(|c| &c.connection_id == connection_id)
            .map(|c| c.state)
    }

    /// Ids of every live producer
    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        let state = self.state.lock();
        let mut ids: Vec<_> = state.graph.producers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Connection owning a producer
    #[must_use]
    pub(crate) fn producer_owner(&self, producer_id: &ProducerId) -> Option<ConnectionId> {
        self.state
            .lock()
            .graph
            .producers
            .get(producer_id)
            .map(|p| p.connection_id.clone())
    }
}
