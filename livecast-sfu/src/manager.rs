//! Relay manager - owns every session, transport, producer and consumer
//!
//! This module provides:
//! - Session lifecycle keyed by signaling connection
//! - Cascading teardown shared by every close path
//! - Server-push delivery to connections
//! - Engine event handling
//! - Global statistics

use crate::config::SfuConfig;
use crate::engine::{EngineEvent, MediaEngine, ProducerScore};
use crate::graph::{ConsumerState, MediaGraph};
use crate::ports::PortAllocator;
use crate::rtp::CapabilitySet;
use crate::session::{SessionRegistry, SessionSnapshot};
use crate::signaling::Notification;
use crate::transport::TransportEntry;
use crate::types::{ConnectionId, ConsumerId, ProducerId, SessionId, TransportId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Every record the relay keeps, behind one lock. The lock is never held
/// across an engine call.
#[derive(Default)]
pub(crate) struct RelayState {
    pub sessions: SessionRegistry,
    pub transports: HashMap<TransportId, TransportEntry>,
    pub graph: MediaGraph,
}

/// A consumer closed as part of a teardown
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedConsumer {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
    /// Subscriber that owned the consumer
    pub connection_id: ConnectionId,
}

/// What a close operation removed, in the order it was removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    pub transports: Vec<TransportId>,
    pub producers: Vec<ProducerId>,
    pub consumers: Vec<ClosedConsumer>,
}

impl Teardown {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty() && self.producers.is_empty() && self.consumers.is_empty()
    }
}

/// Global relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub sessions: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub paused_consumers: usize,
    pub ports_in_use: usize,
}

/// Relay manager
pub struct SfuManager {
    pub(crate) config: Arc<SfuConfig>,
    pub(crate) capabilities: Arc<CapabilitySet>,
    pub(crate) engine: Arc<dyn MediaEngine>,
    pub(crate) ports: PortAllocator,
    pub(crate) state: Mutex<RelayState>,
    /// Server-push queue per connection
    push: DashMap<ConnectionId, mpsc::Sender<Notification>>,
}

impl SfuManager {
    #[must_use]
    pub fn new(
        config: Arc<SfuConfig>,
        capabilities: Arc<CapabilitySet>,
        engine: Arc<dyn MediaEngine>,
    ) -> Self {
        let ports = PortAllocator::new(config.rtc_min_port, config.rtc_max_port);
        let (min, max) = ports.range();
        info!(
            rtc_min_port = min,
            rtc_max_port = max,
            codecs = capabilities.rtp_capabilities().codecs.len(),
            "SFU manager initialized"
        );

        Self {
            config,
            capabilities,
            engine,
            ports,
            state: Mutex::new(RelayState::default()),
            push: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    /// Session of the connection, created on first use
    pub fn get_or_create_session(&self, connection_id: &ConnectionId) -> SessionId {
        let mut state = self.state.lock();
        let (session, created) = state.sessions.get_or_create(connection_id);
        if created {
            debug!(
                connection_id = %connection_id,
                session_id = %session.id,
                "Session created"
            );
        }
        session.id.clone()
    }

    #[must_use]
    pub fn session(&self, connection_id: &ConnectionId) -> Option<SessionSnapshot> {
        self.state.lock().sessions.get(connection_id).map(|s| s.snapshot())
    }

    /// Close everything the connection owns and forget its session.
    ///
    /// Idempotent: destroying an unknown or already destroyed session returns
    /// an empty teardown. Other sessions' consumers of this session's
    /// producers are closed too.
    pub fn destroy_session(&self, connection_id: &ConnectionId) -> Teardown {
        let (teardown, session_id) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut teardown = Teardown::default();

            let Some(session) = state.sessions.get(connection_id) else {
                return teardown;
            };
            let session_id = session.id.clone();
            let producing = session.producing.clone();
            let consuming = session.consuming.clone();

            if let Some(transport_id) = producing {
                state.close_transport(&transport_id, &mut teardown);
            }
            if let Some(transport_id) = consuming {
                state.close_transport(&transport_id, &mut teardown);
            }

            // Anything not reachable through a transport
            if let Some(session) = state.sessions.remove(connection_id) {
                for producer_id in &session.producers {
                    state.close_producer(producer_id, &mut teardown);
                }
                for consumer_id in &session.consumers {
                    state.close_consumer(consumer_id, &mut teardown);
                }
            }
            (teardown, session_id)
        };

        info!(
            connection_id = %connection_id,
            session_id = %session_id,
            transports = teardown.transports.len(),
            producers = teardown.producers.len(),
            consumers = teardown.consumers.len(),
            "Session destroyed"
        );
        self.finish_teardown(&teardown);
        teardown
    }

    /// Route server-push notifications for `connection_id` into `sender`
    pub fn register_push(&self, connection_id: &ConnectionId, sender: mpsc::Sender<Notification>) {
        self.push.insert(connection_id.clone(), sender);
    }

    pub fn unregister_push(&self, connection_id: &ConnectionId) {
        self.push.remove(connection_id);
    }

    /// Best-effort push; a full or closed queue drops the notification
    pub fn notify(&self, connection_id: &ConnectionId, notification: Notification) -> bool {
        let Some(sender) = self.push.get(connection_id).map(|s| s.value().clone()) else {
            return false;
        };

        match sender.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection_id = %connection_id, "Push queue full, notification dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.push.remove(connection_id);
                false
            }
        }
    }

    /// Tell subscribers whose consumers were closed under them
    pub(crate) fn finish_teardown(&self, teardown: &Teardown) {
        for closed in &teardown.consumers {
            self.notify(
                &closed.connection_id,
                Notification::consumer_closed(closed.consumer_id.clone(), closed.producer_id.clone()),
            );
        }
    }

    /// Apply one engine event
    pub fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportDtlsState { transport_id, state } => {
                self.handle_transport_dtls_state(&transport_id, state);
            }
            EngineEvent::ProducerScore { producer_id, scores } => {
                self.handle_producer_score(&producer_id, scores);
            }
            EngineEvent::WorkerDied { reason } => {
                error!(reason = %reason, "Media worker died");
            }
        }
    }

    fn handle_producer_score(&self, producer_id: &ProducerId, scores: Vec<ProducerScore>) {
        let Some(owner) = self.producer_owner(producer_id) else {
            debug!(producer_id = %producer_id, "Score for unknown producer ignored");
            return;
        };
        self.notify(&owner, Notification::producer_score(producer_id.clone(), scores));
    }

    #[must_use]
    pub fn stats(&self) -> RelayStats {
        let state = self.state.lock();
        RelayStats {
            sessions: state.sessions.len(),
            transports: state.transports.len(),
            producers: state.graph.producers.len(),
            consumers: state.graph.consumers.len(),
            paused_consumers: state
                .graph
                .consumers
                .values()
                .filter(|c| c.state == ConsumerState::Paused)
                .count(),
            ports_in_use: self.ports.in_use(),
        }
    }
}
