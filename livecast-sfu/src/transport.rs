//! Transport lifecycle
//!
//! Each session owns at most one producing and one consuming transport.
//! Creating a transport for an occupied role closes the previous one first.
//! Whether a transport closes because of replacement, an engine DTLS event or
//! session teardown, the same [`RelayState::close_transport`] routine runs.

use crate::engine::{DtlsState, EngineError, EngineTransport, WebRtcTransportOptions};
use crate::error::{Result, SfuError};
use crate::manager::{RelayState, SfuManager, Teardown};
use crate::params::{DtlsParameters, IceCandidate, IceParameters};
use crate::ports::PortLease;
use crate::types::{ConnectionId, ConsumerId, ProducerId, SessionId, TransportId, TransportRole};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Transport state: `new -> connecting -> connected`, `closed` from anywhere
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Closed,
}

impl TransportState {
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::New | Self::Connecting | Self::Connected, Self::Closed)
        )
    }
}

/// Parameters returned to the remote side so it can complete ICE/DTLS
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

pub(crate) struct TransportEntry {
    pub id: TransportId,
    pub role: TransportRole,
    pub connection_id: ConnectionId,
    pub session_id: SessionId,
    pub handle: Arc<dyn EngineTransport>,
    pub state: TransportState,
    pub producers: BTreeSet<ProducerId>,
    pub consumers: BTreeSet<ConsumerId>,
    next_mid: u32,
    lease: PortLease,
}

impl TransportEntry {
    fn new(
        role: TransportRole,
        connection_id: ConnectionId,
        session_id: SessionId,
        handle: Arc<dyn EngineTransport>,
        lease: PortLease,
    ) -> Self {
        Self {
            id: handle.id().clone(),
            role,
            connection_id,
            session_id,
            handle,
            state: TransportState::New,
            producers: BTreeSet::new(),
            consumers: BTreeSet::new(),
            next_mid: 0,
            lease,
        }
    }

    pub(crate) fn transition(&mut self, next: TransportState) -> Result<()> {
        if self.state.can_transition_to(next) {
            debug!(
                transport_id = %self.id,
                from = ?self.state,
                to = ?next,
                "Transport state change"
            );
            self.state = next;
            return Ok(());
        }

        Err(match self.state {
            TransportState::Closed => SfuError::TransportClosed,
            TransportState::Connected => SfuError::TransportAlreadyConnected(self.role),
            TransportState::New | TransportState::Connecting => {
                SfuError::TransportNotConnected(self.role)
            }
        })
    }

    /// MID for the next consumer on this transport
    pub(crate) fn next_mid(&mut self) -> String {
        let mid = self.next_mid;
        self.next_mid += 1;
        mid.to_string()
    }
}

impl RelayState {
    /// Close a transport and everything on it.
    ///
    /// Producing transports close their producers (and, through them, every
    /// dependent consumer); consuming transports close their consumers. The
    /// owning session's reference is cleared and the port lease released.
    pub(crate) fn close_transport(&mut self, transport_id: &TransportId, teardown: &mut Teardown) {
        let Some(mut entry) = self.transports.remove(transport_id) else {
            return;
        };

        // Only fails if already closed
        let _ = entry.transition(TransportState::Closed);

        for producer_id in std::mem::take(&mut entry.producers) {
            self.close_producer(&producer_id, teardown);
        }
        for consumer_id in std::mem::take(&mut entry.consumers) {
            self.close_consumer(&consumer_id, teardown);
        }

        if let Some(session) = self
            .sessions
            .current_mut(&entry.connection_id, &entry.session_id)
        {
            let slot = session.transport_slot(entry.role);
            if slot.as_ref() == Some(transport_id) {
                *slot = None;
            }
        }

        entry.handle.close();
        debug!(
            transport_id = %entry.id,
            connection_id = %entry.connection_id,
            role = %entry.role,
            port = entry.lease.port(),
            "Transport closed"
        );
        teardown.transports.push(entry.id);
    }
}

impl SfuManager {
    /// Create the `role` transport of the connection's session, creating the
    /// session if needed. A previous transport of the same role is closed
    /// first.
    pub async fn create_transport(
        &self,
        connection_id: &ConnectionId,
        role: TransportRole,
    ) -> Result<TransportInfo> {
        let (session_id, replaced) = {
            let mut state = self.state.lock();
            let (session, created) = state.sessions.get_or_create(connection_id);
            if created {
                debug!(
                    connection_id = %connection_id,
                    session_id = %session.id,
                    "Session created"
                );
            }
            let session_id = session.id.clone();
            let previous = session.transport(role).cloned();

            let mut teardown = Teardown::default();
            if let Some(previous) = previous {
                info!(
                    connection_id = %connection_id,
                    transport_id = %previous,
                    role = %role,
                    "Replacing existing transport"
                );
                state.close_transport(&previous, &mut teardown);
            }
            (session_id, teardown)
        };
        self.finish_teardown(&replaced);

        let lease = self.ports.acquire()?;
        let port = lease.port();
        let options = WebRtcTransportOptions {
            listen_ip: self.config.listen_ip,
            announced_ip: self.config.announced_ip.clone(),
            port,
            initial_available_outgoing_bitrate: self.config.initial_available_outgoing_bitrate,
        };

        let handle = self
            .engine
            .create_webrtc_transport(options)
            .await
            .map_err(|e| match e {
                EngineError::WorkerClosed => SfuError::EngineClosed,
                other => SfuError::TransportCreation(other.to_string()),
            })?;

        let info = TransportInfo {
            id: handle.id().clone(),
            ice_parameters: handle.ice_parameters(),
            ice_candidates: handle.ice_candidates(),
            dtls_parameters: handle.dtls_parameters(),
        };

        let teardown = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            let Some(session) = state.sessions.current_mut(connection_id, &session_id) else {
                // Connection dropped while the engine was working
                handle.close();
                warn!(
                    connection_id = %connection_id,
                    transport_id = %info.id,
                    "Session closed during transport creation, released transport"
                );
                return Err(SfuError::SessionClosed);
            };

            // A terminal DTLS event that beat registration was dropped as unknown
            if handle.is_closed() {
                handle.close();
                warn!(
                    connection_id = %connection_id,
                    transport_id = %info.id,
                    "Transport closed by engine before registration"
                );
                return Err(SfuError::TransportClosed);
            }

            let previous = session.transport_slot(role).replace(info.id.clone());
            state.transports.insert(
                info.id.clone(),
                TransportEntry::new(role, connection_id.clone(), session_id, handle, lease),
            );

            let mut teardown = Teardown::default();
            if let Some(previous) = previous {
                state.close_transport(&previous, &mut teardown);
            }
            teardown
        };
        self.finish_teardown(&teardown);

        info!(
            connection_id = %connection_id,
            transport_id = %info.id,
            role = %role,
            port,
            "Transport created"
        );
        Ok(info)
    }

    /// Complete the DTLS handshake of the connection's `role` transport
    pub async fn connect_transport(
        &self,
        connection_id: &ConnectionId,
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        dtls_parameters.validate()?;

        let (transport_id, handle) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let session = state
                .sessions
                .get(connection_id)
                .ok_or(SfuError::SessionNotFound)?;
            let transport_id = session
                .transport(role)
                .cloned()
                .ok_or(SfuError::TransportNotFound(role))?;
            let entry = state
                .transports
                .get_mut(&transport_id)
                .ok_or(SfuError::TransportClosed)?;
            // Engine-side failure whose event has not been handled yet
            if entry.handle.is_closed() {
                return Err(SfuError::TransportClosed);
            }

            match entry.state {
                TransportState::New => entry.transition(TransportState::Connecting)?,
                // Retry after a failed handshake
                TransportState::Connecting => {}
                TransportState::Connected => return Err(SfuError::TransportAlreadyConnected(role)),
                TransportState::Closed => return Err(SfuError::TransportClosed),
            }
            (transport_id, Arc::clone(&entry.handle))
        };

        handle.connect(dtls_parameters).await?;

        let mut state = self.state.lock();
        let entry = state
            .transports
            .get_mut(&transport_id)
            .ok_or(SfuError::TransportClosed)?;
        entry.transition(TransportState::Connected)?;

        info!(
            connection_id = %connection_id,
            transport_id = %transport_id,
            role = %role,
            "Transport connected"
        );
        Ok(())
    }

    /// Close the connection's `role` transport with its full cascade
    pub fn close_transport(&self, connection_id: &ConnectionId, role: TransportRole) -> Teardown {
        let teardown = {
            let mut state = self.state.lock();
            let transport_id = state
                .sessions
                .get(connection_id)
                .and_then(|s| s.transport(role).cloned());

            let mut teardown = Teardown::default();
            if let Some(transport_id) = transport_id {
                state.close_transport(&transport_id, &mut teardown);
            }
            teardown
        };
        self.finish_teardown(&teardown);
        teardown
    }

    /// Current state of the connection's `role` transport
    #[must_use]
    pub fn transport_state(
        &self,
        connection_id: &ConnectionId,
        role: TransportRole,
    ) -> Option<TransportState> {
        let state = self.state.lock();
        let transport_id = state.sessions.get(connection_id)?.transport(role)?;
        state.transports.get(transport_id).map(|t| t.state)
    }

    /// Engine DTLS state change for one transport
    pub(crate) fn handle_transport_dtls_state(&self, transport_id: &TransportId, dtls: DtlsState) {
        if !dtls.is_terminal() {
            debug!(transport_id = %transport_id, state = ?dtls, "Transport DTLS state");
            return;
        }

        let teardown = {
            let mut state = self.state.lock();
            let mut teardown = Teardown::default();
            state.close_transport(transport_id, &mut teardown);
            teardown
        };

        if teardown.transports.is_empty() {
            debug!(transport_id = %transport_id, "DTLS close for unknown transport ignored");
            return;
        }

        warn!(
            transport_id = %transport_id,
            state = ?dtls,
            producers_closed = teardown.producers.len(),
            consumers_closed = teardown.consumers.len(),
            "Transport failed, closed by engine"
        );
        self.finish_teardown(&teardown);
    }
}
