//! In-process engine
//!
//! Allocates ICE credentials, a host candidate and a DTLS certificate
//! fingerprint per transport, keeps the engine-side producer/consumer graph
//! and reports state changes over an unbounded channel. Packet forwarding is
//! left to a production engine behind the same seam.

use super::{
    DtlsState, EngineError, EngineEvent, EngineTransport, MediaEngine, ProducerScore,
    WebRtcTransportOptions,
};
use crate::params::{
    format_fingerprint, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    IceProtocol,
};
use crate::rtp::RtpParameters;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

/// Host candidate priority for UDP
const HOST_UDP_PRIORITY: u32 = 1_076_302_079;

struct Worker {
    events: mpsc::UnboundedSender<EngineEvent>,
    closed: AtomicBool,
    latency: Duration,
    transports: DashMap<TransportId, Arc<LocalTransport>>,
    /// producer -> owning transport
    producers: DashMap<ProducerId, TransportId>,
}

impl Worker {
    fn emit(&self, event: EngineEvent) {
        // Receiver gone means the supervisor is shutting down
        let _ = self.events.send(event);
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn ensure_alive(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::WorkerClosed)
        } else {
            Ok(())
        }
    }
}

/// In-process [`MediaEngine`]. Cloning shares the same worker.
#[derive(Clone)]
pub struct LocalEngine {
    worker: Arc<Worker>,
}

impl LocalEngine {
    /// Create the engine and the event stream the supervisor consumes
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        Self::with_latency(Duration::ZERO)
    }

    /// Every async engine call sleeps for `latency` first
    #[must_use]
    pub fn with_latency(latency: Duration) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let engine = Self {
            worker: Arc::new(Worker {
                events,
                closed: AtomicBool::new(false),
                latency,
                transports: DashMap::new(),
                producers: DashMap::new(),
            }),
        };
        (engine, rx)
    }

    /// Number of open engine-side transports
    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.worker.transports.len()
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &ProducerId) -> bool {
        self.worker.producers.contains_key(producer_id)
    }

    /// Number of engine-side consumers across all transports
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.worker
            .transports
            .iter()
            .map(|t| t.value().consumers.lock().len())
            .sum()
    }

    /// Drive a transport into `state` as if the network did it.
    /// Returns false if the transport is unknown.
    pub fn fail_transport(&self, transport_id: &TransportId, state: DtlsState) -> bool {
        let Some((_, transport)) = self.worker.transports.remove(transport_id) else {
            return false;
        };

        *transport.state.lock() = state;
        transport.release(&self.worker);
        self.worker.emit(EngineEvent::TransportDtlsState {
            transport_id: transport_id.clone(),
            state,
        });
        true
    }

    /// Report a producer score
    pub fn report_producer_score(&self, producer_id: &ProducerId, scores: Vec<ProducerScore>) {
        self.worker.emit(EngineEvent::ProducerScore {
            producer_id: producer_id.clone(),
            scores,
        });
    }

    /// Kill the worker: every transport closes and `WorkerDied` is emitted
    pub fn kill(&self, reason: &str) {
        if self.worker.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        error!(reason = %reason, "Local media worker died");
        let ids: Vec<TransportId> = self.worker.transports.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, transport)) = self.worker.transports.remove(&id) {
                *transport.state.lock() = DtlsState::Closed;
                transport.release(&self.worker);
            }
        }
        self.worker.emit(EngineEvent::WorkerDied {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError> {
        self.worker.ensure_alive()?;
        self.worker.simulate_latency().await;
        self.worker.ensure_alive()?;

        let id = TransportId::random();
        let ip = options
            .announced_ip
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());

        let certificate = Uuid::new_v4();
        let digest = Sha256::digest(certificate.as_bytes());

        let transport = Arc::new(LocalTransport {
            id: id.clone(),
            worker: Arc::downgrade(&self.worker),
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_UDP_PRIORITY,
                ip,
                protocol: IceProtocol::Udp,
                port: options.port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: format_fingerprint(&digest),
                }],
            },
            state: Mutex::new(DtlsState::New),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(BTreeMap::new()),
        });

        self.worker.transports.insert(id.clone(), Arc::clone(&transport));
        debug!(
            transport_id = %id,
            port = options.port,
            bitrate = options.initial_available_outgoing_bitrate,
            "Local transport created"
        );

        Ok(transport)
    }
}

struct LocalTransport {
    id: TransportId,
    worker: Weak<Worker>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    state: Mutex<DtlsState>,
    producers: Mutex<Vec<ProducerId>>,
    /// consumer -> paused
    consumers: Mutex<BTreeMap<ConsumerId, bool>>,
}

impl LocalTransport {
    fn worker(&self) -> Result<Arc<Worker>, EngineError> {
        let worker = self.worker.upgrade().ok_or(EngineError::WorkerClosed)?;
        worker.ensure_alive()?;
        Ok(worker)
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.state.lock().is_terminal() {
            Err(EngineError::TransportClosed)
        } else {
            Ok(())
        }
    }

    /// Drop every producer and consumer on this transport
    fn release(&self, worker: &Worker) {
        for producer_id in self.producers.lock().drain(..) {
            worker.producers.remove(&producer_id);
        }
        self.consumers.lock().clear();
    }
}

#[async_trait]
impl EngineTransport for LocalTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    async fn connect(&self, remote: DtlsParameters) -> Result<(), EngineError> {
        let worker = self.worker()?;
        {
            let mut state = self.state.lock();
            match *state {
                DtlsState::New => *state = DtlsState::Connecting,
                DtlsState::Connecting => {}
                DtlsState::Connected => {
                    return Err(EngineError::Rejected("already connected".to_string()))
                }
                DtlsState::Failed | DtlsState::Closed => return Err(EngineError::TransportClosed),
            }
        }

        worker.simulate_latency().await;

        {
            let mut state = self.state.lock();
            if state.is_terminal() {
                return Err(EngineError::TransportClosed);
            }
            *state = DtlsState::Connected;
        }

        debug!(
            transport_id = %self.id,
            remote_role = ?remote.role,
            "Local transport DTLS connected"
        );
        worker.emit(EngineEvent::TransportDtlsState {
            transport_id: self.id.clone(),
            state: DtlsState::Connected,
        });
        Ok(())
    }

    async fn produce(
        &self,
        producer_id: &ProducerId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<(), EngineError> {
        let worker = self.worker()?;
        self.ensure_open()?;
        worker.simulate_latency().await;
        self.ensure_open()?;

        self.producers.lock().push(producer_id.clone());
        worker.producers.insert(producer_id.clone(), self.id.clone());
        debug!(
            transport_id = %self.id,
            producer_id = %producer_id,
            kind = %kind,
            codecs = rtp_parameters.codecs.len(),
            "Local producer created"
        );
        Ok(())
    }

    async fn consume(
        &self,
        consumer_id: &ConsumerId,
        producer_id: &ProducerId,
        rtp_parameters: &RtpParameters,
        paused: bool,
    ) -> Result<(), EngineError> {
        let worker = self.worker()?;
        self.ensure_open()?;
        worker.simulate_latency().await;
        self.ensure_open()?;

        if !worker.producers.contains_key(producer_id) {
            return Err(EngineError::ProducerNotFound);
        }

        self.consumers.lock().insert(consumer_id.clone(), paused);
        debug!(
            transport_id = %self.id,
            consumer_id = %consumer_id,
            producer_id = %producer_id,
            ssrc = ?rtp_parameters.encodings.first().and_then(|e| e.ssrc),
            paused,
            "Local consumer created"
        );
        Ok(())
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        let worker = self.worker()?;
        self.ensure_open()?;
        worker.simulate_latency().await;

        let mut consumers = self.consumers.lock();
        let paused = consumers
            .get_mut(consumer_id)
            .ok_or(EngineError::ConsumerNotFound)?;
        *paused = false;
        Ok(())
    }

    fn close_producer(&self, producer_id: &ProducerId) {
        self.producers.lock().retain(|p| p != producer_id);
        if let Some(worker) = self.worker.upgrade() {
            worker.producers.remove(producer_id);
        }
    }

    fn close_consumer(&self, consumer_id: &ConsumerId) {
        self.consumers.lock().remove(consumer_id);
    }

    fn close(&self) {
        *self.state.lock() = DtlsState::Closed;
        if let Some(worker) = self.worker.upgrade() {
            worker.transports.remove(&self.id);
            self.release(&worker);
        }
    }

    fn is_closed(&self) -> bool {
        self.state.lock().is_terminal()
    }
}
