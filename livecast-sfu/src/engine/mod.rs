//! Media-transport engine seam
//!
//! The relay never touches packets. It configures an engine through
//! [`MediaEngine`] / [`EngineTransport`] and learns about asynchronous state
//! changes from the [`EngineEvent`] stream handed to the supervisor.

mod local;

pub use local::LocalEngine;

use crate::params::{DtlsParameters, IceCandidate, IceParameters};
use crate::rtp::RtpParameters;
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("worker closed")]
    WorkerClosed,

    #[error("transport closed")]
    TransportClosed,

    #[error("producer not found")]
    ProducerNotFound,

    #[error("consumer not found")]
    ConsumerNotFound,

    #[error("{0}")]
    Rejected(String),
}

/// DTLS state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl DtlsState {
    /// The transport can no longer carry media
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }
}

/// Score of one RTP stream of a producer (0-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScore {
    pub ssrc: u32,
    pub score: u8,
}

/// Asynchronous notifications from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TransportDtlsState {
        transport_id: TransportId,
        state: DtlsState,
    },
    ProducerScore {
        producer_id: ProducerId,
        scores: Vec<ProducerScore>,
    },
    /// The engine cannot continue; fatal for the process
    WorkerDied { reason: String },
}

/// Options for a new WebRTC transport
#[derive(Debug, Clone)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub port: u16,
    pub initial_available_outgoing_bitrate: u32,
}

#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> Result<Arc<dyn EngineTransport>, EngineError>;
}

/// One engine-side WebRTC transport.
///
/// The `close*` methods are synchronous and idempotent so the relay can call
/// them while holding its state lock.
#[async_trait]
pub trait EngineTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    async fn connect(&self, remote: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(
        &self,
        producer_id: &ProducerId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<(), EngineError>;

    async fn consume(
        &self,
        consumer_id: &ConsumerId,
        producer_id: &ProducerId,
        rtp_parameters: &RtpParameters,
        paused: bool,
    ) -> Result<(), EngineError>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    fn close_producer(&self, producer_id: &ProducerId);

    fn close_consumer(&self, consumer_id: &ConsumerId);

    fn close(&self);

    /// The transport reached a terminal DTLS state or was closed
    fn is_closed(&self) -> bool;
}
