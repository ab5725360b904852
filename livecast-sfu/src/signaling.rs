//! Signaling contract
//!
//! JSON envelopes exchanged over one ordered channel per connection:
//!
//! - request `{"id": 1, "method": "produce", "data": {...}}`
//! - response `{"id": 1, "response": {...}}`, failures as `{"error": "..."}`
//! - push `{"notification": "producerScore", "data": {...}}`
//!
//! A bad request only ever produces an error response.

use crate::engine::ProducerScore;
use crate::error::SfuError;
use crate::manager::SfuManager;
use crate::params::DtlsParameters;
use crate::rtp::{RtpCapabilities, RtpParameters};
use crate::types::{ConnectionId, ConsumerId, MediaKind, ProducerId, TransportRole};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct RawRequest {
    #[serde(default)]
    id: Option<u64>,
    method: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTransportData {
    is_producer: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectTransportData {
    dtls_parameters: DtlsParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProduceData {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumeData {
    producer_id: ProducerId,
    rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeData {
    consumer_id: ConsumerId,
}

/// A decoded signaling request
#[derive(Debug, Clone, PartialEq)]
pub enum SignalRequest {
    GetCapabilities,
    CreateTransport { role: TransportRole },
    ConnectTransport { role: TransportRole, dtls_parameters: DtlsParameters },
    Produce { kind: MediaKind, rtp_parameters: RtpParameters },
    Consume { producer_id: ProducerId, rtp_capabilities: RtpCapabilities },
    Resume { consumer_id: ConsumerId },
}

impl SignalRequest {
    /// Decode `method` and its `data` payload
    pub fn parse(method: &str, data: Value) -> Result<Self, SfuError> {
        let request = match method {
            "getCapabilities" => Self::GetCapabilities,
            "createTransport" => {
                let data: CreateTransportData = decode(method, data)?;
                Self::CreateTransport {
                    role: TransportRole::from_is_producer(data.is_producer),
                }
            }
            "connectProducerTransport" => {
                let data: ConnectTransportData = decode(method, data)?;
                Self::ConnectTransport {
                    role: TransportRole::Producing,
                    dtls_parameters: data.dtls_parameters,
                }
            }
            "connectConsumerTransport" => {
                let data: ConnectTransportData = decode(method, data)?;
                Self::ConnectTransport {
                    role: TransportRole::Consuming,
                    dtls_parameters: data.dtls_parameters,
                }
            }
            "produce" => {
                let data: ProduceData = decode(method, data)?;
                Self::Produce {
                    kind: data.kind,
                    rtp_parameters: data.rtp_parameters,
                }
            }
            "consume" => {
                let data: ConsumeData = decode(method, data)?;
                Self::Consume {
                    producer_id: data.producer_id,
                    rtp_capabilities: data.rtp_capabilities,
                }
            }
            "resume" => {
                let data: ResumeData = decode(method, data)?;
                Self::Resume {
                    consumer_id: data.consumer_id,
                }
            }
            other => {
                return Err(SfuError::InvalidRequest(format!("unknown method {other}")));
            }
        };
        Ok(request)
    }

    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetCapabilities => "getCapabilities",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport {
                role: TransportRole::Producing,
                ..
            } => "connectProducerTransport",
            Self::ConnectTransport {
                role: TransportRole::Consuming,
                ..
            } => "connectConsumerTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::Resume { .. } => "resume",
        }
    }
}

fn decode<T: DeserializeOwned>(method: &str, data: Value) -> Result<T, SfuError> {
    serde_json::from_value(data)
        .map_err(|e| SfuError::InvalidRequest(format!("bad {method} parameters: {e}")))
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalResponse {
    pub id: Option<u64>,
    pub response: Value,
}

impl SignalResponse {
    fn error(id: Option<u64>, err: &SfuError) -> Self {
        Self {
            id,
            response: json!({ "error": err.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerScoreNotification {
    pub producer_id: ProducerId,
    pub score: Vec<ProducerScore>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosedNotification {
    pub consumer_id: ConsumerId,
    pub producer_id: ProducerId,
}

/// Server push, serialized as `{"notification": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "notification", content = "data", rename_all = "camelCase")]
pub enum Notification {
    ProducerScore(ProducerScoreNotification),
    ConsumerClosed(ConsumerClosedNotification),
}

impl Notification {
    #[must_use]
    pub const fn producer_score(producer_id: ProducerId, score: Vec<ProducerScore>) -> Self {
        Self::ProducerScore(ProducerScoreNotification { producer_id, score })
    }

    #[must_use]
    pub const fn consumer_closed(consumer_id: ConsumerId, producer_id: ProducerId) -> Self {
        Self::ConsumerClosed(ConsumerClosedNotification {
            consumer_id,
            producer_id,
        })
    }
}

/// Dispatches decoded requests for one relay
#[derive(Clone)]
pub struct SignalingHandler {
    relay: Arc<SfuManager>,
}

impl SignalingHandler {
    #[must_use]
    pub const fn new(relay: Arc<SfuManager>) -> Self {
        Self { relay }
    }

    /// Run one request for `connection_id` and build its response payload
    pub async fn handle(&self, connection_id: &ConnectionId, request: SignalRequest) -> Value {
        let method = request.method();
        match self.dispatch(connection_id, request).await {
            Ok(value) => value,
            Err(err) => {
                if err.is_fatal() {
                    warn!(connection_id = %connection_id, method, error = %err, "Request hit a closed engine");
                } else {
                    debug!(connection_id = %connection_id, method, error = %err, "Request failed");
                }
                json!({ "error": err.to_string() })
            }
        }
    }

    async fn dispatch(
        &self,
        connection_id: &ConnectionId,
        request: SignalRequest,
    ) -> Result<Value, SfuError> {
        let value = match request {
            SignalRequest::GetCapabilities => to_value(self.relay.capabilities().rtp_capabilities())?,
            SignalRequest::CreateTransport { role } => {
                let info = self.relay.create_transport(connection_id, role).await?;
                to_value(&info)?
            }
            SignalRequest::ConnectTransport {
                role,
                dtls_parameters,
            } => {
                self.relay
                    .connect_transport(connection_id, role, dtls_parameters)
                    .await?;
                json!({ "success": true })
            }
            SignalRequest::Produce {
                kind,
                rtp_parameters,
            } => {
                let id = self.relay.produce(connection_id, kind, rtp_parameters).await?;
                json!({ "id": id })
            }
            SignalRequest::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let info = self
                    .relay
                    .consume(connection_id, &producer_id, &rtp_capabilities)
                    .await?;
                to_value(&info)?
            }
            SignalRequest::Resume { consumer_id } => {
                self.relay.resume(connection_id, &consumer_id).await?;
                json!({ "success": true })
            }
        };
        Ok(value)
    }

    /// Decode a text frame, run it and encode the response envelope
    pub async fn handle_text(&self, connection_id: &ConnectionId, text: &str) -> String {
        let response = match serde_json::from_str::<RawRequest>(text) {
            Err(e) => SignalResponse::error(None, &SfuError::InvalidRequest(e.to_string())),
            Ok(raw) => match SignalRequest::parse(&raw.method, raw.data) {
                Err(err) => {
                    debug!(connection_id = %connection_id, method = %raw.method, error = %err, "Rejected request");
                    SignalResponse::error(raw.id, &err)
                }
                Ok(request) => SignalResponse {
                    id: raw.id,
                    response: self.handle(connection_id, request).await,
                },
            },
        };

        serde_json::to_string(&response).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to encode response");
            json!({ "id": response.id, "response": { "error": "internal error" } }).to_string()
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, SfuError> {
    serde_json::to_value(value).map_err(|e| SfuError::Engine(format!("failed to encode response: {e}")))
}
