//! Livecast media relay
//!
//! Session manager of a selective forwarding relay: publishers send media
//! streams over a producing transport, subscribers receive relayed copies
//! over a consuming transport. The crate coordinates the lifecycles of those
//! transports, producers and consumers per signaling connection. Packet
//! forwarding itself is delegated to a media engine behind [`MediaEngine`].
//!
//! ## Architecture
//!
//! - **`Supervisor`**: Starts the relay, consumes engine events, treats a
//!   dead worker as fatal
//! - **`SfuManager`**: Session registry, transport lifecycle and the
//!   producer/consumer graph behind one lock
//! - **`SignalingHandler`**: Decodes request envelopes and dispatches them
//! - **`LocalEngine`**: In-process engine used by the binary and the tests
//!
//! ## Teardown
//!
//! Closing a transport closes its producers, which close every dependent
//! consumer in any session, before the call returns. Replacement, engine
//! failure and disconnect all run the same routine.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use livecast_sfu::{LocalEngine, SfuConfig, SignalingHandler, Supervisor};
//!
//! let (engine, events) = LocalEngine::new();
//! let supervisor = Supervisor::initialize(
//!     SfuConfig::default(),
//!     Arc::new(engine),
//!     events,
//!     Supervisor::exit_process_handler(),
//! )?;
//! let signaling = SignalingHandler::new(Arc::clone(supervisor.relay()));
//! let response = signaling.handle_text(&connection_id, text).await;
//! ```

mod config;
pub mod engine;
mod error;
mod graph;
mod manager;
mod params;
mod ports;
mod rtp;
mod session;
pub mod signaling;
mod supervisor;
mod transport;
mod types;

pub use config::{default_media_codecs, SfuConfig};
pub use engine::{LocalEngine, MediaEngine};
pub use error::{Result, SfuError};
pub use graph::{ConsumerInfo, ConsumerState};
pub use manager::{ClosedConsumer, RelayStats, SfuManager, Teardown};
pub use params::{DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, IceProtocol};
pub use ports::{PortAllocator, PortLease};
pub use rtp::{
    CapabilitySet, RtcpFeedback, RtcpParameters, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpEncodingParameters, RtpHeaderExtension, RtpHeaderExtensionParameters,
    RtpParameters, RtxParameters,
};
pub use session::SessionSnapshot;
pub use signaling::{Notification, SignalRequest, SignalingHandler};
pub use supervisor::{FatalHandler, Supervisor};
pub use transport::{TransportInfo, TransportState};
pub use types::{ConnectionId, ConsumerId, MediaKind, ProducerId, SessionId, TransportId, TransportRole};
