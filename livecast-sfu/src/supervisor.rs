//! Engine supervisor
//!
//! Owns the relay manager and the tasks that feed it: the engine event loop
//! and the periodic statistics log. A dead engine worker is fatal; the
//! supervisor logs it and hands control to the fatal handler.

use crate::config::SfuConfig;
use crate::engine::{EngineEvent, MediaEngine};
use crate::error::SfuError;
use crate::manager::SfuManager;
use crate::rtp::CapabilitySet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{error, info};

/// Called once with the reason when the engine can no longer continue
pub type FatalHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Supervisor {
    relay: Arc<SfuManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Build the capability set, the relay manager and start the background
    /// tasks. Must be called from within a tokio runtime.
    pub fn initialize(
        config: SfuConfig,
        engine: Arc<dyn MediaEngine>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        on_fatal: FatalHandler,
    ) -> Result<Self, SfuError> {
        let capabilities = Arc::new(CapabilitySet::new(&config.media_codecs)?);
        let stats_interval = config.stats_interval_secs;
        let relay = Arc::new(SfuManager::new(Arc::new(config), capabilities, engine));

        let mut tasks = vec![tokio::spawn(event_loop(Arc::clone(&relay), events, on_fatal))];
        if stats_interval > 0 {
            tasks.push(tokio::spawn(stats_task(
                Arc::clone(&relay),
                Duration::from_secs(stats_interval),
            )));
        }

        info!("Media engine supervisor started");
        Ok(Self { relay, tasks })
    }

    #[must_use]
    pub fn capabilities(&self) -> &CapabilitySet {
        self.relay.capabilities()
    }

    #[must_use]
    pub const fn relay(&self) -> &Arc<SfuManager> {
        &self.relay
    }

    /// Fatal handler that terminates the process
    #[must_use]
    pub fn exit_process_handler() -> FatalHandler {
        Arc::new(|reason: &str| {
            error!(reason = %reason, "Exiting after media engine failure");
            std::process::exit(1);
        })
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn event_loop(
    relay: Arc<SfuManager>,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
    on_fatal: FatalHandler,
) {
    while let Some(event) = events.recv().await {
        if let EngineEvent::WorkerDied { reason } = &event {
            error!(reason = %reason, "Media worker died, relay cannot continue");
            on_fatal(reason.as_str());
            return;
        }
        relay.handle_engine_event(event);
    }
    info!("Engine event stream ended");
}

async fn stats_task(relay: Arc<SfuManager>, period: Duration) {
    let mut ticker = interval(period);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let stats = relay.stats();
        info!(
            sessions = stats.sessions,
            transports = stats.transports,
            producers = stats.producers,
            consumers = stats.consumers,
            paused_consumers = stats.paused_consumers,
            ports_in_use = stats.ports_in_use,
            "Relay statistics"
        );
    }
}
