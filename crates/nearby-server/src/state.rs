//! Application state shared across handlers.

use std::sync::Arc;

use nearby_core::{
    Clock, Config, DataService, DiscoveryHub, MemoryDataService, ProfileSummary, SensorSuite,
    SystemClock,
};
use tracing::info;

/// State handle passed to every handler.
///
/// Channels synchronize internally, so handlers share the hub without a lock.
pub type SharedState = Arc<AppState>;

/// Everything the HTTP layer serves.
#[derive(Debug)]
pub struct AppState {
    /// The three discovery channels.
    pub hub: DiscoveryHub,
}

impl AppState {
    /// Builds the state with the host's sensors and an in-process backend.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let service = Arc::new(MemoryDataService::new());
        let self_id = config.identity.self_id.clone();
        service.add_user(&self_id, ProfileSummary::personal(&self_id, &self_id));

        Self::with_parts(config, host_sensors(), service, Arc::new(SystemClock))
    }

    /// Builds the state from explicit collaborators.
    #[must_use]
    pub fn with_parts(
        config: &Config,
        sensors: SensorSuite,
        service: Arc<dyn DataService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            hub: DiscoveryHub::from_config(config, sensors, service, clock),
        }
    }

    /// Wraps the state for sharing between handlers.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(self)
    }
}

/// Sensors for this build.
///
/// With `mock-sensors`, Bluetooth and Location are simulated adapters that
/// are always available; NFC stays unsupported.
#[cfg(feature = "mock-sensors")]
fn host_sensors() -> SensorSuite {
    use nearby_core::{MockAdapter, NullAdapter};

    info!("Using simulated Bluetooth and Location sensors");
    SensorSuite {
        bluetooth: Arc::new(MockAdapter::available()),
        nfc: Arc::new(NullAdapter::new("no NFC reader on this host")),
        location: Arc::new(MockAdapter::available()),
    }
}

#[cfg(not(feature = "mock-sensors"))]
fn host_sensors() -> SensorSuite {
    info!("No sensor backends compiled in, every channel reports unavailable");
    SensorSuite::unsupported()
}
