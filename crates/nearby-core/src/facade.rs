//! UI-facing discovery surface.
//!
//! [`DiscoveryFacade`] is the only object a view touches for one channel.
//! [`DiscoveryHub`] builds the three facades from configuration and tears
//! them all down together.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::adapter::{NullAdapter, PositionSource, SensorAdapter};
use crate::backend::{ConnectionRequest, DataService};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{DiscoveryError, Result};
use crate::scanner::{ChannelDriver, ControllerSettings, ScanController};
use crate::sync::{GeoSync, RadioSync};
use crate::types::{Channel, ChannelStatus, DiscoveredUser, ScannerState};

/// One channel's discovery, as seen by a view.
#[derive(Debug)]
pub struct DiscoveryFacade {
    controller: ScanController,
    enabled: bool,
}

impl DiscoveryFacade {
    /// Wraps a controller. A disabled facade refuses to start.
    #[must_use]
    pub const fn new(controller: ScanController, enabled: bool) -> Self {
        Self {
            controller,
            enabled,
        }
    }

    /// The channel this facade drives.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.controller.channel()
    }

    /// Starts discovery. Calling it again before [`stop`](Self::stop) has no effect.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::ChannelDisabled`] for a disabled channel, or
    /// the terminal start failure.
    pub async fn start(&self, auto_retry: bool) -> Result<()> {
        if !self.enabled {
            return Err(DiscoveryError::ChannelDisabled(self.channel()));
        }
        self.controller.start(auto_retry).await
    }

    /// Stops discovery and forgets everything discovered.
    pub fn stop(&self) {
        self.controller.stop();
    }

    /// Current discovered users.
    #[must_use]
    pub fn get_discovered(&self) -> Vec<DiscoveredUser> {
        self.controller.get_discovered()
    }

    /// Sets the callback for new and updated users.
    pub fn on_user_discovered(&self, callback: impl Fn(&DiscoveredUser) + Send + Sync + 'static) {
        self.controller.set_on_user_discovered(callback);
    }

    /// Sets the callback for surfaced errors.
    pub fn on_error(&self, callback: impl Fn(&DiscoveryError) + Send + Sync + 'static) {
        self.controller.set_on_error(callback);
    }

    /// Switches between foreground and background scan cadence.
    pub fn set_background_mode(&self, enabled: bool) {
        self.controller.set_background_mode(enabled);
    }

    /// Status for the channel indicator.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.controller.status()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> ScannerState {
        self.controller.state()
    }
}

/// The platform sensors behind each channel.
#[derive(Clone)]
pub struct SensorSuite {
    /// Bluetooth detection.
    pub bluetooth: Arc<dyn SensorAdapter>,
    /// NFC detection.
    pub nfc: Arc<dyn SensorAdapter>,
    /// Position updates.
    pub location: Arc<dyn PositionSource>,
}

impl SensorSuite {
    /// A suite where every sensor reports unavailable.
    #[must_use]
    pub fn unsupported() -> Self {
        Self {
            bluetooth: Arc::new(NullAdapter::new("no Bluetooth adapter on this host")),
            nfc: Arc::new(NullAdapter::new("no NFC reader on this host")),
            location: Arc::new(NullAdapter::new("no location provider on this host")),
        }
    }
}

impl std::fmt::Debug for SensorSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorSuite").finish_non_exhaustive()
    }
}

/// The three channel facades for the local user.
pub struct DiscoveryHub {
    self_id: String,
    auto_retry: bool,
    service: Arc<dyn DataService>,
    bluetooth: DiscoveryFacade,
    nfc: DiscoveryFacade,
    location: DiscoveryFacade,
}

impl std::fmt::Debug for DiscoveryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryHub")
            .field("self_id", &self.self_id)
            .field("bluetooth", &self.bluetooth)
            .field("nfc", &self.nfc)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

impl DiscoveryHub {
    /// Builds every channel from `config`.
    #[must_use]
    pub fn from_config(
        config: &Config,
        sensors: SensorSuite,
        service: Arc<dyn DataService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let self_id = config.identity.self_id.clone();
        let radio = |channel: Channel, adapter: Arc<dyn SensorAdapter>| {
            let channel_config = match channel {
                Channel::Nfc => &config.nfc,
                _ => &config.bluetooth,
            };
            let sync = RadioSync::new(
                Arc::clone(&service),
                Arc::clone(&clock),
                self_id.clone(),
                channel,
                channel_config.presence_window(),
            );
            let controller = ScanController::new(
                channel,
                ChannelDriver::Radio { adapter, sync },
                ControllerSettings::radio(config, channel_config),
                Arc::clone(&clock),
            );
            DiscoveryFacade::new(controller, channel_config.enabled)
        };
        let bluetooth = radio(Channel::Bluetooth, sensors.bluetooth);
        let nfc = radio(Channel::Nfc, sensors.nfc);

        let geo = GeoSync::new(
            Arc::clone(&service),
            Arc::clone(&clock),
            self_id.clone(),
            config.location.radius_meters,
            chrono::Duration::hours(i64::from(config.location.freshness_hours)),
        );
        let location = DiscoveryFacade::new(
            ScanController::new(
                Channel::Location,
                ChannelDriver::Geo {
                    source: sensors.location,
                    sync: geo,
                },
                ControllerSettings::location(config),
                Arc::clone(&clock),
            ),
            config.location.enabled,
        );

        info!(self_id = %self_id, "Discovery hub ready");
        Self {
            self_id,
            auto_retry: config.discovery.auto_retry,
            service,
            bluetooth,
            nfc,
            location,
        }
    }

    /// Id of the local user.
    #[must_use]
    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Auto-retry used when a caller does not choose.
    #[must_use]
    pub const fn default_auto_retry(&self) -> bool {
        self.auto_retry
    }

    /// The facade for `channel`.
    #[must_use]
    pub const fn channel(&self, channel: Channel) -> &DiscoveryFacade {
        match channel {
            Channel::Bluetooth => &self.bluetooth,
            Channel::Nfc => &self.nfc,
            Channel::Location => &self.location,
        }
    }

    /// Every facade, in [`Channel::ALL`] order.
    pub fn channels(&self) -> impl Iterator<Item = &DiscoveryFacade> {
        Channel::ALL.into_iter().map(|channel| self.channel(channel))
    }

    /// Status of every channel.
    #[must_use]
    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.channels().map(DiscoveryFacade::status).collect()
    }

    /// Stops every channel.
    pub fn stop_all(&self) {
        for facade in self.channels() {
            facade.stop();
        }
    }

    /// Asks the backend to connect the local user with `target_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::UserNotFound`] for an unknown target, or the
    /// backend failure.
    #[instrument(skip(self))]
    pub async fn request_connection(&self, target_id: &str) -> Result<ConnectionRequest> {
        let request = self
            .service
            .send_connection_request(&self.self_id, target_id)
            .await?;
        info!(request_id = %request.id, "Connection request sent");
        Ok(request)
    }
}
