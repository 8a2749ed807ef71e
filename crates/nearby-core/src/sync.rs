//! Remote sync against the backend data service.
//!
//! Two query shapes:
//!
//! - [`RadioSync`] (Bluetooth, NFC) never learns a peer identity over the
//!   radio. An active radio channel is treated as "I am reachable": each
//!   local scan tick advertises the caller's presence, and each discovery
//!   tick asks the backend who else advertised recently. The two halves are
//!   separate calls so the proxy stays visible.
//! - [`GeoSync`] (Location) writes every position fix and runs a radius
//!   query from the last known position.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::backend::DataService;
use crate::clock::{cutoff, Clock};
use crate::error::Result;
use crate::types::{Channel, Position, Sighting};

/// Kilometers to meters.
const METERS_PER_KM: f64 = 1000.0;

/// Output of one discovery tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryBatch {
    /// Sightings to merge into the registry.
    pub sightings: Vec<Sighting>,
    /// Authoritative friend set, when the query fetched one.
    pub friend_ids: Option<HashSet<String>>,
}

/// Presence-based sync for radio channels.
pub struct RadioSync {
    service: Arc<dyn DataService>,
    clock: Arc<dyn Clock>,
    self_id: String,
    channel: Channel,
    presence_window: Duration,
}

impl RadioSync {
    /// Creates a radio sync for `channel`.
    pub fn new(
        service: Arc<dyn DataService>,
        clock: Arc<dyn Clock>,
        self_id: impl Into<String>,
        channel: Channel,
        presence_window: Duration,
    ) -> Self {
        Self {
            service,
            clock,
            self_id: self_id.into(),
            channel,
            presence_window,
        }
    }

    /// Upserts the caller's own presence row for this channel.
    ///
    /// # Errors
    ///
    /// Returns the backend error; callers log it and carry on.
    #[instrument(level = "debug", skip(self), fields(channel = %self.channel))]
    pub async fn advertise_self(&self) -> Result<()> {
        let now = self.clock.now();
        self.service
            .upsert_self_presence(&self.self_id, self.channel, now)
            .await?;
        debug!("Advertised own presence");
        Ok(())
    }

    /// Fetches fresh presences and friends, and cross-references them.
    ///
    /// Every fresh user becomes a sighting. Fresh friends are annotated
    /// `is_friend = true`; strangers are plain sightings. The friend set is
    /// returned for the registry's authoritative refresh.
    ///
    /// # Errors
    ///
    /// Returns the first backend error.
    #[instrument(level = "debug", skip(self), fields(channel = %self.channel))]
    pub async fn discover(&self) -> Result<DiscoveryBatch> {
        let now = self.clock.now();
        let since = cutoff(now, self.presence_window);

        let fresh = self
            .service
            .query_fresh_presences(&self.self_id, self.channel, since)
            .await?;
        let friends = self
            .service
            .query_accepted_connections(&self.self_id)
            .await?;
        let friend_ids: HashSet<String> = friends.into_iter().map(|f| f.id).collect();

        let sightings: Vec<Sighting> = fresh
            .into_iter()
            .map(|user| {
                let sighting = Sighting::new(user.id, self.channel, now, user.profile);
                if friend_ids.contains(&sighting.subject_id) {
                    sighting.with_friend(true)
                } else {
                    sighting
                }
            })
            .collect();

        debug!(
            fresh = sightings.len(),
            friends = friend_ids.len(),
            "Radio discovery query complete"
        );
        Ok(DiscoveryBatch {
            sightings,
            friend_ids: Some(friend_ids),
        })
    }
}

/// Radius-based sync for the location channel.
pub struct GeoSync {
    service: Arc<dyn DataService>,
    clock: Arc<dyn Clock>,
    self_id: String,
    radius_meters: f64,
    freshness: Duration,
    last_position: Mutex<Option<Position>>,
}

impl GeoSync {
    /// Creates a location sync.
    pub fn new(
        service: Arc<dyn DataService>,
        clock: Arc<dyn Clock>,
        self_id: impl Into<String>,
        radius_meters: f64,
        freshness: Duration,
    ) -> Self {
        Self {
            service,
            clock,
            self_id: self_id.into(),
            radius_meters,
            freshness,
            last_position: Mutex::new(None),
        }
    }

    /// Remembers `position` and writes it to the backend.
    ///
    /// The position is kept for the next radius query even if the write fails.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn record_position(&self, position: Position) -> Result<()> {
        self.remember(position);
        self.publish(position).await
    }

    /// Keeps `position` as the center of the next radius query.
    pub fn remember(&self, position: Position) {
        *self.last_position.lock() = Some(position);
    }

    /// Writes `position` to the backend without remembering it.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    #[instrument(level = "debug", skip(self))]
    pub async fn publish(&self, position: Position) -> Result<()> {
        let now = self.clock.now();
        self.service
            .update_self_location(&self.self_id, position, now)
            .await?;
        Ok(())
    }

    /// The most recent position fix.
    pub fn last_position(&self) -> Option<Position> {
        *self.last_position.lock()
    }

    /// Forgets the last position, so a new session waits for a fresh fix.
    pub fn reset(&self) {
        self.last_position.lock().take();
    }

    /// Runs the radius query from the last known position.
    ///
    /// Yields nothing before the first fix. Distances arrive in kilometers
    /// and are converted to meters.
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    #[instrument(level = "debug", skip(self))]
    pub async fn discover(&self) -> Result<DiscoveryBatch> {
        let Some(center) = self.last_position() else {
            debug!("No position fix yet, skipping nearby query");
            return Ok(DiscoveryBatch::default());
        };

        let now = self.clock.now();
        let nearby = self
            .service
            .query_nearby_by_location(
                &self.self_id,
                center,
                self.radius_meters,
                cutoff(now, self.freshness),
            )
            .await?;

        let sightings = nearby
            .into_iter()
            .map(|row| {
                Sighting::new(row.user.id, Channel::Location, now, row.user.profile)
                    .with_distance(row.distance_km * METERS_PER_KM)
            })
            .collect::<Vec<_>>();

        debug!(nearby = sightings.len(), "Location discovery query complete");
        Ok(DiscoveryBatch {
            sightings,
            friend_ids: None,
        })
    }
}
