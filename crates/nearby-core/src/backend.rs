//! Backend presence and social data service.
//!
//! Durable state (presence rows, locations, the friend graph) lives behind
//! the [`DataService`] trait. The transport is whatever generic data client
//! the host application uses; [`MemoryDataService`] keeps everything in
//! process for tests and standalone deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use uuid::Uuid;

use crate::types::{Channel, Position, ProfileSummary};

/// Mean Earth radius used for great-circle distances.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Connection requests kept by [`MemoryDataService`]; older ones are dropped.
pub const MAX_RECORDED_REQUESTS: usize = 256;

/// Errors returned by the data service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The service could not be reached.
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The service refused the request.
    #[error("backend rejected request: {0}")]
    Rejected(String),

    /// A referenced user does not exist.
    #[error("user not found: {0}")]
    NotFound(String),
}

/// Result type for data service calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// A user as returned by presence and connection queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// User id.
    pub id: String,
    /// Profile summary.
    pub profile: ProfileSummary,
}

/// A user returned by a radius query.
#[derive(Debug, Clone, PartialEq)]
pub struct NearbyRecord {
    /// The user.
    pub user: UserRecord,
    /// Server-computed distance, in kilometers.
    pub distance_km: f64,
}

/// Outcome of a connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Request id assigned by the service.
    pub id: Uuid,
    /// Requesting user.
    pub from: String,
    /// Target user.
    pub to: String,
    /// When the request was recorded.
    pub created_at: DateTime<Utc>,
}

/// Operations the engine needs from the backend.
#[async_trait]
pub trait DataService: Send + Sync {
    /// Upserts the "last active" row for `self_id` on `channel`.
    ///
    /// Keyed by `(self_id, channel)`, so repeated calls never duplicate rows.
    async fn upsert_self_presence(
        &self,
        self_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> BackendResult<()>;

    /// Users whose presence on `channel` was updated at or after `since`, excluding `exclude_id`.
    async fn query_fresh_presences(
        &self,
        exclude_id: &str,
        channel: Channel,
        since: DateTime<Utc>,
    ) -> BackendResult<Vec<UserRecord>>;

    /// Accepted friend connections of `self_id`.
    ///
    /// Every connection is returned, including friends without a profile.
    async fn query_accepted_connections(&self, self_id: &str) -> BackendResult<Vec<UserRecord>>;

    /// Records the caller's latest position.
    async fn update_self_location(
        &self,
        self_id: &str,
        position: Position,
        at: DateTime<Utc>,
    ) -> BackendResult<()>;

    /// Users within `radius_meters` of `center` whose location is newer than `since`.
    ///
    /// Implementations exclude the caller's own row when they can identify it.
    async fn query_nearby_by_location(
        &self,
        self_id: &str,
        center: Position,
        radius_meters: f64,
        since: DateTime<Utc>,
    ) -> BackendResult<Vec<NearbyRecord>>;

    /// Sends a connection request from `self_id` to `target_id`.
    async fn send_connection_request(
        &self,
        self_id: &str,
        target_id: &str,
    ) -> BackendResult<ConnectionRequest>;
}

/// Great-circle distance between two positions, in kilometers.
#[must_use]
pub fn haversine_km(a: Position, b: Position) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[derive(Debug, Default)]
struct Tables {
    profiles: HashMap<String, ProfileSummary>,
    presence: HashMap<(String, Channel), DateTime<Utc>>,
    locations: HashMap<String, (Position, DateTime<Utc>)>,
    connections: HashSet<(String, String)>,
    requests: VecDeque<ConnectionRequest>,
}

impl Tables {
    fn record(&self, id: &str) -> Option<UserRecord> {
        self.profiles.get(id).map(|profile| UserRecord {
            id: id.to_string(),
            profile: profile.clone(),
        })
    }

    /// Like [`record`](Self::record), but a user without a profile gets a
    /// placeholder named after their id.
    fn record_or_placeholder(&self, id: &str) -> UserRecord {
        self.record(id).unwrap_or_else(|| UserRecord {
            id: id.to_string(),
            profile: ProfileSummary::personal(id, id),
        })
    }
}

/// In-process data service.
///
/// Every query consults the same tables, so seeding helpers and engine writes
/// are visible to each other immediately. [`set_failing`](Self::set_failing)
/// makes every call return [`BackendError::Unreachable`], and
/// [`set_latency`](Self::set_latency) delays every call on the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryDataService {
    tables: RwLock<Tables>,
    failing: AtomicBool,
    latency: Mutex<Duration>,
}

impl MemoryDataService {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a user profile.
    pub fn add_user(&self, id: impl Into<String>, profile: ProfileSummary) {
        self.tables.write().profiles.insert(id.into(), profile);
    }

    /// Sets a presence row directly.
    pub fn set_presence(&self, id: impl Into<String>, channel: Channel, at: DateTime<Utc>) {
        self.tables
            .write()
            .presence
            .insert((id.into(), channel), at);
    }

    /// Sets a location row directly.
    pub fn set_location(&self, id: impl Into<String>, position: Position, at: DateTime<Utc>) {
        self.tables
            .write()
            .locations
            .insert(id.into(), (position, at));
    }

    /// Records an accepted connection in both directions.
    pub fn connect(&self, a: impl Into<String>, b: impl Into<String>) {
        let (a, b) = (a.into(), b.into());
        let mut tables = self.tables.write();
        tables.connections.insert((a.clone(), b.clone()));
        tables.connections.insert((b, a));
    }

    /// Removes an accepted connection in both directions.
    pub fn disconnect(&self, a: &str, b: &str) {
        let mut tables = self.tables.write();
        tables
            .connections
            .remove(&(a.to_string(), b.to_string()));
        tables
            .connections
            .remove(&(b.to_string(), a.to_string()));
    }

    /// Makes every call fail with `Unreachable` while `failing` is true.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Delays every call by `latency` before it touches the tables.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Latest presence timestamp for `id` on `channel`.
    pub fn presence_of(&self, id: &str, channel: Channel) -> Option<DateTime<Utc>> {
        self.tables
            .read()
            .presence
            .get(&(id.to_string(), channel))
            .copied()
    }

    /// Number of presence rows across all users and channels.
    pub fn presence_rows(&self) -> usize {
        self.tables.read().presence.len()
    }

    /// Latest recorded location for `id`.
    pub fn location_of(&self, id: &str) -> Option<(Position, DateTime<Utc>)> {
        self.tables.read().locations.get(id).copied()
    }

    /// The most recent connection requests, oldest first.
    ///
    /// At most [`MAX_RECORDED_REQUESTS`] are kept.
    pub fn connection_requests(&self) -> Vec<ConnectionRequest> {
        self.tables.read().requests.iter().cloned().collect()
    }

    async fn round_trip(&self) -> BackendResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            Err(BackendError::Unreachable("memory backend set to fail".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn upsert_self_presence(
        &self,
        self_id: &str,
        channel: Channel,
        at: DateTime<Utc>,
    ) -> BackendResult<()> {
        self.round_trip().await?;
        self.tables
            .write()
            .presence
            .insert((self_id.to_string(), channel), at);
        Ok(())
    }

    async fn query_fresh_presences(
        &self,
        exclude_id: &str,
        channel: Channel,
        since: DateTime<Utc>,
    ) -> BackendResult<Vec<UserRecord>> {
        self.round_trip().await?;
        let tables = self.tables.read();
        Ok(tables
            .presence
            .iter()
            .filter(|((id, ch), at)| *ch == channel && id != exclude_id && **at >= since)
            .filter_map(|((id, _), _)| tables.record(id))
            .collect())
    }

    async fn query_accepted_connections(&self, self_id: &str) -> BackendResult<Vec<UserRecord>> {
        self.round_trip().await?;
        let tables = self.tables.read();
        Ok(tables
            .connections
            .iter()
            .filter(|(from, _)| from == self_id)
            .map(|(_, to)| tables.record_or_placeholder(to))
            .collect())
    }

    async fn update_self_location(
        &self,
        self_id: &str,
        position: Position,
        at: DateTime<Utc>,
    ) -> BackendResult<()> {
        self.round_trip().await?;
        self.tables
            .write()
            .locations
            .insert(self_id.to_string(), (position, at));
        Ok(())
    }

    async fn query_nearby_by_location(
        &self,
        self_id: &str,
        center: Position,
        radius_meters: f64,
        since: DateTime<Utc>,
    ) -> BackendResult<Vec<NearbyRecord>> {
        self.round_trip().await?;
        let radius_km = radius_meters / 1000.0;
        let tables = self.tables.read();
        Ok(tables
            .locations
            .iter()
            .filter(|(id, (_, at))| id.as_str() != self_id && *at >= since)
            .filter_map(|(id, (position, _))| {
                let distance_km = haversine_km(center, *position);
                if distance_km > radius_km {
                    return None;
                }
                tables.record(id).map(|user| NearbyRecord { user, distance_km })
            })
            .collect())
    }

    async fn send_connection_request(
        &self,
        self_id: &str,
        target_id: &str,
    ) -> BackendResult<ConnectionRequest> {
        self.round_trip().await?;
        let mut tables = self.tables.write();
        if !tables.profiles.contains_key(target_id) {
            return Err(BackendError::NotFound(target_id.to_string()));
        }
        if self_id == target_id {
            return Err(BackendError::Rejected(
                "cannot send a connection request to yourself".into(),
            ));
        }
        let request = ConnectionRequest {
            id: Uuid::new_v4(),
            from: self_id.to_string(),
            to: target_id.to_string(),
            created_at: Utc::now(),
        };
        if tables.requests.len() == MAX_RECORDED_REQUESTS {
            tables.requests.pop_front();
        }
        tables.requests.push_back(request.clone());
        Ok(request)
    }
}
