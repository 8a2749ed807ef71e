//! Shared types and OpenAPI schemas.
//!
//! This module contains the data model the engine passes between its layers:
//! sightings flowing in from sensors and the backend, the merged
//! [`DiscoveredUser`] records held by the registry, and the per-channel
//! status surfaced to the UI.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// One of the three discovery modalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Short-range radio presence.
    Bluetooth,
    /// Contact-based tag exchange.
    Nfc,
    /// Coarse geolocation.
    Location,
}

impl Channel {
    /// Every channel, in display order.
    pub const ALL: [Self; 3] = [Self::Bluetooth, Self::Nfc, Self::Location];

    /// Stable lowercase name, also used as the backend channel marker.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bluetooth => "bluetooth",
            Self::Nfc => "nfc",
            Self::Location => "location",
        }
    }

    /// Whether this channel infers proximity from radio activity rather than position.
    #[must_use]
    pub const fn is_radio(self) -> bool {
        matches!(self, Self::Bluetooth | Self::Nfc)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bluetooth" | "ble" => Ok(Self::Bluetooth),
            "nfc" => Ok(Self::Nfc),
            "location" | "geo" => Ok(Self::Location),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// Kind of account behind a discovered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// Individual account.
    #[default]
    Personal,
    /// Company or brand account.
    Business,
}

/// The profile slice every backend row carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProfileSummary {
    /// Unique handle.
    #[schema(example = "ada")]
    pub username: String,

    /// Human-readable name.
    #[schema(example = "Ada Lovelace")]
    pub display_name: String,

    /// Avatar image URL, if the user has one.
    pub avatar_url: Option<String>,

    /// Personal or business account.
    pub account_type: AccountType,
}

impl ProfileSummary {
    /// Convenience constructor for a personal account without an avatar.
    pub fn personal(username: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            display_name: display_name.into(),
            avatar_url: None,
            account_type: AccountType::Personal,
        }
    }
}

/// A single normalized detection event from one channel.
///
/// Sightings are never stored on their own; the registry folds them into
/// [`DiscoveredUser`] records.
#[derive(Debug, Clone, PartialEq)]
pub struct Sighting {
    /// Id of the detected user.
    pub subject_id: String,
    /// Channel that produced the detection.
    pub channel: Channel,
    /// When the detection happened.
    pub observed_at: DateTime<Utc>,
    /// Profile data attached to the detection.
    pub profile: ProfileSummary,
    /// Distance to the subject, when the channel measures one.
    pub distance_meters: Option<f64>,
    /// Friend annotation; `None` for a plain sighting.
    pub is_friend: Option<bool>,
}

impl Sighting {
    /// Creates a plain sighting with no distance or friend data.
    pub fn new(
        subject_id: impl Into<String>,
        channel: Channel,
        observed_at: DateTime<Utc>,
        profile: ProfileSummary,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            channel,
            observed_at,
            profile,
            distance_meters: None,
            is_friend: None,
        }
    }

    /// Attaches a distance in meters.
    #[must_use]
    pub const fn with_distance(mut self, meters: f64) -> Self {
        self.distance_meters = Some(meters);
        self
    }

    /// Attaches a friend annotation.
    #[must_use]
    pub const fn with_friend(mut self, is_friend: bool) -> Self {
        self.is_friend = Some(is_friend);
        self
    }
}

/// The registry's merged, time-stamped record for one discovered identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "u-42",
    "username": "ada",
    "display_name": "Ada Lovelace",
    "avatar_url": null,
    "account_type": "personal",
    "last_seen": "2026-01-15T03:30:00Z",
    "distance_meters": 100.0,
    "is_friend": true
}))]
pub struct DiscoveredUser {
    /// User id, unique within one channel's registry.
    pub id: String,
    /// Unique handle.
    pub username: String,
    /// Human-readable name.
    pub display_name: String,
    /// Avatar image URL.
    pub avatar_url: Option<String>,
    /// Personal or business account.
    pub account_type: AccountType,
    /// Most recent sighting time. Never moves backwards.
    pub last_seen: DateTime<Utc>,
    /// Distance in meters, for channels that measure one.
    pub distance_meters: Option<f64>,
    /// Whether the user is an accepted connection of the local user.
    pub is_friend: Option<bool>,
}

impl DiscoveredUser {
    /// Builds a fresh record from a first sighting.
    #[must_use]
    pub fn from_sighting(sighting: Sighting) -> Self {
        Self {
            id: sighting.subject_id,
            username: sighting.profile.username,
            display_name: sighting.profile.display_name,
            avatar_url: sighting.profile.avatar_url,
            account_type: sighting.profile.account_type,
            last_seen: sighting.observed_at,
            distance_meters: sighting.distance_meters,
            is_friend: sighting.is_friend,
        }
    }
}

/// Scan lifecycle of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScannerState {
    /// Not scanning; `start()` is accepted.
    #[default]
    Idle,
    /// Checking adapter availability.
    Requesting,
    /// Loops are running.
    Scanning,
    /// A start attempt failed and is being classified.
    Erroring,
    /// Waiting for the retry delay before the next start attempt.
    BackoffWait,
}

impl ScannerState {
    /// Whether the channel is doing (or about to do) work.
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// Per-channel indicator rendered by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "channel": "bluetooth",
    "state": "scanning",
    "background_mode": false,
    "discovered": 3,
    "last_error": null
}))]
pub struct ChannelStatus {
    /// Which channel this status describes.
    pub channel: Channel,
    /// Current scanner state.
    pub state: ScannerState,
    /// Whether the slow background cadence is active.
    pub background_mode: bool,
    /// Number of users currently in the registry.
    pub discovered: usize,
    /// Most recent error surfaced to the UI since the last `start()`.
    pub last_error: Option<String>,
}

/// A geographic coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Position {
    /// Latitude, -90 to 90.
    pub latitude: f64,
    /// Longitude, -180 to 180.
    pub longitude: f64,
}

impl Position {
    /// Creates a position.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_round_trips_through_str() {
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert_eq!("BLE".parse::<Channel>().unwrap(), Channel::Bluetooth);
        assert!("wifi".parse::<Channel>().is_err());
    }

    #[test]
    fn test_channel_serializes_lowercase() {
        let json = serde_json::to_string(&Channel::Nfc).unwrap();
        assert_eq!(json, "\"nfc\"");
    }

    #[test]
    fn test_radio_channels() {
        assert!(Channel::Bluetooth.is_radio());
        assert!(Channel::Nfc.is_radio());
        assert!(!Channel::Location.is_radio());
    }

    #[test]
    fn test_discovered_user_from_sighting() {
        let now = Utc::now();
        let sighting = Sighting::new(
            "u1",
            Channel::Location,
            now,
            ProfileSummary::personal("ada", "Ada"),
        )
        .with_distance(42.0);

        let user = DiscoveredUser::from_sighting(sighting);
        assert_eq!(user.id, "u1");
        assert_eq!(user.username, "ada");
        assert_eq!(user.last_seen, now);
        assert_eq!(user.distance_meters, Some(42.0));
        assert_eq!(user.is_friend, None);
    }

    #[test]
    fn test_scanner_state_serialization() {
        let json = serde_json::to_string(&ScannerState::BackoffWait).unwrap();
        assert_eq!(json, "\"backoff_wait\"");
        assert!(!ScannerState::Idle.is_active());
        assert!(ScannerState::Scanning.is_active());
    }
}
