//! # nearby-core
//!
//! Core engine for proximity-based social discovery.
//!
//! Three independent channels (Bluetooth, NFC, Location) each produce
//! "sightings" of other users. Sightings are merged into a per-channel
//! presence registry with time-based expiry and exposed to a UI through a
//! callback-driven facade.
//!
//! ## Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`adapter`] - Platform sensor contracts, plus null and mock sensors
//! - [`backend`] - Backend data service contract and an in-memory implementation
//! - [`clock`] - Wall-clock abstraction for timestamps
//! - [`config`] - Configuration loading, saving, and validation
//! - [`error`] - Unified error types for the crate
//! - [`facade`] - The UI-facing channel facades and the hub that owns them
//! - [`registry`] - Per-channel presence registry with TTL eviction
//! - [`scanner`] - Channel lifecycle, scan loops and retry
//! - [`sync`] - Backend presence and radius queries
//! - [`types`] - Shared types and OpenAPI schemas

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod adapter;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod facade;
pub mod registry;
pub mod scanner;
pub mod sync;
pub mod types;

// Re-export primary types for convenience
#[cfg(any(test, feature = "mock-sensors"))]
pub use adapter::MockAdapter;
pub use adapter::{
    Accuracy, AdapterError, AdapterEvent, AdapterResult, EncounterSink, NullAdapter,
    PositionOptions, PositionSink, PositionSource, PositionSubscription, RawEncounter,
    SensorAdapter,
};
pub use backend::{
    BackendError, BackendResult, ConnectionRequest, DataService, MemoryDataService, NearbyRecord,
    UserRecord,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{default_config_path, Config, ConfigError, ConfigResult};
pub use error::{DiscoveryError, ErrorClass, Result};
pub use facade::{DiscoveryFacade, DiscoveryHub, SensorSuite};
pub use registry::PresenceRegistry;
pub use scanner::{ControllerSettings, RetryPolicy, ScanController};
pub use types::{
    AccountType, Channel, ChannelStatus, DiscoveredUser, Position, ProfileSummary, ScannerState,
    Sighting,
};
