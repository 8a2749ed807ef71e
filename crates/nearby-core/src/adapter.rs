//! Sensor adapter abstraction.
//!
//! The radios and positioning hardware are provided by the platform. The
//! engine only sees them through [`SensorAdapter`] (availability plus a
//! detection event stream) and [`PositionSource`] (push-based position
//! updates). Platform implementations are chosen when the engine is
//! composed; [`NullAdapter`] stands in wherever a capability does not exist.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{Position, ProfileSummary};

/// Errors reported by a sensor adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    /// Hardware is missing, powered off, or unsupported.
    #[error("sensor unavailable: {0}")]
    Unavailable(String),

    /// The OS refused the permission the sensor needs.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The hardware exists but is in use or still initializing.
    #[error("sensor busy: {0}")]
    Busy(String),

    /// The user dismissed a system prompt mid-flow.
    #[error("cancelled by user")]
    Cancelled,

    /// Any other adapter failure.
    #[error("sensor failure: {0}")]
    Failed(String),
}

/// Result type for adapter calls.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Identity carried by an encounter, when the channel exchanges one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncounterSubject {
    /// Id of the other user.
    pub id: String,
    /// Profile data read alongside the id.
    pub profile: ProfileSummary,
}

/// A raw detection as delivered by the platform.
///
/// Radio scans usually produce anonymous encounters (activity only); a tag
/// exchange carries the other party's identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawEncounter {
    /// The detected identity, if any.
    pub subject: Option<EncounterSubject>,
}

impl RawEncounter {
    /// An encounter without identity.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self { subject: None }
    }

    /// An encounter that identifies the other user.
    pub fn identified(id: impl Into<String>, profile: ProfileSummary) -> Self {
        Self {
            subject: Some(EncounterSubject {
                id: id.into(),
                profile,
            }),
        }
    }
}

/// Events pushed by an adapter while detection is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// Something was detected.
    Encounter(RawEncounter),
    /// Detection failed asynchronously.
    Failed(AdapterError),
}

/// Where adapters push detection events.
pub type EncounterSink = mpsc::UnboundedSender<AdapterEvent>;

/// Where position sources push fixes.
pub type PositionSink = mpsc::UnboundedSender<Position>;

/// Requested positioning accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    /// Best available fix.
    High,
    /// City-block level, lower power.
    #[default]
    Balanced,
    /// Coarse fix only.
    Low,
}

/// Options for position updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    /// Target delivery interval. There is no minimum displacement filter.
    pub interval: Duration,
    /// Requested accuracy tier.
    pub accuracy: Accuracy,
}

/// Handle that removes a position subscription.
///
/// Cancels on [`cancel`](Self::cancel) or when dropped.
pub struct PositionSubscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl PositionSubscription {
    /// Wraps an unsubscribe action.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribes now.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for PositionSubscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for PositionSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// A platform radio or tag reader.
#[async_trait]
pub trait SensorAdapter: Send + Sync {
    /// Queries hardware and permission state. Never cached by callers.
    async fn is_available(&self) -> AdapterResult<bool>;

    /// Starts (or restarts) a detection window, replacing any previous sink.
    async fn start_detection(&self, events: EncounterSink) -> AdapterResult<()>;

    /// Stops detection and unregisters the sink.
    ///
    /// Synchronous so that unregistration has completed when it returns.
    fn stop_detection(&self);
}

/// A platform positioning service.
#[async_trait]
pub trait PositionSource: SensorAdapter {
    /// Subscribes to position fixes. Fixes arrive whenever the OS delivers them.
    async fn start_position_updates(
        &self,
        updates: PositionSink,
        options: PositionOptions,
    ) -> AdapterResult<PositionSubscription>;
}

/// Stand-in for capabilities the device does not have.
#[derive(Debug, Clone, Default)]
pub struct NullAdapter {
    reason: String,
}

impl NullAdapter {
    /// Creates a null adapter that reports `reason` when asked to start.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SensorAdapter for NullAdapter {
    async fn is_available(&self) -> AdapterResult<bool> {
        Ok(false)
    }

    async fn start_detection(&self, _events: EncounterSink) -> AdapterResult<()> {
        Err(AdapterError::Unavailable(self.reason.clone()))
    }

    fn stop_detection(&self) {}
}

#[async_trait]
impl PositionSource for NullAdapter {
    async fn start_position_updates(
        &self,
        _updates: PositionSink,
        _options: PositionOptions,
    ) -> AdapterResult<PositionSubscription> {
        Err(AdapterError::Unavailable(self.reason.clone()))
    }
}

#[cfg(any(test, feature = "mock-sensors"))]
pub use mock::MockAdapter;

#[cfg(any(test, feature = "mock-sensors"))]
mod mock {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{
        AdapterError, AdapterEvent, AdapterResult, EncounterSink, PositionOptions, PositionSink,
        PositionSource, PositionSubscription, RawEncounter, SensorAdapter,
    };
    use crate::types::Position;

    /// Scriptable adapter for tests and hardware-less deployments.
    ///
    /// Availability answers are taken from a queue first and fall back to a
    /// default. Encounters, failures and positions are injected by hand.
    #[derive(Debug)]
    pub struct MockAdapter {
        default_availability: Mutex<AdapterResult<bool>>,
        scripted: Mutex<VecDeque<AdapterResult<bool>>>,
        detection_failure: Mutex<Option<AdapterError>>,
        sink: Mutex<Option<EncounterSink>>,
        positions: Arc<Mutex<Option<PositionSink>>>,
        last_options: Mutex<Option<PositionOptions>>,
        availability_checks: AtomicUsize,
        detection_starts: AtomicUsize,
        detection_stops: AtomicUsize,
        active_subscriptions: Arc<AtomicUsize>,
    }

    impl Default for MockAdapter {
        fn default() -> Self {
            Self::available()
        }
    }

    impl MockAdapter {
        /// An adapter that is always available.
        #[must_use]
        pub fn available() -> Self {
            Self::with_availability(Ok(true))
        }

        /// An adapter whose availability checks return `result` by default.
        #[must_use]
        pub fn with_availability(result: AdapterResult<bool>) -> Self {
            Self {
                default_availability: Mutex::new(result),
                scripted: Mutex::new(VecDeque::new()),
                detection_failure: Mutex::new(None),
                sink: Mutex::new(None),
                positions: Arc::new(Mutex::new(None)),
                last_options: Mutex::new(None),
                availability_checks: AtomicUsize::new(0),
                detection_starts: AtomicUsize::new(0),
                detection_stops: AtomicUsize::new(0),
                active_subscriptions: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Changes the default availability answer.
        pub fn set_availability(&self, result: AdapterResult<bool>) {
            *self.default_availability.lock() = result;
        }

        /// Queues one availability answer ahead of the default.
        pub fn push_availability(&self, result: AdapterResult<bool>) {
            self.scripted.lock().push_back(result);
        }

        /// Makes subsequent `start_detection` calls fail (or succeed with `None`).
        pub fn fail_detection(&self, error: Option<AdapterError>) {
            *self.detection_failure.lock() = error;
        }

        /// Delivers an encounter to the registered sink.
        ///
        /// Returns `false` when no sink is registered.
        pub fn emit(&self, encounter: RawEncounter) -> bool {
            self.send(AdapterEvent::Encounter(encounter))
        }

        /// Delivers an asynchronous detection failure.
        pub fn emit_failure(&self, error: AdapterError) -> bool {
            self.send(AdapterEvent::Failed(error))
        }

        /// Delivers a position fix to the active subscription.
        pub fn push_position(&self, position: Position) -> bool {
            self.positions
                .lock()
                .as_ref()
                .is_some_and(|sink| sink.send(position).is_ok())
        }

        /// Number of availability checks performed.
        pub fn availability_checks(&self) -> usize {
            self.availability_checks.load(Ordering::SeqCst)
        }

        /// Number of `start_detection` calls.
        pub fn detection_starts(&self) -> usize {
            self.detection_starts.load(Ordering::SeqCst)
        }

        /// Number of `stop_detection` calls.
        pub fn detection_stops(&self) -> usize {
            self.detection_stops.load(Ordering::SeqCst)
        }

        /// Whether a detection sink is currently registered.
        pub fn is_detecting(&self) -> bool {
            self.sink.lock().is_some()
        }

        /// Number of position subscriptions not yet cancelled.
        pub fn active_subscriptions(&self) -> usize {
            self.active_subscriptions.load(Ordering::SeqCst)
        }

        /// Options passed to the latest position subscription.
        pub fn last_position_options(&self) -> Option<PositionOptions> {
            *self.last_options.lock()
        }

        fn send(&self, event: AdapterEvent) -> bool {
            self.sink
                .lock()
                .as_ref()
                .is_some_and(|sink| sink.send(event).is_ok())
        }
    }

    #[async_trait]
    impl SensorAdapter for MockAdapter {
        async fn is_available(&self) -> AdapterResult<bool> {
            self.availability_checks.fetch_add(1, Ordering::SeqCst);
            if let Some(result) = self.scripted.lock().pop_front() {
                return result;
            }
            self.default_availability.lock().clone()
        }

        async fn start_detection(&self, events: EncounterSink) -> AdapterResult<()> {
            self.detection_starts.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.detection_failure.lock().clone() {
                return Err(err);
            }
            *self.sink.lock() = Some(events);
            Ok(())
        }

        fn stop_detection(&self) {
            self.detection_stops.fetch_add(1, Ordering::SeqCst);
            self.sink.lock().take();
        }
    }

    #[async_trait]
    impl PositionSource for MockAdapter {
        async fn start_position_updates(
            &self,
            updates: PositionSink,
            options: PositionOptions,
        ) -> AdapterResult<PositionSubscription> {
            if let Some(err) = self.detection_failure.lock().clone() {
                return Err(err);
            }
            *self.positions.lock() = Some(updates);
            *self.last_options.lock() = Some(options);
            self.active_subscriptions.fetch_add(1, Ordering::SeqCst);

            let positions = Arc::clone(&self.positions);
            let active = Arc::clone(&self.active_subscriptions);
            Ok(PositionSubscription::new(move || {
                positions.lock().take();
                active.fetch_sub(1, Ordering::SeqCst);
            }))
        }
    }
}
