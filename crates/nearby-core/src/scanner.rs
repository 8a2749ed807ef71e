//! Per-channel scan controller.
//!
//! A [`ScanController`] owns one channel's lifecycle:
//!
//! ```text
//! Idle -> Requesting -> Scanning
//!            |
//!            +-> Erroring -> BackoffWait -> Requesting ...   (auto-retry)
//!            +-> Erroring -> Idle                            (terminal)
//! ```
//!
//! While scanning, independent tokio tasks drive the channel:
//!
//! - radio channels: the local scan loop (re-arms detection, advertises
//!   presence), the encounter pump, and the remote discovery loop;
//! - location: the position pump and the remote discovery loop.
//!
//! Every delivery into the registry and out to the callbacks is checked
//! against the current session under a re-entrant gate. [`ScanController::stop`]
//! closes the gate before aborting tasks, so nothing is delivered after it
//! returns and callbacks may call `stop` themselves.

use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::adapter::{
    Accuracy, AdapterEvent, EncounterSink, PositionOptions, PositionSource, PositionSubscription,
    SensorAdapter,
};
use crate::clock::Clock;
use crate::config::{Config, RadioChannelConfig};
use crate::error::{DiscoveryError, Result};
use crate::registry::PresenceRegistry;
use crate::sync::{DiscoveryBatch, GeoSync, RadioSync};
use crate::types::{Channel, ChannelStatus, DiscoveredUser, Position, ScannerState, Sighting};

/// Gate value meaning "no live session".
const CLOSED: u64 = 0;

/// Callback invoked for every created or updated record.
pub type DiscoveredCallback = Arc<dyn Fn(&DiscoveredUser) + Send + Sync>;

/// Callback invoked for every surfaced error.
pub type ErrorCallback = Arc<dyn Fn(&DiscoveryError) + Send + Sync>;

/// Automatic retry of a failed start.
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    /// Whether failed starts are retried at all.
    pub enabled: bool,
    /// Delay before each retry.
    pub delay: Duration,
    /// Cap on consecutive retries; unlimited when `None`.
    pub max_retries: Option<u32>,
    /// Decides which errors are worth retrying.
    pub classifier: fn(&DiscoveryError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: Duration::from_millis(5000),
            max_retries: None,
            classifier: DiscoveryError::is_recoverable,
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("enabled", &self.enabled)
            .field("delay", &self.delay)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Whether `err` should be retried after `retries` completed retries.
    #[must_use]
    pub fn allows(&self, err: &DiscoveryError, retries: u32) -> bool {
        self.enabled
            && (self.classifier)(err)
            && self.max_retries.map_or(true, |max| retries < max)
    }
}

/// Cadences and policies for one controller.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Local scan period in the foreground.
    pub scan_interval: Duration,
    /// Local scan period in background mode.
    pub background_scan_interval: Duration,
    /// Remote discovery period.
    pub discovery_interval: Duration,
    /// Position update interval (location only).
    pub position_interval: Duration,
    /// Position accuracy (location only).
    pub accuracy: Accuracy,
    /// Registry entry lifetime.
    pub ttl: chrono::Duration,
    /// Start retry policy; `enabled` is the default for `start`.
    pub retry: RetryPolicy,
    /// Whether an unavailable sensor is reported through `on_error`.
    pub report_unavailable: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            background_scan_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(3),
            position_interval: Duration::from_secs(5),
            accuracy: Accuracy::Balanced,
            ttl: chrono::Duration::hours(24),
            retry: RetryPolicy::default(),
            report_unavailable: true,
        }
    }
}

impl ControllerSettings {
    /// Settings for a radio channel.
    #[must_use]
    pub fn radio(config: &Config, channel: &RadioChannelConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(channel.scan_interval_secs),
            background_scan_interval: Duration::from_secs(channel.background_scan_interval_secs),
            discovery_interval: Duration::from_secs(channel.discovery_interval_secs),
            report_unavailable: channel.report_unavailable,
            ..Self::shared(config)
        }
    }

    /// Settings for the location channel.
    #[must_use]
    pub fn location(config: &Config) -> Self {
        let location = &config.location;
        Self {
            discovery_interval: Duration::from_secs(location.discovery_interval_secs),
            position_interval: Duration::from_secs(location.update_interval_secs),
            accuracy: location.accuracy,
            ..Self::shared(config)
        }
    }

    fn shared(config: &Config) -> Self {
        Self {
            ttl: config.ttl(),
            retry: RetryPolicy {
                enabled: config.discovery.auto_retry,
                delay: config.retry_delay(),
                max_retries: config.discovery.max_retries,
                ..RetryPolicy::default()
            },
            ..Self::default()
        }
    }

    const fn scan_period(&self, background: bool) -> Duration {
        if background {
            self.background_scan_interval
        } else {
            self.scan_interval
        }
    }
}

/// The sensor a channel reads and the sync strategy paired with it.
pub enum ChannelDriver {
    /// Bluetooth or NFC.
    Radio {
        /// Detection primitive.
        adapter: Arc<dyn SensorAdapter>,
        /// Presence-based backend sync.
        sync: RadioSync,
    },
    /// Location.
    Geo {
        /// Position updates.
        source: Arc<dyn PositionSource>,
        /// Radius-based backend sync.
        sync: GeoSync,
    },
}

impl ChannelDriver {
    async fn is_available(&self) -> crate::adapter::AdapterResult<bool> {
        match self {
            Self::Radio { adapter, .. } => adapter.is_available().await,
            Self::Geo { source, .. } => source.is_available().await,
        }
    }

    async fn discover(&self) -> Result<DiscoveryBatch> {
        match self {
            Self::Radio { sync, .. } => sync.discover().await,
            Self::Geo { sync, .. } => sync.discover().await,
        }
    }
}

impl fmt::Debug for ChannelDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radio { .. } => f.write_str("ChannelDriver::Radio"),
            Self::Geo { .. } => f.write_str("ChannelDriver::Geo"),
        }
    }
}

#[derive(Default)]
struct Tasks {
    local_scan: Option<JoinHandle<()>>,
    encounters: Option<JoinHandle<()>>,
    positions: Option<JoinHandle<()>>,
    discovery: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    subscription: Option<PositionSubscription>,
}

impl Tasks {
    fn shutdown(self) {
        for handle in [
            self.local_scan,
            self.encounters,
            self.positions,
            self.discovery,
            self.retry,
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        if let Some(subscription) = self.subscription {
            subscription.cancel();
        }
    }
}

#[derive(Default)]
struct ControlState {
    phase: ScannerState,
    session: u64,
    background: bool,
    detecting: bool,
    last_error: Option<String>,
    encounter_sink: Option<EncounterSink>,
    tasks: Tasks,
}

/// What a start attempt came to.
enum Attempt {
    Started,
    Abandoned,
    Failed(DiscoveryError),
}

/// What happened after a failed attempt.
enum Recovery {
    Retrying,
    Terminal,
    Abandoned,
}

/// Ownership of a detection window once its restart has returned.
enum Restart {
    /// The tick's session is still running.
    Current,
    /// The session ended; nothing is left registered on its behalf.
    Ended,
    /// A newer session is running and its sink must be registered again.
    Superseded(EncounterSink),
}

/// Resources acquired by a successful attempt, before tasks are spawned.
enum Acquired {
    Radio {
        sink: EncounterSink,
        events: mpsc::UnboundedReceiver<AdapterEvent>,
    },
    Geo {
        positions: mpsc::UnboundedReceiver<Position>,
        subscription: PositionSubscription,
    },
}

struct Shared {
    channel: Channel,
    driver: ChannelDriver,
    settings: ControllerSettings,
    clock: Arc<dyn Clock>,
    /// Live session id; [`CLOSED`] when nothing may be delivered.
    gate: ReentrantMutex<Cell<u64>>,
    state: Mutex<ControlState>,
    registry: Mutex<PresenceRegistry>,
    on_discovered: Mutex<Option<DiscoveredCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
}

/// Lifecycle owner for one discovery channel.
///
/// Lock order is gate, then state, then registry. Callbacks run with only
/// the (re-entrant) gate held.
pub struct ScanController {
    shared: Arc<Shared>,
}

impl ScanController {
    /// Creates an idle controller.
    pub fn new(
        channel: Channel,
        driver: ChannelDriver,
        settings: ControllerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                driver,
                settings,
                clock,
                gate: ReentrantMutex::new(Cell::new(CLOSED)),
                state: Mutex::new(ControlState::default()),
                registry: Mutex::new(PresenceRegistry::new(channel)),
                on_discovered: Mutex::new(None),
                on_error: Mutex::new(None),
            }),
        }
    }

    /// The channel this controller drives.
    #[must_use]
    pub fn channel(&self) -> Channel {
        self.shared.channel
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ScannerState {
        self.shared.state.lock().phase
    }

    /// Status snapshot for UI indicators.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        let state = self.shared.state.lock();
        let discovered = self.shared.registry.lock().len();
        ChannelStatus {
            channel: self.shared.channel,
            state: state.phase,
            background_mode: state.background,
            discovered,
            last_error: state.last_error.clone(),
        }
    }

    /// Snapshot of the channel's registry.
    #[must_use]
    pub fn get_discovered(&self) -> Vec<DiscoveredUser> {
        self.shared.registry.lock().snapshot()
    }

    /// Registers the discovery callback, replacing any previous one.
    pub fn set_on_user_discovered(&self, callback: impl Fn(&DiscoveredUser) + Send + Sync + 'static) {
        *self.shared.on_discovered.lock() = Some(Arc::new(callback));
    }

    /// Registers the error callback, replacing any previous one.
    pub fn set_on_error(&self, callback: impl Fn(&DiscoveryError) + Send + Sync + 'static) {
        *self.shared.on_error.lock() = Some(Arc::new(callback));
    }

    /// Starts the channel.
    ///
    /// A no-op unless the controller is idle. Availability is checked on
    /// every call. With `auto_retry`, a failure the retry policy accepts
    /// schedules a retry and this returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the failure when the start is terminal. Unless the failure is
    /// silent, it is also passed to `on_error`.
    pub async fn start(&self, auto_retry: bool) -> Result<()> {
        let shared = &self.shared;
        let session = {
            let gate = shared.gate.lock();
            let mut state = shared.state.lock();
            if state.phase != ScannerState::Idle {
                debug!(channel = %shared.channel, state = ?state.phase, "Start ignored, channel already active");
                return Ok(());
            }
            state.session += 1;
            state.phase = ScannerState::Requesting;
            state.last_error = None;
            gate.set(state.session);
            state.session
        };
        info!(channel = %shared.channel, session, auto_retry, "Starting discovery");

        let policy = RetryPolicy {
            enabled: auto_retry,
            ..shared.settings.retry
        };
        match shared.attempt(session).await {
            Attempt::Started | Attempt::Abandoned => Ok(()),
            Attempt::Failed(err) => match shared.recover(session, &policy, &err, 0) {
                Recovery::Retrying => {
                    Shared::schedule_retry(shared, session, policy);
                    Ok(())
                }
                Recovery::Abandoned => Ok(()),
                Recovery::Terminal => Err(err),
            },
        }
    }

    /// Stops the channel. Safe to call in any state, from any thread, and
    /// from inside a callback.
    ///
    /// On return no timer or task is left running, detection is unregistered,
    /// any position subscription is cancelled and the registry is empty.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Switches the local scan cadence between foreground and background.
    ///
    /// A running scan loop is rescheduled to the new period without an
    /// extra immediate scan. Location has no local scan loop; the flag is
    /// only recorded.
    pub fn set_background_mode(&self, enabled: bool) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.background == enabled {
            return;
        }
        state.background = enabled;
        let period = shared.settings.scan_period(enabled);
        info!(channel = %shared.channel, background = enabled, ?period, "Background mode changed");

        if state.phase != ScannerState::Scanning {
            return;
        }
        let Some(sink) = state.encounter_sink.clone() else {
            return;
        };
        if let Some(handle) = state.tasks.local_scan.take() {
            handle.abort();
        }
        let session = state.session;
        state.tasks.local_scan = Some(Shared::spawn_local_scan(
            shared,
            session,
            sink,
            period,
            Instant::now() + period,
        ));
    }
}

impl Drop for ScanController {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

impl fmt::Debug for ScanController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanController")
            .field("channel", &self.shared.channel)
            .field("driver", &self.shared.driver)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shared {
    /// Checks availability and acquires the sensor.
    async fn attempt(self: &Arc<Self>, session: u64) -> Attempt {
        let channel = self.channel;
        match self.driver.is_available().await {
            Ok(true) => {}
            Ok(false) => {
                return self.fail(
                    session,
                    DiscoveryError::Unavailable {
                        channel,
                        reason: "sensor is off or unsupported".to_string(),
                    },
                )
            }
            Err(err) => return self.fail(session, DiscoveryError::from_adapter(channel, err)),
        }

        let acquired = match &self.driver {
            ChannelDriver::Radio { .. } => {
                let (sink, events) = mpsc::unbounded_channel();
                Acquired::Radio { sink, events }
            }
            ChannelDriver::Geo { source, .. } => {
                let (updates, positions) = mpsc::unbounded_channel();
                let options = PositionOptions {
                    interval: self.settings.position_interval,
                    accuracy: self.settings.accuracy,
                };
                match source.start_position_updates(updates, options).await {
                    Ok(subscription) => Acquired::Geo {
                        positions,
                        subscription,
                    },
                    Err(err) => {
                        return self.fail(session, DiscoveryError::from_adapter(channel, err))
                    }
                }
            }
        };

        self.begin_scanning(session, acquired)
    }

    fn fail(&self, session: u64, err: DiscoveryError) -> Attempt {
        let mut state = self.state.lock();
        if state.session != session {
            return Attempt::Abandoned;
        }
        state.phase = ScannerState::Erroring;
        Attempt::Failed(err)
    }

    fn begin_scanning(self: &Arc<Self>, session: u64, acquired: Acquired) -> Attempt {
        let mut state = self.state.lock();
        if state.session != session || state.phase != ScannerState::Requesting {
            debug!(channel = %self.channel, session, "Start superseded, releasing sensor");
            return Attempt::Abandoned;
        }

        self.registry.lock().clear();
        match acquired {
            Acquired::Radio { sink, events } => {
                let period = self.settings.scan_period(state.background);
                state.tasks.local_scan = Some(Self::spawn_local_scan(
                    self,
                    session,
                    sink.clone(),
                    period,
                    Instant::now(),
                ));
                state.tasks.encounters = Some(tokio::spawn(
                    Arc::clone(self)
                        .encounter_pump(session, events)
                        .instrument(info_span!("encounters", channel = %self.channel)),
                ));
                state.encounter_sink = Some(sink);
                state.detecting = true;
            }
            Acquired::Geo {
                positions,
                subscription,
            } => {
                state.tasks.positions = Some(tokio::spawn(
                    Arc::clone(self)
                        .position_pump(session, positions)
                        .instrument(info_span!("positions", channel = %self.channel)),
                ));
                state.tasks.subscription = Some(subscription);
            }
        }
        state.tasks.discovery = Some(tokio::spawn(
            Arc::clone(self)
                .discovery_loop(session)
                .instrument(info_span!("discovery", channel = %self.channel)),
        ));
        state.phase = ScannerState::Scanning;
        drop(state);

        info!(channel = %self.channel, session, "Scanning");
        Attempt::Started
    }

    /// Settles the state after a failed attempt and surfaces the error.
    fn recover(
        &self,
        session: u64,
        policy: &RetryPolicy,
        err: &DiscoveryError,
        retries: u32,
    ) -> Recovery {
        let silent = self.is_silent_start_error(err);
        let retry = policy.allows(err, retries);

        let gate = self.gate.lock();
        {
            let mut state = self.state.lock();
            if state.session != session {
                return Recovery::Abandoned;
            }
            state.phase = if retry {
                ScannerState::BackoffWait
            } else {
                ScannerState::Idle
            };
            if !silent {
                state.last_error = Some(err.to_string());
            }
        }

        if silent {
            debug!(channel = %self.channel, error = %err, "Start failed silently");
        } else {
            warn!(channel = %self.channel, error = %err, retry, "Start failed");
            self.notify_error(session, err);
        }

        if retry {
            Recovery::Retrying
        } else {
            if gate.get() == session {
                gate.set(CLOSED);
            }
            Recovery::Terminal
        }
    }

    fn is_silent_start_error(&self, err: &DiscoveryError) -> bool {
        match err {
            DiscoveryError::UserCancelled { .. } => true,
            DiscoveryError::Unavailable { .. } => !self.settings.report_unavailable,
            _ => false,
        }
    }

    fn schedule_retry(self: &Arc<Self>, session: u64, policy: RetryPolicy) {
        let mut state = self.state.lock();
        if state.session != session || state.phase != ScannerState::BackoffWait {
            return;
        }
        state.tasks.retry = Some(tokio::spawn(
            Arc::clone(self)
                .retry_loop(session, policy)
                .instrument(info_span!("retry", channel = %self.channel)),
        ));
    }

    async fn retry_loop(self: Arc<Self>, session: u64, policy: RetryPolicy) {
        let mut retries = 0_u32;
        loop {
            time::sleep(policy.delay).await;
            if !self.resume_requesting(session) {
                return;
            }
            retries += 1;
            info!(channel = %self.channel, attempt = retries, "Retrying start");

            match self.attempt(session).await {
                Attempt::Started | Attempt::Abandoned => return,
                Attempt::Failed(err) => match self.recover(session, &policy, &err, retries) {
                    Recovery::Retrying => {}
                    Recovery::Terminal | Recovery::Abandoned => return,
                },
            }
        }
    }

    fn resume_requesting(&self, session: u64) -> bool {
        let mut state = self.state.lock();
        if state.session != session || state.phase != ScannerState::BackoffWait {
            return false;
        }
        state.phase = ScannerState::Requesting;
        true
    }

    fn spawn_local_scan(
        self: &Arc<Self>,
        session: u64,
        sink: EncounterSink,
        period: Duration,
        first_tick: Instant,
    ) -> JoinHandle<()> {
        tokio::spawn(
            Arc::clone(self)
                .local_scan_loop(session, sink, period, first_tick)
                .instrument(info_span!("local_scan", channel = %self.channel)),
        )
    }

    async fn local_scan_loop(
        self: Arc<Self>,
        session: u64,
        sink: EncounterSink,
        period: Duration,
        first_tick: Instant,
    ) {
        let ChannelDriver::Radio { adapter, sync } = &self.driver else {
            return;
        };
        let mut ticker = time::interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            trace!("Local scan tick");
            let registered = adapter.start_detection(sink.clone()).await;
            match self.release_stale_detection(session, registered.is_ok()) {
                Restart::Current => {}
                Restart::Ended => return,
                Restart::Superseded(current) => {
                    if let Err(err) = adapter.start_detection(current).await {
                        debug!(error = %err, "Failed to hand detection back to the current session");
                    }
                    return;
                }
            }
            if let Err(err) = registered {
                self.report_tick_error(session, &DiscoveryError::from_adapter(self.channel, err));
            }

            if !self.is_current(session) {
                return;
            }
            if let Err(err) = sync.advertise_self().await {
                warn!(error = %err, "Failed to advertise presence");
            }
        }
    }

    async fn encounter_pump(
        self: Arc<Self>,
        session: u64,
        mut events: mpsc::UnboundedReceiver<AdapterEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                AdapterEvent::Encounter(encounter) => {
                    let Some(subject) = encounter.subject else {
                        trace!("Anonymous encounter ignored");
                        continue;
                    };
                    let sighting =
                        Sighting::new(subject.id, self.channel, self.clock.now(), subject.profile);
                    self.deliver(
                        session,
                        DiscoveryBatch {
                            sightings: vec![sighting],
                            friend_ids: None,
                        },
                    );
                }
                AdapterEvent::Failed(err) => {
                    self.report_tick_error(session, &DiscoveryError::from_adapter(self.channel, err));
                }
            }
        }
    }

    async fn position_pump(
        self: Arc<Self>,
        session: u64,
        mut positions: mpsc::UnboundedReceiver<Position>,
    ) {
        let ChannelDriver::Geo { sync, .. } = &self.driver else {
            return;
        };
        while let Some(position) = positions.recv().await {
            trace!(?position, "Position fix");
            {
                // stop() resets the fix under the gate.
                let gate = self.gate.lock();
                if gate.get() != session {
                    debug!(session, "Dropping position fix from a closed session");
                    return;
                }
                sync.remember(position);
            }
            if let Err(err) = sync.publish(position).await {
                warn!(error = %err, "Failed to record position");
            }
        }
    }

    async fn discovery_loop(self: Arc<Self>, session: u64) {
        let mut ticker = time::interval(self.settings.discovery_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.evict_stale(session);
            match self.driver.discover().await {
                Ok(batch) => self.deliver(session, batch),
                Err(err) => self.report_tick_error(session, &err),
            }
        }
    }

    /// Undoes a detection restart that finished after `session` ended.
    fn release_stale_detection(&self, session: u64, registered: bool) -> Restart {
        let gate = self.gate.lock();
        let current = gate.get();
        if current == session {
            return Restart::Current;
        }
        debug!(session, "Session closed during detection restart");
        if !registered {
            return Restart::Ended;
        }
        if current == CLOSED {
            if let ChannelDriver::Radio { adapter, .. } = &self.driver {
                adapter.stop_detection();
            }
            return Restart::Ended;
        }
        self.state
            .lock()
            .encounter_sink
            .clone()
            .map_or(Restart::Ended, Restart::Superseded)
    }

    fn is_current(&self, session: u64) -> bool {
        self.gate.lock().get() == session
    }

    fn evict_stale(&self, session: u64) {
        let gate = self.gate.lock();
        if gate.get() != session {
            return;
        }
        let evicted = self
            .registry
            .lock()
            .evict_stale(self.clock.now(), self.settings.ttl);
        if evicted > 0 {
            debug!(evicted, "Evicted stale entries");
        }
    }

    /// Merges a batch into the registry and emits every touched record.
    fn deliver(&self, session: u64, batch: DiscoveryBatch) {
        let gate = self.gate.lock();
        if gate.get() != session {
            trace!("Dropping batch from a closed session");
            return;
        }

        let touched = {
            let mut registry = self.registry.lock();
            let mut ids: Vec<String> = batch
                .sightings
                .into_iter()
                .map(|sighting| registry.upsert(sighting).id)
                .collect();
            if let Some(friend_ids) = &batch.friend_ids {
                ids.extend(
                    registry
                        .refresh_friends(friend_ids)
                        .into_iter()
                        .map(|user| user.id),
                );
            }
            let mut seen = HashSet::new();
            ids.into_iter()
                .filter(|id| seen.insert(id.clone()))
                .filter_map(|id| registry.get(&id).cloned())
                .collect::<Vec<_>>()
        };
        if touched.is_empty() {
            return;
        }
        debug!(count = touched.len(), "Delivering discovered users");

        let Some(callback) = self.on_discovered.lock().clone() else {
            return;
        };
        for user in &touched {
            if gate.get() != session {
                break;
            }
            callback(user);
        }
    }

    fn report_tick_error(&self, session: u64, err: &DiscoveryError) {
        if err.is_silent_tick_error() {
            debug!(error = %err, "Swallowed tick error");
            return;
        }
        warn!(error = %err, "Tick failed");

        let gate = self.gate.lock();
        if gate.get() != session {
            return;
        }
        self.state.lock().last_error = Some(err.to_string());
        self.notify_error(session, err);
    }

    fn notify_error(&self, session: u64, err: &DiscoveryError) {
        let gate = self.gate.lock();
        if gate.get() != session {
            return;
        }
        let callback = self.on_error.lock().clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }

    fn stop(&self) {
        let gate = self.gate.lock();
        gate.set(CLOSED);

        let (previous, detecting, tasks) = {
            let mut state = self.state.lock();
            state.session += 1;
            state.encounter_sink = None;
            (
                std::mem::replace(&mut state.phase, ScannerState::Idle),
                std::mem::take(&mut state.detecting),
                std::mem::take(&mut state.tasks),
            )
        };
        tasks.shutdown();

        match &self.driver {
            ChannelDriver::Radio { adapter, .. } => {
                if detecting {
                    adapter.stop_detection();
                }
            }
            ChannelDriver::Geo { sync, .. } => sync.reset(),
        }
        self.registry.lock().clear();
        drop(gate);

        if previous != ScannerState::Idle {
            info!(channel = %self.channel, "Stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::adapter::{AdapterError, AdapterResult, MockAdapter, NullAdapter, RawEncounter};
    use crate::backend::MemoryDataService;
    use crate::clock::ManualClock;
    use crate::types::ProfileSummary;

    struct Fixture {
        adapter: Arc<MockAdapter>,
        service: Arc<MemoryDataService>,
        clock: ManualClock,
        discovered: Arc<Mutex<Vec<DiscoveredUser>>>,
        errors: Arc<Mutex<Vec<DiscoveryError>>>,
    }

    impl Fixture {
        fn new(adapter: MockAdapter) -> Self {
            let service = Arc::new(MemoryDataService::new());
            service.add_user("me", ProfileSummary::personal("me", "Me"));
            service.add_user("u1", ProfileSummary::personal("ada", "Ada"));
            service.add_user("u2", ProfileSummary::personal("bob", "Bob"));
            Self {
                adapter: Arc::new(adapter),
                service,
                clock: ManualClock::new(Utc::now()),
                discovered: Arc::default(),
                errors: Arc::default(),
            }
        }

        fn radio(&self, channel: Channel, settings: ControllerSettings) -> ScanController {
            let sync = RadioSync::new(
                Arc::clone(&self.service) as Arc<dyn crate::backend::DataService>,
                Arc::new(self.clock.clone()),
                "me",
                channel,
                chrono::Duration::seconds(60),
            );
            let controller = ScanController::new(
                channel,
                ChannelDriver::Radio {
                    adapter: Arc::clone(&self.adapter) as Arc<dyn SensorAdapter>,
                    sync,
                },
                settings,
                Arc::new(self.clock.clone()),
            );
            self.observe(&controller);
            controller
        }

        fn location(&self) -> ScanController {
            let sync = GeoSync::new(
                Arc::clone(&self.service) as Arc<dyn crate::backend::DataService>,
                Arc::new(self.clock.clone()),
                "me",
                150.0,
                chrono::Duration::hours(24),
            );
            let settings = ControllerSettings {
                discovery_interval: Duration::from_secs(30),
                ..ControllerSettings::default()
            };
            let controller = ScanController::new(
                Channel::Location,
                ChannelDriver::Geo {
                    source: Arc::clone(&self.adapter) as Arc<dyn PositionSource>,
                    sync,
                },
                settings,
                Arc::new(self.clock.clone()),
            );
            self.observe(&controller);
            controller
        }

        fn observe(&self, controller: &ScanController) {
            let discovered = Arc::clone(&self.discovered);
            controller.set_on_user_discovered(move |user| discovered.lock().push(user.clone()));
            let errors = Arc::clone(&self.errors);
            controller.set_on_error(move |err| errors.lock().push(err.clone()));
        }

        fn discovered_count(&self) -> usize {
            self.discovered.lock().len()
        }

        fn error_count(&self) -> usize {
            self.errors.lock().len()
        }
    }

    async fn advance(duration: Duration) {
        time::sleep(duration).await;
    }

    fn permission_denied() -> AdapterError {
        AdapterError::PermissionDenied("bluetooth scan".into())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_enters_scanning_and_runs_local_scan_loop() {
        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        assert_eq!(controller.state(), ScannerState::Scanning);

        advance(Duration::from_secs(25)).await;
        // Ticks at 0s, 10s, 20s.
        assert_eq!(fx.adapter.detection_starts(), 3);
        assert!(fx.service.presence_of("me", Channel::Bluetooth).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_a_no_op() {
        let single = Fixture::new(MockAdapter::available());
        let single_controller = single.radio(Channel::Bluetooth, ControllerSettings::default());
        single_controller.start(false).await.unwrap();
        advance(Duration::from_secs(25)).await;
        let expected = single.adapter.detection_starts();
        single_controller.stop();

        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());
        controller.start(false).await.unwrap();
        controller.start(false).await.unwrap();
        advance(Duration::from_secs(25)).await;

        assert_eq!(fx.adapter.detection_starts(), expected);
        assert_eq!(fx.adapter.availability_checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_availability_is_rechecked_on_every_start() {
        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        controller.stop();
        fx.adapter.set_availability(Ok(false));
        let err = controller.start(false).await.unwrap_err();

        assert!(matches!(err, DiscoveryError::Unavailable { .. }));
        assert_eq!(fx.adapter.availability_checks(), 2);
        assert_eq!(controller.state(), ScannerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_everything() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_presence("u1", Channel::Bluetooth, fx.clock.now());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(4)).await;
        assert!(!controller.get_discovered().is_empty());

        controller.stop();
        let delivered = fx.discovered_count();
        let starts = fx.adapter.detection_starts();

        assert_eq!(controller.state(), ScannerState::Idle);
        assert!(controller.get_discovered().is_empty());
        assert_eq!(fx.adapter.detection_stops(), 1);
        assert!(!fx.adapter.is_detecting());
        assert!(!fx.adapter.emit(RawEncounter::identified(
            "u2",
            ProfileSummary::personal("bob", "Bob")
        )));

        advance(Duration::from_secs(60)).await;
        assert_eq!(fx.discovered_count(), delivered);
        assert_eq!(fx.adapter.detection_starts(), starts);
        assert!(controller.get_discovered().is_empty());
    }

    /// Radio whose detection restart blocks its worker thread.
    #[derive(Default)]
    struct BlockingRadio {
        entered: AtomicBool,
        registered: Mutex<Option<EncounterSink>>,
    }

    #[async_trait]
    impl SensorAdapter for BlockingRadio {
        async fn is_available(&self) -> AdapterResult<bool> {
            Ok(true)
        }

        async fn start_detection(&self, events: EncounterSink) -> AdapterResult<()> {
            self.entered.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            *self.registered.lock() = Some(events);
            Ok(())
        }

        fn stop_detection(&self) {
            self.registered.lock().take();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_blocking_detection_restart_leaves_nothing_behind() {
        let service = Arc::new(MemoryDataService::new());
        service.add_user("me", ProfileSummary::personal("me", "Me"));
        let clock = ManualClock::new(Utc::now());
        let radio = Arc::new(BlockingRadio::default());
        let sync = RadioSync::new(
            Arc::clone(&service) as Arc<dyn crate::backend::DataService>,
            Arc::new(clock.clone()),
            "me",
            Channel::Bluetooth,
            chrono::Duration::seconds(60),
        );
        let controller = ScanController::new(
            Channel::Bluetooth,
            ChannelDriver::Radio {
                adapter: Arc::clone(&radio) as Arc<dyn SensorAdapter>,
                sync,
            },
            ControllerSettings::default(),
            Arc::new(clock),
        );

        controller.start(false).await.unwrap();
        time::timeout(Duration::from_secs(5), async {
            while !radio.entered.load(Ordering::SeqCst) {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        controller.stop();
        assert_eq!(controller.state(), ScannerState::Idle);

        time::sleep(Duration::from_millis(500)).await;
        assert!(radio.registered.lock().is_none());
        assert!(service.presence_of("me", Channel::Bluetooth).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_failure() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_failing(true);
        fx.service.set_latency(Duration::from_secs(2));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        // The first discovery query is still waiting to fail.
        advance(Duration::from_secs(1)).await;
        controller.stop();

        advance(Duration::from_secs(10)).await;
        assert_eq!(fx.error_count(), 0);
        assert_eq!(fx.discovered_count(), 0);
        assert!(controller.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_detection_restart_is_surfaced_and_loop_continues() {
        let fx = Fixture::new(MockAdapter::available());
        fx.adapter
            .fail_detection(Some(AdapterError::Busy("radio in use".into())));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(1)).await;

        assert_eq!(fx.error_count(), 1);
        assert!(matches!(
            fx.errors.lock()[0],
            DiscoveryError::SensorBusy { .. }
        ));
        assert!(!fx.adapter.is_detecting());
        assert!(fx.service.presence_of("me", Channel::Bluetooth).is_some());
        assert_eq!(controller.state(), ScannerState::Scanning);
        assert!(controller.status().last_error.is_some());

        fx.adapter.fail_detection(None);
        advance(Duration::from_secs(10)).await;
        assert_eq!(fx.adapter.detection_starts(), 2);
        assert!(fx.adapter.is_detecting());
        assert_eq!(fx.error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_tick() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_presence("u1", Channel::Bluetooth, fx.clock.now());
        fx.service.set_latency(Duration::from_secs(2));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        // The first discovery query is still awaiting the backend.
        advance(Duration::from_secs(1)).await;
        controller.stop();

        advance(Duration::from_secs(10)).await;
        assert_eq!(fx.discovered_count(), 0);
        assert!(controller.get_discovered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_harmless() {
        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.stop();
        controller.stop();
        assert_eq!(controller.state(), ScannerState::Idle);
        assert_eq!(fx.adapter.detection_stops(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_may_stop_its_own_controller() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_presence("u1", Channel::Bluetooth, fx.clock.now());
        fx.service.set_presence("u2", Channel::Bluetooth, fx.clock.now());
        let controller = Arc::new(fx.radio(Channel::Bluetooth, ControllerSettings::default()));

        let calls = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&controller);
        let counter = Arc::clone(&calls);
        controller.set_on_user_discovered(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(controller) = weak.upgrade() {
                controller.stop();
            }
        });

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.state(), ScannerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_once_per_delay() {
        let fx = Fixture::new(MockAdapter::with_availability(Err(permission_denied())));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(true).await.unwrap();
        assert_eq!(controller.state(), ScannerState::BackoffWait);
        assert_eq!(fx.error_count(), 1);
        assert_eq!(fx.adapter.availability_checks(), 1);

        advance(Duration::from_millis(4900)).await;
        assert_eq!(fx.adapter.availability_checks(), 1);

        advance(Duration::from_millis(200)).await;
        assert_eq!(fx.adapter.availability_checks(), 2);
        assert_eq!(controller.state(), ScannerState::BackoffWait);

        advance(Duration::from_millis(4800)).await;
        assert_eq!(fx.adapter.availability_checks(), 2);

        advance(Duration::from_millis(200)).await;
        assert_eq!(fx.adapter.availability_checks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retry_recovers_into_scanning() {
        let fx = Fixture::new(MockAdapter::available());
        fx.adapter.push_availability(Err(permission_denied()));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(true).await.unwrap();
        assert_eq!(controller.state(), ScannerState::BackoffWait);

        advance(Duration::from_millis(5100)).await;
        assert_eq!(controller.state(), ScannerState::Scanning);
        assert_eq!(fx.adapter.detection_starts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_respects_max_retries() {
        let fx = Fixture::new(MockAdapter::with_availability(Err(permission_denied())));
        let settings = ControllerSettings {
            retry: RetryPolicy {
                max_retries: Some(2),
                ..RetryPolicy::default()
            },
            ..ControllerSettings::default()
        };
        let controller = fx.radio(Channel::Bluetooth, settings);

        controller.start(true).await.unwrap();
        advance(Duration::from_secs(60)).await;

        assert_eq!(fx.adapter.availability_checks(), 3);
        assert_eq!(controller.state(), ScannerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let fx = Fixture::new(MockAdapter::with_availability(Err(permission_denied())));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(true).await.unwrap();
        controller.stop();
        advance(Duration::from_secs(30)).await;

        assert_eq!(fx.adapter.availability_checks(), 1);
        assert_eq!(controller.state(), ScannerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_auto_retry_is_terminal() {
        let fx = Fixture::new(MockAdapter::with_availability(Err(permission_denied())));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        let err = controller.start(false).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::PermissionDenied { .. }));
        assert_eq!(controller.state(), ScannerState::Idle);
        assert_eq!(fx.error_count(), 1);
        assert!(controller.status().last_error.is_some());

        advance(Duration::from_secs(30)).await;
        assert_eq!(fx.adapter.availability_checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_is_not_retried() {
        let fx = Fixture::new(MockAdapter::with_availability(Ok(false)));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        let err = controller.start(true).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Unavailable { .. }));
        assert_eq!(fx.error_count(), 1);

        advance(Duration::from_secs(30)).await;
        assert_eq!(fx.adapter.availability_checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nfc_unavailable_is_silent() {
        let fx = Fixture::new(MockAdapter::available());
        let settings = ControllerSettings {
            report_unavailable: false,
            ..ControllerSettings::default()
        };
        let sync = RadioSync::new(
            Arc::clone(&fx.service) as Arc<dyn crate::backend::DataService>,
            Arc::new(fx.clock.clone()),
            "me",
            Channel::Nfc,
            chrono::Duration::seconds(60),
        );
        let controller = ScanController::new(
            Channel::Nfc,
            ChannelDriver::Radio {
                adapter: Arc::new(NullAdapter::new("no NFC chip")),
                sync,
            },
            settings,
            Arc::new(fx.clock.clone()),
        );
        fx.observe(&controller);

        let err = controller.start(false).await.unwrap_err();

        assert!(matches!(err, DiscoveryError::Unavailable { .. }));
        assert_eq!(fx.error_count(), 0);
        assert_eq!(controller.state(), ScannerState::Idle);
        assert!(controller.status().last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_prompt_is_silent() {
        let fx = Fixture::new(MockAdapter::with_availability(Err(AdapterError::Cancelled)));
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        assert!(controller.start(false).await.is_err());
        assert_eq!(fx.error_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bluetooth_fresh_friend_is_flagged() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_presence(
            "u1",
            Channel::Bluetooth,
            fx.clock.now() - chrono::Duration::seconds(10),
        );
        fx.service.connect("me", "u1");
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(1)).await;

        let users = controller.get_discovered();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "u1");
        assert_eq!(users[0].is_friend, Some(true));
        assert_eq!(fx.discovered_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_friend_flag_cleared_only_by_friend_refresh() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_presence("u1", Channel::Bluetooth, fx.clock.now());
        fx.service.connect("me", "u1");
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(1)).await;
        assert_eq!(controller.get_discovered()[0].is_friend, Some(true));

        // A plain encounter does not clear the flag.
        fx.adapter.emit(RawEncounter::identified(
            "u1",
            ProfileSummary::personal("ada", "Ada"),
        ));
        advance(Duration::from_millis(100)).await;
        assert_eq!(controller.get_discovered()[0].is_friend, Some(true));

        fx.service.disconnect("me", "u1");
        advance(Duration::from_secs(3)).await;
        assert_eq!(controller.get_discovered()[0].is_friend, Some(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identified_encounter_is_registered() {
        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.radio(Channel::Nfc, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_millis(10)).await;
        assert!(fx.adapter.emit(RawEncounter::anonymous()));
        assert!(fx.adapter.emit(RawEncounter::identified(
            "u2",
            ProfileSummary::personal("bob", "Bob")
        )));
        advance(Duration::from_millis(10)).await;

        let users = controller.get_discovered();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id, "u2");
        assert_eq!(users[0].last_seen, fx.clock.now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_reports_distance_in_meters() {
        let fx = Fixture::new(MockAdapter::available());
        let here = Position::new(52.5200, 13.4050);
        // About 100 m north.
        fx.service
            .set_location("u1", Position::new(52.5209, 13.4050), fx.clock.now());
        // About 1 km north, outside the radius.
        fx.service
            .set_location("u2", Position::new(52.5290, 13.4050), fx.clock.now());
        let controller = fx.location();

        controller.start(false).await.unwrap();
        assert_eq!(fx.adapter.active_subscriptions(), 1);
        assert_eq!(
            fx.adapter.last_position_options().unwrap().interval,
            Duration::from_secs(5)
        );
        assert!(fx.adapter.push_position(here));
        advance(Duration::from_secs(31)).await;

        let users = controller.get_discovered();
        assert_eq!(users.len(), 1);
        let meters = users[0].distance_meters.unwrap();
        assert!((meters - 100.0).abs() < 1.0, "got {meters}");
        assert_eq!(fx.service.location_of("me").map(|(p, _)| p), Some(here));

        controller.stop();
        assert_eq!(fx.adapter.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_are_evicted_on_discovery_tick() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_presence("u1", Channel::Bluetooth, fx.clock.now());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(1)).await;
        assert_eq!(controller.get_discovered().len(), 1);

        fx.clock.advance(chrono::Duration::hours(25));
        advance(Duration::from_secs(3)).await;
        assert!(controller.get_discovered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_tick_error_is_surfaced_and_loop_continues() {
        let fx = Fixture::new(MockAdapter::available());
        fx.service.set_failing(true);
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(4)).await;
        assert!(fx.error_count() >= 1);
        assert!(fx
            .errors
            .lock()
            .iter()
            .all(DiscoveryError::is_backend_error));

        fx.service.set_failing(false);
        fx.service.set_presence("u1", Channel::Bluetooth, fx.clock.now());
        advance(Duration::from_secs(3)).await;
        assert_eq!(controller.get_discovered().len(), 1);
        assert_eq!(controller.state(), ScannerState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_query_failure_is_surfaced_and_loop_continues() {
        let fx = Fixture::new(MockAdapter::available());
        let here = Position::new(52.5200, 13.4050);
        let controller = fx.location();

        controller.start(false).await.unwrap();
        assert!(fx.adapter.push_position(here));
        advance(Duration::from_millis(10)).await;
        fx.service.set_failing(true);
        advance(Duration::from_secs(30)).await;

        assert_eq!(fx.error_count(), 1);
        assert!(fx.errors.lock()[0].is_backend_error());
        assert_eq!(controller.state(), ScannerState::Scanning);

        fx.service.set_failing(false);
        fx.service
            .set_location("u1", Position::new(52.5209, 13.4050), fx.clock.now());
        advance(Duration::from_secs(30)).await;
        assert_eq!(controller.get_discovered().len(), 1);
        assert_eq!(fx.error_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_tick_errors_are_swallowed() {
        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_millis(10)).await;
        fx.adapter.emit_failure(permission_denied());
        fx.adapter.emit_failure(AdapterError::Cancelled);
        advance(Duration::from_millis(10)).await;
        assert_eq!(fx.error_count(), 0);

        fx.adapter.emit_failure(AdapterError::Failed("radio reset".into()));
        advance(Duration::from_millis(10)).await;
        assert_eq!(fx.error_count(), 1);
        assert_eq!(controller.state(), ScannerState::Scanning);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_mode_reschedules_local_scan() {
        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.radio(Channel::Bluetooth, ControllerSettings::default());

        controller.start(false).await.unwrap();
        advance(Duration::from_secs(1)).await;
        assert_eq!(fx.adapter.detection_starts(), 1);

        controller.set_background_mode(true);
        assert!(controller.status().background_mode);
        advance(Duration::from_secs(25)).await;
        // No immediate scan, and no 10 s tick.
        assert_eq!(fx.adapter.detection_starts(), 1);

        advance(Duration::from_secs(6)).await;
        assert_eq!(fx.adapter.detection_starts(), 2);

        controller.set_background_mode(false);
        advance(Duration::from_secs(11)).await;
        assert_eq!(fx.adapter.detection_starts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_controller() {
        let fx = Fixture::new(MockAdapter::available());
        let controller = fx.location();

        controller.start(false).await.unwrap();
        assert_eq!(fx.adapter.active_subscriptions(), 1);
        drop(controller);

        assert_eq!(fx.adapter.active_subscriptions(), 0);
    }

    #[test]
    fn test_retry_policy_classifier() {
        let policy = RetryPolicy {
            enabled: true,
            ..RetryPolicy::default()
        };
        let denied = DiscoveryError::from_adapter(Channel::Bluetooth, permission_denied());
        let busy = DiscoveryError::from_adapter(Channel::Bluetooth, AdapterError::Busy("x".into()));
        let unavailable =
            DiscoveryError::from_adapter(Channel::Bluetooth, AdapterError::Unavailable("x".into()));

        assert!(policy.allows(&denied, 0));
        assert!(policy.allows(&busy, 100));
        assert!(!policy.allows(&unavailable, 0));
        assert!(!RetryPolicy::default().allows(&denied, 0));
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.discovery.auto_retry = true;
        config.discovery.max_retries = Some(3);

        let nfc = ControllerSettings::radio(&config, &config.nfc);
        assert!(!nfc.report_unavailable);
        assert_eq!(nfc.scan_interval, Duration::from_secs(10));
        assert_eq!(nfc.discovery_interval, Duration::from_secs(3));
        assert!(nfc.retry.enabled);
        assert_eq!(nfc.retry.max_retries, Some(3));

        let location = ControllerSettings::location(&config);
        assert_eq!(location.discovery_interval, Duration::from_secs(30));
        assert_eq!(location.position_interval, Duration::from_secs(5));
        assert_eq!(location.ttl, chrono::Duration::hours(24));
    }
}
