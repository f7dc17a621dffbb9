//! Channel and subscription controller.
//!
//! Multiplexes any number of program subscriptions onto the single receiver:
//!
//! ```text
//! Idle ──tune──▶ Tuning ──attach──▶ Active ──last unsubscribe──▶ Draining
//!   ▲                                  ▲                            │
//!   └────────── reset delay elapsed ───┼────────────────────────────┤
//!                                      └──── subscribe (same ch) ───┘
//! ```
//!
//! All state sits behind one mutex that is never held across an await.
//! Subscription attempts are additionally serialized by an async mutex so
//! two callers never race to tune different channels.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use dabcast_types::{ChannelStatus, ProgramStatus, ServiceId, SignalInfo, SubscribeError};

use crate::engine::ChannelEventHandler;
use crate::radio::device::DabDevice;
use crate::radio::lock::DeviceLockGuard;
use crate::radio::program::ProgramHandler;

/// Default time to wait for a program to be announced after tuning.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default interval between two discovery checks.
pub const DEFAULT_DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Default grace period before an idle channel is released.
pub const DEFAULT_CHANNEL_RESET_DELAY: Duration = Duration::from_secs(5);

/// Controller timings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub discovery_timeout: Duration,
    pub discovery_poll_interval: Duration,
    pub channel_reset_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            discovery_poll_interval: DEFAULT_DISCOVERY_POLL_INTERVAL,
            channel_reset_delay: DEFAULT_CHANNEL_RESET_DELAY,
        }
    }
}

/// Why a caller gave up on a pending subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller itself cancelled the request.
    Cancelled,
    /// The consumer the audio was meant for went away.
    ConnectionLost,
}

impl From<AbortReason> for SubscribeError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Cancelled => SubscribeError::Cancelled,
            AbortReason::ConnectionLost => SubscribeError::ConnectionLost,
        }
    }
}

/// One service announced in the tuned ensemble.
struct ProgramEntry {
    service_id: ServiceId,
    /// Cached once the engine returned a non-empty label.
    name: Option<String>,
    handler: Option<Arc<ProgramHandler>>,
}

struct TunedChannel {
    name: String,
    /// Identifies this tune; a subscription discovering on an older epoch
    /// must not attach.
    epoch: u64,
    ensemble_label: Option<String>,
    datetime: Option<DateTime<Local>>,
    signal: SignalInfo,
    /// In announcement order.
    programs: Vec<ProgramEntry>,
    _lock: DeviceLockGuard,
}

impl TunedChannel {
    fn new(name: &str, epoch: u64, lock: DeviceLockGuard) -> Self {
        Self {
            name: name.to_string(),
            epoch,
            ensemble_label: None,
            datetime: None,
            signal: SignalInfo::default(),
            programs: Vec::new(),
            _lock: lock,
        }
    }

    fn has_handlers(&self) -> bool {
        self.programs.iter().any(|p| p.handler.is_some())
    }

    fn subscribed(&self, program: &str) -> Option<&ProgramEntry> {
        self.programs
            .iter()
            .find(|p| p.handler.is_some() && p.name.as_deref() == Some(program))
    }
}

struct PendingReset {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct ControllerState {
    channel: Option<TunedChannel>,
    pending_reset: Option<PendingReset>,
    last_epoch: u64,
    last_reset_id: u64,
}

struct ControllerShared {
    state: Mutex<ControllerState>,
    device: Arc<DabDevice>,
    config: ControllerConfig,
    runtime: Handle,
}

/// Shares one receiver between many program subscriptions.
pub struct RadioController {
    shared: Arc<ControllerShared>,
    /// Serializes subscription attempts in arrival order.
    subscription_lock: tokio::sync::Mutex<()>,
}

impl RadioController {
    /// Create a controller over `device`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(device: Arc<DabDevice>, config: ControllerConfig) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                state: Mutex::new(ControllerState::default()),
                device,
                config,
                runtime: Handle::current(),
            }),
            subscription_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Arc<DabDevice> {
        &self.shared.device
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Subscribe to `program` on `channel`, tuning the receiver if needed.
    ///
    /// Returns the program's handler, shared with every other subscriber of
    /// the same program. Dropping the returned future while it waits for the
    /// program to be announced releases the channel if nothing else uses it.
    pub async fn subscribe_program(
        &self,
        channel: &str,
        program: &str,
    ) -> Result<Arc<ProgramHandler>, SubscribeError> {
        self.subscribe_program_until(channel, program, std::future::pending())
            .await
    }

    /// Like [`subscribe_program`](Self::subscribe_program), but gives up as
    /// soon as `abort` resolves. The channel is cleaned up before the abort
    /// reason is returned as the error.
    pub async fn subscribe_program_until<F>(
        &self,
        channel: &str,
        program: &str,
        abort: F,
    ) -> Result<Arc<ProgramHandler>, SubscribeError>
    where
        F: Future<Output = AbortReason>,
    {
        let _serial = self.subscription_lock.lock().await;
        let shared = &*self.shared;

        let epoch = self.shared.tune_channel(channel)?;
        let mut guard = DiscoveryGuard {
            shared,
            epoch,
            armed: true,
        };

        let found = tokio::select! {
            biased;
            reason = abort => {
                info!(
                    "[Controller] Subscription to {} on {} aborted: {:?}",
                    program, channel, reason
                );
                Err(SubscribeError::from(reason))
            }
            found = shared.wait_for_program(epoch, channel, program) => found,
        };

        let handler =
            found.and_then(|service_id| shared.attach(epoch, channel, program, service_id))?;
        guard.armed = false;
        Ok(handler)
    }

    /// Drop one subscription to `program`. Returns false if nothing is
    /// subscribed under that name.
    pub fn unsubscribe_program(&self, program: &str) -> bool {
        self.shared.unsubscribe(program)
    }

    /// Whether a subscription to `channel` could currently proceed.
    pub fn can_subscribe(&self, channel: &str) -> bool {
        let state = self.shared.state.lock();
        match &state.channel {
            None => true,
            Some(tuned) => tuned.name == channel || state.pending_reset.is_some(),
        }
    }

    /// The handler of a subscribed program, if any.
    pub fn handler(&self, program: &str) -> Option<Arc<ProgramHandler>> {
        let state = self.shared.state.lock();
        state
            .channel
            .as_ref()?
            .subscribed(program)?
            .handler
            .clone()
    }

    /// Snapshot of the tuned channel. `None` while idle.
    pub fn status(&self) -> Option<ChannelStatus> {
        let state = self.shared.state.lock();
        let tuned = state.channel.as_ref()?;
        Some(ChannelStatus {
            channel: tuned.name.clone(),
            ensemble_label: tuned.ensemble_label.clone(),
            datetime: tuned.datetime,
            draining: state.pending_reset.is_some(),
            signal: tuned.signal,
            programs: tuned
                .programs
                .iter()
                .map(|p| ProgramStatus {
                    service_id: p.service_id,
                    name: p.name.clone(),
                    subscribers: p.handler.as_ref().map(|h| h.subscribers()).unwrap_or(0),
                })
                .collect(),
        })
    }

    /// Force-release every subscription and the channel.
    ///
    /// Safe to call repeatedly, and after a delayed reset already fired.
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// [`stop`](Self::stop), then close and finalize the receiver.
    pub async fn shutdown(&self) {
        self.stop();
        self.shared.device.cleanup().await;
    }
}

impl ControllerShared {
    /// Tune to `channel` or reuse it. Returns the epoch of the tuned channel.
    fn tune_channel(self: &Arc<Self>, channel: &str) -> Result<u64, SubscribeError> {
        let mut state = self.state.lock();

        if let Some(pending) = state.pending_reset.take() {
            pending.token.cancel();
            let same = state.channel.as_ref().map(|c| c.name == channel).unwrap_or(false);
            if same {
                debug!("[Controller] Pending reset of {} cancelled", channel);
            } else {
                info!("[Controller] Draining channel released early for {}", channel);
                self.reset_locked(&mut state);
            }
        }

        if let Some(tuned) = &state.channel {
            if tuned.name == channel {
                debug!("[Controller] Reusing tuned channel {}", channel);
                return Ok(tuned.epoch);
            }
            warn!(
                "[Controller] Channel {} requested while {} is active",
                channel, tuned.name
            );
            return Err(SubscribeError::ResourceBusy {
                active: Some(tuned.name.clone()),
                requested: channel.to_string(),
            });
        }

        let lock = match self.device.lock().try_acquire() {
            Ok(lock) => lock,
            Err(e) => {
                warn!("[Controller] Receiver lock unavailable for {}: {}", channel, e);
                return Err(SubscribeError::ResourceBusy {
                    active: None,
                    requested: channel.to_string(),
                });
            }
        };

        let events: Arc<dyn ChannelEventHandler> = Arc::new(ChannelEvents {
            shared: Arc::downgrade(self),
        });
        if !self.device.set_channel(channel, events) {
            return Err(SubscribeError::TuneRejected(channel.to_string()));
        }

        state.last_epoch += 1;
        let epoch = state.last_epoch;
        state.channel = Some(TunedChannel::new(channel, epoch, lock));
        info!("[Controller] Channel {} tuned", channel);
        Ok(epoch)
    }

    /// Poll until `program` shows up among the announced services.
    async fn wait_for_program(
        &self,
        epoch: u64,
        channel: &str,
        program: &str,
    ) -> Result<ServiceId, SubscribeError> {
        let deadline = Instant::now() + self.config.discovery_timeout;
        loop {
            if let Some(service_id) = self.find_program(epoch, channel, program)? {
                debug!("[Controller] Found {} as {}", program, service_id);
                return Ok(service_id);
            }
            if Instant::now() >= deadline {
                warn!(
                    "[Controller] Program {} not announced on {} within {:?}",
                    program, channel, self.config.discovery_timeout
                );
                return Err(SubscribeError::ProgramNotFound {
                    channel: channel.to_string(),
                    program: program.to_string(),
                });
            }
            tokio::time::sleep(self.config.discovery_poll_interval).await;
        }
    }

    /// Resolve missing names and look `program` up, first match in
    /// announcement order.
    fn find_program(
        &self,
        epoch: u64,
        channel: &str,
        program: &str,
    ) -> Result<Option<ServiceId>, SubscribeError> {
        let mut state = self.state.lock();
        let tuned = match state.channel.as_mut() {
            Some(tuned) if tuned.epoch == epoch => tuned,
            _ => return Err(SubscribeError::ChannelReleased(channel.to_string())),
        };

        for entry in tuned.programs.iter_mut().filter(|p| p.name.is_none()) {
            entry.name = self
                .device
                .service_name(entry.service_id)
                .filter(|name| !name.is_empty());
        }

        Ok(tuned
            .programs
            .iter()
            .find(|p| p.name.as_deref() == Some(program))
            .map(|p| p.service_id))
    }

    /// Get or create the handler of `service_id` and count one subscriber.
    fn attach(
        &self,
        epoch: u64,
        channel: &str,
        program: &str,
        service_id: ServiceId,
    ) -> Result<Arc<ProgramHandler>, SubscribeError> {
        let mut state = self.state.lock();
        let tuned = match state.channel.as_mut() {
            Some(tuned) if tuned.epoch == epoch => tuned,
            _ => return Err(SubscribeError::ChannelReleased(channel.to_string())),
        };
        let entry = tuned
            .programs
            .iter_mut()
            .find(|p| p.service_id == service_id)
            .ok_or_else(|| SubscribeError::ProgramNotFound {
                channel: channel.to_string(),
                program: program.to_string(),
            })?;

        let handler = match &entry.handler {
            Some(handler) => Arc::clone(handler),
            None => {
                let handler = Arc::new(ProgramHandler::new(service_id, program));
                if !self.device.subscribe_program(service_id, handler.clone()) {
                    handler.release_waiters();
                    return Err(SubscribeError::SubscribeRejected {
                        program: program.to_string(),
                        service_id,
                    });
                }
                entry.handler = Some(Arc::clone(&handler));
                handler
            }
        };

        // The channel is in use again, whoever scheduled the reset.
        if let Some(pending) = state.pending_reset.take() {
            pending.token.cancel();
            debug!("[Controller] Pending reset of {} cancelled by {}", channel, program);
        }

        let subscribers = handler.add_subscriber();
        info!(
            "[Controller] Subscribed to {} ({}) on {}, subscribers={}",
            program, service_id, channel, subscribers
        );
        Ok(handler)
    }

    fn unsubscribe(self: &Arc<Self>, program: &str) -> bool {
        let mut state = self.state.lock();
        let tuned = match state.channel.as_mut() {
            Some(tuned) => tuned,
            None => {
                debug!("[Controller] Unsubscribe from {} with no channel tuned", program);
                return false;
            }
        };
        let entry = match tuned
            .programs
            .iter_mut()
            .find(|p| p.handler.is_some() && p.name.as_deref() == Some(program))
        {
            Some(entry) => entry,
            None => {
                debug!("[Controller] Unsubscribe from {}: not subscribed", program);
                return false;
            }
        };
        let handler = match &entry.handler {
            Some(handler) => Arc::clone(handler),
            None => return false,
        };

        let remaining = handler.remove_subscriber();
        if remaining > 0 {
            debug!("[Controller] {} still has {} subscribers", program, remaining);
            return true;
        }

        entry.handler = None;
        let service_id = entry.service_id;
        let idle = !tuned.has_handlers();

        if !self.device.unsubscribe_program(service_id) {
            warn!("[Controller] Receiver did not know subscription {}", service_id);
        }
        handler.release_waiters();
        info!("[Controller] Last subscriber of {} ({}) left", program, service_id);

        if idle {
            self.schedule_reset(&mut state);
        }
        true
    }

    fn schedule_reset(self: &Arc<Self>, state: &mut ControllerState) {
        if state.channel.is_none() || state.pending_reset.is_some() {
            return;
        }

        state.last_reset_id += 1;
        let id = state.last_reset_id;
        let token = CancellationToken::new();
        state.pending_reset = Some(PendingReset {
            id,
            token: token.clone(),
        });

        let delay = self.config.channel_reset_delay;
        let shared = Arc::downgrade(self);
        debug!("[Controller] Channel reset #{} scheduled in {:?}", id, delay);

        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("[Controller] Channel reset #{} cancelled", id);
                }
                _ = tokio::time::sleep(delay) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.fire_reset(id, &token);
                    }
                }
            }
        });
    }

    fn fire_reset(&self, id: u64, token: &CancellationToken) {
        let mut state = self.state.lock();
        match &state.pending_reset {
            Some(pending) if pending.id == id && !token.is_cancelled() => {}
            _ => {
                trace!("[Controller] Stale channel reset #{} ignored", id);
                return;
            }
        }
        state.pending_reset = None;

        if state.channel.as_ref().map(|c| c.has_handlers()).unwrap_or(false) {
            return;
        }
        info!("[Controller] Channel idle for {:?}", self.config.channel_reset_delay);
        self.reset_locked(&mut state);
    }

    /// Release the channel of a failed subscription unless others use it.
    fn cleanup_channel(&self, epoch: u64) {
        let mut state = self.state.lock();
        let idle = match &state.channel {
            Some(tuned) if tuned.epoch == epoch => !tuned.has_handlers(),
            _ => return,
        };
        if idle {
            debug!("[Controller] Releasing channel after failed subscription");
            self.reset_locked(&mut state);
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(tuned) = state.channel.as_mut() {
            for entry in tuned.programs.iter_mut() {
                if let Some(handler) = entry.handler.take() {
                    handler.clear_subscribers();
                    self.device.unsubscribe_program(entry.service_id);
                    handler.release_waiters();
                    info!("[Controller] Force-released {}", handler.name());
                }
            }
        }
        self.reset_locked(&mut state);
    }

    /// Cancel any pending reset, detune and release the receiver lock.
    fn reset_locked(&self, state: &mut ControllerState) {
        if let Some(pending) = state.pending_reset.take() {
            pending.token.cancel();
        }
        if let Some(tuned) = state.channel.take() {
            self.device.reset_channel();
            info!("[Controller] Channel {} released", tuned.name);
        }
    }

    fn with_channel(&self, f: impl FnOnce(&mut TunedChannel)) {
        if let Some(tuned) = self.state.lock().channel.as_mut() {
            f(tuned);
        }
    }
}

/// Cleans up the channel if a subscription fails or is dropped before
/// attaching.
struct DiscoveryGuard<'a> {
    shared: &'a ControllerShared,
    epoch: u64,
    armed: bool,
}

impl Drop for DiscoveryGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.cleanup_channel(self.epoch);
        }
    }
}

/// Device-level event target while a channel is tuned.
struct ChannelEvents {
    shared: Weak<ControllerShared>,
}

impl ChannelEvents {
    fn with_channel(&self, f: impl FnOnce(&mut TunedChannel)) {
        if let Some(shared) = self.shared.upgrade() {
            shared.with_channel(f);
        }
    }
}

impl ChannelEventHandler for ChannelEvents {
    fn on_snr(&self, snr: f32) {
        self.with_channel(|c| c.signal.snr = Some(snr));
    }

    fn on_frequency_corrector_change(&self, fine: i32, coarse: i32) {
        self.with_channel(|c| c.signal.frequency_correction = Some((fine, coarse)));
    }

    fn on_sync_change(&self, is_sync: bool) {
        self.with_channel(|c| c.signal.is_sync = is_sync);
    }

    fn on_signal_presence(&self, is_signal: bool) {
        self.with_channel(|c| {
            if c.signal.is_signal != is_signal {
                debug!("[Controller] Signal on {}: {}", c.name, is_signal);
            }
            c.signal.is_signal = is_signal;
        });
    }

    fn on_service_detected(&self, service_id: ServiceId) {
        self.with_channel(|c| {
            if c.programs.iter().any(|p| p.service_id == service_id) {
                return;
            }
            debug!("[Controller] Service {} detected on {}", service_id, c.name);
            c.programs.push(ProgramEntry {
                service_id,
                name: None,
                handler: None,
            });
        });
    }

    fn on_new_ensemble(&self, ensemble_id: u16) {
        self.with_channel(|c| debug!("[Controller] Ensemble 0x{:04X} on {}", ensemble_id, c.name));
    }

    fn on_set_ensemble_label(&self, label: String) {
        self.with_channel(|c| {
            let label = label.trim_end().to_string();
            info!("[Controller] Ensemble on {}: {}", c.name, label);
            c.ensemble_label = Some(label);
        });
    }

    fn on_datetime_update(&self, timestamp: i64) {
        self.with_channel(|c| {
            if let Some(datetime) = Local.timestamp_opt(timestamp, 0).single() {
                c.datetime = Some(datetime);
            }
        });
    }

    fn on_message(&self, text: String, text2: String, is_error: bool) {
        if is_error {
            warn!("[Controller] Receiver: {} {}", text, text2);
        } else {
            info!("[Controller] Receiver: {} {}", text, text2);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EngineBackend, ProgramEventHandler, RadioEngine, SimulatedBackend, SimulatedChannel,
        SimulatedProbe,
    };
    use crate::radio::device::DeviceConfig;
    use dabcast_types::DeviceError;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(vec![
            SimulatedChannel::new("5C", "Test Mux")
                .with_announce_delay(ms(20))
                .with_service(0x1001, "News")
                .with_service(0x1002, "Jazz")
                .with_data_service(0x1003, "EPG"),
            SimulatedChannel::new("11D", "Other Mux")
                .with_announce_delay(ms(20))
                .with_service(0x2001, "Talk"),
        ])
        .with_frame_interval(ms(10))
    }

    fn setup(backend: SimulatedBackend) -> (Arc<RadioController>, SimulatedProbe) {
        let probe = backend.probe();
        (controller_on(Arc::new(backend)), probe)
    }

    fn controller_on(backend: Arc<dyn EngineBackend>) -> Arc<RadioController> {
        let device = DabDevice::open(
            backend,
            &DeviceConfig {
                settle_delay: ms(5),
                ..DeviceConfig::default()
            },
        );
        let controller = RadioController::new(
            Arc::new(device),
            ControllerConfig {
                discovery_timeout: ms(300),
                discovery_poll_interval: ms(10),
                channel_reset_delay: ms(100),
            },
        );
        Arc::new(controller)
    }

    /// Receiver whose detune lets one more service announcement slip out of
    /// an engine thread.
    struct LateEventBackend {
        inner: SimulatedBackend,
    }

    struct LateEventEngine {
        inner: Box<dyn RadioEngine>,
        events: Arc<dyn ChannelEventHandler>,
    }

    impl EngineBackend for LateEventBackend {
        fn name(&self) -> &'static str {
            "late-event"
        }

        fn open(
            &self,
            events: Arc<dyn ChannelEventHandler>,
            device_name: &str,
            gain: i32,
        ) -> Result<Box<dyn RadioEngine>, DeviceError> {
            let inner = self.inner.open(Arc::clone(&events), device_name, gain)?;
            Ok(Box::new(LateEventEngine { inner, events }))
        }

        fn all_channel_names(&self) -> Vec<String> {
            self.inner.all_channel_names()
        }
    }

    impl RadioEngine for LateEventEngine {
        fn tune(&mut self, channel: &str, is_scan: bool) -> bool {
            self.inner.tune(channel, is_scan)
        }

        fn detune(&mut self) {
            self.inner.detune();
            let events = Arc::clone(&self.events);
            std::thread::spawn(move || {
                events.on_service_detected(ServiceId::new(0x1003));
                events.on_signal_presence(false);
            })
            .join()
            .unwrap();
        }

        fn subscribe(&mut self, service_id: ServiceId, sink: Arc<dyn ProgramEventHandler>) -> bool {
            self.inner.subscribe(service_id, sink)
        }

        fn unsubscribe(&mut self, service_id: ServiceId) -> bool {
            self.inner.unsubscribe(service_id)
        }

        fn service_name(&self, service_id: ServiceId) -> Option<String> {
            self.inner.service_name(service_id)
        }

        fn is_audio_service(&self, service_id: ServiceId) -> bool {
            self.inner.is_audio_service(service_id)
        }

        fn close(&mut self) {
            self.inner.close();
        }

        fn finalize(self: Box<Self>) {
            self.inner.finalize();
        }
    }

    async fn cancel_after(delay: Duration, reason: AbortReason) -> AbortReason {
        tokio::time::sleep(delay).await;
        reason
    }

    #[tokio::test]
    async fn test_two_programs_share_channel_then_drain() {
        let (controller, probe) = setup(backend());

        let news = controller.subscribe_program("5C", "News").await.unwrap();
        assert_eq!(probe.tuned_channel().as_deref(), Some("5C"));
        assert_eq!(news.subscribers(), 1);
        assert_eq!(news.service_id(), ServiceId::new(0x1001));

        let jazz = controller.subscribe_program("5C", "Jazz").await.unwrap();
        assert_eq!(jazz.subscribers(), 1);
        assert_eq!(news.subscribers(), 1);
        assert_eq!(probe.tune_count(), 1);
        assert_eq!(
            probe.subscribed_services(),
            vec![ServiceId::new(0x1001), ServiceId::new(0x1002)]
        );

        let frame = tokio::time::timeout(ms(1000), news.next_audio()).await.unwrap();
        assert_eq!(frame.map(|f| f.sample_rate), Some(48_000));

        assert!(controller.unsubscribe_program("News"));
        assert!(news.is_released());
        assert_eq!(news.subscribers(), 0);
        assert_eq!(jazz.subscribers(), 1);
        assert!(!controller.status().unwrap().draining);

        assert!(controller.unsubscribe_program("Jazz"));
        assert!(controller.status().unwrap().draining);
        assert!(controller.device().lock().is_locked());

        tokio::time::sleep(ms(250)).await;
        assert_eq!(probe.tuned_channel(), None);
        assert!(controller.status().is_none());
        assert!(!controller.device().lock().is_locked());
    }

    #[tokio::test]
    async fn test_different_channel_is_busy() {
        let (controller, probe) = setup(backend());
        controller.subscribe_program("5C", "News").await.unwrap();

        let err = controller.subscribe_program("11D", "Talk").await.unwrap_err();
        assert_eq!(
            err,
            SubscribeError::ResourceBusy {
                active: Some("5C".to_string()),
                requested: "11D".to_string(),
            }
        );
        assert!(err.is_declined());
        assert!(controller.can_subscribe("5C"));
        assert!(!controller.can_subscribe("11D"));
        assert_eq!(probe.tuned_channel().as_deref(), Some("5C"));
    }

    #[tokio::test]
    async fn test_subscriber_count_matches_handler_lifetime() {
        let (controller, _probe) = setup(backend());

        let first = controller.subscribe_program("5C", "News").await.unwrap();
        let second = controller.subscribe_program("5C", "News").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.subscribers(), 2);

        assert!(controller.unsubscribe_program("News"));
        assert_eq!(first.subscribers(), 1);
        assert!(!first.is_released());
        assert!(controller.handler("News").is_some());

        assert!(controller.unsubscribe_program("News"));
        assert_eq!(first.subscribers(), 0);
        assert!(first.is_released());
        assert!(controller.handler("News").is_none());

        assert!(!controller.unsubscribe_program("News"));
        assert_eq!(first.subscribers(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_discovery_detunes_idle_channel() {
        let (controller, probe) = setup(backend());

        let err = controller
            .subscribe_program_until("5C", "News", cancel_after(ms(5), AbortReason::Cancelled))
            .await
            .unwrap_err();

        assert_eq!(err, SubscribeError::Cancelled);
        assert!(!err.is_declined());
        assert_eq!(probe.tuned_channel(), None);
        assert!(controller.status().is_none());
        assert!(!controller.device().lock().is_locked());
    }

    #[tokio::test]
    async fn test_connection_lost_keeps_active_channel() {
        let (controller, probe) = setup(backend());
        let news = controller.subscribe_program("5C", "News").await.unwrap();

        let err = controller
            .subscribe_program_until(
                "5C",
                "Missing",
                cancel_after(ms(30), AbortReason::ConnectionLost),
            )
            .await
            .unwrap_err();

        assert_eq!(err, SubscribeError::ConnectionLost);
        assert_eq!(probe.tuned_channel().as_deref(), Some("5C"));
        assert_eq!(news.subscribers(), 1);
        assert!(!controller.status().unwrap().draining);
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_channel() {
        let (controller, probe) = setup(backend());

        let result = tokio::time::timeout(ms(5), controller.subscribe_program("5C", "News")).await;
        assert!(result.is_err());
        assert_eq!(probe.tuned_channel(), None);
        assert!(!controller.device().lock().is_locked());

        // The serialization lock was released with the dropped future.
        assert!(controller.subscribe_program("5C", "News").await.is_ok());
    }

    #[tokio::test]
    async fn test_program_not_found_releases_channel() {
        let (controller, probe) = setup(backend());

        let err = controller.subscribe_program("5C", "Missing").await.unwrap_err();
        assert_eq!(
            err,
            SubscribeError::ProgramNotFound {
                channel: "5C".to_string(),
                program: "Missing".to_string(),
            }
        );
        assert_eq!(probe.tuned_channel(), None);
        assert!(!controller.device().lock().is_locked());
    }

    #[tokio::test]
    async fn test_pending_reset_cancelled_by_same_channel() {
        let (controller, probe) = setup(backend());

        controller.subscribe_program("5C", "News").await.unwrap();
        assert!(controller.unsubscribe_program("News"));
        assert!(controller.status().unwrap().draining);

        controller.subscribe_program("5C", "Jazz").await.unwrap();
        assert!(!controller.status().unwrap().draining);

        tokio::time::sleep(ms(250)).await;
        assert_eq!(probe.tuned_channel().as_deref(), Some("5C"));
        assert_eq!(probe.tune_count(), 1);
    }

    #[tokio::test]
    async fn test_draining_channel_yields_to_other_channel() {
        let (controller, probe) = setup(backend());

        controller.subscribe_program("5C", "News").await.unwrap();
        assert!(controller.unsubscribe_program("News"));
        assert!(controller.can_subscribe("11D"));

        let talk = controller.subscribe_program("11D", "Talk").await.unwrap();
        assert_eq!(talk.subscribers(), 1);
        assert_eq!(probe.tuned_channel().as_deref(), Some("11D"));
        assert_eq!(probe.tune_count(), 2);

        // The cancelled reset of 5C must not detune 11D.
        tokio::time::sleep(ms(250)).await;
        assert_eq!(probe.tuned_channel().as_deref(), Some("11D"));
    }

    #[tokio::test]
    async fn test_attach_cancels_reset_scheduled_during_discovery() {
        let (controller, probe) = setup(backend());
        probe.withhold_label(ServiceId::new(0x1002));

        controller.subscribe_program("5C", "News").await.unwrap();
        let jazz = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.subscribe_program("5C", "Jazz").await })
        };
        tokio::time::sleep(ms(30)).await;

        // Last subscriber leaves while Jazz is still being looked up.
        assert!(controller.unsubscribe_program("News"));
        assert!(controller.status().unwrap().draining);

        probe.label_service(ServiceId::new(0x1002));
        let jazz = jazz.await.unwrap().unwrap();
        assert_eq!(jazz.subscribers(), 1);
        assert!(!controller.status().unwrap().draining);
        assert!(!controller.can_subscribe("11D"));

        let err = controller.subscribe_program("11D", "Talk").await.unwrap_err();
        assert_eq!(
            err,
            SubscribeError::ResourceBusy {
                active: Some("5C".to_string()),
                requested: "11D".to_string(),
            }
        );
        assert!(!jazz.is_released());

        tokio::time::sleep(ms(250)).await;
        assert_eq!(probe.tuned_channel().as_deref(), Some("5C"));
        assert_eq!(probe.subscribed_services(), vec![ServiceId::new(0x1002)]);
        assert_eq!(jazz.subscribers(), 1);
    }

    #[tokio::test]
    async fn test_late_event_from_previous_channel_is_ignored() {
        let backend = backend();
        let probe = backend.probe();
        let controller = controller_on(Arc::new(LateEventBackend { inner: backend }));

        controller.subscribe_program("5C", "News").await.unwrap();
        assert!(controller.unsubscribe_program("News"));

        // Detuning 5C raises a service announcement and a signal loss that
        // are still queued when 11D is bound.
        controller.subscribe_program("11D", "Talk").await.unwrap();
        assert_eq!(probe.tuned_channel().as_deref(), Some("11D"));
        tokio::time::sleep(ms(30)).await;

        let status = controller.status().unwrap();
        assert_eq!(status.channel, "11D");
        let services: Vec<_> = status.programs.iter().map(|p| p.service_id).collect();
        assert_eq!(services, vec![ServiceId::new(0x2001)]);
        assert!(status.signal.is_signal);
    }

    #[tokio::test]
    async fn test_stop_force_releases_everything() {
        let (controller, probe) = setup(backend());

        let news = controller.subscribe_program("5C", "News").await.unwrap();
        controller.subscribe_program("5C", "News").await.unwrap();
        let jazz = controller.subscribe_program("5C", "Jazz").await.unwrap();

        controller.stop();
        assert!(news.is_released());
        assert!(jazz.is_released());
        assert_eq!(news.subscribers(), 0);
        assert_eq!(jazz.subscribers(), 0);
        assert_eq!(probe.tuned_channel(), None);
        assert!(probe.subscribed_services().is_empty());
        assert!(controller.status().is_none());
        assert!(!controller.device().lock().is_locked());

        controller.stop();

        let fresh = controller.subscribe_program("5C", "News").await.unwrap();
        assert!(!Arc::ptr_eq(&fresh, &news));
        assert_eq!(fresh.subscribers(), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_reset() {
        let (controller, probe) = setup(backend());

        controller.subscribe_program("5C", "News").await.unwrap();
        assert!(controller.unsubscribe_program("News"));
        controller.stop();
        assert_eq!(probe.tuned_channel(), None);

        controller.subscribe_program("5C", "News").await.unwrap();
        tokio::time::sleep(ms(250)).await;
        assert_eq!(probe.tuned_channel().as_deref(), Some("5C"));
    }

    #[tokio::test]
    async fn test_stop_after_reset_fired() {
        let (controller, probe) = setup(backend());

        controller.subscribe_program("5C", "News").await.unwrap();
        assert!(controller.unsubscribe_program("News"));
        tokio::time::sleep(ms(250)).await;
        assert_eq!(probe.tuned_channel(), None);

        controller.stop();
        assert!(controller.can_subscribe("11D"));
        assert!(controller.subscribe_program("11D", "Talk").await.is_ok());
    }

    #[tokio::test]
    async fn test_stop_during_discovery_reports_released_channel() {
        let (controller, probe) = setup(backend());

        let pending = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.subscribe_program("5C", "Missing").await })
        };
        tokio::time::sleep(ms(40)).await;
        controller.stop();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, SubscribeError::ChannelReleased("5C".to_string()));
        assert_eq!(probe.tuned_channel(), None);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_rejected() {
        let (controller, _probe) = setup(backend());

        let err = controller.subscribe_program("99X", "News").await.unwrap_err();
        assert_eq!(err, SubscribeError::TuneRejected("99X".to_string()));
        assert!(!controller.device().lock().is_locked());
        assert!(controller.subscribe_program("5C", "News").await.is_ok());
    }

    #[tokio::test]
    async fn test_unusable_device_declines() {
        let (controller, _probe) = setup(backend().unavailable());

        assert!(!controller.device().is_usable());
        let err = controller.subscribe_program("5C", "News").await.unwrap_err();
        assert!(err.is_declined());
        assert!(controller.status().is_none());
    }

    #[tokio::test]
    async fn test_rejected_subscribe_leaves_no_handler() {
        let (controller, probe) = setup(backend());
        probe.reject_subscription(ServiceId::new(0x1002));

        let err = controller.subscribe_program("5C", "Jazz").await.unwrap_err();
        assert_eq!(
            err,
            SubscribeError::SubscribeRejected {
                program: "Jazz".to_string(),
                service_id: ServiceId::new(0x1002),
            }
        );
        assert!(controller.handler("Jazz").is_none());
        assert_eq!(probe.tuned_channel(), None);

        let news = controller.subscribe_program("5C", "News").await.unwrap();
        let err = controller.subscribe_program("5C", "EPG").await.unwrap_err();
        assert!(matches!(err, SubscribeError::SubscribeRejected { .. }));
        assert_eq!(news.subscribers(), 1);

        let status = controller.status().unwrap();
        assert_eq!(status.active_programs(), 1);
        assert!(status
            .programs
            .iter()
            .filter(|p| p.name.as_deref() != Some("News"))
            .all(|p| p.subscribers == 0));
        assert_eq!(probe.tuned_channel().as_deref(), Some("5C"));
    }

    #[tokio::test]
    async fn test_status_reports_ensemble() {
        let (controller, _probe) = setup(backend());
        controller.subscribe_program("5C", "News").await.unwrap();

        let status = controller.status().unwrap();
        assert_eq!(status.channel, "5C");
        assert_eq!(status.ensemble_label.as_deref(), Some("Test Mux"));
        assert!(status.datetime.is_some());
        assert!(status.signal.is_signal);
        assert!(status.signal.is_sync);
        assert_eq!(status.programs[0].service_id, ServiceId::new(0x1001));
        assert_eq!(status.programs[0].name.as_deref(), Some("News"));
        assert_eq!(status.programs[0].subscribers, 1);
    }

    #[tokio::test]
    async fn test_shutdown_finalizes_receiver() {
        let (controller, probe) = setup(backend());
        let news = controller.subscribe_program("5C", "News").await.unwrap();

        controller.shutdown().await;
        assert!(news.is_released());
        assert!(probe.is_finalized());
        assert!(!controller.device().is_usable());
        assert!(controller.subscribe_program("5C", "News").await.unwrap_err().is_declined());
    }
}
