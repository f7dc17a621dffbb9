//! Virtual receiver.
//!
//! Behaves like a real engine from the controller's point of view: tuning
//! starts a receiver thread that announces the configured ensemble after a
//! delay and then streams silent PCM frames to every subscribed service. All
//! callbacks originate on that thread, never on the caller's.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;

use dabcast_types::{DeviceError, ServiceId};

use crate::engine::{
    ChannelEventHandler, EngineBackend, ProgramEventHandler, RadioEngine, BAND_III_CHANNELS,
};

const SAMPLE_RATE: u32 = 48_000;
const AUDIO_MODE: &str = "DAB+ stereo";
const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(120);
/// Frames between two signal/label updates.
const STATUS_EVERY: u64 = 25;

fn default_audio() -> bool {
    true
}

fn default_announce_delay_ms() -> u64 {
    1500
}

/// One service of a simulated ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulatedService {
    pub id: u32,
    pub name: String,
    #[serde(default = "default_audio")]
    pub audio: bool,
}

/// One simulated ensemble, keyed by its Band III channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimulatedChannel {
    pub name: String,
    #[serde(default)]
    pub ensemble_label: Option<String>,
    /// Time between tuning and the ensemble announcement.
    #[serde(default = "default_announce_delay_ms")]
    pub announce_delay_ms: u64,
    #[serde(default)]
    pub services: Vec<SimulatedService>,
}

impl SimulatedChannel {
    pub fn new(name: impl Into<String>, ensemble_label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ensemble_label: Some(ensemble_label.into()),
            announce_delay_ms: default_announce_delay_ms(),
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, id: u32, name: impl Into<String>) -> Self {
        self.services.push(SimulatedService {
            id,
            name: name.into(),
            audio: true,
        });
        self
    }

    pub fn with_data_service(mut self, id: u32, name: impl Into<String>) -> Self {
        self.services.push(SimulatedService {
            id,
            name: name.into(),
            audio: false,
        });
        self
    }

    pub fn with_announce_delay(mut self, delay: Duration) -> Self {
        self.announce_delay_ms = delay.as_millis() as u64;
        self
    }

    fn service(&self, service_id: ServiceId) -> Option<&SimulatedService> {
        self.services.iter().find(|s| s.id == service_id.get())
    }
}

/// Receiver state shared between the engine, its threads and probes.
#[derive(Default)]
struct SimState {
    open: bool,
    tuned: Option<String>,
    /// Bumped on every tune/detune; receiver threads exit once it moves on.
    session: u64,
    sinks: HashMap<ServiceId, Arc<dyn ProgramEventHandler>>,
    rejected: HashSet<ServiceId>,
    /// Announced, but label not decoded yet.
    unlabelled: HashSet<ServiceId>,
    tune_count: u32,
    finalized: bool,
}

impl SimState {
    fn is_current(&self, session: u64) -> bool {
        self.session == session && self.tuned.is_some()
    }
}

/// Backend producing simulated receivers.
#[derive(Clone)]
pub struct SimulatedBackend {
    channels: Arc<Vec<SimulatedChannel>>,
    frame_interval: Duration,
    available: bool,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBackend {
    pub fn new(channels: Vec<SimulatedChannel>) -> Self {
        Self {
            channels: Arc::new(channels),
            frame_interval: DEFAULT_FRAME_INTERVAL,
            available: true,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Interval between two audio frames.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Simulate a machine without any receiver attached.
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Observe and steer the receiver from outside the engine.
    pub fn probe(&self) -> SimulatedProbe {
        SimulatedProbe {
            state: Arc::clone(&self.state),
        }
    }
}

impl EngineBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn open(
        &self,
        events: Arc<dyn ChannelEventHandler>,
        device_name: &str,
        gain: i32,
    ) -> Result<Box<dyn RadioEngine>, DeviceError> {
        if !self.available {
            return Err(DeviceError::OpenFailed {
                device: device_name.to_string(),
                reason: "no receiver attached".to_string(),
            });
        }

        let mut state = self.state.lock();
        if state.open {
            return Err(DeviceError::OpenFailed {
                device: device_name.to_string(),
                reason: "receiver already in use".to_string(),
            });
        }
        state.open = true;
        state.finalized = false;

        info!(
            "[Simulated] Receiver {} opened (gain={}, {} ensembles)",
            device_name,
            gain,
            self.channels.len()
        );
        Ok(Box::new(SimulatedEngine {
            channels: Arc::clone(&self.channels),
            frame_interval: self.frame_interval,
            state: Arc::clone(&self.state),
            events,
            workers: Vec::new(),
        }))
    }

    fn all_channel_names(&self) -> Vec<String> {
        super::band_iii_channel_names()
    }
}

/// Read/steer access to a simulated receiver.
#[derive(Clone)]
pub struct SimulatedProbe {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedProbe {
    pub fn tuned_channel(&self) -> Option<String> {
        self.state.lock().tuned.clone()
    }

    pub fn tune_count(&self) -> u32 {
        self.state.lock().tune_count
    }

    pub fn subscribed_services(&self) -> Vec<ServiceId> {
        let mut ids: Vec<_> = self.state.lock().sinks.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    /// Make every later subscribe to `service_id` fail.
    pub fn reject_subscription(&self, service_id: ServiceId) {
        self.state.lock().rejected.insert(service_id);
    }

    /// Report no label for `service_id` until [`label_service`] is called.
    ///
    /// [`label_service`]: Self::label_service
    pub fn withhold_label(&self, service_id: ServiceId) {
        self.state.lock().unlabelled.insert(service_id);
    }

    pub fn label_service(&self, service_id: ServiceId) {
        self.state.lock().unlabelled.remove(&service_id);
    }
}

struct SimulatedEngine {
    channels: Arc<Vec<SimulatedChannel>>,
    frame_interval: Duration,
    state: Arc<Mutex<SimState>>,
    events: Arc<dyn ChannelEventHandler>,
    workers: Vec<JoinHandle<()>>,
}

impl SimulatedEngine {
    fn ensemble(&self, channel: &str) -> Option<&SimulatedChannel> {
        self.channels.iter().find(|c| c.name == channel)
    }

    fn tuned_ensemble(&self) -> Option<&SimulatedChannel> {
        let tuned = self.state.lock().tuned.clone()?;
        self.ensemble(&tuned)
    }
}

impl RadioEngine for SimulatedEngine {
    fn tune(&mut self, channel: &str, _is_scan: bool) -> bool {
        if channel.is_empty() {
            self.detune();
            return true;
        }
        if !BAND_III_CHANNELS.contains(&channel) {
            warn!("[Simulated] Unknown channel {}", channel);
            return false;
        }

        let session = {
            let mut state = self.state.lock();
            if !state.open {
                return false;
            }
            state.session += 1;
            state.tuned = Some(channel.to_string());
            state.sinks.clear();
            state.tune_count += 1;
            state.session
        };

        self.workers.retain(|h| !h.is_finished());

        let receiver = Receiver {
            state: Arc::clone(&self.state),
            events: Arc::clone(&self.events),
            ensemble: self.ensemble(channel).cloned(),
            session,
            frame_interval: self.frame_interval,
        };
        match thread::Builder::new()
            .name(format!("sim-receiver-{}", channel))
            .spawn(move || receiver.run())
        {
            Ok(handle) => {
                self.workers.push(handle);
                debug!("[Simulated] Tuned to {} (session {})", channel, session);
                true
            }
            Err(e) => {
                error!("[Simulated] Failed to start receiver thread: {}", e);
                let mut state = self.state.lock();
                state.tuned = None;
                false
            }
        }
    }

    fn detune(&mut self) {
        let mut state = self.state.lock();
        if state.tuned.take().is_some() {
            state.session += 1;
            state.sinks.clear();
            debug!("[Simulated] Detuned");
        }
    }

    fn subscribe(&mut self, service_id: ServiceId, sink: Arc<dyn ProgramEventHandler>) -> bool {
        let is_audio = match self.tuned_ensemble().and_then(|e| e.service(service_id)) {
            Some(service) => service.audio,
            None => return false,
        };
        let mut state = self.state.lock();
        if !is_audio || state.rejected.contains(&service_id) {
            return false;
        }
        state.sinks.insert(service_id, sink);
        true
    }

    fn unsubscribe(&mut self, service_id: ServiceId) -> bool {
        self.state.lock().sinks.remove(&service_id).is_some()
    }

    fn service_name(&self, service_id: ServiceId) -> Option<String> {
        if self.state.lock().unlabelled.contains(&service_id) {
            return None;
        }
        // Labels come padded to 16 characters like on air.
        self.tuned_ensemble()
            .and_then(|e| e.service(service_id))
            .map(|s| format!("{:<16}", s.name))
    }

    fn is_audio_service(&self, service_id: ServiceId) -> bool {
        self.tuned_ensemble()
            .and_then(|e| e.service(service_id))
            .map(|s| s.audio)
            .unwrap_or(false)
    }

    fn close(&mut self) {
        self.detune();
        self.state.lock().open = false;
    }

    fn finalize(mut self: Box<Self>) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("[Simulated] Receiver thread panicked");
            }
        }
        let mut state = self.state.lock();
        state.open = false;
        state.finalized = true;
        info!("[Simulated] Receiver finalized");
    }
}

/// Body of one receiver thread (one per tune).
struct Receiver {
    state: Arc<Mutex<SimState>>,
    events: Arc<dyn ChannelEventHandler>,
    ensemble: Option<SimulatedChannel>,
    session: u64,
    frame_interval: Duration,
}

impl Receiver {
    fn current(&self) -> bool {
        self.state.lock().is_current(self.session)
    }

    fn run(self) {
        let ensemble = match &self.ensemble {
            Some(e) => e,
            None => {
                self.events.on_signal_presence(false);
                return;
            }
        };

        thread::sleep(Duration::from_millis(ensemble.announce_delay_ms));
        if !self.current() {
            return;
        }

        self.events.on_signal_presence(true);
        self.events.on_sync_change(true);
        if let Some(label) = &ensemble.ensemble_label {
            self.events.on_new_ensemble((self.session & 0xFFFF) as u16);
            self.events.on_set_ensemble_label(label.clone());
        }
        self.events
            .on_datetime_update(chrono::Utc::now().timestamp());

        for service in &ensemble.services {
            if !self.current() {
                return;
            }
            self.events.on_service_detected(ServiceId::new(service.id));
        }

        let samples = (SAMPLE_RATE as u128 * self.frame_interval.as_millis() / 1000) as usize;
        let silence = Bytes::from(vec![0u8; samples.max(1) * 4]);
        let mut frame: u64 = 0;

        loop {
            let sinks: Vec<(ServiceId, Arc<dyn ProgramEventHandler>)> = {
                let state = self.state.lock();
                if !state.is_current(self.session) {
                    break;
                }
                state
                    .sinks
                    .iter()
                    .map(|(id, sink)| (*id, Arc::clone(sink)))
                    .collect()
            };

            for (service_id, sink) in &sinks {
                sink.on_new_audio(silence.clone(), SAMPLE_RATE, AUDIO_MODE.to_string());
                if frame % STATUS_EVERY == 0 {
                    if let Some(service) = ensemble.service(*service_id) {
                        sink.on_new_dynamic_label(format!("{} - simulated broadcast", service.name));
                    }
                }
            }
            if frame % STATUS_EVERY == 0 {
                self.events.on_snr(12.0);
            }

            frame += 1;
            thread::sleep(self.frame_interval);
        }
        debug!("[Simulated] Receiver session {} ended", self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Discovered {
        services: Mutex<Vec<ServiceId>>,
        label: Mutex<Option<String>>,
    }

    impl ChannelEventHandler for Discovered {
        fn on_service_detected(&self, service_id: ServiceId) {
            self.services.lock().push(service_id);
        }

        fn on_set_ensemble_label(&self, label: String) {
            *self.label.lock() = Some(label);
        }
    }

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(vec![SimulatedChannel::new("5C", "Test Mux")
            .with_announce_delay(Duration::from_millis(10))
            .with_service(0x1001, "News")
            .with_data_service(0x1002, "EPG")])
        .with_frame_interval(Duration::from_millis(5))
    }

    #[test]
    fn test_announces_services_from_receiver_thread() {
        let backend = backend();
        let events = Arc::new(Discovered::default());
        let mut engine = backend.open(events.clone(), "auto", -1).unwrap();

        assert!(engine.tune("5C", false));
        thread::sleep(Duration::from_millis(100));

        assert_eq!(
            *events.services.lock(),
            vec![ServiceId::new(0x1001), ServiceId::new(0x1002)]
        );
        assert_eq!(events.label.lock().as_deref(), Some("Test Mux"));
        assert_eq!(
            engine.service_name(ServiceId::new(0x1001)).as_deref(),
            Some("News            ")
        );
        assert!(engine.is_audio_service(ServiceId::new(0x1001)));
        assert!(!engine.is_audio_service(ServiceId::new(0x1002)));

        engine.close();
        engine.finalize();
        assert!(backend.probe().is_finalized());
    }

    #[test]
    fn test_rejects_unknown_channel_and_data_services() {
        let backend = backend();
        let mut engine = backend
            .open(Arc::new(Discovered::default()), "auto", -1)
            .unwrap();

        assert!(!engine.tune("99X", false));
        assert!(engine.tune("5C", false));

        struct Sink;
        impl ProgramEventHandler for Sink {}

        assert!(!engine.subscribe(ServiceId::new(0x1002), Arc::new(Sink)));
        assert!(engine.subscribe(ServiceId::new(0x1001), Arc::new(Sink)));
        assert_eq!(backend.probe().subscribed_services(), vec![ServiceId::new(0x1001)]);
        assert!(engine.unsubscribe(ServiceId::new(0x1001)));
        assert!(!engine.unsubscribe(ServiceId::new(0x1001)));

        engine.close();
        engine.finalize();
    }

    #[test]
    fn test_single_open_and_unavailable() {
        let backend = backend();
        let events: Arc<dyn ChannelEventHandler> = Arc::new(Discovered::default());
        let engine = backend.open(events.clone(), "auto", -1).unwrap();
        assert!(backend.open(events.clone(), "auto", -1).is_err());
        engine.finalize();

        let missing = SimulatedBackend::new(Vec::new()).unavailable();
        assert!(matches!(
            missing.open(events, "auto", -1),
            Err(DeviceError::OpenFailed { .. })
        ));
    }
}
