//! The single owner of the decoding engine.
//!
//! [`DabDevice`] is the only place that calls into the engine. It keeps the
//! device-level forwarder registered with the engine for its whole life and
//! one program-level forwarder per subscribed service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use dabcast_types::{ServiceId, AUTO_GAIN, DEFAULT_DEVICE_NAME};

use crate::engine::{
    ChannelEventHandler, ChannelForwarder, EngineBackend, ProgramEventHandler, ProgramForwarder,
    RadioEngine,
};
use crate::radio::lock::DeviceLock;

/// Wait between closing the engine and finalizing it, so callbacks already
/// running on engine threads can finish queueing into the forwarders.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Receiver acquisition parameters.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_name: String,
    pub gain: i32,
    pub settle_delay: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: DEFAULT_DEVICE_NAME.to_string(),
            gain: AUTO_GAIN,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// Handle to the one receiver of this process.
pub struct DabDevice {
    engine: Mutex<Option<Box<dyn RadioEngine>>>,
    backend: Arc<dyn EngineBackend>,
    /// Registered with the engine at acquisition, never replaced.
    events: Arc<ChannelForwarder>,
    programs: Mutex<HashMap<ServiceId, Arc<ProgramForwarder>>>,
    lock: DeviceLock,
    settle_delay: Duration,
}

impl DabDevice {
    /// Acquire the receiver.
    ///
    /// A failure is logged once and leaves the handle permanently unusable;
    /// every later operation then reports failure.
    ///
    /// Must be called inside the tokio runtime that will run the controller.
    pub fn open(backend: Arc<dyn EngineBackend>, config: &DeviceConfig) -> Self {
        let events = Arc::new(ChannelForwarder::new("channel"));
        let sink: Arc<dyn ChannelEventHandler> = events.clone();

        let engine = match backend.open(sink, &config.device_name, config.gain) {
            Ok(engine) => {
                info!(
                    "[Device] Receiver {} opened via {} backend",
                    config.device_name,
                    backend.name()
                );
                Some(engine)
            }
            Err(e) => {
                error!("[Device] Receiver unusable: {}", e);
                None
            }
        };

        Self {
            engine: Mutex::new(engine),
            backend,
            events,
            programs: Mutex::new(HashMap::new()),
            lock: DeviceLock::new(),
            settle_delay: config.settle_delay,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// The exclusion lock over this receiver.
    pub fn lock(&self) -> &DeviceLock {
        &self.lock
    }

    /// Tune to `channel` and route device events to `events` from now on.
    pub fn set_channel(&self, channel: &str, events: Arc<dyn ChannelEventHandler>) -> bool {
        let mut engine = self.engine.lock();
        let engine = match engine.as_mut() {
            Some(engine) => engine,
            None => return false,
        };

        if !self.events.bind(events) {
            debug!("[Device] Channel events already bound");
        }
        if engine.tune(channel, false) {
            info!("[Device] Tuned to channel {}", channel);
            true
        } else {
            warn!("[Device] Engine rejected channel {}", channel);
            self.events.unbind();
            false
        }
    }

    /// Detune. Only valid while no program is subscribed.
    pub fn reset_channel(&self) {
        {
            let programs = self.programs.lock();
            if !programs.is_empty() {
                warn!(
                    "[Device] Resetting channel with {} programs still subscribed",
                    programs.len()
                );
            }
        }
        if let Some(engine) = self.engine.lock().as_mut() {
            engine.detune();
            info!("[Device] Channel reset");
        }
        self.events.unbind();
    }

    /// Start delivering `service_id` into `handler` through a dedicated
    /// forwarder.
    pub fn subscribe_program(
        &self,
        service_id: ServiceId,
        handler: Arc<dyn ProgramEventHandler>,
    ) -> bool {
        let mut engine = self.engine.lock();
        let engine = match engine.as_mut() {
            Some(engine) => engine,
            None => return false,
        };

        let forwarder = Arc::new(ProgramForwarder::bound("program", handler));
        let sink: Arc<dyn ProgramEventHandler> = forwarder.clone();
        if !engine.subscribe(service_id, sink) {
            warn!("[Device] Engine rejected subscription to {}", service_id);
            return false;
        }

        if let Some(previous) = self.programs.lock().insert(service_id, forwarder) {
            previous.unbind();
        }
        debug!("[Device] Subscribed to {}", service_id);
        true
    }

    /// Stop delivering `service_id`. Fails if it was not subscribed.
    pub fn unsubscribe_program(&self, service_id: ServiceId) -> bool {
        let forwarder = self.programs.lock().remove(&service_id);
        // Frames still queued in the forwarder must not reach a disposed handler.
        if let Some(forwarder) = &forwarder {
            forwarder.unbind();
        }

        let mut engine = self.engine.lock();
        match engine.as_mut() {
            Some(engine) => {
                let removed = engine.unsubscribe(service_id);
                if removed {
                    debug!("[Device] Unsubscribed from {}", service_id);
                }
                removed && forwarder.is_some()
            }
            None => false,
        }
    }

    /// Raw service label from the engine, trailing padding removed.
    pub fn service_name(&self, service_id: ServiceId) -> Option<String> {
        self.engine
            .lock()
            .as_ref()
            .and_then(|engine| engine.service_name(service_id))
            .map(|name| name.trim_end().to_string())
    }

    /// `None` if the device is unusable.
    pub fn is_audio_service(&self, service_id: ServiceId) -> Option<bool> {
        self.engine
            .lock()
            .as_ref()
            .map(|engine| engine.is_audio_service(service_id))
    }

    pub fn all_channel_names(&self) -> Vec<String> {
        self.backend.all_channel_names()
    }

    /// Detune, close and finalize the engine.
    pub async fn cleanup(&self) {
        let engine = match self.close_engine() {
            Some(engine) => engine,
            None => return,
        };
        tokio::time::sleep(self.settle_delay).await;
        engine.finalize();
        info!("[Device] Receiver finalized");
    }

    fn close_engine(&self) -> Option<Box<dyn RadioEngine>> {
        let mut engine = self.engine.lock().take()?;
        info!("[Device] Closing receiver");
        engine.tune("", false);
        engine.close();

        for (_, forwarder) in self.programs.lock().drain() {
            forwarder.unbind();
        }
        self.events.unbind();
        self.lock.close();
        Some(engine)
    }
}

impl Drop for DabDevice {
    fn drop(&mut self) {
        if let Some(engine) = self.close_engine() {
            std::thread::sleep(self.settle_delay);
            engine.finalize();
            debug!("[Device] Receiver finalized on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SimulatedBackend, SimulatedChannel, UnsupportedBackend};

    #[derive(Default)]
    struct Discovered {
        services: Mutex<Vec<ServiceId>>,
    }

    impl ChannelEventHandler for Discovered {
        fn on_service_detected(&self, service_id: ServiceId) {
            self.services.lock().push(service_id);
        }
    }

    struct Sink;
    impl ProgramEventHandler for Sink {}

    fn test_config() -> DeviceConfig {
        DeviceConfig {
            settle_delay: Duration::from_millis(10),
            ..DeviceConfig::default()
        }
    }

    fn backend() -> SimulatedBackend {
        SimulatedBackend::new(vec![SimulatedChannel::new("5C", "Test Mux")
            .with_announce_delay(Duration::from_millis(5))
            .with_service(0x1001, "News")
            .with_service(0x1002, "Jazz")
            .with_data_service(0x1003, "EPG")])
        .with_frame_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_unusable_device_reports_failure() {
        let device = DabDevice::open(Arc::new(UnsupportedBackend), &test_config());

        assert!(!device.is_usable());
        assert!(!device.set_channel("5C", Arc::new(Discovered::default())));
        assert!(!device.subscribe_program(ServiceId::new(1), Arc::new(Sink)));
        assert!(!device.unsubscribe_program(ServiceId::new(1)));
        assert_eq!(device.service_name(ServiceId::new(1)), None);
        assert_eq!(device.is_audio_service(ServiceId::new(1)), None);
        // Channel table does not need a receiver.
        assert_eq!(device.all_channel_names().len(), 41);
    }

    #[tokio::test]
    async fn test_events_reach_bound_target_on_runtime() {
        let backend = backend();
        let device = DabDevice::open(Arc::new(backend.clone()), &test_config());
        let discovered = Arc::new(Discovered::default());

        assert!(device.set_channel("5C", discovered.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            *discovered.services.lock(),
            vec![ServiceId::new(0x1001), ServiceId::new(0x1002), ServiceId::new(0x1003)]
        );
        assert_eq!(device.service_name(ServiceId::new(0x1001)).as_deref(), Some("News"));
        assert_eq!(device.is_audio_service(ServiceId::new(0x1001)), Some(true));
        assert_eq!(device.is_audio_service(ServiceId::new(0x1002)), Some(true));
        assert_eq!(device.is_audio_service(ServiceId::new(0x1003)), Some(false));
        assert_eq!(device.is_audio_service(ServiceId::new(0x9999)), Some(false));

        assert!(device.subscribe_program(ServiceId::new(0x1001), Arc::new(Sink)));
        assert!(device.unsubscribe_program(ServiceId::new(0x1001)));
        assert!(!device.unsubscribe_program(ServiceId::new(0x1001)));

        device.reset_channel();
        assert_eq!(backend.probe().tuned_channel(), None);
    }

    #[tokio::test]
    async fn test_rejected_tune_unbinds_events() {
        let device = DabDevice::open(Arc::new(backend()), &test_config());
        assert!(!device.set_channel("99X", Arc::new(Discovered::default())));
        // A later tune can bind a fresh target.
        assert!(device.set_channel("5C", Arc::new(Discovered::default())));
    }

    #[tokio::test]
    async fn test_cleanup_finalizes_engine() {
        let backend = backend();
        let device = DabDevice::open(Arc::new(backend.clone()), &test_config());
        assert!(device.set_channel("5C", Arc::new(Discovered::default())));

        device.cleanup().await;
        let probe = backend.probe();
        assert!(probe.is_finalized());
        assert_eq!(probe.tuned_channel(), None);
        assert!(!device.is_usable());
        assert!(device.lock().try_acquire().is_err());
    }
}
