//! Interface to the DAB+ decoding engine.
//!
//! The engine is an external collaborator: it owns the receiver hardware,
//! demodulates the ensemble and decodes audio. This module only describes the
//! surface the controller consumes:
//! - [`EngineBackend`]: opens a receiver and lists the channel table
//! - [`RadioEngine`]: one opened receiver (tune, subscribe, metadata queries)
//! - [`events`]: the callbacks the engine raises on its own threads
//!
//! Two backends ship with the crate: [`unsupported`] stands in for the native
//! library when it is not linked, and [`simulated`] is a virtual receiver.

use std::sync::Arc;

use dabcast_types::{DeviceError, ServiceId};

pub mod events;
pub mod simulated;
pub mod unsupported;

pub use events::{
    ChannelEvent, ChannelEventHandler, ChannelForwarder, ProgramEvent, ProgramEventHandler,
    ProgramForwarder,
};
pub use simulated::{SimulatedBackend, SimulatedChannel, SimulatedProbe, SimulatedService};
pub use unsupported::UnsupportedBackend;

/// DAB Band III channel designators, in frequency order.
pub const BAND_III_CHANNELS: &[&str] = &[
    "5A", "5B", "5C", "5D", "6A", "6B", "6C", "6D", "7A", "7B", "7C", "7D", "8A", "8B", "8C",
    "8D", "9A", "9B", "9C", "9D", "10A", "10N", "10B", "10C", "10D", "11A", "11N", "11B", "11C",
    "11D", "12A", "12N", "12B", "12C", "12D", "13A", "13B", "13C", "13D", "13E", "13F",
];

/// Returns the Band III channel table as owned strings.
pub fn band_iii_channel_names() -> Vec<String> {
    BAND_III_CHANNELS.iter().map(|c| c.to_string()).collect()
}

/// Factory for receivers.
pub trait EngineBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Open a receiver. Device-level callbacks for its whole lifetime go to
    /// `events`.
    fn open(
        &self,
        events: Arc<dyn ChannelEventHandler>,
        device_name: &str,
        gain: i32,
    ) -> Result<Box<dyn RadioEngine>, DeviceError>;

    /// Channels the engine knows how to tune to. Does not need a receiver.
    fn all_channel_names(&self) -> Vec<String>;
}

/// One opened receiver.
///
/// All methods are synchronous and may be called from the runtime. Callbacks
/// are raised on engine-owned threads, never from inside these calls.
pub trait RadioEngine: Send {
    /// Tune to `channel`. Returns false if the channel is rejected.
    fn tune(&mut self, channel: &str, is_scan: bool) -> bool;

    /// Stop receiving. Idempotent.
    fn detune(&mut self);

    /// Start delivering `service_id` to `sink`.
    fn subscribe(&mut self, service_id: ServiceId, sink: Arc<dyn ProgramEventHandler>) -> bool;

    /// Stop delivering `service_id`. Returns false if it was not subscribed.
    fn unsubscribe(&mut self, service_id: ServiceId) -> bool;

    /// Label of a service in the tuned ensemble, as broadcast (may be padded).
    fn service_name(&self, service_id: ServiceId) -> Option<String>;

    fn is_audio_service(&self, service_id: ServiceId) -> bool;

    /// Close the receiver. No new callbacks are started afterwards, but ones
    /// already in flight may still complete.
    fn close(&mut self);

    /// Release the engine instance.
    fn finalize(self: Box<Self>);
}
