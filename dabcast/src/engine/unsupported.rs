//! Stub backend used when the native decoding engine is not linked.

use std::sync::Arc;

use dabcast_types::DeviceError;

use crate::engine::{band_iii_channel_names, ChannelEventHandler, EngineBackend, RadioEngine};

const UNSUPPORTED_MSG: &str = "native DAB+ decoding engine is not linked into this build";

pub struct UnsupportedBackend;

impl EngineBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn open(
        &self,
        _events: Arc<dyn ChannelEventHandler>,
        _device_name: &str,
        _gain: i32,
    ) -> Result<Box<dyn RadioEngine>, DeviceError> {
        Err(DeviceError::Unavailable(UNSUPPORTED_MSG.to_string()))
    }

    fn all_channel_names(&self) -> Vec<String> {
        band_iii_channel_names()
    }
}
