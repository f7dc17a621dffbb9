//! Shared types for the dabcast receiver controller.
//!
//! This crate holds the vocabulary that both the controller and the layers
//! built on top of it (playlist generation, HTTP streaming, casting) speak:
//!
//! - [`ServiceId`]: runtime-discovered identifier of a program in an ensemble
//! - [`AudioFrame`] / [`MotObject`]: decoded content delivered per program
//! - [`ChannelStatus`] / [`ProgramStatus`]: read-only controller snapshots
//! - [`SubscribeError`] / [`DeviceError`]: failure taxonomy
//!
//! ```rust
//! use dabcast_types::{ServiceId, SubscribeError};
//!
//! let sid = ServiceId::new(0xD210);
//! assert_eq!(sid.to_string(), "0xD210");
//!
//! let err = SubscribeError::TuneRejected("13Z".to_string());
//! assert!(err.is_declined());
//! assert!(!SubscribeError::Cancelled.is_declined());
//! ```

pub mod error;
pub mod types;

pub use error::{DeviceError, SubscribeError};
pub use types::{
    AudioFrame, ChannelStatus, DecoderErrors, MotObject, ProgramStatus, ServiceId, SignalInfo,
    AUTO_GAIN, DEFAULT_DEVICE_NAME,
};
