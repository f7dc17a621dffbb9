//! Receiver sharing: device handle, callback hand-off, program sinks and the
//! subscription controller.

pub mod controller;
pub mod device;
pub mod forwarder;
pub mod lock;
pub mod program;

pub use controller::{AbortReason, ControllerConfig, RadioController};
pub use device::{DabDevice, DeviceConfig};
pub use forwarder::{CallbackForwarder, Deliver};
pub use lock::{DeviceLock, DeviceLockGuard, LockError};
pub use program::ProgramHandler;
