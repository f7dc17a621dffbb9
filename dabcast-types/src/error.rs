//! Error types for the dabcast receiver controller.

use thiserror::Error;

use crate::types::ServiceId;

/// Reasons a program subscription did not produce a handler.
///
/// Every variant except [`SubscribeError::Cancelled`] and
/// [`SubscribeError::ConnectionLost`] is a *declined* subscription: the
/// controller recovered locally and the caller simply gets no handler.
/// The two abort variants are raised only after the controller has cleaned up
/// the channel it tuned for the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The receiver is committed to another channel, or its lock is held
    /// outside the controller.
    #[error("Receiver is busy (requested channel: {requested})")]
    ResourceBusy {
        active: Option<String>,
        requested: String,
    },

    /// The device refused to tune (unusable device or unknown channel).
    #[error("Device rejected channel {0}")]
    TuneRejected(String),

    /// No service with the requested name showed up before the discovery
    /// timeout.
    #[error("Program {program} is not part of channel {channel}")]
    ProgramNotFound { channel: String, program: String },

    /// The engine refused to deliver the resolved service.
    #[error("Subscription to program {program} ({service_id}) was rejected")]
    SubscribeRejected {
        program: String,
        service_id: ServiceId,
    },

    /// The channel was released (forced stop) while the request was waiting
    /// for its program.
    #[error("Channel {0} was released while waiting for the program")]
    ChannelReleased(String),

    /// The caller aborted the request during program discovery.
    #[error("Subscription request cancelled")]
    Cancelled,

    /// The downstream consumer disappeared during program discovery.
    #[error("Connection lost while waiting for the program")]
    ConnectionLost,
}

impl SubscribeError {
    /// Returns true for failures that are reported as a declined subscription
    /// rather than propagated as an abort.
    pub fn is_declined(&self) -> bool {
        !matches!(self, SubscribeError::Cancelled | SubscribeError::ConnectionLost)
    }
}

/// Errors raised while acquiring the receiver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The decoding engine is not available in this build.
    #[error("Decoding engine unavailable: {0}")]
    Unavailable(String),

    /// No physical or virtual receiver could be opened.
    #[error("Failed to open receiver {device}: {reason}")]
    OpenFailed { device: String, reason: String },
}
