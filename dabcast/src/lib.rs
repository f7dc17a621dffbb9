//! dabcast: shares one DAB+ receiver between many program listeners.
//!
//! The [`radio::RadioController`] tunes the receiver on demand, waits for the
//! requested program to be announced and hands out one
//! [`radio::ProgramHandler`] per program, reference-counted across
//! subscribers. Engine callbacks arrive on foreign threads and are relayed
//! into the tokio runtime by [`radio::CallbackForwarder`].

pub mod config;
pub mod engine;
pub mod logging;
pub mod radio;

pub use dabcast_types::{ServiceId, SubscribeError};
