//! Identifiers, decoded content and status snapshots.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Device name that lets the engine pick the first available receiver.
pub const DEFAULT_DEVICE_NAME: &str = "auto";

/// Gain value selecting automatic gain control.
pub const AUTO_GAIN: i32 = -1;

/// Identifier of one service (program) inside a DAB ensemble.
///
/// Service ids are only known after the receiver announced them, so they are
/// never configured up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub u32);

impl ServiceId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u32> for ServiceId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// One chunk of decoded PCM audio (interleaved signed 16-bit little endian).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub data: Bytes,
    pub sample_rate: u32,
    /// Audio mode reported by the decoder (e.g. "DAB+ stereo").
    pub mode: String,
}

/// A MOT object (slideshow picture) broadcast alongside a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotObject {
    pub data: Bytes,
    pub mime_type: String,
    pub name: String,
}

/// Accumulated decoder error counters of one program.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderErrors {
    pub frame_errors: u64,
    pub rs_uncorrected: u64,
    pub rs_corrected: u64,
    pub aac_errors: u64,
}

/// Latest signal indicators reported for the tuned channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalInfo {
    pub snr: Option<f32>,
    pub is_sync: bool,
    pub is_signal: bool,
    pub frequency_correction: Option<(i32, i32)>,
}

/// Snapshot of one discovered program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramStatus {
    pub service_id: ServiceId,
    pub name: Option<String>,
    pub subscribers: u32,
}

/// Snapshot of the tuned channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub ensemble_label: Option<String>,
    pub datetime: Option<DateTime<Local>>,
    /// True while the delayed channel reset is pending.
    pub draining: bool,
    pub signal: SignalInfo,
    pub programs: Vec<ProgramStatus>,
}

impl ChannelStatus {
    /// Number of programs that currently have at least one subscriber.
    pub fn active_programs(&self) -> usize {
        self.programs.iter().filter(|p| p.subscribers > 0).count()
    }
}
