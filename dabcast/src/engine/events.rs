//! Callback surfaces of the decoding engine.
//!
//! Both handler traits have empty default methods so a target only overrides
//! what it cares about. The matching event enums are what travels through a
//! [`CallbackForwarder`]; each forwarder type implements the handler trait
//! itself, so it can be handed to the engine in place of the real target.

use bytes::Bytes;

use dabcast_types::{AudioFrame, MotObject, ServiceId};

use crate::radio::forwarder::{CallbackForwarder, Deliver};

/// Device-level callbacks: signal state and ensemble discovery.
pub trait ChannelEventHandler: Send + Sync {
    fn on_snr(&self, _snr: f32) {}
    fn on_frequency_corrector_change(&self, _fine: i32, _coarse: i32) {}
    fn on_sync_change(&self, _is_sync: bool) {}
    fn on_signal_presence(&self, _is_signal: bool) {}
    fn on_service_detected(&self, _service_id: ServiceId) {}
    fn on_new_ensemble(&self, _ensemble_id: u16) {}
    fn on_set_ensemble_label(&self, _label: String) {}
    fn on_datetime_update(&self, _timestamp: i64) {}
    fn on_fib_decode_success(&self, _crc_check_ok: bool, _fib: u32) {}
    fn on_message(&self, _text: String, _text2: String, _is_error: bool) {}
}

/// Per-program callbacks: decoded content and decoder health.
pub trait ProgramEventHandler: Send + Sync {
    fn on_frame_errors(&self, _frame_errors: u32) {}
    fn on_new_audio(&self, _audio: Bytes, _sample_rate: u32, _mode: String) {}
    fn on_rs_errors(&self, _uncorrected: u32, _corrected: u32) {}
    fn on_aac_errors(&self, _aac_errors: u32) {}
    fn on_new_dynamic_label(&self, _label: String) {}
    fn on_mot(&self, _data: Bytes, _mime_type: String, _name: String) {}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Snr(f32),
    FrequencyCorrectorChange { fine: i32, coarse: i32 },
    SyncChange(bool),
    SignalPresence(bool),
    ServiceDetected(ServiceId),
    NewEnsemble(u16),
    EnsembleLabel(String),
    DatetimeUpdate(i64),
    FibDecodeSuccess { crc_check_ok: bool, fib: u32 },
    Message { text: String, text2: String, is_error: bool },
}

impl Deliver<dyn ChannelEventHandler> for ChannelEvent {
    fn deliver(self, target: &dyn ChannelEventHandler) {
        match self {
            ChannelEvent::Snr(snr) => target.on_snr(snr),
            ChannelEvent::FrequencyCorrectorChange { fine, coarse } => {
                target.on_frequency_corrector_change(fine, coarse)
            }
            ChannelEvent::SyncChange(is_sync) => target.on_sync_change(is_sync),
            ChannelEvent::SignalPresence(is_signal) => target.on_signal_presence(is_signal),
            ChannelEvent::ServiceDetected(service_id) => target.on_service_detected(service_id),
            ChannelEvent::NewEnsemble(id) => target.on_new_ensemble(id),
            ChannelEvent::EnsembleLabel(label) => target.on_set_ensemble_label(label),
            ChannelEvent::DatetimeUpdate(ts) => target.on_datetime_update(ts),
            ChannelEvent::FibDecodeSuccess { crc_check_ok, fib } => {
                target.on_fib_decode_success(crc_check_ok, fib)
            }
            ChannelEvent::Message {
                text,
                text2,
                is_error,
            } => target.on_message(text, text2, is_error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgramEvent {
    FrameErrors(u32),
    NewAudio(AudioFrame),
    RsErrors { uncorrected: u32, corrected: u32 },
    AacErrors(u32),
    DynamicLabel(String),
    Mot(MotObject),
}

impl Deliver<dyn ProgramEventHandler> for ProgramEvent {
    fn deliver(self, target: &dyn ProgramEventHandler) {
        match self {
            ProgramEvent::FrameErrors(n) => target.on_frame_errors(n),
            ProgramEvent::NewAudio(frame) => {
                target.on_new_audio(frame.data, frame.sample_rate, frame.mode)
            }
            ProgramEvent::RsErrors {
                uncorrected,
                corrected,
            } => target.on_rs_errors(uncorrected, corrected),
            ProgramEvent::AacErrors(n) => target.on_aac_errors(n),
            ProgramEvent::DynamicLabel(label) => target.on_new_dynamic_label(label),
            ProgramEvent::Mot(object) => target.on_mot(object.data, object.mime_type, object.name),
        }
    }
}

/// Forwarder registered with the engine for device-level events.
pub type ChannelForwarder = CallbackForwarder<dyn ChannelEventHandler, ChannelEvent>;

/// Forwarder registered with the engine for one subscribed program.
pub type ProgramForwarder = CallbackForwarder<dyn ProgramEventHandler, ProgramEvent>;

impl ChannelEventHandler for ChannelForwarder {
    fn on_snr(&self, snr: f32) {
        self.forward(ChannelEvent::Snr(snr));
    }

    fn on_frequency_corrector_change(&self, fine: i32, coarse: i32) {
        self.forward(ChannelEvent::FrequencyCorrectorChange { fine, coarse });
    }

    fn on_sync_change(&self, is_sync: bool) {
        self.forward(ChannelEvent::SyncChange(is_sync));
    }

    fn on_signal_presence(&self, is_signal: bool) {
        self.forward(ChannelEvent::SignalPresence(is_signal));
    }

    fn on_service_detected(&self, service_id: ServiceId) {
        self.forward(ChannelEvent::ServiceDetected(service_id));
    }

    fn on_new_ensemble(&self, ensemble_id: u16) {
        self.forward(ChannelEvent::NewEnsemble(ensemble_id));
    }

    fn on_set_ensemble_label(&self, label: String) {
        self.forward(ChannelEvent::EnsembleLabel(label));
    }

    fn on_datetime_update(&self, timestamp: i64) {
        self.forward(ChannelEvent::DatetimeUpdate(timestamp));
    }

    fn on_fib_decode_success(&self, crc_check_ok: bool, fib: u32) {
        self.forward(ChannelEvent::FibDecodeSuccess { crc_check_ok, fib });
    }

    fn on_message(&self, text: String, text2: String, is_error: bool) {
        self.forward(ChannelEvent::Message {
            text,
            text2,
            is_error,
        });
    }
}

impl ProgramEventHandler for ProgramForwarder {
    fn on_frame_errors(&self, frame_errors: u32) {
        self.forward(ProgramEvent::FrameErrors(frame_errors));
    }

    fn on_new_audio(&self, audio: Bytes, sample_rate: u32, mode: String) {
        self.forward(ProgramEvent::NewAudio(AudioFrame {
            data: audio,
            sample_rate,
            mode,
        }));
    }

    fn on_rs_errors(&self, uncorrected: u32, corrected: u32) {
        self.forward(ProgramEvent::RsErrors {
            uncorrected,
            corrected,
        });
    }

    fn on_aac_errors(&self, aac_errors: u32) {
        self.forward(ProgramEvent::AacErrors(aac_errors));
    }

    fn on_new_dynamic_label(&self, label: String) {
        self.forward(ProgramEvent::DynamicLabel(label));
    }

    fn on_mot(&self, data: Bytes, mime_type: String, name: String) {
        self.forward(ProgramEvent::Mot(MotObject {
            data,
            mime_type,
            name,
        }));
    }
}
