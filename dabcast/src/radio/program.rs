//! Per-program sink shared by all subscribers of one service.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::{self, Stream};
use log::{debug, trace};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use dabcast_types::{AudioFrame, DecoderErrors, MotObject, ServiceId};

use crate::engine::ProgramEventHandler;

/// Capacity of the audio broadcast channel, in frames.
/// At 120 ms per frame this is a little under 8 seconds of audio.
const AUDIO_CAPACITY: usize = 64;

const WAV_CHANNELS: u16 = 2;
const WAV_BITS_PER_SAMPLE: u16 = 16;

/// Sink for the decoded content of one program.
///
/// The controller creates one handler per subscribed service and hands the
/// same `Arc` to every subscriber. Audio is fanned out through a broadcast
/// channel; metadata keeps only the latest value.
pub struct ProgramHandler {
    service_id: ServiceId,
    name: String,
    /// Number of logical subscribers. Only the controller changes it.
    subscribers: AtomicU32,
    /// Taken on release, which closes every receiver.
    audio_tx: Mutex<Option<broadcast::Sender<AudioFrame>>>,
    released: AtomicBool,
    frames_received: AtomicU64,
    format: Mutex<Option<(u32, String)>>,
    dynamic_label: Mutex<Option<String>>,
    mot: Mutex<Option<MotObject>>,
    errors: Mutex<DecoderErrors>,
}

impl ProgramHandler {
    pub fn new(service_id: ServiceId, name: impl Into<String>) -> Self {
        let (audio_tx, _) = broadcast::channel(AUDIO_CAPACITY);
        Self {
            service_id,
            name: name.into(),
            subscribers: AtomicU32::new(0),
            audio_tx: Mutex::new(Some(audio_tx)),
            released: AtomicBool::new(false),
            frames_received: AtomicU64::new(0),
            format: Mutex::new(None),
            dynamic_label: Mutex::new(None),
            mot: Mutex::new(None),
            errors: Mutex::new(DecoderErrors::default()),
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of logical subscribers.
    pub fn subscribers(&self) -> u32 {
        self.subscribers.load(Ordering::SeqCst)
    }

    pub(crate) fn add_subscriber(&self) -> u32 {
        self.subscribers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrement, saturating at zero. Returns the new count.
    pub(crate) fn remove_subscriber(&self) -> u32 {
        let prev = self
            .subscribers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub(crate) fn clear_subscribers(&self) {
        self.subscribers.store(0, Ordering::SeqCst);
    }

    /// Wake everyone waiting for content: pending and future waits observe
    /// that the handler is gone.
    pub fn release_waiters(&self) {
        self.released.store(true, Ordering::SeqCst);
        if self.audio_tx.lock().take().is_some() {
            debug!("[Program {}] Released waiters of {}", self.service_id, self.name);
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Receive every following audio frame. `None` once released.
    pub fn subscribe_audio(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.audio_tx.lock().as_ref().map(|tx| tx.subscribe())
    }

    /// Wait for the next audio frame. `None` once the handler is released.
    pub async fn next_audio(&self) -> Option<AudioFrame> {
        let mut rx = self.subscribe_audio()?;
        loop {
            match rx.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    trace!("[Program {}] Waiter lagged by {} frames", self.service_id, n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Audio frames as a stream. Frames missed by a slow consumer are
    /// skipped; the stream ends once the handler is released.
    pub fn audio_stream(&self) -> impl Stream<Item = AudioFrame> + Send + 'static {
        stream::unfold(self.subscribe_audio(), |rx| async move {
            let mut rx = rx?;
            loop {
                match rx.recv().await {
                    Ok(frame) => return Some((frame, Some(rx))),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Sample rate and mode of the last received frame.
    pub fn audio_format(&self) -> Option<(u32, String)> {
        self.format.lock().clone()
    }

    pub fn dynamic_label(&self) -> Option<String> {
        self.dynamic_label.lock().clone()
    }

    pub fn mot(&self) -> Option<MotObject> {
        self.mot.lock().clone()
    }

    pub fn decoder_errors(&self) -> DecoderErrors {
        *self.errors.lock()
    }

    /// Header for streaming the PCM output as an open-ended WAV file.
    /// `None` until the first frame revealed the sample rate.
    pub fn wav_header(&self) -> Option<Bytes> {
        let (sample_rate, _) = self.audio_format()?;
        Some(wav_header(sample_rate))
    }
}

/// 44-byte RIFF/WAVE header with unknown (maximal) length.
fn wav_header(sample_rate: u32) -> Bytes {
    let block_align = WAV_CHANNELS * WAV_BITS_PER_SAMPLE / 8;
    let byte_rate = sample_rate * block_align as u32;

    let mut buf = BytesMut::with_capacity(44);
    buf.put_slice(b"RIFF");
    buf.put_u32_le(u32::MAX);
    buf.put_slice(b"WAVE");
    buf.put_slice(b"fmt ");
    buf.put_u32_le(16);
    buf.put_u16_le(1); // PCM
    buf.put_u16_le(WAV_CHANNELS);
    buf.put_u32_le(sample_rate);
    buf.put_u32_le(byte_rate);
    buf.put_u16_le(block_align);
    buf.put_u16_le(WAV_BITS_PER_SAMPLE);
    buf.put_slice(b"data");
    buf.put_u32_le(u32::MAX - 36);
    buf.freeze()
}

impl ProgramEventHandler for ProgramHandler {
    fn on_frame_errors(&self, frame_errors: u32) {
        self.errors.lock().frame_errors += frame_errors as u64;
    }

    fn on_new_audio(&self, audio: Bytes, sample_rate: u32, mode: String) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        {
            let mut format = self.format.lock();
            if format.as_ref().map(|(rate, m)| *rate != sample_rate || *m != mode).unwrap_or(true) {
                debug!(
                    "[Program {}] Audio format: {} Hz, {}",
                    self.service_id, sample_rate, mode
                );
                *format = Some((sample_rate, mode.clone()));
            }
        }
        if let Some(tx) = self.audio_tx.lock().as_ref() {
            // No receivers is fine.
            let _ = tx.send(AudioFrame {
                data: audio,
                sample_rate,
                mode,
            });
        }
    }

    fn on_rs_errors(&self, uncorrected: u32, corrected: u32) {
        let mut errors = self.errors.lock();
        errors.rs_uncorrected += uncorrected as u64;
        errors.rs_corrected += corrected as u64;
    }

    fn on_aac_errors(&self, aac_errors: u32) {
        self.errors.lock().aac_errors += aac_errors as u64;
    }

    fn on_new_dynamic_label(&self, label: String) {
        trace!("[Program {}] DLS: {}", self.service_id, label);
        *self.dynamic_label.lock() = Some(label);
    }

    fn on_mot(&self, data: Bytes, mime_type: String, name: String) {
        debug!(
            "[Program {}] MOT {} ({}, {} bytes)",
            self.service_id,
            name,
            mime_type,
            data.len()
        );
        *self.mot.lock() = Some(MotObject {
            data,
            mime_type,
            name,
        });
    }
}

impl std::fmt::Debug for ProgramHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgramHandler")
            .field("service_id", &self.service_id)
            .field("name", &self.name)
            .field("subscribers", &self.subscribers())
            .field("released", &self.is_released())
            .finish()
    }
}
