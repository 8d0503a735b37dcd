//! Audio - Mikrofon Capture und Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Ein cpal `Stream` ist nicht
//! `Send`, daher lebt jeder Stream auf einem eigenen Thread und wird über
//! einen Stop-Kanal beendet. Nach außen bleibt nur ein [`PcmBuffer`].

use super::media::DeviceHandle;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use thiserror::Error;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// PCM BUFFER
// ============================================================================

/// Ring-Buffer mit Mono-PCM @ 48kHz, geteilt zwischen Audio-Thread und Codec
#[derive(Clone)]
pub struct PcmBuffer {
    inner: Arc<Mutex<HeapRb<f32>>>,
}

impl PcmBuffer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
        }
    }

    /// Schreibt Samples, bei vollem Buffer wird verworfen
    pub fn push(&self, samples: &[f32]) {
        let mut buffer = self.inner.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    pub fn pop(&self) -> Option<f32> {
        self.inner.lock().try_pop()
    }

    /// Liest einen 20ms Frame, falls genug Samples vorhanden sind
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.inner.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PcmBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PcmBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcmBuffer")
            .field("buffered", &self.len())
            .finish()
    }
}

// ============================================================================
// STREAM THREAD
// ============================================================================

/// Thread, der einen cpal Stream besitzt, bis er gestoppt wird
struct StreamThread {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    fn spawn<F>(name: &str, build: F) -> Result<Self, AudioError>
    where
        F: FnOnce() -> Result<Stream, AudioError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), AudioError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::StreamPlayError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Blockiert bis stop() oder der Sender gedroppt wird
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop_tx, handle }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::StreamBuildError(
                    "audio thread exited during startup".to_string(),
                ))
            }
        }
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::error!("Audio thread panicked");
        }
    }
}

// ============================================================================
// CAPTURE
// ============================================================================

/// Laufende Mikrofon-Aufnahme
pub struct AudioCapture {
    thread: Option<StreamThread>,
}

impl AudioCapture {
    /// Startet die Aufnahme in `buffer`, solange `enabled` gesetzt ist
    pub fn start(enabled: Arc<AtomicBool>, buffer: PcmBuffer) -> Result<Self, AudioError> {
        let thread = StreamThread::spawn("pulse-audio-capture", move || {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or(AudioError::NoInputDevice)?;
            let config = find_best_input_config(&device)?;

            tracing::info!(
                "Starting audio capture: {} Hz, {} channels",
                config.sample_rate.0,
                config.channels
            );

            let source_sample_rate = config.sample_rate.0;
            let channels = usize::from(config.channels.max(1));

            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !enabled.load(Ordering::Relaxed) {
                            return;
                        }

                        let mono = downmix(data, channels);
                        buffer.push(&resample(&mono, source_sample_rate, SAMPLE_RATE));
                    },
                    |err| {
                        tracing::error!("Audio capture error: {}", err);
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))
        })?;

        Ok(Self {
            thread: Some(thread),
        })
    }
}

impl DeviceHandle for AudioCapture {
    fn release(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.stop();
            tracing::info!("Audio capture stopped");
        }
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// PLAYBACK
// ============================================================================

/// Laufende Wiedergabe aus einem [`PcmBuffer`]
pub struct AudioPlayback {
    thread: Option<StreamThread>,
}

impl AudioPlayback {
    pub fn start(buffer: PcmBuffer) -> Result<Self, AudioError> {
        let thread = StreamThread::spawn("pulse-audio-playback", move || {
            let host = cpal::default_host();
            let device = host
                .default_output_device()
                .ok_or(AudioError::NoOutputDevice)?;
            let config = find_best_output_config(&device)?;

            tracing::info!(
                "Starting audio playback: {} Hz, {} channels",
                config.sample_rate.0,
                config.channels
            );

            let ratio = SAMPLE_RATE as f32 / config.sample_rate.0 as f32;
            let channels = usize::from(config.channels.max(1));
            let mut position = 0.0f32;
            let mut current = 0.0f32;

            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        for frame in data.chunks_mut(channels) {
                            // Quell-Samples im 48kHz Takt konsumieren
                            position += ratio;
                            while position >= 1.0 {
                                current = buffer.pop().unwrap_or(0.0);
                                position -= 1.0;
                            }
                            // Auf alle Kanäle verteilen
                            for sample in frame.iter_mut() {
                                *sample = current;
                            }
                        }
                    },
                    |err| {
                        tracing::error!("Audio playback error: {}", err);
                    },
                    None,
                )
                .map_err(|e| AudioError::StreamBuildError(e.to_string()))
        })?;

        Ok(Self {
            thread: Some(thread),
        })
    }
}

impl DeviceHandle for AudioPlayback {
    fn release(&mut self) {
        if let Some(thread) = self.thread.take() {
            thread.stop();
            tracing::info!("Audio playback stopped");
        }
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.release();
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Einfaches Linear-Resampling
/// Mittelt interleavte Frames auf einen Kanal
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    data.chunks(channels.max(1))
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

fn resample(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return data.to_vec();
    }
    let ratio = target_rate as f32 / source_rate as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: F32 mit 48kHz > F32 mit anderer Rate. Andere Formate werden
/// nicht akzeptiert, da die Callbacks f32 erwarten.
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    // Versuche exakt 48kHz zu finden
    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    // Fallback auf höchste verfügbare Rate
    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 audio configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_frame_requires_full_frame() {
        let buffer = PcmBuffer::new();
        buffer.push(&vec![0.1; FRAME_SIZE - 1]);
        assert!(buffer.read_frame().is_none());

        buffer.push(&[0.2]);
        let frame = buffer.read_frame().unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_full_buffer_drops_samples() {
        let buffer = PcmBuffer::new();
        buffer.push(&vec![0.0; RING_BUFFER_SIZE + 100]);
        assert_eq!(buffer.len(), RING_BUFFER_SIZE);
    }

    #[test]
    fn test_buffer_clones_share_storage() {
        let buffer = PcmBuffer::new();
        let writer = buffer.clone();
        writer.push(&[0.5, 0.25]);
        assert_eq!(buffer.pop(), Some(0.5));
        assert_eq!(buffer.pop(), Some(0.25));
        assert_eq!(buffer.pop(), None);
    }

    #[test]
    fn test_downmix_stereo_to_mono() {
        let stereo = [0.5, -0.5, 1.0, 0.0, 0.25, 0.25];
        assert_eq!(downmix(&stereo, 2), vec![0.0, 0.5, 0.25]);
        assert_eq!(downmix(&[0.1, 0.2], 1), vec![0.1, 0.2]);
    }

    #[test]
    fn test_downmix_keeps_partial_trailing_frame() {
        assert_eq!(downmix(&[1.0, 1.0, 0.5], 2), vec![1.0, 0.5]);
        assert!(downmix(&[], 2).is_empty());
    }

    #[test]
    fn test_resample_44100_to_48000() {
        let input = vec![0.5; 441];
        let output = resample(&input, 44100, SAMPLE_RATE);
        assert_eq!(output.len(), 480);
        assert!(output.iter().all(|s| (s - 0.5).abs() < f32::EPSILON));
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let input = vec![0.1, 0.2, 0.3];
        assert_eq!(resample(&input, SAMPLE_RATE, SAMPLE_RATE), input);
    }

    #[test]
    fn test_select_best_config_prefers_48k_f32() {
        let configs = vec![
            SupportedStreamConfigRange::new(
                2,
                cpal::SampleRate(8000),
                cpal::SampleRate(44100),
                cpal::SupportedBufferSize::Unknown,
                SampleFormat::F32,
            ),
            SupportedStreamConfigRange::new(
                1,
                cpal::SampleRate(8000),
                cpal::SampleRate(96000),
                cpal::SupportedBufferSize::Unknown,
                SampleFormat::F32,
            ),
        ];
        let config = select_best_config(configs).unwrap();
        assert_eq!(config.sample_rate.0, SAMPLE_RATE);
        assert_eq!(config.channels, 1);
    }

    #[test]
    fn test_select_best_config_rejects_integer_formats() {
        let configs = vec![SupportedStreamConfigRange::new(
            1,
            cpal::SampleRate(48000),
            cpal::SampleRate(48000),
            cpal::SupportedBufferSize::Unknown,
            SampleFormat::I16,
        )];
        assert!(select_best_config(configs).is_err());
    }
}
