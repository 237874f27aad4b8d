//! Microphone capture pipeline
//!
//! Pulls fixed-size frames of mono audio at the capture rate, converts
//! each to PCM16 and hands it to a [`FrameSink`] — the session manager's
//! send operation. The cpal stream runs on a dedicated thread for low
//! latency: an `Arc<AtomicBool>` running flag and a keep-alive loop that
//! drops the stream on the way out.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::default_input_device;
use crate::constants::STREAM_START_TIMEOUT_SECS;
use crate::error::{AudioError, TransportError};
use crate::pcm;
use crate::transport::wire::TransportEnvelope;

/// Best-effort frame delivery.
///
/// `deliver` must never block. An error means the frame was dropped —
/// at-most-once, no retry, no buffering across drops. Callers are free to
/// ignore the result; the capture callback logs it at debug level.
pub trait FrameSink: Send + 'static {
    fn deliver(&self, envelope: TransportEnvelope) -> Result<(), TransportError>;
}

/// Teardown seam the session manager holds for the capture pipeline.
pub trait CaptureControl: Send {
    fn stop(&mut self);
}

/// Regroups arbitrary-size device buffers into exact fixed-size frames.
pub struct FrameAccumulator {
    pending: Vec<f32>,
    frame_len: usize,
}

impl FrameAccumulator {
    pub fn new(frame_len: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_len * 2),
            frame_len,
        }
    }

    /// Append samples and drain every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            frames.push(self.pending.drain(..self.frame_len).collect());
        }
        frames
    }

    /// Samples held back waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved multi-channel samples down to mono.
pub fn downmix_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let channels = channels as usize;
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Capture stream for the session's input device.
pub struct CaptureStream {
    sample_rate: u32,
    frame_len: usize,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Option<Receiver<AudioError>>,
    frames_produced: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
}

impl CaptureStream {
    /// Validate that an input device is available and prepare the stream.
    ///
    /// The device is re-acquired on the stream thread at [`start`]; a
    /// missing device here is the fatal, pre-session failure of the
    /// device-unavailable class.
    ///
    /// [`start`]: CaptureStream::start
    pub fn new(sample_rate: u32, frame_len: usize) -> Result<Self, AudioError> {
        let device = default_input_device()?;
        device
            .default_input_config()
            .map_err(|e| AudioError::InputUnavailable(e.to_string()))?;

        Ok(Self {
            sample_rate,
            frame_len,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            error_rx: None,
            frames_produced: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Start capturing, delivering one envelope per complete frame.
    ///
    /// Blocks until the stream thread reports that the hardware stream is
    /// live, so stream-open failures surface here instead of on first
    /// frame.
    pub fn start(&mut self, sink: Box<dyn FrameSink>) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        let device = default_input_device()?;
        let native = device
            .default_input_config()
            .map_err(|e| AudioError::InputUnavailable(e.to_string()))?;
        let channels = native.channels();
        let config = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (error_tx, error_rx) = bounded::<AudioError>(16);
        self.error_rx = Some(error_rx);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let frames_produced = self.frames_produced.clone();
        let frames_dropped = self.frames_dropped.clone();
        let frame_len = self.frame_len;

        self.frames_produced.store(0, Ordering::SeqCst);
        self.frames_dropped.store(0, Ordering::SeqCst);
        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let mut accumulator = FrameAccumulator::new(frame_len);

                let stream = device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Relaxed) {
                            return;
                        }

                        let mono = downmix_mono(data, channels);
                        for frame in accumulator.push(&mono) {
                            let chunk = pcm::samples_to_pcm16(&frame);
                            let envelope = TransportEnvelope::outbound(&chunk);
                            match sink.deliver(envelope) {
                                Ok(()) => {
                                    frames_produced.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    frames_dropped.fetch_add(1, Ordering::Relaxed);
                                    tracing::debug!("dropping capture frame: {e}");
                                }
                            }
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ =
                                ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                            return;
                        }
                        let _ = ready_tx.send(Ok(()));

                        // Keep thread alive while running
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }

                        // Stream is dropped here, releasing the device
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        self.thread_handle = Some(handle);

        match ready_rx.recv_timeout(Duration::from_secs(STREAM_START_TIMEOUT_SECS)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stop();
                Err(e)
            }
            Err(_) => {
                self.stop();
                Err(AudioError::StreamError(
                    "timed out waiting for capture stream".to_string(),
                ))
            }
        }
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Frames delivered to the sink so far
    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::Relaxed)
    }

    /// Frames dropped because the sink was not ready
    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    /// Check for asynchronous stream errors
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }
}

impl CaptureControl for CaptureStream {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_holds_partial_frames() {
        let mut acc = FrameAccumulator::new(4);

        assert!(acc.push(&[0.1, 0.2]).is_empty());
        assert_eq!(acc.pending_len(), 2);

        let frames = acc.push(&[0.3, 0.4, 0.5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(acc.pending_len(), 1);
    }

    #[test]
    fn accumulator_drains_multiple_frames_at_once() {
        let mut acc = FrameAccumulator::new(2);
        let frames = acc.push(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![1.0, 2.0]);
        assert_eq!(frames[1], vec![3.0, 4.0]);
        assert_eq!(acc.pending_len(), 1);
    }

    #[test]
    fn accumulator_exact_boundary_leaves_nothing_pending() {
        let mut acc = FrameAccumulator::new(3);
        let frames = acc.push(&[1.0, 2.0, 3.0]);

        assert_eq!(frames.len(), 1);
        assert_eq!(acc.pending_len(), 0);
    }

    #[test]
    fn downmix_averages_channel_pairs() {
        let mono = downmix_mono(&[0.5, -0.5, 1.0, 0.0], 2);
        assert_eq!(mono, vec![0.0, 0.5]);
    }

    #[test]
    fn downmix_passes_mono_through() {
        let mono = downmix_mono(&[0.1, 0.2, 0.3], 1);
        assert_eq!(mono, vec![0.1, 0.2, 0.3]);
    }
}
