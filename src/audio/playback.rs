//! Gap-free playback scheduling
//!
//! [`PlaybackScheduler`] receives decoded PCM16 chunks from the transport
//! and schedules them back-to-back on an [`OutputSink`] so they play with
//! no gaps and no overlaps, in arrival order. Arrival order is trusted as
//! playback order; there are no sequence numbers. `interrupt()` silences
//! everything immediately for barge-in.
//!
//! [`CpalSink`] is the production sink: a mixer shared with the cpal
//! output callback holds scheduled sources addressed in absolute output
//! frames, and an atomic frame counter advanced by the callback is the
//! output clock.

use crossbeam::queue::ArrayQueue;
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;

use crate::audio::device::default_output_device;
use crate::constants::{FINISHED_QUEUE_CAPACITY, STREAM_START_TIMEOUT_SECS};
use crate::error::{AudioError, Error};
use crate::pcm;

/// Identifier for one scheduled playback unit.
pub type SourceId = u64;

/// Shared output sink: a monotonic clock plus source scheduling.
///
/// Only the playback scheduler creates or stops sources on it.
pub trait OutputSink: Send {
    /// Current position of the output clock, in seconds.
    fn clock_now(&self) -> f64;

    /// Schedule mono samples to start playing at `start_at` on the clock.
    fn start_source(&mut self, samples: Vec<f32>, start_at: f64) -> Result<SourceId, AudioError>;

    /// Stop one source immediately, whether or not it started sounding.
    fn stop_source(&mut self, id: SourceId);

    /// Sources that completed naturally since the last call.
    fn drain_finished(&mut self) -> Vec<SourceId>;

    /// Release the underlying output device.
    fn close(&mut self);
}

/// Schedules inbound chunks contiguously on the output clock.
pub struct PlaybackScheduler {
    sink: Box<dyn OutputSink>,
    sample_rate: u32,
    /// Where the next chunk must start; 0.0 means re-anchor to the clock.
    next_start: f64,
    active: Vec<SourceId>,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn OutputSink>, sample_rate: u32) -> Self {
        Self {
            sink,
            sample_rate,
            next_start: 0.0,
            active: Vec::new(),
        }
    }

    /// Decode one PCM16 chunk and schedule it directly after the previous
    /// one.
    ///
    /// `start_at = max(next_start, clock_now())`: a chunk never starts
    /// before the clock's current position even when scheduling lags, and
    /// never before the previous chunk's end.
    pub fn enqueue(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let mut channels = pcm::pcm16_to_samples(chunk, 1)?;
        let samples = channels.pop().unwrap_or_default();
        if samples.is_empty() {
            return Ok(());
        }

        self.reap_finished();

        let now = self.sink.clock_now();
        let start_at = if self.next_start > now {
            self.next_start
        } else {
            now
        };
        let duration = samples.len() as f64 / self.sample_rate as f64;

        let id = self.sink.start_source(samples, start_at)?;
        self.active.push(id);
        self.next_start = start_at + duration;

        Ok(())
    }

    /// Barge-in: stop every active source and forget the cursor so the
    /// next chunk re-anchors to the live clock.
    pub fn interrupt(&mut self) {
        for id in self.active.drain(..) {
            self.sink.stop_source(id);
        }
        self.next_start = 0.0;
    }

    /// [`interrupt`](PlaybackScheduler::interrupt) plus releasing the sink.
    pub fn teardown(&mut self) {
        self.interrupt();
        self.sink.close();
    }

    /// Number of sources currently scheduled or sounding.
    pub fn active_sources(&mut self) -> usize {
        self.reap_finished();
        self.active.len()
    }

    /// The clock position the next chunk will not start before.
    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    fn reap_finished(&mut self) {
        let finished = self.sink.drain_finished();
        if !finished.is_empty() {
            self.active.retain(|id| !finished.contains(id));
        }
    }
}

/// One scheduled span of samples inside the mixer.
struct MixSource {
    id: SourceId,
    samples: Vec<f32>,
    start_frame: u64,
    cursor: usize,
}

/// State shared between the scheduler thread and the output callback.
struct Mixer {
    /// Output clock: frames rendered since the stream started.
    frames_elapsed: AtomicU64,
    sources: Mutex<Vec<MixSource>>,
    finished: ArrayQueue<SourceId>,
}

impl Mixer {
    fn new() -> Self {
        Self {
            frames_elapsed: AtomicU64::new(0),
            sources: Mutex::new(Vec::new()),
            finished: ArrayQueue::new(FINISHED_QUEUE_CAPACITY),
        }
    }

    /// Render one output buffer of `channel_count`-interleaved frames.
    fn render(&self, out: &mut [f32], channel_count: usize) {
        let frame_count = out.len() / channel_count;
        let base = self.frames_elapsed.load(Ordering::Relaxed);
        out.fill(0.0);

        let mut sources = self.sources.lock();
        for source in sources.iter_mut() {
            let end = source.start_frame + source.samples.len() as u64;
            if end <= base {
                // Scheduled entirely in the past; retire without sounding
                source.cursor = source.samples.len();
                continue;
            }

            let begin = source.start_frame.max(base);
            let span_end = end.min(base + frame_count as u64);
            if begin >= span_end {
                continue;
            }

            let src_off = (begin - source.start_frame) as usize;
            let out_off = (begin - base) as usize;
            let len = (span_end - begin) as usize;

            for i in 0..len {
                let value = source.samples[src_off + i];
                let frame_start = (out_off + i) * channel_count;
                for sample in &mut out[frame_start..frame_start + channel_count] {
                    *sample += value;
                }
            }
            source.cursor = src_off + len;
        }

        sources.retain(|source| {
            if source.cursor >= source.samples.len() {
                let _ = self.finished.push(source.id);
                false
            } else {
                true
            }
        });
        drop(sources);

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.frames_elapsed
            .fetch_add(frame_count as u64, Ordering::Relaxed);
    }
}

/// Output sink backed by a cpal stream on a dedicated thread.
pub struct CpalSink {
    mixer: Arc<Mixer>,
    sample_rate: u32,
    next_id: SourceId,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalSink {
    /// Acquire the default output device and bring the stream up.
    ///
    /// Blocks until the stream thread reports success or failure, so
    /// device problems surface here, before the session opens.
    pub fn open(sample_rate: u32) -> Result<Self, AudioError> {
        let device = default_output_device()?;
        let native = device
            .default_output_config()
            .map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;
        let channel_count = native.channels() as usize;
        let config = StreamConfig {
            channels: native.channels(),
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let mixer = Arc::new(Mixer::new());
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let mixer_for_thread = mixer.clone();
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let stream = device.build_output_stream(
                    &config,
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        mixer_for_thread.render(out, channel_count);
                    },
                    move |err| {
                        tracing::error!("playback stream error: {err}");
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
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

        let mut sink = Self {
            mixer,
            sample_rate,
            next_id: 0,
            running,
            thread_handle: Some(handle),
        };

        match ready_rx.recv_timeout(Duration::from_secs(STREAM_START_TIMEOUT_SECS)) {
            Ok(Ok(())) => Ok(sink),
            Ok(Err(e)) => {
                sink.close();
                Err(e)
            }
            Err(_) => {
                sink.close();
                Err(AudioError::StreamError(
                    "timed out waiting for playback stream".to_string(),
                ))
            }
        }
    }
}

impl OutputSink for CpalSink {
    fn clock_now(&self) -> f64 {
        self.mixer.frames_elapsed.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn start_source(&mut self, samples: Vec<f32>, start_at: f64) -> Result<SourceId, AudioError> {
        self.next_id += 1;
        let id = self.next_id;
        let start_frame = (start_at * self.sample_rate as f64).round() as u64;

        self.mixer.sources.lock().push(MixSource {
            id,
            samples,
            start_frame,
            cursor: 0,
        });
        Ok(id)
    }

    fn stop_source(&mut self, id: SourceId) {
        self.mixer.sources.lock().retain(|source| source.id != id);
    }

    fn drain_finished(&mut self) -> Vec<SourceId> {
        let mut finished = Vec::new();
        while let Some(id) = self.mixer.finished.pop() {
            finished.push(id);
        }
        finished
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.mixer.sources.lock().clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}
