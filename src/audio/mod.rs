//! Audio subsystem module

pub mod capture;
pub mod device;
pub mod playback;

pub use capture::{CaptureControl, CaptureStream, FrameSink};
pub use device::{default_input_device, default_output_device, list_devices, AudioDeviceInfo};
pub use playback::{CpalSink, OutputSink, PlaybackScheduler, SourceId};

use crate::error::AudioError;

/// Device acquisition seam between the session manager and the hardware.
///
/// The production backend is [`CpalBackend`]; tests substitute doubles so
/// the session state machine runs without any audio device.
pub trait AudioBackend: Send + Sync {
    /// Acquire the output device and return a live sink.
    fn open_sink(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError>;

    /// Acquire the input device and start delivering frames to `sink`.
    fn start_capture(
        &self,
        sample_rate: u32,
        frame_samples: usize,
        sink: Box<dyn FrameSink>,
    ) -> Result<Box<dyn CaptureControl>, AudioError>;
}

/// Production backend using the default cpal host.
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_sink(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError> {
        Ok(Box::new(CpalSink::open(sample_rate)?))
    }

    fn start_capture(
        &self,
        sample_rate: u32,
        frame_samples: usize,
        sink: Box<dyn FrameSink>,
    ) -> Result<Box<dyn CaptureControl>, AudioError> {
        let mut capture = CaptureStream::new(sample_rate, frame_samples)?;
        capture.start(sink)?;
        Ok(Box::new(capture))
    }
}
