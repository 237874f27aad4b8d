//! Audio device acquisition and enumeration

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Summary of one audio device, for startup listings and diagnostics.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
}

/// List all available audio devices on the default host.
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(inputs) = host.input_devices() {
        for device in inputs {
            if let Ok(name) = device.name() {
                let is_default = default_input_name.as_ref() == Some(&name);
                devices.push(AudioDeviceInfo {
                    name,
                    is_input: true,
                    is_output: false,
                    is_default,
                });
            }
        }
    }

    if let Ok(outputs) = host.output_devices() {
        for device in outputs {
            if let Ok(name) = device.name() {
                let is_default = default_output_name.as_ref() == Some(&name);
                if let Some(existing) = devices.iter_mut().find(|d| d.name == name) {
                    existing.is_output = true;
                    existing.is_default = existing.is_default || is_default;
                } else {
                    devices.push(AudioDeviceInfo {
                        name,
                        is_input: false,
                        is_output: true,
                        is_default,
                    });
                }
            }
        }
    }

    devices
}

/// Default input device, or [`AudioError::InputUnavailable`] when the host
/// has none (no microphone, or permission denied at the platform layer).
pub fn default_input_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::InputUnavailable("no default input device".to_string()))
}

/// Default output device, or [`AudioError::OutputUnavailable`].
pub fn default_output_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::OutputUnavailable("no default output device".to_string()))
}
