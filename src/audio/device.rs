//! Audio device lookup

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::AudioError;

/// Get the default input device
pub fn default_input_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()))
}

/// Get the default output device
pub fn default_output_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceNotFound("No default output device".to_string()))
}

/// Device name for logging, tolerating backends that cannot report one
pub fn device_name(device: &cpal::Device) -> String {
    device.name().unwrap_or_else(|_| "Unknown".to_string())
}
