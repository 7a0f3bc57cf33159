//! Audio device enumeration.

use serde::{Deserialize, Serialize};

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
}

/// List all available audio capture devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    match host.input_devices() {
        Ok(devices) => collect(devices, default_name, "Input Device"),
        Err(e) => {
            tracing::warn!("failed to enumerate input devices: {e}");
            default_only(host.default_input_device(), "Default Input Device")
        }
    }
}

/// List all available audio playback devices on the system.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    match host.output_devices() {
        Ok(devices) => collect(devices, default_name, "Output Device"),
        Err(e) => {
            tracing::warn!("failed to enumerate output devices: {e}");
            default_only(host.default_output_device(), "Default Output Device")
        }
    }
}

#[cfg(feature = "audio-cpal")]
fn collect(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: Option<String>,
    fallback_label: &str,
) -> Vec<DeviceInfo> {
    use cpal::traits::DeviceTrait;

    let mut list = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("{fallback_label} {}", idx + 1));
            let is_default = default_name.as_deref() == Some(name.as_str());
            DeviceInfo { name, is_default }
        })
        .collect::<Vec<_>>();

    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
    list
}

#[cfg(feature = "audio-cpal")]
fn default_only(device: Option<cpal::Device>, fallback_label: &str) -> Vec<DeviceInfo> {
    use cpal::traits::DeviceTrait;

    match device {
        Some(d) => vec![DeviceInfo {
            name: d.name().unwrap_or_else(|_| fallback_label.to_string()),
            is_default: true,
        }],
        None => vec![],
    }
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}
