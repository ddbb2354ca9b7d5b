//! Audio device enumeration, deduplication and input/output pairing

use super::capture::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, HostId};
use std::collections::HashSet;
use thiserror::Error;

/// Name fragments of aggregation pseudo-devices that duplicate real ones
const PSEUDO_DEVICE_MARKERS: [&str; 2] = ["mapper", "primary"];

/// Host APIs in order of preference (native low-latency first)
const HOST_API_PREFERENCE: [&str; 10] = [
    "ASIO",
    "WASAPI",
    "CoreAudio",
    "JACK",
    "PipeWire",
    "PulseAudio",
    "ALSA",
    "Windows WDM-KS",
    "Windows DirectSound",
    "MME",
];

/// Virtual cable naming patterns, most specific first
const VIRTUAL_CABLE_PATTERNS: [&str; 7] = [
    "CABLE Input",
    "VB-Audio Virtual",
    "VB-Audio",
    "VoiceMeeter Input",
    "VoiceMeeter",
    "BlackHole",
    "Virtual",
];

/// Name fragments of physical speakers and headphones
const PHYSICAL_OUTPUT_PATTERNS: [&str; 5] = ["speaker", "headphone", "headset", "realtek", "output"];

/// Device enumeration errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("No audio host available")]
    NoHost,

    #[error("Failed to enumerate devices: {0}")]
    EnumerationError(String),
}

/// What a device can do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapability {
    pub input: bool,
    pub output: bool,
}

impl DeviceCapability {
    pub const INPUT: Self = Self {
        input: true,
        output: false,
    };

    pub const OUTPUT: Self = Self {
        input: false,
        output: true,
    };
}

/// One device as seen by a single enumeration pass.
///
/// `index` is only meaningful for the enumeration that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Display name
    pub name: String,

    /// Input/output capability
    pub capability: DeviceCapability,

    /// Host API the device is exposed through
    pub host_api: String,

    /// Position in the enumeration across all hosts
    pub index: usize,
}

impl DeviceDescriptor {
    fn is_pseudo_device(&self) -> bool {
        let lower = self.name.to_lowercase();
        PSEUDO_DEVICE_MARKERS.iter().any(|m| lower.contains(m))
    }
}

/// Where the transmission output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRoute {
    /// A specific device sharing the input's host API
    Device(DeviceDescriptor),

    /// The default output of the input's host
    SystemDefault,
}

/// Rank of a host API, lower is better. Unknown APIs rank last.
pub fn host_api_rank(host_api: &str) -> usize {
    HOST_API_PREFERENCE
        .iter()
        .position(|api| api.eq_ignore_ascii_case(host_api))
        .unwrap_or(HOST_API_PREFERENCE.len())
}

/// Snapshot of every device from one enumeration pass
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceCatalog {
    /// Enumerate all devices on all available hosts.
    pub fn enumerate() -> Result<Self, SourceError> {
        let devices: Vec<DeviceDescriptor> = walk_devices()?
            .into_iter()
            .enumerate()
            .map(|(index, (host_id, device))| DeviceDescriptor {
                name: device.name().unwrap_or_else(|_| "Unknown".to_string()),
                capability: DeviceCapability {
                    input: device.default_input_config().is_ok(),
                    output: device.default_output_config().is_ok(),
                },
                host_api: host_id.name().to_string(),
                index,
            })
            .collect();

        log::info!("Enumerated {} audio devices", devices.len());
        Ok(Self { devices })
    }

    /// Build a catalog from already-known descriptors.
    pub fn from_descriptors(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }

    pub fn descriptor(&self, index: usize) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.index == index)
    }

    /// Input and output names offered to the user: pseudo-devices removed,
    /// one entry per display name.
    pub fn list_devices(&self) -> (Vec<String>, Vec<String>) {
        let inputs = self
            .preferred(|c| c.input)
            .into_iter()
            .map(|d| d.name.clone())
            .collect();
        let outputs = self
            .preferred(|c| c.output)
            .into_iter()
            .map(|d| d.name.clone())
            .collect();
        (inputs, outputs)
    }

    /// Index of the preferred input device with this display name.
    pub fn resolve_input_index(&self, name: &str) -> Option<usize> {
        self.preferred(|c| c.input)
            .into_iter()
            .find(|d| d.name == name)
            .map(|d| d.index)
    }

    /// Index of the preferred output device with this display name.
    pub fn resolve_output_index(&self, name: &str) -> Option<usize> {
        self.preferred(|c| c.output)
            .into_iter()
            .find(|d| d.name == name)
            .map(|d| d.index)
    }

    /// Pick an output sharing the input's host API.
    ///
    /// `previous` is tried first, then every other output in enumeration
    /// order. Falls back to the system default when nothing matches.
    pub fn resolve_output_for(&self, input_index: usize, previous: Option<&str>) -> OutputRoute {
        let Some(input) = self.descriptor(input_index) else {
            return OutputRoute::SystemDefault;
        };

        let outputs = self
            .devices
            .iter()
            .filter(|d| d.capability.output && d.index != input_index && !d.is_pseudo_device());

        let (preferred, others): (Vec<_>, Vec<_>) =
            outputs.partition(|d| previous.is_some_and(|p| d.name == p));

        preferred
            .into_iter()
            .chain(others)
            .find(|d| d.host_api == input.host_api)
            .cloned()
            .map(OutputRoute::Device)
            .unwrap_or(OutputRoute::SystemDefault)
    }

    /// Deduplicated view: for each display name, the entry whose host API
    /// ranks best. Order follows first appearance of each name.
    fn preferred(&self, filter: impl Fn(&DeviceCapability) -> bool) -> Vec<&DeviceDescriptor> {
        let mut result: Vec<&DeviceDescriptor> = Vec::new();
        let mut seen = HashSet::new();

        for device in self
            .devices
            .iter()
            .filter(|d| filter(&d.capability) && !d.is_pseudo_device())
        {
            if seen.insert(device.name.as_str()) {
                result.push(device);
                continue;
            }
            if let Some(existing) = result.iter_mut().find(|d| d.name == device.name) {
                if host_api_rank(&device.host_api) < host_api_rank(&existing.host_api) {
                    *existing = device;
                }
            }
        }

        result
    }
}

/// Default output choice from the names offered to the user.
///
/// Previous choice if still present, then a virtual cable, then a physical
/// speaker or headphone, then whatever comes first.
pub fn find_best_output(available: &[String], previous: Option<&str>) -> Option<String> {
    if let Some(previous) = previous {
        if available.iter().any(|name| name == previous) {
            return Some(previous.to_string());
        }
    }

    for pattern in VIRTUAL_CABLE_PATTERNS {
        let pattern = pattern.to_lowercase();
        if let Some(name) = available.iter().find(|n| n.to_lowercase().contains(&pattern)) {
            return Some(name.clone());
        }
    }

    available
        .iter()
        .find(|name| {
            let lower = name.to_lowercase();
            PHYSICAL_OUTPUT_PATTERNS.iter().any(|p| lower.contains(p))
        })
        .or_else(|| available.first())
        .cloned()
}

/// Every device on every available host, in enumeration order.
fn walk_devices() -> Result<Vec<(HostId, Device)>, SourceError> {
    let hosts = cpal::available_hosts();
    if hosts.is_empty() {
        return Err(SourceError::NoHost);
    }

    let per_host = hosts.into_iter().map(|host_id| {
        let devices = cpal::host_from_id(host_id)
            .map_err(|e| e.to_string())
            .and_then(|host| host.devices().map_err(|e| e.to_string()))
            .map(|iter| iter.map(|d| (host_id, d)).collect::<Vec<_>>());
        (host_id.name(), devices)
    });
    merge_host_devices(per_host)
}

/// Concatenate per-host device lists in host order.
///
/// A failing host is skipped with a warning; only when every host fails is
/// the enumeration itself an error.
fn merge_host_devices<T>(
    per_host: impl IntoIterator<Item = (&'static str, Result<Vec<T>, String>)>,
) -> Result<Vec<T>, SourceError> {
    let mut devices = Vec::new();
    let mut any_host = false;
    let mut last_error = None;

    for (host_name, result) in per_host {
        match result {
            Ok(found) => {
                any_host = true;
                devices.extend(found);
            }
            Err(e) => {
                log::warn!("Failed to enumerate {} devices: {}", host_name, e);
                last_error = Some(format!("{}: {}", host_name, e));
            }
        }
    }

    match last_error {
        Some(e) if !any_host => Err(SourceError::EnumerationError(e)),
        _ => Ok(devices),
    }
}

/// Re-enumerate and open the device a descriptor points at.
///
/// Fails with `DeviceUnavailable` if the device at that position no longer
/// carries the same name (unplugged or reordered since enumeration).
pub(crate) fn locate_device(descriptor: &DeviceDescriptor) -> Result<(HostId, Device), CaptureError> {
    let unavailable = || CaptureError::DeviceUnavailable(descriptor.name.clone());

    let (host_id, device) = walk_devices()
        .map_err(|_| unavailable())?
        .into_iter()
        .nth(descriptor.index)
        .ok_or_else(unavailable)?;

    let name_matches = device.name().map(|n| n == descriptor.name).unwrap_or(false);
    if !name_matches || host_id.name() != descriptor.host_api {
        return Err(unavailable());
    }
    Ok((host_id, device))
}

/// Default output device of a host.
pub(crate) fn default_output_of(host_id: HostId) -> Result<Device, CaptureError> {
    cpal::host_from_id(host_id)
        .ok()
        .and_then(|host| host.default_output_device())
        .ok_or_else(|| CaptureError::DeviceUnavailable("system default output".to_string()))
}
