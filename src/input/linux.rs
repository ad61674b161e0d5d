//! evdev/uinput backend
//!
//! Key components:
//! - evdev for raw input device enumeration, grabbing and reading
//! - uinput (through evdev) for the virtual replay device
//! - nix for switching device descriptors to non-blocking reads

use super::{AxisInfo, Capabilities, CaptureDevice, EventOutput, InputBackend, RedirectError};
use crate::key::RawEvent;
use evdev::uinput::VirtualDevice;
use evdev::{
    AbsInfo, AbsoluteAxisCode, AttributeSet, Device, EventType, KeyCode, MiscCode,
    RelativeAxisCode, SwitchCode, UinputAbsSetup,
};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Name the virtual replay device registers under
pub const VIRTUAL_DEVICE_NAME: &str = "couchgrab-uinput";

const UINPUT_PATH: &str = "/dev/uinput";

// ============================================================================
// Devices
// ============================================================================

/// An evdev device node opened for capture
pub struct EvdevDevice {
    path: PathBuf,
    name: String,
    device: Device,
    capabilities: Capabilities,
}

impl EvdevDevice {
    fn new(path: PathBuf, mut device: Device) -> io::Result<Self> {
        // Readiness is reported by poll(2); reads must never block after that
        device.set_nonblocking(true)?;
        Ok(Self {
            name: device.name().unwrap_or("unknown").to_string(),
            capabilities: read_capabilities(&device),
            path,
            device,
        })
    }
}

impl AsFd for EvdevDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

impl CaptureDevice for EvdevDevice {
    fn path(&self) -> &Path {
        &self.path
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn grab(&mut self) -> io::Result<()> {
        self.device.grab()
    }

    fn ungrab(&mut self) -> io::Result<()> {
        self.device.ungrab()
    }

    fn read_events(&mut self, out: &mut Vec<RawEvent>) -> io::Result<()> {
        match self.device.fetch_events() {
            Ok(events) => {
                out.extend(events.map(RawEvent::from));
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Collect every code the device reports, per event type
fn read_capabilities(device: &Device) -> Capabilities {
    let mut caps = Capabilities::new();

    if let Some(keys) = device.supported_keys() {
        for key in keys.iter() {
            caps.insert(EventType::KEY, key.code());
        }
    }
    if let Some(axes) = device.supported_relative_axes() {
        for axis in axes.iter() {
            caps.insert(EventType::RELATIVE, axis.0);
        }
    }
    if device.supported_absolute_axes().is_some() {
        match device.get_absinfo() {
            Ok(axes) => {
                for (axis, info) in axes {
                    caps.insert_axis(
                        axis.0,
                        AxisInfo {
                            value: info.value(),
                            minimum: info.minimum(),
                            maximum: info.maximum(),
                            fuzz: info.fuzz(),
                            flat: info.flat(),
                            resolution: info.resolution(),
                        },
                    );
                }
            }
            Err(e) => debug!("failed to read absolute axis ranges: {}", e),
        }
    }
    if let Some(switches) = device.supported_switches() {
        for switch in switches.iter() {
            caps.insert(EventType::SWITCH, switch.0);
        }
    }
    if let Some(misc) = device.misc_properties() {
        for code in misc.iter() {
            caps.insert(EventType::MISC, code.0);
        }
    }
    if let Some(leds) = device.supported_leds() {
        for led in leds.iter() {
            caps.insert(EventType::LED, led.0);
        }
    }
    if let Some(ff) = device.supported_ff() {
        for effect in ff.iter() {
            caps.insert(EventType::FORCEFEEDBACK, effect.0);
        }
    }

    caps
}

/// Numeric suffix of `/dev/input/eventN`, so event10 sorts after event9
fn event_index(path: &Path) -> u32 {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("event"))
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX)
}

/// Find every input device exposing at least one media key.
///
/// Each candidate is probed with a grab/ungrab pair; devices that cannot be
/// grabbed (permissions, already grabbed elsewhere) are reported and skipped.
pub fn find_media_key_devices() -> Vec<EvdevDevice> {
    let mut candidates: Vec<(PathBuf, Device)> = evdev::enumerate().collect();
    candidates.sort_by_key(|(path, _)| (event_index(path), path.clone()));

    info!("capturing media keys from:");
    let mut devices = Vec::new();

    for (path, device) in candidates {
        let mut device = match EvdevDevice::new(path.clone(), device) {
            Ok(device) => device,
            Err(e) => {
                debug!("could not prepare {}: {}", path.display(), e);
                continue;
            }
        };

        if !device.capabilities().has_media_keys() {
            continue;
        }

        match probe(&mut device) {
            Ok(()) => {
                info!("  {}", device.describe());
                devices.push(device);
            }
            Err(e) => warn!("  [IGNORING] {} (not accessible: {})", device.describe(), e),
        }
    }

    if devices.is_empty() {
        info!("  <no devices with media keys found>");
    }
    devices
}

fn probe(device: &mut EvdevDevice) -> io::Result<()> {
    device.grab()?;
    device.ungrab()
}

// ============================================================================
// Virtual Device (uinput)
// ============================================================================

/// Virtual device replaying pass-through events
pub struct UinputOutput {
    device: VirtualDevice,
}

impl UinputOutput {
    /// Build a uinput device advertising `capabilities`.
    ///
    /// Keys, relative axes, absolute axes, switches and misc codes are
    /// advertised. LED and sound codes are not re-emitted by the kernel for
    /// this device.
    pub fn create(name: &str, capabilities: &Capabilities) -> io::Result<Self> {
        let mut builder = VirtualDevice::builder()?.name(name);

        if capabilities.codes(EventType::KEY).next().is_some() {
            let mut keys = AttributeSet::<KeyCode>::new();
            for code in capabilities.codes(EventType::KEY) {
                keys.insert(KeyCode::new(code));
            }
            builder = builder.with_keys(&keys)?;
        }

        if capabilities.codes(EventType::RELATIVE).next().is_some() {
            let mut axes = AttributeSet::<RelativeAxisCode>::new();
            for code in capabilities.codes(EventType::RELATIVE) {
                axes.insert(RelativeAxisCode(code));
            }
            builder = builder.with_relative_axes(&axes)?;
        }

        for code in capabilities.codes(EventType::ABSOLUTE) {
            let info = capabilities.axis_info(code).unwrap_or_default();
            let setup = UinputAbsSetup::new(
                AbsoluteAxisCode(code),
                AbsInfo::new(
                    info.value,
                    info.minimum,
                    info.maximum,
                    info.fuzz,
                    info.flat,
                    info.resolution,
                ),
            );
            builder = builder.with_absolute_axis(&setup)?;
        }

        if capabilities.codes(EventType::SWITCH).next().is_some() {
            let mut switches = AttributeSet::<SwitchCode>::new();
            for code in capabilities.codes(EventType::SWITCH) {
                switches.insert(SwitchCode(code));
            }
            builder = builder.with_switches(&switches)?;
        }

        if capabilities.codes(EventType::MISC).next().is_some() {
            let mut misc = AttributeSet::<MiscCode>::new();
            for code in capabilities.codes(EventType::MISC) {
                misc.insert(MiscCode(code));
            }
            builder = builder.with_msc(&misc)?;
        }

        for event_type in unadvertised_types(capabilities) {
            debug!(?event_type, "not advertised on virtual device");
        }

        Ok(Self {
            device: builder.build()?,
        })
    }
}

/// Event types the uinput builder can advertise
const ADVERTISED_TYPES: [EventType; 5] = [
    EventType::KEY,
    EventType::RELATIVE,
    EventType::ABSOLUTE,
    EventType::SWITCH,
    EventType::MISC,
];

fn unadvertised_types(capabilities: &Capabilities) -> Vec<EventType> {
    capabilities
        .event_types()
        .filter(|event_type| !ADVERTISED_TYPES.contains(event_type))
        .collect()
}

impl EventOutput for UinputOutput {
    fn write(&mut self, event: RawEvent) -> io::Result<()> {
        // emit() terminates the batch with SYN_REPORT
        self.device.emit(&[event.into()])
    }
}

impl Drop for UinputOutput {
    fn drop(&mut self) {
        debug!("destroying virtual device");
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Production backend: real `/dev/input` devices and a uinput replay device
#[derive(Debug, Default)]
pub struct EvdevBackend;

impl InputBackend for EvdevBackend {
    type Device = EvdevDevice;
    type Output = UinputOutput;

    fn discover(&mut self) -> Vec<EvdevDevice> {
        find_media_key_devices()
    }

    fn create_output(&mut self, capabilities: &Capabilities) -> Result<UinputOutput, RedirectError> {
        check_uinput_access()?;
        let output = UinputOutput::create(VIRTUAL_DEVICE_NAME, capabilities)
            .map_err(RedirectError::VirtualDevice)?;
        info!("created virtual device {}", VIRTUAL_DEVICE_NAME);
        Ok(output)
    }
}

/// Check uinput is present and writable, for a clearer error than the ioctl's
fn check_uinput_access() -> Result<(), RedirectError> {
    if !Path::new(UINPUT_PATH).exists() {
        return Err(RedirectError::UinputMissing);
    }
    OpenOptions::new()
        .write(true)
        .open(UINPUT_PATH)
        .map(drop)
        .map_err(RedirectError::UinputDenied)
}
