use crate::config::{DeviceConfig, StreamConfig};
use crate::hid::HidTransport;
use crate::protocol::{HID_INTERFACE, SLAM_ENDPOINT};
use crate::slam::SlamStream;
use crate::types::{DeviceInfo, Features, UsbAddress};
use crate::usb::InterruptTransfer;
use crate::{Result, Xr50Error};
use rusb::{Context, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::time::Duration;

/// An opened XR50 device ready for queries and SLAM streaming.
///
/// Owns the USB handle and the claimed HID interface. Commands are issued on
/// the caller's thread; telemetry is read by a [`SlamStream`] borrowed from it.
pub struct Device {
    hid: HidTransport<Arc<DeviceHandle<Context>>>,
    context: Context,
    info: DeviceInfo,
    config: DeviceConfig,
    /// Whether open detached a kernel driver that Drop should give back.
    reattach_kernel_driver: bool,
}

impl Device {
    /// Open a device, claim its HID interface and read its identity.
    ///
    /// Any failure fails the open; the handle is released again on error.
    pub fn open(usb_device: &rusb::Device<Context>, config: &DeviceConfig) -> Result<Device> {
        let address = UsbAddress {
            bus: usb_device.bus_number(),
            address: usb_device.address(),
        };
        let handle = usb_device.open().map_err(open_error)?;
        let context = handle.context().clone();

        let mut detached = false;
        if config.detach_kernel_driver {
            match handle.kernel_driver_active(HID_INTERFACE) {
                Ok(true) => {
                    handle
                        .detach_kernel_driver(HID_INTERFACE)
                        .map_err(Xr50Error::from)?;
                    log::info!("Detached kernel driver from interface {}", HID_INTERFACE);
                    detached = true;
                }
                Ok(false) | Err(rusb::Error::NotSupported) => {}
                Err(e) => log::warn!("kernel_driver_active: {} (continuing)", e),
            }
        }

        if let Err(e) = handle.claim_interface(HID_INTERFACE) {
            log::warn!("Claim interface {} failed: {}", HID_INTERFACE, e);
            if detached {
                let _ = handle.attach_kernel_driver(HID_INTERFACE);
            }
            return Err(e.into());
        }

        // From here on Drop releases the interface.
        let mut device = Device {
            hid: HidTransport::new(Arc::new(handle), config.control_timeout),
            context,
            info: DeviceInfo {
                uuid: String::new(),
                version: String::new(),
                features: Features::empty(),
                address,
            },
            config: *config,
            reattach_kernel_driver: detached,
        };

        let identity = device.hid.discover()?;
        device.info.uuid = identity.uuid;
        device.info.version = identity.version;
        device.info.features = identity.features;

        log::info!(
            "Opened XR50 at {}: UUID={} Version={} Features={:?}",
            address,
            device.info.uuid,
            device.info.version,
            device.info.features
        );
        Ok(device)
    }

    /// Get the device UUID.
    pub fn uuid(&self) -> &str {
        &self.info.uuid
    }

    /// Get the firmware version string.
    pub fn version(&self) -> &str {
        &self.info.version
    }

    /// Get the device feature flags.
    pub fn features(&self) -> Features {
        self.info.features
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn address(&self) -> UsbAddress {
        self.info.address
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn supports_edge_mode(&self) -> bool {
        self.info.features.contains(Features::EDGE_MODE)
    }

    pub fn supports_mixed_mode(&self) -> bool {
        self.info.features.contains(Features::MIXED_MODE)
    }

    pub fn supports_stereo(&self) -> bool {
        self.info.features.contains(Features::STEREO)
    }

    pub fn supports_rgb(&self) -> bool {
        self.info.features.contains(Features::RGB)
    }

    pub fn supports_tof(&self) -> bool {
        self.info.features.contains(Features::TOF)
    }

    pub fn supports_ia(&self) -> bool {
        self.info.features.contains(Features::IA)
    }

    pub fn supports_sgbm(&self) -> bool {
        self.info.features.contains(Features::SGBM)
    }

    pub fn supports_eye_tracking(&self) -> bool {
        self.info.features.contains(Features::EYE_TRACKING)
    }

    pub fn supports_face_id(&self) -> bool {
        self.info.features.contains(Features::FACE_ID)
    }

    /// Send the mode configuration command. The ack is not validated.
    pub fn configure(&self, edge: bool, uvc_mode: u8, embedded_algo: bool) -> Result<()> {
        log::debug!(
            "configure: edge={} uvc_mode={} embedded_algo={}",
            edge,
            uvc_mode,
            embedded_algo
        );
        self.hid.configure(edge, uvc_mode, embedded_algo)
    }

    /// Send the edge stream start/stop command.
    pub fn start_edge_stream(
        &self,
        enable: bool,
        rotation_enabled: bool,
        flipped: bool,
    ) -> Result<()> {
        log::debug!(
            "edge stream: enable={} rotation={} flipped={}",
            enable,
            rotation_enabled,
            flipped
        );
        self.hid
            .edge_stream(u8::from(enable), rotation_enabled, flipped)
    }

    /// Send a raw HID command and return the response payload.
    pub fn hid_command(&self, cmd: &[u8]) -> Result<Vec<u8>> {
        self.hid.transaction(cmd)
    }

    /// SLAM session using [`StreamConfig::from_env`].
    pub fn slam(&mut self) -> SlamStream<'_> {
        self.slam_with_config(StreamConfig::from_env())
    }

    pub fn slam_with_config(&mut self, config: StreamConfig) -> SlamStream<'_> {
        SlamStream::new(self, config)
    }

    pub(crate) fn interrupt_transfer(&self, timeout: Duration) -> Result<InterruptTransfer> {
        let handle = self.hid.channel().clone();
        InterruptTransfer::new(handle, self.context.clone(), SLAM_ENDPOINT, timeout)
            .map_err(Xr50Error::from)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let handle = self.hid.channel();
        match handle.release_interface(HID_INTERFACE) {
            Ok(()) | Err(rusb::Error::NoDevice) => {}
            Err(e) => log::warn!("Release interface {}: {}", HID_INTERFACE, e),
        }
        if self.reattach_kernel_driver {
            match handle.attach_kernel_driver(HID_INTERFACE) {
                Ok(()) => log::debug!("Re-attached kernel driver"),
                Err(e) => log::debug!("Re-attach kernel driver: {}", e),
            }
        }
        log::debug!("Closed XR50 at {}", self.info.address);
    }
}

/// Map a failure of `libusb_open`. A matched device that vanished before
/// the open is `DeviceGone`.
fn open_error(err: rusb::Error) -> Xr50Error {
    match err {
        rusb::Error::NotFound => Xr50Error::DeviceNotFound,
        other => other.into(),
    }
}

/// Whether a USB device descriptor identifies an XR50.
pub(crate) fn is_xr50<T: UsbContext>(device: &rusb::Device<T>) -> bool {
    device
        .device_descriptor()
        .map(|desc| is_xr50_ids(desc.vendor_id(), desc.product_id()))
        .unwrap_or(false)
}

fn is_xr50_ids(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == crate::protocol::VID && product_id == crate::protocol::PID
}
