use crate::config::DeviceConfig;
use crate::device::{is_xr50, Device};
use crate::protocol::{PID, VID};
use crate::types::{DeviceInfo, UsbAddress};
use crate::{Result, Xr50Error};
use crossbeam_channel::{Receiver, Sender};
use rusb::{Context, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::time::Duration;

/// Discovers XR50 devices on one libusb context and watches for new ones.
pub struct Enumerator {
    context: Context,
    config: DeviceConfig,
    sender: Sender<rusb::Device<Context>>,
    arrivals: Receiver<rusb::Device<Context>>,
    registration: Option<Registration<Context>>,
}

/// Hotplug callback. Runs inside libusb event handling, so it only queues
/// the device; opening happens in [`Enumerator::poll_new_devices`].
struct ArrivalQueue {
    sender: Sender<rusb::Device<Context>>,
}

impl Hotplug<Context> for ArrivalQueue {
    fn device_arrived(&mut self, device: rusb::Device<Context>) {
        let _ = self.sender.send(device);
    }

    fn device_left(&mut self, device: rusb::Device<Context>) {
        log::debug!(
            "XR50 left at {:03}:{:03}",
            device.bus_number(),
            device.address()
        );
    }
}

impl Enumerator {
    /// New context with [`DeviceConfig::from_env`].
    pub fn new() -> Result<Self> {
        Self::with_config(DeviceConfig::from_env())
    }

    pub fn with_config(config: DeviceConfig) -> Result<Self> {
        let context = Context::new()?;
        let (sender, arrivals) = crossbeam_channel::unbounded();
        Ok(Self {
            context,
            config,
            sender,
            arrivals,
            registration: None,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn xr50_devices(&self) -> Result<Vec<rusb::Device<Context>>> {
        let devices = self.context.devices()?;
        Ok(devices.iter().filter(is_xr50).collect())
    }

    /// Bus positions of all connected XR50 devices. Nothing is opened.
    pub fn enumerate(&self) -> Result<Vec<UsbAddress>> {
        Ok(self
            .xr50_devices()?
            .iter()
            .map(|d| UsbAddress {
                bus: d.bus_number(),
                address: d.address(),
            })
            .collect())
    }

    /// Open the device at `address`.
    pub fn open(&self, address: &UsbAddress) -> Result<Device> {
        let usb_device = self
            .xr50_devices()?
            .into_iter()
            .find(|d| d.bus_number() == address.bus && d.address() == address.address)
            .ok_or(Xr50Error::DeviceNotFound)?;
        Device::open(&usb_device, &self.config)
    }

    /// Open the first available XR50 device.
    pub fn open_first(&self) -> Result<Device> {
        let usb_device = self
            .xr50_devices()?
            .into_iter()
            .next()
            .ok_or(Xr50Error::DeviceNotFound)?;
        Device::open(&usb_device, &self.config)
    }

    /// List all connected XR50 devices with their info.
    ///
    /// Opens each device temporarily to read UUID, version, and features, then closes it.
    pub fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut devices = Vec::new();
        for usb_device in self.xr50_devices()? {
            match Device::open(&usb_device, &self.config) {
                Ok(device) => devices.push(device.info().clone()),
                Err(e) => log::warn!(
                    "Failed to query XR50 at {:03}:{:03}: {}",
                    usb_device.bus_number(),
                    usb_device.address(),
                    e
                ),
            }
        }
        Ok(devices)
    }

    /// Start watching for newly attached devices. Calling it again is a no-op.
    pub fn watch(&mut self) -> Result<()> {
        if self.registration.is_some() {
            return Ok(());
        }
        if !rusb::has_hotplug() {
            return Err(Xr50Error::HotplugUnsupported);
        }
        let callback: Box<dyn Hotplug<Context>> = Box::new(ArrivalQueue {
            sender: self.sender.clone(),
        });
        let mut builder = HotplugBuilder::new();
        builder.vendor_id(VID).product_id(PID).enumerate(false);
        let registration = builder.register(&self.context, callback)?;
        self.registration = Some(registration);
        log::info!("Watching for XR50 hotplug events");
        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.registration.is_some()
    }

    /// Open every device that arrived since the last call.
    ///
    /// Pumps pending libusb events without blocking first. Devices that fail
    /// to open are logged and skipped.
    pub fn poll_new_devices(&self) -> Vec<Device> {
        if let Err(e) = self.context.handle_events(Some(Duration::ZERO)) {
            log::warn!("Hotplug event handling failed: {}", e);
        }
        drain_arrivals(&self.arrivals, |usb_device| {
            log::info!(
                "XR50 arrived at {:03}:{:03}",
                usb_device.bus_number(),
                usb_device.address()
            );
            Device::open(usb_device, &self.config)
        })
    }
}

/// Take everything queued in `arrivals` and open each with `open`.
fn drain_arrivals<D, T>(arrivals: &Receiver<D>, mut open: impl FnMut(&D) -> Result<T>) -> Vec<T> {
    arrivals
        .try_iter()
        .filter_map(|arrived| match open(&arrived) {
            Ok(opened) => Some(opened),
            Err(e) => {
                log::warn!("Failed to open arrived XR50: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_arrivals_opens_each_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        for id in [1u8, 2, 3] {
            tx.send(id).unwrap();
        }
        let opened = drain_arrivals(&rx, |&id| {
            if id == 2 {
                Err(Xr50Error::AccessDenied)
            } else {
                Ok(id * 10)
            }
        });
        assert_eq!(opened, vec![10, 30]);
        assert!(drain_arrivals(&rx, |&id| Ok(id)).is_empty());
    }

    #[test]
    fn test_drain_arrivals_keeps_later_arrivals() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(1u8).unwrap();
        assert_eq!(drain_arrivals(&rx, |&id| Ok(id)), vec![1]);
        tx.send(2u8).unwrap();
        assert_eq!(drain_arrivals(&rx, |&id| Ok(id)), vec![2]);
    }
}
