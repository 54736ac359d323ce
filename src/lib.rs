//! # xr50 - Rust driver for the XVisio XR50 6DOF tracking sensor
//!
//! Talks to the device over libusb through `rusb`. Provides:
//! - Device discovery, hotplug and info queries (UUID, firmware version, features)
//! - SLAM pose streaming at ~950 Hz with automatic endpoint recovery
//! - A reconnecting supervisor for long-running consumers
//! - C FFI for integration with C/C++/Unity/Swift
//!
//! ## Quick Start
//! ```no_run
//! use xr50::{Enumerator, SlamMode};
//! use std::time::Duration;
//!
//! let enumerator = Enumerator::new().unwrap();
//! let mut device = enumerator.open_first().unwrap();
//! println!("UUID: {}", device.uuid());
//!
//! let mut slam = device.slam();
//! let poses = slam.subscribe(256).unwrap();
//! slam.start(SlamMode::Edge).unwrap();
//! for _ in 0..100 {
//!     let pose = poses.recv_timeout(Duration::from_secs(1)).unwrap();
//!     println!("pos: {:?}", pose.position);
//! }
//! ```

pub mod config;
pub mod device;
pub mod enumerator;
pub mod error;
pub mod ffi;
pub mod hid;
pub mod protocol;
pub mod slam;
pub mod supervisor;
pub mod types;
pub mod usb;

pub use config::{DeviceConfig, StreamConfig};
pub use device::Device;
pub use enumerator::Enumerator;
pub use error::{DecodeError, ErrorKind, Xr50Error};
pub use slam::{PoseQueue, SlamStream, StreamEnd, StreamEvent, StreamState};
pub use supervisor::{ReconnectPolicy, Supervisor};
pub use types::*;

/// Result type alias for xr50 operations.
pub type Result<T> = std::result::Result<T, Xr50Error>;
