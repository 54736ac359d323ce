use std::fmt;

/// 3x3 row-major rotation matrix.
pub type Matrix3 = [[f64; 3]; 3];

/// Unit quaternion in wire order [w, x, y, z].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(w: f64, x: f64, y: f64, z: f64) -> Self {
        Self { w, x, y, z }
    }

    pub fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// Components as [w, x, y, z].
    pub fn to_wxyz(&self) -> [f64; 4] {
        [self.w, self.x, self.y, self.z]
    }

    /// Components as [x, y, z, w], the order used by the vendor SDK API.
    pub fn to_xyzw(&self) -> [f64; 4] {
        [self.x, self.y, self.z, self.w]
    }
}

/// Tait-Bryan angles in radians.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EulerAngles {
    /// Rotation about X.
    pub roll: f64,
    /// Rotation about Y.
    pub pitch: f64,
    /// Rotation about Z.
    pub yaw: f64,
}

impl EulerAngles {
    pub fn to_degrees(&self) -> [f64; 3] {
        [
            self.roll.to_degrees(),
            self.pitch.to_degrees(),
            self.yaw.to_degrees(),
        ]
    }
}

/// Length of the undecoded tail of a SLAM packet, bytes [27..63].
pub const EXTENDED_LEN: usize = 36;

/// Raw bytes [27..63] of a SLAM packet.
///
/// Suspected to carry IMU and confidence data; the layout is unconfirmed, so
/// the bytes are handed out as-is.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExtendedTelemetry(pub [u8; EXTENDED_LEN]);

impl ExtendedTelemetry {
    pub fn as_bytes(&self) -> &[u8; EXTENDED_LEN] {
        &self.0
    }

    /// Reinterpret byte `offset` (relative to packet byte 27) as an i16 LE.
    pub fn i16_at(&self, offset: usize) -> Option<i16> {
        let b = self.0.get(offset..offset + 2)?;
        Some(i16::from_le_bytes([b[0], b[1]]))
    }
}

impl fmt::Debug for ExtendedTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtendedTelemetry({:02x?})", &self.0[..])
    }
}

/// 6DOF pose decoded from one SLAM packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Translation in meters [x, y, z].
    pub position: [f64; 3],
    pub orientation: Quaternion,
    /// Device clock in microseconds. Wraps every 2^32 µs (~71.6 min),
    /// compare with [`Pose::delta_us`], never by plain subtraction.
    pub timestamp_us: u32,
    /// Host monotonic time of receipt, in seconds since the stream started.
    /// Zero for a pose decoded outside a stream.
    pub host_timestamp_s: f64,
    pub extended: ExtendedTelemetry,
}

impl Pose {
    pub fn rotation(&self) -> Matrix3 {
        crate::protocol::matrix_from_quaternion(&self.orientation)
    }

    pub fn euler(&self) -> EulerAngles {
        crate::protocol::euler_from_quaternion(&self.orientation)
    }

    /// Microseconds from `earlier` to this pose, across timestamp wraparound.
    pub fn delta_us(&self, earlier: &Pose) -> u32 {
        crate::protocol::timestamp_delta_us(earlier.timestamp_us, self.timestamp_us)
    }
}

/// Position of a device on the USB bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbAddress {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for UsbAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Device identification and capabilities.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub uuid: String,
    pub version: String,
    pub features: Features,
    pub address: UsbAddress,
}

bitflags::bitflags! {
    /// Feature bitmap reported by the XR50 device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[repr(C)]
    pub struct Features: u32 {
        const EDGE_MODE    = 1 << 0;
        const MIXED_MODE   = 1 << 1;
        const STEREO       = 1 << 2;
        const RGB          = 1 << 3;
        const TOF          = 1 << 4;
        const IA           = 1 << 5;
        const SGBM         = 1 << 6;
        const EYE_TRACKING = 1 << 10;
        const FACE_ID      = 1 << 12;
    }
}

/// SLAM operating mode.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlamMode {
    /// On-device SLAM processing (edge6dof=1, embeddedAlgo=0).
    Edge = 0,
    /// Mixed host+device SLAM processing (edge6dof=0, embeddedAlgo=1).
    Mixed = 1,
}

impl SlamMode {
    /// (edge6dof, embeddedAlgo) flags of the configure command.
    pub fn configure_flags(self) -> (bool, bool) {
        match self {
            SlamMode::Edge => (true, false),
            SlamMode::Mixed => (false, true),
        }
    }

    /// The other mode, used as a fallback after repeated start failures.
    pub fn alternate(self) -> SlamMode {
        match self {
            SlamMode::Edge => SlamMode::Mixed,
            SlamMode::Mixed => SlamMode::Edge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quaternion_orders() {
        let q = Quaternion::new(0.5, 0.1, 0.2, 0.3);
        assert_eq!(q.to_wxyz(), [0.5, 0.1, 0.2, 0.3]);
        assert_eq!(q.to_xyzw(), [0.1, 0.2, 0.3, 0.5]);
        assert!((Quaternion::IDENTITY.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_extended_i16_at() {
        let mut raw = [0u8; EXTENDED_LEN];
        raw[10] = 0xa0;
        raw[11] = 0x56;
        let ext = ExtendedTelemetry(raw);
        assert_eq!(ext.i16_at(10), Some(0x56a0));
        assert_eq!(ext.i16_at(35), None);
    }

    #[test]
    fn test_slam_mode_flags() {
        assert_eq!(SlamMode::Edge.configure_flags(), (true, false));
        assert_eq!(SlamMode::Mixed.configure_flags(), (false, true));
        assert_eq!(SlamMode::Edge.alternate(), SlamMode::Mixed);
    }

    #[test]
    fn test_usb_address_display() {
        let addr = UsbAddress { bus: 1, address: 23 };
        assert_eq!(addr.to_string(), "001:023");
    }
}
