//! C FFI layer for xr50.
//!
//! Provides opaque handle-based API for C/C++ consumers.
//! The generated C header is written to `include/xr50.h` by cbindgen.

use crate::device::Device;
use crate::enumerator::Enumerator;
use crate::error::LastError;
use crate::slam::{PoseQueue, SlamStream};
use crate::types::{Pose, SlamMode, UsbAddress, EXTENDED_LEN};
use crate::Xr50Error;
use std::ffi::{c_char, c_int, c_void, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Last error message for C consumers.
static LAST_ERROR: LastError = LastError::new();

/// Poses buffered for `xr50_slam_recv`.
const RECV_QUEUE_CAPACITY: usize = 256;

/// Opaque device handle for C consumers.
pub struct Xr50Device {
    device: Box<Device>,
    uuid: CString,
    version: CString,
    /// Set while a stream borrows the device.
    streaming: Arc<AtomicBool>,
}

/// Opaque SLAM stream handle for C consumers.
pub struct Xr50SlamStream {
    stream: SlamStream<'static>,
    queue: PoseQueue,
    streaming: Arc<AtomicBool>,
}

impl Drop for Xr50SlamStream {
    fn drop(&mut self) {
        self.stream.stop();
        self.streaming.store(false, Ordering::Release);
    }
}

/// Pose callback invoked on the stream thread for every decoded packet.
pub type Xr50PoseCallback =
    Option<unsafe extern "C" fn(pose: *const Xr50Pose, user_data: *mut c_void)>;

struct UserData(*mut c_void);

// SAFETY: the pointer is only handed back to the C callback; the caller
// guarantees it may be used from the stream thread.
unsafe impl Send for UserData {}
unsafe impl Sync for UserData {}

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

/// Pose data in C-compatible layout.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Xr50Pose {
    /// Translation [x, y, z] in meters.
    pub position: [f64; 3],
    /// Rotation matrix, flat row-major (9 elements).
    pub rotation: [f64; 9],
    /// Quaternion [qx, qy, qz, qw].
    pub quaternion: [f64; 4],
    /// Euler angles [roll, pitch, yaw] in degrees.
    pub euler_deg: [f64; 3],
    /// Device timestamp in microseconds; wraps at 2^32.
    pub timestamp_us: u32,
    /// Host monotonic time of receipt, seconds since the stream started.
    pub host_timestamp_s: f64,
    /// Undecoded packet bytes [27..63).
    pub extended: [u8; EXTENDED_LEN],
}

impl From<&Pose> for Xr50Pose {
    fn from(pose: &Pose) -> Self {
        let m = pose.rotation();
        Xr50Pose {
            position: pose.position,
            rotation: [
                m[0][0], m[0][1], m[0][2], m[1][0], m[1][1], m[1][2], m[2][0], m[2][1], m[2][2],
            ],
            quaternion: pose.orientation.to_xyzw(),
            euler_deg: pose.euler().to_degrees(),
            timestamp_us: pose.timestamp_us,
            host_timestamp_s: pose.host_timestamp_s,
            extended: *pose.extended.as_bytes(),
        }
    }
}

/// Device info in C-compatible layout.
#[repr(C)]
pub struct Xr50DeviceInfo {
    /// Null-terminated UUID string.
    pub uuid: [c_char; 64],
    /// Null-terminated version string.
    pub version: [c_char; 128],
    /// Feature bitmap.
    pub features: u32,
    /// USB bus number.
    pub bus: u8,
    /// USB device address.
    pub address: u8,
}

fn str_to_fixed<const N: usize>(s: &str) -> [c_char; N] {
    let mut buf = [0 as c_char; N];
    let bytes = s.as_bytes();
    let len = bytes.len().min(N - 1);
    for (i, &b) in bytes[..len].iter().enumerate() {
        buf[i] = b as c_char;
    }
    buf
}

fn c_string(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

fn wrap_device(result: crate::Result<Device>) -> *mut Xr50Device {
    match result {
        Ok(device) => {
            let uuid = c_string(device.uuid());
            let version = c_string(device.version());
            Box::into_raw(Box::new(Xr50Device {
                device: Box::new(device),
                uuid,
                version,
                streaming: Arc::new(AtomicBool::new(false)),
            }))
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// List connected XR50 devices.
///
/// Writes up to `max` entries into `out`. Returns the number of devices found,
/// or -1 on error.
///
/// # Safety
/// `out` must point to an array of at least `max` `Xr50DeviceInfo` elements, or be null.
#[no_mangle]
pub unsafe extern "C" fn xr50_list_devices(out: *mut Xr50DeviceInfo, max: c_int) -> c_int {
    let devices = match Enumerator::new().and_then(|e| e.list_devices()) {
        Ok(devices) => devices,
        Err(e) => {
            LAST_ERROR.set(&e);
            return -1;
        }
    };
    let count = devices.len().min(max.max(0) as usize);
    if !out.is_null() {
        for (i, dev) in devices.iter().take(count).enumerate() {
            let info = Xr50DeviceInfo {
                uuid: str_to_fixed(&dev.uuid),
                version: str_to_fixed(&dev.version),
                features: dev.features.bits(),
                bus: dev.address.bus,
                address: dev.address.address,
            };
            out.add(i).write(info);
        }
    }
    count as c_int
}

/// Open the first available XR50 device.
/// Returns NULL on error (check xr50_last_error()).
#[no_mangle]
pub extern "C" fn xr50_open_first() -> *mut Xr50Device {
    wrap_device(Enumerator::new().and_then(|e| e.open_first()))
}

/// Open the XR50 at the bus position in `info`.
/// Returns NULL on error.
///
/// # Safety
/// `info` must point to a valid `Xr50DeviceInfo`, or be null.
#[no_mangle]
pub unsafe extern "C" fn xr50_open_device(info: *const Xr50DeviceInfo) -> *mut Xr50Device {
    if info.is_null() {
        return std::ptr::null_mut();
    }
    let info = &*info;
    let address = UsbAddress {
        bus: info.bus,
        address: info.address,
    };
    wrap_device(Enumerator::new().and_then(|e| e.open(&address)))
}

/// Close a device and free its resources.
///
/// Refused while a stream started on it is still alive; stop the stream first.
///
/// # Safety
/// `dev` must be a pointer returned by `xr50_open_first` or `xr50_open_device`, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_close_device(dev: *mut Xr50Device) {
    if dev.is_null() {
        return;
    }
    if (*dev).streaming.load(Ordering::Acquire) {
        log::error!("xr50_close_device called with a live stream, ignoring");
        LAST_ERROR.set(&Xr50Error::StreamActive);
        return;
    }
    drop(Box::from_raw(dev));
}

/// Get the device UUID. Returns a pointer to a null-terminated string
/// valid for the lifetime of the device.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_device_uuid(dev: *const Xr50Device) -> *const c_char {
    if dev.is_null() {
        return std::ptr::null();
    }
    (*dev).uuid.as_ptr()
}

/// Get the device firmware version string.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_device_version(dev: *const Xr50Device) -> *const c_char {
    if dev.is_null() {
        return std::ptr::null();
    }
    (*dev).version.as_ptr()
}

/// Get the device feature bitmap.
///
/// # Safety
/// `dev` must be a valid device pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_device_features(dev: *const Xr50Device) -> u32 {
    if dev.is_null() {
        return 0;
    }
    (*dev).device.features().bits()
}

/// Start SLAM streaming.
/// `mode`: 0 = Edge, 1 = Mixed.
/// `callback` may be NULL; when set it runs on the stream thread for every
/// pose and must return quickly. Poses are also buffered for `xr50_slam_recv`.
/// Returns NULL on error.
///
/// # Safety
/// `dev` must be a valid device pointer, or null. The device must not be
/// closed before the returned stream is stopped.
#[no_mangle]
pub unsafe extern "C" fn xr50_start_slam(
    dev: *mut Xr50Device,
    mode: c_int,
    callback: Xr50PoseCallback,
    user_data: *mut c_void,
) -> *mut Xr50SlamStream {
    if dev.is_null() {
        return std::ptr::null_mut();
    }
    let dev = &mut *dev;
    if dev.streaming.swap(true, Ordering::AcqRel) {
        LAST_ERROR.set(&Xr50Error::StreamActive);
        return std::ptr::null_mut();
    }
    let slam_mode = match mode {
        1 => SlamMode::Mixed,
        _ => SlamMode::Edge,
    };

    // SAFETY: the device is boxed and outlives the stream, which
    // xr50_close_device enforces through the streaming flag.
    let device: &'static mut Device = &mut *(&mut *dev.device as *mut Device);
    let mut stream = device.slam();

    let started = (|| {
        let queue = stream.subscribe(RECV_QUEUE_CAPACITY)?;
        if let Some(cb) = callback {
            let user_data = UserData(user_data);
            stream.on_pose(move |pose| {
                let out = Xr50Pose::from(&pose);
                // SAFETY: the caller registered a callback valid for the
                // stream's lifetime.
                unsafe { cb(&out, user_data.get()) };
            })?;
        }
        stream.start(slam_mode)?;
        Ok::<_, Xr50Error>(queue)
    })();

    match started {
        Ok(queue) => Box::into_raw(Box::new(Xr50SlamStream {
            stream,
            queue,
            streaming: dev.streaming.clone(),
        })),
        Err(e) => {
            drop(stream);
            dev.streaming.store(false, Ordering::Release);
            LAST_ERROR.set(&e);
            std::ptr::null_mut()
        }
    }
}

/// Receive the next SLAM pose with timeout.
/// `timeout_ms`: timeout in milliseconds (0 = try without blocking, -1 = block forever).
/// Returns 0 on success, -1 on error/timeout. After -1, `xr50_last_error`
/// tells a timeout from a stream that was stopped, lost its device or gave up
/// recovering.
///
/// # Safety
/// `stream` and `pose` must be valid pointers, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_slam_recv(
    stream: *mut Xr50SlamStream,
    pose: *mut Xr50Pose,
    timeout_ms: c_int,
) -> c_int {
    if stream.is_null() || pose.is_null() {
        return -1;
    }
    let stream = &*stream;

    let result = if timeout_ms < 0 {
        stream.queue.recv()
    } else {
        stream
            .queue
            .recv_timeout(Duration::from_millis(timeout_ms as u64))
    };

    match result {
        Ok(sample) => {
            pose.write(Xr50Pose::from(&sample));
            0
        }
        Err(e) => {
            LAST_ERROR.set(&e);
            -1
        }
    }
}

/// Number of packets decoded since the stream started.
///
/// # Safety
/// `stream` must be a valid stream pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_slam_frame_count(stream: *const Xr50SlamStream) -> u64 {
    if stream.is_null() {
        return 0;
    }
    (*stream).stream.frame_count()
}

/// Stream state: 0 idle, 1 starting, 2 streaming, 3 recovering, 4 stopped, 5 failed.
///
/// # Safety
/// `stream` must be a valid stream pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_slam_state(stream: *const Xr50SlamStream) -> c_int {
    if stream.is_null() {
        return -1;
    }
    (*stream).stream.state() as c_int
}

/// Check if the SLAM stream is still active.
///
/// # Safety
/// `stream` must be a valid stream pointer, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_slam_is_active(stream: *const Xr50SlamStream) -> bool {
    if stream.is_null() {
        return false;
    }
    (*stream).stream.is_active()
}

/// Stop a SLAM stream and free its resources.
///
/// # Safety
/// `stream` must be a pointer returned by `xr50_start_slam`, or null.
#[no_mangle]
pub unsafe extern "C" fn xr50_stop_slam(stream: *mut Xr50SlamStream) {
    if !stream.is_null() {
        drop(Box::from_raw(stream));
    }
}

/// Get the last error message. Returns NULL if no error.
/// The returned pointer is valid until the next xr50 API call.
#[no_mangle]
pub extern "C" fn xr50_last_error() -> *const c_char {
    LAST_ERROR.as_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExtendedTelemetry, Quaternion};
    use std::ffi::CStr;

    #[test]
    fn test_str_to_fixed_truncates_and_terminates() {
        let buf: [c_char; 4] = str_to_fixed("abcdef");
        assert_eq!(buf, [b'a' as c_char, b'b' as c_char, b'c' as c_char, 0]);
    }

    #[test]
    fn test_pose_layout_conversion() {
        let pose = Pose {
            position: [0.5, -1.0, 2.0],
            orientation: Quaternion::new(1.0, 0.0, 0.0, 0.0),
            timestamp_us: 42,
            host_timestamp_s: 1.5,
            extended: ExtendedTelemetry([7; EXTENDED_LEN]),
        };
        let out = Xr50Pose::from(&pose);
        assert_eq!(out.position, [0.5, -1.0, 2.0]);
        assert_eq!(out.quaternion, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(
            out.rotation,
            [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0]
        );
        assert_eq!(out.euler_deg, [0.0, 0.0, 0.0]);
        assert_eq!(out.timestamp_us, 42);
        assert_eq!(out.host_timestamp_s, 1.5);
        assert_eq!(out.extended[35], 7);
    }

    #[test]
    fn test_null_handles_are_rejected() {
        unsafe {
            assert!(xr50_device_uuid(std::ptr::null()).is_null());
            assert_eq!(xr50_device_features(std::ptr::null()), 0);
            assert!(xr50_start_slam(std::ptr::null_mut(), 0, None, std::ptr::null_mut()).is_null());
            assert_eq!(
                xr50_slam_recv(std::ptr::null_mut(), std::ptr::null_mut(), 0),
                -1
            );
            assert_eq!(xr50_slam_state(std::ptr::null()), -1);
            assert_eq!(xr50_slam_frame_count(std::ptr::null()), 0);
            xr50_stop_slam(std::ptr::null_mut());
            xr50_close_device(std::ptr::null_mut());
        }
    }

    #[test]
    fn test_last_error_is_nul_terminated() {
        LAST_ERROR.set(&Xr50Error::StreamActive);
        let msg = unsafe { CStr::from_ptr(xr50_last_error()) };
        assert_eq!(msg.to_str().unwrap(), "SLAM stream is running");
    }

    #[test]
    fn test_c_string_strips_interior_nul() {
        assert_eq!(c_string("ab\0cd").as_bytes(), b"abcd");
    }
}
