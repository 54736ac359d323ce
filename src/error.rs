use std::cell::RefCell;
use std::ffi::CString;
use std::fmt;

/// Which half of a HID transaction timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    SetReport,
    GetReport,
}

impl fmt::Display for TransferPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPhase::SetReport => f.write_str("SET_REPORT"),
            TransferPhase::GetReport => f.write_str("GET_REPORT"),
        }
    }
}

/// Coarse classification of [`Xr50Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Control or interrupt transfer failed: timeout, stall, access, device gone.
    Transport,
    /// The device answered, but not with what the protocol expects.
    Protocol,
    /// A SLAM packet could not be decoded. Never fatal for a stream.
    Decode,
    /// The call was made in the wrong session state. Nothing is wrong with
    /// the device.
    Usage,
    /// The stream cannot continue.
    Fatal,
}

/// A SLAM packet that could not be turned into a pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("SLAM packet truncated: {len} bytes, need at least 27")]
    Truncated { len: usize },

    #[error("unexpected SLAM packet header {header:02x?}")]
    UnexpectedHeader { header: [u8; 3] },
}

/// Errors that can occur when interacting with the XR50 device.
#[derive(Debug, thiserror::Error)]
pub enum Xr50Error {
    #[error("USB error: {0}")]
    Usb(rusb::Error),

    #[error("Device not found (VID=040E PID=F408)")]
    DeviceNotFound,

    #[error("Access denied opening XR50 (check udev rules or run with sudo)")]
    AccessDenied,

    #[error("XR50 disconnected")]
    DeviceGone,

    #[error("XR50 control interface is busy")]
    InterfaceBusy,

    #[error("Timeout during {0}")]
    Timeout(TransferPhase),

    #[error("Invalid response: expected prefix 0x01, got 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("Command echo mismatch: sent {expected:02x?}, got {actual:02x?}")]
    EchoMismatch { expected: Vec<u8>, actual: Vec<u8> },

    #[error("Unsupported firmware: {query} query returned an unexpected response")]
    VersionMismatch {
        query: &'static str,
        #[source]
        source: Box<Xr50Error>,
    },

    #[error("Command too long: {0} bytes (max 62)")]
    CommandTooLong(usize),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("SLAM stream failed to start")]
    StartFailed,

    #[error("SLAM stream failed after {0} recovery attempts")]
    RecoveryExhausted(u32),

    #[error("XR50 disconnected while streaming")]
    Disconnected,

    #[error("SLAM stream is running")]
    StreamActive,

    #[error("SLAM stream stopped")]
    StreamStopped,

    #[error("Timeout waiting for data")]
    RecvTimeout,

    #[error("Hotplug is not supported by this libusb build")]
    HotplugUnsupported,

    #[error("Failed to spawn SLAM thread: {0}")]
    Spawn(#[source] std::io::Error),
}

impl Xr50Error {
    /// Map a libusb error from a control transfer, tagging timeouts with the phase.
    pub(crate) fn from_usb(err: rusb::Error, phase: TransferPhase) -> Self {
        match err {
            rusb::Error::Timeout => Xr50Error::Timeout(phase),
            other => other.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Xr50Error::Usb(_)
            | Xr50Error::DeviceNotFound
            | Xr50Error::AccessDenied
            | Xr50Error::DeviceGone
            | Xr50Error::InterfaceBusy
            | Xr50Error::Timeout(_)
            | Xr50Error::HotplugUnsupported
            | Xr50Error::RecvTimeout
            | Xr50Error::Spawn(_) => ErrorKind::Transport,
            Xr50Error::InvalidResponse(_)
            | Xr50Error::EchoMismatch { .. }
            | Xr50Error::VersionMismatch { .. }
            | Xr50Error::CommandTooLong(_) => ErrorKind::Protocol,
            Xr50Error::Decode(_) => ErrorKind::Decode,
            Xr50Error::StreamActive | Xr50Error::StreamStopped => ErrorKind::Usage,
            Xr50Error::StartFailed
            | Xr50Error::RecoveryExhausted(_)
            | Xr50Error::Disconnected => ErrorKind::Fatal,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Xr50Error::Timeout(_) | Xr50Error::InterfaceBusy | Xr50Error::RecvTimeout
        )
    }
}

impl From<rusb::Error> for Xr50Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Access => Xr50Error::AccessDenied,
            rusb::Error::NoDevice => Xr50Error::DeviceGone,
            rusb::Error::Busy => Xr50Error::InterfaceBusy,
            other => Xr50Error::Usb(other),
        }
    }
}

thread_local! {
    static LAST_MESSAGE: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Last-error storage for the C FFI layer, kept per calling thread.
///
/// A pointer from [`LastError::as_ptr`] stays valid until the next `set` on
/// the same thread; other threads never touch it.
pub(crate) struct LastError;

impl LastError {
    pub const fn new() -> Self {
        LastError
    }

    pub fn set(&self, err: &Xr50Error) {
        // Display output never contains NUL.
        let msg = CString::new(err.to_string()).unwrap_or_default();
        LAST_MESSAGE.with(|m| *m.borrow_mut() = Some(msg));
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        LAST_MESSAGE.with(|m| match &*m.borrow() {
            Some(msg) => msg.as_ptr(),
            None => std::ptr::null(),
        })
    }
}
