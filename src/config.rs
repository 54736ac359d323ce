use std::time::Duration;

/// Options applied when opening a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Timeout for each half of a HID command transaction.
    pub control_timeout: Duration,
    /// Detach a kernel HID driver bound to the control interface before claiming it.
    pub detach_kernel_driver: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            control_timeout: Duration::from_secs(2),
            detach_kernel_driver: true,
        }
    }
}

impl DeviceConfig {
    /// Defaults overridden by `XR50_CONTROL_TIMEOUT_MS` and `XR50_DETACH_KERNEL_DRIVER`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            control_timeout: read_env_millis("XR50_CONTROL_TIMEOUT_MS", d.control_timeout),
            detach_kernel_driver: read_env_bool(
                "XR50_DETACH_KERNEL_DRIVER",
                d.detach_kernel_driver,
            ),
        }
    }
}

/// Options for starting a SLAM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    /// uvcMode byte of the configure command (0 matches the official driver).
    pub uvc_mode: u8,
    /// Without rotation enabled the device reports a frozen quaternion.
    pub rotation_enabled: bool,
    pub flipped: bool,
    /// Pause between configure and the edge stream command.
    pub configure_settle: Duration,
    /// libusb timeout of each interrupt transfer.
    pub transfer_timeout: Duration,
    /// How long `start` waits for the first transfer to be submitted.
    pub start_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            uvc_mode: 0,
            rotation_enabled: true,
            flipped: false,
            configure_settle: Duration::from_secs(1),
            transfer_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(2),
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `XR50_UVC_MODE`, `XR50_ROTATION_ENABLED`,
    /// `XR50_FLIPPED` and `XR50_CONFIGURE_SETTLE_MS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            uvc_mode: read_env_u8("XR50_UVC_MODE", d.uvc_mode),
            rotation_enabled: read_env_bool("XR50_ROTATION_ENABLED", d.rotation_enabled),
            flipped: read_env_bool("XR50_FLIPPED", d.flipped),
            configure_settle: read_env_millis("XR50_CONFIGURE_SETTLE_MS", d.configure_settle),
            ..d
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn read_env_u8(name: &str, default: u8) -> u8 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(default)
}

fn read_env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", " YES ", "on"] {
            assert_eq!(parse_bool(v), Some(true), "{}", v);
        }
        for v in ["0", "False", "no", "off"] {
            assert_eq!(parse_bool(v), Some(false), "{}", v);
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("XR50_TEST_U8", "7");
        std::env::set_var("XR50_TEST_MS", "250");
        std::env::set_var("XR50_TEST_BAD", "lots");
        assert_eq!(read_env_u8("XR50_TEST_U8", 0), 7);
        assert_eq!(read_env_u8("XR50_TEST_BAD", 3), 3);
        assert_eq!(
            read_env_millis("XR50_TEST_MS", Duration::ZERO),
            Duration::from_millis(250)
        );
        assert!(read_env_bool("XR50_TEST_UNSET", true));
    }

    #[test]
    fn test_defaults_match_vendor_sequence() {
        let cfg = StreamConfig::default();
        assert_eq!(cfg.uvc_mode, 0);
        assert!(cfg.rotation_enabled);
        assert!(!cfg.flipped);
        assert_eq!(cfg.configure_settle, Duration::from_secs(1));
        assert!(DeviceConfig::default().detach_kernel_driver);
    }
}
