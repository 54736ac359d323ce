use crate::error::DecodeError;
use crate::types::{
    EulerAngles, ExtendedTelemetry, Features, Matrix3, Pose, Quaternion, EXTENDED_LEN,
};
use crate::{Result, Xr50Error};

// -- USB identifiers --
pub const VID: u16 = 0x040E;
pub const PID: u16 = 0xF408;
pub const HID_INTERFACE: u8 = 3;
pub const SLAM_ENDPOINT: u8 = 0x83;

// -- HID class requests (SET_REPORT output #2, GET_REPORT input #1) --
pub const REQUEST_TYPE_SET_REPORT: u8 = 0x21;
pub const REQUEST_TYPE_GET_REPORT: u8 = 0xA1;
pub const HID_SET_REPORT: u8 = 0x09;
pub const HID_GET_REPORT: u8 = 0x01;
pub const SET_REPORT_VALUE: u16 = 0x0202;
pub const GET_REPORT_VALUE: u16 = 0x0101;

// -- Packet geometry --
pub const REPORT_SIZE: usize = 63;
pub const MAX_OPCODE_LEN: usize = REPORT_SIZE - 1;
/// Header + timestamp + translation + quaternion.
pub const SLAM_MIN_LEN: usize = 27;

/// Fixed-point scale factor: 2^(-14) = 1/16384.
pub const SCALE: f64 = 6.103515625e-05;

// -- Command direction prefixes --
pub const PREFIX_HOST_TO_DEVICE: u8 = 0x02;
pub const PREFIX_DEVICE_TO_HOST: u8 = 0x01;

// -- Command bytes (after the 0x02 prefix) --
pub const CMD_UUID: &[u8] = &[0xFD, 0x66, 0x00, 0x02];
pub const CMD_VERSION: &[u8] = &[0x1C, 0x99];
pub const CMD_FEATURES: &[u8] = &[0xDE, 0x62, 0x01];
pub const CMD_CONFIGURE: &[u8] = &[0x19, 0x95];
pub const CMD_EDGE_STREAM: &[u8] = &[0xA2, 0x33];

// -- SLAM packet header echo --
pub const SLAM_HEADER: [u8; 3] = [0x01, 0xA2, 0x33];

/// Build a 63-byte HID command buffer.
/// Format: [0x02, cmd_bytes..., 0x00 padding...]
///
/// Opcodes longer than 62 bytes are truncated; [`crate::hid::HidTransport`]
/// rejects them before they get here.
pub fn build_command(cmd: &[u8]) -> [u8; REPORT_SIZE] {
    let mut buf = [0u8; REPORT_SIZE];
    buf[0] = PREFIX_HOST_TO_DEVICE;
    let len = cmd.len().min(MAX_OPCODE_LEN);
    buf[1..1 + len].copy_from_slice(&cmd[..len]);
    buf
}

/// Opcode of the configure command.
/// Edge mode: [0x19, 0x95, 0x01, uvc, 0x00]
/// Mixed mode: [0x19, 0x95, 0x00, uvc, 0x01]
pub fn configure_opcode(edge: bool, uvc_mode: u8, embedded_algo: bool) -> [u8; 5] {
    [
        CMD_CONFIGURE[0],
        CMD_CONFIGURE[1],
        edge as u8,
        uvc_mode,
        embedded_algo as u8,
    ]
}

/// Opcode of the edge stream start/stop command.
/// Start: [0xA2, 0x33, 0x01, 0x01, 0x00] (rotationEnabled is needed for live rotation)
/// Stop:  [0xA2, 0x33, 0x00, 0x00, 0x00]
pub fn edge_stream_opcode(edge_mode: u8, rotation_enabled: bool, flipped: bool) -> [u8; 5] {
    [
        CMD_EDGE_STREAM[0],
        CMD_EDGE_STREAM[1],
        edge_mode,
        rotation_enabled as u8,
        flipped as u8,
    ]
}

pub fn build_configure_cmd(edge: bool, uvc_mode: u8, embedded_algo: bool) -> [u8; REPORT_SIZE] {
    build_command(&configure_opcode(edge, uvc_mode, embedded_algo))
}

pub fn build_edge_stream_cmd(
    edge_mode: u8,
    rotation_enabled: bool,
    flipped: bool,
) -> [u8; REPORT_SIZE] {
    build_command(&edge_stream_opcode(edge_mode, rotation_enabled, flipped))
}

/// Check the marker and command echo of a response and return the payload start offset.
/// Response format: [0x01, cmd_echo..., payload...]
pub fn validate_response(response: &[u8], expected_cmd: &[u8]) -> Result<usize> {
    if response.first() != Some(&PREFIX_DEVICE_TO_HOST) {
        return Err(Xr50Error::InvalidResponse(
            response.first().copied().unwrap_or(0),
        ));
    }
    let end = 1 + expected_cmd.len();
    let echo = response.get(1..end).unwrap_or(&response[1..]);
    if echo != expected_cmd {
        return Err(Xr50Error::EchoMismatch {
            expected: expected_cmd.to_vec(),
            actual: echo.to_vec(),
        });
    }
    Ok(end)
}

/// Validate a response and return its payload.
pub fn parse_response<'a>(response: &'a [u8], expected_cmd: &[u8]) -> Result<&'a [u8]> {
    let offset = validate_response(response, expected_cmd)?;
    Ok(&response[offset..])
}

/// Extract a null-terminated string from a byte slice.
pub fn extract_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).to_string()
}

/// Parse features bitmap from response payload (little-endian u32).
pub fn parse_features(payload: &[u8]) -> Features {
    if payload.len() < 4 {
        return Features::empty();
    }
    let bits = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    Features::from_bits_truncate(bits)
}

/// Microseconds elapsed between two device timestamps, modulo 2^32.
pub fn timestamp_delta_us(earlier: u32, later: u32) -> u32 {
    later.wrapping_sub(earlier)
}

/// Convert a quaternion to a 3x3 rotation matrix (row-major).
pub fn matrix_from_quaternion(q: &Quaternion) -> Matrix3 {
    let Quaternion { w, x, y, z } = *q;
    [
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
        ],
        [
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
        ],
        [
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ]
}

/// Convert a rotation matrix to a quaternion, branching on the largest
/// diagonal term to keep the divisor away from zero.
pub fn quaternion_from_matrix(m: &Matrix3) -> Quaternion {
    let trace = m[0][0] + m[1][1] + m[2][2];
    if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        Quaternion::new(
            0.25 * s,
            (m[2][1] - m[1][2]) / s,
            (m[0][2] - m[2][0]) / s,
            (m[1][0] - m[0][1]) / s,
        )
    } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
        let s = (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.0;
        Quaternion::new(
            (m[2][1] - m[1][2]) / s,
            0.25 * s,
            (m[0][1] + m[1][0]) / s,
            (m[0][2] + m[2][0]) / s,
        )
    } else if m[1][1] > m[2][2] {
        let s = (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.0;
        Quaternion::new(
            (m[0][2] - m[2][0]) / s,
            (m[0][1] + m[1][0]) / s,
            0.25 * s,
            (m[1][2] + m[2][1]) / s,
        )
    } else {
        let s = (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.0;
        Quaternion::new(
            (m[1][0] - m[0][1]) / s,
            (m[0][2] + m[2][0]) / s,
            (m[1][2] + m[2][1]) / s,
            0.25 * s,
        )
    }
}

/// Roll/pitch/yaw (radians) from a quaternion.
///
///   roll  = atan2(2(wx + yz), 1 - 2(x² + y²))
///   pitch = asin(clamp(2(wy - zx), -1, 1))
///   yaw   = atan2(2(wz + xy), 1 - 2(y² + z²))
pub fn euler_from_quaternion(q: &Quaternion) -> EulerAngles {
    let Quaternion { w, x, y, z } = *q;
    EulerAngles {
        roll: (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y)),
        // Float overshoot near the poles would make asin return NaN.
        pitch: (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin(),
        yaw: (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z)),
    }
}

fn le_i32(data: &[u8], at: usize) -> f64 {
    i32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as f64 * SCALE
}

fn le_i16(data: &[u8], at: usize) -> f64 {
    i16::from_le_bytes([data[at], data[at + 1]]) as f64 * SCALE
}

/// Decode a SLAM packet into a [`Pose`].
///
/// Packet layout:
/// - `[0]`: 0x01 (response indicator)
/// - `[1..2]`: 0xA2, 0x33 (command echo)
/// - `[3..6]`: uint32 LE timestamp (microseconds)
/// - `[7..18]`: 3x int32 LE translation (scaled by 2^-14)
/// - `[19..26]`: quaternion [w, x, y, z] as 4x int16 LE (scaled by 2^-14)
/// - `[27..62]`: extended data, layout unconfirmed
///
/// Packets shorter than 63 bytes are accepted down to 27; the missing tail of
/// the extended region reads as zero.
pub fn decode_slam_packet(data: &[u8]) -> std::result::Result<Pose, DecodeError> {
    if data.len() < SLAM_MIN_LEN {
        return Err(DecodeError::Truncated { len: data.len() });
    }
    let header = [data[0], data[1], data[2]];
    if header != SLAM_HEADER {
        return Err(DecodeError::UnexpectedHeader { header });
    }

    let timestamp_us = u32::from_le_bytes([data[3], data[4], data[5], data[6]]);
    let position = [le_i32(data, 7), le_i32(data, 11), le_i32(data, 15)];
    let orientation = Quaternion::new(
        le_i16(data, 19),
        le_i16(data, 21),
        le_i16(data, 23),
        le_i16(data, 25),
    );

    let mut extended = [0u8; EXTENDED_LEN];
    let tail = &data[SLAM_MIN_LEN..data.len().min(REPORT_SIZE)];
    extended[..tail.len()].copy_from_slice(tail);

    Ok(Pose {
        position,
        orientation,
        timestamp_us,
        host_timestamp_s: 0.0,
        extended: ExtendedTelemetry(extended),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    // Example packet captured from a static device.
    const EXAMPLE_PACKET: [u8; 63] = [
        0x01, 0xa2, 0x33, 0x6b, 0xd1, 0x25, 0x5f, 0x58, 0x01, 0x00, 0x00, 0x1e, 0x00, 0x00,
        0x00, 0xc3, 0x01, 0x00, 0x00, 0x62, 0xc0, 0x3a, 0x03, 0x2d, 0x06, 0x5a, 0xfd, 0x56,
        0xc0, 0xf3, 0x05, 0x72, 0x06, 0xa9, 0x05, 0x6c, 0x3f, 0xa0, 0x56, 0x7d, 0x00, 0xf3,
        0xff, 0xf2, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x09, 0x00, 0x07,
        0x00, 0x2b, 0x41, 0x00, 0x00, 0x00, 0x00,
    ];

    fn synthetic_packet(ts: u32, pos: [i32; 3], quat: [i16; 4]) -> [u8; 63] {
        let mut p = [0u8; 63];
        p[..3].copy_from_slice(&SLAM_HEADER);
        p[3..7].copy_from_slice(&ts.to_le_bytes());
        for (i, v) in pos.iter().enumerate() {
            p[7 + 4 * i..11 + 4 * i].copy_from_slice(&v.to_le_bytes());
        }
        for (i, v) in quat.iter().enumerate() {
            p[19 + 2 * i..21 + 2 * i].copy_from_slice(&v.to_le_bytes());
        }
        p
    }

    #[test]
    fn test_build_command() {
        let buf = build_command(CMD_UUID);
        assert_eq!(buf[0], 0x02);
        assert_eq!(&buf[1..5], CMD_UUID);
        assert!(buf[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_build_mode_commands() {
        let cfg = build_configure_cmd(true, 0, false);
        assert_eq!(&cfg[..6], &[0x02, 0x19, 0x95, 0x01, 0x00, 0x00]);
        let start = build_edge_stream_cmd(1, true, false);
        assert_eq!(&start[..6], &[0x02, 0xA2, 0x33, 0x01, 0x01, 0x00]);
        let stop = build_edge_stream_cmd(0, false, false);
        assert_eq!(&stop[..6], &[0x02, 0xA2, 0x33, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_validate_response() {
        let mut resp = [0u8; 63];
        resp[0] = 0x01;
        resp[1..5].copy_from_slice(CMD_UUID);
        resp[5] = b'X';
        let offset = validate_response(&resp, CMD_UUID).unwrap();
        assert_eq!(offset, 5);
        assert_eq!(parse_response(&resp, CMD_UUID).unwrap()[0], b'X');
    }

    #[test]
    fn test_echo_ok_iff_bytes_match() {
        for cmd in [CMD_UUID, CMD_VERSION, CMD_FEATURES, CMD_CONFIGURE, CMD_EDGE_STREAM] {
            let mut resp = [0u8; 63];
            resp[0] = PREFIX_DEVICE_TO_HOST;
            resp[1..1 + cmd.len()].copy_from_slice(cmd);
            assert!(parse_response(&resp, cmd).is_ok());

            for i in 0..cmd.len() {
                let mut bad = resp;
                bad[1 + i] ^= 0xFF;
                let err = parse_response(&bad, cmd).unwrap_err();
                assert!(matches!(err, Xr50Error::EchoMismatch { .. }));
            }
        }
    }

    #[test]
    fn test_bad_marker_is_protocol_error() {
        let mut resp = [0u8; 63];
        resp[1..5].copy_from_slice(CMD_UUID);
        let err = parse_response(&resp, CMD_UUID).unwrap_err();
        assert!(matches!(err, Xr50Error::InvalidResponse(0x00)));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(parse_response(&[], CMD_UUID).is_err());
    }

    #[test]
    fn test_short_response_is_echo_mismatch() {
        let err = validate_response(&[0x01, 0xFD], CMD_UUID).unwrap_err();
        assert!(matches!(err, Xr50Error::EchoMismatch { .. }));
    }

    #[test]
    fn test_extract_string_and_features() {
        assert_eq!(extract_string(b"XR50-1234\0garbage"), "XR50-1234");
        assert_eq!(extract_string(b"no-nul"), "no-nul");
        let f = parse_features(&[0x07, 0x04, 0x00, 0x00]);
        assert!(f.contains(Features::EDGE_MODE | Features::MIXED_MODE | Features::STEREO));
        assert!(f.contains(Features::EYE_TRACKING));
        assert!(!f.contains(Features::RGB));
        assert_eq!(parse_features(&[0x01]), Features::empty());
    }

    #[test]
    fn test_decode_example_packet() {
        let pose = decode_slam_packet(&EXAMPLE_PACKET).unwrap();

        assert_eq!(pose.timestamp_us, 1596313963);

        assert!((pose.position[0] - 0.0210).abs() < 1e-4);
        assert!((pose.position[1] - 0.0018).abs() < 1e-4);
        assert!((pose.position[2] - 0.0275).abs() < 1e-4);

        let q = pose.orientation;
        assert!((q.w - (-0.9940)).abs() < 1e-3);
        assert!((q.x - 0.0504).abs() < 1e-3);
        assert!((q.y - 0.0965).abs() < 1e-3);
        assert!((q.z - (-0.0414)).abs() < 1e-3);
        assert!((q.norm() - 1.0).abs() < 0.01);

        assert_eq!(&pose.extended.as_bytes()[..], &EXAMPLE_PACKET[27..]);
    }

    #[test]
    fn test_decode_is_deterministic() {
        assert_eq!(
            decode_slam_packet(&EXAMPLE_PACKET).unwrap(),
            decode_slam_packet(&EXAMPLE_PACKET).unwrap()
        );
    }

    #[test]
    fn test_fixed_point_scale() {
        for v in [i32::MIN, -16384, -1, 0, 1, 344, 16384, i32::MAX] {
            let packet = synthetic_packet(0, [v, 0, 0], [16384, 0, 0, 0]);
            let pose = decode_slam_packet(&packet).unwrap();
            assert!((pose.position[0] - v as f64 / 16384.0).abs() < 1e-9);
        }
        for v in [i16::MIN, -16384, 0, 826, 16384, i16::MAX] {
            let pose = decode_slam_packet(&synthetic_packet(0, [0; 3], [v, v, v, v])).unwrap();
            assert!((pose.orientation.w - v as f64 / 16384.0).abs() < 1e-12);
            // 16-bit fixed point bounds every component by 2.
            assert!(pose.orientation.z.abs() <= 2.0);
        }
    }

    #[test]
    fn test_decode_rejects_truncated_and_foreign() {
        assert_eq!(
            decode_slam_packet(&EXAMPLE_PACKET[..26]),
            Err(DecodeError::Truncated { len: 26 })
        );
        assert!(decode_slam_packet(&[]).is_err());

        let mut foreign = EXAMPLE_PACKET;
        foreign[1] = 0xFD;
        assert!(matches!(
            decode_slam_packet(&foreign),
            Err(DecodeError::UnexpectedHeader { .. })
        ));
    }

    #[test]
    fn test_decode_minimal_packet_zero_fills_extended() {
        let pose = decode_slam_packet(&EXAMPLE_PACKET[..30]).unwrap();
        assert_eq!(&pose.extended.as_bytes()[..3], &EXAMPLE_PACKET[27..30]);
        assert!(pose.extended.as_bytes()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_timestamp_wraparound() {
        assert_eq!(timestamp_delta_us(4294967290, 5), 11);
        assert_eq!(timestamp_delta_us(100, 1150), 1050);

        let wrapped = synthetic_packet(4294967290, [0; 3], [16384, 0, 0, 0]);
        let a = decode_slam_packet(&wrapped).unwrap();
        let b = decode_slam_packet(&synthetic_packet(5, [0; 3], [16384, 0, 0, 0])).unwrap();
        assert_eq!(b.delta_us(&a), 11);
    }

    #[test]
    fn test_matrix_identity() {
        let m = matrix_from_quaternion(&Quaternion::IDENTITY);
        for (i, row) in m.iter().enumerate() {
            for (j, v) in row.iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((v - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_matrix_quaternion_round_trip_on_known_pose() {
        let q = decode_slam_packet(&EXAMPLE_PACKET).unwrap().orientation;
        let n = q.norm();
        let q = Quaternion::new(q.w / n, q.x / n, q.y / n, q.z / n);

        let back = quaternion_from_matrix(&matrix_from_quaternion(&q));
        // q and -q encode the same rotation.
        let sign = if back.w * q.w < 0.0 { -1.0 } else { 1.0 };
        assert!((back.w * sign - q.w).abs() < 1e-9);
        assert!((back.x * sign - q.x).abs() < 1e-9);
        assert!((back.y * sign - q.y).abs() < 1e-9);
        assert!((back.z * sign - q.z).abs() < 1e-9);
    }

    #[test]
    fn test_quaternion_from_matrix_all_branches() {
        // 180° about X, Y and Z hit the three non-trace branches.
        let cases = [
            ([[1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, -1.0]], [0.0, 1.0, 0.0, 0.0]),
            ([[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]], [0.0, 0.0, 1.0, 0.0]),
            ([[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]], [0.0, 0.0, 0.0, 1.0]),
        ];
        for (m, expected) in cases {
            let q = quaternion_from_matrix(&m).to_wxyz();
            for (a, b) in q.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-12, "{:?} != {:?}", q, expected);
            }
        }
    }

    #[test]
    fn test_euler_single_axis() {
        let half = std::f64::consts::FRAC_PI_4;
        let about_x = Quaternion::new(half.cos(), half.sin(), 0.0, 0.0);
        let e = euler_from_quaternion(&about_x);
        assert!((e.roll - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
        assert!(e.pitch.abs() < 1e-9);
        assert!(e.yaw.abs() < 1e-9);

        let about_z = Quaternion::new(half.cos(), 0.0, 0.0, half.sin());
        let e = euler_from_quaternion(&about_z);
        assert!((e.yaw - std::f64::consts::FRAC_PI_2).abs() < 1e-9);
    }

    #[test]
    fn test_euler_pitch_clamped_at_pole() {
        // Slightly denormalized 90° pitch: 2(wy - zx) > 1 without the clamp.
        let s = std::f64::consts::FRAC_1_SQRT_2 + 1e-6;
        let e = euler_from_quaternion(&Quaternion::new(s, 0.0, s, 0.0));
        assert!(!e.pitch.is_nan());
        assert!((e.pitch - std::f64::consts::FRAC_PI_2).abs() < 1e-6);
    }
}
