use crate::error::TransferPhase;
use crate::protocol::{self, MAX_OPCODE_LEN, REPORT_SIZE};
use crate::types::Features;
use crate::{Result, Xr50Error};
use std::sync::Arc;
use std::time::Duration;

/// The two halves of a HID command transaction on the control endpoint.
///
/// Implemented for rusb device handles in [`crate::usb`]; tests substitute a
/// scripted channel.
pub trait ReportChannel: Send + Sync {
    /// HID SET_REPORT carrying a 63-byte command frame.
    fn set_report(&self, frame: &[u8; REPORT_SIZE], timeout: Duration) -> rusb::Result<usize>;

    /// HID GET_REPORT into `buf`. Returns the number of bytes read.
    fn get_report(&self, buf: &mut [u8; REPORT_SIZE], timeout: Duration) -> rusb::Result<usize>;
}

impl<C: ReportChannel + ?Sized> ReportChannel for Arc<C> {
    fn set_report(&self, frame: &[u8; REPORT_SIZE], timeout: Duration) -> rusb::Result<usize> {
        (**self).set_report(frame, timeout)
    }

    fn get_report(&self, buf: &mut [u8; REPORT_SIZE], timeout: Duration) -> rusb::Result<usize> {
        (**self).get_report(buf, timeout)
    }
}

/// Identity read from the device during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uuid: String,
    pub version: String,
    pub features: Features,
}

/// HID command/response transport over control transfers.
///
/// Every command is a SET_REPORT of `[0x02, opcode..., 0...]` followed by a
/// GET_REPORT of the same size whose bytes 1.. echo the opcode.
pub struct HidTransport<C> {
    channel: C,
    timeout: Duration,
}

impl<C: ReportChannel> HidTransport<C> {
    pub fn new(channel: C, timeout: Duration) -> Self {
        Self { channel, timeout }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Send a command and read back the raw 63-byte response frame.
    fn exchange(&self, cmd: &[u8]) -> Result<[u8; REPORT_SIZE]> {
        if cmd.len() > MAX_OPCODE_LEN {
            return Err(Xr50Error::CommandTooLong(cmd.len()));
        }
        let send_buf = protocol::build_command(cmd);
        self.channel
            .set_report(&send_buf, self.timeout)
            .map_err(|e| Xr50Error::from_usb(e, TransferPhase::SetReport))?;

        let mut response = [0u8; REPORT_SIZE];
        let len = self
            .channel
            .get_report(&mut response, self.timeout)
            .map_err(|e| Xr50Error::from_usb(e, TransferPhase::GetReport))?;
        // Bytes past a short read stay zero and fail the echo check below.
        response[len.min(REPORT_SIZE)..].fill(0);
        Ok(response)
    }

    /// Execute one command/response transaction.
    ///
    /// Returns at most `resp_len` payload bytes following the echoed opcode.
    pub fn transact(&self, cmd: &[u8], resp_len: usize) -> Result<Vec<u8>> {
        let response = self.exchange(cmd)?;
        let payload = protocol::parse_response(&response, cmd)?;
        Ok(payload[..resp_len.min(payload.len())].to_vec())
    }

    /// Like [`transact`](Self::transact) with the full payload.
    pub fn transaction(&self, cmd: &[u8]) -> Result<Vec<u8>> {
        self.transact(cmd, REPORT_SIZE)
    }

    /// Read UUID string from the device.
    pub fn read_uuid(&self) -> Result<String> {
        let payload = self.transaction(protocol::CMD_UUID)?;
        Ok(protocol::extract_string(&payload))
    }

    /// Read firmware version string from the device.
    pub fn read_version(&self) -> Result<String> {
        let payload = self.transaction(protocol::CMD_VERSION)?;
        Ok(protocol::extract_string(&payload))
    }

    /// Read features bitmap from the device.
    pub fn read_features(&self) -> Result<Features> {
        let payload = self.transact(protocol::CMD_FEATURES, 4)?;
        Ok(protocol::parse_features(&payload))
    }

    /// Run the three discovery queries in order. The first failure aborts.
    ///
    /// A response that does not follow the protocol here means the firmware
    /// speaks a different version, and is reported as such.
    pub fn discover(&self) -> Result<Identity> {
        let uuid = self.read_uuid().map_err(|e| version_mismatch("uuid", e))?;
        let version = self
            .read_version()
            .map_err(|e| version_mismatch("version", e))?;
        let features = self
            .read_features()
            .map_err(|e| version_mismatch("features", e))?;
        Ok(Identity {
            uuid,
            version,
            features,
        })
    }

    /// Send the configure command. The acknowledgment is unreliable and only logged.
    pub fn configure(&self, edge: bool, uvc_mode: u8, embedded_algo: bool) -> Result<()> {
        let cmd = protocol::configure_opcode(edge, uvc_mode, embedded_algo);
        self.command_unacked("configure", &cmd)
    }

    /// Send the edge stream start/stop command.
    pub fn edge_stream(&self, edge_mode: u8, rotation_enabled: bool, flipped: bool) -> Result<()> {
        let cmd = protocol::edge_stream_opcode(edge_mode, rotation_enabled, flipped);
        self.command_unacked("edge stream", &cmd)
    }

    fn command_unacked(&self, label: &str, cmd: &[u8]) -> Result<()> {
        let send_buf = protocol::build_command(cmd);
        self.channel
            .set_report(&send_buf, self.timeout)
            .map_err(|e| Xr50Error::from_usb(e, TransferPhase::SetReport))?;

        // Read response (may be all zeros, that's OK)
        let mut response = [0u8; REPORT_SIZE];
        match self.channel.get_report(&mut response, self.timeout) {
            Ok(len) => {
                let ack = &response[..len.min(REPORT_SIZE)];
                if let Err(e) = protocol::validate_response(ack, cmd) {
                    log::debug!("{} ack ignored: {}", label, e);
                }
            }
            Err(rusb::Error::NoDevice) => return Err(Xr50Error::DeviceGone),
            Err(e) => log::warn!("{} GET_REPORT failed: {} (continuing)", label, e),
        }
        Ok(())
    }
}

fn version_mismatch(query: &'static str, err: Xr50Error) -> Xr50Error {
    match err.kind() {
        crate::error::ErrorKind::Protocol => Xr50Error::VersionMismatch {
            query,
            source: Box::new(err),
        },
        _ => err,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// What the scripted device does for one transaction.
    #[derive(Clone)]
    pub(crate) enum Reply {
        /// Echo the command and append this payload.
        Echo(Vec<u8>),
        /// Return these raw bytes as the response frame.
        Raw(Vec<u8>),
        SetFails(rusb::Error),
        GetFails(rusb::Error),
    }

    #[derive(Default)]
    pub(crate) struct ScriptedChannel {
        replies: Mutex<VecDeque<Reply>>,
        pending: Mutex<Option<Reply>>,
        last_cmd: Mutex<Vec<u8>>,
        pub(crate) sent: Mutex<Vec<[u8; REPORT_SIZE]>>,
    }

    impl ScriptedChannel {
        pub(crate) fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }
    }

    impl ReportChannel for ScriptedChannel {
        fn set_report(&self, frame: &[u8; REPORT_SIZE], _: Duration) -> rusb::Result<usize> {
            self.sent.lock().unwrap().push(*frame);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::GetFails(rusb::Error::Timeout));
            if let Reply::SetFails(e) = reply {
                return Err(e);
            }
            *self.last_cmd.lock().unwrap() = frame[1..].to_vec();
            *self.pending.lock().unwrap() = Some(reply);
            Ok(REPORT_SIZE)
        }

        fn get_report(&self, buf: &mut [u8; REPORT_SIZE], _: Duration) -> rusb::Result<usize> {
            let reply = self.pending.lock().unwrap().take();
            let bytes = match reply {
                Some(Reply::Echo(payload)) => {
                    // Echo every opcode byte the host sent, trailing zeros included,
                    // then overwrite with the payload after the real opcode.
                    let cmd = self.last_cmd.lock().unwrap().clone();
                    let opcode_len = cmd.iter().rposition(|&b| b != 0).map_or(0, |p| p + 1);
                    let mut out = vec![protocol::PREFIX_DEVICE_TO_HOST];
                    out.extend_from_slice(&cmd[..opcode_len]);
                    out.extend_from_slice(&payload);
                    out
                }
                Some(Reply::Raw(bytes)) => bytes,
                Some(Reply::GetFails(e)) => return Err(e),
                Some(Reply::SetFails(_)) | None => return Err(rusb::Error::Pipe),
            };
            let n = bytes.len().min(REPORT_SIZE);
            buf[..n].copy_from_slice(&bytes[..n]);
            Ok(n)
        }
    }

    fn transport(replies: Vec<Reply>) -> HidTransport<ScriptedChannel> {
        HidTransport::new(ScriptedChannel::new(replies), Duration::from_millis(100))
    }

    #[test]
    fn test_transact_returns_payload_after_echo() {
        let hid = transport(vec![Reply::Echo(b"FW 1.2.3\0".to_vec())]);
        let payload = hid.transact(protocol::CMD_VERSION, 4).unwrap();
        assert_eq!(payload, b"FW 1");

        let sent = hid.channel().sent.lock().unwrap();
        assert_eq!(&sent[0][..3], &[0x02, 0x1C, 0x99]);
    }

    #[test]
    fn test_timeouts_report_phase() {
        let hid = transport(vec![Reply::SetFails(rusb::Error::Timeout)]);
        let err = hid.transaction(protocol::CMD_UUID).unwrap_err();
        assert!(matches!(err, Xr50Error::Timeout(TransferPhase::SetReport)));

        let hid = transport(vec![Reply::GetFails(rusb::Error::Timeout)]);
        let err = hid.transaction(protocol::CMD_UUID).unwrap_err();
        assert!(matches!(err, Xr50Error::Timeout(TransferPhase::GetReport)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_echo_mismatch_is_protocol_error() {
        let mut raw = vec![0x01, 0x1C, 0x98];
        raw.extend_from_slice(b"1.0");
        let hid = transport(vec![Reply::Raw(raw)]);
        let err = hid.transaction(protocol::CMD_VERSION).unwrap_err();
        assert!(matches!(err, Xr50Error::EchoMismatch { .. }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_rejects_oversized_opcode() {
        let hid = transport(vec![]);
        let err = hid.transaction(&[0u8; 63]).unwrap_err();
        assert!(matches!(err, Xr50Error::CommandTooLong(63)));
        assert!(hid.channel().sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_discover_reads_identity_in_order() {
        let hid = transport(vec![
            Reply::Echo(b"0123456789AB\0".to_vec()),
            Reply::Echo(b"3.2.1\0".to_vec()),
            Reply::Echo(vec![0x07, 0x10, 0x00, 0x00]),
        ]);
        let id = hid.discover().unwrap();
        assert_eq!(id.uuid, "0123456789AB");
        assert_eq!(id.version, "3.2.1");
        assert!(id.features.contains(Features::EDGE_MODE | Features::FACE_ID));

        let sent = hid.channel().sent.lock().unwrap();
        assert_eq!(&sent[0][1..5], protocol::CMD_UUID);
        assert_eq!(&sent[1][1..3], protocol::CMD_VERSION);
        assert_eq!(&sent[2][1..4], protocol::CMD_FEATURES);
    }

    #[test]
    fn test_discover_protocol_failure_is_version_mismatch() {
        let hid = transport(vec![
            Reply::Echo(b"uuid\0".to_vec()),
            Reply::Raw(vec![0x00; 63]),
        ]);
        let err = hid.discover().unwrap_err();
        assert!(matches!(
            err,
            Xr50Error::VersionMismatch { query: "version", .. }
        ));
        // Never reached the features query.
        assert_eq!(hid.channel().sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_discover_transport_failure_propagates() {
        let hid = transport(vec![Reply::GetFails(rusb::Error::NoDevice)]);
        assert!(matches!(hid.discover().unwrap_err(), Xr50Error::DeviceGone));
    }

    #[test]
    fn test_configure_ignores_bad_ack() {
        let hid = transport(vec![Reply::Raw(vec![0x00; 63])]);
        hid.configure(true, 0, false).unwrap();
        let sent = hid.channel().sent.lock().unwrap();
        assert_eq!(&sent[0][..6], &[0x02, 0x19, 0x95, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_edge_stream_set_failure_propagates() {
        let hid = transport(vec![Reply::SetFails(rusb::Error::Pipe)]);
        assert!(matches!(
            hid.edge_stream(1, true, false).unwrap_err(),
            Xr50Error::Usb(rusb::Error::Pipe)
        ));

        let hid = transport(vec![Reply::GetFails(rusb::Error::Timeout)]);
        hid.edge_stream(1, true, false).unwrap();
    }
}
