//! rusb/libusb backend.
//!
//! Control commands go through rusb's synchronous control transfers. The
//! telemetry stream needs a resubmittable asynchronous interrupt transfer,
//! which rusb does not wrap, so [`InterruptTransfer`] drives libusb directly
//! through `rusb::ffi`.

use crate::hid::ReportChannel;
use crate::protocol::{
    GET_REPORT_VALUE, HID_GET_REPORT, HID_INTERFACE, HID_SET_REPORT, REPORT_SIZE,
    REQUEST_TYPE_GET_REPORT, REQUEST_TYPE_SET_REPORT, SET_REPORT_VALUE,
};
use crate::slam::{Completion, TransferSource, TransferStatus};
use rusb::constants::*;
use rusb::{ffi, Context, DeviceHandle, UsbContext};
use std::cell::Cell;
use std::ffi::{c_int, c_uint, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

impl<T: UsbContext> ReportChannel for DeviceHandle<T> {
    fn set_report(&self, frame: &[u8; REPORT_SIZE], timeout: Duration) -> rusb::Result<usize> {
        self.write_control(
            REQUEST_TYPE_SET_REPORT,
            HID_SET_REPORT,
            SET_REPORT_VALUE,
            HID_INTERFACE as u16,
            frame,
            timeout,
        )
    }

    fn get_report(&self, buf: &mut [u8; REPORT_SIZE], timeout: Duration) -> rusb::Result<usize> {
        self.read_control(
            REQUEST_TYPE_GET_REPORT,
            HID_GET_REPORT,
            GET_REPORT_VALUE,
            HID_INTERFACE as u16,
            buf,
            timeout,
        )
    }
}

/// Map a libusb return code to a rusb error.
pub(crate) fn error_from_code(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

pub(crate) fn status_from_code(code: c_int) -> TransferStatus {
    match code {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

const BUFFER_LEN: usize = 64;
const NO_STATUS: c_int = -1;
/// Event pumps allowed for a cancelled transfer to come back before it is leaked.
const CANCEL_DRAIN_ROUNDS: usize = 20;

/// State reachable from the libusb callback through `user_data`.
struct CallbackShared {
    in_flight: AtomicBool,
    /// Status of a completion dispatched on a thread that was not pumping
    /// this transfer, waiting to be delivered by the owner.
    deferred: AtomicI32,
}

/// Completion handler installed for the duration of one `handle_events` call.
struct DispatchFrame<'a> {
    on_complete: &'a mut dyn FnMut(Completion<'_>),
}

thread_local! {
    static DISPATCH: Cell<Option<(*const CallbackShared, *mut c_void)>> = const { Cell::new(None) };
}

/// Single asynchronous interrupt IN transfer on the telemetry endpoint.
pub struct InterruptTransfer {
    handle: Arc<DeviceHandle<Context>>,
    context: Context,
    endpoint: u8,
    transfer: NonNull<ffi::libusb_transfer>,
    shared: Box<CallbackShared>,
    // Referenced by the transfer; must not move or drop while it is in flight.
    _buffer: Box<[u8; BUFFER_LEN]>,
}

// SAFETY: the raw transfer is only touched by the thread owning this value,
// or by libusb while in flight; the callback state is atomics only.
unsafe impl Send for InterruptTransfer {}

impl InterruptTransfer {
    pub fn new(
        handle: Arc<DeviceHandle<Context>>,
        context: Context,
        endpoint: u8,
        timeout: Duration,
    ) -> rusb::Result<Self> {
        // SAFETY: plain allocation, checked for null below.
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        let transfer = NonNull::new(raw).ok_or(rusb::Error::NoMem)?;
        let shared = Box::new(CallbackShared {
            in_flight: AtomicBool::new(false),
            deferred: AtomicI32::new(NO_STATUS),
        });
        let mut buffer = Box::new([0u8; BUFFER_LEN]);

        // SAFETY: the transfer was just allocated and is not submitted. The
        // buffer and callback state are boxed, so their addresses stay valid
        // for as long as this value lives.
        unsafe {
            let t = transfer.as_ptr();
            (*t).dev_handle = handle.as_raw();
            (*t).flags = 0;
            (*t).endpoint = endpoint;
            (*t).transfer_type = LIBUSB_TRANSFER_TYPE_INTERRUPT;
            (*t).timeout = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;
            (*t).buffer = buffer.as_mut_ptr();
            (*t).length = REPORT_SIZE as c_int;
            (*t).callback = on_transfer_complete;
            (*t).user_data = &*shared as *const CallbackShared as *mut c_void;
            (*t).num_iso_packets = 0;
        }

        Ok(Self {
            handle,
            context,
            endpoint,
            transfer,
            shared,
            _buffer: buffer,
        })
    }

    pub fn is_in_flight(&self) -> bool {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

impl TransferSource for InterruptTransfer {
    fn submit(&mut self) -> rusb::Result<()> {
        submit_raw(self.transfer.as_ptr(), &self.shared)
    }

    fn handle_events(
        &mut self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion<'_>),
    ) -> rusb::Result<()> {
        let mut frame = DispatchFrame { on_complete };

        let deferred = self.shared.deferred.swap(NO_STATUS, Ordering::AcqRel);
        if deferred != NO_STATUS {
            // SAFETY: the transfer completed and was not resubmitted, so
            // libusb no longer touches it.
            unsafe { deliver(self.transfer.as_ptr(), &self.shared, deferred, &mut frame) };
        }

        let owner = &*self.shared as *const CallbackShared;
        let frame_ptr = &mut frame as *mut DispatchFrame<'_> as *mut c_void;
        DISPATCH.with(|d| d.set(Some((owner, frame_ptr))));
        let result = self.context.handle_events(Some(timeout));
        DISPATCH.with(|d| d.set(None));
        result
    }

    fn clear_halt(&mut self) -> rusb::Result<()> {
        self.handle.clear_halt(self.endpoint)
    }

    fn cancel(&mut self) -> rusb::Result<()> {
        // SAFETY: cancelling a transfer that is not in flight is reported as
        // NOT_FOUND by libusb and has no other effect.
        let rc = unsafe { ffi::libusb_cancel_transfer(self.transfer.as_ptr()) };
        match rc {
            0 | LIBUSB_ERROR_NOT_FOUND => Ok(()),
            code => Err(error_from_code(code)),
        }
    }
}

impl Drop for InterruptTransfer {
    fn drop(&mut self) {
        if self.is_in_flight() {
            let _ = self.cancel();
            for _ in 0..CANCEL_DRAIN_ROUNDS {
                if !self.is_in_flight() {
                    break;
                }
                let _ = self.context.handle_events(Some(Duration::from_millis(10)));
            }
        }
        if self.is_in_flight() {
            // Freeing now would hand libusb dangling memory.
            log::error!("SLAM transfer still in flight at drop, leaking it");
            let shared = std::mem::replace(
                &mut self.shared,
                Box::new(CallbackShared {
                    in_flight: AtomicBool::new(false),
                    deferred: AtomicI32::new(NO_STATUS),
                }),
            );
            let buffer = std::mem::replace(&mut self._buffer, Box::new([0u8; BUFFER_LEN]));
            Box::leak(shared);
            Box::leak(buffer);
            return;
        }
        // SAFETY: not in flight, allocated by libusb_alloc_transfer.
        unsafe { ffi::libusb_free_transfer(self.transfer.as_ptr()) };
    }
}

fn submit_raw(transfer: *mut ffi::libusb_transfer, shared: &CallbackShared) -> rusb::Result<()> {
    // Marked before submitting: the completion may fire on another thread
    // before libusb_submit_transfer returns.
    shared.in_flight.store(true, Ordering::Release);
    // SAFETY: the transfer is fully initialized and not in flight.
    let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
    if rc == 0 {
        Ok(())
    } else {
        shared.in_flight.store(false, Ordering::Release);
        Err(error_from_code(rc))
    }
}

/// Copy the packet out of the transfer and hand it to the installed handler.
///
/// # Safety
/// `transfer` must be a completed transfer that libusb is not writing to.
unsafe fn deliver(
    transfer: *mut ffi::libusb_transfer,
    shared: &CallbackShared,
    status: c_int,
    frame: &mut DispatchFrame<'_>,
) {
    let len = ((*transfer).actual_length.max(0) as usize).min(BUFFER_LEN);
    let mut packet = [0u8; BUFFER_LEN];
    std::ptr::copy_nonoverlapping((*transfer).buffer, packet.as_mut_ptr(), len);

    let mut resubmit = || submit_raw(transfer, shared);
    let completion = Completion::new(status_from_code(status), &packet[..len], &mut resubmit);
    let on_complete = &mut *frame.on_complete;
    if catch_unwind(AssertUnwindSafe(|| on_complete(completion))).is_err() {
        log::error!("SLAM completion handler panicked; packet dropped");
    }
}

extern "system" fn on_transfer_complete(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data points at the boxed CallbackShared of the owning
    // InterruptTransfer, which outlives every in-flight transfer.
    let shared = unsafe { &*((*transfer).user_data as *const CallbackShared) };
    shared.in_flight.store(false, Ordering::Release);
    let status = unsafe { (*transfer).status };

    let owner = shared as *const CallbackShared;
    let frame = DISPATCH.with(|d| d.get()).filter(|(o, _)| *o == owner);
    match frame {
        Some((_, frame_ptr)) => {
            // SAFETY: the frame lives on the stack of handle_events, which is
            // the call currently dispatching this callback on this thread.
            let frame = unsafe { &mut *(frame_ptr as *mut DispatchFrame<'_>) };
            unsafe { deliver(transfer, shared, status, frame) };
        }
        None => shared.deferred.store(status, Ordering::Release),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(error_from_code(LIBUSB_ERROR_NO_DEVICE), rusb::Error::NoDevice);
        assert_eq!(error_from_code(LIBUSB_ERROR_PIPE), rusb::Error::Pipe);
        assert_eq!(error_from_code(LIBUSB_ERROR_BUSY), rusb::Error::Busy);
        assert_eq!(error_from_code(-1234), rusb::Error::Other);
    }

    #[test]
    fn test_transfer_status_codes() {
        assert_eq!(
            status_from_code(LIBUSB_TRANSFER_COMPLETED),
            TransferStatus::Completed
        );
        assert_eq!(status_from_code(LIBUSB_TRANSFER_STALL), TransferStatus::Stall);
        assert_eq!(
            status_from_code(LIBUSB_TRANSFER_NO_DEVICE),
            TransferStatus::NoDevice
        );
        assert_eq!(
            status_from_code(LIBUSB_TRANSFER_CANCELLED),
            TransferStatus::Cancelled
        );
        assert_eq!(status_from_code(99), TransferStatus::Error);
    }
}
