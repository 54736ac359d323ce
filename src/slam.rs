//! SLAM telemetry streaming.
//!
//! A [`StreamEngine`] owns one interrupt transfer on a dedicated thread. The
//! transfer completion handler only resubmits, decodes, dispatches and flips
//! atomics; halt clearing, backoff and resubmission after an error all run on
//! the loop's own iteration. [`SlamStream`] is the device-bound session on top.

use crate::config::StreamConfig;
use crate::device::Device;
use crate::protocol;
use crate::types::{Pose, SlamMode};
use crate::{Result, Xr50Error};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Recovery attempts allowed before the stream is declared failed.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;
/// Timeout of each event-handling call of the loop.
pub const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Recovery backoff is this step times the attempt number.
pub const RECOVERY_BACKOFF_STEP: Duration = Duration::from_millis(50);
/// Bounded wait for the cancelled transfer to come back on shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

const QUEUE_POLL: Duration = Duration::from_millis(50);

/// Outcome of one interrupt transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

/// A finished transfer as seen by the completion handler.
///
/// Exposes the received bytes and resubmission of the same transfer, and
/// nothing else: no halt clearing, no sleeping, no control traffic.
pub struct Completion<'a> {
    status: TransferStatus,
    data: &'a [u8],
    resubmit: &'a mut dyn FnMut() -> rusb::Result<()>,
}

impl<'a> Completion<'a> {
    pub fn new(
        status: TransferStatus,
        data: &'a [u8],
        resubmit: &'a mut dyn FnMut() -> rusb::Result<()>,
    ) -> Self {
        Self {
            status,
            data,
            resubmit,
        }
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    /// Bytes received, already copied out of the transfer buffer.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn resubmit(&mut self) -> rusb::Result<()> {
        (self.resubmit)()
    }
}

/// The telemetry endpoint as driven by the engine loop.
///
/// Implemented by [`crate::usb::InterruptTransfer`]; tests use a scripted source.
pub trait TransferSource: Send {
    /// Submit the transfer. Only called when it is not in flight.
    fn submit(&mut self) -> rusb::Result<()>;

    /// Process pending USB events for at most `timeout`, invoking
    /// `on_complete` for the transfer if it finished.
    fn handle_events(
        &mut self,
        timeout: Duration,
        on_complete: &mut dyn FnMut(Completion<'_>),
    ) -> rusb::Result<()>;

    /// Clear a halt condition on the endpoint.
    fn clear_halt(&mut self) -> rusb::Result<()>;

    /// Cancel the transfer if it is in flight.
    fn cancel(&mut self) -> rusb::Result<()>;
}

/// Lifecycle of a stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle = 0,
    Starting = 1,
    Streaming = 2,
    Recovering = 3,
    Stopped = 4,
    Failed = 5,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => StreamState::Starting,
            2 => StreamState::Streaming,
            3 => StreamState::Recovering,
            4 => StreamState::Stopped,
            5 => StreamState::Failed,
            _ => StreamState::Idle,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Stopped | StreamState::Failed)
    }
}

/// Why a stream ended.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// `stop()` was called.
    Requested = 1,
    /// The device disconnected.
    DeviceGone = 2,
    /// The first transfer could not be submitted.
    StartFailed = 3,
    /// Recovery attempts ran out.
    RecoveryExhausted = 4,
}

impl StreamEnd {
    /// The error a pull consumer sees once the stream ended this way.
    pub fn to_error(self) -> Xr50Error {
        match self {
            StreamEnd::Requested => Xr50Error::StreamStopped,
            StreamEnd::DeviceGone => Xr50Error::Disconnected,
            StreamEnd::StartFailed => Xr50Error::StartFailed,
            StreamEnd::RecoveryExhausted => Xr50Error::RecoveryExhausted(MAX_RECOVERY_ATTEMPTS),
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(StreamEnd::Requested),
            2 => Some(StreamEnd::DeviceGone),
            3 => Some(StreamEnd::StartFailed),
            4 => Some(StreamEnd::RecoveryExhausted),
            _ => None,
        }
    }
}

/// Lifecycle notifications delivered to observers registered with
/// [`SlamStream::on_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StateChanged(StreamState),
    /// A transfer completed with an error status.
    TransferError { status: TransferStatus, frames: u64 },
    /// Recovery succeeded on this attempt.
    Recovered { attempt: u32 },
    Ended(StreamEnd),
}

pub type PoseCallback = Arc<dyn Fn(Pose) + Send + Sync>;
pub type EventObserver = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Counters and flags shared between the loop thread and its owners.
pub(crate) struct StreamShared {
    running: AtomicBool,
    state: AtomicU8,
    end: AtomicU8,
    frames: AtomicU64,
    /// 0 when no recovery is requested, otherwise the current attempt number.
    recovery: AtomicU32,
    device_gone: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            state: AtomicU8::new(StreamState::Idle as u8),
            end: AtomicU8::new(0),
            frames: AtomicU64::new(0),
            recovery: AtomicU32::new(0),
            device_gone: AtomicBool::new(false),
        }
    }

    fn reset(&self) {
        self.running.store(false, Ordering::Release);
        self.state.store(StreamState::Idle as u8, Ordering::Release);
        self.end.store(0, Ordering::Release);
        self.frames.store(0, Ordering::Release);
        self.recovery.store(0, Ordering::Release);
        self.device_gone.store(false, Ordering::Release);
    }

    pub(crate) fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn end(&self) -> Option<StreamEnd> {
        StreamEnd::from_u8(self.end.load(Ordering::Acquire))
    }

    pub(crate) fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn request_recovery(&self) {
        let _ = self
            .recovery
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
    }

    fn mark_device_gone(&self) {
        self.device_gone.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}

/// Everything the completion handler may touch.
struct Dispatcher {
    shared: Arc<StreamShared>,
    /// Host clock origin for `Pose::host_timestamp_s`.
    epoch: Instant,
    callbacks: Arc<[PoseCallback]>,
    observers: Arc<[EventObserver]>,
}

impl Dispatcher {
    fn emit(&self, event: StreamEvent) {
        for observer in self.observers.iter() {
            observer(&event);
        }
    }

    fn set_state(&self, state: StreamState) {
        let prev = self.shared.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            log::debug!("SLAM stream {:?} -> {:?}", StreamState::from_u8(prev), state);
            self.emit(StreamEvent::StateChanged(state));
        }
    }

    fn finish(&self, state: StreamState, end: StreamEnd) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.end.store(end as u8, Ordering::Release);
        self.set_state(state);
        log::info!(
            "SLAM stream ended ({:?}) after {} frames",
            end,
            self.shared.frames()
        );
        self.emit(StreamEvent::Ended(end));
    }

    fn on_complete(&self, mut completion: Completion<'_>) {
        let shared = &*self.shared;
        let status = completion.status();

        if status == TransferStatus::Completed {
            if !shared.is_running() {
                return;
            }
            // Resubmit first; the packet was already copied out.
            match completion.resubmit() {
                Ok(()) => {}
                Err(rusb::Error::NoDevice) => {
                    log::warn!("XR50 disconnected during resubmit");
                    shared.mark_device_gone();
                    return;
                }
                Err(e) => {
                    log::warn!("SLAM resubmit failed: {}", e);
                    shared.request_recovery();
                }
            }

            match protocol::decode_slam_packet(completion.data()) {
                Ok(mut pose) => {
                    pose.host_timestamp_s = self.epoch.elapsed().as_secs_f64();
                    let frame = shared.frames.fetch_add(1, Ordering::AcqRel);
                    if frame < 3 {
                        log::trace!("SLAM packet #{}: {:02x?}", frame, completion.data());
                    }
                    for callback in self.callbacks.iter() {
                        callback(pose);
                    }
                }
                Err(e) => log::trace!("Skipping SLAM packet: {}", e),
            }
            return;
        }

        if status == TransferStatus::Cancelled || !shared.is_running() {
            return;
        }
        let frames = shared.frames();
        log::warn!("SLAM transfer {:?} after {} frames", status, frames);
        self.emit(StreamEvent::TransferError { status, frames });
        if status == TransferStatus::NoDevice {
            shared.mark_device_gone();
        } else {
            shared.request_recovery();
        }
    }
}

/// The streaming loop thread for one transfer source.
pub struct StreamEngine {
    shared: Arc<StreamShared>,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl StreamEngine {
    /// Spawn the loop and wait for the first submission.
    ///
    /// Returns once the stream is `Streaming`, or `Err(StartFailed)` after it
    /// went to `Failed`.
    pub fn spawn<S>(
        source: S,
        callbacks: Vec<PoseCallback>,
        observers: Vec<EventObserver>,
        config: &StreamConfig,
    ) -> Result<Self>
    where
        S: TransferSource + 'static,
    {
        Self::spawn_with(
            Arc::new(StreamShared::new()),
            source,
            callbacks.into(),
            observers.into(),
            config.start_timeout,
        )
    }

    pub(crate) fn spawn_with<S>(
        shared: Arc<StreamShared>,
        source: S,
        callbacks: Arc<[PoseCallback]>,
        observers: Arc<[EventObserver]>,
        start_timeout: Duration,
    ) -> Result<Self>
    where
        S: TransferSource + 'static,
    {
        shared.reset();
        shared.running.store(true, Ordering::Release);
        let dispatcher = Dispatcher {
            shared: shared.clone(),
            epoch: Instant::now(),
            callbacks,
            observers,
        };
        dispatcher.set_state(StreamState::Starting);

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<bool>(1);

        let spawned = std::thread::Builder::new()
            .name("xr50-slam".into())
            .spawn(move || {
                // Dropped on exit, which is what `wait` observes.
                let _done = done_tx;
                run_stream(source, dispatcher, stop_rx, ready_tx);
            });
        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                shared.running.store(false, Ordering::Release);
                shared.end.store(StreamEnd::StartFailed as u8, Ordering::Release);
                shared.state.store(StreamState::Failed as u8, Ordering::Release);
                return Err(Xr50Error::Spawn(e));
            }
        };

        let mut engine = StreamEngine {
            shared,
            stop_tx: Some(stop_tx),
            done_rx,
            thread: Some(thread),
        };
        match ready_rx.recv_timeout(start_timeout) {
            Ok(true) => Ok(engine),
            Ok(false) | Err(RecvTimeoutError::Disconnected) => {
                engine.join();
                Err(Xr50Error::StartFailed)
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!("SLAM thread did not report start within {:?}", start_timeout);
                engine.stop();
                Err(Xr50Error::StartFailed)
            }
        }
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn end(&self) -> Option<StreamEnd> {
        self.shared.end()
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frames()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Block until the loop thread has exited or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<StreamEnd> {
        match self.done_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => self.shared.end(),
            _ => None,
        }
    }

    /// Stop the loop and join its thread. Safe to call repeatedly.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        // Disconnecting wakes a recovery backoff early.
        self.stop_tx.take();
        self.join();
    }

    fn join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            // Called from a pose callback; the loop exits on its own.
            log::debug!("SLAM stop requested from the stream thread");
            return;
        }
        if thread.join().is_err() {
            log::error!("SLAM thread panicked");
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_stream<S: TransferSource>(
    mut source: S,
    dispatcher: Dispatcher,
    stop_rx: Receiver<()>,
    ready: Sender<bool>,
) {
    let shared = dispatcher.shared.clone();

    if let Err(e) = source.submit() {
        log::error!("Failed to submit SLAM transfer: {}", e);
        dispatcher.finish(StreamState::Failed, StreamEnd::StartFailed);
        let _ = ready.send(false);
        return;
    }
    dispatcher.set_state(StreamState::Streaming);
    let _ = ready.send(true);
    log::info!("SLAM stream started");

    let mut end = StreamEnd::Requested;
    let on_complete: &mut dyn FnMut(Completion<'_>) =
        &mut |c: Completion<'_>| dispatcher.on_complete(c);

    while shared.is_running() {
        match source.handle_events(EVENT_POLL_INTERVAL, on_complete) {
            Ok(()) | Err(rusb::Error::Interrupted) | Err(rusb::Error::Timeout) => {}
            Err(rusb::Error::NoDevice) => {
                shared.mark_device_gone();
                break;
            }
            Err(e) => log::warn!("SLAM event handling failed: {}", e),
        }

        let attempt = shared.recovery.load(Ordering::Acquire);
        if attempt == 0 || !shared.is_running() {
            continue;
        }
        if attempt > MAX_RECOVERY_ATTEMPTS {
            log::error!(
                "SLAM recovery failed after {} attempts",
                MAX_RECOVERY_ATTEMPTS
            );
            end = StreamEnd::RecoveryExhausted;
            break;
        }

        dispatcher.set_state(StreamState::Recovering);
        log::info!("SLAM recovery attempt {}/{}", attempt, MAX_RECOVERY_ATTEMPTS);
        match source.clear_halt() {
            Ok(()) | Err(rusb::Error::NotFound) => {}
            Err(rusb::Error::NoDevice) => {
                shared.mark_device_gone();
                break;
            }
            Err(e) => log::warn!("clear_halt failed: {}", e),
        }

        if let Err(RecvTimeoutError::Disconnected) =
            stop_rx.recv_timeout(RECOVERY_BACKOFF_STEP * attempt)
        {
            break;
        }
        if !shared.is_running() {
            break;
        }

        match source.submit() {
            Ok(()) => {
                shared.recovery.store(0, Ordering::Release);
                dispatcher.set_state(StreamState::Streaming);
                log::info!("SLAM stream recovered on attempt {}", attempt);
                dispatcher.emit(StreamEvent::Recovered { attempt });
            }
            Err(rusb::Error::NoDevice) => {
                shared.mark_device_gone();
                break;
            }
            Err(e) => {
                log::warn!("SLAM resubmit attempt {} failed: {}", attempt, e);
                shared.recovery.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    if shared.device_gone.load(Ordering::Acquire) {
        end = StreamEnd::DeviceGone;
    }
    // No callback may run past this point.
    shared.running.store(false, Ordering::Release);
    if let Err(e) = source.cancel() {
        log::debug!("SLAM cancel: {}", e);
    }
    let _ = source.handle_events(DRAIN_TIMEOUT, &mut |_| {});

    let state = match end {
        StreamEnd::RecoveryExhausted => StreamState::Failed,
        _ => StreamState::Stopped,
    };
    dispatcher.finish(state, end);
}

/// Bounded queue of poses fed by a stream callback.
///
/// Created by [`SlamStream::subscribe`]. When the consumer falls behind, new
/// samples are dropped. Once the stream has ended and the queue is drained,
/// receiving fails with the reason the stream ended: [`Xr50Error::StreamStopped`]
/// after `stop()`, [`Xr50Error::Disconnected`] or
/// [`Xr50Error::RecoveryExhausted`] when the stream was lost.
///
/// A queue whose session has not been started yet waits for it to start;
/// use [`PoseQueue::recv_timeout`] to bound that wait.
pub struct PoseQueue {
    receiver: Receiver<Pose>,
    shared: Arc<StreamShared>,
}

impl PoseQueue {
    /// Receive the next pose (blocks until available or the stream ends).
    pub fn recv(&self) -> Result<Pose> {
        loop {
            match self.receiver.recv_timeout(QUEUE_POLL) {
                Ok(pose) => return Ok(pose),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(err) = self.ended() {
                        return Err(err);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Err(self.end_reason()),
            }
        }
    }

    /// Try to receive a pose without blocking.
    pub fn try_recv(&self) -> Option<Pose> {
        self.receiver.try_recv().ok()
    }

    /// Receive a pose with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Pose> {
        self.receiver.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => self.ended().unwrap_or(Xr50Error::RecvTimeout),
            RecvTimeoutError::Disconnected => self.end_reason(),
        })
    }

    /// Why the stream ended, once it has.
    fn ended(&self) -> Option<Xr50Error> {
        self.shared
            .state()
            .is_terminal()
            .then(|| self.end_reason())
    }

    fn end_reason(&self) -> Xr50Error {
        self.shared
            .end()
            .map_or(Xr50Error::StreamStopped, StreamEnd::to_error)
    }

    /// Number of queued poses.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// SLAM session bound to an open device.
///
/// Borrows the device exclusively, so the device outlives the session and
/// no other command is sent while it exists. Dropping the session stops it.
///
/// ```no_run
/// use xr50::{Enumerator, SlamMode};
///
/// let enumerator = Enumerator::new()?;
/// let mut device = enumerator.open_first()?;
/// let mut slam = device.slam();
/// slam.on_pose(|pose| println!("{:?}", pose.position))?;
/// slam.start(SlamMode::Edge)?;
/// std::thread::sleep(std::time::Duration::from_secs(5));
/// slam.stop();
/// # Ok::<(), xr50::Xr50Error>(())
/// ```
pub struct SlamStream<'d> {
    device: &'d mut Device,
    config: StreamConfig,
    callbacks: Vec<PoseCallback>,
    observers: Vec<EventObserver>,
    shared: Arc<StreamShared>,
    engine: Option<StreamEngine>,
    mode: Option<SlamMode>,
}

impl<'d> SlamStream<'d> {
    pub(crate) fn new(device: &'d mut Device, config: StreamConfig) -> Self {
        Self {
            device,
            config,
            callbacks: Vec::new(),
            observers: Vec::new(),
            shared: Arc::new(StreamShared::new()),
            engine: None,
            mode: None,
        }
    }

    pub fn device(&self) -> &Device {
        self.device
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Register a pose callback. Callbacks run on the stream thread, in
    /// registration order, and should return quickly.
    pub fn on_pose<F>(&mut self, callback: F) -> Result<()>
    where
        F: Fn(Pose) + Send + Sync + 'static,
    {
        self.ensure_idle()?;
        self.callbacks.push(Arc::new(callback));
        Ok(())
    }

    /// Register a lifecycle observer.
    pub fn on_event<F>(&mut self, observer: F) -> Result<()>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.ensure_idle()?;
        self.observers.push(Arc::new(observer));
        Ok(())
    }

    /// Register a bounded queue of poses for pull-style consumers.
    pub fn subscribe(&mut self, capacity: usize) -> Result<PoseQueue> {
        let (sender, receiver) = crossbeam_channel::bounded(capacity.max(1));
        self.on_pose(move |pose| {
            if let Err(TrySendError::Full(_)) = sender.try_send(pose) {
                log::trace!("Pose queue full, dropping sample");
            }
        })?;
        Ok(PoseQueue {
            receiver,
            shared: self.shared.clone(),
        })
    }

    /// Configure the device for `mode`, start the edge stream and spawn the
    /// streaming thread.
    pub fn start(&mut self, mode: SlamMode) -> Result<()> {
        self.ensure_idle()?;
        // Reap a previous session that ended on its own.
        self.stop();

        let (edge, embedded_algo) = mode.configure_flags();
        log::info!("Starting SLAM in {:?} mode", mode);
        self.device
            .configure(edge, self.config.uvc_mode, embedded_algo)?;
        std::thread::sleep(self.config.configure_settle);
        self.device
            .start_edge_stream(edge, self.config.rotation_enabled, self.config.flipped)?;

        let source = self.device.interrupt_transfer(self.config.transfer_timeout)?;
        let engine = StreamEngine::spawn_with(
            self.shared.clone(),
            source,
            self.callbacks.clone().into(),
            self.observers.clone().into(),
            self.config.start_timeout,
        )?;
        self.engine = Some(engine);
        self.mode = Some(mode);
        Ok(())
    }

    /// Stop streaming and join the thread. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
    }

    pub fn mode(&self) -> Option<SlamMode> {
        self.mode
    }

    pub fn frame_count(&self) -> u64 {
        self.shared.frames()
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn end(&self) -> Option<StreamEnd> {
        self.shared.end()
    }

    /// Block until the stream ends on its own or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Option<StreamEnd> {
        match &self.engine {
            Some(engine) => engine.wait(timeout),
            None => self.shared.end(),
        }
    }

    /// Whether the streaming thread is running.
    pub fn is_active(&self) -> bool {
        self.engine.as_ref().is_some_and(StreamEngine::is_running)
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_active() {
            Err(Xr50Error::StreamActive)
        } else {
            Ok(())
        }
    }
}

impl Drop for SlamStream<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}
