//! Session lifecycle above the stream engine: reopen the device after a
//! stream ends, with escalating backoff and a mode fallback.

use crate::config::StreamConfig;
use crate::enumerator::Enumerator;
use crate::slam::{PoseCallback, StreamEnd};
use crate::types::{Pose, SlamMode};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// How one supervised session went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// No device could be opened.
    OpenFailed,
    /// The device opened but streaming did not start.
    StartFailed,
    /// The stream ran and ended on its own.
    Ended { ran_for: Duration, end: StreamEnd },
}

/// What to do before the next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub delay: Duration,
    pub mode: SlamMode,
}

/// Reconnect backoff with fallback to the other SLAM mode.
///
/// The delay doubles with every consecutive failure up to `max_delay`. A
/// session that outlived `early_failure_window` resets it. After
/// `fallback_after` consecutive early failures the mode flips.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub early_failure_window: Duration,
    pub fallback_after: u32,
    mode: SlamMode,
    failures: u32,
    early_failures: u32,
}

impl ReconnectPolicy {
    pub fn new(mode: SlamMode) -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            early_failure_window: Duration::from_secs(5),
            fallback_after: 3,
            mode,
            failures: 0,
            early_failures: 0,
        }
    }

    /// Mode for the next session.
    pub fn mode(&self) -> SlamMode {
        self.mode
    }

    pub fn next(&mut self, outcome: SessionOutcome) -> Decision {
        match outcome {
            SessionOutcome::Ended { ran_for, .. } if ran_for >= self.early_failure_window => {
                self.failures = 0;
                self.early_failures = 0;
            }
            SessionOutcome::OpenFailed => {
                self.failures = self.failures.saturating_add(1);
            }
            SessionOutcome::StartFailed | SessionOutcome::Ended { .. } => {
                self.failures = self.failures.saturating_add(1);
                self.early_failures += 1;
                if self.early_failures >= self.fallback_after {
                    let next = self.mode.alternate();
                    log::warn!(
                        "{} early failures in {:?} mode, falling back to {:?}",
                        self.early_failures,
                        self.mode,
                        next
                    );
                    self.mode = next;
                    self.early_failures = 0;
                }
            }
        }

        let exponent = self.failures.saturating_sub(1).min(16);
        Decision {
            delay: self
                .base_delay
                .saturating_mul(1 << exponent)
                .min(self.max_delay),
            mode: self.mode,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(SlamMode::Edge)
    }
}

/// Keeps one device streaming until shut down.
pub struct Supervisor {
    enumerator: Enumerator,
    policy: ReconnectPolicy,
    stream_config: StreamConfig,
}

impl Supervisor {
    pub fn new(enumerator: Enumerator, policy: ReconnectPolicy) -> Self {
        Self {
            enumerator,
            policy,
            stream_config: StreamConfig::from_env(),
        }
    }

    pub fn with_stream_config(mut self, config: StreamConfig) -> Self {
        self.stream_config = config;
        self
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Open, stream and reopen until `shutdown` receives a message or
    /// disconnects. `on_pose` is registered on every session.
    pub fn run<F>(&mut self, shutdown: &Receiver<()>, on_pose: F)
    where
        F: Fn(Pose) + Send + Sync + 'static,
    {
        let on_pose: PoseCallback = Arc::new(on_pose);
        while !shutdown_requested(shutdown) {
            let Some(outcome) = self.run_session(shutdown, &on_pose) else {
                break;
            };
            let decision = self.policy.next(outcome);
            log::info!(
                "Session {:?}; reconnecting in {:?} ({:?} mode)",
                outcome,
                decision.delay,
                decision.mode
            );
            match shutdown.recv_timeout(decision.delay) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
        }
        log::info!("Supervisor stopped");
    }

    /// One open-start-wait cycle. `None` when shut down mid-session.
    fn run_session(
        &mut self,
        shutdown: &Receiver<()>,
        on_pose: &PoseCallback,
    ) -> Option<SessionOutcome> {
        let mut device = match self.enumerator.open_first() {
            Ok(device) => device,
            Err(e) => {
                log::warn!("Open failed: {}", e);
                return Some(SessionOutcome::OpenFailed);
            }
        };

        let mode = self.policy.mode();
        let mut slam = device.slam_with_config(self.stream_config);
        let callback = on_pose.clone();
        if let Err(e) = slam.on_pose(move |pose| callback(pose)) {
            log::warn!("Registering pose callback failed: {}", e);
            return Some(SessionOutcome::StartFailed);
        }
        let started = Instant::now();
        if let Err(e) = slam.start(mode) {
            log::warn!("Start in {:?} mode failed: {}", mode, e);
            return Some(SessionOutcome::StartFailed);
        }

        loop {
            if let Some(end) = slam.wait(SHUTDOWN_POLL) {
                return Some(SessionOutcome::Ended {
                    ran_for: started.elapsed(),
                    end,
                });
            }
            if shutdown_requested(shutdown) {
                slam.stop();
                return None;
            }
        }
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn early_end() -> SessionOutcome {
        SessionOutcome::Ended {
            ran_for: Duration::from_secs(1),
            end: StreamEnd::RecoveryExhausted,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let mut policy = ReconnectPolicy::new(SlamMode::Edge);
        let delays: Vec<_> = (0..6)
            .map(|_| policy.next(SessionOutcome::OpenFailed).delay.as_millis())
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000]);
        assert_eq!(policy.mode(), SlamMode::Edge);
    }

    #[test]
    fn test_long_session_resets_backoff() {
        let mut policy = ReconnectPolicy::new(SlamMode::Edge);
        policy.next(SessionOutcome::StartFailed);
        policy.next(SessionOutcome::StartFailed);
        let decision = policy.next(SessionOutcome::Ended {
            ran_for: Duration::from_secs(60),
            end: StreamEnd::DeviceGone,
        });
        assert_eq!(decision.delay, Duration::from_millis(500));
        assert_eq!(decision.mode, SlamMode::Edge);

        // The early-failure count restarted too.
        policy.next(early_end());
        assert_eq!(policy.next(early_end()).mode, SlamMode::Edge);
    }

    #[test]
    fn test_falls_back_after_repeated_early_failures() {
        let mut policy = ReconnectPolicy::new(SlamMode::Edge);
        assert_eq!(policy.next(SessionOutcome::StartFailed).mode, SlamMode::Edge);
        assert_eq!(policy.next(early_end()).mode, SlamMode::Edge);
        assert_eq!(policy.next(early_end()).mode, SlamMode::Mixed);
        assert_eq!(policy.mode(), SlamMode::Mixed);

        for _ in 0..2 {
            policy.next(SessionOutcome::StartFailed);
        }
        assert_eq!(policy.next(SessionOutcome::StartFailed).mode, SlamMode::Edge);
    }

    #[test]
    fn test_open_failures_do_not_flip_mode() {
        let mut policy = ReconnectPolicy::new(SlamMode::Mixed);
        for _ in 0..10 {
            assert_eq!(policy.next(SessionOutcome::OpenFailed).mode, SlamMode::Mixed);
        }
    }

    #[test]
    fn test_shutdown_requested() {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        assert!(!shutdown_requested(&rx));
        tx.send(()).unwrap();
        assert!(shutdown_requested(&rx));
        drop(tx);
        assert!(shutdown_requested(&rx));
    }
}
