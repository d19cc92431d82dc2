//! Relocalization session: owns the Searching / Placed / Locked state of one
//! project, rate-limits attempts and runs them on a background worker.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError, bounded};
use image::GrayImage;
use mural_core::{
    CameraIntrinsics, Fingerprint, RelocalizationError, Relocalizer, SolverFailureReason, Transform,
};
use tracing::{debug, info, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{SessionConfig, SolveMode};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RelocalizationState {
    Searching,
    /// Accepted but not yet confirmed; `consecutive` counts back-to-back
    /// accepted attempts including the current one.
    Placed { transform: Transform, consecutive: u32 },
    Locked { transform: Transform },
}

impl RelocalizationState {
    pub fn transform(&self) -> Option<&Transform> {
        match self {
            Self::Searching => None,
            Self::Placed { transform, .. } | Self::Locked { transform } => Some(transform),
        }
    }

    pub fn is_searching(&self) -> bool {
        matches!(self, Self::Searching)
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Locked,
    RateLimited,
    InFlight,
    WorkerUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Submitted,
    Dropped(DropReason),
}

/// The single externally visible fact produced by a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttemptReport {
    /// A newly accepted transform; its confidence is [`Transform::confidence`].
    Transform(Transform),
    NoChange,
}

struct Job {
    epoch: u64,
    frame: GrayImage,
    intrinsics: Option<CameraIntrinsics>,
}

struct Outcome {
    epoch: u64,
    result: Result<Transform, RelocalizationError>,
}

pub struct RelocalizationSession<C: Clock = SystemClock> {
    config: SessionConfig,
    clock: C,
    state: RelocalizationState,
    epoch: u64,
    last_attempt: Option<Duration>,
    /// Set on submit, cleared only once the session has taken the outcome
    /// off the channel.
    attempt_pending: bool,
    job_tx: Option<Sender<Job>>,
    outcome_rx: Receiver<Outcome>,
    worker: Option<JoinHandle<()>>,
}

impl RelocalizationSession<SystemClock> {
    pub fn new(relocalizer: Arc<Relocalizer>, fingerprint: Arc<Fingerprint>, config: SessionConfig) -> Self {
        Self::with_clock(relocalizer, fingerprint, config, SystemClock::default())
    }
}

impl<C: Clock> RelocalizationSession<C> {
    pub fn with_clock(
        relocalizer: Arc<Relocalizer>,
        fingerprint: Arc<Fingerprint>,
        config: SessionConfig,
        clock: C,
    ) -> Self {
        let (job_tx, job_rx) = bounded::<Job>(1);
        let (outcome_tx, outcome_rx) = bounded::<Outcome>(1);

        let mode = config.mode;
        let spawned = std::thread::Builder::new()
            .name("mural-relocalize".into())
            .spawn(move || worker_loop(relocalizer, fingerprint, mode, job_rx, outcome_tx));
        let (job_tx, worker) = match spawned {
            Ok(handle) => (Some(job_tx), Some(handle)),
            Err(err) => {
                warn!("failed to spawn relocalization worker: {err}");
                (None, None)
            }
        };

        Self {
            config,
            clock,
            state: RelocalizationState::Searching,
            epoch: 0,
            last_attempt: None,
            attempt_pending: false,
            job_tx,
            outcome_rx,
            worker,
        }
    }

    pub fn state(&self) -> &RelocalizationState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True from a successful submit until `poll` or `wait_for_outcome` has
    /// consumed that attempt's outcome, stale or not.
    pub fn is_attempt_in_flight(&self) -> bool {
        self.attempt_pending
    }

    /// Offers a frame for a relocalization attempt. Never blocks: a frame that
    /// cannot start an attempt right now is dropped, not queued.
    pub fn submit_frame(&mut self, frame: GrayImage, intrinsics: Option<CameraIntrinsics>) -> Submission {
        if self.state.is_locked() {
            return Submission::Dropped(DropReason::Locked);
        }
        let Some(job_tx) = self.job_tx.as_ref() else {
            return Submission::Dropped(DropReason::WorkerUnavailable);
        };
        if self.attempt_pending {
            return Submission::Dropped(DropReason::InFlight);
        }
        let now = self.clock.now();
        let interval = Duration::from_millis(self.config.min_attempt_interval_ms);
        if let Some(last) = self.last_attempt {
            if now.saturating_sub(last) < interval {
                return Submission::Dropped(DropReason::RateLimited);
            }
        }

        let job = Job {
            epoch: self.epoch,
            frame,
            intrinsics,
        };
        match job_tx.try_send(job) {
            Ok(()) => {
                self.attempt_pending = true;
                self.last_attempt = Some(now);
                debug!(epoch = self.epoch, "relocalization attempt submitted");
                Submission::Submitted
            }
            Err(TrySendError::Full(_)) => Submission::Dropped(DropReason::InFlight),
            Err(TrySendError::Disconnected(_)) => {
                warn!("relocalization worker has exited");
                Submission::Dropped(DropReason::WorkerUnavailable)
            }
        }
    }

    /// Applies a finished attempt, if any, without blocking.
    pub fn poll(&mut self) -> Option<AttemptReport> {
        loop {
            match self.outcome_rx.try_recv() {
                Ok(outcome) => {
                    if let Some(report) = self.apply(outcome) {
                        return Some(report);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.attempt_pending = false;
                    return None;
                }
            }
        }
    }

    /// Blocks for at most `timeout` waiting for the current attempt. Returns
    /// `None` early once no attempt is pending.
    pub fn wait_for_outcome(&mut self, timeout: Duration) -> Option<AttemptReport> {
        let deadline = Instant::now() + timeout;
        while self.attempt_pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.outcome_rx.recv_timeout(remaining) {
                Ok(outcome) => {
                    if let Some(report) = self.apply(outcome) {
                        return Some(report);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.attempt_pending = false;
                    return None;
                }
            }
        }
        None
    }

    /// Confirms a placed transform. Returns whether the session is now locked.
    pub fn lock(&mut self) -> bool {
        match self.state {
            RelocalizationState::Placed { transform, .. } => {
                info!("transform locked by caller");
                self.state = RelocalizationState::Locked { transform };
                true
            }
            RelocalizationState::Locked { .. } => true,
            RelocalizationState::Searching => false,
        }
    }

    pub fn reset(&mut self) {
        info!("relocalization session reset");
        self.restart_search();
    }

    /// Host tracking was lost. Unless the host recovered its anchor, the
    /// session goes back to searching.
    pub fn report_tracking_lost(&mut self, anchor_recovered: bool) {
        if anchor_recovered {
            debug!("tracking lost but anchor recovered; keeping state");
            return;
        }
        info!("tracking lost; searching again");
        self.restart_search();
    }

    /// The owning project was closed and reopened.
    pub fn reopen(&mut self, degraded_confidence: bool) {
        if degraded_confidence {
            info!("project reopened with degraded confidence; searching again");
            self.restart_search();
        }
    }

    /// Closes the job channel and waits for any in-flight attempt to finish.
    /// Dropping the session instead detaches the worker, which exits once
    /// its current attempt completes.
    pub fn shutdown(mut self) {
        self.job_tx = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("relocalization worker panicked");
            }
        }
    }

    fn restart_search(&mut self) {
        self.state = RelocalizationState::Searching;
        self.epoch += 1;
        self.last_attempt = None;
    }

    fn accepts(&self, transform: &Transform) -> bool {
        transform.inlier_count >= self.config.min_accepted_inliers
            && transform.mean_reprojection_error_px <= self.config.max_mean_reprojection_error_px
    }

    fn apply(&mut self, outcome: Outcome) -> Option<AttemptReport> {
        self.attempt_pending = false;
        if outcome.epoch != self.epoch {
            debug!(epoch = outcome.epoch, current = self.epoch, "discarding stale attempt");
            return None;
        }
        if self.state.is_locked() {
            debug!("discarding attempt finished after lock");
            return None;
        }

        let result = outcome.result.and_then(|transform| {
            if self.accepts(&transform) {
                Ok(transform)
            } else {
                Err(SolverFailureReason::AcceptanceThreshold.into())
            }
        });

        match result {
            Ok(transform) => {
                let consecutive = match self.state {
                    RelocalizationState::Placed { consecutive, .. } => consecutive.saturating_add(1),
                    _ => 1,
                };
                self.state = match self.config.auto_lock_after {
                    Some(n) if consecutive >= n => {
                        info!(consecutive, "transform confirmed; locking");
                        RelocalizationState::Locked { transform }
                    }
                    _ => RelocalizationState::Placed {
                        transform,
                        consecutive,
                    },
                };
                Some(AttemptReport::Transform(transform))
            }
            Err(err) => {
                debug!("attempt produced no change: {err}");
                if matches!(self.state, RelocalizationState::Placed { .. }) {
                    self.state = RelocalizationState::Searching;
                }
                Some(AttemptReport::NoChange)
            }
        }
    }
}

fn worker_loop(
    relocalizer: Arc<Relocalizer>,
    fingerprint: Arc<Fingerprint>,
    mode: SolveMode,
    jobs: Receiver<Job>,
    outcomes: Sender<Outcome>,
) {
    for job in jobs.iter() {
        let span = info_span!("relocalize", epoch = job.epoch);
        let _guard = span.enter();

        let started = Instant::now();
        let result = run_attempt(&relocalizer, &fingerprint, mode, &job);
        match &result {
            Ok(t) => info!(
                inliers = t.inlier_count,
                correspondences = t.correspondence_count,
                error_px = t.mean_reprojection_error_px,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "attempt solved"
            ),
            Err(err) => debug!(elapsed_ms = started.elapsed().as_millis() as u64, "attempt failed: {err}"),
        }

        if outcomes
            .send(Outcome {
                epoch: job.epoch,
                result,
            })
            .is_err()
        {
            debug!("session closed; discarding attempt result");
            break;
        }
    }
}

fn run_attempt(
    relocalizer: &Relocalizer,
    fingerprint: &Fingerprint,
    mode: SolveMode,
    job: &Job,
) -> Result<Transform, RelocalizationError> {
    match (mode, job.intrinsics.as_ref()) {
        (SolveMode::Homography, _) => relocalizer.relocalize(&job.frame, fingerprint),
        (SolveMode::Pose, Some(k)) => relocalizer.relocalize_with_pose(&job.frame, fingerprint, k),
        (SolveMode::Pose, None) => Err(RelocalizationError::DegenerateInput),
        (SolveMode::Auto, k) => relocalizer.relocalize_auto(&job.frame, fingerprint, k),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mural_core::TransformModel;
    use nalgebra::Matrix3;

    fn session(config: SessionConfig) -> RelocalizationSession {
        RelocalizationSession::new(
            Arc::new(Relocalizer::default()),
            Arc::new(Fingerprint::default()),
            config,
        )
    }

    fn transform(inliers: usize, error_px: f64) -> Transform {
        Transform {
            model: TransformModel::Homography(Matrix3::identity()),
            inlier_count: inliers,
            correspondence_count: 60,
            mean_reprojection_error_px: error_px,
        }
    }

    fn solved(s: &RelocalizationSession, t: Transform) -> Outcome {
        Outcome {
            epoch: s.epoch,
            result: Ok(t),
        }
    }

    fn failed(s: &RelocalizationSession) -> Outcome {
        Outcome {
            epoch: s.epoch,
            result: Err(RelocalizationError::InsufficientMatches { found: 3, required: 20 }),
        }
    }

    #[test]
    fn placed_locks_after_consecutive_successes() {
        let mut s = session(SessionConfig::default());
        let t = transform(40, 1.0);
        assert_eq!(s.apply(solved(&s, t)), Some(AttemptReport::Transform(t)));
        assert_eq!(*s.state(), RelocalizationState::Placed { transform: t, consecutive: 1 });
        s.apply(solved(&s, t));
        assert!(matches!(s.state(), RelocalizationState::Placed { consecutive: 2, .. }));
        s.apply(solved(&s, t));
        assert_eq!(*s.state(), RelocalizationState::Locked { transform: t });
    }

    #[test]
    fn failure_while_placed_returns_to_searching() {
        let mut s = session(SessionConfig::default());
        s.apply(solved(&s, transform(40, 1.0)));
        assert_eq!(s.apply(failed(&s)), Some(AttemptReport::NoChange));
        assert!(s.state().is_searching());
        assert_eq!(s.apply(failed(&s)), Some(AttemptReport::NoChange));
        assert!(s.state().is_searching());
    }

    #[test]
    fn rejects_transforms_outside_accept_thresholds() {
        let mut s = session(SessionConfig::default());
        assert_eq!(s.apply(solved(&s, transform(5, 1.0))), Some(AttemptReport::NoChange));
        assert_eq!(s.apply(solved(&s, transform(40, 9.0))), Some(AttemptReport::NoChange));
        assert!(s.state().is_searching());
    }

    #[test]
    fn stale_epochs_are_discarded() {
        let mut s = session(SessionConfig::default());
        let stale = solved(&s, transform(40, 1.0));
        s.reset();
        assert_eq!(s.apply(stale), None);
        assert!(s.state().is_searching());
    }

    #[test]
    fn unconsumed_outcome_keeps_the_gate_closed() {
        let mut s = session(SessionConfig {
            min_attempt_interval_ms: 0,
            ..SessionConfig::default()
        });
        assert_eq!(s.submit_frame(GrayImage::new(8, 8), None), Submission::Submitted);
        for _ in 0..3 {
            std::thread::sleep(Duration::from_millis(50));
            assert_eq!(
                s.submit_frame(GrayImage::new(8, 8), None),
                Submission::Dropped(DropReason::InFlight)
            );
            assert!(s.is_attempt_in_flight());
        }

        assert_eq!(s.wait_for_outcome(Duration::from_secs(30)), Some(AttemptReport::NoChange));
        assert!(!s.is_attempt_in_flight());
        assert_eq!(s.poll(), None);
        assert_eq!(s.wait_for_outcome(Duration::from_secs(30)), None);
        assert_eq!(s.submit_frame(GrayImage::new(8, 8), None), Submission::Submitted);
        s.shutdown();
    }

    #[test]
    fn manual_lock_and_reset_paths() {
        let mut s = session(SessionConfig {
            auto_lock_after: None,
            ..SessionConfig::default()
        });
        assert!(!s.lock());
        let t = transform(40, 1.0);
        for _ in 0..5 {
            s.apply(solved(&s, t));
        }
        assert!(matches!(s.state(), RelocalizationState::Placed { consecutive: 5, .. }));
        assert!(s.lock());
        assert!(s.state().is_locked());
        assert_eq!(
            s.submit_frame(GrayImage::new(8, 8), None),
            Submission::Dropped(DropReason::Locked)
        );

        s.report_tracking_lost(true);
        assert!(s.state().is_locked());
        s.report_tracking_lost(false);
        assert!(s.state().is_searching());

        s.apply(solved(&s, t));
        s.reopen(false);
        assert!(matches!(s.state(), RelocalizationState::Placed { .. }));
        s.reopen(true);
        assert!(s.state().is_searching());
    }
}
