mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::{SIZE, keep_world_points, similarity_about_centre, textured_image, wall_depth, wall_intrinsics, warp};
use mural_engine::{
    AttemptReport, Clock, DropReason, Engine, EngineConfig, RelocalizationState, SessionConfig, SolveMode,
    Submission,
};

const WAIT: Duration = Duration::from_secs(60);

#[derive(Clone, Default)]
struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    fn advance(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

fn engine(session: SessionConfig) -> Engine {
    let mut config = EngineConfig {
        session,
        ..EngineConfig::default()
    };
    config.relocalizer.homography.seed = Some(5);
    Engine::new(config).unwrap()
}

#[test]
fn searching_placed_locked_and_back() {
    let engine = engine(SessionConfig::default());
    let reference = textured_image(SIZE, SIZE, 31);
    let fp = Arc::new(engine.generate_fingerprint(&reference, None, None, None));
    let live = warp(&reference, &similarity_about_centre(SIZE, SIZE, 5.0, 0.95));

    let clock = ManualClock::default();
    let mut session = engine.open_session_with_clock(fp, clock.clone());
    assert!(session.state().is_searching());

    assert_eq!(session.submit_frame(live.clone(), None), Submission::Submitted);
    assert!(matches!(session.submit_frame(live.clone(), None), Submission::Dropped(_)));

    for expected in 1..=2u32 {
        let report = session.wait_for_outcome(WAIT).expect("attempt finished");
        assert!(matches!(report, AttemptReport::Transform(_)));
        match session.state() {
            RelocalizationState::Placed { consecutive, .. } => assert_eq!(*consecutive, expected),
            other => panic!("unexpected state {other:?}"),
        }
        assert!(!session.is_attempt_in_flight());
        assert_eq!(
            session.submit_frame(live.clone(), None),
            Submission::Dropped(DropReason::RateLimited)
        );
        clock.advance(1500);
        assert_eq!(session.submit_frame(live.clone(), None), Submission::Submitted);
    }

    assert!(matches!(session.wait_for_outcome(WAIT), Some(AttemptReport::Transform(_))));
    assert!(session.state().is_locked());
    clock.advance(5000);
    assert_eq!(
        session.submit_frame(live.clone(), None),
        Submission::Dropped(DropReason::Locked)
    );

    session.report_tracking_lost(false);
    assert!(session.state().is_searching());
    assert_eq!(session.submit_frame(live, None), Submission::Submitted);
    session.shutdown();
}

#[test]
fn failed_attempt_returns_placed_to_searching() {
    let engine = engine(SessionConfig {
        auto_lock_after: None,
        ..SessionConfig::default()
    });
    let reference = textured_image(SIZE, SIZE, 32);
    let fp = Arc::new(engine.generate_fingerprint(&reference, None, None, None));
    let clock = ManualClock::default();
    let mut session = engine.open_session_with_clock(fp, clock.clone());

    assert_eq!(session.submit_frame(reference.clone(), None), Submission::Submitted);
    assert!(matches!(session.wait_for_outcome(WAIT), Some(AttemptReport::Transform(_))));
    assert!(matches!(session.state(), RelocalizationState::Placed { .. }));

    clock.advance(1500);
    let blank = image::GrayImage::new(SIZE, SIZE);
    assert_eq!(session.submit_frame(blank, None), Submission::Submitted);
    assert_eq!(session.wait_for_outcome(WAIT), Some(AttemptReport::NoChange));
    assert!(session.state().is_searching());
}

#[test]
fn reset_discards_in_flight_result() {
    let engine = engine(SessionConfig::default());
    let reference = textured_image(SIZE, SIZE, 33);
    let fp = Arc::new(engine.generate_fingerprint(&reference, None, None, None));
    let mut session = engine.open_session_with_clock(fp, ManualClock::default());

    assert_eq!(session.submit_frame(reference.clone(), None), Submission::Submitted);
    session.reset();
    // The worker is still busy with the old attempt.
    assert_eq!(
        session.submit_frame(reference.clone(), None),
        Submission::Dropped(DropReason::InFlight)
    );
    assert_eq!(session.wait_for_outcome(WAIT), None);
    assert!(!session.is_attempt_in_flight());
    assert!(session.state().is_searching());

    // The rate limiter restarts with the search.
    assert_eq!(session.submit_frame(reference, None), Submission::Submitted);
    assert!(matches!(session.wait_for_outcome(WAIT), Some(AttemptReport::Transform(_))));
}

#[test]
fn dropping_session_lets_worker_finish() {
    let engine = engine(SessionConfig::default());
    let reference = textured_image(SIZE, SIZE, 34);
    let fp = Arc::new(engine.generate_fingerprint(&reference, None, None, None));
    let mut session = engine.open_session(fp);
    assert_eq!(session.submit_frame(reference, None), Submission::Submitted);
    drop(session);
}

#[test]
fn frames_are_not_queued_behind_an_unread_outcome() {
    let engine = engine(SessionConfig::default());
    let reference = textured_image(SIZE, SIZE, 35);
    let fp = Arc::new(engine.generate_fingerprint(&reference, None, None, None));
    let clock = ManualClock::default();
    let mut session = engine.open_session_with_clock(fp, clock.clone());

    assert_eq!(session.submit_frame(reference.clone(), None), Submission::Submitted);
    for _ in 0..3 {
        std::thread::sleep(Duration::from_millis(200));
        clock.advance(2000);
        assert_eq!(
            session.submit_frame(reference.clone(), None),
            Submission::Dropped(DropReason::InFlight)
        );
    }

    assert!(matches!(session.wait_for_outcome(WAIT), Some(AttemptReport::Transform(_))));
    assert!(!session.is_attempt_in_flight());
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(session.poll(), None);
    session.shutdown();
}

#[test]
fn auto_session_places_with_homography_when_matched_depth_is_sparse() {
    let engine = engine(SessionConfig {
        mode: SolveMode::Auto,
        ..SessionConfig::default()
    });
    let reference = textured_image(SIZE, SIZE, 36);
    let k = wall_intrinsics();
    let full = engine.generate_fingerprint(&reference, None, Some(&wall_depth()), Some(&k));
    let sparse = Arc::new(keep_world_points(&full, 3));
    let mut session = engine.open_session_with_clock(sparse, ManualClock::default());

    assert_eq!(session.submit_frame(reference, Some(k)), Submission::Submitted);
    match session.wait_for_outcome(WAIT) {
        Some(AttemptReport::Transform(t)) => assert!(t.homography().is_some()),
        other => panic!("expected a placed homography, got {other:?}"),
    }
    assert!(matches!(session.state(), RelocalizationState::Placed { .. }));
    session.shutdown();
}
