//! Continuous correction session: a background worker that keeps a single
//! pose estimate registered against the map at a bounded rate.
//!
//! Scans and pose guesses arrive over a channel; the worker keeps the
//! latest scan, corrects each scan at most once and at most once per period,
//! composes the delta onto the tracked pose, and tightens the acceptance
//! radius as the estimate settles. Stale scans are overwritten, never queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nalgebra::Isometry3;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::correction::{apply_corrections, CorrectionParams, Corrector};

/// Configuration for a correction session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Correction period (default: 50ms)
    pub period: Duration,
    /// Initial correction parameters
    pub params: CorrectionParams,
    /// Multiplier applied to the acceptance radius after each correction
    /// with matches (default: 0.9)
    pub max_distance_decay: f32,
    /// Floor for the decayed acceptance radius (default: 0.15)
    pub max_distance_min: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(50),
            params: CorrectionParams::default(),
            max_distance_decay: 0.9,
            max_distance_min: 0.15,
        }
    }
}

enum SessionCommand {
    Ranges(Vec<f32>),
    PoseGuess(Isometry3<f64>),
}

struct Shared {
    pose: Mutex<Isometry3<f64>>,
    stop: AtomicBool,
    corrections: AtomicU64,
}

/// Handle to a running correction session. Dropping it stops the worker.
pub struct CorrectionSession {
    shared: Arc<Shared>,
    tx: Sender<SessionCommand>,
    worker: Option<JoinHandle<()>>,
}

impl CorrectionSession {
    /// Spawn the worker with the given corrector and initial pose. The
    /// corrector's map and sensor model must already be set; the session
    /// takes over its params and input data.
    pub fn spawn<C>(mut corrector: C, initial_pose: Isometry3<f64>, config: SessionConfig) -> Self
    where
        C: Corrector + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            pose: Mutex::new(initial_pose),
            stop: AtomicBool::new(false),
            corrections: AtomicU64::new(0),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                corrector.set_params(config.params);
                worker_loop(rx, shared, &mut corrector, &config);
            })
        };

        Self {
            shared,
            tx,
            worker: Some(worker),
        }
    }

    /// Current pose estimate.
    pub fn pose(&self) -> Isometry3<f64> {
        *self.shared.pose.lock()
    }

    /// Submit a new scan. Only the latest scan per period is corrected
    /// against; earlier ones are overwritten.
    pub fn push_ranges(&self, ranges: Vec<f32>) {
        let _ = self.tx.send(SessionCommand::Ranges(ranges));
    }

    /// Reset the tracked pose (e.g. an external relocalization). Also resets
    /// the decayed acceptance radius.
    pub fn set_pose(&self, pose: Isometry3<f64>) {
        let _ = self.tx.send(SessionCommand::PoseGuess(pose));
    }

    /// Number of corrections applied since spawn.
    pub fn corrections(&self) -> u64 {
        self.shared.corrections.load(Ordering::Relaxed)
    }
}

impl Drop for CorrectionSession {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop<C: Corrector>(
    rx: Receiver<SessionCommand>,
    shared: Arc<Shared>,
    corrector: &mut C,
    config: &SessionConfig,
) {
    let mut has_scan = false;
    let mut max_distance = config.params.max_distance;
    let mut last_correction = Instant::now();

    debug!(period_ms = config.period.as_millis() as u64, "session worker started");

    loop {
        if shared.stop.load(Ordering::Relaxed) {
            break;
        }

        match rx.recv_timeout(config.period) {
            Ok(SessionCommand::Ranges(ranges)) => {
                corrector.set_input_data(ranges);
                has_scan = true;
            }
            Ok(SessionCommand::PoseGuess(pose)) => {
                *shared.pose.lock() = pose;
                max_distance = config.params.max_distance;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if !has_scan || last_correction.elapsed() < config.period {
            continue;
        }

        corrector.set_params(CorrectionParams {
            max_distance,
            ..config.params
        });

        let pose = *shared.pose.lock();
        match corrector.correct(&[pose]) {
            Ok(results) => {
                if results.ncorr[0] > 0 {
                    let updated = apply_corrections(&[pose], &results);
                    *shared.pose.lock() = updated[0];
                    shared.corrections.fetch_add(1, Ordering::Relaxed);

                    // Tighten the acceptance radius as the estimate settles;
                    // a pose reset restores the configured radius.
                    max_distance =
                        (max_distance * config.max_distance_decay).max(config.max_distance_min);
                }
            }
            Err(e) => {
                warn!("correction failed: {e}");
            }
        }
        has_scan = false;
        last_correction = Instant::now();
    }

    debug!("session worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correction::CpuCorrector;
    use crate::test_utils::{make_downward_model, make_plane_mesh};
    use approx::assert_relative_eq;

    #[test]
    fn scan_moves_the_pose_onto_the_plane() {
        let map = Arc::new(make_plane_mesh(50.0, 0.0));
        let mut corrector = CpuCorrector::new(map);
        corrector.set_model(make_downward_model(4, 4, 0.5, 1.0));

        let config = SessionConfig {
            period: Duration::from_millis(5),
            ..SessionConfig::default()
        };
        let session = CorrectionSession::spawn(corrector, Isometry3::identity(), config);

        // Measured 1.2 against a simulated 1.0: one correction pulls the
        // pose 0.2 down.
        session.push_ranges(vec![1.2; 16]);
        for _ in 0..100 {
            if session.corrections() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(session.corrections(), 1);
        assert_relative_eq!(session.pose().translation.z, -0.2, epsilon = 1e-4);
    }

    #[test]
    fn consistent_scans_leave_the_pose_fixed() {
        let map = Arc::new(make_plane_mesh(50.0, 0.0));
        let mut corrector = CpuCorrector::new(map);
        corrector.set_model(make_downward_model(4, 4, 0.5, 1.0));

        let config = SessionConfig {
            period: Duration::from_millis(5),
            ..SessionConfig::default()
        };
        let session = CorrectionSession::spawn(corrector, Isometry3::identity(), config);

        for _ in 0..5 {
            session.push_ranges(vec![1.0; 16]);
            thread::sleep(Duration::from_millis(10));
        }

        assert!(session.corrections() > 0);
        assert_relative_eq!(session.pose().translation.vector.norm(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn pose_reset_is_applied() {
        let map = Arc::new(make_plane_mesh(50.0, 0.0));
        let mut corrector = CpuCorrector::new(map);
        corrector.set_model(make_downward_model(2, 2, 0.5, 1.0));

        let session = CorrectionSession::spawn(
            corrector,
            Isometry3::identity(),
            SessionConfig::default(),
        );

        let target = Isometry3::translation(3.0, -1.0, 0.5);
        session.set_pose(target);
        thread::sleep(Duration::from_millis(30));

        assert_relative_eq!(
            session.pose().translation.vector,
            target.translation.vector,
            epsilon = 1e-9
        );
    }
}
