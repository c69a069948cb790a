//! Shared data types for the correction engines.
//!
//! Per-pose outputs are parallel arrays: index `i` refers to the same pose in
//! every buffer of a result set.

use nalgebra::{Isometry3, Matrix3, Vector3};

/// Parameters of a single correction call.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionParams {
    /// Correspondence acceptance radius: a (pose, ray) pair is valid only if
    /// the simulated and measured distances differ by at most this much.
    pub max_distance: f32,
    /// Sensor-to-base transform, fixed for the call.
    pub tsb: Isometry3<f32>,
}

impl Default for CorrectionParams {
    fn default() -> Self {
        Self {
            max_distance: 0.5,
            tsb: Isometry3::identity(),
        }
    }
}

/// A matched point pair for one (pose, ray) combination. Transient: exists
/// only between the correspondence stage and the reduction.
///
/// Invalid pairs carry zero vectors and contribute nothing to the statistics.
#[derive(Debug, Clone, Copy)]
pub struct Correspondence {
    pub valid: bool,
    /// Simulated hit point on the mesh, map frame.
    pub model: Vector3<f32>,
    /// Point reconstructed from the measured range along the same ray,
    /// map frame.
    pub dataset: Vector3<f32>,
}

impl Correspondence {
    pub fn invalid() -> Self {
        Self {
            valid: false,
            model: Vector3::zeros(),
            dataset: Vector3::zeros(),
        }
    }
}

/// Per-pose matched-point statistics, one entry per hypothesis pose.
///
/// Zero-correspondence poses carry all-zero statistics, never NaN, so they
/// stay inert through merging and solving.
#[derive(Debug, Clone, Default)]
pub struct CorrectionPreResults {
    /// Mean dataset point per pose.
    pub ms: Vec<Vector3<f64>>,
    /// Mean model point per pose.
    pub ds: Vec<Vector3<f64>>,
    /// Cross-covariance per pose: `Σ (model − d)(dataset − m)ᵀ / Ncorr`.
    pub cs: Vec<Matrix3<f64>>,
    /// Valid correspondence count per pose.
    pub ncorr: Vec<u32>,
}

impl CorrectionPreResults {
    pub fn with_len(n: usize) -> Self {
        Self {
            ms: vec![Vector3::zeros(); n],
            ds: vec![Vector3::zeros(); n],
            cs: vec![Matrix3::zeros(); n],
            ncorr: vec![0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.ncorr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ncorr.is_empty()
    }
}

/// Final correction output: one delta transform and one correspondence count
/// per hypothesis pose. `ncorr[i] == 0` implies `tdelta[i]` is the identity.
#[derive(Debug, Clone, Default)]
pub struct CorrectionResults {
    pub tdelta: Vec<Isometry3<f64>>,
    pub ncorr: Vec<u32>,
}

impl CorrectionResults {
    pub fn len(&self) -> usize {
        self.ncorr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ncorr.is_empty()
    }
}

/// Work-distribution strategy for the correspondence stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// One parallel unit per (pose, ray) pair. Fine-grained; wins when the
    /// ray count dominates the pose count.
    RayWise,
    /// One parallel unit per pose, rays handled sequentially inside the
    /// unit. Wins when the pose count dominates.
    ScanWise,
}

/// Default pose-count switch point between the strategies.
pub const POSE_SWITCH: usize = 1024 * 8;

/// Strategy selection is a pure function of pose count and the threshold.
/// Both branches produce the same statistics up to floating-point
/// associativity.
pub fn select_strategy(num_poses: usize, pose_switch: usize) -> Strategy {
    if num_poses > pose_switch {
        Strategy::ScanWise
    } else {
        Strategy::RayWise
    }
}

/// Apply per-pose corrections: `pose[i] · tdelta[i]`. This is the outer
/// loop's update step, shared by the session and by callers driving their own
/// iteration.
pub fn apply_corrections(
    poses: &[Isometry3<f64>],
    results: &CorrectionResults,
) -> Vec<Isometry3<f64>> {
    poses
        .iter()
        .zip(results.tdelta.iter())
        .map(|(pose, delta)| pose * delta)
        .collect()
}
