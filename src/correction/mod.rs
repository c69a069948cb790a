//! Pose correction: correspondence search, statistics, and the backend
//! dispatch surface.
//!
//! A corrector owns the map and sensor model, receives measured ranges, and
//! turns a batch of hypothesis poses into per-pose incremental corrections.
//! The CPU and GPU backends implement the same two-stage pipeline behind a
//! common [`Corrector`] trait so callers hold a `Box<dyn Corrector>` and
//! swap backends at runtime.

pub mod cpu;
pub mod gpu;
mod kernels;
pub mod types;

use nalgebra::Isometry3;

use crate::error::Result;
pub use cpu::CpuCorrector;
pub use gpu::{is_cuda_available, GpuCorrector};
pub use types::{
    apply_corrections, select_strategy, CorrectionParams, CorrectionPreResults, CorrectionResults,
    Correspondence, Strategy, POSE_SWITCH,
};

/// Backend-independent correction interface.
///
/// The map and sensor model are backend-specific and set on the concrete
/// type before it is boxed; everything per-iteration goes through here.
pub trait Corrector: Send {
    /// Replace the correction parameters.
    fn set_params(&mut self, params: CorrectionParams);

    /// Replace the measured ranges. Length must match the sensor model's ray
    /// count; the mismatch is reported by the next [`correct`](Self::correct)
    /// call, not here.
    fn set_input_data(&mut self, ranges: Vec<f32>);

    /// One full correction: correspondences, reduction, and solve for every
    /// pose. Returns one `Tdelta` and count per pose.
    fn correct(&self, tbm: &[Isometry3<f64>]) -> Result<CorrectionResults>;

    /// Run only the first two stages, exposing the per-pose statistics for
    /// cross-sensor merging before a single solve.
    fn compute_covs(&self, tbm: &[Isometry3<f64>]) -> Result<CorrectionPreResults>;
}
