//! CubeCL-based CUDA scan-to-mesh pose correction library.
//!
//! This library registers batches of hypothesis poses against a triangle-mesh
//! map using ray-cast correspondences, with CPU (rayon) and GPU (CubeCL/CUDA)
//! backends behind a common interface.
//!
//! # Architecture
//!
//! A correction call is a three-stage pipeline, run independently per pose:
//! - Stage 1: Correspondence search — cast every sensor ray from the pose
//!   into the mesh and pair the simulated hit with the measured point
//! - Stage 2: Statistics reduction — per-pose means, cross-covariance, and
//!   valid-pair count
//! - Stage 3: Transform solve — closed-form SVD (Kabsch) rigid transform
//!
//! Both backends offer a ray-wise strategy (parallel over (pose, ray) pairs)
//! and a scan-wise strategy (parallel over poses), selected by pose count.
//!
//! # Usage
//!
//! ```ignore
//! use micp_cuda::{CorrectionParams, Corrector, CpuCorrector};
//! use nalgebra::Isometry3;
//! use std::sync::Arc;
//!
//! let map = Arc::new(load_mesh("map.ply")?);
//! let mut corrector = CpuCorrector::new(map);
//! corrector.set_model(sensor_model);
//!
//! corrector.set_input_data(get_lidar_ranges());
//! let results = corrector.correct(&poses)?;
//! println!("matched {} rays, delta = {}", results.ncorr[0], results.tdelta[0]);
//! ```

pub mod correction;
pub mod error;
pub mod map;
pub mod reduction;
pub mod sensor;
pub mod session;
pub mod solver;
pub mod test_utils;
pub mod timing;

pub use correction::{
    apply_corrections, CorrectionParams, CorrectionPreResults, CorrectionResults, Corrector,
    CpuCorrector, Strategy, POSE_SWITCH,
};
pub use error::{CorrectionError, Result};
pub use map::{RayCastBackend, RayHit, TriangleMesh};
pub use reduction::{merge_pooled, merge_weighted};
pub use sensor::{DiscreteInterval, OnDnModel, RangeInterval, Ray, SensorModel, SphericalModel};
pub use session::{CorrectionSession, SessionConfig};
pub use solver::{solve_batch, solve_single};
pub use timing::CorrectionTimings;

// GPU backend (requires a CUDA device at runtime)
pub use correction::{is_cuda_available, GpuCorrector};
