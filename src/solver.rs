//! Rigid-transform estimation from per-pose statistics.
//!
//! Closed-form Umeyama/Kabsch solve: SVD of the cross-covariance gives the
//! optimal rotation, the means give the translation. One independent solve
//! per pose, parallelized over the batch.

use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3};
use rayon::prelude::*;

use crate::correction::types::{CorrectionPreResults, CorrectionResults};

/// Solve one pose's incremental correction from its statistics.
///
/// With `C = U Σ Vᵀ` the rotation aligning dataset onto model is `R = V Uᵀ`,
/// with the last column of `V` negated when `det(R) < 0` to exclude
/// reflections. Translation is `t = m − R d` where `m` is the dataset mean
/// and `d` the model mean. Zero correspondences give the identity.
pub fn solve_single(
    m: &Vector3<f64>,
    d: &Vector3<f64>,
    c: &Matrix3<f64>,
    ncorr: u32,
) -> Isometry3<f64> {
    if ncorr == 0 {
        return Isometry3::identity();
    }

    let svd = c.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Isometry3::identity();
    };
    let mut v = v_t.transpose();

    let mut r = v * u.transpose();
    if r.determinant() < 0.0 {
        // Reflection case: singular values are sorted descending, so the
        // smallest axis is the last column.
        v.set_column(2, &(-v.column(2)));
        r = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = Translation3::from(m - r * d);
    Isometry3::from_parts(translation, rotation)
}

/// Solve the whole batch, one correction per pose.
pub fn solve_batch(pre: &CorrectionPreResults) -> CorrectionResults {
    let tdelta: Vec<Isometry3<f64>> = (0..pre.len())
        .into_par_iter()
        .map(|i| solve_single(&pre.ms[i], &pre.ds[i], &pre.cs[i], pre.ncorr[i]))
        .collect();

    CorrectionResults {
        tdelta,
        ncorr: pre.ncorr.clone(),
    }
}
