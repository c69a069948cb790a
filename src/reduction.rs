//! Batched statistics reduction and multi-source merging.
//!
//! The correspondence stage produces one [`Correspondence`] per (pose, ray)
//! pair; this module collapses them into per-pose statistics: valid count,
//! mean dataset point, mean model point, and the cross-covariance
//! `C = Σ (model − d)(dataset − m)ᵀ / Ncorr`.
//!
//! Correspondences are f32 (device layout); accumulation happens in f64.
//! Reduction order is unconstrained, so results across strategies and
//! backends agree only up to floating-point rounding.

use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;

use crate::correction::types::{Correspondence, CorrectionPreResults};
use crate::error::{CorrectionError, Result};

/// Statistics of a single pose's correspondence set.
#[derive(Debug, Clone, Copy)]
pub struct PoseStats {
    /// Mean dataset point.
    pub m: Vector3<f64>,
    /// Mean model point.
    pub d: Vector3<f64>,
    /// Cross-covariance `Σ (model − d)(dataset − m)ᵀ / n`.
    pub c: Matrix3<f64>,
    /// Valid correspondence count.
    pub n: u32,
}

impl PoseStats {
    pub fn zeros() -> Self {
        Self {
            m: Vector3::zeros(),
            d: Vector3::zeros(),
            c: Matrix3::zeros(),
            n: 0,
        }
    }
}

/// Reduce one pose's correspondences. Two passes: means first, then the
/// mean-centered covariance. A pose with zero valid pairs yields all zeros.
pub fn reduce_single(correspondences: &[Correspondence]) -> PoseStats {
    let mut n = 0u32;
    let mut sum_dataset = Vector3::<f64>::zeros();
    let mut sum_model = Vector3::<f64>::zeros();

    for corr in correspondences.iter().filter(|c| c.valid) {
        n += 1;
        sum_dataset += corr.dataset.cast::<f64>();
        sum_model += corr.model.cast::<f64>();
    }

    if n == 0 {
        return PoseStats::zeros();
    }

    let inv_n = 1.0 / n as f64;
    let m = sum_dataset * inv_n;
    let d = sum_model * inv_n;

    let mut c = Matrix3::<f64>::zeros();
    for corr in correspondences.iter().filter(|c| c.valid) {
        let p = corr.model.cast::<f64>() - d;
        let q = corr.dataset.cast::<f64>() - m;
        c += p * q.transpose();
    }
    c *= inv_n;

    PoseStats { m, d, c, n }
}

/// Reduce a flat correspondence buffer segmented by pose: `rays_per_pose`
/// consecutive entries belong to one pose.
pub fn reduce_batch(
    correspondences: &[Correspondence],
    rays_per_pose: usize,
) -> CorrectionPreResults {
    debug_assert_eq!(correspondences.len() % rays_per_pose.max(1), 0);

    let stats: Vec<PoseStats> = correspondences
        .par_chunks(rays_per_pose.max(1))
        .map(reduce_single)
        .collect();

    collect_stats(stats)
}

/// Assemble per-pose statistics into parallel result buffers.
pub fn collect_stats(stats: Vec<PoseStats>) -> CorrectionPreResults {
    let mut res = CorrectionPreResults::with_len(stats.len());
    for (i, s) in stats.into_iter().enumerate() {
        res.ms[i] = s.m;
        res.ds[i] = s.d;
        res.cs[i] = s.c;
        res.ncorr[i] = s.n;
    }
    res
}

/// Merge one pose's statistics from several sources with the given weights.
///
/// The merged covariance is the weighted average of the source covariances
/// plus the parallel-axis term `Σ wₖ (dₖ − d̄)(mₖ − m̄)ᵀ`, which restores the
/// cross moments lost by averaging means. The count is the rounded weighted
/// average of the source counts, an effective sample size; [`merge_pooled`]
/// overrides it with the exact pooled sum.
fn merge_pose(stats: &[PoseStats], weights: &[f64]) -> PoseStats {
    let mut m = Vector3::<f64>::zeros();
    let mut d = Vector3::<f64>::zeros();
    let mut n = 0.0f64;
    for (s, &w) in stats.iter().zip(weights) {
        m += s.m * w;
        d += s.d * w;
        n += s.n as f64 * w;
    }

    let mut c = Matrix3::<f64>::zeros();
    for (s, &w) in stats.iter().zip(weights) {
        let dp = s.d - d;
        let dq = s.m - m;
        c += (s.c + dp * dq.transpose()) * w;
    }

    PoseStats {
        m,
        d,
        c,
        n: n.round() as u32,
    }
}

fn check_source_shapes(sources: &[&CorrectionPreResults]) -> Result<usize> {
    let num_poses = sources.first().map_or(0, |s| s.len());
    if sources.iter().any(|s| s.len() != num_poses) {
        return Err(CorrectionError::SourceShape);
    }
    Ok(num_poses)
}

/// Merge K independent statistics sets (e.g. distinct sensors) with explicit
/// per-source weights summing to 1.
pub fn merge_weighted(
    sources: &[&CorrectionPreResults],
    weights: &[f64],
) -> Result<CorrectionPreResults> {
    if sources.len() != weights.len() {
        return Err(CorrectionError::SourceShape);
    }
    let total: f64 = weights.iter().sum();
    if (total - 1.0).abs() > 1e-6 {
        return Err(CorrectionError::InvalidWeights(total));
    }
    let num_poses = check_source_shapes(sources)?;

    let stats = (0..num_poses)
        .map(|i| {
            let per_source: Vec<PoseStats> = sources
                .iter()
                .map(|s| PoseStats {
                    m: s.ms[i],
                    d: s.ds[i],
                    c: s.cs[i],
                    n: s.ncorr[i],
                })
                .collect();
            merge_pose(&per_source, weights)
        })
        .collect();

    Ok(collect_stats(stats))
}

/// Merge K statistics sets with count-proportional weights, reproducing the
/// statistics of the pooled correspondence sets exactly (up to rounding).
/// Poses with zero total count stay all-zero.
pub fn merge_pooled(sources: &[&CorrectionPreResults]) -> Result<CorrectionPreResults> {
    let num_poses = check_source_shapes(sources)?;

    let stats = (0..num_poses)
        .map(|i| {
            let per_source: Vec<PoseStats> = sources
                .iter()
                .map(|s| PoseStats {
                    m: s.ms[i],
                    d: s.ds[i],
                    c: s.cs[i],
                    n: s.ncorr[i],
                })
                .collect();

            let total: u32 = per_source.iter().map(|s| s.n).sum();
            if total == 0 {
                return PoseStats::zeros();
            }
            let weights: Vec<f64> = per_source
                .iter()
                .map(|s| s.n as f64 / total as f64)
                .collect();
            let mut merged = merge_pose(&per_source, &weights);
            merged.n = total;
            merged
        })
        .collect();

    Ok(collect_stats(stats))
}
