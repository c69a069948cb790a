//! Multi-threaded CPU correction backend.
//!
//! The same two-stage pipeline as the GPU backend, built on rayon: the
//! ray-wise strategy parallelizes over (pose, ray) pairs and reduces
//! afterwards, the scan-wise strategy parallelizes over poses with a fused
//! per-pose loop. Both produce identical statistics up to floating-point
//! associativity.

use std::sync::Arc;
use std::time::Instant;

use nalgebra::{Isometry3, Point3};
use rayon::prelude::*;
use tracing::debug;

use crate::correction::types::{
    select_strategy, CorrectionParams, CorrectionPreResults, CorrectionResults, Correspondence,
    Strategy, POSE_SWITCH,
};
use crate::correction::Corrector;
use crate::error::{CorrectionError, Result};
use crate::map::RayCastBackend;
use crate::reduction::{collect_stats, reduce_batch, reduce_single};
use crate::sensor::{RangeInterval, SensorModel};
use crate::solver::solve_batch;
use crate::timing::CorrectionTimings;

/// Match one (pose, ray) pair: cast the pose-transformed ray against the map
/// and accept the pair if the measured distance falls inside the sensor's
/// range interval and the simulated distance differs from it by at most
/// `max_distance`. The simulated distance itself is not range-clipped; a hit
/// beyond the sensor's reach still anchors a nearby measurement.
fn match_ray<B: RayCastBackend>(
    map: &B,
    ray_origin: &nalgebra::Vector3<f32>,
    ray_direction: &nalgebra::Vector3<f32>,
    measured: f32,
    range: RangeInterval,
    max_distance: f32,
    tsm: &Isometry3<f32>,
) -> Correspondence {
    if !range.contains(measured) {
        return Correspondence::invalid();
    }

    let origin = tsm.transform_point(&Point3::from(*ray_origin)).coords;
    let direction = tsm.rotation * ray_direction;

    let Some(hit) = map.cast(&origin, &direction) else {
        return Correspondence::invalid();
    };
    if (hit.distance - measured).abs() > max_distance {
        return Correspondence::invalid();
    }

    Correspondence {
        valid: true,
        model: origin + direction * hit.distance,
        dataset: origin + direction * measured,
    }
}

/// CPU corrector over a sensor model `M` and a ray-cast backend `B`.
///
/// Generic rather than boxed on the inside so the per-ray hot loop
/// monomorphizes; callers wanting runtime dispatch box the whole corrector
/// as a [`Corrector`].
pub struct CpuCorrector<M, B> {
    map: Arc<B>,
    model: Option<M>,
    ranges: Vec<f32>,
    params: CorrectionParams,
    pose_switch: usize,
}

impl<M, B> CpuCorrector<M, B>
where
    M: SensorModel,
    B: RayCastBackend,
{
    pub fn new(map: Arc<B>) -> Self {
        Self {
            map,
            model: None,
            ranges: Vec::new(),
            params: CorrectionParams::default(),
            pose_switch: POSE_SWITCH,
        }
    }

    /// Set the sensor model. Ranges set before a model with a different ray
    /// count are reported as a shape mismatch on the next correction.
    pub fn set_model(&mut self, model: M) {
        self.model = Some(model);
    }

    pub fn params(&self) -> &CorrectionParams {
        &self.params
    }

    /// Override the ray-wise/scan-wise switch point. Zero forces scan-wise
    /// for every batch.
    pub fn set_pose_switch(&mut self, pose_switch: usize) {
        self.pose_switch = pose_switch;
    }

    fn validate(&self) -> Result<(&M, &[f32])> {
        let model = self.model.as_ref().ok_or(CorrectionError::MissingModel)?;
        if self.ranges.is_empty() {
            return Err(CorrectionError::MissingRanges);
        }
        if self.ranges.len() != model.size() {
            return Err(CorrectionError::InputShape {
                expected: model.size(),
                got: self.ranges.len(),
            });
        }
        Ok((model, &self.ranges))
    }

    /// Sensor-to-map transform per pose.
    fn frame_transforms(&self, tbm: &[Isometry3<f64>]) -> Vec<Isometry3<f32>> {
        tbm.iter()
            .map(|pose| pose.cast::<f32>() * self.params.tsb)
            .collect()
    }

    fn compute_covs_impl(&self, tbm: &[Isometry3<f64>]) -> Result<CorrectionPreResults> {
        let (model, ranges) = self.validate()?;
        if tbm.is_empty() {
            return Ok(CorrectionPreResults::default());
        }

        let tsm = self.frame_transforms(tbm);
        let strategy = select_strategy(tbm.len(), self.pose_switch);
        debug!(
            num_poses = tbm.len(),
            num_rays = model.size(),
            ?strategy,
            "computing correspondence statistics"
        );

        let pre = match strategy {
            Strategy::RayWise => self.compute_ray_wise(model, ranges, &tsm),
            Strategy::ScanWise => self.compute_scan_wise(model, ranges, &tsm),
        };
        Ok(pre)
    }

    fn compute_ray_wise(
        &self,
        model: &M,
        ranges: &[f32],
        tsm: &[Isometry3<f32>],
    ) -> CorrectionPreResults {
        let num_rays = model.size();
        let width = model.width();
        let range = model.range();
        let max_distance = self.params.max_distance;

        let correspondences: Vec<Correspondence> = (0..tsm.len() * num_rays)
            .into_par_iter()
            .map(|idx| {
                let pose_idx = idx / num_rays;
                let ray_idx = idx % num_rays;
                let ray = model.ray(ray_idx / width, ray_idx % width);
                match_ray(
                    self.map.as_ref(),
                    &ray.origin,
                    &ray.direction,
                    ranges[ray_idx],
                    range,
                    max_distance,
                    &tsm[pose_idx],
                )
            })
            .collect();

        reduce_batch(&correspondences, num_rays)
    }

    fn compute_scan_wise(
        &self,
        model: &M,
        ranges: &[f32],
        tsm: &[Isometry3<f32>],
    ) -> CorrectionPreResults {
        let width = model.width();
        let range = model.range();
        let max_distance = self.params.max_distance;

        let stats = tsm
            .par_iter()
            .map(|tsm| {
                let correspondences: Vec<Correspondence> = (0..model.size())
                    .map(|ray_idx| {
                        let ray = model.ray(ray_idx / width, ray_idx % width);
                        match_ray(
                            self.map.as_ref(),
                            &ray.origin,
                            &ray.direction,
                            ranges[ray_idx],
                            range,
                            max_distance,
                            tsm,
                        )
                    })
                    .collect();
                reduce_single(&correspondences)
            })
            .collect();

        collect_stats(stats)
    }

    /// Time one full correction of `tbm`, repeated `runs` times, reporting
    /// the per-stage average. The correspondence and reduction stages are
    /// fused in the scan-wise strategy; their split is only meaningful for
    /// ray-wise batches.
    pub fn benchmark(&self, tbm: &[Isometry3<f64>], runs: u32) -> Result<CorrectionTimings> {
        let (model, ranges) = self.validate()?;
        let mut total = CorrectionTimings::default();

        for _ in 0..runs.max(1) {
            let tsm = self.frame_transforms(tbm);

            let start = Instant::now();
            let pre = match select_strategy(tbm.len(), self.pose_switch) {
                Strategy::RayWise => {
                    let num_rays = model.size();
                    let width = model.width();
                    let range = model.range();
                    let correspondences: Vec<Correspondence> = (0..tsm.len() * num_rays)
                        .into_par_iter()
                        .map(|idx| {
                            let ray_idx = idx % num_rays;
                            let ray = model.ray(ray_idx / width, ray_idx % width);
                            match_ray(
                                self.map.as_ref(),
                                &ray.origin,
                                &ray.direction,
                                ranges[ray_idx],
                                range,
                                self.params.max_distance,
                                &tsm[idx / num_rays],
                            )
                        })
                        .collect();
                    total.raycast_ms += start.elapsed().as_secs_f64() * 1e3;

                    let start = Instant::now();
                    let pre = reduce_batch(&correspondences, num_rays);
                    total.reduction_ms += start.elapsed().as_secs_f64() * 1e3;
                    pre
                }
                Strategy::ScanWise => {
                    let pre = self.compute_scan_wise(model, ranges, &tsm);
                    total.raycast_ms += start.elapsed().as_secs_f64() * 1e3;
                    pre
                }
            };

            let start = Instant::now();
            let _ = solve_batch(&pre);
            total.solve_ms += start.elapsed().as_secs_f64() * 1e3;
        }

        Ok(total.per_run(runs))
    }
}

impl<M, B> Corrector for CpuCorrector<M, B>
where
    M: SensorModel + Send,
    B: RayCastBackend,
{
    fn set_params(&mut self, params: CorrectionParams) {
        self.params = params;
    }

    fn set_input_data(&mut self, ranges: Vec<f32>) {
        self.ranges = ranges;
    }

    fn correct(&self, tbm: &[Isometry3<f64>]) -> Result<CorrectionResults> {
        let pre = self.compute_covs_impl(tbm)?;
        Ok(solve_batch(&pre))
    }

    fn compute_covs(&self, tbm: &[Isometry3<f64>]) -> Result<CorrectionPreResults> {
        self.compute_covs_impl(tbm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::TriangleMesh;
    use crate::sensor::OnDnModel;
    use crate::test_utils::{make_downward_model, make_plane_mesh, simulate_ranges};
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    fn plane_corrector() -> CpuCorrector<OnDnModel, TriangleMesh> {
        let map = Arc::new(make_plane_mesh(50.0, 0.0));
        let mut corrector = CpuCorrector::new(map);
        corrector.set_model(make_downward_model(4, 4, 0.5, 1.0));
        corrector
    }

    #[test]
    fn exact_ranges_give_identity() {
        let mut corrector = plane_corrector();
        corrector.set_input_data(vec![1.0; 16]);

        let pose = Isometry3::identity();
        let res = corrector.correct(&[pose]).unwrap();
        assert_eq!(res.ncorr, vec![16]);
        assert_relative_eq!(res.tdelta[0].translation.vector.norm(), 0.0, epsilon = 1e-5);
        assert_relative_eq!(res.tdelta[0].rotation.angle(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn longer_ranges_pull_the_pose_down() {
        // Measured 1.2 against a simulated 1.0: the floor is farther than
        // expected, so the correction moves the sensor down by 0.2.
        let mut corrector = plane_corrector();
        corrector.set_input_data(vec![1.2; 16]);

        let res = corrector.correct(&[Isometry3::identity()]).unwrap();
        assert_eq!(res.ncorr, vec![16]);
        assert_relative_eq!(
            res.tdelta[0].translation.vector,
            Vector3::new(0.0, 0.0, -0.2),
            epsilon = 1e-4
        );
    }

    #[test]
    fn out_of_radius_measurements_match_nothing() {
        let mut corrector = plane_corrector();
        corrector.set_params(CorrectionParams {
            max_distance: 0.05,
            ..CorrectionParams::default()
        });
        corrector.set_input_data(vec![1.5; 16]);

        let res = corrector.correct(&[Isometry3::identity()]).unwrap();
        assert_eq!(res.ncorr, vec![0]);
        assert_eq!(res.tdelta[0], Isometry3::identity());
    }

    #[test]
    fn hits_beyond_sensor_reach_still_match() {
        // Rays from z = 1.15 simulate 1.15 against the floor, past the 1.1
        // range limit. The measured 1.05 is in range and within the match
        // radius, so every pair must still count.
        let map = Arc::new(make_plane_mesh(50.0, 0.0));
        let mut corrector = CpuCorrector::new(map);
        let mut model = make_downward_model(2, 2, 0.5, 1.15);
        model.range = RangeInterval::new(0.0, 1.1);
        corrector.set_model(model);
        corrector.set_input_data(vec![1.05; 4]);

        let res = corrector.correct(&[Isometry3::identity()]).unwrap();
        assert_eq!(res.ncorr, vec![4]);
        assert_relative_eq!(
            res.tdelta[0].translation.vector,
            Vector3::new(0.0, 0.0, 0.1),
            epsilon = 1e-4
        );
    }

    #[test]
    fn strategies_agree() {
        let map = Arc::new(make_plane_mesh(50.0, 0.0));
        let model = make_downward_model(6, 3, 0.4, 1.0);
        let ranges = simulate_ranges(
            map.as_ref(),
            &model,
            &Isometry3::identity(),
            &Isometry3::translation(0.3, -0.2, 0.15),
        );

        let poses: Vec<_> = (0..5)
            .map(|i| Isometry3::translation(i as f64 * 0.1, 0.0, 0.05))
            .collect();

        let mut ray_wise = CpuCorrector::new(map.clone());
        ray_wise.set_model(model.clone());
        ray_wise.set_input_data(ranges.clone());
        ray_wise.set_pose_switch(usize::MAX);

        let mut scan_wise = CpuCorrector::new(map);
        scan_wise.set_model(model);
        scan_wise.set_input_data(ranges);
        scan_wise.set_pose_switch(0);

        let a = ray_wise.compute_covs(&poses).unwrap();
        let b = scan_wise.compute_covs(&poses).unwrap();
        assert_eq!(a.ncorr, b.ncorr);
        for i in 0..a.len() {
            assert_relative_eq!(a.ms[i], b.ms[i], epsilon = 1e-4);
            assert_relative_eq!(a.ds[i], b.ds[i], epsilon = 1e-4);
            assert_relative_eq!(a.cs[i], b.cs[i], epsilon = 1e-4);
        }
    }

    #[test]
    fn batch_results_match_individual_poses() {
        let mut corrector = plane_corrector();
        corrector.set_input_data(vec![1.1; 16]);

        let poses = vec![
            Isometry3::identity(),
            Isometry3::translation(0.2, 0.0, 0.1),
            Isometry3::translation(-0.1, 0.3, -0.05),
        ];

        let batch = corrector.correct(&poses).unwrap();
        for (i, pose) in poses.iter().enumerate() {
            let single = corrector.correct(std::slice::from_ref(pose)).unwrap();
            assert_eq!(single.ncorr[0], batch.ncorr[i]);
            assert_relative_eq!(
                single.tdelta[0].translation.vector,
                batch.tdelta[i].translation.vector,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn batch_size_does_not_change_per_pose_results() {
        // A pose's correction must not depend on how many neighbours share
        // the batch, including across the ray-wise/scan-wise switch.
        let mut corrector = plane_corrector();
        corrector.set_input_data(vec![1.1; 16]);

        let poses: Vec<_> = (0..300)
            .map(|i| {
                Isometry3::translation(
                    (i % 7) as f64 * 0.05,
                    (i % 5) as f64 * -0.04,
                    (i % 3) as f64 * 0.02,
                )
            })
            .collect();

        let singles: Vec<_> = poses[..7]
            .iter()
            .map(|pose| corrector.correct(std::slice::from_ref(pose)).unwrap())
            .collect();

        for switch in [usize::MAX, 100] {
            corrector.set_pose_switch(switch);
            let batch = corrector.correct(&poses).unwrap();
            assert_eq!(batch.len(), poses.len());
            for (i, single) in singles.iter().enumerate() {
                assert_eq!(single.ncorr[0], batch.ncorr[i]);
                assert_relative_eq!(
                    single.tdelta[0].translation.vector,
                    batch.tdelta[i].translation.vector,
                    epsilon = 1e-5
                );
                assert_relative_eq!(
                    single.tdelta[0].rotation.angle(),
                    batch.tdelta[i].rotation.angle(),
                    epsilon = 1e-5
                );
            }
        }
    }

    #[test]
    fn empty_pose_batch_is_empty() {
        let mut corrector = plane_corrector();
        corrector.set_input_data(vec![1.0; 16]);
        let res = corrector.correct(&[]).unwrap();
        assert!(res.is_empty());
    }

    #[test]
    fn missing_inputs_are_reported() {
        let map = Arc::new(make_plane_mesh(10.0, 0.0));
        let mut corrector: CpuCorrector<OnDnModel, _> = CpuCorrector::new(map);

        let err = corrector.correct(&[Isometry3::identity()]).unwrap_err();
        assert!(matches!(err, CorrectionError::MissingModel));

        corrector.set_model(make_downward_model(2, 2, 0.5, 1.0));
        let err = corrector.correct(&[Isometry3::identity()]).unwrap_err();
        assert!(matches!(err, CorrectionError::MissingRanges));

        corrector.set_input_data(vec![1.0; 3]);
        let err = corrector.correct(&[Isometry3::identity()]).unwrap_err();
        assert!(matches!(
            err,
            CorrectionError::InputShape {
                expected: 4,
                got: 3
            }
        ));
    }

    #[test]
    fn tsb_offset_is_honoured() {
        // Sensor mounted 0.5 above the base: ranges shrink by 0.5 but the
        // correction stays the identity when they are consistent.
        let map = Arc::new(make_plane_mesh(50.0, 0.0));
        let mut corrector = CpuCorrector::new(map);
        corrector.set_model(make_downward_model(3, 3, 0.5, 0.0));
        corrector.set_params(CorrectionParams {
            max_distance: 0.5,
            tsb: Isometry3::translation(0.0, 0.0, 0.5),
        });
        corrector.set_input_data(vec![1.5; 9]);

        let pose = Isometry3::translation(0.0, 0.0, 1.0);
        let res = corrector.correct(&[pose]).unwrap();
        assert_eq!(res.ncorr, vec![9]);
        assert_relative_eq!(res.tdelta[0].translation.vector.norm(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn benchmark_reports_positive_total() {
        let mut corrector = plane_corrector();
        corrector.set_input_data(vec![1.2; 16]);
        let poses = vec![Isometry3::identity(); 32];

        let timings = corrector.benchmark(&poses, 2).unwrap();
        assert!(timings.total_ms() > 0.0);
    }
}
