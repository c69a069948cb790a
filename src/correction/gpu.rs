//! CUDA correction backend built on CubeCL.
//!
//! Mesh triangles, ray geometry, and measured ranges are uploaded once per
//! `set_*` call and reused across corrections; only the per-pose transforms
//! travel to the device per call. Strategy selection mirrors the CPU
//! backend: ray-wise launches one thread per (pose, ray) pair and reduces
//! the downloaded correspondences on the host, scan-wise launches one
//! thread per pose and downloads the finished statistics.

use std::time::Instant;

use cubecl::client::ComputeClient;
use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use nalgebra::{Isometry3, Matrix3, Vector3};
use tracing::debug;

use crate::correction::kernels::{correspondence_kernel, scanwise_stats_kernel};
use crate::correction::types::{
    select_strategy, CorrectionParams, CorrectionPreResults, CorrectionResults, Correspondence,
    Strategy, POSE_SWITCH,
};
use crate::correction::Corrector;
use crate::error::{CorrectionError, Result};
use crate::map::TriangleMesh;
use crate::reduction::reduce_batch;
use crate::sensor::SensorModel;
use crate::solver::solve_batch;
use crate::timing::CorrectionTimings;

/// Type alias for CUDA compute client
type CudaClient = ComputeClient<<CudaRuntime as Runtime>::Server>;

const CUBE_DIM: u32 = 256;

/// Check if CUDA is available on this system.
pub fn is_cuda_available() -> bool {
    // Try to create a device - if it fails, CUDA is not available
    std::panic::catch_unwind(|| {
        let _device = CudaDevice::new(0);
    })
    .is_ok()
}

/// GPU corrector over a sensor model `M` and a triangle-mesh map.
pub struct GpuCorrector<M> {
    /// CUDA device (kept alive for corrector lifetime)
    #[allow(dead_code)]
    device: CudaDevice,
    client: CudaClient,
    model: Option<M>,
    /// Flattened ray geometry, cached on model change.
    ray_origins: Vec<f32>,
    ray_directions: Vec<f32>,
    /// Flattened mesh triangles [T * 9].
    triangles: Vec<f32>,
    num_triangles: u32,
    ranges: Vec<f32>,
    params: CorrectionParams,
    pose_switch: usize,
}

impl<M: SensorModel> GpuCorrector<M> {
    /// Create a corrector on the default CUDA device.
    pub fn new(map: &TriangleMesh) -> Result<Self> {
        Self::with_device_id(map, 0)
    }

    pub fn with_device_id(map: &TriangleMesh, device_id: usize) -> Result<Self> {
        if !is_cuda_available() {
            return Err(CorrectionError::Backend(
                "CUDA device unavailable".to_string(),
            ));
        }
        let device = CudaDevice::new(device_id);
        let client = CudaRuntime::client(&device);

        let triangles = map.flatten();
        let num_triangles = map.num_faces() as u32;

        Ok(Self {
            device,
            client,
            model: None,
            ray_origins: Vec::new(),
            ray_directions: Vec::new(),
            triangles,
            num_triangles,
            ranges: Vec::new(),
            params: CorrectionParams::default(),
            pose_switch: POSE_SWITCH,
        })
    }

    pub fn set_model(&mut self, model: M) {
        let (origins, directions) = model.flatten_rays();
        self.ray_origins = origins;
        self.ray_directions = directions;
        self.model = Some(model);
    }

    /// Override the ray-wise/scan-wise switch point.
    pub fn set_pose_switch(&mut self, pose_switch: usize) {
        self.pose_switch = pose_switch;
    }

    fn validate(&self) -> Result<&M> {
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
        Ok(model)
    }

    /// Flatten sensor-to-map transforms to [N * 16] row-major.
    fn flatten_transforms(&self, tbm: &[Isometry3<f64>]) -> Vec<f32> {
        let mut out = Vec::with_capacity(tbm.len() * 16);
        for pose in tbm {
            let tsm = (pose.cast::<f32>() * self.params.tsb).to_homogeneous();
            for row in 0..4 {
                for col in 0..4 {
                    out.push(tsm[(row, col)]);
                }
            }
        }
        out
    }

    fn compute_covs_impl(&self, tbm: &[Isometry3<f64>]) -> Result<CorrectionPreResults> {
        let model = self.validate()?;
        if tbm.is_empty() {
            return Ok(CorrectionPreResults::default());
        }

        let strategy = select_strategy(tbm.len(), self.pose_switch);
        debug!(
            num_poses = tbm.len(),
            num_rays = model.size(),
            num_triangles = self.num_triangles,
            ?strategy,
            "launching correspondence kernels"
        );

        match strategy {
            Strategy::RayWise => self.compute_ray_wise(model, tbm),
            Strategy::ScanWise => self.compute_scan_wise(model, tbm),
        }
    }

    fn compute_ray_wise(&self, model: &M, tbm: &[Isometry3<f64>]) -> Result<CorrectionPreResults> {
        let num_rays = model.size();
        let num_poses = tbm.len();
        let num_pairs = num_poses * num_rays;
        let range = model.range();

        let transforms_flat = self.flatten_transforms(tbm);

        let origins_gpu = self.client.create(f32::as_bytes(&self.ray_origins));
        let directions_gpu = self.client.create(f32::as_bytes(&self.ray_directions));
        let ranges_gpu = self.client.create(f32::as_bytes(&self.ranges));
        let transforms_gpu = self.client.create(f32::as_bytes(&transforms_flat));
        let triangles_gpu = self.client.create(f32::as_bytes(&self.triangles));
        let params_flat = [range.min, range.max, self.params.max_distance];
        let params_gpu = self.client.create(f32::as_bytes(&params_flat));

        let valid_gpu = self.client.empty(num_pairs * std::mem::size_of::<u32>());
        let model_gpu = self.client.empty(num_pairs * 3 * std::mem::size_of::<f32>());
        let dataset_gpu = self.client.empty(num_pairs * 3 * std::mem::size_of::<f32>());

        let cube_count = num_pairs.div_ceil(CUBE_DIM as usize) as u32;
        unsafe {
            correspondence_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                CubeCount::Static(cube_count, 1, 1),
                CubeDim::new(CUBE_DIM, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&origins_gpu, self.ray_origins.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&directions_gpu, self.ray_directions.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&ranges_gpu, self.ranges.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&transforms_gpu, transforms_flat.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&triangles_gpu, self.triangles.len(), 1),
                ScalarArg::new(num_rays as u32),
                ScalarArg::new(num_poses as u32),
                ScalarArg::new(self.num_triangles),
                ArrayArg::from_raw_parts::<f32>(&params_gpu, params_flat.len(), 1),
                ArrayArg::from_raw_parts::<u32>(&valid_gpu, num_pairs, 1),
                ArrayArg::from_raw_parts::<f32>(&model_gpu, num_pairs * 3, 1),
                ArrayArg::from_raw_parts::<f32>(&dataset_gpu, num_pairs * 3, 1),
            );
        }

        let valid_bytes = self.client.read_one(valid_gpu.binding());
        let valid = u32::from_bytes(&valid_bytes);
        let model_bytes = self.client.read_one(model_gpu.binding());
        let model_points = f32::from_bytes(&model_bytes);
        let dataset_bytes = self.client.read_one(dataset_gpu.binding());
        let dataset_points = f32::from_bytes(&dataset_bytes);

        let correspondences: Vec<Correspondence> = (0..num_pairs)
            .map(|i| {
                if valid[i] == 0 {
                    Correspondence::invalid()
                } else {
                    let base = i * 3;
                    Correspondence {
                        valid: true,
                        model: Vector3::new(
                            model_points[base],
                            model_points[base + 1],
                            model_points[base + 2],
                        ),
                        dataset: Vector3::new(
                            dataset_points[base],
                            dataset_points[base + 1],
                            dataset_points[base + 2],
                        ),
                    }
                }
            })
            .collect();

        Ok(reduce_batch(&correspondences, num_rays))
    }

    fn compute_scan_wise(&self, model: &M, tbm: &[Isometry3<f64>]) -> Result<CorrectionPreResults> {
        let num_rays = model.size();
        let num_poses = tbm.len();
        let range = model.range();

        let transforms_flat = self.flatten_transforms(tbm);

        let origins_gpu = self.client.create(f32::as_bytes(&self.ray_origins));
        let directions_gpu = self.client.create(f32::as_bytes(&self.ray_directions));
        let ranges_gpu = self.client.create(f32::as_bytes(&self.ranges));
        let transforms_gpu = self.client.create(f32::as_bytes(&transforms_flat));
        let triangles_gpu = self.client.create(f32::as_bytes(&self.triangles));
        let params_flat = [range.min, range.max, self.params.max_distance];
        let params_gpu = self.client.create(f32::as_bytes(&params_flat));

        let means_dataset_gpu = self.client.empty(num_poses * 3 * std::mem::size_of::<f32>());
        let means_model_gpu = self.client.empty(num_poses * 3 * std::mem::size_of::<f32>());
        let covs_gpu = self.client.empty(num_poses * 9 * std::mem::size_of::<f32>());
        let ncorr_gpu = self.client.empty(num_poses * std::mem::size_of::<u32>());

        let cube_count = num_poses.div_ceil(CUBE_DIM as usize) as u32;
        unsafe {
            scanwise_stats_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                CubeCount::Static(cube_count, 1, 1),
                CubeDim::new(CUBE_DIM, 1, 1),
                ArrayArg::from_raw_parts::<f32>(&origins_gpu, self.ray_origins.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&directions_gpu, self.ray_directions.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&ranges_gpu, self.ranges.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&transforms_gpu, transforms_flat.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&triangles_gpu, self.triangles.len(), 1),
                ScalarArg::new(num_rays as u32),
                ScalarArg::new(num_poses as u32),
                ScalarArg::new(self.num_triangles),
                ArrayArg::from_raw_parts::<f32>(&params_gpu, params_flat.len(), 1),
                ArrayArg::from_raw_parts::<f32>(&means_dataset_gpu, num_poses * 3, 1),
                ArrayArg::from_raw_parts::<f32>(&means_model_gpu, num_poses * 3, 1),
                ArrayArg::from_raw_parts::<f32>(&covs_gpu, num_poses * 9, 1),
                ArrayArg::from_raw_parts::<u32>(&ncorr_gpu, num_poses, 1),
            );
        }

        let ms_bytes = self.client.read_one(means_dataset_gpu.binding());
        let ms_flat = f32::from_bytes(&ms_bytes);
        let ds_bytes = self.client.read_one(means_model_gpu.binding());
        let ds_flat = f32::from_bytes(&ds_bytes);
        let cs_bytes = self.client.read_one(covs_gpu.binding());
        let cs_flat = f32::from_bytes(&cs_bytes);
        let ncorr_bytes = self.client.read_one(ncorr_gpu.binding());
        let ncorr = u32::from_bytes(&ncorr_bytes);

        let mut pre = CorrectionPreResults::with_len(num_poses);
        for i in 0..num_poses {
            let b3 = i * 3;
            let b9 = i * 9;
            pre.ms[i] = Vector3::new(ms_flat[b3], ms_flat[b3 + 1], ms_flat[b3 + 2]).cast::<f64>();
            pre.ds[i] = Vector3::new(ds_flat[b3], ds_flat[b3 + 1], ds_flat[b3 + 2]).cast::<f64>();
            pre.cs[i] = Matrix3::new(
                cs_flat[b9],
                cs_flat[b9 + 1],
                cs_flat[b9 + 2],
                cs_flat[b9 + 3],
                cs_flat[b9 + 4],
                cs_flat[b9 + 5],
                cs_flat[b9 + 6],
                cs_flat[b9 + 7],
                cs_flat[b9 + 8],
            )
            .cast::<f64>();
            pre.ncorr[i] = ncorr[i];
        }
        Ok(pre)
    }

    /// Time one full correction of `tbm`, repeated `runs` times, reporting
    /// the per-stage average. `read_one` synchronizes, so device time lands
    /// in the raycast bucket.
    pub fn benchmark(&self, tbm: &[Isometry3<f64>], runs: u32) -> Result<CorrectionTimings> {
        self.validate()?;
        let mut total = CorrectionTimings::default();

        // The cubecl prelude brings its own `max` into scope.
        let runs = Ord::max(runs, 1);
        for _ in 0..runs {
            let start = Instant::now();
            let pre = self.compute_covs_impl(tbm)?;
            total.raycast_ms += start.elapsed().as_secs_f64() * 1e3;

            let start = Instant::now();
            let _ = solve_batch(&pre);
            total.solve_ms += start.elapsed().as_secs_f64() * 1e3;
        }

        Ok(total.per_run(runs))
    }
}

impl<M: SensorModel + Send> Corrector for GpuCorrector<M> {
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
    use crate::correction::cpu::CpuCorrector;
    use crate::test_utils::{make_downward_model, make_plane_mesh, make_sphere_mesh, vlp16};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    /// Skip test at runtime if CUDA is not available.
    macro_rules! require_cuda {
        () => {
            if !is_cuda_available() {
                eprintln!("Skipping test: CUDA not available");
                return;
            }
        };
    }

    fn assert_pre_results_close(a: &CorrectionPreResults, b: &CorrectionPreResults, eps: f64) {
        assert_eq!(a.ncorr, b.ncorr);
        for i in 0..a.len() {
            assert_relative_eq!(a.ms[i], b.ms[i], epsilon = eps);
            assert_relative_eq!(a.ds[i], b.ds[i], epsilon = eps);
            assert_relative_eq!(a.cs[i], b.cs[i], epsilon = eps);
        }
    }

    #[test]
    fn gpu_matches_cpu_on_plane() {
        require_cuda!();

        let mesh = make_plane_mesh(50.0, 0.0);
        let model = make_downward_model(8, 4, 0.3, 1.0);
        let ranges = vec![1.15; 32];
        let poses: Vec<_> = (0..6)
            .map(|i| Isometry3::translation(i as f64 * 0.2, 0.1, 0.05))
            .collect();

        let mut cpu = CpuCorrector::new(Arc::new(mesh.clone()));
        cpu.set_model(model.clone());
        cpu.set_input_data(ranges.clone());

        let mut gpu = GpuCorrector::new(&mesh).unwrap();
        gpu.set_model(model);
        gpu.set_input_data(ranges);

        let a = cpu.compute_covs(&poses).unwrap();
        let b = gpu.compute_covs(&poses).unwrap();
        assert_pre_results_close(&a, &b, 1e-3);
    }

    #[test]
    fn gpu_strategies_agree_on_sphere() {
        require_cuda!();

        let mesh = make_sphere_mesh(12, 24, 10.0);
        let model = vlp16(90);
        let ranges = vec![10.0; model.size()];
        let poses = vec![Isometry3::identity(), Isometry3::translation(0.2, 0.0, 0.0)];

        let mut ray_wise = GpuCorrector::new(&mesh).unwrap();
        ray_wise.set_model(model.clone());
        ray_wise.set_input_data(ranges.clone());
        ray_wise.set_pose_switch(usize::MAX);

        let mut scan_wise = GpuCorrector::new(&mesh).unwrap();
        scan_wise.set_model(model);
        scan_wise.set_input_data(ranges);
        scan_wise.set_pose_switch(0);

        let a = ray_wise.compute_covs(&poses).unwrap();
        let b = scan_wise.compute_covs(&poses).unwrap();
        assert_pre_results_close(&a, &b, 1e-3);
    }

    #[test]
    fn gpu_matches_hits_beyond_sensor_reach() {
        require_cuda!();

        let mesh = make_plane_mesh(50.0, 0.0);
        let mut model = make_downward_model(2, 2, 0.5, 1.15);
        model.range = crate::sensor::RangeInterval::new(0.0, 1.1);

        let mut gpu = GpuCorrector::new(&mesh).unwrap();
        gpu.set_model(model);
        gpu.set_input_data(vec![1.05; 4]);

        let res = gpu.correct(&[Isometry3::identity()]).unwrap();
        assert_eq!(res.ncorr, vec![4]);
        assert_relative_eq!(res.tdelta[0].translation.z, 0.1, epsilon = 1e-3);
    }

    #[test]
    fn gpu_correct_pulls_pose_down() {
        require_cuda!();

        let mesh = make_plane_mesh(50.0, 0.0);
        let model = make_downward_model(4, 4, 0.5, 1.0);
        let mut gpu = GpuCorrector::new(&mesh).unwrap();
        gpu.set_model(model);
        gpu.set_input_data(vec![1.2; 16]);

        let res = gpu.correct(&[Isometry3::identity()]).unwrap();
        assert_eq!(res.ncorr, vec![16]);
        assert_relative_eq!(res.tdelta[0].translation.z, -0.2, epsilon = 1e-3);
    }
}
