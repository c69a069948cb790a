//! CubeCL kernels for the GPU correction backend.
//!
//! # GPU Memory Layout
//!
//! - Ray origins/directions: [R, 3] flattened to [R * 3], row-major ray order
//! - Measured ranges: [R]
//! - Sensor-to-map transforms: [N, 16] flattened to [N * 16] (row-major 4x4)
//! - Mesh triangles: [T, 9] flattened to [T * 9] (three vertices per face)
//!
//! The ray-cast is a brute-force scan over all triangles, O(R*T) per pose, but
//! with good GPU parallelism for moderate mesh sizes.
//!
//! Helper math is inlined in the kernels; CubeCL type inference struggles
//! with generic helpers returning multiple values.

use cubecl::prelude::*;

/// Cast one ray against every triangle and return the nearest hit distance,
/// or -1.0 for a miss. Watertight enough for closed meshes: back faces are
/// accepted, near-parallel and behind-origin hits are rejected.
#[cube]
fn cast_ray_inline<F: Float>(
    ox: F,
    oy: F,
    oz: F,
    dx: F,
    dy: F,
    dz: F,
    triangles: &Array<F>,
    num_triangles: u32,
) -> F {
    let mut best = F::new(-1.0);

    for t in 0..num_triangles {
        let base = t * 9;
        let ax = triangles[base];
        let ay = triangles[base + 1];
        let az = triangles[base + 2];

        // Edge vectors of the triangle.
        let e1x = triangles[base + 3] - ax;
        let e1y = triangles[base + 4] - ay;
        let e1z = triangles[base + 5] - az;
        let e2x = triangles[base + 6] - ax;
        let e2y = triangles[base + 7] - ay;
        let e2z = triangles[base + 8] - az;

        // p = dir × e2
        let px = dy * e2z - dz * e2y;
        let py = dz * e2x - dx * e2z;
        let pz = dx * e2y - dy * e2x;

        let det = e1x * px + e1y * py + e1z * pz;
        let abs_det = F::abs(det);

        // Parallel rays are skipped with a conditional instead of `continue`;
        // control-flow shortcuts upset the CubeCL optimizer.
        if abs_det > F::new(1e-9) {
            let inv_det = F::new(1.0) / det;
            let sx = ox - ax;
            let sy = oy - ay;
            let sz = oz - az;

            let u = (sx * px + sy * py + sz * pz) * inv_det;
            if u >= F::new(0.0) && u <= F::new(1.0) {
                // q = s × e1
                let qx = sy * e1z - sz * e1y;
                let qy = sz * e1x - sx * e1z;
                let qz = sx * e1y - sy * e1x;

                let v = (dx * qx + dy * qy + dz * qz) * inv_det;
                if v >= F::new(0.0) && u + v <= F::new(1.0) {
                    let dist = (e2x * qx + e2y * qy + e2z * qz) * inv_det;
                    if dist > F::new(1e-6) && (best < F::new(0.0) || dist < best) {
                        best = dist;
                    }
                }
            }
        }
    }

    best
}

/// Ray-wise correspondence kernel: one thread per (pose, ray) pair.
///
/// Each thread transforms its ray into the map frame, casts it, applies the
/// range and acceptance checks, and writes a validity flag plus the model and
/// dataset points. The statistics reduction happens on the host.
#[cube(launch_unchecked)]
pub fn correspondence_kernel<F: Float>(
    // Ray origins [R * 3], sensor frame
    ray_origins: &Array<F>,
    // Ray unit directions [R * 3], sensor frame
    ray_directions: &Array<F>,
    // Measured ranges [R]
    ranges: &Array<F>,
    // Sensor-to-map transforms [N * 16] (row-major 4x4)
    transforms: &Array<F>,
    // Mesh triangles [T * 9]
    triangles: &Array<F>,
    // Number of rays per scan
    num_rays: u32,
    // Number of poses
    num_poses: u32,
    // Number of triangles
    num_triangles: u32,
    // Scalar parameters [range_min, range_max, max_distance]
    params: &Array<F>,
    // Output: validity flags [N * R]
    corr_valid: &mut Array<u32>,
    // Output: simulated hit points [N * R * 3], map frame
    model_points: &mut Array<F>,
    // Output: measured points [N * R * 3], map frame
    dataset_points: &mut Array<F>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_poses * num_rays {
        terminate!();
    }

    let pose_idx = idx / num_rays;
    let ray_idx = idx % num_rays;
    let range_min = params[0];
    let range_max = params[1];
    let max_distance = params[2];

    corr_valid[idx] = 0u32;
    let out_base = idx * 3;
    model_points[out_base] = F::new(0.0);
    model_points[out_base + 1] = F::new(0.0);
    model_points[out_base + 2] = F::new(0.0);
    dataset_points[out_base] = F::new(0.0);
    dataset_points[out_base + 1] = F::new(0.0);
    dataset_points[out_base + 2] = F::new(0.0);

    let measured = ranges[ray_idx];
    if measured >= range_min && measured <= range_max {
        let rbase = ray_idx * 3;
        let lox = ray_origins[rbase];
        let loy = ray_origins[rbase + 1];
        let loz = ray_origins[rbase + 2];
        let ldx = ray_directions[rbase];
        let ldy = ray_directions[rbase + 1];
        let ldz = ray_directions[rbase + 2];

        // Transform origin (with translation) and direction (rotation only)
        // into the map frame.
        let tbase = pose_idx * 16;
        let ox = transforms[tbase] * lox
            + transforms[tbase + 1] * loy
            + transforms[tbase + 2] * loz
            + transforms[tbase + 3];
        let oy = transforms[tbase + 4] * lox
            + transforms[tbase + 5] * loy
            + transforms[tbase + 6] * loz
            + transforms[tbase + 7];
        let oz = transforms[tbase + 8] * lox
            + transforms[tbase + 9] * loy
            + transforms[tbase + 10] * loz
            + transforms[tbase + 11];
        let dx = transforms[tbase] * ldx + transforms[tbase + 1] * ldy + transforms[tbase + 2] * ldz;
        let dy = transforms[tbase + 4] * ldx
            + transforms[tbase + 5] * ldy
            + transforms[tbase + 6] * ldz;
        let dz = transforms[tbase + 8] * ldx
            + transforms[tbase + 9] * ldy
            + transforms[tbase + 10] * ldz;

        let simulated = cast_ray_inline(ox, oy, oz, dx, dy, dz, triangles, num_triangles);

        // Negative means the cast missed; hits past the sensor's reach still
        // anchor nearby measurements, only the match radius filters them.
        if simulated > F::new(0.0) && F::abs(simulated - measured) <= max_distance {
            corr_valid[idx] = 1u32;
            model_points[out_base] = ox + dx * simulated;
            model_points[out_base + 1] = oy + dy * simulated;
            model_points[out_base + 2] = oz + dz * simulated;
            dataset_points[out_base] = ox + dx * measured;
            dataset_points[out_base + 1] = oy + dy * measured;
            dataset_points[out_base + 2] = oz + dz * measured;
        }
    }
}

/// Scan-wise statistics kernel: one thread per pose, rays traversed
/// sequentially.
///
/// Accumulates the correspondence count, point sums, and the raw second
/// moment `Σ model·datasetᵀ` in one pass, then finalizes the means and the
/// centered cross-covariance `C = Σ model·datasetᵀ / n − d·mᵀ` in registers
/// before writing. Per-ray buffers never materialize, so the footprint stays
/// O(N) for arbitrarily large pose batches.
#[cube(launch_unchecked)]
pub fn scanwise_stats_kernel<F: Float>(
    // Ray origins [R * 3], sensor frame
    ray_origins: &Array<F>,
    // Ray unit directions [R * 3], sensor frame
    ray_directions: &Array<F>,
    // Measured ranges [R]
    ranges: &Array<F>,
    // Sensor-to-map transforms [N * 16] (row-major 4x4)
    transforms: &Array<F>,
    // Mesh triangles [T * 9]
    triangles: &Array<F>,
    // Number of rays per scan
    num_rays: u32,
    // Number of poses
    num_poses: u32,
    // Number of triangles
    num_triangles: u32,
    // Scalar parameters [range_min, range_max, max_distance]
    params: &Array<F>,
    // Output: mean dataset point per pose [N * 3]
    means_dataset: &mut Array<F>,
    // Output: mean model point per pose [N * 3]
    means_model: &mut Array<F>,
    // Output: cross-covariances [N * 9] (row-major 3x3)
    covs: &mut Array<F>,
    // Output: correspondence counts [N]
    ncorr: &mut Array<u32>,
) {
    let pose_idx = ABSOLUTE_POS;

    if pose_idx >= num_poses {
        terminate!();
    }

    let range_min = params[0];
    let range_max = params[1];
    let max_distance = params[2];

    let tbase = pose_idx * 16;
    let t00 = transforms[tbase];
    let t01 = transforms[tbase + 1];
    let t02 = transforms[tbase + 2];
    let t03 = transforms[tbase + 3];
    let t10 = transforms[tbase + 4];
    let t11 = transforms[tbase + 5];
    let t12 = transforms[tbase + 6];
    let t13 = transforms[tbase + 7];
    let t20 = transforms[tbase + 8];
    let t21 = transforms[tbase + 9];
    let t22 = transforms[tbase + 10];
    let t23 = transforms[tbase + 11];

    let mut count = 0u32;
    let mut sum_dx = F::new(0.0);
    let mut sum_dy = F::new(0.0);
    let mut sum_dz = F::new(0.0);
    let mut sum_mx = F::new(0.0);
    let mut sum_my = F::new(0.0);
    let mut sum_mz = F::new(0.0);
    // Raw second moment Σ model·datasetᵀ, row-major.
    let mut s00 = F::new(0.0);
    let mut s01 = F::new(0.0);
    let mut s02 = F::new(0.0);
    let mut s10 = F::new(0.0);
    let mut s11 = F::new(0.0);
    let mut s12 = F::new(0.0);
    let mut s20 = F::new(0.0);
    let mut s21 = F::new(0.0);
    let mut s22 = F::new(0.0);

    for ray_idx in 0..num_rays {
        let measured = ranges[ray_idx];

        if measured >= range_min && measured <= range_max {
            let rbase = ray_idx * 3;
            let lox = ray_origins[rbase];
            let loy = ray_origins[rbase + 1];
            let loz = ray_origins[rbase + 2];
            let ldx = ray_directions[rbase];
            let ldy = ray_directions[rbase + 1];
            let ldz = ray_directions[rbase + 2];

            let ox = t00 * lox + t01 * loy + t02 * loz + t03;
            let oy = t10 * lox + t11 * loy + t12 * loz + t13;
            let oz = t20 * lox + t21 * loy + t22 * loz + t23;
            let dx = t00 * ldx + t01 * ldy + t02 * ldz;
            let dy = t10 * ldx + t11 * ldy + t12 * ldz;
            let dz = t20 * ldx + t21 * ldy + t22 * ldz;

            let simulated = cast_ray_inline(ox, oy, oz, dx, dy, dz, triangles, num_triangles);

            if simulated > F::new(0.0) && F::abs(simulated - measured) <= max_distance {
                let mx = ox + dx * simulated;
                let my = oy + dy * simulated;
                let mz = oz + dz * simulated;
                let px = ox + dx * measured;
                let py = oy + dy * measured;
                let pz = oz + dz * measured;

                count += 1u32;
                sum_dx += px;
                sum_dy += py;
                sum_dz += pz;
                sum_mx += mx;
                sum_my += my;
                sum_mz += mz;
                s00 += mx * px;
                s01 += mx * py;
                s02 += mx * pz;
                s10 += my * px;
                s11 += my * py;
                s12 += my * pz;
                s20 += mz * px;
                s21 += mz * py;
                s22 += mz * pz;
            }
        }
    }

    let out3 = pose_idx * 3;
    let out9 = pose_idx * 9;
    ncorr[pose_idx] = count;

    if count > 0u32 {
        let inv_n = F::new(1.0) / F::cast_from(count);
        let mean_dx = sum_dx * inv_n;
        let mean_dy = sum_dy * inv_n;
        let mean_dz = sum_dz * inv_n;
        let mean_mx = sum_mx * inv_n;
        let mean_my = sum_my * inv_n;
        let mean_mz = sum_mz * inv_n;

        means_dataset[out3] = mean_dx;
        means_dataset[out3 + 1] = mean_dy;
        means_dataset[out3 + 2] = mean_dz;
        means_model[out3] = mean_mx;
        means_model[out3 + 1] = mean_my;
        means_model[out3 + 2] = mean_mz;

        covs[out9] = s00 * inv_n - mean_mx * mean_dx;
        covs[out9 + 1] = s01 * inv_n - mean_mx * mean_dy;
        covs[out9 + 2] = s02 * inv_n - mean_mx * mean_dz;
        covs[out9 + 3] = s10 * inv_n - mean_my * mean_dx;
        covs[out9 + 4] = s11 * inv_n - mean_my * mean_dy;
        covs[out9 + 5] = s12 * inv_n - mean_my * mean_dz;
        covs[out9 + 6] = s20 * inv_n - mean_mz * mean_dx;
        covs[out9 + 7] = s21 * inv_n - mean_mz * mean_dy;
        covs[out9 + 8] = s22 * inv_n - mean_mz * mean_dz;
    } else {
        means_dataset[out3] = F::new(0.0);
        means_dataset[out3 + 1] = F::new(0.0);
        means_dataset[out3 + 2] = F::new(0.0);
        means_model[out3] = F::new(0.0);
        means_model[out3 + 1] = F::new(0.0);
        means_model[out3 + 2] = F::new(0.0);
        for i in 0..9u32 {
            covs[out9 + i] = F::new(0.0);
        }
    }
}
