//! Sensor model abstraction.
//!
//! A sensor model describes, per ray index, an origin and a unit direction in
//! sensor-local coordinates. Two shapes are provided:
//!
//! - [`SphericalModel`]: a regular angular scan (rotating lidar), rays derived
//!   from azimuth/elevation grids, all sharing the sensor origin.
//! - [`OnDnModel`]: an arbitrary origin-and-direction-per-ray model for
//!   sensors that do not fit a spherical pattern.
//!
//! Models are immutable for the duration of a correction call and are
//! borrowed, never copied, by the engines. Rays are indexed row-major:
//! `index = row * width + col`, and the measured range buffer is parallel to
//! that ordering.

use nalgebra::Vector3;

/// Validity bounds for measured ranges, in meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeInterval {
    pub min: f32,
    pub max: f32,
}

impl RangeInterval {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Whether a measured range lies within the valid interval.
    #[inline]
    pub fn contains(&self, range: f32) -> bool {
        range >= self.min && range <= self.max
    }
}

impl Default for RangeInterval {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: f32::INFINITY,
        }
    }
}

/// A single ray in sensor-local coordinates. `direction` is expected to be
/// unit length.
#[derive(Debug, Clone, Copy)]
pub struct Ray {
    pub origin: Vector3<f32>,
    pub direction: Vector3<f32>,
}

/// A regularly discretized angular axis: `count` samples starting at
/// `min_angle` with constant `increment` (radians).
#[derive(Debug, Clone, Copy)]
pub struct DiscreteInterval {
    pub min_angle: f32,
    pub increment: f32,
    pub count: usize,
}

impl DiscreteInterval {
    pub fn new(min_angle: f32, increment: f32, count: usize) -> Self {
        Self {
            min_angle,
            increment,
            count,
        }
    }

    /// Span an interval from `[min, max]` with `count` samples.
    pub fn spanning(min_angle: f32, max_angle: f32, count: usize) -> Self {
        let increment = if count > 1 {
            (max_angle - min_angle) / (count as f32 - 1.0)
        } else {
            0.0
        };
        Self {
            min_angle,
            increment,
            count,
        }
    }

    #[inline]
    pub fn angle(&self, i: usize) -> f32 {
        self.min_angle + self.increment * i as f32
    }
}

/// Per-ray geometry of a scanning sensor.
///
/// Implementations must be cheap to query: `ray()` sits inside the
/// correspondence hot loop and is called once per (pose, ray) pair.
pub trait SensorModel: Sync {
    /// Rays per scan row.
    fn width(&self) -> usize;

    /// Number of scan rows.
    fn height(&self) -> usize;

    /// Valid measured-range interval.
    fn range(&self) -> RangeInterval;

    /// Ray origin and unit direction in sensor coordinates.
    fn ray(&self, row: usize, col: usize) -> Ray;

    /// Total ray count.
    fn size(&self) -> usize {
        self.width() * self.height()
    }

    /// Flatten all rays into `[R * 3]` origin and direction buffers
    /// (row-major ray order) for GPU upload.
    fn flatten_rays(&self) -> (Vec<f32>, Vec<f32>) {
        let n = self.size();
        let mut origins = Vec::with_capacity(n * 3);
        let mut directions = Vec::with_capacity(n * 3);
        for row in 0..self.height() {
            for col in 0..self.width() {
                let ray = self.ray(row, col);
                origins.extend_from_slice(ray.origin.as_slice());
                directions.extend_from_slice(ray.direction.as_slice());
            }
        }
        (origins, directions)
    }
}

/// Regular spherical scan pattern: azimuth along the width axis, elevation
/// along the height axis, all rays originating at the sensor origin.
#[derive(Debug, Clone)]
pub struct SphericalModel {
    /// Azimuth axis (width).
    pub theta: DiscreteInterval,
    /// Elevation axis (height).
    pub phi: DiscreteInterval,
    pub range: RangeInterval,
}

impl SensorModel for SphericalModel {
    fn width(&self) -> usize {
        self.theta.count
    }

    fn height(&self) -> usize {
        self.phi.count
    }

    fn range(&self) -> RangeInterval {
        self.range
    }

    fn ray(&self, row: usize, col: usize) -> Ray {
        let phi = self.phi.angle(row);
        let theta = self.theta.angle(col);
        let (sp, cp) = phi.sin_cos();
        let (st, ct) = theta.sin_cos();
        Ray {
            origin: Vector3::zeros(),
            direction: Vector3::new(cp * ct, cp * st, sp),
        }
    }
}

/// Arbitrary origin/direction-per-ray model.
///
/// Directions are taken as given; callers are responsible for normalizing
/// them. Buffers are row-major and must hold `width * height` entries.
#[derive(Debug, Clone)]
pub struct OnDnModel {
    width: usize,
    height: usize,
    origins: Vec<Vector3<f32>>,
    directions: Vec<Vector3<f32>>,
    pub range: RangeInterval,
}

impl OnDnModel {
    pub fn new(
        width: usize,
        height: usize,
        origins: Vec<Vector3<f32>>,
        directions: Vec<Vector3<f32>>,
        range: RangeInterval,
    ) -> Self {
        assert_eq!(origins.len(), width * height, "origin buffer length");
        assert_eq!(directions.len(), width * height, "direction buffer length");
        Self {
            width,
            height,
            origins,
            directions,
            range,
        }
    }
}

impl SensorModel for OnDnModel {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn range(&self) -> RangeInterval {
        self.range
    }

    fn ray(&self, row: usize, col: usize) -> Ray {
        let idx = row * self.width + col;
        Ray {
            origin: self.origins[idx],
            direction: self.directions[idx],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    #[test]
    fn spherical_directions_are_unit() {
        let model = SphericalModel {
            theta: DiscreteInterval::spanning(-PI, PI, 16),
            phi: DiscreteInterval::spanning(-0.3, 0.3, 4),
            range: RangeInterval::default(),
        };

        assert_eq!(model.size(), 64);
        for row in 0..model.height() {
            for col in 0..model.width() {
                let ray = model.ray(row, col);
                assert_relative_eq!(ray.direction.norm(), 1.0, epsilon = 1e-6);
                assert_relative_eq!(ray.origin.norm(), 0.0);
            }
        }
    }

    #[test]
    fn spherical_forward_ray() {
        // Single ray at theta = 0, phi = 0 points along +x.
        let model = SphericalModel {
            theta: DiscreteInterval::new(0.0, 0.0, 1),
            phi: DiscreteInterval::new(0.0, 0.0, 1),
            range: RangeInterval::default(),
        };
        let ray = model.ray(0, 0);
        assert_relative_eq!(ray.direction.x, 1.0, epsilon = 1e-6);
        assert_relative_eq!(ray.direction.y, 0.0, epsilon = 1e-6);
        assert_relative_eq!(ray.direction.z, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn ondn_row_major_indexing() {
        let origins: Vec<_> = (0..6).map(|i| Vector3::new(i as f32, 0.0, 0.0)).collect();
        let directions = vec![Vector3::new(0.0, 0.0, -1.0); 6];
        let model = OnDnModel::new(3, 2, origins, directions, RangeInterval::default());

        assert_eq!(model.ray(0, 2).origin.x, 2.0);
        assert_eq!(model.ray(1, 0).origin.x, 3.0);
    }

    #[test]
    fn flatten_matches_ray_order() {
        let model = SphericalModel {
            theta: DiscreteInterval::spanning(-1.0, 1.0, 8),
            phi: DiscreteInterval::spanning(-0.2, 0.2, 3),
            range: RangeInterval::default(),
        };

        let (origins, directions) = model.flatten_rays();
        assert_eq!(origins.len(), model.size() * 3);
        assert_eq!(directions.len(), model.size() * 3);

        let ray = model.ray(2, 5);
        let idx = 2 * model.width() + 5;
        assert_relative_eq!(directions[idx * 3], ray.direction.x);
        assert_relative_eq!(directions[idx * 3 + 1], ray.direction.y);
        assert_relative_eq!(directions[idx * 3 + 2], ray.direction.z);
    }

    #[test]
    fn range_interval_bounds() {
        let range = RangeInterval::new(0.5, 30.0);
        assert!(range.contains(0.5));
        assert!(range.contains(30.0));
        assert!(!range.contains(0.4));
        assert!(!range.contains(30.1));
    }
}
