//! Shared fixtures for unit tests and benchmarks: small procedural meshes,
//! sensor presets, and range simulation.

use std::f32::consts::PI;

use nalgebra::{Isometry3, Point3, Vector3};

use crate::map::{RayCastBackend, TriangleMesh};
use crate::sensor::{DiscreteInterval, OnDnModel, RangeInterval, SensorModel, SphericalModel};

/// Square plane at height `z`, spanning `[-half_extent, half_extent]` in x
/// and y, as two triangles.
pub fn make_plane_mesh(half_extent: f32, z: f32) -> TriangleMesh {
    let h = half_extent;
    let vertices = vec![
        Vector3::new(-h, -h, z),
        Vector3::new(h, -h, z),
        Vector3::new(h, h, z),
        Vector3::new(-h, h, z),
    ];
    let faces = vec![[0, 1, 2], [0, 2, 3]];
    TriangleMesh::new(vertices, faces)
}

/// UV sphere of the given `radius` centered at the origin.
pub fn make_sphere_mesh(rings: usize, sectors: usize, radius: f32) -> TriangleMesh {
    assert!(rings >= 2 && sectors >= 3);

    let mut vertices = Vec::with_capacity((rings + 1) * (sectors + 1));
    for ring in 0..=rings {
        let phi = PI * ring as f32 / rings as f32;
        for sector in 0..=sectors {
            let theta = 2.0 * PI * sector as f32 / sectors as f32;
            vertices.push(Vector3::new(
                radius * phi.sin() * theta.cos(),
                radius * phi.sin() * theta.sin(),
                radius * phi.cos(),
            ));
        }
    }

    let stride = sectors as u32 + 1;
    let mut faces = Vec::with_capacity(rings * sectors * 2);
    for ring in 0..rings as u32 {
        for sector in 0..sectors as u32 {
            let a = ring * stride + sector;
            let b = a + stride;
            faces.push([a, b, a + 1]);
            faces.push([b, b + 1, a + 1]);
        }
    }
    TriangleMesh::new(vertices, drop_degenerate(faces))
}

// Pole triangles collapse to a line and never intersect; filtering keeps the
// cast loop tight.
fn drop_degenerate(faces: Vec<[u32; 3]>) -> Vec<[u32; 3]> {
    faces
        .into_iter()
        .filter(|f| f[0] != f[1] && f[1] != f[2] && f[0] != f[2])
        .collect()
}

/// Regular `width × height` grid of downward rays on `spacing` centers,
/// origins at height `z` in the sensor frame.
pub fn make_downward_model(width: usize, height: usize, spacing: f32, z: f32) -> OnDnModel {
    let mut origins = Vec::with_capacity(width * height);
    let mut directions = Vec::with_capacity(width * height);
    let cx = (width as f32 - 1.0) * spacing * 0.5;
    let cy = (height as f32 - 1.0) * spacing * 0.5;
    for row in 0..height {
        for col in 0..width {
            origins.push(Vector3::new(
                col as f32 * spacing - cx,
                row as f32 * spacing - cy,
                z,
            ));
            directions.push(Vector3::new(0.0, 0.0, -1.0));
        }
    }
    OnDnModel::new(width, height, origins, directions, RangeInterval::default())
}

/// VLP-16 style spinning lidar: 16 elevation rings from -15° to 15°, `width`
/// azimuth steps over the full circle.
pub fn vlp16(width: usize) -> SphericalModel {
    SphericalModel {
        theta: DiscreteInterval::new(-PI, 2.0 * PI / width as f32, width),
        phi: DiscreteInterval::spanning(-15f32.to_radians(), 15f32.to_radians(), 16),
        range: RangeInterval::new(0.1, 130.0),
    }
}

/// Simulate a scan: cast every model ray from `pose · tsb` against the map
/// and return the hit distances in row-major ray order, 0.0 for misses.
pub fn simulate_ranges<B: RayCastBackend, M: SensorModel>(
    map: &B,
    model: &M,
    tsb: &Isometry3<f32>,
    pose: &Isometry3<f64>,
) -> Vec<f32> {
    let tsm = pose.cast::<f32>() * tsb;
    let mut ranges = Vec::with_capacity(model.size());
    for row in 0..model.height() {
        for col in 0..model.width() {
            let ray = model.ray(row, col);
            let origin = tsm.transform_point(&Point3::from(ray.origin)).coords;
            let direction = tsm.rotation * ray.direction;
            ranges.push(map.cast(&origin, &direction).map_or(0.0, |h| h.distance));
        }
    }
    ranges
}
