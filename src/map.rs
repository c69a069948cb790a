//! Ray-cast backend contract and a reference triangle-mesh implementation.
//!
//! The correction engines only need one operation from a map: cast a ray,
//! return the first hit distance. Production deployments are expected to plug
//! in an accelerated backend wrapping a prebuilt spatial index; index
//! construction is the collaborator's concern, not this crate's.
//!
//! [`TriangleMesh`] is the reference backend: a plain vertex/face soup with a
//! linear Möller–Trumbore scan over all faces, O(T) per ray. The same
//! flattened face buffer drives the GPU kernels, which scan it the same way.

use nalgebra::Vector3;

/// Minimum accepted hit distance. Rejects self-intersections at the ray
/// origin caused by floating-point noise.
const T_MIN: f32 = 1e-6;

/// First intersection of a ray with the map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Distance from the ray origin to the hit point, in multiples of the
    /// direction vector's length.
    pub distance: f32,
}

/// Map collaborator contract: first-hit ray casting against the static map.
///
/// Implementations must be safe to share across threads; the engines cast
/// from many rayon workers concurrently against one shared map.
pub trait RayCastBackend: Send + Sync {
    /// Cast a ray and return the first hit, or `None` if the ray leaves the
    /// map without intersecting anything.
    fn cast(&self, origin: &Vector3<f32>, direction: &Vector3<f32>) -> Option<RayHit>;
}

/// Indexed triangle mesh with brute-force ray casting.
#[derive(Debug, Clone, Default)]
pub struct TriangleMesh {
    vertices: Vec<Vector3<f32>>,
    faces: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn new(vertices: Vec<Vector3<f32>>, faces: Vec<[u32; 3]>) -> Self {
        Self { vertices, faces }
    }

    pub fn num_faces(&self) -> usize {
        self.faces.len()
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Flatten faces into a `[T * 9]` buffer (three vertices per face,
    /// row-major xyz) for GPU upload.
    pub fn flatten(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.faces.len() * 9);
        for face in &self.faces {
            for &vi in face {
                out.extend_from_slice(self.vertices[vi as usize].as_slice());
            }
        }
        out
    }
}

/// Möller–Trumbore ray/triangle intersection. Returns the hit distance along
/// `dir`, or `None` for a miss. Backface hits are accepted.
#[inline]
fn intersect_triangle(
    origin: &Vector3<f32>,
    dir: &Vector3<f32>,
    v0: &Vector3<f32>,
    v1: &Vector3<f32>,
    v2: &Vector3<f32>,
) -> Option<f32> {
    let e1 = v1 - v0;
    let e2 = v2 - v0;

    let pvec = dir.cross(&e2);
    let det = e1.dot(&pvec);
    if det.abs() < 1e-9 {
        return None;
    }
    let inv_det = 1.0 / det;

    let tvec = origin - v0;
    let u = tvec.dot(&pvec) * inv_det;
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let qvec = tvec.cross(&e1);
    let v = dir.dot(&qvec) * inv_det;
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    let t = e2.dot(&qvec) * inv_det;
    (t > T_MIN).then_some(t)
}

impl RayCastBackend for TriangleMesh {
    fn cast(&self, origin: &Vector3<f32>, direction: &Vector3<f32>) -> Option<RayHit> {
        let mut best: Option<f32> = None;
        for face in &self.faces {
            let v0 = &self.vertices[face[0] as usize];
            let v1 = &self.vertices[face[1] as usize];
            let v2 = &self.vertices[face[2] as usize];
            if let Some(t) = intersect_triangle(origin, direction, v0, v1, v2) {
                if best.map_or(true, |b| t < b) {
                    best = Some(t);
                }
            }
        }
        best.map(|distance| RayHit { distance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_plane_mesh, make_sphere_mesh};
    use approx::assert_relative_eq;

    #[test]
    fn downward_ray_hits_plane() {
        let mesh = make_plane_mesh(5.0, 0.0);
        let hit = mesh
            .cast(&Vector3::new(0.3, -0.7, 2.0), &Vector3::new(0.0, 0.0, -1.0))
            .expect("ray straight down must hit the plane");
        assert_relative_eq!(hit.distance, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn ray_away_from_plane_misses() {
        let mesh = make_plane_mesh(5.0, 0.0);
        let hit = mesh.cast(&Vector3::new(0.0, 0.0, 2.0), &Vector3::new(0.0, 0.0, 1.0));
        assert!(hit.is_none());
    }

    #[test]
    fn ray_outside_plane_extent_misses() {
        let mesh = make_plane_mesh(1.0, 0.0);
        let hit = mesh.cast(&Vector3::new(10.0, 10.0, 2.0), &Vector3::new(0.0, 0.0, -1.0));
        assert!(hit.is_none());
    }

    #[test]
    fn first_hit_wins_on_sphere() {
        // From outside a unit sphere, the first hit is the near surface.
        let mesh = make_sphere_mesh(32, 32, 1.0);
        let hit = mesh
            .cast(&Vector3::new(-3.0, 0.0, 0.0), &Vector3::new(1.0, 0.0, 0.0))
            .expect("ray through sphere center must hit");
        // Faceted sphere, so the tolerance is loose.
        assert_relative_eq!(hit.distance, 2.0, epsilon = 0.05);
    }

    #[test]
    fn flatten_layout() {
        let mesh = make_plane_mesh(1.0, 0.5);
        let flat = mesh.flatten();
        assert_eq!(flat.len(), mesh.num_faces() * 9);
        // Every vertex of the plane sits at z = 0.5.
        for v in flat.chunks_exact(3) {
            assert_relative_eq!(v[2], 0.5);
        }
    }
}
