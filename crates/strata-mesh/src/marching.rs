//! Marching cubes over a dense scalar field with an optional per-voxel
//! validity mask.

use std::collections::HashMap;

use glam::Vec3;

use crate::tables::{CORNER_OFFSETS, EDGE_CORNERS, TRI_TABLE};

/// Triangle mesh in voxel-grid coordinates with shared vertices and
/// per-vertex gradient normals. Callers scale vertices into world space.
#[derive(Debug, Clone, Default)]
pub struct SurfaceMesh {
    pub vertices: Vec<Vec3>,
    pub faces: Vec<[u32; 3]>,
    pub normals: Vec<Vec3>,
}

impl SurfaceMesh {
    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }
}

/// Extract the `level` isosurface of `field`, a dense `dims` grid stored
/// row-major with x outermost (`index = (x * dims[1] + y) * dims[2] + z`).
///
/// When `mask` is given, a cell contributes triangles only if all eight of
/// its corner voxels are marked valid.
pub fn marching_cubes(
    field: &[f32],
    dims: [usize; 3],
    level: f32,
    mask: Option<&[bool]>,
) -> SurfaceMesh {
    assert_eq!(field.len(), dims[0] * dims[1] * dims[2]);
    if let Some(mask) = mask {
        assert_eq!(mask.len(), field.len());
    }

    let mut mesh = SurfaceMesh::default();
    if dims[0] < 2 || dims[1] < 2 || dims[2] < 2 {
        return mesh;
    }

    let at = |x: usize, y: usize, z: usize| (x * dims[1] + y) * dims[2] + z;
    // One shared vertex per grid edge, keyed by the edge's lower voxel and
    // its axis.
    let mut edge_vertices: HashMap<(usize, usize, usize, usize), u32> = HashMap::new();

    for x in 0..dims[0] - 1 {
        for y in 0..dims[1] - 1 {
            for z in 0..dims[2] - 1 {
                let corners: [(usize, usize, usize); 8] = std::array::from_fn(|c| {
                    let [dx, dy, dz] = CORNER_OFFSETS[c];
                    (x + dx, y + dy, z + dz)
                });

                if let Some(mask) = mask {
                    if corners.iter().any(|&(cx, cy, cz)| !mask[at(cx, cy, cz)]) {
                        continue;
                    }
                }

                let values: [f32; 8] = std::array::from_fn(|c| {
                    let (cx, cy, cz) = corners[c];
                    field[at(cx, cy, cz)]
                });

                let mut case = 0usize;
                for (c, &v) in values.iter().enumerate() {
                    if v < level {
                        case |= 1 << c;
                    }
                }

                let tris = &TRI_TABLE[case];
                let mut t = 0;
                while tris[t] >= 0 {
                    let face: [u32; 3] = std::array::from_fn(|k| {
                        let edge = tris[t + k] as usize;
                        edge_vertex(
                            edge,
                            &corners,
                            &values,
                            level,
                            field,
                            dims,
                            &mut edge_vertices,
                            &mut mesh,
                        )
                    });
                    mesh.faces.push(face);
                    t += 3;
                }
            }
        }
    }

    mesh
}

#[allow(clippy::too_many_arguments)]
fn edge_vertex(
    edge: usize,
    corners: &[(usize, usize, usize); 8],
    values: &[f32; 8],
    level: f32,
    field: &[f32],
    dims: [usize; 3],
    edge_vertices: &mut HashMap<(usize, usize, usize, usize), u32>,
    mesh: &mut SurfaceMesh,
) -> u32 {
    let [a, b] = EDGE_CORNERS[edge];
    let pa = corners[a];
    let pb = corners[b];
    let lower = (pa.0.min(pb.0), pa.1.min(pb.1), pa.2.min(pb.2));
    let axis = if pa.0 != pb.0 {
        0
    } else if pa.1 != pb.1 {
        1
    } else {
        2
    };

    let key = (lower.0, lower.1, lower.2, axis);
    if let Some(&idx) = edge_vertices.get(&key) {
        return idx;
    }

    let va = values[a];
    let vb = values[b];
    let denom = vb - va;
    let t = if denom.abs() < 1e-12 {
        0.5
    } else {
        ((level - va) / denom).clamp(0.0, 1.0)
    };

    let wa = Vec3::new(pa.0 as f32, pa.1 as f32, pa.2 as f32);
    let wb = Vec3::new(pb.0 as f32, pb.1 as f32, pb.2 as f32);
    let normal = gradient(field, dims, pa)
        .lerp(gradient(field, dims, pb), t)
        .normalize_or_zero();

    let idx = mesh.vertices.len() as u32;
    mesh.vertices.push(wa.lerp(wb, t));
    mesh.normals.push(normal);
    edge_vertices.insert(key, idx);
    idx
}

/// Central-difference field gradient, one-sided at grid borders.
fn gradient(field: &[f32], dims: [usize; 3], p: (usize, usize, usize)) -> Vec3 {
    let at = |x: usize, y: usize, z: usize| (x * dims[1] + y) * dims[2] + z;
    let diff = |axis: usize| {
        let (x, y, z) = p;
        let coord = [x, y, z][axis];
        let hi = (coord + 1).min(dims[axis] - 1);
        let lo = coord.saturating_sub(1);
        let mut ph = [x, y, z];
        let mut pl = [x, y, z];
        ph[axis] = hi;
        pl[axis] = lo;
        let span = (hi - lo).max(1) as f32;
        (field[at(ph[0], ph[1], ph[2])] - field[at(pl[0], pl[1], pl[2])]) / span
    };
    Vec3::new(diff(0), diff(1), diff(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn sphere_field(dims: [usize; 3], center: Vec3, radius: f32) -> Vec<f32> {
        let mut field = vec![0.0; dims[0] * dims[1] * dims[2]];
        for x in 0..dims[0] {
            for y in 0..dims[1] {
                for z in 0..dims[2] {
                    let p = Vec3::new(x as f32, y as f32, z as f32);
                    field[(x * dims[1] + y) * dims[2] + z] = p.distance(center) - radius;
                }
            }
        }
        field
    }

    #[test]
    fn empty_field_produces_no_surface() {
        let dims = [8, 8, 8];
        let field = vec![1.0; 512];
        let mesh = marching_cubes(&field, dims, 0.0, None);
        assert!(mesh.is_empty());
        assert!(mesh.vertices.is_empty());
    }

    #[test]
    fn sphere_vertices_lie_on_the_isosurface() {
        let dims = [24, 24, 24];
        let center = Vec3::splat(11.5);
        let radius = 7.0;
        let field = sphere_field(dims, center, radius);
        let mesh = marching_cubes(&field, dims, 0.0, None);

        assert!(!mesh.is_empty());
        assert_eq!(mesh.vertices.len(), mesh.normals.len());
        for v in &mesh.vertices {
            let err = (v.distance(center) - radius).abs();
            assert!(err < 0.5, "vertex {v} is {err} off the sphere");
        }
        for f in &mesh.faces {
            for &i in f {
                assert!((i as usize) < mesh.vertices.len());
            }
        }
        for n in &mesh.normals {
            assert_approx_eq!(n.length(), 1.0, 1e-3);
        }
    }

    #[test]
    fn shared_vertices_are_deduplicated() {
        let dims = [16, 16, 16];
        let field = sphere_field(dims, Vec3::splat(7.5), 5.0);
        let mesh = marching_cubes(&field, dims, 0.0, None);
        // Far fewer shared vertices than the 3 * faces a soup would emit.
        assert!(mesh.vertices.len() < mesh.faces.len() * 2);
    }

    #[test]
    fn mask_excludes_cells() {
        let dims = [16, 16, 16];
        let field = sphere_field(dims, Vec3::splat(7.5), 5.0);
        let mask = vec![false; field.len()];
        let mesh = marching_cubes(&field, dims, 0.0, Some(&mask));
        assert!(mesh.is_empty());
    }
}
