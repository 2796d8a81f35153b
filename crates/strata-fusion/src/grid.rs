//! Grid configuration and host-side snapshots of the voxel fields.

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::FusionError;

/// Initial TSDF value: free / unseen space.
pub const TSDF_FREE: f32 = 1.0;
/// Occlusion witness sentinel for voxels never observed with valid depth.
pub const OCCL_UNSEEN: f32 = -100.0;

/// Truncation margin in voxels.
const TRUNC_MARGIN_VOXELS: f32 = 5.0;

/// Axis-aligned world-space bounds of the reconstruction volume, meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeBounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl VolumeBounds {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// Build from the `(3, 2)` min/max-per-axis layout callers often
    /// carry around.
    pub fn from_min_max_array(bounds: [[f32; 2]; 3]) -> Self {
        Self {
            min: Vec3::new(bounds[0][0], bounds[1][0], bounds[2][0]),
            max: Vec3::new(bounds[0][1], bounds[1][1], bounds[2][1]),
        }
    }
}

/// Immutable grid geometry, derived once at construction.
///
/// `dims` is the per-axis ceiling of the bounds span over `voxel_size`;
/// `bounds.max` is then snapped to `min + dims * voxel_size` so the voxel
/// lattice exactly spans the bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    pub bounds: VolumeBounds,
    pub voxel_size: f32,
    pub trunc_margin: f32,
    pub dims: UVec3,
    pub origin: Vec3,
}

impl GridParams {
    pub fn new(bounds: VolumeBounds, voxel_size: f32) -> Result<Self, FusionError> {
        if !voxel_size.is_finite() || voxel_size <= 0.0 {
            return Err(FusionError::InvalidVoxelSize(voxel_size));
        }
        for axis in 0..3 {
            let (min, max) = (bounds.min[axis], bounds.max[axis]);
            if !min.is_finite() || !max.is_finite() || max <= min {
                return Err(FusionError::InvalidBounds { axis, min, max });
            }
        }

        let span = bounds.max - bounds.min;
        let dims = UVec3::new(
            (span.x / voxel_size).ceil() as u32,
            (span.y / voxel_size).ceil() as u32,
            (span.z / voxel_size).ceil() as u32,
        );
        let snapped = VolumeBounds {
            min: bounds.min,
            max: bounds.min + dims.as_vec3() * voxel_size,
        };

        Ok(Self {
            bounds: snapped,
            voxel_size,
            trunc_margin: TRUNC_MARGIN_VOXELS * voxel_size,
            dims,
            origin: snapped.min,
        })
    }

    pub fn num_voxels(&self) -> usize {
        self.dims.x as usize * self.dims.y as usize * self.dims.z as usize
    }

    /// Flat index of a voxel, row-major with x outermost.
    pub fn voxel_index(&self, v: UVec3) -> usize {
        (v.x as usize * self.dims.y as usize + v.y as usize) * self.dims.z as usize + v.z as usize
    }
}

/// Host-side copy of the four observable voxel fields.
#[derive(Debug, Clone)]
pub struct VolumeData {
    pub dims: UVec3,
    pub tsdf: Vec<f32>,
    pub occl: Vec<f32>,
    pub color: Vec<f32>,
    pub mask: Vec<u32>,
}

impl VolumeData {
    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        (x as usize * self.dims.y as usize + y as usize) * self.dims.z as usize + z as usize
    }
}
