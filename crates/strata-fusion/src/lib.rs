//! Volumetric fusion of posed RGB-D frames into a dense TSDF voxel grid.
//!
//! The grid tracks four fields per voxel: a truncated signed distance,
//! an occlusion witness (maximum observed signed depth disparity), a
//! weighted running-mean color packed into a single float, and a bitmask
//! OR-merged from per-frame label images. Frames are fused either by a
//! wgpu compute kernel or by a vectorised CPU path with the same
//! semantics, chosen at construction.

pub mod color;
pub mod geom;
pub mod grid;
pub mod volume;

mod cpu;
mod gpu;

pub use geom::Pinhole;
pub use grid::{GridParams, VolumeBounds, VolumeData};
pub use volume::{BackendKind, CloudPoint, Frame, FusionOptions, TsdfVolume};

#[derive(Debug, thiserror::Error)]
pub enum FusionError {
    #[error("volume bounds must be finite with min < max on every axis (axis {axis}: {min}..{max})")]
    InvalidBounds { axis: usize, min: f32, max: f32 },
    #[error("voxel size must be a positive finite number, got {0}")]
    InvalidVoxelSize(f32),
    #[error("{name} holds {got} elements, expected {expected} for a {width}x{height} frame")]
    ShapeMismatch {
        name: &'static str,
        got: usize,
        expected: usize,
        width: u32,
        height: u32,
    },
    #[error("{name} intrinsics need non-zero focal lengths (fx={fx}, fy={fy})")]
    DegenerateIntrinsics {
        name: &'static str,
        fx: f32,
        fy: f32,
    },
    #[error("observation weight must be positive, got {0}")]
    InvalidObsWeight(f32),
    #[error("decimation stride must be at least 1")]
    InvalidStride,
    #[error(transparent)]
    Gpu(#[from] strata_kernel::GpuError),
}
