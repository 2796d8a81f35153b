//! Isosurface extraction and PLY export for dense voxel fields.

pub mod marching;
pub mod ply;

mod tables;

pub use marching::{marching_cubes, SurfaceMesh};
