//! The fused volume: construction-time backend choice, frame integration,
//! and the extraction / query API.

use glam::{Mat3, Mat4, UVec3, Vec3};
use serde::{Deserialize, Serialize};
use strata_mesh::{marching_cubes, SurfaceMesh};

use crate::color;
use crate::cpu::CpuVolume;
use crate::geom::Pinhole;
use crate::gpu::GpuVolume;
use crate::grid::{GridParams, VolumeData, OCCL_UNSEEN};
use crate::{FusionError, VolumeBounds};

/// Construction-time knobs. `use_gpu` is a request: when no usable device
/// exists the volume silently falls back to the CPU path and records the
/// choice in [`TsdfVolume::backend`]. `clamp_dist` caps the normalised
/// signed distance at 1 before averaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionOptions {
    pub use_gpu: bool,
    pub clamp_dist: bool,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            use_gpu: true,
            clamp_dist: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cpu,
    Gpu,
}

/// One posed RGB-D observation. `color` is interleaved r, g, b bytes,
/// `depth` is meters with 0 marking invalid pixels, `mask` is a per-pixel
/// label bitmask. Poses are rigid camera-to-world transforms; both images
/// share `width` x `height`.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub color: &'a [u8],
    pub depth: &'a [f32],
    pub mask: &'a [u32],
    pub width: u32,
    pub height: u32,
    pub cam_intr: Mat3,
    pub cam_pose: Mat4,
    pub rgb_intr: Mat3,
    pub rgb_pose: Mat4,
}

impl Frame<'_> {
    fn validate(&self) -> Result<(), FusionError> {
        let pixels = self.width as usize * self.height as usize;
        let check = |name: &'static str, got: usize, expected: usize| {
            if got == expected {
                Ok(())
            } else {
                Err(FusionError::ShapeMismatch {
                    name,
                    got,
                    expected,
                    width: self.width,
                    height: self.height,
                })
            }
        };
        check("depth", self.depth.len(), pixels)?;
        check("mask", self.mask.len(), pixels)?;
        check("color", self.color.len(), pixels * 3)?;

        for (name, intr) in [("depth", self.cam_intr), ("rgb", self.rgb_intr)] {
            let pin = Pinhole::from_mat3(intr);
            if pin.fx == 0.0 || pin.fy == 0.0 {
                return Err(FusionError::DegenerateIntrinsics {
                    name,
                    fx: pin.fx,
                    fy: pin.fy,
                });
            }
        }
        Ok(())
    }
}

/// Surface sample from the point-cloud query: world position, unpacked
/// color, and the OR-merged label bits of its voxel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CloudPoint {
    pub position: Vec3,
    pub color: [u8; 3],
    pub mask: u32,
}

enum BackendState {
    Cpu(CpuVolume),
    Gpu(GpuVolume),
}

/// Dense TSDF voxel volume with fixed bounds.
pub struct TsdfVolume {
    params: GridParams,
    clamp_dist: bool,
    backend: BackendState,
}

impl TsdfVolume {
    pub fn new(
        bounds: VolumeBounds,
        voxel_size: f32,
        opts: FusionOptions,
    ) -> Result<Self, FusionError> {
        let params = GridParams::new(bounds, voxel_size)?;
        tracing::info!(
            dims = ?params.dims,
            voxels = params.num_voxels(),
            trunc_margin = params.trunc_margin,
            "created tsdf volume"
        );

        let backend = if opts.use_gpu {
            match GpuVolume::new(&params) {
                Ok(gpu) => BackendState::Gpu(gpu),
                Err(err) => {
                    tracing::warn!(%err, "gpu unavailable, falling back to cpu fusion");
                    BackendState::Cpu(CpuVolume::new(&params))
                }
            }
        } else {
            BackendState::Cpu(CpuVolume::new(&params))
        };

        Ok(Self {
            params,
            clamp_dist: opts.clamp_dist,
            backend,
        })
    }

    pub fn params(&self) -> &GridParams {
        &self.params
    }

    pub fn backend(&self) -> BackendKind {
        match self.backend {
            BackendState::Cpu(_) => BackendKind::Cpu,
            BackendState::Gpu(_) => BackendKind::Gpu,
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.backend() == BackendKind::Gpu
    }

    /// Fuse one frame into the grid. Voxels outside the view frustum or
    /// hitting invalid depth are left untouched; everything else follows
    /// the weighted running-mean update.
    pub fn integrate(&mut self, frame: &Frame<'_>, obs_weight: f32) -> Result<(), FusionError> {
        frame.validate()?;
        if !(obs_weight > 0.0) {
            return Err(FusionError::InvalidObsWeight(obs_weight));
        }
        if frame.width == 0 || frame.height == 0 {
            return Ok(());
        }

        let _span =
            tracing::trace_span!("integrate", width = frame.width, height = frame.height).entered();

        let packed = color::fold_image(frame.color);
        match &mut self.backend {
            BackendState::Cpu(vol) => vol.integrate(frame, &packed, obs_weight, self.clamp_dist),
            BackendState::Gpu(vol) => vol.integrate(frame, &packed, obs_weight, self.clamp_dist),
        }
        Ok(())
    }

    /// Zero the observation weights and label masks while keeping TSDF,
    /// occlusion and color. Callers wipe the visibility witnesses between
    /// re-observations of a scene without losing the geometry prior.
    pub fn reset_visible(&mut self) {
        match &mut self.backend {
            BackendState::Cpu(vol) => vol.reset_visible(),
            BackendState::Gpu(vol) => vol.reset_visible(),
        }
    }

    /// Host-side copies of the four observable fields.
    pub fn volume(&self) -> Result<VolumeData, FusionError> {
        match &self.backend {
            BackendState::Cpu(vol) => Ok(vol.snapshot()),
            BackendState::Gpu(vol) => Ok(vol.snapshot()?),
        }
    }

    /// Host-side copy of the cumulative observation weights.
    pub fn weights(&self) -> Result<Vec<f32>, FusionError> {
        match &self.backend {
            BackendState::Cpu(vol) => Ok(vol.weights()),
            BackendState::Gpu(vol) => Ok(vol.weights()?),
        }
    }

    /// Extract the zero isosurface with per-vertex colors, restricted to
    /// voxels whose TSDF sits strictly inside (-0.5, 0.5).
    pub fn mesh(&self) -> Result<(SurfaceMesh, Vec<[u8; 3]>), FusionError> {
        let vol = self.volume()?;
        let valid: Vec<bool> = vol.tsdf.iter().map(|&t| t > -0.5 && t < 0.5).collect();
        let mut mesh = self.run_marching_cubes(&vol, &valid);
        let colors = sample_colors(&vol, &mesh.vertices);
        self.vertices_to_world(&mut mesh);
        Ok((mesh, colors))
    }

    /// Surface samples with color and label bits, using the wider
    /// (-0.5, 0.9) validity band of the point-cloud query.
    pub fn point_cloud(&self) -> Result<Vec<CloudPoint>, FusionError> {
        let vol = self.volume()?;
        let valid: Vec<bool> = vol.tsdf.iter().map(|&t| t > -0.5 && t < 0.9).collect();
        let mut mesh = self.run_marching_cubes(&vol, &valid);

        let points = mesh
            .vertices
            .iter()
            .map(|&v| {
                let idx = nearest_voxel(&vol, v);
                (color::unpack_u8(vol.color[idx]), vol.mask[idx])
            })
            .collect::<Vec<_>>();
        self.vertices_to_world(&mut mesh);

        Ok(mesh
            .vertices
            .iter()
            .zip(points)
            .map(|(&position, (color, mask))| CloudPoint {
                position,
                color,
                mask,
            })
            .collect())
    }

    /// Stride-`reduce` decimation of the grid together with a per-cell
    /// occupancy flag. A cell counts as occupied when its occlusion
    /// witness saw it behind a surface (`-100 < occl < 0`) or its TSDF
    /// sits in the surface band (`-0.5 < tsdf < 0.9`). Both arrays are
    /// flattened row-major with x outermost.
    pub fn downsampled_occupancy(
        &self,
        reduce: usize,
    ) -> Result<(Vec<Vec3>, Vec<bool>), FusionError> {
        if reduce == 0 {
            return Err(FusionError::InvalidStride);
        }
        let vol = self.volume()?;
        let dims = self.params.dims;
        let out_dims = UVec3::new(
            (dims.x as usize).div_ceil(reduce) as u32,
            (dims.y as usize).div_ceil(reduce) as u32,
            (dims.z as usize).div_ceil(reduce) as u32,
        );

        let cell_size = self.params.voxel_size * reduce as f32;
        let mut points = Vec::with_capacity(
            out_dims.x as usize * out_dims.y as usize * out_dims.z as usize,
        );
        let mut occupied = Vec::with_capacity(points.capacity());

        for x in 0..out_dims.x {
            for y in 0..out_dims.y {
                for z in 0..out_dims.z {
                    points.push(
                        self.params.origin + cell_size * Vec3::new(x as f32, y as f32, z as f32),
                    );
                    let idx = vol.index(
                        x * reduce as u32,
                        y * reduce as u32,
                        z * reduce as u32,
                    );
                    let occl = vol.occl[idx];
                    let tsdf = vol.tsdf[idx];
                    occupied.push(
                        (occl > OCCL_UNSEEN && occl < 0.0) || (tsdf > -0.5 && tsdf < 0.9),
                    );
                }
            }
        }
        Ok((points, occupied))
    }

    /// Decimated world-space cell centers only.
    pub fn downsampled_points(&self, reduce: usize) -> Result<Vec<Vec3>, FusionError> {
        Ok(self.downsampled_occupancy(reduce)?.0)
    }

    /// Decimated occupancy flags only.
    pub fn downsampled_collision_mask(&self, reduce: usize) -> Result<Vec<bool>, FusionError> {
        Ok(self.downsampled_occupancy(reduce)?.1)
    }

    fn run_marching_cubes(&self, vol: &VolumeData, valid: &[bool]) -> SurfaceMesh {
        let dims = [
            vol.dims.x as usize,
            vol.dims.y as usize,
            vol.dims.z as usize,
        ];
        marching_cubes(&vol.tsdf, dims, 0.0, Some(valid))
    }

    fn vertices_to_world(&self, mesh: &mut SurfaceMesh) {
        for v in &mut mesh.vertices {
            *v = *v * self.params.voxel_size + self.params.origin;
        }
    }
}

/// Color of the voxel nearest to a vertex in grid coordinates.
fn sample_colors(vol: &VolumeData, vertices: &[Vec3]) -> Vec<[u8; 3]> {
    vertices
        .iter()
        .map(|&v| color::unpack_u8(vol.color[nearest_voxel(vol, v)]))
        .collect()
}

fn nearest_voxel(vol: &VolumeData, v: Vec3) -> usize {
    let x = (v.x.round() as u32).min(vol.dims.x - 1);
    let y = (v.y.round() as u32).min(vol.dims.y - 1);
    let z = (v.z.round() as u32).min(vol.dims.z - 1);
    vol.index(x, y, z)
}
