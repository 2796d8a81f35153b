//! Vectorised CPU fusion path. Every voxel is owned by exactly one
//! iteration of a rayon loop over the zipped field vectors, mirroring the
//! one-thread-per-voxel layout of the GPU kernel.

use glam::{UVec3, Vec3};
use rayon::prelude::*;

use crate::color;
use crate::geom::Pinhole;
use crate::grid::{GridParams, VolumeData, OCCL_UNSEEN, TSDF_FREE};
use crate::volume::Frame;

pub(crate) struct CpuVolume {
    dims: UVec3,
    origin: Vec3,
    voxel_size: f32,
    trunc_margin: f32,
    tsdf: Vec<f32>,
    weight: Vec<f32>,
    occl: Vec<f32>,
    color: Vec<f32>,
    mask: Vec<u32>,
}

impl CpuVolume {
    pub fn new(params: &GridParams) -> Self {
        let n = params.num_voxels();
        Self {
            dims: params.dims,
            origin: params.origin,
            voxel_size: params.voxel_size,
            trunc_margin: params.trunc_margin,
            tsdf: vec![TSDF_FREE; n],
            weight: vec![0.0; n],
            occl: vec![OCCL_UNSEEN; n],
            color: vec![0.0; n],
            mask: vec![0; n],
        }
    }

    pub fn integrate(
        &mut self,
        frame: &Frame<'_>,
        packed_color: &[f32],
        obs_weight: f32,
        clamp_dist: bool,
    ) {
        let im_w = frame.width as f32;
        let im_h = frame.height as f32;
        let stride = frame.width as usize;

        let cam_inv = frame.cam_pose.inverse();
        let rgb_inv = frame.rgb_pose.inverse();
        let cam = Pinhole::from_mat3(frame.cam_intr);
        let rgb = Pinhole::from_mat3(frame.rgb_intr);

        let origin = self.origin;
        let voxel_size = self.voxel_size;
        let trunc_margin = self.trunc_margin;
        let plane = (self.dims.y * self.dims.z) as usize;
        let dim_z = self.dims.z as usize;

        let depth_im = frame.depth;
        let mask_im = frame.mask;

        self.tsdf
            .par_iter_mut()
            .zip(self.weight.par_iter_mut())
            .zip(self.occl.par_iter_mut())
            .zip(self.color.par_iter_mut())
            .zip(self.mask.par_iter_mut())
            .enumerate()
            .for_each(|(idx, ((((tsdf, weight), occl), color), mask))| {
                let vx = idx / plane;
                let rem = idx - vx * plane;
                let vy = rem / dim_z;
                let vz = rem - vy * dim_z;
                let pt = origin + voxel_size * Vec3::new(vx as f32, vy as f32, vz as f32);

                let cam_pt = cam_inv.transform_point3(pt);
                if cam_pt.z <= 0.0 {
                    return;
                }
                let (px, py) = cam.project_rounded(cam_pt);
                if !(px >= 0.0 && px < im_w && py >= 0.0 && py < im_h) {
                    return;
                }
                let pix = py as usize * stride + px as usize;

                let depth_value = depth_im[pix];
                if depth_value == 0.0 {
                    return;
                }

                *mask |= mask_im[pix];

                let depth_diff = depth_value - cam_pt.z;
                *occl = occl.max(depth_diff);
                if depth_diff < -trunc_margin {
                    return;
                }

                let mut dist = depth_diff / trunc_margin;
                if clamp_dist {
                    dist = dist.min(1.0);
                }

                let w_old = *weight;
                let w_new = w_old + obs_weight;
                *tsdf = (*tsdf * w_old + obs_weight * dist) / w_new;
                *weight = w_new;

                // The sign test stays on the depth camera's z; the rgb
                // camera is assumed rigidly co-located.
                let rgb_pt = rgb_inv.transform_point3(pt);
                let (rx, ry) = rgb.project_rounded(rgb_pt);
                if !(rx >= 0.0 && rx < im_w && ry >= 0.0 && ry < im_h) {
                    return;
                }
                let rgb_pix = ry as usize * stride + rx as usize;

                *color = color::blend(*color, packed_color[rgb_pix], w_old, obs_weight, w_new);
            });
    }

    pub fn reset_visible(&mut self) {
        self.weight.fill(0.0);
        self.mask.fill(0);
    }

    pub fn snapshot(&self) -> VolumeData {
        VolumeData {
            dims: self.dims,
            tsdf: self.tsdf.clone(),
            occl: self.occl.clone(),
            color: self.color.clone(),
            mask: self.mask.clone(),
        }
    }

    pub fn weights(&self) -> Vec<f32> {
        self.weight.clone()
    }
}
