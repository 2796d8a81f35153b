//! GPU fusion path: dense field buffers on the device and one compute
//! thread per voxel.

use bytemuck::Zeroable;
use glam::{UVec3, Vec3};
use strata_kernel::{plan_dispatch, GpuContext, GpuError};

use crate::geom::Pinhole;
use crate::grid::{GridParams, VolumeData, OCCL_UNSEEN, TSDF_FREE};
use crate::volume::Frame;

/// Matches the @workgroup_size attribute in `shaders/integrate.wgsl`.
const WORKGROUP_SIZE: u32 = 256;

/// Uniform block mirroring the WGSL `Uniforms` struct layout.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct IntegrateUniforms {
    cam_pose: [[f32; 4]; 4],
    rgb_pose: [[f32; 4]; 4],
    cam_intr: [f32; 4],
    rgb_intr: [f32; 4],
    vol_origin: [f32; 4],
    vol_dim: [u32; 4],
    img_size: [u32; 4],
    fusion: [f32; 4],
}

pub(crate) struct GpuVolume {
    ctx: GpuContext,
    pipeline: wgpu::ComputePipeline,
    bind_layout: wgpu::BindGroupLayout,
    uniforms: wgpu::Buffer,
    tsdf: wgpu::Buffer,
    weight: wgpu::Buffer,
    occl: wgpu::Buffer,
    color: wgpu::Buffer,
    mask: wgpu::Buffer,
    num_voxels: usize,
    dims: UVec3,
    origin: Vec3,
    voxel_size: f32,
    trunc_margin: f32,
}

impl GpuVolume {
    pub fn new(params: &GridParams) -> Result<Self, GpuError> {
        let ctx = GpuContext::new()?;
        let n = params.num_voxels();
        ctx.check_buffer_size(n as u64 * std::mem::size_of::<f32>() as u64)?;

        let tsdf = ctx.create_storage_buffer("tsdf volume", bytemuck::cast_slice(&vec![TSDF_FREE; n]));
        let weight = ctx.create_storage_buffer("weight volume", bytemuck::cast_slice(&vec![0.0f32; n]));
        let occl =
            ctx.create_storage_buffer("occlusion volume", bytemuck::cast_slice(&vec![OCCL_UNSEEN; n]));
        let color = ctx.create_storage_buffer("color volume", bytemuck::cast_slice(&vec![0.0f32; n]));
        let mask = ctx.create_storage_buffer("mask volume", bytemuck::cast_slice(&vec![0u32; n]));
        let uniforms = ctx.create_uniform_buffer(
            "integrate uniforms",
            bytemuck::bytes_of(&IntegrateUniforms::zeroed()),
        );

        let module = ctx
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("tsdf integrate"),
                source: wgpu::ShaderSource::Wgsl(include_str!("shaders/integrate.wgsl").into()),
            });

        let mut entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }];
        for binding in 1..=8u32 {
            entries.push(storage_entry(binding, binding >= 6));
        }
        let bind_layout = ctx
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("tsdf integrate"),
                entries: &entries,
            });

        let layout = ctx
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("tsdf integrate"),
                bind_group_layouts: &[&bind_layout],
                push_constant_ranges: &[],
            });
        let pipeline = ctx
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("tsdf integrate"),
                layout: Some(&layout),
                module: &module,
                entry_point: "integrate",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        Ok(Self {
            ctx,
            pipeline,
            bind_layout,
            uniforms,
            tsdf,
            weight,
            occl,
            color,
            mask,
            num_voxels: n,
            dims: params.dims,
            origin: params.origin,
            voxel_size: params.voxel_size,
            trunc_margin: params.trunc_margin,
        })
    }

    pub fn integrate(
        &self,
        frame: &Frame<'_>,
        packed_color: &[f32],
        obs_weight: f32,
        clamp_dist: bool,
    ) {
        let uniforms = IntegrateUniforms {
            cam_pose: frame.cam_pose.to_cols_array_2d(),
            rgb_pose: frame.rgb_pose.to_cols_array_2d(),
            cam_intr: intr4(Pinhole::from_mat3(frame.cam_intr)),
            rgb_intr: intr4(Pinhole::from_mat3(frame.rgb_intr)),
            vol_origin: [self.origin.x, self.origin.y, self.origin.z, 0.0],
            vol_dim: [self.dims.x, self.dims.y, self.dims.z, u32::from(clamp_dist)],
            img_size: [frame.width, frame.height, 0, 0],
            fusion: [self.voxel_size, self.trunc_margin, obs_weight, 0.0],
        };
        self.ctx
            .queue
            .write_buffer(&self.uniforms, 0, bytemuck::bytes_of(&uniforms));

        let depth_buf = self
            .ctx
            .create_storage_buffer("depth image", bytemuck::cast_slice(frame.depth));
        let color_buf = self
            .ctx
            .create_storage_buffer("packed color image", bytemuck::cast_slice(packed_color));
        let mask_buf = self
            .ctx
            .create_storage_buffer("mask image", bytemuck::cast_slice(frame.mask));

        let buffers = [
            &self.uniforms,
            &self.tsdf,
            &self.weight,
            &self.occl,
            &self.color,
            &self.mask,
            &depth_buf,
            &color_buf,
            &mask_buf,
        ];
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(i, buffer)| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        let bind_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("tsdf integrate"),
            layout: &self.bind_layout,
            entries: &entries,
        });

        let plan = plan_dispatch(self.num_voxels as u64, WORKGROUP_SIZE, self.ctx.limits());
        let launch_offset = (std::mem::offset_of!(IntegrateUniforms, img_size) + 8) as u64;
        for launch in 0..plan.launches {
            if launch > 0 {
                self.ctx
                    .queue
                    .write_buffer(&self.uniforms, launch_offset, bytemuck::bytes_of(&launch));
            }
            let mut encoder = self
                .ctx
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("tsdf integrate"),
                });
            {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("tsdf integrate"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(plan.groups[0], plan.groups[1], plan.groups[2]);
            }
            self.ctx.queue.submit([encoder.finish()]);
        }
    }

    pub fn reset_visible(&self) {
        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("reset visible"),
            });
        encoder.clear_buffer(&self.weight, 0, None);
        encoder.clear_buffer(&self.mask, 0, None);
        self.ctx.queue.submit([encoder.finish()]);
    }

    pub fn snapshot(&self) -> Result<VolumeData, GpuError> {
        Ok(VolumeData {
            dims: self.dims,
            tsdf: self.ctx.read_buffer(&self.tsdf, self.num_voxels)?,
            occl: self.ctx.read_buffer(&self.occl, self.num_voxels)?,
            color: self.ctx.read_buffer(&self.color, self.num_voxels)?,
            mask: self.ctx.read_buffer(&self.mask, self.num_voxels)?,
        })
    }

    pub fn weights(&self) -> Result<Vec<f32>, GpuError> {
        self.ctx.read_buffer(&self.weight, self.num_voxels)
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn intr4(p: Pinhole) -> [f32; 4] {
    [p.fx, p.fy, p.cx, p.cy]
}
