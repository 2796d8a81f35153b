//! Thin wgpu plumbing shared by compute-heavy crates: device acquisition,
//! buffer helpers, and dispatch planning for 1-D domains folded onto the
//! 3-D workgroup grid.

use std::sync::mpsc;

use wgpu::util::DeviceExt;

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no compatible gpu adapter available")]
    AdapterUnavailable,
    #[error("failed to acquire gpu device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("gpu buffer mapping failed: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
    #[error("gpu readback channel closed before the map callback ran")]
    ReadbackChannel,
    #[error("domain of {bytes} bytes exceeds the device buffer limit of {limit} bytes")]
    BufferTooLarge { bytes: u64, limit: u64 },
}

/// Owned device/queue pair. Allocation and pipeline compilation are scoped
/// to this object; dropping it releases all device resources.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    limits: wgpu::Limits,
}

impl GpuContext {
    /// Acquire the best available adapter and a device with storage-buffer
    /// limits raised to whatever the adapter supports. Dense voxel grids
    /// routinely exceed the default 128 MiB binding limit.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or(GpuError::AdapterUnavailable)?;

        let adapter_limits = adapter.limits();
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..wgpu::Limits::default()
        };

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("strata device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                memory_hints: wgpu::MemoryHints::default(),
            },
            None,
        ))?;

        tracing::info!(adapter = %adapter.get_info().name, "acquired gpu device");

        Ok(Self {
            device,
            queue,
            limits,
        })
    }

    pub fn limits(&self) -> &wgpu::Limits {
        &self.limits
    }

    /// Fails early when a buffer of `bytes` cannot be bound on this device.
    pub fn check_buffer_size(&self, bytes: u64) -> Result<(), GpuError> {
        let limit = u64::from(self.limits.max_storage_buffer_binding_size)
            .min(self.limits.max_buffer_size);
        if bytes > limit {
            return Err(GpuError::BufferTooLarge { bytes, limit });
        }
        Ok(())
    }

    pub fn create_storage_buffer(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            })
    }

    pub fn create_uniform_buffer(&self, label: &str, contents: &[u8]) -> wgpu::Buffer {
        self.device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
    }

    /// Copy a storage buffer back to the host and reinterpret it as `T`s.
    /// Synchronous; polls the device until the map callback has run.
    pub fn read_buffer<T: bytemuck::Pod>(
        &self,
        buffer: &wgpu::Buffer,
        count: usize,
    ) -> Result<Vec<T>, GpuError> {
        let bytes = (count * std::mem::size_of::<T>()) as u64;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
        self.queue.submit([encoder.finish()]);

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        rx.recv().map_err(|_| GpuError::ReadbackChannel)??;

        let data = slice.get_mapped_range();
        let out = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging.unmap();
        Ok(out)
    }
}

/// How a flat domain of `domain` items maps onto the device: a 3-D
/// workgroup grid, repeated `launches` times with a per-launch offset when
/// a single dispatch cannot cover the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPlan {
    pub groups: [u32; 3],
    pub launches: u32,
}

impl DispatchPlan {
    /// Items covered by one launch.
    pub fn launch_span(&self, workgroup_size: u32) -> u64 {
        u64::from(self.groups[0])
            * u64::from(self.groups[1])
            * u64::from(self.groups[2])
            * u64::from(workgroup_size)
    }
}

/// Spread `domain.div_ceil(workgroup_size)` workgroups over x/y/z as close
/// to a cube as the per-dimension limit allows: x gets the floored cube
/// root, y the floored square root of the remainder, z the ceiling of what
/// is left. Whatever still does not fit becomes extra launches.
pub fn plan_dispatch(domain: u64, workgroup_size: u32, limits: &wgpu::Limits) -> DispatchPlan {
    assert!(domain > 0 && workgroup_size > 0);
    let t = u64::from(workgroup_size);
    let max_dim = u64::from(limits.max_compute_workgroups_per_dimension);

    let total_groups = domain.div_ceil(t);
    let gx = ((total_groups as f64).cbrt().floor() as u64).clamp(1, max_dim);
    let gy = (((total_groups as f64) / (gx as f64)).sqrt().floor() as u64).clamp(1, max_dim);
    let gz = total_groups.div_ceil(gx * gy).clamp(1, max_dim);

    let plan = DispatchPlan {
        groups: [gx as u32, gy as u32, gz as u32],
        launches: 1,
    };
    let launches = domain.div_ceil(plan.launch_span(workgroup_size));
    DispatchPlan {
        launches: launches as u32,
        ..plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn covers(domain: u64, workgroup_size: u32) {
        let limits = wgpu::Limits::default();
        let plan = plan_dispatch(domain, workgroup_size, &limits);
        let covered = plan.launch_span(workgroup_size) * u64::from(plan.launches);
        assert!(covered >= domain, "{covered} < {domain} for {plan:?}");
        for g in plan.groups {
            assert!(g >= 1 && g <= limits.max_compute_workgroups_per_dimension);
        }
    }

    #[test]
    fn single_workgroup_domain() {
        let plan = plan_dispatch(1, 256, &wgpu::Limits::default());
        assert_eq!(plan.groups, [1, 1, 1]);
        assert_eq!(plan.launches, 1);
    }

    #[test]
    fn plans_cover_their_domain() {
        for domain in [1, 255, 256, 257, 1 << 16, (1 << 24) + 3, 512 * 512 * 512] {
            covers(domain, 256);
            covers(domain, 64);
        }
    }
}
