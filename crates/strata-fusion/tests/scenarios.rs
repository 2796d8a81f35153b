//! End-to-end fusion scenarios on the CPU path, plus a GPU/CPU parity
//! check that runs when a device is available.

use assert_approx_eq::assert_approx_eq;
use glam::{vec3, Mat3, Mat4, Vec3};
use rand::{Rng, SeedableRng};
use strata_fusion::{
    color, Frame, FusionError, FusionOptions, TsdfVolume, VolumeBounds,
};

fn cpu_opts() -> FusionOptions {
    FusionOptions {
        use_gpu: false,
        clamp_dist: true,
    }
}

fn pinhole_intr(fx: f32, fy: f32, cx: f32, cy: f32) -> Mat3 {
    Mat3::from_cols(
        vec3(fx, 0.0, 0.0),
        vec3(0.0, fy, 0.0),
        vec3(cx, cy, 1.0),
    )
}

/// One voxel at the world origin, camera slightly behind it on the z axis
/// so the voxel sits at camera depth 0.01.
fn single_voxel_volume(clamp_dist: bool) -> TsdfVolume {
    TsdfVolume::new(
        VolumeBounds::new(Vec3::ZERO, Vec3::splat(0.02)),
        0.02,
        FusionOptions {
            use_gpu: false,
            clamp_dist,
        },
    )
    .unwrap()
}

fn single_pixel_frame<'a>(
    depth: &'a [f32],
    color: &'a [u8],
    mask: &'a [u32],
    pose: Mat4,
) -> Frame<'a> {
    Frame {
        color,
        depth,
        mask,
        width: 1,
        height: 1,
        cam_intr: Mat3::IDENTITY,
        cam_pose: pose,
        rgb_intr: Mat3::IDENTITY,
        rgb_pose: pose,
    }
}

fn behind_voxel() -> Mat4 {
    Mat4::from_translation(vec3(0.0, 0.0, -0.01))
}

#[test]
fn construction_initializes_all_fields() {
    let vol = TsdfVolume::new(
        VolumeBounds::new(Vec3::ZERO, Vec3::splat(0.1)),
        0.05,
        cpu_opts(),
    )
    .unwrap();
    assert_eq!(vol.params().dims, glam::uvec3(2, 2, 2));

    let data = vol.volume().unwrap();
    assert!(data.tsdf.iter().all(|&t| t == 1.0));
    assert!(data.occl.iter().all(|&o| o == -100.0));
    assert!(data.color.iter().all(|&c| c == 0.0));
    assert!(data.mask.iter().all(|&m| m == 0));
    assert!(vol.weights().unwrap().iter().all(|&w| w == 0.0));
}

#[test]
fn single_pixel_single_voxel() {
    let mut vol = single_voxel_volume(true);
    let depth = [1.0f32];
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, behind_voxel()), 1.0)
        .unwrap();

    let data = vol.volume().unwrap();
    // depth_diff = 1.0 - 0.01 clamps to the truncation bound.
    assert_approx_eq!(data.tsdf[0], 1.0, 1e-6);
    assert_approx_eq!(data.occl[0], 0.99, 1e-6);
    assert_eq!(data.mask[0], 3);
    assert_eq!(data.color[0], 200.0 * 65536.0 + 150.0 * 256.0 + 100.0);
    assert_eq!(color::unpack_u8(data.color[0]), [100, 150, 200]);
    assert_eq!(vol.weights().unwrap(), vec![1.0]);
}

#[test]
fn unclamped_policy_keeps_the_raw_distance() {
    let mut vol = single_voxel_volume(false);
    let depth = [1.0f32];
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, behind_voxel()), 1.0)
        .unwrap();

    let data = vol.volume().unwrap();
    assert_approx_eq!(data.tsdf[0], 9.9, 1e-4);
    assert_eq!(vol.weights().unwrap(), vec![1.0]);
}

#[test]
fn invalid_depth_leaves_the_grid_untouched() {
    let mut vol = single_voxel_volume(true);
    let depth = [0.0f32];
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, behind_voxel()), 1.0)
        .unwrap();

    let data = vol.volume().unwrap();
    assert_eq!(data.tsdf[0], 1.0);
    assert_eq!(data.occl[0], -100.0);
    assert_eq!(data.color[0], 0.0);
    assert_eq!(data.mask[0], 0);
    assert_eq!(vol.weights().unwrap(), vec![0.0]);
}

#[test]
fn out_of_frustum_leaves_the_grid_untouched() {
    let mut vol = single_voxel_volume(true);
    let depth = [1.0f32];
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    // Camera shifted so the voxel projects to u = -1.
    let pose = Mat4::from_translation(vec3(0.01, 0.0, -0.01));
    vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, pose), 1.0)
        .unwrap();

    let data = vol.volume().unwrap();
    assert_eq!(data.tsdf[0], 1.0);
    assert_eq!(data.occl[0], -100.0);
    assert_eq!(data.mask[0], 0);
    assert_eq!(vol.weights().unwrap(), vec![0.0]);
}

#[test]
fn behind_camera_leaves_the_grid_untouched() {
    let mut vol = single_voxel_volume(true);
    let depth = [1.0f32];
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    // Camera in front of the voxel, looking away: z_cam < 0.
    let pose = Mat4::from_translation(vec3(0.0, 0.0, 0.01));
    vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, pose), 1.0)
        .unwrap();

    let data = vol.volume().unwrap();
    assert_eq!(data.tsdf[0], 1.0);
    assert_eq!(data.occl[0], -100.0);
    assert_eq!(data.mask[0], 0);
    assert_eq!(vol.weights().unwrap(), vec![0.0]);
}

#[test]
fn running_mean_over_identical_frames() {
    let mut vol = single_voxel_volume(true);
    let depth = [1.0f32];
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    let frame = single_pixel_frame(&depth, &rgb, &mask, behind_voxel());
    vol.integrate(&frame, 1.0).unwrap();
    let once = vol.volume().unwrap();
    vol.integrate(&frame, 1.0).unwrap();
    let twice = vol.volume().unwrap();

    assert_eq!(vol.weights().unwrap(), vec![2.0]);
    assert_approx_eq!(twice.tsdf[0], once.tsdf[0], 1e-6);
    assert_eq!(color::unpack_u8(twice.color[0]), [100, 150, 200]);
    // OR is idempotent.
    assert_eq!(twice.mask[0], once.mask[0]);
}

#[test]
fn reset_visible_preserves_geometry() {
    let mut vol = single_voxel_volume(true);
    let depth = [1.0f32];
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, behind_voxel()), 1.0)
        .unwrap();
    let before = vol.volume().unwrap();

    vol.reset_visible();
    let after = vol.volume().unwrap();

    assert_eq!(vol.weights().unwrap(), vec![0.0]);
    assert_eq!(after.mask[0], 0);
    assert_eq!(after.tsdf[0], before.tsdf[0]);
    assert_eq!(after.occl[0], before.occl[0]);
    assert_eq!(after.color[0], before.color[0]);
}

#[test]
fn occlusion_keeps_the_maximum_disparity() {
    let mut vol = single_voxel_volume(true);
    let rgb = [100u8, 150, 200];
    let mask = [3u32];
    for depth in [[0.5f32], [2.0f32]] {
        vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, behind_voxel()), 1.0)
            .unwrap();
    }
    let data = vol.volume().unwrap();
    assert_approx_eq!(data.occl[0], 1.99, 1e-6);
}

#[test]
fn occlusion_is_monotone_over_any_sequence() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut vol = single_voxel_volume(true);
    let rgb = [10u8, 20, 30];
    let mask = [1u32];

    let mut prev = -100.0f32;
    for _ in 0..32 {
        let depth = [rng.gen_range(0.05f32..3.0)];
        vol.integrate(&single_pixel_frame(&depth, &rgb, &mask, behind_voxel()), 1.0)
            .unwrap();
        let occl = vol.volume().unwrap().occl[0];
        assert!(occl >= prev);
        prev = occl;
    }
}

#[test]
fn weighted_mean_matches_the_closed_form() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(13);
    let mut vol = single_voxel_volume(true);
    let rgb = [0u8, 0, 0];
    let mask = [0u32];

    let mut num = 0.0f64;
    let mut den = 0.0f64;
    for _ in 0..16 {
        // Depths close enough that the distance stays below the clamp.
        let d = rng.gen_range(0.02f32..0.10);
        let w = rng.gen_range(0.5f32..2.0);
        vol.integrate(&single_pixel_frame(&[d], &rgb, &mask, behind_voxel()), w)
            .unwrap();
        let s = (f64::from(d) - 0.01) / 0.1;
        num += f64::from(w) * s;
        den += f64::from(w);
    }

    let data = vol.volume().unwrap();
    assert_approx_eq!(data.tsdf[0], (num / den) as f32, 1e-4);
    assert_approx_eq!(vol.weights().unwrap()[0], den as f32, 1e-4);
}

#[test]
fn rejects_malformed_inputs() {
    let mut vol = single_voxel_volume(true);
    let rgb = [1u8, 2, 3];
    let mask = [0u32];

    let short_depth: [f32; 0] = [];
    let err = vol
        .integrate(
            &single_pixel_frame(&short_depth, &rgb, &mask, behind_voxel()),
            1.0,
        )
        .unwrap_err();
    assert!(matches!(err, FusionError::ShapeMismatch { name: "depth", .. }));

    let depth = [1.0f32];
    let err = vol
        .integrate(&single_pixel_frame(&depth, &rgb, &mask, behind_voxel()), 0.0)
        .unwrap_err();
    assert!(matches!(err, FusionError::InvalidObsWeight(_)));

    let mut frame = single_pixel_frame(&depth, &rgb, &mask, behind_voxel());
    frame.cam_intr = Mat3::ZERO;
    let err = vol.integrate(&frame, 1.0).unwrap_err();
    assert!(matches!(err, FusionError::DegenerateIntrinsics { .. }));

    assert!(matches!(
        vol.downsampled_occupancy(0),
        Err(FusionError::InvalidStride)
    ));
}

/// A fronto-parallel wall one meter from the camera, fused into a 16^3
/// grid. Exercises integration, extraction and the occupancy query on a
/// scene larger than one voxel.
struct WallScene {
    depth: Vec<f32>,
    rgb: Vec<u8>,
    mask: Vec<u32>,
}

impl WallScene {
    const SIZE: u32 = 128;

    fn new() -> Self {
        let pixels = (Self::SIZE * Self::SIZE) as usize;
        Self {
            depth: vec![1.0; pixels],
            rgb: [200u8, 120, 40].repeat(pixels),
            mask: vec![1; pixels],
        }
    }

    fn frame(&self) -> Frame<'_> {
        let intr = pinhole_intr(100.0, 100.0, 63.5, 63.5);
        let pose = Mat4::from_translation(vec3(0.0, 0.0, -0.5));
        Frame {
            color: &self.rgb,
            depth: &self.depth,
            mask: &self.mask,
            width: Self::SIZE,
            height: Self::SIZE,
            cam_intr: intr,
            cam_pose: pose,
            rgb_intr: intr,
            rgb_pose: pose,
        }
    }

    fn volume(&self, opts: FusionOptions) -> TsdfVolume {
        let mut vol = TsdfVolume::new(
            VolumeBounds::from_min_max_array([[-0.32, 0.32], [-0.32, 0.32], [0.0, 0.64]]),
            0.04,
            opts,
        )
        .unwrap();
        vol.integrate(&self.frame(), 1.0).unwrap();
        vol
    }
}

#[test]
fn wall_scene_extracts_a_surface_at_the_right_depth() -> anyhow::Result<()> {
    let scene = WallScene::new();
    let vol = scene.volume(cpu_opts());

    let (mesh, colors) = vol.mesh()?;
    assert!(!mesh.is_empty());
    assert_eq!(mesh.vertices.len(), colors.len());
    for v in &mesh.vertices {
        // The wall sits at world z = 0.5.
        assert!((v.z - 0.5).abs() < 0.05, "vertex {v} off the wall");
        assert!(v.x.abs() <= 0.33 && v.y.abs() <= 0.33);
    }
    for c in &colors {
        assert_eq!(*c, [200, 120, 40]);
    }
    Ok(())
}

#[test]
fn wall_scene_point_cloud_carries_labels() -> anyhow::Result<()> {
    let scene = WallScene::new();
    let vol = scene.volume(cpu_opts());

    let cloud = vol.point_cloud()?;
    assert!(!cloud.is_empty());
    for p in &cloud {
        assert!((p.position.z - 0.5).abs() < 0.1);
        assert_eq!(p.color, [200, 120, 40]);
        assert_eq!(p.mask, 1);
    }
    Ok(())
}

#[test]
fn wall_scene_occupancy_query() {
    let scene = WallScene::new();
    let vol = scene.volume(cpu_opts());

    let (points, occupied) = vol.downsampled_occupancy(4).unwrap();
    assert_eq!(points.len(), 4 * 4 * 4);
    assert_eq!(occupied.len(), points.len());

    // Decimated cell centers live on the coarse lattice.
    assert_eq!(points[0], vec3(-0.32, -0.32, 0.0));
    let cell = 0.04 * 4.0;
    assert_approx_eq!(points[1].z, cell, 1e-6);

    // Free space in front of the wall, surface band at it.
    let idx = |x: usize, y: usize, z: usize| (x * 4 + y) * 4 + z;
    assert!(!occupied[idx(2, 2, 0)]);
    assert!(occupied[idx(2, 2, 3)]);
}

#[test]
fn gpu_and_cpu_paths_agree() {
    let scene = WallScene::new();
    let gpu_vol = scene.volume(FusionOptions::default());
    if !gpu_vol.is_gpu() {
        eprintln!("skipping gpu parity test: no adapter available");
        return;
    }
    let cpu_vol = scene.volume(cpu_opts());

    let gpu = gpu_vol.volume().unwrap();
    let cpu = cpu_vol.volume().unwrap();

    assert_eq!(gpu_vol.weights().unwrap(), cpu_vol.weights().unwrap());
    assert_eq!(gpu.mask, cpu.mask);
    for (a, b) in gpu.tsdf.iter().zip(&cpu.tsdf) {
        assert_approx_eq!(a, b, 1e-4);
    }
    for (a, b) in gpu.occl.iter().zip(&cpu.occl) {
        assert_approx_eq!(a, b, 1e-4);
    }
    for (a, b) in gpu.color.iter().zip(&cpu.color) {
        let ca = color::unpack(*a);
        let cb = color::unpack(*b);
        assert!((ca.0 - cb.0).abs() <= 1.0);
        assert!((ca.1 - cb.1).abs() <= 1.0);
        assert!((ca.2 - cb.2).abs() <= 1.0);
    }
}
