//! Small geometry helpers shared by both fusion paths: voxel-to-world
//! conversion, rigid point-set transforms, and pinhole projection.

use glam::{IVec2, Mat3, Mat4, UVec3, Vec3};

/// The four pinhole parameters pulled out of a 3x3 intrinsics matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pinhole {
    pub fx: f32,
    pub fy: f32,
    pub cx: f32,
    pub cy: f32,
}

impl Pinhole {
    pub fn from_mat3(intr: Mat3) -> Self {
        Self {
            fx: intr.x_axis.x,
            fy: intr.y_axis.y,
            cx: intr.z_axis.x,
            cy: intr.z_axis.y,
        }
    }

    /// Project a camera-space point to rounded pixel coordinates, kept as
    /// floats so the caller can bounds-test before any integer cast.
    /// Rounds half away from zero, like the GPU kernel.
    pub(crate) fn project_rounded(&self, p: Vec3) -> (f32, f32) {
        (
            (self.fx * p.x / p.z + self.cx).round(),
            (self.fy * p.y / p.z + self.cy).round(),
        )
    }
}

/// World position of each integer voxel coordinate: `origin + size * ijk`.
pub fn vox_to_world(origin: Vec3, coords: &[UVec3], voxel_size: f32) -> Vec<Vec3> {
    coords
        .iter()
        .map(|&c| origin + voxel_size * c.as_vec3())
        .collect()
}

/// Apply a 4x4 homogeneous transform to a point set.
pub fn rigid_transform(points: &[Vec3], transform: Mat4) -> Vec<Vec3> {
    points
        .iter()
        .map(|&p| transform.transform_point3(p))
        .collect()
}

/// Project camera-space points to integer pixel coordinates. Points at or
/// behind the camera plane are the caller's problem; the frustum test in
/// the fusion kernel rejects them before any image access.
pub fn cam_to_pix(cam_pts: &[Vec3], intr: Mat3) -> Vec<IVec2> {
    let pin = Pinhole::from_mat3(intr);
    cam_pts
        .iter()
        .map(|&p| {
            let (u, v) = pin.project_rounded(p);
            IVec2::new(u as i32, v as i32)
        })
        .collect()
}

/// World-space view frustum of a depth image: the camera center plus the
/// four image corners pushed out to the maximum observed depth. Callers
/// take the min/max of these over a frame sequence to size volume bounds.
pub fn view_frustum_corners(
    depth: &[f32],
    width: u32,
    height: u32,
    intr: Mat3,
    pose: Mat4,
) -> [Vec3; 5] {
    let pin = Pinhole::from_mat3(intr);
    let d = depth.iter().copied().fold(0.0f32, f32::max);
    let (w, h) = (width as f32, height as f32);

    let corner = |px: f32, py: f32| {
        Vec3::new((px - pin.cx) * d / pin.fx, (py - pin.cy) * d / pin.fy, d)
    };
    let cam_pts = [
        Vec3::ZERO,
        corner(0.0, 0.0),
        corner(0.0, h),
        corner(w, 0.0),
        corner(w, h),
    ];

    let world = rigid_transform(&cam_pts, pose);
    [world[0], world[1], world[2], world[3], world[4]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use glam::{uvec3, vec3};

    #[test]
    fn vox_to_world_scales_and_offsets() {
        let pts = vox_to_world(vec3(1.0, 2.0, 3.0), &[uvec3(0, 0, 0), uvec3(2, 0, 5)], 0.5);
        assert_eq!(pts[0], vec3(1.0, 2.0, 3.0));
        assert_eq!(pts[1], vec3(2.0, 2.0, 5.5));
    }

    #[test]
    fn rigid_transform_matches_inverse() {
        let pose = Mat4::from_rotation_y(0.7) * Mat4::from_translation(vec3(0.3, -1.0, 2.0));
        let p = vec3(0.25, 0.5, -1.5);
        let there = rigid_transform(&[p], pose);
        let back = rigid_transform(&there, pose.inverse());
        assert_approx_eq!(back[0].x, p.x, 1e-5);
        assert_approx_eq!(back[0].y, p.y, 1e-5);
        assert_approx_eq!(back[0].z, p.z, 1e-5);
    }

    #[test]
    fn cam_to_pix_rounds_to_nearest() {
        // fx = fy = 100, cx = cy = 64, stored column-major.
        let intr = Mat3::from_cols(
            vec3(100.0, 0.0, 0.0),
            vec3(0.0, 100.0, 0.0),
            vec3(64.0, 64.0, 1.0),
        );
        let pix = cam_to_pix(&[vec3(0.1, -0.2, 1.0), vec3(0.0, 0.0, 2.0)], intr);
        assert_eq!(pix[0], IVec2::new(74, 44));
        assert_eq!(pix[1], IVec2::new(64, 64));
    }

    #[test]
    fn frustum_corners_start_at_the_camera_center() {
        let intr = Mat3::from_cols(
            vec3(50.0, 0.0, 0.0),
            vec3(0.0, 50.0, 0.0),
            vec3(32.0, 32.0, 1.0),
        );
        let pose = Mat4::from_translation(vec3(1.0, 2.0, 3.0));
        let depth = [0.5f32, 2.0, 1.0];
        let corners = view_frustum_corners(&depth, 64, 64, intr, pose);

        assert_eq!(corners[0], vec3(1.0, 2.0, 3.0));
        for c in &corners[1..] {
            // All far corners sit at max depth in front of the camera.
            assert_approx_eq!(c.z, 5.0, 1e-6);
        }
    }
}
