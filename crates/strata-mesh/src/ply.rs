//! ASCII PLY writers for colored meshes and point clouds.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use glam::Vec3;

/// Write a colored triangle mesh with per-vertex normals.
///
/// Vertex rows are `x y z nx ny nz red green blue`, face rows are
/// `3 i0 i1 i2`.
pub fn write_mesh_ply<W: Write>(
    w: &mut W,
    vertices: &[Vec3],
    normals: &[Vec3],
    colors: &[[u8; 3]],
    faces: &[[u32; 3]],
) -> io::Result<()> {
    assert_eq!(vertices.len(), normals.len());
    assert_eq!(vertices.len(), colors.len());

    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "element vertex {}", vertices.len())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    writeln!(w, "property float nx")?;
    writeln!(w, "property float ny")?;
    writeln!(w, "property float nz")?;
    writeln!(w, "property uchar red")?;
    writeln!(w, "property uchar green")?;
    writeln!(w, "property uchar blue")?;
    writeln!(w, "element face {}", faces.len())?;
    writeln!(w, "property list uchar int vertex_index")?;
    writeln!(w, "end_header")?;

    for ((v, n), c) in vertices.iter().zip(normals).zip(colors) {
        writeln!(
            w,
            "{:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {} {} {}",
            v.x, v.y, v.z, n.x, n.y, n.z, c[0], c[1], c[2]
        )?;
    }
    for f in faces {
        writeln!(w, "3 {} {} {}", f[0], f[1], f[2])?;
    }
    Ok(())
}

/// Write a colored point cloud; rows are `x y z red green blue`.
pub fn write_point_cloud_ply<W: Write>(
    w: &mut W,
    points: &[Vec3],
    colors: &[[u8; 3]],
) -> io::Result<()> {
    assert_eq!(points.len(), colors.len());

    writeln!(w, "ply")?;
    writeln!(w, "format ascii 1.0")?;
    writeln!(w, "element vertex {}", points.len())?;
    writeln!(w, "property float x")?;
    writeln!(w, "property float y")?;
    writeln!(w, "property float z")?;
    writeln!(w, "property uchar red")?;
    writeln!(w, "property uchar green")?;
    writeln!(w, "property uchar blue")?;
    writeln!(w, "end_header")?;

    for (p, c) in points.iter().zip(colors) {
        writeln!(
            w,
            "{:.6} {:.6} {:.6} {} {} {}",
            p.x, p.y, p.z, c[0], c[1], c[2]
        )?;
    }
    Ok(())
}

pub fn save_mesh_ply<P: AsRef<Path>>(
    path: P,
    vertices: &[Vec3],
    normals: &[Vec3],
    colors: &[[u8; 3]],
    faces: &[[u32; 3]],
) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_mesh_ply(&mut w, vertices, normals, colors, faces)?;
    w.flush()
}

pub fn save_point_cloud_ply<P: AsRef<Path>>(
    path: P,
    points: &[Vec3],
    colors: &[[u8; 3]],
) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_point_cloud_ply(&mut w, points, colors)?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_header_and_rows() {
        let vertices = [Vec3::ZERO, Vec3::X, Vec3::Y];
        let normals = [Vec3::Z; 3];
        let colors = [[255, 0, 0], [0, 255, 0], [0, 0, 255]];
        let faces = [[0u32, 1, 2]];

        let mut out = Vec::new();
        write_mesh_ply(&mut out, &vertices, &normals, &colors, &faces).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("ply\nformat ascii 1.0\nelement vertex 3\n"));
        assert!(text.contains("property list uchar int vertex_index\n"));
        assert!(text.contains("0.000000 0.000000 0.000000 0.000000 0.000000 1.000000 255 0 0\n"));
        assert!(text.trim_end().ends_with("3 0 1 2"));
    }

    #[test]
    fn point_cloud_rows() {
        let points = [Vec3::new(1.5, -2.0, 0.25)];
        let colors = [[10, 20, 30]];

        let mut out = Vec::new();
        write_point_cloud_ply(&mut out, &points, &colors).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("element vertex 1\n"));
        assert!(text.trim_end().ends_with("1.500000 -2.000000 0.250000 10 20 30"));
    }
}
