// Asset sources
//
// The renderer asks an AssetSource for vertex lists and RGBA8 pixel data by
// name. The built-in source generates everything procedurally.

use anyhow::Result;
use glam::{Vec2, Vec3};

use crate::scene::Vertex;

/// Decoded RGBA8 texture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    /// Size the pixel buffer must have for the declared dimensions.
    pub fn byte_size(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

pub trait AssetSource {
    fn load_mesh(&self, name: &str) -> Result<Vec<Vertex>>;
    fn load_texture(&self, name: &str) -> Result<TextureData>;
}

/// Procedural meshes (`cube`, `plane`) and textures (`checkerboard`).
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinAssets;

impl AssetSource for BuiltinAssets {
    fn load_mesh(&self, name: &str) -> Result<Vec<Vertex>> {
        match name {
            "cube" => Ok(cube()),
            "plane" => Ok(plane(20.0)),
            _ => anyhow::bail!("Unknown built-in mesh '{}'", name),
        }
    }

    fn load_texture(&self, name: &str) -> Result<TextureData> {
        match name {
            "checkerboard" => Ok(checkerboard(64, 8)),
            _ => anyhow::bail!("Unknown built-in texture '{}'", name),
        }
    }
}

// Face normal, then the two in-plane axes spanning it.
const CUBE_FACES: [(Vec3, Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Z, Vec3::Y),
    (Vec3::NEG_X, Vec3::Z, Vec3::Y),
    (Vec3::Y, Vec3::X, Vec3::NEG_Z),
    (Vec3::NEG_Y, Vec3::X, Vec3::Z),
    (Vec3::Z, Vec3::X, Vec3::Y),
    (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y),
];

fn quad(center: Vec3, normal: Vec3, u: Vec3, v: Vec3, half: f32, uv_scale: f32, color: Vec3) -> [Vertex; 6] {
    let corner = |su: f32, sv: f32| Vertex {
        position: center + (u * su + v * sv) * half,
        normal,
        color,
        uv: Vec2::new((su + 1.0) * 0.5, (1.0 - sv) * 0.5) * uv_scale,
    };
    let (a, b, c, d) = (corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0));
    [a, b, c, a, c, d]
}

/// Unit cube centred on the origin, 36 vertices, colored by face normal.
fn cube() -> Vec<Vertex> {
    CUBE_FACES
        .iter()
        .flat_map(|&(normal, u, v)| {
            let color = normal.abs() * 0.7 + Vec3::splat(0.3);
            quad(normal * 0.5, normal, u, v, 0.5, 1.0, color)
        })
        .collect()
}

/// Ground plane in XZ facing +Y, UVs repeating once per unit.
fn plane(size: f32) -> Vec<Vertex> {
    quad(Vec3::ZERO, Vec3::Y, Vec3::X, Vec3::NEG_Z, size * 0.5, size, Vec3::splat(0.6)).to_vec()
}

fn checkerboard(size: u32, tile: u32) -> TextureData {
    let mut pixels = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / tile) + (y / tile)) % 2 == 0;
            let v = if light { 230 } else { 40 };
            pixels.extend_from_slice(&[v, v, v, 255]);
        }
    }
    TextureData {
        width: size,
        height: size,
        pixels,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_has_36_unit_normal_vertices_inside_bounds() {
        let cube = BuiltinAssets.load_mesh("cube").unwrap();
        assert_eq!(cube.len(), 36);
        for v in &cube {
            assert!((v.normal.length() - 1.0).abs() < 1e-6);
            assert!(v.position.abs().max_element() <= 0.5 + 1e-6);
            // Every vertex sits on the face its normal points out of.
            assert!((v.position.dot(v.normal) - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn cube_triangles_wind_counter_clockwise_seen_from_outside() {
        let cube = BuiltinAssets.load_mesh("cube").unwrap();
        for tri in cube.chunks(3) {
            let n = (tri[1].position - tri[0].position).cross(tri[2].position - tri[0].position);
            assert!(n.dot(tri[0].normal) > 0.0);
        }
    }

    #[test]
    fn plane_is_flat_and_faces_up() {
        let plane = BuiltinAssets.load_mesh("plane").unwrap();
        assert_eq!(plane.len(), 6);
        assert!(plane.iter().all(|v| v.position.y == 0.0 && v.normal == Vec3::Y));
    }

    #[test]
    fn checkerboard_alternates_tiles() {
        let tex = BuiltinAssets.load_texture("checkerboard").unwrap();
        assert_eq!(tex.pixels.len(), tex.byte_size());

        let texel = |x: u32, y: u32| tex.pixels[((y * tex.width + x) * 4) as usize];
        assert_ne!(texel(0, 0), texel(8, 0));
        assert_eq!(texel(0, 0), texel(8, 8));
        assert_eq!(texel(0, 0), texel(7, 7));
    }

    #[test]
    fn unknown_names_are_errors() {
        assert!(BuiltinAssets.load_mesh("teapot").is_err());
        assert!(BuiltinAssets.load_texture("lost_empire").is_err());
    }
}
