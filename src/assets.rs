// Asset ingestion: OBJ meshes and RGBA8 textures
//
// Meshes are flattened to unique vertices plus 32-bit indices. Texture
// decoding stays on the CPU; uploading is the renderer's job.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::{offset_of, size_of};
use std::path::Path;

/// Vertex format shared with `shaders/test.vert`
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, position) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(offset_of!(Vertex, color) as u32)
                .build(),
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(2)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(offset_of!(Vertex, tex_coord) as u32)
                .build(),
        ]
    }
}

// Equality and hashing compare raw bits, so a vertex is only merged with an
// exact duplicate (and -0.0 != 0.0, NaN == NaN).
impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        bytemuck::bytes_of(self) == bytemuck::bytes_of(other)
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        bytemuck::bytes_of(self).hash(state);
    }
}

/// Deduplicated triangle mesh
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

fn load_options() -> tobj::LoadOptions {
    tobj::LoadOptions {
        single_index: true,
        triangulate: true,
        ..Default::default()
    }
}

/// Load an OBJ file from disk
pub fn load_mesh(path: &Path) -> Result<Mesh> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open model {}", path.display()))?;
    let mesh = load_mesh_from_reader(&mut BufReader::new(file))
        .with_context(|| format!("Failed to load model {}", path.display()))?;

    log::info!(
        "Loaded {}: {} unique vertices, {} indices",
        path.display(),
        mesh.vertices.len(),
        mesh.indices.len()
    );
    Ok(mesh)
}

/// Parse OBJ text from any reader. Material libraries are ignored.
pub fn load_mesh_from_reader<R: BufRead>(reader: &mut R) -> Result<Mesh> {
    let (models, _materials) = tobj::load_obj_buf(reader, &load_options(), |_| {
        Err(tobj::LoadError::OpenFileFailed)
    })
    .context("Failed to parse OBJ data")?;

    Ok(build_mesh(&models))
}

fn build_mesh(models: &[tobj::Model]) -> Mesh {
    let mut mesh = Mesh::default();
    let mut unique: HashMap<Vertex, u32> = HashMap::new();

    for model in models {
        let m = &model.mesh;
        for &index in &m.indices {
            let i = index as usize;
            let position = [m.positions[3 * i], m.positions[3 * i + 1], m.positions[3 * i + 2]];
            // OBJ puts v=0 at the bottom of the image, Vulkan samples top-down
            let tex_coord = if m.texcoords.len() >= 2 * i + 2 {
                [m.texcoords[2 * i], 1.0 - m.texcoords[2 * i + 1]]
            } else {
                [0.0, 0.0]
            };

            let vertex = Vertex {
                position,
                color: [1.0, 1.0, 1.0],
                tex_coord,
            };

            let next = mesh.vertices.len() as u32;
            let slot = *unique.entry(vertex).or_insert_with(|| {
                mesh.vertices.push(vertex);
                next
            });
            mesh.indices.push(slot);
        }
    }

    mesh
}

/// Decoded texture, tightly packed RGBA8
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    /// Number of levels in a full mip chain for this image
    pub fn mip_levels(&self) -> u32 {
        crate::backend::image::mip_level_count(self.width, self.height)
    }
}

/// Decode any supported image file into RGBA8
pub fn load_texture(path: &Path) -> Result<TextureData> {
    let image = image::open(path)
        .with_context(|| format!("Failed to load texture {}", path.display()))?
        .into_rgba8();

    let (width, height) = image.dimensions();
    log::info!("Loaded {}: {}x{}", path.display(), width, height);

    Ok(TextureData {
        width,
        height,
        pixels: image.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    // Unit quad as two triangles sharing an edge
    const QUAD: &str = "\
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 1.0 1.0 0.0
v 0.0 1.0 0.0
vt 0.0 0.0
vt 1.0 0.0
vt 1.0 1.0
vt 0.0 1.0
f 1/1 2/2 3/3
f 1/1 3/3 4/4
";

    fn quad() -> Mesh {
        load_mesh_from_reader(&mut Cursor::new(QUAD)).unwrap()
    }

    #[test]
    fn shared_corners_are_deduplicated() {
        let mesh = quad();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 0, 2, 3]);
    }

    #[test]
    fn v_coordinate_is_flipped() {
        let mesh = quad();
        assert_eq!(mesh.vertices[0].tex_coord, [0.0, 1.0]);
        assert_eq!(mesh.vertices[2].tex_coord, [1.0, 0.0]);
        assert!(mesh.vertices.iter().all(|v| v.color == [1.0, 1.0, 1.0]));
    }

    #[test]
    fn same_position_with_different_uv_stays_distinct() {
        let obj = "\
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 0.0 1.0 0.0
vt 0.0 0.0
vt 0.5 0.5
f 1/1 2/1 3/1
f 1/2 2/1 3/1
";
        let mesh = load_mesh_from_reader(&mut Cursor::new(obj)).unwrap();
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices, vec![0, 1, 2, 3, 1, 2]);
    }

    #[test]
    fn loading_twice_is_identical() {
        assert_eq!(quad(), quad());
    }

    #[test]
    fn indices_stay_in_bounds() {
        let mesh = quad();
        assert!(mesh.indices.iter().all(|&i| (i as usize) < mesh.vertices.len()));
    }

    #[test]
    fn equality_is_bitwise() {
        let a = Vertex { position: [0.0, 0.0, 0.0], color: [1.0; 3], tex_coord: [0.0; 2] };
        let b = Vertex { position: [-0.0, 0.0, 0.0], ..a };
        assert_ne!(a, b);

        let nan = Vertex { position: [f32::NAN, 0.0, 0.0], ..a };
        assert_eq!(nan, nan);
    }

    #[test]
    fn vertex_layout_matches_shader_inputs() {
        assert_eq!(size_of::<Vertex>(), 32);
        let attrs = Vertex::attribute_descriptions();
        assert_eq!(attrs.map(|a| a.offset), [0, 12, 24]);
        assert_eq!(Vertex::binding_description().stride, 32);
    }

    #[test]
    fn missing_texture_is_an_error() {
        assert!(load_texture(Path::new("textures/missing.png")).is_err());
    }
}
