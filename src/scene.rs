// Scene data - meshes, materials, render objects and the GPU-side structs
//
// Meshes and materials live in name-keyed catalogues. Render objects refer
// to them through typed handles, so batching compares handles instead of
// pointers and nothing is copied into the object itself.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::SceneError;

// =============================================================================
// GPU DATA
// =============================================================================

/// Interleaved vertex as laid out in the vertex buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub color: Vec3,
    pub uv: Vec2,
}

/// Camera block, set 0 binding 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct GpuCameraData {
    pub view: Mat4,
    pub projection: Mat4,
    pub viewproj: Mat4,
}

/// Scene block, set 0 binding 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuSceneData {
    pub fog_color: Vec4,          // w is the exponent
    pub fog_distances: Vec4,      // x min, y max
    pub ambient_color: Vec4,
    pub sunlight_direction: Vec4, // w is sun power
    pub sunlight_color: Vec4,
}

impl Default for GpuSceneData {
    fn default() -> Self {
        Self {
            fog_color: Vec4::ZERO,
            fog_distances: Vec4::new(10.0, 200.0, 0.0, 0.0),
            ambient_color: Vec4::new(0.1, 0.1, 0.1, 1.0),
            sunlight_direction: Vec4::new(-0.3, -1.0, -0.2, 1.0),
            sunlight_color: Vec4::ONE,
        }
    }
}

impl GpuSceneData {
    /// Slow ambient color cycle driven by the frame counter.
    pub fn animate(&mut self, frame_number: u64) {
        let framed = frame_number as f32 / 120.0;
        self.ambient_color = Vec4::new(framed.sin() * 0.5 + 0.5, 0.0, framed.cos() * 0.5 + 0.5, 1.0);
    }
}

/// One entry of the per-frame object storage buffer, indexed by instance.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct GpuObjectData {
    pub model: Mat4,
}

// =============================================================================
// HANDLES AND CATALOGUES
// =============================================================================

/// Typed index into a [`Catalogue`].
pub struct Handle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    fn new(index: usize) -> Self {
        Self {
            index: index as u32,
            _marker: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.index)
    }
}

/// Name-keyed store. Entries are registered once and never removed while
/// the renderer runs, so handles stay valid.
pub struct Catalogue<T> {
    items: Vec<T>,
    by_name: HashMap<String, Handle<T>>,
}

impl<T> Default for Catalogue<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T> Catalogue<T> {
    /// Register `item` under `name`. Re-registering a name replaces the entry
    /// in place and keeps its handle.
    pub fn insert(&mut self, name: impl Into<String>, item: T) -> Handle<T> {
        let name = name.into();
        if let Some(&handle) = self.by_name.get(&name) {
            self.items[handle.index()] = item;
            return handle;
        }
        let handle = Handle::new(self.items.len());
        self.items.push(item);
        self.by_name.insert(name, handle);
        handle
    }

    pub fn handle(&self, name: &str) -> Option<Handle<T>> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        self.items.get(handle.index())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

// =============================================================================
// MESHES, MATERIALS, OBJECTS
// =============================================================================

/// Mesh uploaded once at load time; immutable until teardown.
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub vertex_buffer: vk::Buffer,
}

impl Mesh {
    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }
}

/// Pipeline pair plus the optional texture set bound at set 2.
#[derive(Debug, Clone, Copy)]
pub struct Material {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub texture_set: Option<vk::DescriptorSet>,
}

pub type MeshId = Handle<Mesh>;
pub type MaterialId = Handle<Material>;

#[derive(Debug, Clone, Copy)]
pub struct RenderObject {
    pub mesh: MeshId,
    pub material: MaterialId,
    pub transform: Mat4,
}

/// Everything the frame loop reads: catalogues plus the ordered object list.
///
/// Only mutated while the render loop is not iterating.
#[derive(Default)]
pub struct Scene {
    pub meshes: Catalogue<Mesh>,
    pub materials: Catalogue<Material>,
    pub objects: Vec<RenderObject>,
}

impl Scene {
    /// Append an object built from registered mesh and material names.
    pub fn spawn(&mut self, mesh: &str, material: &str, transform: Mat4) -> Result<usize, SceneError> {
        let mesh = self
            .meshes
            .handle(mesh)
            .ok_or_else(|| SceneError::MeshNotFound(mesh.to_string()))?;
        let material = self
            .materials
            .handle(material)
            .ok_or_else(|| SceneError::MaterialNotFound(material.to_string()))?;

        self.objects.push(RenderObject {
            mesh,
            material,
            transform,
        });
        Ok(self.objects.len() - 1)
    }

    /// Order objects so equal (material, mesh) pairs are adjacent. Batching
    /// only merges neighbours, so call this before building batches when
    /// maximal merging is wanted. The sort is stable.
    pub fn sort_for_batching(&mut self) {
        self.objects.sort_by_key(|o| (o.material, o.mesh));
    }

    pub fn transforms(&self) -> Vec<Mat4> {
        self.objects.iter().map(|o| o.transform).collect()
    }

    pub fn vertex_count(&self, object: &RenderObject) -> u32 {
        self.meshes.get(object.mesh).map_or(0, Mesh::vertex_count)
    }
}
