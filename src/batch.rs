// Draw batching - run-length compression of the render object list
//
// Adjacent objects that share a (mesh, material) pair collapse into one
// indirect draw. Only neighbours merge: [A, A, B, A] is three batches.
// Callers that want fewer batches sort the list first.

use ash::vk;

use crate::error::SceneError;
use crate::scene::{MaterialId, MeshId, RenderObject, Scene};

/// Byte stride of one indirect command in the indirect buffer.
pub const INDIRECT_STRIDE: u32 = std::mem::size_of::<vk::DrawIndirectCommand>() as u32;

/// A contiguous run of objects `[first, first + count)` drawn with one
/// `vkCmdDrawIndirect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectBatch {
    pub mesh: MeshId,
    pub material: MaterialId,
    pub first: u32,
    pub count: u32,
}

impl IndirectBatch {
    /// Offset of this batch's first command in the indirect buffer.
    pub fn byte_offset(&self) -> vk::DeviceSize {
        self.first as vk::DeviceSize * INDIRECT_STRIDE as vk::DeviceSize
    }
}

/// Single pass over `objects`, opening a new batch whenever the
/// (mesh, material) pair changes.
pub fn compact(objects: &[RenderObject]) -> Vec<IndirectBatch> {
    let mut batches: Vec<IndirectBatch> = Vec::new();

    for (i, object) in objects.iter().enumerate() {
        match batches.last_mut() {
            Some(batch) if batch.mesh == object.mesh && batch.material == object.material => {
                batch.count += 1;
            }
            _ => batches.push(IndirectBatch {
                mesh: object.mesh,
                material: object.material,
                first: i as u32,
                count: 1,
            }),
        }
    }

    batches
}

/// Write one command per object into `commands`: the object's vertex count,
/// a single instance, and `first_instance` set to the object's index so the
/// vertex shader can find its transform.
pub fn write_indirect_commands(
    scene: &Scene,
    commands: &mut [vk::DrawIndirectCommand],
) -> Result<(), SceneError> {
    if scene.objects.len() > commands.len() {
        return Err(SceneError::TooManyObjects {
            count: scene.objects.len(),
            capacity: commands.len(),
        });
    }

    for (i, (object, command)) in scene.objects.iter().zip(commands.iter_mut()).enumerate() {
        *command = vk::DrawIndirectCommand {
            vertex_count: scene.vertex_count(object),
            instance_count: 1,
            first_vertex: 0,
            first_instance: i as u32,
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{Material, Mesh, Vertex};
    use crate::upload::MappedRegion;
    use ash::vk::Handle;
    use glam::Mat4;

    /// Scene with meshes "a" (3 verts), "b" (6 verts) and materials "m", "n".
    fn scene() -> Scene {
        let mut scene = Scene::default();
        for (name, count, raw) in [("a", 3, 1), ("b", 6, 2)] {
            scene.meshes.insert(
                name,
                Mesh {
                    vertices: vec![Vertex::default(); count],
                    vertex_buffer: vk::Buffer::from_raw(raw),
                },
            );
        }
        for (name, raw) in [("m", 10), ("n", 20)] {
            scene.materials.insert(
                name,
                Material {
                    pipeline: vk::Pipeline::from_raw(raw),
                    layout: vk::PipelineLayout::from_raw(raw),
                    texture_set: None,
                },
            );
        }
        scene
    }

    fn spawn_all(scene: &mut Scene, pairs: &[(&str, &str)]) {
        for (mesh, material) in pairs {
            scene.spawn(mesh, material, Mat4::IDENTITY).unwrap();
        }
    }

    fn assert_partition(batches: &[IndirectBatch], objects: &[RenderObject]) {
        let mut next = 0u32;
        for batch in batches {
            assert_eq!(batch.first, next, "gap or overlap at {}", next);
            assert!(batch.count > 0);
            for object in &objects[batch.first as usize..(batch.first + batch.count) as usize] {
                assert_eq!(object.mesh, batch.mesh);
                assert_eq!(object.material, batch.material);
            }
            next += batch.count;
        }
        assert_eq!(next as usize, objects.len());
    }

    #[test]
    fn separated_pairs_are_not_merged() {
        let mut scene = scene();
        spawn_all(&mut scene, &[("a", "m"), ("a", "m"), ("b", "m"), ("a", "m")]);

        let batches = compact(&scene.objects);

        let ranges: Vec<(u32, u32)> = batches.iter().map(|b| (b.first, b.count)).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 1), (3, 1)]);
        assert_partition(&batches, &scene.objects);
    }

    #[test]
    fn material_change_alone_splits_a_batch() {
        let mut scene = scene();
        spawn_all(&mut scene, &[("a", "m"), ("a", "n"), ("a", "n")]);

        let batches = compact(&scene.objects);

        assert_eq!(batches.len(), 2);
        assert_eq!((batches[1].first, batches[1].count), (1, 2));
    }

    #[test]
    fn batches_partition_a_mixed_list() {
        let mut scene = scene();
        let pattern = [("a", "m"), ("b", "n"), ("b", "n"), ("a", "n"), ("a", "m")];
        for i in 0..40 {
            let (mesh, material) = pattern[(i * 7 / 3) % pattern.len()];
            scene.spawn(mesh, material, Mat4::IDENTITY).unwrap();
        }

        let batches = compact(&scene.objects);
        assert_partition(&batches, &scene.objects);

        scene.sort_for_batching();
        let sorted = compact(&scene.objects);
        assert_partition(&sorted, &scene.objects);
        assert!(sorted.len() <= 4);
    }

    #[test]
    fn empty_list_has_no_batches() {
        assert!(compact(&[]).is_empty());
    }

    #[test]
    fn byte_offset_uses_command_stride() {
        let mut scene = scene();
        spawn_all(&mut scene, &[("a", "m"), ("a", "m"), ("b", "m")]);
        let batches = compact(&scene.objects);
        assert_eq!(INDIRECT_STRIDE, 16);
        assert_eq!(batches[1].byte_offset(), 32);
    }

    #[test]
    fn written_commands_read_back_from_mapped_memory() {
        let mut scene = scene();
        spawn_all(&mut scene, &[("a", "m"), ("b", "m"), ("b", "n"), ("a", "n"), ("a", "m")]);

        let capacity = 8;
        let mut backing = vec![0u64; capacity * 2];
        let mut region = unsafe {
            MappedRegion::new(backing.as_mut_ptr().cast(), backing.len() * 8).unwrap()
        };
        write_indirect_commands(&scene, region.draw_commands_mut()).unwrap();

        let words: &[u32] = bytemuck::cast_slice(&backing);
        for (i, object) in scene.objects.iter().enumerate() {
            let cmd = &words[i * 4..i * 4 + 4];
            assert_eq!(cmd[0], scene.vertex_count(object), "vertex_count of {}", i);
            assert_eq!(cmd[1], 1, "instance_count of {}", i);
            assert_eq!(cmd[2], 0, "first_vertex of {}", i);
            assert_eq!(cmd[3], i as u32, "first_instance of {}", i);
        }
        // Slots past the object list stay untouched.
        assert!(words[scene.objects.len() * 4..].iter().all(|&w| w == 0));
    }

    #[test]
    fn too_many_objects_for_the_buffer() {
        let mut scene = scene();
        spawn_all(&mut scene, &[("a", "m"), ("a", "m"), ("a", "m")]);
        let mut commands = vec![vk::DrawIndirectCommand::default(); 2];

        assert_eq!(
            write_indirect_commands(&scene, &mut commands),
            Err(SceneError::TooManyObjects { count: 3, capacity: 2 })
        );
    }
}
