// Descriptor pool, set layouts and set allocation
//
// Set 0 (global): camera and scene uniforms, both dynamic so every frame slot
// selects its region of one shared buffer by offset.
// Set 1 (object): per-slot storage buffer of model matrices.
// Set 2 (texture): one combined image sampler per textured material.

use anyhow::{Context, Result};
use ash::vk;

use crate::ledger::ResourceLedger;

const MAX_SETS: u32 = 10;
const DESCRIPTORS_PER_TYPE: u32 = 4;

/// Round `size` up to a multiple of `alignment`. Zero alignment means none.
pub fn pad_uniform_size(alignment: vk::DeviceSize, size: vk::DeviceSize) -> vk::DeviceSize {
    if alignment == 0 {
        return size;
    }
    size.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorLayouts {
    pub global: vk::DescriptorSetLayout,
    pub object: vk::DescriptorSetLayout,
    pub texture: vk::DescriptorSetLayout,
}

impl DescriptorLayouts {
    /// Layout list for pipelines, in set index order.
    pub fn all(&self) -> [vk::DescriptorSetLayout; 3] {
        [self.global, self.object, self.texture]
    }
}

pub struct DescriptorAllocator {
    device: ash::Device,
    pool: vk::DescriptorPool,
    layouts: DescriptorLayouts,
}

impl DescriptorAllocator {
    pub fn new(device: &ash::Device, ledger: &mut ResourceLedger) -> Result<Self> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                descriptor_count: DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: DESCRIPTORS_PER_TYPE,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: DESCRIPTORS_PER_TYPE,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(MAX_SETS)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;
        let d = device.clone();
        ledger.push("descriptor pool", move || unsafe { d.destroy_descriptor_pool(pool, None) });

        let global = create_layout(
            device,
            ledger,
            &[
                binding(0, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, vk::ShaderStageFlags::VERTEX),
                binding(1, vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, vk::ShaderStageFlags::FRAGMENT),
            ],
        )?;
        let object = create_layout(
            device,
            ledger,
            &[binding(0, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::VERTEX)],
        )?;
        let texture = create_layout(
            device,
            ledger,
            &[binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT)],
        )?;

        Ok(Self {
            device: device.clone(),
            pool,
            layouts: DescriptorLayouts { global, object, texture },
        })
    }

    pub fn layouts(&self) -> DescriptorLayouts {
        self.layouts
    }

    fn allocate(&self, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }
            .context("Descriptor pool exhausted")?;
        sets.into_iter().next().context("Driver returned no descriptor set")
    }

    /// Global set pointing at one struct-sized range of each uniform buffer.
    pub fn allocate_global_set(
        &self,
        camera: vk::Buffer,
        camera_size: vk::DeviceSize,
        scene: vk::Buffer,
        scene_size: vk::DeviceSize,
    ) -> Result<vk::DescriptorSet> {
        let set = self.allocate(self.layouts.global)?;

        let camera_info = [vk::DescriptorBufferInfo::default().buffer(camera).range(camera_size)];
        let scene_info = [vk::DescriptorBufferInfo::default().buffer(scene).range(scene_size)];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&camera_info),
            vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(&scene_info),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        Ok(set)
    }

    pub fn allocate_object_set(&self, objects: vk::Buffer, size: vk::DeviceSize) -> Result<vk::DescriptorSet> {
        let set = self.allocate(self.layouts.object)?;

        let info = [vk::DescriptorBufferInfo::default().buffer(objects).range(size)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };

        Ok(set)
    }

    pub fn allocate_texture_set(&self, view: vk::ImageView, sampler: vk::Sampler) -> Result<vk::DescriptorSet> {
        let set = self.allocate(self.layouts.texture)?;

        let info = [vk::DescriptorImageInfo::default()
            .sampler(sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };

        Ok(set)
    }
}

fn binding(index: u32, ty: vk::DescriptorType, stages: vk::ShaderStageFlags) -> vk::DescriptorSetLayoutBinding<'static> {
    vk::DescriptorSetLayoutBinding::default()
        .binding(index)
        .descriptor_type(ty)
        .descriptor_count(1)
        .stage_flags(stages)
}

fn create_layout(
    device: &ash::Device,
    ledger: &mut ResourceLedger,
    bindings: &[vk::DescriptorSetLayoutBinding],
) -> Result<vk::DescriptorSetLayout> {
    let info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
    let layout = unsafe { device.create_descriptor_set_layout(&info, None) }
        .context("Failed to create descriptor set layout")?;
    let d = device.clone();
    ledger.push("descriptor set layout", move || unsafe { d.destroy_descriptor_set_layout(layout, None) });
    Ok(layout)
}
