// Images, depth attachments and sampled textures

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::buffer::{StagingBuffer, UploadContext};
use super::VulkanDevice;
use crate::assets::TextureData;
use crate::ledger::ResourceLedger;

pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Device-local image plus a view covering its single mip level.
#[derive(Debug, Clone, Copy)]
pub struct GpuImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Create a 2D image view. Used for swapchain images as well.
pub fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping::default())
        .subresource_range(subresource_range(aspect));

    unsafe { device.create_image_view(&create_info, None) }.context("Failed to create image view")
}

pub fn create_image(
    device: &VulkanDevice,
    ledger: &mut ResourceLedger,
    name: &str,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    aspect: vk::ImageAspectFlags,
) -> Result<GpuImage> {
    let image_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { device.device.create_image(&image_info, None) }
        .with_context(|| format!("Failed to create image '{}'", name))?;
    let requirements = unsafe { device.device.get_image_memory_requirements(image) };

    let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
        name,
        requirements,
        location: MemoryLocation::GpuOnly,
        linear: false,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(e).with_context(|| format!("Failed to allocate memory for '{}'", name));
        }
    };

    unsafe { device.device.bind_image_memory(image, allocation.memory(), allocation.offset()) }
        .with_context(|| format!("Failed to bind memory for '{}'", name))?;

    let view = create_image_view(&device.device, image, format, aspect)?;

    let d = device.device.clone();
    let allocator = device.allocator();
    ledger.push("image", move || {
        unsafe {
            d.destroy_image_view(view, None);
            d.destroy_image(image, None);
        }
        if let Err(e) = allocator.lock().free(allocation) {
            log::error!("Failed to free image memory: {}", e);
        }
    });

    Ok(GpuImage { image, view })
}

pub fn create_depth_image(device: &VulkanDevice, ledger: &mut ResourceLedger, extent: vk::Extent2D) -> Result<GpuImage> {
    create_image(
        device,
        ledger,
        "depth",
        extent,
        DEPTH_FORMAT,
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        vk::ImageAspectFlags::DEPTH,
    )
}

/// Upload RGBA8 pixels into a new sampled image.
///
/// Copies through a staging buffer and leaves the image in
/// SHADER_READ_ONLY_OPTIMAL.
pub fn upload_texture(
    device: &VulkanDevice,
    ledger: &mut ResourceLedger,
    upload: &UploadContext,
    name: &str,
    texture: &TextureData,
) -> Result<GpuImage> {
    if texture.pixels.len() != texture.byte_size() {
        anyhow::bail!(
            "Texture '{}' has {} bytes, expected {}",
            name,
            texture.pixels.len(),
            texture.byte_size()
        );
    }

    let extent = vk::Extent2D {
        width: texture.width,
        height: texture.height,
    };
    let image = create_image(
        device,
        ledger,
        name,
        extent,
        TEXTURE_FORMAT,
        vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
        vk::ImageAspectFlags::COLOR,
    )?;

    let staging = StagingBuffer::new(device, &format!("{} staging", name), &texture.pixels)?;

    let result = upload.submit(device, |d, cmd| unsafe {
        let to_transfer = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE);
        d.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );

        let region = vk::BufferImageCopy::default()
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width: texture.width,
                height: texture.height,
                depth: 1,
            });
        d.cmd_copy_buffer_to_image(
            cmd,
            staging.buffer,
            image.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );

        let to_shader = vk::ImageMemoryBarrier::default()
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(subresource_range(vk::ImageAspectFlags::COLOR))
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ);
        d.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_shader],
        );
    });
    staging.free(device);
    result?;

    log::info!("Uploaded texture '{}' ({}x{})", name, texture.width, texture.height);
    Ok(image)
}

/// Nearest-filtered, repeating sampler.
pub fn create_sampler(device: &ash::Device, ledger: &mut ResourceLedger) -> Result<vk::Sampler> {
    let create_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::NEAREST)
        .min_filter(vk::Filter::NEAREST)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT);

    let sampler = unsafe { device.create_sampler(&create_info, None) }.context("Failed to create sampler")?;
    let d = device.clone();
    ledger.push("sampler", move || unsafe { d.destroy_sampler(sampler, None) });
    Ok(sampler)
}
