// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// the depth attachment sized to match. Everything created here goes into a
// swapchain-scoped ledger so recreation can drop the lot at once.

use anyhow::{Context, Result};
use ash::vk;

use super::device::QueueFamilies;
use super::texture::{self, GpuImage};
use super::VulkanDevice;
use crate::ledger::ResourceLedger;

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub depth: GpuImage,
}

impl Swapchain {
    /// Create a swapchain for the device's surface.
    ///
    /// Pass the previous handle as `old` when recreating; it stays alive
    /// until its own ledger is flushed.
    pub fn new(
        device: &VulkanDevice,
        ledger: &mut ResourceLedger,
        width: u32,
        height: u32,
        preferred_present_mode: Option<vk::PresentModeKHR>,
        old: Option<vk::SwapchainKHR>,
    ) -> Result<Self> {
        log::info!("Creating swapchain: {}x{}", width, height);

        let surface_loader = &device.surface_loader;
        let surface_caps = unsafe {
            surface_loader.get_physical_device_surface_capabilities(device.physical_device, device.surface)
        }?;
        let formats = unsafe {
            surface_loader.get_physical_device_surface_formats(device.physical_device, device.surface)
        }?;
        let present_modes = unsafe {
            surface_loader.get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }?;

        let surface_format = choose_surface_format(&formats).context("Surface reports no formats")?;
        let present_mode =
            choose_present_mode(&present_modes, preferred_present_mode).context("Surface reports no present modes")?;
        let extent = choose_extent(&surface_caps, width, height);
        let image_count = choose_image_count(&surface_caps);
        let (sharing_mode, family_indices) = choose_sharing(device.queue_families);

        log::info!(
            "Swapchain: {:?} {:?}, {:?}, {} images",
            surface_format.format,
            surface_format.color_space,
            present_mode,
            image_count
        );

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old.unwrap_or_default());

        let loader = device.swapchain_loader.clone();
        let swapchain =
            unsafe { loader.create_swapchain(&create_info, None) }.context("Failed to create swapchain")?;
        ledger.push("swapchain", move || unsafe { loader.destroy_swapchain(swapchain, None) });

        let images = unsafe { device.swapchain_loader.get_swapchain_images(swapchain) }?;

        let image_views = images
            .iter()
            .map(|&image| {
                let view =
                    texture::create_image_view(&device.device, image, surface_format.format, vk::ImageAspectFlags::COLOR)?;
                let d = device.device.clone();
                ledger.push("swapchain image view", move || unsafe { d.destroy_image_view(view, None) });
                Ok(view)
            })
            .collect::<Result<Vec<_>>>()?;

        let depth = texture::create_depth_image(device, ledger, extent)?;

        log::info!("Created swapchain with {} images", images.len());

        Ok(Self {
            swapchain,
            images,
            image_views,
            format: surface_format.format,
            extent,
            present_mode,
            depth,
        })
    }
}

// =============================================================================
// SELECTION POLICY
// =============================================================================

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = [vk::Format::B8G8R8A8_SRGB, vk::Format::B8G8R8A8_UNORM];
    preferred
        .iter()
        .find_map(|&wanted| {
            formats
                .iter()
                .find(|f| f.format == wanted && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        })
        .or_else(|| formats.first())
        .copied()
}

/// IMMEDIATE: No vsync, lowest latency, may tear
/// MAILBOX: No vsync, no tearing
/// FIFO: Vsync, always supported
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> Option<vk::PresentModeKHR> {
    if available.is_empty() {
        return None;
    }

    let fallbacks = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX];
    let mode = preferred
        .into_iter()
        .chain(fallbacks)
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO);

    if let Some(wanted) = preferred {
        if wanted != mode {
            log::warn!("Present mode {:?} not supported, using {:?}", wanted, mode);
        }
    }
    Some(mode)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped at the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let wanted = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        wanted.min(caps.max_image_count)
    } else {
        wanted
    }
}

pub fn choose_sharing(families: QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.graphics == families.present {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, vec![families.graphics, families.present])
    }
}
