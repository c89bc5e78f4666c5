// Buffer utilities for vertex, uniform, storage and indirect buffers
//
// Memory comes from gpu-allocator. Every long-lived buffer registers its
// destroy-and-free closure in the ledger it was created with. Staging
// buffers are released as soon as their copy has finished.

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::time::Duration;

use super::frame_device::nanos;
use super::VulkanDevice;
use crate::error::{FrameError, WaitStage};
use crate::ledger::ResourceLedger;
use crate::upload::MappedRegion;

/// A buffer whose allocation is owned by a ledger entry.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    /// Present for host-visible buffers.
    pub mapped: Option<MappedRegion>,
}

impl GpuBuffer {
    pub fn mapped(&mut self) -> Result<&mut MappedRegion> {
        self.mapped.as_mut().context("Buffer is not host visible")
    }
}

fn allocate_buffer(
    device: &VulkanDevice,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<(vk::Buffer, Allocation)> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .with_context(|| format!("Failed to create buffer '{}'", name))?;
    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    let allocation = device
        .allocator()
        .lock()
        .allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .with_context(|| format!("Failed to allocate memory for '{}'", name));

    let allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    unsafe { device.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        .with_context(|| format!("Failed to bind memory for '{}'", name))?;

    Ok((buffer, allocation))
}

fn free_buffer(device: &VulkanDevice, buffer: vk::Buffer, allocation: Allocation) {
    unsafe { device.device.destroy_buffer(buffer, None) };
    if let Err(e) = device.allocator().lock().free(allocation) {
        log::error!("Failed to free buffer memory: {}", e);
    }
}

/// Create a buffer and register its teardown.
pub fn create_buffer(
    device: &VulkanDevice,
    ledger: &mut ResourceLedger,
    name: &str,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
) -> Result<GpuBuffer> {
    let (buffer, allocation) = allocate_buffer(device, name, size, usage, location)?;

    let mapped = allocation
        .mapped_ptr()
        .and_then(|ptr| unsafe { MappedRegion::new(ptr.as_ptr().cast(), size as usize) });

    let d = device.device.clone();
    let allocator = device.allocator();
    let label = name.to_string();
    ledger.push("buffer", move || {
        unsafe { d.destroy_buffer(buffer, None) };
        if let Err(e) = allocator.lock().free(allocation) {
            log::error!("Failed to free memory of '{}': {}", label, e);
        }
    });

    log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);

    Ok(GpuBuffer { buffer, mapped })
}

/// Device-local buffer filled through a staging copy.
pub fn create_device_local_buffer<T: Pod>(
    device: &VulkanDevice,
    ledger: &mut ResourceLedger,
    upload: &UploadContext,
    name: &str,
    usage: vk::BufferUsageFlags,
    data: &[T],
) -> Result<GpuBuffer> {
    let size = std::mem::size_of_val(data) as vk::DeviceSize;

    let target = create_buffer(
        device,
        ledger,
        name,
        size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        MemoryLocation::GpuOnly,
    )?;

    let staging = StagingBuffer::new(device, &format!("{} staging", name), bytemuck::cast_slice(data))?;
    let result = upload.submit(device, |d, cmd| unsafe {
        let region = vk::BufferCopy::default().size(size);
        d.cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]);
    });
    staging.free(device);
    result?;

    Ok(target)
}

/// Short-lived transfer source, freed right after use.
pub struct StagingBuffer {
    pub buffer: vk::Buffer,
    allocation: Allocation,
}

impl StagingBuffer {
    pub fn new(device: &VulkanDevice, name: &str, bytes: &[u8]) -> Result<Self> {
        let (buffer, mut allocation) = allocate_buffer(
            device,
            name,
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        match allocation.mapped_slice_mut() {
            Some(slice) => slice[..bytes.len()].copy_from_slice(bytes),
            None => {
                free_buffer(device, buffer, allocation);
                anyhow::bail!("Staging buffer '{}' is not host visible", name);
            }
        }

        Ok(Self { buffer, allocation })
    }

    pub fn free(self, device: &VulkanDevice) {
        free_buffer(device, self.buffer, self.allocation);
    }
}

// =============================================================================
// IMMEDIATE SUBMIT
// =============================================================================

/// Dedicated pool, buffer and fence for one-off transfer work at load time.
pub struct UploadContext {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
    timeout: Duration,
}

impl UploadContext {
    pub fn new(device: &VulkanDevice, ledger: &mut ResourceLedger, timeout: Duration) -> Result<Self> {
        let pool = super::sync::create_command_pool(&device.device, ledger, device.queue_families.graphics)?;
        let cmd = super::sync::allocate_command_buffer(&device.device, pool, vk::CommandBufferLevel::PRIMARY)?;

        let fence = unsafe { device.device.create_fence(&vk::FenceCreateInfo::default(), None) }
            .context("Failed to create upload fence")?;
        let d = device.device.clone();
        ledger.push("upload fence", move || unsafe { d.destroy_fence(fence, None) });

        Ok(Self {
            pool,
            cmd,
            fence,
            timeout,
        })
    }

    /// Record with `record`, submit on the graphics queue and wait for it.
    pub fn submit<F>(&self, device: &VulkanDevice, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let d = &device.device;
        let begin_info = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            d.begin_command_buffer(self.cmd, &begin_info)?;
            record(d, self.cmd);
            d.end_command_buffer(self.cmd)?;

            let command_buffers = [self.cmd];
            let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
            d.queue_submit(device.graphics_queue, &[submit_info], self.fence)
                .context("Failed to submit upload commands")?;

            let waited = d.wait_for_fences(&[self.fence], true, nanos(self.timeout));
            settle_upload(waited, || d.device_wait_idle())?;
            d.reset_fences(&[self.fence])?;
            d.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        }

        Ok(())
    }
}

/// Turn the upload fence wait into a result. After a failed wait the copy
/// may still be executing, so the device is drained before returning and
/// callers can free their staging sources.
fn settle_upload<I>(waited: ash::prelude::VkResult<()>, wait_idle: I) -> Result<()>
where
    I: FnOnce() -> ash::prelude::VkResult<()>,
{
    let Err(result) = waited else {
        return Ok(());
    };
    if let Err(e) = wait_idle() {
        log::error!("Device wait idle after failed upload: {}", e);
    }
    Err(FrameError::from_wait(result, WaitStage::ImmediateSubmit).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn timed_out_upload_drains_device_before_returning() {
        let idled = Cell::new(false);
        let err = settle_upload(Err(vk::Result::TIMEOUT), || {
            idled.set(true);
            Ok(())
        })
        .unwrap_err();

        assert!(idled.get());
        assert!(matches!(
            err.downcast_ref::<FrameError>(),
            Some(FrameError::Timeout {
                stage: WaitStage::ImmediateSubmit
            })
        ));
    }

    #[test]
    fn failed_idle_keeps_the_wait_error() {
        let err = settle_upload(Err(vk::Result::ERROR_DEVICE_LOST), || Err(vk::Result::ERROR_DEVICE_LOST)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FrameError>(),
            Some(FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST))
        ));
    }

    #[test]
    fn finished_upload_skips_idle() {
        let idled = Cell::new(false);
        settle_upload(Ok(()), || {
            idled.set(true);
            Ok(())
        })
        .unwrap();
        assert!(!idled.get());
    }
}
