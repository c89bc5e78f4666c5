// Per-frame command and synchronization objects
//
// Each frame slot gets its own command pools, semaphore pair and fence so
// resetting one slot never touches another. Fences start signaled.

use anyhow::{Context, Result};
use ash::vk;

use crate::frame::{FrameSlot, SecondaryRecorder};
use crate::ledger::ResourceLedger;

/// Semaphores and fence for one frame in flight.
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device, ledger: &mut ResourceLedger) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        let mut create_semaphore = || -> Result<vk::Semaphore> {
            let semaphore = unsafe { device.create_semaphore(&semaphore_info, None) }
                .context("Failed to create semaphore")?;
            let d = device.clone();
            ledger.push("semaphore", move || unsafe { d.destroy_semaphore(semaphore, None) });
            Ok(semaphore)
        };
        let image_available = create_semaphore()?;
        let render_finished = create_semaphore()?;

        let in_flight_fence = unsafe { device.create_fence(&fence_info, None) }.context("Failed to create fence")?;
        let d = device.clone();
        ledger.push("fence", move || unsafe { d.destroy_fence(in_flight_fence, None) });

        Ok(Self {
            image_available,
            render_finished,
            in_flight_fence,
        })
    }
}

/// Command pool that allows resetting individual buffers.
pub fn create_command_pool(device: &ash::Device, ledger: &mut ResourceLedger, queue_family: u32) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    let pool = unsafe { device.create_command_pool(&pool_info, None) }.context("Failed to create command pool")?;
    let d = device.clone();
    ledger.push("command pool", move || unsafe { d.destroy_command_pool(pool, None) });
    Ok(pool)
}

pub fn allocate_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
    level: vk::CommandBufferLevel,
) -> Result<vk::CommandBuffer> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(level)
        .command_buffer_count(1);

    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }.context("Failed to allocate command buffer")?;
    buffers
        .into_iter()
        .next()
        .context("Driver returned no command buffer")
}

/// Build one frame slot: primary pool and buffer, `secondary_count`
/// secondary recorders, sync objects, plus the object buffer and set the
/// caller already created.
pub fn create_frame_slot(
    device: &ash::Device,
    ledger: &mut ResourceLedger,
    queue_family: u32,
    secondary_count: usize,
    object_buffer: vk::Buffer,
    object_set: vk::DescriptorSet,
) -> Result<FrameSlot> {
    let command_pool = create_command_pool(device, ledger, queue_family)?;
    let primary = allocate_command_buffer(device, command_pool, vk::CommandBufferLevel::PRIMARY)?;

    let secondaries = (0..secondary_count.max(1))
        .map(|_| {
            let pool = create_command_pool(device, ledger, queue_family)?;
            let buffer = allocate_command_buffer(device, pool, vk::CommandBufferLevel::SECONDARY)?;
            Ok(SecondaryRecorder { pool, buffer })
        })
        .collect::<Result<Vec<_>>>()?;

    let sync = FrameSync::new(device, ledger)?;

    Ok(FrameSlot {
        command_pool,
        primary,
        secondaries,
        image_available: sync.image_available,
        render_finished: sync.render_finished,
        in_flight_fence: sync.in_flight_fence,
        object_buffer,
        object_set,
    })
}
