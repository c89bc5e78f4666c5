// Background upload of per-frame uniform and storage data
//
// The render loop releases a slot to the worker right after that slot's
// fence has signaled. The worker then writes camera, scene and object data
// into the slot's region of the mapped buffers and reports completion. The
// render loop waits for that completion before it submits the slot.
//
// Handoff protocol:
//   main:   wait fence -> release(slot) -> ... record ... -> wait_complete -> submit
//   worker: acquire() -> write slot -> complete()

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::Pod;
use glam::Mat4;
use parking_lot::{Condvar, Mutex};
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::camera::Camera;
use crate::error::{FrameError, FrameResult, WaitStage};
use crate::scene::{GpuObjectData, GpuSceneData};

// =============================================================================
// MAPPED MEMORY
// =============================================================================

/// Host-visible memory mapped for the lifetime of its allocation.
///
/// The region does not own the memory. Whoever frees the allocation must
/// make sure no region outlives it.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The pointer targets persistently mapped device memory, not thread-local data.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the region is used, and nothing else may write the range concurrently.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Option<Self> {
        NonNull::new(ptr).map(|ptr| Self { ptr, len })
    }

    /// Copy `data` to `offset`. Anything past the end of the region is
    /// dropped and logged.
    pub fn write_slice<T: Pod>(&mut self, offset: usize, data: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let available = self.len.saturating_sub(offset);
        let count = bytes.len().min(available);
        if count < bytes.len() {
            log::error!(
                "Mapped write of {} bytes at {} overflows region of {} bytes",
                bytes.len(),
                offset,
                self.len
            );
        }
        if count == 0 {
            return;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), count);
        }
    }

    pub fn write<T: Pod>(&mut self, offset: usize, value: &T) {
        self.write_slice(offset, std::slice::from_ref(value));
    }

    /// View the region as an array of indirect draw commands.
    pub fn draw_commands_mut(&mut self) -> &mut [vk::DrawIndirectCommand] {
        let align = std::mem::align_of::<vk::DrawIndirectCommand>();
        if self.ptr.as_ptr() as usize % align != 0 {
            log::error!("Indirect buffer mapping is not {}-byte aligned", align);
            return &mut [];
        }
        let count = self.len / std::mem::size_of::<vk::DrawIndirectCommand>();
        // DrawIndirectCommand is four u32s, so any bit pattern is valid.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast(), count) }
    }
}

// =============================================================================
// HANDOFF
// =============================================================================

/// One unit of work for the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadJob {
    pub slot: usize,
    pub ticket: u64,
}

#[derive(Debug, Default)]
struct HandoffState {
    pending: Option<UploadJob>,
    issued: u64,
    completed: u64,
    closed: bool,
}

/// Binary semaphore between the render loop and the upload worker, carrying
/// the slot index. A release that arrives while another is still pending
/// replaces its slot instead of queueing a second job.
#[derive(Debug, Default)]
pub struct UploadHandoff {
    state: Mutex<HandoffState>,
    work: Condvar,
    done: Condvar,
}

impl UploadHandoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `slot` to the worker. Returns the ticket to wait on.
    pub fn release(&self, slot: usize) -> u64 {
        let mut state = self.state.lock();
        let ticket = match state.pending {
            Some(job) => job.ticket,
            None => {
                state.issued += 1;
                state.issued
            }
        };
        state.pending = Some(UploadJob { slot, ticket });
        self.work.notify_one();
        ticket
    }

    /// Block until a slot is released. `None` once the handoff is closed.
    pub fn acquire(&self) -> Option<UploadJob> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(job) = state.pending.take() {
                return Some(job);
            }
            self.work.wait(&mut state);
        }
    }

    pub fn complete(&self, job: UploadJob) {
        let mut state = self.state.lock();
        state.completed = state.completed.max(job.ticket);
        self.done.notify_all();
    }

    /// Wait until the upload for `ticket` has finished.
    pub fn wait_complete(&self, ticket: u64, timeout: Duration) -> FrameResult<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.completed >= ticket {
                return Ok(());
            }
            if state.closed {
                return Err(FrameError::UploadWorkerGone);
            }
            if self.done.wait_until(&mut state, deadline).timed_out() && state.completed < ticket {
                return Err(FrameError::Timeout {
                    stage: WaitStage::UploadComplete,
                });
            }
        }
    }

    /// Tickets handed out so far.
    #[cfg(test)]
    pub fn issued(&self) -> u64 {
        self.state.lock().issued
    }

    /// Wake the worker and make every further acquire return `None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.work.notify_all();
        self.done.notify_all();
    }
}

// =============================================================================
// SOURCE AND TARGETS
// =============================================================================

/// What the worker reads each time it is woken.
pub struct UploadSource {
    pub camera: Mutex<Camera>,
    pub scene: Mutex<GpuSceneData>,
    /// Swapped wholesale on scene load.
    pub transforms: Mutex<Arc<[Mat4]>>,
    pub extent: Mutex<vk::Extent2D>,
}

impl UploadSource {
    pub fn new(camera: Camera, extent: vk::Extent2D) -> Self {
        Self {
            camera: Mutex::new(camera),
            scene: Mutex::new(GpuSceneData::default()),
            transforms: Mutex::new(Arc::from(Vec::new())),
            extent: Mutex::new(extent),
        }
    }

    pub fn set_transforms(&self, transforms: Vec<Mat4>) {
        *self.transforms.lock() = Arc::from(transforms);
    }
}

/// Mapped destinations. Camera and scene share one buffer each, sliced per
/// slot by a padded stride; objects get one buffer per slot.
pub struct UploadTargets {
    pub camera: MappedRegion,
    pub camera_stride: usize,
    pub scene: MappedRegion,
    pub scene_stride: usize,
    pub objects: Vec<MappedRegion>,
}

impl UploadTargets {
    fn write_slot(&mut self, slot: usize, source: &UploadSource) {
        let extent = *source.extent.lock();
        let camera = source.camera.lock().gpu_data(extent.width, extent.height);
        let scene = *source.scene.lock();
        let transforms = source.transforms.lock().clone();

        self.camera.write(slot * self.camera_stride, &camera);
        self.scene.write(slot * self.scene_stride, &scene);

        let Some(objects) = self.objects.get_mut(slot) else {
            log::error!("Upload for unknown frame slot {}", slot);
            return;
        };
        let data: Vec<GpuObjectData> = transforms.iter().map(|&model| GpuObjectData { model }).collect();
        objects.write_slice(0, &data);
    }
}

// =============================================================================
// WORKER
// =============================================================================

pub struct UploadWorker {
    handoff: Arc<UploadHandoff>,
    handle: Option<JoinHandle<()>>,
}

impl UploadWorker {
    pub fn spawn(handoff: Arc<UploadHandoff>, source: Arc<UploadSource>, mut targets: UploadTargets) -> Result<Self> {
        let worker_handoff = handoff.clone();
        let handle = std::thread::Builder::new()
            .name("upload-worker".into())
            .spawn(move || {
                log::debug!("Upload worker started");
                while let Some(job) = worker_handoff.acquire() {
                    targets.write_slot(job.slot, &source);
                    worker_handoff.complete(job);
                }
                log::debug!("Upload worker stopped");
            })
            .context("Failed to spawn upload worker")?;

        Ok(Self {
            handoff,
            handle: Some(handle),
        })
    }

    /// Close the handoff and join the thread. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.handoff.close();
        if handle.join().is_err() {
            log::error!("Upload worker panicked");
        }
    }
}

impl Drop for UploadWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
