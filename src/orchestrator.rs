// Frame orchestration - one pass through the per-frame state machine
//
//   Idle -> WaitFence -> Acquiring -> Recording -> Submitting -> Presenting -> Idle
//
// Ordering rules:
// - the slot's fence has signaled before its uploads start, before its
//   command buffers are reset and before its storage buffer is rewritten
// - the fence is reset only once an image was acquired, so a stale
//   swapchain leaves it signaled and the retry does not deadlock
// - the slot's upload has completed before the primary buffer is submitted
//
// Everything GPU-facing goes through the FrameDevice trait so the sequence
// can run against a recording mock in tests.

use ash::vk;
use std::time::Duration;

use crate::batch::{self, IndirectBatch, INDIRECT_STRIDE};
use crate::error::{FrameError, FrameResult};
use crate::frame::FrameSlotSet;
use crate::scene::Scene;
use crate::upload::UploadHandoff;

// =============================================================================
// DEVICE SEAM
// =============================================================================

/// The native calls a frame needs. Recording methods may be called from
/// several threads at once, each on its own command buffer.
pub trait FrameDevice: Sync {
    fn wait_fence(&self, fence: vk::Fence, timeout: Duration) -> FrameResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> FrameResult<()>;
    /// Returns the image index and whether the swapchain is suboptimal.
    fn acquire_image(&self, signal: vk::Semaphore, timeout: Duration) -> FrameResult<(u32, bool)>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()>;

    fn begin_primary(&self, cmd: vk::CommandBuffer) -> FrameResult<()>;
    fn begin_secondary(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
    ) -> FrameResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()>;

    fn begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
    );
    fn end_render_pass(&self, cmd: vk::CommandBuffer);
    fn execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]);

    fn set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);
    fn bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
        dynamic_offsets: &[u32],
    );
    fn bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer);
    fn draw_indirect(
        &self,
        cmd: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        draw_count: u32,
        stride: u32,
    );

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        wait: vk::Semaphore,
        signal: vk::Semaphore,
        fence: vk::Fence,
    ) -> FrameResult<()>;
    /// Returns true when the swapchain should be recreated.
    fn present(&self, image_index: u32, wait: vk::Semaphore) -> FrameResult<bool>;
}

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Idle,
    WaitFence,
    Acquiring,
    Recording,
    Submitting,
    Presenting,
}

/// How batches are spread over secondary command buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingPolicy {
    /// Every batch goes into the slot's first secondary buffer.
    Serial,
    /// Contiguous chunks of batches are recorded on scoped threads, one per
    /// secondary buffer, and executed in chunk order.
    Parallel,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameTimeouts {
    pub fence: Duration,
    pub acquire: Duration,
    pub upload: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutcome {
    pub image_index: u32,
    pub frame_number: u64,
    pub swapchain_suboptimal: bool,
}

/// Read-only inputs for recording one frame.
pub struct FrameContext<'a> {
    pub scene: &'a Scene,
    pub render_pass: vk::RenderPass,
    pub framebuffers: &'a [vk::Framebuffer],
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub global_set: vk::DescriptorSet,
    /// Padded per-slot strides of the camera and scene uniform buffers.
    pub camera_stride: u32,
    pub scene_stride: u32,
    pub indirect_buffer: vk::Buffer,
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================

pub struct FrameOrchestrator {
    state: FrameState,
    frame_number: u64,
    policy: RecordingPolicy,
    timeouts: FrameTimeouts,
}

impl FrameOrchestrator {
    pub fn new(policy: RecordingPolicy, timeouts: FrameTimeouts) -> Self {
        Self {
            state: FrameState::Idle,
            frame_number: 0,
            policy,
            timeouts,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn policy(&self) -> RecordingPolicy {
        self.policy
    }

    fn enter(&mut self, state: FrameState) {
        log::trace!("Frame {}: {:?} -> {:?}", self.frame_number, self.state, state);
        self.state = state;
    }

    /// Run one frame. The slot index advances only when the frame was
    /// presented; on error the state returns to `Idle` and the slot stays.
    pub fn draw_frame<D: FrameDevice>(
        &mut self,
        device: &D,
        slots: &mut FrameSlotSet,
        handoff: &UploadHandoff,
        ctx: &FrameContext<'_>,
    ) -> FrameResult<FrameOutcome> {
        let result = self.run(device, slots, handoff, ctx);
        self.enter(FrameState::Idle);
        result
    }

    fn run<D: FrameDevice>(
        &mut self,
        device: &D,
        slots: &mut FrameSlotSet,
        handoff: &UploadHandoff,
        ctx: &FrameContext<'_>,
    ) -> FrameResult<FrameOutcome> {
        let slot_index = slots.current_index();
        let slot = slots.current().clone();

        self.enter(FrameState::WaitFence);
        device.wait_fence(slot.in_flight_fence, self.timeouts.fence)?;

        // The GPU is done with this slot, its buffers are free to rewrite.
        let ticket = handoff.release(slot_index);

        self.enter(FrameState::Acquiring);
        let (image_index, suboptimal) = device.acquire_image(slot.image_available, self.timeouts.acquire)?;
        // The image is held and its semaphore signaled, so this cannot be
        // retried like a stale acquire.
        let Some(&framebuffer) = ctx.framebuffers.get(image_index as usize) else {
            log::error!(
                "No framebuffer for swapchain image {} ({} framebuffers)",
                image_index,
                ctx.framebuffers.len()
            );
            return Err(FrameError::Vulkan(vk::Result::ERROR_UNKNOWN));
        };
        device.reset_fence(slot.in_flight_fence)?;

        device.reset_command_buffer(slot.primary)?;
        for secondary in &slot.secondaries {
            device.reset_command_buffer(secondary.buffer)?;
        }

        self.enter(FrameState::Recording);
        let batches = batch::compact(&ctx.scene.objects);

        let recorded: Vec<vk::CommandBuffer> = match self.policy {
            RecordingPolicy::Serial => {
                let cmd = slot.secondaries[0].buffer;
                record_batches(device, cmd, ctx, framebuffer, slot_index, slot.object_set, &batches)?;
                vec![cmd]
            }
            RecordingPolicy::Parallel => {
                let workers = slot.secondaries.len();
                let chunk = batches.len().div_ceil(workers).max(1);
                let chunks: Vec<(vk::CommandBuffer, &[IndirectBatch])> = batches
                    .chunks(chunk)
                    .zip(&slot.secondaries)
                    .map(|(chunk, recorder)| (recorder.buffer, chunk))
                    .collect();

                std::thread::scope(|scope| {
                    let handles: Vec<_> = chunks
                        .iter()
                        .map(|&(cmd, chunk)| {
                            scope.spawn(move || {
                                record_batches(device, cmd, ctx, framebuffer, slot_index, slot.object_set, chunk)
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
                    }
                    Ok::<(), FrameError>(())
                })?;
                chunks.iter().map(|&(cmd, _)| cmd).collect()
            }
        };

        device.begin_primary(slot.primary)?;
        device.begin_render_pass(slot.primary, ctx.render_pass, framebuffer, ctx.extent, ctx.clear_color);
        if !recorded.is_empty() {
            device.execute_commands(slot.primary, &recorded);
        }
        device.end_render_pass(slot.primary);
        device.end_command_buffer(slot.primary)?;

        self.enter(FrameState::Submitting);
        handoff.wait_complete(ticket, self.timeouts.upload)?;
        device.submit(slot.primary, slot.image_available, slot.render_finished, slot.in_flight_fence)?;

        self.enter(FrameState::Presenting);
        let present_stale = device.present(image_index, slot.render_finished)?;

        slots.advance();
        let frame_number = self.frame_number;
        self.frame_number += 1;

        Ok(FrameOutcome {
            image_index,
            frame_number,
            swapchain_suboptimal: suboptimal || present_stale,
        })
    }
}

/// Record `batches` into one secondary buffer inheriting the render pass.
fn record_batches<D: FrameDevice>(
    device: &D,
    cmd: vk::CommandBuffer,
    ctx: &FrameContext<'_>,
    framebuffer: vk::Framebuffer,
    slot_index: usize,
    object_set: vk::DescriptorSet,
    batches: &[IndirectBatch],
) -> FrameResult<()> {
    device.begin_secondary(cmd, ctx.render_pass, framebuffer)?;

    let dynamic_offsets = [
        slot_index as u32 * ctx.camera_stride,
        slot_index as u32 * ctx.scene_stride,
    ];

    for batch in batches {
        let (Some(material), Some(mesh)) = (
            ctx.scene.materials.get(batch.material),
            ctx.scene.meshes.get(batch.mesh),
        ) else {
            log::warn!("Skipping batch with dangling mesh or material: {:?}", batch);
            continue;
        };

        device.set_viewport_scissor(cmd, ctx.extent);
        device.bind_pipeline(cmd, material.pipeline);
        device.bind_descriptor_set(cmd, material.layout, 0, ctx.global_set, &dynamic_offsets);
        device.bind_descriptor_set(cmd, material.layout, 1, object_set, &[]);
        if let Some(texture_set) = material.texture_set {
            device.bind_descriptor_set(cmd, material.layout, 2, texture_set, &[]);
        }
        device.bind_vertex_buffer(cmd, mesh.vertex_buffer);
        device.draw_indirect(cmd, ctx.indirect_buffer, batch.byte_offset(), batch.count, INDIRECT_STRIDE);
    }

    device.end_command_buffer(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WaitStage;
    use crate::frame::tests::fake_slots;
    use crate::scene::{Material, Mesh, Vertex};
    use ash::vk::Handle;
    use glam::Mat4;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        WaitFence(vk::Fence),
        ResetFence(vk::Fence),
        Acquire(vk::Semaphore),
        ResetCommandBuffer(vk::CommandBuffer),
        BeginPrimary(vk::CommandBuffer),
        BeginSecondary(vk::CommandBuffer, vk::Framebuffer),
        End(vk::CommandBuffer),
        BeginRenderPass(vk::CommandBuffer, vk::Framebuffer),
        EndRenderPass(vk::CommandBuffer),
        Execute(vk::CommandBuffer, Vec<vk::CommandBuffer>),
        Viewport(vk::CommandBuffer),
        BindPipeline(vk::CommandBuffer, vk::Pipeline),
        BindSet(vk::CommandBuffer, u32, vk::DescriptorSet, Vec<u32>),
        BindVertexBuffer(vk::CommandBuffer, vk::Buffer),
        DrawIndirect {
            cmd: vk::CommandBuffer,
            offset: vk::DeviceSize,
            count: u32,
            stride: u32,
        },
        Submit {
            cmd: vk::CommandBuffer,
            wait: vk::Semaphore,
            signal: vk::Semaphore,
            fence: vk::Fence,
        },
        Present(u32, vk::Semaphore),
    }

    #[derive(Default)]
    struct MockDevice {
        calls: Mutex<Vec<Call>>,
        stale_acquires: Mutex<u32>,
        fence_times_out: bool,
        next_image: Mutex<u32>,
        /// When set, every fence wait notes how many uploads were issued.
        handoff: Option<Arc<UploadHandoff>>,
        issued_at_fence_wait: Mutex<Vec<u64>>,
    }

    impl MockDevice {
        fn record(&self, call: Call) {
            self.calls.lock().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn draws_by_buffer(&self) -> Vec<(vk::CommandBuffer, vk::DeviceSize, u32)> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::DrawIndirect { cmd, offset, count, .. } => Some((cmd, offset, count)),
                    _ => None,
                })
                .collect()
        }
    }

    impl FrameDevice for MockDevice {
        fn wait_fence(&self, fence: vk::Fence, _timeout: Duration) -> FrameResult<()> {
            self.record(Call::WaitFence(fence));
            if let Some(handoff) = &self.handoff {
                self.issued_at_fence_wait.lock().push(handoff.issued());
            }
            if self.fence_times_out {
                return Err(FrameError::from_wait(vk::Result::TIMEOUT, WaitStage::InFlightFence));
            }
            Ok(())
        }

        fn reset_fence(&self, fence: vk::Fence) -> FrameResult<()> {
            self.record(Call::ResetFence(fence));
            Ok(())
        }

        fn acquire_image(&self, signal: vk::Semaphore, _timeout: Duration) -> FrameResult<(u32, bool)> {
            self.record(Call::Acquire(signal));
            let mut stale = self.stale_acquires.lock();
            if *stale > 0 {
                *stale -= 1;
                return Err(FrameError::from_wait(vk::Result::ERROR_OUT_OF_DATE_KHR, WaitStage::AcquireImage));
            }
            let mut next = self.next_image.lock();
            let image = *next;
            *next = (*next + 1) % 3;
            Ok((image, false))
        }

        fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
            self.record(Call::ResetCommandBuffer(cmd));
            Ok(())
        }

        fn begin_primary(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
            self.record(Call::BeginPrimary(cmd));
            Ok(())
        }

        fn begin_secondary(&self, cmd: vk::CommandBuffer, _rp: vk::RenderPass, fb: vk::Framebuffer) -> FrameResult<()> {
            self.record(Call::BeginSecondary(cmd, fb));
            Ok(())
        }

        fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> FrameResult<()> {
            self.record(Call::End(cmd));
            Ok(())
        }

        fn begin_render_pass(
            &self,
            cmd: vk::CommandBuffer,
            _rp: vk::RenderPass,
            fb: vk::Framebuffer,
            _extent: vk::Extent2D,
            _clear: [f32; 4],
        ) {
            self.record(Call::BeginRenderPass(cmd, fb));
        }

        fn end_render_pass(&self, cmd: vk::CommandBuffer) {
            self.record(Call::EndRenderPass(cmd));
        }

        fn execute_commands(&self, primary: vk::CommandBuffer, secondaries: &[vk::CommandBuffer]) {
            self.record(Call::Execute(primary, secondaries.to_vec()));
        }

        fn set_viewport_scissor(&self, cmd: vk::CommandBuffer, _extent: vk::Extent2D) {
            self.record(Call::Viewport(cmd));
        }

        fn bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
            self.record(Call::BindPipeline(cmd, pipeline));
        }

        fn bind_descriptor_set(
            &self,
            cmd: vk::CommandBuffer,
            _layout: vk::PipelineLayout,
            set_index: u32,
            set: vk::DescriptorSet,
            dynamic_offsets: &[u32],
        ) {
            self.record(Call::BindSet(cmd, set_index, set, dynamic_offsets.to_vec()));
        }

        fn bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
            self.record(Call::BindVertexBuffer(cmd, buffer));
        }

        fn draw_indirect(&self, cmd: vk::CommandBuffer, _buffer: vk::Buffer, offset: vk::DeviceSize, count: u32, stride: u32) {
            self.record(Call::DrawIndirect { cmd, offset, count, stride });
        }

        fn submit(&self, cmd: vk::CommandBuffer, wait: vk::Semaphore, signal: vk::Semaphore, fence: vk::Fence) -> FrameResult<()> {
            self.record(Call::Submit { cmd, wait, signal, fence });
            Ok(())
        }

        fn present(&self, image_index: u32, wait: vk::Semaphore) -> FrameResult<bool> {
            self.record(Call::Present(image_index, wait));
            Ok(false)
        }
    }

    /// Stand-in uploader that completes every job immediately.
    fn instant_uploader(handoff: Arc<UploadHandoff>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while let Some(job) = handoff.acquire() {
                handoff.complete(job);
            }
        })
    }

    fn timeouts() -> FrameTimeouts {
        FrameTimeouts {
            fence: Duration::from_secs(1),
            acquire: Duration::from_secs(1),
            upload: Duration::from_secs(5),
        }
    }

    /// Meshes "a", "b"; materials "plain" and "textured" (with a set 2).
    fn scene(pairs: &[(&str, &str)]) -> Scene {
        let mut scene = Scene::default();
        scene.meshes.insert("a", Mesh { vertices: vec![Vertex::default(); 3], vertex_buffer: vk::Buffer::from_raw(11) });
        scene.meshes.insert("b", Mesh { vertices: vec![Vertex::default(); 6], vertex_buffer: vk::Buffer::from_raw(12) });
        scene.materials.insert(
            "plain",
            Material {
                pipeline: vk::Pipeline::from_raw(21),
                layout: vk::PipelineLayout::from_raw(31),
                texture_set: None,
            },
        );
        scene.materials.insert(
            "textured",
            Material {
                pipeline: vk::Pipeline::from_raw(22),
                layout: vk::PipelineLayout::from_raw(32),
                texture_set: Some(vk::DescriptorSet::from_raw(42)),
            },
        );
        for (mesh, material) in pairs {
            scene.spawn(mesh, material, Mat4::IDENTITY).unwrap();
        }
        scene
    }

    fn framebuffers() -> Vec<vk::Framebuffer> {
        (501..504).map(vk::Framebuffer::from_raw).collect()
    }

    fn context<'a>(scene: &'a Scene, framebuffers: &'a [vk::Framebuffer]) -> FrameContext<'a> {
        FrameContext {
            scene,
            render_pass: vk::RenderPass::from_raw(600),
            framebuffers,
            extent: vk::Extent2D { width: 800, height: 600 },
            clear_color: [0.0; 4],
            global_set: vk::DescriptorSet::from_raw(700),
            camera_stride: 256,
            scene_stride: 256,
            indirect_buffer: vk::Buffer::from_raw(800),
        }
    }

    #[test]
    fn single_object_frame_runs_through_and_toggles_once() {
        let handoff = Arc::new(UploadHandoff::new());
        let device = MockDevice {
            handoff: Some(handoff.clone()),
            ..Default::default()
        };
        let mut slots = fake_slots(1);
        let slot = slots.current().clone();
        let uploader = instant_uploader(handoff.clone());
        let scene = scene(&[("a", "plain")]);
        let fbs = framebuffers();
        let mut orchestrator = FrameOrchestrator::new(RecordingPolicy::Serial, timeouts());

        let outcome = orchestrator.draw_frame(&device, &mut slots, &handoff, &context(&scene, &fbs)).unwrap();

        assert_eq!(outcome, FrameOutcome { image_index: 0, frame_number: 0, swapchain_suboptimal: false });
        assert_eq!(slots.current_index(), 1);
        assert_eq!(orchestrator.state(), FrameState::Idle);
        assert_eq!(orchestrator.frame_number(), 1);

        let secondary = slot.secondaries[0].buffer;
        let expected = vec![
            Call::WaitFence(slot.in_flight_fence),
            Call::Acquire(slot.image_available),
            Call::ResetFence(slot.in_flight_fence),
            Call::ResetCommandBuffer(slot.primary),
            Call::ResetCommandBuffer(secondary),
            Call::BeginSecondary(secondary, fbs[0]),
            Call::Viewport(secondary),
            Call::BindPipeline(secondary, vk::Pipeline::from_raw(21)),
            Call::BindSet(secondary, 0, vk::DescriptorSet::from_raw(700), vec![0, 0]),
            Call::BindSet(secondary, 1, slot.object_set, vec![]),
            Call::BindVertexBuffer(secondary, vk::Buffer::from_raw(11)),
            Call::DrawIndirect { cmd: secondary, offset: 0, count: 1, stride: 16 },
            Call::End(secondary),
            Call::BeginPrimary(slot.primary),
            Call::BeginRenderPass(slot.primary, fbs[0]),
            Call::Execute(slot.primary, vec![secondary]),
            Call::EndRenderPass(slot.primary),
            Call::End(slot.primary),
            Call::Submit {
                cmd: slot.primary,
                wait: slot.image_available,
                signal: slot.render_finished,
                fence: slot.in_flight_fence,
            },
            Call::Present(0, slot.render_finished),
        ];
        assert_eq!(device.calls(), expected);

        // The slot went to the uploader only once its fence had been waited on.
        assert_eq!(*device.issued_at_fence_wait.lock(), [0]);
        assert_eq!(handoff.issued(), 1);

        handoff.close();
        uploader.join().unwrap();
    }

    #[test]
    fn second_frame_uses_the_other_slot_and_dynamic_offsets() {
        let device = MockDevice::default();
        let mut slots = fake_slots(1);
        let second = slots.slots()[1].clone();
        let handoff = Arc::new(UploadHandoff::new());
        let uploader = instant_uploader(handoff.clone());
        let scene = scene(&[("a", "textured"), ("a", "textured"), ("b", "plain")]);
        let fbs = framebuffers();
        let ctx = context(&scene, &fbs);
        let mut orchestrator = FrameOrchestrator::new(RecordingPolicy::Serial, timeouts());

        orchestrator.draw_frame(&device, &mut slots, &handoff, &ctx).unwrap();
        device.calls.lock().clear();
        let outcome = orchestrator.draw_frame(&device, &mut slots, &handoff, &ctx).unwrap();

        assert_eq!(outcome.frame_number, 1);
        assert_eq!(slots.current_index(), 0);

        let calls = device.calls();
        assert_eq!(calls[0], Call::WaitFence(second.in_flight_fence));
        let cmd = second.secondaries[0].buffer;
        assert!(calls.contains(&Call::BindSet(cmd, 0, ctx.global_set, vec![256, 256])));
        assert!(calls.contains(&Call::BindSet(cmd, 2, vk::DescriptorSet::from_raw(42), vec![])));
        assert_eq!(device.draws_by_buffer(), vec![(cmd, 0, 2), (cmd, 32, 1)]);

        handoff.close();
        uploader.join().unwrap();
    }

    #[test]
    fn stale_acquire_keeps_fence_signaled_and_slot_in_place() {
        let device = MockDevice {
            stale_acquires: Mutex::new(1),
            ..Default::default()
        };
        let mut slots = fake_slots(1);
        let fence = slots.current().in_flight_fence;
        let handoff = Arc::new(UploadHandoff::new());
        let uploader = instant_uploader(handoff.clone());
        let scene = scene(&[("a", "plain")]);
        let fbs = framebuffers();
        let mut orchestrator = FrameOrchestrator::new(RecordingPolicy::Serial, timeouts());

        let err = orchestrator.draw_frame(&device, &mut slots, &handoff, &context(&scene, &fbs)).unwrap_err();
        assert!(matches!(err, FrameError::SwapchainStale));
        assert!(err.is_recoverable());
        assert_eq!(slots.current_index(), 0);
        assert_eq!(orchestrator.state(), FrameState::Idle);
        assert!(!device.calls().contains(&Call::ResetFence(fence)));

        // Retry goes through on the same slot.
        let outcome = orchestrator.draw_frame(&device, &mut slots, &handoff, &context(&scene, &fbs)).unwrap();
        assert_eq!(outcome.frame_number, 0);
        assert_eq!(slots.current_index(), 1);

        handoff.close();
        uploader.join().unwrap();
    }

    #[test]
    fn fence_timeout_surfaces_as_timeout() {
        let device = MockDevice {
            fence_times_out: true,
            ..Default::default()
        };
        let mut slots = fake_slots(1);
        let handoff = UploadHandoff::new();
        let scene = scene(&[("a", "plain")]);
        let fbs = framebuffers();
        let mut orchestrator = FrameOrchestrator::new(RecordingPolicy::Serial, timeouts());

        let err = orchestrator.draw_frame(&device, &mut slots, &handoff, &context(&scene, &fbs)).unwrap_err();

        assert!(matches!(err, FrameError::Timeout { stage: WaitStage::InFlightFence }));
        assert_eq!(device.calls().len(), 1);
        assert_eq!(slots.current_index(), 0);
        // The GPU may still be reading the slot, so no upload was started.
        assert_eq!(handoff.issued(), 0);
    }

    #[test]
    fn missing_framebuffer_is_fatal() {
        let device = MockDevice::default();
        let mut slots = fake_slots(1);
        let fence = slots.current().in_flight_fence;
        let handoff = UploadHandoff::new();
        let scene = scene(&[("a", "plain")]);
        let mut orchestrator = FrameOrchestrator::new(RecordingPolicy::Serial, timeouts());

        let err = orchestrator.draw_frame(&device, &mut slots, &handoff, &context(&scene, &[])).unwrap_err();

        assert!(matches!(err, FrameError::Vulkan(vk::Result::ERROR_UNKNOWN)));
        assert!(!err.is_recoverable());
        assert!(!device.calls().contains(&Call::ResetFence(fence)));
        assert_eq!(orchestrator.state(), FrameState::Idle);
        assert_eq!(slots.current_index(), 0);
    }

    #[test]
    fn submit_waits_for_the_upload() {
        let device = MockDevice::default();
        let mut slots = fake_slots(1);
        let handoff = UploadHandoff::new();
        let scene = scene(&[("a", "plain")]);
        let fbs = framebuffers();
        let mut orchestrator = FrameOrchestrator::new(
            RecordingPolicy::Serial,
            FrameTimeouts {
                upload: Duration::from_millis(20),
                ..timeouts()
            },
        );

        // Nobody consumes the handoff, so the upload never completes.
        let err = orchestrator.draw_frame(&device, &mut slots, &handoff, &context(&scene, &fbs)).unwrap_err();

        assert!(matches!(err, FrameError::Timeout { stage: WaitStage::UploadComplete }));
        assert!(!device.calls().iter().any(|c| matches!(c, Call::Submit { .. })));
    }

    #[test]
    fn parallel_recording_draws_the_same_batches_in_order() {
        let pairs = [
            ("a", "plain"),
            ("b", "plain"),
            ("b", "plain"),
            ("a", "textured"),
            ("b", "textured"),
            ("a", "plain"),
            ("a", "plain"),
        ];
        let scene = scene(&pairs);
        let fbs = framebuffers();
        let handoff = Arc::new(UploadHandoff::new());
        let uploader = instant_uploader(handoff.clone());

        let serial = MockDevice::default();
        let mut serial_slots = fake_slots(3);
        FrameOrchestrator::new(RecordingPolicy::Serial, timeouts())
            .draw_frame(&serial, &mut serial_slots, &handoff, &context(&scene, &fbs))
            .unwrap();

        let parallel = MockDevice::default();
        let mut parallel_slots = fake_slots(3);
        let slot = parallel_slots.current().clone();
        FrameOrchestrator::new(RecordingPolicy::Parallel, timeouts())
            .draw_frame(&parallel, &mut parallel_slots, &handoff, &context(&scene, &fbs))
            .unwrap();

        // Five batches over three recorders: chunks of 2, 2 and 1.
        let recorders: Vec<_> = slot.secondaries.iter().map(|s| s.buffer).collect();
        let executed = parallel.calls().into_iter().find_map(|c| match c {
            Call::Execute(_, list) => Some(list),
            _ => None,
        });
        assert_eq!(executed, Some(recorders.clone()));

        // Reassemble draws in execution order and compare with the serial run.
        let parallel_draws = parallel.draws_by_buffer();
        let mut ordered = Vec::new();
        for cmd in &recorders {
            ordered.extend(parallel_draws.iter().filter(|d| d.0 == *cmd).map(|d| (d.1, d.2)));
        }
        let serial_draws: Vec<_> = serial.draws_by_buffer().into_iter().map(|d| (d.1, d.2)).collect();
        assert_eq!(ordered, serial_draws);
        assert_eq!(serial_draws.len(), 5);

        handoff.close();
        uploader.join().unwrap();
    }

    #[test]
    fn empty_scene_still_renders_a_cleared_frame() {
        let device = MockDevice::default();
        let mut slots = fake_slots(2);
        let handoff = Arc::new(UploadHandoff::new());
        let uploader = instant_uploader(handoff.clone());
        let scene = scene(&[]);
        let fbs = framebuffers();
        let mut orchestrator = FrameOrchestrator::new(RecordingPolicy::Parallel, timeouts());

        orchestrator.draw_frame(&device, &mut slots, &handoff, &context(&scene, &fbs)).unwrap();

        let calls = device.calls();
        assert!(device.draws_by_buffer().is_empty());
        assert!(!calls.iter().any(|c| matches!(c, Call::Execute(..))));
        assert!(calls.iter().any(|c| matches!(c, Call::Present(..))));

        handoff.close();
        uploader.join().unwrap();
    }
}
