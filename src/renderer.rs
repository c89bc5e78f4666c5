// Renderer - owns every GPU subsystem and drives frames
//
// Ownership is a tree: the renderer owns the device, both ledgers, the frame
// slots, the upload worker and the scene, and lends references downward.
//
// Teardown order:
//   1. upload worker joined (it writes into mapped buffers)
//   2. device idle
//   3. swapchain ledger flushed (framebuffers, depth, views, swapchain)
//   4. global ledger flushed (everything else, newest first)
//   5. device dropped (allocator, device, surface, instance)

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use parking_lot::MutexGuard;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::mem::size_of;
use std::sync::Arc;
use std::time::Duration;

use crate::assets::{AssetSource, BuiltinAssets};
use crate::backend::buffer::{self, GpuBuffer, UploadContext};
use crate::backend::descriptor::{pad_uniform_size, DescriptorAllocator};
use crate::backend::frame_device::VulkanFrameDevice;
use crate::backend::pipeline::{self, MaterialDesc};
use crate::backend::{sync, texture, Swapchain, VulkanDevice};
use crate::batch;
use crate::camera::Camera;
use crate::config::Config;
use crate::error::SceneError;
use crate::frame::{FrameSlotSet, FRAME_OVERLAP};
use crate::ledger::ResourceLedger;
use crate::orchestrator::{FrameContext, FrameOrchestrator, FrameState};
use crate::scene::{GpuCameraData, GpuObjectData, GpuSceneData, Mesh, Scene};
use crate::upload::{UploadHandoff, UploadSource, UploadTargets, UploadWorker};

pub const TEXTURED_MATERIAL: &str = "texturedMesh";
pub const TEXTURELESS_MATERIAL: &str = "texturelessMesh";

pub struct Renderer {
    orchestrator: FrameOrchestrator,
    slots: FrameSlotSet,
    scene: Scene,

    handoff: Arc<UploadHandoff>,
    upload_source: Arc<UploadSource>,
    worker: UploadWorker,

    swapchain: Swapchain,
    framebuffers: Vec<vk::Framebuffer>,
    render_pass: vk::RenderPass,
    present_mode: Option<vk::PresentModeKHR>,

    global_set: vk::DescriptorSet,
    camera_stride: u32,
    scene_stride: u32,
    indirect: GpuBuffer,
    clear_color: [f32; 4],

    window_extent: vk::Extent2D,
    needs_recreate: bool,
    shut_down: bool,

    swapchain_ledger: ResourceLedger,
    ledger: ResourceLedger,
    // Declared last so it drops after both ledgers are empty.
    device: VulkanDevice,
}

impl Renderer {
    pub fn new<W>(config: &Config, window: &W, width: u32, height: u32) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let device = VulkanDevice::new(&config.window.title, config.debug.validation_layers, window)?;

        // Locals drop in reverse order, so on an init error the guard drains
        // the device first and the ledgers flush while it is still alive.
        let mut ledger = ResourceLedger::new("global");
        let mut swapchain_ledger = ResourceLedger::new("swapchain");
        let idle_guard = IdleOnDrop::new(|| device.wait_idle());

        // ─────────────────────────────────────────────────────────────────
        // Presentation
        // ─────────────────────────────────────────────────────────────────
        let present_mode = config.get_present_mode();
        let swapchain = Swapchain::new(&device, &mut swapchain_ledger, width, height, present_mode, None)?;
        let render_pass = pipeline::create_render_pass(&device.device, &mut ledger, swapchain.format)?;
        let framebuffers = pipeline::create_framebuffers(
            &device.device,
            &mut swapchain_ledger,
            &swapchain.image_views,
            swapchain.depth.view,
            render_pass,
            swapchain.extent,
        )?;

        // ─────────────────────────────────────────────────────────────────
        // Descriptors and per-frame buffers
        // ─────────────────────────────────────────────────────────────────
        let descriptors = DescriptorAllocator::new(&device.device, &mut ledger)?;
        let layouts = descriptors.layouts();

        let alignment = device.min_uniform_alignment();
        let camera_size = size_of::<GpuCameraData>() as vk::DeviceSize;
        let scene_size = size_of::<GpuSceneData>() as vk::DeviceSize;
        let camera_stride = pad_uniform_size(alignment, camera_size);
        let scene_stride = pad_uniform_size(alignment, scene_size);

        let mut camera_buffer = buffer::create_buffer(
            &device,
            &mut ledger,
            "camera uniforms",
            camera_stride * FRAME_OVERLAP as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        let mut scene_buffer = buffer::create_buffer(
            &device,
            &mut ledger,
            "scene uniforms",
            scene_stride * FRAME_OVERLAP as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;
        let global_set =
            descriptors.allocate_global_set(camera_buffer.buffer, camera_size, scene_buffer.buffer, scene_size)?;

        let max_objects = config.graphics.max_objects.max(1) as vk::DeviceSize;
        let object_buffer_size = max_objects * size_of::<GpuObjectData>() as vk::DeviceSize;
        let secondaries = config.secondary_buffers_per_slot();

        let mut frame_slots = Vec::with_capacity(FRAME_OVERLAP);
        let mut object_regions = Vec::with_capacity(FRAME_OVERLAP);
        for i in 0..FRAME_OVERLAP {
            let mut objects = buffer::create_buffer(
                &device,
                &mut ledger,
                &format!("object data {}", i),
                object_buffer_size,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
            )?;
            let object_set = descriptors.allocate_object_set(objects.buffer, object_buffer_size)?;
            object_regions.push(objects.mapped.take().context("Object buffer is not host visible")?);

            frame_slots.push(sync::create_frame_slot(
                &device.device,
                &mut ledger,
                device.queue_families.graphics,
                secondaries,
                objects.buffer,
                object_set,
            )?);
        }
        let slots = FrameSlotSet::new(frame_slots)?;

        let indirect = buffer::create_buffer(
            &device,
            &mut ledger,
            "indirect commands",
            max_objects * batch::INDIRECT_STRIDE as vk::DeviceSize,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            MemoryLocation::CpuToGpu,
        )?;

        // ─────────────────────────────────────────────────────────────────
        // Assets and materials
        // ─────────────────────────────────────────────────────────────────
        let upload = UploadContext::new(
            &device,
            &mut ledger,
            Duration::from_millis(config.sync.fence_timeout_ms),
        )?;
        let assets = BuiltinAssets;
        let mut scene = Scene::default();

        for name in ["cube", "plane"] {
            let vertices = assets.load_mesh(name)?;
            let vertex_buffer = buffer::create_device_local_buffer(
                &device,
                &mut ledger,
                &upload,
                name,
                vk::BufferUsageFlags::VERTEX_BUFFER,
                &vertices,
            )?;
            scene.meshes.insert(
                name,
                Mesh {
                    vertices,
                    vertex_buffer: vertex_buffer.buffer,
                },
            );
        }

        let checkerboard = assets.load_texture("checkerboard")?;
        let image = texture::upload_texture(&device, &mut ledger, &upload, "checkerboard", &checkerboard)?;
        let sampler = texture::create_sampler(&device.device, &mut ledger)?;
        let texture_set = descriptors.allocate_texture_set(image.view, sampler)?;

        let shaders = &config.shaders;
        pipeline::build_material(
            &device.device,
            &mut ledger,
            render_pass,
            &mut scene.materials,
            TEXTURED_MATERIAL,
            &MaterialDesc {
                vertex_shader: shaders.path(&shaders.vertex),
                fragment_shader: shaders.path(&shaders.textured_fragment),
                set_layouts: layouts.all().to_vec(),
                push_constants: Vec::new(),
                texture_set: Some(texture_set),
            },
        )?;
        pipeline::build_material(
            &device.device,
            &mut ledger,
            render_pass,
            &mut scene.materials,
            TEXTURELESS_MATERIAL,
            &MaterialDesc {
                vertex_shader: shaders.path(&shaders.vertex),
                fragment_shader: shaders.path(&shaders.textureless_fragment),
                set_layouts: vec![layouts.global, layouts.object],
                push_constants: Vec::new(),
                texture_set: None,
            },
        )?;

        populate_default_scene(&mut scene)?;

        // ─────────────────────────────────────────────────────────────────
        // Upload worker
        // ─────────────────────────────────────────────────────────────────
        let camera = Camera::new(
            Vec3::new(0.0, 6.0, 30.0),
            config.controls.movement_speed,
            config.controls.mouse_sensitivity,
        );
        let upload_source = Arc::new(UploadSource::new(camera, swapchain.extent));
        let handoff = Arc::new(UploadHandoff::new());

        let targets = UploadTargets {
            camera: camera_buffer.mapped.take().context("Camera buffer is not host visible")?,
            camera_stride: camera_stride as usize,
            scene: scene_buffer.mapped.take().context("Scene buffer is not host visible")?,
            scene_stride: scene_stride as usize,
            objects: object_regions,
        };
        let worker = UploadWorker::spawn(handoff.clone(), upload_source.clone(), targets)?;
        idle_guard.disarm();

        let mut renderer = Self {
            orchestrator: FrameOrchestrator::new(config.recording_policy(), config.frame_timeouts()),
            slots,
            scene: Scene::default(),
            handoff,
            upload_source,
            worker,
            swapchain,
            framebuffers,
            render_pass,
            present_mode,
            global_set,
            camera_stride: camera_stride as u32,
            scene_stride: scene_stride as u32,
            indirect,
            clear_color: config.graphics.clear_color,
            window_extent: vk::Extent2D { width, height },
            needs_recreate: false,
            shut_down: false,
            swapchain_ledger,
            ledger,
            device,
        };
        renderer.set_scene(scene)?;

        log::info!(
            "Renderer ready: {} frame slots, {:?} recording, {} secondary buffers per slot",
            renderer.slots.slots().len(),
            renderer.orchestrator.policy(),
            secondaries
        );

        Ok(renderer)
    }

    /// Replace the scene. Waits for the GPU, then rewrites the indirect
    /// commands and the transforms the uploader copies each frame.
    pub fn set_scene(&mut self, scene: Scene) -> Result<()> {
        self.device.wait_idle()?;

        let commands = self.indirect.mapped()?.draw_commands_mut();
        batch::write_indirect_commands(&scene, commands)?;
        self.upload_source.set_transforms(scene.transforms());

        log::info!(
            "Scene loaded: {} objects, {} batches, {} meshes, {} materials",
            scene.objects.len(),
            batch::compact(&scene.objects).len(),
            scene.meshes.len(),
            scene.materials.len()
        );
        self.scene = scene;
        Ok(())
    }

    /// Lock the camera the uploader reads from.
    pub fn camera(&self) -> MutexGuard<'_, Camera> {
        self.upload_source.camera.lock()
    }

    pub fn frame_number(&self) -> u64 {
        self.orchestrator.frame_number()
    }

    /// Note a new window size; the swapchain is rebuilt before the next frame.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.window_extent = vk::Extent2D { width, height };
        self.needs_recreate = true;
    }

    fn is_minimized(&self) -> bool {
        self.window_extent.width == 0 || self.window_extent.height == 0
    }

    /// Draw one frame. Returns false when nothing was presented.
    ///
    /// A stale or suboptimal swapchain is rebuilt; any other failure is
    /// returned and should end the process.
    pub fn draw_frame(&mut self) -> Result<bool> {
        if self.is_minimized() {
            return Ok(false);
        }
        if self.needs_recreate {
            self.recreate_swapchain()?;
        }

        self.upload_source.scene.lock().animate(self.orchestrator.frame_number());
        *self.upload_source.extent.lock() = self.swapchain.extent;

        let frame_device = VulkanFrameDevice {
            device: &self.device.device,
            swapchain_loader: &self.device.swapchain_loader,
            swapchain: self.swapchain.swapchain,
            graphics_queue: self.device.graphics_queue,
            present_queue: self.device.present_queue,
        };
        let ctx = FrameContext {
            scene: &self.scene,
            render_pass: self.render_pass,
            framebuffers: &self.framebuffers,
            extent: self.swapchain.extent,
            clear_color: self.clear_color,
            global_set: self.global_set,
            camera_stride: self.camera_stride,
            scene_stride: self.scene_stride,
            indirect_buffer: self.indirect.buffer,
        };

        let result = self
            .orchestrator
            .draw_frame(&frame_device, &mut self.slots, &self.handoff, &ctx);
        debug_assert_eq!(self.orchestrator.state(), FrameState::Idle);

        match result {
            Ok(outcome) => {
                if outcome.swapchain_suboptimal {
                    log::debug!("Swapchain suboptimal after frame {}", outcome.frame_number);
                    self.needs_recreate = true;
                }
                Ok(true)
            }
            Err(e) if e.is_recoverable() => {
                log::info!("{}, recreating", e);
                self.needs_recreate = true;
                Ok(false)
            }
            Err(e) => Err(e).context("Frame failed"),
        }
    }

    /// Rebuild the swapchain and everything sized by it.
    pub fn recreate_swapchain(&mut self) -> Result<()> {
        self.needs_recreate = false;
        if self.is_minimized() {
            return Ok(());
        }

        self.device.wait_idle()?;

        let mut ledger = ResourceLedger::new("swapchain");
        let swapchain = Swapchain::new(
            &self.device,
            &mut ledger,
            self.window_extent.width,
            self.window_extent.height,
            self.present_mode,
            Some(self.swapchain.swapchain),
        )?;
        if swapchain.format != self.swapchain.format {
            log::warn!(
                "Surface format changed from {:?} to {:?}",
                self.swapchain.format,
                swapchain.format
            );
        }
        let framebuffers = pipeline::create_framebuffers(
            &self.device.device,
            &mut ledger,
            &swapchain.image_views,
            swapchain.depth.view,
            self.render_pass,
            swapchain.extent,
        )?;

        // The old swapchain was retired by the create call above.
        self.swapchain_ledger.flush();
        self.swapchain_ledger = ledger;
        self.swapchain = swapchain;
        self.framebuffers = framebuffers;

        log::info!(
            "Swapchain recreated: {}x{}, {} images, {:?}",
            self.swapchain.extent.width,
            self.swapchain.extent.height,
            self.swapchain.images.len(),
            self.swapchain.present_mode
        );
        Ok(())
    }

    /// Join the uploader, idle the device and flush both ledgers.
    /// Safe to call more than once.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        log::info!("Shutting down renderer after {} frames", self.frame_number());

        let worker = &mut self.worker;
        let device = &self.device;
        teardown(
            || worker.shutdown(),
            || device.wait_idle(),
            &mut self.swapchain_ledger,
            &mut self.ledger,
        );
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Join the uploader, wait for the GPU, then flush the swapchain ledger
/// before the global one. The worker writes into mapped memory the global
/// ledger frees, so it has to be gone first.
fn teardown<J, I>(join_worker: J, wait_idle: I, swapchain_ledger: &mut ResourceLedger, ledger: &mut ResourceLedger)
where
    J: FnOnce(),
    I: FnOnce() -> Result<()>,
{
    join_worker();
    if let Err(e) = wait_idle() {
        log::error!("Device wait idle failed during shutdown: {:#}", e);
    }
    swapchain_ledger.flush();
    ledger.flush();
}

/// Waits for the device when dropped, unless disarmed.
struct IdleOnDrop<I>
where
    I: FnOnce() -> Result<()>,
{
    wait_idle: Option<I>,
}

impl<I> IdleOnDrop<I>
where
    I: FnOnce() -> Result<()>,
{
    fn new(wait_idle: I) -> Self {
        Self {
            wait_idle: Some(wait_idle),
        }
    }

    fn disarm(mut self) {
        self.wait_idle = None;
    }
}

impl<I> Drop for IdleOnDrop<I>
where
    I: FnOnce() -> Result<()>,
{
    fn drop(&mut self) {
        if let Some(wait_idle) = self.wait_idle.take() {
            log::warn!("Renderer init failed, waiting for the device before teardown");
            if let Err(e) = wait_idle() {
                log::error!("Device wait idle failed: {:#}", e);
            }
        }
    }
}

/// A textured ground plane and a grid of cubes alternating materials.
/// Objects end up sorted so equal (material, mesh) pairs are adjacent.
pub fn populate_default_scene(scene: &mut Scene) -> Result<(), SceneError> {
    scene.spawn("plane", TEXTURED_MATERIAL, Mat4::IDENTITY)?;

    for x in -10..=10 {
        for z in -10..=10 {
            let material = if (x + z) % 3 == 0 {
                TEXTURED_MATERIAL
            } else {
                TEXTURELESS_MATERIAL
            };
            let transform = Mat4::from_translation(Vec3::new(x as f32 * 3.0, 1.0, z as f32 * 3.0))
                * Mat4::from_scale(Vec3::splat(0.5));
            scene.spawn("cube", material, transform)?;
        }
    }

    scene.sort_for_batching();
    Ok(())
}
