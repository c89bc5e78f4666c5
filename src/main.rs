// =============================================================================
// FRAME FORGE - Indirect-drawing Vulkan renderer
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, FPS title)                           │
// │    └── Renderer (owns everything GPU-side)                      │
// │          ├── FrameOrchestrator (one pass per displayed frame)   │
// │          ├── FrameSlotSet (2 frames in flight)                  │
// │          ├── UploadWorker (camera/scene/object data)            │
// │          └── ResourceLedgers (global + swapchain-scoped)        │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the slot's fence, hand the slot to the upload worker
// 2. Acquire swapchain image
// 3. Record one indirect draw per batch into secondary buffers
// 4. Wait for the upload, submit
// 5. Present, advance the slot
//
// =============================================================================

mod assets;
mod backend;
mod batch;
mod camera;
mod config;
mod error;
mod frame;
mod ledger;
mod orchestrator;
mod renderer;
mod scene;
mod upload;

use anyhow::{Context, Result};
use camera::Movement;
use config::Config;
use renderer::Renderer;
use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let (config, config_error) = Config::load();

    init_logging(&config);
    if let Some(e) = config_error {
        log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
    }
    log::info!("Starting Frame Forge");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Present mode: {}, recording: {}",
        config.graphics.present_mode,
        config.graphics.recording
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Initialize logging, optionally piping everything to the configured file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};

    let mut builder = Builder::from_env(log_env("RUST_LOG"));

    let mut file_error = None;
    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Frame Forge Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some(e),
        }
    }

    builder.init();

    if let Some(e) = file_error {
        log::warn!("Could not open log file {}: {}", config.debug.log_file, e);
    }
}

/// Filter taken from `var`, info when it is unset.
fn log_env(var: &str) -> env_logger::Env<'_> {
    env_logger::Env::new().filter_or(var, "info")
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// The renderer is declared before the window so it drops first; the
/// surface must go before the window it was created from.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    is_fullscreen: bool,
    held_keys: HashSet<KeyCode>,
    last_cursor: Option<(f64, f64)>,

    last_frame_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,

    /// Set when the app stops because of an error.
    fatal: Option<anyhow::Error>,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            is_fullscreen: config.window.fullscreen,
            config,
            renderer: None,
            window: None,
            held_keys: HashSet::new(),
            last_cursor: None,
            last_frame_time: now,
            frame_count: 0,
            last_fps_update: now,
            fatal: None,
        }
    }

    /// Log, tear the renderer down and stop the event loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("Fatal: {:#}", error);
        if let Some(mut renderer) = self.renderer.take() {
            renderer.shutdown();
        }
        self.fatal = Some(error);
        event_loop.exit();
    }

    fn render(&mut self, event_loop: &ActiveEventLoop) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;

        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        {
            let mut camera = renderer.camera();
            for key in &self.held_keys {
                if let Some(movement) = movement_for(*key) {
                    camera.process_movement(movement, dt);
                }
            }
        }

        match renderer.draw_frame() {
            Ok(true) => self.update_fps(dt),
            Ok(false) => {}
            Err(e) => self.fail(event_loop, e),
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows rebuilds the swapchain.
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self, frame_time: f32) {
        if !self.config.debug.show_fps {
            return;
        }

        self.frame_count += 1;
        let now = Instant::now();

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

fn movement_for(key: KeyCode) -> Option<Movement> {
    match key {
        KeyCode::KeyW => Some(Movement::Forward),
        KeyCode::KeyS => Some(Movement::Backward),
        KeyCode::KeyA => Some(Movement::Left),
        KeyCode::KeyD => Some(Movement::Right),
        _ => None,
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        let size = window.inner_size();
        match Renderer::new(&self.config, window.as_ref(), size.width, size.height)
            .context("Failed to initialize renderer")
        {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e);
                return;
            }
        }

        self.window = Some(window);
        self.last_frame_time = Instant::now();
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    renderer.resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => self.render(event_loop),

            WindowEvent::CursorMoved { position, .. } => {
                if let (Some((last_x, last_y)), Some(renderer)) = (self.last_cursor, self.renderer.as_ref()) {
                    let dx = (position.x - last_x) as f32;
                    let dy = (position.y - last_y) as f32;
                    renderer.camera().process_mouse(dx, dy);
                }
                self.last_cursor = Some((position.x, position.y));
            }

            WindowEvent::CursorLeft { .. } => self.last_cursor = None,

            WindowEvent::KeyboardInput { event, .. } => {
                let PhysicalKey::Code(key) = event.physical_key else {
                    return;
                };
                match event.state {
                    ElementState::Pressed => {
                        if !event.repeat {
                            match key {
                                KeyCode::Escape => {
                                    log::info!("ESC pressed, exiting...");
                                    event_loop.exit();
                                }
                                KeyCode::F11 => self.toggle_fullscreen(),
                                _ => {}
                            }
                        }
                        if movement_for(key).is_some() {
                            self.held_keys.insert(key);
                        }
                    }
                    ElementState::Released => {
                        self.held_keys.remove(&key);
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(mut renderer) = self.renderer.take() {
            renderer.shutdown();
        }
        log::info!("Cleanup complete");
    }
}
