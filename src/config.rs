// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// The Config is built once in main and passed down by reference.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestrator::{FrameTimeouts, RecordingPolicy};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub sync: SyncConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Forge".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Capacity of each slot's object buffer and of the indirect buffer.
    pub max_objects: u32,
    /// "serial" or "parallel"
    pub recording: String,
    pub recording_workers: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "immediate".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_objects: 32767,
            recording: "serial".to_string(),
            recording_workers: 4,
        }
    }
}

/// Bounded waits, in milliseconds
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Also bounds immediate-submit uploads at load time.
    pub fence_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub upload_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fence_timeout_ms: 1000,
            acquire_timeout_ms: 1000,
            upload_timeout_ms: 1000,
        }
    }
}

/// Compiled SPIR-V locations
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: PathBuf,
    pub vertex: String,
    pub textured_fragment: String,
    pub textureless_fragment: String,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("shaders"),
            vertex: "mesh.vert.spv".to_string(),
            textured_fragment: "textured.frag.spv".to_string(),
            textureless_fragment: "textureless.frag.spv".to_string(),
        }
    }
}

impl ShaderConfig {
    pub fn path(&self, file: &str) -> PathBuf {
        self.directory.join(file)
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "frame_forge.log".to_string(),
            show_fps: true,
        }
    }
}

/// Camera controls
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlsConfig {
    pub movement_speed: f32,
    pub mouse_sensitivity: f32,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            movement_speed: 5.0,
            mouse_sensitivity: 0.1,
        }
    }
}

impl Config {
    /// Load config.toml, falling back to defaults.
    ///
    /// The logger is configured from the result, so a load failure is
    /// handed back for the caller to report once logging is up.
    pub fn load() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Preferred present mode, or None to let the swapchain pick
    pub fn get_present_mode(&self) -> Option<vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
            _ => {
                log::warn!(
                    "Unknown present mode '{}', using the default preference order",
                    self.graphics.present_mode
                );
                None
            }
        }
    }

    pub fn recording_policy(&self) -> RecordingPolicy {
        match self.graphics.recording.to_lowercase().as_str() {
            "parallel" => RecordingPolicy::Parallel,
            "serial" => RecordingPolicy::Serial,
            other => {
                log::warn!("Unknown recording policy '{}', defaulting to serial", other);
                RecordingPolicy::Serial
            }
        }
    }

    /// Secondary command buffers each frame slot needs for the policy.
    pub fn secondary_buffers_per_slot(&self) -> usize {
        match self.recording_policy() {
            RecordingPolicy::Serial => 1,
            RecordingPolicy::Parallel => self.graphics.recording_workers.max(1),
        }
    }

    pub fn frame_timeouts(&self) -> FrameTimeouts {
        FrameTimeouts {
            fence: Duration::from_millis(self.sync.fence_timeout_ms),
            acquire: Duration::from_millis(self.sync.acquire_timeout_ms),
            upload: Duration::from_millis(self.sync.upload_timeout_ms),
        }
    }
}
