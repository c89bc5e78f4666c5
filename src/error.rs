// Error kinds for the per-frame path
//
// Init code uses anyhow with context strings. The frame loop needs to tell
// apart the failures it can recover from (stale swapchain) from the ones
// that end the process, so those get a typed enum.

use ash::vk;
use thiserror::Error;

/// Which bounded wait expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    InFlightFence,
    AcquireImage,
    UploadComplete,
    ImmediateSubmit,
}

impl std::fmt::Display for WaitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WaitStage::InFlightFence => "in-flight fence",
            WaitStage::AcquireImage => "swapchain image acquisition",
            WaitStage::UploadComplete => "upload completion",
            WaitStage::ImmediateSubmit => "immediate submit fence",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Timed out waiting for {stage}")]
    Timeout { stage: WaitStage },

    /// The swapchain no longer matches the surface and must be recreated.
    #[error("Swapchain is out of date")]
    SwapchainStale,

    #[error("Upload worker stopped while a frame was waiting on it")]
    UploadWorkerGone,
}

impl FrameError {
    /// Maps a native wait result, turning `TIMEOUT` into a typed timeout.
    pub fn from_wait(result: vk::Result, stage: WaitStage) -> Self {
        match result {
            vk::Result::TIMEOUT | vk::Result::NOT_READY => FrameError::Timeout { stage },
            vk::Result::ERROR_OUT_OF_DATE_KHR => FrameError::SwapchainStale,
            other => FrameError::Vulkan(other),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::SwapchainStale)
    }
}

/// Scene catalogue and object list errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SceneError {
    #[error("Mesh '{0}' is not registered")]
    MeshNotFound(String),

    #[error("Material '{0}' is not registered")]
    MaterialNotFound(String),

    #[error("Scene has {count} objects but capacity is {capacity}")]
    TooManyObjects { count: usize, capacity: usize },
}

pub type FrameResult<T> = std::result::Result<T, FrameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_result_maps_to_timeout_kind() {
        let err = FrameError::from_wait(vk::Result::TIMEOUT, WaitStage::InFlightFence);
        assert!(matches!(
            err,
            FrameError::Timeout { stage: WaitStage::InFlightFence }
        ));
        assert!(err.to_string().contains("in-flight fence"));
    }

    #[test]
    fn out_of_date_is_the_only_recoverable_kind() {
        let stale = FrameError::from_wait(vk::Result::ERROR_OUT_OF_DATE_KHR, WaitStage::AcquireImage);
        assert!(stale.is_recoverable());

        let lost = FrameError::from_wait(vk::Result::ERROR_DEVICE_LOST, WaitStage::AcquireImage);
        assert!(matches!(lost, FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST)));
        assert!(!lost.is_recoverable());
        assert!(!FrameError::UploadWorkerGone.is_recoverable());
    }

    #[test]
    fn scene_error_names_the_missing_entry() {
        let err = SceneError::MaterialNotFound("texturedMesh".into());
        assert_eq!(err.to_string(), "Material 'texturedMesh' is not registered");
    }
}
