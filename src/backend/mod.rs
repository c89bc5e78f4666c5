// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Creation functions take a ResourceLedger and
// register the matching destroy call, so teardown order is creation order
// reversed.

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod frame_device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
