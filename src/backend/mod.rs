// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. Each wrapper owns its handles and knows how to
// destroy them; teardown order is decided by the owner.

pub mod buffer;
pub mod commands;
pub mod descriptor;
pub mod device;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use swapchain::Swapchain;
