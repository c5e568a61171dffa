// Command pools and one-shot submission
//
// Frame command buffers come from a RESET_COMMAND_BUFFER pool so each slot
// resets its own buffer. Setup work (uploads, layout transitions, mipmaps)
// goes through OneShotCommands: record, submit, wait idle, free.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

/// Pool for per-frame command buffers, reset individually each frame
pub fn create_frame_command_pool(device: &VulkanDevice, queue_family: u32) -> Result<vk::CommandPool> {
    let pool_info = vk::CommandPoolCreateInfo::builder()
        .queue_family_index(queue_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe {
        device.device.create_command_pool(&pool_info, None)
            .context("Failed to create graphics command pool")
    }
}

/// Allocate `count` primary command buffers
pub fn allocate_command_buffers(
    device: &VulkanDevice,
    pool: vk::CommandPool,
    count: u32,
) -> Result<Vec<vk::CommandBuffer>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count);

    unsafe {
        device.device.allocate_command_buffers(&alloc_info)
            .context("Failed to allocate command buffers")
    }
}

/// Transient pool + queue pair for synchronous setup-time submissions.
///
/// Every submission waits for the queue to go idle. Not for the frame loop.
pub struct OneShotCommands {
    pub pool: vk::CommandPool,
    pub queue: vk::Queue,
}

impl OneShotCommands {
    pub fn new(device: &VulkanDevice, queue_family: u32, queue: vk::Queue) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);

        let pool = unsafe {
            device.device.create_command_pool(&pool_info, None)
                .context("Failed to create transient command pool")?
        };

        Ok(Self { pool, queue })
    }

    /// Null handles; destroying this is a no-op
    pub fn null() -> Self {
        Self {
            pool: vk::CommandPool::null(),
            queue: vk::Queue::null(),
        }
    }

    /// Record `body` into a fresh command buffer, submit it and block until done.
    pub fn run<F>(&self, device: &VulkanDevice, body: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let cmd = allocate_command_buffers(device, self.pool, 1)?[0];

        let result = self.record_and_submit(device, cmd, body);

        unsafe {
            device.device.free_command_buffers(self.pool, &[cmd]);
        }

        result
    }

    fn record_and_submit<F>(&self, device: &VulkanDevice, cmd: vk::CommandBuffer, body: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device.device.begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin one-shot command buffer")?;
        }

        body(&device.device, cmd)?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device.device.end_command_buffer(cmd)
                .context("Failed to end one-shot command buffer")?;
            device.device.queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
                .context("Failed to submit one-shot command buffer")?;
            // TODO: per-transfer fences would let several uploads overlap
            device.device.queue_wait_idle(self.queue)
                .context("Failed to wait for one-shot submission")?;
        }

        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_command_pool(self.pool, None);
        }
    }
}
