// Synchronization and command recording for one-shot transfers
//
// A single primary command buffer is recorded once and submitted once.
// The fence is the only CPU-GPU sync point: the host blocks on it before
// touching the readback buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Command pool, command buffer and fence for a single submission
pub struct TransferSync {
    pub command_pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl TransferSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.queue_family);

        let command_pool = unsafe {
            device.device.create_command_pool(&pool_info, None)
                .context("Failed to create command pool")?
        };

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let command_buffer = match unsafe { device.device.allocate_command_buffers(&alloc_info) } {
            Ok(buffers) => buffers[0],
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e).context("Failed to allocate command buffer");
            }
        };

        // Created unsignaled; reset again before submit
        let fence_info = vk::FenceCreateInfo::builder();

        let fence = match unsafe { device.device.create_fence(&fence_info, None) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.device.destroy_command_pool(command_pool, None) };
                return Err(e).context("Failed to create fence");
            }
        };

        Ok(Self {
            command_pool,
            command_buffer,
            fence,
            device: Arc::clone(device),
        })
    }

    /// Start recording a one-time-submit command buffer
    pub fn begin(&self) -> Result<vk::CommandBuffer> {
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device.device.begin_command_buffer(self.command_buffer, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        Ok(self.command_buffer)
    }

    /// End recording, submit to `queue` and block until the GPU signals the fence
    pub fn submit_and_wait(&self, queue: vk::Queue) -> Result<()> {
        let device = &self.device.device;

        unsafe {
            device.end_command_buffer(self.command_buffer)
                .context("Failed to end command buffer")?;

            device.reset_fences(&[self.fence])
                .context("Failed to reset fence")?;

            let command_buffers = [self.command_buffer];
            let submit_info = vk::SubmitInfo::builder()
                .command_buffers(&command_buffers);

            device.queue_submit(queue, &[submit_info.build()], self.fence)
                .context("Failed to submit transfer")?;

            device.wait_for_fences(&[self.fence], true, u64::MAX)
                .context("Failed waiting for transfer fence")?;
        }

        Ok(())
    }
}

impl Drop for TransferSync {
    fn drop(&mut self) {
        // Buffer may still be pending if the fence wait failed
        let _ = self.device.wait_idle();

        let device = &self.device.device;
        unsafe {
            device.free_command_buffers(self.command_pool, &[self.command_buffer]);
            device.destroy_command_pool(self.command_pool, None);
            device.destroy_fence(self.fence, None);
        }
    }
}
