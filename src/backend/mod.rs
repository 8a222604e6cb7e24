// Backend module - Vulkan plumbing for the transfer probe
//
// Design: Thin wrapper around ash, every handle owned by exactly one struct

pub mod device;
pub mod memory;
pub mod sync;

pub use device::VulkanDevice;
pub use memory::{AllocationStrategy, DeviceImage, HostBuffer};
pub use sync::TransferSync;
