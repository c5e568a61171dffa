// Buffer utilities for vertex, index, uniform and staging buffers
//
// Each buffer owns one dedicated memory allocation, bound at offset 0.

use anyhow::{Context, Result};
use ash::vk;
use super::commands::OneShotCommands;
use super::VulkanDevice;

/// A buffer and its exclusively-bound memory
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl AllocatedBuffer {
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Helper to create a GPU buffer with specified usage and memory properties
pub fn create_buffer(
    device: &VulkanDevice,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    memory_properties: vk::MemoryPropertyFlags,
) -> Result<AllocatedBuffer> {
    let buffer_info = vk::BufferCreateInfo::builder()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe {
        device.device.create_buffer(&buffer_info, None)
            .context("Failed to create buffer")?
    };

    let mem_requirements = unsafe {
        device.device.get_buffer_memory_requirements(buffer)
    };

    let memory = find_memory_type(
        &device.memory_properties,
        mem_requirements.memory_type_bits,
        memory_properties,
    )
    .and_then(|memory_type_index| {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        unsafe {
            device.device.allocate_memory(&alloc_info, None)
                .context("Failed to allocate buffer memory")
        }
    });
    let memory = match memory {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e);
        }
    };

    let bound = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) }
        .context("Failed to bind buffer memory");
    if let Err(e) = bound {
        unsafe {
            device.device.destroy_buffer(buffer, None);
            device.device.free_memory(memory, None);
        }
        return Err(e);
    }

    Ok(AllocatedBuffer { buffer, memory, size })
}

/// Create a host-visible, coherent staging buffer holding a copy of `data`
pub fn create_staging_buffer(device: &VulkanDevice, data: &[u8]) -> Result<AllocatedBuffer> {
    let staging = create_buffer(
        device,
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
    )?;

    let mapped = unsafe {
        device.device.map_memory(staging.memory, 0, staging.size, vk::MemoryMapFlags::empty())
    };
    let ptr = match mapped {
        Ok(ptr) => ptr as *mut u8,
        Err(e) => {
            staging.destroy(&device.device);
            return Err(e).context("Failed to map staging buffer");
        }
    };

    unsafe {
        ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
        device.device.unmap_memory(staging.memory);
    }

    Ok(staging)
}

/// Upload `data` into a new device-local buffer through a staging copy on
/// the transfer queue
pub fn create_device_local_buffer(
    device: &VulkanDevice,
    transfer: &OneShotCommands,
    usage: vk::BufferUsageFlags,
    data: &[u8],
) -> Result<AllocatedBuffer> {
    let staging = create_staging_buffer(device, data)?;

    let result = create_buffer(
        device,
        staging.size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .and_then(|target| {
        match copy_buffer(device, transfer, staging.buffer, target.buffer, staging.size) {
            Ok(()) => Ok(target),
            Err(e) => {
                target.destroy(&device.device);
                Err(e)
            }
        }
    });

    staging.destroy(&device.device);
    result
}

/// Copy `size` bytes between buffers with a one-shot submission
pub fn copy_buffer(
    device: &VulkanDevice,
    transfer: &OneShotCommands,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> Result<()> {
    transfer.run(device, |d, cmd| {
        let region = vk::BufferCopy::builder()
            .src_offset(0)
            .dst_offset(0)
            .size(size)
            .build();
        unsafe {
            d.cmd_copy_buffer(cmd, src, dst, &[region]);
        }
        Ok(())
    })
}

/// Persistently mapped, host-coherent uniform buffer
pub struct MappedBuffer {
    pub buffer: AllocatedBuffer,
    ptr: *mut u8,
}

impl MappedBuffer {
    pub fn new(device: &VulkanDevice, size: vk::DeviceSize) -> Result<Self> {
        let buffer = create_buffer(
            device,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;

        let ptr = unsafe {
            device.device.map_memory(buffer.memory, 0, size, vk::MemoryMapFlags::empty())
        };
        let ptr = match ptr {
            Ok(ptr) => ptr as *mut u8,
            Err(e) => {
                buffer.destroy(&device.device);
                return Err(e).context("Failed to map uniform buffer");
            }
        };

        Ok(Self { buffer, ptr })
    }

    /// Overwrite the start of the mapping with `bytes`.
    ///
    /// The caller must have waited on the fence guarding the last GPU read.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.buffer.size,
            "Write of {} bytes overflows a {} byte mapping",
            bytes.len(),
            self.buffer.size
        );
        unsafe {
            self.ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        Ok(())
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.unmap_memory(self.buffer.memory);
        }
        self.buffer.destroy(device);
    }
}

/// Find a memory type allowed by `type_filter` that has every flag in `properties`
pub fn find_memory_type(
    mem_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    (0..mem_properties.memory_type_count)
        .find(|&i| {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = mem_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);
            has_type && has_properties
        })
        .with_context(|| format!("Failed to find suitable memory type for {:?}", properties))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, &flags) in types.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags: flags,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn picks_first_type_with_all_requested_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, wanted).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_filter_bits() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            1
        );
    }

    #[test]
    fn no_matching_type_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).is_err());
    }

    fn host_mapping(backing: &mut [u8]) -> MappedBuffer {
        MappedBuffer {
            buffer: AllocatedBuffer {
                size: backing.len() as vk::DeviceSize,
                ..Default::default()
            },
            ptr: backing.as_mut_ptr(),
        }
    }

    #[test]
    fn mapped_write_copies_into_mapping() {
        let mut backing = [0u8; 8];
        let mut mapped = host_mapping(&mut backing);
        mapped.write(&[1, 2, 3]).unwrap();
        assert_eq!(backing, [1, 2, 3, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn oversized_mapped_write_is_rejected() {
        let mut backing = [0u8; 4];
        let mut mapped = host_mapping(&mut backing);
        let err = mapped.write(&[9; 5]).unwrap_err();
        assert!(err.to_string().contains("overflows"));
        assert_eq!(backing, [0; 4]);
    }
}
