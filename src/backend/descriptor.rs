// Descriptor pool and per-slot descriptor sets
//
// Each frame slot gets one set pointing at its own uniform buffer and the
// shared texture. Sets live as long as the pool and are never freed alone.

use anyhow::{Context, Result};
use ash::vk;
use super::VulkanDevice;

/// Pool sized for exactly `set_count` sets of the model layout
pub fn create_descriptor_pool(device: &VulkanDevice, set_count: u32) -> Result<vk::DescriptorPool> {
    let pool_sizes = [
        vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(set_count)
            .build(),
        vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(set_count)
            .build(),
    ];

    let pool_info = vk::DescriptorPoolCreateInfo::builder()
        .pool_sizes(&pool_sizes)
        .max_sets(set_count);

    unsafe {
        device.device.create_descriptor_pool(&pool_info, None)
            .context("Failed to create descriptor pool")
    }
}

/// What one slot's set points at
#[derive(Debug, Clone, Copy)]
pub struct SlotBindings {
    pub uniform_buffer: vk::Buffer,
    pub uniform_size: vk::DeviceSize,
    pub texture_view: vk::ImageView,
    pub sampler: vk::Sampler,
}

/// Allocate one set per entry in `slots` and write its bindings
pub fn allocate_slot_sets(
    device: &VulkanDevice,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    slots: &[SlotBindings],
) -> Result<Vec<vk::DescriptorSet>> {
    let layouts = vec![layout; slots.len()];
    let alloc_info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(&layouts);

    let sets = unsafe {
        device.device.allocate_descriptor_sets(&alloc_info)
            .context("Failed to allocate descriptor sets")?
    };

    for (&set, slot) in sets.iter().zip(slots) {
        write_slot_set(&device.device, set, slot);
    }

    Ok(sets)
}

fn write_slot_set(device: &ash::Device, set: vk::DescriptorSet, slot: &SlotBindings) {
    let buffer_info = [vk::DescriptorBufferInfo::builder()
        .buffer(slot.uniform_buffer)
        .offset(0)
        .range(slot.uniform_size)
        .build()];

    let image_info = [vk::DescriptorImageInfo::builder()
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .image_view(slot.texture_view)
        .sampler(slot.sampler)
        .build()];

    let writes = [
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build(),
        vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(1)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build(),
    ];

    unsafe {
        device.update_descriptor_sets(&writes, &[]);
    }
}
