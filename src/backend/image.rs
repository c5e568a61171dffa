// Image utilities: creation, views, layout transitions, mip chains
//
// Layout transitions only cover the pairs the renderer actually needs;
// anything else is a programming error and reported as such.

use anyhow::{Context, Result};
use ash::vk;
use super::buffer::find_memory_type;
use super::VulkanDevice;

/// An image, its dedicated memory and a view over it
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocatedImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
}

impl AllocatedImage {
    /// Destroys view, then image, then memory
    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Parameters for a 2D image
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub samples: vk::SampleCountFlags,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

/// Create a device-local, optimally tiled 2D image with a view covering all mips
pub fn create_image(device: &VulkanDevice, desc: &ImageDesc) -> Result<AllocatedImage> {
    let image_info = vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .extent(vk::Extent3D {
            width: desc.width,
            height: desc.height,
            depth: 1,
        })
        .mip_levels(desc.mip_levels)
        .array_layers(1)
        .format(desc.format)
        .tiling(vk::ImageTiling::OPTIMAL)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .usage(desc.usage)
        .samples(desc.samples)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let image = unsafe {
        device.device.create_image(&image_info, None)
            .context("Failed to create image")?
    };

    let mem_requirements = unsafe {
        device.device.get_image_memory_requirements(image)
    };

    let memory = find_memory_type(
        &device.memory_properties,
        mem_requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .and_then(|memory_type_index| {
        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);
        unsafe {
            device.device.allocate_memory(&alloc_info, None)
                .context("Failed to allocate image memory")
        }
    });
    let memory = match memory {
        Ok(memory) => memory,
        Err(e) => {
            unsafe { device.device.destroy_image(image, None) };
            return Err(e);
        }
    };

    let view = unsafe { device.device.bind_image_memory(image, memory, 0) }
        .context("Failed to bind image memory")
        .and_then(|()| create_image_view(device, image, desc.format, desc.aspect, desc.mip_levels));

    match view {
        Ok(view) => Ok(AllocatedImage { image, memory, view }),
        Err(e) => {
            unsafe {
                device.device.destroy_image(image, None);
                device.device.free_memory(memory, None);
            }
            Err(e)
        }
    }
}

/// Create a 2D view over `mip_levels` levels of `image`
pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe {
        device.device.create_image_view(&view_info, None)
            .context("Failed to create image view")
    }
}

/// Access and stage masks for a layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionMasks {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Barrier masks for the supported (old, new) layout pairs
pub fn transition_masks(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<TransitionMasks> {
    match (old, new) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => Ok(TransitionMasks {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL) => {
            Ok(TransitionMasks {
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_access: vk::AccessFlags::TRANSFER_READ,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                dst_stage: vk::PipelineStageFlags::TRANSFER,
            })
        }
        (
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ) => Ok(TransitionMasks {
            src_access: if old == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                vk::AccessFlags::TRANSFER_READ
            } else {
                vk::AccessFlags::TRANSFER_WRITE
            },
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }),
        _ => anyhow::bail!("Unsupported layout transition: {:?} -> {:?}", old, new),
    }
}

/// Record a layout transition over `level_count` mips starting at `base_level`
pub fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    base_level: u32,
    level_count: u32,
) -> Result<()> {
    let masks = transition_masks(old, new)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: base_level,
            level_count,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
    Ok(())
}

/// Copy a tightly packed buffer into mip 0 of an image in TRANSFER_DST layout
pub fn record_copy_buffer_to_image(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    buffer: vk::Buffer,
    image: vk::Image,
    width: u32,
    height: u32,
) {
    let region = vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
        .image_extent(vk::Extent3D { width, height, depth: 1 })
        .build();

    unsafe {
        device.cmd_copy_buffer_to_image(
            cmd,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );
    }
}

/// Number of levels in a full mip chain: floor(log2(max(w, h))) + 1
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    let largest = width.max(height).max(1);
    u32::BITS - largest.leading_zeros()
}

/// One command of the mip generation sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipStep {
    Transition {
        level: u32,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },
    Blit {
        src_level: u32,
        src_extent: (i32, i32),
        dst_extent: (i32, i32),
    },
}

/// Plan the barrier/blit sequence that fills levels 1..N from level 0.
///
/// Expects every level in TRANSFER_DST; leaves every level in SHADER_READ.
pub fn plan_mip_chain(width: u32, height: u32, mip_levels: u32) -> Vec<MipStep> {
    let mut steps = Vec::with_capacity(mip_levels as usize * 3);
    let mut mip_width = width as i32;
    let mut mip_height = height as i32;

    for level in 1..mip_levels {
        let next = ((mip_width / 2).max(1), (mip_height / 2).max(1));

        steps.push(MipStep::Transition {
            level: level - 1,
            old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        });
        steps.push(MipStep::Blit {
            src_level: level - 1,
            src_extent: (mip_width, mip_height),
            dst_extent: next,
        });
        steps.push(MipStep::Transition {
            level: level - 1,
            old: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });

        (mip_width, mip_height) = next;
    }

    steps.push(MipStep::Transition {
        level: mip_levels.saturating_sub(1),
        old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    });

    steps
}

/// Fail unless `format` supports linear filtering for blits under optimal tiling
pub fn check_linear_blit_support(device: &VulkanDevice, format: vk::Format) -> Result<()> {
    let props = unsafe {
        device.instance.get_physical_device_format_properties(device.physical_device, format)
    };

    if !props
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR)
    {
        anyhow::bail!("Texture image format {:?} does not support linear blitting", format);
    }
    Ok(())
}

/// Record mipmap generation for an image whose levels are all in TRANSFER_DST
pub fn record_generate_mipmaps(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    width: u32,
    height: u32,
    mip_levels: u32,
) -> Result<()> {
    for step in plan_mip_chain(width, height, mip_levels) {
        match step {
            MipStep::Transition { level, old, new } => {
                record_transition(device, cmd, image, old, new, level, 1)?;
            }
            MipStep::Blit { src_level, src_extent, dst_extent } => {
                let layers = |mip_level| vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                let blit = vk::ImageBlit::builder()
                    .src_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D { x: src_extent.0, y: src_extent.1, z: 1 },
                    ])
                    .src_subresource(layers(src_level))
                    .dst_offsets([
                        vk::Offset3D { x: 0, y: 0, z: 0 },
                        vk::Offset3D { x: dst_extent.0, y: dst_extent.1, z: 1 },
                    ])
                    .dst_subresource(layers(src_level + 1))
                    .build();

                unsafe {
                    device.cmd_blit_image(
                        cmd,
                        image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[blit],
                        vk::Filter::LINEAR,
                    );
                }
            }
        }
    }
    Ok(())
}

/// First candidate whose tiling features contain `features`
pub fn find_supported_format(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    format_properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        let props = format_properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Pick a depth format usable as an optimally tiled depth-stencil attachment
pub fn find_depth_format(device: &VulkanDevice) -> Result<vk::Format> {
    find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |format| unsafe {
            device.instance.get_physical_device_format_properties(device.physical_device, format)
        },
    )
    .context("Failed to find supported depth format")
}

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(format, vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT)
}
