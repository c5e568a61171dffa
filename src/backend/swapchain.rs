// Swapchain - Window presentation
//
// The swapchain bundle owns everything whose size depends on the surface:
// swapchain images + views, the multisampled color target, the depth target
// and one framebuffer per swapchain image. It is rebuilt as a unit.

use anyhow::{Context, Result};
use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;
use std::sync::Arc;
use super::device::QueueFamilies;
use super::image::{create_image, create_image_view, AllocatedImage, ImageDesc};
use super::VulkanDevice;
use crate::scheduler::{AcquireOutcome, PresentOutcome};

/// What the surface supports for a given physical device
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(device: &VulkanDevice) -> Result<Self> {
        let loader = &device.surface_loader;
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(device.physical_device, device.surface)
                    .context("Failed to query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(device.physical_device, device.surface)
                    .context("Failed to query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(device.physical_device, device.surface)
                    .context("Failed to query present modes")?,
            })
        }
    }
}

/// Prefer B8G8R8A8_SRGB + SRGB_NONLINEAR, otherwise the first format offered
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// MAILBOX when available (and wanted), otherwise FIFO, which is always supported
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], prefer_mailbox: bool) -> vk::PresentModeKHR {
    if prefer_mailbox && modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Use the surface's fixed extent if it has one, otherwise clamp the
/// framebuffer size to the surface limits
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, framebuffer: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: framebuffer.width.clamp(
                caps.min_image_extent.width,
                caps.max_image_extent.width,
            ),
            height: framebuffer.height.clamp(
                caps.min_image_extent.height,
                caps.max_image_extent.height,
            ),
        }
    }
}

/// The surface minimum, clamped to the maximum when one is reported
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        caps.max_image_count
    } else {
        image_count
    }
}

/// Concurrent sharing across the distinct families, exclusive when all coincide
pub fn choose_sharing_mode(families: &QueueFamilies) -> (vk::SharingMode, Vec<u32>) {
    if families.is_shared() {
        (vk::SharingMode::EXCLUSIVE, Vec::new())
    } else {
        (vk::SharingMode::CONCURRENT, families.unique())
    }
}

/// Settings that stay fixed across swapchain recreation
#[derive(Debug, Clone, Copy)]
pub struct SwapchainSettings {
    pub surface_format: vk::SurfaceFormatKHR,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub prefer_mailbox: bool,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: SwapchainLoader,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub color: AllocatedImage,
    pub depth: AllocatedImage,
    pub framebuffers: Vec<vk::Framebuffer>,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        settings: &SwapchainSettings,
        render_pass: vk::RenderPass,
        framebuffer_size: vk::Extent2D,
    ) -> Result<Self> {
        let support = SurfaceSupport::query(&device)?;
        let caps = &support.capabilities;

        let present_mode = choose_present_mode(&support.present_modes, settings.prefer_mailbox);
        let extent = choose_extent(caps, framebuffer_size);
        let image_count = choose_image_count(caps);
        let (sharing_mode, family_indices) = choose_sharing_mode(&device.queue_families);

        let swapchain_loader = SwapchainLoader::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(settings.surface_format.format)
            .image_color_space(settings.surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe {
            swapchain_loader.create_swapchain(&create_info, None)
        }
        .context("Failed to create swap chain")?;

        // From here on Drop cleans up whatever was created; null handles are no-ops
        let mut bundle = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            format: settings.surface_format.format,
            extent,
            color: AllocatedImage::default(),
            depth: AllocatedImage::default(),
            framebuffers: Vec::new(),
            device,
        };

        bundle.images = unsafe {
            bundle.swapchain_loader.get_swapchain_images(swapchain)
        }
        .context("Failed to get swap chain images")?;

        for &image in &bundle.images {
            let view = create_image_view(
                &bundle.device,
                image,
                bundle.format,
                vk::ImageAspectFlags::COLOR,
                1,
            )?;
            bundle.image_views.push(view);
        }

        bundle.color = create_image(
            &bundle.device,
            &ImageDesc {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                samples: settings.samples,
                format: bundle.format,
                usage: vk::ImageUsageFlags::TRANSIENT_ATTACHMENT
                    | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )
        .context("Failed to create MSAA color target")?;

        bundle.depth = create_image(
            &bundle.device,
            &ImageDesc {
                width: extent.width,
                height: extent.height,
                mip_levels: 1,
                samples: settings.samples,
                format: settings.depth_format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                aspect: vk::ImageAspectFlags::DEPTH,
            },
        )
        .context("Failed to create depth target")?;

        bundle.framebuffers = bundle.create_framebuffers(render_pass)?;

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            bundle.images.len(),
            bundle.format,
            present_mode
        );

        Ok(bundle)
    }

    /// One framebuffer per swapchain image: {MSAA color, depth, resolve target}
    fn create_framebuffers(&self, render_pass: vk::RenderPass) -> Result<Vec<vk::Framebuffer>> {
        let mut framebuffers = Vec::with_capacity(self.image_views.len());

        for &image_view in &self.image_views {
            let attachments = [self.color.view, self.depth.view, image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            let framebuffer = unsafe {
                self.device.device.create_framebuffer(&framebuffer_info, None)
            };
            match framebuffer {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    for framebuffer in framebuffers {
                        unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
                    }
                    return Err(e).context("Failed to create framebuffer");
                }
            }
        }

        Ok(framebuffers)
    }

    /// Acquire next image for rendering, signaling `semaphore` when it is ready
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swap chain image"),
        }
    }

    /// Present `image_index` on `queue` once `wait_semaphore` is signaled
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader.queue_present(queue, &present_info)
        };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(e).context("Failed to present swap chain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.color.destroy(device);
            self.depth.destroy(device);
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            min_image_count: 2,
            max_image_count: 8,
            ..Default::default()
        }
    }

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    #[test]
    fn prefers_bgra_srgb_nonlinear() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn falls_back_to_first_format() {
        let formats = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(choose_surface_format(&formats).unwrap().format, vk::Format::R8G8B8A8_UNORM);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn mailbox_preferred_fifo_fallback() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(choose_present_mode(&modes, true), vk::PresentModeKHR::MAILBOX);
        assert_eq!(choose_present_mode(&modes, false), vk::PresentModeKHR::FIFO);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO], true),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn fixed_surface_extent_wins() {
        let caps = caps((1200, 800), (1, 1), (4096, 4096));
        let extent = choose_extent(&caps, vk::Extent2D { width: 1600, height: 900 });
        assert_eq!((extent.width, extent.height), (1200, 800));
    }

    #[test]
    fn variable_extent_is_clamped_to_limits() {
        let caps = caps((u32::MAX, u32::MAX), (100, 100), (1920, 1080));
        let extent = choose_extent(&caps, vk::Extent2D { width: 1600, height: 900 });
        assert_eq!((extent.width, extent.height), (1600, 900));

        let extent = choose_extent(&caps, vk::Extent2D { width: 4000, height: 10 });
        assert_eq!((extent.width, extent.height), (1920, 100));
    }

    #[test]
    fn image_count_uses_minimum_clamped_to_maximum() {
        let mut caps = caps((1, 1), (1, 1), (1, 1));
        assert_eq!(choose_image_count(&caps), 2);

        caps.min_image_count = 3;
        caps.max_image_count = 0;
        assert_eq!(choose_image_count(&caps), 3);

        caps.min_image_count = 5;
        caps.max_image_count = 4;
        assert_eq!(choose_image_count(&caps), 4);
    }

    #[test]
    fn sharing_mode_depends_on_distinct_families() {
        let shared = QueueFamilies { graphics: 0, present: 0, transfer: 0 };
        assert_eq!(choose_sharing_mode(&shared), (vk::SharingMode::EXCLUSIVE, vec![]));

        let split = QueueFamilies { graphics: 0, present: 2, transfer: 0 };
        assert_eq!(choose_sharing_mode(&split), (vk::SharingMode::CONCURRENT, vec![0, 2]));
    }
}
