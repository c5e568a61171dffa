// Vulkan renderer
//
// Owns every device object for the viewer and implements FrameBackend so the
// scheduler can drive it. Construction fills the struct in place; a failure
// part way through drops what was built so far (null handles are skipped by
// vkDestroy*).

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use winit::window::Window;

use crate::assets::{self, Mesh, TextureData};
use crate::backend::buffer::{self, AllocatedBuffer, MappedBuffer};
use crate::backend::commands::{self, OneShotCommands};
use crate::backend::descriptor::{self, SlotBindings};
use crate::backend::image::{self, AllocatedImage, ImageDesc};
use crate::backend::pipeline::{self, GraphicsPipeline};
use crate::backend::shader;
use crate::backend::swapchain::{self, SurfaceSupport, SwapchainSettings};
use crate::backend::sync::FrameSync;
use crate::backend::{Swapchain, VulkanDevice};
use crate::config::Config;
use crate::scheduler::{AcquireOutcome, FrameBackend, PresentOutcome, MAX_FRAMES_IN_FLIGHT};
use crate::uniform::UniformBlock;

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

/// Everything one frame slot owns
struct FrameSlot {
    sync: FrameSync,
    command_buffer: vk::CommandBuffer,
    uniforms: MappedBuffer,
    descriptor_set: vk::DescriptorSet,
}

struct Texture {
    image: AllocatedImage,
    sampler: vk::Sampler,
    mip_levels: u32,
}

pub struct Renderer {
    window: Arc<Window>,
    device: Arc<VulkanDevice>,
    swapchain: Option<Swapchain>,
    settings: SwapchainSettings,

    render_pass: vk::RenderPass,
    descriptor_set_layout: vk::DescriptorSetLayout,
    pipeline: GraphicsPipeline,
    descriptor_pool: vk::DescriptorPool,

    vertex_buffer: AllocatedBuffer,
    index_buffer: AllocatedBuffer,
    index_count: u32,
    texture: Texture,

    frames: Vec<FrameSlot>,
    command_pool: vk::CommandPool,
    graphics_commands: OneShotCommands,
    transfer_commands: OneShotCommands,

    clear_color: [f32; 4],
    start: Instant,
}

impl Renderer {
    pub fn new(window: Arc<Window>, config: &Config) -> Result<Self> {
        let device = VulkanDevice::new(
            &config.window.title,
            window.raw_display_handle(),
            window.raw_window_handle(),
            config.validation_enabled(),
            config.msaa_cap(),
        )?;

        let support = SurfaceSupport::query(&device)?;
        let surface_format = swapchain::choose_surface_format(&support.formats)
            .context("Surface reports no formats")?;
        let depth_format = image::find_depth_format(&device)?;
        log::info!(
            "Surface format {:?}, depth format {:?} (stencil: {})",
            surface_format.format,
            depth_format,
            image::has_stencil_component(depth_format)
        );

        let settings = SwapchainSettings {
            surface_format,
            depth_format,
            samples: device.msaa_samples,
            prefer_mailbox: config.graphics.prefer_mailbox,
        };

        let mut renderer = Self {
            window,
            device,
            swapchain: None,
            settings,
            render_pass: vk::RenderPass::null(),
            descriptor_set_layout: vk::DescriptorSetLayout::null(),
            pipeline: GraphicsPipeline::default(),
            descriptor_pool: vk::DescriptorPool::null(),
            vertex_buffer: AllocatedBuffer::default(),
            index_buffer: AllocatedBuffer::default(),
            index_count: 0,
            texture: Texture {
                image: AllocatedImage::default(),
                sampler: vk::Sampler::null(),
                mip_levels: 1,
            },
            frames: Vec::with_capacity(MAX_FRAMES_IN_FLIGHT),
            command_pool: vk::CommandPool::null(),
            graphics_commands: OneShotCommands::null(),
            transfer_commands: OneShotCommands::null(),
            clear_color: config.graphics.clear_color,
            start: Instant::now(),
        };

        renderer.init(config)?;
        Ok(renderer)
    }

    fn init(&mut self, config: &Config) -> Result<()> {
        let device = self.device.clone();
        let families = device.queue_families;

        self.render_pass = pipeline::create_render_pass(
            &device,
            self.settings.surface_format.format,
            self.settings.depth_format,
            self.settings.samples,
        )?;
        self.descriptor_set_layout = pipeline::create_descriptor_set_layout(&device)?;
        self.pipeline = self.create_pipeline(config)?;

        self.command_pool = commands::create_frame_command_pool(&device, families.graphics)?;
        self.graphics_commands = OneShotCommands::new(&device, families.graphics, device.graphics_queue)?;
        self.transfer_commands = OneShotCommands::new(&device, families.transfer, device.transfer_queue)?;

        let mesh = assets::load_mesh(Path::new(&config.assets.model))?;
        self.upload_mesh(&mesh)?;

        let texture = assets::load_texture(Path::new(&config.assets.texture))?;
        self.upload_texture(&texture)?;
        self.texture.sampler = self.create_sampler()?;

        self.create_frames()?;

        self.swapchain = Some(Swapchain::new(
            device,
            &self.settings,
            self.render_pass,
            self.framebuffer_extent(),
        )?);

        log::info!("Renderer ready ({} frames in flight)", MAX_FRAMES_IN_FLIGHT);
        Ok(())
    }

    fn create_pipeline(&self, config: &Config) -> Result<GraphicsPipeline> {
        let vert = shader::load_shader_module(&self.device, Path::new(&config.assets.vertex_shader))?;
        let frag = match shader::load_shader_module(&self.device, Path::new(&config.assets.fragment_shader)) {
            Ok(frag) => frag,
            Err(e) => {
                unsafe { self.device.device.destroy_shader_module(vert, None) };
                return Err(e);
            }
        };

        let pipeline = pipeline::create_graphics_pipeline(
            &self.device,
            self.render_pass,
            self.descriptor_set_layout,
            self.settings.samples,
            vert,
            frag,
        );

        // Modules are only needed while the pipeline is compiled
        unsafe {
            self.device.device.destroy_shader_module(vert, None);
            self.device.device.destroy_shader_module(frag, None);
        }

        pipeline
    }

    fn upload_mesh(&mut self, mesh: &Mesh) -> Result<()> {
        anyhow::ensure!(!mesh.indices.is_empty(), "Model contains no triangles");

        self.vertex_buffer = buffer::create_device_local_buffer(
            &self.device,
            &self.transfer_commands,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(&mesh.vertices),
        )
        .context("Failed to upload vertex buffer")?;

        self.index_buffer = buffer::create_device_local_buffer(
            &self.device,
            &self.transfer_commands,
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(&mesh.indices),
        )
        .context("Failed to upload index buffer")?;

        self.index_count = mesh.indices.len() as u32;
        Ok(())
    }

    /// Upload mip 0 through a staging buffer, then blit the rest of the chain
    fn upload_texture(&mut self, texture: &TextureData) -> Result<()> {
        image::check_linear_blit_support(&self.device, TEXTURE_FORMAT)?;

        let mip_levels = texture.mip_levels();
        let (width, height) = (texture.width, texture.height);

        self.texture.image = image::create_image(
            &self.device,
            &ImageDesc {
                width,
                height,
                mip_levels,
                samples: vk::SampleCountFlags::TYPE_1,
                format: TEXTURE_FORMAT,
                usage: vk::ImageUsageFlags::TRANSFER_SRC
                    | vk::ImageUsageFlags::TRANSFER_DST
                    | vk::ImageUsageFlags::SAMPLED,
                aspect: vk::ImageAspectFlags::COLOR,
            },
        )
        .context("Failed to create texture image")?;
        self.texture.mip_levels = mip_levels;

        let staging = buffer::create_staging_buffer(&self.device, &texture.pixels)?;
        let target = self.texture.image.image;

        let result = self.graphics_commands.run(&self.device, |d, cmd| {
            image::record_transition(
                d,
                cmd,
                target,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                0,
                mip_levels,
            )?;
            image::record_copy_buffer_to_image(d, cmd, staging.buffer, target, width, height);
            image::record_generate_mipmaps(d, cmd, target, width, height, mip_levels)
        });

        staging.destroy(&self.device.device);
        result.context("Failed to upload texture")?;

        log::info!("Texture uploaded: {}x{}, {} mip levels", width, height, mip_levels);
        Ok(())
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(true)
            .max_anisotropy(self.device.max_anisotropy())
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(self.texture.mip_levels as f32)
            .mip_lod_bias(0.0);

        unsafe {
            self.device.device.create_sampler(&sampler_info, None)
                .context("Failed to create texture sampler")
        }
    }

    fn create_frames(&mut self) -> Result<()> {
        let command_buffers = commands::allocate_command_buffers(
            &self.device,
            self.command_pool,
            MAX_FRAMES_IN_FLIGHT as u32,
        )?;

        for command_buffer in command_buffers {
            let sync = FrameSync::new(&self.device)?;
            let uniforms = match MappedBuffer::new(&self.device, UniformBlock::SIZE) {
                Ok(uniforms) => uniforms,
                Err(e) => {
                    sync.destroy(&self.device.device);
                    return Err(e);
                }
            };
            self.frames.push(FrameSlot {
                sync,
                command_buffer,
                uniforms,
                descriptor_set: vk::DescriptorSet::null(),
            });
        }

        self.descriptor_pool = descriptor::create_descriptor_pool(&self.device, MAX_FRAMES_IN_FLIGHT as u32)?;

        let bindings: Vec<SlotBindings> = self
            .frames
            .iter()
            .map(|frame| SlotBindings {
                uniform_buffer: frame.uniforms.buffer.buffer,
                uniform_size: UniformBlock::SIZE,
                texture_view: self.texture.image.view,
                sampler: self.texture.sampler,
            })
            .collect();

        let sets = descriptor::allocate_slot_sets(
            &self.device,
            self.descriptor_pool,
            self.descriptor_set_layout,
            &bindings,
        )?;
        for (frame, set) in self.frames.iter_mut().zip(sets) {
            frame.descriptor_set = set;
        }
        Ok(())
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }

    fn record_commands(&self, cmd: vk::CommandBuffer, frame: &FrameSlot, image_index: u32) -> Result<()> {
        let device = &self.device.device;
        let swapchain = self.swapchain()?;
        let framebuffer = *swapchain
            .framebuffers
            .get(image_index as usize)
            .context("Swapchain image index out of range")?;
        let extent = swapchain.extent;

        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe {
            device.begin_command_buffer(cmd, &begin_info)
                .context("Failed to begin command buffer")?;
        }

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue { float32: self.clear_color },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth: 1.0, stencil: 0 },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[scissor]);
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[frame.descriptor_set],
                &[],
            );
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
            device.cmd_end_render_pass(cmd);

            device.end_command_buffer(cmd)
                .context("Failed to record command buffer")?;
        }
        Ok(())
    }
}

impl FrameBackend for Renderer {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn swapchain_extent(&self) -> vk::Extent2D {
        self.swapchain.as_ref().map(|s| s.extent).unwrap_or_default()
    }

    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fence = self.frames[slot].sync.in_flight_fence;
        unsafe {
            self.device.device.wait_for_fences(&[fence], true, u64::MAX)
                .context("Failed to wait for in-flight fence")
        }
    }

    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
        self.swapchain()?.acquire_next_image(self.frames[slot].sync.image_available)
    }

    fn write_uniforms(&mut self, slot: usize) -> Result<()> {
        let ubo = UniformBlock::spinning(self.start.elapsed(), self.swapchain_extent());
        self.frames[slot].uniforms.write(ubo.as_bytes())
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let frame = &self.frames[slot];
        unsafe {
            self.device.device.reset_fences(&[frame.sync.in_flight_fence])
                .context("Failed to reset in-flight fence")?;
            self.device.device
                .reset_command_buffer(frame.command_buffer, vk::CommandBufferResetFlags::empty())
                .context("Failed to reset command buffer")?;
        }
        Ok(())
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let frame = &self.frames[slot];
        self.record_commands(frame.command_buffer, frame, image_index)
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = &self.frames[slot];

        let wait_semaphores = [frame.sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.sync.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device
                .queue_submit(
                    self.device.graphics_queue,
                    &[submit_info.build()],
                    frame.sync.in_flight_fence,
                )
                .context("Failed to submit draw command buffer")
        }
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
        self.swapchain()?.present(
            self.device.present_queue,
            image_index,
            self.frames[slot].sync.render_finished,
        )
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        // The surface only allows one live swapchain, so the old bundle goes first
        self.swapchain = None;
        self.swapchain = Some(Swapchain::new(
            self.device.clone(),
            &self.settings,
            self.render_pass,
            self.framebuffer_extent(),
        )?);
        Ok(())
    }

    fn renew_image_available(&mut self, slot: usize) -> Result<()> {
        self.frames[slot].sync.renew_image_available(&self.device)
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Destroying renderer resources...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("{:#}", e);
        }

        self.swapchain = None;

        let device = &self.device.device;
        self.vertex_buffer.destroy(device);
        self.index_buffer.destroy(device);
        self.pipeline.destroy(device);

        unsafe {
            device.destroy_render_pass(self.render_pass, None);
        }

        for frame in &self.frames {
            frame.sync.destroy(device);
            frame.uniforms.destroy(device);
        }

        unsafe {
            device.destroy_descriptor_pool(self.descriptor_pool, None);
            device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
            device.destroy_sampler(self.texture.sampler, None);
        }
        self.texture.image.destroy(device);

        unsafe {
            device.destroy_command_pool(self.command_pool, None);
        }
        self.graphics_commands.destroy(device);
        self.transfer_commands.destroy(device);
        // The device itself goes when the last Arc drops
    }
}
