// =============================================================================
// VIKING VIEWER - textured, multisampled model viewer on raw Vulkan
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (App)                                         │
// │    └── FrameScheduler (slot ring, recreation decisions)         │
// │          └── Renderer (FrameBackend over Vulkan)                │
// │                └── backend: device, swapchain, pipeline, ...    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait on the slot's in-flight fence
// 2. Acquire swapchain image (signals the slot's image-available)
// 3. Write the slot's uniform buffer
// 4. Record and submit the slot's command buffer
// 5. Present, rebuild the swapchain if it went stale
// 6. Advance to the next slot
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod renderer;
mod scheduler;
mod uniform;

use anyhow::Result;
use config::Config;
use renderer::Renderer;
use scheduler::{FrameScheduler, FrameStatus};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();

    let config = Config::load();
    log::info!("Starting {}", config.window.title);
    log::info!("Window: {}x{}", config.window.width, config.window.height);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Window plus renderer.
///
/// Field order matters for Drop: the renderer (and with it the device) must
/// be gone before the window it presents to.
struct App {
    config: Config,
    renderer: Option<Renderer>,
    scheduler: FrameScheduler,
    window: Option<Arc<Window>>,

    minimized: bool,
    fatal: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            renderer: None,
            scheduler: FrameScheduler::new(),
            window: None,
            minimized: false,
            fatal: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Log, remember the error for `main`, and leave the event loop
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.fatal = Some(error);
        self.renderer = None;
        event_loop.exit();
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.as_mut() {
            if let Err(e) = self.scheduler.shutdown(renderer) {
                log::error!("{:#}", e);
            }
        }

        let stats = self.scheduler.stats();
        log::info!(
            "Frames presented: {}, swapchain recreations: {}, skipped: {}",
            stats.presented,
            stats.recreations,
            stats.skipped
        );
        // Tear down GPU state while the window is still alive
        self.renderer = None;
        event_loop.exit();
    }

    fn draw(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match self.scheduler.draw_frame(renderer) {
            Ok(FrameStatus::Presented) => self.update_fps(),
            Ok(FrameStatus::Skipped) => {
                log::debug!("Frame skipped, retrying slot {}", self.scheduler.current_slot());
            }
            Ok(FrameStatus::Suspended) => self.minimized = true,
            Err(e) => self.fail(event_loop, e),
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms)",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };
        self.window = Some(window.clone());

        match Renderer::new(window, &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => self.fail(event_loop, e.context("Failed to initialize Vulkan")),
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.scheduler.notify_resized();

                let was_minimized = self.minimized;
                self.minimized = size.width == 0 || size.height == 0;
                if was_minimized && !self.minimized {
                    if let Some(ref window) = self.window {
                        window.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => self.draw(event_loop),

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && event.physical_key == PhysicalKey::Code(KeyCode::Escape) {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    /// Keep redrawing continuously, except while minimized: then the loop
    /// sleeps until a resize brings the window back.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.minimized || self.renderer.is_none() {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
