// Frame scheduler
//
// Drives a ring of MAX_FRAMES_IN_FLIGHT frame slots through
// wait -> acquire -> update -> record -> submit -> present, and decides when
// the swapchain has to be rebuilt. All GPU work goes through FrameBackend so
// the protocol itself carries no Vulkan state.
//
// Semaphores and fences are indexed by slot, never by swapchain image.

use anyhow::Result;
use ash::vk;

/// Number of frame slots the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Result of asking the swapchain for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image is usable. `suboptimal` asks for a rebuild after this frame.
    Ready { image_index: u32, suboptimal: bool },
    /// Swapchain no longer matches the surface; nothing was acquired
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// What a call to `draw_frame` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Work was submitted and presented
    Presented,
    /// Acquire reported out-of-date; the swapchain was rebuilt instead
    Skipped,
    /// Framebuffer has zero area; no GPU work was issued
    Suspended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub recreations: u64,
    pub skipped: u64,
}

/// GPU side of the frame loop.
///
/// `slot` is always `< MAX_FRAMES_IN_FLIGHT`. Between `wait_for_slot(s)`
/// returning and `submit(s)`, the slot's command buffer and uniform memory are
/// owned by the host.
pub trait FrameBackend {
    /// Current window framebuffer size in pixels
    fn framebuffer_extent(&self) -> vk::Extent2D;
    /// Extent the live swapchain was built with
    fn swapchain_extent(&self) -> vk::Extent2D;

    /// Block until the slot's last submission has completed
    fn wait_for_slot(&mut self, slot: usize) -> Result<()>;
    /// Acquire the next image, signaling the slot's image-available semaphore
    fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome>;
    fn write_uniforms(&mut self, slot: usize) -> Result<()>;
    /// Unsignal the slot's fence and reset its command buffer
    fn reset_slot(&mut self, slot: usize) -> Result<()>;
    fn record(&mut self, slot: usize, image_index: u32) -> Result<()>;
    /// Submit the slot's command buffer: wait image-available, signal
    /// render-finished and the slot fence
    fn submit(&mut self, slot: usize) -> Result<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome>;

    /// Rebuild the swapchain bundle for the current framebuffer extent.
    /// Called with the device idle and a non-zero extent.
    fn recreate_swapchain(&mut self) -> Result<()>;
    /// Replace the slot's image-available semaphore with a fresh one.
    /// Called with the device idle.
    fn renew_image_available(&mut self, slot: usize) -> Result<()>;
    fn wait_idle(&mut self) -> Result<()>;
}

pub struct FrameScheduler {
    current: usize,
    framebuffer_resized: bool,
    // Rebuild requested while the framebuffer had zero area
    recreate_pending: bool,
    stats: FrameStats,
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self {
            current: 0,
            framebuffer_resized: false,
            recreate_pending: false,
            stats: FrameStats::default(),
        }
    }

    /// Record a window resize; the swapchain is rebuilt after the next present
    pub fn notify_resized(&mut self) {
        self.framebuffer_resized = true;
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Run one frame on the current slot
    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> Result<FrameStatus> {
        if is_zero(backend.framebuffer_extent()) {
            if self.framebuffer_resized {
                self.framebuffer_resized = false;
                self.recreate_pending = true;
            }
            log::debug!("Framebuffer has zero area, frame suspended");
            return Ok(FrameStatus::Suspended);
        }

        if self.recreate_pending {
            self.recreate(backend)?;
        }

        let slot = self.current;
        backend.wait_for_slot(slot)?;

        let (image_index, acquire_suboptimal) = match backend.acquire_image(slot)? {
            AcquireOutcome::Ready { image_index, suboptimal } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                // The fence stays signaled and the slot is retried next call
                log::debug!("Acquire returned OUT_OF_DATE on slot {}", slot);
                backend.wait_idle()?;
                backend.renew_image_available(slot)?;
                self.recreate(backend)?;
                self.stats.skipped += 1;
                return Ok(FrameStatus::Skipped);
            }
        };

        backend.write_uniforms(slot)?;
        backend.reset_slot(slot)?;
        backend.record(slot, image_index)?;
        backend.submit(slot)?;

        let presented = backend.present(slot, image_index)?;
        self.stats.presented += 1;

        let stale = match presented {
            PresentOutcome::Presented => acquire_suboptimal,
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::debug!("Present returned {:?} on slot {}", presented, slot);
                true
            }
        };

        if stale || self.framebuffer_resized {
            self.recreate(backend)?;
        }

        self.current = (self.current + 1) % MAX_FRAMES_IN_FLIGHT;
        Ok(FrameStatus::Presented)
    }

    /// Wait for outstanding GPU work so every slot can be destroyed
    pub fn shutdown<B: FrameBackend>(&mut self, backend: &mut B) -> Result<()> {
        backend.wait_idle()
    }

    fn recreate<B: FrameBackend>(&mut self, backend: &mut B) -> Result<()> {
        if is_zero(backend.framebuffer_extent()) {
            self.recreate_pending = true;
            return Ok(());
        }

        backend.wait_idle()?;
        backend.recreate_swapchain()?;
        // The new swapchain already matches the current window size
        self.recreate_pending = false;
        self.framebuffer_resized = false;
        self.stats.recreations += 1;
        let built = backend.swapchain_extent();
        log::debug!("Swapchain rebuilt at {}x{}", built.width, built.height);
        Ok(())
    }
}

fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::swapchain::choose_extent;
    use std::collections::{HashSet, VecDeque};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Fence {
        Signaled,
        Unsignaled,
        // Submitted, GPU not finished
        Pending,
    }

    /// Scripted stand-in for the Vulkan renderer.
    ///
    /// Submissions only complete when the host waits for them, which is the
    /// worst case for the in-flight bound.
    struct MockBackend {
        window: vk::Extent2D,
        caps: vk::SurfaceCapabilitiesKHR,
        extent: vk::Extent2D,
        image_count: u32,
        next_image: u32,

        fences: [Fence; MAX_FRAMES_IN_FLIGHT],
        // Image-available has a signal queued by a successful acquire
        ia_signaled: [bool; MAX_FRAMES_IN_FLIGHT],
        // Image-available state is unknown after an out-of-date acquire
        ia_suspect: [bool; MAX_FRAMES_IN_FLIGHT],
        rf_signaled: [bool; MAX_FRAMES_IN_FLIGHT],
        recorded: [Option<u32>; MAX_FRAMES_IN_FLIGHT],
        queue: VecDeque<usize>,
        max_in_flight: usize,

        ood_acquires: HashSet<usize>,
        suboptimal_acquires: HashSet<usize>,
        suboptimal_presents: HashSet<usize>,
        ood_presents: HashSet<usize>,
        // Window shrinks to zero while this present is in progress
        collapse_on_present: Option<usize>,

        waits: usize,
        acquires: usize,
        submits: usize,
        presents: usize,
        recreations: usize,
        renewed: Vec<usize>,
    }

    impl MockBackend {
        fn new(width: u32, height: u32) -> Self {
            let caps = vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 0,
                // Window manager lets the application pick the extent
                current_extent: vk::Extent2D { width: u32::MAX, height: u32::MAX },
                min_image_extent: vk::Extent2D { width: 1, height: 1 },
                max_image_extent: vk::Extent2D { width: 4096, height: 4096 },
                ..Default::default()
            };
            let window = vk::Extent2D { width, height };
            Self {
                window,
                extent: choose_extent(&caps, window),
                caps,
                image_count: 3,
                next_image: 0,
                fences: [Fence::Signaled; MAX_FRAMES_IN_FLIGHT],
                ia_signaled: [false; MAX_FRAMES_IN_FLIGHT],
                ia_suspect: [false; MAX_FRAMES_IN_FLIGHT],
                rf_signaled: [false; MAX_FRAMES_IN_FLIGHT],
                recorded: [None; MAX_FRAMES_IN_FLIGHT],
                queue: VecDeque::new(),
                max_in_flight: 0,
                ood_acquires: HashSet::new(),
                suboptimal_acquires: HashSet::new(),
                suboptimal_presents: HashSet::new(),
                ood_presents: HashSet::new(),
                collapse_on_present: None,
                waits: 0,
                acquires: 0,
                submits: 0,
                presents: 0,
                recreations: 0,
                renewed: Vec::new(),
            }
        }

        fn with_images(mut self, count: u32) -> Self {
            self.image_count = count;
            self
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.window = vk::Extent2D { width, height };
        }

        // GPU finishes queued work in submission order
        fn retire_through(&mut self, slot: usize) {
            while let Some(done) = self.queue.pop_front() {
                self.fences[done] = Fence::Signaled;
                if done == slot {
                    break;
                }
            }
        }
    }

    impl FrameBackend for MockBackend {
        fn framebuffer_extent(&self) -> vk::Extent2D {
            self.window
        }

        fn swapchain_extent(&self) -> vk::Extent2D {
            self.extent
        }

        fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
            self.waits += 1;
            match self.fences[slot] {
                Fence::Signaled => {}
                Fence::Pending => self.retire_through(slot),
                Fence::Unsignaled => panic!("deadlock: slot {} waits on a fence nobody will signal", slot),
            }
            Ok(())
        }

        fn acquire_image(&mut self, slot: usize) -> Result<AcquireOutcome> {
            assert!(!self.ia_suspect[slot], "image-available reused after out-of-date acquire");
            assert!(!self.ia_signaled[slot], "image-available acquired twice without a wait");
            let n = self.acquires;
            self.acquires += 1;

            if self.ood_acquires.contains(&n) {
                self.ia_suspect[slot] = true;
                return Ok(AcquireOutcome::OutOfDate);
            }

            self.ia_signaled[slot] = true;
            let image_index = self.next_image;
            self.next_image = (self.next_image + 1) % self.image_count;
            Ok(AcquireOutcome::Ready {
                image_index,
                suboptimal: self.suboptimal_acquires.contains(&n),
            })
        }

        fn write_uniforms(&mut self, slot: usize) -> Result<()> {
            assert_eq!(self.fences[slot], Fence::Signaled, "uniforms written while GPU may read them");
            Ok(())
        }

        fn reset_slot(&mut self, slot: usize) -> Result<()> {
            assert_eq!(self.fences[slot], Fence::Signaled, "command buffer reset while in flight");
            self.fences[slot] = Fence::Unsignaled;
            self.recorded[slot] = None;
            Ok(())
        }

        fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
            assert_eq!(self.fences[slot], Fence::Unsignaled);
            assert!(image_index < self.image_count, "framebuffer index out of range");
            self.recorded[slot] = Some(image_index);
            Ok(())
        }

        fn submit(&mut self, slot: usize) -> Result<()> {
            assert!(self.recorded[slot].is_some(), "submitted an unrecorded command buffer");
            assert!(self.ia_signaled[slot], "submit waits on an image-available that will never fire");
            self.ia_signaled[slot] = false;
            self.rf_signaled[slot] = true;
            self.fences[slot] = Fence::Pending;
            self.queue.push_back(slot);
            self.max_in_flight = self.max_in_flight.max(self.queue.len());
            assert!(self.queue.len() <= MAX_FRAMES_IN_FLIGHT, "too many frames in flight");
            self.submits += 1;
            Ok(())
        }

        fn present(&mut self, slot: usize, image_index: u32) -> Result<PresentOutcome> {
            assert!(self.rf_signaled[slot], "present without render-finished");
            assert_eq!(self.recorded[slot], Some(image_index));
            self.rf_signaled[slot] = false;
            let n = self.presents;
            self.presents += 1;

            if self.collapse_on_present == Some(n) {
                self.window = vk::Extent2D { width: 0, height: 0 };
            }

            if self.ood_presents.contains(&n) {
                Ok(PresentOutcome::OutOfDate)
            } else if self.suboptimal_presents.contains(&n) {
                Ok(PresentOutcome::Suboptimal)
            } else {
                Ok(PresentOutcome::Presented)
            }
        }

        fn recreate_swapchain(&mut self) -> Result<()> {
            assert!(self.queue.is_empty(), "swapchain rebuilt while work is in flight");
            assert!(!is_zero(self.window), "swapchain rebuilt with zero extent");
            self.extent = choose_extent(&self.caps, self.window);
            self.next_image = 0;
            self.recreations += 1;
            Ok(())
        }

        fn renew_image_available(&mut self, slot: usize) -> Result<()> {
            assert!(self.queue.is_empty(), "semaphore destroyed while work is in flight");
            self.ia_suspect[slot] = false;
            self.ia_signaled[slot] = false;
            self.renewed.push(slot);
            Ok(())
        }

        fn wait_idle(&mut self) -> Result<()> {
            while let Some(done) = self.queue.pop_front() {
                self.fences[done] = Fence::Signaled;
            }
            Ok(())
        }
    }

    fn run(scheduler: &mut FrameScheduler, backend: &mut MockBackend, frames: usize) -> Vec<FrameStatus> {
        (0..frames)
            .map(|_| scheduler.draw_frame(backend).unwrap())
            .collect()
    }

    #[test]
    fn steady_state_cycles_slots_without_recreation() {
        let mut backend = MockBackend::new(1200, 800);
        let mut scheduler = FrameScheduler::new();

        let statuses = run(&mut scheduler, &mut backend, 120);

        assert!(statuses.iter().all(|&s| s == FrameStatus::Presented));
        assert_eq!(backend.presents, 120);
        assert_eq!(backend.recreations, 0);
        assert_eq!(scheduler.current_slot(), 120 % MAX_FRAMES_IN_FLIGHT);
        assert_eq!(backend.max_in_flight, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(
            scheduler.stats(),
            FrameStats { presented: 120, recreations: 0, skipped: 0 }
        );
    }

    #[test]
    fn more_or_fewer_images_than_slots() {
        for images in [1, 2, 3, 5] {
            let mut backend = MockBackend::new(640, 480).with_images(images);
            let mut scheduler = FrameScheduler::new();
            run(&mut scheduler, &mut backend, 25);
            assert_eq!(backend.presents, 25);
            assert!(backend.max_in_flight <= MAX_FRAMES_IN_FLIGHT);
        }
    }

    #[test]
    fn resize_rebuilds_at_new_extent() {
        let mut backend = MockBackend::new(1200, 800);
        let mut scheduler = FrameScheduler::new();
        run(&mut scheduler, &mut backend, 30);

        backend.resize(1600, 900);
        scheduler.notify_resized();
        run(&mut scheduler, &mut backend, 2);

        assert_eq!(backend.recreations, 1);
        assert_eq!(backend.swapchain_extent(), vk::Extent2D { width: 1600, height: 900 });

        let statuses = run(&mut scheduler, &mut backend, 10);
        assert!(statuses.iter().all(|&s| s == FrameStatus::Presented));
        assert_eq!(backend.presents, 42);
    }

    #[test]
    fn rebuilt_extent_is_clamped_to_surface_limits() {
        let mut backend = MockBackend::new(1200, 800);
        backend.caps.max_image_extent = vk::Extent2D { width: 1920, height: 1080 };
        let mut scheduler = FrameScheduler::new();
        run(&mut scheduler, &mut backend, 3);

        backend.resize(2560, 1440);
        scheduler.notify_resized();
        run(&mut scheduler, &mut backend, 1);

        assert_eq!(backend.swapchain_extent(), vk::Extent2D { width: 1920, height: 1080 });
    }

    #[test]
    fn minimized_window_submits_nothing_until_restored() {
        let mut backend = MockBackend::new(1200, 800);
        let mut scheduler = FrameScheduler::new();
        run(&mut scheduler, &mut backend, 10);

        backend.resize(0, 0);
        scheduler.notify_resized();
        let (waits, submits) = (backend.waits, backend.submits);

        let statuses = run(&mut scheduler, &mut backend, 5);
        assert!(statuses.iter().all(|&s| s == FrameStatus::Suspended));
        assert_eq!(backend.waits, waits);
        assert_eq!(backend.submits, submits);
        assert_eq!(backend.recreations, 0);

        backend.resize(800, 600);
        scheduler.notify_resized();
        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.recreations, 1);
        assert_eq!(backend.swapchain_extent(), vk::Extent2D { width: 800, height: 600 });
    }

    #[test]
    fn rebuild_deferred_while_minimized_runs_on_restore() {
        let mut backend = MockBackend::new(1200, 800);
        backend.suboptimal_presents.insert(2);
        backend.collapse_on_present = Some(2);
        let mut scheduler = FrameScheduler::new();

        run(&mut scheduler, &mut backend, 3);
        assert_eq!(backend.recreations, 0);
        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Suspended);

        // Restored without a resize event; the deferred rebuild still happens
        backend.resize(1200, 800);
        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.recreations, 1);
    }

    #[test]
    fn out_of_date_acquire_skips_frame_and_recovers() {
        let mut backend = MockBackend::new(1200, 800);
        backend.ood_acquires.insert(5);
        let mut scheduler = FrameScheduler::new();

        let statuses = run(&mut scheduler, &mut backend, 5);
        assert!(statuses.iter().all(|&s| s == FrameStatus::Presented));
        let slot = scheduler.current_slot();

        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Skipped);
        assert_eq!(backend.submits, 5);
        assert_eq!(backend.presents, 5);
        assert_eq!(backend.recreations, 1);
        assert_eq!(backend.renewed, vec![slot]);
        assert_eq!(scheduler.current_slot(), slot);

        let statuses = run(&mut scheduler, &mut backend, 6);
        assert!(statuses.iter().all(|&s| s == FrameStatus::Presented));
        assert_eq!(backend.presents, 11);
        assert_eq!(scheduler.stats().skipped, 1);
    }

    #[test]
    fn suboptimal_present_rebuilds_before_next_frame() {
        let mut backend = MockBackend::new(1200, 800);
        backend.suboptimal_presents.insert(7);
        let mut scheduler = FrameScheduler::new();

        run(&mut scheduler, &mut backend, 7);
        assert_eq!(backend.recreations, 0);

        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.presents, 8);
        assert_eq!(backend.recreations, 1);

        run(&mut scheduler, &mut backend, 4);
        assert_eq!(backend.recreations, 1);
        assert_eq!(backend.presents, 12);
    }

    #[test]
    fn suboptimal_acquire_still_presents_then_rebuilds() {
        let mut backend = MockBackend::new(1200, 800);
        backend.suboptimal_acquires.insert(0);
        let mut scheduler = FrameScheduler::new();

        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.presents, 1);
        assert_eq!(backend.recreations, 1);
        assert_eq!(scheduler.current_slot(), 1);

        run(&mut scheduler, &mut backend, 4);
        assert_eq!(backend.recreations, 1);
    }

    #[test]
    fn out_of_date_present_rebuilds_once() {
        let mut backend = MockBackend::new(1200, 800);
        backend.ood_presents.insert(0);
        let mut scheduler = FrameScheduler::new();

        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.presents, 1);
        assert_eq!(backend.recreations, 1);
        assert_eq!(scheduler.current_slot(), 1);
        assert_eq!(scheduler.stats().presented, 1);

        run(&mut scheduler, &mut backend, 4);
        assert_eq!(backend.recreations, 1);
    }

    #[test]
    fn out_of_date_acquire_during_resize_rebuilds_once() {
        let mut backend = MockBackend::new(1200, 800);
        backend.ood_acquires.insert(3);
        let mut scheduler = FrameScheduler::new();
        run(&mut scheduler, &mut backend, 3);
        let slot = scheduler.current_slot();

        backend.resize(1600, 900);
        scheduler.notify_resized();
        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Skipped);
        assert_eq!(backend.recreations, 1);
        assert_eq!(scheduler.current_slot(), slot);
        assert_eq!(backend.swapchain_extent(), vk::Extent2D { width: 1600, height: 900 });

        // The rebuild already covered the resize
        assert_eq!(scheduler.draw_frame(&mut backend).unwrap(), FrameStatus::Presented);
        assert_eq!(backend.recreations, 1);
        assert_eq!(scheduler.current_slot(), (slot + 1) % MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn shutdown_leaves_every_slot_idle() {
        let mut backend = MockBackend::new(1200, 800);
        let mut scheduler = FrameScheduler::new();
        run(&mut scheduler, &mut backend, 10);
        assert!(!backend.queue.is_empty());

        scheduler.shutdown(&mut backend).unwrap();

        assert_eq!(scheduler.stats().presented, 10);
        assert!(backend.queue.is_empty());
        assert!(backend.fences.iter().all(|&f| f == Fence::Signaled));
        assert!(backend.ia_signaled.iter().all(|&s| !s));
        assert!(backend.rf_signaled.iter().all(|&s| !s));
    }
}
