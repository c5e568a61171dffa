// Per-frame uniform block
//
// Three column-major mat4s, which already satisfy std140 alignment.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::time::Duration;

/// Model spin rate in degrees per second
pub const SPIN_DEGREES_PER_SECOND: f32 = 90.0;

/// Matches `GlobalUBO` in `shaders/test.vert`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBlock {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBlock {
    pub const SIZE: vk::DeviceSize = std::mem::size_of::<UniformBlock>() as vk::DeviceSize;

    /// Model spinning about +Z, seen from (2, 2, 2) with +Z up
    pub fn spinning(elapsed: Duration, extent: vk::Extent2D) -> Self {
        let angle = (elapsed.as_secs_f32() * SPIN_DEGREES_PER_SECOND).to_radians();
        let model = Mat4::from_rotation_z(angle);

        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);

        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    const EXTENT: vk::Extent2D = vk::Extent2D { width: 1200, height: 800 };

    #[test]
    fn block_is_three_packed_matrices() {
        assert_eq!(UniformBlock::SIZE, 3 * 64);
    }

    #[test]
    fn model_turns_a_quarter_per_second() {
        let ubo = UniformBlock::spinning(Duration::from_secs(1), EXTENT);
        let x = ubo.model * Vec4::X;
        assert!((x - Vec4::Y).abs().max_element() < 1e-5);
    }

    #[test]
    fn origin_projects_to_screen_center() {
        let ubo = UniformBlock::spinning(Duration::ZERO, EXTENT);
        let clip = ubo.proj * ubo.view * ubo.model * Vec4::W;
        let ndc = clip / clip.w;
        assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5);
        assert!(ndc.z > 0.0 && ndc.z < 1.0);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let ubo = UniformBlock::spinning(Duration::ZERO, EXTENT);
        assert!(ubo.proj.y_axis.y < 0.0);
        assert!(ubo.proj.x_axis.x > 0.0);
    }

    #[test]
    fn aspect_follows_extent() {
        let wide = UniformBlock::spinning(Duration::ZERO, EXTENT);
        let square = UniformBlock::spinning(Duration::ZERO, vk::Extent2D { width: 800, height: 800 });
        let ratio = square.proj.x_axis.x / wide.proj.x_axis.x;
        assert!((ratio - 1.5).abs() < 1e-4);
    }
}
