// Shader module loading
//
// Shaders arrive as precompiled SPIR-V files (see build.rs).

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;
use super::VulkanDevice;

/// Read a SPIR-V file into 32-bit words
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read shader {}", path.display()))?;
    ash::util::read_spv(&mut Cursor::new(bytes))
        .with_context(|| format!("Invalid SPIR-V in {}", path.display()))
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &VulkanDevice, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe {
        device.device.create_shader_module(&create_info, None)
            .context("Failed to create shader module")
    }
}

/// Load a SPIR-V file from disk and wrap it in a shader module
pub fn load_shader_module(device: &VulkanDevice, path: &Path) -> Result<vk::ShaderModule> {
    let code = read_spirv(path)?;
    log::debug!("Loaded shader {} ({} words)", path.display(), code.len());
    create_shader_module(device, &code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_shader_file_reports_path() {
        let err = read_spirv(Path::new("shaders/does_not_exist.spv")).unwrap_err();
        assert!(format!("{:#}", err).contains("does_not_exist.spv"));
    }

    #[test]
    fn rejects_bytes_that_are_not_spirv() {
        let dir = std::env::temp_dir().join("viking-viewer-shader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bogus.spv");
        std::fs::write(&path, [1u8, 2, 3, 4, 5]).unwrap();
        assert!(read_spirv(&path).is_err());
    }
}
