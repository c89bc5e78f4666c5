// Shader module loading
//
// Vulkan consumes SPIR-V words. build.rs compiles each .vert/.frag GLSL
// source to a .spv file beside it; this module reads that output from disk.

use anyhow::{Context, Result};
use ash::vk;
use std::io::Cursor;
use std::path::Path;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode SPIR-V bytes into aligned words, checking the magic number.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    let words = ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V bytecode")?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        _ => anyhow::bail!("Missing SPIR-V magic number"),
    }
}

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> Result<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::default().code(code);

    unsafe { device.create_shader_module(&create_info, None) }.context("Failed to create shader module")
}

/// Read a compiled shader from disk and create its module.
/// The caller destroys the module once the pipeline is built.
pub fn load_shader_module(device: &ash::Device, path: &Path) -> Result<vk::ShaderModule> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read shader {}", path.display()))?;
    let words = parse_spirv(&bytes).with_context(|| format!("Failed to parse shader {}", path.display()))?;
    log::debug!("Loaded shader {} ({} words)", path.display(), words.len());
    create_shader_module(device, &words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShaderConfig;

    #[test]
    fn configured_spirv_sits_beside_its_glsl_source() {
        let shaders = ShaderConfig::default();
        let root = Path::new(env!("CARGO_MANIFEST_DIR"));
        for spv in [&shaders.vertex, &shaders.textured_fragment, &shaders.textureless_fragment] {
            let source = spv.strip_suffix(".spv").unwrap();
            assert!(source.ends_with(".vert") || source.ends_with(".frag"), "{}", source);
            assert!(root.join(shaders.path(source)).exists(), "{} has no GLSL source", spv);
        }
    }

    #[test]
    fn accepts_little_endian_magic() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn rejects_truncated_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.push(0);
        assert!(parse_spirv(&bytes).is_err());
    }

    #[test]
    fn rejects_wrong_magic() {
        assert!(parse_spirv(&[0u8; 8]).is_err());
        assert!(parse_spirv(&[]).is_err());
    }
}
