// Shader module and shader object creation
//
// Vulkan uses SPIR-V bytecode for shaders. Instrumented code is already held
// as words, so no byte realignment is needed here.

use crate::state::ShaderCreateInfo;
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CString;

/// Create a shader module from SPIR-V words
pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> VkResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.create_shader_module(&create_info, None) }
}

/// Create one shader object
pub fn create_shader(
    shader_object: &ash::extensions::ext::ShaderObject,
    info: &ShaderCreateInfo,
) -> VkResult<vk::ShaderEXT> {
    let entry_point = CString::new(info.entry_point.as_str()).map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;
    // Code size is in bytes, the pointer is untyped
    let create_info = vk::ShaderCreateInfoEXT::builder()
        .flags(info.flags)
        .stage(info.stage)
        .next_stage(info.next_stage)
        .code_type(vk::ShaderCodeTypeEXT::SPIRV)
        .code(bytes_of(&info.code))
        .name(&entry_point)
        .set_layouts(&info.set_layouts)
        .push_constant_ranges(&info.push_constant_ranges)
        .build();

    let shaders = unsafe { shader_object.create_shaders(&[create_info], None) }?;
    shaders
        .into_iter()
        .next()
        .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
}

fn bytes_of(words: &[u32]) -> &[u8] {
    // Safety: u32 has no padding and u8 has alignment 1
    unsafe { std::slice::from_raw_parts(words.as_ptr() as *const u8, std::mem::size_of_val(words)) }
}
