// Pipeline layout and pipeline library creation
//
// Libraries are rebuilt from the create-info model: shader stages, layout,
// library part flags. Fixed function state of the parts is expected to be
// dynamic; the model does not carry it.

use crate::state::GraphicsPipelineCreateInfo;
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CString;

/// Create a pipeline layout from set layouts and push constant ranges
pub fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> VkResult<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);

    unsafe { device.create_pipeline_layout(&layout_info, None) }
}

/// Create one graphics pipeline library from its create info
pub fn create_graphics_pipeline_library(
    device: &ash::Device,
    info: &GraphicsPipelineCreateInfo,
) -> VkResult<vk::Pipeline> {
    let entry_points = info
        .stages
        .iter()
        .map(|stage| CString::new(stage.entry_point.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;

    // Inline SPIR-V goes through a chained VkShaderModuleCreateInfo
    let inline_modules: Vec<Option<vk::ShaderModuleCreateInfo>> = info
        .stages
        .iter()
        .map(|stage| {
            stage
                .inline_spirv
                .as_ref()
                .map(|code| vk::ShaderModuleCreateInfo::builder().code(code).build())
        })
        .collect();

    let stages: Vec<vk::PipelineShaderStageCreateInfo> = info
        .stages
        .iter()
        .zip(&entry_points)
        .zip(&inline_modules)
        .map(|((stage, name), inline)| {
            let mut create_info = vk::PipelineShaderStageCreateInfo::builder()
                .stage(stage.stage)
                .module(stage.module)
                .name(name)
                .build();
            if let Some(inline) = inline {
                create_info.p_next = inline as *const vk::ShaderModuleCreateInfo as *const std::ffi::c_void;
            }
            create_info
        })
        .collect();

    let mut library_info = vk::GraphicsPipelineLibraryCreateInfoEXT::builder().flags(info.library_flags);
    let mut link_info = vk::PipelineLibraryCreateInfoKHR::builder().libraries(&info.libraries);

    let mut create_info = vk::GraphicsPipelineCreateInfo::builder()
        .flags(info.flags)
        .stages(&stages)
        .layout(info.layout)
        .push_next(&mut library_info);
    if !info.libraries.is_empty() {
        create_info = create_info.push_next(&mut link_info);
    }

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[create_info.build()], None)
    }
    .map_err(|(_, e)| e)?;

    pipelines
        .into_iter()
        .next()
        .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)
}
