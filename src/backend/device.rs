// Vulkan device access - the ash-backed dispatch
//
// Responsibilities:
// - Forward the instrumentor's own object creation to the driver
// - Query the device features instrumentation depends on
// - Shader objects only when VK_EXT_shader_object is loaded

use super::DeviceDispatch;
use crate::instrumentor::DeviceFeatures;
use crate::state::{GraphicsPipelineCreateInfo, ShaderCreateInfo};
use ash::prelude::VkResult;
use ash::vk;
use std::ffi::CStr;

/// `DeviceDispatch` over a loaded `ash::Device`
pub struct AshDeviceDispatch {
    pub device: ash::Device,
    shader_object: Option<ash::extensions::ext::ShaderObject>,
}

impl AshDeviceDispatch {
    /// Create the dispatch
    ///
    /// # Arguments
    /// * `instance` - Instance the device was created from
    /// * `device` - The application's logical device
    /// * `shader_object_enabled` - VK_EXT_shader_object was enabled on the device
    pub fn new(instance: &ash::Instance, device: ash::Device, shader_object_enabled: bool) -> Self {
        let shader_object =
            shader_object_enabled.then(|| ash::extensions::ext::ShaderObject::new(instance, &device));
        Self {
            device,
            shader_object,
        }
    }
}

impl DeviceDispatch for AshDeviceDispatch {
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) }
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        super::pipeline::create_pipeline_layout(&self.device, set_layouts, push_constant_ranges)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) }
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        super::shader::create_shader_module(&self.device, code)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) }
    }

    fn create_shader(&self, info: &ShaderCreateInfo) -> VkResult<vk::ShaderEXT> {
        let shader_object = self
            .shader_object
            .as_ref()
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        super::shader::create_shader(shader_object, info)
    }

    fn destroy_shader(&self, shader: vk::ShaderEXT) {
        if let Some(shader_object) = &self.shader_object {
            unsafe { shader_object.destroy_shader(shader, None) }
        }
    }

    fn create_graphics_pipeline_library(
        &self,
        info: &GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline> {
        super::pipeline::create_graphics_pipeline_library(&self.device, info)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }
}

/// Features of `physical_device` that matter to instrumentation
pub fn query_device_features(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> VkResult<DeviceFeatures> {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features12).build();
    unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
    let core = features2.features;

    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }?;
    let has_extension = |name: &CStr| {
        extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == name)
    };
    let non_semantic_info = vk::api_version_minor(properties.api_version) >= 3
        || has_extension(vk::KhrShaderNonSemanticInfoFn::name());

    let features = DeviceFeatures {
        fragment_stores_and_atomics: core.fragment_stores_and_atomics == vk::TRUE,
        vertex_pipeline_stores_and_atomics: core.vertex_pipeline_stores_and_atomics == vk::TRUE,
        shader_int64: core.shader_int64 == vk::TRUE,
        robust_buffer_access: core.robust_buffer_access == vk::TRUE,
        timeline_semaphore: features12.timeline_semaphore == vk::TRUE,
        buffer_device_address: features12.buffer_device_address == vk::TRUE,
        vulkan_memory_model: features12.vulkan_memory_model == vk::TRUE,
        vulkan_memory_model_device_scope: features12.vulkan_memory_model_device_scope == vk::TRUE,
        scalar_block_layout: features12.scalar_block_layout == vk::TRUE,
        uniform_buffer_standard_layout: features12.uniform_buffer_standard_layout == vk::TRUE,
        shader_non_semantic_info: non_semantic_info,
    };

    log::info!(
        "Device {}: {:?}",
        unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy(),
        features
    );
    Ok(features)
}
