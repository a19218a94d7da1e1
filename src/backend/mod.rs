// Backend module - the Vulkan calls the instrumentor makes itself
//
// Design: the instrumentor only talks to the driver through `DeviceDispatch`,
// so it can run against a real `ash::Device` or a recording fake.

pub mod device;
pub mod pipeline;
pub mod shader;

pub use device::{query_device_features, AshDeviceDispatch};

use crate::state::{GraphicsPipelineCreateInfo, ShaderCreateInfo};
use ash::prelude::VkResult;
use ash::vk;

/// Object creation and destruction down the call chain
pub trait DeviceDispatch: Send + Sync {
    fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_shader(&self, info: &ShaderCreateInfo) -> VkResult<vk::ShaderEXT>;
    fn destroy_shader(&self, shader: vk::ShaderEXT);

    /// Build a graphics pipeline library; stages referencing modules use `vk::ShaderModule` handles
    fn create_graphics_pipeline_library(
        &self,
        info: &GraphicsPipelineCreateInfo,
    ) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}
