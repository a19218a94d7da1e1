// Tracked object state and create-info models
//
// The layer core never walks Vulkan pNext chains itself. Callers hand in these
// plain models (already decoded from the API structures) and a `StateTracker`
// answering lookups for objects created earlier.

use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
    pub binding_flags: vk::DescriptorBindingFlags,
}

impl DescriptorSetLayoutBinding {
    pub fn new(binding: u32, descriptor_type: vk::DescriptorType, descriptor_count: u32) -> Self {
        Self {
            binding,
            descriptor_type,
            descriptor_count,
            stage_flags: vk::ShaderStageFlags::ALL,
            binding_flags: vk::DescriptorBindingFlags::empty(),
        }
    }

    pub fn with_flags(mut self, binding_flags: vk::DescriptorBindingFlags) -> Self {
        self.binding_flags = binding_flags;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutState {
    pub handle: vk::DescriptorSetLayout,
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutState {
    pub handle: vk::PipelineLayout,
    /// One entry per set; `None` for sets left null (allowed with independent sets)
    pub set_layouts: Vec<Option<Arc<DescriptorSetLayoutState>>>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

#[derive(Debug, Clone)]
pub struct ShaderModuleState {
    pub handle: vk::ShaderModule,
    pub spirv: Arc<[u32]>,
    pub debug_name: Option<String>,
}

/// One `VkPipelineShaderStageCreateInfo`
#[derive(Debug, Clone)]
pub struct ShaderStageCreateInfo {
    pub stage: vk::ShaderStageFlags,
    pub module: vk::ShaderModule,
    /// SPIR-V passed through a chained `VkShaderModuleCreateInfo` instead of a module
    pub inline_spirv: Option<Vec<u32>>,
    pub entry_point: String,
    pub debug_name: Option<String>,
    /// `VkValidationFeaturesEXT`-style per-object opt in for selective instrumentation
    pub enable_instrumentation: bool,
}

impl ShaderStageCreateInfo {
    pub fn from_module(stage: vk::ShaderStageFlags, module: vk::ShaderModule) -> Self {
        Self {
            stage,
            module,
            inline_spirv: None,
            entry_point: "main".to_string(),
            debug_name: None,
            enable_instrumentation: false,
        }
    }

    pub fn inline(stage: vk::ShaderStageFlags, spirv: Vec<u32>) -> Self {
        Self {
            stage,
            module: vk::ShaderModule::null(),
            inline_spirv: Some(spirv),
            entry_point: "main".to_string(),
            debug_name: None,
            enable_instrumentation: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineCreateInfo {
    pub flags: vk::PipelineCreateFlags,
    pub stages: Vec<ShaderStageCreateInfo>,
    pub layout: vk::PipelineLayout,
    /// Parts this create info builds when it is a pipeline library
    pub library_flags: vk::GraphicsPipelineLibraryFlagsEXT,
    /// Libraries linked through `VkPipelineLibraryCreateInfoKHR`
    pub libraries: Vec<vk::Pipeline>,
    pub debug_name: Option<String>,
    pub enable_instrumentation: bool,
    /// Created with `VK_PIPELINE_CREATE_INDIRECT_BINDABLE_BIT_NV`
    pub indirect_bindable: bool,
}

#[derive(Debug, Clone)]
pub struct ComputePipelineCreateInfo {
    pub flags: vk::PipelineCreateFlags,
    pub stage: ShaderStageCreateInfo,
    pub layout: vk::PipelineLayout,
    pub debug_name: Option<String>,
    pub enable_instrumentation: bool,
    pub indirect_bindable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RayTracingPipelineCreateInfo {
    pub flags: vk::PipelineCreateFlags,
    pub stages: Vec<ShaderStageCreateInfo>,
    pub layout: vk::PipelineLayout,
    pub libraries: Vec<vk::Pipeline>,
    pub debug_name: Option<String>,
    pub enable_instrumentation: bool,
}

/// One `VkShaderCreateInfoEXT`
#[derive(Debug, Clone)]
pub struct ShaderCreateInfo {
    pub flags: vk::ShaderCreateFlagsEXT,
    pub stage: vk::ShaderStageFlags,
    pub next_stage: vk::ShaderStageFlags,
    pub code: Vec<u32>,
    pub entry_point: String,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pub debug_name: Option<String>,
    pub enable_instrumentation: bool,
    pub indirect_bindable: bool,
}

impl ShaderCreateInfo {
    pub fn new(stage: vk::ShaderStageFlags, code: Vec<u32>) -> Self {
        Self {
            flags: vk::ShaderCreateFlagsEXT::empty(),
            stage,
            next_stage: vk::ShaderStageFlags::empty(),
            code,
            entry_point: "main".to_string(),
            set_layouts: Vec::new(),
            push_constant_ranges: Vec::new(),
            debug_name: None,
            enable_instrumentation: false,
            indirect_bindable: false,
        }
    }
}

/// A graphics pipeline library and the create info it was built from
#[derive(Debug, Clone)]
pub struct PipelineLibraryState {
    pub handle: vk::Pipeline,
    pub create_info: GraphicsPipelineCreateInfo,
}

/// Lookups into the generic object tracker of the layer
pub trait StateTracker: Send + Sync {
    fn shader_module(&self, module: vk::ShaderModule) -> Option<Arc<ShaderModuleState>>;
    fn pipeline_layout(&self, layout: vk::PipelineLayout) -> Option<Arc<PipelineLayoutState>>;
    fn descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Option<Arc<DescriptorSetLayoutState>>;
    fn pipeline_library(&self, pipeline: vk::Pipeline) -> Option<Arc<PipelineLibraryState>>;
}
