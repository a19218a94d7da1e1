// Shared test fixtures: a fake device, a map-backed state tracker, a report
// sink that keeps every message and a small SPIR-V assembler for shaders
// exercising each pass.

use crate::backend::DeviceDispatch;
use crate::config::GpuavSettings;
use crate::descriptor_layout::InstrumentationDescriptorSetLayouts;
use crate::instrumentor::{DeviceCreateParams, DeviceFeatures, ShaderInstrumentor};
use crate::report::{DebugReport, LogObjectList, Severity};
use crate::spirv::consts::*;
use crate::spirv::execution_model;
use crate::spirv::instruction::{encode_string, MAGIC_NUMBER};
use crate::spirv::{Instruction, ModuleSettings};
use crate::state::{
    DescriptorSetLayoutBinding, DescriptorSetLayoutState, GraphicsPipelineCreateInfo, PipelineLayoutState,
    PipelineLibraryState, ShaderCreateInfo, ShaderModuleState, StateTracker,
};
use ash::prelude::VkResult;
use ash::vk;
use ash::vk::Handle;
use parking_lot::{Mutex, RwLock};
use rspirv::spirv::{Decoration, Op};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub fn default_settings() -> ModuleSettings {
    ModuleSettings {
        shader_id: 1,
        output_buffer_descriptor_set: 7,
        safe_mode: false,
        print_debug_info: false,
        max_instrumentations_count: 0,
        support_non_semantic_info: true,
        has_bindless_descriptors: false,
    }
}

fn storage_buffer_set(handle: vk::DescriptorSetLayout, count: u32) -> DescriptorSetLayoutState {
    DescriptorSetLayoutState {
        handle,
        bindings: vec![DescriptorSetLayoutBinding::new(0, vk::DescriptorType::STORAGE_BUFFER, count)],
    }
}

/// One set per entry, each with a single storage buffer binding of that many descriptors
pub fn layouts_for(counts: &[u32]) -> InstrumentationDescriptorSetLayouts {
    let sets: Vec<_> = counts
        .iter()
        .map(|&count| Some(Arc::new(storage_buffer_set(vk::DescriptorSetLayout::null(), count))))
        .collect();
    InstrumentationDescriptorSetLayouts::from_set_layouts(&sets)
}

// -------------------------------------------------------------------------
// Reporting
// -------------------------------------------------------------------------

#[derive(Default)]
pub struct CaptureReport {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl CaptureReport {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().iter().map(|(_, message)| message.clone()).collect()
    }

    pub fn messages_with(&self, severity: Severity) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.messages_with(severity).len()
    }
}

impl DebugReport for CaptureReport {
    fn report(&self, severity: Severity, _message_id: &str, _objects: &LogObjectList, message: &str) {
        self.messages.lock().push((severity, message.to_string()));
    }
}

// -------------------------------------------------------------------------
// State tracking
// -------------------------------------------------------------------------

/// Objects the application created, as the layer's tracker would see them
pub struct MapStateTracker {
    next_handle: AtomicU64,
    modules: RwLock<HashMap<vk::ShaderModule, Arc<ShaderModuleState>>>,
    set_layouts: RwLock<HashMap<vk::DescriptorSetLayout, Arc<DescriptorSetLayoutState>>>,
    pipeline_layouts: RwLock<HashMap<vk::PipelineLayout, Arc<PipelineLayoutState>>>,
    libraries: RwLock<HashMap<vk::Pipeline, Arc<PipelineLibraryState>>>,
}

impl Default for MapStateTracker {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(0x10_0000),
            modules: RwLock::default(),
            set_layouts: RwLock::default(),
            pipeline_layouts: RwLock::default(),
            libraries: RwLock::default(),
        }
    }
}

impl MapStateTracker {
    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    pub fn add_module(&self, spirv: Vec<u32>) -> vk::ShaderModule {
        self.insert_module(spirv, None)
    }

    pub fn add_named_module(&self, spirv: Vec<u32>, name: &str) -> vk::ShaderModule {
        self.insert_module(spirv, Some(name.to_string()))
    }

    fn insert_module(&self, spirv: Vec<u32>, debug_name: Option<String>) -> vk::ShaderModule {
        let handle = vk::ShaderModule::from_raw(self.handle());
        let state = ShaderModuleState {
            handle,
            spirv: Arc::from(spirv),
            debug_name,
        };
        self.modules.write().insert(handle, Arc::new(state));
        handle
    }

    /// Set layout with a single storage buffer binding of `count` descriptors
    pub fn add_set_layout(&self, count: u32) -> vk::DescriptorSetLayout {
        let handle = vk::DescriptorSetLayout::from_raw(self.handle());
        self.set_layouts
            .write()
            .insert(handle, Arc::new(storage_buffer_set(handle, count)));
        handle
    }

    /// Pipeline layout with one set per entry, see `add_set_layout`
    pub fn add_pipeline_layout(&self, counts: &[u32]) -> vk::PipelineLayout {
        let set_layouts = counts
            .iter()
            .map(|&count| {
                let handle = self.add_set_layout(count);
                self.set_layouts.read().get(&handle).cloned()
            })
            .collect();
        let handle = vk::PipelineLayout::from_raw(self.handle());
        let state = PipelineLayoutState {
            handle,
            set_layouts,
            push_constant_ranges: Vec::new(),
        };
        self.pipeline_layouts.write().insert(handle, Arc::new(state));
        handle
    }

    pub fn add_library(&self, create_info: GraphicsPipelineCreateInfo) -> vk::Pipeline {
        let handle = vk::Pipeline::from_raw(self.handle());
        self.libraries
            .write()
            .insert(handle, Arc::new(PipelineLibraryState { handle, create_info }));
        handle
    }

    pub fn pipeline_library_info(&self, library: vk::Pipeline) -> GraphicsPipelineCreateInfo {
        self.libraries.read()[&library].create_info.clone()
    }
}

impl StateTracker for MapStateTracker {
    fn shader_module(&self, module: vk::ShaderModule) -> Option<Arc<ShaderModuleState>> {
        self.modules.read().get(&module).cloned()
    }

    fn pipeline_layout(&self, layout: vk::PipelineLayout) -> Option<Arc<PipelineLayoutState>> {
        self.pipeline_layouts.read().get(&layout).cloned()
    }

    fn descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) -> Option<Arc<DescriptorSetLayoutState>> {
        self.set_layouts.read().get(&layout).cloned()
    }

    fn pipeline_library(&self, pipeline: vk::Pipeline) -> Option<Arc<PipelineLibraryState>> {
        self.libraries.read().get(&pipeline).cloned()
    }
}

// -------------------------------------------------------------------------
// Device
// -------------------------------------------------------------------------

#[derive(Default)]
struct FakeObjects {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layouts: HashMap<vk::PipelineLayout, Vec<vk::DescriptorSetLayout>>,
    modules: HashMap<vk::ShaderModule, Vec<u32>>,
    shaders: HashMap<vk::ShaderEXT, Vec<u32>>,
    libraries: HashMap<vk::Pipeline, GraphicsPipelineCreateInfo>,
    created_shaders: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Failures {
    pipeline_layouts: bool,
    shader_modules: bool,
    shaders: bool,
    libraries: bool,
}

/// Device that keeps every object it creates, with switchable failures
pub struct FakeDispatch {
    next_handle: AtomicU64,
    objects: Mutex<FakeObjects>,
    failures: Mutex<Failures>,
    tracker: Arc<MapStateTracker>,
}

impl Default for FakeDispatch {
    fn default() -> Self {
        Self {
            next_handle: AtomicU64::new(0x1_0000),
            objects: Mutex::default(),
            failures: Mutex::default(),
            tracker: Arc::default(),
        }
    }
}

impl FakeDispatch {
    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::SeqCst)
    }

    pub fn state_tracker(&self) -> Arc<MapStateTracker> {
        self.tracker.clone()
    }

    pub fn fail_pipeline_layouts(&self, fail: bool) {
        self.failures.lock().pipeline_layouts = fail;
    }

    pub fn fail_shader_modules(&self, fail: bool) {
        self.failures.lock().shader_modules = fail;
    }

    pub fn fail_shaders(&self, fail: bool) {
        self.failures.lock().shaders = fail;
    }

    pub fn fail_libraries(&self, fail: bool) {
        self.failures.lock().libraries = fail;
    }

    /// Objects created through the dispatch and not destroyed yet
    pub fn live_object_count(&self) -> usize {
        let objects = self.objects.lock();
        objects.set_layouts.len()
            + objects.pipeline_layouts.len()
            + objects.modules.len()
            + objects.shaders.len()
            + objects.libraries.len()
    }

    pub fn pipeline_layout_sets(&self, layout: vk::PipelineLayout) -> Option<Vec<vk::DescriptorSetLayout>> {
        self.objects.lock().pipeline_layouts.get(&layout).cloned()
    }

    pub fn is_live_module(&self, module: vk::ShaderModule) -> bool {
        self.objects.lock().modules.contains_key(&module)
    }

    pub fn is_live_shader(&self, shader: vk::ShaderEXT) -> bool {
        self.objects.lock().shaders.contains_key(&shader)
    }

    pub fn is_live_pipeline(&self, pipeline: vk::Pipeline) -> bool {
        self.objects.lock().libraries.contains_key(&pipeline)
    }

    pub fn shader_code(&self, shader: vk::ShaderEXT) -> Option<Vec<u32>> {
        self.objects.lock().shaders.get(&shader).cloned()
    }

    pub fn library_create_info(&self, library: vk::Pipeline) -> Option<GraphicsPipelineCreateInfo> {
        self.objects.lock().libraries.get(&library).cloned()
    }

    pub fn created_shader_count(&self) -> usize {
        self.objects.lock().created_shaders
    }
}

impl DeviceDispatch for FakeDispatch {
    fn create_descriptor_set_layout(&self, _bindings: &[vk::DescriptorSetLayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let layout = vk::DescriptorSetLayout::from_raw(self.handle());
        self.objects.lock().set_layouts.push(layout);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.objects.lock().set_layouts.retain(|live| *live != layout);
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        _push_constant_ranges: &[vk::PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        if self.failures.lock().pipeline_layouts {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let layout = vk::PipelineLayout::from_raw(self.handle());
        self.objects.lock().pipeline_layouts.insert(layout, set_layouts.to_vec());
        Ok(layout)
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.objects.lock().pipeline_layouts.remove(&layout);
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if self.failures.lock().shader_modules {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let module = vk::ShaderModule::from_raw(self.handle());
        self.objects.lock().modules.insert(module, code.to_vec());
        Ok(module)
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.objects.lock().modules.remove(&module);
    }

    fn create_shader(&self, info: &ShaderCreateInfo) -> VkResult<vk::ShaderEXT> {
        if self.failures.lock().shaders {
            return Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        }
        let shader = vk::ShaderEXT::from_raw(self.handle());
        let mut objects = self.objects.lock();
        objects.shaders.insert(shader, info.code.clone());
        objects.created_shaders += 1;
        Ok(shader)
    }

    fn destroy_shader(&self, shader: vk::ShaderEXT) {
        self.objects.lock().shaders.remove(&shader);
    }

    fn create_graphics_pipeline_library(&self, info: &GraphicsPipelineCreateInfo) -> VkResult<vk::Pipeline> {
        if self.failures.lock().libraries {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let library = vk::Pipeline::from_raw(self.handle());
        self.objects.lock().libraries.insert(library, info.clone());
        Ok(library)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.objects.lock().libraries.remove(&pipeline);
    }
}

pub fn instrumentor_with_dispatch(
    dispatch: Arc<FakeDispatch>,
    features: DeviceFeatures,
    max_bound_descriptor_sets: u32,
    settings: GpuavSettings,
) -> (ShaderInstrumentor, Arc<FakeDispatch>, Arc<CaptureReport>) {
    let report = Arc::new(CaptureReport::default());
    let instrumentor = ShaderInstrumentor::new(
        DeviceCreateParams {
            settings,
            features,
            max_bound_descriptor_sets,
        },
        dispatch.clone(),
        dispatch.state_tracker(),
        report.clone(),
    );
    (instrumentor, dispatch, report)
}

pub fn instrumentor_with(
    features: DeviceFeatures,
    max_bound_descriptor_sets: u32,
) -> (ShaderInstrumentor, Arc<FakeDispatch>, Arc<CaptureReport>) {
    instrumentor_with_dispatch(
        Arc::new(FakeDispatch::default()),
        features,
        max_bound_descriptor_sets,
        GpuavSettings::default(),
    )
}

pub fn instrumentor_with_settings(settings: GpuavSettings) -> (ShaderInstrumentor, Arc<FakeDispatch>, Arc<CaptureReport>) {
    instrumentor_with_dispatch(Arc::new(FakeDispatch::default()), DeviceFeatures::all(), 8, settings)
}

// -------------------------------------------------------------------------
// SPIR-V
// -------------------------------------------------------------------------

const CAPABILITY_SHADER: u32 = 1;
const CAPABILITY_SAMPLED_BUFFER: u32 = 46;
const CAPABILITY_RAY_QUERY: u32 = 4472;
const CAPABILITY_PHYSICAL_STORAGE_BUFFER_ADDRESSES: u32 = 5347;
const ADDRESSING_LOGICAL: u32 = 0;
const ADDRESSING_PHYSICAL_STORAGE_BUFFER_64: u32 = 5348;
const MEMORY_MODEL_GLSL450: u32 = 1;
const EXECUTION_MODE_LOCAL_SIZE: u32 = 17;
const SOURCE_LANGUAGE_GLSL: u32 = 2;
const OP_TYPE_RAY_QUERY: u32 = 4472;
const FLOAT_ONE: u32 = 0x3f80_0000;
const SHADER_DEBUG_SOURCE: u32 = 35;
const SHADER_DEBUG_LINE: u32 = 103;

#[derive(Debug, Clone)]
enum Feature {
    DescriptorArray(u32),
    StorageBufferStore,
    TexelFetch,
    PhysicalPointerStore,
    RayQuery,
    VertexInput,
    DebugPrintf(String, Vec<u32>),
    SourceLine { file: String, source: String, line: u32 },
    ShaderDebugInfo { file: String, source: String, line: u32 },
}

/// Assembles a single entry point shader with the requested constructs
#[derive(Debug, Clone)]
pub struct ShaderBuilder {
    execution_model: u32,
    version: u32,
    features: Vec<Feature>,
}

#[derive(Default)]
struct Sections {
    next_id: u32,
    capabilities: Vec<Instruction>,
    extensions: Vec<Instruction>,
    imports: Vec<Instruction>,
    addressing_model: u32,
    interface: Vec<u32>,
    debug: Vec<Instruction>,
    annotations: Vec<Instruction>,
    globals: Vec<Instruction>,
    locals: Vec<Instruction>,
    body: Vec<Instruction>,
}

impl Sections {
    fn id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn global(&mut self, op: Op, result_type: u32, operands: &[u32]) -> u32 {
        let id = self.id();
        self.globals.push(Instruction::new(op, result_type, id, operands));
        id
    }

    fn body(&mut self, op: Op, result_type: u32, operands: &[u32]) -> u32 {
        let id = self.id();
        self.body.push(Instruction::new(op, result_type, id, operands));
        id
    }

    fn body_void(&mut self, op: Op, operands: &[u32]) {
        self.body.push(Instruction::new(op, 0, 0, operands));
    }

    fn decorate(&mut self, target: u32, decoration: Decoration, values: &[u32]) {
        let mut operands = vec![target, decoration as u32];
        operands.extend_from_slice(values);
        self.annotations.push(Instruction::new(Op::Decorate, 0, 0, &operands));
    }

    fn capability(&mut self, capability: u32) {
        self.capabilities.push(Instruction::new(Op::Capability, 0, 0, &[capability]));
    }

    fn extension(&mut self, name: &str) {
        self.extensions.push(Instruction::new(Op::Extension, 0, 0, &encode_string(name)));
    }

    fn import(&mut self, name: &str) -> u32 {
        let id = self.id();
        self.imports.push(Instruction::new(Op::ExtInstImport, 0, id, &encode_string(name)));
        id
    }

    fn string(&mut self, text: &str) -> u32 {
        let id = self.id();
        self.debug.push(Instruction::new(Op::String, 0, id, &encode_string(text)));
        id
    }
}

/// Ids every shader gets
struct Common {
    void: u32,
    uint: u32,
    float: u32,
    zero: u32,
    /// Private uint the dynamic indices are loaded from
    index_variable: u32,
    storage_version_extension: bool,
}

impl ShaderBuilder {
    pub fn compute() -> Self {
        Self {
            execution_model: execution_model::GL_COMPUTE,
            version: 0x0001_0300,
            features: Vec::new(),
        }
    }

    pub fn vertex() -> Self {
        Self {
            execution_model: execution_model::VERTEX,
            ..Self::compute()
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Array of `count` storage buffers at set 0 binding 0, indexed dynamically
    pub fn with_descriptor_array(mut self, count: u32) -> Self {
        self.features.push(Feature::DescriptorArray(count));
        self
    }

    /// Store through a storage buffer at set 0 binding 0
    pub fn with_storage_buffer_store(mut self) -> Self {
        self.features.push(Feature::StorageBufferStore);
        self
    }

    /// `OpImageFetch` from a uniform texel buffer at set 0 binding 0
    pub fn with_texel_fetch(mut self) -> Self {
        self.features.push(Feature::TexelFetch);
        self
    }

    pub fn with_physical_pointer_store(mut self) -> Self {
        self.features.push(Feature::PhysicalPointerStore);
        self
    }

    pub fn with_ray_query(mut self) -> Self {
        self.features.push(Feature::RayQuery);
        self
    }

    /// Vertex attribute at location 0 copied into a local
    pub fn with_vertex_input(mut self) -> Self {
        self.features.push(Feature::VertexInput);
        self
    }

    pub fn with_debug_printf(mut self, format: &str, values: &[u32]) -> Self {
        self.features.push(Feature::DebugPrintf(format.to_string(), values.to_vec()));
        self
    }

    /// `OpSource` with the full text and an `OpLine` before the body
    pub fn with_source_line(mut self, file: &str, source: &str, line: u32) -> Self {
        self.features.push(Feature::SourceLine {
            file: file.to_string(),
            source: source.to_string(),
            line,
        });
        self
    }

    /// `NonSemantic.Shader.DebugInfo.100` source and line before the body
    pub fn with_shader_debug_info(mut self, file: &str, source: &str, line: u32) -> Self {
        self.features.push(Feature::ShaderDebugInfo {
            file: file.to_string(),
            source: source.to_string(),
            line,
        });
        self
    }

    pub fn build(&self) -> Vec<u32> {
        let mut s = Sections {
            next_id: 1,
            addressing_model: ADDRESSING_LOGICAL,
            ..Default::default()
        };
        s.capability(CAPABILITY_SHADER);

        let void = s.global(Op::TypeVoid, 0, &[]);
        let function_type = s.global(Op::TypeFunction, 0, &[void]);
        let uint = s.global(Op::TypeInt, 0, &[32, 0]);
        let float = s.global(Op::TypeFloat, 0, &[32]);
        let zero = s.global(Op::Constant, uint, &[0]);
        let private_uint = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_PRIVATE, uint]);
        let index_variable = s.global(Op::Variable, private_uint, &[STORAGE_CLASS_PRIVATE]);
        let common = Common {
            void,
            uint,
            float,
            zero,
            index_variable,
            storage_version_extension: self.version < 0x0001_0300,
        };

        if self.execution_model == execution_model::VERTEX {
            let vec4 = s.global(Op::TypeVector, 0, &[float, 4]);
            let function_vec4 = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_FUNCTION, vec4]);
            let local = s.id();
            s.locals.push(Instruction::new(Op::Variable, function_vec4, local, &[STORAGE_CLASS_FUNCTION]));
            if self.features.iter().any(|f| matches!(f, Feature::VertexInput)) {
                let input_vec4 = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_INPUT, vec4]);
                let attribute = s.global(Op::Variable, input_vec4, &[STORAGE_CLASS_INPUT]);
                s.decorate(attribute, Decoration::Location, &[0]);
                s.interface.push(attribute);
                let value = s.body(Op::Load, vec4, &[attribute]);
                s.body_void(Op::Store, &[local, value]);
            }
        }

        for feature in &self.features {
            self.add_feature(&mut s, &common, feature);
        }

        let main = s.id();
        let label = s.id();
        self.assemble(s, main, label, function_type, void)
    }

    fn storage_buffer_block(&self, s: &mut Sections, common: &Common) -> u32 {
        if common.storage_version_extension {
            s.extension("SPV_KHR_storage_buffer_storage_class");
        }
        let runtime_array = s.global(Op::TypeRuntimeArray, 0, &[common.uint]);
        s.decorate(runtime_array, Decoration::ArrayStride, &[4]);
        let block = s.global(Op::TypeStruct, 0, &[runtime_array]);
        s.decorate(block, Decoration::Block, &[]);
        s.annotations.push(Instruction::new(
            Op::MemberDecorate,
            0,
            0,
            &[block, 0, Decoration::Offset as u32, 0],
        ));
        block
    }

    fn add_feature(&self, s: &mut Sections, common: &Common, feature: &Feature) {
        let uint = common.uint;
        match feature {
            Feature::DescriptorArray(count) => {
                let block = self.storage_buffer_block(s, common);
                let count = s.global(Op::Constant, uint, &[*count]);
                let array = s.global(Op::TypeArray, 0, &[block, count]);
                let array_pointer = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_STORAGE_BUFFER, array]);
                let element_pointer = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_STORAGE_BUFFER, uint]);
                let buffers = s.global(Op::Variable, array_pointer, &[STORAGE_CLASS_STORAGE_BUFFER]);
                s.decorate(buffers, Decoration::DescriptorSet, &[0]);
                s.decorate(buffers, Decoration::Binding, &[0]);
                s.interface.push(buffers);

                let index = s.body(Op::Load, uint, &[common.index_variable]);
                let chain = s.body(Op::AccessChain, element_pointer, &[buffers, index, common.zero, common.zero]);
                s.body(Op::Load, uint, &[chain]);
            }
            Feature::StorageBufferStore => {
                let block = self.storage_buffer_block(s, common);
                let block_pointer = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_STORAGE_BUFFER, block]);
                let element_pointer = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_STORAGE_BUFFER, uint]);
                let buffer = s.global(Op::Variable, block_pointer, &[STORAGE_CLASS_STORAGE_BUFFER]);
                s.decorate(buffer, Decoration::DescriptorSet, &[0]);
                s.decorate(buffer, Decoration::Binding, &[0]);
                s.interface.push(buffer);

                let index = s.body(Op::Load, uint, &[common.index_variable]);
                let chain = s.body(Op::AccessChain, element_pointer, &[buffer, common.zero, index]);
                s.body_void(Op::Store, &[chain, index]);
            }
            Feature::TexelFetch => {
                s.capability(CAPABILITY_SAMPLED_BUFFER);
                let vec4 = s.global(Op::TypeVector, 0, &[uint, 4]);
                let image = s.global(Op::TypeImage, 0, &[uint, DIM_BUFFER, 0, 0, 0, 1, 0]);
                let image_pointer = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_UNIFORM_CONSTANT, image]);
                let texels = s.global(Op::Variable, image_pointer, &[STORAGE_CLASS_UNIFORM_CONSTANT]);
                s.decorate(texels, Decoration::DescriptorSet, &[0]);
                s.decorate(texels, Decoration::Binding, &[0]);

                let index = s.body(Op::Load, uint, &[common.index_variable]);
                let loaded = s.body(Op::Load, image, &[texels]);
                s.body(Op::ImageFetch, vec4, &[loaded, index]);
            }
            Feature::PhysicalPointerStore => {
                s.capability(CAPABILITY_PHYSICAL_STORAGE_BUFFER_ADDRESSES);
                s.extension("SPV_KHR_physical_storage_buffer");
                s.addressing_model = ADDRESSING_PHYSICAL_STORAGE_BUFFER_64;
                let physical = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER, uint]);
                let private_physical = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_PRIVATE, physical]);
                let holder = s.global(Op::Variable, private_physical, &[STORAGE_CLASS_PRIVATE]);
                s.decorate(holder, Decoration::RestrictPointer, &[]);

                let pointer = s.body(Op::Load, physical, &[holder]);
                s.body_void(Op::Store, &[pointer, common.zero, MEMORY_ACCESS_ALIGNED, 4]);
            }
            Feature::RayQuery => {
                s.capability(CAPABILITY_RAY_QUERY);
                s.extension("SPV_KHR_ray_query");
                let ray_query = s.id();
                s.globals.push(Instruction::from_words(vec![(2 << 16) | OP_TYPE_RAY_QUERY, ray_query], None));
                let acceleration_structure = s.id();
                s.globals.push(Instruction::from_words(
                    vec![(2 << 16) | OP_TYPE_ACCELERATION_STRUCTURE, acceleration_structure],
                    None,
                ));
                let query_pointer = s.global(Op::TypePointer, 0, &[STORAGE_CLASS_FUNCTION, ray_query]);
                let structure_pointer =
                    s.global(Op::TypePointer, 0, &[STORAGE_CLASS_UNIFORM_CONSTANT, acceleration_structure]);
                let structure = s.global(Op::Variable, structure_pointer, &[STORAGE_CLASS_UNIFORM_CONSTANT]);
                s.decorate(structure, Decoration::DescriptorSet, &[0]);
                s.decorate(structure, Decoration::Binding, &[1]);
                let vec3 = s.global(Op::TypeVector, 0, &[common.float, 3]);
                let float_zero = s.global(Op::Constant, common.float, &[0]);
                let float_one = s.global(Op::Constant, common.float, &[FLOAT_ONE]);
                let origin = s.global(Op::ConstantComposite, vec3, &[float_zero, float_zero, float_zero]);
                let direction = s.global(Op::ConstantComposite, vec3, &[float_zero, float_zero, float_one]);
                let cull_mask = s.global(Op::Constant, uint, &[0xFF]);

                let query = s.id();
                s.locals.push(Instruction::new(Op::Variable, query_pointer, query, &[STORAGE_CLASS_FUNCTION]));
                let loaded = s.body(Op::Load, acceleration_structure, &[structure]);
                s.body_void(
                    Op::RayQueryInitializeKHR,
                    &[query, loaded, common.zero, cull_mask, origin, float_zero, direction, float_one],
                );
            }
            Feature::VertexInput => {}
            Feature::DebugPrintf(format, values) => {
                s.extension("SPV_KHR_non_semantic_info");
                let import = s.import("NonSemantic.DebugPrintf");
                let format = s.string(format);
                let mut operands = vec![import, 1, format];
                for &value in values {
                    operands.push(s.global(Op::Constant, uint, &[value]));
                }
                s.body(Op::ExtInst, common.void, &operands);
            }
            Feature::SourceLine { file, source, line } => {
                let file = s.string(file);
                let mut operands = vec![SOURCE_LANGUAGE_GLSL, 450, file];
                operands.extend(encode_string(source));
                s.debug.push(Instruction::new(Op::Source, 0, 0, &operands));
                s.body.insert(0, Instruction::new(Op::Line, 0, 0, &[file, *line, 1]));
            }
            Feature::ShaderDebugInfo { file, source, line } => {
                s.extension("SPV_KHR_non_semantic_info");
                let import = s.import("NonSemantic.Shader.DebugInfo.100");
                let file = s.string(file);
                let text = s.string(source);
                let debug_source = s.global(Op::ExtInst, common.void, &[import, SHADER_DEBUG_SOURCE, file, text]);
                let line = s.global(Op::Constant, uint, &[*line]);
                let column = s.global(Op::Constant, uint, &[1]);
                let debug_line = s.id();
                s.body.insert(
                    0,
                    Instruction::new(
                        Op::ExtInst,
                        common.void,
                        debug_line,
                        &[import, SHADER_DEBUG_LINE, debug_source, line, line, column, column],
                    ),
                );
            }
        }
    }

    fn assemble(&self, s: Sections, main: u32, label: u32, function_type: u32, void: u32) -> Vec<u32> {
        let mut entry_operands = vec![self.execution_model, main];
        entry_operands.extend(encode_string("main"));
        entry_operands.extend(&s.interface);
        let entry_point = Instruction::new(Op::EntryPoint, 0, 0, &entry_operands);
        let memory_model = Instruction::new(Op::MemoryModel, 0, 0, &[s.addressing_model, MEMORY_MODEL_GLSL450]);
        let execution_modes: Vec<Instruction> = (self.execution_model == execution_model::GL_COMPUTE)
            .then(|| Instruction::new(Op::ExecutionMode, 0, 0, &[main, EXECUTION_MODE_LOCAL_SIZE, 1, 1, 1]))
            .into_iter()
            .collect();

        let function = Instruction::new(Op::Function, void, main, &[FUNCTION_CONTROL_NONE, function_type]);
        let block_label = Instruction::new(Op::Label, 0, label, &[]);
        let ret = Instruction::new(Op::Return, 0, 0, &[]);
        let end = Instruction::new(Op::FunctionEnd, 0, 0, &[]);

        let mut words = vec![MAGIC_NUMBER, self.version, 0, s.next_id, 0];
        let module_sections = [
            &s.capabilities,
            &s.extensions,
            &s.imports,
            &vec![memory_model],
            &vec![entry_point],
            &execution_modes,
            &s.debug,
            &s.annotations,
            &s.globals,
        ];
        for section in module_sections {
            for inst in section.iter() {
                words.extend_from_slice(inst.words());
            }
        }
        for inst in std::iter::once(&function)
            .chain(std::iter::once(&block_label))
            .chain(s.locals.iter())
            .chain(s.body.iter())
            .chain([&ret, &end])
        {
            words.extend_from_slice(inst.words());
        }
        words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::instruction::parse_instructions;

    #[test]
    fn built_shaders_pass_the_validator() {
        use crate::validator::{SpirvToolsValidator, SpirvValidator, ValidatorOptions};
        for words in [
            ShaderBuilder::compute().build(),
            ShaderBuilder::compute().with_descriptor_array(4).build(),
            ShaderBuilder::compute().with_storage_buffer_store().build(),
            ShaderBuilder::compute().with_texel_fetch().build(),
            ShaderBuilder::compute().with_physical_pointer_store().build(),
            ShaderBuilder::compute().with_ray_query().build(),
            ShaderBuilder::vertex().with_vertex_input().build(),
            ShaderBuilder::compute().with_debug_printf("%u", &[1]).build(),
            ShaderBuilder::compute().with_source_line("a.comp", "void main() {}", 1).build(),
            ShaderBuilder::compute().with_shader_debug_info("a.comp", "void main() {}", 1).build(),
        ] {
            SpirvToolsValidator
                .validate(&words, &ValidatorOptions::default())
                .unwrap();
        }
    }

    #[test]
    fn id_bound_covers_every_id() {
        let words = ShaderBuilder::compute().with_descriptor_array(4).build();
        let bound = words[3];
        let instructions = parse_instructions(&words).unwrap();
        assert!(instructions.iter().all(|inst| inst.result_id() < bound));
    }
}
