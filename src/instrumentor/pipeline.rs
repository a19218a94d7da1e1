// Pipeline creation hooks
//
// Pre-call: decide per pipeline and per stage whether to instrument, swap in
// instrumented code (a new module for standalone modules, in place for inline
// SPIR-V) and a pipeline layout with the reserved set. Post-call: attach the
// unique shader ids to the created pipelines, or destroy what was created on
// behalf of pipelines that failed.

use super::{ShaderInstrumentor, ShaderOwner};
use crate::descriptor_layout::InstrumentationDescriptorSetLayouts;
use crate::report::LogObjectList;
use crate::state::{
    ComputePipelineCreateInfo, GraphicsPipelineCreateInfo, PipelineLayoutState,
    RayTracingPipelineCreateInfo, ShaderStageCreateInfo,
};
use ash::vk;
use std::sync::Arc;

/// A stage whose code was replaced
#[derive(Debug, Clone)]
pub(crate) struct InstrumentedStage {
    pub unique_shader_id: u32,
    /// Module the application passed; null for inline code
    pub original_module: vk::ShaderModule,
    /// Module created with the instrumented code; null for inline code
    pub instrumented_module: vk::ShaderModule,
    pub original_spirv: Arc<[u32]>,
}

/// What pre-call did for one pipeline
#[derive(Debug, Clone, Default)]
pub struct PipelineInstrumentationData {
    pub(crate) stages: Vec<InstrumentedStage>,
    /// Pipeline layouts with the reserved set, only needed while creating
    pub(crate) instrumented_layouts: Vec<vk::PipelineLayout>,
    /// Libraries recreated from instrumented stages, owned by the linking pipeline
    pub(crate) recreated_libraries: Vec<vk::Pipeline>,
}

impl PipelineInstrumentationData {
    pub fn is_instrumented(&self) -> bool {
        !self.stages.is_empty()
    }

    pub fn unique_shader_ids(&self) -> Vec<u32> {
        self.stages.iter().map(|stage| stage.unique_shader_id).collect()
    }
}

/// Carried from the pre-call to the post-call of one creation call,
/// one entry per create info
#[derive(Debug, Default)]
pub struct CreatePipelinesState {
    pub(crate) pipelines: Vec<PipelineInstrumentationData>,
}

impl CreatePipelinesState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pipeline(&self, index: usize) -> Option<&PipelineInstrumentationData> {
        self.pipelines.get(index)
    }
}

/// The parts of a pipeline create info instrumentation touches
pub(crate) trait InstrumentablePipeline: Clone {
    fn flags(&self) -> vk::PipelineCreateFlags;
    fn layout(&self) -> vk::PipelineLayout;
    fn set_layout(&mut self, layout: vk::PipelineLayout);
    fn stages(&self) -> &[ShaderStageCreateInfo];
    fn stages_mut(&mut self) -> &mut [ShaderStageCreateInfo];
    fn libraries(&self) -> &[vk::Pipeline];
    fn debug_name(&self) -> Option<&str>;
    fn enable_instrumentation(&self) -> bool;
    fn indirect_bindable(&self) -> bool;
}

impl InstrumentablePipeline for GraphicsPipelineCreateInfo {
    fn flags(&self) -> vk::PipelineCreateFlags {
        self.flags
    }
    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
    fn set_layout(&mut self, layout: vk::PipelineLayout) {
        self.layout = layout;
    }
    fn stages(&self) -> &[ShaderStageCreateInfo] {
        &self.stages
    }
    fn stages_mut(&mut self) -> &mut [ShaderStageCreateInfo] {
        &mut self.stages
    }
    fn libraries(&self) -> &[vk::Pipeline] {
        &self.libraries
    }
    fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }
    fn enable_instrumentation(&self) -> bool {
        self.enable_instrumentation
    }
    fn indirect_bindable(&self) -> bool {
        self.indirect_bindable
    }
}

impl InstrumentablePipeline for ComputePipelineCreateInfo {
    fn flags(&self) -> vk::PipelineCreateFlags {
        self.flags
    }
    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
    fn set_layout(&mut self, layout: vk::PipelineLayout) {
        self.layout = layout;
    }
    fn stages(&self) -> &[ShaderStageCreateInfo] {
        std::slice::from_ref(&self.stage)
    }
    fn stages_mut(&mut self) -> &mut [ShaderStageCreateInfo] {
        std::slice::from_mut(&mut self.stage)
    }
    fn libraries(&self) -> &[vk::Pipeline] {
        &[]
    }
    fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }
    fn enable_instrumentation(&self) -> bool {
        self.enable_instrumentation
    }
    fn indirect_bindable(&self) -> bool {
        self.indirect_bindable
    }
}

impl InstrumentablePipeline for RayTracingPipelineCreateInfo {
    fn flags(&self) -> vk::PipelineCreateFlags {
        self.flags
    }
    fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
    fn set_layout(&mut self, layout: vk::PipelineLayout) {
        self.layout = layout;
    }
    fn stages(&self) -> &[ShaderStageCreateInfo] {
        &self.stages
    }
    fn stages_mut(&mut self) -> &mut [ShaderStageCreateInfo] {
        &mut self.stages
    }
    fn libraries(&self) -> &[vk::Pipeline] {
        &self.libraries
    }
    fn debug_name(&self) -> Option<&str> {
        self.debug_name.as_deref()
    }
    fn enable_instrumentation(&self) -> bool {
        self.enable_instrumentation
    }
    fn indirect_bindable(&self) -> bool {
        false
    }
}

/// Instrumentation hit a fatal error; the instrumentor is already aborted
pub(crate) struct Fatal;

impl ShaderInstrumentor {
    // ---------------------------------------------------------------------
    // Registration
    // ---------------------------------------------------------------------

    pub fn post_call_record_create_shader_module(&self, module: vk::ShaderModule, enable_instrumentation: bool) {
        let _coarse = self.coarse_write();
        if enable_instrumentation && self.selector.is_enabled() {
            self.selector.select_handle(module);
        }
    }

    /// Debug names given through `vkSetDebugUtilsObjectNameEXT`
    pub fn record_debug_object_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let _coarse = self.coarse_write();
        if !self.selector.is_enabled() || handle == 0 || !self.selector.matches_name(name) {
            return;
        }
        self.selector.select(object_type, handle);
        let mut objects = LogObjectList::new();
        objects.add_raw(object_type, handle);
        self.info(
            &objects,
            &format!("{:?} \"{}\" selected for instrumentation by its debug name", object_type, name),
        );
    }

    pub fn pre_call_record_destroy_shader_module(&self, module: vk::ShaderModule) {
        let _coarse = self.coarse_write();
        self.selector.forget(module);
    }

    // ---------------------------------------------------------------------
    // Eligibility
    // ---------------------------------------------------------------------

    /// Whether any stage of a pipeline may be instrumented. `warned` latches
    /// the reserved-slot warning for the current creation call.
    pub(crate) fn need_pipeline_instrumentation<P: InstrumentablePipeline>(
        &self,
        info: &P,
        layout: Option<&PipelineLayoutState>,
        warned: &mut bool,
    ) -> bool {
        if self.is_aborted() {
            return false;
        }
        if info.stages().is_empty() && info.libraries().is_empty() {
            return false;
        }
        if info.flags().contains(vk::PipelineCreateFlags::LIBRARY_KHR) {
            return false;
        }
        if layout.map_or(false, |layout| self.layout_uses_reserved_slot(layout, warned)) {
            return false;
        }
        if info.indirect_bindable() {
            self.warning(
                &LogObjectList::new(),
                "Pipeline is indirect bindable and can not be instrumented",
            );
            return false;
        }
        true
    }

    /// Whether `layout` already has a set at the reserved index. Warns once
    /// per creation call.
    pub(crate) fn layout_uses_reserved_slot(&self, layout: &PipelineLayoutState, warned: &mut bool) -> bool {
        let desc_set_bind_index = self.reserved.lock().desc_set_bind_index as usize;
        if layout.set_layouts.len() <= desc_set_bind_index {
            return false;
        }
        if !*warned {
            *warned = true;
            self.warning(
                &LogObjectList::new().with(layout.handle),
                &format!(
                    "Pipeline layout uses {} descriptor sets, descriptor set {} is reserved for validation. \
                     Shaders of this pipeline are not instrumented.",
                    layout.set_layouts.len(),
                    desc_set_bind_index
                ),
            );
        }
        true
    }

    fn module_names(&self, pipeline_name: Option<&str>, stage: &ShaderStageCreateInfo, module_name: Option<&str>) -> bool {
        self.selector.wants(
            stage.enable_instrumentation,
            stage.module,
            [pipeline_name, stage.debug_name.as_deref(), module_name],
        )
    }

    // ---------------------------------------------------------------------
    // Instrumentation
    // ---------------------------------------------------------------------

    /// Instrument the selected stages of `info` in place
    pub(crate) fn instrument_stages<P: InstrumentablePipeline>(
        &self,
        info: &mut P,
        layouts: &InstrumentationDescriptorSetLayouts,
        data: &mut PipelineInstrumentationData,
    ) -> Result<(), Fatal> {
        let pipeline_flag = info.enable_instrumentation();
        let pipeline_name = info.debug_name().map(str::to_string);

        for stage in info.stages_mut() {
            let (original_spirv, module_name): (Arc<[u32]>, Option<String>) = match &stage.inline_spirv {
                Some(code) => (Arc::from(code.as_slice()), None),
                None => match self.state_tracker.shader_module(stage.module) {
                    Some(module) => (module.spirv.clone(), module.debug_name.clone()),
                    None => {
                        log::debug!("stage {:?} uses an unknown shader module", stage.stage);
                        continue;
                    }
                },
            };
            let wanted = pipeline_flag || self.module_names(pipeline_name.as_deref(), stage, module_name.as_deref());
            if !wanted {
                continue;
            }

            let objects = LogObjectList::new().with(stage.module);
            let Some((unique_shader_id, code)) = self.instrument(&original_spirv, layouts, &objects) else {
                continue;
            };

            if stage.inline_spirv.is_some() {
                stage.inline_spirv = Some(code);
                data.stages.push(InstrumentedStage {
                    unique_shader_id,
                    original_module: vk::ShaderModule::null(),
                    instrumented_module: vk::ShaderModule::null(),
                    original_spirv,
                });
                continue;
            }

            match self.dispatch.create_shader_module(&code) {
                Ok(instrumented_module) => {
                    data.stages.push(InstrumentedStage {
                        unique_shader_id,
                        original_module: stage.module,
                        instrumented_module,
                        original_spirv,
                    });
                    stage.module = instrumented_module;
                }
                Err(result) => {
                    self.internal_error(
                        &objects,
                        &format!("Unable to create the instrumented shader module: {:?}", result),
                    );
                    return Err(Fatal);
                }
            }
        }
        Ok(())
    }

    /// A copy of `layout` with the reserved set at its index
    pub(crate) fn create_instrumented_layout(&self, layout: &PipelineLayoutState) -> Result<vk::PipelineLayout, Fatal> {
        let application: Vec<_> = layout
            .set_layouts
            .iter()
            .map(|set| set.as_ref().map_or(vk::DescriptorSetLayout::null(), |set| set.handle))
            .collect();
        let set_layouts = self.instrumented_set_layouts(&application);
        self.dispatch
            .create_pipeline_layout(&set_layouts, &layout.push_constant_ranges)
            .map_err(|result| {
                self.internal_error(
                    &LogObjectList::new().with(layout.handle),
                    &format!("Unable to create the instrumented pipeline layout: {:?}", result),
                );
                Fatal
            })
    }

    /// Destroy everything created for pipelines that will never exist
    pub(crate) fn destroy_instrumentation_objects(&self, data: &PipelineInstrumentationData) {
        for stage in &data.stages {
            if stage.instrumented_module != vk::ShaderModule::null() {
                self.dispatch.destroy_shader_module(stage.instrumented_module);
            }
        }
        for &library in &data.recreated_libraries {
            self.dispatch.destroy_pipeline(library);
        }
        for &layout in &data.instrumented_layouts {
            self.dispatch.destroy_pipeline_layout(layout);
        }
    }

    /// Instrument one pipeline. `Ok(None)` leaves the create info untouched.
    fn instrument_pipeline<P: InstrumentablePipeline>(
        &self,
        info: &P,
        warned: &mut bool,
        link_libraries: impl FnOnce(&mut P, &mut PipelineInstrumentationData, &mut bool) -> Result<(), Fatal>,
    ) -> Result<Option<(P, PipelineInstrumentationData)>, Fatal> {
        let layout = self.state_tracker.pipeline_layout(info.layout());
        if !self.need_pipeline_instrumentation(info, layout.as_deref(), warned) {
            return Ok(None);
        }
        let layouts = layout
            .as_ref()
            .map(|layout| InstrumentationDescriptorSetLayouts::from_set_layouts(&layout.set_layouts))
            .unwrap_or_default();

        let mut working = info.clone();
        let mut data = PipelineInstrumentationData::default();
        let result = self
            .instrument_stages(&mut working, &layouts, &mut data)
            .and_then(|()| link_libraries(&mut working, &mut data, warned))
            .and_then(|()| {
                if let (true, Some(layout)) = (data.is_instrumented(), layout.as_deref()) {
                    let instrumented_layout = self.create_instrumented_layout(layout)?;
                    data.instrumented_layouts.push(instrumented_layout);
                    working.set_layout(instrumented_layout);
                }
                Ok(())
            });
        if let Err(fatal) = result {
            self.destroy_instrumentation_objects(&data);
            return Err(fatal);
        }
        Ok(data.is_instrumented().then_some((working, data)))
    }

    /// Shared pre-call; on a fatal error every create info is left as the application passed it
    fn pre_call_record_create_pipelines<P: InstrumentablePipeline>(
        &self,
        infos: &mut [P],
        state: &mut CreatePipelinesState,
        link_libraries: impl Fn(&mut P, &mut PipelineInstrumentationData, &mut bool) -> Result<(), Fatal>,
    ) {
        state.pipelines = vec![PipelineInstrumentationData::default(); infos.len()];
        if self.is_aborted() {
            return;
        }
        let mut warned = false;
        let mut instrumented = Vec::new();
        for (index, info) in infos.iter().enumerate() {
            match self.instrument_pipeline(info, &mut warned, &link_libraries) {
                Ok(Some((working, data))) => instrumented.push((index, working, data)),
                Ok(None) => {}
                Err(Fatal) => {
                    for (_, _, data) in &instrumented {
                        self.destroy_instrumentation_objects(data);
                    }
                    return;
                }
            }
        }
        for (index, working, data) in instrumented {
            infos[index] = working;
            state.pipelines[index] = data;
        }
    }

    pub fn pre_call_record_create_graphics_pipelines(
        &self,
        infos: &mut [GraphicsPipelineCreateInfo],
        state: &mut CreatePipelinesState,
    ) {
        let _coarse = self.coarse_write();
        self.pre_call_record_create_pipelines(infos, state, |info, data, warned| {
            self.link_pipeline_libraries(info, data, warned)
        });
    }

    pub fn pre_call_record_create_compute_pipelines(
        &self,
        infos: &mut [ComputePipelineCreateInfo],
        state: &mut CreatePipelinesState,
    ) {
        let _coarse = self.coarse_write();
        self.pre_call_record_create_pipelines(infos, state, |_, _, _| Ok(()));
    }

    pub fn pre_call_record_create_ray_tracing_pipelines(
        &self,
        infos: &mut [RayTracingPipelineCreateInfo],
        state: &mut CreatePipelinesState,
    ) {
        let _coarse = self.coarse_write();
        self.pre_call_record_create_pipelines(infos, state, |_, _, _| Ok(()));
    }

    // ---------------------------------------------------------------------
    // Post-call bookkeeping
    // ---------------------------------------------------------------------

    /// Attach the instrumented shaders to the created pipelines
    pub(crate) fn record_created_pipelines(&self, pipelines: &[vk::Pipeline], state: CreatePipelinesState) {
        for (index, data) in state.pipelines.into_iter().enumerate() {
            if !data.is_instrumented() {
                continue;
            }
            for &layout in &data.instrumented_layouts {
                self.dispatch.destroy_pipeline_layout(layout);
            }
            let pipeline = pipelines.get(index).copied().unwrap_or_default();
            if pipeline == vk::Pipeline::null() {
                self.destroy_instrumentation_objects(&PipelineInstrumentationData {
                    instrumented_layouts: Vec::new(),
                    ..data
                });
                continue;
            }

            let mut substates = self.pipeline_substates.write();
            let substate = substates.entry(pipeline).or_default();
            for stage in &data.stages {
                let owner = if stage.original_module == vk::ShaderModule::null() {
                    ShaderOwner::InlinedInPipelineStage { pipeline }
                } else {
                    ShaderOwner::Pipeline {
                        pipeline,
                        shader_module: stage.original_module,
                    }
                };
                self.insert_record(stage.unique_shader_id, owner, stage.original_spirv.clone());
                substate.unique_shader_ids.push(stage.unique_shader_id);
                if stage.instrumented_module != vk::ShaderModule::null() {
                    substate.instrumented_modules.push(stage.instrumented_module);
                }
            }
            substate.recreated_libraries.extend(&data.recreated_libraries);
        }
    }

    pub fn post_call_record_create_graphics_pipelines(&self, pipelines: &[vk::Pipeline], state: CreatePipelinesState) {
        let _coarse = self.coarse_write();
        self.record_created_pipelines(pipelines, state);
    }

    pub fn post_call_record_create_compute_pipelines(&self, pipelines: &[vk::Pipeline], state: CreatePipelinesState) {
        let _coarse = self.coarse_write();
        self.record_created_pipelines(pipelines, state);
    }

    pub fn pre_call_record_destroy_pipeline(&self, pipeline: vk::Pipeline) {
        let _coarse = self.coarse_write();
        let Some(substate) = self.pipeline_substates.write().remove(&pipeline) else {
            return;
        };
        for module in substate.instrumented_modules {
            self.dispatch.destroy_shader_module(module);
        }
        for library in substate.recreated_libraries {
            self.dispatch.destroy_pipeline(library);
        }
        self.remove_records(&substate.unique_shader_ids);
    }
}
