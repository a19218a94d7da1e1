// Shader instrumentor - per-device integration of the engine
//
// One `ShaderInstrumentor` exists per logical device. It owns the unique
// shader id counter, the records of every instrumented shader and the
// reserved descriptor set objects, and it hooks instrumentation into every
// object creation call that carries shaders.
//
// Lock order: selection set -> pipeline / shader object substates -> records.

mod deferred;
mod library;
mod pipeline;
mod selection;
mod setup;
mod shader_object;

pub use deferred::{DeferredCompletion, DeferredOperationCallbacks};
pub use pipeline::{CreatePipelinesState, PipelineInstrumentationData};
pub use selection::ShaderSelector;
pub use setup::{DeviceCreateParams, DeviceFeatures, LifecycleState, ReservedDescriptorSet};
pub use shader_object::CreateShadersState;

use crate::backend::DeviceDispatch;
use crate::config::GpuavSettings;
use crate::debug_info::{generate_debug_info_message, ShaderMessageInfo};
use crate::debug_printf::{find_string, format_printf, PrintfRecord};
use crate::descriptor_layout::InstrumentationDescriptorSetLayouts;
use crate::engine::ShaderInstrumentationEngine;
use crate::error_message::GpuErrorRecord;
use crate::report::{DebugReport, LogObjectList, Severity, ValidationMode};
use crate::spirv::interface::MAX_INSTRUMENTED_SHADERS;
use crate::state::{ShaderCreateInfo, StateTracker};
use ash::vk;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// The object an instrumented shader belongs to; exactly one kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderOwner {
    /// Standalone module used by a pipeline stage
    Pipeline {
        pipeline: vk::Pipeline,
        shader_module: vk::ShaderModule,
    },
    /// SPIR-V chained directly into a pipeline stage
    InlinedInPipelineStage { pipeline: vk::Pipeline },
    ShaderObject { shader: vk::ShaderEXT },
}

impl ShaderOwner {
    pub fn objects(&self) -> LogObjectList {
        match *self {
            ShaderOwner::Pipeline {
                pipeline,
                shader_module,
            } => LogObjectList::new().with(pipeline).with(shader_module),
            ShaderOwner::InlinedInPipelineStage { pipeline } => LogObjectList::new().with(pipeline),
            ShaderOwner::ShaderObject { shader } => LogObjectList::new().with(shader),
        }
    }
}

/// What is kept of every instrumented shader, keyed by unique shader id
#[derive(Debug, Clone)]
pub struct InstrumentedShader {
    pub unique_shader_id: u32,
    pub owner: ShaderOwner,
    pub original_spirv: Arc<[u32]>,
    /// Non-instrumented twin of a shader object, created on first request
    pub original_shader_object: vk::ShaderEXT,
}

/// Objects created on behalf of one application pipeline
#[derive(Debug, Clone, Default)]
pub(crate) struct PipelineSubState {
    pub unique_shader_ids: Vec<u32>,
    pub instrumented_modules: Vec<vk::ShaderModule>,
    pub recreated_libraries: Vec<vk::Pipeline>,
}

#[derive(Debug, Clone)]
pub(crate) struct ShaderObjectSubState {
    pub unique_shader_id: u32,
    /// Create info with the application's code, for the original twin
    pub original_create_info: ShaderCreateInfo,
}

pub struct ShaderInstrumentor {
    pub(crate) settings: GpuavSettings,
    pub(crate) mode: ValidationMode,
    pub(crate) report: Arc<dyn DebugReport>,
    pub(crate) dispatch: Arc<dyn DeviceDispatch>,
    pub(crate) state_tracker: Arc<dyn StateTracker>,
    pub(crate) engine: ShaderInstrumentationEngine,
    pub(crate) selector: ShaderSelector,

    pub(crate) lifecycle: Mutex<LifecycleState>,
    aborted: AtomicBool,
    pub(crate) reserved: Mutex<ReservedDescriptorSet>,

    unique_shader_id: AtomicU32,
    pub(crate) instrumented_shaders: RwLock<HashMap<u32, InstrumentedShader>>,
    pub(crate) pipeline_substates: RwLock<HashMap<vk::Pipeline, PipelineSubState>>,
    pub(crate) shader_object_substates: RwLock<HashMap<vk::ShaderEXT, ShaderObjectSubState>>,

    /// Taken around every entry point when fine grained locking is off
    coarse_lock: RwLock<()>,
}

impl ShaderInstrumentor {
    // ---------------------------------------------------------------------
    // Reporting
    // ---------------------------------------------------------------------

    /// Report a fatal problem and disable the instrumentor for the rest of the device's life
    pub fn internal_error(&self, objects: &LogObjectList, message: &str) {
        self.report.report(
            Severity::Error,
            self.mode.message_id(),
            objects,
            &format!("Internal Error, GPU-AV is being disabled. Details:\n{}", message),
        );
        if !self.aborted.swap(true, Ordering::SeqCst) {
            *self.lifecycle.lock() = LifecycleState::Aborted;
            self.release_reserved_objects();
        }
    }

    pub fn warning(&self, objects: &LogObjectList, message: &str) {
        self.report
            .report(Severity::Warning, self.mode.message_id(), objects, message);
    }

    pub fn info(&self, objects: &LogObjectList, message: &str) {
        self.report
            .report(Severity::Info, self.mode.message_id(), objects, message);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.lifecycle.lock()
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn settings(&self) -> &GpuavSettings {
        &self.settings
    }

    // ---------------------------------------------------------------------
    // Locking
    // ---------------------------------------------------------------------

    pub(crate) fn coarse_write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        (!self.settings.locking.fine_grained).then(|| self.coarse_lock.write())
    }

    pub(crate) fn coarse_read(&self) -> Option<RwLockReadGuard<'_, ()>> {
        (!self.settings.locking.fine_grained).then(|| self.coarse_lock.read())
    }

    // ---------------------------------------------------------------------
    // Unique shader ids
    // ---------------------------------------------------------------------

    /// Next unique shader id; `None` once the id space is exhausted
    pub fn next_unique_shader_id(&self) -> Option<u32> {
        self.unique_shader_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                (id < MAX_INSTRUMENTED_SHADERS).then_some(id + 1)
            })
            .ok()
    }

    /// Instrument one shader with a fresh id. Returns the id and the new code.
    pub(crate) fn instrument(
        &self,
        spirv: &[u32],
        layouts: &InstrumentationDescriptorSetLayouts,
        objects: &LogObjectList,
    ) -> Option<(u32, Vec<u32>)> {
        let Some(unique_shader_id) = self.next_unique_shader_id() else {
            self.warning(
                objects,
                &format!(
                    "Maximum of {} instrumented shaders reached, shader left uninstrumented",
                    MAX_INSTRUMENTED_SHADERS
                ),
            );
            return None;
        };
        let desc_set_bind_index = self.reserved.lock().desc_set_bind_index;
        let code = self
            .engine
            .instrument_shader(spirv, unique_shader_id, layouts, desc_set_bind_index)?;
        Some((unique_shader_id, code))
    }

    /// Descriptor layout table for a list of set layout handles
    pub(crate) fn layouts_from_handles(&self, handles: &[vk::DescriptorSetLayout]) -> InstrumentationDescriptorSetLayouts {
        let set_layouts: Vec<_> = handles
            .iter()
            .map(|&handle| self.state_tracker.descriptor_set_layout(handle))
            .collect();
        InstrumentationDescriptorSetLayouts::from_set_layouts(&set_layouts)
    }

    /// Set layouts with the validation layout at the reserved index and dummies in between
    pub(crate) fn instrumented_set_layouts(&self, application: &[vk::DescriptorSetLayout]) -> Vec<vk::DescriptorSetLayout> {
        let reserved = self.reserved.lock();
        let index = reserved.desc_set_bind_index as usize;
        debug_assert!(
            application.len() <= index,
            "set layouts at or past the reserved index {} would be dropped",
            index
        );
        let mut set_layouts: Vec<_> = application
            .iter()
            .take(index)
            .map(|&layout| {
                if layout == vk::DescriptorSetLayout::null() {
                    reserved.dummy_desc_layout
                } else {
                    layout
                }
            })
            .collect();
        set_layouts.resize(index, reserved.dummy_desc_layout);
        set_layouts.push(reserved.instrumentation_desc_layout);
        set_layouts
    }

    // ---------------------------------------------------------------------
    // Records
    // ---------------------------------------------------------------------

    pub fn instrumented_shader(&self, unique_shader_id: u32) -> Option<InstrumentedShader> {
        self.instrumented_shaders.read().get(&unique_shader_id).cloned()
    }

    pub fn instrumented_shader_count(&self) -> usize {
        self.instrumented_shaders.read().len()
    }

    pub(crate) fn insert_record(&self, unique_shader_id: u32, owner: ShaderOwner, original_spirv: Arc<[u32]>) {
        let previous = self.instrumented_shaders.write().insert(
            unique_shader_id,
            InstrumentedShader {
                unique_shader_id,
                owner,
                original_spirv,
                original_shader_object: vk::ShaderEXT::null(),
            },
        );
        debug_assert!(previous.is_none(), "unique shader id {} recorded twice", unique_shader_id);
    }

    pub(crate) fn remove_records(&self, unique_shader_ids: &[u32]) {
        let mut records = self.instrumented_shaders.write();
        for id in unique_shader_ids {
            records.remove(id);
        }
    }

    // ---------------------------------------------------------------------
    // Reading back GPU output
    // ---------------------------------------------------------------------

    /// Message describing where the shader that produced a record ran
    pub fn debug_info_message(
        &self,
        command_buffer: vk::CommandBuffer,
        info: &ShaderMessageInfo,
        bind_point: vk::PipelineBindPoint,
        operation_index: u32,
    ) -> String {
        let records = self.instrumented_shaders.read();
        generate_debug_info_message(
            command_buffer,
            info,
            records.get(&info.shader_id),
            bind_point,
            operation_index,
        )
    }

    fn record_objects(&self, command_buffer: vk::CommandBuffer, shader_id: u32) -> LogObjectList {
        let mut objects = self
            .instrumented_shader(shader_id)
            .map(|record| record.owner.objects())
            .unwrap_or_default();
        objects.add(command_buffer);
        objects
    }

    /// Report every error record of a read back error output buffer
    /// (`[written_words, records...]`). Returns the number of records.
    pub fn process_error_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        operation_index: u32,
        buffer: &[u32],
    ) -> usize {
        let _coarse = self.coarse_read();
        let Some((&written, data)) = buffer.split_first() else {
            return 0;
        };
        let end = (written as usize).min(data.len());
        let mut offset = 0;
        let mut count = 0;

        while offset < end {
            let Some(record) = GpuErrorRecord::parse(&data[offset..end]) else {
                log::warn!("truncated error record at word {}", offset);
                break;
            };
            let info = record.message_info();
            let message = format!(
                "{}\n{}",
                record.error_message(),
                self.debug_info_message(command_buffer, &info, bind_point, operation_index)
            );
            let objects = self.record_objects(command_buffer, record.shader_id);
            self.report
                .report(Severity::Error, self.mode.message_id(), &objects, &message);
            offset += record.size as usize;
            count += 1;
        }
        count
    }

    /// Print every record of a read back debug printf buffer. Returns the number of records.
    pub fn process_debug_printf_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        operation_index: u32,
        buffer: &[u32],
    ) -> usize {
        let _coarse = self.coarse_read();
        let Some((&written, data)) = buffer.split_first() else {
            return 0;
        };
        let end = (written as usize).min(data.len());
        let mut offset = 0;
        let mut count = 0;

        while offset < end {
            let Some(record) = PrintfRecord::parse(&data[offset..end]) else {
                log::warn!("truncated debug printf record at word {}", offset);
                break;
            };
            let format = self
                .instrumented_shader(record.info.shader_id)
                .and_then(|shader| find_string(&shader.original_spirv, record.format_string_id));
            let text = match format {
                Some(format) => format_printf(&format, &record.values),
                None => format!("<format string {} not found>", record.format_string_id),
            };
            let message = if self.settings.debug.print_debug_info {
                format!(
                    "{}\n{}",
                    text,
                    self.debug_info_message(command_buffer, &record.info, bind_point, operation_index)
                )
            } else {
                text
            };
            let objects = self.record_objects(command_buffer, record.info.shader_id);
            self.report.report(
                Severity::Info,
                ValidationMode::DebugPrintfOnly.message_id(),
                &objects,
                &message,
            );
            offset += record.size as usize;
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::instruction::parse_instructions;
    use crate::spirv::interface::{self, error_group, pack_set_binding, ERROR_RECORD_SIZE, PRINTF_HEADER_SIZE};
    use crate::state::{ComputePipelineCreateInfo, ShaderStageCreateInfo};
    use crate::test_utils::{instrumentor_with, instrumentor_with_settings, ShaderBuilder};
    use ash::vk::Handle;
    use rspirv::spirv::Op;

    /// Create and instrument one compute pipeline, returning its unique shader id
    fn compute_pipeline(instrumentor: &ShaderInstrumentor, dispatch: &crate::test_utils::FakeDispatch, spirv: Vec<u32>) -> u32 {
        let tracker = dispatch.state_tracker();
        let module = tracker.add_module(spirv);
        let layout = tracker.add_pipeline_layout(&[4]);
        let mut infos = vec![ComputePipelineCreateInfo {
            flags: vk::PipelineCreateFlags::empty(),
            stage: ShaderStageCreateInfo::from_module(vk::ShaderStageFlags::COMPUTE, module),
            layout,
            debug_name: None,
            enable_instrumentation: false,
            indirect_bindable: false,
        }];
        let mut state = CreatePipelinesState::new();
        instrumentor.pre_call_record_create_compute_pipelines(&mut infos, &mut state);
        let id = state.pipeline(0).unwrap().unique_shader_ids()[0];
        instrumentor.post_call_record_create_compute_pipelines(&[vk::Pipeline::from_raw(0x1000)], state);
        id
    }

    #[test]
    fn unique_ids_are_sequential() {
        let (instrumentor, _, _) = instrumentor_with(DeviceFeatures::all(), 8);
        assert_eq!(instrumentor.next_unique_shader_id(), Some(0));
        assert_eq!(instrumentor.next_unique_shader_id(), Some(1));
    }

    #[test]
    fn set_layouts_are_padded_up_to_the_reserved_set() {
        let (instrumentor, _, _) = instrumentor_with(DeviceFeatures::all(), 4);
        let application = vk::DescriptorSetLayout::from_raw(0x77);
        let reserved = instrumentor.reserved_descriptor_set();

        let layouts = instrumentor.instrumented_set_layouts(&[application, vk::DescriptorSetLayout::null()]);
        assert_eq!(
            layouts,
            vec![
                application,
                reserved.dummy_desc_layout,
                reserved.dummy_desc_layout,
                reserved.instrumentation_desc_layout
            ]
        );
    }

    #[test]
    fn error_records_are_reported_with_debug_info() {
        let (instrumentor, dispatch, report) = instrumentor_with(DeviceFeatures::all(), 8);
        let id = compute_pipeline(&instrumentor, &dispatch, ShaderBuilder::compute().with_descriptor_array(4).build());

        let mut buffer = vec![
            ERROR_RECORD_SIZE,
            ERROR_RECORD_SIZE,
            id,
            0,
            crate::spirv::execution_model::GL_COMPUTE,
            3,
            0,
            0,
            error_group::DESCRIPTOR_INDEXING,
            interface::descriptor_indexing::INDEX_OOB,
            6,
            4,
            pack_set_binding(0, 0),
        ];
        // Words past the written count are ignored
        buffer.extend_from_slice(&[0xdead; 4]);

        let count = instrumentor.process_error_buffer(
            vk::CommandBuffer::from_raw(0x10),
            vk::PipelineBindPoint::COMPUTE,
            2,
            &buffer,
        );
        assert_eq!(count, 1);
        let errors = report.messages_with(Severity::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Index of 6 used to index descriptor array of length 4"));
        assert!(errors[0].contains("Global invocation ID (x, y, z) = (3, 0, 0)"));
        assert!(errors[0].contains("Compute Dispatch Index = 2"));
        assert!(errors[0].contains("Pipeline (0x1000)"));
    }

    #[test]
    fn corrupt_record_sizes_stop_processing() {
        let (instrumentor, _, report) = instrumentor_with(DeviceFeatures::all(), 8);
        let buffer = [4, 0, 0, 0, 0];
        let count = instrumentor.process_error_buffer(
            vk::CommandBuffer::null(),
            vk::PipelineBindPoint::GRAPHICS,
            0,
            &buffer,
        );
        assert_eq!(count, 0);
        assert_eq!(report.count(Severity::Error), 0);
    }

    #[test]
    fn printf_records_are_formatted_from_the_original_shader() {
        let mut settings = GpuavSettings::default();
        settings.debug_printf.enabled = true;
        let (instrumentor, dispatch, report) = instrumentor_with_settings(settings);
        let spirv = ShaderBuilder::compute().with_debug_printf("value = %u", &[3]).build();
        let format_id = parse_instructions(&spirv)
            .unwrap()
            .iter()
            .find(|inst| inst.is(Op::String))
            .unwrap()
            .result_id();
        let id = compute_pipeline(&instrumentor, &dispatch, spirv);

        let size = PRINTF_HEADER_SIZE + 1;
        let buffer = [size, size, id, 0, 5, 0, 0, 0, format_id, 3];
        let count = instrumentor.process_debug_printf_buffer(
            vk::CommandBuffer::from_raw(0x10),
            vk::PipelineBindPoint::COMPUTE,
            0,
            &buffer,
        );
        assert_eq!(count, 1);
        assert_eq!(report.messages_with(Severity::Info), vec!["value = 3".to_string()]);
    }
}
