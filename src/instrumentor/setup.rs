// Device setup and teardown
//
// Checks the features the instrumented code relies on, picks the reserved
// descriptor set index and creates the validation descriptor set layout, an
// empty dummy layout for the sets in between and a pipeline layout chaining
// them. Any failure here disables the instrumentor.

use super::{ShaderInstrumentor, ShaderSelector};
use crate::backend::DeviceDispatch;
use crate::config::GpuavSettings;
use crate::engine::{EngineOptions, ShaderInstrumentationEngine};
use crate::report::{DebugReport, LogObjectList, ValidationMode};
use crate::spirv::interface::{BINDING_COUNT, MAX_DESCRIPTOR_SETS};
use crate::state::StateTracker;
use crate::validator::ValidatorOptions;
use ash::vk;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::Arc;

/// Device features the instrumented code and the passes depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub fragment_stores_and_atomics: bool,
    pub vertex_pipeline_stores_and_atomics: bool,
    pub timeline_semaphore: bool,
    pub buffer_device_address: bool,
    pub vulkan_memory_model: bool,
    pub vulkan_memory_model_device_scope: bool,
    pub shader_int64: bool,
    pub robust_buffer_access: bool,
    pub shader_non_semantic_info: bool,
    pub scalar_block_layout: bool,
    pub uniform_buffer_standard_layout: bool,
}

impl DeviceFeatures {
    /// Every feature on except robust buffer access
    pub fn all() -> Self {
        Self {
            fragment_stores_and_atomics: true,
            vertex_pipeline_stores_and_atomics: true,
            timeline_semaphore: true,
            buffer_device_address: true,
            vulkan_memory_model: true,
            vulkan_memory_model_device_scope: true,
            shader_int64: true,
            robust_buffer_access: false,
            shader_non_semantic_info: true,
            scalar_block_layout: true,
            uniform_buffer_standard_layout: true,
        }
    }

    /// Name of the first missing prerequisite
    fn missing_prerequisite(&self) -> Option<&'static str> {
        if !self.fragment_stores_and_atomics {
            Some("fragmentStoresAndAtomics")
        } else if !self.vertex_pipeline_stores_and_atomics {
            Some("vertexPipelineStoresAndAtomics")
        } else if !self.timeline_semaphore {
            Some("timelineSemaphore")
        } else if !self.buffer_device_address {
            Some("bufferDeviceAddress")
        } else if self.vulkan_memory_model && !self.vulkan_memory_model_device_scope {
            Some("vulkanMemoryModelDeviceScope")
        } else {
            None
        }
    }

    pub fn validator_options(&self) -> ValidatorOptions {
        ValidatorOptions {
            // VK_KHR_maintenance1 relaxations are core since 1.1
            relax_block_layout: true,
            uniform_buffer_standard_layout: self.uniform_buffer_standard_layout,
            scalar_block_layout: self.scalar_block_layout,
        }
    }
}

/// What the device was created with
#[derive(Debug, Clone, Default)]
pub struct DeviceCreateParams {
    pub settings: GpuavSettings,
    pub features: DeviceFeatures,
    pub max_bound_descriptor_sets: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    FeatureChecked,
    ResourcesCreated,
    Active,
    Aborted,
    Destroyed,
}

/// The descriptor set slot taken over for validation, and its objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReservedDescriptorSet {
    pub desc_set_bind_index: u32,
    pub instrumentation_desc_layout: vk::DescriptorSetLayout,
    pub dummy_desc_layout: vk::DescriptorSetLayout,
    pub instrumentation_pipeline_layout: vk::PipelineLayout,
}

/// Bindings of the validation descriptor set, all storage buffers
fn instrumentation_bindings() -> Vec<vk::DescriptorSetLayoutBinding> {
    (0..BINDING_COUNT)
        .map(|binding| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build()
        })
        .collect()
}

impl ShaderInstrumentor {
    /// Set up instrumentation for a device. An instrumentor whose setup failed
    /// is returned aborted: every entry point then passes calls through.
    pub fn new(
        params: DeviceCreateParams,
        dispatch: Arc<dyn DeviceDispatch>,
        state_tracker: Arc<dyn StateTracker>,
        report: Arc<dyn DebugReport>,
    ) -> Self {
        let DeviceCreateParams {
            mut settings,
            features,
            max_bound_descriptor_sets,
        } = params;

        let buffer_device_address_unusable = settings.validation.buffer_device_address && !features.shader_int64;
        if buffer_device_address_unusable {
            settings.validation.buffer_device_address = false;
        }

        let mode = if !settings.any_validation_enabled() && settings.debug_printf.enabled {
            ValidationMode::DebugPrintfOnly
        } else {
            ValidationMode::GpuAssisted
        };
        let engine = ShaderInstrumentationEngine::new(
            EngineOptions::new(&settings, &features),
            features.validator_options(),
            report.clone(),
            mode.message_id(),
        );
        let selector = ShaderSelector::new(
            settings.instrumentation.select_instrumented_shaders,
            settings.shader_name_filters(),
        );

        let instrumentor = Self {
            settings,
            mode,
            report,
            dispatch,
            state_tracker,
            engine,
            selector,
            lifecycle: Mutex::new(LifecycleState::Uninitialized),
            aborted: AtomicBool::new(false),
            reserved: Mutex::new(ReservedDescriptorSet::default()),
            unique_shader_id: AtomicU32::new(0),
            instrumented_shaders: RwLock::new(HashMap::new()),
            pipeline_substates: RwLock::new(HashMap::new()),
            shader_object_substates: RwLock::new(HashMap::new()),
            coarse_lock: RwLock::new(()),
        };

        if buffer_device_address_unusable {
            instrumentor.warning(
                &LogObjectList::new(),
                "Buffer device address validation needs shaderInt64, which the device does not support. \
                 Buffer device address validation is disabled.",
            );
        }
        instrumentor.initialize(&features, max_bound_descriptor_sets);
        instrumentor
    }

    fn initialize(&self, features: &DeviceFeatures, max_bound_descriptor_sets: u32) {
        if let Some(feature) = features.missing_prerequisite() {
            self.internal_error(
                &LogObjectList::new(),
                &format!("GPU-AV requires the {} feature, which is not enabled on the device.", feature),
            );
            return;
        }
        *self.lifecycle.lock() = LifecycleState::FeatureChecked;

        if max_bound_descriptor_sets <= 1 {
            self.internal_error(
                &LogObjectList::new(),
                "Device can bind only a single descriptor set, none can be reserved for validation.",
            );
            return;
        }
        let desc_set_bind_index = max_bound_descriptor_sets.min(MAX_DESCRIPTOR_SETS) - 1;
        self.reserved.lock().desc_set_bind_index = desc_set_bind_index;

        if let Err((what, result)) = self.create_reserved_objects(desc_set_bind_index) {
            self.internal_error(
                &LogObjectList::new(),
                &format!("Unable to create the {}: {:?}", what, result),
            );
            return;
        }
        *self.lifecycle.lock() = LifecycleState::ResourcesCreated;
        log::info!("Shader instrumentation active, descriptor set {} reserved", desc_set_bind_index);
        *self.lifecycle.lock() = LifecycleState::Active;
    }

    /// Create the reserved layouts; whatever was created stays recorded for teardown
    fn create_reserved_objects(&self, desc_set_bind_index: u32) -> Result<(), (&'static str, vk::Result)> {
        let bindings = instrumentation_bindings();
        let instrumentation_desc_layout = self
            .dispatch
            .create_descriptor_set_layout(&bindings)
            .map_err(|e| ("instrumentation descriptor set layout", e))?;
        self.reserved.lock().instrumentation_desc_layout = instrumentation_desc_layout;

        let dummy_desc_layout = self
            .dispatch
            .create_descriptor_set_layout(&[])
            .map_err(|e| ("dummy descriptor set layout", e))?;
        self.reserved.lock().dummy_desc_layout = dummy_desc_layout;

        let mut set_layouts = vec![dummy_desc_layout; desc_set_bind_index as usize];
        set_layouts.push(instrumentation_desc_layout);
        let pipeline_layout = self
            .dispatch
            .create_pipeline_layout(&set_layouts, &[])
            .map_err(|e| ("instrumentation pipeline layout", e))?;
        self.reserved.lock().instrumentation_pipeline_layout = pipeline_layout;
        Ok(())
    }

    /// Destroy the reserved objects that exist; safe to call repeatedly
    pub(crate) fn release_reserved_objects(&self) {
        let mut reserved = self.reserved.lock();
        if reserved.instrumentation_pipeline_layout != vk::PipelineLayout::null() {
            self.dispatch
                .destroy_pipeline_layout(reserved.instrumentation_pipeline_layout);
            reserved.instrumentation_pipeline_layout = vk::PipelineLayout::null();
        }
        if reserved.instrumentation_desc_layout != vk::DescriptorSetLayout::null() {
            self.dispatch
                .destroy_descriptor_set_layout(reserved.instrumentation_desc_layout);
            reserved.instrumentation_desc_layout = vk::DescriptorSetLayout::null();
        }
        if reserved.dummy_desc_layout != vk::DescriptorSetLayout::null() {
            self.dispatch
                .destroy_descriptor_set_layout(reserved.dummy_desc_layout);
            reserved.dummy_desc_layout = vk::DescriptorSetLayout::null();
        }
    }

    pub fn reserved_descriptor_set(&self) -> ReservedDescriptorSet {
        *self.reserved.lock()
    }

    /// Hide the reserved set from the application
    pub fn adjust_physical_device_limits(&self, limits: &mut vk::PhysicalDeviceLimits) {
        if self.is_aborted() {
            return;
        }
        let index = self.reserved.lock().desc_set_bind_index;
        if limits.max_bound_descriptor_sets > index {
            limits.max_bound_descriptor_sets = index;
        }
    }

    pub fn pre_call_record_destroy_device(&self) {
        let _coarse = self.coarse_write();

        let pipelines: Vec<_> = self.pipeline_substates.write().drain().collect();
        for (_, substate) in pipelines {
            for module in substate.instrumented_modules {
                self.dispatch.destroy_shader_module(module);
            }
            for library in substate.recreated_libraries {
                self.dispatch.destroy_pipeline(library);
            }
        }
        self.shader_object_substates.write().clear();
        let originals: Vec<_> = self
            .instrumented_shaders
            .write()
            .drain()
            .map(|(_, record)| record.original_shader_object)
            .filter(|shader| *shader != vk::ShaderEXT::null())
            .collect();
        for shader in originals {
            self.dispatch.destroy_shader(shader);
        }

        self.release_reserved_objects();
        self.set_aborted();
        *self.lifecycle.lock() = LifecycleState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentor::LifecycleState;
    use crate::report::Severity;
    use crate::test_utils::{instrumentor_with, FakeDispatch};

    #[test]
    fn healthy_device_reserves_the_last_usable_set() {
        let (instrumentor, dispatch, _) = instrumentor_with(DeviceFeatures::all(), 8);
        assert_eq!(instrumentor.lifecycle_state(), LifecycleState::Active);

        let reserved = instrumentor.reserved_descriptor_set();
        assert_eq!(reserved.desc_set_bind_index, 7);
        let layouts = dispatch.pipeline_layout_sets(reserved.instrumentation_pipeline_layout).unwrap();
        assert_eq!(layouts.len(), 8);
        assert_eq!(layouts[7], reserved.instrumentation_desc_layout);
        assert!(layouts[..7].iter().all(|layout| *layout == reserved.dummy_desc_layout));
    }

    #[test]
    fn reserved_index_is_capped() {
        let (instrumentor, _, _) = instrumentor_with(DeviceFeatures::all(), 64);
        assert_eq!(instrumentor.reserved_descriptor_set().desc_set_bind_index, MAX_DESCRIPTOR_SETS - 1);

        let mut limits = vk::PhysicalDeviceLimits {
            max_bound_descriptor_sets: 64,
            ..Default::default()
        };
        instrumentor.adjust_physical_device_limits(&mut limits);
        assert_eq!(limits.max_bound_descriptor_sets, MAX_DESCRIPTOR_SETS - 1);
    }

    #[test]
    fn missing_buffer_device_address_aborts_without_leaking() {
        let features = DeviceFeatures {
            buffer_device_address: false,
            ..DeviceFeatures::all()
        };
        let (instrumentor, dispatch, report) = instrumentor_with(features, 8);

        assert_eq!(instrumentor.lifecycle_state(), LifecycleState::Aborted);
        assert!(instrumentor.is_aborted());
        assert_eq!(report.count(Severity::Error), 1);
        assert!(report.messages_with(Severity::Error)[0].contains("bufferDeviceAddress"));
        assert_eq!(dispatch.live_object_count(), 0);
    }

    #[test]
    fn memory_model_needs_device_scope() {
        let features = DeviceFeatures {
            vulkan_memory_model_device_scope: false,
            ..DeviceFeatures::all()
        };
        let (instrumentor, _, _) = instrumentor_with(features, 8);
        assert!(instrumentor.is_aborted());
    }

    #[test]
    fn single_descriptor_set_device_is_fatal() {
        let (instrumentor, dispatch, _) = instrumentor_with(DeviceFeatures::all(), 1);
        assert!(instrumentor.is_aborted());
        assert_eq!(dispatch.live_object_count(), 0);
    }

    #[test]
    fn creation_failure_rolls_back() {
        let dispatch = Arc::new(FakeDispatch::default());
        dispatch.fail_pipeline_layouts(true);
        let (instrumentor, dispatch, report) =
            crate::test_utils::instrumentor_with_dispatch(dispatch, DeviceFeatures::all(), 8, GpuavSettings::default());

        assert!(instrumentor.is_aborted());
        assert_eq!(report.count(Severity::Error), 1);
        assert_eq!(dispatch.live_object_count(), 0);
        assert_eq!(instrumentor.reserved_descriptor_set().instrumentation_desc_layout, vk::DescriptorSetLayout::null());
    }

    #[test]
    fn teardown_is_reentrant() {
        let (instrumentor, dispatch, _) = instrumentor_with(DeviceFeatures::all(), 8);
        instrumentor.pre_call_record_destroy_device();
        instrumentor.pre_call_record_destroy_device();
        assert_eq!(instrumentor.lifecycle_state(), LifecycleState::Destroyed);
        assert_eq!(dispatch.live_object_count(), 0);
    }

    #[test]
    fn missing_int64_disables_buffer_device_address_checks() {
        let features = DeviceFeatures {
            shader_int64: false,
            ..DeviceFeatures::all()
        };
        let (instrumentor, _, report) = instrumentor_with(features, 8);
        assert!(!instrumentor.is_aborted());
        assert!(!instrumentor.settings().validation.buffer_device_address);
        assert_eq!(report.count(Severity::Warning), 1);
    }
}
