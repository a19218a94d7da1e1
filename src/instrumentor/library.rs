// Graphics pipeline library linking
//
// Libraries are never instrumented when created on their own. When a
// pipeline links them, each library with selected stages is rebuilt from its
// create info with instrumented code and the reserved set in its layout, and
// the rebuilt library is linked instead. Rebuilt libraries live as long as
// the linking pipeline.

use super::pipeline::{Fatal, PipelineInstrumentationData};
use super::ShaderInstrumentor;
use crate::descriptor_layout::InstrumentationDescriptorSetLayouts;
use crate::report::LogObjectList;
use crate::state::GraphicsPipelineCreateInfo;
use ash::vk;

impl ShaderInstrumentor {
    pub(crate) fn link_pipeline_libraries(
        &self,
        info: &mut GraphicsPipelineCreateInfo,
        data: &mut PipelineInstrumentationData,
        warned: &mut bool,
    ) -> Result<(), Fatal> {
        for library in info.libraries.iter_mut() {
            if let Some(recreated) = self.recreate_library(*library, data, warned)? {
                *library = recreated;
            }
        }
        Ok(())
    }

    /// Rebuild one library; `None` when nothing in it was instrumented
    fn recreate_library(
        &self,
        library: vk::Pipeline,
        data: &mut PipelineInstrumentationData,
        warned: &mut bool,
    ) -> Result<Option<vk::Pipeline>, Fatal> {
        let Some(library_state) = self.state_tracker.pipeline_library(library) else {
            log::debug!("linked library {:?} is not tracked", library);
            return Ok(None);
        };
        if library_state.create_info.stages.is_empty() {
            return Ok(None);
        }

        let layout = self.state_tracker.pipeline_layout(library_state.create_info.layout);
        if layout.as_deref().map_or(false, |layout| self.layout_uses_reserved_slot(layout, warned)) {
            return Ok(None);
        }
        let layouts = layout
            .as_ref()
            .map(|layout| InstrumentationDescriptorSetLayouts::from_set_layouts(&layout.set_layouts))
            .unwrap_or_default();

        let mut create_info = library_state.create_info.clone();
        let stages_before = data.stages.len();
        self.instrument_stages(&mut create_info, &layouts, data)?;
        if data.stages.len() == stages_before {
            return Ok(None);
        }

        create_info.flags &= !vk::PipelineCreateFlags::FAIL_ON_PIPELINE_COMPILE_REQUIRED_EXT;
        if let Some(layout) = layout.as_deref() {
            let instrumented_layout = self.create_instrumented_layout(layout)?;
            data.instrumented_layouts.push(instrumented_layout);
            create_info.layout = instrumented_layout;
        }

        match self.dispatch.create_graphics_pipeline_library(&create_info) {
            Ok(recreated) => {
                data.recreated_libraries.push(recreated);
                Ok(Some(recreated))
            }
            Err(result) => {
                self.internal_error(
                    &LogObjectList::new().with(library),
                    &format!("Unable to recreate the instrumented pipeline library: {:?}", result),
                );
                Err(Fatal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::instrumentor::{CreatePipelinesState, DeviceFeatures, ShaderOwner};
    use crate::report::Severity;
    use crate::state::{GraphicsPipelineCreateInfo, ShaderStageCreateInfo};
    use crate::test_utils::{instrumentor_with, ShaderBuilder};
    use ash::vk;
    use ash::vk::Handle;

    fn library_info(module: vk::ShaderModule, layout: vk::PipelineLayout) -> GraphicsPipelineCreateInfo {
        GraphicsPipelineCreateInfo {
            flags: vk::PipelineCreateFlags::LIBRARY_KHR | vk::PipelineCreateFlags::FAIL_ON_PIPELINE_COMPILE_REQUIRED_EXT,
            stages: vec![ShaderStageCreateInfo::from_module(vk::ShaderStageFlags::VERTEX, module)],
            layout,
            library_flags: vk::GraphicsPipelineLibraryFlagsEXT::PRE_RASTERIZATION_SHADERS,
            ..Default::default()
        }
    }

    #[test]
    fn linked_library_is_recreated_and_owned_by_the_linking_pipeline() {
        let (instrumentor, dispatch, _) = instrumentor_with(DeviceFeatures::all(), 8);
        let tracker = dispatch.state_tracker();
        let module = tracker.add_module(ShaderBuilder::vertex().with_vertex_input().build());
        let layout = tracker.add_pipeline_layout(&[1]);
        let library = tracker.add_library(library_info(module, layout));

        let mut infos = vec![GraphicsPipelineCreateInfo {
            layout,
            libraries: vec![library],
            ..Default::default()
        }];
        let mut state = CreatePipelinesState::new();
        instrumentor.pre_call_record_create_graphics_pipelines(&mut infos, &mut state);

        let recreated = infos[0].libraries[0];
        assert_ne!(recreated, library);
        let recreated_info = dispatch.library_create_info(recreated).unwrap();
        assert!(!recreated_info
            .flags
            .contains(vk::PipelineCreateFlags::FAIL_ON_PIPELINE_COMPILE_REQUIRED_EXT));
        assert_ne!(recreated_info.stages[0].module, module);
        assert_ne!(recreated_info.layout, layout);
        // The library handed in by the application is untouched
        assert_eq!(tracker.pipeline_library_info(library).stages[0].module, module);

        let pipeline = vk::Pipeline::from_raw(0x3000);
        instrumentor.post_call_record_create_graphics_pipelines(&[pipeline], state);
        let record = instrumentor.instrumented_shader(0).unwrap();
        assert_eq!(
            record.owner,
            ShaderOwner::Pipeline {
                pipeline,
                shader_module: module
            }
        );

        instrumentor.pre_call_record_destroy_pipeline(pipeline);
        assert!(!dispatch.is_live_pipeline(recreated));
        assert_eq!(instrumentor.instrumented_shader_count(), 0);
    }

    #[test]
    fn library_recreation_failure_is_fatal() {
        let (instrumentor, dispatch, report) = instrumentor_with(DeviceFeatures::all(), 8);
        let tracker = dispatch.state_tracker();
        let module = tracker.add_module(ShaderBuilder::vertex().with_vertex_input().build());
        let layout = tracker.add_pipeline_layout(&[1]);
        let library = tracker.add_library(library_info(module, layout));
        dispatch.fail_libraries(true);

        let mut infos = vec![GraphicsPipelineCreateInfo {
            layout,
            libraries: vec![library],
            ..Default::default()
        }];
        let mut state = CreatePipelinesState::new();
        instrumentor.pre_call_record_create_graphics_pipelines(&mut infos, &mut state);

        assert!(instrumentor.is_aborted());
        assert_eq!(infos[0].libraries, vec![library]);
        assert_eq!(report.count(Severity::Error), 1);
        assert_eq!(dispatch.live_object_count(), 0);
    }

    #[test]
    fn library_layout_using_the_reserved_set_is_not_recreated() {
        let (instrumentor, dispatch, report) = instrumentor_with(DeviceFeatures::all(), 4);
        let tracker = dispatch.state_tracker();
        let module = tracker.add_module(ShaderBuilder::vertex().with_vertex_input().build());
        let library_layout = tracker.add_pipeline_layout(&[1, 1, 1, 1]);
        let library = tracker.add_library(library_info(module, library_layout));
        let layout = tracker.add_pipeline_layout(&[1]);

        let mut infos = vec![GraphicsPipelineCreateInfo {
            layout,
            libraries: vec![library],
            ..Default::default()
        }];
        let live_before = dispatch.live_object_count();
        let mut state = CreatePipelinesState::new();
        instrumentor.pre_call_record_create_graphics_pipelines(&mut infos, &mut state);

        assert_eq!(infos[0].libraries, vec![library]);
        assert_eq!(infos[0].layout, layout);
        assert!(!state.pipeline(0).unwrap().is_instrumented());
        assert_eq!(report.count(Severity::Warning), 1);
        assert!(report.messages_with(Severity::Warning)[0].contains("descriptor set 3 is reserved"));
        assert_eq!(dispatch.live_object_count(), live_before);
    }
}
