// Shader object hooks (VK_EXT_shader_object)
//
// The code in the create info is replaced and its set layouts get the reserved
// set. The unique shader id is attached once the shader exists. Binary data
// queries are answered with a lazily created twin built from the original
// code, so applications never cache instrumented binaries.

use super::{ShaderInstrumentor, ShaderObjectSubState, ShaderOwner};
use crate::report::LogObjectList;
use crate::state::ShaderCreateInfo;
use ash::vk;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) struct PendingShaderObject {
    pub unique_shader_id: u32,
    pub original_create_info: ShaderCreateInfo,
}

/// Carried from the pre-call to the post-call of `vkCreateShadersEXT`,
/// one entry per create info
#[derive(Debug, Default)]
pub struct CreateShadersState {
    pub(crate) shaders: Vec<Option<PendingShaderObject>>,
}

impl CreateShadersState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unique_shader_id(&self, index: usize) -> Option<u32> {
        self.shaders
            .get(index)
            .and_then(|shader| shader.as_ref())
            .map(|shader| shader.unique_shader_id)
    }
}

impl ShaderInstrumentor {
    fn need_shader_object_instrumentation(&self, info: &ShaderCreateInfo, warned: &mut bool) -> bool {
        let desc_set_bind_index = self.reserved.lock().desc_set_bind_index as usize;
        if info.set_layouts.len() > desc_set_bind_index {
            if !*warned {
                *warned = true;
                self.warning(
                    &LogObjectList::new(),
                    &format!(
                        "Shader object uses {} descriptor sets, descriptor set {} is reserved for validation. \
                         The shader is not instrumented.",
                        info.set_layouts.len(),
                        desc_set_bind_index
                    ),
                );
            }
            return false;
        }
        if info.indirect_bindable {
            self.warning(
                &LogObjectList::new(),
                "Shader object is indirect bindable and can not be instrumented",
            );
            return false;
        }
        self.selector.wants(
            info.enable_instrumentation,
            vk::ShaderModule::null(),
            [info.debug_name.as_deref()],
        )
    }

    pub fn pre_call_record_create_shaders_ext(&self, infos: &mut [ShaderCreateInfo], state: &mut CreateShadersState) {
        let _coarse = self.coarse_write();
        state.shaders = vec![None; infos.len()];
        if self.is_aborted() {
            return;
        }

        let mut warned = false;
        for (info, pending) in infos.iter_mut().zip(state.shaders.iter_mut()) {
            if !self.need_shader_object_instrumentation(info, &mut warned) {
                continue;
            }
            let layouts = self.layouts_from_handles(&info.set_layouts);
            let Some((unique_shader_id, code)) = self.instrument(&info.code, &layouts, &LogObjectList::new()) else {
                continue;
            };
            let original_create_info = info.clone();
            info.code = code;
            info.set_layouts = self.instrumented_set_layouts(&original_create_info.set_layouts);
            *pending = Some(PendingShaderObject {
                unique_shader_id,
                original_create_info,
            });
        }
    }

    pub fn post_call_record_create_shaders_ext(&self, shaders: &[vk::ShaderEXT], state: CreateShadersState) {
        let _coarse = self.coarse_write();
        for (&shader, pending) in shaders.iter().zip(state.shaders) {
            let Some(pending) = pending else {
                continue;
            };
            if shader == vk::ShaderEXT::null() {
                continue;
            }
            let mut substates = self.shader_object_substates.write();
            self.insert_record(
                pending.unique_shader_id,
                ShaderOwner::ShaderObject { shader },
                Arc::from(pending.original_create_info.code.as_slice()),
            );
            substates.insert(
                shader,
                ShaderObjectSubState {
                    unique_shader_id: pending.unique_shader_id,
                    original_create_info: pending.original_create_info,
                },
            );
        }
    }

    /// The shader whose binary `vkGetShaderBinaryDataEXT` should return
    pub fn pre_call_record_get_shader_binary_data_ext(&self, shader: vk::ShaderEXT) -> vk::ShaderEXT {
        let _coarse = self.coarse_write();
        if self.is_aborted() {
            return shader;
        }
        let substates = self.shader_object_substates.read();
        let Some(substate) = substates.get(&shader) else {
            return shader;
        };

        let mut records = self.instrumented_shaders.write();
        let Some(record) = records.get_mut(&substate.unique_shader_id) else {
            return shader;
        };
        if record.original_shader_object != vk::ShaderEXT::null() {
            return record.original_shader_object;
        }

        let mut create_info = substate.original_create_info.clone();
        // The twin exists only for its binary, never linked with other stages
        create_info.flags &= !vk::ShaderCreateFlagsEXT::LINK_STAGE;
        match self.dispatch.create_shader(&create_info) {
            Ok(original) => {
                record.original_shader_object = original;
                original
            }
            Err(result) => {
                drop(records);
                drop(substates);
                self.internal_error(
                    &LogObjectList::new().with(shader),
                    &format!("Unable to create the original shader object: {:?}", result),
                );
                shader
            }
        }
    }

    pub fn pre_call_record_destroy_shader_ext(&self, shader: vk::ShaderEXT) {
        let _coarse = self.coarse_write();
        let Some(substate) = self.shader_object_substates.write().remove(&shader) else {
            return;
        };
        let record = self.instrumented_shaders.write().remove(&substate.unique_shader_id);
        if let Some(record) = record {
            if record.original_shader_object != vk::ShaderEXT::null() {
                self.dispatch.destroy_shader(record.original_shader_object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentor::DeviceFeatures;
    use crate::report::Severity;
    use crate::test_utils::{instrumentor_with, ShaderBuilder};
    use ash::vk::Handle;

    fn shader_info(code: Vec<u32>, set_layouts: Vec<vk::DescriptorSetLayout>) -> ShaderCreateInfo {
        ShaderCreateInfo {
            set_layouts,
            ..ShaderCreateInfo::new(vk::ShaderStageFlags::COMPUTE, code)
        }
    }

    #[test]
    fn shader_object_code_and_layouts_are_rewritten() {
        let (instrumentor, dispatch, _) = instrumentor_with(DeviceFeatures::all(), 8);
        let set_layout = dispatch.state_tracker().add_set_layout(4);
        let code = ShaderBuilder::compute().with_descriptor_array(4).build();

        let mut infos = vec![shader_info(code.clone(), vec![set_layout])];
        let mut state = CreateShadersState::new();
        instrumentor.pre_call_record_create_shaders_ext(&mut infos, &mut state);

        assert_ne!(infos[0].code, code);
        let reserved = instrumentor.reserved_descriptor_set();
        assert_eq!(infos[0].set_layouts.len(), 8);
        assert_eq!(infos[0].set_layouts[0], set_layout);
        assert_eq!(infos[0].set_layouts[1], reserved.dummy_desc_layout);
        assert_eq!(infos[0].set_layouts[7], reserved.instrumentation_desc_layout);

        let shader = vk::ShaderEXT::from_raw(0x4000);
        let id = state.unique_shader_id(0).unwrap();
        instrumentor.post_call_record_create_shaders_ext(&[shader], state);
        let record = instrumentor.instrumented_shader(id).unwrap();
        assert_eq!(record.owner, ShaderOwner::ShaderObject { shader });
        assert_eq!(&*record.original_spirv, code.as_slice());
    }

    #[test]
    fn shader_object_using_the_reserved_set_is_skipped_with_one_warning() {
        let (instrumentor, dispatch, report) = instrumentor_with(DeviceFeatures::all(), 4);
        let tracker = dispatch.state_tracker();
        let set_layouts: Vec<_> = (0..4).map(|_| tracker.add_set_layout(4)).collect();
        let code = ShaderBuilder::compute().with_descriptor_array(4).build();

        let mut infos = vec![
            shader_info(code.clone(), set_layouts.clone()),
            shader_info(code.clone(), set_layouts.clone()),
        ];
        let mut state = CreateShadersState::new();
        instrumentor.pre_call_record_create_shaders_ext(&mut infos, &mut state);

        for info in &infos {
            assert_eq!(info.code, code);
            assert_eq!(info.set_layouts, set_layouts);
        }
        assert!(state.unique_shader_id(0).is_none());
        assert!(state.unique_shader_id(1).is_none());
        let warnings = report.messages_with(Severity::Warning);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("descriptor set 3 is reserved"));
    }

    #[test]
    fn binary_queries_use_a_lazily_created_original() {
        let (instrumentor, dispatch, _) = instrumentor_with(DeviceFeatures::all(), 8);
        let code = ShaderBuilder::compute().with_descriptor_array(4).build();
        let set_layout = dispatch.state_tracker().add_set_layout(4);
        let mut infos = vec![shader_info(code.clone(), vec![set_layout])];
        let mut state = CreateShadersState::new();
        instrumentor.pre_call_record_create_shaders_ext(&mut infos, &mut state);
        let shader = vk::ShaderEXT::from_raw(0x4000);
        instrumentor.post_call_record_create_shaders_ext(&[shader], state);

        let original = instrumentor.pre_call_record_get_shader_binary_data_ext(shader);
        assert_ne!(original, shader);
        assert_eq!(dispatch.shader_code(original).unwrap(), code);
        assert_eq!(instrumentor.pre_call_record_get_shader_binary_data_ext(shader), original);
        assert_eq!(dispatch.created_shader_count(), 1);

        instrumentor.pre_call_record_destroy_shader_ext(shader);
        assert!(!dispatch.is_live_shader(original));
        assert_eq!(instrumentor.instrumented_shader_count(), 0);
    }

    #[test]
    fn uninstrumented_shader_answers_for_itself() {
        let (instrumentor, _, _) = instrumentor_with(DeviceFeatures::all(), 8);
        let shader = vk::ShaderEXT::from_raw(0x5000);
        assert_eq!(instrumentor.pre_call_record_get_shader_binary_data_ext(shader), shader);
    }

    #[test]
    fn twin_creation_failure_is_fatal() {
        let (instrumentor, dispatch, report) = instrumentor_with(DeviceFeatures::all(), 8);
        let set_layout = dispatch.state_tracker().add_set_layout(4);
        let mut infos = vec![shader_info(
            ShaderBuilder::compute().with_descriptor_array(4).build(),
            vec![set_layout],
        )];
        let mut state = CreateShadersState::new();
        instrumentor.pre_call_record_create_shaders_ext(&mut infos, &mut state);
        let shader = vk::ShaderEXT::from_raw(0x4000);
        instrumentor.post_call_record_create_shaders_ext(&[shader], state);

        dispatch.fail_shaders(true);
        assert_eq!(instrumentor.pre_call_record_get_shader_binary_data_ext(shader), shader);
        assert!(instrumentor.is_aborted());
        assert_eq!(report.count(Severity::Error), 1);
    }

    #[test]
    fn null_output_leaves_no_record() {
        let (instrumentor, dispatch, _) = instrumentor_with(DeviceFeatures::all(), 8);
        let set_layout = dispatch.state_tracker().add_set_layout(4);
        let mut infos = vec![shader_info(
            ShaderBuilder::compute().with_descriptor_array(4).build(),
            vec![set_layout],
        )];
        let mut state = CreateShadersState::new();
        instrumentor.pre_call_record_create_shaders_ext(&mut infos, &mut state);
        instrumentor.post_call_record_create_shaders_ext(&[vk::ShaderEXT::null()], state);
        assert_eq!(instrumentor.instrumented_shader_count(), 0);
    }
}
