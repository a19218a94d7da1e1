// Shader instrumentation engine
//
// Turns one SPIR-V binary into its instrumented version: parse, run the
// enabled passes in their fixed order, link helpers, legalize, serialize.
// Optionally dumps both binaries and self-checks the output.

use crate::config::GpuavSettings;
use crate::descriptor_layout::InstrumentationDescriptorSetLayouts;
use crate::instrumentor::DeviceFeatures;
use crate::report::{DebugReport, LogObjectList, Severity};
use crate::spirv::instruction::MAGIC_NUMBER;
use crate::spirv::interface::MAX_INSTRUMENTED_SHADERS;
use crate::spirv::link::link_functions;
use crate::spirv::passes::{
    buffer_device_address, debug_printf, descriptor_class, descriptor_indexing, log_error,
    post_process, ray_query, vertex_attribute_fetch,
};
use crate::spirv::{Module, ModuleSettings};
use crate::validator::{SpirvToolsValidator, SpirvValidator, ValidatorOptions};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything that decides what gets instrumented, fixed for a device
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub descriptor_checks: bool,
    pub buffer_device_address: bool,
    pub ray_query: bool,
    pub post_process_descriptor_indexing: bool,
    pub vertex_attribute_fetch_oob: bool,
    pub debug_printf: bool,

    pub safe_mode: bool,
    pub print_debug_info: bool,
    pub max_instrumentations_count: u32,

    pub robust_buffer_access: bool,
    pub shader_int64: bool,
    pub support_non_semantic_info: bool,

    pub validate_instrumented_shaders: bool,
    pub dump_instrumented_shaders: bool,
    pub dump_directory: PathBuf,
}

impl EngineOptions {
    pub fn new(settings: &GpuavSettings, features: &DeviceFeatures) -> Self {
        Self {
            descriptor_checks: settings.validation.descriptor_checks,
            buffer_device_address: settings.validation.buffer_device_address,
            ray_query: settings.validation.ray_query,
            post_process_descriptor_indexing: settings.validation.post_process_descriptor_indexing,
            vertex_attribute_fetch_oob: settings.validation.vertex_attribute_fetch_oob,
            debug_printf: settings.debug_printf.enabled,
            safe_mode: settings.instrumentation.safe_mode,
            print_debug_info: settings.debug.print_debug_info,
            max_instrumentations_count: settings.instrumentation.max_instrumentations_count,
            robust_buffer_access: features.robust_buffer_access,
            shader_int64: features.shader_int64,
            support_non_semantic_info: features.shader_non_semantic_info,
            validate_instrumented_shaders: settings.debug.validate_instrumented_shaders,
            dump_instrumented_shaders: settings.debug.dump_instrumented_shaders,
            dump_directory: settings.debug.dump_directory.clone(),
        }
    }
}

type Pass = fn(&mut Module) -> bool;

pub struct ShaderInstrumentationEngine {
    options: EngineOptions,
    validator_options: ValidatorOptions,
    validator: Box<dyn SpirvValidator>,
    report: Arc<dyn DebugReport>,
    message_id: &'static str,
}

impl ShaderInstrumentationEngine {
    pub fn new(
        options: EngineOptions,
        validator_options: ValidatorOptions,
        report: Arc<dyn DebugReport>,
        message_id: &'static str,
    ) -> Self {
        Self {
            options,
            validator_options,
            validator: Box::new(SpirvToolsValidator),
            report,
            message_id,
        }
    }

    /// Replace the self-check validator
    pub fn with_validator(mut self, validator: Box<dyn SpirvValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    fn warn(&self, message: &str) {
        self.report
            .report(Severity::Warning, self.message_id, &LogObjectList::new(), message);
    }

    /// The passes in the order they must run, with whether each is on
    fn passes(&self) -> [(bool, Pass); 7] {
        let o = &self.options;
        let descriptor_class = o.descriptor_checks && !o.robust_buffer_access;
        [
            (o.descriptor_checks, descriptor_indexing::run),
            (descriptor_class, descriptor_class::run_general_buffer),
            (descriptor_class, descriptor_class::run_texel_buffer),
            (o.buffer_device_address && o.shader_int64, buffer_device_address::run),
            (o.ray_query, ray_query::run),
            (o.post_process_descriptor_indexing, post_process::run),
            (o.vertex_attribute_fetch_oob && !o.robust_buffer_access, vertex_attribute_fetch::run),
        ]
    }

    /// Instrument `input`. `None` means the original shader should be used.
    pub fn instrument_shader(
        &self,
        input: &[u32],
        unique_shader_id: u32,
        layouts: &InstrumentationDescriptorSetLayouts,
        desc_set_bind_index: u32,
    ) -> Option<Vec<u32>> {
        if input.first() != Some(&MAGIC_NUMBER) {
            return None;
        }
        if unique_shader_id >= MAX_INSTRUMENTED_SHADERS {
            self.warn(&format!(
                "Shader instrumentation limit of {} shaders reached, shader left uninstrumented",
                MAX_INSTRUMENTED_SHADERS
            ));
            return None;
        }

        let settings = ModuleSettings {
            shader_id: unique_shader_id,
            output_buffer_descriptor_set: desc_set_bind_index,
            safe_mode: self.options.safe_mode,
            print_debug_info: self.options.print_debug_info,
            max_instrumentations_count: self.options.max_instrumentations_count,
            support_non_semantic_info: self.options.support_non_semantic_info,
            has_bindless_descriptors: layouts.has_bindless_descriptors,
        };
        let mut module = match Module::parse(input, settings, layouts.clone()) {
            Ok(module) => module,
            Err(e) => {
                self.warn(&format!("Shader {} could not be parsed for instrumentation: {:#}", unique_shader_id, e));
                return None;
            }
        };

        let mut modified = self
            .passes()
            .into_iter()
            .fold(false, |modified, (enabled, pass)| if enabled { pass(&mut module) | modified } else { modified });
        if module.need_log_error {
            modified |= log_error::run(&mut module);
        }
        modified |= link_functions(&mut module);
        if self.options.debug_printf {
            modified |= debug_printf::run(&mut module);
        }

        if !modified {
            log::debug!("shader {} has nothing to instrument", unique_shader_id);
            return None;
        }
        module.legalize();
        let output = module.serialize();

        if self.options.dump_instrumented_shaders {
            self.dump(unique_shader_id, input, &output, "after");
        }

        if self.options.validate_instrumented_shaders {
            if let Err(e) = self.validator.validate(&output, &self.validator_options) {
                self.dump(unique_shader_id, input, &output, "after_invalid");
                self.warn(&format!(
                    "Instrumented shader (id {}) is invalid, using the original shader instead. Validator output: {:#}",
                    unique_shader_id, e
                ));
                return None;
            }
        }

        Some(output)
    }

    fn dump(&self, unique_shader_id: u32, before: &[u32], after: &[u32], after_suffix: &str) {
        let directory = &self.options.dump_directory;
        let written = write_spirv(&dump_path(directory, unique_shader_id, "before"), before)
            .and_then(|_| write_spirv(&dump_path(directory, unique_shader_id, after_suffix), after));
        if let Err(e) = written {
            self.warn(&format!("Failed to dump shader {}: {:#}", unique_shader_id, e));
        }
    }
}

pub fn dump_path(directory: &Path, unique_shader_id: u32, suffix: &str) -> PathBuf {
    directory.join(format!("dump_{}_{}.spv", unique_shader_id, suffix))
}

/// Write SPIR-V words as a little endian binary
pub fn write_spirv(path: &Path, words: &[u32]) -> Result<()> {
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {:?}", path))
}

/// Read a little endian SPIR-V binary
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    if bytes.len() % 4 != 0 {
        anyhow::bail!("{:?} is not a whole number of SPIR-V words ({} bytes)", path, bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
