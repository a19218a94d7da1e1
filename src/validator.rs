// Self-check of instrumented SPIR-V
//
// The instrumentor can run the SPIR-V validator over every shader it produced
// before handing it to the driver. The device's block layout relaxations are
// passed through so layouts the application relies on are not flagged.

use anyhow::{anyhow, Result};
use spirv_tools::val::{self, Validator};
use spirv_tools::TargetEnv;

/// Layout relaxations the device enabled, affecting block layout rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorOptions {
    pub relax_block_layout: bool,
    pub uniform_buffer_standard_layout: bool,
    pub scalar_block_layout: bool,
}

impl ValidatorOptions {
    fn to_spirv_tools(self) -> val::ValidatorOptions {
        val::ValidatorOptions {
            relax_block_layout: Some(self.relax_block_layout),
            uniform_buffer_standard_layout: self.uniform_buffer_standard_layout,
            scalar_block_layout: self.scalar_block_layout,
            ..Default::default()
        }
    }
}

pub trait SpirvValidator: Send + Sync {
    /// `Err` carries the validator's diagnostic text
    fn validate(&self, words: &[u32], options: &ValidatorOptions) -> Result<()>;
}

/// Validates against the Vulkan environment matching the module's SPIR-V version
#[derive(Debug, Default, Clone, Copy)]
pub struct SpirvToolsValidator;

fn target_env(words: &[u32]) -> TargetEnv {
    match words.get(1) {
        Some(&version) if version > 0x0001_0500 => TargetEnv::Vulkan_1_3,
        _ => TargetEnv::Vulkan_1_2,
    }
}

impl SpirvValidator for SpirvToolsValidator {
    fn validate(&self, words: &[u32], options: &ValidatorOptions) -> Result<()> {
        let env = target_env(words);
        log::debug!("validating {} words for {:?} ({:?})", words.len(), env, options);
        // The validator context is not thread safe, one per call
        let validator = val::create(Some(env));
        validator
            .validate(words, Some(options.to_spirv_tools()))
            .map_err(|e| anyhow!("{}", e))
    }
}
