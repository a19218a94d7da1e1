// =============================================================================
// GPU-ASSISTED VALIDATION - Shader instrumentation core
// =============================================================================
//
// Rewrites application SPIR-V so shaders check their own descriptor, buffer
// device address, ray query and vertex fetch accesses and report violations
// through a buffer bound at a reserved descriptor set.
//
// LAYOUT:
//   instrumentor  per-device integration: pipelines, libraries, shader objects
//   engine        one shader in, one instrumented shader out
//   spirv         module IR, code generation and the instrumentation passes
//   debug_info    human readable messages for records read back from the GPU
//   backend       the Vulkan calls the layer makes itself
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod debug_info;
pub mod debug_printf;
pub mod descriptor_layout;
pub mod engine;
pub mod error_message;
pub mod instrumentor;
pub mod report;
pub mod spirv;
pub mod state;
pub mod validator;

#[cfg(test)]
mod test_utils;
