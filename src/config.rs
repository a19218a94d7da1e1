// =============================================================================
// CONFIGURATION - Load settings from gpuav.toml
// =============================================================================
//
// This module handles loading and parsing the instrumentation settings.
// Provides sensible defaults if the config file is missing or has errors.

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "gpuav.toml";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GpuavSettings {
    pub validation: ValidationConfig,
    pub debug_printf: DebugPrintfConfig,
    pub instrumentation: InstrumentationConfig,
    pub debug: DebugConfig,
    pub locking: LockingConfig,
}

/// Which check families get instrumented
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub descriptor_checks: bool,
    pub buffer_device_address: bool,
    pub ray_query: bool,
    pub post_process_descriptor_indexing: bool,
    pub vertex_attribute_fetch_oob: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            descriptor_checks: true,
            buffer_device_address: true,
            ray_query: true,
            post_process_descriptor_indexing: true,
            vertex_attribute_fetch_oob: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DebugPrintfConfig {
    pub enabled: bool,
}

/// How much gets instrumented, and whether safe mode guards the checked accesses
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct InstrumentationConfig {
    /// Skip faulting accesses instead of only reporting them
    pub safe_mode: bool,
    /// 0 = unlimited
    pub max_instrumentations_count: u32,
    /// Only instrument shaders that opted in, by flag or by name
    pub select_instrumented_shaders: bool,
    pub shader_name_regexes: Vec<String>,
}

/// Debugging the instrumentation itself
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub dump_instrumented_shaders: bool,
    pub validate_instrumented_shaders: bool,
    pub print_debug_info: bool,
    pub dump_directory: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            dump_instrumented_shaders: false,
            validate_instrumented_shaders: false,
            print_debug_info: false,
            dump_directory: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    pub fine_grained: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self { fine_grained: true }
    }
}

impl GpuavSettings {
    /// Load configuration from gpuav.toml, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_FILE).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG_FILE, e);
            GpuavSettings::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(GpuavSettings::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let settings: GpuavSettings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Settings: {:?}", settings);

        Ok(settings)
    }

    /// Compile the shader name filters; invalid patterns are reported and dropped
    pub fn shader_name_filters(&self) -> Vec<Regex> {
        self.instrumentation
            .shader_name_regexes
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    log::warn!("Ignoring invalid shader name regex '{}': {}", pattern, e);
                    None
                }
            })
            .collect()
    }

    /// True when any validation family is on, as opposed to debug printf only
    pub fn any_validation_enabled(&self) -> bool {
        let v = &self.validation;
        v.descriptor_checks
            || v.buffer_device_address
            || v.ray_query
            || v.post_process_descriptor_indexing
            || v.vertex_attribute_fetch_oob
    }
}
