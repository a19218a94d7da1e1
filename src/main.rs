// =============================================================================
// GPUAV-INSTRUMENT - Offline shader instrumentation
// =============================================================================
//
// Runs the instrumentation engine over one SPIR-V binary, the same way the
// layer does at pipeline creation, and writes the result. Useful to inspect
// what a shader turns into without a device.
//
// USAGE:
//   gpuav-instrument <input.spv> <output.spv> [--shader-id N] [--set N] [--config FILE]
//
// Settings come from gpuav.toml (or --config). Device features are assumed
// to be all present.
//
// =============================================================================

use anyhow::{bail, Context, Result};
use gpuav_instrument::config::GpuavSettings;
use gpuav_instrument::descriptor_layout::InstrumentationDescriptorSetLayouts;
use gpuav_instrument::engine::{read_spirv, write_spirv, EngineOptions, ShaderInstrumentationEngine};
use gpuav_instrument::instrumentor::DeviceFeatures;
use gpuav_instrument::report::{LogDebugReport, ValidationMode};
use gpuav_instrument::spirv::interface::MAX_DESCRIPTOR_SETS;
use std::path::PathBuf;
use std::sync::Arc;

// =============================================================================
// COMMAND LINE
// =============================================================================

struct Args {
    input: PathBuf,
    output: PathBuf,
    shader_id: u32,
    desc_set_bind_index: u32,
    config: Option<PathBuf>,
}

const USAGE: &str = "usage: gpuav-instrument <input.spv> <output.spv> [--shader-id N] [--set N] [--config FILE]";

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut shader_id = 0;
    let mut desc_set_bind_index = MAX_DESCRIPTOR_SETS - 1;
    let mut config = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--shader-id" => {
                let value = args.next().context("--shader-id needs a value")?;
                shader_id = value.parse().with_context(|| format!("invalid shader id '{}'", value))?;
            }
            "--set" => {
                let value = args.next().context("--set needs a value")?;
                desc_set_bind_index = value.parse().with_context(|| format!("invalid set index '{}'", value))?;
            }
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a path")?)),
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let [input, output]: [PathBuf; 2] = match positional.try_into() {
        Ok(paths) => paths,
        Err(_) => bail!("{}", USAGE),
    };
    Ok(Args {
        input,
        output,
        shader_id,
        desc_set_bind_index,
        config,
    })
}

fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();
    let args = parse_args()?;

    let settings = match &args.config {
        Some(path) => GpuavSettings::load_from_path(path)?,
        None => GpuavSettings::load(),
    };
    let features = DeviceFeatures::all();
    let mode = if !settings.any_validation_enabled() && settings.debug_printf.enabled {
        ValidationMode::DebugPrintfOnly
    } else {
        ValidationMode::GpuAssisted
    };

    let engine = ShaderInstrumentationEngine::new(
        EngineOptions::new(&settings, &features),
        features.validator_options(),
        Arc::new(LogDebugReport),
        mode.message_id(),
    );

    let input = read_spirv(&args.input)?;
    log::info!("Instrumenting {:?} ({} words) as shader {}", args.input, input.len(), args.shader_id);

    // No pipeline layout offline: descriptor accesses are checked without binding sizes
    let layouts = InstrumentationDescriptorSetLayouts::default();
    let output = match engine.instrument_shader(&input, args.shader_id, &layouts, args.desc_set_bind_index) {
        Some(output) => output,
        None => {
            log::info!("Nothing was instrumented, writing the shader unchanged");
            input
        }
    };

    write_spirv(&args.output, &output)?;
    log::info!("Wrote {:?} ({} words)", args.output, output.len());
    Ok(())
}
