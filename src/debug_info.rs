// Debug info for GPU reported messages
//
// Turns the (shader id, stage, instruction position) triple a record carries
// into the human readable part of a message: the stage and invocation, the
// command and objects involved, the instruction and, when the shader was
// built with debug info, the source line.

use crate::instrumentor::{InstrumentedShader, ShaderOwner};
use crate::spirv::execution_model;
use crate::spirv::instruction::{decode_string, parse_instructions};
use crate::spirv::Instruction;
use ash::vk;
use ash::vk::Handle;
use rspirv::spirv::Op;
use std::collections::HashMap;
use std::fmt::Write;

const SHADER_DEBUG_INFO_SET: &str = "NonSemantic.Shader.DebugInfo.100";
const SHADER_DEBUG_SOURCE: u32 = 35;
const SHADER_DEBUG_SOURCE_CONTINUED: u32 = 102;
const SHADER_DEBUG_LINE: u32 = 103;
const SHADER_DEBUG_NO_LINE: u32 = 104;

/// Where a record came from, decoded from its header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShaderMessageInfo {
    pub shader_id: u32,
    /// Execution model of the entry point
    pub stage_id: u32,
    pub stage_info: [u32; 3],
    pub instruction_position: u32,
}

impl ShaderMessageInfo {
    /// One line description of the invocation that wrote the record
    pub fn stage_message(&self) -> String {
        let [a, b, c] = self.stage_info;
        let name = execution_model::name(self.stage_id);
        match self.stage_id {
            execution_model::VERTEX => format!("Stage = {}. Vertex Index = {} Instance Index = {}.", name, a, b),
            execution_model::TESSELLATION_CONTROL => {
                format!("Stage = {}. Invocation ID = {}, Primitive ID = {}", name, a, b)
            }
            execution_model::TESSELLATION_EVALUATION => format!(
                "Stage = {}. Primitive ID = {}, TessCoord (u, v) = ({}, {})",
                name,
                a,
                f32::from_bits(b),
                f32::from_bits(c)
            ),
            execution_model::GEOMETRY => format!("Stage = {}. Primitive ID = {} Invocation ID = {}", name, a, b),
            execution_model::FRAGMENT => format!(
                "Stage = {}. Fragment coord (x,y) = ({}, {}).",
                name,
                f32::from_bits(a),
                f32::from_bits(b)
            ),
            execution_model::GL_COMPUTE
            | execution_model::TASK_NV
            | execution_model::TASK_EXT
            | execution_model::MESH_NV
            | execution_model::MESH_EXT => {
                format!("Stage = {}. Global invocation ID (x, y, z) = ({}, {}, {})", name, a, b, c)
            }
            model if execution_model::is_ray_tracing(model) => {
                format!("Stage = {}. Launch ID (x, y, z) = ({}, {}, {})", name, a, b, c)
            }
            model => format!("Internal Error (unexpected stage = {}).", model),
        }
    }
}

fn operation_label(bind_point: vk::PipelineBindPoint) -> &'static str {
    match bind_point {
        vk::PipelineBindPoint::GRAPHICS => "Draw Index",
        vk::PipelineBindPoint::COMPUTE => "Compute Dispatch Index",
        vk::PipelineBindPoint::RAY_TRACING_KHR => "Ray Trace Index",
        _ => "Unknown Command Index",
    }
}

fn owner_message(owner: &ShaderOwner) -> String {
    match *owner {
        ShaderOwner::Pipeline {
            pipeline,
            shader_module,
        } => format!(
            "Pipeline (0x{:x})\nShader Module (0x{:x})",
            pipeline.as_raw(),
            shader_module.as_raw()
        ),
        ShaderOwner::InlinedInPipelineStage { pipeline } => format!(
            "Pipeline (0x{:x})\nShader Module (inlined, the SPIR-V was passed through \
             VkShaderModuleCreateInfo in the pNext chain of the pipeline stage)",
            pipeline.as_raw()
        ),
        ShaderOwner::ShaderObject { shader } => format!("Shader Object (0x{:x})", shader.as_raw()),
    }
}

/// Compose the debug info part of a message. `record` is the instrumented
/// shader registered under `info.shader_id`, if any.
pub fn generate_debug_info_message(
    command_buffer: vk::CommandBuffer,
    info: &ShaderMessageInfo,
    record: Option<&InstrumentedShader>,
    bind_point: vk::PipelineBindPoint,
    operation_index: u32,
) -> String {
    let Some(record) = record.filter(|record| !record.original_spirv.is_empty()) else {
        return format!(
            "[Internal Error] - Unable to locate the shader (unique shader id {}) used in command buffer (0x{:x}). \
             The shader or its pipeline may have been destroyed before the commands completed.",
            info.shader_id,
            command_buffer.as_raw()
        );
    };

    let mut message = String::new();
    let _ = writeln!(message, "{}", info.stage_message());
    let _ = writeln!(
        message,
        "Command buffer (0x{:x})\n{} = {}",
        command_buffer.as_raw(),
        operation_label(bind_point),
        operation_index
    );
    let _ = writeln!(message, "{}", owner_message(&record.owner));
    let _ = writeln!(message, "Unique Shader ID = {}", record.unique_shader_id);

    let Some(instructions) = parse_instructions(&record.original_spirv) else {
        let _ = write!(message, "SPIR-V Instruction Index = {} (unable to parse the shader)", info.instruction_position);
        return message;
    };
    let position = info.instruction_position as usize;
    match instructions.get(position) {
        Some(inst) => {
            let _ = writeln!(message, "SPIR-V Instruction Index = {}\n{}", position, inst.describe());
        }
        None => {
            let _ = writeln!(message, "SPIR-V Instruction Index = {} (past the end of the shader)", position);
        }
    }

    let source = SourceInfo::new(&instructions);
    match source.locate(&instructions, position) {
        Some(location) => message.push_str(&location),
        None => message.push_str(
            "Unable to find source information for the instruction, \
             build the shader with debug info (for example glslang -g) to get the source line.",
        ),
    }
    message
}

/// Last debug line marker seen before an instruction
#[derive(Debug, Clone, Copy)]
enum LineMarker {
    /// `OpLine` file string id, line, column
    Line { file: u32, line: u32, column: u32 },
    /// `DebugLine`: `DebugSource` id, line, column (already resolved constants)
    ShaderDebugLine { source: u32, line: u32, column: u32 },
}

/// Strings, constants and sources the locator resolves ids through
#[derive(Default)]
struct SourceInfo {
    strings: HashMap<u32, String>,
    constants: HashMap<u32, u32>,
    /// `OpSource` text by file string id
    op_sources: HashMap<u32, String>,
    /// `DebugSource` id to (file string id, text)
    debug_sources: HashMap<u32, (u32, String)>,
    debug_info_set: Option<u32>,
}

impl SourceInfo {
    fn new(instructions: &[Instruction]) -> Self {
        let mut info = SourceInfo::default();
        let mut last_op_source = None;
        let mut last_debug_source = None;
        for inst in instructions {
            match inst.op() {
                Some(Op::String) => {
                    info.strings.insert(inst.result_id(), inst.string_operand(0));
                }
                Some(Op::Constant) if inst.operand_count() == 1 => {
                    info.constants.insert(inst.result_id(), inst.operand(0));
                }
                Some(Op::ExtInstImport) if inst.string_operand(0) == SHADER_DEBUG_INFO_SET => {
                    info.debug_info_set = Some(inst.result_id());
                }
                // OpSource language version [file [source]]
                Some(Op::Source) if inst.operand_count() > 2 => {
                    let file = inst.operand(2);
                    let text = if inst.operand_count() > 3 {
                        decode_string(&inst.operands()[3..]).0
                    } else {
                        String::new()
                    };
                    info.op_sources.insert(file, text);
                    last_op_source = Some(file);
                }
                Some(Op::SourceContinued) => {
                    if let Some(text) = last_op_source.and_then(|file| info.op_sources.get_mut(&file)) {
                        text.push_str(&inst.string_operand(0));
                    }
                }
                Some(Op::ExtInst) if Some(inst.operand(0)) == info.debug_info_set => match inst.operand(1) {
                    SHADER_DEBUG_SOURCE => {
                        let file = inst.operand(2);
                        let text = inst
                            .try_operand(3)
                            .and_then(|text| info.strings.get(&text).cloned())
                            .unwrap_or_default();
                        info.debug_sources.insert(inst.result_id(), (file, text));
                        last_debug_source = Some(inst.result_id());
                    }
                    SHADER_DEBUG_SOURCE_CONTINUED => {
                        let continued = info.strings.get(&inst.operand(2)).cloned().unwrap_or_default();
                        if let Some((_, text)) = last_debug_source.and_then(|id| info.debug_sources.get_mut(&id)) {
                            text.push_str(&continued);
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        info
    }

    /// The line marker in effect at `position`, if one was set and not cleared since
    fn marker_before(&self, instructions: &[Instruction], position: usize) -> Option<LineMarker> {
        let mut marker = None;
        for inst in instructions.iter().take(position + 1) {
            match inst.op() {
                Some(Op::Line) => {
                    marker = Some(LineMarker::Line {
                        file: inst.operand(0),
                        line: inst.operand(1),
                        column: inst.operand(2),
                    });
                }
                Some(Op::NoLine) | Some(Op::Function) | Some(Op::FunctionEnd) => marker = None,
                Some(Op::ExtInst) if self.debug_info_set.is_some() && Some(inst.operand(0)) == self.debug_info_set => {
                    match inst.operand(1) {
                        SHADER_DEBUG_LINE => {
                            let constant = |index| {
                                inst.try_operand(index)
                                    .and_then(|id| self.constants.get(&id).copied())
                                    .unwrap_or(0)
                            };
                            marker = Some(LineMarker::ShaderDebugLine {
                                source: inst.operand(2),
                                line: constant(3),
                                column: constant(5),
                            });
                        }
                        SHADER_DEBUG_NO_LINE => marker = None,
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        marker
    }

    fn locate(&self, instructions: &[Instruction], position: usize) -> Option<String> {
        let (file, line, column, text) = match self.marker_before(instructions, position)? {
            LineMarker::Line { file, line, column } => (file, line, column, self.op_sources.get(&file)),
            LineMarker::ShaderDebugLine { source, line, column } => {
                let (file, text) = self.debug_sources.get(&source)?;
                (*file, line, column, Some(text))
            }
        };
        let file_name = self.strings.get(&file).map_or("<unknown file>", String::as_str);
        let mut location = format!("{}:{}:{}", file_name, line, column);
        let excerpt = text.and_then(|text| text.lines().nth((line as usize).checked_sub(1)?));
        match excerpt {
            Some(excerpt) => {
                let _ = write!(location, "\n{}: {}", line, excerpt.trim_end());
            }
            None => location.push_str("\nUnable to find the source text for this line"),
        }
        Some(location)
    }
}
