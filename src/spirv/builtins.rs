// Builtin inputs used to describe the invocation that hit an error
//
// Every record carries three "stage info" words whose meaning depends on the
// execution model; the host formatter decodes them the same way.

use super::builder::Emitter;
use super::consts::*;
use super::execution_model as model;
use rspirv::spirv::{Decoration, Op};

/// Shape of a builtin input variable
#[derive(Debug, Clone, Copy)]
enum BuiltinType {
    Uint,
    Uvec3,
    Vec3,
    Vec4,
}

/// Find the input variable decorated with `builtin`, or declare it, and list it
/// in the interface of the entry points of `execution_model`
fn builtin_variable(emitter: &mut Emitter, builtin: u32, ty: BuiltinType, execution_model: u32) -> (u32, u32) {
    let module = &mut *emitter.module;

    let existing = module
        .annotations
        .iter()
        .filter(|inst| {
            inst.is(Op::Decorate)
                && inst.operand(1) == Decoration::BuiltIn as u32
                && inst.operand(2) == builtin
        })
        .map(|inst| inst.operand(0))
        .find_map(|target| {
            let variable = module.global(target)?;
            if !variable.is(Op::Variable) || variable.operand(0) != STORAGE_CLASS_INPUT {
                return None;
            }
            let pointer = module.global(variable.type_id())?;
            Some((target, pointer.operand(1)))
        });

    let (variable, pointee) = match existing {
        Some(found) => found,
        None => {
            let uint = module.type_uint32();
            let float = module.type_float(32);
            let pointee = match ty {
                BuiltinType::Uint => uint,
                BuiltinType::Uvec3 => module.type_vector(uint, 3),
                BuiltinType::Vec3 => module.type_vector(float, 3),
                BuiltinType::Vec4 => module.type_vector(float, 4),
            };
            let pointer = module.type_pointer(STORAGE_CLASS_INPUT, pointee);
            let variable = module.take_next_id();
            module.types_values_constants.push(super::Instruction::new(
                Op::Variable,
                pointer,
                variable,
                &[STORAGE_CLASS_INPUT],
            ));
            module.decorate(variable, Decoration::BuiltIn, &[builtin]);
            (variable, pointee)
        }
    };

    module.add_to_entry_point_interfaces(variable, Some(execution_model));
    (variable, pointee)
}

/// Load a scalar builtin as uint
fn load_uint(emitter: &mut Emitter, builtin: u32, execution_model: u32) -> u32 {
    let (variable, pointee) = builtin_variable(emitter, builtin, BuiltinType::Uint, execution_model);
    let value = emitter.emit(Op::Load, pointee, &[variable]);
    emitter.to_uint32(value, pointee).unwrap_or(value)
}

/// Load `count` components of a vector builtin as uint words
fn load_components(
    emitter: &mut Emitter,
    builtin: u32,
    ty: BuiltinType,
    components: &[u32],
    execution_model: u32,
) -> Vec<u32> {
    let (variable, pointee) = builtin_variable(emitter, builtin, ty, execution_model);
    let vector = emitter.emit(Op::Load, pointee, &[variable]);
    let component_type = emitter
        .module
        .global(pointee)
        .map(|inst| inst.operand(0))
        .unwrap_or(0);
    let is_float = emitter
        .module
        .global(component_type)
        .map_or(false, |inst| inst.is(Op::TypeFloat));
    let uint = emitter.module.type_uint32();

    components
        .iter()
        .map(|&index| {
            let component = emitter.emit(Op::CompositeExtract, component_type, &[vector, index]);
            if is_float || component_type != uint {
                emitter.emit(Op::Bitcast, uint, &[component])
            } else {
                component
            }
        })
        .collect()
}

/// Emit loads producing the three stage info words for `execution_model`
pub fn stage_info(emitter: &mut Emitter, execution_model: u32) -> [u32; 3] {
    let zero = emitter.module.constant_u32(0);
    match execution_model {
        model::VERTEX => [
            load_uint(emitter, BUILTIN_VERTEX_INDEX, execution_model),
            load_uint(emitter, BUILTIN_INSTANCE_INDEX, execution_model),
            zero,
        ],
        model::FRAGMENT => {
            let xy = load_components(emitter, BUILTIN_FRAG_COORD, BuiltinType::Vec4, &[0, 1], execution_model);
            [xy[0], xy[1], zero]
        }
        model::TESSELLATION_CONTROL => [
            load_uint(emitter, BUILTIN_INVOCATION_ID, execution_model),
            load_uint(emitter, BUILTIN_PRIMITIVE_ID, execution_model),
            zero,
        ],
        model::TESSELLATION_EVALUATION => {
            let primitive = load_uint(emitter, BUILTIN_PRIMITIVE_ID, execution_model);
            let uv = load_components(emitter, BUILTIN_TESS_COORD, BuiltinType::Vec3, &[0, 1], execution_model);
            [primitive, uv[0], uv[1]]
        }
        model::GEOMETRY => [
            load_uint(emitter, BUILTIN_PRIMITIVE_ID, execution_model),
            load_uint(emitter, BUILTIN_INVOCATION_ID, execution_model),
            zero,
        ],
        model::GL_COMPUTE | model::TASK_NV | model::MESH_NV | model::TASK_EXT | model::MESH_EXT => {
            let id = load_components(
                emitter,
                BUILTIN_GLOBAL_INVOCATION_ID,
                BuiltinType::Uvec3,
                &[0, 1, 2],
                execution_model,
            );
            [id[0], id[1], id[2]]
        }
        m if model::is_ray_tracing(m) => {
            let id = load_components(emitter, BUILTIN_LAUNCH_ID, BuiltinType::Uvec3, &[0, 1, 2], execution_model);
            [id[0], id[1], id[2]]
        }
        _ => [zero, zero, zero],
    }
}
