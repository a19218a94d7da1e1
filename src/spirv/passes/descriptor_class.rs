// Bounds checks for accesses through buffer descriptors
//
// General buffers: the byte range touched by a load, store or atomic is
// derived from the access chain using the block's Offset / ArrayStride
// decorations and compared with the bound range size.
// Texel buffers: the texel coordinate is compared with the texel count.

use super::{
    accessed_type, descriptor_index, descriptor_variables, for_each_original_instruction,
    memory_access_pointer, DescriptorVariable, Visit,
};
use crate::spirv::builder::{guard_instruction, Emitter};
use crate::spirv::consts::*;
use crate::spirv::link::LinkFunction;
use crate::spirv::module::{Cursor, Module};
use crate::spirv::Instruction;
use rspirv::spirv::{Decoration, Op};
use std::collections::HashMap;

/// Byte offset of an access, as a constant part plus `index * stride` terms
#[derive(Debug, Default)]
struct AccessOffset {
    constant: u32,
    dynamic: Vec<(u32, u32)>,
}

/// Walk the indices after the descriptor index and accumulate the offset
fn access_offset(module: &Module, mut ty: u32, indices: &[u32]) -> Option<AccessOffset> {
    let mut offset = AccessOffset::default();
    for &index in indices {
        let inst = module.global(ty)?;
        match inst.op()? {
            Op::TypeStruct => {
                let member = module.constant_value(index)?;
                offset.constant += module.member_decoration_value(ty, member, Decoration::Offset)?;
                ty = inst.try_operand(member as usize)?;
            }
            Op::TypeArray | Op::TypeRuntimeArray => {
                let stride = module.decoration_value(ty, Decoration::ArrayStride)?;
                match module.constant_value(index) {
                    Some(value) => offset.constant += value * stride,
                    None => offset.dynamic.push((index, stride)),
                }
                ty = inst.operand(0);
            }
            Op::TypeVector => {
                let stride = module.scalar_or_vector_size(inst.operand(0))?;
                match module.constant_value(index) {
                    Some(value) => offset.constant += value * stride,
                    None => offset.dynamic.push((index, stride)),
                }
                ty = inst.operand(0);
            }
            _ => return None,
        }
    }
    Some(offset)
}

fn is_chain(inst: &Instruction) -> bool {
    inst.is(Op::AccessChain) || inst.is(Op::InBoundsAccessChain)
}

/// Call a range check before the instruction at `cursor` and, in safe mode,
/// guard it. Returns where scanning resumes.
fn inject_check(module: &mut Module, cursor: Cursor, code: Vec<Instruction>, valid: u32) -> Cursor {
    let safe_mode = module.settings.safe_mode;
    let target = module.insert_before(cursor, code);
    module.need_log_error = true;
    let after = Cursor {
        instruction: target.instruction + 1,
        ..target
    };
    if safe_mode {
        guard_instruction(module, target, valid).unwrap_or(after)
    } else {
        after
    }
}

pub fn run_general_buffer(module: &mut Module) -> bool {
    let variables = descriptor_variables(module);
    if variables.is_empty() {
        return false;
    }
    let types = module.type_map();
    let function_defs: Vec<_> = (0..module.functions.len())
        .map(|function| module.function_defs(function))
        .collect();
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        let Some(pointer) = memory_access_pointer(inst) else {
            return Visit::Skip;
        };
        let defs = &function_defs[cursor.function];
        let Some(chain) = defs.get(&pointer).filter(|def| is_chain(def)) else {
            return Visit::Skip;
        };
        let Some(variable) = variables.get(&chain.operand(0)) else {
            return Visit::Skip;
        };
        if !matches!(variable.storage_class, STORAGE_CLASS_UNIFORM | STORAGE_CLASS_STORAGE_BUFFER) {
            return Visit::Skip;
        }
        let Some(layout) = module.binding_layout(variable.set, variable.binding) else {
            return Visit::Skip;
        };

        let (block_type, indices) = match variable.array_element {
            Some(element) => (element, chain.operands().get(2..).unwrap_or(&[])),
            None => (variable.pointee, chain.operands().get(1..).unwrap_or(&[])),
        };
        let Some(offset) = access_offset(module, block_type, indices) else {
            return Visit::Skip;
        };
        let Some(size) = accessed_type(module, inst, &types).and_then(|ty| module.scalar_or_vector_size(ty)) else {
            return Visit::Skip;
        };
        let dynamic_ok = offset.dynamic.iter().all(|(index, _)| {
            types
                .get(index)
                .and_then(|ty| module.global(*ty))
                .map_or(false, |ty| ty.is(Op::TypeInt) && ty.operand(0) == 32)
        });
        let Some(position) = inst.position().filter(|_| dynamic_ok) else {
            return Visit::Skip;
        };
        let Some(index) = descriptor_index(module, variable, Some(chain)) else {
            return Visit::Skip;
        };
        let index_type = types
            .get(&index)
            .copied()
            .or_else(|| module.global(index).map(Instruction::type_id))
            .unwrap_or(0);
        if !module.try_count_instrumentation() {
            return Visit::Stop;
        }

        let mut e = Emitter::new(module);
        let uint = e.module.type_uint32();
        let boolean = e.module.type_bool();
        let mut end = e.module.constant_u32(offset.constant + size);
        for (dynamic_index, stride) in offset.dynamic {
            let index_type = types.get(&dynamic_index).copied().unwrap_or(uint);
            let index_uint = e.to_uint32(dynamic_index, index_type).unwrap_or(dynamic_index);
            let stride = e.module.constant_u32(stride);
            let scaled = e.emit(Op::IMul, uint, &[index_uint, stride]);
            end = e.emit(Op::IAdd, uint, &[end, scaled]);
        }
        let descriptor = e.to_uint32(index, index_type).unwrap_or(index);
        let args = [
            e.module.constant_u32(position),
            e.module.constant_u32(variable.set),
            e.module.constant_u32(variable.binding),
            descriptor,
            e.module.constant_u32(layout.start),
            end,
        ];
        let check = e.module.link_function(LinkFunction::BufferRangeCheck);
        let valid = e.call(boolean, check, &args);
        let code = e.finish();

        modified = true;
        Visit::Resume(inject_check(module, cursor, code, valid))
    });

    modified
}

/// Descriptor variable and index an image operand was loaded from
fn image_source<'a>(
    module: &mut Module,
    variables: &'a HashMap<u32, DescriptorVariable>,
    defs: &HashMap<u32, Instruction>,
    image: u32,
) -> Option<(&'a DescriptorVariable, u32)> {
    let load = defs.get(&image).filter(|def| def.is(Op::Load))?;
    let pointer = load.operand(0);
    if let Some(variable) = variables.get(&pointer) {
        let index = descriptor_index(module, variable, None)?;
        return Some((variable, index));
    }
    let chain = defs.get(&pointer).filter(|def| is_chain(def))?;
    let variable = variables.get(&chain.operand(0))?;
    let index = descriptor_index(module, variable, Some(chain))?;
    Some((variable, index))
}

pub fn run_texel_buffer(module: &mut Module) -> bool {
    let variables = descriptor_variables(module);
    if variables.is_empty() {
        return false;
    }
    let types = module.type_map();
    let function_defs: Vec<_> = (0..module.functions.len())
        .map(|function| module.function_defs(function))
        .collect();
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        if !(inst.is(Op::ImageFetch) || inst.is(Op::ImageRead) || inst.is(Op::ImageWrite)) {
            return Visit::Skip;
        }
        let (image, coordinate) = (inst.operand(0), inst.operand(1));
        let defs = &function_defs[cursor.function];
        let Some((variable, index)) = image_source(module, &variables, defs, image) else {
            return Visit::Skip;
        };
        let is_texel_buffer = module
            .global(variable.descriptor_type())
            .map_or(false, |ty| ty.is(Op::TypeImage) && ty.operand(1) == DIM_BUFFER);
        if !is_texel_buffer {
            return Visit::Skip;
        }
        let Some(layout) = module.binding_layout(variable.set, variable.binding) else {
            return Visit::Skip;
        };
        let Some(&coordinate_type) = types.get(&coordinate) else {
            return Visit::Skip;
        };
        let is_int32 = module
            .global(coordinate_type)
            .map_or(false, |ty| ty.is(Op::TypeInt) && ty.operand(0) == 32);
        let Some(position) = inst.position().filter(|_| is_int32) else {
            return Visit::Skip;
        };
        let index_type = types
            .get(&index)
            .copied()
            .or_else(|| module.global(index).map(Instruction::type_id))
            .unwrap_or(0);
        if !module.try_count_instrumentation() {
            return Visit::Stop;
        }

        let mut e = Emitter::new(module);
        let boolean = e.module.type_bool();
        let texel = e.to_uint32(coordinate, coordinate_type).unwrap_or(coordinate);
        let descriptor = e.to_uint32(index, index_type).unwrap_or(index);
        let args = [
            e.module.constant_u32(position),
            e.module.constant_u32(variable.set),
            e.module.constant_u32(variable.binding),
            descriptor,
            e.module.constant_u32(layout.start),
            texel,
        ];
        let check = e.module.link_function(LinkFunction::TexelBufferCheck);
        let valid = e.call(boolean, check, &args);
        let code = e.finish();

        modified = true;
        Visit::Resume(inject_check(module, cursor, code, valid))
    });

    modified
}
