// Descriptor access recording
//
// Stores the unique shader id into the post-process slot of every descriptor
// the shader touches, so the host can tell afterwards which descriptors were
// actually used. No errors are reported from here. Indices past the binding's
// descriptor count never reach the buffer: the store is branched around, or
// the index is clamped where the block cannot be split.

use super::{descriptor_index, descriptor_variables, for_each_original_instruction, Visit};
use crate::spirv::builder::{guard_instruction, Emitter};
use crate::spirv::consts::*;
use crate::spirv::interface::BINDING_POST_PROCESS;
use crate::spirv::module::{Cursor, Module};
use crate::spirv::Instruction;
use rspirv::spirv::Op;

pub fn run(module: &mut Module) -> bool {
    let variables = descriptor_variables(module);
    if variables.is_empty() {
        return false;
    }
    let types = module.type_map();
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        let is_chain = inst.is(Op::AccessChain) || inst.is(Op::InBoundsAccessChain);
        let is_direct_load = inst.is(Op::Load);
        if !(is_chain || is_direct_load) {
            return Visit::Skip;
        }
        let Some(variable) = variables.get(&inst.operand(0)) else {
            return Visit::Skip;
        };
        // Loads of whole descriptor arrays are indexed later through a chain
        if is_direct_load && variable.array_element.is_some() {
            return Visit::Skip;
        }
        let Some(layout) = module.binding_layout(variable.set, variable.binding).filter(|layout| layout.count > 0) else {
            return Visit::Skip;
        };
        let chain = is_chain.then_some(inst);
        let Some(index) = descriptor_index(module, variable, chain) else {
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
        let uint_pointer = e.module.type_pointer(STORAGE_CLASS_STORAGE_BUFFER, uint);
        let buffer = e.module.buffer_variable(BINDING_POST_PROCESS);
        let member = e.module.constant_u32(buffer.data_member);
        let set = e.module.constant_u32(variable.set);
        let start = e.module.constant_u32(layout.start);
        let shader_id = e.module.shader_id_constant();

        let index = e.to_uint32(index, index_type).unwrap_or(index);
        let in_range = match e.module.constant_value(index) {
            Some(value) if value < layout.count => None,
            _ => {
                let count = e.module.constant_u32(layout.count);
                let boolean = e.module.type_bool();
                Some(e.emit(Op::ULessThan, boolean, &[index, count]))
            }
        };
        let splittable = !e.module.functions[cursor.function].blocks[cursor.block].is_loop_header();
        let index = match in_range {
            Some(in_range) if !splittable => {
                let zero = e.module.constant_u32(0);
                e.emit(Op::Select, uint, &[in_range, index, zero])
            }
            _ => index,
        };
        let base_pointer = e.emit(Op::AccessChain, uint_pointer, &[buffer.variable, member, set]);
        let base = e.emit(Op::Load, uint, &[base_pointer]);
        let descriptor = e.emit(Op::IAdd, uint, &[start, index]);
        let slot = e.emit(Op::IAdd, uint, &[base, descriptor]);
        let slot_pointer = e.emit(Op::AccessChain, uint_pointer, &[buffer.variable, member, slot]);
        e.emit_void(Op::Store, &[slot_pointer, shader_id]);
        let code = e.finish();

        let mut target = module.insert_before(cursor, code);
        if let Some(in_range) = in_range.filter(|_| splittable) {
            let store = Cursor {
                instruction: target.instruction - 1,
                ..target
            };
            if let Some(next) = guard_instruction(module, store, in_range) {
                target = next;
            }
        }
        modified = true;
        Visit::Resume(Cursor {
            instruction: target.instruction + 1,
            ..target
        })
    });

    modified
}
