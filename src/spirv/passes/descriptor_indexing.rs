// Descriptor array index bounds checking
//
// Every access chain into a descriptor array gets its first index checked
// against the binding's descriptor count. Bindless layouts also get the
// descriptor state consulted to catch uninitialized descriptors.

use super::{descriptor_variables, for_each_original_instruction, Visit};
use crate::spirv::builder::Emitter;
use crate::spirv::link::LinkFunction;
use crate::spirv::module::{Cursor, Module};
use rspirv::spirv::Op;

pub fn run(module: &mut Module) -> bool {
    let variables = descriptor_variables(module);
    if variables.is_empty() {
        return false;
    }
    let types = module.type_map();
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        if !(inst.is(Op::AccessChain) || inst.is(Op::InBoundsAccessChain)) || inst.operand_count() < 2 {
            return Visit::Skip;
        }
        let Some(variable) = variables.get(&inst.operand(0)) else {
            return Visit::Skip;
        };
        if variable.array_element.is_none() {
            return Visit::Skip;
        }
        let Some(layout) = module.binding_layout(variable.set, variable.binding) else {
            return Visit::Skip;
        };
        if layout.count == 0 {
            return Visit::Skip;
        }

        let index = inst.operand(1);
        let bindless = module.settings.has_bindless_descriptors;
        if let Some(constant) = module.constant_value(index) {
            if constant < layout.count && !bindless {
                return Visit::Skip;
            }
        }
        let Some(&index_type) = types.get(&index) else {
            return Visit::Skip;
        };
        let is_int32 = module
            .global(index_type)
            .map_or(false, |ty| ty.is(Op::TypeInt) && ty.operand(0) == 32);
        let Some(position) = inst.position().filter(|_| is_int32) else {
            return Visit::Skip;
        };
        if !module.try_count_instrumentation() {
            return Visit::Stop;
        }

        let safe_mode = module.settings.safe_mode;
        let mut e = Emitter::new(module);
        let index_uint = e.to_uint32(index, index_type).unwrap_or(index);
        let boolean = e.module.type_bool();
        let args = [
            e.module.constant_u32(position),
            e.module.constant_u32(variable.set),
            e.module.constant_u32(variable.binding),
            index_uint,
            e.module.constant_u32(layout.count),
            e.module.constant_u32(layout.start),
            e.module.constant_u32(bindless as u32),
        ];
        let check = e.module.link_function(LinkFunction::DescriptorIndexCheck);
        let valid = e.call(boolean, check, &args);

        let clamped = if safe_mode {
            let zero = e.module.constant_null(index_type);
            Some(e.emit(Op::Select, index_type, &[valid, index, zero]))
        } else {
            None
        };

        let code = e.finish();
        let target = module.insert_before(cursor, code);
        if let Some(clamped) = clamped {
            module.instruction_mut(target).set_operand(1, clamped);
        }
        module.need_log_error = true;
        modified = true;

        Visit::Resume(Cursor {
            instruction: target.instruction + 1,
            ..target
        })
    });

    modified
}
