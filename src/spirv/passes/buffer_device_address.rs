// Buffer device address checks
//
// Loads, stores and atomics through PhysicalStorageBuffer pointers are checked
// against the address ranges of live buffers and the alignment the access
// declares.

use super::{accessed_type, for_each_original_instruction, memory_access_pointer, Visit};
use crate::spirv::builder::{guard_instruction, Emitter};
use crate::spirv::consts::*;
use crate::spirv::link::LinkFunction;
use crate::spirv::module::{Cursor, Module};
use crate::spirv::Instruction;
use rspirv::spirv::Op;

/// Alignment literal of an `Aligned` memory access operand, if any
fn declared_alignment(inst: &Instruction) -> Option<u32> {
    let mask_index = if inst.is(Op::Load) {
        1
    } else if inst.is(Op::Store) {
        2
    } else {
        return None;
    };
    let mask = inst.try_operand(mask_index)?;
    if mask & MEMORY_ACCESS_ALIGNED == 0 {
        return None;
    }
    inst.try_operand(mask_index + 1)
}

pub fn run(module: &mut Module) -> bool {
    let types = module.type_map();
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        let Some(pointer) = memory_access_pointer(inst) else {
            return Visit::Skip;
        };
        let is_physical = types
            .get(&pointer)
            .and_then(|ty| module.global(*ty))
            .map_or(false, |ty| ty.is(Op::TypePointer) && ty.operand(0) == STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER);
        if !is_physical {
            return Visit::Skip;
        }
        let Some(size) = accessed_type(module, inst, &types).and_then(|ty| module.scalar_or_vector_size(ty)) else {
            return Visit::Skip;
        };
        let Some(position) = inst.position() else {
            return Visit::Skip;
        };
        let alignment = declared_alignment(inst).unwrap_or(size).max(1);
        if !module.try_count_instrumentation() {
            return Visit::Stop;
        }

        let safe_mode = module.settings.safe_mode;
        let mut e = Emitter::new(module);
        let ulong = e.module.type_uint64();
        let boolean = e.module.type_bool();
        let address = e.emit(Op::ConvertPtrToU, ulong, &[pointer]);
        let args = [
            e.module.constant_u32(position),
            address,
            e.module.constant_u32(size),
            e.module.constant_u32(alignment),
        ];
        let check = e.module.link_function(LinkFunction::BufferDeviceAddressCheck);
        let valid = e.call(boolean, check, &args);
        let code = e.finish();

        let target = module.insert_before(cursor, code);
        module.need_log_error = true;
        modified = true;

        let after = Cursor {
            instruction: target.instruction + 1,
            ..target
        };
        let next = if safe_mode {
            guard_instruction(module, target, valid).unwrap_or(after)
        } else {
            after
        };
        Visit::Resume(next)
    });

    modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{default_settings, ShaderBuilder};

    #[test]
    fn physical_pointer_store_is_checked() {
        let words = ShaderBuilder::compute().with_physical_pointer_store().build();
        let mut module = Module::parse(&words, default_settings(), Default::default()).unwrap();
        assert!(run(&mut module));
        assert!(module.has_capability(CAPABILITY_INT64));

        let store = Instruction::new(Op::Store, 0, 0, &[1, 2, MEMORY_ACCESS_ALIGNED, 16]);
        assert_eq!(declared_alignment(&store), Some(16));
    }

    #[test]
    fn plain_storage_buffer_access_is_ignored() {
        let words = ShaderBuilder::compute().with_storage_buffer_store().build();
        let mut module = Module::parse(&words, default_settings(), Default::default()).unwrap();
        assert!(!run(&mut module));
    }
}
