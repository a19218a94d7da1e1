// Instrumentation passes
//
// Each pass walks the original instructions of every function, injects code
// in front of the ones it targets and reports whether it changed the module.
// Only instructions carrying a position are targeted, so code injected by an
// earlier pass is never instrumented again.

pub mod buffer_device_address;
pub mod debug_printf;
pub mod descriptor_class;
pub mod descriptor_indexing;
pub mod log_error;
pub mod post_process;
pub mod ray_query;
pub mod vertex_attribute_fetch;

use super::consts::*;
use super::module::{Cursor, Module};
use super::Instruction;
use rspirv::spirv::{Decoration, Op};
use std::collections::HashMap;

/// A variable bound to an application descriptor
#[derive(Debug, Clone, Copy)]
pub(crate) struct DescriptorVariable {
    pub set: u32,
    pub binding: u32,
    pub storage_class: u32,
    /// Type behind the pointer, the array itself for descriptor arrays
    pub pointee: u32,
    /// Element type when the variable is a descriptor array
    pub array_element: Option<u32>,
}

impl DescriptorVariable {
    /// Type of one descriptor
    pub fn descriptor_type(&self) -> u32 {
        self.array_element.unwrap_or(self.pointee)
    }
}

/// Every descriptor variable of the module, outside the reserved set
pub(crate) fn descriptor_variables(module: &Module) -> HashMap<u32, DescriptorVariable> {
    let reserved = module.settings.output_buffer_descriptor_set;
    let mut variables = HashMap::new();

    for inst in module.types_values_constants.iter().filter(|inst| inst.is(Op::Variable)) {
        let storage_class = inst.operand(0);
        if !matches!(
            storage_class,
            STORAGE_CLASS_UNIFORM_CONSTANT | STORAGE_CLASS_UNIFORM | STORAGE_CLASS_STORAGE_BUFFER
        ) {
            continue;
        }
        let id = inst.result_id();
        let (Some(set), Some(binding)) = (
            module.decoration_value(id, Decoration::DescriptorSet),
            module.decoration_value(id, Decoration::Binding),
        ) else {
            continue;
        };
        if set == reserved {
            continue;
        }
        let Some(pointer) = module.global(inst.type_id()) else {
            continue;
        };
        let pointee = pointer.operand(1);
        let array_element = module
            .global(pointee)
            .filter(|ty| ty.is(Op::TypeArray) || ty.is(Op::TypeRuntimeArray))
            .map(|ty| ty.operand(0));

        variables.insert(
            id,
            DescriptorVariable {
                set,
                binding,
                storage_class,
                pointee,
                array_element,
            },
        );
    }
    variables
}

/// What a pass does with one targeted instruction
pub(crate) enum Visit {
    /// Not a target, move on
    Skip,
    /// Instrumented; resume scanning at this cursor
    Resume(Cursor),
    /// The instrumentation budget is spent
    Stop,
}

/// Walk every original instruction of every function that existed before the
/// pass started, letting `visit` instrument it
pub(crate) fn for_each_original_instruction(
    module: &mut Module,
    mut visit: impl FnMut(&mut Module, Cursor, &Instruction) -> Visit,
) {
    let function_count = module.functions.len();
    for function in 0..function_count {
        let mut block = 0;
        while block < module.functions[function].blocks.len() {
            let mut instruction = 0;
            while instruction < module.functions[function].blocks[block].instructions.len() {
                let inst = module.functions[function].blocks[block].instructions[instruction].clone();
                if inst.position().is_none() {
                    instruction += 1;
                    continue;
                }
                let cursor = Cursor {
                    function,
                    block,
                    instruction,
                };
                match visit(module, cursor, &inst) {
                    Visit::Skip => instruction += 1,
                    Visit::Resume(next) => {
                        block = next.block;
                        instruction = next.instruction;
                    }
                    Visit::Stop => return,
                }
            }
            block += 1;
        }
    }
}

/// Pointer operand of a memory access instruction
pub(crate) fn memory_access_pointer(inst: &Instruction) -> Option<u32> {
    match inst.op()? {
        Op::Load
        | Op::Store
        | Op::AtomicLoad
        | Op::AtomicStore
        | Op::AtomicExchange
        | Op::AtomicCompareExchange
        | Op::AtomicIIncrement
        | Op::AtomicIDecrement
        | Op::AtomicIAdd
        | Op::AtomicISub
        | Op::AtomicSMin
        | Op::AtomicUMin
        | Op::AtomicSMax
        | Op::AtomicUMax
        | Op::AtomicAnd
        | Op::AtomicOr
        | Op::AtomicXor => Some(inst.operand(0)),
        _ => None,
    }
}

/// Type of the value moved by a memory access
pub(crate) fn accessed_type(module: &Module, inst: &Instruction, types: &HashMap<u32, u32>) -> Option<u32> {
    if inst.is(Op::Store) || inst.is(Op::AtomicStore) {
        let value = if inst.is(Op::Store) { inst.operand(1) } else { inst.operand(3) };
        return types.get(&value).copied();
    }
    let pointer_type = types.get(&inst.operand(0))?;
    let pointer = module.global(*pointer_type)?;
    Some(pointer.operand(1))
}

/// Index of the accessed descriptor: the first chain index for arrays, 0 otherwise
pub(crate) fn descriptor_index(module: &mut Module, variable: &DescriptorVariable, access_chain: Option<&Instruction>) -> Option<u32> {
    match (variable.array_element, access_chain) {
        (Some(_), Some(chain)) => chain.try_operand(1),
        (Some(_), None) => None,
        (None, _) => Some(module.constant_u32(0)),
    }
}
