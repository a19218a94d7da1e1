// Debug printf lowering
//
// `NonSemantic.DebugPrintf` instructions become calls to a printf helper of
// matching arity. The format string stays in the module as an `OpString`; the
// record only carries its id and the argument values as raw 32-bit words.

use super::{for_each_original_instruction, Visit};
use crate::spirv::builder::Emitter;
use crate::spirv::builtins::stage_info;
use crate::spirv::consts::*;
use crate::spirv::link::{link_functions, LinkFunction};
use crate::spirv::module::{Cursor, Module};
use crate::spirv::Instruction;
use rspirv::spirv::Op;
use std::collections::{BTreeSet, HashMap, HashSet};

pub const DEBUG_PRINTF_IMPORT: &str = "NonSemantic.DebugPrintf";
const NON_SEMANTIC_PREFIX: &str = "NonSemantic.";
const NON_SEMANTIC_EXTENSION: &str = "SPV_KHR_non_semantic_info";
/// Instruction number of `DebugPrintf` in the extended instruction set
const DEBUG_PRINTF_INSTRUCTION: u32 = 1;

/// Append the 32-bit words representing `value` of type `ty`
fn push_value_words(e: &mut Emitter, value: u32, ty: u32, words: &mut Vec<u32>) -> Option<()> {
    let ty_inst = e.module.global(ty)?.clone();
    let uint = e.module.type_uint32();

    match ty_inst.op()? {
        Op::TypeBool => {
            let one = e.module.constant_u32(1);
            let zero = e.module.constant_u32(0);
            words.push(e.emit(Op::Select, uint, &[value, one, zero]));
        }
        Op::TypeInt => {
            let (width, signed) = (ty_inst.operand(0), ty_inst.operand(1) != 0);
            match width {
                32 => words.push(e.to_uint32(value, ty)?),
                64 => push_split_u64(e, value, words),
                8 | 16 if signed => {
                    let int = e.module.type_int(32, true);
                    let wide = e.emit(Op::SConvert, int, &[value]);
                    words.push(e.emit(Op::Bitcast, uint, &[wide]));
                }
                8 | 16 => words.push(e.emit(Op::UConvert, uint, &[value])),
                _ => return None,
            }
        }
        Op::TypeFloat => match ty_inst.operand(0) {
            32 => words.push(e.emit(Op::Bitcast, uint, &[value])),
            64 => push_split_u64(e, value, words),
            16 => {
                let float = e.module.type_float(32);
                let wide = e.emit(Op::FConvert, float, &[value]);
                words.push(e.emit(Op::Bitcast, uint, &[wide]));
            }
            _ => return None,
        },
        Op::TypeVector => {
            let (component_type, count) = (ty_inst.operand(0), ty_inst.operand(1));
            for index in 0..count {
                let component = e.emit(Op::CompositeExtract, component_type, &[value, index]);
                push_value_words(e, component, component_type, words)?;
            }
        }
        Op::TypePointer if ty_inst.operand(0) == STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER => {
            let ulong = e.module.type_uint64();
            let address = e.emit(Op::ConvertPtrToU, ulong, &[value]);
            push_split_u64(e, address, words);
        }
        _ => return None,
    }
    Some(())
}

/// 64-bit values travel as two words, low word first
fn push_split_u64(e: &mut Emitter, value: u32, words: &mut Vec<u32>) {
    let uint = e.module.type_uint32();
    let uvec2 = e.module.type_vector(uint, 2);
    let pair = e.emit(Op::Bitcast, uvec2, &[value]);
    words.push(e.emit(Op::CompositeExtract, uint, &[pair, 0]));
    words.push(e.emit(Op::CompositeExtract, uint, &[pair, 1]));
}

/// Drop the printf import, then non-semantic instructions the device can't take
fn strip_non_semantic(module: &mut Module, printf_import: u32) {
    module
        .ext_inst_imports
        .retain(|inst| inst.result_id() != printf_import);

    if !module.settings.support_non_semantic_info {
        let removed: HashSet<u32> = module
            .ext_inst_imports
            .iter()
            .filter(|inst| inst.string_operand(0).starts_with(NON_SEMANTIC_PREFIX))
            .map(Instruction::result_id)
            .collect();
        let is_removed = |inst: &Instruction| inst.is(Op::ExtInst) && removed.contains(&inst.operand(0));

        module.ext_inst_imports.retain(|inst| !removed.contains(&inst.result_id()));
        module.types_values_constants.retain(|inst| !is_removed(inst));
        for function in &mut module.functions {
            for block in &mut function.blocks {
                block.instructions.retain(|inst| !is_removed(inst));
            }
        }
    }

    let non_semantic_left = module
        .ext_inst_imports
        .iter()
        .any(|inst| inst.string_operand(0).starts_with(NON_SEMANTIC_PREFIX));
    if !non_semantic_left {
        module.remove_extension(NON_SEMANTIC_EXTENSION);
    }
}

pub fn run(module: &mut Module) -> bool {
    let Some(printf_import) = module.ext_inst_import(DEBUG_PRINTF_IMPORT) else {
        return false;
    };
    let types = module.type_map();

    // Stage info is only meaningful when every entry point shares one model
    let models: BTreeSet<u32> = module
        .entry_point_functions()
        .iter()
        .map(|(model, _)| *model)
        .collect();
    let single_model = (models.len() == 1).then(|| models.iter().next().copied()).flatten();
    let stage_id = single_model.or_else(|| models.iter().next().copied()).unwrap_or(0);

    let mut calls: HashMap<u32, u32> = HashMap::new();
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        if !inst.is(Op::ExtInst)
            || inst.operand(0) != printf_import
            || inst.operand(1) != DEBUG_PRINTF_INSTRUCTION
        {
            return Visit::Skip;
        }
        let Some(position) = inst.position() else {
            return Visit::Skip;
        };
        let format = inst.operand(2);

        let mut e = Emitter::new(module);
        let void = e.module.type_void();
        let mut values = Vec::new();
        let converted = inst.operands()[3..].iter().all(|&argument| {
            let ty = types.get(&argument).copied().unwrap_or(0);
            push_value_words(&mut e, argument, ty, &mut values).is_some()
        });
        if !converted {
            log::warn!("debug printf at position {position} has an argument of unsupported type, dropping it");
            drop(e);
            module.functions[cursor.function].blocks[cursor.block]
                .instructions
                .remove(cursor.instruction);
            modified = true;
            return Visit::Resume(cursor);
        }

        let info = match single_model {
            Some(model) => stage_info(&mut e, model),
            None => [e.module.constant_u32(0); 3],
        };
        let mut args = vec![e.module.constant_u32(position), e.module.constant_u32(stage_id)];
        args.extend_from_slice(&info);
        args.push(format);
        args.extend_from_slice(&values);

        let arity = values.len() as u32;
        let helper = e.module.link_function(LinkFunction::DebugPrintf(arity));
        let code = e.finish();
        *calls.entry(arity).or_default() += 1;

        let target = module.insert_before(cursor, code);
        let mut operands = vec![helper];
        operands.extend_from_slice(&args);
        *module.instruction_mut(target) = Instruction::new(Op::FunctionCall, void, inst.result_id(), &operands);
        modified = true;
        Visit::Resume(Cursor {
            instruction: target.instruction + 1,
            ..target
        })
    });

    strip_non_semantic(module, printf_import);
    if modified {
        link_functions(module);
        log::debug!("lowered debug printf calls by arity: {calls:?}");
    }
    modified
}
