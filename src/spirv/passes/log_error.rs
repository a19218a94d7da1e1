// Error flushing at entry point exit
//
// Checks only record the first error of an invocation in the private payload.
// Before every return of an entry point, and before every instruction that
// ends the invocation, the payload is written out together with the stage id
// and the stage info words.

use super::{for_each_original_instruction, Visit};
use crate::spirv::builder::Emitter;
use crate::spirv::builtins::stage_info;
use crate::spirv::link::LinkFunction;
use crate::spirv::module::{Cursor, Module};
use crate::spirv::Instruction;
use rspirv::spirv::Op;
use std::collections::HashMap;

fn ends_invocation(inst: &Instruction) -> bool {
    matches!(
        inst.op(),
        Some(Op::Return | Op::Kill | Op::TerminateInvocation | Op::TerminateRayKHR | Op::IgnoreIntersectionKHR)
    )
}

pub fn run(module: &mut Module) -> bool {
    // function index -> execution model; the first entry point wins
    let mut entry_functions: HashMap<usize, u32> = HashMap::new();
    for (model, function_id) in module.entry_point_functions() {
        if let Some(function) = module.function_index(function_id) {
            entry_functions.entry(function).or_insert(model);
        }
    }
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        if !ends_invocation(inst) {
            return Visit::Skip;
        }
        let Some(&model) = entry_functions.get(&cursor.function) else {
            return Visit::Skip;
        };

        let mut e = Emitter::new(module);
        let void = e.module.type_void();
        let stage = e.module.constant_u32(model);
        let [info0, info1, info2] = stage_info(&mut e, model);
        let log_error = e.module.link_function(LinkFunction::LogError);
        e.call(void, log_error, &[stage, info0, info1, info2]);
        let code = e.finish();

        let target = module.insert_before(cursor, code);
        modified = true;
        Visit::Resume(Cursor {
            instruction: target.instruction + 1,
            ..target
        })
    });

    modified
}
