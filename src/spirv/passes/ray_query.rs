// Ray query initialization checks
//
// `OpRayQueryInitializeKHR` gets its ray flags, origin, direction and t-range
// validated before the query starts traversal.

use super::{for_each_original_instruction, Visit};
use crate::spirv::builder::{guard_instruction, Emitter};
use crate::spirv::link::LinkFunction;
use crate::spirv::module::{Cursor, Module};
use rspirv::spirv::Op;

pub fn run(module: &mut Module) -> bool {
    let types = module.type_map();
    let mut modified = false;

    for_each_original_instruction(module, |module, cursor, inst| {
        if !inst.is(Op::RayQueryInitializeKHR) || inst.operand_count() < 8 {
            return Visit::Skip;
        }
        let Some(position) = inst.position() else {
            return Visit::Skip;
        };
        if !module.try_count_instrumentation() {
            return Visit::Stop;
        }

        // query, acceleration structure, flags, cull mask, origin, tmin, direction, tmax
        let flags = inst.operand(2);
        let (origin, tmin, direction, tmax) = (inst.operand(4), inst.operand(5), inst.operand(6), inst.operand(7));
        let flags_type = types.get(&flags).copied().unwrap_or(0);

        let safe_mode = module.settings.safe_mode;
        let mut e = Emitter::new(module);
        let boolean = e.module.type_bool();
        let flags = e.to_uint32(flags, flags_type).unwrap_or(flags);
        let args = [e.module.constant_u32(position), flags, origin, tmin, direction, tmax];
        let check = e.module.link_function(LinkFunction::RayQueryCheck);
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
    fn initialize_is_checked_and_guarded() {
        let words = ShaderBuilder::compute().with_ray_query().build();
        let mut settings = default_settings();
        settings.safe_mode = true;
        let mut module = Module::parse(&words, settings, Default::default()).unwrap();
        assert!(run(&mut module));
        assert!(module.link_functions.contains_key(&LinkFunction::RayQueryCheck));
        let guarded = module.functions[0]
            .blocks
            .iter()
            .any(|block| block.instructions.len() == 3 && block.instructions[1].is(Op::RayQueryInitializeKHR));
        assert!(guarded);
    }
}
