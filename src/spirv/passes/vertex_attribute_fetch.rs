// Vertex attribute fetch limits
//
// Vertex entry points that consume vertex attributes compare VertexIndex and
// InstanceIndex with the highest index the bound vertex buffers can serve.
// The limits are written by the host at draw time.

use crate::spirv::builder::Emitter;
use crate::spirv::builtins::stage_info;
use crate::spirv::consts::*;
use crate::spirv::execution_model;
use crate::spirv::link::LinkFunction;
use crate::spirv::module::{Cursor, Module};
use rspirv::spirv::{Decoration, Op};
use std::collections::BTreeSet;

/// Does the entry point list an input with a Location decoration
fn reads_vertex_attributes(module: &Module, entry: &crate::spirv::Instruction) -> bool {
    let interface_start = 2 + entry.string_operand_words(2);
    entry.operands()[interface_start..].iter().any(|&variable| {
        let is_input = module
            .global(variable)
            .map_or(false, |inst| inst.is(Op::Variable) && inst.operand(0) == STORAGE_CLASS_INPUT);
        is_input && module.has_decoration(variable, Decoration::Location)
    })
}

pub fn run(module: &mut Module) -> bool {
    let functions: BTreeSet<u32> = module
        .entry_points
        .iter()
        .filter(|entry| entry.operand(0) == execution_model::VERTEX)
        .filter(|entry| reads_vertex_attributes(module, entry))
        .map(|entry| entry.operand(1))
        .collect();

    let mut modified = false;
    for function_id in functions {
        let Some(function) = module.function_index(function_id) else {
            continue;
        };
        let Some(entry_block) = module.functions[function].blocks.first() else {
            continue;
        };
        // Function variables must stay at the top of the entry block
        let first = entry_block
            .instructions
            .iter()
            .skip(1)
            .position(|inst| !inst.is(Op::Variable))
            .map(|index| index + 1);
        let Some(instruction) = first else {
            continue;
        };
        let Some(position) = entry_block.instructions[instruction].position() else {
            continue;
        };
        if !module.try_count_instrumentation() {
            break;
        }

        let mut e = Emitter::new(module);
        let void = e.module.type_void();
        let [vertex_index, instance_index, _] = stage_info(&mut e, execution_model::VERTEX);
        let args = [e.module.constant_u32(position), vertex_index, instance_index];
        let check = e.module.link_function(LinkFunction::VertexAttributeFetchCheck);
        e.call(void, check, &args);
        let code = e.finish();

        let cursor = Cursor {
            function,
            block: 0,
            instruction,
        };
        module.insert_before(cursor, code);
        module.need_log_error = true;
        modified = true;
    }
    modified
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{default_settings, ShaderBuilder};

    #[test]
    fn vertex_shader_with_attributes_is_checked() {
        let words = ShaderBuilder::vertex().with_vertex_input().build();
        let mut module = Module::parse(&words, default_settings(), Default::default()).unwrap();
        assert!(run(&mut module));
        assert!(module.link_functions.contains_key(&LinkFunction::VertexAttributeFetchCheck));

        let block = &module.functions[0].blocks[0];
        let call = block.instructions.iter().position(|inst| inst.is(Op::FunctionCall)).unwrap();
        let last_variable = block.instructions.iter().rposition(|inst| inst.is(Op::Variable)).unwrap_or(0);
        assert!(call > last_variable);
    }

    #[test]
    fn vertex_shader_without_attributes_is_untouched() {
        let words = ShaderBuilder::vertex().build();
        let mut module = Module::parse(&words, default_settings(), Default::default()).unwrap();
        assert!(!run(&mut module));
    }
}
