// Code emission helpers
//
// `Emitter` collects straight-line code to splice in front of an existing
// instruction. `FunctionBuilder` assembles whole helper functions block by
// block. `guard_instruction` wraps one instruction in a conditional.

use super::consts::*;
use super::module::{BasicBlock, Cursor, Function, Module};
use super::Instruction;
use rspirv::spirv::Op;

/// Straight-line code destined for one insertion point
pub struct Emitter<'m> {
    pub module: &'m mut Module,
    instructions: Vec<Instruction>,
}

impl<'m> Emitter<'m> {
    pub fn new(module: &'m mut Module) -> Self {
        Self {
            module,
            instructions: Vec::new(),
        }
    }

    /// Emit an instruction with a fresh result id
    pub fn emit(&mut self, op: Op, result_type: u32, operands: &[u32]) -> u32 {
        let id = self.module.take_next_id();
        self.instructions
            .push(Instruction::new(op, result_type, id, operands));
        id
    }

    /// Emit an instruction without a result
    pub fn emit_void(&mut self, op: Op, operands: &[u32]) {
        self.instructions
            .push(Instruction::new(op, 0, 0, operands));
    }

    pub fn call(&mut self, return_type: u32, function: u32, args: &[u32]) -> u32 {
        let mut operands = vec![function];
        operands.extend_from_slice(args);
        self.emit(Op::FunctionCall, return_type, &operands)
    }

    /// Reinterpret a 32-bit integer value as unsigned, if it is signed
    pub fn to_uint32(&mut self, value: u32, value_type: u32) -> Option<u32> {
        let ty = self.module.global(value_type)?;
        if !ty.is(Op::TypeInt) || ty.operand(0) != 32 {
            return None;
        }
        if ty.operand(1) == 0 {
            return Some(value);
        }
        let uint = self.module.type_uint32();
        Some(self.emit(Op::Bitcast, uint, &[value]))
    }

    pub fn finish(self) -> Vec<Instruction> {
        self.instructions
    }
}

/// Builds one function; call `finish` to append it to the module
pub struct FunctionBuilder<'m> {
    pub module: &'m mut Module,
    pre_block: Vec<Instruction>,
    blocks: Vec<BasicBlock>,
    current: BasicBlock,
}

impl<'m> FunctionBuilder<'m> {
    /// Start `function_id`; returns the builder and the parameter ids
    pub fn new(
        module: &'m mut Module,
        function_id: u32,
        return_type: u32,
        param_types: &[u32],
    ) -> (Self, Vec<u32>) {
        let function_type = module.type_function(return_type, param_types);
        let mut pre_block = vec![Instruction::new(
            Op::Function,
            return_type,
            function_id,
            &[FUNCTION_CONTROL_NONE, function_type],
        )];

        let mut params = Vec::with_capacity(param_types.len());
        for &param_type in param_types {
            let id = module.take_next_id();
            pre_block.push(Instruction::new(Op::FunctionParameter, param_type, id, &[]));
            params.push(id);
        }

        let entry = module.take_next_id();
        let builder = Self {
            module,
            pre_block,
            blocks: Vec::new(),
            current: BasicBlock::new(entry),
        };
        (builder, params)
    }

    pub fn emit(&mut self, op: Op, result_type: u32, operands: &[u32]) -> u32 {
        let id = self.module.take_next_id();
        self.current
            .instructions
            .push(Instruction::new(op, result_type, id, operands));
        id
    }

    /// Emit an instruction whose result id was reserved earlier, e.g. for loop back edges
    pub fn emit_with_id(&mut self, op: Op, result_type: u32, result_id: u32, operands: &[u32]) {
        self.current
            .instructions
            .push(Instruction::new(op, result_type, result_id, operands));
    }

    pub fn emit_void(&mut self, op: Op, operands: &[u32]) {
        self.current
            .instructions
            .push(Instruction::new(op, 0, 0, operands));
    }

    pub fn call(&mut self, return_type: u32, function: u32, args: &[u32]) -> u32 {
        let mut operands = vec![function];
        operands.extend_from_slice(args);
        self.emit(Op::FunctionCall, return_type, &operands)
    }

    /// Reserve a label for a block started later
    pub fn new_label(&mut self) -> u32 {
        self.module.take_next_id()
    }

    /// Label of the block being built
    pub fn current_label(&self) -> u32 {
        self.current.label()
    }

    /// Close the current block (it must already end in a terminator) and start `label`
    pub fn begin_block(&mut self, label: u32) {
        let finished = std::mem::replace(&mut self.current, BasicBlock::new(label));
        self.blocks.push(finished);
    }

    /// `if (condition) { then }` where `then` is emitted by the closure
    pub fn if_then(&mut self, condition: u32, then: impl FnOnce(&mut Self)) {
        let then_label = self.new_label();
        let merge_label = self.new_label();
        self.emit_void(Op::SelectionMerge, &[merge_label, SELECTION_CONTROL_NONE]);
        self.emit_void(Op::BranchConditional, &[condition, then_label, merge_label]);
        self.begin_block(then_label);
        then(self);
        self.emit_void(Op::Branch, &[merge_label]);
        self.begin_block(merge_label);
    }

    pub fn finish(mut self) {
        self.blocks.push(self.current);
        let function = Function {
            pre_block: self.pre_block,
            blocks: self.blocks,
            end: Instruction::new(Op::FunctionEnd, 0, 0, &[]),
        };
        self.module.functions.push(function);
    }
}

/// Make the instruction at `cursor` execute only when `condition` holds.
///
/// The block is split as `pre -> (valid) -> merge`; a result is merged back with
/// `OpPhi` against a null value. Returns the cursor of the first instruction
/// after the guarded one, or `None` when the block can't be split (loop headers
/// and results that can't flow through a phi), in which case nothing changed.
pub fn guard_instruction(module: &mut Module, cursor: Cursor, condition: u32) -> Option<Cursor> {
    let (result_id, result_type) = {
        let block = &module.functions[cursor.function].blocks[cursor.block];
        if block.is_loop_header() {
            return None;
        }
        let target = &block.instructions[cursor.instruction];
        (target.result_id(), target.type_id())
    };
    if result_id != 0 && !module.is_phi_compatible(result_type) {
        return None;
    }

    let original_label = module.functions[cursor.function].blocks[cursor.block].label();
    let valid_label = module.take_next_id();
    let merge_label = module.take_next_id();
    let null = if result_id != 0 {
        module.constant_null(result_type)
    } else {
        0
    };
    let renamed = if result_id != 0 {
        module.take_next_id()
    } else {
        0
    };

    let function = &mut module.functions[cursor.function];

    // Successors now see the merge block as their predecessor
    for block in function.blocks.iter_mut() {
        for inst in block.instructions.iter_mut().filter(|inst| inst.is(Op::Phi)) {
            for parent in (1..inst.operand_count()).step_by(2) {
                if inst.operand(parent) == original_label {
                    inst.set_operand(parent, merge_label);
                }
            }
        }
    }

    let block = &mut function.blocks[cursor.block];
    let mut tail = block.instructions.split_off(cursor.instruction);
    let mut target = tail.remove(0);
    block.instructions.push(Instruction::new(
        Op::SelectionMerge,
        0,
        0,
        &[merge_label, SELECTION_CONTROL_NONE],
    ));
    block.instructions.push(Instruction::new(
        Op::BranchConditional,
        0,
        0,
        &[condition, valid_label, merge_label],
    ));

    let mut valid = BasicBlock::new(valid_label);
    let mut merge = BasicBlock::new(merge_label);
    if result_id != 0 {
        target.set_result_id(renamed);
        merge.instructions.push(Instruction::new(
            Op::Phi,
            result_type,
            result_id,
            &[renamed, valid_label, null, original_label],
        ));
    }
    valid.instructions.push(target);
    valid
        .instructions
        .push(Instruction::new(Op::Branch, 0, 0, &[merge_label]));
    let resume = merge.instructions.len();
    merge.instructions.extend(tail);

    function.blocks.insert(cursor.block + 1, valid);
    function.blocks.insert(cursor.block + 2, merge);

    Some(Cursor {
        function: cursor.function,
        block: cursor.block + 2,
        instruction: resume,
    })
}
