// In-memory SPIR-V module
//
// Instructions are grouped by the logical layout sections of a module.
// Function bodies are split into basic blocks so passes can split blocks and
// inject control flow. Serialization concatenates the sections back in order.

use super::consts::*;
use super::instruction::{encode_string, parse_instructions, Instruction, HEADER_WORDS};
use super::interface::{self, ERROR_PAYLOAD_WORDS};
use super::link::LinkFunction;
use crate::descriptor_layout::{BindingLayout, InstrumentationDescriptorSetLayouts};
use anyhow::{bail, Result};
use rspirv::spirv::{Decoration, Op};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Per-run knobs shared by every pass
#[derive(Debug, Clone)]
pub struct ModuleSettings {
    pub shader_id: u32,
    /// Descriptor set index the validation buffers are bound at
    pub output_buffer_descriptor_set: u32,
    pub safe_mode: bool,
    pub print_debug_info: bool,
    /// 0 means no limit
    pub max_instrumentations_count: u32,
    pub support_non_semantic_info: bool,
    pub has_bindless_descriptors: bool,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    pub fn new(label: u32) -> Self {
        Self {
            instructions: vec![Instruction::new(Op::Label, 0, label, &[])],
        }
    }

    pub fn label(&self) -> u32 {
        self.instructions[0].result_id()
    }

    pub fn is_loop_header(&self) -> bool {
        self.instructions.iter().any(|inst| inst.is(Op::LoopMerge))
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    /// `OpFunction` and its `OpFunctionParameter`s
    pub pre_block: Vec<Instruction>,
    pub blocks: Vec<BasicBlock>,
    pub end: Instruction,
}

impl Function {
    pub fn id(&self) -> u32 {
        self.pre_block[0].result_id()
    }
}

/// Location of one instruction inside the function bodies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub function: usize,
    pub block: usize,
    pub instruction: usize,
}

/// Layout of one of the validation buffers declared by the passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferShape {
    /// `{ uint written; uint data[]; }`
    CounterAndData,
    /// `{ uint data[]; }`
    Data,
    /// `{ uint64 data[]; }`
    Data64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferVariable {
    pub variable: u32,
    /// Member holding the runtime array
    pub data_member: u32,
}

pub struct Module {
    pub header: [u32; HEADER_WORDS],
    pub capabilities: Vec<Instruction>,
    pub extensions: Vec<Instruction>,
    pub ext_inst_imports: Vec<Instruction>,
    pub memory_model: Vec<Instruction>,
    pub entry_points: Vec<Instruction>,
    pub execution_modes: Vec<Instruction>,
    pub debug_source: Vec<Instruction>,
    pub debug_names: Vec<Instruction>,
    pub debug_module_processed: Vec<Instruction>,
    pub annotations: Vec<Instruction>,
    pub types_values_constants: Vec<Instruction>,
    pub functions: Vec<Function>,

    pub settings: ModuleSettings,
    pub layouts: InstrumentationDescriptorSetLayouts,

    /// Set by passes that leave an error in the private payload
    pub need_log_error: bool,

    next_id: u32,
    instrumentations_count: u32,
    pub(crate) link_functions: BTreeMap<LinkFunction, u32>,
    pub(crate) linked: BTreeSet<LinkFunction>,
    buffers: BTreeMap<u32, BufferVariable>,
    payload_variable: Option<u32>,
    shader_id_constant: Option<u32>,
    /// Globals created here that SPIR-V 1.4+ entry points must list
    added_globals: Vec<u32>,
    uses_atomics: bool,
}

impl Module {
    pub fn parse(
        words: &[u32],
        settings: ModuleSettings,
        layouts: InstrumentationDescriptorSetLayouts,
    ) -> Result<Self> {
        let Some(instructions) = parse_instructions(words) else {
            bail!("malformed SPIR-V binary ({} words)", words.len());
        };

        let mut header = [0; HEADER_WORDS];
        header.copy_from_slice(&words[..HEADER_WORDS]);

        let mut module = Self {
            header,
            capabilities: Vec::new(),
            extensions: Vec::new(),
            ext_inst_imports: Vec::new(),
            memory_model: Vec::new(),
            entry_points: Vec::new(),
            execution_modes: Vec::new(),
            debug_source: Vec::new(),
            debug_names: Vec::new(),
            debug_module_processed: Vec::new(),
            annotations: Vec::new(),
            types_values_constants: Vec::new(),
            functions: Vec::new(),
            settings,
            layouts,
            need_log_error: false,
            next_id: header[3],
            instrumentations_count: 0,
            link_functions: BTreeMap::new(),
            linked: BTreeSet::new(),
            buffers: BTreeMap::new(),
            payload_variable: None,
            shader_id_constant: None,
            added_globals: Vec::new(),
            uses_atomics: false,
        };

        let mut pre_block: Option<Vec<Instruction>> = None;
        let mut blocks: Vec<BasicBlock> = Vec::new();

        for inst in instructions {
            if pre_block.is_some() {
                match inst.op() {
                    Some(Op::FunctionEnd) => {
                        let pre = pre_block.take().unwrap_or_default();
                        module.functions.push(Function {
                            pre_block: pre,
                            blocks: std::mem::take(&mut blocks),
                            end: inst,
                        });
                    }
                    Some(Op::Label) => blocks.push(BasicBlock {
                        instructions: vec![inst],
                    }),
                    _ => match (blocks.last_mut(), pre_block.as_mut()) {
                        (Some(block), _) => block.instructions.push(inst),
                        (None, Some(pre)) => pre.push(inst),
                        (None, None) => {}
                    },
                }
                continue;
            }

            match inst.op() {
                Some(Op::Function) => pre_block = Some(vec![inst]),
                Some(Op::Capability) => module.capabilities.push(inst),
                Some(Op::Extension) => module.extensions.push(inst),
                Some(Op::ExtInstImport) => module.ext_inst_imports.push(inst),
                Some(Op::MemoryModel) => module.memory_model.push(inst),
                Some(Op::EntryPoint) => module.entry_points.push(inst),
                Some(Op::ExecutionMode) | Some(Op::ExecutionModeId) => {
                    module.execution_modes.push(inst)
                }
                Some(Op::String)
                | Some(Op::Source)
                | Some(Op::SourceExtension)
                | Some(Op::SourceContinued) => module.debug_source.push(inst),
                Some(Op::Name) | Some(Op::MemberName) => module.debug_names.push(inst),
                Some(Op::ModuleProcessed) => module.debug_module_processed.push(inst),
                Some(Op::Decorate)
                | Some(Op::MemberDecorate)
                | Some(Op::DecorationGroup)
                | Some(Op::GroupDecorate)
                | Some(Op::GroupMemberDecorate)
                | Some(Op::DecorateId) => module.annotations.push(inst),
                _ if matches!(inst.opcode(), OP_DECORATE_STRING | OP_MEMBER_DECORATE_STRING) => {
                    module.annotations.push(inst)
                }
                _ => module.types_values_constants.push(inst),
            }
        }

        if pre_block.is_some() {
            bail!("function without OpFunctionEnd");
        }

        Ok(module)
    }

    pub fn serialize(&self) -> Vec<u32> {
        let mut words = self.header.to_vec();
        words[3] = self.next_id;

        let sections = [
            &self.capabilities,
            &self.extensions,
            &self.ext_inst_imports,
            &self.memory_model,
            &self.entry_points,
            &self.execution_modes,
            &self.debug_source,
            &self.debug_names,
            &self.debug_module_processed,
            &self.annotations,
            &self.types_values_constants,
        ];
        for section in sections {
            for inst in section.iter() {
                words.extend_from_slice(inst.words());
            }
        }
        for function in &self.functions {
            for inst in function
                .pre_block
                .iter()
                .chain(function.blocks.iter().flat_map(|block| block.instructions.iter()))
                .chain(std::iter::once(&function.end))
            {
                words.extend_from_slice(inst.words());
            }
        }
        words
    }

    pub fn version(&self) -> u32 {
        self.header[1]
    }

    pub fn take_next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn id_bound(&self) -> u32 {
        self.next_id
    }

    // ---------------------------------------------------------------------
    // Instrumentation budget
    // ---------------------------------------------------------------------

    /// Count one more instrumented site; false once the configured limit is hit
    pub fn try_count_instrumentation(&mut self) -> bool {
        let max = self.settings.max_instrumentations_count;
        if max != 0 && self.instrumentations_count >= max {
            return false;
        }
        self.instrumentations_count += 1;
        true
    }

    // ---------------------------------------------------------------------
    // Lookups
    // ---------------------------------------------------------------------

    pub fn global(&self, id: u32) -> Option<&Instruction> {
        self.types_values_constants
            .iter()
            .find(|inst| inst.result_id() == id)
    }

    /// result id -> type id, for every typed value in the module
    pub fn type_map(&self) -> HashMap<u32, u32> {
        let mut map = HashMap::new();
        let globals = self.types_values_constants.iter();
        let locals = self.functions.iter().flat_map(|function| {
            function
                .pre_block
                .iter()
                .chain(function.blocks.iter().flat_map(|block| block.instructions.iter()))
        });
        for inst in globals.chain(locals) {
            if inst.result_id() != 0 && inst.type_id() != 0 {
                map.insert(inst.result_id(), inst.type_id());
            }
        }
        map
    }

    /// Definitions inside one function, by result id
    pub fn function_defs(&self, function: usize) -> HashMap<u32, Instruction> {
        let function = &self.functions[function];
        function
            .blocks
            .iter()
            .flat_map(|block| block.instructions.iter())
            .filter(|inst| inst.result_id() != 0)
            .map(|inst| (inst.result_id(), inst.clone()))
            .collect()
    }

    /// Value of a 32-bit integer `OpConstant`
    pub fn constant_value(&self, id: u32) -> Option<u32> {
        let inst = self.global(id)?;
        if !inst.is(Op::Constant) {
            return None;
        }
        let ty = self.global(inst.type_id())?;
        if ty.is(Op::TypeInt) && ty.operand(0) == 32 {
            Some(inst.operand(0))
        } else {
            None
        }
    }

    pub fn decoration(&self, target: u32, decoration: Decoration) -> Option<&Instruction> {
        self.annotations.iter().find(|inst| {
            inst.is(Op::Decorate) && inst.operand(0) == target && inst.operand(1) == decoration as u32
        })
    }

    pub fn decoration_value(&self, target: u32, decoration: Decoration) -> Option<u32> {
        self.decoration(target, decoration)?.try_operand(2)
    }

    pub fn has_decoration(&self, target: u32, decoration: Decoration) -> bool {
        self.decoration(target, decoration).is_some()
    }

    pub fn member_decoration_value(
        &self,
        target: u32,
        member: u32,
        decoration: Decoration,
    ) -> Option<u32> {
        self.annotations
            .iter()
            .find(|inst| {
                inst.is(Op::MemberDecorate)
                    && inst.operand(0) == target
                    && inst.operand(1) == member
                    && inst.operand(2) == decoration as u32
            })?
            .try_operand(3)
    }

    /// Byte size of a scalar or vector type
    pub fn scalar_or_vector_size(&self, ty: u32) -> Option<u32> {
        let inst = self.global(ty)?;
        match inst.op()? {
            Op::TypeInt | Op::TypeFloat => Some(inst.operand(0) / 8),
            Op::TypeBool => Some(4),
            Op::TypeVector => Some(self.scalar_or_vector_size(inst.operand(0))? * inst.operand(1)),
            Op::TypePointer if inst.operand(0) == STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER => Some(8),
            _ => None,
        }
    }

    /// Types a `OpPhi` can merge with an `OpConstantNull` fallback
    pub fn is_phi_compatible(&self, ty: u32) -> bool {
        self.global(ty).map_or(false, |inst| {
            matches!(
                inst.op(),
                Some(Op::TypeInt)
                    | Some(Op::TypeFloat)
                    | Some(Op::TypeBool)
                    | Some(Op::TypeVector)
                    | Some(Op::TypeMatrix)
            )
        })
    }

    pub fn binding_layout(&self, set: u32, binding: u32) -> Option<BindingLayout> {
        self.layouts.binding(set, binding)
    }

    // ---------------------------------------------------------------------
    // Types and constants
    // ---------------------------------------------------------------------

    fn find_global(&self, op: Op, type_id: u32, operands: &[u32]) -> Option<u32> {
        self.types_values_constants
            .iter()
            .filter(|inst| Some(inst.result_id()) != self.shader_id_constant)
            .find(|inst| inst.is(op) && inst.type_id() == type_id && inst.operands() == operands)
            .map(Instruction::result_id)
    }

    fn push_global(&mut self, op: Op, type_id: u32, operands: &[u32]) -> u32 {
        let id = self.take_next_id();
        self.types_values_constants
            .push(Instruction::new(op, type_id, id, operands));
        id
    }

    /// Reuse an identical type declaration or add one
    pub fn add_type(&mut self, op: Op, operands: &[u32]) -> u32 {
        match self.find_global(op, 0, operands) {
            Some(id) => id,
            None => self.push_global(op, 0, operands),
        }
    }

    pub fn type_void(&mut self) -> u32 {
        self.add_type(Op::TypeVoid, &[])
    }

    pub fn type_bool(&mut self) -> u32 {
        self.add_type(Op::TypeBool, &[])
    }

    pub fn type_int(&mut self, width: u32, signed: bool) -> u32 {
        self.add_type(Op::TypeInt, &[width, signed as u32])
    }

    pub fn type_uint32(&mut self) -> u32 {
        self.type_int(32, false)
    }

    pub fn type_uint64(&mut self) -> u32 {
        self.add_capability(CAPABILITY_INT64);
        self.type_int(64, false)
    }

    pub fn type_float(&mut self, width: u32) -> u32 {
        self.add_type(Op::TypeFloat, &[width])
    }

    pub fn type_vector(&mut self, component: u32, count: u32) -> u32 {
        self.add_type(Op::TypeVector, &[component, count])
    }

    pub fn type_pointer(&mut self, storage_class: u32, pointee: u32) -> u32 {
        self.add_type(Op::TypePointer, &[storage_class, pointee])
    }

    pub fn type_function(&mut self, return_type: u32, params: &[u32]) -> u32 {
        let mut operands = vec![return_type];
        operands.extend_from_slice(params);
        self.add_type(Op::TypeFunction, &operands)
    }

    pub fn constant_u32(&mut self, value: u32) -> u32 {
        let uint = self.type_uint32();
        match self.find_global(Op::Constant, uint, &[value]) {
            Some(id) => id,
            None => self.push_global(Op::Constant, uint, &[value]),
        }
    }

    pub fn constant_u64(&mut self, value: u64) -> u32 {
        let ulong = self.type_uint64();
        let words = [value as u32, (value >> 32) as u32];
        match self.find_global(Op::Constant, ulong, &words) {
            Some(id) => id,
            None => self.push_global(Op::Constant, ulong, &words),
        }
    }

    pub fn constant_f32(&mut self, value: f32) -> u32 {
        let float = self.type_float(32);
        let bits = value.to_bits();
        match self.find_global(Op::Constant, float, &[bits]) {
            Some(id) => id,
            None => self.push_global(Op::Constant, float, &[bits]),
        }
    }

    pub fn constant_bool(&mut self, value: bool) -> u32 {
        let bool_type = self.type_bool();
        let op = if value { Op::ConstantTrue } else { Op::ConstantFalse };
        match self.find_global(op, bool_type, &[]) {
            Some(id) => id,
            None => self.push_global(op, bool_type, &[]),
        }
    }

    pub fn constant_null(&mut self, ty: u32) -> u32 {
        match self.find_global(Op::ConstantNull, ty, &[]) {
            Some(id) => id,
            None => self.push_global(Op::ConstantNull, ty, &[]),
        }
    }

    /// The unique shader id, as a constant no other value shares
    pub fn shader_id_constant(&mut self) -> u32 {
        if let Some(id) = self.shader_id_constant {
            return id;
        }
        let uint = self.type_uint32();
        let shader_id = self.settings.shader_id;
        let id = self.push_global(Op::Constant, uint, &[shader_id]);
        self.shader_id_constant = Some(id);
        id
    }

    // ---------------------------------------------------------------------
    // Annotations, capabilities, extensions
    // ---------------------------------------------------------------------

    pub fn decorate(&mut self, target: u32, decoration: Decoration, values: &[u32]) {
        let mut operands = vec![target, decoration as u32];
        operands.extend_from_slice(values);
        self.annotations
            .push(Instruction::new(Op::Decorate, 0, 0, &operands));
    }

    pub fn member_decorate(&mut self, target: u32, member: u32, decoration: Decoration, values: &[u32]) {
        let mut operands = vec![target, member, decoration as u32];
        operands.extend_from_slice(values);
        self.annotations
            .push(Instruction::new(Op::MemberDecorate, 0, 0, &operands));
    }

    pub fn has_capability(&self, capability: u32) -> bool {
        self.capabilities
            .iter()
            .any(|inst| inst.operand(0) == capability)
    }

    pub fn add_capability(&mut self, capability: u32) {
        if !self.has_capability(capability) {
            self.capabilities
                .push(Instruction::new(Op::Capability, 0, 0, &[capability]));
        }
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions
            .iter()
            .any(|inst| inst.string_operand(0) == name)
    }

    pub fn add_extension(&mut self, name: &str) {
        if !self.has_extension(name) {
            self.extensions
                .push(Instruction::new(Op::Extension, 0, 0, &encode_string(name)));
        }
    }

    pub fn remove_extension(&mut self, name: &str) {
        self.extensions.retain(|inst| inst.string_operand(0) != name);
    }

    pub fn ext_inst_import(&self, name: &str) -> Option<u32> {
        self.ext_inst_imports
            .iter()
            .find(|inst| inst.string_operand(0) == name)
            .map(Instruction::result_id)
    }

    // ---------------------------------------------------------------------
    // Entry points
    // ---------------------------------------------------------------------

    /// (execution model, function id) of every entry point
    pub fn entry_point_functions(&self) -> Vec<(u32, u32)> {
        self.entry_points
            .iter()
            .map(|inst| (inst.operand(0), inst.operand(1)))
            .collect()
    }

    pub fn function_index(&self, function_id: u32) -> Option<usize> {
        self.functions
            .iter()
            .position(|function| function.id() == function_id)
    }

    /// Add a global to the interface of every entry point, or only those of `model`
    pub fn add_to_entry_point_interfaces(&mut self, variable: u32, model: Option<u32>) {
        for entry in &mut self.entry_points {
            if model.map_or(false, |model| entry.operand(0) != model) {
                continue;
            }
            let interface_start = 2 + entry.string_operand_words(2);
            let listed = entry.operands()[interface_start..].contains(&variable);
            if !listed {
                entry.push_operand(variable);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Validation buffers and the error payload
    // ---------------------------------------------------------------------

    /// Variable for a buffer of the reserved descriptor set, declared on first use
    pub(crate) fn buffer_variable(&mut self, binding: u32) -> BufferVariable {
        if let Some(buffer) = self.buffers.get(&binding) {
            return *buffer;
        }

        let shape = match binding {
            interface::BINDING_ERROR_OUTPUT | interface::BINDING_DEBUG_PRINTF => {
                BufferShape::CounterAndData
            }
            interface::BINDING_BDA_RANGES => BufferShape::Data64,
            _ => BufferShape::Data,
        };

        let (element, stride) = match shape {
            BufferShape::Data64 => (self.type_uint64(), 8),
            _ => (self.type_uint32(), 4),
        };

        // Fresh aggregates, so decorations never leak onto application types
        let runtime_array = self.push_global(Op::TypeRuntimeArray, 0, &[element]);
        self.decorate(runtime_array, Decoration::ArrayStride, &[stride]);

        let (members, data_member) = match shape {
            BufferShape::CounterAndData => (vec![self.type_uint32(), runtime_array], 1),
            _ => (vec![runtime_array], 0),
        };
        let block = self.push_global(Op::TypeStruct, 0, &members);
        self.decorate(block, Decoration::Block, &[]);
        if shape == BufferShape::CounterAndData {
            self.member_decorate(block, 0, Decoration::Offset, &[0]);
            self.member_decorate(block, 1, Decoration::Offset, &[4]);
        } else {
            self.member_decorate(block, 0, Decoration::Offset, &[0]);
        }

        let pointer = self.type_pointer(STORAGE_CLASS_STORAGE_BUFFER, block);
        let variable = self.push_global(Op::Variable, pointer, &[STORAGE_CLASS_STORAGE_BUFFER]);
        let set = self.settings.output_buffer_descriptor_set;
        self.decorate(variable, Decoration::DescriptorSet, &[set]);
        self.decorate(variable, Decoration::Binding, &[binding]);
        self.added_globals.push(variable);

        let buffer = BufferVariable {
            variable,
            data_member,
        };
        self.buffers.insert(binding, buffer);
        buffer
    }

    pub(crate) fn mark_atomics_used(&mut self) {
        self.uses_atomics = true;
    }

    /// `Private uint[6]` holding the first error of the invocation
    pub fn error_payload_variable(&mut self) -> u32 {
        if let Some(id) = self.payload_variable {
            return id;
        }
        let uint = self.type_uint32();
        let length = self.constant_u32(ERROR_PAYLOAD_WORDS);
        let array = self.push_global(Op::TypeArray, 0, &[uint, length]);
        let pointer = self.type_pointer(STORAGE_CLASS_PRIVATE, array);
        let null = self.constant_null(array);
        let variable = self.push_global(Op::Variable, pointer, &[STORAGE_CLASS_PRIVATE, null]);
        self.added_globals.push(variable);
        self.payload_variable = Some(variable);
        variable
    }

    // ---------------------------------------------------------------------
    // Function bodies
    // ---------------------------------------------------------------------

    pub fn instruction(&self, cursor: Cursor) -> &Instruction {
        &self.functions[cursor.function].blocks[cursor.block].instructions[cursor.instruction]
    }

    pub fn instruction_mut(&mut self, cursor: Cursor) -> &mut Instruction {
        &mut self.functions[cursor.function].blocks[cursor.block].instructions[cursor.instruction]
    }

    /// Insert code before the instruction at `cursor`; returns the instruction's new cursor
    pub fn insert_before(&mut self, cursor: Cursor, code: Vec<Instruction>) -> Cursor {
        let count = code.len();
        let block = &mut self.functions[cursor.function].blocks[cursor.block];
        block
            .instructions
            .splice(cursor.instruction..cursor.instruction, code);
        Cursor {
            instruction: cursor.instruction + count,
            ..cursor
        }
    }

    // ---------------------------------------------------------------------
    // Legalization
    // ---------------------------------------------------------------------

    /// Fix up module level requirements of the injected code
    pub fn legalize(&mut self) {
        let storage_buffers_used = !self.buffers.is_empty();

        if self.version() >= 0x0001_0400 {
            let added = std::mem::take(&mut self.added_globals);
            for variable in &added {
                self.add_to_entry_point_interfaces(*variable, None);
            }
            self.added_globals = added;
        }

        if storage_buffers_used && self.version() < 0x0001_0300 {
            self.add_extension("SPV_KHR_storage_buffer_storage_class");
        }

        let vulkan_memory_model = self
            .memory_model
            .first()
            .map_or(false, |inst| inst.operand(1) == MEMORY_MODEL_VULKAN);
        if vulkan_memory_model && self.uses_atomics {
            self.add_capability(CAPABILITY_VULKAN_MEMORY_MODEL_DEVICE_SCOPE);
        }

        let mut seen = BTreeSet::new();
        self.capabilities.retain(|inst| seen.insert(inst.operand(0)));
        let mut seen = BTreeSet::new();
        self.extensions
            .retain(|inst| seen.insert(inst.string_operand(0)));

        self.header[3] = self.next_id;
    }
}
