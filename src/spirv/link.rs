// Helper functions called by the instrumented code
//
// Passes only reserve a function id when they inject a call. Once every pass
// has run, `link_functions` emits the body of each reserved helper. Helpers
// may reserve further helpers while being emitted (every check reports through
// `SetError`), so linking repeats until nothing is pending.

use super::builder::FunctionBuilder;
use super::consts::*;
use super::interface::{self, error_group, ERROR_RECORD_SIZE, PRINTF_HEADER_SIZE};
use super::module::Module;
use rspirv::spirv::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LinkFunction {
    /// (position, group, sub code, p0, p1, p2) -> void, keeps only the first error
    SetError,
    /// (position, set, binding, index, count, start, check state) -> bool
    DescriptorIndexCheck,
    /// (position, set, binding, descriptor index, start, end offset) -> bool
    BufferRangeCheck,
    /// (position, set, binding, descriptor index, start, texel index) -> bool
    TexelBufferCheck,
    /// (position, address, size, alignment) -> bool
    BufferDeviceAddressCheck,
    /// (position, ray flags, origin, tmin, direction, tmax) -> bool
    RayQueryCheck,
    /// (position, vertex index, instance index) -> void
    VertexAttributeFetchCheck,
    /// (stage id, info 0, info 1, info 2) -> void, flushes the pending error
    LogError,
    /// (position, stage id, info 0..2, format string id, value words) -> void
    DebugPrintf(u32),
}

impl Module {
    /// Function id of `helper`, reserving one on first use
    pub fn link_function(&mut self, helper: LinkFunction) -> u32 {
        if let Some(&id) = self.link_functions.get(&helper) {
            return id;
        }
        let id = self.take_next_id();
        self.link_functions.insert(helper, id);
        id
    }
}

/// Emit every reserved helper not emitted yet. Returns true if any was added.
pub fn link_functions(module: &mut Module) -> bool {
    let mut linked_any = false;
    loop {
        let pending: Vec<(LinkFunction, u32)> = module
            .link_functions
            .iter()
            .filter(|(helper, _)| !module.linked.contains(helper))
            .map(|(helper, id)| (*helper, *id))
            .collect();
        if pending.is_empty() {
            return linked_any;
        }

        for (helper, id) in pending {
            module.linked.insert(helper);
            match helper {
                LinkFunction::SetError => set_error(module, id),
                LinkFunction::DescriptorIndexCheck => descriptor_index_check(module, id),
                LinkFunction::BufferRangeCheck => buffer_range_check(module, id, false),
                LinkFunction::TexelBufferCheck => buffer_range_check(module, id, true),
                LinkFunction::BufferDeviceAddressCheck => buffer_device_address_check(module, id),
                LinkFunction::RayQueryCheck => ray_query_check(module, id),
                LinkFunction::VertexAttributeFetchCheck => vertex_attribute_fetch_check(module, id),
                LinkFunction::LogError => log_error(module, id),
                LinkFunction::DebugPrintf(arg_count) => debug_printf(module, id, arg_count),
            }
            linked_any = true;
        }
    }
}

/// Scalar types every helper uses
struct Types {
    void: u32,
    boolean: u32,
    uint: u32,
}

impl Types {
    fn new(module: &mut Module) -> Self {
        Self {
            void: module.type_void(),
            boolean: module.type_bool(),
            uint: module.type_uint32(),
        }
    }
}

/// Pointer to `payload[index]`
fn payload_element(b: &mut FunctionBuilder, index: u32) -> u32 {
    let uint = b.module.type_uint32();
    let pointer = b.module.type_pointer(STORAGE_CLASS_PRIVATE, uint);
    let payload = b.module.error_payload_variable();
    let index = b.module.constant_u32(index);
    b.emit(Op::AccessChain, pointer, &[payload, index])
}

/// Pointer to `data[index]` of one of the validation buffers
fn buffer_element(b: &mut FunctionBuilder, binding: u32, index: u32) -> u32 {
    let buffer = b.module.buffer_variable(binding);
    let element = if binding == interface::BINDING_BDA_RANGES {
        b.module.type_uint64()
    } else {
        b.module.type_uint32()
    };
    let pointer = b.module.type_pointer(STORAGE_CLASS_STORAGE_BUFFER, element);
    let member = b.module.constant_u32(buffer.data_member);
    b.emit(Op::AccessChain, pointer, &[buffer.variable, member, index])
}

fn load_buffer_word(b: &mut FunctionBuilder, binding: u32, index: u32) -> u32 {
    let uint = b.module.type_uint32();
    let pointer = buffer_element(b, binding, index);
    b.emit(Op::Load, uint, &[pointer])
}

/// Index of the descriptor state words of descriptor `index` of a binding
fn descriptor_state_slot(b: &mut FunctionBuilder, set: u32, start: u32, index: u32) -> u32 {
    let uint = b.module.type_uint32();
    let one = b.module.constant_u32(1);
    let base = load_buffer_word(b, interface::BINDING_DESCRIPTOR_STATE, set);
    let descriptor = b.emit(Op::IAdd, uint, &[start, index]);
    let offset = b.emit(Op::ShiftLeftLogical, uint, &[descriptor, one]);
    b.emit(Op::IAdd, uint, &[base, offset])
}

fn call_set_error(b: &mut FunctionBuilder, args: [u32; 6]) {
    let void = b.module.type_void();
    let set_error = b.module.link_function(LinkFunction::SetError);
    b.call(void, set_error, &args);
}

fn set_error(module: &mut Module, id: u32) {
    let t = Types::new(module);
    let (mut b, params) = FunctionBuilder::new(module, id, t.void, &[t.uint; 6]);

    let zero = b.module.constant_u32(0);
    let group_pointer = payload_element(&mut b, 1);
    let group = b.emit(Op::Load, t.uint, &[group_pointer]);
    let first = b.emit(Op::IEqual, t.boolean, &[group, zero]);
    b.if_then(first, |b| {
        for (index, &value) in params.iter().enumerate() {
            let pointer = payload_element(b, index as u32);
            b.emit_void(Op::Store, &[pointer, value]);
        }
    });
    b.emit_void(Op::Return, &[]);
    b.finish();
}

fn descriptor_index_check(module: &mut Module, id: u32) {
    let t = Types::new(module);
    let (mut b, p) = FunctionBuilder::new(module, id, t.boolean, &[t.uint; 7]);
    let (position, set, binding, index, count, start, check_state) = (p[0], p[1], p[2], p[3], p[4], p[5], p[6]);

    let zero = b.module.constant_u32(0);
    let sixteen = b.module.constant_u32(16);
    let group = b.module.constant_u32(error_group::DESCRIPTOR_INDEXING);
    let oob_code = b.module.constant_u32(interface::descriptor_indexing::INDEX_OOB);
    let uninit_code = b.module.constant_u32(interface::descriptor_indexing::UNINITIALIZED);

    let shifted = b.emit(Op::ShiftLeftLogical, t.uint, &[set, sixteen]);
    let set_binding = b.emit(Op::BitwiseOr, t.uint, &[shifted, binding]);

    let oob = b.emit(Op::UGreaterThanEqual, t.boolean, &[index, count]);
    b.if_then(oob, |b| call_set_error(b, [position, group, oob_code, index, count, set_binding]));

    // Descriptor state is only meaningful for in-range indices of bindless layouts
    let in_range = b.emit(Op::LogicalNot, t.boolean, &[oob]);
    let wants_state = b.emit(Op::INotEqual, t.boolean, &[check_state, zero]);
    let read_state = b.emit(Op::LogicalAnd, t.boolean, &[in_range, wants_state]);
    let before_state = b.current_label();
    let state_label = b.new_label();
    let merge_label = b.new_label();
    b.emit_void(Op::SelectionMerge, &[merge_label, SELECTION_CONTROL_NONE]);
    b.emit_void(Op::BranchConditional, &[read_state, state_label, merge_label]);

    b.begin_block(state_label);
    let slot = descriptor_state_slot(&mut b, set, start, index);
    let state = load_buffer_word(&mut b, interface::BINDING_DESCRIPTOR_STATE, slot);
    let uninitialized = b.emit(Op::IEqual, t.boolean, &[state, zero]);
    b.if_then(uninitialized, |b| {
        call_set_error(b, [position, group, uninit_code, index, zero, set_binding])
    });
    let state_end = b.current_label();
    b.emit_void(Op::Branch, &[merge_label]);

    b.begin_block(merge_label);
    let false_value = b.module.constant_bool(false);
    let uninit_seen = b.emit(
        Op::Phi,
        t.boolean,
        &[uninitialized, state_end, false_value, before_state],
    );
    let bad = b.emit(Op::LogicalOr, t.boolean, &[oob, uninit_seen]);
    let ok = b.emit(Op::LogicalNot, t.boolean, &[bad]);
    b.emit_void(Op::ReturnValue, &[ok]);
    b.finish();
}

fn buffer_range_check(module: &mut Module, id: u32, texel: bool) {
    let t = Types::new(module);
    let (mut b, p) = FunctionBuilder::new(module, id, t.boolean, &[t.uint; 6]);
    let (position, set, binding, index, start, access) = (p[0], p[1], p[2], p[3], p[4], p[5]);

    let one = b.module.constant_u32(1);
    let sixteen = b.module.constant_u32(16);
    let group = b.module.constant_u32(error_group::DESCRIPTOR_CLASS);
    let code = b.module.constant_u32(if texel {
        interface::descriptor_class::TEXEL_BUFFER_OOB
    } else {
        interface::descriptor_class::GENERAL_BUFFER_OOB
    });

    let slot = descriptor_state_slot(&mut b, set, start, index);
    let size_slot = b.emit(Op::IAdd, t.uint, &[slot, one]);
    let size = load_buffer_word(&mut b, interface::BINDING_DESCRIPTOR_STATE, size_slot);

    // End offsets may equal the size, texel indices may not
    let compare = if texel {
        Op::UGreaterThanEqual
    } else {
        Op::UGreaterThan
    };
    let oob = b.emit(compare, t.boolean, &[access, size]);
    b.if_then(oob, |b| {
        let shifted = b.emit(Op::ShiftLeftLogical, t.uint, &[set, sixteen]);
        let set_binding = b.emit(Op::BitwiseOr, t.uint, &[shifted, binding]);
        call_set_error(b, [position, group, code, access, size, set_binding]);
    });
    let ok = b.emit(Op::LogicalNot, t.boolean, &[oob]);
    b.emit_void(Op::ReturnValue, &[ok]);
    b.finish();
}

fn buffer_device_address_check(module: &mut Module, id: u32) {
    let t = Types::new(module);
    let ulong = module.type_uint64();
    let (mut b, p) = FunctionBuilder::new(module, id, t.boolean, &[t.uint, ulong, t.uint, t.uint]);
    let (position, address, size, alignment) = (p[0], p[1], p[2], p[3]);

    let zero64 = b.module.constant_u64(0);
    let one64 = b.module.constant_u64(1);
    let two64 = b.module.constant_u64(2);
    let thirty_two = b.module.constant_u64(32);
    let false_value = b.module.constant_bool(false);
    let group = b.module.constant_u32(error_group::BUFFER_DEVICE_ADDRESS);
    let unallocated_code = b.module.constant_u32(interface::buffer_device_address::UNALLOCATED_REFERENCE);
    let alignment_code = b.module.constant_u32(interface::buffer_device_address::ALIGNMENT);

    let count_pointer = buffer_element(&mut b, interface::BINDING_BDA_RANGES, zero64);
    let range_count = b.emit(Op::Load, ulong, &[count_pointer]);
    let size64 = b.emit(Op::UConvert, ulong, &[size]);
    let end = b.emit(Op::IAdd, ulong, &[address, size64]);
    let entry_label = b.current_label();

    let header = b.new_label();
    let body = b.new_label();
    let continue_label = b.new_label();
    let loop_merge = b.new_label();
    let next_index = b.module.take_next_id();
    let in_range = b.module.take_next_id();
    b.emit_void(Op::Branch, &[header]);

    // for (i = 0; i < count && !found; ++i) found = ranges[i] contains [address, end)
    b.begin_block(header);
    let index = b.emit(Op::Phi, ulong, &[zero64, entry_label, next_index, continue_label]);
    let found = b.emit(Op::Phi, t.boolean, &[false_value, entry_label, in_range, continue_label]);
    let more = b.emit(Op::ULessThan, t.boolean, &[index, range_count]);
    let not_found = b.emit(Op::LogicalNot, t.boolean, &[found]);
    let keep_going = b.emit(Op::LogicalAnd, t.boolean, &[more, not_found]);
    b.emit_void(Op::LoopMerge, &[loop_merge, continue_label, LOOP_CONTROL_NONE]);
    b.emit_void(Op::BranchConditional, &[keep_going, body, loop_merge]);

    b.begin_block(body);
    let pair = b.emit(Op::IMul, ulong, &[index, two64]);
    let begin_index = b.emit(Op::IAdd, ulong, &[pair, one64]);
    let end_index = b.emit(Op::IAdd, ulong, &[begin_index, one64]);
    let begin_pointer = buffer_element(&mut b, interface::BINDING_BDA_RANGES, begin_index);
    let range_begin = b.emit(Op::Load, ulong, &[begin_pointer]);
    let end_pointer = buffer_element(&mut b, interface::BINDING_BDA_RANGES, end_index);
    let range_end = b.emit(Op::Load, ulong, &[end_pointer]);
    let after_begin = b.emit(Op::UGreaterThanEqual, t.boolean, &[address, range_begin]);
    let before_end = b.emit(Op::ULessThanEqual, t.boolean, &[end, range_end]);
    b.emit_with_id(Op::LogicalAnd, t.boolean, in_range, &[after_begin, before_end]);
    b.emit_void(Op::Branch, &[continue_label]);

    b.begin_block(continue_label);
    b.emit_with_id(Op::IAdd, ulong, next_index, &[index, one64]);
    b.emit_void(Op::Branch, &[header]);

    b.begin_block(loop_merge);
    let address_low = b.emit(Op::UConvert, t.uint, &[address]);
    let shifted = b.emit(Op::ShiftRightLogical, ulong, &[address, thirty_two]);
    let address_high = b.emit(Op::UConvert, t.uint, &[shifted]);

    let unallocated = b.emit(Op::LogicalNot, t.boolean, &[found]);
    b.if_then(unallocated, |b| {
        call_set_error(b, [position, group, unallocated_code, address_low, address_high, size])
    });

    let alignment64 = b.emit(Op::UConvert, ulong, &[alignment]);
    let remainder = b.emit(Op::UMod, ulong, &[address, alignment64]);
    let misaligned = b.emit(Op::INotEqual, t.boolean, &[remainder, zero64]);
    b.if_then(misaligned, |b| {
        call_set_error(b, [position, group, alignment_code, address_low, address_high, alignment])
    });

    let bad = b.emit(Op::LogicalOr, t.boolean, &[unallocated, misaligned]);
    let ok = b.emit(Op::LogicalNot, t.boolean, &[bad]);
    b.emit_void(Op::ReturnValue, &[ok]);
    b.finish();
}

fn ray_query_check(module: &mut Module, id: u32) {
    let t = Types::new(module);
    let float = module.type_float(32);
    let vec3 = module.type_vector(float, 3);
    let bvec3 = module.type_vector(t.boolean, 3);
    let (mut b, p) = FunctionBuilder::new(module, id, t.boolean, &[t.uint, t.uint, vec3, float, vec3, float]);
    let (position, flags, origin, tmin, direction, tmax) = (p[0], p[1], p[2], p[3], p[4], p[5]);

    use interface::ray_query as code;
    let zero = b.module.constant_u32(0);
    let zero_f = b.module.constant_f32(0.0);
    let skip_both = b.module.constant_u32(interface::RAY_FLAGS_SKIP_BOTH);
    let group = b.module.constant_u32(error_group::RAY_QUERY);

    let origin_nan_v = b.emit(Op::IsNan, bvec3, &[origin]);
    let origin_nan = b.emit(Op::Any, t.boolean, &[origin_nan_v]);
    let direction_nan_v = b.emit(Op::IsNan, bvec3, &[direction]);
    let direction_nan = b.emit(Op::Any, t.boolean, &[direction_nan_v]);
    let origin_inf_v = b.emit(Op::IsInf, bvec3, &[origin]);
    let origin_inf = b.emit(Op::Any, t.boolean, &[origin_inf_v]);
    let direction_inf_v = b.emit(Op::IsInf, bvec3, &[direction]);
    let direction_inf = b.emit(Op::Any, t.boolean, &[direction_inf_v]);
    let tmin_nan = b.emit(Op::IsNan, t.boolean, &[tmin]);
    let tmax_nan = b.emit(Op::IsNan, t.boolean, &[tmax]);
    let tmin_negative = b.emit(Op::FOrdLessThan, t.boolean, &[tmin, zero_f]);
    let tmax_negative = b.emit(Op::FOrdLessThan, t.boolean, &[tmax, zero_f]);
    let inverted = b.emit(Op::FOrdLessThan, t.boolean, &[tmax, tmin]);
    let skip_bits = b.emit(Op::BitwiseAnd, t.uint, &[flags, skip_both]);
    let both_skipped = b.emit(Op::IEqual, t.boolean, &[skip_bits, skip_both]);

    // Later entries take priority
    let checks = [
        (both_skipped, code::BOTH_SKIP),
        (inverted, code::MIN_MAX),
        (tmax_negative, code::NEGATIVE_MAX),
        (tmin_negative, code::NEGATIVE_MIN),
        (tmax_nan, code::MAX_NAN),
        (tmin_nan, code::MIN_NAN),
        (direction_inf, code::DIRECTION_FINITE),
        (origin_inf, code::ORIGIN_FINITE),
        (direction_nan, code::DIRECTION_NAN),
        (origin_nan, code::ORIGIN_NAN),
    ];
    let mut error_code = zero;
    for (condition, sub_code) in checks {
        let sub_code = b.module.constant_u32(sub_code);
        error_code = b.emit(Op::Select, t.uint, &[condition, sub_code, error_code]);
    }

    let bad = b.emit(Op::INotEqual, t.boolean, &[error_code, zero]);
    b.if_then(bad, |b| {
        let tmin_bits = b.emit(Op::Bitcast, t.uint, &[tmin]);
        let tmax_bits = b.emit(Op::Bitcast, t.uint, &[tmax]);
        call_set_error(b, [position, group, error_code, flags, tmin_bits, tmax_bits]);
    });
    let ok = b.emit(Op::LogicalNot, t.boolean, &[bad]);
    b.emit_void(Op::ReturnValue, &[ok]);
    b.finish();
}

fn vertex_attribute_fetch_check(module: &mut Module, id: u32) {
    let t = Types::new(module);
    let (mut b, p) = FunctionBuilder::new(module, id, t.void, &[t.uint; 3]);
    let (position, vertex_index, instance_index) = (p[0], p[1], p[2]);

    use interface::vertex_attribute_fetch as code;
    let zero = b.module.constant_u32(0);
    let group = b.module.constant_u32(error_group::VERTEX_ATTRIBUTE_FETCH);

    let checks = [
        (
            interface::VERTEX_LIMITS_HAS_VERTEX,
            interface::VERTEX_LIMITS_MAX_VERTEX,
            vertex_index,
            code::VERTEX_INDEX_OOB,
        ),
        (
            interface::VERTEX_LIMITS_HAS_INSTANCE,
            interface::VERTEX_LIMITS_MAX_INSTANCE,
            instance_index,
            code::INSTANCE_INDEX_OOB,
        ),
    ];
    for (has_limit_word, max_word, value, sub_code) in checks {
        let has_limit_index = b.module.constant_u32(has_limit_word);
        let max_index = b.module.constant_u32(max_word);
        let sub_code = b.module.constant_u32(sub_code);

        let has_limit = load_buffer_word(&mut b, interface::BINDING_VERTEX_LIMITS, has_limit_index);
        let max = load_buffer_word(&mut b, interface::BINDING_VERTEX_LIMITS, max_index);
        let limited = b.emit(Op::INotEqual, t.boolean, &[has_limit, zero]);
        let above = b.emit(Op::UGreaterThan, t.boolean, &[value, max]);
        let oob = b.emit(Op::LogicalAnd, t.boolean, &[limited, above]);
        b.if_then(oob, |b| call_set_error(b, [position, group, sub_code, value, max, zero]));
    }
    b.emit_void(Op::Return, &[]);
    b.finish();
}

/// Reserve `size` words in a counter-and-data buffer; returns (offset, fits)
fn reserve_record(b: &mut FunctionBuilder, binding: u32, size: u32) -> (u32, u32) {
    let t = Types::new(b.module);
    let zero = b.module.constant_u32(0);
    let scope = b.module.constant_u32(SCOPE_DEVICE);
    let buffer = b.module.buffer_variable(binding);
    b.module.mark_atomics_used();

    let counter_pointer_type = b.module.type_pointer(STORAGE_CLASS_STORAGE_BUFFER, t.uint);
    let counter = b.emit(Op::AccessChain, counter_pointer_type, &[buffer.variable, zero]);
    // Relaxed ordering is enough, records are only read after the submission completes
    let offset = b.emit(Op::AtomicIAdd, t.uint, &[counter, scope, zero, size]);
    let capacity = b.emit(Op::ArrayLength, t.uint, &[buffer.variable, buffer.data_member]);
    let end = b.emit(Op::IAdd, t.uint, &[offset, size]);
    let fits = b.emit(Op::ULessThanEqual, t.boolean, &[end, capacity]);
    (offset, fits)
}

fn store_record(b: &mut FunctionBuilder, binding: u32, offset: u32, words: &[u32]) {
    let uint = b.module.type_uint32();
    for (index, &word) in words.iter().enumerate() {
        let index = b.module.constant_u32(index as u32);
        let slot = b.emit(Op::IAdd, uint, &[offset, index]);
        let pointer = buffer_element(b, binding, slot);
        b.emit_void(Op::Store, &[pointer, word]);
    }
}

fn log_error(module: &mut Module, id: u32) {
    let t = Types::new(module);
    let (mut b, p) = FunctionBuilder::new(module, id, t.void, &[t.uint; 4]);
    let (stage_id, info0, info1, info2) = (p[0], p[1], p[2], p[3]);

    let zero = b.module.constant_u32(0);
    let group_pointer = payload_element(&mut b, 1);
    let group = b.emit(Op::Load, t.uint, &[group_pointer]);
    let pending = b.emit(Op::INotEqual, t.boolean, &[group, zero]);
    b.if_then(pending, |b| {
        let size = b.module.constant_u32(ERROR_RECORD_SIZE);
        let shader_id = b.module.shader_id_constant();
        let (offset, fits) = reserve_record(b, interface::BINDING_ERROR_OUTPUT, size);
        b.if_then(fits, |b| {
            let mut payload = [0; 6];
            for (index, word) in payload.iter_mut().enumerate() {
                let pointer = payload_element(b, index as u32);
                *word = b.emit(Op::Load, t.uint, &[pointer]);
            }
            let record = [
                size, shader_id, payload[0], stage_id, info0, info1, info2, payload[1], payload[2],
                payload[3], payload[4], payload[5],
            ];
            store_record(b, interface::BINDING_ERROR_OUTPUT, offset, &record);
        });
    });
    b.emit_void(Op::Return, &[]);
    b.finish();
}

fn debug_printf(module: &mut Module, id: u32, arg_count: u32) {
    let t = Types::new(module);
    let params = vec![t.uint; 6 + arg_count as usize];
    let (mut b, p) = FunctionBuilder::new(module, id, t.void, &params);

    let size = b.module.constant_u32(PRINTF_HEADER_SIZE + arg_count);
    let shader_id = b.module.shader_id_constant();
    let (offset, fits) = reserve_record(&mut b, interface::BINDING_DEBUG_PRINTF, size);
    b.if_then(fits, |b| {
        // position, stage id, info 0..2, format id, values
        let mut record = vec![size, shader_id];
        record.extend_from_slice(&p);
        store_record(b, interface::BINDING_DEBUG_PRINTF, offset, &record);
    });
    b.emit_void(Op::Return, &[]);
    b.finish();
}
