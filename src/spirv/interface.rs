// Device <-> host contract
//
// Bindings of the reserved descriptor set, record layouts and error codes.
// Both the instrumentation passes and the host decoders read from here, keep
// them in sync.

/// Bindings inside the reserved validation descriptor set
pub const BINDING_ERROR_OUTPUT: u32 = 0;
pub const BINDING_DESCRIPTOR_STATE: u32 = 1;
pub const BINDING_BDA_RANGES: u32 = 2;
pub const BINDING_POST_PROCESS: u32 = 3;
pub const BINDING_VERTEX_LIMITS: u32 = 4;
pub const BINDING_DEBUG_PRINTF: u32 = 5;
pub const BINDING_COUNT: u32 = 6;

/// Maximum descriptor sets a pipeline layout may use, reserved slot included
pub const MAX_DESCRIPTOR_SETS: u32 = 33;

/// Number of per-set base words at the head of the descriptor state buffer
pub const DESCRIPTOR_STATE_SET_WORDS: u32 = 32;

/// Upper bound (exclusive) for unique shader ids
pub const MAX_INSTRUMENTED_SHADERS: u32 = 1 << 16;

// Error record, in words
pub const ERROR_RECORD_SIZE: u32 = 12;
pub const RECORD_SIZE_OFFSET: usize = 0;
pub const RECORD_SHADER_ID_OFFSET: usize = 1;
pub const RECORD_INSTRUCTION_POSITION_OFFSET: usize = 2;
pub const RECORD_STAGE_ID_OFFSET: usize = 3;
pub const RECORD_STAGE_INFO_OFFSET: usize = 4;
pub const RECORD_ERROR_GROUP_OFFSET: usize = 7;
pub const RECORD_ERROR_SUB_CODE_OFFSET: usize = 8;
pub const RECORD_PARAM_OFFSET: usize = 9;

// Debug printf record header, in words; the values follow
pub const PRINTF_HEADER_SIZE: u32 = 8;
pub const PRINTF_FORMAT_STRING_ID_OFFSET: usize = 7;

/// Words of the private error payload: position, group, sub code, params 0..2
pub const ERROR_PAYLOAD_WORDS: u32 = 6;

// Vertex attribute limits buffer
pub const VERTEX_LIMITS_HAS_VERTEX: u32 = 0;
pub const VERTEX_LIMITS_MAX_VERTEX: u32 = 1;
pub const VERTEX_LIMITS_HAS_INSTANCE: u32 = 2;
pub const VERTEX_LIMITS_MAX_INSTANCE: u32 = 3;

/// Ray flags `SkipTrianglesKHR | SkipAABBsKHR`
pub const RAY_FLAGS_SKIP_BOTH: u32 = 0x100 | 0x200;

pub mod error_group {
    pub const DESCRIPTOR_INDEXING: u32 = 1;
    pub const DESCRIPTOR_CLASS: u32 = 2;
    pub const BUFFER_DEVICE_ADDRESS: u32 = 3;
    pub const RAY_QUERY: u32 = 4;
    pub const VERTEX_ATTRIBUTE_FETCH: u32 = 5;
}

pub mod descriptor_indexing {
    pub const INDEX_OOB: u32 = 1;
    pub const UNINITIALIZED: u32 = 2;
}

pub mod descriptor_class {
    pub const GENERAL_BUFFER_OOB: u32 = 1;
    pub const TEXEL_BUFFER_OOB: u32 = 2;
}

pub mod buffer_device_address {
    pub const UNALLOCATED_REFERENCE: u32 = 1;
    pub const ALIGNMENT: u32 = 2;
}

pub mod ray_query {
    pub const NEGATIVE_MIN: u32 = 1;
    pub const NEGATIVE_MAX: u32 = 2;
    pub const MIN_MAX: u32 = 3;
    pub const MIN_NAN: u32 = 4;
    pub const MAX_NAN: u32 = 5;
    pub const ORIGIN_NAN: u32 = 6;
    pub const DIRECTION_NAN: u32 = 7;
    pub const ORIGIN_FINITE: u32 = 8;
    pub const BOTH_SKIP: u32 = 9;
    pub const DIRECTION_FINITE: u32 = 10;
}

pub mod vertex_attribute_fetch {
    pub const VERTEX_INDEX_OOB: u32 = 1;
    pub const INSTANCE_INDEX_OOB: u32 = 2;
}

/// Pack a set and binding into one parameter word
pub fn pack_set_binding(set: u32, binding: u32) -> u32 {
    (set << 16) | (binding & 0xFFFF)
}

pub fn unpack_set_binding(word: u32) -> (u32, u32) {
    (word >> 16, word & 0xFFFF)
}
