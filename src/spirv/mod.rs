// SPIR-V layer - module IR, code generation helpers and instrumentation passes
//
// Design: a flat, position-preserving instruction list split into the logical
// sections of a module. Passes edit it in place; the linker appends helper
// functions at the end.

pub mod builder;
pub mod builtins;
pub mod instruction;
pub mod interface;
pub mod link;
pub mod module;
pub mod passes;

pub use instruction::Instruction;
pub use module::{Module, ModuleSettings};

/// Enumerant values as raw operand words
pub(crate) mod consts {
    use rspirv::spirv::{
        BuiltIn, Capability, Dim, FunctionControl, LoopControl, MemoryAccess, MemoryModel, Op, Scope,
        SelectionControl, StorageClass,
    };

    pub const STORAGE_CLASS_UNIFORM_CONSTANT: u32 = StorageClass::UniformConstant as u32;
    pub const STORAGE_CLASS_INPUT: u32 = StorageClass::Input as u32;
    pub const STORAGE_CLASS_UNIFORM: u32 = StorageClass::Uniform as u32;
    pub const STORAGE_CLASS_PRIVATE: u32 = StorageClass::Private as u32;
    pub const STORAGE_CLASS_FUNCTION: u32 = StorageClass::Function as u32;
    pub const STORAGE_CLASS_STORAGE_BUFFER: u32 = StorageClass::StorageBuffer as u32;
    pub const STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER: u32 = StorageClass::PhysicalStorageBuffer as u32;

    pub const CAPABILITY_INT64: u32 = Capability::Int64 as u32;
    pub const CAPABILITY_VULKAN_MEMORY_MODEL_DEVICE_SCOPE: u32 = Capability::VulkanMemoryModelDeviceScope as u32;
    pub const MEMORY_MODEL_VULKAN: u32 = MemoryModel::Vulkan as u32;

    pub const BUILTIN_PRIMITIVE_ID: u32 = BuiltIn::PrimitiveId as u32;
    pub const BUILTIN_INVOCATION_ID: u32 = BuiltIn::InvocationId as u32;
    pub const BUILTIN_TESS_COORD: u32 = BuiltIn::TessCoord as u32;
    pub const BUILTIN_FRAG_COORD: u32 = BuiltIn::FragCoord as u32;
    pub const BUILTIN_GLOBAL_INVOCATION_ID: u32 = BuiltIn::GlobalInvocationId as u32;
    pub const BUILTIN_VERTEX_INDEX: u32 = BuiltIn::VertexIndex as u32;
    pub const BUILTIN_INSTANCE_INDEX: u32 = BuiltIn::InstanceIndex as u32;
    pub const BUILTIN_LAUNCH_ID: u32 = BuiltIn::LaunchIdKHR as u32;

    pub const OP_DECORATE_STRING: u32 = Op::DecorateString as u32;
    pub const OP_MEMBER_DECORATE_STRING: u32 = Op::MemberDecorateString as u32;
    pub const OP_TYPE_ACCELERATION_STRUCTURE: u32 = Op::TypeAccelerationStructureKHR as u32;

    pub const DIM_BUFFER: u32 = Dim::DimBuffer as u32;
    pub const MEMORY_ACCESS_ALIGNED: u32 = MemoryAccess::ALIGNED.bits();
    pub const SCOPE_DEVICE: u32 = Scope::Device as u32;
    pub const SELECTION_CONTROL_NONE: u32 = SelectionControl::NONE.bits();
    pub const LOOP_CONTROL_NONE: u32 = LoopControl::NONE.bits();
    pub const FUNCTION_CONTROL_NONE: u32 = FunctionControl::NONE.bits();

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn operand_words_match_the_grammar() {
            assert_eq!(STORAGE_CLASS_STORAGE_BUFFER, 12);
            assert_eq!(STORAGE_CLASS_PHYSICAL_STORAGE_BUFFER, 5349);
            assert_eq!(CAPABILITY_VULKAN_MEMORY_MODEL_DEVICE_SCOPE, 5346);
            assert_eq!(BUILTIN_GLOBAL_INVOCATION_ID, 28);
            assert_eq!(BUILTIN_LAUNCH_ID, 5319);
            assert_eq!(OP_DECORATE_STRING, 5632);
            assert_eq!(OP_TYPE_ACCELERATION_STRUCTURE, 5341);
            assert_eq!(DIM_BUFFER, 5);
            assert_eq!(MEMORY_ACCESS_ALIGNED, 0x2);
        }
    }
}

/// Execution models as reported in the stage id word of a record
pub mod execution_model {
    pub const VERTEX: u32 = 0;
    pub const TESSELLATION_CONTROL: u32 = 1;
    pub const TESSELLATION_EVALUATION: u32 = 2;
    pub const GEOMETRY: u32 = 3;
    pub const FRAGMENT: u32 = 4;
    pub const GL_COMPUTE: u32 = 5;
    pub const KERNEL: u32 = 6;
    pub const TASK_NV: u32 = 5267;
    pub const MESH_NV: u32 = 5268;
    pub const RAY_GENERATION: u32 = 5313;
    pub const INTERSECTION: u32 = 5314;
    pub const ANY_HIT: u32 = 5315;
    pub const CLOSEST_HIT: u32 = 5316;
    pub const MISS: u32 = 5317;
    pub const CALLABLE: u32 = 5318;
    pub const TASK_EXT: u32 = 5364;
    pub const MESH_EXT: u32 = 5365;

    pub fn name(model: u32) -> &'static str {
        match model {
            VERTEX => "Vertex",
            TESSELLATION_CONTROL => "Tessellation Control",
            TESSELLATION_EVALUATION => "Tessellation Eval",
            GEOMETRY => "Geometry",
            FRAGMENT => "Fragment",
            GL_COMPUTE => "Compute",
            KERNEL => "Kernel",
            TASK_NV | TASK_EXT => "Task",
            MESH_NV | MESH_EXT => "Mesh",
            RAY_GENERATION => "Ray Generation",
            INTERSECTION => "Intersection",
            ANY_HIT => "Any Hit",
            CLOSEST_HIT => "Closest Hit",
            MISS => "Miss",
            CALLABLE => "Callable",
            _ => "Unknown",
        }
    }

    pub fn is_ray_tracing(model: u32) -> bool {
        (RAY_GENERATION..=CALLABLE).contains(&model)
    }
}
