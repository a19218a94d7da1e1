// Error records read back from the error output buffer
//
// Each record is `ERROR_RECORD_SIZE` words: size, unique shader id,
// instruction position, stage id, three stage info words, error group,
// sub code and three parameters whose meaning depends on the error.

use crate::debug_info::ShaderMessageInfo;
use crate::spirv::interface::{
    self, error_group, unpack_set_binding, RECORD_ERROR_GROUP_OFFSET, RECORD_ERROR_SUB_CODE_OFFSET,
    RECORD_INSTRUCTION_POSITION_OFFSET, RECORD_PARAM_OFFSET, RECORD_SHADER_ID_OFFSET, RECORD_SIZE_OFFSET,
    RECORD_STAGE_ID_OFFSET, RECORD_STAGE_INFO_OFFSET,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuErrorRecord {
    /// Words the record spans, as written by the shader
    pub size: u32,
    pub shader_id: u32,
    pub instruction_position: u32,
    pub stage_id: u32,
    pub stage_info: [u32; 3],
    pub group: u32,
    pub sub_code: u32,
    pub params: [u32; 3],
}

impl GpuErrorRecord {
    /// Decode the record at the start of `words`. `None` when the size word
    /// is zero, smaller than a record or runs past the data.
    pub fn parse(words: &[u32]) -> Option<Self> {
        let size = *words.get(RECORD_SIZE_OFFSET)?;
        if (size as usize) <= RECORD_PARAM_OFFSET + 2 || size as usize > words.len() {
            return None;
        }
        let word = |offset: usize| words[offset];
        Some(Self {
            size,
            shader_id: word(RECORD_SHADER_ID_OFFSET),
            instruction_position: word(RECORD_INSTRUCTION_POSITION_OFFSET),
            stage_id: word(RECORD_STAGE_ID_OFFSET),
            stage_info: [
                word(RECORD_STAGE_INFO_OFFSET),
                word(RECORD_STAGE_INFO_OFFSET + 1),
                word(RECORD_STAGE_INFO_OFFSET + 2),
            ],
            group: word(RECORD_ERROR_GROUP_OFFSET),
            sub_code: word(RECORD_ERROR_SUB_CODE_OFFSET),
            params: [
                word(RECORD_PARAM_OFFSET),
                word(RECORD_PARAM_OFFSET + 1),
                word(RECORD_PARAM_OFFSET + 2),
            ],
        })
    }

    pub fn message_info(&self) -> ShaderMessageInfo {
        ShaderMessageInfo {
            shader_id: self.shader_id,
            stage_id: self.stage_id,
            stage_info: self.stage_info,
            instruction_position: self.instruction_position,
        }
    }

    /// The error specific part of the message
    pub fn error_message(&self) -> String {
        let [p0, p1, p2] = self.params;
        match self.group {
            error_group::DESCRIPTOR_INDEXING => {
                let (set, binding) = unpack_set_binding(p2);
                match self.sub_code {
                    interface::descriptor_indexing::INDEX_OOB => format!(
                        "(set = {}, binding = {}) Index of {} used to index descriptor array of length {}.",
                        set, binding, p0, p1
                    ),
                    interface::descriptor_indexing::UNINITIALIZED => format!(
                        "(set = {}, binding = {}) Descriptor index {} is uninitialized.",
                        set, binding, p0
                    ),
                    code => unknown_sub_code(self.group, code),
                }
            }
            error_group::DESCRIPTOR_CLASS => {
                let (set, binding) = unpack_set_binding(p2);
                match self.sub_code {
                    interface::descriptor_class::GENERAL_BUFFER_OOB => format!(
                        "(set = {}, binding = {}) Access ending at byte offset {} is out of bounds. \
                         The descriptor's bound range is {} bytes.",
                        set, binding, p0, p1
                    ),
                    interface::descriptor_class::TEXEL_BUFFER_OOB => format!(
                        "(set = {}, binding = {}) Texel index {} is out of bounds. \
                         The texel buffer view holds {} texels.",
                        set, binding, p0, p1
                    ),
                    code => unknown_sub_code(self.group, code),
                }
            }
            error_group::BUFFER_DEVICE_ADDRESS => {
                let address = ((p1 as u64) << 32) | p0 as u64;
                match self.sub_code {
                    interface::buffer_device_address::UNALLOCATED_REFERENCE => format!(
                        "Out of bounds access: {} bytes at buffer device address 0x{:x}, \
                         which is not within any allocated buffer range.",
                        p2, address
                    ),
                    interface::buffer_device_address::ALIGNMENT => format!(
                        "Unaligned pointer access: buffer device address 0x{:x} is not aligned to {} bytes.",
                        address, p2
                    ),
                    code => unknown_sub_code(self.group, code),
                }
            }
            error_group::RAY_QUERY => self.ray_query_message(),
            error_group::VERTEX_ATTRIBUTE_FETCH => match self.sub_code {
                interface::vertex_attribute_fetch::VERTEX_INDEX_OOB => format!(
                    "Vertex index {} is past the highest vertex {} the bound vertex buffers can provide.",
                    p0, p1
                ),
                interface::vertex_attribute_fetch::INSTANCE_INDEX_OOB => format!(
                    "Instance index {} is past the highest instance {} the bound vertex buffers can provide.",
                    p0, p1
                ),
                code => unknown_sub_code(self.group, code),
            },
            group => format!("Internal Error (unknown error group {}).", group),
        }
    }

    fn ray_query_message(&self) -> String {
        use interface::ray_query as code;
        let [flags, tmin, tmax] = self.params;
        let (tmin, tmax) = (f32::from_bits(tmin), f32::from_bits(tmax));
        match self.sub_code {
            code::NEGATIVE_MIN => format!("OpRayQueryInitializeKHR operand Ray Tmin value is negative ({}).", tmin),
            code::NEGATIVE_MAX => format!("OpRayQueryInitializeKHR operand Ray Tmax value is negative ({}).", tmax),
            code::MIN_MAX => format!(
                "OpRayQueryInitializeKHR operand Ray Tmax ({}) is less than Ray Tmin ({}).",
                tmax, tmin
            ),
            code::MIN_NAN => "OpRayQueryInitializeKHR operand Ray Tmin is NaN.".to_string(),
            code::MAX_NAN => "OpRayQueryInitializeKHR operand Ray Tmax is NaN.".to_string(),
            code::ORIGIN_NAN => "OpRayQueryInitializeKHR operand Ray Origin contains a NaN.".to_string(),
            code::DIRECTION_NAN => "OpRayQueryInitializeKHR operand Ray Direction contains a NaN.".to_string(),
            code::ORIGIN_FINITE => "OpRayQueryInitializeKHR operand Ray Origin contains a non-finite value.".to_string(),
            code::DIRECTION_FINITE => {
                "OpRayQueryInitializeKHR operand Ray Direction contains a non-finite value.".to_string()
            }
            code::BOTH_SKIP => format!(
                "OpRayQueryInitializeKHR operand Ray Flags (0x{:x}) contains both SkipTrianglesKHR and SkipAABBsKHR.",
                flags
            ),
            sub_code => unknown_sub_code(self.group, sub_code),
        }
    }
}

fn unknown_sub_code(group: u32, sub_code: u32) -> String {
    format!("Internal Error (unknown sub code {} in error group {}).", sub_code, group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spirv::interface::{pack_set_binding, ERROR_RECORD_SIZE};

    fn record(group: u32, sub_code: u32, params: [u32; 3]) -> Vec<u32> {
        let mut words = vec![ERROR_RECORD_SIZE, 5, 42, 5, 1, 2, 3, group, sub_code];
        words.extend_from_slice(&params);
        words
    }

    #[test]
    fn header_words_decode_into_message_info() {
        let words = record(error_group::DESCRIPTOR_INDEXING, 1, [6, 4, 0]);
        let parsed = GpuErrorRecord::parse(&words).unwrap();
        assert_eq!(parsed.size, ERROR_RECORD_SIZE);
        assert_eq!(
            parsed.message_info(),
            ShaderMessageInfo {
                shader_id: 5,
                stage_id: 5,
                stage_info: [1, 2, 3],
                instruction_position: 42,
            }
        );
    }

    #[test]
    fn truncated_or_empty_records_are_rejected() {
        let words = record(error_group::DESCRIPTOR_INDEXING, 1, [6, 4, 0]);
        assert!(GpuErrorRecord::parse(&words[..8]).is_none());
        assert!(GpuErrorRecord::parse(&[0; 12]).is_none());
        assert!(GpuErrorRecord::parse(&[]).is_none());
    }

    #[test]
    fn descriptor_index_message_names_set_and_binding() {
        let words = record(
            error_group::DESCRIPTOR_INDEXING,
            interface::descriptor_indexing::INDEX_OOB,
            [6, 4, pack_set_binding(0, 3)],
        );
        let message = GpuErrorRecord::parse(&words).unwrap().error_message();
        assert_eq!(
            message,
            "(set = 0, binding = 3) Index of 6 used to index descriptor array of length 4."
        );
    }

    #[test]
    fn buffer_device_address_joins_address_words() {
        let words = record(
            error_group::BUFFER_DEVICE_ADDRESS,
            interface::buffer_device_address::UNALLOCATED_REFERENCE,
            [0x1000, 0x2, 4],
        );
        let message = GpuErrorRecord::parse(&words).unwrap().error_message();
        assert!(message.contains("0x200001000"), "{}", message);
        assert!(message.contains("4 bytes"));
    }

    #[test]
    fn ray_query_messages_decode_float_params() {
        let words = record(
            error_group::RAY_QUERY,
            interface::ray_query::MIN_MAX,
            [0, 2.0f32.to_bits(), 1.0f32.to_bits()],
        );
        let message = GpuErrorRecord::parse(&words).unwrap().error_message();
        assert!(message.contains("Ray Tmax (1) is less than Ray Tmin (2)"), "{}", message);
    }

    #[test]
    fn unknown_codes_are_internal_errors() {
        let words = record(99, 1, [0; 3]);
        assert!(GpuErrorRecord::parse(&words)
            .unwrap()
            .error_message()
            .starts_with("Internal Error"));
        let words = record(error_group::VERTEX_ATTRIBUTE_FETCH, 9, [0; 3]);
        assert!(GpuErrorRecord::parse(&words)
            .unwrap()
            .error_message()
            .contains("unknown sub code 9"));
    }
}
