// Descriptor layout indexing
//
// Flattens the descriptor set layouts a shader is used with into per-set
// binding tables. The instrumentation needs, for every (set, binding), the
// descriptor count and the index of its first descriptor within the set, to
// address the descriptor state buffer. Tables are keyed by binding number,
// so sparse numbering costs nothing.

use crate::state::DescriptorSetLayoutState;
use ash::vk;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindingLayout {
    /// Sum of the descriptor counts of every lower numbered binding in the set
    pub start: u32,
    pub count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationDescriptorSetLayouts {
    pub set_index_to_bindings_layout: Vec<BTreeMap<u32, BindingLayout>>,
    pub has_bindless_descriptors: bool,
}

const BINDLESS_FLAGS: vk::DescriptorBindingFlags = vk::DescriptorBindingFlags::from_raw(
    vk::DescriptorBindingFlags::UPDATE_AFTER_BIND.as_raw()
        | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING.as_raw()
        | vk::DescriptorBindingFlags::PARTIALLY_BOUND.as_raw()
        | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT.as_raw(),
);

impl InstrumentationDescriptorSetLayouts {
    /// Build the table from the set layouts of a pipeline layout or shader object, in set order
    pub fn from_set_layouts(set_layouts: &[Option<Arc<DescriptorSetLayoutState>>]) -> Self {
        let mut layouts = Self {
            set_index_to_bindings_layout: Vec::with_capacity(set_layouts.len()),
            has_bindless_descriptors: false,
        };

        for set_layout in set_layouts {
            let Some(set_layout) = set_layout.as_deref() else {
                layouts.set_index_to_bindings_layout.push(BTreeMap::new());
                continue;
            };
            let table = layouts.index_set(set_layout);
            layouts.set_index_to_bindings_layout.push(table);
        }

        layouts
    }

    fn index_set(&mut self, set_layout: &DescriptorSetLayoutState) -> BTreeMap<u32, BindingLayout> {
        let mut counts = BTreeMap::new();
        for binding in &set_layout.bindings {
            // An inline uniform block is a single descriptor whatever its byte size
            let count = if binding.descriptor_type == vk::DescriptorType::INLINE_UNIFORM_BLOCK {
                1
            } else {
                binding.descriptor_count
            };
            counts.insert(binding.binding, count);

            if binding.binding_flags.intersects(BINDLESS_FLAGS) {
                self.has_bindless_descriptors = true;
            }
        }

        let mut start = 0u32;
        counts
            .into_iter()
            .map(|(binding, count)| {
                let layout = BindingLayout { start, count };
                start = start.saturating_add(count);
                (binding, layout)
            })
            .collect()
    }

    pub fn binding(&self, set: u32, binding: u32) -> Option<BindingLayout> {
        self.set_index_to_bindings_layout
            .get(set as usize)?
            .get(&binding)
            .copied()
    }

    pub fn set_count(&self) -> usize {
        self.set_index_to_bindings_layout.len()
    }
}
