// Selective instrumentation
//
// With selection on, only shaders the application opted in are instrumented:
// an enable flag on the create info, an object registered earlier (its create
// info carried the flag, or its debug name matched a configured regex), or a
// debug name matching a regex directly.

use ash::vk;
use ash::vk::Handle;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashSet;

#[derive(Debug)]
pub struct ShaderSelector {
    enabled: bool,
    name_filters: Vec<Regex>,
    selected: RwLock<HashSet<(vk::ObjectType, u64)>>,
}

impl ShaderSelector {
    pub fn new(enabled: bool, name_filters: Vec<Regex>) -> Self {
        Self {
            enabled,
            name_filters,
            selected: RwLock::new(HashSet::new()),
        }
    }

    /// Whether only opted-in shaders are instrumented
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name_filters.iter().any(|filter| filter.is_match(name))
    }

    pub fn select(&self, object_type: vk::ObjectType, handle: u64) {
        self.selected.write().insert((object_type, handle));
    }

    pub fn select_handle<H: Handle>(&self, handle: H) {
        self.select(H::TYPE, handle.as_raw());
    }

    pub fn is_selected<H: Handle>(&self, handle: H) -> bool {
        let raw = handle.as_raw();
        raw != 0 && self.selected.read().contains(&(H::TYPE, raw))
    }

    pub fn forget<H: Handle>(&self, handle: H) {
        self.selected.write().remove(&(H::TYPE, handle.as_raw()));
    }

    /// Decide for one shader. `enable_flag` is any explicit opt-in on the
    /// create infos involved, `names` the debug names known for it.
    pub fn wants<'a>(
        &self,
        enable_flag: bool,
        module: vk::ShaderModule,
        names: impl IntoIterator<Item = Option<&'a str>>,
    ) -> bool {
        if !self.enabled || enable_flag || self.is_selected(module) {
            return true;
        }
        names.into_iter().flatten().any(|name| self.matches_name(name))
    }
}
