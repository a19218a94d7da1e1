// Message reporting - the host's validation message channel
//
// Everything the instrumentor has to say goes through `DebugReport`. The
// default implementation forwards to the `log` facade.

use ash::vk;
use ash::vk::Handle;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Which feature the layer is running as; selects the message id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    #[default]
    GpuAssisted,
    DebugPrintfOnly,
}

impl ValidationMode {
    pub fn message_id(self) -> &'static str {
        match self {
            ValidationMode::GpuAssisted => "UNASSIGNED-GPU-Assisted-Validation",
            ValidationMode::DebugPrintfOnly => "UNASSIGNED-DEBUG-PRINTF",
        }
    }
}

/// Vulkan objects a message is about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogObjectList {
    objects: Vec<(vk::ObjectType, u64)>,
}

impl LogObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<H: Handle>(mut self, handle: H) -> Self {
        self.add(handle);
        self
    }

    /// Null handles are skipped
    pub fn add<H: Handle>(&mut self, handle: H) {
        let raw = handle.as_raw();
        if raw != 0 {
            self.objects.push((H::TYPE, raw));
        }
    }

    /// For objects known only by type and raw handle, e.g. from debug utils
    pub fn add_raw(&mut self, object_type: vk::ObjectType, raw: u64) {
        if raw != 0 {
            self.objects.push((object_type, raw));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(vk::ObjectType, u64)> {
        self.objects.iter()
    }
}

impl fmt::Display for LogObjectList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (object_type, raw)) in self.objects.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?} 0x{:x}", object_type, raw)?;
        }
        Ok(())
    }
}

/// Sink for validation messages
pub trait DebugReport: Send + Sync {
    fn report(&self, severity: Severity, message_id: &str, objects: &LogObjectList, message: &str);
}

/// Forwards messages to the `log` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDebugReport;

impl DebugReport for LogDebugReport {
    fn report(&self, severity: Severity, message_id: &str, objects: &LogObjectList, message: &str) {
        let objects = if objects.is_empty() {
            String::new()
        } else {
            format!(" [{}]", objects)
        };
        match severity {
            Severity::Error => log::error!("{}{}: {}", message_id, objects, message),
            Severity::Warning => log::warn!("{}{}: {}", message_id, objects, message),
            Severity::Info => log::info!("{}{}: {}", message_id, objects, message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handles_are_not_listed() {
        let objects = LogObjectList::new()
            .with(vk::Pipeline::null())
            .with(vk::Pipeline::from_raw(0x42));
        assert_eq!(objects.iter().count(), 1);
        assert_eq!(objects.to_string(), "PIPELINE 0x42");
    }

    #[test]
    fn message_ids_follow_mode() {
        assert_eq!(ValidationMode::GpuAssisted.message_id(), "UNASSIGNED-GPU-Assisted-Validation");
        assert_eq!(ValidationMode::DebugPrintfOnly.message_id(), "UNASSIGNED-DEBUG-PRINTF");
    }
}
