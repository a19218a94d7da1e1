// Ray tracing pipelines and deferred host operations
//
// A deferred `vkCreateRayTracingPipelinesKHR` returns before the pipelines
// exist. The post-call bookkeeping is then parked as a continuation owning the
// per-call metadata and runs once the layer sees the operation complete.

use super::{CreatePipelinesState, ShaderInstrumentor};
use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Bookkeeping to run with the pipelines of a completed deferred operation
pub type DeferredCompletion = Box<dyn FnOnce(&[vk::Pipeline]) + Send>;

/// Continuations registered per deferred operation
#[derive(Default)]
pub struct DeferredOperationCallbacks {
    pending: Mutex<HashMap<vk::DeferredOperationKHR, Vec<DeferredCompletion>>>,
}

impl DeferredOperationCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, operation: vk::DeferredOperationKHR, completion: DeferredCompletion) {
        self.pending.lock().entry(operation).or_default().push(completion);
    }

    pub fn pending_count(&self, operation: vk::DeferredOperationKHR) -> usize {
        self.pending.lock().get(&operation).map_or(0, Vec::len)
    }

    /// Run every continuation of `operation` with the created pipelines.
    /// Continuations run once; later calls for the same operation do nothing.
    pub fn complete(&self, operation: vk::DeferredOperationKHR, pipelines: &[vk::Pipeline]) -> usize {
        let completions = self.pending.lock().remove(&operation).unwrap_or_default();
        let count = completions.len();
        for completion in completions {
            completion(pipelines);
        }
        count
    }
}

impl std::fmt::Debug for DeferredOperationCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredOperationCallbacks")
            .field("operations", &self.pending.lock().len())
            .finish()
    }
}

impl ShaderInstrumentor {
    pub fn post_call_record_create_ray_tracing_pipelines(
        self: &Arc<Self>,
        deferred_operation: vk::DeferredOperationKHR,
        result: vk::Result,
        pipelines: &[vk::Pipeline],
        state: CreatePipelinesState,
        callbacks: &DeferredOperationCallbacks,
    ) {
        let _coarse = self.coarse_write();
        if deferred_operation != vk::DeferredOperationKHR::null() && result == vk::Result::OPERATION_DEFERRED_KHR {
            let instrumentor = Arc::clone(self);
            callbacks.push(
                deferred_operation,
                Box::new(move |pipelines: &[vk::Pipeline]| {
                    let _coarse = instrumentor.coarse_write();
                    instrumentor.record_created_pipelines(pipelines, state);
                }),
            );
            return;
        }
        self.record_created_pipelines(pipelines, state);
    }
}
