//! State shared by the dispatcher and the embedding API
//!
//! Everything a VM instance owns lives here: loaded modules, registries,
//! globals, the heap, the sandbox and the continuation arena. Nothing is
//! process-global, so independent VMs never observe each other.

use std::collections::HashMap;
use std::sync::Arc;

use core_types::{
    ErrorKind, Fault, FrameId, MapKey, MapObject, ModuleId, Object, TypeId, TypeRegistry, Value,
    VmError,
};
use crossbeam::queue::SegQueue;
use memory_manager::{AllocError, Heap, RootSet};
use tracing::{debug, warn};

use crate::config::VmConfig;
use crate::continuation::{ContinuationArena, ContinuationKey, ContinuationRef};
use crate::loader::LoadedModule;
use crate::native::NativeRegistry;
use crate::profile::JitHook;
use crate::sandbox::{CancelHandle, ExecutionMeter, Sandbox};

pub(crate) struct Runtime {
    pub(crate) config: VmConfig,
    pub(crate) modules: Vec<Option<Arc<LoadedModule>>>,
    pub(crate) types: TypeRegistry,
    pub(crate) natives: NativeRegistry,
    pub(crate) methods: HashMap<(TypeId, String), Value>,
    pub(crate) globals: HashMap<String, Value>,
    pub(crate) heap: Heap,
    pub(crate) sandbox: Sandbox,
    pub(crate) meter: ExecutionMeter,
    pub(crate) cancel: CancelHandle,
    pub(crate) arena: ContinuationArena,
    pub(crate) released: Arc<SegQueue<ContinuationKey>>,
    pub(crate) jit: Option<Arc<dyn JitHook>>,
    next_frame: u64,
    /// Set when an exception value could not be built; the VM refuses work
    pub(crate) poisoned: bool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("modules", &self.modules.iter().flatten().count())
            .field("globals", &self.globals.len())
            .field("heap", &self.heap.stats())
            .field("continuations", &self.arena.len())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub(crate) fn new(config: VmConfig, heap: Heap, sandbox: Sandbox) -> Self {
        let meter = ExecutionMeter::new(config.checkpoint_interval, config.policy.limits);
        Self {
            config,
            modules: Vec::new(),
            types: TypeRegistry::new(),
            natives: NativeRegistry::with_builtins(),
            methods: HashMap::new(),
            globals: HashMap::new(),
            heap,
            sandbox,
            meter,
            cancel: CancelHandle::new(),
            arena: ContinuationArena::new(),
            released: Arc::new(SegQueue::new()),
            jit: None,
            next_frame: 0,
            poisoned: false,
        }
    }

    pub(crate) fn module(&self, id: ModuleId) -> Result<Arc<LoadedModule>, Fault> {
        self.modules
            .get(id.0 as usize)
            .and_then(Option::clone)
            .ok_or_else(|| Fault::runtime(format!("module {} is not loaded", id.0)))
    }

    pub(crate) fn module_named(&self, name: &str) -> Option<&Arc<LoadedModule>> {
        self.modules.iter().flatten().find(|m| m.name() == name)
    }

    pub(crate) fn next_frame_id(&mut self) -> FrameId {
        self.next_frame += 1;
        FrameId(self.next_frame)
    }

    /// Exception value for a fault: a map tagged with the fault's error type
    ///
    /// Draws on the heap's emergency reserve. If even that is exhausted the
    /// VM is poisoned and `None` is returned.
    pub(crate) fn exception_value(&mut self, fault: &Fault) -> Option<Value> {
        match self.build_exception(fault) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(%fault, %err, "cannot allocate exception value; VM poisoned");
                self.poisoned = true;
                None
            }
        }
    }

    fn build_exception(&mut self, fault: &Fault) -> Result<Value, AllocError> {
        let mut map = MapObject::tagged(fault.error_type());
        let kind = self.heap.alloc_reserved_text(&fault.kind().to_string())?;
        let message = self.heap.alloc_reserved_text(&fault.to_string())?;
        map.insert(MapKey::from("kind"), Value::Text(kind));
        map.insert(MapKey::from("message"), Value::Text(message));
        Ok(Value::Map(self.heap.alloc_reserved_map(map)?))
    }

    /// Boundary error for an exception nobody caught
    pub(crate) fn uncaught(&self, exception: &Value) -> VmError {
        let tag = exception.type_id();
        let kind = Fault::kind_for_error_type(tag).unwrap_or(ErrorKind::UncaughtException);
        let message = match exception {
            Value::Map(cell) => match &*cell.read() {
                Object::Map(map) => match map.get(&MapKey::from("message")) {
                    Some(Value::Text(text)) => text.to_string(),
                    _ => format!("uncaught {}", self.types.name(tag)),
                },
                _ => exception.to_string(),
            },
            other => format!("uncaught exception: {}", other),
        };
        VmError::new(kind, message).with_exception(exception.clone())
    }

    /// Wrap an arena key in a continuation value
    pub(crate) fn continuation_value(&mut self, key: ContinuationKey) -> Result<Value, AllocError> {
        let handle = ContinuationRef::new(key, self.released.clone());
        let cell = self
            .heap
            .alloc_custom(TypeId::CONTINUATION, Box::new(handle), None)?;
        Ok(Value::Custom(cell))
    }

    /// Arena key of a continuation value
    pub(crate) fn continuation_key(value: &Value) -> Option<ContinuationKey> {
        match value {
            Value::Custom(cell) => match &*cell.read() {
                Object::Custom(custom) if custom.type_id == TypeId::CONTINUATION => custom
                    .downcast_ref::<ContinuationRef>()
                    .map(ContinuationRef::key),
                _ => None,
            },
            _ => None,
        }
    }

    /// Free arena slots whose handles were dropped
    pub(crate) fn drain_released(&mut self) {
        self.arena.drain(&self.released);
    }

    /// Limit, cancellation and collection checkpoint
    pub(crate) fn checkpoint(&mut self) -> Result<(), Fault> {
        self.meter.check(&self.cancel)?;
        self.drain_released();
        if self.heap.should_collect() {
            self.collect();
        }
        Ok(())
    }

    /// Run the cycle collector with the globals as explicit roots
    ///
    /// Frames, parked continuations and host handles hold their values
    /// outside the tracked heap, so the collector sees them as external
    /// references.
    pub(crate) fn collect(&mut self) -> usize {
        let mut roots = RootSet::new();
        roots.extend(self.globals.values().cloned());
        let stats = self.heap.collect(&roots);
        debug!(reclaimed = stats.reclaimed, "garbage collected");
        stats.reclaimed
    }
}
