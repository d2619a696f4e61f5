//! Thread-safe VM handle
//!
//! Host threads take turns through one VM-wide lock. Cancellation does not
//! need the lock, so a watchdog can stop a call another thread is running.

use std::sync::Arc;

use bytecode_system::Module;
use core_types::{ModuleId, Value, VmError};
use parking_lot::{Mutex, MutexGuard};

use crate::sandbox::CancelHandle;
use crate::vm::Vm;

/// A [`Vm`] shared between threads.
///
/// # Examples
///
/// ```
/// use interpreter::{Vm, VmConfig};
///
/// let shared = Vm::new(VmConfig::default()).unwrap().into_shared();
/// let worker = shared.clone();
/// std::thread::spawn(move || worker.lock().set_global("ready", true.into()))
///     .join()
///     .unwrap();
/// assert_eq!(shared.lock().get_global("ready"), Some(true.into()));
/// ```
#[derive(Debug, Clone)]
pub struct SharedVm {
    inner: Arc<Mutex<Vm>>,
    cancel: CancelHandle,
}

impl SharedVm {
    pub(crate) fn new(vm: Vm) -> Self {
        let cancel = vm.cancel_handle();
        Self {
            inner: Arc::new(Mutex::new(vm)),
            cancel,
        }
    }

    /// Exclusive access for a sequence of operations
    pub fn lock(&self) -> MutexGuard<'_, Vm> {
        self.inner.lock()
    }

    /// Load an encoded module
    pub fn load_module(&self, bytes: &[u8]) -> Result<ModuleId, VmError> {
        self.inner.lock().load_module(bytes)
    }

    /// Load a decoded module
    pub fn load_shared(&self, module: Arc<Module>) -> Result<ModuleId, VmError> {
        self.inner.lock().load_shared(module)
    }

    /// Call a function by name
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        self.inner.lock().call(name, args)
    }

    /// Resume a continuation
    pub fn resume(&self, continuation: &Value, sent: Value) -> Result<(Value, bool), VmError> {
        self.inner.lock().resume(continuation, sent)
    }

    /// Cancel whatever call is running, without taking the lock
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// The VM's cancellation handle
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}
