//! Virtual machine instance and embedding API
//!
//! A [`Vm`] owns everything it runs: loaded modules, the type registry,
//! registered natives, globals, the heap and the sandbox. Independent
//! instances share nothing but the `Arc<Module>`s a host chooses to load into
//! several of them.

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use bytecode_system::Module;
use core_types::{
    CustomTypeInfo, Destructor, ErrorKind, Fault, FunctionRef, MapKey, MapObject, ModuleId,
    NativeId, RegistryError, TypeId, Value, VmError,
};
use memory_manager::{Heap, HeapStats, ValuePool};
use tracing::info;

use crate::config::{ConfigError, VmConfig};
use crate::dispatch::Dispatcher;
use crate::loader::{link, load_error, LoadedModule};
use crate::native::{NativeContext, NativeEntry, NativeError};
use crate::profile::JitHook;
use crate::runtime::Runtime;
use crate::sandbox::{CancelHandle, Privilege, ResourceLimits, Sandbox, SecurityPolicy};
use crate::shared::SharedVm;

fn registry_error(err: RegistryError) -> VmError {
    VmError::new(ErrorKind::TypeResolutionError, err.to_string())
}

/// A virtual machine instance
///
/// # Example
///
/// ```
/// use bytecode_system::{FunctionBuilder, ModuleBuilder, Opcode};
/// use core_types::Value;
/// use interpreter::{Vm, VmConfig};
///
/// let mut module = ModuleBuilder::new("demo");
/// let answer = module.integer(42);
/// let mut main = FunctionBuilder::new("main");
/// main.emit(&Opcode::LoadConst(answer));
/// main.emit(&Opcode::Return);
/// module.add_function(main).unwrap();
///
/// let mut vm = Vm::new(VmConfig::default()).unwrap();
/// vm.load_module(&module.build().encode()).unwrap();
/// assert_eq!(vm.call("main", &[]).unwrap(), Value::Integer(42));
/// ```
#[derive(Debug)]
pub struct Vm {
    rt: Runtime,
    last_error: Option<VmError>,
}

impl Vm {
    /// Create a VM
    ///
    /// # Arguments
    ///
    /// * `config` - Heap, collection, checkpoint and sandbox settings
    ///
    /// # Returns
    ///
    /// * `Err(ConfigError)` - If the configuration or its policy is invalid
    pub fn new(config: VmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let heap = match config.pool_size {
            Some(slots) => Heap::with_pool(config.heap_config(), Arc::new(ValuePool::new(slots))),
            None => Heap::new(config.heap_config()),
        };
        Self::build(config, heap)
    }

    /// Create a VM whose list buffers are recycled through `pool`
    ///
    /// One pool may serve several VMs.
    pub fn with_pool(config: VmConfig, pool: Arc<ValuePool>) -> Result<Self, ConfigError> {
        config.validate()?;
        let heap = Heap::with_pool(config.heap_config(), pool);
        Self::build(config, heap)
    }

    fn build(config: VmConfig, heap: Heap) -> Result<Self, ConfigError> {
        let sandbox = Sandbox::new(config.policy.clone())?;
        Ok(Self {
            rt: Runtime::new(config, heap, sandbox),
            last_error: None,
        })
    }

    /// Wrap the VM for use from several host threads
    pub fn into_shared(self) -> SharedVm {
        SharedVm::new(self)
    }

    /// Construction parameters, with any policy installed since
    pub fn config(&self) -> &VmConfig {
        &self.rt.config
    }

    fn record<T>(&mut self, result: Result<T, VmError>) -> Result<T, VmError> {
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    /// Decode, verify and link a module image
    ///
    /// # Arguments
    ///
    /// * `bytes` - Encoded module
    ///
    /// # Returns
    ///
    /// * `Ok(ModuleId)` - Identity of the loaded module
    /// * `Err(VmError)` - `MalformedModule`, `UnsupportedVersion` or
    ///   `TypeResolutionError`; nothing is registered on failure
    pub fn load_module(&mut self, bytes: &[u8]) -> Result<ModuleId, VmError> {
        let module = Module::decode(bytes).map_err(load_error);
        let module = self.record(module)?;
        self.load_shared(Arc::new(module))
    }

    /// Read a module image from disk and load it
    pub fn load_module_file(&mut self, path: impl AsRef<Path>) -> Result<ModuleId, VmError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            VmError::new(
                ErrorKind::MalformedModule,
                format!("cannot read `{}`: {}", path.display(), err),
            )
        });
        let bytes = self.record(bytes)?;
        self.load_module(&bytes)
    }

    /// Link an already decoded module
    ///
    /// The same `Arc<Module>` may be loaded into any number of VMs.
    pub fn load_shared(&mut self, module: Arc<Module>) -> Result<ModuleId, VmError> {
        if self.rt.module_named(module.name()).is_some() {
            let err = VmError::new(
                ErrorKind::TypeResolutionError,
                format!("module `{}` is already loaded", module.name()),
            );
            return self.record(Err(err));
        }
        let id = ModuleId(self.rt.modules.len() as u32);
        let linked = link(
            module,
            id,
            &mut self.rt.types,
            &self.rt.natives,
            self.rt.config.jit_threshold,
        )
        .map_err(load_error);
        let linked = Arc::new(self.record(linked)?);
        for (type_id, name, index) in &linked.methods {
            self.rt.methods.insert(
                (*type_id, name.clone()),
                Value::Function(FunctionRef::Bytecode {
                    module: id,
                    index: *index,
                }),
            );
        }
        info!(
            module = %linked.name(),
            id = id.0,
            functions = linked.module.functions.len(),
            "module loaded"
        );
        self.rt.modules.push(Some(linked));
        Ok(id)
    }

    /// Remove a module
    ///
    /// Its registered types stay. Continuations already running its code
    /// keep the module alive until they finish.
    pub fn unload_module(&mut self, id: ModuleId) -> Result<(), VmError> {
        let removed = self
            .rt
            .modules
            .get_mut(id.0 as usize)
            .and_then(Option::take);
        let Some(module) = removed else {
            let err = VmError::new(
                ErrorKind::TypeResolutionError,
                format!("module {} is not loaded", id.0),
            );
            return self.record(Err(err));
        };
        self.rt.methods.retain(|_, method| {
            !matches!(method, Value::Function(FunctionRef::Bytecode { module, .. }) if *module == id)
        });
        info!(module = %module.name(), id = id.0, "module unloaded");
        Ok(())
    }

    /// A loaded module
    pub fn module(&self, id: ModuleId) -> Option<Arc<LoadedModule>> {
        self.rt.module(id).ok()
    }

    /// Identity of a loaded module by name
    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.rt.module_named(name).map(|m| m.id)
    }

    /// Function value for a named function of a loaded module
    pub fn function(&self, module: ModuleId, name: &str) -> Option<Value> {
        let loaded = self.rt.module(module).ok()?;
        let index = loaded.module.function_index(name)?;
        Some(Value::Function(FunctionRef::Bytecode { module, index }))
    }

    fn begin(&mut self) -> Result<(), VmError> {
        if self.rt.poisoned {
            return Err(VmError::new(
                ErrorKind::OutOfMemory,
                "VM is unusable after running out of memory while raising an exception",
            ));
        }
        self.rt.meter.reset();
        self.rt.drain_released();
        Ok(())
    }

    /// Call a function by name, searching loaded modules in load order
    ///
    /// # Arguments
    ///
    /// * `name` - Function name
    /// * `args` - Argument values
    ///
    /// # Returns
    ///
    /// * `Ok(Value)` - The function's result; a continuation for generator
    ///   and async functions
    /// * `Err(VmError)` - An uncaught exception or a fatal error
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, VmError> {
        let target = self
            .rt
            .modules
            .iter()
            .flatten()
            .find_map(|m| m.module.function_index(name).map(|index| (m.id, index)));
        let Some((module, index)) = target else {
            let err = VmError::new(
                ErrorKind::TypeResolutionError,
                format!("no loaded module defines `{}`", name),
            );
            return self.record(Err(err));
        };
        self.call_value(&Value::Function(FunctionRef::Bytecode { module, index }), args)
    }

    /// Call a function of one module
    pub fn call_in(&mut self, module: ModuleId, name: &str, args: &[Value]) -> Result<Value, VmError> {
        let Some(callee) = self.function(module, name) else {
            let err = VmError::new(
                ErrorKind::TypeResolutionError,
                format!("module {} does not define `{}`", module.0, name),
            );
            return self.record(Err(err));
        };
        self.call_value(&callee, args)
    }

    /// Call any callable value: a function, closure or native
    pub fn call_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value, VmError> {
        let result = match self.begin() {
            Ok(()) => Dispatcher::new(&mut self.rt).call(callee, args.to_vec()),
            Err(err) => Err(err),
        };
        self.record(result)
    }

    /// Run a continuation until it yields, awaits or returns
    ///
    /// # Arguments
    ///
    /// * `continuation` - Value returned by calling a generator or async
    ///   function
    /// * `sent` - Result of the `Yield`/`Await` the frame is suspended at;
    ///   ignored on the first resume
    ///
    /// # Returns
    ///
    /// * `Ok((value, done))` - The yielded value with `done == false`, or the
    ///   returned value with `done == true`
    pub fn resume(&mut self, continuation: &Value, sent: Value) -> Result<(Value, bool), VmError> {
        let result = match self.begin() {
            Ok(()) => Dispatcher::new(&mut self.rt).resume(continuation, sent),
            Err(err) => Err(err),
        };
        self.record(result)
    }

    /// Register a host function callable as `name`
    ///
    /// Modules reference natives by qualified name (`library.function`), so
    /// natives must be registered before the modules that use them load.
    pub fn register_native<F>(&mut self, name: &str, func: F) -> NativeId
    where
        F: Fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.rt.natives.register(NativeEntry::new(name, None, func))
    }

    /// Register a host function with data it can read through
    /// [`NativeContext::data`]
    pub fn register_native_with_data<F>(
        &mut self,
        name: &str,
        data: Arc<dyn Any + Send + Sync>,
        func: F,
    ) -> NativeId
    where
        F: Fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.rt
            .natives
            .register(NativeEntry::new(name, None, func).with_data(data))
    }

    /// Register a host function the sandbox checks before every call
    pub fn register_privileged_native<F>(
        &mut self,
        name: &str,
        privilege: Privilege,
        func: F,
    ) -> NativeId
    where
        F: Fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.rt
            .natives
            .register(NativeEntry::new(name, Some(privilege), func))
    }

    /// Function value for a registered native
    pub fn native(&self, name: &str) -> Option<Value> {
        self.rt
            .natives
            .lookup(name)
            .map(|id| Value::Function(FunctionRef::Native(id)))
    }

    /// Register an opaque host type
    pub fn register_type(
        &mut self,
        name: &str,
        destructor: Option<Destructor>,
    ) -> Result<TypeId, VmError> {
        let result = self
            .rt
            .types
            .register_custom(name, destructor)
            .map_err(registry_error);
        self.record(result)
    }

    /// Register an opaque host type with a comparison hook
    pub fn register_type_info(&mut self, name: &str, info: CustomTypeInfo) -> Result<TypeId, VmError> {
        let result = self
            .rt
            .types
            .register_custom_info(name, info)
            .map_err(registry_error);
        self.record(result)
    }

    /// Bind `callable` as method `name` of `type_id`
    ///
    /// `CallMethod` passes the receiver as the first argument. Methods are
    /// inherited by subtypes.
    pub fn register_method(&mut self, type_id: TypeId, name: &str, callable: Value) -> Result<(), VmError> {
        if !matches!(callable, Value::Function(_) | Value::Closure(_)) {
            let err = VmError::from(Fault::TypeMismatch {
                expected: TypeId::FUNCTION,
                actual: callable.type_id(),
            });
            return self.record(Err(err));
        }
        if self.rt.types.get(type_id).is_none() {
            return self.record(Err(registry_error(RegistryError::UnknownType(type_id.0))));
        }
        self.rt.methods.insert((type_id, name.to_string()), callable);
        Ok(())
    }

    /// Wrap host data in a value of a registered custom type
    ///
    /// The type's destructor runs when the last reference is released.
    pub fn new_custom(
        &mut self,
        type_id: TypeId,
        data: Box<dyn Any + Send + Sync>,
    ) -> Result<Value, VmError> {
        let Some(info) = self.rt.types.custom_info(type_id) else {
            let err = VmError::new(
                ErrorKind::TypeMismatch,
                format!("`{}` is not a custom type", self.rt.types.name(type_id)),
            );
            return self.record(Err(err));
        };
        let destructor = info.destructor.clone();
        let cell = self
            .rt
            .heap
            .alloc_custom(type_id, data, destructor)
            .map_err(|err| VmError::from(Fault::from(err)));
        self.record(cell).map(Value::Custom)
    }

    /// Allocate a list
    pub fn new_list(&mut self, items: Vec<Value>) -> Result<Value, VmError> {
        let cell = self
            .rt
            .heap
            .alloc_list(items)
            .map_err(|err| VmError::from(Fault::from(err)));
        self.record(cell).map(Value::List)
    }

    /// Allocate a map; keys must be null, booleans, integers or text
    pub fn new_map(&mut self, entries: Vec<(Value, Value)>) -> Result<Value, VmError> {
        let mut map = MapObject::new();
        for (key, value) in entries {
            let key = MapKey::from_value(&key).map_err(VmError::from);
            map.insert(self.record(key)?, value);
        }
        let cell = self
            .rt
            .heap
            .alloc_map(map)
            .map_err(|err| VmError::from(Fault::from(err)));
        self.record(cell).map(Value::Map)
    }

    /// Allocate text
    pub fn new_text(&mut self, s: &str) -> Result<Value, VmError> {
        let text = self
            .rt
            .heap
            .alloc_text(s)
            .map_err(|err| VmError::from(Fault::from(err)));
        self.record(text).map(Value::Text)
    }

    /// Dynamic type of a value
    pub fn type_of(&self, value: &Value) -> TypeId {
        self.rt.types.type_of(value)
    }

    /// Whether `value` is an instance of `type_id` or one of its subtypes
    pub fn is_instance(&self, value: &Value, type_id: TypeId) -> bool {
        self.rt.types.is_instance(value, type_id)
    }

    /// Registered name of a type
    pub fn type_name(&self, type_id: TypeId) -> &str {
        self.rt.types.name(type_id)
    }

    /// Registry id of a named type; module structs are named `module.Type`
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.rt.types.lookup(name)
    }

    /// Installed security policy
    pub fn policy(&self) -> &SecurityPolicy {
        self.rt.sandbox.policy()
    }

    /// Replace the security policy
    ///
    /// A memory limit in the policy lowers the heap ceiling; it never raises
    /// it above the configured one.
    pub fn set_policy(&mut self, policy: SecurityPolicy) -> Result<(), ConfigError> {
        let sandbox = Sandbox::new(policy.clone())?;
        self.rt.meter.set_limits(policy.limits);
        self.rt.config.policy = policy;
        let ceiling = self.rt.config.heap_config().ceiling;
        self.rt.heap.set_ceiling(ceiling);
        self.rt.sandbox = sandbox;
        info!(ceiling, "security policy installed");
        Ok(())
    }

    /// Replace only the resource limits of the installed policy
    pub fn set_limits(&mut self, limits: ResourceLimits) -> Result<(), ConfigError> {
        let mut policy = self.policy().clone();
        policy.limits = limits;
        self.set_policy(policy)
    }

    /// Error of the most recent failed operation
    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    /// Run the cycle collector now and return the number of cells reclaimed
    pub fn collect_garbage(&mut self) -> usize {
        self.rt.drain_released();
        self.rt.collect()
    }

    /// Heap counters
    pub fn heap_stats(&self) -> HeapStats {
        self.rt.heap.stats()
    }

    /// Handle that cancels the running call from any thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.rt.cancel.clone()
    }

    /// Take a counted reference
    pub fn retain(&self, value: &Value) -> Value {
        Heap::retain(value)
    }

    /// Give up a counted reference
    pub fn release(&self, value: Value) {
        Heap::release(value)
    }

    /// Reference count of a heap value, `None` for immediates
    pub fn refcount(&self, value: &Value) -> Option<usize> {
        Heap::refcount(value)
    }

    /// Read a global
    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.rt.globals.get(name).cloned()
    }

    /// Write a global; globals are roots for the cycle collector
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.rt.globals.insert(name.to_string(), value);
    }

    /// Install the receiver of hot-function notifications
    pub fn set_jit_hook(&mut self, hook: Arc<dyn JitHook>) {
        self.rt.jit = Some(hook);
    }

    /// Calls recorded for a function
    pub fn call_count(&self, module: ModuleId, name: &str) -> u64 {
        self.rt.module(module).ok().map_or(0, |loaded| {
            loaded
                .module
                .function_index(name)
                .map_or(0, |index| loaded.profile.call_count(index))
        })
    }

    /// Continuation slots not yet released
    pub fn live_continuations(&mut self) -> usize {
        self.rt.drain_released();
        self.rt.arena.len()
    }
}
