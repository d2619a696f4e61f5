//! Linking verified modules into a VM
//!
//! Loading happens in two phases. The check phase verifies the module and
//! resolves every name it needs from the host (native libraries, native and
//! external functions, external constants and types) without touching VM
//! state. Only when everything resolves does the apply phase register the
//! module's types and materialize its constants, so a failed load leaves the
//! VM exactly as it was.

use std::collections::HashMap;
use std::sync::Arc;

use bytecode_system::{
    function_flags, is_host_bound, verify_module, Constant, LoadError, Module, TypeKind,
};
use core_types::{
    ErrorKind, FieldLayout, FunctionRef, MapKey, MapObject, ModuleId, NativeId, Text, TypeId,
    TypeRegistry, TypeShape, Value, VmError,
};
use memory_manager::{AllocError, Heap};

use crate::native::NativeRegistry;
use crate::profile::ProfileData;

/// A module linked into one VM.
#[derive(Debug)]
pub struct LoadedModule {
    pub(crate) id: ModuleId,
    pub(crate) module: Arc<Module>,
    /// Materialized scalar constants; list and map entries hold `Null` and
    /// are built fresh on every load
    pub(crate) constants: Vec<Value>,
    /// Module-local type id to registry id
    pub(crate) types: Vec<TypeId>,
    /// Host-bound function index to native
    pub(crate) natives: HashMap<u32, NativeId>,
    /// Functions flagged `METHOD`: receiver type, method name, function index
    pub(crate) methods: Vec<(TypeId, String, u32)>,
    pub(crate) profile: ProfileData,
}

impl LoadedModule {
    /// VM-local identity
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Module name
    pub fn name(&self) -> &str {
        self.module.name()
    }

    /// The decoded module
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// Registry id for a module-local type id
    pub(crate) fn type_id(&self, local: u32) -> TypeId {
        self.types.get(local as usize).copied().unwrap_or(TypeId::ANY)
    }

    /// Text of a text constant; verified modules only use valid indices
    pub(crate) fn text(&self, index: u32) -> &str {
        self.module.text_constant(index).unwrap_or("")
    }

    /// Value of constant `index`, allocating fresh containers
    pub(crate) fn constant(&self, index: u32, heap: &mut Heap) -> Result<Value, AllocError> {
        match self.module.constants.get(index as usize) {
            Some(Constant::List(items)) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.constant(*item, heap)?);
                }
                Ok(Value::List(heap.alloc_list(values)?))
            }
            Some(Constant::Map(pairs)) => {
                let mut map = MapObject::new();
                for (key, value) in pairs {
                    let key = self.constant(*key, heap)?;
                    let value = self.constant(*value, heap)?;
                    // The verifier only admits hashable keys.
                    if let Ok(key) = MapKey::from_value(&key) {
                        map.insert(key, value);
                    }
                }
                Ok(Value::Map(heap.alloc_map(map)?))
            }
            _ => Ok(self
                .constants
                .get(index as usize)
                .cloned()
                .unwrap_or(Value::Null)),
        }
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Arc<LoadedModule> {
        let mut builder = bytecode_system::ModuleBuilder::new("test");
        let mut main = bytecode_system::FunctionBuilder::new("main");
        main.emit(&bytecode_system::Opcode::PushNull);
        main.emit(&bytecode_system::Opcode::Return);
        let _ = builder.add_function(main);
        let module = Arc::new(builder.build());
        Arc::new(LoadedModule {
            id: ModuleId(0),
            profile: ProfileData::new(module.functions.len(), 100),
            module,
            constants: Vec::new(),
            types: Vec::new(),
            natives: HashMap::new(),
            methods: Vec::new(),
        })
    }
}

/// Map a load failure to its boundary error
pub(crate) fn load_error(err: LoadError) -> VmError {
    let kind = match &err {
        LoadError::Malformed(_) => ErrorKind::MalformedModule,
        LoadError::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
        LoadError::TypeResolution(_) => ErrorKind::TypeResolutionError,
    };
    VmError::new(kind, err.to_string())
}

/// Names a module needs from the host, resolved during the check phase
struct Resolved {
    natives: HashMap<u32, NativeId>,
    external_constants: HashMap<u32, NativeId>,
    external_types: HashMap<u32, TypeId>,
}

fn resolve(
    module: &Module,
    types: &TypeRegistry,
    natives: &NativeRegistry,
) -> Result<Resolved, LoadError> {
    for library in &module.header.native_libraries {
        if !natives.has_library(library) {
            return Err(LoadError::TypeResolution(format!(
                "native library `{}` is not registered",
                library
            )));
        }
    }

    let mut resolved = Resolved {
        natives: HashMap::new(),
        external_constants: HashMap::new(),
        external_types: HashMap::new(),
    };
    for (index, function) in module.functions.iter().enumerate() {
        if is_host_bound(function) {
            let id = natives.lookup(&function.name).ok_or_else(|| {
                LoadError::TypeResolution(format!("native `{}` is not registered", function.name))
            })?;
            resolved.natives.insert(index as u32, id);
        }
    }
    for (index, constant) in module.constants.iter().enumerate() {
        if let Constant::External(name) = constant {
            let id = natives.lookup(name).ok_or_else(|| {
                LoadError::TypeResolution(format!("external `{}` is not registered", name))
            })?;
            resolved.external_constants.insert(index as u32, id);
        }
    }
    for descriptor in &module.types {
        if let TypeKind::External(name) = &descriptor.kind {
            let id = types.lookup(name).ok_or_else(|| {
                LoadError::TypeResolution(format!("host type `{}` is not registered", name))
            })?;
            resolved.external_types.insert(descriptor.id, id);
        }
    }
    Ok(resolved)
}

fn qualified(module: &Module, name: &str) -> String {
    if name.is_empty() {
        String::new()
    } else {
        format!("{}.{}", module.name(), name)
    }
}

/// Check `module` against the host and link it as `id`
///
/// # Arguments
///
/// * `module` - Decoded module
/// * `id` - Identity the module will have
/// * `types` - Registry receiving the module's types
/// * `natives` - Registered host functions
/// * `jit_threshold` - Calls before a function is reported hot
///
/// # Returns
///
/// The linked module; on error nothing has been registered.
pub(crate) fn link(
    module: Arc<Module>,
    id: ModuleId,
    types: &mut TypeRegistry,
    natives: &NativeRegistry,
    jit_threshold: u64,
) -> Result<LoadedModule, LoadError> {
    verify_module(&module)?;
    let resolved = resolve(&module, types, natives)?;

    // Receiver types of methods must be declared by the module or the host.
    let mut methods = Vec::new();
    for (index, function) in module.functions.iter().enumerate() {
        if !function.has_flag(function_flags::METHOD) {
            continue;
        }
        let Some((receiver, method)) = function.name.rsplit_once('.') else {
            return Err(LoadError::Malformed(format!(
                "method `{}` is not named `Type.method`",
                function.name
            )));
        };
        let local = module.types.iter().find(|t| t.name == receiver).map(|t| t.id);
        if local.is_none() && types.lookup(receiver).is_none() {
            return Err(LoadError::TypeResolution(format!(
                "method `{}` has unknown receiver type `{}`",
                function.name, receiver
            )));
        }
        methods.push((local, receiver.to_string(), method.to_string(), index as u32));
    }

    // Apply: every id is allocated before any shape refers to it.
    let mut mapped = Vec::with_capacity(module.types.len());
    for descriptor in &module.types {
        let type_id = match &descriptor.kind {
            TypeKind::Primitive(kind) => kind.type_id(),
            TypeKind::External(_) => resolved
                .external_types
                .get(&descriptor.id)
                .copied()
                .unwrap_or(TypeId::ANY),
            TypeKind::Struct { .. } => types.define(
                &qualified(&module, &descriptor.name),
                TypeShape::Struct {
                    fields: Vec::new(),
                    size: 0,
                },
                Some(TypeId::MAP),
            ),
            _ => types.define(
                &qualified(&module, &descriptor.name),
                TypeShape::Optional(TypeId::ANY),
                None,
            ),
        };
        mapped.push(type_id);
    }
    let map = |local: u32| mapped.get(local as usize).copied().unwrap_or(TypeId::ANY);
    for descriptor in &module.types {
        let shape = match &descriptor.kind {
            TypeKind::Primitive(_) | TypeKind::External(_) => continue,
            TypeKind::Struct { size, fields } => TypeShape::Struct {
                fields: fields
                    .iter()
                    .map(|f| FieldLayout {
                        name: f.name.clone(),
                        type_id: map(f.type_id),
                        offset: f.offset,
                        indirect: f.is_indirect(),
                    })
                    .collect(),
                size: *size,
            },
            TypeKind::List(element) => TypeShape::List(map(*element)),
            TypeKind::Map(key, value) => TypeShape::Map(map(*key), map(*value)),
            TypeKind::Function { params, ret } => TypeShape::Function {
                params: params.iter().map(|p| map(*p)).collect(),
                ret: map(*ret),
            },
            TypeKind::Optional(inner) => TypeShape::Optional(map(*inner)),
            TypeKind::Union(members) => TypeShape::Union(members.iter().map(|m| map(*m)).collect()),
        };
        types
            .redefine(map(descriptor.id), shape)
            .map_err(|e| LoadError::TypeResolution(e.to_string()))?;
    }

    let constants = module
        .constants
        .iter()
        .enumerate()
        .map(|(index, constant)| match constant {
            Constant::Null | Constant::List(_) | Constant::Map(_) => Value::Null,
            Constant::Boolean(b) => Value::Boolean(*b),
            Constant::Integer(i) => Value::Integer(*i),
            Constant::Decimal(d) => Value::Decimal(*d),
            Constant::Text(s) => Value::Text(Text::new(s)),
            Constant::Function(f) => Value::Function(FunctionRef::Bytecode {
                module: id,
                index: *f,
            }),
            Constant::Type(t) => Value::Integer(i64::from(map(*t).0)),
            Constant::External(_) => resolved
                .external_constants
                .get(&(index as u32))
                .map_or(Value::Null, |native| {
                    Value::Function(FunctionRef::Native(*native))
                }),
        })
        .collect();

    let methods = methods
        .into_iter()
        .map(|(local, receiver, method, index)| {
            let type_id = match local {
                Some(local) => map(local),
                None => types.lookup(&receiver).unwrap_or(TypeId::ANY),
            };
            (type_id, method, index)
        })
        .collect();

    Ok(LoadedModule {
        id,
        profile: ProfileData::new(module.functions.len(), jit_threshold),
        constants,
        types: mapped,
        natives: resolved.natives,
        methods,
        module,
    })
}
