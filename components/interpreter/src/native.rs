//! Host functions callable from bytecode
//!
//! Natives receive argument values directly and a [`NativeContext`] for
//! allocating results. A native returning `Err` is treated like a thrown
//! exception at the call site.

use std::any::Any;
use std::collections::HashMap;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use core_types::{Fault, MapKey, MapObject, NativeId, Object, TypeId, TypeRegistry, Value};
use memory_manager::{AllocError, Heap};
use thiserror::Error;
use tracing::debug;

use crate::sandbox::Privilege;

/// Failure of a native function.
#[derive(Debug, Error)]
pub enum NativeError {
    /// The host operation failed; surfaces as `HostCallbackError`
    #[error("{0}")]
    Failed(String),

    /// A VM fault such as a type mismatch
    #[error(transparent)]
    Fault(#[from] Fault),

    /// Throw an arbitrary value
    #[error("native threw {0}")]
    Thrown(Value),
}

impl From<AllocError> for NativeError {
    fn from(err: AllocError) -> Self {
        NativeError::Fault(err.into())
    }
}

impl From<std::io::Error> for NativeError {
    fn from(err: std::io::Error) -> Self {
        NativeError::Failed(err.to_string())
    }
}

/// Signature of a host function.
pub type NativeFn =
    Arc<dyn Fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, NativeError> + Send + Sync>;

/// What a native may touch while it runs.
pub struct NativeContext<'a> {
    heap: &'a mut Heap,
    types: &'a TypeRegistry,
    data: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> NativeContext<'a> {
    pub(crate) fn new(
        heap: &'a mut Heap,
        types: &'a TypeRegistry,
        data: Option<&'a (dyn Any + Send + Sync)>,
    ) -> Self {
        Self { heap, types, data }
    }

    /// Allocate text
    pub fn new_text(&mut self, s: &str) -> Result<Value, NativeError> {
        Ok(Value::Text(self.heap.alloc_text(s)?))
    }

    /// Allocate a list
    pub fn new_list(&mut self, items: Vec<Value>) -> Result<Value, NativeError> {
        Ok(Value::List(self.heap.alloc_list(items)?))
    }

    /// Allocate a map from key/value pairs
    pub fn new_map(&mut self, entries: Vec<(Value, Value)>) -> Result<Value, NativeError> {
        let mut map = MapObject::new();
        for (key, value) in entries {
            map.insert(MapKey::from_value(&key)?, value);
        }
        Ok(Value::Map(self.heap.alloc_map(map)?))
    }

    /// Registered type information
    pub fn types(&self) -> &TypeRegistry {
        self.types
    }

    /// Name of a value's dynamic type
    pub fn type_name(&self, value: &Value) -> &str {
        self.types.name(value.type_id())
    }

    /// Data attached with [`crate::Vm::register_native_with_data`]
    pub fn data<T: Any>(&self) -> Option<&T> {
        self.data.and_then(|d| d.downcast_ref::<T>())
    }
}

/// A registered native.
#[derive(Clone)]
pub struct NativeEntry {
    /// Qualified name, `library.function`
    pub name: String,
    /// Required privilege, checked before every call
    pub privilege: Option<Privilege>,
    pub(crate) func: NativeFn,
    pub(crate) data: Option<Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for NativeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeEntry")
            .field("name", &self.name)
            .field("privilege", &self.privilege)
            .finish_non_exhaustive()
    }
}

/// Table of natives known to one VM.
#[derive(Debug, Default, Clone)]
pub struct NativeRegistry {
    entries: Vec<NativeEntry>,
    by_name: HashMap<String, NativeId>,
}

impl NativeRegistry {
    /// Registry holding the builtin natives
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        install_builtins(&mut registry);
        registry
    }

    /// Add a native; a later registration of the same name shadows earlier ones
    pub fn register(&mut self, entry: NativeEntry) -> NativeId {
        let id = NativeId(self.entries.len() as u32);
        debug!(name = %entry.name, privilege = ?entry.privilege, "native registered");
        self.by_name.insert(entry.name.clone(), id);
        self.entries.push(entry);
        id
    }

    /// Find a native by qualified name
    pub fn lookup(&self, name: &str) -> Option<NativeId> {
        self.by_name.get(name).copied()
    }

    /// Entry for an id
    pub fn get(&self, id: NativeId) -> Option<&NativeEntry> {
        self.entries.get(id.0 as usize)
    }

    /// Whether any native belongs to `library`
    pub fn has_library(&self, library: &str) -> bool {
        self.by_name.keys().any(|name| {
            name.split_once('.')
                .map_or(false, |(prefix, _)| prefix == library)
        })
    }

    /// Number of registered natives
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl NativeEntry {
    /// Entry without attached data
    pub fn new<F>(name: &str, privilege: Option<Privilege>, func: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            privilege,
            func: Arc::new(func),
            data: None,
        }
    }

    /// Attach data handed to the function through [`NativeContext::data`]
    pub fn with_data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.data = Some(data);
        self
    }
}

static NULL: Value = Value::Null;

fn arg(args: &[Value], index: usize) -> &Value {
    args.get(index).unwrap_or(&NULL)
}

fn text_arg(args: &[Value], index: usize) -> Result<&str, NativeError> {
    match arg(args, index) {
        Value::Text(t) => Ok(t.as_str()),
        other => Err(Fault::TypeMismatch {
            expected: TypeId::TEXT,
            actual: other.type_id(),
        }
        .into()),
    }
}

/// Length of text, a list or a map
pub(crate) fn length_of(value: &Value) -> Result<i64, Fault> {
    let len = match value {
        Value::Text(t) => t.char_len(),
        Value::List(cell) | Value::Map(cell) => match &*cell.read() {
            Object::List(items) => items.len(),
            Object::Map(map) => map.len(),
            _ => 0,
        },
        other => {
            return Err(Fault::TypeMismatch {
                expected: TypeId::LIST,
                actual: other.type_id(),
            })
        }
    };
    Ok(len as i64)
}

fn install_builtins(registry: &mut NativeRegistry) {
    registry.register(NativeEntry::new(
        "core.len",
        None,
        |_ctx, args| Ok(Value::Integer(length_of(arg(args, 0))?)),
    ));
    registry.register(NativeEntry::new(
        "core.type_name",
        None,
        |ctx, args| {
            let name = ctx.type_name(arg(args, 0)).to_string();
            ctx.new_text(&name)
        },
    ));
    registry.register(NativeEntry::new(
        "core.to_text",
        None,
        |ctx, args| {
            let text = arg(args, 0).to_string();
            ctx.new_text(&text)
        },
    ));
    registry.register(NativeEntry::new(
        "fs.read_text",
        Some(Privilege::FileRead),
        |ctx, args| {
            let contents = std::fs::read_to_string(text_arg(args, 0)?)?;
            ctx.new_text(&contents)
        },
    ));
    registry.register(NativeEntry::new(
        "fs.write_text",
        Some(Privilege::FileWrite),
        |_ctx, args| {
            let contents = text_arg(args, 1)?;
            let mut file = std::fs::File::create(text_arg(args, 0)?)?;
            file.write_all(contents.as_bytes())?;
            Ok(Value::Integer(contents.len() as i64))
        },
    ));
    registry.register(NativeEntry::new(
        "fs.exists",
        Some(Privilege::FileRead),
        |_ctx, args| Ok(Value::Boolean(std::path::Path::new(text_arg(args, 0)?).exists())),
    ));
    registry.register(NativeEntry::new(
        "net.connect",
        Some(Privilege::Network),
        |_ctx, args| {
            let host = text_arg(args, 0)?;
            let port = arg(args, 1)
                .as_integer()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| NativeError::Failed("net.connect needs a port".to_string()))?;
            let addr = (host, port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| NativeError::Failed(format!("`{}` did not resolve", host)))?;
            TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
            Ok(Value::Boolean(true))
        },
    ));
    registry.register(NativeEntry::new(
        "process.spawn",
        Some(Privilege::Process),
        |ctx, args| {
            let program = text_arg(args, 0)?;
            let mut command = std::process::Command::new(program);
            if let Value::List(cell) = arg(args, 1) {
                if let Object::List(items) = &*cell.read() {
                    for item in items {
                        command.arg(item.to_string());
                    }
                }
            }
            let output = command.output()?;
            let stdout = ctx.new_text(&String::from_utf8_lossy(&output.stdout))?;
            let status = Value::Integer(i64::from(output.status.code().unwrap_or(-1)));
            let status_key = ctx.new_text("status")?;
            let stdout_key = ctx.new_text("stdout")?;
            ctx.new_map(vec![(status_key, status), (stdout_key, stdout)])
        },
    ));
}
