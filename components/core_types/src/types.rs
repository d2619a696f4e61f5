//! Runtime type identities and the type registry.
//!
//! Every value has a [`TypeId`]. Builtin ids are fixed; module-defined and
//! host-registered types are appended to a [`TypeRegistry`] owned by the VM.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::object::{CustomObject, Destructor};
use crate::value::{CompareHooks, Value};

/// Identity of a runtime type.
///
/// # Examples
///
/// ```
/// use core_types::TypeId;
///
/// assert!(TypeId::INTEGER.is_builtin());
/// assert!(!TypeId::FIRST_USER.is_builtin());
/// assert_eq!(TypeId::TEXT.to_string(), "Text");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl TypeId {
    /// The null type
    pub const NULL: TypeId = TypeId(0);
    /// Booleans
    pub const BOOLEAN: TypeId = TypeId(1);
    /// 64-bit signed integers
    pub const INTEGER: TypeId = TypeId(2);
    /// IEEE-754 doubles
    pub const DECIMAL: TypeId = TypeId(3);
    /// UTF-8 text
    pub const TEXT: TypeId = TypeId(4);
    /// Untyped lists
    pub const LIST: TypeId = TypeId(5);
    /// Untyped maps
    pub const MAP: TypeId = TypeId(6);
    /// Functions and closures
    pub const FUNCTION: TypeId = TypeId(7);
    /// Matches every value
    pub const ANY: TypeId = TypeId(8);
    /// Suspended generator or async frames
    pub const CONTINUATION: TypeId = TypeId(9);
    /// Base of every builtin error type
    pub const ERROR: TypeId = TypeId(10);
    /// Raised by failed casts and ill-typed operands
    pub const TYPE_MISMATCH_ERROR: TypeId = TypeId(11);
    /// Raised when the heap ceiling is reached
    pub const OUT_OF_MEMORY_ERROR: TypeId = TypeId(12);
    /// Raised by the security policy
    pub const PERMISSION_DENIED_ERROR: TypeId = TypeId(13);
    /// Raised when the instruction ceiling is reached
    pub const EXECUTION_LIMIT_ERROR: TypeId = TypeId(14);
    /// Raised when the wall-clock ceiling is reached
    pub const TIMEOUT_ERROR: TypeId = TypeId(15);
    /// Raised on host cancellation
    pub const CANCELLED_ERROR: TypeId = TypeId(16);
    /// Raised when a native callback fails
    pub const HOST_CALLBACK_ERROR: TypeId = TypeId(17);
    /// Raised by every other runtime fault
    pub const RUNTIME_ERROR: TypeId = TypeId(18);
    /// First id handed out to module or host types
    pub const FIRST_USER: TypeId = TypeId(19);

    /// Whether this id is one of the fixed builtin types
    pub fn is_builtin(self) -> bool {
        self < Self::FIRST_USER
    }

    fn builtin_name(self) -> Option<&'static str> {
        BUILTINS.get(self.0 as usize).map(|(name, _, _)| *name)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.builtin_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "type#{}", self.0),
        }
    }
}

/// Primitive kinds as encoded in module type tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    /// `null`
    Null,
    /// `true` / `false`
    Boolean,
    /// 64-bit integer
    Integer,
    /// Double
    Decimal,
    /// Text
    Text,
    /// Dynamic
    Any,
}

impl PrimitiveKind {
    /// Builtin type id for this primitive
    pub fn type_id(self) -> TypeId {
        match self {
            PrimitiveKind::Null => TypeId::NULL,
            PrimitiveKind::Boolean => TypeId::BOOLEAN,
            PrimitiveKind::Integer => TypeId::INTEGER,
            PrimitiveKind::Decimal => TypeId::DECIMAL,
            PrimitiveKind::Text => TypeId::TEXT,
            PrimitiveKind::Any => TypeId::ANY,
        }
    }
}

/// A struct field after type resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    /// Field name
    pub name: String,
    /// Declared field type
    pub type_id: TypeId,
    /// Byte offset inside the struct
    pub offset: u32,
    /// Field is stored behind a reference
    pub indirect: bool,
}

/// Comparison hook for a custom type.
///
/// Returns `Some(Ordering::Equal)` for equal payloads and `None` when the
/// payloads are not comparable.
pub type CompareHook =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> Option<Ordering> + Send + Sync>;

/// Host-side behavior of a custom type.
#[derive(Clone, Default)]
pub struct CustomTypeInfo {
    /// Runs exactly once when the last reference to a value is released
    pub destructor: Option<Destructor>,
    /// Optional equality and ordering hook
    pub compare: Option<CompareHook>,
}

impl fmt::Debug for CustomTypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomTypeInfo")
            .field("destructor", &self.destructor.is_some())
            .field("compare", &self.compare.is_some())
            .finish()
    }
}

/// Structure of a registered type.
#[derive(Debug, Clone)]
pub enum TypeShape {
    /// A builtin primitive
    Primitive(PrimitiveKind),
    /// Named record; values are maps tagged with the struct's id
    Struct {
        /// Fields in declaration order
        fields: Vec<FieldLayout>,
        /// Declared size in bytes
        size: u32,
    },
    /// Homogeneous list
    List(TypeId),
    /// Map from key type to value type
    Map(TypeId, TypeId),
    /// Function signature
    Function {
        /// Parameter types
        params: Vec<TypeId>,
        /// Return type
        ret: TypeId,
    },
    /// `null` or the inner type
    Optional(TypeId),
    /// Any of the member types
    Union(Vec<TypeId>),
    /// Host-defined opaque type
    Custom(CustomTypeInfo),
    /// Builtin error type
    Error,
}

/// An entry of the registry.
#[derive(Debug, Clone)]
pub struct TypeEntry {
    /// Registered name
    pub name: String,
    /// Structure
    pub shape: TypeShape,
    /// Supertype, for error types and structs
    pub parent: Option<TypeId>,
}

/// Errors raised while registering types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A custom type with this name already exists
    #[error("type `{0}` is already registered")]
    DuplicateName(String),
    /// An id was referenced that the registry does not hold
    #[error("unknown type id {0}")]
    UnknownType(u32),
}

const BUILTINS: &[(&str, Option<PrimitiveKind>, Option<TypeId>)] = &[
    ("Null", Some(PrimitiveKind::Null), None),
    ("Boolean", Some(PrimitiveKind::Boolean), None),
    ("Integer", Some(PrimitiveKind::Integer), None),
    ("Decimal", Some(PrimitiveKind::Decimal), None),
    ("Text", Some(PrimitiveKind::Text), None),
    ("List", None, None),
    ("Map", None, None),
    ("Function", None, None),
    ("Any", Some(PrimitiveKind::Any), None),
    ("Continuation", None, None),
    ("Error", None, Some(TypeId::MAP)),
    ("TypeMismatch", None, Some(TypeId::ERROR)),
    ("OutOfMemory", None, Some(TypeId::ERROR)),
    ("PermissionDenied", None, Some(TypeId::ERROR)),
    ("ExecutionLimitExceeded", None, Some(TypeId::ERROR)),
    ("TimeoutExceeded", None, Some(TypeId::ERROR)),
    ("Cancelled", None, Some(TypeId::ERROR)),
    ("HostCallbackError", None, Some(TypeId::ERROR)),
    ("RuntimeError", None, Some(TypeId::ERROR)),
];

/// Registry of every type known to a VM instance.
///
/// # Examples
///
/// ```
/// use core_types::{TypeId, TypeRegistry, Value};
///
/// let mut types = TypeRegistry::new();
/// let file = types.register_custom("File", None).unwrap();
///
/// assert!(file >= TypeId::FIRST_USER);
/// assert_eq!(types.lookup("File"), Some(file));
/// assert!(types.is_instance(&Value::Integer(1), TypeId::ANY));
/// assert!(!types.is_instance(&Value::Null, TypeId::INTEGER));
/// ```
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    entries: Vec<TypeEntry>,
    by_name: HashMap<String, TypeId>,
}

impl TypeRegistry {
    /// Registry pre-populated with the builtin types
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::with_capacity(BUILTINS.len()),
            by_name: HashMap::new(),
        };
        for (index, (name, primitive, parent)) in BUILTINS.iter().enumerate() {
            let id = TypeId(index as u32);
            let shape = match (primitive, id) {
                (Some(kind), _) => TypeShape::Primitive(*kind),
                (None, TypeId::LIST) => TypeShape::List(TypeId::ANY),
                (None, TypeId::MAP) => TypeShape::Map(TypeId::ANY, TypeId::ANY),
                (None, TypeId::FUNCTION) => TypeShape::Function {
                    params: Vec::new(),
                    ret: TypeId::ANY,
                },
                (None, TypeId::CONTINUATION) => TypeShape::Custom(CustomTypeInfo::default()),
                (None, _) => TypeShape::Error,
            };
            registry.entries.push(TypeEntry {
                name: (*name).to_string(),
                shape,
                parent: *parent,
            });
            registry.by_name.insert((*name).to_string(), id);
        }
        registry
    }

    /// Register a host-defined opaque type with an optional destructor
    pub fn register_custom(
        &mut self,
        name: &str,
        destructor: Option<Destructor>,
    ) -> Result<TypeId, RegistryError> {
        self.register_custom_info(
            name,
            CustomTypeInfo {
                destructor,
                compare: None,
            },
        )
    }

    /// Register a host-defined type with full behavior
    pub fn register_custom_info(
        &mut self,
        name: &str,
        info: CustomTypeInfo,
    ) -> Result<TypeId, RegistryError> {
        if self.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        Ok(self.define(name, TypeShape::Custom(info), None))
    }

    /// Append a type and return its id
    ///
    /// Named structs are also reachable through [`TypeRegistry::lookup`]; a
    /// later definition with the same name shadows the earlier one.
    pub fn define(&mut self, name: &str, shape: TypeShape, parent: Option<TypeId>) -> TypeId {
        let id = TypeId(self.entries.len() as u32);
        if !name.is_empty() {
            self.by_name.insert(name.to_string(), id);
        }
        self.entries.push(TypeEntry {
            name: name.to_string(),
            shape,
            parent,
        });
        id
    }

    /// Replace the shape of an already defined type
    ///
    /// Used by the loader to resolve recursive struct definitions.
    pub fn redefine(&mut self, id: TypeId, shape: TypeShape) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .get_mut(id.0 as usize)
            .ok_or(RegistryError::UnknownType(id.0))?;
        entry.shape = shape;
        Ok(())
    }

    /// Find a type by name
    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    /// Entry for an id
    pub fn get(&self, id: TypeId) -> Option<&TypeEntry> {
        self.entries.get(id.0 as usize)
    }

    /// Registered name of a type, or `"?"` for unknown ids
    pub fn name(&self, id: TypeId) -> &str {
        self.get(id).map(|e| e.name.as_str()).unwrap_or("?")
    }

    /// Number of registered types, builtins included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false; builtins are present from construction
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Custom behavior for a host type
    pub fn custom_info(&self, id: TypeId) -> Option<&CustomTypeInfo> {
        match self.get(id).map(|e| &e.shape) {
            Some(TypeShape::Custom(info)) => Some(info),
            _ => None,
        }
    }

    /// Dynamic type of a value
    pub fn type_of(&self, value: &Value) -> TypeId {
        value.type_id()
    }

    /// Whether `sub` is `ancestor` or derives from it
    pub fn is_subtype(&self, sub: TypeId, ancestor: TypeId) -> bool {
        let mut current = Some(sub);
        // Parent chains are acyclic; the bound guards against a corrupt table.
        for _ in 0..=self.entries.len() {
            match current {
                Some(id) if id == ancestor => return true,
                Some(id) => current = self.get(id).and_then(|e| e.parent),
                None => return false,
            }
        }
        false
    }

    /// Whether `value` is an instance of `ty`
    pub fn is_instance(&self, value: &Value, ty: TypeId) -> bool {
        if ty == TypeId::ANY {
            return true;
        }
        let actual = value.type_id();
        if self.is_subtype(actual, ty) {
            return true;
        }
        match self.get(ty).map(|e| &e.shape) {
            Some(TypeShape::Primitive(PrimitiveKind::Any)) => true,
            Some(TypeShape::Primitive(kind)) => PrimitiveKind::type_id(*kind) == actual,
            Some(TypeShape::Optional(inner)) => {
                matches!(value, Value::Null) || self.is_instance(value, *inner)
            }
            Some(TypeShape::Union(members)) => {
                members.iter().any(|member| self.is_instance(value, *member))
            }
            Some(TypeShape::List(_)) => matches!(value, Value::List(_)),
            Some(TypeShape::Map(_, _)) => matches!(value, Value::Map(_)),
            Some(TypeShape::Function { .. }) => {
                matches!(value, Value::Function(_) | Value::Closure(_))
            }
            _ => false,
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CompareHooks for TypeRegistry {
    fn compare_custom(&self, a: &CustomObject, b: &CustomObject) -> Option<Ordering> {
        if a.type_id != b.type_id {
            return None;
        }
        let hook = self.custom_info(a.type_id)?.compare.as_ref()?;
        hook(a.data.as_ref(), b.data.as_ref())
    }
}
