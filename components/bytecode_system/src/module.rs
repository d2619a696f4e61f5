//! Binary module format.
//!
//! ```text
//! "RUNA" | Header | Const | Types | Funcs | Code | Meta | [Debug]
//! ```
//!
//! Every section is prefixed with its byte length. Decoding keeps every
//! field, so encoding a decoded module reproduces the input byte for byte.

use std::fmt;

use core_types::PrimitiveKind;

use crate::error::LoadError;
use crate::reader::ByteReader;
use crate::writer::ByteWriter;

/// Module file magic
pub const MAGIC: &[u8; 4] = b"RUNA";

/// Newest module format this build reads
pub const FORMAT_VERSION: Version = Version { major: 1, minor: 0 };

/// Version of this VM, compared against a module's minimum VM version
pub const VM_VERSION: Version = Version { major: 1, minor: 0 };

/// Header feature bit: a Debug section follows Meta
pub const HAS_DEBUG_INFO: u32 = 0x1;

/// Struct field flag: stored behind a reference
pub const FIELD_INDIRECT: u8 = 0x1;

/// Function flags
pub mod function_flags {
    /// Declared but implemented elsewhere
    pub const EXTERNAL: u16 = 1;
    /// Implemented by a host native
    pub const NATIVE: u16 = 2;
    /// Constructor
    pub const CONSTRUCTOR: u16 = 4;
    /// Method
    pub const METHOD: u16 = 8;
    /// Anonymous function
    pub const ANONYMOUS: u16 = 16;
    /// May `Yield`
    pub const GENERATOR: u16 = 32;
    /// May `Await`
    pub const ASYNC: u16 = 64;
    /// Last parameter collects extra arguments
    pub const VARIADIC: u16 = 128;
}

/// Parameter flags
pub mod param_flags {
    /// May be omitted; defaults to null
    pub const OPTIONAL: u8 = 1;
    /// Collects remaining arguments into a list
    pub const VARIADIC: u8 = 2;
}

/// A `major.minor` version pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Incompatible changes
    pub major: u16,
    /// Compatible additions
    pub minor: u16,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Module header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Format version the module was written with
    pub format_version: Version,
    /// Oldest VM able to run the module
    pub min_vm_version: Version,
    /// Creation time, seconds since the Unix epoch
    pub created_at: u64,
    /// Feature bits such as [`HAS_DEBUG_INFO`]
    pub features: u32,
    /// Optional content hash supplied by the compiler
    pub hash: Option<[u8; 32]>,
    /// Native libraries the host must provide
    pub native_libraries: Vec<String>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            min_vm_version: VM_VERSION,
            created_at: 0,
            features: 0,
            hash: None,
            native_libraries: Vec::new(),
        }
    }
}

/// Constant-pool entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// `null`
    Null,
    /// Boolean literal
    Boolean(bool),
    /// Integer literal
    Integer(i64),
    /// Decimal literal
    Decimal(f64),
    /// Text literal
    Text(String),
    /// List of earlier constants
    List(Vec<u32>),
    /// Map of earlier constant pairs
    Map(Vec<(u32, u32)>),
    /// Function of this module
    Function(u32),
    /// Type of this module
    Type(u32),
    /// Host native named by its qualified name
    External(String),
}

impl Constant {
    fn tag(&self) -> u8 {
        match self {
            Constant::Null => 0,
            Constant::Boolean(_) => 1,
            Constant::Integer(_) => 2,
            Constant::Decimal(_) => 3,
            Constant::Text(_) => 4,
            Constant::List(_) => 5,
            Constant::Map(_) => 6,
            Constant::Function(_) => 7,
            Constant::Type(_) => 8,
            Constant::External(_) => 9,
        }
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self, LoadError> {
        let at = r.position();
        let constant = match r.read_u8()? {
            0 => Constant::Null,
            1 => Constant::Boolean(r.read_bool()?),
            2 => Constant::Integer(r.read_i64()?),
            3 => Constant::Decimal(r.read_f64()?),
            4 => Constant::Text(r.read_str()?),
            5 => {
                let n = r.read_count(4)?;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(r.read_u32()?);
                }
                Constant::List(items)
            }
            6 => {
                let n = r.read_count(8)?;
                let mut pairs = Vec::with_capacity(n);
                for _ in 0..n {
                    pairs.push((r.read_u32()?, r.read_u32()?));
                }
                Constant::Map(pairs)
            }
            7 => Constant::Function(r.read_u32()?),
            8 => Constant::Type(r.read_u32()?),
            9 => Constant::External(r.read_str()?),
            tag => {
                return Err(LoadError::malformed(format!(
                    "unknown constant tag {} at offset {}",
                    tag, at
                )))
            }
        };
        Ok(constant)
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.write_u8(self.tag());
        match self {
            Constant::Null => {}
            Constant::Boolean(b) => w.write_bool(*b),
            Constant::Integer(i) => w.write_i64(*i),
            Constant::Decimal(d) => w.write_f64(*d),
            Constant::Text(s) | Constant::External(s) => w.write_str(s),
            Constant::List(items) => {
                w.write_count(items.len());
                items.iter().for_each(|i| w.write_u32(*i));
            }
            Constant::Map(pairs) => {
                w.write_count(pairs.len());
                for (k, v) in pairs {
                    w.write_u32(*k);
                    w.write_u32(*v);
                }
            }
            Constant::Function(i) | Constant::Type(i) => w.write_u32(*i),
        }
    }
}

/// A struct field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Field name
    pub name: String,
    /// Module-local type id
    pub type_id: u32,
    /// Byte offset
    pub offset: u32,
    /// Flags such as [`FIELD_INDIRECT`]
    pub flags: u8,
}

impl FieldDescriptor {
    /// Whether the field is stored behind a reference
    pub fn is_indirect(&self) -> bool {
        self.flags & FIELD_INDIRECT != 0
    }
}

/// Kind-specific layout of a type descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    /// Builtin primitive
    Primitive(PrimitiveKind),
    /// Record type
    Struct {
        /// Declared size in bytes
        size: u32,
        /// Fields in declaration order
        fields: Vec<FieldDescriptor>,
    },
    /// List of an element type
    List(u32),
    /// Map from key to value type
    Map(u32, u32),
    /// Function signature
    Function {
        /// Parameter types
        params: Vec<u32>,
        /// Return type
        ret: u32,
    },
    /// Null or the inner type
    Optional(u32),
    /// One of several types
    Union(Vec<u32>),
    /// Host type looked up by name at load
    External(String),
}

fn primitive_code(kind: PrimitiveKind) -> u8 {
    match kind {
        PrimitiveKind::Null => 0,
        PrimitiveKind::Boolean => 1,
        PrimitiveKind::Integer => 2,
        PrimitiveKind::Decimal => 3,
        PrimitiveKind::Text => 4,
        PrimitiveKind::Any => 5,
    }
}

impl TypeKind {
    /// Module-local type ids this kind refers to
    pub fn references(&self) -> Vec<u32> {
        match self {
            TypeKind::Primitive(_) | TypeKind::External(_) => Vec::new(),
            TypeKind::Struct { fields, .. } => fields.iter().map(|f| f.type_id).collect(),
            TypeKind::List(e) | TypeKind::Optional(e) => vec![*e],
            TypeKind::Map(k, v) => vec![*k, *v],
            TypeKind::Function { params, ret } => {
                params.iter().copied().chain(std::iter::once(*ret)).collect()
            }
            TypeKind::Union(members) => members.clone(),
        }
    }
}

/// Entry of the type table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Id; equals the entry's position
    pub id: u32,
    /// Name, empty for anonymous types
    pub name: String,
    /// Layout
    pub kind: TypeKind,
}

impl TypeDescriptor {
    fn decode(r: &mut ByteReader<'_>) -> Result<Self, LoadError> {
        let id = r.read_u32()?;
        let at = r.position();
        let tag = r.read_u8()?;
        let name = r.read_str()?;
        let kind = match tag {
            0 => {
                let kind = match r.read_u8()? {
                    0 => PrimitiveKind::Null,
                    1 => PrimitiveKind::Boolean,
                    2 => PrimitiveKind::Integer,
                    3 => PrimitiveKind::Decimal,
                    4 => PrimitiveKind::Text,
                    5 => PrimitiveKind::Any,
                    code => {
                        return Err(LoadError::malformed(format!(
                            "unknown primitive code {} in type {}",
                            code, id
                        )))
                    }
                };
                TypeKind::Primitive(kind)
            }
            1 => {
                let size = r.read_u32()?;
                let n = r.read_count(13)?;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    fields.push(FieldDescriptor {
                        name: r.read_str()?,
                        type_id: r.read_u32()?,
                        offset: r.read_u32()?,
                        flags: r.read_u8()?,
                    });
                }
                TypeKind::Struct { size, fields }
            }
            2 => TypeKind::List(r.read_u32()?),
            3 => TypeKind::Map(r.read_u32()?, r.read_u32()?),
            4 => {
                let n = r.read_count(4)?;
                let mut params = Vec::with_capacity(n);
                for _ in 0..n {
                    params.push(r.read_u32()?);
                }
                TypeKind::Function {
                    params,
                    ret: r.read_u32()?,
                }
            }
            5 => TypeKind::Optional(r.read_u32()?),
            6 => {
                let n = r.read_count(4)?;
                let mut members = Vec::with_capacity(n);
                for _ in 0..n {
                    members.push(r.read_u32()?);
                }
                TypeKind::Union(members)
            }
            7 => TypeKind::External(r.read_str()?),
            other => {
                return Err(LoadError::malformed(format!(
                    "unknown type kind {} at offset {}",
                    other, at
                )))
            }
        };
        Ok(Self { id, name, kind })
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.write_u32(self.id);
        let tag = match &self.kind {
            TypeKind::Primitive(_) => 0,
            TypeKind::Struct { .. } => 1,
            TypeKind::List(_) => 2,
            TypeKind::Map(_, _) => 3,
            TypeKind::Function { .. } => 4,
            TypeKind::Optional(_) => 5,
            TypeKind::Union(_) => 6,
            TypeKind::External(_) => 7,
        };
        w.write_u8(tag);
        w.write_str(&self.name);
        match &self.kind {
            TypeKind::Primitive(kind) => w.write_u8(primitive_code(*kind)),
            TypeKind::Struct { size, fields } => {
                w.write_u32(*size);
                w.write_count(fields.len());
                for field in fields {
                    w.write_str(&field.name);
                    w.write_u32(field.type_id);
                    w.write_u32(field.offset);
                    w.write_u8(field.flags);
                }
            }
            TypeKind::List(e) | TypeKind::Optional(e) => w.write_u32(*e),
            TypeKind::Map(k, v) => {
                w.write_u32(*k);
                w.write_u32(*v);
            }
            TypeKind::Function { params, ret } => {
                w.write_count(params.len());
                params.iter().for_each(|p| w.write_u32(*p));
                w.write_u32(*ret);
            }
            TypeKind::Union(members) => {
                w.write_count(members.len());
                members.iter().for_each(|m| w.write_u32(*m));
            }
            TypeKind::External(name) => w.write_str(name),
        }
    }
}

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    /// Name
    pub name: String,
    /// Module-local type id
    pub type_id: u32,
    /// [`param_flags`]
    pub flags: u8,
}

/// A declared local variable and its live range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDescriptor {
    /// Name
    pub name: String,
    /// Module-local type id
    pub type_id: u32,
    /// Slot index
    pub slot: u16,
    /// First offset where the local is in scope
    pub scope_start: u32,
    /// Offset where the scope ends (exclusive)
    pub scope_end: u32,
}

/// Entry of the function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    /// Id within the module
    pub id: u32,
    /// Name, unique among non-anonymous functions
    pub name: String,
    /// Signature type; must be a function type
    pub signature: u32,
    /// [`function_flags`]
    pub flags: u16,
    /// Parameters; occupy the first local slots
    pub params: Vec<ParamDescriptor>,
    /// Declared locals
    pub locals: Vec<LocalDescriptor>,
    /// Total local slots, parameters included
    pub local_count: u16,
    /// Number of captured variables
    pub upvalue_count: u16,
    /// Start of the body in the code section
    pub code_offset: u32,
    /// Body length in bytes
    pub code_length: u32,
}

impl FunctionDescriptor {
    /// Whether all of `flag` is set
    pub fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag == flag
    }

    /// Whether calling the function creates a continuation
    pub fn is_resumable(&self) -> bool {
        self.has_flag(function_flags::GENERATOR) || self.has_flag(function_flags::ASYNC)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self, LoadError> {
        let id = r.read_u32()?;
        let name = r.read_str()?;
        let signature = r.read_u32()?;
        let flags = r.read_u16()?;
        let n = r.read_count(9)?;
        let mut params = Vec::with_capacity(n);
        for _ in 0..n {
            params.push(ParamDescriptor {
                name: r.read_str()?,
                type_id: r.read_u32()?,
                flags: r.read_u8()?,
            });
        }
        let n = r.read_count(18)?;
        let mut locals = Vec::with_capacity(n);
        for _ in 0..n {
            locals.push(LocalDescriptor {
                name: r.read_str()?,
                type_id: r.read_u32()?,
                slot: r.read_u16()?,
                scope_start: r.read_u32()?,
                scope_end: r.read_u32()?,
            });
        }
        Ok(Self {
            id,
            name,
            signature,
            flags,
            params,
            locals,
            local_count: r.read_u16()?,
            upvalue_count: r.read_u16()?,
            code_offset: r.read_u32()?,
            code_length: r.read_u32()?,
        })
    }

    fn encode(&self, w: &mut ByteWriter) {
        w.write_u32(self.id);
        w.write_str(&self.name);
        w.write_u32(self.signature);
        w.write_u16(self.flags);
        w.write_count(self.params.len());
        for p in &self.params {
            w.write_str(&p.name);
            w.write_u32(p.type_id);
            w.write_u8(p.flags);
        }
        w.write_count(self.locals.len());
        for l in &self.locals {
            w.write_str(&l.name);
            w.write_u32(l.type_id);
            w.write_u16(l.slot);
            w.write_u32(l.scope_start);
            w.write_u32(l.scope_end);
        }
        w.write_u16(self.local_count);
        w.write_u16(self.upvalue_count);
        w.write_u32(self.code_offset);
        w.write_u32(self.code_length);
    }
}

/// Descriptive metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Module name, used for lookup and `Import`
    pub name: String,
    /// Path of the source the module was compiled from
    pub source_path: String,
    /// Compiler that produced the module
    pub compiler_version: String,
    /// License identifier
    pub license: String,
    /// Declared dependencies as `(name, version)`
    pub dependencies: Vec<(String, String)>,
    /// Free-form optimization hints
    pub hints: Vec<(String, String)>,
}

/// One row of the line table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Function index
    pub function: u32,
    /// Offset within the function
    pub offset: u32,
    /// Index into [`DebugInfo::files`]
    pub file: u32,
    /// Line
    pub line: u32,
    /// Column
    pub column: u32,
}

/// Source name of a local slot over a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalName {
    /// Function index
    pub function: u32,
    /// Slot
    pub slot: u16,
    /// Source name
    pub name: String,
    /// Range start
    pub start: u32,
    /// Range end (exclusive)
    pub end: u32,
}

/// Optional debug section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    /// Source files
    pub files: Vec<String>,
    /// Line table, sorted by function then offset
    pub lines: Vec<LineEntry>,
    /// Local variable names
    pub local_names: Vec<LocalName>,
}

impl DebugInfo {
    /// Location of the last line entry at or before `offset`
    pub fn location(&self, function: u32, offset: u32) -> Option<(&str, u32, u32)> {
        let entry = self
            .lines
            .iter()
            .filter(|e| e.function == function && e.offset <= offset)
            .max_by_key(|e| e.offset)?;
        let file = self.files.get(entry.file as usize)?;
        Some((file.as_str(), entry.line, entry.column))
    }
}

/// A decoded module.
///
/// # Examples
///
/// ```
/// use bytecode_system::{Module, ModuleBuilder, Opcode, FunctionBuilder};
///
/// let mut builder = ModuleBuilder::new("demo");
/// let mut f = FunctionBuilder::new("main");
/// f.emit(&Opcode::PushNull);
/// f.emit(&Opcode::Return);
/// builder.add_function(f).unwrap();
///
/// let bytes = builder.build().encode();
/// let module = Module::decode(&bytes).unwrap();
/// assert_eq!(module.encode(), bytes);
/// assert_eq!(module.metadata.name, "demo");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Header
    pub header: Header,
    /// Constant pool
    pub constants: Vec<Constant>,
    /// Type table
    pub types: Vec<TypeDescriptor>,
    /// Function table
    pub functions: Vec<FunctionDescriptor>,
    /// Raw instruction bytes of every function
    pub code: Vec<u8>,
    /// Metadata
    pub metadata: Metadata,
    /// Debug info, present iff [`HAS_DEBUG_INFO`] is set
    pub debug: Option<DebugInfo>,
}

impl Module {
    /// Decode a module, checking magic, versions and section framing
    pub fn decode(bytes: &[u8]) -> Result<Self, LoadError> {
        let mut r = ByteReader::new(bytes);
        let magic = r
            .read_bytes(4)
            .map_err(|_| LoadError::malformed("module shorter than its magic"))?;
        if magic != MAGIC {
            return Err(LoadError::malformed(format!("bad magic {:02x?}", magic)));
        }

        let mut section = r.read_section("Header")?;
        let header = decode_header(&mut section)?;
        section.finish("Header")?;

        if header.format_version.major > FORMAT_VERSION.major {
            return Err(LoadError::UnsupportedVersion {
                found: header.format_version,
                supported: FORMAT_VERSION,
            });
        }
        if header.min_vm_version > VM_VERSION {
            return Err(LoadError::UnsupportedVersion {
                found: header.min_vm_version,
                supported: VM_VERSION,
            });
        }

        let mut section = r.read_section("Const")?;
        let n = section.read_count(1)?;
        let mut constants = Vec::with_capacity(n);
        for _ in 0..n {
            constants.push(Constant::decode(&mut section)?);
        }
        section.finish("Const")?;

        let mut section = r.read_section("Types")?;
        let n = section.read_count(10)?;
        let mut types = Vec::with_capacity(n);
        for _ in 0..n {
            types.push(TypeDescriptor::decode(&mut section)?);
        }
        section.finish("Types")?;

        let mut section = r.read_section("Funcs")?;
        let n = section.read_count(34)?;
        let mut functions = Vec::with_capacity(n);
        for _ in 0..n {
            functions.push(FunctionDescriptor::decode(&mut section)?);
        }
        section.finish("Funcs")?;

        let section = r.read_section("Code")?;
        let code = section.clone().read_bytes(section.remaining())?.to_vec();

        let mut section = r.read_section("Meta")?;
        let metadata = decode_metadata(&mut section)?;
        section.finish("Meta")?;

        let debug = if header.features & HAS_DEBUG_INFO != 0 {
            let mut section = r.read_section("Debug")?;
            let debug = decode_debug(&mut section)?;
            section.finish("Debug")?;
            Some(debug)
        } else {
            None
        };
        r.finish("module")?;

        Ok(Self {
            header,
            constants,
            types,
            functions,
            code,
            metadata,
            debug,
        })
    }

    /// Encode the module
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(MAGIC);
        w.write_section(|s| encode_header(&self.header, s));
        w.write_section(|s| {
            s.write_count(self.constants.len());
            self.constants.iter().for_each(|c| c.encode(s));
        });
        w.write_section(|s| {
            s.write_count(self.types.len());
            self.types.iter().for_each(|t| t.encode(s));
        });
        w.write_section(|s| {
            s.write_count(self.functions.len());
            self.functions.iter().for_each(|f| f.encode(s));
        });
        w.write_section(|s| s.write_bytes(&self.code));
        w.write_section(|s| encode_metadata(&self.metadata, s));
        if self.header.features & HAS_DEBUG_INFO != 0 {
            let empty = DebugInfo::default();
            let debug = self.debug.as_ref().unwrap_or(&empty);
            w.write_section(|s| encode_debug(debug, s));
        }
        w.into_bytes()
    }

    /// Module name from metadata
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Body of a function
    ///
    /// Returns an empty slice for out-of-range descriptors; verified modules
    /// never have those.
    pub fn function_code(&self, function: &FunctionDescriptor) -> &[u8] {
        let start = function.code_offset as usize;
        let end = start.saturating_add(function.code_length as usize);
        self.code.get(start..end).unwrap_or(&[])
    }

    /// Index of the named, non-anonymous function
    pub fn function_index(&self, name: &str) -> Option<u32> {
        self.functions
            .iter()
            .position(|f| f.name == name && !f.has_flag(function_flags::ANONYMOUS))
            .map(|i| i as u32)
    }

    /// Text of a text constant
    pub fn text_constant(&self, index: u32) -> Option<&str> {
        match self.constants.get(index as usize) {
            Some(Constant::Text(s)) => Some(s),
            _ => None,
        }
    }
}

fn decode_header(r: &mut ByteReader<'_>) -> Result<Header, LoadError> {
    let format_version = Version {
        major: r.read_u16()?,
        minor: r.read_u16()?,
    };
    let min_vm_version = Version {
        major: r.read_u16()?,
        minor: r.read_u16()?,
    };
    let created_at = r.read_u64()?;
    let features = r.read_u32()?;
    let hash = if r.read_bool()? {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(r.read_bytes(32)?);
        Some(hash)
    } else {
        None
    };
    let n = r.read_count(4)?;
    let mut native_libraries = Vec::with_capacity(n);
    for _ in 0..n {
        native_libraries.push(r.read_str()?);
    }
    Ok(Header {
        format_version,
        min_vm_version,
        created_at,
        features,
        hash,
        native_libraries,
    })
}

fn encode_header(h: &Header, w: &mut ByteWriter) {
    w.write_u16(h.format_version.major);
    w.write_u16(h.format_version.minor);
    w.write_u16(h.min_vm_version.major);
    w.write_u16(h.min_vm_version.minor);
    w.write_u64(h.created_at);
    w.write_u32(h.features);
    match &h.hash {
        Some(hash) => {
            w.write_bool(true);
            w.write_bytes(hash);
        }
        None => w.write_bool(false),
    }
    w.write_count(h.native_libraries.len());
    h.native_libraries.iter().for_each(|n| w.write_str(n));
}

fn decode_pairs(r: &mut ByteReader<'_>) -> Result<Vec<(String, String)>, LoadError> {
    let n = r.read_count(8)?;
    let mut pairs = Vec::with_capacity(n);
    for _ in 0..n {
        pairs.push((r.read_str()?, r.read_str()?));
    }
    Ok(pairs)
}

fn encode_pairs(pairs: &[(String, String)], w: &mut ByteWriter) {
    w.write_count(pairs.len());
    for (a, b) in pairs {
        w.write_str(a);
        w.write_str(b);
    }
}

fn decode_metadata(r: &mut ByteReader<'_>) -> Result<Metadata, LoadError> {
    Ok(Metadata {
        name: r.read_str()?,
        source_path: r.read_str()?,
        compiler_version: r.read_str()?,
        license: r.read_str()?,
        dependencies: decode_pairs(r)?,
        hints: decode_pairs(r)?,
    })
}

fn encode_metadata(m: &Metadata, w: &mut ByteWriter) {
    w.write_str(&m.name);
    w.write_str(&m.source_path);
    w.write_str(&m.compiler_version);
    w.write_str(&m.license);
    encode_pairs(&m.dependencies, w);
    encode_pairs(&m.hints, w);
}

fn decode_debug(r: &mut ByteReader<'_>) -> Result<DebugInfo, LoadError> {
    let n = r.read_count(4)?;
    let mut files = Vec::with_capacity(n);
    for _ in 0..n {
        files.push(r.read_str()?);
    }
    let n = r.read_count(20)?;
    let mut lines = Vec::with_capacity(n);
    for _ in 0..n {
        lines.push(LineEntry {
            function: r.read_u32()?,
            offset: r.read_u32()?,
            file: r.read_u32()?,
            line: r.read_u32()?,
            column: r.read_u32()?,
        });
    }
    let n = r.read_count(18)?;
    let mut local_names = Vec::with_capacity(n);
    for _ in 0..n {
        local_names.push(LocalName {
            function: r.read_u32()?,
            slot: r.read_u16()?,
            name: r.read_str()?,
            start: r.read_u32()?,
            end: r.read_u32()?,
        });
    }
    Ok(DebugInfo {
        files,
        lines,
        local_names,
    })
}

fn encode_debug(d: &DebugInfo, w: &mut ByteWriter) {
    w.write_count(d.files.len());
    d.files.iter().for_each(|f| w.write_str(f));
    w.write_count(d.lines.len());
    for e in &d.lines {
        w.write_u32(e.function);
        w.write_u32(e.offset);
        w.write_u32(e.file);
        w.write_u32(e.line);
        w.write_u32(e.column);
    }
    w.write_count(d.local_names.len());
    for l in &d.local_names {
        w.write_u32(l.function);
        w.write_u16(l.slot);
        w.write_str(&l.name);
        w.write_u32(l.start);
        w.write_u32(l.end);
    }
}
