//! Heap cells shared by reference-counted values.
//!
//! A [`Gc`] is an atomically counted pointer to a lock-protected [`Object`].
//! Cloning a handle retains the cell and dropping it releases; when the last
//! handle goes away the payload is torn down and, for custom objects, the
//! registered destructor runs exactly once.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::Fault;
use crate::types::TypeId;
use crate::value::{FunctionRef, Value};

/// Destructor for custom payloads.
pub type Destructor = Arc<dyn Fn(&mut (dyn Any + Send + Sync)) + Send + Sync>;

/// Identity of a live call frame, used by open upvalues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub u64);

/// Reuses list buffers released by dropped cells.
pub trait Recycler: Send + Sync {
    /// Take an empty buffer, if one is available
    fn take(&self) -> Option<Vec<Value>>;
    /// Return a buffer; implementations clear it before storing
    fn recycle(&self, buffer: Vec<Value>);
}

/// Byte and object counters shared by every cell allocated from one heap.
#[derive(Default)]
pub struct HeapAccount {
    allocated: AtomicUsize,
    live: AtomicUsize,
    allocations: AtomicU64,
    frees: AtomicU64,
    recycler: Option<Arc<dyn Recycler>>,
}

impl HeapAccount {
    /// Account without buffer recycling
    pub fn new() -> Self {
        Self::default()
    }

    /// Account whose list buffers are returned to `recycler`
    pub fn with_recycler(recycler: Arc<dyn Recycler>) -> Self {
        Self {
            recycler: Some(recycler),
            ..Self::default()
        }
    }

    /// Bytes currently charged
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Cells currently alive
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Allocations since creation
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Frees since creation
    pub fn frees(&self) -> u64 {
        self.frees.load(Ordering::Relaxed)
    }

    /// Charge `size` bytes unless the total would pass `ceiling`
    ///
    /// Returns the bytes in use on failure.
    pub fn try_charge(&self, size: usize, ceiling: usize) -> Result<(), usize> {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(size);
            if next > ceiling {
                return Err(current);
            }
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::AcqRel);
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a recycled list buffer
    pub fn take_buffer(&self) -> Option<Vec<Value>> {
        self.recycler.as_ref().and_then(|r| r.take())
    }
}

impl fmt::Debug for HeapAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapAccount")
            .field("allocated", &self.allocated())
            .field("live", &self.live())
            .finish()
    }
}

/// Payload of a heap cell.
#[derive(Debug)]
pub enum Object {
    /// Ordered list
    List(Vec<Value>),
    /// Map or struct instance
    Map(MapObject),
    /// Function plus captured upvalue cells
    Closure(Closure),
    /// A captured variable
    Upvalue(Upvalue),
    /// Host-defined payload
    Custom(CustomObject),
    /// Payload torn down by the cycle collector
    Cleared,
}

impl Object {
    /// Visit every cell this payload references directly
    pub fn children(&self, visit: &mut dyn FnMut(&Gc)) {
        match self {
            Object::List(items) => items.iter().filter_map(Value::as_gc).for_each(visit),
            Object::Map(map) => {
                map.entries.values().filter_map(Value::as_gc).for_each(visit)
            }
            Object::Closure(closure) => closure.upvalues.iter().for_each(visit),
            Object::Upvalue(Upvalue::Closed(value)) => {
                if let Some(cell) = value.as_gc() {
                    visit(cell)
                }
            }
            Object::Upvalue(Upvalue::Open { .. }) | Object::Custom(_) | Object::Cleared => {}
        }
    }

    /// Rough byte cost used for heap accounting
    pub fn footprint(&self) -> usize {
        let payload = match self {
            Object::List(items) => items.capacity() * std::mem::size_of::<Value>(),
            Object::Map(map) => map.entries.capacity() * 2 * std::mem::size_of::<Value>(),
            Object::Closure(closure) => closure.upvalues.len() * std::mem::size_of::<Gc>(),
            Object::Upvalue(_) | Object::Custom(_) | Object::Cleared => 0,
        };
        std::mem::size_of::<GcBox>() + payload
    }
}

/// Hashable map key.
///
/// Integral decimals normalize to integers so `1` and `1.0` address the same
/// entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    /// `null`
    Null,
    /// Boolean key
    Boolean(bool),
    /// Integer key
    Integer(i64),
    /// Text key
    Text(Text),
}

impl MapKey {
    /// Convert a value into a key
    pub fn from_value(value: &Value) -> Result<Self, Fault> {
        match value {
            Value::Null => Ok(MapKey::Null),
            Value::Boolean(b) => Ok(MapKey::Boolean(*b)),
            Value::Integer(i) => Ok(MapKey::Integer(*i)),
            Value::Decimal(d) if d.fract() == 0.0 && d.abs() < i64::MAX as f64 => {
                Ok(MapKey::Integer(*d as i64))
            }
            Value::Text(t) => Ok(MapKey::Text(t.clone())),
            other => Err(Fault::TypeMismatch {
                expected: TypeId::TEXT,
                actual: other.type_id(),
            }),
        }
    }

    /// Convert back into a value
    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Null => Value::Null,
            MapKey::Boolean(b) => Value::Boolean(*b),
            MapKey::Integer(i) => Value::Integer(*i),
            MapKey::Text(t) => Value::Text(t.clone()),
        }
    }
}

impl From<&str> for MapKey {
    fn from(s: &str) -> Self {
        MapKey::Text(Text::new(s))
    }
}

/// Insertion-ordered map, optionally tagged with a struct or error type.
#[derive(Debug, Default)]
pub struct MapObject {
    /// Struct or error type of this instance; `None` for plain maps
    pub type_tag: Option<TypeId>,
    /// Entries in insertion order
    pub entries: IndexMap<MapKey, Value>,
}

impl MapObject {
    /// Empty untagged map
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty map tagged with `type_id`
    pub fn tagged(type_id: TypeId) -> Self {
        Self {
            type_tag: Some(type_id),
            entries: IndexMap::new(),
        }
    }

    /// Look up a key
    pub fn get(&self, key: &MapKey) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Insert or replace, returning the previous value
    pub fn insert(&mut self, key: MapKey, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A function bundled with its captured variables.
#[derive(Debug, Clone)]
pub struct Closure {
    /// Target function
    pub function: FunctionRef,
    /// Upvalue cells in capture order
    pub upvalues: Vec<Gc>,
}

/// State of a captured variable.
#[derive(Debug)]
pub enum Upvalue {
    /// Still aliases a live frame's local slot
    Open {
        /// Owning frame
        frame: FrameId,
        /// Local slot
        slot: u16,
    },
    /// Frame is gone; the cell owns the value
    Closed(Value),
}

/// Host-defined payload with an optional destructor.
pub struct CustomObject {
    /// Registered type
    pub type_id: TypeId,
    /// Opaque payload
    pub data: Box<dyn Any + Send + Sync>,
    destructor: Option<Destructor>,
}

impl CustomObject {
    /// Wrap a payload
    pub fn new(
        type_id: TypeId,
        data: Box<dyn Any + Send + Sync>,
        destructor: Option<Destructor>,
    ) -> Self {
        Self {
            type_id,
            data,
            destructor,
        }
    }

    /// Downcast the payload
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref::<T>()
    }
}

impl Drop for CustomObject {
    fn drop(&mut self) {
        if let Some(destructor) = self.destructor.take() {
            destructor(self.data.as_mut());
        }
    }
}

impl fmt::Debug for CustomObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomObject")
            .field("type_id", &self.type_id)
            .finish_non_exhaustive()
    }
}

/// Backing storage of a [`Gc`].
pub struct GcBox {
    object: RwLock<Object>,
    size: usize,
    account: Option<Arc<HeapAccount>>,
}

impl Drop for GcBox {
    fn drop(&mut self) {
        if let Some(account) = self.account.take() {
            account.release(self.size);
            if let Some(recycler) = &account.recycler {
                if let Object::List(items) = std::mem::replace(self.object.get_mut(), Object::Cleared) {
                    recycler.recycle(items);
                }
            }
        }
    }
}

/// Counted handle to a heap cell.
///
/// # Examples
///
/// ```
/// use core_types::{Gc, Object, Value};
///
/// let cell = Gc::new(Object::List(vec![Value::Integer(1)]));
/// let alias = cell.clone();
///
/// assert_eq!(cell.strong_count(), 2);
/// assert!(cell.ptr_eq(&alias));
/// ```
#[derive(Clone)]
pub struct Gc(Arc<GcBox>);

impl Gc {
    /// Allocate an unaccounted cell
    pub fn new(object: Object) -> Self {
        let size = object.footprint();
        Gc(Arc::new(GcBox {
            object: RwLock::new(object),
            size,
            account: None,
        }))
    }

    /// Allocate a cell charged to `account`
    ///
    /// The caller has already reserved `size` bytes with
    /// [`HeapAccount::try_charge`].
    pub fn new_accounted(object: Object, size: usize, account: Arc<HeapAccount>) -> Self {
        Gc(Arc::new(GcBox {
            object: RwLock::new(object),
            size,
            account: Some(account),
        }))
    }

    /// Shared access to the payload
    pub fn read(&self) -> RwLockReadGuard<'_, Object> {
        self.0.object.read_recursive()
    }

    /// Exclusive access to the payload
    pub fn write(&self) -> RwLockWriteGuard<'_, Object> {
        self.0.object.write()
    }

    /// Same cell
    pub fn ptr_eq(&self, other: &Gc) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Current reference count
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Non-owning handle
    pub fn downgrade(&self) -> WeakGc {
        WeakGc(Arc::downgrade(&self.0))
    }

    /// Address, stable while the cell is alive
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Bytes charged for this cell
    pub fn size(&self) -> usize {
        self.0.size
    }
}

impl fmt::Debug for Gc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gc({:#x})", self.addr())
    }
}

/// Non-owning handle used by heap tracking.
#[derive(Clone)]
pub struct WeakGc(Weak<GcBox>);

impl WeakGc {
    /// Upgrade if the cell is still alive
    pub fn upgrade(&self) -> Option<Gc> {
        self.0.upgrade().map(Gc)
    }

    /// Whether the cell has been freed
    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl fmt::Debug for WeakGc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakGc")
    }
}

struct TextBox {
    text: Box<str>,
    size: usize,
    account: Option<Arc<HeapAccount>>,
}

impl Drop for TextBox {
    fn drop(&mut self) {
        if let Some(account) = self.account.take() {
            account.release(self.size);
        }
    }
}

/// Immutable shared UTF-8 text.
///
/// Length and indexing count Unicode scalar values.
///
/// # Examples
///
/// ```
/// use core_types::Text;
///
/// let t = Text::new("héllo");
/// assert_eq!(t.char_len(), 5);
/// assert_eq!(t.char_at(1), Some('é'));
/// ```
#[derive(Clone)]
pub struct Text(Arc<TextBox>);

impl Text {
    /// Unaccounted text
    pub fn new(s: &str) -> Self {
        Text(Arc::new(TextBox {
            text: s.into(),
            size: s.len(),
            account: None,
        }))
    }

    /// Text charged to `account`
    pub fn new_accounted(s: &str, size: usize, account: Arc<HeapAccount>) -> Self {
        Text(Arc::new(TextBox {
            text: s.into(),
            size,
            account: Some(account),
        }))
    }

    /// Borrow as `&str`
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    /// Number of Unicode scalar values
    pub fn char_len(&self) -> usize {
        self.0.text.chars().count()
    }

    /// Scalar value at `index`
    pub fn char_at(&self, index: usize) -> Option<char> {
        self.0.text.chars().nth(index)
    }

    /// Same allocation
    pub fn ptr_eq(&self, other: &Text) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.as_str() == other.as_str()
    }
}

impl Eq for Text {}

impl Hash for Text {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
