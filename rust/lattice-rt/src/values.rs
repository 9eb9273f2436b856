//! Runtime values.
//!
//! Every value carries a [`Phase`] and a [`Home`]. Heap-backed values built
//! by the VM are registered in the fluid heap ledger (`Home::Fluid`);
//! frozen values are placed in a crystal region (`Home::Region`). The two
//! homes are mutually exclusive.

use crate::bridge::ExtensionHandle;
use crate::channel::Channel;
use crate::natives::NativeFn;
use lattice_core::Chunk;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

pub type AllocId = u64;
pub type RegionId = u64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Unphased,
    Fluid,
    Crystal,
    Sublimated,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Unphased => "unphased",
            Phase::Fluid => "fluid",
            Phase::Crystal => "crystal",
            Phase::Sublimated => "sublimated",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the storage of a heap-backed value is accounted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Home {
    #[default]
    None,
    Fluid(AllocId),
    Region(RegionId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    pub name: String,
    pub fields: Vec<(String, Value)>,
}

impl StructValue {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == field).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, field: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(k, _)| k == field)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub enum_name: String,
    pub variant: String,
    pub payload: Vec<Value>,
}

/// Value payload.
#[derive(Debug, Clone, Default)]
pub enum Data {
    #[default]
    Nil,
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Members keyed by their display string.
    Set(BTreeMap<String, Value>),
    Struct(Box<StructValue>),
    Enum(Box<EnumValue>),
    Tuple(Vec<Value>),
    Range(i64, i64),
    Closure(Arc<Closure>),
    Buffer(Vec<u8>),
    Channel(Arc<Channel>),
    Ref(Arc<Mutex<Value>>),
}

#[derive(Debug, Clone, Default)]
pub struct Value {
    pub data: Data,
    pub phase: Phase,
    pub home: Home,
}

// ---------------------------------------------------------------------------
// Closures and upvalues
// ---------------------------------------------------------------------------

pub enum UpvalueCell {
    /// Aliases an absolute operand-stack slot.
    Open(usize),
    Closed(Value),
}

/// Shared capture cell. Closures created in the same frame that capture the
/// same slot share one cell.
#[derive(Clone)]
pub struct UpvalueRef(Arc<Mutex<UpvalueCell>>);

impl UpvalueRef {
    pub fn open(slot: usize) -> Self {
        Self(Arc::new(Mutex::new(UpvalueCell::Open(slot))))
    }

    pub fn closed(value: Value) -> Self {
        Self(Arc::new(Mutex::new(UpvalueCell::Closed(value))))
    }

    pub fn cell(&self) -> &Mutex<UpvalueCell> {
        &self.0
    }

    /// Open slot, or `None` once closed.
    pub fn open_slot(&self) -> Option<usize> {
        match &*self.0.lock() {
            UpvalueCell::Open(slot) => Some(*slot),
            UpvalueCell::Closed(_) => None,
        }
    }

    pub fn close(&self, value: Value) {
        *self.0.lock() = UpvalueCell::Closed(value);
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    pub fn ptr_eq(&self, other: &UpvalueRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for UpvalueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0.lock() {
            UpvalueCell::Open(slot) => write!(f, "Upvalue(open @{slot})"),
            UpvalueCell::Closed(v) => write!(f, "Upvalue(closed {v:?})"),
        }
    }
}

#[derive(Clone)]
pub enum ClosureKind {
    Compiled {
        chunk: Arc<Chunk>,
        upvalues: Arc<[UpvalueRef]>,
    },
    Native(NativeFn),
    Extension(ExtensionHandle),
}

#[derive(Clone)]
pub struct Closure {
    pub name: Option<String>,
    pub param_names: Vec<String>,
    pub kind: ClosureKind,
}

impl Closure {
    pub fn compiled(chunk: Arc<Chunk>, upvalues: Vec<UpvalueRef>) -> Self {
        Self {
            name: chunk.name.clone(),
            param_names: chunk.param_names.clone(),
            kind: ClosureKind::Compiled {
                chunk,
                upvalues: upvalues.into(),
            },
        }
    }

    pub fn native(name: &str, f: NativeFn) -> Self {
        Self {
            name: Some(name.to_string()),
            param_names: Vec::new(),
            kind: ClosureKind::Native(f),
        }
    }

    pub fn extension(name: &str, params: &[&str], handle: ExtensionHandle) -> Self {
        Self {
            name: Some(name.to_string()),
            param_names: params.iter().map(|p| p.to_string()).collect(),
            kind: ClosureKind::Extension(handle),
        }
    }

    pub fn arity(&self) -> usize {
        self.param_names.len()
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ClosureKind::Compiled { .. } => "compiled",
            ClosureKind::Native(_) => "native",
            ClosureKind::Extension(_) => "extension",
        };
        f.debug_struct("Closure")
            .field("name", &self.name)
            .field("params", &self.param_names)
            .field("kind", &kind)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Constructors and accessors
// ---------------------------------------------------------------------------

impl Value {
    pub fn new(data: Data) -> Self {
        Self {
            data,
            phase: Phase::Unphased,
            home: Home::None,
        }
    }

    pub fn nil() -> Self {
        Self::new(Data::Nil)
    }

    pub fn unit() -> Self {
        Self::new(Data::Unit)
    }

    pub fn bool(b: bool) -> Self {
        Self::new(Data::Bool(b))
    }

    pub fn int(i: i64) -> Self {
        Self::new(Data::Int(i))
    }

    pub fn float(f: f64) -> Self {
        Self::new(Data::Float(f))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::new(Data::String(s.into()))
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self::new(Data::Array(items))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Self::new(Data::Tuple(items))
    }

    pub fn map(entries: BTreeMap<String, Value>) -> Self {
        Self::new(Data::Map(entries))
    }

    pub fn set_of(items: Vec<Value>) -> Self {
        let members = items.into_iter().map(|v| (v.to_string(), v)).collect();
        Self::new(Data::Set(members))
    }

    pub fn buffer(bytes: Vec<u8>) -> Self {
        Self::new(Data::Buffer(bytes))
    }

    pub fn range(start: i64, end: i64) -> Self {
        Self::new(Data::Range(start, end))
    }

    pub fn closure(c: Closure) -> Self {
        Self::new(Data::Closure(Arc::new(c)))
    }

    pub fn channel(ch: Arc<Channel>) -> Self {
        Self::new(Data::Channel(ch))
    }

    pub fn new_ref(inner: Value) -> Self {
        Self::new(Data::Ref(Arc::new(Mutex::new(inner))))
    }

    pub fn structure(name: &str, fields: Vec<(String, Value)>) -> Self {
        Self::new(Data::Struct(Box::new(StructValue {
            name: name.to_string(),
            fields,
        })))
    }

    pub fn enumeration(enum_name: &str, variant: &str, payload: Vec<Value>) -> Self {
        Self::new(Data::Enum(Box::new(EnumValue {
            enum_name: enum_name.to_string(),
            variant: variant.to_string(),
            payload,
        })))
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.data, Data::Nil)
    }

    pub fn is_crystal(&self) -> bool {
        self.phase == Phase::Crystal
    }

    pub fn is_sublimated(&self) -> bool {
        self.phase == Phase::Sublimated
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self.data, Data::Nil | Data::Unit | Data::Bool(false))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.data {
            Data::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.data {
            Data::Int(i) => Some(i as f64),
            Data::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            Data::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match &self.data {
            Data::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Arc<Closure>> {
        match &self.data {
            Data::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Arc<Channel>> {
        match &self.data {
            Data::Channel(ch) => Some(ch),
            _ => None,
        }
    }

    pub fn is_channel(&self) -> bool {
        matches!(self.data, Data::Channel(_))
    }

    /// Values whose storage lives on the heap.
    pub fn is_heap_backed(&self) -> bool {
        matches!(
            self.data,
            Data::String(_)
                | Data::Array(_)
                | Data::Map(_)
                | Data::Set(_)
                | Data::Struct(_)
                | Data::Enum(_)
                | Data::Tuple(_)
                | Data::Closure(_)
                | Data::Buffer(_)
                | Data::Ref(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match &self.data {
            Data::Nil => "Nil",
            Data::Unit => "Unit",
            Data::Bool(_) => "Bool",
            Data::Int(_) => "Int",
            Data::Float(_) => "Float",
            Data::String(_) => "String",
            Data::Array(_) => "Array",
            Data::Map(_) => "Map",
            Data::Set(_) => "Set",
            Data::Struct(_) => "Struct",
            Data::Enum(_) => "Enum",
            Data::Tuple(_) => "Tuple",
            Data::Range(..) => "Range",
            Data::Closure(_) => "Closure",
            Data::Buffer(_) => "Buffer",
            Data::Channel(_) => "Channel",
            Data::Ref(_) => "Ref",
        }
    }

    /// Dense per-type tag used as the inline cache key.
    pub fn type_tag(&self) -> u8 {
        match &self.data {
            Data::Nil => 0,
            Data::Unit => 1,
            Data::Bool(_) => 2,
            Data::Int(_) => 3,
            Data::Float(_) => 4,
            Data::String(_) => 5,
            Data::Array(_) => 6,
            Data::Map(_) => 7,
            Data::Set(_) => 8,
            Data::Struct(_) => 9,
            Data::Enum(_) => 10,
            Data::Tuple(_) => 11,
            Data::Range(..) => 12,
            Data::Closure(_) => 13,
            Data::Buffer(_) => 14,
            Data::Channel(_) => 15,
            Data::Ref(_) => 16,
        }
    }

    /// Rough byte size of the top-level allocation, for GC accounting.
    pub fn approx_size(&self) -> usize {
        const SLOT: usize = std::mem::size_of::<Value>();
        match &self.data {
            Data::String(s) => s.len(),
            Data::Array(items) | Data::Tuple(items) => items.len() * SLOT,
            Data::Map(m) | Data::Set(m) => m.iter().map(|(k, _)| k.len() + SLOT).sum(),
            Data::Struct(s) => s.fields.iter().map(|(k, _)| k.len() + SLOT).sum(),
            Data::Enum(e) => e.payload.len() * SLOT,
            Data::Closure(c) => match &c.kind {
                ClosureKind::Compiled { upvalues, .. } => 64 + upvalues.len() * 16,
                _ => 64,
            },
            Data::Buffer(b) => b.len(),
            Data::Ref(_) => SLOT,
            _ => 0,
        }
    }

    /// Copy with fresh `Ref` cells, so the copy shares no mutable state.
    /// Fluid ledger entries are not shared with the copy.
    pub fn deep_clone(&self) -> Value {
        self.map_deep(&|v| v.phase, &|v| match v.home {
            Home::Region(r) => Home::Region(r),
            _ => Home::None,
        })
    }

    /// Deep copy with `phase` and `home` applied at every level.
    pub fn deep_with_phase(&self, phase: Phase, home: Home) -> Value {
        self.map_deep(&|_| phase, &|v| if v.is_heap_backed() { home } else { Home::None })
    }

    fn map_deep(&self, phase: &dyn Fn(&Value) -> Phase, home: &dyn Fn(&Value) -> Home) -> Value {
        DeepCopy {
            phase,
            home,
            cells: HashMap::new(),
        }
        .copy(self)
    }

    /// `repr` form: strings are quoted, everything else displays as usual.
    pub fn repr(&self) -> String {
        match &self.data {
            Data::String(s) => format!("{s:?}"),
            _ => self.to_string(),
        }
    }
}

/// Deep copier. `Ref` cells are memoized by address, so a cell reachable
/// from its own contents is copied once and no lock is held while recursing.
struct DeepCopy<'a> {
    phase: &'a dyn Fn(&Value) -> Phase,
    home: &'a dyn Fn(&Value) -> Home,
    cells: HashMap<*const Mutex<Value>, Arc<Mutex<Value>>>,
}

impl DeepCopy<'_> {
    fn copy(&mut self, v: &Value) -> Value {
        let data = match &v.data {
            Data::Array(items) => Data::Array(self.each(items)),
            Data::Tuple(items) => Data::Tuple(self.each(items)),
            Data::Map(m) => Data::Map(m.iter().map(|(k, v)| (k.clone(), self.copy(v))).collect()),
            Data::Set(m) => Data::Set(m.iter().map(|(k, v)| (k.clone(), self.copy(v))).collect()),
            Data::Struct(s) => Data::Struct(Box::new(StructValue {
                name: s.name.clone(),
                fields: s.fields.iter().map(|(k, v)| (k.clone(), self.copy(v))).collect(),
            })),
            Data::Enum(e) => Data::Enum(Box::new(EnumValue {
                enum_name: e.enum_name.clone(),
                variant: e.variant.clone(),
                payload: self.each(&e.payload),
            })),
            Data::Ref(cell) => Data::Ref(self.copy_cell(cell)),
            other => other.clone(),
        };
        Value {
            data,
            phase: (self.phase)(v),
            home: (self.home)(v),
        }
    }

    fn each(&mut self, items: &[Value]) -> Vec<Value> {
        items.iter().map(|v| self.copy(v)).collect()
    }

    fn copy_cell(&mut self, cell: &Arc<Mutex<Value>>) -> Arc<Mutex<Value>> {
        let key = Arc::as_ptr(cell);
        if let Some(copied) = self.cells.get(&key) {
            return Arc::clone(copied);
        }
        let copied = Arc::new(Mutex::new(Value::nil()));
        self.cells.insert(key, Arc::clone(&copied));
        let inner = cell.lock().clone();
        let inner = self.copy(&inner);
        *copied.lock() = inner;
        copied
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

// ---------------------------------------------------------------------------
// Equality and display
// ---------------------------------------------------------------------------

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (&self.data, &other.data) {
            (Data::Nil, Data::Nil) | (Data::Unit, Data::Unit) => true,
            (Data::Bool(a), Data::Bool(b)) => a == b,
            (Data::Int(a), Data::Int(b)) => a == b,
            (Data::Float(a), Data::Float(b)) => a == b,
            (Data::Int(a), Data::Float(b)) | (Data::Float(b), Data::Int(a)) => (*a as f64) == *b,
            (Data::String(a), Data::String(b)) => a == b,
            (Data::Array(a), Data::Array(b)) | (Data::Tuple(a), Data::Tuple(b)) => a == b,
            (Data::Map(a), Data::Map(b)) | (Data::Set(a), Data::Set(b)) => a == b,
            (Data::Struct(a), Data::Struct(b)) => a == b,
            (Data::Enum(a), Data::Enum(b)) => a == b,
            (Data::Range(a0, a1), Data::Range(b0, b1)) => a0 == b0 && a1 == b1,
            (Data::Buffer(a), Data::Buffer(b)) => a == b,
            (Data::Closure(a), Data::Closure(b)) => Arc::ptr_eq(a, b),
            (Data::Channel(a), Data::Channel(b)) => Arc::ptr_eq(a, b),
            (Data::Ref(a), Data::Ref(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Data::Nil => f.write_str("nil"),
            Data::Unit => f.write_str("()"),
            Data::Bool(b) => write!(f, "{b}"),
            Data::Int(i) => write!(f, "{i}"),
            Data::Float(x) => write!(f, "{x}"),
            Data::String(s) => f.write_str(s),
            Data::Array(items) => {
                f.write_str("[")?;
                join(f, items)?;
                f.write_str("]")
            }
            Data::Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
            Data::Set(m) => {
                f.write_str("Set{")?;
                for (i, v) in m.values().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("}")
            }
            Data::Struct(s) => {
                write!(f, "{} {{ ", s.name)?;
                for (i, (k, v)) in s.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str(" }")
            }
            Data::Enum(e) => {
                write!(f, "{}::{}", e.enum_name, e.variant)?;
                if !e.payload.is_empty() {
                    f.write_str("(")?;
                    join(f, &e.payload)?;
                    f.write_str(")")?;
                }
                Ok(())
            }
            Data::Tuple(items) => {
                f.write_str("(")?;
                join(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Data::Range(s, e) => write!(f, "{s}..{e}"),
            Data::Closure(c) => write!(f, "<closure|{}|>", c.param_names.join(", ")),
            Data::Buffer(b) => write!(f, "Buffer<{} bytes>", b.len()),
            Data::Channel(_) => f.write_str("<Channel>"),
            Data::Ref(cell) => write!(f, "Ref<{}>", cell.lock().type_name()),
        }
    }
}
