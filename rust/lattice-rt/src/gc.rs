//! Ledger header for fluid-heap allocations.
//!
//! Each value the VM builds on the fluid heap gets an 8-byte `GcHeader`
//! holding the mark bit, a type tag, and the accounted size.

use crate::values::{Data, Value};
use std::fmt;

/// Layout (8 bytes total):
/// ```text
/// flags (u32):
///   [0]     marked   object reached during the current cycle
///   [7:1]   unused
///   [15:8]  type_tag TypeTag discriminant
///   [31:16] unused
/// size (u32):
///   accounted body size in bytes
/// ```
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GcHeader {
    flags: u32,
    size: u32,
}

const MARKED_BIT: u32 = 1;
const TYPE_TAG_MASK: u32 = 0xFF;
const TYPE_TAG_SHIFT: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeTag {
    Array = 0,
    Tuple = 1,
    Map = 2,
    Set = 3,
    Struct = 4,
    Enum = 5,
    Closure = 6,
    Buffer = 7,
    Ref = 8,
    String = 9,
}

impl TypeTag {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TypeTag::Array),
            1 => Some(TypeTag::Tuple),
            2 => Some(TypeTag::Map),
            3 => Some(TypeTag::Set),
            4 => Some(TypeTag::Struct),
            5 => Some(TypeTag::Enum),
            6 => Some(TypeTag::Closure),
            7 => Some(TypeTag::Buffer),
            8 => Some(TypeTag::Ref),
            9 => Some(TypeTag::String),
            _ => None,
        }
    }

    /// Tag for a heap-backed value, `None` for immediates and channels.
    pub fn of(value: &Value) -> Option<Self> {
        Some(match &value.data {
            Data::Array(_) => TypeTag::Array,
            Data::Tuple(_) => TypeTag::Tuple,
            Data::Map(_) => TypeTag::Map,
            Data::Set(_) => TypeTag::Set,
            Data::Struct(_) => TypeTag::Struct,
            Data::Enum(_) => TypeTag::Enum,
            Data::Closure(_) => TypeTag::Closure,
            Data::Buffer(_) => TypeTag::Buffer,
            Data::Ref(_) => TypeTag::Ref,
            Data::String(_) => TypeTag::String,
            _ => return None,
        })
    }
}

impl GcHeader {
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Unmarked header for a body of `size` bytes.
    pub fn new(tag: TypeTag, size: u32) -> Self {
        Self {
            flags: (tag as u32) << TYPE_TAG_SHIFT,
            size,
        }
    }

    pub fn is_marked(&self) -> bool {
        self.flags & MARKED_BIT != 0
    }

    pub fn mark(&mut self) {
        self.flags |= MARKED_BIT;
    }

    pub fn unmark(&mut self) {
        self.flags &= !MARKED_BIT;
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        TypeTag::from_u8(((self.flags >> TYPE_TAG_SHIFT) & TYPE_TAG_MASK) as u8)
    }

    pub fn object_size(&self) -> u32 {
        self.size
    }

    /// Header plus body.
    pub fn total_size(&self) -> usize {
        Self::SIZE + self.size as usize
    }
}

impl fmt::Debug for GcHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcHeader")
            .field("marked", &self.is_marked())
            .field("type_tag", &self.type_tag())
            .field("object_size", &self.object_size())
            .finish()
    }
}
