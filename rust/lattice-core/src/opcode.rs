//! Opcodes for the Lattice stack VM.
//!
//! Operands follow the opcode byte in the code stream. Single-byte operands
//! are slot or constant indices; jump offsets are big-endian `u16`.

use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};

/// Select arm flag: the arm is the `default` arm.
pub const ARM_DEFAULT: u8 = 0x01;
/// Select arm flag: the arm is a `timeout(ms)` arm.
pub const ARM_TIMEOUT: u8 = 0x02;
/// Select arm flag: the arm binds the received value to a name.
pub const ARM_BINDING: u8 = 0x04;
/// Placeholder index meaning "no chunk / no constant".
pub const NO_INDEX: u8 = 0xFF;
/// High bit of the phase-var location byte: consume matching seeds.
pub const CONSUME_SEEDS: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, IntoStaticStr, Serialize, Deserialize)]
#[repr(u8)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    // Stack manipulation
    Constant = 0,     // idx: push constants[idx]
    Nil = 1,
    True = 2,
    False = 3,
    Unit = 4,
    Pop = 5,
    Dup = 6,
    Swap = 7,

    // Arithmetic / logical
    Add = 8,
    Sub = 9,
    Mul = 10,
    Div = 11,
    Mod = 12,
    Neg = 13,
    Not = 14,

    // Bitwise
    BitAnd = 15,
    BitOr = 16,
    BitXor = 17,
    BitNot = 18,
    #[strum(serialize = "LSHIFT")]
    LShift = 19,
    #[strum(serialize = "RSHIFT")]
    RShift = 20,

    // Comparison
    Eq = 21,
    Neq = 22,
    Lt = 23,
    Gt = 24,
    #[strum(serialize = "LTEQ")]
    LtEq = 25,
    #[strum(serialize = "GTEQ")]
    GtEq = 26,

    Concat = 27,

    // Variables
    GetLocal = 28,    // slot
    SetLocal = 29,    // slot: keeps TOS
    GetGlobal = 30,   // name idx
    SetGlobal = 31,   // name idx: keeps TOS
    DefineGlobal = 32, // name idx: pops TOS
    GetUpvalue = 33,  // idx
    SetUpvalue = 34,  // idx: keeps TOS
    CloseUpvalue = 35,

    // Jumps
    Jump = 36,        // u16 forward
    JumpIfFalse = 37, // u16, does not pop
    JumpIfTrue = 38,  // u16, does not pop
    JumpIfNotNil = 39, // u16, does not pop
    Loop = 40,        // u16 backward

    // Functions / closures
    Call = 41,        // argc
    Closure = 42,     // fn idx, upvalue count, (is_local, index) * count
    Return = 43,

    // Iterators
    IterInit = 44,
    IterNext = 45,    // u16 exit offset

    // Data structures
    BuildArray = 46,  // n
    ArrayFlatten = 47,
    BuildMap = 48,    // n pairs
    BuildTuple = 49,  // n
    BuildStruct = 50, // name idx, field count; field names follow the name
    BuildRange = 51,
    BuildEnum = 52,   // enum idx, variant idx, payload count
    Index = 53,
    SetIndex = 54,
    GetField = 55,    // name idx
    SetField = 56,    // name idx
    Invoke = 57,      // method idx, argc
    InvokeLocal = 58, // slot, method idx, argc
    InvokeGlobal = 59, // global idx, method idx, argc
    SetIndexLocal = 60, // slot

    // Exceptions
    PushExceptionHandler = 61, // u16 catch offset
    PopExceptionHandler = 62,
    Throw = 63,
    TryUnwrap = 64,

    // Defer
    DeferPush = 65,   // scope depth, u16 body length
    DeferRun = 66,    // minimum scope depth

    // Phase system
    Freeze = 67,
    Thaw = 68,
    Clone = 69,
    MarkFluid = 70,
    React = 71,       // name idx
    Unreact = 72,     // name idx
    Bond = 73,        // target name idx
    Unbond = 74,      // target name idx
    Seed = 75,        // name idx
    Unseed = 76,      // name idx
    FreezeVar = 77,   // name idx, location, slot
    ThawVar = 78,     // name idx, location, slot
    SublimateVar = 79, // name idx, location, slot
    Sublimate = 80,

    Print = 81,       // n
    Import = 82,      // path idx

    // Concurrency (variable length)
    Scope = 83,       // spawn count, sync idx, spawn idx * count
    Select = 84,      // arm count, (flags, chan idx, body idx, binding idx) * count

    // Integer fast paths
    IncLocal = 85,    // slot
    DecLocal = 86,    // slot
    AddInt = 87,
    SubInt = 88,
    MulInt = 89,
    LtInt = 90,
    #[strum(serialize = "LTEQ_INT")]
    LtEqInt = 91,
    LoadInt8 = 92,    // i8

    // Wide constant-index variants
    #[strum(serialize = "CONSTANT_16")]
    Constant16 = 93,
    #[strum(serialize = "GET_GLOBAL_16")]
    GetGlobal16 = 94,
    #[strum(serialize = "SET_GLOBAL_16")]
    SetGlobal16 = 95,
    #[strum(serialize = "DEFINE_GLOBAL_16")]
    DefineGlobal16 = 96,
    #[strum(serialize = "CLOSURE_16")]
    Closure16 = 97,

    Halt = 98,
}

impl OpCode {
    /// Decode a raw byte.
    pub fn decode(byte: u8) -> Option<Self> {
        Self::from_repr(byte)
    }

    /// Mnemonic used by the disassembler.
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Number of fixed operand bytes, or `None` for variable-length forms.
    pub fn fixed_operand_len(self) -> Option<usize> {
        use OpCode::*;
        let len = match self {
            Closure | Closure16 | Scope | Select => return None,
            Constant | GetLocal | SetLocal | GetGlobal | SetGlobal | DefineGlobal | GetUpvalue
            | SetUpvalue | Call | BuildArray | BuildMap | BuildTuple | GetField | SetField
            | SetIndexLocal | DeferRun | React | Unreact | Bond | Unbond | Seed | Unseed
            | Print | Import | IncLocal | DecLocal | LoadInt8 => 1,
            Jump | JumpIfFalse | JumpIfTrue | JumpIfNotNil | Loop | IterNext
            | PushExceptionHandler | BuildStruct | Invoke | Constant16 | GetGlobal16
            | SetGlobal16 | DefineGlobal16 => 2,
            BuildEnum | InvokeLocal | InvokeGlobal | DeferPush | FreezeVar | ThawVar
            | SublimateVar => 3,
            _ => 0,
        };
        Some(len)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

/// Storage class operand of `FREEZE_VAR` / `THAW_VAR` / `SUBLIMATE_VAR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarLocation {
    Local = 0,
    Upvalue = 1,
    Global = 2,
}

impl VarLocation {
    /// Split a raw location byte into the location and the consume-seeds flag.
    pub fn decode(byte: u8) -> Option<(Self, bool)> {
        let consume = byte & CONSUME_SEEDS != 0;
        let loc = match byte & !CONSUME_SEEDS {
            0 => VarLocation::Local,
            1 => VarLocation::Upvalue,
            2 => VarLocation::Global,
            _ => return None,
        };
        Some((loc, consume))
    }

    pub fn encode(self, consume_seeds: bool) -> u8 {
        let byte = self as u8;
        if consume_seeds {
            byte | CONSUME_SEEDS
        } else {
            byte
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_roundtrips_every_opcode() {
        for byte in 0..=OpCode::Halt as u8 {
            let op = OpCode::decode(byte).expect("dense opcode space");
            assert_eq!(u8::from(op), byte);
        }
        assert!(OpCode::decode(OpCode::Halt as u8 + 1).is_none());
    }

    #[test]
    fn mnemonics_match_bytecode_listing() {
        assert_eq!(OpCode::GetLocal.name(), "GET_LOCAL");
        assert_eq!(OpCode::PushExceptionHandler.name(), "PUSH_EXCEPTION_HANDLER");
        assert_eq!(OpCode::LtEqInt.name(), "LTEQ_INT");
        assert_eq!(OpCode::Constant16.name(), "CONSTANT_16");
        assert_eq!(OpCode::LShift.name(), "LSHIFT");
    }

    #[test]
    fn var_location_carries_consume_flag() {
        let byte = VarLocation::Global.encode(true);
        assert_eq!(byte, 0x82);
        assert_eq!(VarLocation::decode(byte), Some((VarLocation::Global, true)));
        assert_eq!(VarLocation::decode(0), Some((VarLocation::Local, false)));
        assert_eq!(VarLocation::decode(3), None);
    }
}
