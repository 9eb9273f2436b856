//! Arithmetic, comparison, and bitwise operators.

use super::{Vm, VmError};
use crate::values::{Data, Value};
use lattice_core::OpCode;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
        }
    }
}

fn int_op(op: BinaryOp, a: i64, b: i64) -> Result<i64, VmError> {
    match op {
        BinaryOp::Add => a.checked_add(b).ok_or(VmError::Overflow),
        BinaryOp::Sub => a.checked_sub(b).ok_or(VmError::Overflow),
        BinaryOp::Mul => a.checked_mul(b).ok_or(VmError::Overflow),
        BinaryOp::Div => {
            if b == 0 {
                return Err(VmError::DivisionByZero);
            }
            a.checked_div(b).ok_or(VmError::Overflow)
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(VmError::ModuloByZero);
            }
            a.checked_rem(b).ok_or(VmError::Overflow)
        }
    }
}

fn float_op(op: BinaryOp, a: f64, b: f64) -> Result<f64, VmError> {
    match op {
        BinaryOp::Add => Ok(a + b),
        BinaryOp::Sub => Ok(a - b),
        BinaryOp::Mul => Ok(a * b),
        BinaryOp::Div if b == 0.0 => Err(VmError::DivisionByZero),
        BinaryOp::Div => Ok(a / b),
        BinaryOp::Mod if b == 0.0 => Err(VmError::ModuloByZero),
        BinaryOp::Mod => Ok(a % b),
    }
}

/// Apply `op` to two values. Int pairs stay Int; any Float operand promotes.
/// `+` also concatenates strings (either side) and arrays.
pub(crate) fn arith(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, VmError> {
    match (&lhs.data, &rhs.data) {
        (Data::Int(a), Data::Int(b)) => int_op(op, *a, *b).map(Value::int),
        (Data::Int(_) | Data::Float(_), Data::Int(_) | Data::Float(_)) => {
            let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Err(VmError::type_error(op.symbol(), lhs, rhs));
            };
            float_op(op, a, b).map(Value::float)
        }
        (Data::String(_), _) | (_, Data::String(_)) if op == BinaryOp::Add => {
            Ok(Value::string(format!("{lhs}{rhs}")))
        }
        (Data::Array(a), Data::Array(b)) if op == BinaryOp::Add => {
            Ok(Value::array(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => Err(VmError::type_error(op.symbol(), lhs, rhs)),
    }
}

pub(crate) fn negate(v: &Value) -> Result<Value, VmError> {
    match v.data {
        Data::Int(i) => i.checked_neg().map(Value::int).ok_or(VmError::Overflow),
        Data::Float(f) => Ok(Value::float(-f)),
        _ => Err(VmError::Type(format!("cannot negate {}", v.type_name()))),
    }
}

/// Ordering of two numbers or two strings.
pub(crate) fn compare_values(lhs: &Value, rhs: &Value) -> Result<Ordering, VmError> {
    match (&lhs.data, &rhs.data) {
        (Data::Int(a), Data::Int(b)) => Ok(a.cmp(b)),
        (Data::String(a), Data::String(b)) => Ok(a.cmp(b)),
        _ => match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| {
                VmError::Type("cannot compare NaN".into())
            }),
            _ => Err(VmError::Type(format!(
                "cannot compare {} and {}",
                lhs.type_name(),
                rhs.type_name()
            ))),
        },
    }
}

fn ordering_holds(op: OpCode, ord: Ordering) -> bool {
    match op {
        OpCode::Lt => ord == Ordering::Less,
        OpCode::Gt => ord == Ordering::Greater,
        OpCode::LtEq => ord != Ordering::Greater,
        _ => ord != Ordering::Less,
    }
}

impl Vm {
    /// Pop two operands and push the result. On error nothing is pushed.
    pub(crate) fn binary_arith(&mut self, op: BinaryOp) -> Result<(), VmError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let result = arith(op, &lhs, &rhs)?;
        self.push(result);
        Ok(())
    }

    /// Int-specialized arithmetic; falls back to the generic path for
    /// anything but two Ints.
    pub(crate) fn int_fast_path(&mut self, op: BinaryOp) -> Result<(), VmError> {
        let len = self.stack.len();
        if len >= 2 {
            if let (Data::Int(a), Data::Int(b)) = (&self.stack[len - 2].data, &self.stack[len - 1].data) {
                let result = int_op(op, *a, *b)?;
                self.stack.truncate(len - 2);
                self.push(Value::int(result));
                return Ok(());
            }
        }
        self.binary_arith(op)
    }

    pub(crate) fn compare(&mut self, op: OpCode) -> Result<(), VmError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let ord = compare_values(&lhs, &rhs)?;
        self.push(Value::bool(ordering_holds(op, ord)));
        Ok(())
    }

    pub(crate) fn int_compare(&mut self, op: OpCode) -> Result<(), VmError> {
        let len = self.stack.len();
        if len >= 2 {
            if let (Data::Int(a), Data::Int(b)) = (&self.stack[len - 2].data, &self.stack[len - 1].data) {
                let holds = ordering_holds(op, a.cmp(b));
                self.stack.truncate(len - 2);
                self.push(Value::bool(holds));
                return Ok(());
            }
        }
        self.compare(op)
    }

    pub(crate) fn bitwise(&mut self, op: OpCode) -> Result<(), VmError> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let (Data::Int(a), Data::Int(b)) = (&lhs.data, &rhs.data) else {
            let symbol = match op {
                OpCode::BitAnd => "&",
                OpCode::BitOr => "|",
                OpCode::BitXor => "^",
                OpCode::LShift => "<<",
                _ => ">>",
            };
            return Err(VmError::type_error(symbol, &lhs, &rhs));
        };
        let (a, b) = (*a, *b);
        let result = match op {
            OpCode::BitAnd => a & b,
            OpCode::BitOr => a | b,
            OpCode::BitXor => a ^ b,
            OpCode::LShift | OpCode::RShift => {
                let shift = u32::try_from(b)
                    .ok()
                    .filter(|s| *s < 64)
                    .ok_or_else(|| VmError::Runtime(format!("shift amount {b} out of range")))?;
                if op == OpCode::LShift {
                    a << shift
                } else {
                    a >> shift
                }
            }
            _ => return Err(VmError::Runtime(format!("{} is not a bitwise op", op.name()))),
        };
        self.push(Value::int(result));
        Ok(())
    }
}
